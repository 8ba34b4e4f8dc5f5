// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{Configuration, allocate_generator_id},
    constants::{
        DEFAULT_GENERATOR_POLL_INTERVAL, DEFAULT_OPENPERF_TIMEOUT, DEFAULT_PEER_TIMEOUT,
        DEFAULT_START_DELAY, DEFAULT_STATS_POLL_INTERVAL, MAXIMUM_START_TIME_DELTA,
    },
    errors::Error,
    openperf::{self, Poller, describe_response, poll_response, spawn_poller, take_in_flight},
    state::{State, StateHandle, StepOutcome, cleanup, cleanup_with, fail, finished, proceed},
};
use chrono::{DateTime, TimeDelta, Utc};
use spiperf_messages::{
    DataStreamStats, Hello, Message, MessageKind, PEER_PROTOCOL_VERSION, ServerConfiguration,
    ServerParameters,
};
use spiperf_openperf_interface::{
    command::{Command, CommandResult, Request, Response},
    command_repeater::MINIMUM_INTERVAL,
};
use std::time::Duration;
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// The server side of a test session. Long-lived: after non-fatal errors
/// the machine resets and loops back to the connect state so that a flaky
/// client does not bring the server down. Only fatal errors (broken
/// channels, Openperf failures during cleanup) terminate it.
pub struct Server {
    /// Receives commands from the peer's client state machine.
    peer_cmd_receiver: mpsc::Receiver<Message>,

    /// Sends responses to the peer's client state machine.
    peer_resp_sender: mpsc::Sender<Message>,

    /// Sends notifications to the peer's client state machine.
    peer_notif_sender: mpsc::Sender<Message>,

    /// Sends commands to the local Openperf instance.
    openperf_cmd_sender: mpsc::Sender<Command>,

    /// Maximum time to wait for commands from the peer once a session is
    /// underway. Zero means "use the default".
    pub peer_timeout: Duration,

    /// Maximum time to wait for responses from Openperf. Zero means "use
    /// the default".
    pub openperf_timeout: Duration,

    /// Added to the local Openperf time so both sides start traffic
    /// generation and analysis at the same instant. Zero means "use the
    /// default".
    pub start_delay: Duration,

    /// How often to poll local Openperf statistics. This does not impact
    /// results output. Zero means "use the default".
    pub stats_poll_interval: Duration,

    /// How often to poll the local Openperf generator resource to see if
    /// it is still transmitting. Zero means "use the default".
    pub generator_poll_interval: Duration,

    /// The test configuration. The server's own parameters (Openperf URL,
    /// link speed, address lists) are advertised to the client; the rates
    /// are filled in from the client's configuration push.
    pub configuration: Configuration,

    state: StateHandle,
    start_time: Option<DateTime<Utc>>,
    generator_id: Option<String>,

    /// Set when a fatal error has been recorded; cleanup then routes to
    /// the error state instead of looping back to connect.
    error_after_cleanup: bool,
}

/// How a failed wait for a peer command should be handled.
enum WaitError {
    /// The session cannot continue at all (broken channel, disconnect).
    Fatal(Error),
    /// The peer misbehaved; report the error and reset.
    NonFatal(Error),
}

impl Server {
    pub fn new(
        peer_cmd_receiver: mpsc::Receiver<Message>,
        peer_resp_sender: mpsc::Sender<Message>,
        peer_notif_sender: mpsc::Sender<Message>,
        openperf_cmd_sender: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            peer_cmd_receiver,
            peer_resp_sender,
            peer_notif_sender,
            openperf_cmd_sender,
            peer_timeout: Duration::ZERO,
            openperf_timeout: Duration::ZERO,
            start_delay: Duration::ZERO,
            stats_poll_interval: Duration::ZERO,
            generator_poll_interval: Duration::ZERO,
            configuration: Configuration::default(),
            state: StateHandle::new(),
            start_time: None,
            generator_id: None,
            error_after_cleanup: false,
        }
    }

    /// Returns a handle observers may use to read the current state label
    /// while the machine runs.
    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Serves test sessions until cancelled or a fatal error occurs. The
    /// first fatal error observed is returned; subsequent errors are
    /// discarded because they are presumed consequences of the first. The
    /// outbound peer response channel is closed when this returns.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
        self.resolve_tunables()?;

        let mut first_error: Option<Error> = None;
        let mut next = Some(State::Connect);
        while let Some(state) = next {
            let (next_state, outcome) = match state {
                State::Connect => self.connect(&cancel).await,
                State::Configure => self.configure(&cancel).await,
                State::Ready => self.ready(&cancel).await,
                State::Armed => self.armed(&cancel).await,
                State::Running => self.running(&cancel).await,
                State::Done => self.done(&cancel).await,
                State::Cleanup => self.cleanup().await,
                State::Error => self.error_state(),
            };
            if let Err(error) = outcome {
                self.error_after_cleanup = true;
                first_error.get_or_insert(error);
            }
            next = next_state;
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn resolve_tunables(&mut self) -> Result<(), Error> {
        if self.peer_timeout.is_zero() {
            self.peer_timeout = DEFAULT_PEER_TIMEOUT;
            debug!(peer_timeout = ?self.peer_timeout, "using default value for server parameter");
        }
        if self.openperf_timeout.is_zero() {
            self.openperf_timeout = DEFAULT_OPENPERF_TIMEOUT;
            debug!(openperf_timeout = ?self.openperf_timeout, "using default value for server parameter");
        }
        if self.start_delay.is_zero() {
            self.start_delay = DEFAULT_START_DELAY;
            debug!(start_delay = ?self.start_delay, "using default value for server parameter");
        }
        if self.stats_poll_interval.is_zero() {
            self.stats_poll_interval = DEFAULT_STATS_POLL_INTERVAL;
            debug!(stats_poll_interval = ?self.stats_poll_interval, "using default value for server parameter");
        }
        if self.generator_poll_interval.is_zero() {
            self.generator_poll_interval = DEFAULT_GENERATOR_POLL_INTERVAL;
            debug!(generator_poll_interval = ?self.generator_poll_interval, "using default value for server parameter");
        }

        if self.stats_poll_interval < MINIMUM_INTERVAL {
            return Err(Error::invalid_param(
                "stats_poll_interval",
                format!("{:?}", self.stats_poll_interval),
                format!(">= {:?}", MINIMUM_INTERVAL),
            ));
        }
        if self.generator_poll_interval < MINIMUM_INTERVAL {
            return Err(Error::invalid_param(
                "generator_poll_interval",
                format!("{:?}", self.generator_poll_interval),
                format!(">= {:?}", MINIMUM_INTERVAL),
            ));
        }
        Ok(())
    }

    fn enter(&self, state: State) {
        trace!(%state, "server state machine entering state");
        self.state.set(state);
    }

    /// True when the peer transmits traffic (client to server direction).
    fn client_tx(&self) -> bool {
        self.configuration.upstream_rate_bps > 0
    }

    /// True when this side transmits traffic (server to client direction).
    fn server_tx(&self) -> bool {
        self.configuration.downstream_rate_bps > 0
    }

    /// Waits for a client to introduce itself. There is no timeout here;
    /// there is no way to know when a client will connect. Cancellation
    /// while waiting is a clean exit, not an error.
    async fn connect(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Connect);

        let command = tokio::select! {
            command = self.peer_cmd_receiver.recv() => command,
            _ = cancel.cancelled() => {
                info!("server state machine exiting due to caller cancellation");
                return finished();
            },
        };
        let Some(command) = command else {
            return fail(Error::peer("error reading from peer command channel"));
        };

        let hello = match command {
            Message::Hello(hello) => hello,
            other => {
                warn!(
                    actual = %other.kind(),
                    expected = %MessageKind::Hello,
                    "got unexpected message from peer, connection terminated"
                );
                let reason = format!(
                    "unexpected message type: got {}, expected {}",
                    other.kind(),
                    MessageKind::Hello
                );
                if let Err(error) = self.send_peer_resp(Message::Error(reason)).await {
                    return fail(error);
                }
                return proceed(State::Connect);
            },
        };

        if hello.peer_protocol_version != PEER_PROTOCOL_VERSION {
            warn!(
                local_version = PEER_PROTOCOL_VERSION,
                remote_version = %hello.peer_protocol_version,
                "peer protocol version mismatch, connection terminated"
            );
            let reason = format!(
                "peer version mismatch: got {}, expected {}",
                hello.peer_protocol_version, PEER_PROTOCOL_VERSION
            );
            if let Err(error) = self.send_peer_resp(Message::Error(reason)).await {
                return fail(error);
            }
            return proceed(State::Connect);
        }

        let reply = Message::Hello(Hello {
            peer_protocol_version: PEER_PROTOCOL_VERSION.into(),
        });
        if let Err(error) = self.send_peer_resp(reply).await {
            return fail(error);
        }

        proceed(State::Configure)
    }

    /// Advertises the server's parameters and validates the configuration
    /// the client pushes back. Openperf has not been touched yet, so error
    /// paths reset straight to connect without cleanup.
    async fn configure(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Configure);

        match self
            .wait_for_peer_command(cancel, MessageKind::GetServerParameters)
            .await
        {
            Ok(_) => {},
            Err(WaitError::Fatal(fatal)) => {
                error!(error = %fatal, "fatal server state machine error, terminating");
                return fail(fatal);
            },
            Err(WaitError::NonFatal(nonfatal)) => {
                error!(
                    error = %nonfatal,
                    expected = %MessageKind::GetServerParameters,
                    "error while waiting for peer command"
                );
                if let Err(error) = self.send_peer_resp(Message::Error(nonfatal.to_string())).await
                {
                    return fail(error);
                }
                return proceed(State::Connect);
            },
        }

        let parameters = Message::ServerParameters(self.server_parameters());
        if let Err(error) = self.send_peer_resp(parameters).await {
            return fail(error);
        }

        let command = match self
            .wait_for_peer_command(cancel, MessageKind::SetConfig)
            .await
        {
            Ok(command) => command,
            Err(WaitError::Fatal(fatal)) => {
                error!(error = %fatal, "fatal server state machine error, terminating");
                return fail(fatal);
            },
            Err(WaitError::NonFatal(nonfatal)) => {
                error!(
                    error = %nonfatal,
                    expected = %MessageKind::SetConfig,
                    "error while waiting for peer command"
                );
                if let Err(error) = self.send_peer_resp(Message::Error(nonfatal.to_string())).await
                {
                    return fail(error);
                }
                return proceed(State::Connect);
            },
        };
        let Message::SetConfig(server_configuration) = command else {
            return fail(Error::internal("peer command kind mismatch"));
        };

        // Sanity check the inputs. The more that gets validated here, the
        // less there is to clean up from Openperf if it all goes wrong.
        if let Err(validation_error) = validate_test_configuration(&server_configuration) {
            error!(error = %validation_error, "error with test configuration");
            if let Err(error) = self
                .send_peer_resp(Message::Error(validation_error.to_string()))
                .await
            {
                return fail(error);
            }
            return proceed(State::Connect);
        }

        self.configuration.upstream_rate_bps = server_configuration.upstream_rate_bps;
        self.configuration.downstream_rate_bps = server_configuration.downstream_rate_bps;
        self.configuration.transmit_duration = server_configuration.transmit_duration;
        self.configuration.fixed_frame_size = server_configuration.fixed_frame_size;

        // The generator is the session resource cleanup must delete, so
        // remember its id for the rest of the session.
        if self.server_tx() {
            self.generator_id = Some(allocate_generator_id());
        }

        if let Err(error) = self.send_peer_resp(Message::Ack).await {
            return fail(error);
        }

        proceed(State::Ready)
    }

    /// Waits for the start command and validates the requested start
    /// instant before arming.
    async fn ready(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Ready);

        let command = match self
            .wait_for_peer_command(cancel, MessageKind::StartCommand)
            .await
        {
            Ok(command) => command,
            Err(WaitError::Fatal(fatal)) => return cleanup_with(fatal),
            Err(WaitError::NonFatal(nonfatal)) => {
                error!(
                    error = %nonfatal,
                    expected = %MessageKind::StartCommand,
                    "error while waiting for peer command"
                );
                if let Err(error) = self.send_peer_resp(Message::Error(nonfatal.to_string())).await
                {
                    return cleanup_with(error);
                }
                return cleanup();
            },
        };
        let Message::StartCommand(start_command) = command else {
            return cleanup_with(Error::internal("peer command kind mismatch"));
        };

        let start_time = match DateTime::parse_from_rfc3339(&start_command.start_time) {
            Ok(start_time) => start_time.with_timezone(&Utc),
            Err(parse_error) => {
                error!(error = %parse_error, "error parsing test start time");
                if let Err(error) = self
                    .send_peer_resp(Message::Error(parse_error.to_string()))
                    .await
                {
                    return cleanup_with(error);
                }
                return cleanup();
            },
        };

        let now = Utc::now();
        if start_time < now {
            error!(
                requested_start_time = %start_time,
                %now,
                "requested start time is in the past"
            );
            if let Err(error) = self
                .send_peer_resp(Message::Error("requested start time is in the past".into()))
                .await
            {
                return cleanup_with(error);
            }
            return cleanup();
        }

        let maximum_start_time = now + TimeDelta::from_std(MAXIMUM_START_TIME_DELTA)
            .unwrap_or_else(|_| TimeDelta::zero());
        if start_time >= maximum_start_time {
            error!(
                requested_start_time = %start_time,
                %now,
                maximum_delta = ?MAXIMUM_START_TIME_DELTA,
                "requested start time is too far in the future"
            );
            if let Err(error) = self
                .send_peer_resp(Message::Error(
                    "requested start time is too far in the future".into(),
                ))
                .await
            {
                return cleanup_with(error);
            }
            return cleanup();
        }

        self.start_time = Some(start_time);

        if let Err(error) = self.send_peer_resp(Message::Ack).await {
            return cleanup_with(error);
        }

        proceed(State::Armed)
    }

    /// Waits for the start instant to arrive, making sure the peer does
    /// not disappear in the meantime. No stats arrive in this state, so
    /// any peer traffic is a reason to clean up and reconnect.
    async fn armed(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Armed);

        let Some(start_time) = self.start_time else {
            return cleanup_with(Error::internal("armed without a scheduled start time"));
        };

        tokio::select! {
            _ = sleep(time_until(start_time)) => proceed(State::Running),
            _ = cancel.cancelled() => {
                cleanup_with(Error::timeout("waiting for the test to start"))
            },
            command = self.peer_cmd_receiver.recv() => match command {
                None => cleanup_with(Error::peer("error reading from peer command channel")),
                Some(Message::PeerDisconnectLocal(_)) | Some(Message::PeerDisconnectRemote(_)) => {
                    error!("unexpected peer disconnection");
                    cleanup()
                },
                Some(other) => {
                    error!(
                        command = %other.kind(),
                        "unexpected command from peer while waiting for the test to start"
                    );
                    cleanup()
                },
            },
        }
    }

    /// The test is running. Polls local Openperf, streams every sample to
    /// the client as a stats notification, and exchanges transmit-done
    /// markers.
    async fn running(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Running);

        let mut generator_poll: Option<Poller> = None;
        let mut tx_stats_poll: Option<Poller> = None;
        let mut rx_stats_poll: Option<Poller> = None;

        // Mirror of the client's poller selection: the server's transmit
        // side is the downstream direction.
        let mut client_running = self.client_tx();
        let mut server_running = self.server_tx();

        if server_running {
            let generator_id = self.generator_id.clone().unwrap_or_default();
            generator_poll = Some(spawn_poller(
                &self.openperf_cmd_sender,
                cancel,
                Request::GetGenerator { id: generator_id },
                self.generator_poll_interval,
            ));
            tx_stats_poll = Some(spawn_poller(
                &self.openperf_cmd_sender,
                cancel,
                Request::GetTxStats,
                self.stats_poll_interval,
            ));
        }
        if client_running {
            rx_stats_poll = Some(spawn_poller(
                &self.openperf_cmd_sender,
                cancel,
                Request::GetRxStats,
                self.stats_poll_interval,
            ));
        }

        loop {
            enum RunningEvent {
                Canceled,
                PeerCmd(Option<Message>),
                TxStat(Option<CommandResult>),
                RxStat(Option<CommandResult>),
                Generator(Option<CommandResult>),
            }

            let event = tokio::select! {
                _ = cancel.cancelled() => RunningEvent::Canceled,
                command = self.peer_cmd_receiver.recv() => RunningEvent::PeerCmd(command),
                result = poll_response(&mut tx_stats_poll) => RunningEvent::TxStat(result),
                result = poll_response(&mut rx_stats_poll) => RunningEvent::RxStat(result),
                result = poll_response(&mut generator_poll) => RunningEvent::Generator(result),
            };

            match event {
                RunningEvent::Canceled => {
                    return cleanup_with(Error::timeout("waiting for the test to finish"));
                },

                RunningEvent::PeerCmd(None) => {
                    return cleanup_with(Error::peer("error reading from peer command channel"));
                },
                RunningEvent::PeerCmd(Some(message)) => match message {
                    Message::TransmitDone => {
                        client_running = false;
                        if let Some(poller) = &rx_stats_poll {
                            poller.cancel();
                        }
                        if !server_running {
                            break;
                        }
                    },
                    Message::PeerDisconnectLocal(_) | Message::PeerDisconnectRemote(_) => {
                        error!("unexpected peer disconnection");
                        return cleanup();
                    },
                    other => {
                        error!(
                            actual = %other.kind(),
                            expected = %MessageKind::TransmitDone,
                            "got unexpected message from peer, connection terminated"
                        );
                        return cleanup();
                    },
                },

                RunningEvent::TxStat(None) => tx_stats_poll = None,
                RunningEvent::TxStat(Some(result)) => match result {
                    Ok(Response::TxStats(stats)) => {
                        let notification = Message::StatsNotification(DataStreamStats {
                            tx_stats: Some(stats),
                            rx_stats: None,
                        });
                        if let Err(error) = self.send_peer_notif(notification).await {
                            return cleanup_with(error);
                        }
                    },
                    Err(poll_error) => {
                        error!(
                            error = %poll_error,
                            "error occurred while polling openperf transmit stats"
                        );
                        return cleanup();
                    },
                    Ok(other) => {
                        error!(
                            received = describe_response(&other),
                            "got an unexpected response while polling openperf transmit stats"
                        );
                        return cleanup_with(Error::openperf_mismatch(
                            "sent a get tx stats request and got an unexpected response",
                            describe_response(&other),
                            "a tx stats response",
                        ));
                    },
                },

                RunningEvent::RxStat(None) => rx_stats_poll = None,
                RunningEvent::RxStat(Some(result)) => match result {
                    Ok(Response::RxStats(stats)) => {
                        let notification = Message::StatsNotification(DataStreamStats {
                            tx_stats: None,
                            rx_stats: Some(stats),
                        });
                        if let Err(error) = self.send_peer_notif(notification).await {
                            return cleanup_with(error);
                        }
                    },
                    Err(poll_error) => {
                        error!(
                            error = %poll_error,
                            "error occurred while polling openperf receive stats"
                        );
                        return cleanup();
                    },
                    Ok(other) => {
                        error!(
                            received = describe_response(&other),
                            "got an unexpected response while polling openperf receive stats"
                        );
                        return cleanup_with(Error::openperf_mismatch(
                            "sent a get rx stats request and got an unexpected response",
                            describe_response(&other),
                            "an rx stats response",
                        ));
                    },
                },

                RunningEvent::Generator(None) => generator_poll = None,
                RunningEvent::Generator(Some(result)) => match result {
                    Ok(Response::Generator(generator)) => {
                        if generator.running {
                            continue;
                        }
                        // A late poll response can come through even after
                        // we finished. This is not an error.
                        if !server_running {
                            continue;
                        }

                        if let Some(poller) = &generator_poll {
                            poller.cancel();
                        }
                        generator_poll = None;

                        // Check if there is an in-flight tx stats response
                        // waiting for us. Not having one is not an error.
                        if let Some(flushed) = take_in_flight(&mut tx_stats_poll).await {
                            match flushed {
                                Ok(Response::TxStats(stats)) => {
                                    let notification =
                                        Message::StatsNotification(DataStreamStats {
                                            tx_stats: Some(stats),
                                            rx_stats: None,
                                        });
                                    if let Err(error) = self.send_peer_notif(notification).await {
                                        return cleanup_with(error);
                                    }
                                },
                                Err(poll_error) => {
                                    error!(
                                        error = %poll_error,
                                        "error occurred while polling openperf transmit stats"
                                    );
                                    return cleanup();
                                },
                                Ok(other) => {
                                    return cleanup_with(Error::openperf_mismatch(
                                        "sent a get tx stats request and got an unexpected response",
                                        describe_response(&other),
                                        "a tx stats response",
                                    ));
                                },
                            }
                        }

                        // Tell the client we are done transmitting.
                        if let Err(error) = self.send_peer_notif(Message::TransmitDone).await {
                            return cleanup_with(error);
                        }
                        server_running = false;
                        if !client_running {
                            break;
                        }
                    },
                    Err(poll_error) => {
                        error!(
                            error = %poll_error,
                            "error occurred while polling the openperf generator"
                        );
                        return cleanup();
                    },
                    Ok(other) => {
                        error!(
                            received = describe_response(&other),
                            "got an unexpected response while polling the openperf generator"
                        );
                        return cleanup_with(Error::openperf_mismatch(
                            "sent a get generator request and got an unexpected response",
                            describe_response(&other),
                            "a generator response",
                        ));
                    },
                },
            }
        }

        proceed(State::Done)
    }

    /// Traffic has stopped. Samples the final local statistics and serves
    /// them to the client on request.
    async fn done(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Done);

        let mut final_stats = DataStreamStats::default();

        if self.server_tx() {
            match self.openperf_request(Request::GetTxStats).await {
                Ok(Response::TxStats(stats)) => final_stats.tx_stats = Some(stats),
                Ok(other) => {
                    error!(
                        received = describe_response(&other),
                        "got an unexpected response while collecting final transmit stats"
                    );
                    return cleanup();
                },
                Err(request_error) => {
                    error!(error = %request_error, "error getting final transmit stats");
                    return cleanup();
                },
            }
        }
        if self.client_tx() {
            match self.openperf_request(Request::GetRxStats).await {
                Ok(Response::RxStats(stats)) => final_stats.rx_stats = Some(stats),
                Ok(other) => {
                    error!(
                        received = describe_response(&other),
                        "got an unexpected response while collecting final receive stats"
                    );
                    return cleanup();
                },
                Err(request_error) => {
                    error!(error = %request_error, "error getting final receive stats");
                    return cleanup();
                },
            }
        }

        match self
            .wait_for_peer_command(cancel, MessageKind::GetFinalStats)
            .await
        {
            Ok(_) => {},
            Err(WaitError::Fatal(fatal)) => return cleanup_with(fatal),
            Err(WaitError::NonFatal(nonfatal)) => {
                error!(
                    error = %nonfatal,
                    expected = %MessageKind::GetFinalStats,
                    "error while waiting for peer command"
                );
                if let Err(error) = self.send_peer_resp(Message::Error(nonfatal.to_string())).await
                {
                    return cleanup_with(error);
                }
                return cleanup();
            },
        }

        if let Err(error) = self.send_peer_resp(Message::FinalStats(final_stats)).await {
            return cleanup_with(error);
        }

        cleanup()
    }

    /// Deletes the generator this session created, if any, then loops
    /// back to accept the next client unless a fatal error was recorded.
    async fn cleanup(&mut self) -> StepOutcome {
        self.enter(State::Cleanup);

        if let Some(generator_id) = self.generator_id.take() {
            if let Err(error) = self
                .openperf_request(Request::DeleteGenerator { id: generator_id })
                .await
            {
                return (Some(State::Error), Err(error));
            }
        }

        if self.error_after_cleanup {
            return (Some(State::Error), Ok(()));
        }

        self.start_time = None;
        proceed(State::Connect)
    }

    /// Terminal state for fatal errors.
    fn error_state(&mut self) -> StepOutcome {
        self.enter(State::Error);
        error!("server state machine exiting due to error");
        finished()
    }

    /// Builds the parameters advertised to the client from the server's
    /// local configuration.
    fn server_parameters(&self) -> ServerParameters {
        let addresses = self.configuration.server_addresses.clone().unwrap_or_default();
        ServerParameters {
            openperf_url: self
                .configuration
                .openperf_url
                .as_ref()
                .map(Url::to_string)
                .unwrap_or_else(|| "http://localhost:9000".into()),
            link_speed: self.configuration.link_speed,
            protocol_list: addresses.protocol_list,
            address_list: addresses.address_list,
        }
    }

    async fn send_peer_resp(&self, message: Message) -> Result<(), Error> {
        self.peer_resp_sender
            .send(message)
            .await
            .map_err(|_| Error::peer("error writing to peer response channel"))
    }

    async fn send_peer_notif(&self, message: Message) -> Result<(), Error> {
        self.peer_notif_sender
            .send(message)
            .await
            .map_err(|_| Error::peer("error writing to peer notification channel"))
    }

    async fn openperf_request(&self, request: Request) -> Result<Response, Error> {
        openperf::request(&self.openperf_cmd_sender, self.openperf_timeout, request).await
    }

    /// Waits up to the peer timeout for a command of the expected kind.
    /// Distinguishes fatal outcomes (broken channel, disconnects,
    /// cancellation) from non-fatal protocol violations so the caller can
    /// choose between terminating and resetting.
    async fn wait_for_peer_command(
        &mut self,
        cancel: &CancellationToken,
        expected: MessageKind,
    ) -> Result<Message, WaitError> {
        let command = tokio::select! {
            command = self.peer_cmd_receiver.recv() => command,
            _ = cancel.cancelled() => {
                return Err(WaitError::Fatal(Error::timeout(
                    "waiting for a command from peer",
                )));
            },
            _ = sleep(self.peer_timeout) => {
                error!(expected = %expected, "timed out waiting for peer command");
                return Err(WaitError::NonFatal(Error::timeout(
                    "waiting for a command from peer",
                )));
            },
        };

        let Some(command) = command else {
            error!(expected = %expected, "error reading from peer command channel");
            return Err(WaitError::Fatal(Error::peer(
                "error reading from peer command channel",
            )));
        };

        if command.kind() == expected {
            trace!(message = %command.kind(), "received message from peer");
            return Ok(command);
        }

        match command {
            Message::Error(reason) => {
                error!(error = %reason, "received error command from peer");
                Err(WaitError::NonFatal(Error::peer(reason)))
            },
            Message::PeerDisconnectLocal(notif) => {
                Err(WaitError::Fatal(Error::peer_disconnect(true, notif.err)))
            },
            Message::PeerDisconnectRemote(notif) => {
                Err(WaitError::Fatal(Error::peer_disconnect(false, notif.err)))
            },
            other => {
                error!(
                    actual = %other.kind(),
                    expected = %expected,
                    "unexpected command from peer"
                );
                Err(WaitError::NonFatal(Error::peer_mismatch(
                    "unexpected command from peer",
                    other.kind().to_string(),
                    expected.to_string(),
                )))
            },
        }
    }
}

fn validate_test_configuration(configuration: &ServerConfiguration) -> Result<(), Error> {
    if configuration.upstream_rate_bps == 0 && configuration.downstream_rate_bps == 0 {
        return Err(Error::invalid_configuration(
            "upstream and downstream rates",
            "both zero",
            "at least one positive rate",
        ));
    }
    Ok(())
}

fn time_until(instant: DateTime<Utc>) -> Duration {
    (instant - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
