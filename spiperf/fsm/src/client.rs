// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{Configuration, allocate_generator_id},
    constants::{
        DEFAULT_GENERATOR_POLL_INTERVAL, DEFAULT_OPENPERF_TIMEOUT, DEFAULT_PEER_TIMEOUT,
        DEFAULT_START_DELAY, DEFAULT_STATS_POLL_INTERVAL,
    },
    errors::Error,
    openperf::{self, Poller, describe_response, poll_response, spawn_poller, take_in_flight},
    state::{State, StateHandle, StepOutcome, cleanup_with, fail, finished, proceed},
    stats::{Stats, StatsKind, StatsValues},
};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use spiperf_messages::{
    DataStreamStats, Hello, Message, MessageKind, PEER_PROTOCOL_VERSION, ServerConfiguration,
    StartCommand,
};
use spiperf_openperf_interface::{
    command::{Command, CommandResult, Request, Response},
    command_repeater::MINIMUM_INTERVAL,
};
use std::time::Duration;
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

/// The client side of a test session. Initiates the session with the
/// server state machine over the peer transport, drives the local Openperf
/// instance, and emits data stream statistics to the stats sink.
pub struct Client {
    /// Sends commands to the peer's server state machine.
    peer_cmd_sender: mpsc::Sender<Message>,

    /// Receives responses from the peer's server state machine.
    peer_resp_receiver: mpsc::Receiver<Message>,

    /// Receives notifications from the peer's server state machine.
    peer_notif_receiver: mpsc::Receiver<Message>,

    /// Sends commands to the local Openperf instance.
    openperf_cmd_sender: mpsc::Sender<Command>,

    /// Emits data stream statistics.
    stats_sender: mpsc::Sender<Stats>,

    /// Maximum time to wait for responses from the peer. Zero means "use
    /// the default".
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

    /// The test configuration for this session.
    pub configuration: Configuration,

    state: StateHandle,
    start_time: Option<DateTime<Utc>>,
    generator_id: Option<String>,
}

/// Event observed by the running-state dispatch loop.
enum RunningEvent {
    Canceled,
    PeerNotif(Option<Message>),
    TxStat(Option<CommandResult>),
    RxStat(Option<CommandResult>),
    Generator(Option<CommandResult>),
}

impl Client {
    pub fn new(
        peer_cmd_sender: mpsc::Sender<Message>,
        peer_resp_receiver: mpsc::Receiver<Message>,
        peer_notif_receiver: mpsc::Receiver<Message>,
        openperf_cmd_sender: mpsc::Sender<Command>,
        stats_sender: mpsc::Sender<Stats>,
    ) -> Self {
        Self {
            peer_cmd_sender,
            peer_resp_receiver,
            peer_notif_receiver,
            openperf_cmd_sender,
            stats_sender,
            peer_timeout: Duration::ZERO,
            openperf_timeout: Duration::ZERO,
            start_delay: Duration::ZERO,
            stats_poll_interval: Duration::ZERO,
            generator_poll_interval: Duration::ZERO,
            configuration: Configuration::default(),
            state: StateHandle::new(),
            start_time: None,
            generator_id: None,
        }
    }

    /// Returns a handle observers may use to read the current state label
    /// while the machine runs.
    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Drives one test session to completion. The first error observed is
    /// returned; subsequent errors are discarded because they are presumed
    /// consequences of the first. The outbound peer command channel is
    /// closed when this returns.
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
                // The error state belongs to the server machine.
                State::Error => finished(),
            };
            if let Err(error) = outcome {
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
            debug!(peer_timeout = ?self.peer_timeout, "using default value for client parameter");
        }
        if self.openperf_timeout.is_zero() {
            self.openperf_timeout = DEFAULT_OPENPERF_TIMEOUT;
            debug!(openperf_timeout = ?self.openperf_timeout, "using default value for client parameter");
        }
        if self.start_delay.is_zero() {
            self.start_delay = DEFAULT_START_DELAY;
            debug!(start_delay = ?self.start_delay, "using default value for client parameter");
        }
        if self.stats_poll_interval.is_zero() {
            self.stats_poll_interval = DEFAULT_STATS_POLL_INTERVAL;
            debug!(stats_poll_interval = ?self.stats_poll_interval, "using default value for client parameter");
        }
        if self.generator_poll_interval.is_zero() {
            self.generator_poll_interval = DEFAULT_GENERATOR_POLL_INTERVAL;
            debug!(generator_poll_interval = ?self.generator_poll_interval, "using default value for client parameter");
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
        trace!(%state, "client state machine entering state");
        self.state.set(state);
    }

    /// True when this side transmits traffic (client to server direction).
    fn client_tx(&self) -> bool {
        self.configuration.upstream_rate_bps > 0
    }

    /// True when the peer transmits traffic (server to client direction).
    fn server_tx(&self) -> bool {
        self.configuration.downstream_rate_bps > 0
    }

    /// Exchanges version information with the peer to verify
    /// compatibility. Nothing has been allocated in Openperf yet, so
    /// errors here terminate without cleanup.
    async fn connect(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Connect);

        let hello = Message::Hello(Hello {
            peer_protocol_version: PEER_PROTOCOL_VERSION.into(),
        });
        if let Err(error) = self.send_peer_cmd(hello).await {
            return fail(error);
        }

        let reply = match self.wait_for_peer_response(cancel, MessageKind::Hello).await {
            Ok(reply) => reply,
            Err(error) => return fail(error),
        };
        let Message::Hello(hello) = reply else {
            return fail(Error::internal("peer response kind mismatch"));
        };

        if hello.peer_protocol_version != PEER_PROTOCOL_VERSION {
            return fail(Error::peer_mismatch(
                "mismatch between client and server protocol versions",
                hello.peer_protocol_version,
                PEER_PROTOCOL_VERSION,
            ));
        }

        proceed(State::Configure)
    }

    /// Fetches the server's parameters, builds the local test
    /// configuration, and pushes it to the server. Once the configuration
    /// has been sent, any error must route through cleanup before exiting.
    async fn configure(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Configure);

        if let Err(error) = self.send_peer_cmd(Message::GetConfig).await {
            return fail(error);
        }

        let reply = match self
            .wait_for_peer_response(cancel, MessageKind::ServerParameters)
            .await
        {
            Ok(reply) => reply,
            Err(error) => return fail(error),
        };
        let Message::ServerParameters(parameters) = reply else {
            return fail(Error::internal("peer response kind mismatch"));
        };

        let openperf_url = match Url::parse(&parameters.openperf_url) {
            Ok(openperf_url) => openperf_url,
            Err(_) => {
                return fail(Error::invalid_configuration(
                    "openperf url received from server",
                    parameters.openperf_url,
                    "a parseable url",
                ));
            },
        };
        self.configuration.openperf_url = Some(openperf_url);

        // The generator is the session resource cleanup must delete, so
        // remember its id for the rest of the session.
        if self.client_tx() {
            self.generator_id = Some(allocate_generator_id());
        }

        let server_configuration = ServerConfiguration {
            transmit_duration: self.configuration.transmit_duration,
            fixed_frame_size: self.configuration.fixed_frame_size,
            upstream_rate_bps: self.configuration.upstream_rate_bps,
            downstream_rate_bps: self.configuration.downstream_rate_bps,
        };
        if let Err(error) = self
            .send_peer_cmd(Message::SetConfig(server_configuration))
            .await
        {
            return cleanup_with(error);
        }

        match self.wait_for_peer_response(cancel, MessageKind::Ack).await {
            Ok(_) => proceed(State::Ready),
            Err(error) => cleanup_with(error),
        }
    }

    /// Reads the local Openperf clock, schedules the start instant, and
    /// sends it to the server.
    async fn ready(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Ready);

        let timekeeper = match self.openperf_request(Request::GetTime).await {
            Ok(Response::Time(timekeeper)) => timekeeper,
            Ok(other) => {
                return cleanup_with(Error::openperf_mismatch(
                    "sent a get time request and got an unexpected response",
                    describe_response(&other),
                    "a timekeeper response",
                ));
            },
            Err(error) => return cleanup_with(error),
        };

        let start_delay = match TimeDelta::from_std(self.start_delay) {
            Ok(start_delay) => start_delay,
            Err(_) => {
                return cleanup_with(Error::invalid_param(
                    "start_delay",
                    format!("{:?}", self.start_delay),
                    "a delay representable as a time offset",
                ));
            },
        };
        let start_time = timekeeper.time + start_delay;
        self.start_time = Some(start_time);

        let start_command = Message::StartCommand(StartCommand {
            start_time: start_time.to_rfc3339_opts(SecondsFormat::Nanos, true),
        });
        if let Err(error) = self.send_peer_cmd(start_command).await {
            return cleanup_with(error);
        }

        match self.wait_for_peer_response(cancel, MessageKind::Ack).await {
            Ok(_) => proceed(State::Armed),
            Err(error) => cleanup_with(error),
        }
    }

    /// Waits for the start instant to arrive. The server may begin
    /// transmitting a fraction before we leave this state, so early stats
    /// notifications are accepted and forwarded.
    async fn armed(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Armed);

        let Some(start_time) = self.start_time else {
            return cleanup_with(Error::internal("armed without a scheduled start time"));
        };

        let deadline = sleep(time_until(start_time));
        tokio::pin!(deadline);

        loop {
            enum ArmedEvent {
                Started,
                Canceled,
                Notif(Option<Message>),
            }

            let event = tokio::select! {
                _ = &mut deadline => ArmedEvent::Started,
                _ = cancel.cancelled() => ArmedEvent::Canceled,
                notif = self.peer_notif_receiver.recv() => ArmedEvent::Notif(notif),
            };

            match event {
                ArmedEvent::Started => return proceed(State::Running),
                ArmedEvent::Canceled => {
                    return cleanup_with(Error::timeout("waiting for the test to start"));
                },
                ArmedEvent::Notif(None) => {
                    return cleanup_with(Error::peer("error reading peer notifications"));
                },
                ArmedEvent::Notif(Some(message)) => match message {
                    Message::StatsNotification(stats) => {
                        if let Err(error) = self.emit_peer_stats(stats, false).await {
                            return cleanup_with(error);
                        }
                    },
                    Message::PeerDisconnectLocal(notif) => {
                        return cleanup_with(Error::peer_disconnect(true, notif.err));
                    },
                    Message::PeerDisconnectRemote(notif) => {
                        return cleanup_with(Error::peer_disconnect(false, notif.err));
                    },
                    other => {
                        return cleanup_with(Error::peer_mismatch(
                            "unexpected notification while waiting for the test to start",
                            other.kind().to_string(),
                            MessageKind::StatsNotification.to_string(),
                        ));
                    },
                },
            }
        }
    }

    /// The test is running. Polls local Openperf for statistics and the
    /// generator runstate, relays peer stats notifications to the sink,
    /// and exchanges transmit-done markers with the server.
    async fn running(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Running);

        let mut generator_poll: Option<Poller> = None;
        let mut tx_stats_poll: Option<Poller> = None;
        let mut rx_stats_poll: Option<Poller> = None;

        // The direction flags select which pollers run and who has to
        // finish transmitting before the test is over.
        let mut client_running = self.client_tx();
        let mut server_running = self.server_tx();

        if client_running {
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
        if server_running {
            rx_stats_poll = Some(spawn_poller(
                &self.openperf_cmd_sender,
                cancel,
                Request::GetRxStats,
                self.stats_poll_interval,
            ));
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => RunningEvent::Canceled,
                notif = self.peer_notif_receiver.recv() => RunningEvent::PeerNotif(notif),
                result = poll_response(&mut tx_stats_poll) => RunningEvent::TxStat(result),
                result = poll_response(&mut rx_stats_poll) => RunningEvent::RxStat(result),
                result = poll_response(&mut generator_poll) => RunningEvent::Generator(result),
            };

            match event {
                RunningEvent::Canceled => {
                    return cleanup_with(Error::timeout("waiting for the test to finish"));
                },

                RunningEvent::PeerNotif(None) => {
                    return cleanup_with(Error::peer("error reading peer notifications"));
                },
                RunningEvent::PeerNotif(Some(message)) => match message {
                    Message::Error(reason) => return cleanup_with(Error::peer(reason)),
                    Message::TransmitDone => {
                        server_running = false;
                        if let Some(poller) = &rx_stats_poll {
                            poller.cancel();
                        }
                        if !client_running {
                            break;
                        }
                    },
                    Message::StatsNotification(stats) => {
                        if let Err(error) = self.emit_peer_stats(stats, false).await {
                            return cleanup_with(error);
                        }
                    },
                    Message::PeerDisconnectLocal(notif) => {
                        return cleanup_with(Error::peer_disconnect(true, notif.err));
                    },
                    Message::PeerDisconnectRemote(notif) => {
                        return cleanup_with(Error::peer_disconnect(false, notif.err));
                    },
                    other => {
                        return cleanup_with(Error::peer_mismatch(
                            "unexpected notification while the test is running",
                            other.kind().to_string(),
                            "a stats notification or transmit done",
                        ));
                    },
                },

                RunningEvent::TxStat(None) => tx_stats_poll = None,
                RunningEvent::TxStat(Some(result)) => match result {
                    Ok(Response::TxStats(stats)) => {
                        let record = Stats::runtime(StatsKind::UpstreamTx, StatsValues::Tx(stats));
                        if let Err(error) = self.emit_stats(record).await {
                            return cleanup_with(error);
                        }
                    },
                    Ok(other) => {
                        return cleanup_with(Error::openperf_mismatch(
                            "sent a get tx stats request and got an unexpected response",
                            describe_response(&other),
                            "a tx stats response",
                        ));
                    },
                    Err(error) => return cleanup_with(Error::openperf(error.to_string())),
                },

                RunningEvent::RxStat(None) => rx_stats_poll = None,
                RunningEvent::RxStat(Some(result)) => match result {
                    Ok(Response::RxStats(stats)) => {
                        let record = Stats::runtime(StatsKind::DownstreamRx, StatsValues::Rx(stats));
                        if let Err(error) = self.emit_stats(record).await {
                            return cleanup_with(error);
                        }
                    },
                    Ok(other) => {
                        return cleanup_with(Error::openperf_mismatch(
                            "sent a get rx stats request and got an unexpected response",
                            describe_response(&other),
                            "an rx stats response",
                        ));
                    },
                    Err(error) => return cleanup_with(Error::openperf(error.to_string())),
                },

                RunningEvent::Generator(None) => generator_poll = None,
                RunningEvent::Generator(Some(result)) => match result {
                    Ok(Response::Generator(generator)) => {
                        if generator.running {
                            continue;
                        }
                        // A late poll response can come through even after
                        // we finished. This is not an error.
                        if !client_running {
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
                                    let record = Stats::runtime(
                                        StatsKind::UpstreamTx,
                                        StatsValues::Tx(stats),
                                    );
                                    if let Err(error) = self.emit_stats(record).await {
                                        return cleanup_with(error);
                                    }
                                },
                                Ok(other) => {
                                    return cleanup_with(Error::openperf_mismatch(
                                        "sent a get tx stats request and got an unexpected response",
                                        describe_response(&other),
                                        "a tx stats response",
                                    ));
                                },
                                Err(error) => {
                                    return cleanup_with(Error::openperf(error.to_string()));
                                },
                            }
                        }

                        // Tell the server we are done transmitting. No ack
                        // is expected.
                        if let Err(error) = self.send_peer_cmd(Message::TransmitDone).await {
                            return cleanup_with(error);
                        }
                        client_running = false;
                        if !server_running {
                            break;
                        }
                    },
                    Ok(other) => {
                        return cleanup_with(Error::openperf_mismatch(
                            "sent a get generator request and got an unexpected response",
                            describe_response(&other),
                            "a generator response",
                        ));
                    },
                    Err(error) => return cleanup_with(Error::openperf(error.to_string())),
                },
            }
        }

        proceed(State::Done)
    }

    /// Traffic has stopped. Collects the end-of-test results from the
    /// server and from local Openperf and emits them as final records.
    async fn done(&mut self, cancel: &CancellationToken) -> StepOutcome {
        self.enter(State::Done);

        // Ask the server for its end-of-test results while sampling our
        // own side in parallel.
        if let Err(error) = self.send_peer_cmd(Message::GetFinalStats).await {
            return cleanup_with(error);
        }

        let (final_tx, final_rx) = futures::join!(
            async {
                if self.client_tx() {
                    Some(self.openperf_request(Request::GetTxStats).await)
                } else {
                    None
                }
            },
            async {
                if self.server_tx() {
                    Some(self.openperf_request(Request::GetRxStats).await)
                } else {
                    None
                }
            },
        );

        match final_tx {
            Some(Ok(Response::TxStats(stats))) => {
                let record = Stats::final_sample(StatsKind::UpstreamTx, StatsValues::Tx(stats));
                if let Err(error) = self.emit_stats(record).await {
                    return cleanup_with(error);
                }
            },
            Some(Ok(other)) => {
                return cleanup_with(Error::openperf_mismatch(
                    "sent a get tx stats request and got an unexpected response",
                    describe_response(&other),
                    "a tx stats response",
                ));
            },
            Some(Err(error)) => return cleanup_with(error),
            None => {},
        }

        match final_rx {
            Some(Ok(Response::RxStats(stats))) => {
                let record = Stats::final_sample(StatsKind::DownstreamRx, StatsValues::Rx(stats));
                if let Err(error) = self.emit_stats(record).await {
                    return cleanup_with(error);
                }
            },
            Some(Ok(other)) => {
                return cleanup_with(Error::openperf_mismatch(
                    "sent a get rx stats request and got an unexpected response",
                    describe_response(&other),
                    "an rx stats response",
                ));
            },
            Some(Err(error)) => return cleanup_with(error),
            None => {},
        }

        let reply = match self
            .wait_for_peer_response(cancel, MessageKind::FinalStats)
            .await
        {
            Ok(reply) => reply,
            Err(error) => return cleanup_with(error),
        };
        let Message::FinalStats(stats) = reply else {
            return cleanup_with(Error::internal("peer response kind mismatch"));
        };
        if let Err(error) = self.emit_peer_stats(stats, true).await {
            return cleanup_with(error);
        }

        proceed(State::Cleanup)
    }

    /// Deletes the generator this session created, if any. Runs at most
    /// once per session and always before `run` returns once the
    /// configuration has been pushed to the server.
    async fn cleanup(&mut self) -> StepOutcome {
        self.enter(State::Cleanup);

        if let Some(generator_id) = self.generator_id.take() {
            match self
                .openperf_request(Request::DeleteGenerator { id: generator_id })
                .await
            {
                Ok(_) => {},
                // Openperf took too long to respond; nothing more we can do.
                Err(Error::Timeout { .. }) => {},
                Err(error) => return fail(error),
            }
        }

        finished()
    }

    async fn send_peer_cmd(&self, message: Message) -> Result<(), Error> {
        self.peer_cmd_sender
            .send(message)
            .await
            .map_err(|_| Error::peer("error writing to peer command channel"))
    }

    async fn openperf_request(&self, request: Request) -> Result<Response, Error> {
        openperf::request(&self.openperf_cmd_sender, self.openperf_timeout, request).await
    }

    /// Waits up to the peer timeout for a response of the expected kind.
    /// Stats notifications arriving in the meantime are forwarded to the
    /// sink; disconnect notifications and unexpected messages fail the
    /// wait.
    async fn wait_for_peer_response(
        &mut self,
        cancel: &CancellationToken,
        expected: MessageKind,
    ) -> Result<Message, Error> {
        let deadline = sleep(self.peer_timeout);
        tokio::pin!(deadline);

        loop {
            enum WaitEvent {
                Response(Option<Message>),
                Notif(Option<Message>),
                TimedOut,
            }

            let event = tokio::select! {
                response = self.peer_resp_receiver.recv() => WaitEvent::Response(response),
                notif = self.peer_notif_receiver.recv() => WaitEvent::Notif(notif),
                _ = &mut deadline => WaitEvent::TimedOut,
                _ = cancel.cancelled() => WaitEvent::TimedOut,
            };

            match event {
                WaitEvent::Response(None) => {
                    return Err(Error::peer("error reading from peer response channel"));
                },
                WaitEvent::Response(Some(message)) => {
                    if message.kind() == expected {
                        return Ok(message);
                    }
                    if let Message::Error(reason) = message {
                        return Err(Error::peer(reason));
                    }
                    return Err(Error::peer_mismatch(
                        "got unexpected message type from peer",
                        message.kind().to_string(),
                        expected.to_string(),
                    ));
                },
                WaitEvent::Notif(None) => {
                    return Err(Error::peer("error reading peer notifications"));
                },
                WaitEvent::Notif(Some(message)) => match message {
                    Message::StatsNotification(stats) => {
                        self.emit_peer_stats(stats, false).await?;
                    },
                    Message::PeerDisconnectLocal(notif) => {
                        return Err(Error::peer_disconnect(true, notif.err));
                    },
                    Message::PeerDisconnectRemote(notif) => {
                        return Err(Error::peer_disconnect(false, notif.err));
                    },
                    other => {
                        return Err(Error::peer_mismatch(
                            "got unexpected notification from peer",
                            other.kind().to_string(),
                            expected.to_string(),
                        ));
                    },
                },
                WaitEvent::TimedOut => {
                    return Err(Error::timeout("waiting for a reply from peer"));
                },
            }
        }
    }

    /// Splits a peer stats notification into tagged records. The peer's
    /// transmit side is the downstream direction; its receive side is the
    /// upstream direction.
    async fn emit_peer_stats(&self, stats: DataStreamStats, is_final: bool) -> Result<(), Error> {
        if let Some(tx_stats) = stats.tx_stats {
            self.emit_stats(Stats {
                kind: StatsKind::DownstreamTx,
                values: StatsValues::Tx(tx_stats),
                is_final,
            })
            .await?;
        }
        if let Some(rx_stats) = stats.rx_stats {
            self.emit_stats(Stats {
                kind: StatsKind::UpstreamRx,
                values: StatsValues::Rx(rx_stats),
                is_final,
            })
            .await?;
        }
        Ok(())
    }

    async fn emit_stats(&self, stats: Stats) -> Result<(), Error> {
        self.stats_sender
            .send(stats)
            .await
            .map_err(|_| Error::internal("error writing to data stream stats channel"))
    }
}

fn time_until(instant: DateTime<Utc>) -> Duration {
    (instant - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
