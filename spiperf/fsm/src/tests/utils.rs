// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    client::Client,
    config::Configuration,
    errors::Error,
    server::Server,
    state::{State, StateHandle},
    stats::Stats,
};
use claims::{assert_ok, assert_some};
use spiperf_messages::{Message, MessageKind};
use spiperf_openperf_interface::command::{
    Command, CommandResult, Request, RxStats, TimeKeeper, TxStats,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Short tunables so the tests run quickly.
pub const TEST_PEER_TIMEOUT: Duration = Duration::from_millis(500);
pub const TEST_OPENPERF_TIMEOUT: Duration = Duration::from_millis(500);
pub const TEST_START_DELAY: Duration = Duration::from_millis(200);
pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on any single wait inside a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initializes the test logger (if it hasn't already been initialized)
pub fn initialize_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A client state machine running on its own task, along with the far ends
/// of all of its channels.
pub struct ClientHarness {
    pub peer_cmd_receiver: mpsc::Receiver<Message>,
    pub peer_resp_sender: mpsc::Sender<Message>,
    pub peer_notif_sender: mpsc::Sender<Message>,
    pub openperf_cmd_receiver: mpsc::Receiver<Command>,
    pub stats_receiver: mpsc::Receiver<Stats>,
    pub state: StateHandle,
    pub cancel: CancellationToken,
    pub run_handle: JoinHandle<Result<(), Error>>,
}

/// Spawns a client state machine with test tunables and the given
/// configuration.
pub fn spawn_client(configuration: Configuration) -> ClientHarness {
    initialize_logger();

    let (peer_cmd_sender, peer_cmd_receiver) = mpsc::channel(8);
    let (peer_resp_sender, peer_resp_receiver) = mpsc::channel(8);
    let (peer_notif_sender, peer_notif_receiver) = mpsc::channel(8);
    let (openperf_cmd_sender, openperf_cmd_receiver) = mpsc::channel(8);
    let (stats_sender, stats_receiver) = mpsc::channel(64);

    let mut client = Client::new(
        peer_cmd_sender,
        peer_resp_receiver,
        peer_notif_receiver,
        openperf_cmd_sender,
        stats_sender,
    );
    client.peer_timeout = TEST_PEER_TIMEOUT;
    client.openperf_timeout = TEST_OPENPERF_TIMEOUT;
    client.start_delay = TEST_START_DELAY;
    client.stats_poll_interval = TEST_POLL_INTERVAL;
    client.generator_poll_interval = TEST_POLL_INTERVAL;
    client.configuration = configuration;

    let state = client.state_handle();
    let cancel = CancellationToken::new();
    let run_handle = tokio::spawn(client.run(cancel.clone()));

    ClientHarness {
        peer_cmd_receiver,
        peer_resp_sender,
        peer_notif_sender,
        openperf_cmd_receiver,
        stats_receiver,
        state,
        cancel,
        run_handle,
    }
}

/// A server state machine running on its own task, along with the far ends
/// of all of its channels.
pub struct ServerHarness {
    pub peer_cmd_sender: mpsc::Sender<Message>,
    pub peer_resp_receiver: mpsc::Receiver<Message>,
    pub peer_notif_receiver: mpsc::Receiver<Message>,
    pub openperf_cmd_receiver: mpsc::Receiver<Command>,
    pub state: StateHandle,
    pub cancel: CancellationToken,
    pub run_handle: JoinHandle<Result<(), Error>>,
}

/// Spawns a server state machine with test tunables and the given
/// configuration.
pub fn spawn_server(configuration: Configuration) -> ServerHarness {
    initialize_logger();

    let (peer_cmd_sender, peer_cmd_receiver) = mpsc::channel(8);
    let (peer_resp_sender, peer_resp_receiver) = mpsc::channel(8);
    let (peer_notif_sender, peer_notif_receiver) = mpsc::channel(8);
    let (openperf_cmd_sender, openperf_cmd_receiver) = mpsc::channel(8);

    let mut server = Server::new(
        peer_cmd_receiver,
        peer_resp_sender,
        peer_notif_sender,
        openperf_cmd_sender,
    );
    server.peer_timeout = TEST_PEER_TIMEOUT;
    server.openperf_timeout = TEST_OPENPERF_TIMEOUT;
    server.start_delay = TEST_START_DELAY;
    server.stats_poll_interval = TEST_POLL_INTERVAL;
    server.generator_poll_interval = TEST_POLL_INTERVAL;
    server.configuration = configuration;

    let state = server.state_handle();
    let cancel = CancellationToken::new();
    let run_handle = tokio::spawn(server.run(cancel.clone()));

    ServerHarness {
        peer_cmd_sender,
        peer_resp_receiver,
        peer_notif_receiver,
        openperf_cmd_receiver,
        state,
        cancel,
        run_handle,
    }
}

/// Creates a configuration with client to server traffic only.
pub fn upstream_only_configuration() -> Configuration {
    Configuration {
        upstream_rate_bps: 100,
        transmit_duration: 10,
        fixed_frame_size: 128,
        ..Configuration::default()
    }
}

/// Creates a configuration with server to client traffic only.
pub fn downstream_only_configuration() -> Configuration {
    Configuration {
        downstream_rate_bps: 100,
        transmit_duration: 10,
        fixed_frame_size: 128,
        ..Configuration::default()
    }
}

/// Creates a configuration with traffic in both directions.
pub fn bidirectional_configuration() -> Configuration {
    Configuration {
        upstream_rate_bps: 100,
        downstream_rate_bps: 200,
        transmit_duration: 10,
        fixed_frame_size: 128,
        ..Configuration::default()
    }
}

/// Creates the server's local configuration (the parameters it advertises
/// to connecting clients).
pub fn server_local_configuration() -> Configuration {
    Configuration {
        openperf_url: Some(Url::parse("http://localhost:9000").unwrap()),
        link_speed: 1_000_000_000,
        server_addresses: Some(crate::config::AddressConfiguration {
            protocol_list: vec!["ipv4".into(), "udp".into()],
            address_list: vec!["198.51.100.10".into()],
        }),
        ..Configuration::default()
    }
}

/// Receives the next message from the given peer channel, failing the test
/// if nothing arrives in time, and verifies its kind.
pub async fn expect_peer_message(
    receiver: &mut mpsc::Receiver<Message>,
    expected: MessageKind,
) -> Message {
    let message = assert_some!(assert_ok!(timeout(TEST_TIMEOUT, receiver.recv()).await));
    assert_eq!(message.kind(), expected);
    message
}

/// Receives the next command sent to the mock Openperf controller.
pub async fn expect_openperf_command(receiver: &mut mpsc::Receiver<Command>) -> Command {
    assert_some!(assert_ok!(timeout(TEST_TIMEOUT, receiver.recv()).await))
}

/// Receives the next stats record emitted to the sink.
pub async fn expect_stats_record(receiver: &mut mpsc::Receiver<Stats>) -> Stats {
    assert_some!(assert_ok!(timeout(TEST_TIMEOUT, receiver.recv()).await))
}

/// Waits for the state machine task to finish and returns its result.
pub async fn wait_for_run_result(run_handle: JoinHandle<Result<(), Error>>) -> Result<(), Error> {
    assert_ok!(assert_ok!(timeout(TEST_TIMEOUT, run_handle).await))
}

/// Polls the state handle until the machine publishes the expected state.
pub async fn wait_for_state(state: &StateHandle, expected: State) {
    assert_ok!(
        timeout(TEST_TIMEOUT, async {
            while state.get() != expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    );
}

/// Spawns a mock Openperf controller that answers every command with the
/// given handler until the command channel closes.
pub fn spawn_openperf_controller<Handler>(
    mut openperf_cmd_receiver: mpsc::Receiver<Command>,
    mut handler: Handler,
) -> JoinHandle<()>
where
    Handler: FnMut(&Request) -> CommandResult + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(command) = openperf_cmd_receiver.recv().await {
            let result = handler(&command.request);
            command.signal_done(result);
        }
    })
}

/// Creates a timekeeper snapshot at the current time.
pub fn create_timekeeper() -> TimeKeeper {
    TimeKeeper { time: Utc::now() }
}

/// Creates a transmit stats sample for the given sequence number.
pub fn create_tx_stats(sequence: u64) -> TxStats {
    TxStats {
        timestamp: Utc::now(),
        tx_packets: sequence * 10,
        tx_bytes: sequence * 1280,
    }
}

/// Creates a receive stats sample for the given sequence number.
pub fn create_rx_stats(sequence: u64) -> RxStats {
    RxStats {
        timestamp: Utc::now(),
        rx_packets: sequence * 10,
        rx_bytes: sequence * 1280,
    }
}

/// Parses an RFC 3339 start time the way the server does.
pub fn parse_start_time(start_time: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(start_time)
        .unwrap()
        .with_timezone(&Utc)
}
