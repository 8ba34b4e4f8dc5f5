// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
pub use spiperf_openperf_interface::command::{RxStats, TxStats};
use std::fmt;

/// Version of the peer coordination protocol spoken by this build. Peers
/// compare version strings for exact equality during the hello exchange.
pub const PEER_PROTOCOL_VERSION: &str = "1.0";

/// A message envelope for communication between peers. Commands, responses
/// and notifications share this one envelope so that a stream of messages
/// can be multiplexed over a single transport.
///
/// The `PeerDisconnect*` variants are never sent over the wire: the peer
/// transport raises them locally into the state machines when the
/// underlying connection ends unexpectedly.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Message {
    Hello(Hello),
    Ack,
    Error(String),
    GetServerParameters,
    ServerParameters(ServerParameters),
    GetConfig,
    SetConfig(ServerConfiguration),
    StartCommand(StartCommand),
    StatsNotification(DataStreamStats),
    TransmitDone,
    GetFinalStats,
    FinalStats(DataStreamStats),
    PeerDisconnectRemote(PeerDisconnectRemote),
    #[serde(skip)]
    PeerDisconnectLocal(PeerDisconnectLocal),
}

impl Message {
    /// Returns the discriminant-only view of this message, used for
    /// expectation checks and log output.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::Ack => MessageKind::Ack,
            Message::Error(_) => MessageKind::Error,
            Message::GetServerParameters => MessageKind::GetServerParameters,
            Message::ServerParameters(_) => MessageKind::ServerParameters,
            Message::GetConfig => MessageKind::GetConfig,
            Message::SetConfig(_) => MessageKind::SetConfig,
            Message::StartCommand(_) => MessageKind::StartCommand,
            Message::StatsNotification(_) => MessageKind::StatsNotification,
            Message::TransmitDone => MessageKind::TransmitDone,
            Message::GetFinalStats => MessageKind::GetFinalStats,
            Message::FinalStats(_) => MessageKind::FinalStats,
            Message::PeerDisconnectRemote(_) => MessageKind::PeerDisconnectRemote,
            Message::PeerDisconnectLocal(_) => MessageKind::PeerDisconnectLocal,
        }
    }
}

/// Identifies a message variant without its payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageKind {
    Hello,
    Ack,
    Error,
    GetServerParameters,
    ServerParameters,
    GetConfig,
    SetConfig,
    StartCommand,
    StatsNotification,
    TransmitDone,
    GetFinalStats,
    FinalStats,
    PeerDisconnectRemote,
    PeerDisconnectLocal,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Hello => "hello",
            MessageKind::Ack => "ack",
            MessageKind::Error => "error",
            MessageKind::GetServerParameters => "get_server_parameters",
            MessageKind::ServerParameters => "server_parameters",
            MessageKind::GetConfig => "get_config",
            MessageKind::SetConfig => "set_config",
            MessageKind::StartCommand => "start_command",
            MessageKind::StatsNotification => "stats_notification",
            MessageKind::TransmitDone => "transmit_done",
            MessageKind::GetFinalStats => "get_final_stats",
            MessageKind::FinalStats => "final_stats",
            MessageKind::PeerDisconnectRemote => "peer_disconnect_remote",
            MessageKind::PeerDisconnectLocal => "peer_disconnect_local",
        };
        write!(f, "{}", name)
    }
}

/// Initiates a session between client and server instances.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Hello {
    pub peer_protocol_version: String,
}

/// Conveys the server's locally-configured parameters to the client.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerParameters {
    pub openperf_url: String,
    pub link_speed: u64,
    pub protocol_list: Vec<String>,
    pub address_list: Vec<String>,
}

/// The client's view of the test configuration, pushed to the server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerConfiguration {
    pub transmit_duration: u64,
    pub fixed_frame_size: u64,
    pub upstream_rate_bps: u64,
    pub downstream_rate_bps: u64,
}

/// Tells the server what time the test starts running. At the given time
/// both sides start transmitting and/or receiving packets. The instant is
/// rendered as RFC 3339 with nanosecond precision.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StartCommand {
    pub start_time: String,
}

/// Stats sampled from a data stream. Sent while the test is running and
/// again, with the same shape, as the final end-of-test sample.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DataStreamStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_stats: Option<TxStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_stats: Option<RxStats>,
}

/// Sent by the peer to indicate it is terminating the connection.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerDisconnectRemote {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

/// Raised locally by the peer transport when the connection has
/// unexpectedly broken. Carries the rendered local error (for example, a
/// framing failure). Never exchanged between peers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PeerDisconnectLocal {
    pub err: String,
}
