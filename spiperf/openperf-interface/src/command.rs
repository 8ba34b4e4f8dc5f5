// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

/// A request to the local Openperf instance. The Openperf controller
/// translates each variant into the corresponding REST call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// Fetch the current time from the Openperf timekeeper.
    GetTime,
    /// Fetch the runstate of the specified generator resource.
    GetGenerator { id: String },
    /// Delete the specified generator resource.
    DeleteGenerator { id: String },
    /// Fetch the current transmit statistics.
    GetTxStats,
    /// Fetch the current receive statistics.
    GetRxStats,
}

/// A typed reply from the Openperf controller.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Time(TimeKeeper),
    Generator(GeneratorState),
    TxStats(TxStats),
    RxStats(RxStats),
    /// Acknowledges a delete request.
    Deleted,
}

/// Timekeeper snapshot returned for a get time request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TimeKeeper {
    pub time: DateTime<Utc>,
}

/// Generator runstate as reported by Openperf.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GeneratorState {
    pub id: String,
    pub running: bool,
}

/// Transmit-side counters sampled from a generator resource.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TxStats {
    pub timestamp: DateTime<Utc>,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Receive-side counters sampled from an analyzer resource.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RxStats {
    pub timestamp: DateTime<Utc>,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

/// Error populated by the Openperf controller when a request fails.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{0}")]
pub struct CommandError(pub String);

/// The outcome of a single Openperf call.
pub type CommandResult = Result<Response, CommandError>;

/// A single Openperf call in flight between a requester and the Openperf
/// controller. The controller must take each command, issue the
/// corresponding REST call, and signal completion exactly once. The
/// completion slot is a oneshot sender, so the requester may read the
/// result race-free once it resolves.
#[derive(Debug)]
pub struct Command {
    pub request: Request,
    done: Option<oneshot::Sender<CommandResult>>,
}

impl Command {
    /// Creates a command along with the receiver its result is delivered on.
    pub fn new(request: Request) -> (Self, oneshot::Receiver<CommandResult>) {
        let (done, done_receiver) = oneshot::channel();
        let command = Self {
            request,
            done: Some(done),
        };
        (command, done_receiver)
    }

    /// Creates a command whose completion nobody waits on.
    pub fn fire_and_forget(request: Request) -> Self {
        Self {
            request,
            done: None,
        }
    }

    /// Delivers the result to the requester and consumes the completion
    /// slot. A requester that has already gone away is not an error.
    pub fn signal_done(self, result: CommandResult) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }

    /// True when the requester has stopped waiting for this command. The
    /// controller may use this to abort an expensive request early.
    pub fn is_abandoned(&self) -> bool {
        match &self.done {
            Some(done) => done.is_closed(),
            None => false,
        }
    }
}
