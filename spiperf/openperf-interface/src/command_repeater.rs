// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::command::{Command, CommandResult, Request};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shortest time allowed between repeated commands to Openperf. This value
/// is somewhat arbitrary, but is required so callers can reasonably cancel
/// a running repeater.
pub const MINIMUM_INTERVAL: Duration = Duration::from_millis(10);

/// Errors surfaced by a running command repeater.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RepeaterError {
    #[error("repeater interval {actual:?} is shorter than the minimum {MINIMUM_INTERVAL:?}")]
    IntervalTooShort { actual: Duration },

    #[error("openperf command channel closed")]
    CommandChannelClosed,
}

/// Outcome of a single send/await/relay round.
enum RoundOutcome {
    Relayed,
    ReceiverGone,
    ControllerGone,
}

/// Repeatedly sends the same request to an Openperf instance. This should
/// only ever be used for read requests. At most one command is in flight at
/// a time: each round waits for the controller to signal completion before
/// arming the next tick, so responses are relayed in completion order.
pub struct CommandRepeater {
    /// Request template cloned into each outgoing command.
    request: Request,

    /// Time between commands. Must be at least `MINIMUM_INTERVAL`.
    interval: Duration,

    /// Channel commands are sent to the Openperf controller on. The
    /// repeater never closes this channel.
    openperf_cmd_sender: mpsc::Sender<Command>,

    /// Channel responses are relayed to the caller on. Closed (by drop)
    /// exactly once when `run` returns.
    responses: mpsc::Sender<CommandResult>,
}

impl CommandRepeater {
    pub fn new(
        request: Request,
        interval: Duration,
        openperf_cmd_sender: mpsc::Sender<Command>,
        responses: mpsc::Sender<CommandResult>,
    ) -> Self {
        Self {
            request,
            interval,
            openperf_cmd_sender,
            responses,
        }
    }

    /// Sends the request every interval until the token is cancelled. On
    /// exit the responses channel is dropped, which closes it for the
    /// caller.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RepeaterError> {
        if self.interval < MINIMUM_INTERVAL {
            return Err(RepeaterError::IntervalTooShort {
                actual: self.interval,
            });
        }

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                outcome = self.round() => outcome,
            };

            match outcome {
                RoundOutcome::Relayed => {},
                RoundOutcome::ReceiverGone => return Ok(()),
                RoundOutcome::ControllerGone => return Err(RepeaterError::CommandChannelClosed),
            }
        }
    }

    /// One round: wait out the interval, send a fresh command, wait for the
    /// controller to complete it, and relay the result to the caller.
    async fn round(&self) -> RoundOutcome {
        tokio::time::sleep(self.interval).await;

        let (command, done_receiver) = Command::new(self.request.clone());
        if self.openperf_cmd_sender.send(command).await.is_err() {
            return RoundOutcome::ControllerGone;
        }

        let result = match done_receiver.await {
            Ok(result) => result,
            Err(_) => return RoundOutcome::ControllerGone,
        };

        if self.responses.send(result).await.is_err() {
            return RoundOutcome::ReceiverGone;
        }
        RoundOutcome::Relayed
    }
}
