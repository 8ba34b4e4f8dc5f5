// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Helpers for talking to the local Openperf instance from a state machine.

use crate::errors::Error;
use spiperf_openperf_interface::{
    command::{Command, CommandResult, Request, Response},
    command_repeater::CommandRepeater,
};
use std::time::Duration;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Issues a single command to the local Openperf instance and waits for the
/// controller to complete it, bounded by the given timeout.
pub(crate) async fn request(
    openperf_cmd_sender: &mpsc::Sender<Command>,
    openperf_timeout: Duration,
    request: Request,
) -> Result<Response, Error> {
    let (command, done_receiver) = Command::new(request);
    openperf_cmd_sender
        .send(command)
        .await
        .map_err(|_| Error::openperf("error writing to openperf command channel"))?;

    let result = timeout(openperf_timeout, done_receiver)
        .await
        .map_err(|_| Error::timeout("waiting for a reply from openperf"))?
        .map_err(|_| Error::openperf("openperf controller dropped the command"))?;

    result.map_err(|error| Error::openperf(error.to_string()))
}

/// A repeater running on its own task, polling Openperf with a fixed
/// request. Cancelling the poller (explicitly or by drop) stops the
/// repeater, which then closes the response channel.
#[derive(Debug)]
pub(crate) struct Poller {
    pub responses: mpsc::Receiver<CommandResult>,
    cancel: CancellationToken,
}

impl Poller {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawns a repeater polling the given request every interval. The poller's
/// cancellation token is a child of the caller's, so cancelling the session
/// also stops every poller.
pub(crate) fn spawn_poller(
    openperf_cmd_sender: &mpsc::Sender<Command>,
    cancel: &CancellationToken,
    request: Request,
    interval: Duration,
) -> Poller {
    let (response_sender, responses) = mpsc::channel(1);
    let repeater = CommandRepeater::new(
        request,
        interval,
        openperf_cmd_sender.clone(),
        response_sender,
    );

    let poller_cancel = cancel.child_token();
    let repeater_cancel = poller_cancel.clone();
    tokio::spawn(async move {
        if let Err(error) = repeater.run(repeater_cancel).await {
            warn!(%error, "openperf command repeater exited with an error");
        }
    });

    Poller {
        responses,
        cancel: poller_cancel,
    }
}

/// Names a response variant for error messages.
pub(crate) fn describe_response(response: &Response) -> &'static str {
    match response {
        Response::Time(_) => "timekeeper",
        Response::Generator(_) => "generator",
        Response::TxStats(_) => "tx stats",
        Response::RxStats(_) => "rx stats",
        Response::Deleted => "deleted",
    }
}

/// Receives the next response from an optional poller. Pends forever when
/// the slot is empty so a select loop can treat a stopped poller as inert.
pub(crate) async fn poll_response(poller: &mut Option<Poller>) -> Option<CommandResult> {
    match poller {
        Some(poller) => poller.responses.recv().await,
        None => std::future::pending().await,
    }
}

/// Cancels the poller and reads its in-flight response, if any, then clears
/// the slot. The repeater closes the response channel once it observes the
/// cancellation, which bounds the wait.
pub(crate) async fn take_in_flight(poller: &mut Option<Poller>) -> Option<CommandResult> {
    let Some(active) = poller else {
        return None;
    };
    active.cancel();
    let result = active.responses.recv().await;
    *poller = None;
    result
}
