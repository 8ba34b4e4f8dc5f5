// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Error taxonomy surfaced by the client and server state machines.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("state machine parameter{}", format_details(.what, .actual, .expected))]
    InvalidParam {
        what: String,
        actual: String,
        expected: String,
    },

    #[error("invalid test configuration{}", format_details(.what, .actual, .expected))]
    InvalidConfiguration {
        what: String,
        actual: String,
        expected: String,
    },

    #[error("an error occurred with peer{}", format_details(.what, .actual, .expected))]
    Peer {
        what: String,
        actual: String,
        expected: String,
    },

    #[error("timed out while {operation}")]
    Timeout { operation: String },

    #[error("an error occurred with openperf{}", format_details(.what, .actual, .expected))]
    Openperf {
        what: String,
        actual: String,
        expected: String,
    },

    #[error(
        "unexpected peer disconnect due to {} error: {detail}",
        if *.local { "local" } else { "remote" }
    )]
    UnexpectedPeerDisconnect { local: bool, detail: String },

    #[error("internal error occurred: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn invalid_param(
        what: impl Into<String>,
        actual: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Error::InvalidParam {
            what: what.into(),
            actual: actual.into(),
            expected: expected.into(),
        }
    }

    pub fn invalid_configuration(
        what: impl Into<String>,
        actual: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Error::InvalidConfiguration {
            what: what.into(),
            actual: actual.into(),
            expected: expected.into(),
        }
    }

    pub fn peer(what: impl Into<String>) -> Self {
        Error::Peer {
            what: what.into(),
            actual: String::new(),
            expected: String::new(),
        }
    }

    pub fn peer_mismatch(
        what: impl Into<String>,
        actual: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Error::Peer {
            what: what.into(),
            actual: actual.into(),
            expected: expected.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Error::Timeout {
            operation: operation.into(),
        }
    }

    pub fn openperf(what: impl Into<String>) -> Self {
        Error::Openperf {
            what: what.into(),
            actual: String::new(),
            expected: String::new(),
        }
    }

    pub fn openperf_mismatch(
        what: impl Into<String>,
        actual: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Error::Openperf {
            what: what.into(),
            actual: actual.into(),
            expected: expected.into(),
        }
    }

    pub fn peer_disconnect(local: bool, detail: impl Into<String>) -> Self {
        Error::UnexpectedPeerDisconnect {
            local,
            detail: detail.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }
}

/// Assembles the optional what/actual/expected pieces of an error message,
/// skipping the ones that were not provided.
fn format_details(what: &str, actual: &str, expected: &str) -> String {
    let mut message = String::new();
    if !what.is_empty() {
        message.push_str(": ");
        message.push_str(what);
    }
    if !expected.is_empty() {
        message.push_str(". expected: ");
        message.push_str(expected);
    }
    if !actual.is_empty() {
        message.push_str(". actual: ");
        message.push_str(actual);
    }
    message
}
