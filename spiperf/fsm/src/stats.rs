// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use spiperf_openperf_interface::command::{RxStats, TxStats};

/// Identifies which traffic direction a stats record describes and which
/// side of the session produced the sample. Upstream is client to server
/// traffic; downstream is server to client traffic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatsKind {
    UpstreamTx,
    UpstreamRx,
    DownstreamTx,
    DownstreamRx,
}

/// Payload carried by a stats record.
#[derive(Clone, Debug, PartialEq)]
pub enum StatsValues {
    Tx(TxStats),
    Rx(RxStats),
}

/// One statistics record emitted to the stats sink. Records with `is_final`
/// set describe the end-of-test sample; all others are runtime samples.
#[derive(Clone, Debug, PartialEq)]
pub struct Stats {
    pub kind: StatsKind,
    pub values: StatsValues,
    pub is_final: bool,
}

impl Stats {
    pub fn runtime(kind: StatsKind, values: StatsValues) -> Self {
        Self {
            kind,
            values,
            is_final: false,
        }
    }

    pub fn final_sample(kind: StatsKind, values: StatsValues) -> Self {
        Self {
            kind,
            values,
            is_final: true,
        }
    }
}
