// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OPENPERF_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_STATS_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_GENERATOR_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on how far in the future a client may schedule the test
/// start time.
pub const MAXIMUM_START_TIME_DELTA: Duration = Duration::from_secs(180);
