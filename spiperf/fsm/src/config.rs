// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::errors::Error;
use std::{fmt, str::FromStr};
use url::Url;

/// Repository of information for one test session.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    /// REST endpoint of the local Openperf instance.
    pub openperf_url: Option<Url>,

    /// Client to server traffic rate. Zero disables the direction.
    pub upstream_rate_bps: u64,
    /// Server to client traffic rate. Zero disables the direction.
    pub downstream_rate_bps: u64,

    pub transmit_duration: u64,
    pub duration_units: DurationUnits,

    pub fixed_frame_size: u64,
    pub imix_genome_code: Option<String>,

    /// Nominal speed of the local link, advertised to the peer.
    pub link_speed: u64,

    pub client_addresses: Option<AddressConfiguration>,
    pub server_addresses: Option<AddressConfiguration>,
}

/// List of protocol headers and the addresses associated with them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AddressConfiguration {
    pub protocol_list: Vec<String>,
    pub address_list: Vec<String>,
}

/// Units for the configured transmit duration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DurationUnits {
    #[default]
    Seconds,
    Frames,
}

impl FromStr for DurationUnits {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "seconds" => Ok(DurationUnits::Seconds),
            "frames" => Ok(DurationUnits::Frames),
            other => Err(Error::invalid_configuration(
                "duration units",
                other,
                "seconds | frames",
            )),
        }
    }
}

impl fmt::Display for DurationUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationUnits::Seconds => write!(f, "seconds"),
            DurationUnits::Frames => write!(f, "frames"),
        }
    }
}

/// Allocates a session-unique identifier for the generator resource created
/// on the local Openperf instance. The state machine remembers the id so
/// cleanup can delete the resource it created.
pub(crate) fn allocate_generator_id() -> String {
    format!("spiperf-generator-{:08x}", rand::random::<u32>())
}
