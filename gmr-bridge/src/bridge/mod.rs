//! The two bridge loops and what they share.
//!
//! [`ingest::IngestLoop`] owns the multicast socket and publishes sweeps and
//! status; [`command::CommandLoop`] owns the control socket and forwards bus
//! commands to the radome. They share nothing but the bus.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use gmr_core::sweep::AssemblerConfig;
use thiserror::Error;

use crate::bus::payload::SweepFormat;
use crate::bus::BusError;

pub mod command;
pub mod ingest;
pub mod stdio;

pub const DEFAULT_SWEEP_TOPIC: &str = "garmin/gmr18radar/scanline";
pub const DEFAULT_STATUS_TOPIC: &str = "garmin/gmr18radar/status";
pub const DEFAULT_COMMAND_TOPIC: &str = "garmin/radar/command";

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("Interface '{0}' is not available")]
    InterfaceNotFound(String),
    #[error("Interface '{0}' has no IPv4 address")]
    InterfaceNoV4(String),
    #[error("Cannot enumerate network interfaces: {0}")]
    Enumerate(String),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Shutdown")]
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    pub sweep: String,
    pub status: String,
    pub command: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            sweep: DEFAULT_SWEEP_TOPIC.to_string(),
            status: DEFAULT_STATUS_TOPIC.to_string(),
            command: DEFAULT_COMMAND_TOPIC.to_string(),
        }
    }
}

/// Settings shared by the loops
#[derive(Clone, Debug, Default)]
pub struct BridgeConfig {
    pub topics: Topics,
    pub format: SweepFormat,
    pub assembler: AssemblerConfig,
}

/// Wall clock time in milliseconds since the Unix epoch
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
