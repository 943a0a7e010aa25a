//! Bus payload formats.
//!
//! Every payload carries a version so consumers can detect layout changes.
//! Sweeps are published either as JSON or in a compact binary layout
//! (little-endian, fixed 28 byte header followed by the samples):
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 4    | magic `GMRS`     |
//! | 4      | 2    | version          |
//! | 6      | 2    | angle            |
//! | 8      | 4    | range (meters)   |
//! | 12     | 4    | sequence         |
//! | 16     | 8    | timestamp (ms)   |
//! | 24     | 4    | sample count     |
//! | 28     | n    | samples          |
//!
//! Status and settings frames are always published as JSON.

use std::io;

use gmr_core::protocol::gmr18::{RadarSettings, RadarStatus, ScannerState};
use gmr_core::RadarSweep;
use serde::Serialize;

/// Magic bytes of a binary sweep payload
pub const SWEEP_MAGIC: [u8; 4] = *b"GMRS";

/// Current payload version
pub const PAYLOAD_VERSION: u16 = 1;

/// Binary sweep header size in bytes
pub const SWEEP_HEADER_SIZE: usize = 28;

/// Encoding of sweeps on the bus
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SweepFormat {
    #[default]
    Json,
    Binary,
}

impl std::fmt::Display for SweepFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepFormat::Json => write!(f, "json"),
            SweepFormat::Binary => write!(f, "binary"),
        }
    }
}

#[derive(Serialize)]
struct SweepMessage<'a> {
    version: u16,
    angle: u16,
    range_meters: u32,
    sequence: u32,
    timestamp_ms: u64,
    samples: &'a [u8],
}

#[derive(Serialize)]
struct StatusMessage {
    version: u16,
    state: ScannerState,
    countdown: u16,
}

#[derive(Serialize)]
struct SettingsMessage {
    version: u16,
    range_meters: u32,
    gain_auto: bool,
    gain_level: u8,
    ftc: bool,
    crosstalk: bool,
}

/// Encode a completed sweep for publication
pub fn encode_sweep(
    sweep: &RadarSweep,
    timestamp_ms: u64,
    format: SweepFormat,
) -> serde_json::Result<Vec<u8>> {
    match format {
        SweepFormat::Json => serde_json::to_vec(&SweepMessage {
            version: PAYLOAD_VERSION,
            angle: sweep.angle,
            range_meters: sweep.range_m,
            sequence: sweep.sequence,
            timestamp_ms,
            samples: &sweep.samples,
        }),
        SweepFormat::Binary => Ok(encode_binary_sweep(sweep, timestamp_ms)),
    }
}

fn encode_binary_sweep(sweep: &RadarSweep, timestamp_ms: u64) -> Vec<u8> {
    let mut buf = vec![0u8; SWEEP_HEADER_SIZE];

    buf[0..4].copy_from_slice(&SWEEP_MAGIC);
    buf[4..6].copy_from_slice(&PAYLOAD_VERSION.to_le_bytes());
    buf[6..8].copy_from_slice(&sweep.angle.to_le_bytes());
    buf[8..12].copy_from_slice(&sweep.range_m.to_le_bytes());
    buf[12..16].copy_from_slice(&sweep.sequence.to_le_bytes());
    buf[16..24].copy_from_slice(&timestamp_ms.to_le_bytes());
    buf[24..28].copy_from_slice(&(sweep.samples.len() as u32).to_le_bytes());
    buf.extend_from_slice(&sweep.samples);

    buf
}

/// Decode a binary sweep payload, returning the sweep and its timestamp
pub fn decode_binary_sweep(data: &[u8]) -> io::Result<(RadarSweep, u64)> {
    if data.len() < SWEEP_HEADER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("sweep payload too short: {} bytes", data.len()),
        ));
    }
    if data[0..4] != SWEEP_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Invalid sweep payload: bad magic bytes",
        ));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version > PAYLOAD_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unsupported sweep payload version: {}", version),
        ));
    }

    let count = u32::from_le_bytes([data[24], data[25], data[26], data[27]]) as usize;
    let samples = SWEEP_HEADER_SIZE
        .checked_add(count)
        .and_then(|end| data.get(SWEEP_HEADER_SIZE..end))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "sweep payload declares {} samples, has {}",
                    count,
                    data.len() - SWEEP_HEADER_SIZE
                ),
            )
        })?;

    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&data[16..24]);

    Ok((
        RadarSweep {
            angle: u16::from_le_bytes([data[6], data[7]]),
            range_m: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            sequence: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            samples: samples.to_vec(),
        },
        u64::from_le_bytes(timestamp),
    ))
}

pub fn encode_status(status: &RadarStatus) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&StatusMessage {
        version: PAYLOAD_VERSION,
        state: status.state,
        countdown: status.countdown,
    })
}

pub fn encode_settings(settings: &RadarSettings) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&SettingsMessage {
        version: PAYLOAD_VERSION,
        range_meters: settings.range_m,
        gain_auto: settings.gain_auto,
        gain_level: settings.gain_level,
        ftc: settings.ftc,
        crosstalk: settings.crosstalk,
    })
}
