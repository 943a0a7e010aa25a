//! # GMR Core
//!
//! Platform-independent protocol library for the Garmin GMR18 radome.
//!
//! This crate contains pure parsing, reassembly and command translation with
//! **zero I/O dependencies**. Sockets, the message bus and the process
//! lifecycle live in `gmr-bridge`.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  gmr-core (platform-independent, no tokio/async deps)        │
//! │  ├── protocol/  (wire format parsing & formatting)           │
//! │  ├── sweep      (fragment reassembly state machine)          │
//! │  └── command    (bus intents -> control frames)              │
//! └──────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  gmr-bridge             │
//!                 │  (tokio, socket2, bus)  │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Key Modules
//!
//! - [`protocol`] - Wire protocol parsing and command formatting
//! - [`sweep`] - Reassembly of scanline fragments into complete sweeps
//! - [`command`] - Parsing of command messages and translation to frames
//!
//! ## Example: Reassembling a sweep
//!
//! ```rust
//! use gmr_core::protocol::gmr18::{encode_scanline, SweepHeader};
//! use gmr_core::sweep::{RawDatagram, SweepAssembler};
//!
//! let mut assembler = SweepAssembler::default();
//! let header = SweepHeader {
//!     sequence: 1,
//!     fragment_offset: 0,
//!     fragment_len: 4,
//!     angle: 45,
//!     sweep_len: 4,
//!     range_m: 1852,
//! };
//! let datagram = RawDatagram::new(encode_scanline(&header, &[1, 2, 3, 4]), 0);
//! let sweep = assembler.feed(&datagram).unwrap().unwrap();
//! assert_eq!(sweep.samples, vec![1, 2, 3, 4]);
//! ```
//!
//! ## Example: Command translation
//!
//! ```rust
//! use gmr_core::command::{translate, RadarCommand};
//!
//! let cmd = RadarCommand::from_json(br#"{"action":"set_range","value":10}"#).unwrap();
//! let frame = translate(cmd).unwrap();
//! assert_eq!(frame.value, 1000);
//! ```

pub mod command;
pub mod error;
pub mod protocol;
pub mod sweep;

// Re-export commonly used types
pub use command::{translate, RadarCommand};
pub use error::{CommandError, ParseError, SweepError};
pub use protocol::gmr18::{ControlFrame, Frame, RadarSettings, RadarStatus};
pub use sweep::{AssemblerConfig, RadarSweep, RawDatagram, SweepAssembler};
