//! Radar protocol implementation.
//!
//! Wire protocol parsing and formatting for the GMR18 radome.
//! All functions are pure (no I/O).
//!
//! # Example
//!
//! ```rust
//! use gmr_core::protocol::gmr18::{self, CommandKind};
//!
//! // Format a control command
//! let frame = gmr18::encode_control_frame(CommandKind::Gain.code(), 75);
//! assert_eq!(frame, [0x02, 0xb4, 0x00, 0x02, 0x00, 0x4b]);
//!
//! // Decode whatever arrives on the multicast group
//! let packet: &[u8] = &[0x00, 0x00, 0x02, 0xa5];
//! if let Err(e) = gmr18::decode_frame(packet) {
//!     println!("Parse error: {}", e);
//! }
//! ```

pub mod gmr18;
