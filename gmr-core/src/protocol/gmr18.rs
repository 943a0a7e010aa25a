//! Garmin GMR18 radome protocol parsing and command formatting
//!
//! The GMR18 talks plain UDP:
//! - Data address: 239.254.2.0:50100 - scanline, status and response frames
//! - Send port: 50101 - commands to radar (on radar's IP)
//!
//! Every frame received on the multicast group starts with a big-endian u32
//! frame type. Scanlines are too large for one datagram at long range, so each
//! scanline datagram carries one fragment of a sweep together with the
//! sweep's declared total length.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

// =============================================================================
// Network Constants
// =============================================================================

/// Multicast group the radome sends on
pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 254, 2, 0);
/// Multicast port for scanline/status/response frames
pub const DATA_PORT: u16 = 50100;

/// Factory default radome address
pub const RADAR_ADDR: Ipv4Addr = Ipv4Addr::new(172, 16, 2, 0);
/// Command port (on radar's IP address)
pub const SEND_PORT: u16 = 50101;

// =============================================================================
// Frame Types
// =============================================================================

/// Scanline (sweep fragment)
pub const FRAME_SCANLINE: u32 = 0x02a3;
/// Scanner status
pub const FRAME_STATUS: u32 = 0x02a5;
/// Settings response
pub const FRAME_RESPONSE: u32 = 0x02a7;

// =============================================================================
// Command Codes
// =============================================================================

/// Command kinds understood by the radome, with their 16-bit codes.
///
/// Power on and power off share [`CommandKind::Power`] and are told apart by
/// the value field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Power,
    Range,
    Gain,
    Ftc,
    Crosstalk,
}

impl CommandKind {
    pub const fn code(self) -> u16 {
        match self {
            CommandKind::Power => 0x02b2,
            CommandKind::Range => 0x02b3,
            CommandKind::Gain => 0x02b4,
            CommandKind::Ftc => 0x02b8,
            CommandKind::Crosstalk => 0x02b9,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x02b2 => Some(CommandKind::Power),
            0x02b3 => Some(CommandKind::Range),
            0x02b4 => Some(CommandKind::Gain),
            0x02b8 => Some(CommandKind::Ftc),
            0x02b9 => Some(CommandKind::Crosstalk),
            _ => None,
        }
    }
}

/// Power value that starts the radome
pub const POWER_ON: u16 = 2;
/// Power value that stops the radome
pub const POWER_OFF: u16 = 1;
/// Gain value selecting automatic gain
pub const GAIN_AUTO: u16 = 0;

// =============================================================================
// Control Frames
// =============================================================================

/// Size of an encoded control frame
pub const CONTROL_FRAME_SIZE: usize = 6;
/// Value of the length field in every control frame
pub const CONTROL_VALUE_LEN: u16 = 2;

/// One command as written to the control socket.
///
/// Layout (big-endian):
/// ```text
/// [2 bytes] command code
/// [2 bytes] value length (always 2)
/// [2 bytes] value
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    pub command_code: u16,
    pub length: u16,
    pub value: u16,
}

impl ControlFrame {
    pub fn new(kind: CommandKind, value: u16) -> Self {
        ControlFrame {
            command_code: kind.code(),
            length: CONTROL_VALUE_LEN,
            value,
        }
    }

    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_code(self.command_code)
    }

    pub fn to_bytes(&self) -> [u8; CONTROL_FRAME_SIZE] {
        encode_control_frame(self.command_code, self.value)
    }
}

/// Encode a control frame
pub fn encode_control_frame(command_code: u16, value: u16) -> [u8; CONTROL_FRAME_SIZE] {
    let mut frame = [0u8; CONTROL_FRAME_SIZE];
    frame[0..2].copy_from_slice(&command_code.to_be_bytes());
    frame[2..4].copy_from_slice(&CONTROL_VALUE_LEN.to_be_bytes());
    frame[4..6].copy_from_slice(&value.to_be_bytes());
    frame
}

/// Decode a control frame into `(command_code, value)`
pub fn decode_control_frame(data: &[u8]) -> Result<(u16, u16), ParseError> {
    if data.len() != CONTROL_FRAME_SIZE {
        return Err(ParseError::malformed(
            format!("control frame must be {} bytes", CONTROL_FRAME_SIZE),
            data.len(),
        ));
    }
    let length = u16::from_be_bytes([data[2], data[3]]);
    if length != CONTROL_VALUE_LEN {
        return Err(ParseError::malformed(
            format!("control frame length field is {}", length),
            data.len(),
        ));
    }
    Ok((
        u16::from_be_bytes([data[0], data[1]]),
        u16::from_be_bytes([data[4], data[5]]),
    ))
}

// =============================================================================
// Scanline Data Structures
// =============================================================================

/// GMR18 scanline header, all fields big-endian
#[derive(Deserialize, Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct ScanlineHeader {
    /// Frame type (0x02a3)
    pub frame_type: [u8; 4],
    /// Sweep sequence number
    pub sequence: [u8; 4],
    /// Byte offset of this fragment within the sweep
    pub fragment_offset: [u8; 2],
    /// Payload bytes carried in this datagram
    pub fragment_len: [u8; 2],
    /// Angle in device units
    pub angle: [u8; 2],
    /// Declared total sweep length (one byte per range bin)
    pub sweep_len: [u8; 2],
    /// Range in meters
    pub range: [u8; 4],
    /// Device status block (gain, FTC, crosstalk snapshot)
    _status: [u8; 32],
    _status_tail: [u8; 2],
}

/// Scanline header size in bytes; payload starts at 0x36
pub const SCANLINE_HEADER_SIZE: usize = std::mem::size_of::<ScanlineHeader>();

/// Parsed scanline header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepHeader {
    pub sequence: u32,
    pub fragment_offset: u16,
    pub fragment_len: u16,
    pub angle: u16,
    /// Declared number of range bins in the complete sweep
    pub sweep_len: u16,
    pub range_m: u32,
}

/// One decoded scanline datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepFragment<'a> {
    pub header: SweepHeader,
    pub payload: &'a [u8],
}

// =============================================================================
// Status and Response Data Structures
// =============================================================================

/// Minimum size of a status frame
pub const STATUS_FRAME_SIZE: usize = 16;
/// Minimum size of a response frame
pub const RESPONSE_FRAME_SIZE: usize = 20;

/// Scanner state reported in status frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    WarmingUp,
    Standby,
    Active,
    SpinUp,
    Unknown(u16),
}

impl ScannerState {
    pub fn from_value(v: u16) -> Self {
        match v {
            1 => ScannerState::WarmingUp,
            3 => ScannerState::Standby,
            4 => ScannerState::Active,
            5 => ScannerState::SpinUp,
            _ => ScannerState::Unknown(v),
        }
    }
}

/// Parsed status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadarStatus {
    pub state: ScannerState,
    /// Seconds until warm-up completes
    pub countdown: u16,
}

/// Parsed settings response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadarSettings {
    pub range_m: u32,
    pub gain_auto: bool,
    pub gain_level: u8,
    pub ftc: bool,
    pub crosstalk: bool,
}

/// Any frame received on the data group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Scanline(SweepFragment<'a>),
    Status(RadarStatus),
    Response(RadarSettings),
}

// =============================================================================
// Parsing Functions
// =============================================================================

/// Leading frame type, if the datagram is long enough to have one
pub fn frame_type(data: &[u8]) -> Option<u32> {
    data.get(0..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decode any GMR18 frame, dispatching on the frame type
pub fn decode_frame(data: &[u8]) -> Result<Frame<'_>, ParseError> {
    let packet_type = frame_type(data)
        .ok_or_else(|| ParseError::malformed("no frame type", data.len()))?;

    match packet_type {
        FRAME_SCANLINE => decode_fragment(data).map(Frame::Scanline),
        FRAME_STATUS => decode_status(data).map(Frame::Status),
        FRAME_RESPONSE => decode_response(data).map(Frame::Response),
        other => Err(ParseError::UnknownFrameType(other)),
    }
}

/// Decode a scanline header
pub fn decode_sweep_header(data: &[u8]) -> Result<SweepHeader, ParseError> {
    if data.len() < SCANLINE_HEADER_SIZE {
        return Err(ParseError::malformed(
            format!(
                "scanline header needs {} bytes",
                SCANLINE_HEADER_SIZE
            ),
            data.len(),
        ));
    }

    let header: ScanlineHeader = bincode::deserialize(&data[..SCANLINE_HEADER_SIZE])?;

    let parsed = SweepHeader {
        sequence: u32::from_be_bytes(header.sequence),
        fragment_offset: u16::from_be_bytes(header.fragment_offset),
        fragment_len: u16::from_be_bytes(header.fragment_len),
        angle: u16::from_be_bytes(header.angle),
        sweep_len: u16::from_be_bytes(header.sweep_len),
        range_m: u32::from_be_bytes(header.range),
    };

    if parsed.sweep_len == 0 {
        return Err(ParseError::malformed("declared sweep length is 0", data.len()));
    }
    if parsed.fragment_len == 0 {
        return Err(ParseError::malformed("fragment length is 0", data.len()));
    }
    let end = parsed.fragment_offset as usize + parsed.fragment_len as usize;
    if end > parsed.sweep_len as usize {
        return Err(ParseError::malformed(
            format!(
                "fragment {}..{} exceeds declared sweep length {}",
                parsed.fragment_offset, end, parsed.sweep_len
            ),
            data.len(),
        ));
    }
    if parsed.fragment_len as usize > data.len() - SCANLINE_HEADER_SIZE {
        return Err(ParseError::malformed(
            format!(
                "fragment length {} exceeds the {} payload bytes in the datagram",
                parsed.fragment_len,
                data.len() - SCANLINE_HEADER_SIZE
            ),
            data.len(),
        ));
    }

    Ok(parsed)
}

/// Extract the sample bytes of a scanline datagram
pub fn decode_sweep_payload<'a>(
    header: &SweepHeader,
    data: &'a [u8],
) -> Result<&'a [u8], ParseError> {
    let expected = header.fragment_len as usize;
    let available = data.len().saturating_sub(SCANLINE_HEADER_SIZE);
    if available < expected {
        return Err(ParseError::TruncatedPayload {
            expected,
            actual: available,
        });
    }
    Ok(&data[SCANLINE_HEADER_SIZE..SCANLINE_HEADER_SIZE + expected])
}

/// Decode header and payload of a scanline datagram
pub fn decode_fragment(data: &[u8]) -> Result<SweepFragment<'_>, ParseError> {
    let header = decode_sweep_header(data)?;
    let payload = decode_sweep_payload(&header, data)?;
    Ok(SweepFragment { header, payload })
}

/// Decode a status frame
pub fn decode_status(data: &[u8]) -> Result<RadarStatus, ParseError> {
    if data.len() < STATUS_FRAME_SIZE {
        return Err(ParseError::malformed(
            format!("status frame needs {} bytes", STATUS_FRAME_SIZE),
            data.len(),
        ));
    }
    Ok(RadarStatus {
        state: ScannerState::from_value(u16::from_be_bytes([data[4], data[5]])),
        countdown: u16::from_be_bytes([data[6], data[7]]),
    })
}

/// Decode a settings response frame
pub fn decode_response(data: &[u8]) -> Result<RadarSettings, ParseError> {
    if data.len() < RESPONSE_FRAME_SIZE {
        return Err(ParseError::malformed(
            format!("response frame needs {} bytes", RESPONSE_FRAME_SIZE),
            data.len(),
        ));
    }
    Ok(RadarSettings {
        range_m: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        gain_auto: data[16] != 0,
        gain_level: data[17],
        ftc: data[18] != 0,
        crosstalk: data[19] != 0,
    })
}

/// Build a scanline datagram (inverse of [`decode_fragment`])
pub fn encode_scanline(header: &SweepHeader, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; SCANLINE_HEADER_SIZE];
    data[0..4].copy_from_slice(&FRAME_SCANLINE.to_be_bytes());
    data[4..8].copy_from_slice(&header.sequence.to_be_bytes());
    data[8..10].copy_from_slice(&header.fragment_offset.to_be_bytes());
    data[10..12].copy_from_slice(&header.fragment_len.to_be_bytes());
    data[12..14].copy_from_slice(&header.angle.to_be_bytes());
    data[14..16].copy_from_slice(&header.sweep_len.to_be_bytes());
    data[16..20].copy_from_slice(&header.range_m.to_be_bytes());
    data.extend_from_slice(payload);
    data
}

// =============================================================================
// Tests
// =============================================================================
