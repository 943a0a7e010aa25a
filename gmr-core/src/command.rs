//! Translation of control intents into GMR18 control frames.
//!
//! Bus messages are JSON objects of the form
//! `{"action": "set_gain", "manual": true, "value": 75}`. They are parsed
//! into a [`RadarCommand`] by [`RadarCommand::from_json`] and turned into the
//! radome's fixed 6-byte layout by [`translate`].

use serde::Deserialize;

use crate::error::CommandError;
use crate::protocol::gmr18::{CommandKind, ControlFrame, GAIN_AUTO, POWER_OFF, POWER_ON};

/// Range setting is sent in hundredths of a nautical mile
const RANGE_SCALE: f64 = 100.0;

/// A control intent for the radome
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RadarCommand {
    PowerOn,
    PowerOff,
    /// Range in nautical miles
    SetRange(f64),
    /// Manual gain level, or automatic gain when `manual` is false
    SetGain { manual: bool, value: f64 },
    /// Fast time constant (rain clutter) filter
    SetFtc(bool),
    /// Crosstalk (interference) rejection
    SetCrosstalk(bool),
}

/// Raw command message as it arrives on the bus
#[derive(Deserialize, Debug, Clone)]
struct CommandMessage {
    action: String,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    manual: bool,
    #[serde(default)]
    on: Option<bool>,
}

impl RadarCommand {
    /// Parse a JSON bus message.
    ///
    /// Returns [`CommandError::UnsupportedCommand`] for an unknown `action`
    /// and [`CommandError::MalformedMessage`] for anything that is not a
    /// well-formed command object.
    pub fn from_json(payload: &[u8]) -> Result<RadarCommand, CommandError> {
        let msg: CommandMessage = serde_json::from_slice(payload)?;

        let value = |action: &str| {
            msg.value.ok_or_else(|| {
                CommandError::MalformedMessage(format!("'{}' requires a value", action))
            })
        };
        let on = |action: &str| {
            msg.on.ok_or_else(|| {
                CommandError::MalformedMessage(format!("'{}' requires 'on'", action))
            })
        };

        match msg.action.as_str() {
            "power_on" => Ok(RadarCommand::PowerOn),
            "power_off" => Ok(RadarCommand::PowerOff),
            "set_range" => Ok(RadarCommand::SetRange(value("set_range")?)),
            "set_gain" if msg.manual => Ok(RadarCommand::SetGain {
                manual: true,
                value: value("set_gain")?,
            }),
            "set_gain" => Ok(RadarCommand::SetGain {
                manual: false,
                value: msg.value.unwrap_or_default(),
            }),
            "set_ftc" => Ok(RadarCommand::SetFtc(on("set_ftc")?)),
            "set_crosstalk" => Ok(RadarCommand::SetCrosstalk(on("set_crosstalk")?)),
            other => Err(CommandError::UnsupportedCommand(other.to_string())),
        }
    }

    /// Action name as used on the bus
    pub fn action(&self) -> &'static str {
        match self {
            RadarCommand::PowerOn => "power_on",
            RadarCommand::PowerOff => "power_off",
            RadarCommand::SetRange(_) => "set_range",
            RadarCommand::SetGain { .. } => "set_gain",
            RadarCommand::SetFtc(_) => "set_ftc",
            RadarCommand::SetCrosstalk(_) => "set_crosstalk",
        }
    }
}

impl std::fmt::Display for RadarCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RadarCommand::PowerOn => write!(f, "power on"),
            RadarCommand::PowerOff => write!(f, "power off"),
            RadarCommand::SetRange(nm) => write!(f, "range {} nm", nm),
            RadarCommand::SetGain { manual: false, .. } => write!(f, "gain AUTO"),
            RadarCommand::SetGain { value, .. } => write!(f, "gain {}", value),
            RadarCommand::SetFtc(on) => write!(f, "FTC {}", if *on { "ON" } else { "OFF" }),
            RadarCommand::SetCrosstalk(on) => {
                write!(f, "crosstalk {}", if *on { "ON" } else { "OFF" })
            }
        }
    }
}

/// Round `value` and check it fits the 16-bit value field.
/// Negative input is rejected even when it would round to zero.
fn to_u16(action: &'static str, value: f64) -> Result<u16, CommandError> {
    let rounded = value.round();
    if !rounded.is_finite() || value < 0.0 || rounded > u16::MAX as f64 {
        return Err(CommandError::OutOfRange { action, value });
    }
    Ok(rounded as u16)
}

/// Map a command onto its control frame
pub fn translate(command: RadarCommand) -> Result<ControlFrame, CommandError> {
    let frame = match command {
        RadarCommand::PowerOn => ControlFrame::new(CommandKind::Power, POWER_ON),
        RadarCommand::PowerOff => ControlFrame::new(CommandKind::Power, POWER_OFF),
        RadarCommand::SetRange(nm) => {
            ControlFrame::new(CommandKind::Range, to_u16("set_range", nm * RANGE_SCALE)?)
        }
        RadarCommand::SetGain { manual: false, .. } => {
            ControlFrame::new(CommandKind::Gain, GAIN_AUTO)
        }
        RadarCommand::SetGain { value, .. } => {
            ControlFrame::new(CommandKind::Gain, to_u16("set_gain", value)?)
        }
        RadarCommand::SetFtc(on) => ControlFrame::new(CommandKind::Ftc, on as u16),
        RadarCommand::SetCrosstalk(on) => ControlFrame::new(CommandKind::Crosstalk, on as u16),
    };
    Ok(frame)
}
