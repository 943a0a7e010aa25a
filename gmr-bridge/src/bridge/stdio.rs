//! Console helpers: print bus traffic to stdout and read commands from stdin.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_graceful_shutdown::SubsystemHandle;

use super::BridgeError;
use crate::bus::{BusSubscription, MessageBus};

/// Write every message of `subscription` to stdout.
///
/// Text payloads get a trailing newline; binary payloads are written as is.
pub async fn forward_output(
    subsys: SubsystemHandle,
    subscription: BusSubscription,
    newline: bool,
) -> Result<(), BridgeError> {
    forward_to(&subsys, subscription, newline, tokio::io::stdout()).await
}

/// Write every message of `subscription` to `writer`.
///
/// A failed write, such as a closed pipe, ends this output only. The rest
/// of the bridge keeps running.
async fn forward_to<W: AsyncWrite + Unpin>(
    subsys: &SubsystemHandle,
    mut subscription: BusSubscription,
    newline: bool,
    mut writer: W,
) -> Result<(), BridgeError> {
    loop {
        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                return Ok(());
            },
            r = subscription.recv() => {
                match r {
                    Some(message) => {
                        if let Err(e) = write_message(&mut writer, &message, newline).await {
                            log::warn!(
                                "{}: output stopped, write failed: {}",
                                subscription.topic(),
                                e
                            );
                            return Ok(());
                        }
                    }
                    None => {
                        subsys.request_shutdown();
                        return Ok(());
                    }
                }
            },
        }
    }
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &[u8],
    newline: bool,
) -> std::io::Result<()> {
    writer.write_all(message).await?;
    if newline {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await
}

/// Single key shortcuts accepted on stdin
const SHORTCUTS: &[(&str, &str)] = &[
    ("a", r#"{"action":"power_on"}"#),
    ("q", r#"{"action":"power_off"}"#),
    ("w", r#"{"action":"set_range","value":0.25}"#),
    ("e", r#"{"action":"set_range","value":0.5}"#),
    ("r", r#"{"action":"set_range","value":1.0}"#),
    ("t", r#"{"action":"set_range","value":3.0}"#),
    ("x", r#"{"action":"set_crosstalk","on":false}"#),
    ("X", r#"{"action":"set_crosstalk","on":true}"#),
    ("c", r#"{"action":"set_ftc","on":false}"#),
    ("C", r#"{"action":"set_ftc","on":true}"#),
    ("s", r#"{"action":"set_gain","manual":false}"#),
    ("d", r#"{"action":"set_gain","manual":true,"value":0}"#),
    ("f", r#"{"action":"set_gain","manual":true,"value":25}"#),
    ("g", r#"{"action":"set_gain","manual":true,"value":50}"#),
    ("h", r#"{"action":"set_gain","manual":true,"value":75}"#),
    ("j", r#"{"action":"set_gain","manual":true,"value":100}"#),
];

/// Turn one line of console input into a command message.
///
/// JSON objects pass through unchanged, shortcuts are expanded, blank lines
/// and anything else yield `None`.
pub fn command_line(line: &str) -> Option<Vec<u8>> {
    let line = line.trim();
    if line.starts_with('{') {
        return Some(line.as_bytes().to_vec());
    }
    SHORTCUTS
        .iter()
        .find(|(key, _)| *key == line)
        .map(|(_, json)| json.as_bytes().to_vec())
}

/// Publish command lines typed on stdin to `topic`.
///
/// Ends quietly when stdin is closed; the rest of the bridge keeps running.
pub async fn forward_stdin_commands(
    subsys: SubsystemHandle,
    bus: Arc<dyn MessageBus>,
    topic: String,
) -> Result<(), BridgeError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                return Ok(());
            },
            r = lines.next_line() => {
                match r? {
                    Some(line) => match command_line(&line) {
                        Some(message) => bus.publish(&topic, message).await?,
                        None if line.trim().is_empty() => {}
                        None => log::warn!("Unknown command '{}'", line.trim()),
                    },
                    None => {
                        log::info!("stdin closed, no more console commands");
                        return Ok(());
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use gmr_core::{translate, RadarCommand};
    use std::io;
    use std::time::Duration;
    use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

    #[test]
    fn test_json_passes_through() {
        assert_eq!(
            command_line(r#"  {"action":"power_off"}  "#).unwrap(),
            br#"{"action":"power_off"}"#.to_vec()
        );
    }

    #[test]
    fn test_unknown_and_blank() {
        assert_eq!(command_line(""), None);
        assert_eq!(command_line("   "), None);
        assert_eq!(command_line("z"), None);
    }

    #[test]
    fn test_shortcuts_are_valid_commands() {
        for (key, _) in SHORTCUTS {
            let message = command_line(key).unwrap();
            let command = RadarCommand::from_json(&message).unwrap();
            assert!(translate(command).is_ok(), "shortcut {}", key);
        }

        let command = RadarCommand::from_json(&command_line("h").unwrap()).unwrap();
        assert_eq!(translate(command).unwrap().value, 75);
        let command = RadarCommand::from_json(&command_line("w").unwrap()).unwrap();
        assert_eq!(translate(command).unwrap().value, 25);
    }

    #[tokio::test]
    async fn test_output_write_error_ends_output_only() {
        let bus = LocalBus::default();
        let subscription = bus.subscribe("gmr/status");
        bus.publish("gmr/status", b"first".to_vec()).await.unwrap();
        bus.publish("gmr/status", b"second".to_vec()).await.unwrap();

        // The mock panics on drop unless every expected write happened,
        // and on any write it does not expect
        let writer = tokio_test::io::Builder::new()
            .write(b"first")
            .write(b"\n")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "console gone"))
            .build();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let result = Toplevel::new(move |s| async move {
            s.start(SubsystemBuilder::new("Output", move |subsys| async move {
                let r = forward_to(&subsys, subscription, true, writer).await;
                let _ = tx.send(r.is_ok());
                subsys.request_shutdown();
                r
            }));
        })
        .handle_shutdown_requests(Duration::from_secs(2))
        .await;

        assert!(result.is_ok(), "{:?}", result);
        // It returned on its own while the bus was still open
        assert!(rx.await.unwrap());
        drop(bus);
    }
}
