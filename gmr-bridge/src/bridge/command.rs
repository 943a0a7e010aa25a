use gmr_core::protocol::gmr18::{ControlFrame, CONTROL_FRAME_SIZE};
use gmr_core::{translate, RadarCommand};
use tokio::net::UdpSocket;
use tokio_graceful_shutdown::SubsystemHandle;

use super::BridgeError;
use crate::bus::{BusError, BusSubscription};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandStatistics {
    pub sent: usize,
    pub rejected: usize,
    pub send_errors: usize,
}

/// Forwards command messages from the bus to the radome's control port
pub struct CommandLoop {
    key: String,
    sock: UdpSocket,
    subscription: BusSubscription,
    statistics: CommandStatistics,
}

impl CommandLoop {
    /// `sock` must already be connected to the radome's control address.
    pub fn new(key: &str, sock: UdpSocket, subscription: BusSubscription) -> Self {
        CommandLoop {
            key: key.to_string(),
            sock,
            subscription,
            statistics: CommandStatistics::default(),
        }
    }

    pub fn statistics(&self) -> &CommandStatistics {
        &self.statistics
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), BridgeError> {
        log::debug!(
            "{}: Listening for commands on '{}'",
            self.key,
            self.subscription.topic()
        );

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    return Ok(());
                },
                r = self.subscription.recv() => {
                    match r {
                        Some(message) => {
                            self.handle_message(&message).await;
                        }
                        None => {
                            log::error!("{}: command subscription closed", self.key);
                            return Err(BridgeError::Bus(BusError::Closed));
                        }
                    }
                },
            }
        }
    }

    /// Parse, translate and send one command message.
    ///
    /// Returns the frame that was written, or `None` when the message was
    /// rejected or could not be sent. Either way the loop carries on.
    pub async fn handle_message(&mut self, payload: &[u8]) -> Option<ControlFrame> {
        let command = match RadarCommand::from_json(payload) {
            Ok(command) => command,
            Err(e) => {
                self.statistics.rejected += 1;
                log::warn!(
                    "{}: ignoring {} byte command message: {}",
                    self.key,
                    payload.len(),
                    e
                );
                return None;
            }
        };

        let frame = match translate(command) {
            Ok(frame) => frame,
            Err(e) => {
                self.statistics.rejected += 1;
                log::warn!("{}: ignoring {}: {}", self.key, command.action(), e);
                return None;
            }
        };

        log::info!(
            "{}: {} -> command {:#06x} value {}",
            self.key,
            command,
            frame.command_code,
            frame.value
        );

        match self.sock.send(&frame.to_bytes()).await {
            Ok(CONTROL_FRAME_SIZE) => {
                self.statistics.sent += 1;
                Some(frame)
            }
            Ok(n) => {
                self.statistics.send_errors += 1;
                log::warn!(
                    "{}: short write of {}, {} of {} bytes",
                    self.key,
                    command.action(),
                    n,
                    CONTROL_FRAME_SIZE
                );
                None
            }
            Err(e) => {
                self.statistics.send_errors += 1;
                log::warn!("{}: cannot send {}: {}", self.key, command.action(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::DEFAULT_COMMAND_TOPIC;
    use crate::bus::{LocalBus, MessageBus};
    use std::time::Duration;
    use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

    /// A fake radome and a command loop whose socket is connected to it
    async fn setup(bus: &LocalBus) -> (UdpSocket, CommandLoop) {
        let radar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.connect(radar.local_addr().unwrap()).await.unwrap();
        let command = CommandLoop::new("test", sock, bus.subscribe(DEFAULT_COMMAND_TOPIC));
        (radar, command)
    }

    #[tokio::test]
    async fn test_handle_message_writes_frame() {
        let bus = LocalBus::default();
        let (radar, mut command) = setup(&bus).await;

        let frame = command
            .handle_message(br#"{"action":"set_range","value":0.5}"#)
            .await
            .unwrap();
        assert_eq!((frame.command_code, frame.value), (0x02b3, 50));

        let mut buf = [0u8; 64];
        let n = radar.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x02, 0xb3, 0x00, 0x02, 0x00, 0x32]);
        assert_eq!(command.statistics().sent, 1);
    }

    #[tokio::test]
    async fn test_rejected_messages_send_nothing() {
        let bus = LocalBus::default();
        let (radar, mut command) = setup(&bus).await;

        assert!(command.handle_message(b"{oops").await.is_none());
        assert!(command
            .handle_message(br#"{"action":"warp_drive"}"#)
            .await
            .is_none());
        assert!(command
            .handle_message(br#"{"action":"set_range","value":1000}"#)
            .await
            .is_none());
        assert_eq!(command.statistics().rejected, 3);

        command
            .handle_message(br#"{"action":"power_on"}"#)
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = radar.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x02, 0xb2, 0x00, 0x02, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_send_failure_is_counted() {
        let bus = LocalBus::default();
        let closed = UdpSocket::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.connect(closed).await.unwrap();
        let mut command = CommandLoop::new("test", sock, bus.subscribe(DEFAULT_COMMAND_TOPIC));

        // Nobody listens, so the port unreachable reply to the first datagram
        // surfaces as an error on the second send. The third goes out again.
        let mut results = Vec::new();
        for _ in 0..3 {
            let frame = command
                .handle_message(br#"{"action":"power_on"}"#)
                .await;
            results.push(frame.is_some());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(results, [true, false, true]);
        assert_eq!(
            command.statistics(),
            &CommandStatistics {
                sent: 2,
                rejected: 0,
                send_errors: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_gain_command_over_bus() {
        let bus = LocalBus::default();
        let (radar, command) = setup(&bus).await;
        let publisher = bus.clone();

        let result = Toplevel::new(move |s| async move {
            s.start(SubsystemBuilder::new("Commands", |subsys| command.run(subsys)));
            s.start(SubsystemBuilder::new("Radome", move |subsys| async move {
                publisher
                    .publish(
                        DEFAULT_COMMAND_TOPIC,
                        br#"{"action":"set_gain","manual":true,"value":75}"#.to_vec(),
                    )
                    .await?;

                let mut buf = [0u8; 64];
                let n = tokio::time::timeout(Duration::from_secs(5), radar.recv(&mut buf))
                    .await
                    .map_err(|_| BridgeError::Shutdown)??;
                assert_eq!(&buf[..n], &[0x02, 0xb4, 0x00, 0x02, 0x00, 0x4b]);

                // Nothing else was written
                let extra =
                    tokio::time::timeout(Duration::from_millis(200), radar.recv(&mut buf)).await;
                assert!(extra.is_err());

                subsys.request_shutdown();
                Ok::<(), BridgeError>(())
            }));
        })
        .handle_shutdown_requests(Duration::from_secs(5))
        .await;

        assert!(result.is_ok());
    }
}
