use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gmr_core::protocol::gmr18::{self, Frame};
use gmr_core::sweep::{AssemblerStatistics, RadarSweep, SweepAssembler};
use tokio::net::UdpSocket;
use tokio_graceful_shutdown::SubsystemHandle;

use super::{unix_millis, BridgeConfig, BridgeError};
use crate::bus::payload::{encode_settings, encode_status, encode_sweep};
use crate::bus::{BusError, MessageBus};

/// Largest datagram we accept
const RECV_BUFFER_SIZE: usize = 65536;

/// Read errors in a row before the socket is considered unusable
const MAX_CONSECUTIVE_ERRORS: usize = 16;

/// Receive errors in a row. The count resets on every good read.
#[derive(Debug, Default)]
struct ReadErrors {
    consecutive: usize,
}

impl ReadErrors {
    fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Log a failed read, or give up on the socket once
    /// `MAX_CONSECUTIVE_ERRORS` have happened in a row.
    fn failure(&mut self, key: &str, e: io::Error) -> Result<(), BridgeError> {
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_ERRORS {
            return Err(BridgeError::Transport(e));
        }
        log::warn!("{}: receive failed: {}", key, e);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStatistics {
    pub datagrams: usize,
    pub broken_packets: usize, // this revolution
    pub inconsistent: usize,   // this revolution
    pub sweeps: usize,         // this revolution
    pub publish_errors: usize,
    pub total_rotations: usize,
}

impl IngestStatistics {
    pub fn full_rotation(&mut self, key: &str, assembler: &AssemblerStatistics) {
        self.total_rotations += 1;
        log::debug!(
            "{}: Full rotation #{}, {} sweeps published, {} broken packets, {} inconsistent, {} expired, {} evicted, {} duplicate fragments",
            key,
            self.total_rotations,
            self.sweeps,
            self.broken_packets,
            self.inconsistent,
            assembler.expired,
            assembler.evicted,
            assembler.duplicates
        );
        self.sweeps = 0;
        self.broken_packets = 0;
        self.inconsistent = 0;
    }
}

/// Receives the radome's multicast traffic and publishes it on the bus
pub struct IngestLoop {
    key: String,
    sock: UdpSocket,
    bus: Arc<dyn MessageBus>,
    config: BridgeConfig,
    assembler: SweepAssembler,
    statistics: IngestStatistics,
    started: Instant,
    prev_angle: Option<u16>,
}

impl IngestLoop {
    pub fn new(key: &str, sock: UdpSocket, bus: Arc<dyn MessageBus>, config: BridgeConfig) -> Self {
        IngestLoop {
            key: key.to_string(),
            sock,
            bus,
            assembler: SweepAssembler::new(config.assembler),
            config,
            statistics: IngestStatistics::default(),
            started: Instant::now(),
            prev_angle: None,
        }
    }

    pub fn statistics(&self) -> &IngestStatistics {
        &self.statistics
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), BridgeError> {
        match self.socket_loop(&subsys).await {
            Err(BridgeError::Shutdown) | Ok(()) => Ok(()),
            Err(e) => {
                log::error!("{}: ingest stopped: {}", self.key, e);
                Err(e)
            }
        }
    }

    async fn socket_loop(&mut self, subsys: &SubsystemHandle) -> Result<(), BridgeError> {
        let mut buf = Vec::with_capacity(RECV_BUFFER_SIZE);
        let mut errors = ReadErrors::default();
        let mut expiry = tokio::time::interval(Duration::from_millis(
            self.config.assembler.staleness_ms.max(1),
        ));
        log::debug!("{}: Starting ingest loop", self.key);

        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    return Err(BridgeError::Shutdown);
                },
                _ = expiry.tick() => {
                    self.expire_stale(self.now_ms());
                },
                r = self.sock.recv_buf_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            errors.success();
                            log::trace!("{}: {} bytes from {}", self.key, len, from);
                            let now = self.now_ms();
                            self.handle_datagram(&buf, now).await?;
                        },
                        Err(e) => errors.failure(&self.key, e)?,
                    }
                },
            }
            buf.clear();
        }
    }

    /// Milliseconds since the loop was created, monotonic
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Drop partial sweeps that have waited longer than the staleness window
    fn expire_stale(&mut self, now_ms: u64) -> usize {
        let expired = self.assembler.expire(now_ms);
        if expired > 0 {
            log::trace!("{}: dropped {} stale partial sweeps", self.key, expired);
        }
        expired
    }

    /// Decode one datagram and publish whatever it completes.
    ///
    /// Malformed datagrams and inconsistent sweeps are counted, logged and
    /// dropped. Only a closed bus is returned as an error.
    pub async fn handle_datagram(&mut self, data: &[u8], now_ms: u64) -> Result<(), BridgeError> {
        self.statistics.datagrams += 1;

        let frame = match gmr18::decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.statistics.broken_packets += 1;
                log::warn!(
                    "{}: dropped {} byte datagram of type {}: {}",
                    self.key,
                    data.len(),
                    gmr18::frame_type(data)
                        .map(|t| format!("{:#06x}", t))
                        .unwrap_or_else(|| "-".to_string()),
                    e
                );
                return Ok(());
            }
        };

        match frame {
            Frame::Scanline(fragment) => match self.assembler.push(&fragment, now_ms) {
                Ok(Some(sweep)) => self.publish_sweep(sweep).await?,
                Ok(None) => {}
                Err(e) => {
                    self.statistics.inconsistent += 1;
                    log::warn!("{}: {}", self.key, e);
                }
            },
            Frame::Status(status) => {
                log::debug!(
                    "{}: scanner {:?}, countdown {}",
                    self.key,
                    status.state,
                    status.countdown
                );
                let topic = &self.config.topics.status;
                let r = match encode_status(&status) {
                    Ok(payload) => self.bus.publish(topic, payload).await,
                    Err(e) => Err(encode_failed(topic, e)),
                };
                self.check_published(r)?;
            }
            Frame::Response(settings) => {
                log::debug!("{}: settings {:?}", self.key, settings);
                let topic = &self.config.topics.status;
                let r = match encode_settings(&settings) {
                    Ok(payload) => self.bus.publish(topic, payload).await,
                    Err(e) => Err(encode_failed(topic, e)),
                };
                self.check_published(r)?;
            }
        }
        Ok(())
    }

    async fn publish_sweep(&mut self, sweep: RadarSweep) -> Result<(), BridgeError> {
        log::trace!(
            "{}: sweep angle {} range {} m, {} samples",
            self.key,
            sweep.angle,
            sweep.range_m,
            sweep.samples.len()
        );

        if let Some(prev) = self.prev_angle {
            if sweep.angle < prev {
                let assembler = self.assembler.take_statistics();
                self.statistics.full_rotation(&self.key, &assembler);
            }
        }
        self.prev_angle = Some(sweep.angle);

        let topic = &self.config.topics.sweep;
        let r = match encode_sweep(&sweep, unix_millis(), self.config.format) {
            Ok(payload) => self.bus.publish(topic, payload).await,
            Err(e) => Err(encode_failed(topic, e)),
        };
        self.check_published(r)?;
        self.statistics.sweeps += 1;
        Ok(())
    }

    fn check_published(&mut self, r: Result<(), BusError>) -> Result<(), BridgeError> {
        match r {
            Ok(()) => Ok(()),
            Err(BusError::Closed) => Err(BridgeError::Bus(BusError::Closed)),
            Err(e) => {
                self.statistics.publish_errors += 1;
                log::warn!("{}: {}", self.key, e);
                Ok(())
            }
        }
    }
}

fn encode_failed(topic: &str, e: serde_json::Error) -> BusError {
    BusError::Publish {
        topic: topic.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{DEFAULT_STATUS_TOPIC, DEFAULT_SWEEP_TOPIC};
    use crate::bus::payload::{decode_binary_sweep, SweepFormat};
    use crate::bus::{BusSubscription, LocalBus};
    use gmr18::{encode_scanline, SweepHeader};
    use gmr_core::sweep::AssemblerConfig;
    use serde_json::Value;
    use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

    fn fragment(sequence: u32, angle: u16, offset: u16, len: u16, sweep_len: u16) -> Vec<u8> {
        let header = SweepHeader {
            sequence,
            fragment_offset: offset,
            fragment_len: len,
            angle,
            sweep_len,
            range_m: 926,
        };
        let payload: Vec<u8> = (offset..offset + len).map(|i| i as u8).collect();
        encode_scanline(&header, &payload)
    }

    async fn ingest(config: BridgeConfig) -> (IngestLoop, LocalBus) {
        let bus = LocalBus::default();
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ingest = IngestLoop::new("test", sock, Arc::new(bus.clone()), config);
        (ingest, bus)
    }

    async fn next_json(sub: &mut BusSubscription) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_two_fragments_publish_one_sweep() {
        let (mut ingest, bus) = ingest(BridgeConfig::default()).await;
        let mut sub = bus.subscribe(DEFAULT_SWEEP_TOPIC);

        ingest
            .handle_datagram(&fragment(1, 45, 256, 256, 512), 0)
            .await
            .unwrap();
        assert!(sub.try_recv().is_none());
        ingest
            .handle_datagram(&fragment(1, 45, 0, 256, 512), 10)
            .await
            .unwrap();

        let value = next_json(&mut sub).await;
        assert_eq!(value["version"], 1);
        assert_eq!(value["angle"], 45);
        assert_eq!(value["range_meters"], 926);
        let samples = value["samples"].as_array().unwrap();
        assert_eq!(samples.len(), 512);
        assert_eq!(samples[300], 300 % 256);
        assert_eq!(ingest.statistics().sweeps, 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_binary_format() {
        let config = BridgeConfig {
            format: SweepFormat::Binary,
            ..Default::default()
        };
        let (mut ingest, bus) = ingest(config).await;
        let mut sub = bus.subscribe(DEFAULT_SWEEP_TOPIC);

        ingest
            .handle_datagram(&fragment(9, 100, 0, 8, 8), 0)
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        let (sweep, _) = decode_binary_sweep(&msg).unwrap();
        assert_eq!(sweep.angle, 100);
        assert_eq!(sweep.sequence, 9);
        assert_eq!(sweep.samples, (0..8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_bad_datagram_is_dropped() {
        let (mut ingest, bus) = ingest(BridgeConfig::default()).await;
        let mut sub = bus.subscribe(DEFAULT_SWEEP_TOPIC);

        ingest
            .handle_datagram(&fragment(1, 45, 0, 256, 512), 0)
            .await
            .unwrap();

        // Declares more payload than it carries
        let mut short = fragment(2, 46, 0, 64, 64);
        short.truncate(short.len() - 10);
        ingest.handle_datagram(&short, 1).await.unwrap();
        ingest.handle_datagram(&[0, 0], 2).await.unwrap();
        ingest
            .handle_datagram(&[0, 0, 0x02, 0xff, 0, 0, 0, 0], 3)
            .await
            .unwrap();
        assert_eq!(ingest.statistics().broken_packets, 3);

        ingest
            .handle_datagram(&fragment(1, 45, 256, 256, 512), 4)
            .await
            .unwrap();
        let value = next_json(&mut sub).await;
        assert_eq!(value["samples"].as_array().unwrap().len(), 512);
    }

    #[tokio::test]
    async fn test_inconsistent_sweep_is_dropped() {
        let (mut ingest, bus) = ingest(BridgeConfig::default()).await;
        let mut sub = bus.subscribe(DEFAULT_SWEEP_TOPIC);

        ingest
            .handle_datagram(&fragment(3, 10, 0, 100, 200), 0)
            .await
            .unwrap();
        ingest
            .handle_datagram(&fragment(3, 10, 100, 100, 300), 1)
            .await
            .unwrap();
        assert_eq!(ingest.statistics().inconsistent, 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_status_and_response_are_published() {
        let (mut ingest, bus) = ingest(BridgeConfig::default()).await;
        let mut sub = bus.subscribe(DEFAULT_STATUS_TOPIC);

        let mut status = vec![0u8; 16];
        status[0..4].copy_from_slice(&gmr18::FRAME_STATUS.to_be_bytes());
        status[4..6].copy_from_slice(&4u16.to_be_bytes());
        ingest.handle_datagram(&status, 0).await.unwrap();

        let mut response = vec![0u8; 20];
        response[0..4].copy_from_slice(&gmr18::FRAME_RESPONSE.to_be_bytes());
        response[12..16].copy_from_slice(&1852u32.to_be_bytes());
        response[16] = 1;
        response[18] = 1;
        ingest.handle_datagram(&response, 1).await.unwrap();

        let value = next_json(&mut sub).await;
        assert_eq!(value["state"], "active");
        assert_eq!(value["countdown"], 0);

        let value = next_json(&mut sub).await;
        assert_eq!(value["range_meters"], 1852);
        assert_eq!(value["gain_auto"], true);
        assert_eq!(value["ftc"], true);
        assert_eq!(value["crosstalk"], false);
    }

    #[tokio::test]
    async fn test_rotation_statistics() {
        let (mut ingest, _bus) = ingest(BridgeConfig::default()).await;
        for (i, angle) in [10u16, 20, 30, 5].into_iter().enumerate() {
            ingest
                .handle_datagram(&fragment(i as u32, angle, 0, 4, 4), i as u64)
                .await
                .unwrap();
        }
        assert_eq!(ingest.statistics().total_rotations, 1);
        assert_eq!(ingest.statistics().sweeps, 1);
    }

    #[test]
    fn test_read_error_budget() {
        let mut errors = ReadErrors::default();
        let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, "refused");

        for _ in 1..MAX_CONSECUTIVE_ERRORS {
            assert!(errors.failure("test", refused()).is_ok());
        }
        // A good read restores the full budget
        errors.success();
        for _ in 1..MAX_CONSECUTIVE_ERRORS {
            assert!(errors.failure("test", refused()).is_ok());
        }
        match errors.failure("test", refused()) {
            Err(BridgeError::Transport(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused)
            }
            other => panic!("expected a transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expire_stale_drops_partial_sweep() {
        let config = BridgeConfig {
            assembler: AssemblerConfig {
                staleness_ms: 100,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut ingest, bus) = ingest(config).await;
        let mut sub = bus.subscribe(DEFAULT_SWEEP_TOPIC);

        ingest
            .handle_datagram(&fragment(1, 45, 0, 256, 512), 0)
            .await
            .unwrap();
        assert_eq!(ingest.expire_stale(100), 0);
        assert_eq!(ingest.expire_stale(101), 1);

        // The second half now starts a new partial sweep and completes nothing
        ingest
            .handle_datagram(&fragment(1, 45, 256, 256, 512), 102)
            .await
            .unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_loop_expires_on_timer() {
        let config = BridgeConfig {
            assembler: AssemblerConfig {
                staleness_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut ingest, _bus) = ingest(config).await;
        let target = ingest.sock.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let result = Toplevel::new(move |s| async move {
            s.start(SubsystemBuilder::new("Ingest", move |subsys| async move {
                let r = ingest.socket_loop(&subsys).await;
                let _ = tx.send(ingest.assembler.take_statistics());
                match r {
                    Err(BridgeError::Shutdown) => Ok(()),
                    r => r,
                }
            }));
            s.start(SubsystemBuilder::new("Radome", move |subsys| async move {
                let sender = UdpSocket::bind("127.0.0.1:0").await?;
                sender.send_to(&fragment(7, 90, 0, 256, 512), target).await?;

                // No further datagrams, so only the timer can drop it
                tokio::time::sleep(Duration::from_millis(400)).await;

                subsys.request_shutdown();
                Ok::<(), BridgeError>(())
            }));
        })
        .handle_shutdown_requests(Duration::from_secs(5))
        .await;

        assert!(result.is_ok());
        let statistics = rx.await.unwrap();
        assert_eq!(statistics.expired, 1);
    }

    #[tokio::test]
    async fn test_loop_over_udp() {
        let (ingest, bus) = ingest(BridgeConfig::default()).await;
        let target = ingest.sock.local_addr().unwrap();
        let mut sub = bus.subscribe(DEFAULT_SWEEP_TOPIC);

        let result = Toplevel::new(move |s| async move {
            s.start(SubsystemBuilder::new("Ingest", |subsys| ingest.run(subsys)));
            s.start(SubsystemBuilder::new("Radome", move |subsys| async move {
                let sender = UdpSocket::bind("127.0.0.1:0").await?;
                sender.send_to(&fragment(5, 45, 0, 256, 512), target).await?;
                sender.send_to(&fragment(5, 45, 256, 256, 512), target).await?;

                let value = next_json(&mut sub).await;
                assert_eq!(value["angle"], 45);
                assert_eq!(value["sequence"], 5);
                assert_eq!(value["samples"].as_array().unwrap().len(), 512);

                subsys.request_shutdown();
                Ok::<(), BridgeError>(())
            }));
        })
        .handle_shutdown_requests(Duration::from_secs(5))
        .await;

        assert!(result.is_ok());
    }
}
