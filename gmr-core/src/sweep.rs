//! Sweep reassembly.
//!
//! A GMR18 sweep (one scanline at one angle) may be split over several
//! datagrams. [`SweepAssembler`] collects the fragments of each sweep,
//! keyed by sequence number and angle, and emits a [`RadarSweep`] once the
//! declared number of bytes has arrived.
//!
//! ```text
//!  AwaitingFirstFragment ──first fragment──▶ Accumulating ──all bytes──▶ Complete
//!                                              │    ▲
//!                                              │    └── more fragments
//!                                              └── stale / inconsistent ──▶ discarded
//! ```
//!
//! Like the rest of this crate the assembler does no I/O and reads no clock;
//! the caller stamps each datagram with a monotonic millisecond timestamp.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::error::SweepError;
use crate::protocol::gmr18::{self, Frame, SweepFragment};

/// One rotation of the GMR18 at 24 RPM
pub const DEFAULT_STALENESS_MS: u64 = 2500;
/// Upper bound on sweeps being reassembled at the same time
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;
/// Upper bound on emitted sweeps remembered for late fragment detection
pub const DEFAULT_MAX_REMEMBERED: usize = 4096;

/// Datagram as received from the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDatagram {
    pub data: Vec<u8>,
    /// Monotonic receive time in milliseconds
    pub received_ms: u64,
}

impl RawDatagram {
    pub fn new(data: Vec<u8>, received_ms: u64) -> Self {
        Self { data, received_ms }
    }
}

/// A complete sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RadarSweep {
    /// Angle in device units
    pub angle: u16,
    /// Range setting in effect, meters
    pub range_m: u32,
    pub sequence: u32,
    /// One intensity byte per range bin
    pub samples: Vec<u8>,
}

/// Identifies one logical sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SweepKey {
    pub sequence: u32,
    pub angle: u16,
}

impl From<&gmr18::SweepHeader> for SweepKey {
    fn from(header: &gmr18::SweepHeader) -> Self {
        SweepKey {
            sequence: header.sequence,
            angle: header.angle,
        }
    }
}

/// Reassembly state of a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    AwaitingFirstFragment,
    Accumulating,
    Complete,
}

/// Assembler tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Partial sweeps older than this are dropped
    pub staleness_ms: u64,
    /// Oldest partial sweep is dropped when more than this many are open
    pub max_in_flight: usize,
    /// Oldest completion record is forgotten when more than this many are kept
    pub max_remembered: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            staleness_ms: DEFAULT_STALENESS_MS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_remembered: DEFAULT_MAX_REMEMBERED,
        }
    }
}

/// Counters since the last [`SweepAssembler::take_statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStatistics {
    pub completed: usize,
    /// Partial sweeps dropped by the staleness window
    pub expired: usize,
    /// Partial sweeps dropped because too many were open
    pub evicted: usize,
    /// Partial sweeps dropped on a conflicting fragment
    pub inconsistent: usize,
    /// Fragments received twice for an open sweep
    pub duplicates: usize,
    /// Fragments for a sweep that was already emitted
    pub late: usize,
}

/// In-progress sweep
#[derive(Debug)]
struct Accumulation {
    sweep_len: usize,
    range_m: u32,
    received: usize,
    started_ms: u64,
    /// Fragment payloads by offset
    fragments: BTreeMap<u16, Vec<u8>>,
}

impl Accumulation {
    fn new(fragment: &SweepFragment<'_>, now_ms: u64) -> Self {
        Self {
            sweep_len: fragment.header.sweep_len as usize,
            range_m: fragment.header.range_m,
            received: 0,
            started_ms: now_ms,
            fragments: BTreeMap::new(),
        }
    }

    /// Add a fragment. `Ok(false)` means an exact duplicate that was ignored.
    fn add(&mut self, fragment: &SweepFragment<'_>) -> Result<bool, String> {
        let start = fragment.header.fragment_offset;
        let end = start as usize + fragment.payload.len();

        if let Some(existing) = self.fragments.get(&start) {
            if existing.as_slice() == fragment.payload {
                return Ok(false);
            }
            return Err(format!("conflicting fragment at offset {}", start));
        }

        // Fragments are disjoint, so only the neighbours can overlap
        if let Some((&prev_start, prev)) = self.fragments.range(..start).next_back() {
            if prev_start as usize + prev.len() > start as usize {
                return Err(format!(
                    "fragment at {} overlaps fragment {}..{}",
                    start,
                    prev_start,
                    prev_start as usize + prev.len()
                ));
            }
        }
        if let Some((&next_start, _)) = self.fragments.range(start..).next() {
            if (next_start as usize) < end {
                return Err(format!(
                    "fragment {}..{} overlaps fragment at {}",
                    start, end, next_start
                ));
            }
        }

        self.received += fragment.payload.len();
        self.fragments.insert(start, fragment.payload.to_vec());
        Ok(true)
    }

    fn is_complete(&self) -> bool {
        self.received == self.sweep_len
    }

    fn into_samples(self) -> Vec<u8> {
        let mut samples = Vec::with_capacity(self.sweep_len);
        for (_, payload) in self.fragments {
            samples.extend_from_slice(&payload);
        }
        samples
    }
}

/// Reassembles sweeps from scanline fragments
#[derive(Debug)]
pub struct SweepAssembler {
    config: AssemblerConfig,
    in_flight: HashMap<SweepKey, Accumulation>,
    /// Recently emitted sweeps
    completed: HashSet<SweepKey>,
    /// Same keys with their completion time, oldest first
    completion_order: VecDeque<(SweepKey, u64)>,
    statistics: AssemblerStatistics,
}

impl Default for SweepAssembler {
    fn default() -> Self {
        Self::new(AssemblerConfig::default())
    }
}

impl SweepAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self {
            config,
            in_flight: HashMap::new(),
            completed: HashSet::new(),
            completion_order: VecDeque::new(),
            statistics: AssemblerStatistics::default(),
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Number of sweeps currently being reassembled
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of emitted sweeps still remembered for duplicate detection
    pub fn remembered(&self) -> usize {
        self.completed.len()
    }

    pub fn state(&self, key: &SweepKey) -> SweepState {
        if self.in_flight.contains_key(key) {
            SweepState::Accumulating
        } else if self.completed.contains(key) {
            SweepState::Complete
        } else {
            SweepState::AwaitingFirstFragment
        }
    }

    /// Return the counters and reset them
    pub fn take_statistics(&mut self) -> AssemblerStatistics {
        std::mem::take(&mut self.statistics)
    }

    /// Decode a raw scanline datagram and feed it to the assembler
    pub fn feed(&mut self, datagram: &RawDatagram) -> Result<Option<RadarSweep>, SweepError> {
        let fragment = gmr18::decode_fragment(&datagram.data)?;
        self.push(&fragment, datagram.received_ms)
    }

    /// Feed an already decoded frame; non-scanline frames are ignored
    pub fn feed_frame(
        &mut self,
        frame: &Frame<'_>,
        now_ms: u64,
    ) -> Result<Option<RadarSweep>, SweepError> {
        match frame {
            Frame::Scanline(fragment) => self.push(fragment, now_ms),
            _ => Ok(None),
        }
    }

    /// Add one fragment, returning the sweep it completes, if any
    pub fn push(
        &mut self,
        fragment: &SweepFragment<'_>,
        now_ms: u64,
    ) -> Result<Option<RadarSweep>, SweepError> {
        self.expire(now_ms);

        let header = &fragment.header;
        let key = SweepKey::from(header);

        if self.completed.contains(&key) {
            self.statistics.late += 1;
            return Ok(None);
        }

        if !self.in_flight.contains_key(&key) {
            self.make_room();
            self.in_flight.insert(key, Accumulation::new(fragment, now_ms));
        }

        let accumulation = match self.in_flight.get_mut(&key) {
            Some(a) => a,
            None => return Ok(None),
        };

        if accumulation.sweep_len != header.sweep_len as usize {
            let reason = format!(
                "declared length {} differs from {} at start of sweep",
                header.sweep_len, accumulation.sweep_len
            );
            return Err(self.discard(key, reason));
        }

        match accumulation.add(fragment) {
            Ok(true) => {}
            Ok(false) => {
                self.statistics.duplicates += 1;
                return Ok(None);
            }
            Err(reason) => return Err(self.discard(key, reason)),
        }

        if !accumulation.is_complete() {
            return Ok(None);
        }

        let Some(accumulation) = self.in_flight.remove(&key) else {
            return Ok(None);
        };
        self.remember(key, now_ms);
        self.statistics.completed += 1;

        Ok(Some(RadarSweep {
            angle: key.angle,
            range_m: accumulation.range_m,
            sequence: key.sequence,
            samples: accumulation.into_samples(),
        }))
    }

    /// Drop partial sweeps and completion records older than the staleness
    /// window. Returns the number of partial sweeps dropped.
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let window = self.config.staleness_ms;
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, a| now_ms.saturating_sub(a.started_ms) <= window);
        while let Some(&(key, done)) = self.completion_order.front() {
            if now_ms.saturating_sub(done) <= window {
                break;
            }
            self.completion_order.pop_front();
            self.completed.remove(&key);
        }

        let expired = before - self.in_flight.len();
        self.statistics.expired += expired;
        expired
    }

    fn remember(&mut self, key: SweepKey, now_ms: u64) {
        while self.completion_order.len() >= self.config.max_remembered.max(1) {
            match self.completion_order.pop_front() {
                Some((oldest, _)) => {
                    self.completed.remove(&oldest);
                }
                None => break,
            }
        }
        self.completed.insert(key);
        self.completion_order.push_back((key, now_ms));
    }

    fn make_room(&mut self) {
        while self.in_flight.len() >= self.config.max_in_flight.max(1) {
            let oldest = self
                .in_flight
                .iter()
                .min_by_key(|(key, a)| (a.started_ms, **key))
                .map(|(key, _)| *key);
            match oldest {
                Some(key) => {
                    self.in_flight.remove(&key);
                    self.statistics.evicted += 1;
                }
                None => break,
            }
        }
    }

    fn discard(&mut self, key: SweepKey, reason: String) -> SweepError {
        self.in_flight.remove(&key);
        self.statistics.inconsistent += 1;
        SweepError::ProtocolInconsistency {
            sequence: key.sequence,
            angle: key.angle,
            reason,
        }
    }
}
