//! Per-subscriber stream allocator.
//!
//! Turns a channel-capacity estimate and per-track layer-bitrate tables into
//! target layers for every subscribed track, honoring priority and fairness.
//! Runs inside the subscriber's single-threaded loop; external callers post
//! events through a bounded queue and drain results with `pop_output`.

use std::collections::VecDeque;

use media_forward_protocol::media::{LayerBitrates, VideoLayer, MAX_SPATIAL_LAYERS, MAX_TEMPORAL_LAYERS};

use crate::forwarder::{Allocation, StreamingChange, CHANNEL_CAPACITY_INFINITY};
use crate::track::TrackTable;
use crate::transport::{StreamState, TrackId};

const MAX_PENDING_EVENTS: usize = 256;

/// Padding probe cadence while any managed track is deficient.
const PROBE_INTERVAL_MS: u64 = 1000;
/// Bytes requested per probe burst, a handful of MTU-sized packets.
const PROBE_BYTES: u64 = 6000;

/// Multiplicative decrease applied on transport backpressure.
const BACKPRESSURE_DECAY_NUM: u64 = 85;
const BACKPRESSURE_DECAY_DEN: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorEvent {
    EstimateUpdate(u64),
    BitratesUpdate(TrackId, LayerBitrates),
    TrackMuted(TrackId, bool),
    AvailableLayersChange(TrackId, Vec<u8>),
    /// Priority or max-layer settings already applied on the track.
    SettingsChange(TrackId),
    /// Transport send queue crossed its threshold.
    Backpressure,
    NackObserved(TrackId, u32),
    Tick,
}

impl AllocatorEvent {
    /// Non-critical events may be evicted when the queue overflows.
    fn evictable(&self) -> bool {
        matches!(self, AllocatorEvent::Tick | AllocatorEvent::BitratesUpdate(..))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorOutput {
    StreamState(TrackId, StreamState),
    RequestKeyFrame(TrackId),
    /// Probe padding to be paced out on the given track.
    RequestPadding(TrackId, u64),
    /// Connection quality score, 1 (bad) to 5 (optimal).
    Quality(u8),
}

pub struct StreamAllocator {
    /// Working capacity, estimate after any backpressure decay.
    channel_capacity: u64,
    last_estimate: u64,
    /// Managed bits per second committed by the last run.
    committed_bps: u64,
    deficient: bool,
    repeated_nacks: u32,
    last_probe_ms: u64,
    last_quality: Option<u8>,
    last_states: smallmap::Map<TrackId, StreamState>,
    events: VecDeque<AllocatorEvent>,
    queue: VecDeque<AllocatorOutput>,
}

impl Default for StreamAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAllocator {
    pub fn new() -> Self {
        Self {
            channel_capacity: CHANNEL_CAPACITY_INFINITY,
            last_estimate: CHANNEL_CAPACITY_INFINITY,
            committed_bps: 0,
            deficient: false,
            repeated_nacks: 0,
            last_probe_ms: 0,
            last_quality: None,
            last_states: smallmap::Map::new(),
            events: VecDeque::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn channel_capacity(&self) -> u64 {
        self.channel_capacity
    }

    pub fn is_deficient(&self) -> bool {
        self.deficient
    }

    /// Repeated NACKs observed since start, a congestion hint for embedders.
    pub fn repeated_nacks(&self) -> u32 {
        self.repeated_nacks
    }

    pub fn push_event(&mut self, event: AllocatorEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            match self.events.iter().position(|e| e.evictable()) {
                Some(pos) => {
                    let dropped = self.events.remove(pos);
                    log::warn!("[StreamAllocator] event queue full, dropped {:?}", dropped);
                }
                None => {
                    log::warn!("[StreamAllocator] event queue full of critical events, dropped {:?}", event);
                    return;
                }
            }
        }
        self.events.push_back(event);
    }

    pub fn pop_output(&mut self) -> Option<AllocatorOutput> {
        self.queue.pop_front()
    }

    /// Drain pending events in enqueue order and run the allocations they
    /// imply. Every handler is O(tracks x layers).
    pub fn process(&mut self, now_ms: u64, tracks: &mut TrackTable) {
        while let Some(event) = self.events.pop_front() {
            match event {
                AllocatorEvent::EstimateUpdate(bps) => self.on_estimate(now_ms, bps, tracks),
                AllocatorEvent::BitratesUpdate(id, bitrates) => {
                    if let Some(track) = tracks.get_mut(&id) {
                        track.set_bitrates(bitrates);
                        if let Some(alloc) = track.forwarder.finalize_allocate(&bitrates) {
                            self.handle_allocation(id, alloc, tracks);
                        }
                    }
                    self.allocate_all(tracks);
                }
                AllocatorEvent::TrackMuted(_, _) | AllocatorEvent::SettingsChange(_) => self.allocate_all(tracks),
                AllocatorEvent::AvailableLayersChange(id, layers) => {
                    if let Some(track) = tracks.get_mut(&id) {
                        track.forwarder.uptrack_layers_change(layers);
                    }
                    self.allocate_all(tracks);
                }
                AllocatorEvent::Backpressure => {
                    let decayed = self.channel_capacity / BACKPRESSURE_DECAY_DEN * BACKPRESSURE_DECAY_NUM;
                    log::info!("[StreamAllocator] backpressure, capacity {} => {}", self.channel_capacity, decayed);
                    self.channel_capacity = decayed;
                    self.reduce_to_capacity(tracks);
                }
                AllocatorEvent::NackObserved(_, repeated) => {
                    self.repeated_nacks += repeated;
                }
                AllocatorEvent::Tick => self.on_tick(now_ms, tracks),
            }
        }
    }

    fn on_estimate(&mut self, _now_ms: u64, bps: u64, tracks: &mut TrackTable) {
        let raised = bps > self.last_estimate && self.last_estimate != CHANNEL_CAPACITY_INFINITY;
        self.last_estimate = bps;
        self.channel_capacity = bps;

        if bps < self.committed_bps {
            self.reduce_to_capacity(tracks);
        } else if raised && self.deficient {
            self.boost_one(tracks);
        } else {
            self.allocate_all(tracks);
        }
    }

    fn on_tick(&mut self, now_ms: u64, tracks: &mut TrackTable) {
        let awaiting: Vec<TrackId> = tracks.values().filter(|t| t.is_managed()).map(|t| t.id).collect();
        for id in awaiting {
            let alloc = {
                let track = tracks.get_mut(&id).expect("track exists");
                let bitrates = *track.bitrates();
                track.forwarder.finalize_allocate(&bitrates)
            };
            if let Some(alloc) = alloc {
                self.handle_allocation(id, alloc, tracks);
            }
        }

        if self.deficient && now_ms.saturating_sub(self.last_probe_ms) >= PROBE_INTERVAL_MS {
            if let Some(id) = self.pick_deficient(tracks, true) {
                log::debug!("[StreamAllocator] probing with padding on {}", id);
                self.last_probe_ms = now_ms;
                self.queue.push_back(AllocatorOutput::RequestPadding(id, PROBE_BYTES));
            }
        }
    }

    /// Cooperative allocation: unmanaged tracks stay optimal and are charged
    /// first, then managed tracks walk the layers from the bottom, each
    /// taking what the remaining capacity sustains.
    fn allocate_all(&mut self, tracks: &mut TrackTable) {
        let mut available = self.channel_capacity;

        let ids: Vec<TrackId> = tracks.keys().copied().collect();
        for id in &ids {
            let track = tracks.get_mut(id).expect("track exists");
            if track.is_managed() {
                continue;
            }
            if track.kind.is_video() {
                let bitrates = *track.bitrates();
                let alloc = track.forwarder.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates);
                let used = alloc.bandwidth_requested;
                self.handle_allocation(*id, alloc, tracks);
                available = sub_capacity(available, used);
            } else {
                // audio reserves its measured bitrate
                let used = track.bitrates().get(VideoLayer::new(0, 0));
                available = sub_capacity(available, used);
            }
        }

        let mut managed: Vec<TrackId> = tracks.values().filter(|t| t.is_managed()).map(|t| t.id).collect();
        managed.sort_by(|a, b| {
            let ta = &tracks[a];
            let tb = &tracks[b];
            tb.priority
                .cmp(&ta.priority)
                .then(tb.forwarder.max_layer().spatial.cmp(&ta.forwarder.max_layer().spatial))
                .then(tb.forwarder.max_layer().temporal.cmp(&ta.forwarder.max_layer().temporal))
        });

        for id in &managed {
            let track = tracks.get_mut(id).expect("track exists");
            let bitrates = *track.bitrates();
            track.forwarder.provisional_prepare(&bitrates);
        }

        for spatial in 0..MAX_SPATIAL_LAYERS as u8 {
            for temporal in 0..MAX_TEMPORAL_LAYERS as u8 {
                let layer = VideoLayer::new(spatial, temporal);
                for id in &managed {
                    let track = tracks.get_mut(id).expect("track exists");
                    let used = track.forwarder.provisional_allocate(available, layer, true, false);
                    available = sub_capacity(available, used);
                }
            }
        }

        let mut committed = 0u64;
        for id in managed {
            let alloc = tracks.get_mut(&id).expect("track exists").forwarder.provisional_commit();
            committed += alloc.bandwidth_requested;
            self.handle_allocation(id, alloc, tracks);
        }
        self.committed_bps = committed;
        self.update_deficiency(tracks);
    }

    /// Congestion: free bandwidth starting from the lowest-priority track
    /// closest to its desired layer; pause as a last resort. Unmanaged
    /// tracks are left untouched.
    fn reduce_to_capacity(&mut self, tracks: &mut TrackTable) {
        let mut total: u64 = tracks.values().filter(|t| t.is_managed()).map(|t| t.forwarder.bandwidth_requested()).sum();

        let mut ids: Vec<TrackId> = tracks.values().filter(|t| t.is_managed()).map(|t| t.id).collect();
        ids.sort_by(|a, b| {
            let ta = &tracks[a];
            let tb = &tracks[b];
            ta.priority
                .cmp(&tb.priority)
                .then(ta.forwarder.distance_to_desired().total_cmp(&tb.forwarder.distance_to_desired()))
        });

        for id in &ids {
            if total <= self.channel_capacity {
                break;
            }
            let need = total - self.channel_capacity;
            let (before, alloc) = {
                let track = tracks.get_mut(id).expect("track exists");
                let bitrates = *track.bitrates();
                let before = track.forwarder.bandwidth_requested();
                (before, track.forwarder.try_allocate(-(need as i64), &bitrates))
            };
            total -= before.saturating_sub(alloc.bandwidth_requested);
            self.handle_allocation(*id, alloc, tracks);
        }

        for id in &ids {
            if total <= self.channel_capacity {
                break;
            }
            let (before, alloc) = {
                let track = tracks.get_mut(id).expect("track exists");
                let before = track.forwarder.bandwidth_requested();
                (before, track.forwarder.pause())
            };
            total -= before.min(total);
            self.handle_allocation(*id, alloc, tracks);
        }

        if total > self.channel_capacity {
            log::warn!(
                "[StreamAllocator] managed tracks paused but still over capacity, committed {}, capacity {}",
                total,
                self.channel_capacity
            );
        }

        self.committed_bps = total;
        self.update_deficiency(tracks);
    }

    /// Estimator headroom appeared: step the neediest deficient track one
    /// layer up.
    fn boost_one(&mut self, tracks: &mut TrackTable) {
        if let Some(id) = self.pick_deficient(tracks, false) {
            let alloc = {
                let track = tracks.get_mut(&id).expect("track exists");
                let bitrates = *track.bitrates();
                track.forwarder.allocate_next_higher(&bitrates)
            };
            if let Some(alloc) = alloc {
                self.committed_bps = (self.committed_bps as i64 + alloc.bandwidth_delta).max(0) as u64;
                self.handle_allocation(id, alloc, tracks);
            }
            self.update_deficiency(tracks);
        }
    }

    /// Highest-priority deficient track; among equals, the one furthest
    /// from desired. `landed_only` restricts to tracks whose previous
    /// transition completed, which is what padding probes need.
    fn pick_deficient(&self, tracks: &TrackTable, landed_only: bool) -> Option<TrackId> {
        tracks
            .values()
            .filter(|t| t.is_managed() && t.forwarder.is_deficient())
            .filter(|t| !landed_only || t.forwarder.current_layer() == t.forwarder.target_layer())
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.forwarder.distance_to_desired().total_cmp(&b.forwarder.distance_to_desired()))
            })
            .map(|t| t.id)
    }

    fn update_deficiency(&mut self, tracks: &TrackTable) {
        self.deficient = tracks.values().any(|t| t.is_managed() && t.forwarder.is_deficient());
        self.emit_quality(tracks);
    }

    fn handle_allocation(&mut self, id: TrackId, alloc: Allocation, tracks: &TrackTable) {
        let Some(track) = tracks.get(&id) else {
            return;
        };
        if alloc.change == StreamingChange::Resuming && track.kind.is_video() {
            self.queue.push_back(AllocatorOutput::RequestKeyFrame(id));
        }

        let state = match track.forwarder.target_layer() {
            Some(layer) => StreamState::Active { layer: Some(layer) },
            None => StreamState::Paused,
        };
        if self.last_states.get(&id) != Some(&state) {
            self.last_states.insert(id, state);
            self.queue.push_back(AllocatorOutput::StreamState(id, state));
        }
    }

    /// Map aggregate distance from desired layers onto a 1..=5 score.
    fn emit_quality(&mut self, tracks: &TrackTable) {
        let managed: Vec<f64> = tracks.values().filter(|t| t.is_managed()).map(|t| t.forwarder.distance_to_desired()).collect();
        if managed.is_empty() {
            return;
        }
        let avg = managed.iter().sum::<f64>() / managed.len() as f64;
        let quality = (5.0 - avg.min(4.0)).round().clamp(1.0, 5.0) as u8;
        if self.last_quality != Some(quality) {
            self.last_quality = Some(quality);
            self.queue.push_back(AllocatorOutput::Quality(quality));
        }
    }

    pub fn forget_track(&mut self, id: TrackId) {
        self.last_states.remove(&id);
    }
}

fn sub_capacity(available: u64, used: u64) -> u64 {
    if available == CHANNEL_CAPACITY_INFINITY {
        available
    } else {
        available.saturating_sub(used)
    }
}

#[cfg(test)]
mod test {
    use media_forward_protocol::endpoint::{TrackPriority, TrackSource};
    use media_forward_protocol::media::{LayerBitrates, MediaKind, VideoLayer};

    use crate::track::{SubscribedTrack, TrackTable};
    use crate::transport::{StreamState, TrackId};

    use super::{AllocatorEvent, AllocatorOutput, StreamAllocator, MAX_PENDING_EVENTS};

    fn video_track(id: u64) -> SubscribedTrack {
        let mut track = SubscribedTrack::new(TrackId(id), MediaKind::Video, TrackSource::Camera, true, 0x1000 + id as u32);
        track.set_bitrates(LayerBitrates::from_rows(&[
            [100_000, 150_000, 0, 200_000],
            [300_000, 450_000, 0, 600_000],
            [900_000, 1_300_000, 0, 1_800_000],
        ]));
        track
    }

    fn drain(allocator: &mut StreamAllocator) -> Vec<AllocatorOutput> {
        let mut out = Vec::new();
        while let Some(o) = allocator.pop_output() {
            out.push(o);
        }
        out
    }

    fn states(outputs: &[AllocatorOutput]) -> Vec<(TrackId, StreamState)> {
        outputs
            .iter()
            .filter_map(|o| match o {
                AllocatorOutput::StreamState(id, state) => Some((*id, *state)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_track_gets_best_layer_under_capacity() {
        let mut allocator = StreamAllocator::new();
        let mut tracks: TrackTable = TrackTable::new();
        tracks.insert(TrackId(1), video_track(1));

        allocator.push_event(AllocatorEvent::EstimateUpdate(2_000_000));
        allocator.process(0, &mut tracks);

        assert_eq!(tracks[&TrackId(1)].forwarder.target_layer(), Some(VideoLayer::new(2, 3)));
        let outputs = drain(&mut allocator);
        assert_eq!(
            states(&outputs),
            vec![(TrackId(1), StreamState::Active { layer: Some(VideoLayer::new(2, 3)) })]
        );
        assert!(!allocator.is_deficient());
    }

    #[test]
    fn capacity_splits_by_priority() {
        let mut allocator = StreamAllocator::new();
        let mut tracks: TrackTable = TrackTable::new();
        tracks.insert(TrackId(1), video_track(1));
        let mut favored = video_track(2);
        favored.priority = TrackPriority(5);
        tracks.insert(TrackId(2), favored);

        // both rise together layer by layer; the contested step at the top
        // goes to the higher priority track
        allocator.push_event(AllocatorEvent::EstimateUpdate(2_500_000));
        allocator.process(0, &mut tracks);

        assert_eq!(tracks[&TrackId(2)].forwarder.target_layer(), Some(VideoLayer::new(2, 1)));
        assert_eq!(tracks[&TrackId(1)].forwarder.target_layer(), Some(VideoLayer::new(2, 0)));
        assert!(allocator.is_deficient());
    }

    #[test]
    fn unmanaged_screenshare_is_charged_first() {
        let mut allocator = StreamAllocator::new();
        let mut tracks: TrackTable = TrackTable::new();
        let mut share = SubscribedTrack::new(TrackId(1), MediaKind::Video, TrackSource::Screenshare, false, 0x2001);
        share.set_bitrates(LayerBitrates::from_rows(&[[1_000_000, 0, 0, 0], [0; 4], [0; 4]]));
        tracks.insert(TrackId(1), share);
        tracks.insert(TrackId(2), video_track(2));

        allocator.push_event(AllocatorEvent::EstimateUpdate(1_500_000));
        allocator.process(0, &mut tracks);

        // screen share stays optimal, camera takes what is left
        assert_eq!(tracks[&TrackId(1)].forwarder.target_layer(), Some(VideoLayer::new(0, 0)));
        assert_eq!(tracks[&TrackId(2)].forwarder.target_layer(), Some(VideoLayer::new(1, 1)));
    }

    #[test]
    fn estimate_drop_reduces_then_recovers() {
        let mut allocator = StreamAllocator::new();
        let mut tracks: TrackTable = TrackTable::new();
        tracks.insert(TrackId(1), video_track(1));

        allocator.push_event(AllocatorEvent::EstimateUpdate(2_000_000));
        allocator.process(0, &mut tracks);
        drain(&mut allocator);

        allocator.push_event(AllocatorEvent::EstimateUpdate(500_000));
        allocator.process(0, &mut tracks);
        assert_eq!(tracks[&TrackId(1)].forwarder.target_layer(), Some(VideoLayer::new(1, 1)));
        assert!(allocator.is_deficient());
        drain(&mut allocator);

        // the step already landed, so a raised estimate boosts one layer
        let track = tracks.get_mut(&TrackId(1)).expect("track");
        track.forwarder.set_current_for_test();
        allocator.push_event(AllocatorEvent::EstimateUpdate(700_000));
        allocator.process(0, &mut tracks);
        assert_eq!(tracks[&TrackId(1)].forwarder.target_layer(), Some(VideoLayer::new(1, 3)));
    }

    #[test]
    fn idempotent_outputs() {
        let mut allocator = StreamAllocator::new();
        let mut tracks: TrackTable = TrackTable::new();
        tracks.insert(TrackId(1), video_track(1));

        allocator.push_event(AllocatorEvent::EstimateUpdate(2_000_000));
        allocator.process(0, &mut tracks);
        drain(&mut allocator);

        // same estimate again: nothing changed, nothing emitted
        allocator.push_event(AllocatorEvent::EstimateUpdate(2_000_000));
        allocator.process(0, &mut tracks);
        assert_eq!(drain(&mut allocator), vec![]);
    }

    #[test]
    fn deficient_track_probes_on_tick() {
        let mut allocator = StreamAllocator::new();
        let mut tracks: TrackTable = TrackTable::new();
        tracks.insert(TrackId(1), video_track(1));

        allocator.push_event(AllocatorEvent::EstimateUpdate(500_000));
        allocator.process(0, &mut tracks);
        assert!(allocator.is_deficient());
        tracks.get_mut(&TrackId(1)).expect("track").forwarder.set_current_for_test();
        drain(&mut allocator);

        allocator.push_event(AllocatorEvent::Tick);
        allocator.process(2000, &mut tracks);
        let outputs = drain(&mut allocator);
        assert!(outputs.iter().any(|o| matches!(o, AllocatorOutput::RequestPadding(TrackId(1), _))));

        // probe interval gates the next one
        allocator.push_event(AllocatorEvent::Tick);
        allocator.process(2100, &mut tracks);
        let outputs = drain(&mut allocator);
        assert!(!outputs.iter().any(|o| matches!(o, AllocatorOutput::RequestPadding(..))));
    }

    #[test]
    fn backpressure_applies_multiplicative_decrease() {
        let mut allocator = StreamAllocator::new();
        let mut tracks: TrackTable = TrackTable::new();
        tracks.insert(TrackId(1), video_track(1));

        allocator.push_event(AllocatorEvent::EstimateUpdate(2_000_000));
        allocator.process(0, &mut tracks);
        drain(&mut allocator);

        allocator.push_event(AllocatorEvent::Backpressure);
        allocator.process(0, &mut tracks);
        assert_eq!(allocator.channel_capacity(), 2_000_000 / 100 * 85);
        assert!(allocator.is_deficient());
        assert_eq!(tracks[&TrackId(1)].forwarder.target_layer(), Some(VideoLayer::new(2, 1)));
    }

    #[test]
    fn overflow_evicts_ticks_first() {
        let mut allocator = StreamAllocator::new();
        for _ in 0..MAX_PENDING_EVENTS {
            allocator.push_event(AllocatorEvent::Tick);
        }
        allocator.push_event(AllocatorEvent::EstimateUpdate(1_000_000));

        let mut tracks: TrackTable = TrackTable::new();
        tracks.insert(TrackId(1), video_track(1));
        allocator.process(0, &mut tracks);
        // the estimate survived the overflow
        assert_eq!(allocator.channel_capacity(), 1_000_000);
    }

    #[test]
    fn resume_emits_key_frame_request() {
        let mut allocator = StreamAllocator::new();
        let mut tracks: TrackTable = TrackTable::new();
        tracks.insert(TrackId(1), video_track(1));

        // starve the track into a pause
        allocator.push_event(AllocatorEvent::EstimateUpdate(50_000));
        allocator.process(0, &mut tracks);
        assert_eq!(tracks[&TrackId(1)].forwarder.target_layer(), None);
        let outputs = drain(&mut allocator);
        assert_eq!(states(&outputs), vec![(TrackId(1), StreamState::Paused)]);

        // recovery is a single careful step, not a jump back to optimal
        allocator.push_event(AllocatorEvent::EstimateUpdate(2_000_000));
        allocator.process(0, &mut tracks);
        let outputs = drain(&mut allocator);
        assert!(outputs.contains(&AllocatorOutput::RequestKeyFrame(TrackId(1))));
        assert_eq!(
            states(&outputs),
            vec![(TrackId(1), StreamState::Active { layer: Some(VideoLayer::new(0, 0)) })]
        );
    }
}
