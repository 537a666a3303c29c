//! Allocation side of the forwarder: which layer this track should target
//! under a given share of the subscriber's channel capacity.

use media_forward_protocol::media::{LayerBitrates, VideoLayer, MAX_TEMPORAL_LAYERS};

use super::Forwarder;

/// Sentinel for an unconstrained channel.
pub const CHANNEL_CAPACITY_INFINITY: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocationState {
    #[default]
    None,
    Muted,
    /// The feed has no active layers at all.
    FeedDry,
    /// Layers exist but no bitrate has been measured yet.
    AwaitingMeasurement,
    /// Target equals the best available layer under `max_layer`.
    Optimal,
    /// Target is below the best available layer, or paused for bandwidth.
    Deficient,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamingChange {
    #[default]
    None,
    Pausing,
    Resuming,
}

/// Outcome of one allocation operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocation {
    pub change: StreamingChange,
    pub state: AllocationState,
    pub bandwidth_requested: u64,
    pub bandwidth_delta: i64,
    pub layers_changed: bool,
}

impl Forwarder {
    pub fn allocation_state(&self) -> AllocationState {
        self.last_allocation_state
    }

    pub fn is_deficient(&self) -> bool {
        self.last_allocation_state == AllocationState::Deficient
    }

    pub fn bandwidth_requested(&self) -> u64 {
        self.last_request_bps
    }

    /// How far the committed target sits below the subscriber's maximum, in
    /// fractional spatial steps. Zero when optimal or muted.
    pub fn distance_to_desired(&self) -> f64 {
        if self.muted || !self.kind.is_video() {
            return 0.0;
        }
        match self.target {
            None => self.max_layer.spatial as f64 + 1.0,
            Some(target) => {
                let spatial = self.max_layer.spatial.saturating_sub(target.spatial) as f64;
                let temporal = self.max_layer.temporal.saturating_sub(target.temporal) as f64;
                spatial + temporal / MAX_TEMPORAL_LAYERS as f64
            }
        }
    }

    /// Set the target layer directly. Pausing stops forwarding immediately;
    /// a spatial retarget needs a key frame on the new layer, so one is
    /// requested.
    pub fn set_target(&mut self, target: Option<VideoLayer>) {
        if self.target == target {
            return;
        }
        log::info!("[Forwarder] target {:?} => {:?}", self.target, target);
        self.target = target;
        match (self.current, target) {
            (_, None) => self.current = None,
            (Some(current), Some(t)) if t.spatial != current.spatial => self.queue_key_frame_request(),
            (None, Some(_)) if self.started => self.queue_key_frame_request(),
            _ => {}
        }
    }

    fn commit(&mut self, state: AllocationState, target: Option<VideoLayer>, requested: u64) -> Allocation {
        let previous_target = self.target;
        let change = match (previous_target, target) {
            (None, Some(_)) => StreamingChange::Resuming,
            // a mute is reported through its own state, not as a pause
            (Some(_), None) if state != AllocationState::Muted => StreamingChange::Pausing,
            _ => StreamingChange::None,
        };
        let alloc = Allocation {
            change,
            state,
            bandwidth_requested: requested,
            bandwidth_delta: requested as i64 - self.last_request_bps as i64,
            layers_changed: previous_target != target,
        };

        self.set_target(target);
        self.last_allocation_state = state;
        self.last_request_bps = requested;
        alloc
    }

    fn lowest_available_target(&self) -> VideoLayer {
        let spatial = self.available_layers.iter().copied().min().unwrap_or(0);
        VideoLayer::new(spatial, self.max_layer.temporal)
    }

    /// Choose the highest layer fitting `capacity` from the measured table.
    pub fn allocate(&mut self, capacity: u64, bitrates: &LayerBitrates) -> Allocation {
        if !self.kind.is_video() {
            return Allocation::default();
        }
        if self.muted {
            return self.commit(AllocationState::Muted, None, 0);
        }

        if bitrates.is_empty() {
            return if self.available_layers.is_empty() {
                self.commit(AllocationState::FeedDry, None, 0)
            } else if capacity == CHANNEL_CAPACITY_INFINITY {
                // optimistically start the lowest spatial until measured
                let target = self.lowest_available_target();
                self.commit(AllocationState::AwaitingMeasurement, Some(target), 0)
            } else {
                self.commit(AllocationState::Deficient, None, 0)
            };
        }

        match bitrates.select_under(capacity, self.max_layer) {
            Some((layer, bps)) => {
                let state = if bitrates.best_within(self.max_layer) == Some((layer, bps)) {
                    AllocationState::Optimal
                } else {
                    AllocationState::Deficient
                };
                self.commit(state, Some(layer), bps)
            }
            None => self.commit(AllocationState::Deficient, None, 0),
        }
    }

    /// Re-allocate with the last request adjusted by `delta_bps`. Never
    /// pauses: when nothing fits, the current target is preserved.
    pub fn try_allocate(&mut self, delta_bps: i64, bitrates: &LayerBitrates) -> Allocation {
        if !self.kind.is_video() || self.muted {
            return Allocation::default();
        }

        let capacity = (self.last_request_bps as i64 + delta_bps).max(0) as u64;
        match bitrates.select_under(capacity, self.max_layer) {
            Some((layer, bps)) => {
                let state = if bitrates.best_within(self.max_layer) == Some((layer, bps)) {
                    AllocationState::Optimal
                } else {
                    AllocationState::Deficient
                };
                self.commit(state, Some(layer), bps)
            }
            None => {
                self.last_allocation_state = AllocationState::Deficient;
                Allocation {
                    change: StreamingChange::None,
                    state: AllocationState::Deficient,
                    bandwidth_requested: self.last_request_bps,
                    bandwidth_delta: 0,
                    layers_changed: false,
                }
            }
        }
    }

    /// After a measurement window: if still awaiting measurement, lock onto
    /// the best measured cell.
    pub fn finalize_allocate(&mut self, bitrates: &LayerBitrates) -> Option<Allocation> {
        if self.last_allocation_state != AllocationState::AwaitingMeasurement {
            return None;
        }
        if !bitrates.is_empty() {
            return Some(self.allocate(CHANNEL_CAPACITY_INFINITY, bitrates));
        }
        if self.available_layers.is_empty() {
            return Some(self.commit(AllocationState::FeedDry, None, 0));
        }
        // layers exist, still nothing measured
        None
    }

    /// Probe one step up: next temporal in the current spatial, then the
    /// next spatial. Refuses unless the previous step already landed.
    pub fn allocate_next_higher(&mut self, bitrates: &LayerBitrates) -> Option<Allocation> {
        if !self.kind.is_video() || self.muted {
            return None;
        }
        if self.last_allocation_state != AllocationState::Deficient {
            return None;
        }
        if self.current != self.target {
            // previous transition has not landed yet
            return None;
        }

        let (layer, bps) = match self.target {
            None => bitrates.lowest(self.max_layer)?,
            Some(current) => bitrates.next_higher(current, self.max_layer)?,
        };

        let state = if bitrates.best_within(self.max_layer) == Some((layer, bps)) {
            AllocationState::Optimal
        } else {
            AllocationState::Deficient
        };
        Some(self.commit(state, Some(layer), bps))
    }

    /// Pause the stream outright, keeping the deficiency visible.
    pub fn pause(&mut self) -> Allocation {
        if !self.kind.is_video() {
            return Allocation::default();
        }
        self.commit(AllocationState::Deficient, None, 0)
    }

    // ---- provisional allocation, one cooperative round ----

    pub fn provisional_prepare(&mut self, bitrates: &LayerBitrates) {
        self.provisional = None;
        self.provisional_bitrates = *bitrates;
    }

    /// Offer `layer` under `available` remaining capacity. Returns the
    /// additional bits per second consumed if the track takes the layer.
    pub fn provisional_allocate(&mut self, available: u64, layer: VideoLayer, allow_pause: bool, allow_overshoot: bool) -> u64 {
        if !self.kind.is_video() || self.muted {
            return 0;
        }
        if layer.spatial > self.max_layer.spatial || layer.temporal > self.max_layer.temporal {
            return 0;
        }
        let required = self.provisional_bitrates.get(layer);
        if required == 0 {
            return 0;
        }

        let held = self.provisional.map(|(_, bps)| bps).unwrap_or(0);
        let delta = required.saturating_sub(held);
        let lowest = self.provisional_bitrates.lowest(self.max_layer);
        let must_take = !allow_pause && self.provisional.is_none() && lowest == Some((layer, required));
        if delta <= available || allow_overshoot || must_take {
            self.provisional = Some((layer, required));
            delta
        } else {
            0
        }
    }

    /// Commit whatever the cooperative round granted.
    pub fn provisional_commit(&mut self) -> Allocation {
        if !self.kind.is_video() {
            return Allocation::default();
        }
        if self.muted {
            return self.commit(AllocationState::Muted, None, 0);
        }

        match self.provisional.take() {
            Some((layer, bps)) => {
                let state = if self.provisional_bitrates.best_within(self.max_layer) == Some((layer, bps)) {
                    AllocationState::Optimal
                } else {
                    AllocationState::Deficient
                };
                self.commit(state, Some(layer), bps)
            }
            None => {
                if self.provisional_bitrates.is_empty() {
                    if self.available_layers.is_empty() {
                        self.commit(AllocationState::FeedDry, None, 0)
                    } else {
                        let target = self.lowest_available_target();
                        self.commit(AllocationState::AwaitingMeasurement, Some(target), 0)
                    }
                } else {
                    self.commit(AllocationState::Deficient, None, 0)
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use media_forward_protocol::media::{LayerBitrates, MediaKind, VideoLayer};

    use super::super::Forwarder;
    use super::{Allocation, AllocationState, StreamingChange, CHANNEL_CAPACITY_INFINITY};

    fn bitrates() -> LayerBitrates {
        LayerBitrates::from_rows(&[[2, 3, 0, 0], [4, 0, 0, 5], [0, 7, 0, 0]])
    }

    #[test]
    fn audio_does_not_allocate() {
        let mut fwd = Forwarder::new(MediaKind::Audio);
        assert_eq!(fwd.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates()), Allocation::default());
        assert_eq!(fwd.allocate_next_higher(&bitrates()), None);
    }

    #[test]
    fn muted_consumes_nothing() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.mute(true);
        let alloc = fwd.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates());
        assert_eq!(
            alloc,
            Allocation {
                change: StreamingChange::None,
                state: AllocationState::Muted,
                bandwidth_requested: 0,
                bandwidth_delta: 0,
                layers_changed: false,
            }
        );
        assert_eq!(fwd.allocation_state(), AllocationState::Muted);
        assert_eq!(fwd.bandwidth_requested(), 0);
    }

    #[test]
    fn empty_feed_states() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        let empty = LayerBitrates::default();

        // no bitrates and no layers
        let alloc = fwd.allocate(CHANNEL_CAPACITY_INFINITY, &empty);
        assert_eq!(alloc.state, AllocationState::FeedDry);
        assert_eq!(alloc.change, StreamingChange::None);

        // layers appeared: start the lowest spatial until measured
        fwd.uptrack_layers_change(vec![0]);
        let alloc = fwd.allocate(CHANNEL_CAPACITY_INFINITY, &empty);
        assert_eq!(alloc.state, AllocationState::AwaitingMeasurement);
        assert_eq!(alloc.change, StreamingChange::Resuming);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(0, 3)));
        assert_eq!(fwd.current_layer(), None);

        // anything short of an unconstrained channel pauses while unmeasured
        let alloc = fwd.allocate(CHANNEL_CAPACITY_INFINITY - 1, &empty);
        assert_eq!(alloc.state, AllocationState::Deficient);
        assert_eq!(alloc.change, StreamingChange::Pausing);
        assert_eq!(fwd.target_layer(), None);
    }

    #[test]
    fn allocate_walks_the_table() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        let b = bitrates();

        let alloc = fwd.allocate(CHANNEL_CAPACITY_INFINITY, &b);
        assert_eq!(alloc.state, AllocationState::Optimal);
        assert_eq!(alloc.change, StreamingChange::Resuming);
        assert_eq!(alloc.bandwidth_requested, 7);
        assert_eq!(alloc.bandwidth_delta, 7);
        assert!(alloc.layers_changed);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(2, 1)));

        let alloc = fwd.allocate(6, &b);
        assert_eq!(alloc.state, AllocationState::Deficient);
        assert_eq!(alloc.change, StreamingChange::None);
        assert_eq!(alloc.bandwidth_requested, 5);
        assert_eq!(alloc.bandwidth_delta, -2);
        assert!(alloc.layers_changed);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(1, 3)));

        let alloc = fwd.allocate(1, &b);
        assert_eq!(alloc.state, AllocationState::Deficient);
        assert_eq!(alloc.change, StreamingChange::Pausing);
        assert_eq!(alloc.bandwidth_requested, 0);
        assert_eq!(alloc.bandwidth_delta, -5);
        assert_eq!(fwd.target_layer(), None);
    }

    #[test]
    fn try_allocate_reduces_without_pausing() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        let b = bitrates();
        fwd.allocate(6, &b);
        assert_eq!(fwd.bandwidth_requested(), 5);

        // giving back 1 bps lands on the cell that exactly fits
        let alloc = fwd.try_allocate(-1, &b);
        assert_eq!(alloc.state, AllocationState::Deficient);
        assert_eq!(alloc.bandwidth_requested, 4);
        assert_eq!(alloc.bandwidth_delta, -1);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(1, 0)));

        // nothing fits: preserve the current target rather than pausing
        let alloc = fwd.try_allocate(-3, &b);
        assert_eq!(alloc.state, AllocationState::Deficient);
        assert_eq!(alloc.bandwidth_requested, 4);
        assert_eq!(alloc.bandwidth_delta, 0);
        assert!(!alloc.layers_changed);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(1, 0)));

        // enough headroom catches up to optimal
        let alloc = fwd.try_allocate(10, &b);
        assert_eq!(alloc.state, AllocationState::Optimal);
        assert_eq!(alloc.bandwidth_requested, 7);
        assert_eq!(alloc.bandwidth_delta, 3);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(2, 1)));
    }

    #[test]
    fn finalize_allocate_locks_measured_feed() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        let full = LayerBitrates::from_rows(&[[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]]);

        // only applies while awaiting measurement
        assert_eq!(fwd.finalize_allocate(&full), None);
        assert_eq!(fwd.allocation_state(), AllocationState::None);

        fwd.uptrack_layers_change(vec![0, 1]);
        fwd.allocate(CHANNEL_CAPACITY_INFINITY, &LayerBitrates::default());
        assert_eq!(fwd.allocation_state(), AllocationState::AwaitingMeasurement);

        // still nothing measured but layers exist: keep waiting
        assert_eq!(fwd.finalize_allocate(&LayerBitrates::default()), None);
        assert_eq!(fwd.allocation_state(), AllocationState::AwaitingMeasurement);

        let alloc = fwd.finalize_allocate(&full).expect("allocation");
        assert_eq!(alloc.state, AllocationState::Optimal);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(2, 3)));

        // sparse table locks onto the best measured cell
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.uptrack_layers_change(vec![0, 1]);
        fwd.allocate(CHANNEL_CAPACITY_INFINITY, &LayerBitrates::default());
        let sparse = LayerBitrates::from_rows(&[[1, 2, 0, 0], [5, 0, 0, 6], [0, 0, 0, 0]]);
        let alloc = fwd.finalize_allocate(&sparse).expect("allocation");
        assert_eq!(alloc.state, AllocationState::Optimal);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(1, 3)));
    }

    #[test]
    fn next_higher_steps_one_layer() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        let b = bitrates();

        // not deficient: no boost
        assert_eq!(fwd.allocate_next_higher(&b), None);

        // land on the lowest cell first
        fwd.allocate(1, &b);
        assert!(fwd.is_deficient());
        let alloc = fwd.allocate_next_higher(&b).expect("boost");
        assert_eq!(alloc.change, StreamingChange::Resuming);
        assert_eq!(alloc.bandwidth_requested, 2);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(0, 0)));

        // target not caught up: refuse to step again
        assert_eq!(fwd.allocate_next_higher(&b), None);
        fwd.current = fwd.target;

        // empty table cannot step
        assert_eq!(fwd.allocate_next_higher(&LayerBitrates::default()), None);

        let steps = [
            (VideoLayer::new(0, 1), 3, 1, AllocationState::Deficient),
            (VideoLayer::new(1, 0), 4, 1, AllocationState::Deficient),
            (VideoLayer::new(1, 3), 5, 1, AllocationState::Deficient),
            (VideoLayer::new(2, 1), 7, 2, AllocationState::Optimal),
        ];
        for (layer, bps, delta, state) in steps {
            let alloc = fwd.allocate_next_higher(&b).expect("boost");
            assert_eq!(alloc.state, state);
            assert_eq!(alloc.bandwidth_requested, bps);
            assert_eq!(alloc.bandwidth_delta, delta);
            assert!(alloc.layers_changed);
            assert_eq!(fwd.target_layer(), Some(layer));
            fwd.current = fwd.target;
        }

        // nowhere higher to go
        fwd.last_allocation_state = AllocationState::Deficient;
        assert_eq!(fwd.allocate_next_higher(&b), None);
    }

    #[test]
    fn provisional_round_distributes_capacity() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        let b = bitrates();
        fwd.provisional_prepare(&b);

        // walk layers upward under a 6 bps budget
        let mut remaining = 6u64;
        for spatial in 0..3u8 {
            for temporal in 0..4u8 {
                let used = fwd.provisional_allocate(remaining, VideoLayer::new(spatial, temporal), true, false);
                remaining -= used;
            }
        }
        let alloc = fwd.provisional_commit();
        assert_eq!(alloc.state, AllocationState::Deficient);
        assert_eq!(alloc.bandwidth_requested, 5);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(1, 3)));
    }

    #[test]
    fn provisional_round_reaches_optimal() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        let b = bitrates();
        fwd.provisional_prepare(&b);
        let mut remaining = 100u64;
        for spatial in 0..3u8 {
            for temporal in 0..4u8 {
                remaining -= fwd.provisional_allocate(remaining, VideoLayer::new(spatial, temporal), true, false);
            }
        }
        let alloc = fwd.provisional_commit();
        assert_eq!(alloc.state, AllocationState::Optimal);
        assert_eq!(alloc.bandwidth_requested, 7);
        // incremental cost across the walk equals the final request
        assert_eq!(remaining, 100 - 7);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(2, 1)));
    }

    #[test]
    fn provisional_commit_pauses_when_nothing_granted() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.allocate(6, &bitrates());
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(1, 3)));

        fwd.provisional_prepare(&bitrates());
        let used = fwd.provisional_allocate(1, VideoLayer::new(0, 0), true, false);
        assert_eq!(used, 0);
        let alloc = fwd.provisional_commit();
        assert_eq!(alloc.state, AllocationState::Deficient);
        assert_eq!(alloc.change, StreamingChange::Pausing);
        assert_eq!(fwd.target_layer(), None);
    }

    #[test]
    fn distance_to_desired_tracks_target() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates());
        let optimal_distance = fwd.distance_to_desired();

        fwd.allocate(6, &bitrates());
        assert!(fwd.distance_to_desired() > optimal_distance);

        fwd.allocate(1, &bitrates());
        assert_eq!(fwd.distance_to_desired(), fwd.max_layer().spatial as f64 + 1.0);
    }
}
