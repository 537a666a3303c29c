//! Per-subscribed-track decision engine.
//!
//! Converts the upstream multi-layer packet stream into one continuous
//! outbound stream: locks onto a source, drops or forwards each packet,
//! and rewrites sequence numbers, timestamps and VP8 descriptor fields so
//! layer switches are invisible to the receiving decoder.

use std::collections::VecDeque;

use media_forward_protocol::media::{ExtPacket, LayerBitrates, MediaKind, MediaMeta, VideoLayer, Vp8Sim};
use media_forward_utils::{SeqExtend, SeqRewrite, TsRewrite};

mod allocation;

pub use allocation::{Allocation, AllocationState, StreamingChange, CHANNEL_CAPACITY_INFINITY};

const SEQ_MAX: u64 = 1 << 16;
const TS_MAX: u64 = 1 << 32;
const PIC_ID_MAX: u64 = 1 << 15;
const TL0_IDX_MAX: u64 = 1 << 8;
const KEY_IDX_MAX: u64 = 1 << 5;

/// Out-of-order packets older than this many sequence numbers are no longer
/// forwardable.
const PENDING_LOSS_CAP: usize = 128;

/// Blank frames injected to terminate an in-flight frame after a resume.
pub const BLANK_FRAMES_MAX: usize = 6;
/// Cadence used for synthesized blank-frame timestamps.
const BLANK_FRAME_RATE: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderAction {
    RequestKeyFrame,
}

/// How a forwarded packet relates to the previous one in sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnOrdering {
    Contiguous,
    Gap,
    OutOfOrder,
}

/// Sequence number and timestamp for one synthesized packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnTs {
    pub seq: u16,
    pub ts: u32,
}

/// Continuity state for the VP8 descriptor fields rewritten at switches.
struct Vp8Continuity {
    pic_id: SeqRewrite<PIC_ID_MAX>,
    tl0_idx: SeqRewrite<TL0_IDX_MAX>,
    key_idx: SeqRewrite<KEY_IDX_MAX>,
}

impl Default for Vp8Continuity {
    fn default() -> Self {
        Self {
            pic_id: SeqRewrite::default(),
            tl0_idx: SeqRewrite::default(),
            key_idx: SeqRewrite::default(),
        }
    }
}

impl Vp8Continuity {
    fn sync_next(&mut self) {
        self.pic_id.sync_next();
        self.tl0_idx.sync_next();
        self.key_idx.sync_next();
    }
}

pub struct Forwarder {
    kind: MediaKind,

    muted: bool,
    started: bool,
    last_ssrc: Option<u32>,

    seq: SeqRewrite<SEQ_MAX>,
    ts: TsRewrite<TS_MAX>,
    vp8: Vp8Continuity,

    seq_extend: SeqExtend,
    max_incoming: Option<u64>,
    pending_loss: VecDeque<u64>,

    last_out_seq: u16,
    last_out_ts: u32,
    last_marker: bool,
    last_out_vp8: Option<(u16, u8, u8)>,

    current: Option<VideoLayer>,
    target: Option<VideoLayer>,
    max_layer: VideoLayer,
    available_layers: Vec<u8>,

    // allocation bookkeeping, see allocation.rs
    last_allocation_state: AllocationState,
    last_request_bps: u64,
    provisional: Option<(VideoLayer, u64)>,
    provisional_bitrates: LayerBitrates,

    actions: VecDeque<ForwarderAction>,
}

impl Forwarder {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            muted: false,
            started: false,
            last_ssrc: None,
            seq: SeqRewrite::default(),
            ts: TsRewrite::new(kind.clock_rate()),
            vp8: Vp8Continuity::default(),
            seq_extend: SeqExtend::default(),
            max_incoming: None,
            pending_loss: VecDeque::new(),
            last_out_seq: 0,
            last_out_ts: 0,
            last_marker: true,
            last_out_vp8: None,
            current: None,
            target: None,
            max_layer: VideoLayer::top(),
            available_layers: Vec::new(),
            last_allocation_state: AllocationState::None,
            last_request_bps: 0,
            provisional: None,
            provisional_bitrates: Default::default(),
            actions: VecDeque::new(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn mute(&mut self, muted: bool) -> bool {
        if self.muted == muted {
            return false;
        }
        log::info!("[Forwarder] mute {}", muted);
        self.muted = muted;
        true
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn current_layer(&self) -> Option<VideoLayer> {
        self.current
    }

    pub fn target_layer(&self) -> Option<VideoLayer> {
        self.target
    }

    pub fn max_layer(&self) -> VideoLayer {
        self.max_layer
    }

    pub fn set_max_layer(&mut self, layer: VideoLayer) -> bool {
        if !self.kind.is_video() || self.max_layer == layer {
            return false;
        }
        log::info!("[Forwarder] max layer {} => {}", self.max_layer, layer);
        self.max_layer = layer;
        true
    }

    pub fn available_layers(&self) -> &[u8] {
        &self.available_layers
    }

    /// The publisher's set of active spatial layers changed.
    pub fn uptrack_layers_change(&mut self, layers: Vec<u8>) {
        log::info!("[Forwarder] available layers {:?} => {:?}", self.available_layers, layers);
        self.available_layers = layers;
    }

    pub fn pop_action(&mut self) -> Option<ForwarderAction> {
        self.actions.pop_front()
    }

    #[cfg(test)]
    pub(crate) fn set_current_for_test(&mut self) {
        self.current = self.target;
    }

    fn queue_key_frame_request(&mut self) {
        self.actions.push_back(ForwarderAction::RequestKeyFrame);
    }

    /// Decide drop/forward for one packet, rewriting it in place on forward.
    /// Returns the sequence ordering class, or `None` for a drop. Key-frame
    /// needs surface through [`Forwarder::pop_action`].
    pub fn translate(&mut self, now_ms: u64, pkt: &mut ExtPacket) -> Option<SnOrdering> {
        if self.muted {
            return None;
        }

        if self.kind.is_video() {
            self.gate_video(pkt)?;
        } else {
            self.gate_audio(pkt);
        }

        let ordering = self.classify(pkt.seq)?;

        if pkt.is_padding_only() {
            match ordering {
                SnOrdering::Contiguous => {
                    // nothing to fill, compact it away
                    self.seq.drop_value(pkt.seq as u64);
                    return None;
                }
                SnOrdering::Gap => {}
                SnOrdering::OutOfOrder => return None,
            }
        }

        let out_seq = self.seq.generate(pkt.seq as u64)? as u16;
        let out_ts = self.ts.generate(now_ms, pkt.ts as u64) as u32;
        pkt.seq = out_seq;
        pkt.ts = out_ts;

        if let MediaMeta::Vp8 { sim: Some(sim), .. } = &mut pkt.meta {
            if let Some(pic_id) = sim.picture_id {
                sim.picture_id = Some(self.vp8.pic_id.generate(pic_id as u64)? as u16);
            }
            if let Some(tl0) = sim.tl0_pic_idx {
                sim.tl0_pic_idx = Some(self.vp8.tl0_idx.generate(tl0 as u64)? as u8);
            }
            if let Some(key_idx) = sim.key_idx {
                sim.key_idx = Some(self.vp8.key_idx.generate(key_idx as u64)? as u8);
            }
            let prev = self.last_out_vp8.unwrap_or((0, 0, 0));
            self.last_out_vp8 = Some((
                sim.picture_id.unwrap_or(prev.0),
                sim.tl0_pic_idx.unwrap_or(prev.1),
                sim.key_idx.unwrap_or(prev.2),
            ));
        }

        if ordering != SnOrdering::OutOfOrder {
            self.last_out_seq = out_seq;
            self.last_out_ts = out_ts;
            self.last_marker = pkt.marker;
        }

        Some(ordering)
    }

    /// Video admission: source locking, spatial switches, temporal filter.
    fn gate_video(&mut self, pkt: &mut ExtPacket) -> Option<()> {
        let target = self.target?;

        if !self.started {
            if pkt.spatial != target.spatial {
                return None;
            }
            if !pkt.meta.is_key() {
                self.queue_key_frame_request();
                return None;
            }
            log::info!("[Forwarder] lock onto ssrc {:08x} layer {}", pkt.ssrc, target);
            self.started = true;
            self.last_ssrc = Some(pkt.ssrc);
            self.current = Some(target);
        } else if self.last_ssrc != Some(pkt.ssrc) {
            // spatial switch lands on the target layer's key frame
            if pkt.spatial != target.spatial {
                return None;
            }
            if !pkt.meta.is_key() {
                self.queue_key_frame_request();
                return None;
            }
            log::info!("[Forwarder] switch ssrc {:08x} => {:08x} layer {}", self.last_ssrc.unwrap_or(0), pkt.ssrc, target);
            self.resync_continuity();
            self.vp8.sync_next();
            self.last_ssrc = Some(pkt.ssrc);
            self.current = Some(target);
        } else if self.current.is_none() {
            // resuming a paused stream needs a decodable point as well
            if pkt.spatial != target.spatial {
                return None;
            }
            if !pkt.meta.is_key() {
                self.queue_key_frame_request();
                return None;
            }
            log::info!("[Forwarder] resume on ssrc {:08x} layer {}", pkt.ssrc, target);
            self.resync_continuity();
            self.vp8.sync_next();
            self.current = Some(target);
        }

        if let MediaMeta::Vp8 { sim: Some(sim), .. } = &pkt.meta {
            let mut current = self.current.expect("current set above");
            if target.temporal < current.temporal {
                // down switch takes effect immediately
                current.temporal = target.temporal;
                self.current = Some(current);
            }
            if sim.temporal > current.temporal {
                if sim.temporal <= target.temporal && sim.layer_sync {
                    // switch point, raise the temporal layer
                    log::info!("[Forwarder] up temporal {} => {}", current.temporal, target.temporal);
                    current.temporal = target.temporal;
                    self.current = Some(current);
                } else {
                    self.drop_for_continuity(pkt);
                    return None;
                }
            }
        }

        Some(())
    }

    fn gate_audio(&mut self, pkt: &mut ExtPacket) {
        if !self.started {
            self.started = true;
            self.last_ssrc = Some(pkt.ssrc);
        } else if self.last_ssrc != Some(pkt.ssrc) {
            log::info!("[Forwarder] switch ssrc {:08x} => {:08x}", self.last_ssrc.unwrap_or(0), pkt.ssrc);
            self.resync_continuity();
            self.last_ssrc = Some(pkt.ssrc);
        }
    }

    fn resync_continuity(&mut self) {
        self.seq.sync_next();
        self.ts.sync_next();
        self.seq_extend = SeqExtend::default();
        self.max_incoming = None;
        self.pending_loss.clear();
    }

    /// Dropped packet in the forwarded layer's sequence space: compact the
    /// outbound counters over it. Picture id continuity is preserved by not
    /// advancing the outbound id for the dropped picture.
    fn drop_for_continuity(&mut self, pkt: &ExtPacket) {
        // keep the incoming watermark moving over the dropped packet
        let _ = self.classify(pkt.seq);
        self.seq.drop_value(pkt.seq as u64);
        if let MediaMeta::Vp8 { sim: Some(sim), .. } = &pkt.meta {
            if let Some(pic_id) = sim.picture_id {
                // tl0picidx only increments in the base temporal layer, which
                // is never dropped; only the picture id needs compaction
                self.vp8.pic_id.drop_value(pic_id as u64);
            }
        }
    }

    /// Classify `seq` against the highest forwarded sequence. Advances the
    /// incoming watermark and the pending-loss window.
    fn classify(&mut self, seq: u16) -> Option<SnOrdering> {
        let ext = self.seq_extend.generate(seq)?;
        match self.max_incoming {
            None => {
                self.max_incoming = Some(ext);
                Some(SnOrdering::Contiguous)
            }
            Some(max) if ext == max => None, // duplicate
            Some(max) if ext == max + 1 => {
                self.max_incoming = Some(ext);
                Some(SnOrdering::Contiguous)
            }
            Some(max) if ext > max => {
                let first_missing = (max + 1).max(ext.saturating_sub(PENDING_LOSS_CAP as u64));
                for missing in first_missing..ext {
                    if self.pending_loss.len() == PENDING_LOSS_CAP {
                        self.pending_loss.pop_front();
                    }
                    self.pending_loss.push_back(missing);
                }
                self.max_incoming = Some(ext);
                Some(SnOrdering::Gap)
            }
            Some(_) => {
                // older than the watermark, forwardable only if it fills a
                // known hole inside the retransmit window
                if let Some(pos) = self.pending_loss.iter().position(|s| *s == ext) {
                    self.pending_loss.remove(pos);
                    Some(SnOrdering::OutOfOrder)
                } else {
                    None
                }
            }
        }
    }

    // ---- padding and blank frames ----

    /// Sequence/timestamp pairs for probe padding while the stream is
    /// paused. The timestamp stays on the last emitted frame.
    pub fn padding_snts(&mut self, num: usize) -> Vec<SnTs> {
        let mut out = Vec::with_capacity(num);
        for i in 0..num {
            out.push(SnTs {
                seq: self.last_out_seq.wrapping_add(i as u16 + 1),
                ts: self.last_out_ts,
            });
        }
        self.last_out_seq = self.last_out_seq.wrapping_add(num as u16);
        self.last_marker = true;
        self.seq.offset(num as u64);
        out
    }

    /// Sequence/timestamp pairs for blank frames injected to terminate
    /// whatever frame the decoder still expects. Returns one extra pair when
    /// the previous forwarded packet did not close its frame; that first
    /// pair repeats the frame's timestamp.
    pub fn blank_frame_snts(&mut self) -> (Vec<SnTs>, bool) {
        let frame_end_needed = !self.last_marker;
        let num = BLANK_FRAMES_MAX + usize::from(frame_end_needed);
        let tick = self.kind.clock_rate() / BLANK_FRAME_RATE;

        let mut out = Vec::with_capacity(num);
        for i in 0..num {
            let frame_index = if frame_end_needed { i as u64 } else { i as u64 + 1 };
            out.push(SnTs {
                seq: self.last_out_seq.wrapping_add(i as u16 + 1),
                ts: self.last_out_ts.wrapping_add((frame_index * tick) as u32),
            });
        }
        self.last_out_seq = self.last_out_seq.wrapping_add(num as u16);
        self.last_marker = true;
        self.seq.offset(num as u64);
        (out, frame_end_needed)
    }

    /// VP8 descriptor for a blank frame. Repeats the last emitted picture id
    /// when a frame end is owed, advances by one picture otherwise.
    pub fn padding_vp8(&mut self, frame_end_needed: bool) -> Option<Vp8Sim> {
        let (pic_id, tl0, key_idx) = self.last_out_vp8?;
        let (pic_id, tl0, key_idx) = if frame_end_needed {
            (pic_id, tl0, key_idx)
        } else {
            self.vp8.pic_id.offset(1);
            self.vp8.tl0_idx.offset(1);
            self.vp8.key_idx.offset(1);
            let next = (
                ((pic_id as u64 + 1) % PIC_ID_MAX) as u16,
                ((tl0 as u64 + 1) % TL0_IDX_MAX) as u8,
                ((key_idx as u64 + 1) % KEY_IDX_MAX) as u8,
            );
            self.last_out_vp8 = Some(next);
            next
        };
        Some(Vp8Sim {
            spatial: self.current.map(|c| c.spatial).unwrap_or(0),
            temporal: 0,
            layer_sync: true,
            picture_id: Some(pic_id),
            tl0_pic_idx: Some(tl0),
            key_idx: Some(key_idx),
        })
    }
}

#[cfg(test)]
mod test {
    use media_forward_protocol::media::{ExtPacket, LayerBitrates, MediaKind, MediaMeta, VideoLayer, Vp8Sim};

    use super::{Forwarder, ForwarderAction, SnOrdering, SnTs, BLANK_FRAMES_MAX, CHANNEL_CAPACITY_INFINITY};

    fn audio_pkt(ssrc: u32, seq: u16, ts: u32, payload: u16) -> ExtPacket {
        ExtPacket {
            ssrc,
            seq,
            ts,
            marker: false,
            header_size: 12,
            payload_size: payload,
            padding_size: 0,
            spatial: 0,
            meta: MediaMeta::Opus { audio_level: None },
            layers: None,
            data: vec![0; payload as usize],
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn vp8_pkt(ssrc: u32, seq: u16, ts: u32, spatial: u8, temporal: u8, key: bool, pic_id: u16, tl0: u8, key_idx: u8) -> ExtPacket {
        ExtPacket {
            ssrc,
            seq,
            ts,
            marker: false,
            header_size: 12,
            payload_size: 20,
            spatial,
            padding_size: 0,
            meta: MediaMeta::Vp8 {
                key,
                sim: Some(Vp8Sim {
                    spatial,
                    temporal,
                    layer_sync: false,
                    picture_id: Some(pic_id),
                    tl0_pic_idx: Some(tl0),
                    key_idx: Some(key_idx),
                }),
            },
            layers: None,
            data: vec![0; 20],
        }
    }

    fn padding_pkt(ssrc: u32, seq: u16, ts: u32) -> ExtPacket {
        ExtPacket {
            payload_size: 0,
            padding_size: 255,
            data: vec![],
            ..audio_pkt(ssrc, seq, ts, 0)
        }
    }

    fn vp8_out(pkt: &ExtPacket) -> (u16, u8, u8) {
        match &pkt.meta {
            MediaMeta::Vp8 { sim: Some(sim), .. } => (sim.picture_id.unwrap(), sim.tl0_pic_idx.unwrap(), sim.key_idx.unwrap()),
            _ => panic!("not a vp8 simulcast packet"),
        }
    }

    #[test]
    fn muted_drops_everything() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.set_target(Some(VideoLayer::new(0, 1)));
        fwd.mute(true);

        let mut pkt = vp8_pkt(0x12345678, 23333, 0xabcdef, 0, 0, true, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), None);
        assert_eq!(fwd.pop_action(), None);
    }

    #[test]
    fn audio_locks_and_splices() {
        let mut fwd = Forwarder::new(MediaKind::Audio);

        // locks onto the first packet and passes it through
        let mut pkt = audio_pkt(0x12345678, 23333, 0xabcdef, 20);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));
        assert_eq!((pkt.seq, pkt.ts), (23333, 0xabcdef));
        assert!(fwd.started());

        // duplicate drops
        let mut pkt = audio_pkt(0x12345678, 23333, 0xabcdef, 20);
        assert_eq!(fwd.translate(0, &mut pkt), None);

        // out-of-order before the lock window drops
        let mut pkt = audio_pkt(0x12345678, 23332, 0xabcdef, 20);
        assert_eq!(fwd.translate(0, &mut pkt), None);

        // padding-only in order drops and compacts
        let mut pkt = padding_pkt(0x12345678, 23334, 0xabcdef);
        assert_eq!(fwd.translate(0, &mut pkt), None);

        let mut pkt = audio_pkt(0x12345678, 23335, 0xabcdef, 20);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));
        assert_eq!(pkt.seq, 23334);

        // padding-only after a gap is forwarded
        let mut pkt = padding_pkt(0x12345678, 23337, 0xabcdef);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Gap));
        assert_eq!(pkt.seq, 23336);

        // the gap filler arrives late and keeps its slot
        let mut pkt = audio_pkt(0x12345678, 23336, 0xabcdef, 20);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::OutOfOrder));
        assert_eq!(pkt.seq, 23335);

        // new source splices with contiguous sequence; the timestamp jumps
        // one frame at the nominal cadence (48 kHz / 30)
        let mut pkt = audio_pkt(0x87654321, 123, 0xfedcba, 20);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));
        assert_eq!((pkt.seq, pkt.ts), (23337, 0xabcdef + 1600));
    }

    #[test]
    fn video_lock_requires_target_and_key_frame() {
        let mut fwd = Forwarder::new(MediaKind::Video);

        // no target layer yet
        let mut pkt = vp8_pkt(0x12345678, 23333, 0xabcdef, 0, 1, false, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), None);
        assert_eq!(fwd.pop_action(), None);

        // target matches but not a key frame: drop and ask for one
        fwd.set_target(Some(VideoLayer::new(0, 1)));
        let mut pkt = vp8_pkt(0x12345678, 23333, 0xabcdef, 0, 1, false, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), None);
        assert_eq!(fwd.pop_action(), Some(ForwarderAction::RequestKeyFrame));

        // key frame locks, passes through unchanged
        let mut pkt = vp8_pkt(0x12345678, 23333, 0xabcdef, 0, 1, true, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));
        assert_eq!((pkt.seq, pkt.ts), (23333, 0xabcdef));
        assert_eq!(vp8_out(&pkt), (13467, 233, 23));
    }

    #[test]
    fn video_temporal_drop_keeps_continuity() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.set_target(Some(VideoLayer::new(0, 1)));

        let mut pkt = vp8_pkt(0x12345678, 23333, 0xabcdef, 0, 1, true, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));

        // padding-only in order drops
        let mut pkt = padding_pkt(0x12345678, 23334, 0xabcdef);
        assert_eq!(fwd.translate(0, &mut pkt), None);

        let mut pkt = vp8_pkt(0x12345678, 23335, 0xabcdef, 0, 1, false, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));
        assert_eq!(pkt.seq, 23334);

        // temporal layer above target drops
        let mut pkt = vp8_pkt(0x12345678, 23336, 0xabcdef, 0, 2, false, 13468, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), None);

        // sequence and picture id stay contiguous over the dropped picture
        let mut pkt = vp8_pkt(0x12345678, 23337, 0xabcdef, 0, 0, false, 13469, 234, 23);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));
        assert_eq!(pkt.seq, 23335);
        assert_eq!(vp8_out(&pkt), (13468, 234, 23));
    }

    #[test]
    fn video_switch_splices_all_counters() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.set_target(Some(VideoLayer::new(0, 1)));

        let mut pkt = vp8_pkt(0x12345678, 23333, 0xabcdef, 0, 1, true, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));

        let mut pkt = vp8_pkt(0x12345678, 23334, 0xabcdef, 0, 0, false, 13469, 234, 23);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));

        // a higher layer becomes the target, switch lands on its key frame
        fwd.set_target(Some(VideoLayer::new(1, 1)));
        assert_eq!(fwd.pop_action(), Some(ForwarderAction::RequestKeyFrame));

        let mut pkt = vp8_pkt(0x87654321, 123, 0xfedcba, 1, 0, false, 45, 12, 30);
        assert_eq!(fwd.translate(0, &mut pkt), None);
        assert_eq!(fwd.pop_action(), Some(ForwarderAction::RequestKeyFrame));

        let mut pkt = vp8_pkt(0x87654321, 123, 0xfedcba, 1, 0, true, 45, 12, 30);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));
        // sequence continues by one, timestamp by one frame at 90 kHz / 30
        assert_eq!((pkt.seq, pkt.ts), (23335, 0xabcdef + 3000));
        assert_eq!(vp8_out(&pkt), (13470, 235, 24));
    }

    #[test]
    fn resume_after_pause_needs_key_frame() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.set_target(Some(VideoLayer::new(0, 1)));

        let mut pkt = vp8_pkt(0x12345678, 100, 1000, 0, 0, true, 10, 1, 1);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));

        // pause
        fwd.set_target(None);
        let mut pkt = vp8_pkt(0x12345678, 101, 2000, 0, 0, false, 11, 1, 1);
        assert_eq!(fwd.translate(10, &mut pkt), None);

        // resume, a delta frame is not a valid entry point
        fwd.set_target(Some(VideoLayer::new(0, 1)));
        let mut pkt = vp8_pkt(0x12345678, 150, 6000, 0, 0, false, 60, 5, 2);
        assert_eq!(fwd.translate(20, &mut pkt), None);
        assert_eq!(fwd.pop_action(), Some(ForwarderAction::RequestKeyFrame));

        let mut pkt = vp8_pkt(0x12345678, 151, 7000, 0, 0, true, 61, 6, 3);
        assert_eq!(fwd.translate(20, &mut pkt), Some(SnOrdering::Contiguous));
        // outbound sequence continues from the packet before the pause
        assert_eq!(pkt.seq, 101);
        assert_eq!(vp8_out(&pkt), (11, 2, 2));
    }

    #[test]
    fn duplicate_forwarded_packet_drops() {
        let mut fwd = Forwarder::new(MediaKind::Audio);
        let mut pkt = audio_pkt(0x1111, 10, 100, 20);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));
        let mut pkt = audio_pkt(0x1111, 10, 100, 20);
        assert_eq!(fwd.translate(0, &mut pkt), None);
    }

    #[test]
    fn padding_snts_freeze_timestamp() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.set_target(Some(VideoLayer::new(0, 1)));
        let mut pkt = vp8_pkt(0x12345678, 23333, 0xabcdef, 0, 1, true, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));

        let snts = fwd.padding_snts(5);
        let expected: Vec<SnTs> = (0..5).map(|i| SnTs { seq: 23334 + i, ts: 0xabcdef }).collect();
        assert_eq!(snts, expected);

        let snts = fwd.padding_snts(5);
        let expected: Vec<SnTs> = (0..5).map(|i| SnTs { seq: 23339 + i, ts: 0xabcdef }).collect();
        assert_eq!(snts, expected);
    }

    #[test]
    fn blank_frames_close_open_frame_first() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.set_target(Some(VideoLayer::new(0, 1)));
        // the locked packet does not carry a marker, so a frame is open
        let mut pkt = vp8_pkt(0x12345678, 23333, 0xabcdef, 0, 1, true, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));

        let tick = 90_000 / 30;
        let (snts, frame_end_needed) = fwd.blank_frame_snts();
        assert!(frame_end_needed);
        assert_eq!(snts.len(), BLANK_FRAMES_MAX + 1);
        // first blank repeats the open frame's timestamp to terminate it
        assert_eq!(snts[0], SnTs { seq: 23334, ts: 0xabcdef });
        assert_eq!(snts[1], SnTs { seq: 23335, ts: 0xabcdef + tick });

        let (snts, frame_end_needed) = fwd.blank_frame_snts();
        assert!(!frame_end_needed);
        assert_eq!(snts.len(), BLANK_FRAMES_MAX);
        assert_eq!(snts[0], SnTs { seq: 23341, ts: 0xabcdef + tick });
    }

    #[test]
    fn padding_vp8_repeats_then_advances_picture() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        fwd.set_target(Some(VideoLayer::new(0, 1)));
        let mut pkt = vp8_pkt(0x12345678, 23333, 0xabcdef, 0, 1, true, 13467, 233, 23);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));

        let sim = fwd.padding_vp8(true).expect("descriptor");
        assert_eq!((sim.picture_id, sim.tl0_pic_idx, sim.key_idx), (Some(13467), Some(233), Some(23)));
        assert_eq!(sim.temporal, 0);

        let sim = fwd.padding_vp8(false).expect("descriptor");
        assert_eq!((sim.picture_id, sim.tl0_pic_idx, sim.key_idx), (Some(13468), Some(234), Some(24)));
    }

    #[test]
    fn allocation_drives_targets() {
        let mut fwd = Forwarder::new(MediaKind::Video);
        let bitrates = LayerBitrates::from_rows(&[[2, 3, 0, 0], [4, 0, 0, 5], [0, 7, 0, 0]]);
        let alloc = fwd.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates);
        assert_eq!(alloc.bandwidth_requested, 7);
        assert_eq!(fwd.target_layer(), Some(VideoLayer::new(2, 1)));

        // packets on the target spatial layer flow once a key frame arrives
        let mut pkt = vp8_pkt(0x3333, 1, 100, 2, 1, true, 1, 1, 1);
        assert_eq!(fwd.translate(0, &mut pkt), Some(SnOrdering::Contiguous));
    }
}
