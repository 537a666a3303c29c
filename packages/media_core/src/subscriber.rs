//! One receiving peer: the single-threaded loop owning all of its
//! subscribed tracks, the stream allocator, the pacer and the RTCP state.
//!
//! Inputs arrive as method calls (the embedder's event loop serializes
//! them), outputs drain through `pop_output`. Nothing here blocks and the
//! per-packet path completes synchronously.

use std::collections::VecDeque;

use media_forward_protocol::endpoint::TrackSettings;
use media_forward_protocol::media::{ExtPacket, MediaMeta};
use serde::{Deserialize, Serialize};

use crate::allocator::{AllocatorEvent, AllocatorOutput, StreamAllocator};
use crate::feedback::{TwccFeedback, TwccInfo};
use crate::forwarder::ForwarderAction;
use crate::pacer::{PacedPacket, Pacer, PassThroughPacer};
use crate::track::{SubscribedTrack, TrackTable};
use crate::transport::{RtcpEgress, RtcpIngress, StreamState, SubscriberId, TrackId};

/// Largest padding payload one RTP packet can carry.
const PADDING_PACKET_BYTES: u64 = 255;
/// Padding packets synthesized per probe burst at most.
const PADDING_BURST_MAX: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub max_egress_bps: u64,
    /// Pacer queue depth that triggers a backpressure decrease.
    pub backpressure_queue_len: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_egress_bps: 5_000_000,
            backpressure_queue_len: 256,
        }
    }
}

#[derive(Debug)]
pub enum SubscriberOutput {
    /// Fully rewritten packet for the transport's RTP sink.
    SendRtp(TrackId, ExtPacket),
    SendRtcp(RtcpEgress),
    /// Key frame wanted from the publisher of this track.
    RequestKeyFrame(TrackId),
    TrackState(TrackId, StreamState),
    Quality(u8),
    /// Remote arrival times for the bandwidth estimator.
    FeedbackArrivals(TwccInfo),
    Closed,
}

pub struct Subscriber {
    id: SubscriberId,
    cfg: SubscriberConfig,
    tracks: TrackTable,
    allocator: StreamAllocator,
    pacer: Box<dyn Pacer>,
    twcc: TwccFeedback,
    queue: VecDeque<SubscriberOutput>,
    closed: bool,
    packets_dropped: u64,
}

impl Subscriber {
    pub fn new(id: SubscriberId, cfg: SubscriberConfig) -> Self {
        Self::with_pacer(id, cfg, Box::<PassThroughPacer>::default())
    }

    pub fn with_pacer(id: SubscriberId, cfg: SubscriberConfig, pacer: Box<dyn Pacer>) -> Self {
        Self {
            id,
            cfg,
            tracks: TrackTable::new(),
            allocator: StreamAllocator::new(),
            pacer,
            twcc: TwccFeedback::new(),
            queue: VecDeque::new(),
            closed: false,
            packets_dropped: 0,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.keys().copied().collect()
    }

    pub fn has_track(&self, id: TrackId) -> bool {
        self.tracks.contains_key(&id)
    }

    /// Dropped for not matching any track or failing feedback parsing.
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    pub fn add_track(&mut self, now_ms: u64, track: SubscribedTrack) {
        if self.closed {
            return;
        }
        let id = track.id;
        log::info!("[Subscriber {}] add {} ({})", self.id, id, track.kind);
        self.tracks.insert(id, track);
        self.allocator.push_event(AllocatorEvent::SettingsChange(id));
        self.allocator.process(now_ms, &mut self.tracks);
        self.drain_allocator(now_ms);
    }

    pub fn remove_track(&mut self, now_ms: u64, id: TrackId) -> Option<SubscribedTrack> {
        let track = self.tracks.remove(&id)?;
        log::info!("[Subscriber {}] remove {}", self.id, id);
        self.allocator.forget_track(id);
        self.allocator.push_event(AllocatorEvent::SettingsChange(id));
        self.allocator.process(now_ms, &mut self.tracks);
        self.drain_allocator(now_ms);
        Some(track)
    }

    pub fn update_track_settings(&mut self, now_ms: u64, id: TrackId, settings: TrackSettings) {
        let Some(track) = self.tracks.get_mut(&id) else {
            return;
        };
        log::info!("[Subscriber {}] settings {} => {:?}", self.id, id, settings);
        track.priority = settings.priority;
        track.forwarder.set_max_layer(settings.max_layer);
        if track.forwarder.mute(!settings.enabled) {
            self.allocator.push_event(AllocatorEvent::TrackMuted(id, !settings.enabled));
        }
        self.allocator.push_event(AllocatorEvent::SettingsChange(id));
        self.allocator.process(now_ms, &mut self.tracks);
        self.drain_allocator(now_ms);
    }

    /// Publisher-side layer availability changed for one track.
    pub fn on_layers_change(&mut self, now_ms: u64, id: TrackId, layers: Vec<u8>) {
        if !self.tracks.contains_key(&id) {
            return;
        }
        self.allocator.push_event(AllocatorEvent::AvailableLayersChange(id, layers));
        self.allocator.process(now_ms, &mut self.tracks);
        self.drain_allocator(now_ms);
    }

    /// Per-packet hot path: decide, rewrite, account, pace. Synchronous and
    /// never fallible; anything wrong becomes a drop plus a counter.
    pub fn on_packet(&mut self, now_ms: u64, id: TrackId, mut pkt: ExtPacket) {
        if self.closed {
            return;
        }
        let Some(track) = self.tracks.get_mut(&id) else {
            self.packets_dropped += 1;
            return;
        };

        if let Some(layers) = pkt.layers.take() {
            track.set_bitrates(layers);
            self.allocator.push_event(AllocatorEvent::BitratesUpdate(id, layers));
        }

        if track.forwarder.translate(now_ms, &mut pkt).is_some() {
            pkt.ssrc = track.ssrc_out;
            track.stats.update(
                now_ms,
                pkt.seq,
                pkt.ts,
                pkt.marker,
                pkt.header_size,
                pkt.payload_size as usize,
                pkt.padding_size as usize,
            );
            self.pacer.enqueue(now_ms, PacedPacket { track: id, pkt, padding: false });
        }

        while let Some(action) = self.tracks.get_mut(&id).expect("track exists").forwarder.pop_action() {
            match action {
                ForwarderAction::RequestKeyFrame => self.queue.push_back(SubscriberOutput::RequestKeyFrame(id)),
            }
        }

        self.drain_pacer(now_ms);
    }

    /// Channel capacity estimate, from the estimator or signaling fallback.
    pub fn on_estimate(&mut self, now_ms: u64, bps: u64) {
        if self.closed {
            return;
        }
        let bps = bps.min(self.cfg.max_egress_bps);
        self.pacer.set_target_bitrate(bps);
        self.allocator.push_event(AllocatorEvent::EstimateUpdate(bps));
        self.allocator.process(now_ms, &mut self.tracks);
        self.drain_allocator(now_ms);
    }

    pub fn on_rtcp(&mut self, now_ms: u64, rtcp: RtcpIngress) {
        if self.closed {
            return;
        }
        match rtcp {
            RtcpIngress::ReceiverReport(rr) => {
                if let Some(track) = self.track_by_ssrc(rr.ssrc) {
                    track.stats.update_from_receiver_report(now_ms, &rr);
                } else {
                    self.packets_dropped += 1;
                }
            }
            RtcpIngress::TransportCc(report) => match self.twcc.handle(now_ms, &report) {
                Ok(info) => self.queue.push_back(SubscriberOutput::FeedbackArrivals(info)),
                Err(err) => {
                    log::debug!("[Subscriber {}] twcc rejected: {}", self.id, err);
                    self.packets_dropped += 1;
                }
            },
            RtcpIngress::Pli { media_ssrc } => {
                if let Some(track) = self.track_by_ssrc(media_ssrc) {
                    let id = track.id;
                    track.stats.update_pli(now_ms, 1);
                    self.queue.push_back(SubscriberOutput::RequestKeyFrame(id));
                }
            }
            RtcpIngress::Fir { media_ssrc } => {
                if let Some(track) = self.track_by_ssrc(media_ssrc) {
                    let id = track.id;
                    track.stats.update_fir(now_ms, 1);
                    self.queue.push_back(SubscriberOutput::RequestKeyFrame(id));
                }
            }
            RtcpIngress::Nack { media_ssrc, pairs } => {
                if let Some(track) = self.track_by_ssrc(media_ssrc) {
                    let id = track.id;
                    let count = pairs.len() as u32;
                    track.stats.update_nack(count);
                    self.allocator.push_event(AllocatorEvent::NackObserved(id, count));
                }
            }
        }
    }

    pub fn on_tick(&mut self, now_ms: u64, unix_now_ms: u64) {
        if self.closed {
            return;
        }

        if self.pacer.queue_len() > self.cfg.backpressure_queue_len {
            log::warn!("[Subscriber {}] pacer queue {} over threshold", self.id, self.pacer.queue_len());
            self.allocator.push_event(AllocatorEvent::Backpressure);
        }
        self.allocator.push_event(AllocatorEvent::Tick);
        self.allocator.process(now_ms, &mut self.tracks);
        self.drain_allocator(now_ms);

        for track in self.tracks.values_mut() {
            let ssrc = track.ssrc_out;
            if let Some(sr) = track.sender_reports.maybe_generate(now_ms, unix_now_ms, ssrc, &mut track.stats) {
                self.queue.push_back(SubscriberOutput::SendRtcp(RtcpEgress::SenderReport(sr)));
            }
        }

        let due = self.pacer.padding_due(now_ms);
        if due > 0 {
            // padding carried over from a probe request finds an idle wire
            if let Some(id) = self.tracks.keys().next().copied() {
                self.enqueue_padding(now_ms, id, due);
            }
        }

        self.drain_pacer(now_ms);
    }

    /// Close cascades over all tracks: drain whatever the pacer holds and
    /// say goodbye on every outbound stream.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        log::info!("[Subscriber {}] close", self.id);
        for paced in self.pacer.drain() {
            self.queue.push_back(SubscriberOutput::SendRtp(paced.track, paced.pkt));
        }
        let ssrcs: Vec<u32> = self.tracks.values().map(|t| t.ssrc_out).collect();
        if !ssrcs.is_empty() {
            self.queue.push_back(SubscriberOutput::SendRtcp(RtcpEgress::Bye { ssrcs }));
        }
        self.queue.push_back(SubscriberOutput::Closed);
        self.closed = true;
    }

    pub fn pop_output(&mut self) -> Option<SubscriberOutput> {
        self.queue.pop_front()
    }

    fn track_by_ssrc(&mut self, ssrc: u32) -> Option<&mut SubscribedTrack> {
        self.tracks.values_mut().find(|t| t.ssrc_out == ssrc)
    }

    fn drain_allocator(&mut self, now_ms: u64) {
        while let Some(output) = self.allocator.pop_output() {
            match output {
                AllocatorOutput::StreamState(id, state) => self.queue.push_back(SubscriberOutput::TrackState(id, state)),
                AllocatorOutput::RequestKeyFrame(id) => self.queue.push_back(SubscriberOutput::RequestKeyFrame(id)),
                AllocatorOutput::RequestPadding(id, bytes) => {
                    self.pacer.request_padding(bytes);
                    let due = self.pacer.padding_due(now_ms);
                    if due > 0 {
                        self.enqueue_padding(now_ms, id, due);
                    }
                }
                AllocatorOutput::Quality(q) => self.queue.push_back(SubscriberOutput::Quality(q)),
            }
        }
    }

    fn enqueue_padding(&mut self, now_ms: u64, id: TrackId, bytes: u64) {
        let Some(track) = self.tracks.get_mut(&id) else {
            return;
        };
        let num = ((bytes.div_ceil(PADDING_PACKET_BYTES)) as usize).min(PADDING_BURST_MAX);
        let ssrc = track.ssrc_out;
        for snts in track.forwarder.padding_snts(num) {
            let pkt = ExtPacket {
                ssrc,
                seq: snts.seq,
                ts: snts.ts,
                marker: false,
                header_size: 12,
                payload_size: 0,
                padding_size: PADDING_PACKET_BYTES as u16,
                spatial: 0,
                meta: MediaMeta::Opus { audio_level: None },
                layers: None,
                data: vec![],
            };
            track.stats.update(now_ms, pkt.seq, pkt.ts, false, pkt.header_size, 0, PADDING_PACKET_BYTES as usize);
            self.pacer.enqueue(now_ms, PacedPacket { track: id, pkt, padding: true });
        }
    }

    fn drain_pacer(&mut self, now_ms: u64) {
        while let Some(paced) = self.pacer.pop(now_ms) {
            self.queue.push_back(SubscriberOutput::SendRtp(paced.track, paced.pkt));
        }
    }
}
