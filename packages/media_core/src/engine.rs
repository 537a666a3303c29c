//! Publisher registry and the publisher-to-subscriber forwarding graph.
//!
//! Keeps upstream statistics and windowed layer-bitrate measurement per
//! published track, fans packets out to subscribers, and routes subscriber
//! key-frame needs back toward the right publisher. All signaling-style
//! notifications leave through one drained event stream.

use std::collections::{BTreeMap, VecDeque};

use media_forward_protocol::endpoint::{TrackSettings, TrackSource};
use media_forward_protocol::media::{ExtPacket, LayerBitrates, MediaCodec, MediaKind, MediaMeta, VideoLayer, MAX_SPATIAL_LAYERS, MAX_TEMPORAL_LAYERS};

use crate::errors::EngineErrors;
use crate::feedback::ReceiverReportGenerator;
use crate::stats::{RtpStats, SenderReportData};
use crate::subscriber::{Subscriber, SubscriberConfig, SubscriberOutput};
use crate::track::SubscribedTrack;
use crate::transport::{RtcpEgress, RtcpIngress, SubscriberId, TrackId};

/// Window over which per-layer bitrates are measured.
const BITRATE_WINDOW_MS: u64 = 2000;
/// Cadence of receiver reports toward publishers.
const RECEIVER_REPORT_INTERVAL_MS: u64 = 1000;
/// Outbound SSRCs are handed out from here.
const SSRC_BASE: u32 = 0x7000_0000;

/// Windowed byte accounting per (spatial, temporal) cell, producing
/// cumulative-per-temporal bitrates the allocator can walk.
struct LayerBitrateMeasure {
    window_ms: u64,
    last_ms: u64,
    sums: [[u64; MAX_TEMPORAL_LAYERS]; MAX_SPATIAL_LAYERS],
}

impl LayerBitrateMeasure {
    fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_ms: 0,
            sums: Default::default(),
        }
    }

    fn add_sample(&mut self, now_ms: u64, spatial: u8, temporal: u8, payload_size: usize) -> Option<LayerBitrates> {
        if self.last_ms == 0 {
            self.last_ms = now_ms;
        }

        let out = if now_ms.saturating_sub(self.last_ms) >= self.window_ms {
            let mut rates = [[0u64; MAX_TEMPORAL_LAYERS]; MAX_SPATIAL_LAYERS];
            for (s, row) in self.sums.iter_mut().enumerate() {
                for (t, sum) in row.iter_mut().enumerate() {
                    rates[s][t] = *sum * 8 * 1000 / self.window_ms;
                    *sum = 0;
                }
            }
            // temporal layers are cumulative: receiving T2 means receiving
            // T0 and T1 as well
            for row in rates.iter_mut() {
                if row[0] == 0 {
                    continue;
                }
                for t in 1..MAX_TEMPORAL_LAYERS {
                    if row[t] == 0 {
                        break;
                    }
                    row[t] += row[t - 1];
                }
            }
            self.last_ms = now_ms;
            Some(LayerBitrates::from_rows(&rates))
        } else {
            None
        };

        if (spatial as usize) < MAX_SPATIAL_LAYERS && (temporal as usize) < MAX_TEMPORAL_LAYERS {
            self.sums[spatial as usize][temporal as usize] += payload_size as u64;
        }
        out
    }
}

pub struct PublishedTrackInfo {
    pub kind: MediaKind,
    pub codec: MediaCodec,
    pub source: TrackSource,
    pub simulcast: bool,
}

struct PublishedTrack {
    info: PublishedTrackInfo,
    stats: RtpStats,
    reports: ReceiverReportGenerator,
    measure: LayerBitrateMeasure,
    available_layers: Vec<u8>,
    bitrates: LayerBitrates,
    rr_ssrc: Option<u32>,
    subscribers: Vec<SubscriberId>,
}

#[derive(Debug)]
pub enum EngineOutput {
    Subscriber(SubscriberId, SubscriberOutput),
    /// A subscriber needs a key frame from this publisher.
    RequestKeyFrame(TrackId),
    /// Receiver reports toward a publisher.
    PublisherRtcp(TrackId, RtcpEgress),
}

#[derive(Default)]
pub struct ForwardEngine {
    publishers: BTreeMap<TrackId, PublishedTrack>,
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    queue: VecDeque<EngineOutput>,
    next_ssrc: u32,
    packets_dropped: u64,
}

impl ForwardEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    // ---- graph management ----

    pub fn publish(&mut self, now_ms: u64, id: TrackId, info: PublishedTrackInfo) {
        log::info!("[ForwardEngine] publish {} ({})", id, info.kind);
        let mut stats = RtpStats::new(info.kind.clock_rate() as u32);
        let reports = ReceiverReportGenerator::new(now_ms, RECEIVER_REPORT_INTERVAL_MS, &mut stats);
        self.publishers.insert(
            id,
            PublishedTrack {
                info,
                stats,
                reports,
                measure: LayerBitrateMeasure::new(BITRATE_WINDOW_MS),
                available_layers: Vec::new(),
                bitrates: LayerBitrates::default(),
                rr_ssrc: None,
                subscribers: Vec::new(),
            },
        );
    }

    pub fn unpublish(&mut self, now_ms: u64, id: TrackId) {
        let Some(publisher) = self.publishers.remove(&id) else {
            return;
        };
        log::info!("[ForwardEngine] unpublish {}", id);
        for sub_id in publisher.subscribers {
            if let Some(subscriber) = self.subscribers.get_mut(&sub_id) {
                subscriber.remove_track(now_ms, id);
            }
        }
        self.drain_subscribers();
    }

    pub fn add_subscriber(&mut self, id: SubscriberId, cfg: SubscriberConfig) {
        log::info!("[ForwardEngine] add {}", id);
        self.subscribers.insert(id, Subscriber::new(id, cfg));
    }

    pub fn remove_subscriber(&mut self, _now_ms: u64, id: SubscriberId) {
        let Some(mut subscriber) = self.subscribers.remove(&id) else {
            return;
        };
        log::info!("[ForwardEngine] remove {}", id);
        for track_id in subscriber.track_ids() {
            if let Some(publisher) = self.publishers.get_mut(&track_id) {
                publisher.subscribers.retain(|s| *s != id);
            }
        }
        subscriber.close();
        while let Some(output) = subscriber.pop_output() {
            self.queue.push_back(EngineOutput::Subscriber(id, output));
        }
    }

    pub fn subscribe(&mut self, now_ms: u64, sub_id: SubscriberId, track_id: TrackId) -> Result<(), EngineErrors> {
        let publisher = self.publishers.get_mut(&track_id).ok_or(EngineErrors::TrackNotFound)?;
        let subscriber = self.subscribers.get_mut(&sub_id).ok_or(EngineErrors::SubscriberNotFound)?;
        if subscriber.is_closed() {
            return Err(EngineErrors::SubscriberClosed);
        }
        if subscriber.has_track(track_id) {
            return Err(EngineErrors::AlreadySubscribed);
        }

        self.next_ssrc += 1;
        let mut track = SubscribedTrack::new(
            track_id,
            publisher.info.kind,
            publisher.info.source,
            publisher.info.simulcast,
            SSRC_BASE + self.next_ssrc,
        );
        track.set_bitrates(publisher.bitrates);
        track.forwarder.uptrack_layers_change(publisher.available_layers.clone());

        publisher.subscribers.push(sub_id);
        subscriber.add_track(now_ms, track);
        self.drain_subscribers();
        Ok(())
    }

    pub fn unsubscribe(&mut self, now_ms: u64, sub_id: SubscriberId, track_id: TrackId) -> Result<(), EngineErrors> {
        let subscriber = self.subscribers.get_mut(&sub_id).ok_or(EngineErrors::SubscriberNotFound)?;
        subscriber.remove_track(now_ms, track_id).ok_or(EngineErrors::NotSubscribed)?;
        if let Some(publisher) = self.publishers.get_mut(&track_id) {
            publisher.subscribers.retain(|s| *s != sub_id);
        }
        self.drain_subscribers();
        Ok(())
    }

    pub fn update_track_settings(&mut self, now_ms: u64, sub_id: SubscriberId, track_id: TrackId, settings: TrackSettings) -> Result<(), EngineErrors> {
        let subscriber = self.subscribers.get_mut(&sub_id).ok_or(EngineErrors::SubscriberNotFound)?;
        if !subscriber.has_track(track_id) {
            return Err(EngineErrors::NotSubscribed);
        }
        subscriber.update_track_settings(now_ms, track_id, settings);
        self.drain_subscribers();
        Ok(())
    }

    /// Signaling fallback when no estimator is wired up.
    pub fn set_channel_capacity(&mut self, now_ms: u64, sub_id: SubscriberId, bps: u64) -> Result<(), EngineErrors> {
        self.on_bandwidth_estimate(now_ms, sub_id, bps)
    }

    pub fn on_bandwidth_estimate(&mut self, now_ms: u64, sub_id: SubscriberId, bps: u64) -> Result<(), EngineErrors> {
        let subscriber = self.subscribers.get_mut(&sub_id).ok_or(EngineErrors::SubscriberNotFound)?;
        subscriber.on_estimate(now_ms, bps);
        self.drain_subscribers();
        Ok(())
    }

    // ---- media path ----

    pub fn on_publisher_packet(&mut self, now_ms: u64, track_id: TrackId, mut pkt: ExtPacket) {
        let Some(publisher) = self.publishers.get_mut(&track_id) else {
            self.packets_dropped += 1;
            return;
        };

        publisher.stats.update(
            now_ms,
            pkt.seq,
            pkt.ts,
            pkt.marker,
            pkt.header_size,
            pkt.payload_size as usize,
            pkt.padding_size as usize,
        );
        if publisher.rr_ssrc.is_none() {
            publisher.rr_ssrc = Some(pkt.ssrc);
        }

        if publisher.info.kind.is_video() && !publisher.available_layers.contains(&pkt.spatial) {
            publisher.available_layers.push(pkt.spatial);
            publisher.available_layers.sort_unstable();
            let layers = publisher.available_layers.clone();
            let fan_out = publisher.subscribers.clone();
            for sub_id in fan_out {
                if let Some(subscriber) = self.subscribers.get_mut(&sub_id) {
                    subscriber.on_layers_change(now_ms, track_id, layers.clone());
                }
            }
        }

        let publisher = self.publishers.get_mut(&track_id).expect("publisher exists");
        let temporal = match &pkt.meta {
            MediaMeta::Vp8 { sim: Some(sim), .. } => sim.temporal,
            _ => 0,
        };
        if let Some(bitrates) = publisher.measure.add_sample(now_ms, pkt.spatial, temporal, pkt.payload_size as usize) {
            log::debug!("[ForwardEngine] {} measured {:?}", track_id, bitrates.best_within(VideoLayer::top()));
            publisher.bitrates = bitrates;
            // piggyback the fresh table on this packet
            pkt.layers = Some(bitrates);
        }

        let fan_out = publisher.subscribers.clone();
        for sub_id in fan_out {
            if let Some(subscriber) = self.subscribers.get_mut(&sub_id) {
                subscriber.on_packet(now_ms, track_id, pkt.clone());
            }
        }
        self.drain_subscribers();
    }

    /// Sender report from a publisher, anchoring its RTP clock to NTP.
    pub fn on_publisher_sender_report(&mut self, _now_ms: u64, track_id: TrackId, sr: SenderReportData) {
        if let Some(publisher) = self.publishers.get_mut(&track_id) {
            publisher.stats.set_sender_report_data(sr);
        }
    }

    pub fn on_subscriber_rtcp(&mut self, now_ms: u64, sub_id: SubscriberId, rtcp: RtcpIngress) {
        if let Some(subscriber) = self.subscribers.get_mut(&sub_id) {
            subscriber.on_rtcp(now_ms, rtcp);
        }
        self.drain_subscribers();
    }

    pub fn on_tick(&mut self, now_ms: u64, unix_now_ms: u64) {
        for subscriber in self.subscribers.values_mut() {
            subscriber.on_tick(now_ms, unix_now_ms);
        }

        for (track_id, publisher) in self.publishers.iter_mut() {
            if let Some(ssrc) = publisher.rr_ssrc {
                if let Some(rr) = publisher.reports.maybe_generate(now_ms, ssrc, &mut publisher.stats) {
                    self.queue.push_back(EngineOutput::PublisherRtcp(*track_id, RtcpEgress::ReceiverReport(rr)));
                }
            }
        }

        self.drain_subscribers();
    }

    pub fn pop_output(&mut self) -> Option<EngineOutput> {
        self.queue.pop_front()
    }

    fn drain_subscribers(&mut self) {
        let mut key_frames: Vec<TrackId> = Vec::new();
        for (sub_id, subscriber) in self.subscribers.iter_mut() {
            while let Some(output) = subscriber.pop_output() {
                match output {
                    SubscriberOutput::RequestKeyFrame(track_id) => key_frames.push(track_id),
                    other => self.queue.push_back(EngineOutput::Subscriber(*sub_id, other)),
                }
            }
        }
        for track_id in key_frames {
            self.queue.push_back(EngineOutput::RequestKeyFrame(track_id));
            if let Some(publisher) = self.publishers.get(&track_id) {
                if let Some(media_ssrc) = publisher.rr_ssrc {
                    let pli = rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication { sender_ssrc: 0, media_ssrc };
                    self.queue.push_back(EngineOutput::PublisherRtcp(track_id, RtcpEgress::Pli(pli)));
                }
            }
        }
    }
}
