//! One subscribed track: the forwarding binding of a published track to a
//! subscriber, owning the forwarder and the downstream statistics.

use std::collections::BTreeMap;

use media_forward_protocol::endpoint::{TrackPriority, TrackSource};
use media_forward_protocol::media::{LayerBitrates, MediaKind};

use crate::feedback::{SenderReportGenerator, SENDER_REPORT_INTERVAL_MS};
use crate::forwarder::Forwarder;
use crate::stats::RtpStats;
use crate::transport::TrackId;

/// All of one subscriber's tracks, keyed by the published track id.
pub type TrackTable = BTreeMap<TrackId, SubscribedTrack>;

pub struct SubscribedTrack {
    pub id: TrackId,
    pub kind: MediaKind,
    pub source: TrackSource,
    pub simulcast: bool,
    pub priority: TrackPriority,
    /// SSRC this track uses toward the subscriber.
    pub ssrc_out: u32,
    pub forwarder: Forwarder,
    /// Downstream accounting of what was actually sent.
    pub(crate) stats: RtpStats,
    /// Latest measured per-layer bitrates from the publisher side.
    pub(crate) bitrates: LayerBitrates,
    pub(crate) sender_reports: SenderReportGenerator,
}

impl SubscribedTrack {
    pub fn new(id: TrackId, kind: MediaKind, source: TrackSource, simulcast: bool, ssrc_out: u32) -> Self {
        Self {
            id,
            kind,
            source,
            simulcast,
            priority: source.default_priority(),
            ssrc_out,
            forwarder: Forwarder::new(kind),
            stats: RtpStats::new(kind.clock_rate() as u32),
            bitrates: LayerBitrates::default(),
            sender_reports: SenderReportGenerator::new(SENDER_REPORT_INTERVAL_MS),
        }
    }

    /// Managed tracks compete in layered allocation. A non-simulcast screen
    /// share is left at its optimal layer and only charged against capacity.
    pub fn is_managed(&self) -> bool {
        self.kind.is_video() && (self.source != TrackSource::Screenshare || self.simulcast)
    }

    pub fn bitrates(&self) -> &LayerBitrates {
        &self.bitrates
    }

    pub fn set_bitrates(&mut self, bitrates: LayerBitrates) {
        self.bitrates = bitrates;
    }
}
