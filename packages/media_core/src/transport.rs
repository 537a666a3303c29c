use std::fmt;

use media_forward_protocol::media::VideoLayer;

/// Identifies one receiving peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub u64);

/// Identifies one published track across the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

impl From<u64> for SubscriberId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<u64> for TrackId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Forwarding state of one subscribed track as surfaced to signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Active { layer: Option<VideoLayer> },
    Paused,
}

/// Parsed inbound RTCP relevant to the core, handed over by the transport.
#[derive(Debug, Clone)]
pub enum RtcpIngress {
    ReceiverReport(rtcp::reception_report::ReceptionReport),
    TransportCc(rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc),
    Pli { media_ssrc: u32 },
    Fir { media_ssrc: u32 },
    Nack { media_ssrc: u32, pairs: Vec<(u16, u16)> },
}

/// Outbound RTCP produced by the core, ready for the transport sink.
#[derive(Debug, Clone)]
pub enum RtcpEgress {
    SenderReport(rtcp::sender_report::SenderReport),
    ReceiverReport(rtcp::receiver_report::ReceiverReport),
    Pli(rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication),
    Bye { ssrcs: Vec<u32> },
}
