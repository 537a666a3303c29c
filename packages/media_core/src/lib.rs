//! Core media forwarding engine of the SFU.
//!
//! Receives demuxed RTP packet streams from publishing endpoints and forwards
//! per-subscriber selections of those streams, choosing simulcast layers as a
//! function of estimated downlink bandwidth, subscriber settings and track
//! priority. Transports, signaling and congestion estimation live outside;
//! this crate consumes their outputs and drains its own through per-component
//! `pop_output` queues.
//!
//! Component map:
//!
//! - [`stats`]: per-direction RTP accounting, receiver/sender report state
//! - [`forwarder`]: per-subscribed-track drop/forward/rewrite decisions
//! - [`allocator`]: per-subscriber layer scheduling across tracks
//! - [`feedback`]: TWCC ingestion and RTCP report generation
//! - [`pacer`]: outbound rate shaping and probe padding
//! - [`subscriber`]: single-threaded loop owning one peer's tracks
//! - [`engine`]: publisher registry and the subscribe graph

pub mod allocator;
pub mod engine;
pub mod errors;
pub mod feedback;
pub mod forwarder;
pub mod pacer;
pub mod stats;
pub mod subscriber;
pub mod track;
pub mod transport;
