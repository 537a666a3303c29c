//! Shared data model between the forwarding core and its embedders.
//!
//! Everything here is plain data: media kinds and codecs, the codec
//! descriptor variants the forwarder rewrites, simulcast layer identifiers,
//! per-layer bitrate tables and the extended packet the receiver pipeline
//! delivers after demux and header parsing.

pub mod endpoint;
pub mod media;
