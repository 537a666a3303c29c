use std::fmt;

use derivative::Derivative;

/// Simulcast streams carry at most this many spatial encodings.
pub const MAX_SPATIAL_LAYERS: usize = 3;
/// Each spatial encoding carries at most this many temporal layers.
pub const MAX_TEMPORAL_LAYERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn is_audio(&self) -> bool {
        matches!(self, MediaKind::Audio)
    }

    pub fn is_video(&self) -> bool {
        matches!(self, MediaKind::Video)
    }

    pub fn clock_rate(&self) -> u64 {
        match self {
            MediaKind::Audio => 48_000,
            MediaKind::Video => 90_000,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCodec {
    Opus,
    Vp8,
    H264,
    Av1,
}

impl MediaCodec {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaCodec::Opus => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }
}

/// VP8 payload descriptor fields the forwarder rewrites at layer switches.
/// Only the subset needed for header rewriting is carried; full payload
/// parsing stays in the receiver pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vp8Sim {
    pub spatial: u8,
    pub temporal: u8,
    pub layer_sync: bool,
    pub picture_id: Option<u16>,
    pub tl0_pic_idx: Option<u8>,
    pub key_idx: Option<u8>,
}

/// Tagged codec descriptor. Each variant carries only what the forwarder
/// needs for its drop/forward/rewrite decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaMeta {
    Opus { audio_level: Option<i8> },
    Vp8 { key: bool, sim: Option<Vp8Sim> },
    H264 { key: bool },
    Av1 { key: bool },
}

impl MediaMeta {
    pub fn is_key(&self) -> bool {
        match self {
            MediaMeta::Opus { .. } => false,
            MediaMeta::Vp8 { key, .. } => *key,
            MediaMeta::H264 { key } => *key,
            MediaMeta::Av1 { key } => *key,
        }
    }
}

/// One simulcast/temporal coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VideoLayer {
    pub spatial: u8,
    pub temporal: u8,
}

impl VideoLayer {
    pub const fn new(spatial: u8, temporal: u8) -> Self {
        Self { spatial, temporal }
    }

    /// Highest selectable coordinate for a simulcast video track.
    pub const fn top() -> Self {
        Self {
            spatial: MAX_SPATIAL_LAYERS as u8 - 1,
            temporal: MAX_TEMPORAL_LAYERS as u8 - 1,
        }
    }
}

impl fmt::Display for VideoLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.spatial, self.temporal)
    }
}

/// Measured bitrate per (spatial, temporal) cell in bits per second.
/// A zero cell means unmeasured or absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerBitrates {
    cells: [[u64; MAX_TEMPORAL_LAYERS]; MAX_SPATIAL_LAYERS],
}

impl LayerBitrates {
    pub fn from_rows(rows: &[[u64; MAX_TEMPORAL_LAYERS]]) -> Self {
        let mut out = Self::default();
        for (spatial, row) in rows.iter().enumerate().take(MAX_SPATIAL_LAYERS) {
            out.cells[spatial] = *row;
        }
        out
    }

    pub fn set(&mut self, layer: VideoLayer, bps: u64) {
        if (layer.spatial as usize) < MAX_SPATIAL_LAYERS && (layer.temporal as usize) < MAX_TEMPORAL_LAYERS {
            self.cells[layer.spatial as usize][layer.temporal as usize] = bps;
        }
    }

    pub fn get(&self, layer: VideoLayer) -> u64 {
        if (layer.spatial as usize) < MAX_SPATIAL_LAYERS && (layer.temporal as usize) < MAX_TEMPORAL_LAYERS {
            self.cells[layer.spatial as usize][layer.temporal as usize]
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(|row| row.iter().all(|c| *c == 0))
    }

    /// Highest measured cell not exceeding `max`, spatial taking precedence.
    pub fn best_within(&self, max: VideoLayer) -> Option<(VideoLayer, u64)> {
        let max_s = (max.spatial as usize).min(MAX_SPATIAL_LAYERS - 1);
        let max_t = (max.temporal as usize).min(MAX_TEMPORAL_LAYERS - 1);
        for spatial in (0..=max_s).rev() {
            for temporal in (0..=max_t).rev() {
                if self.cells[spatial][temporal] > 0 {
                    return Some((VideoLayer::new(spatial as u8, temporal as u8), self.cells[spatial][temporal]));
                }
            }
        }
        None
    }

    /// Highest measured cell whose bitrate fits within `capacity`, spatial
    /// taking precedence over temporal.
    pub fn select_under(&self, capacity: u64, max: VideoLayer) -> Option<(VideoLayer, u64)> {
        let max_s = (max.spatial as usize).min(MAX_SPATIAL_LAYERS - 1);
        let max_t = (max.temporal as usize).min(MAX_TEMPORAL_LAYERS - 1);
        for spatial in (0..=max_s).rev() {
            for temporal in (0..=max_t).rev() {
                let bps = self.cells[spatial][temporal];
                if bps > 0 && bps <= capacity {
                    return Some((VideoLayer::new(spatial as u8, temporal as u8), bps));
                }
            }
        }
        None
    }

    /// Next measured cell above `current` in spatial-major order: remaining
    /// temporals of the current spatial first, then higher spatials from
    /// their lowest measured temporal.
    pub fn next_higher(&self, current: VideoLayer, max: VideoLayer) -> Option<(VideoLayer, u64)> {
        let max_s = (max.spatial as usize).min(MAX_SPATIAL_LAYERS - 1);
        let max_t = (max.temporal as usize).min(MAX_TEMPORAL_LAYERS - 1);
        let spatial = current.spatial as usize;
        if spatial <= max_s {
            for temporal in (current.temporal as usize + 1)..=max_t {
                if self.cells[spatial][temporal] > 0 {
                    return Some((VideoLayer::new(spatial as u8, temporal as u8), self.cells[spatial][temporal]));
                }
            }
        }
        for spatial in (current.spatial as usize + 1)..=max_s {
            for temporal in 0..=max_t {
                if self.cells[spatial][temporal] > 0 {
                    return Some((VideoLayer::new(spatial as u8, temporal as u8), self.cells[spatial][temporal]));
                }
            }
        }
        None
    }

    /// Lowest measured cell, used to resume a fully paused stream.
    pub fn lowest(&self, max: VideoLayer) -> Option<(VideoLayer, u64)> {
        let max_s = (max.spatial as usize).min(MAX_SPATIAL_LAYERS - 1);
        let max_t = (max.temporal as usize).min(MAX_TEMPORAL_LAYERS - 1);
        for spatial in 0..=max_s {
            for temporal in 0..=max_t {
                if self.cells[spatial][temporal] > 0 {
                    return Some((VideoLayer::new(spatial as u8, temporal as u8), self.cells[spatial][temporal]));
                }
            }
        }
        None
    }
}

/// One demuxed packet as delivered by the receiver pipeline: RTP header
/// fields plus the parsed codec descriptor and, when the publisher announced
/// them, refreshed per-layer bitrates.
#[derive(Derivative, Clone, PartialEq, Eq)]
#[derivative(Debug)]
pub struct ExtPacket {
    pub ssrc: u32,
    pub seq: u16,
    pub ts: u32,
    pub marker: bool,
    pub header_size: u16,
    pub payload_size: u16,
    pub padding_size: u16,
    /// Spatial encoding this packet belongs to, assigned at demux.
    pub spatial: u8,
    pub meta: MediaMeta,
    pub layers: Option<LayerBitrates>,
    #[derivative(Debug = "ignore")]
    pub data: Vec<u8>,
}

impl ExtPacket {
    pub fn is_padding_only(&self) -> bool {
        self.payload_size == 0
    }
}
