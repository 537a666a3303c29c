use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::media::VideoLayer;

/// Relative weight of a track inside one subscriber's allocation. Higher
/// wins capacity first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackPriority(pub u8);

impl TrackPriority {
    pub const DEFAULT_VIDEO: TrackPriority = TrackPriority(1);
    pub const DEFAULT_SCREENSHARE: TrackPriority = TrackPriority(3);
}

impl From<u8> for TrackPriority {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl AddAssign for TrackPriority {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl fmt::Display for TrackPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screenshare,
}

impl TrackSource {
    pub fn default_priority(&self) -> TrackPriority {
        match self {
            TrackSource::Screenshare => TrackPriority::DEFAULT_SCREENSHARE,
            _ => TrackPriority::DEFAULT_VIDEO,
        }
    }
}

/// Subscriber-chosen settings for one subscribed track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSettings {
    pub enabled: bool,
    pub max_layer: VideoLayer,
    pub priority: TrackPriority,
}

impl Default for TrackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_layer: VideoLayer::top(),
            priority: TrackPriority::DEFAULT_VIDEO,
        }
    }
}

impl Serialize for VideoLayer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.spatial, self.temporal).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VideoLayer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (spatial, temporal) = <(u8, u8)>::deserialize(deserializer)?;
        Ok(VideoLayer { spatial, temporal })
    }
}
