//! Value types shared by the capture, engine and orchestrator layers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Raw pixel layouts a capture source may declare or deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    I420,
    Yuy2,
    Mjpeg,
    Rgb24,
}

impl PixelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "i420",
            PixelFormat::Yuy2 => "yuy2",
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Rgb24 => "rgb24",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A capture profile: what a capturer was asked for, or what it last produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub max_fps: u32,
    pub expected_capture_delay_ms: u32,
    pub interlaced: bool,
}

impl Capability {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            max_fps: 30,
            expected_capture_delay_ms: 120,
            interlaced: false,
        }
    }

    /// Two capabilities describe the same profile when size and format match.
    /// Frame rate and delay hints do not force a capture restart.
    pub fn same_profile(&self, other: &Capability) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::I420,
            max_fps: 0,
            expected_capture_delay_ms: 0,
            interlaced: false,
        }
    }
}

/// A converted frame on its way into the engine.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Timestamp supplied by the source, in nanoseconds.
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub key: String,
    pub value: String,
}

impl Constraint {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Mandatory and optional key/value constraints, passed through to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(default)]
    pub mandatory: Vec<Constraint>,
    #[serde(default)]
    pub optional: Vec<Constraint>,
}

impl MediaConstraints {
    pub fn is_empty(&self) -> bool {
        self.mandatory.is_empty() && self.optional.is_empty()
    }

    /// Look a key up, mandatory entries first.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.mandatory
            .iter()
            .chain(self.optional.iter())
            .find(|c| c.key == key)
            .map(|c| c.value.as_str())
    }

    pub fn with_mandatory(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.mandatory.push(Constraint::new(key, value));
        self
    }

    pub fn with_optional(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.optional.push(Constraint::new(key, value));
        self
    }
}

/// Where a video source comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceOrigin {
    /// A capture device owned by this process (`sys://`).
    Device,
    /// An image topic published by someone else on the bus (`topic://`).
    Topic,
}

impl SourceOrigin {
    pub const DEVICE_SCHEME: &'static str = "sys://";
    pub const TOPIC_SCHEME: &'static str = "topic://";

    /// Split a configured source name into origin and bare name.
    /// Names without a scheme are process-local devices.
    pub fn parse(name: &str) -> (SourceOrigin, &str) {
        if let Some(rest) = name.strip_prefix(Self::DEVICE_SCHEME) {
            (SourceOrigin::Device, rest)
        } else if let Some(rest) = name.strip_prefix(Self::TOPIC_SCHEME) {
            (SourceOrigin::Topic, rest)
        } else {
            (SourceOrigin::Device, name)
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            SourceOrigin::Device => Self::DEVICE_SCHEME,
            SourceOrigin::Topic => Self::TOPIC_SCHEME,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub uri: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A data channel a peer asked for when connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelSpec {
    pub label: String,
    #[serde(default)]
    pub id: Option<u16>,
    #[serde(default = "default_true")]
    pub ordered: bool,
    #[serde(default = "default_true")]
    pub reliable: bool,
    #[serde(default)]
    pub protocol: String,
}

fn default_true() -> bool {
    true
}

impl DataChannelSpec {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            id: None,
            ordered: true,
            reliable: true,
            protocol: String::new(),
        }
    }
}

/// Endpoints on the remote side that the bridge calls back into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNames {
    #[serde(default)]
    pub disconnect: String,
    #[serde(default)]
    pub ice_candidate: String,
    #[serde(default)]
    pub sdp_offer_answer: String,
}

/// A payload travelling over a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuffer {
    pub data: Bytes,
    pub binary: bool,
}

impl DataBuffer {
    pub fn new(data: impl Into<Bytes>, binary: bool) -> Self {
        Self {
            data: data.into(),
            binary,
        }
    }
}

/// Aggregated per-session counters.
///
/// Advisory telemetry: values are read while traffic continues, so a sum
/// taken across sessions is eventually consistent, not exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub reaped_data_messages: u64,
    pub dropped_data_messages: u64,
}

impl AddAssign for FlushStats {
    fn add_assign(&mut self, rhs: Self) {
        self.reaped_data_messages = self
            .reaped_data_messages
            .saturating_add(rhs.reaped_data_messages);
        self.dropped_data_messages = self
            .dropped_data_messages
            .saturating_add(rhs.dropped_data_messages);
    }
}

impl Add for FlushStats {
    type Output = FlushStats;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Sum for FlushStats {
    fn sum<I: Iterator<Item = FlushStats>>(iter: I) -> Self {
        iter.fold(FlushStats::default(), |acc, s| acc + s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_origin_parse() {
        assert_eq!(
            SourceOrigin::parse("topic://camera/image_raw"),
            (SourceOrigin::Topic, "camera/image_raw")
        );
        assert_eq!(SourceOrigin::parse("sys://video0"), (SourceOrigin::Device, "video0"));
        assert_eq!(SourceOrigin::parse("video0"), (SourceOrigin::Device, "video0"));
    }

    #[test]
    fn test_same_profile_ignores_rate() {
        let a = Capability::new(640, 480, PixelFormat::Rgb24);
        let mut b = a.clone();
        b.max_fps = 15;
        assert!(a.same_profile(&b));
        b.format = PixelFormat::I420;
        assert!(!a.same_profile(&b));
    }

    #[test]
    fn test_constraint_lookup_prefers_mandatory() {
        let c = MediaConstraints::default()
            .with_optional("maxWidth", "320")
            .with_mandatory("maxWidth", "640");
        assert_eq!(c.get("maxWidth"), Some("640"));
        assert_eq!(c.get("missing"), None);
    }

    #[test]
    fn test_flush_stats_sum() {
        let total: FlushStats = vec![
            FlushStats { reaped_data_messages: 2, dropped_data_messages: 1 },
            FlushStats { reaped_data_messages: 3, dropped_data_messages: 0 },
        ]
        .into_iter()
        .sum();
        assert_eq!(total.reaped_data_messages, 5);
        assert_eq!(total.dropped_data_messages, 1);
        assert_eq!(std::iter::empty::<FlushStats>().sum::<FlushStats>(), FlushStats::default());
    }
}
