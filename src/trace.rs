//! Diagnostic trace levels
//!
//! The engine takes a bitmask of trace categories. Configuration names them
//! with filter strings; this module turns those names into the mask and the
//! mask into a `log` filter for our own output.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceLevel(pub u32);

const FILTERS: &[(&str, u32)] = &[
    ("none", 0x0000),
    ("state_info", 0x0001),
    ("warning", 0x0002),
    ("error", 0x0004),
    ("critical", 0x0008),
    ("api_call", 0x0010),
    ("default", 0x00ff),
    ("model_info", 0x0020),
    ("memory", 0x0100),
    ("timer", 0x0200),
    ("stream", 0x0400),
    ("debug", 0x0800),
    ("info", 0x1000),
    ("terse_info", 0x2000),
    ("all", 0xffff),
];

impl TraceLevel {
    pub const NONE: TraceLevel = TraceLevel(0x0000);
    pub const STATE_INFO: TraceLevel = TraceLevel(0x0001);
    pub const WARNING: TraceLevel = TraceLevel(0x0002);
    pub const ERROR: TraceLevel = TraceLevel(0x0004);
    pub const CRITICAL: TraceLevel = TraceLevel(0x0008);
    pub const DEFAULT: TraceLevel = TraceLevel(0x00ff);
    pub const DEBUG: TraceLevel = TraceLevel(0x0800);
    pub const INFO: TraceLevel = TraceLevel(0x1000);
    pub const ALL: TraceLevel = TraceLevel(0xffff);

    /// Bit value for a single named filter.
    pub fn from_name(name: &str) -> Option<TraceLevel> {
        let name = name.trim().to_ascii_lowercase();
        FILTERS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, bits)| TraceLevel(*bits))
    }

    /// OR together a list of named filters.
    ///
    /// One unknown name discards the whole list in favour of [`TraceLevel::DEFAULT`].
    pub fn parse_filters<S: AsRef<str>>(filters: &[S]) -> TraceLevel {
        if filters.is_empty() {
            return TraceLevel::DEFAULT;
        }
        let mut mask = TraceLevel::NONE;
        for filter in filters {
            match TraceLevel::from_name(filter.as_ref()) {
                Some(level) => mask = mask | level,
                None => {
                    log::warn!(
                        "unrecognized trace filter '{}', using default mask {:#06x}",
                        filter.as_ref(),
                        TraceLevel::DEFAULT.0
                    );
                    return TraceLevel::DEFAULT;
                }
            }
        }
        mask
    }

    pub fn contains(&self, other: TraceLevel) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        if *self == TraceLevel::ALL {
            log::LevelFilter::Trace
        } else if self.contains(TraceLevel::DEBUG) {
            log::LevelFilter::Debug
        } else if self.contains(TraceLevel::INFO) || self.contains(TraceLevel::STATE_INFO) {
            log::LevelFilter::Info
        } else if self.contains(TraceLevel::WARNING) {
            log::LevelFilter::Warn
        } else if self.contains(TraceLevel::ERROR) || self.contains(TraceLevel::CRITICAL) {
            log::LevelFilter::Error
        } else {
            log::LevelFilter::Off
        }
    }
}

impl Default for TraceLevel {
    fn default() -> Self {
        TraceLevel::DEFAULT
    }
}

impl BitOr for TraceLevel {
    type Output = TraceLevel;

    fn bitor(self, rhs: Self) -> Self::Output {
        TraceLevel(self.0 | rhs.0)
    }
}
