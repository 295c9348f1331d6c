//! Testing utilities
//!
//! Synthetic images and audio for offline testing and the CLI demo.

pub mod synthetic_data;

pub use synthetic_data::{synthetic_audio, synthetic_image, SyntheticCamera};
