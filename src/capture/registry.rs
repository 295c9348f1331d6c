//! Source enumeration and declared capability catalogs.
//!
//! Catalogs are declared, not probed: every entry is the cross product of
//! the formats declared for the source kind and a fixed resolution ladder.
//! A source is not required to deliver every entry. An unsupported choice
//! fails further down the pipeline.

use super::{ImageSource, SourceInfo};
use crate::bus::IMAGE_DATA_KIND;
use crate::errors::CaptureError;
use crate::types::{Capability, PixelFormat, SourceOrigin};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Declared resolutions, smallest first.
pub const RESOLUTION_LADDER: [(u32, u32); 13] = [
    (128, 96),
    (160, 120),
    (176, 144),
    (320, 240),
    (352, 288),
    (640, 480),
    (704, 576),
    (800, 600),
    (960, 720),
    (1280, 720),
    (1024, 768),
    (1440, 1080),
    (1920, 1080),
];

lazy_static! {
    static ref DECLARED_FORMATS: HashMap<SourceOrigin, Vec<PixelFormat>> = {
        let mut m = HashMap::new();
        m.insert(SourceOrigin::Topic, vec![PixelFormat::Rgb24]);
        m.insert(
            SourceOrigin::Device,
            vec![
                PixelFormat::I420,
                PixelFormat::Yuy2,
                PixelFormat::Mjpeg,
                PixelFormat::Rgb24,
            ],
        );
        m
    };

    static ref DECLARED_CAPABILITIES: HashMap<SourceOrigin, Arc<[Capability]>> = DECLARED_FORMATS
        .iter()
        .map(|(origin, formats)| (*origin, build_cross_product(formats)))
        .collect();
}

fn build_cross_product(formats: &[PixelFormat]) -> Arc<[Capability]> {
    formats
        .iter()
        .flat_map(|&format| {
            RESOLUTION_LADDER
                .iter()
                .map(move |&(w, h)| Capability::new(w, h, format))
        })
        .collect()
}

/// Formats declared for sources of `origin`.
pub fn declared_formats(origin: SourceOrigin) -> &'static [PixelFormat] {
    DECLARED_FORMATS
        .get(&origin)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// The shared declared table for `origin`.
pub fn declared_capabilities(origin: SourceOrigin) -> Arc<[Capability]> {
    DECLARED_CAPABILITIES
        .get(&origin)
        .cloned()
        .unwrap_or_else(|| Arc::from(Vec::new()))
}

/// Capabilities declared for one selected source.
#[derive(Debug, Clone)]
pub struct CapabilityCatalog {
    source_name: String,
    origin: SourceOrigin,
    entries: Arc<[Capability]>,
}

impl CapabilityCatalog {
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn origin(&self) -> SourceOrigin {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Capability] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&Capability> {
        self.entries.get(index)
    }

    pub fn find(&self, width: u32, height: u32, format: PixelFormat) -> Option<&Capability> {
        self.entries
            .iter()
            .find(|c| c.width == width && c.height == height && c.format == format)
    }

    /// The declared entry closest in pixel count to `width`x`height` for `format`.
    pub fn best_match(&self, width: u32, height: u32, format: PixelFormat) -> Option<&Capability> {
        let target = u64::from(width) * u64::from(height);
        self.entries
            .iter()
            .filter(|c| c.format == format)
            .min_by_key(|c| (u64::from(c.width) * u64::from(c.height)).abs_diff(target))
    }
}

/// Enumerates sources of one [`ImageSource`] and resolves their catalogs.
pub struct CaptureSourceRegistry {
    source: Arc<dyn ImageSource>,
    selected: Mutex<Option<Arc<CapabilityCatalog>>>,
}

impl CaptureSourceRegistry {
    pub fn new(source: Arc<dyn ImageSource>) -> Self {
        Self {
            source,
            selected: Mutex::new(None),
        }
    }

    fn image_sources(&self) -> Result<Vec<SourceInfo>, CaptureError> {
        let mut sources: Vec<SourceInfo> = self
            .source
            .list()?
            .into_iter()
            .filter(|info| info.kind == IMAGE_DATA_KIND)
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    /// Names of the image sources published right now, sorted by name.
    pub fn enumerate(&self) -> Result<Vec<String>, CaptureError> {
        Ok(self.image_sources()?.into_iter().map(|s| s.name).collect())
    }

    pub fn number_of_devices(&self) -> Result<usize, CaptureError> {
        Ok(self.image_sources()?.len())
    }

    /// Name of the source at `index` in the sorted enumeration.
    pub fn device_name(&self, index: usize) -> Result<String, CaptureError> {
        self.image_sources()?
            .into_iter()
            .nth(index)
            .map(|s| s.name)
            .ok_or_else(|| CaptureError::SourceNotFound(format!("#{}", index)))
    }

    /// Declared catalog for `source_name`, after checking it is still published.
    pub fn resolve_capabilities(
        &self,
        source_name: &str,
    ) -> Result<Arc<CapabilityCatalog>, CaptureError> {
        if !self.image_sources()?.iter().any(|s| s.name == source_name) {
            return Err(CaptureError::SourceNotFound(source_name.to_string()));
        }

        let mut selected = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(catalog) = selected.as_ref() {
            if catalog.source_name == source_name {
                return Ok(catalog.clone());
            }
        }

        let origin = self.source.origin();
        let catalog = Arc::new(CapabilityCatalog {
            source_name: source_name.to_string(),
            origin,
            entries: declared_capabilities(origin),
        });
        log::debug!(
            "selected '{}' with {} declared capabilities",
            source_name,
            catalog.len()
        );
        *selected = Some(catalog.clone());
        Ok(catalog)
    }
}
