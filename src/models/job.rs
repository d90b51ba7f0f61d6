//! Job: the immutable export specification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::geo::Bbox;

/// One provider's worth of requested work within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Slug of a configured provider.
    pub provider: String,

    /// Requested output format slugs. Unknown slugs are skipped with a
    /// warning at compile time; an empty list fails validation.
    pub formats: Vec<String>,

    /// Zoom overrides; `None` falls back to the provider defaults.
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
}

impl ProviderRequest {
    pub fn new(provider: impl Into<String>, formats: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            provider: provider.into(),
            formats: formats.into_iter().map(String::from).collect(),
            min_zoom: None,
            max_zoom: None,
        }
    }
}

/// The immutable specification an export run executes. Created by the
/// user-facing layer; read-only to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub user: String,

    /// Area of interest as GeoJSON geometry.
    pub geometry: Value,

    /// Envelope of the geometry, used for estimates and collection.
    pub bbox: Bbox,

    /// Requested output projections (EPSG srids). 4326 is the native pass
    /// and implied even when absent.
    pub projections: Vec<i32>,

    pub provider_requests: Vec<ProviderRequest>,

    /// Whether finalization assembles a whole-run archive.
    pub include_archive: bool,
}

impl Job {
    /// Construct a job around a GeoJSON geometry, deriving the bbox.
    /// Returns `None` when the geometry has no usable envelope.
    pub fn new(
        name: impl Into<String>,
        user: impl Into<String>,
        geometry: Value,
        provider_requests: Vec<ProviderRequest>,
    ) -> Option<Self> {
        let bbox = Bbox::from_geojson(&geometry)?;
        Some(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            user: user.into(),
            geometry,
            bbox,
            projections: vec![crate::constants::NATIVE_SRID],
            provider_requests,
            include_archive: true,
        })
    }

    /// Filesystem-safe name used in artifact paths.
    pub fn normalized_name(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect::<String>()
            .split('_')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    }
}
