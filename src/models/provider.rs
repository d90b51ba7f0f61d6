//! Provider and format definitions.
//!
//! A [`Provider`] is a configured external geospatial data source; the
//! catalog of providers is consumed by the orchestrator, not managed by it.
//! [`ExportFormat`] is the closed set of output formats the engine knows how
//! to schedule conversions for; requests naming anything else are skipped
//! with a warning rather than failing the provider.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Kinds of external geospatial services the engine can collect from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Osm,
    Wms,
    Wmts,
    Tms,
    Wfs,
    Wcs,
    ArcgisRaster,
    ArcgisFeature,
    VectorFile,
    RasterFile,
    OgcApiProcess,
}

impl ServiceType {
    /// Display name of the collection step for this service.
    pub fn collection_task_name(&self) -> &'static str {
        match self {
            Self::Osm => "OpenStreetMap Data (.gpkg)",
            Self::Wms | Self::Wmts | Self::Tms | Self::ArcgisRaster => "Raster Tiles (.gpkg)",
            Self::Wfs => "WFS Query (.gpkg)",
            Self::Wcs => "WCS Coverage (.tif)",
            Self::ArcgisFeature => "ArcGIS Feature Service Query (.gpkg)",
            Self::VectorFile => "Vector File Download (.gpkg)",
            Self::RasterFile => "Raster File Download (.gpkg)",
            Self::OgcApiProcess => "OGC API Process (.gpkg)",
        }
    }

    /// Raster services produce tile pyramids; vector services produce
    /// feature data. Drives which formats apply.
    pub fn is_raster(&self) -> bool {
        matches!(
            self,
            Self::Wms | Self::Wmts | Self::Tms | Self::ArcgisRaster | Self::Wcs | Self::RasterFile
        )
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slug = match self {
            Self::Osm => "osm",
            Self::Wms => "wms",
            Self::Wmts => "wmts",
            Self::Tms => "tms",
            Self::Wfs => "wfs",
            Self::Wcs => "wcs",
            Self::ArcgisRaster => "arcgis-raster",
            Self::ArcgisFeature => "arcgis-feature",
            Self::VectorFile => "vector-file",
            Self::RasterFile => "raster-file",
            Self::OgcApiProcess => "ogcapi-process",
        };
        write!(f, "{slug}")
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "osm" => Ok(Self::Osm),
            "wms" => Ok(Self::Wms),
            "wmts" => Ok(Self::Wmts),
            "tms" => Ok(Self::Tms),
            "wfs" => Ok(Self::Wfs),
            "wcs" => Ok(Self::Wcs),
            "arcgis-raster" => Ok(Self::ArcgisRaster),
            "arcgis-feature" => Ok(Self::ArcgisFeature),
            "vector-file" => Ok(Self::VectorFile),
            "raster-file" => Ok(Self::RasterFile),
            "ogcapi-process" | "ogcapi-process-raster" | "ogcapi-process-vector"
            | "ogcapi-process-elevation" => Ok(Self::OgcApiProcess),
            _ => Err(format!("Unknown service type: {s}")),
        }
    }
}

/// Output formats the engine schedules conversions for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportFormat {
    Gpkg,
    Shp,
    Kml,
    Sqlite,
    Gpx,
    Pbf,
    Mbtiles,
    Geotiff,
    Nitf,
    Hfa,
}

impl ExportFormat {
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Gpkg => "gpkg",
            Self::Shp => "shp",
            Self::Kml => "kml",
            Self::Sqlite => "sqlite",
            Self::Gpx => "gpx",
            Self::Pbf => "pbf",
            Self::Mbtiles => "mbtiles",
            Self::Geotiff => "geotiff",
            Self::Nitf => "nitf",
            Self::Hfa => "hfa",
        }
    }

    /// Conversion task display name.
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::Gpkg => "Geopackage (.gpkg)",
            Self::Shp => "ESRI Shapefile (.shp)",
            Self::Kml => "Keyhole Markup Language (.kml)",
            Self::Sqlite => "SQLITE Format (.sqlite)",
            Self::Gpx => "GPS Exchange (.gpx)",
            Self::Pbf => "OSM PBF (.pbf)",
            Self::Mbtiles => "MBtiles (.mbtiles)",
            Self::Geotiff => "Geotiff (.tif)",
            Self::Nitf => "National Imagery Transmission Format (.nitf)",
            Self::Hfa => "Erdas Imagine HFA (.img)",
        }
    }

    /// OGR/GDAL driver slug handed to the conversion collaborator.
    pub fn driver(&self) -> &'static str {
        match self {
            Self::Gpkg => "gpkg",
            Self::Shp => "ESRI Shapefile",
            Self::Kml => "libkml",
            Self::Sqlite => "SQLite",
            Self::Gpx => "GPX",
            Self::Pbf => "OSM",
            Self::Mbtiles => "MBTiles",
            Self::Geotiff => "gtiff",
            Self::Nitf => "nitf",
            Self::Hfa => "hfa",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gpkg => "gpkg",
            Self::Shp => "shp",
            Self::Kml => "kml",
            Self::Sqlite => "sqlite",
            Self::Gpx => "gpx",
            Self::Pbf => "pbf",
            Self::Mbtiles => "mbtiles",
            Self::Geotiff => "tif",
            Self::Nitf => "nitf",
            Self::Hfa => "img",
        }
    }

    /// Whether output in this format can be reprojected to another srid.
    /// Tile pyramids and interchange containers stay in their native grid.
    pub fn supports_reprojection(&self) -> bool {
        !matches!(self, Self::Mbtiles | Self::Pbf | Self::Gpx)
    }

    /// Formats applicable to raster sources.
    pub fn is_raster(&self) -> bool {
        matches!(self, Self::Gpkg | Self::Geotiff | Self::Mbtiles | Self::Nitf | Self::Hfa)
    }

    /// Formats applicable to vector sources.
    pub fn is_vector(&self) -> bool {
        matches!(
            self,
            Self::Gpkg | Self::Shp | Self::Kml | Self::Sqlite | Self::Gpx | Self::Pbf
        )
    }

    /// Whether this format makes sense for the given service. A format
    /// requested against the wrong kind of source is skipped with a
    /// warning, not an error.
    pub fn applicable_to(&self, service: ServiceType) -> bool {
        if service.is_raster() {
            self.is_raster()
        } else {
            self.is_vector()
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpkg" => Ok(Self::Gpkg),
            "shp" => Ok(Self::Shp),
            "kml" => Ok(Self::Kml),
            "sqlite" => Ok(Self::Sqlite),
            "gpx" => Ok(Self::Gpx),
            "pbf" => Ok(Self::Pbf),
            "mbtiles" => Ok(Self::Mbtiles),
            "geotiff" => Ok(Self::Geotiff),
            "nitf" => Ok(Self::Nitf),
            "hfa" => Ok(Self::Hfa),
            _ => Err(format!("Unknown export format: {s}")),
        }
    }
}

/// A configured external geospatial data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub slug: String,
    pub name: String,
    pub service_type: ServiceType,
    pub url: Option<String>,
    pub layer: Option<String>,

    /// Default zoom range, overridable per request.
    pub level_from: u8,
    pub level_to: u8,

    /// Admission cap on estimated output size. `None` falls back to the
    /// configured default cap.
    pub max_data_size_mb: Option<f64>,

    /// Admission cap on estimated duration.
    pub max_duration_secs: Option<f64>,

    /// Whether this provider's outputs get their own per-provider archive.
    pub zip: bool,

    pub display: bool,
}

impl Provider {
    pub fn new(slug: impl Into<String>, name: impl Into<String>, service_type: ServiceType) -> Self {
        Self {
            slug: slug.into(),
            name: name.into(),
            service_type,
            url: None,
            layer: None,
            level_from: 0,
            level_to: 10,
            max_data_size_mb: None,
            max_duration_secs: None,
            zip: false,
            display: true,
        }
    }
}

/// Lookup of configured providers by slug. Loaded at startup; read-only to
/// the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    providers: HashMap<String, Provider>,
}

impl ProviderCatalog {
    pub fn new(providers: impl IntoIterator<Item = Provider>) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|p| (p.slug.clone(), p))
                .collect(),
        }
    }

    pub fn get(&self, slug: &str) -> Option<&Provider> {
        self.providers.get(slug)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_round_trip() {
        for slug in ["osm", "wms", "wfs", "wcs", "arcgis-feature", "ogcapi-process"] {
            let service: ServiceType = slug.parse().unwrap();
            // ogcapi aliases all display as the canonical slug
            assert!(service.to_string().starts_with(slug.split('-').next().unwrap()));
        }
        assert!("gopher".parse::<ServiceType>().is_err());
    }

    #[test]
    fn test_format_registry_is_closed() {
        assert!("shp".parse::<ExportFormat>().is_ok());
        assert!("xlsx".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_reprojection_support() {
        assert!(ExportFormat::Shp.supports_reprojection());
        assert!(ExportFormat::Geotiff.supports_reprojection());
        assert!(!ExportFormat::Mbtiles.supports_reprojection());
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = ProviderCatalog::new([
            Provider::new("osm", "OpenStreetMap", ServiceType::Osm),
            Provider::new("usgs-wms", "USGS Imagery", ServiceType::Wms),
        ]);
        assert_eq!(catalog.get("osm").unwrap().name, "OpenStreetMap");
        assert!(catalog.get("missing").is_none());
    }
}
