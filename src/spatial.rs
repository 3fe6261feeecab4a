//! Latitude/longitude to H3 cell indexing.

use std::fmt;

use h3o::{LatLng, Resolution};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_H3_RESOLUTION: u8 = 9;

/// H3 cell identifier in its canonical lowercase hex form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpatialError {
    #[error("invalid coordinate: latitude={latitude} longitude={longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
    #[error("unsupported H3 resolution: {0}")]
    InvalidResolution(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialIndexer {
    resolution: Resolution,
}

impl SpatialIndexer {
    pub fn new(resolution: u8) -> Result<Self, SpatialError> {
        let parsed = Resolution::try_from(resolution)
            .map_err(|_| SpatialError::InvalidResolution(resolution))?;
        Ok(Self { resolution: parsed })
    }

    pub fn resolution(&self) -> u8 {
        u8::from(self.resolution)
    }

    pub fn index(&self, latitude: f64, longitude: f64) -> Result<CellId, SpatialError> {
        let invalid = || SpatialError::InvalidCoordinate {
            latitude,
            longitude,
        };

        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid());
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid());
        }

        let point = LatLng::new(latitude, longitude).map_err(|_| invalid())?;
        Ok(CellId(point.to_cell(self.resolution).to_string()))
    }
}

impl Default for SpatialIndexer {
    fn default() -> Self {
        Self {
            resolution: Resolution::Nine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_deterministic_and_uses_resolution_prefix() {
        let indexer = SpatialIndexer::new(9).unwrap();
        let a = indexer.index(14.763792, -17.352459).unwrap();
        let b = indexer.index(14.763792, -17.352459).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 15);
        assert!(a.as_str().starts_with("89"));
    }

    #[test]
    fn nearby_points_share_a_cell_and_distant_points_do_not() {
        let indexer = SpatialIndexer::default();
        let dakar = indexer.index(14.763792, -17.352459).unwrap();
        let dakar_nudged = indexer.index(14.7637925, -17.3524595).unwrap();
        let thies = indexer.index(14.7910, -16.9359).unwrap();

        assert_eq!(dakar, dakar_nudged);
        assert_ne!(dakar, thies);
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        let indexer = SpatialIndexer::default();

        for (lat, lon) in [(91.0, 0.0), (-90.5, 0.0), (0.0, 180.5), (f64::NAN, 0.0)] {
            assert!(matches!(
                indexer.index(lat, lon),
                Err(SpatialError::InvalidCoordinate { .. })
            ));
        }
    }

    #[test]
    fn unsupported_resolution_is_rejected() {
        assert_eq!(
            SpatialIndexer::new(16).unwrap_err(),
            SpatialError::InvalidResolution(16)
        );
        assert_eq!(SpatialIndexer::new(7).unwrap().resolution(), 7);
    }
}
