use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CsdmError;
use crate::fs_util;
use crate::storage::Dataset;
use crate::timeutil::tai93_to_utc;

const EARTH_RADIUS_KM: f64 = 6371.0088;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewKind {
    /// Longitude/latitude scatter of footprints.
    Footprint,
    /// Along-track distance against height.
    Curtain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewPoint {
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    pub kind: PreviewKind,
    pub x_label: String,
    pub y_label: String,
    pub color_label: Option<String>,
    /// First and last acquisition time, when the dataset carries `TAI_start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired: Option<[DateTime<Utc>; 2]>,
    pub points: Vec<PreviewPoint>,
}

impl Preview {
    /// Builds scatter data from a preview dataset, or `None` when the
    /// dataset lacks the geolocation columns to place points.
    pub fn from_dataset(
        dataset: &Dataset,
        fields: &[String],
        key_columns: &[String],
    ) -> Option<Self> {
        let latitude = dataset.numeric_column("Latitude")?;
        let longitude = dataset.numeric_column("Longitude")?;
        let color_label = fields
            .iter()
            .filter(|field| {
                !key_columns
                    .iter()
                    .any(|key| key.eq_ignore_ascii_case(field))
                    && !field.eq_ignore_ascii_case("Height")
            })
            .find(|field| dataset.column_index(field).is_some())
            .cloned();
        let color = color_label
            .as_deref()
            .and_then(|label| dataset.numeric_column(label))
            .unwrap_or_else(|| vec![None; dataset.len()]);
        let acquired = acquisition_span(dataset);

        match dataset.numeric_column("Height") {
            Some(height) => {
                let mut points = Vec::new();
                let mut distance = 0.0;
                let mut last: Option<(f64, f64)> = None;
                for index in 0..dataset.len() {
                    let (Some(lat), Some(lon)) = (latitude[index], longitude[index]) else {
                        continue;
                    };
                    if let Some((prev_lat, prev_lon)) = last {
                        distance += haversine_km(prev_lat, prev_lon, lat, lon);
                    }
                    last = Some((lat, lon));
                    if let Some(y) = height[index] {
                        points.push(PreviewPoint {
                            x: distance,
                            y,
                            color: color[index],
                        });
                    }
                }
                Some(Self {
                    kind: PreviewKind::Curtain,
                    x_label: "Along-track distance (km)".to_string(),
                    y_label: "Height".to_string(),
                    color_label,
                    acquired,
                    points,
                })
            }
            None => {
                let points = (0..dataset.len())
                    .filter_map(|index| {
                        Some(PreviewPoint {
                            x: longitude[index]?,
                            y: latitude[index]?,
                            color: color[index],
                        })
                    })
                    .collect();
                Some(Self {
                    kind: PreviewKind::Footprint,
                    x_label: "Longitude".to_string(),
                    y_label: "Latitude".to_string(),
                    color_label,
                    acquired,
                    points,
                })
            }
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), CsdmError> {
        fs_util::write_json_atomic(path, self)
    }
}

/// `TAI_start` plus `Profile_time` per row, reduced to its extremes.
///
/// Rows whose time is a fill value or otherwise unrepresentable are skipped.
fn acquisition_span(dataset: &Dataset) -> Option<[DateTime<Utc>; 2]> {
    let starts = dataset.numeric_column("TAI_start")?;
    let offsets = dataset
        .numeric_column("Profile_time")
        .unwrap_or_else(|| vec![Some(0.0); dataset.len()]);
    let times = starts
        .iter()
        .zip(&offsets)
        .filter_map(|(start, offset)| tai93_to_utc((*start)? + offset.unwrap_or(0.0)))
        .collect::<Vec<_>>();
    let first = times.iter().min()?;
    let last = times.iter().max()?;
    Some([*first, *last])
}

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}
