//! Splat scale inspection.
//!
//! Splats that render as single points usually mean the log-scales are far
//! too small relative to the scene; these statistics make that visible.

use std::fmt;

use serde::Serialize;

use crate::error::{GeoSplatError, Result};
use crate::splat::{SplatRecord, SplatSet};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AxisStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation.
    pub std: f64,
}

impl AxisStats {
    fn from_values(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);

        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            values[n / 2]
        } else {
            0.5 * (values[n / 2 - 1] + values[n / 2])
        };

        Some(Self {
            min: values[0],
            max: values[n - 1],
            mean,
            median,
            std: var.sqrt(),
        })
    }
}

/// Statistics of `map(log_scale[k])` for each axis `k`.
fn per_axis(records: &[SplatRecord], map: impl Fn(f64) -> f64) -> Option<[AxisStats; 3]> {
    let axis = |k: usize| {
        AxisStats::from_values(records.iter().map(|r| map(r.log_scale[k] as f64)).collect())
    };
    Some([axis(0)?, axis(1)?, axis(2)?])
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplatStats {
    pub count: usize,
    pub color_coeffs: usize,
    pub position_min: [f64; 3],
    pub position_max: [f64; 3],
    /// Per-axis `max - min` of the centres.
    pub position_extent: [f64; 3],
    pub log_scale: [AxisStats; 3],
    /// `exp(log_scale)` per axis.
    pub linear_scale: [AxisStats; 3],
    pub opacity: AxisStats,
    /// Mean linear scale over all axes divided by the largest extent;
    /// `None` for a zero-extent scene.
    pub relative_scale: Option<f64>,
}

impl SplatStats {
    pub fn compute(set: &SplatSet) -> Result<Self> {
        let bounds = set.bounds().ok_or(GeoSplatError::EmptyInput)?;
        let records = set.records();

        let log_scale = per_axis(records, |v| v).ok_or(GeoSplatError::EmptyInput)?;
        let linear_scale = per_axis(records, f64::exp).ok_or(GeoSplatError::EmptyInput)?;
        let opacity = AxisStats::from_values(records.iter().map(|r| r.opacity as f64).collect())
            .ok_or(GeoSplatError::EmptyInput)?;

        let extent = bounds.max - bounds.min;
        let scene_size = extent.max();
        let mean_linear = linear_scale.iter().map(|s| s.mean).sum::<f64>() / 3.0;

        Ok(Self {
            count: set.len(),
            color_coeffs: set.layout().color_coeffs,
            position_min: bounds.min.into(),
            position_max: bounds.max.into(),
            position_extent: extent.into(),
            log_scale,
            linear_scale,
            opacity,
            relative_scale: (scene_size > 0.0).then(|| mean_linear / scene_size),
        })
    }
}

impl fmt::Display for SplatStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "splats:           {}", self.count)?;
        writeln!(f, "colour coeffs:    {}", self.color_coeffs)?;
        writeln!(
            f,
            "position extent:  [{:.4}, {:.4}, {:.4}]",
            self.position_extent[0], self.position_extent[1], self.position_extent[2]
        )?;
        for (k, (l, s)) in self.log_scale.iter().zip(&self.linear_scale).enumerate() {
            writeln!(
                f,
                "scale_{k}: log [{:.3}, {:.3}] mean {:.3} median {:.3} std {:.3} | linear mean {:.6}",
                l.min, l.max, l.mean, l.median, l.std, s.mean
            )?;
        }
        writeln!(
            f,
            "opacity:          [{:.3}, {:.3}] mean {:.3}",
            self.opacity.min, self.opacity.max, self.opacity.mean
        )?;
        match self.relative_scale {
            Some(r) => write!(f, "relative scale:   {r:.6} of scene size"),
            None => write!(f, "relative scale:   n/a (zero extent)"),
        }
    }
}
