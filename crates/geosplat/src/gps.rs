//! Per-image GPS extraction and scene summary.
//!
//! Fixes come from EXIF `GPSLatitude/Ref`, `GPSLongitude/Ref` and the optional
//! `GPSAltitude/Ref`. Images without a usable fix are counted, never fatal;
//! a summary with zero fixes is [`GeoSplatError::NoGeoData`].

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use exif::{In, Reader, Tag, Value};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{GeoSplatError, Result};
use crate::geodesy::{check_lat_lon, haversine_m};
use crate::transform::AnchorInput;

/// Default image extensions, matched case-insensitively.
pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg"];

/// One image's location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

impl GpsFix {
    pub fn new(lat: f64, lon: f64, alt: Option<f64>) -> Self {
        Self { lat, lon, alt }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFix {
    pub filename: String,
    #[serde(flatten)]
    pub fix: GpsFix,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub lat: f64,
    pub lon: f64,
    /// Mean altitude, 0 when no image carries one.
    pub alt: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    /// West edge. Greater than `max_lon` when the images straddle the
    /// antimeridian.
    pub min_lon: f64,
    pub max_lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_alt: Option<f64>,
}

/// Aggregate over a set of images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsSummary {
    pub centroid: Centroid,
    /// Largest pairwise great-circle-plus-altitude distance. A heuristic
    /// scene diameter, not an exact bound.
    pub extent_meters: f64,
    pub with_gps: usize,
    pub without_gps: usize,
    pub altitude_available: bool,
    pub bounds: GpsBounds,
    pub images: Vec<ImageFix>,
    #[serde(default)]
    pub images_without_gps: Vec<String>,
}

impl GpsSummary {
    /// Anchor input at the centroid with no scale decided yet.
    pub fn anchor_input(&self) -> AnchorInput {
        AnchorInput {
            latitude: self.centroid.lat,
            longitude: self.centroid.lon,
            height: self.centroid.alt,
            scale: None,
            height_offset: None,
        }
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| GeoSplatError::io(path, e))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn read_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GeoSplatError::io(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Distance between two fixes; altitude contributes only when both have one.
fn fix_distance(a: &GpsFix, b: &GpsFix) -> f64 {
    let ground = haversine_m(a.lat, a.lon, b.lat, b.lon);
    let d_alt = match (a.alt, b.alt) {
        (Some(x), Some(y)) => x - y,
        _ => 0.0,
    };
    ground.hypot(d_alt)
}

fn max_pairwise_distance(fixes: &[GpsFix]) -> f64 {
    (0..fixes.len())
        .into_par_iter()
        .map(|i| {
            fixes[i + 1..]
                .iter()
                .map(|b| fix_distance(&fixes[i], b))
                .fold(0.0, f64::max)
        })
        .reduce(|| 0.0, f64::max)
}

/// Fold degrees into [-180, 180).
fn wrap_lon(deg: f64) -> f64 {
    let w = (deg + 180.0).rem_euclid(360.0) - 180.0;
    if w >= 180.0 {
        w - 360.0
    } else {
        w
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

/// Aggregate `(image id, optional fix)` pairs.
pub fn summarize<I>(images: I) -> Result<GpsSummary>
where
    I: IntoIterator<Item = (String, Option<GpsFix>)>,
{
    let mut located = Vec::new();
    let mut missing = Vec::new();

    for (name, fix) in images {
        match fix {
            Some(fix) => located.push(ImageFix {
                filename: name,
                fix,
            }),
            None => missing.push(name),
        }
    }

    if located.is_empty() {
        return Err(GeoSplatError::NoGeoData {
            inspected: missing.len(),
        });
    }

    let fixes: Vec<GpsFix> = located.iter().map(|i| i.fix).collect();
    let n = fixes.len() as f64;

    // Longitudes are unwrapped around the first fix so a cluster straddling
    // the antimeridian averages to its own side of the globe.
    let lon0 = fixes[0].lon;
    let unwrapped: Vec<f64> = fixes.iter().map(|f| lon0 + wrap_lon(f.lon - lon0)).collect();

    let lat = fixes.iter().map(|f| f.lat).sum::<f64>() / n;
    let lon = wrap_lon(unwrapped.iter().sum::<f64>() / n);
    let alts: Vec<f64> = fixes.iter().filter_map(|f| f.alt).collect();

    let alt = if alts.is_empty() {
        warn!("No image carries altitude, centroid height defaults to 0 m");
        0.0
    } else {
        alts.iter().sum::<f64>() / alts.len() as f64
    };

    let (min_lat, max_lat) = min_max(fixes.iter().map(|f| f.lat));
    let (min_lon, max_lon) = min_max(unwrapped.iter().copied());
    let (min_lon, max_lon) = (wrap_lon(min_lon), wrap_lon(max_lon));
    let (min_alt, max_alt) = if alts.is_empty() {
        (None, None)
    } else {
        let (lo, hi) = min_max(alts.iter().copied());
        (Some(lo), Some(hi))
    };

    let extent_meters = max_pairwise_distance(&fixes);

    info!(
        "GPS: {} located, {} without GPS, centroid ({lat:.6}, {lon:.6}, {alt:.2} m), extent {extent_meters:.2} m",
        located.len(),
        missing.len()
    );

    Ok(GpsSummary {
        centroid: Centroid { lat, lon, alt },
        extent_meters,
        with_gps: located.len(),
        without_gps: missing.len(),
        altitude_available: !alts.is_empty(),
        bounds: GpsBounds {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
            min_alt,
            max_alt,
        },
        images: located,
        images_without_gps: missing,
    })
}

// ───── EXIF ─────

/// Degrees + minutes/60 + seconds/3600.
fn dms_to_degrees(value: &Value) -> Option<f64> {
    match value {
        Value::Rational(v) if v.len() >= 3 => {
            Some(v[0].to_f64() + v[1].to_f64() / 60.0 + v[2].to_f64() / 3600.0)
        }
        _ => None,
    }
}

fn ascii_ref(value: &Value) -> Option<u8> {
    match value {
        Value::Ascii(v) => v.first().and_then(|s| s.first()).copied(),
        _ => None,
    }
}

/// Read a GPS fix from an image. `Ok(None)` when the image has EXIF but no
/// complete latitude/longitude pair.
pub fn read_gps<P: AsRef<Path>>(path: P) -> Result<Option<GpsFix>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| GeoSplatError::io(path, e))?;
    let exif = match Reader::new().read_from_container(&mut BufReader::new(file)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let field = |tag| exif.get_field(tag, In::PRIMARY).map(|f| &f.value);

    let (Some(lat), Some(lat_ref), Some(lon), Some(lon_ref)) = (
        field(Tag::GPSLatitude).and_then(dms_to_degrees),
        field(Tag::GPSLatitudeRef).and_then(ascii_ref),
        field(Tag::GPSLongitude).and_then(dms_to_degrees),
        field(Tag::GPSLongitudeRef).and_then(ascii_ref),
    ) else {
        return Ok(None);
    };

    let lat = if lat_ref == b'S' { -lat } else { lat };
    let lon = if lon_ref == b'W' { -lon } else { lon };

    let alt = match field(Tag::GPSAltitude) {
        Some(Value::Rational(v)) if !v.is_empty() => {
            let below = matches!(field(Tag::GPSAltitudeRef), Some(Value::Byte(b)) if b.first() == Some(&1));
            let a = v[0].to_f64();
            Some(if below { -a } else { a })
        }
        _ => None,
    };

    if check_lat_lon(lat, lon).is_err() {
        warn!("{}: GPS fix ({lat}, {lon}) out of range, ignored", path.display());
        return Ok(None);
    }

    Ok(Some(GpsFix { lat, lon, alt }))
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.trim_start_matches('.').eq_ignore_ascii_case(e)))
}

/// Image files directly inside `dir`, sorted by name.
pub fn list_images<P: AsRef<Path>>(dir: P, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            GeoSplatError::io(path, e.into())
        })?;
        if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

/// Scan a directory and summarise the GPS fixes of its images.
///
/// Images whose metadata cannot be read are logged and counted as lacking GPS.
pub fn scan_directory<P: AsRef<Path>>(dir: P, extensions: &[&str]) -> Result<GpsSummary> {
    let dir = dir.as_ref();
    let files = list_images(dir, extensions)?;
    info!("Found {} images in {}", files.len(), dir.display());

    let fixes: Vec<(String, Option<GpsFix>)> = files
        .par_iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let fix = match read_gps(path) {
                Ok(fix) => fix,
                Err(e) => {
                    warn!("Could not read GPS from {}: {e}", path.display());
                    None
                }
            };
            if fix.is_none() {
                debug!("{name}: no GPS");
            }
            (name, fix)
        })
        .collect();

    summarize(fixes)
}
