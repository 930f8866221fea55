//! Stage composition: PLY in, georeferenced tile directory out.

use std::fmt;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::codec::{encode, Quality, SplatCodec};
use crate::error::GeoSplatError;
use crate::ply::{read_splat_file, write_splat_file, ScalarType, WriteOptions};
use crate::splat::apply_transform;
use crate::tiles::{assemble_with, TileOptions, TileOutput};
use crate::transform::{BuiltTransform, GeoAnchor, ScalePolicy, TransformArtifact, TransformBuilder};

pub const TRANSFORM_FILE: &str = "transform.json";
pub const GEOREFERENCED_FILE: &str = "georeferenced.ply";

/// Pipeline stage, used to tag diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Loading an input splat file.
    Read,
    Gps,
    Georef,
    Transform,
    Encode,
    Assemble,
    Inspect,
    Rescale,
    Reanchor,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Read => "read",
            Stage::Gps => "gps",
            Stage::Georef => "georef",
            Stage::Transform => "transform",
            Stage::Encode => "encode",
            Stage::Assemble => "assemble",
            Stage::Inspect => "inspect",
            Stage::Rescale => "rescale",
            Stage::Reanchor => "reanchor",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`GeoSplatError`] tagged with the stage that raised it.
///
/// Renders as `<stage>: <Kind>: <detail>`.
#[derive(Debug, Error)]
#[error("{}: {}: {}", .stage, .source.kind(), .source)]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: GeoSplatError,
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}

pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T, StageError>;
}

impl<T> StageContext<T> for crate::Result<T> {
    fn stage(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|source| StageError { stage, source })
    }
}

/// Everything `convert` needs besides the input, output and codec.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub anchor: GeoAnchor,
    /// Local scene extent; measured from the splats when `None` and
    /// `measure_local_extent` is set, otherwise the policy's assumed value.
    pub local_extent: Option<f64>,
    pub measure_local_extent: bool,
    /// Real-world extent in metres, e.g. from a GPS summary.
    pub real_extent: Option<f64>,
    pub policy: ScalePolicy,
    /// Reject input files whose colour arity differs.
    pub expected_color_coeffs: Option<usize>,
    pub quality: Quality,
    pub tile: TileOptions,
    /// Also persist the ECEF splat set next to the tile.
    pub write_georeferenced: bool,
}

impl ConvertConfig {
    pub fn new(anchor: GeoAnchor) -> Self {
        Self {
            anchor,
            local_extent: None,
            measure_local_extent: false,
            real_extent: None,
            policy: ScalePolicy::default(),
            expected_color_coeffs: None,
            quality: Quality::default(),
            tile: TileOptions::default(),
            write_georeferenced: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertReport {
    pub built: BuiltTransform,
    pub splat_count: usize,
    pub encoded_byte_length: u64,
    pub output: TileOutput,
    pub transform_artifact: PathBuf,
    pub georeferenced: Option<PathBuf>,
}

/// Local extent for scale resolution: explicit, else measured, else the
/// policy's assumed extent when a real extent needs something to divide by.
pub fn resolve_local_extent(
    explicit: Option<f64>,
    measured: Option<f64>,
    have_real_extent: bool,
    policy: &ScalePolicy,
) -> Option<f64> {
    if explicit.is_some() {
        return explicit;
    }
    if let Some(e) = measured {
        info!("Measured local extent {e:.4}");
        return Some(e);
    }
    if have_real_extent {
        warn!(
            "Assuming local extent {} (normalised training output)",
            policy.assumed_local_extent
        );
        return Some(policy.assumed_local_extent);
    }
    None
}

/// Run every stage from a splat PLY to a tile directory.
///
/// The payload carries the scene-frame splats; the root transform places
/// them, and the bounding volume is measured on the transformed splats.
pub fn convert<C: SplatCodec + ?Sized>(
    input: &Path,
    out_dir: &Path,
    cfg: &ConvertConfig,
    codec: &C,
) -> Result<ConvertReport, StageError> {
    let set = read_splat_file(input, cfg.expected_color_coeffs).stage(Stage::Read)?;
    info!("Loaded {} splats from {}", set.len(), input.display());

    let measured = if cfg.measure_local_extent {
        set.extent()
    } else {
        None
    };
    let local_extent = resolve_local_extent(
        cfg.local_extent,
        measured,
        cfg.real_extent.is_some(),
        &cfg.policy,
    );

    let built = TransformBuilder::new(cfg.policy)
        .build(&cfg.anchor, local_extent, cfg.real_extent)
        .stage(Stage::Georef)?;
    let t = built.transform;

    std::fs::create_dir_all(out_dir)
        .map_err(|e| GeoSplatError::io(out_dir, e))
        .stage(Stage::Assemble)?;

    let transform_artifact = out_dir.join(TRANSFORM_FILE);
    TransformArtifact::new(&t, built.scale_source, Some(&cfg.anchor))
        .write_json(&transform_artifact)
        .stage(Stage::Georef)?;

    let transformed = apply_transform(&set, &t).stage(Stage::Transform)?;

    let georeferenced = if cfg.write_georeferenced {
        let path = out_dir.join(GEOREFERENCED_FILE);
        write_splat_file(
            &path,
            &transformed,
            WriteOptions {
                position_type: ScalarType::F64,
            },
        )
        .stage(Stage::Transform)?;
        Some(path)
    } else {
        None
    };

    let payload = encode(&set, cfg.quality, codec).stage(Stage::Encode)?;
    let encoded_byte_length = payload.encoded_byte_length;

    let tile = assemble_with(&transformed, payload, &t, &cfg.tile).stage(Stage::Assemble)?;
    let output = tile
        .write_dir(out_dir, cfg.tile.payload_mode)
        .stage(Stage::Assemble)?;

    Ok(ConvertReport {
        built,
        splat_count: set.len(),
        encoded_byte_length,
        output,
        transform_artifact,
        georeferenced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_is_stage_kind_detail() {
        let err = StageError {
            stage: Stage::Georef,
            source: GeoSplatError::DegenerateScale {
                value: 0.0,
                source_name: "extentRatio",
            },
        };
        let line = err.to_string();
        assert!(line.starts_with("georef: DegenerateScaleError: "), "{line}");
        assert!(line.contains("extentRatio"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_local_extent_precedence() {
        let policy = ScalePolicy::default();
        assert_eq!(resolve_local_extent(Some(3.0), Some(5.0), true, &policy), Some(3.0));
        assert_eq!(resolve_local_extent(None, Some(5.0), true, &policy), Some(5.0));
        assert_eq!(resolve_local_extent(None, None, true, &policy), Some(2.0));
        assert_eq!(resolve_local_extent(None, None, false, &policy), None);
    }

    #[test]
    fn test_stage_context() {
        let r: crate::Result<()> = Err(GeoSplatError::EmptyBoundingVolume);
        let err = r.stage(Stage::Assemble).unwrap_err();
        assert_eq!(err.stage, Stage::Assemble);
        assert_eq!(err.kind(), "EmptyBoundingVolumeError");
    }
}
