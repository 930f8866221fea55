//! Error types for the georeferencing pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur anywhere in the splat georeferencing pipeline.
///
/// Every variant is terminal for the stage that raised it. Callers that need a
/// stable identifier (job status strings, logs) use [`GeoSplatError::kind`].
#[derive(Debug, Error)]
pub enum GeoSplatError {
    /// Geodetic input outside the valid latitude/longitude domain.
    #[error("{name}={value} is outside [{min}, {max}]")]
    Domain {
        /// Which coordinate was rejected.
        name: &'static str,
        /// Offending value.
        value: f64,
        /// Lower bound (inclusive).
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// Anchor could not be turned into a transform.
    #[error("invalid anchor: {0}")]
    InvalidAnchor(String),

    /// Resolved scale is non-positive or non-finite.
    #[error("resolved scale {value} from {source_name} is not a positive finite number")]
    DegenerateScale {
        /// Offending scale.
        value: f64,
        /// Where the scale came from (explicit, extent ratio, ...).
        source_name: &'static str,
    },

    /// None of the inspected images carries location metadata.
    #[error("no GPS data in any of {inspected} images")]
    NoGeoData {
        /// Number of images looked at.
        inspected: usize,
    },

    /// Internal invariant breach: a stage changed the number of splats.
    #[error("record count changed from {expected} to {actual}")]
    RecordCountMismatch {
        /// Count going in.
        expected: usize,
        /// Count coming out.
        actual: usize,
    },

    /// The external compact codec reported failure.
    #[error("codec '{codec}' failed: {diagnostic}")]
    EncodingFailed {
        /// Codec name.
        codec: String,
        /// Diagnostic reported by the codec.
        diagnostic: String,
    },

    /// Encoding was asked for an empty splat set.
    #[error("splat set is empty")]
    EmptyInput,

    /// A bounding volume was requested for an empty splat set.
    #[error("cannot compute a bounding volume for an empty splat set")]
    EmptyBoundingVolume,

    /// A splat file layout does not match the expected record schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Upper-left 3x3 block of a transform is not a scaled rotation.
    #[error("transform is not a similarity: orthonormality error {error:.3e} exceeds {tolerance:.1e}")]
    NonOrthonormalTransform {
        /// Max absolute deviation of Rᵀ·R from I.
        error: f64,
        /// Accepted tolerance.
        tolerance: f64,
    },

    /// Compression quality outside the accepted range.
    #[error("quality {0} is outside 1..=9")]
    InvalidQuality(u8),

    /// Quality text that is not an integer.
    #[error("quality '{0}' is not an integer in 1..=9")]
    QualityNotANumber(String),

    /// A splat value no transform can act on (non-finite, zero rotation).
    #[error("splat {index}: {field} {value} is not usable")]
    InvalidSplat {
        /// Record index within the set.
        index: usize,
        /// Offending attribute.
        field: &'static str,
        /// Offending value as read.
        value: String,
    },

    /// A write-once output is already present.
    #[error("{} already exists; tile outputs are never overwritten", .0.display())]
    OutputExists(PathBuf),

    /// Correspondence set cannot determine a similarity transform.
    #[error("degenerate correspondences: {0}")]
    DegenerateCorrespondences(String),

    /// I/O error on a specific path.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialisation failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// EXIF container could not be parsed.
    #[error("EXIF error: {0}")]
    Exif(#[from] exif::Error),
}

impl GeoSplatError {
    /// Stable error kind name used in single-line diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            GeoSplatError::Domain { .. } => "DomainError",
            GeoSplatError::InvalidAnchor(_) => "InvalidAnchorError",
            GeoSplatError::DegenerateScale { .. } => "DegenerateScaleError",
            GeoSplatError::NoGeoData { .. } => "NoGeoDataError",
            GeoSplatError::RecordCountMismatch { .. } => "RecordCountMismatchError",
            GeoSplatError::EncodingFailed { .. } => "EncodingFailedError",
            GeoSplatError::EmptyInput => "EmptyInputError",
            GeoSplatError::EmptyBoundingVolume => "EmptyBoundingVolumeError",
            GeoSplatError::SchemaMismatch(_) => "SchemaMismatchError",
            GeoSplatError::NonOrthonormalTransform { .. } => "NonOrthonormalTransformError",
            GeoSplatError::InvalidQuality(_) => "InvalidQualityError",
            GeoSplatError::QualityNotANumber(_) => "InvalidQualityError",
            GeoSplatError::InvalidSplat { .. } => "InvalidSplatError",
            GeoSplatError::OutputExists(_) => "OutputExistsError",
            GeoSplatError::DegenerateCorrespondences(_) => "DegenerateCorrespondencesError",
            GeoSplatError::Io { .. } => "IoError",
            GeoSplatError::Json(_) => "JsonError",
            GeoSplatError::Exif(_) => "ExifError",
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GeoSplatError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        GeoSplatError::SchemaMismatch(msg.into())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GeoSplatError>;
