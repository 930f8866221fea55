//! geosplat: georeferencing and 3D Tiles packaging for Gaussian splat scenes.
//!
//! A splat scene trained in an arbitrary local frame is anchored to WGS-84
//! with a similarity transform `R·(s·p) + t` (ENU basis, uniform scale, ECEF
//! origin), transformed splat by splat, handed to an external compact codec
//! and wrapped as a single-tile `tileset.json` + glTF pair.
//!
//! Stages:
//!
//! - [`gps`]: EXIF GPS fixes -> centroid and scene extent
//! - [`transform`]: anchor + scale -> [`SimilarityTransform`]
//! - [`splat`]: per-splat position/orientation/log-scale transform
//! - [`codec`]: boundary to the compact codec
//! - [`tiles`]: bounding volume, tileset and wrapper documents
//!
//! [`pipeline::convert`] chains them.

pub mod codec;
pub mod error;
pub mod geodesy;
pub mod gps;
pub mod pipeline;
pub mod ply;
pub mod splat;
pub mod stats;
pub mod tiles;
pub mod transform;

pub use codec::{encode, CommandCodec, EncodedPayload, Quality, SplatCodec};
pub use error::{GeoSplatError, Result};
pub use geodesy::{ecef_basis, ecef_to_geodetic, geodetic_to_ecef};
pub use gps::{GpsFix, GpsSummary};
pub use pipeline::{convert, ConvertConfig, Stage, StageContext, StageError};
pub use ply::{read_splat_file, write_splat_file};
pub use splat::{apply_transform, SplatLayout, SplatRecord, SplatSet};
pub use tiles::{assemble, PayloadMode, TileAsset, TileOptions};
pub use transform::{
    build_transform, GeoAnchor, ScalePolicy, SimilarityTransform, TransformArtifact,
    TransformBuilder,
};
