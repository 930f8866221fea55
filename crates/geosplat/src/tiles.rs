//! Single-tile 3D Tiles container around a compact splat payload.
//!
//! Output directory layout:
//!
//! ```text
//! tileset.json   root tile: box, geometricError, refine REPLACE, transform, content
//! tile_0.gltf    one POINTS primitive whose only content is the compact payload
//! tile_0.spz     the payload itself (external mode only)
//! ```
//!
//! The payload holds scene-frame splats and the root `transform` places them
//! in ECEF. The bounding box is measured on the transformed splats and
//! expressed in the tile frame, so the renderer's `transform` maps it back
//! onto exactly that world-space box.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::codec::EncodedPayload;
use crate::error::{GeoSplatError, Result};
use crate::splat::{Bounds, SplatSet};
use crate::geodesy::ecef_to_geodetic;
use crate::transform::{build_transform, GeoAnchor, SimilarityTransform};

pub const TILESET_FILE: &str = "tileset.json";
pub const CONTENT_FILE: &str = "tile_0.gltf";
pub const PAYLOAD_FILE: &str = "tile_0.spz";

pub const EXT_GAUSSIAN_SPLATTING: &str = "KHR_gaussian_splatting";
pub const EXT_SPZ_COMPRESSION: &str = "KHR_gaussian_splatting_compression_spz_2";

const GLTF_POINTS: u32 = 0;

/// Where the compact payload lives relative to the wrapper document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadMode {
    /// Sibling `tile_0.spz` referenced by relative URI.
    #[default]
    External,
    /// Base64 data URI inside `tile_0.gltf`.
    Embedded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileOptions {
    pub geometric_error: f64,
    /// World-space margin added on every side of the box, metres.
    pub box_epsilon: f64,
    pub payload_mode: PayloadMode,
}

impl Default for TileOptions {
    fn default() -> Self {
        Self {
            geometric_error: 100.0,
            box_epsilon: 1e-3,
            payload_mode: PayloadMode::External,
        }
    }
}

/// Oriented box: centre plus three half-axis vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedBox {
    pub center: Vector3<f64>,
    pub half_axes: [Vector3<f64>; 3],
}

impl OrientedBox {
    /// 3D Tiles `boundingVolume.box` order.
    pub fn to_array(&self) -> [f64; 12] {
        let mut out = [0.0; 12];
        out[..3].copy_from_slice(self.center.as_slice());
        for (i, axis) in self.half_axes.iter().enumerate() {
            out[3 + i * 3..6 + i * 3].copy_from_slice(axis.as_slice());
        }
        out
    }

    /// Express a world-space AABB in the frame that `t` maps into world space.
    fn from_world_bounds(bounds: &Bounds, t: &SimilarityTransform) -> Self {
        let inv = t.inverse();
        let h = bounds.half_extents();
        OrientedBox {
            center: inv.apply_point(&bounds.center()),
            half_axes: [
                inv.apply_vector(&Vector3::new(h.x, 0.0, 0.0)),
                inv.apply_vector(&Vector3::new(0.0, h.y, 0.0)),
                inv.apply_vector(&Vector3::new(0.0, 0.0, h.z)),
            ],
        }
    }
}

/// An assembled single-tile asset, ready to be written out.
#[derive(Debug, Clone)]
pub struct TileAsset {
    /// Tile-frame box for `boundingVolume.box`.
    pub bounding_volume: OrientedBox,
    /// World-space AABB of the transformed splats, epsilon included.
    pub world_bounds: Bounds,
    pub geometric_error: f64,
    pub content: EncodedPayload,
    pub transform: SimilarityTransform,
    pub splat_count: usize,
}

/// [`assemble_with`] using the default box epsilon.
pub fn assemble(
    transformed: &SplatSet,
    encoded: EncodedPayload,
    t: &SimilarityTransform,
    geometric_error: f64,
) -> Result<TileAsset> {
    let opts = TileOptions {
        geometric_error,
        ..TileOptions::default()
    };
    assemble_with(transformed, encoded, t, &opts)
}

pub fn assemble_with(
    transformed: &SplatSet,
    encoded: EncodedPayload,
    t: &SimilarityTransform,
    opts: &TileOptions,
) -> Result<TileAsset> {
    let bounds = transformed
        .bounds()
        .ok_or(GeoSplatError::EmptyBoundingVolume)?
        .expanded(opts.box_epsilon);

    if !(opts.geometric_error.is_finite() && opts.geometric_error >= 0.0) {
        return Err(GeoSplatError::Domain {
            name: "geometricError",
            value: opts.geometric_error,
            min: 0.0,
            max: f64::MAX,
        });
    }

    let bounding_volume = OrientedBox::from_world_bounds(&bounds, t);
    debug!(
        "World box min {:?} max {:?}, tile-frame centre {:?}",
        bounds.min.as_slice(),
        bounds.max.as_slice(),
        bounding_volume.center.as_slice()
    );

    Ok(TileAsset {
        bounding_volume,
        world_bounds: bounds,
        geometric_error: opts.geometric_error,
        content: encoded,
        transform: *t,
        splat_count: transformed.len(),
    })
}

// ───── tileset.json ─────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilesetAssetInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gltf_up_axis: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Refine {
    Replace,
    Add,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingVolume {
    #[serde(rename = "box")]
    pub box_: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileContent {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootTile {
    pub bounding_volume: BoundingVolume,
    pub geometric_error: f64,
    pub refine: Refine,
    pub transform: Vec<f64>,
    pub content: TileContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tileset {
    pub asset: TilesetAssetInfo,
    pub geometric_error: f64,
    pub root: RootTile,
}

impl Tileset {
    pub fn read_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GeoSplatError::io(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

// ───── tile_0.gltf ─────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GltfAsset {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpzCompression {
    pub buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplatCompressionExtensions {
    #[serde(rename = "KHR_gaussian_splatting_compression_spz_2")]
    pub spz: SpzCompression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianSplatting {
    pub extensions: SplatCompressionExtensions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveExtensions {
    #[serde(rename = "KHR_gaussian_splatting")]
    pub gaussian_splatting: GaussianSplatting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Primitive {
    pub mode: u32,
    pub extensions: PrimitiveExtensions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub primitives: Vec<Primitive>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub mesh: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub nodes: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffer {
    pub byte_length: u64,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gltf {
    pub asset: GltfAsset,
    pub extensions_used: Vec<String>,
    pub extensions_required: Vec<String>,
    pub scene: usize,
    pub scenes: Vec<Scene>,
    pub nodes: Vec<Node>,
    pub meshes: Vec<Mesh>,
    pub buffers: Vec<Buffer>,
}

impl Gltf {
    pub fn read_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GeoSplatError::io(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Payload bytes for an embedded buffer, `None` for an external URI.
    pub fn embedded_payload(&self) -> Result<Option<Vec<u8>>> {
        let Some(buffer) = self.buffers.first() else {
            return Err(GeoSplatError::schema("wrapper has no buffers"));
        };
        let Some((_, data)) = buffer.uri.split_once(";base64,") else {
            return Ok(None);
        };
        STANDARD
            .decode(data)
            .map(Some)
            .map_err(|e| GeoSplatError::schema(format!("bad base64 payload: {e}")))
    }
}

/// Paths written by [`TileAsset::write_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileOutput {
    pub tileset: PathBuf,
    pub content: PathBuf,
    pub payload: Option<PathBuf>,
}

impl TileAsset {
    pub fn tileset(&self) -> Tileset {
        Tileset {
            asset: TilesetAssetInfo {
                version: "1.1".into(),
                gltf_up_axis: Some("Z".into()),
            },
            geometric_error: self.geometric_error,
            root: RootTile {
                bounding_volume: BoundingVolume {
                    box_: self.bounding_volume.to_array().to_vec(),
                },
                geometric_error: self.geometric_error,
                refine: Refine::Replace,
                transform: self.transform.to_column_major().to_vec(),
                content: TileContent {
                    uri: CONTENT_FILE.into(),
                },
            },
        }
    }

    pub fn gltf(&self, mode: PayloadMode) -> Gltf {
        let extensions = vec![
            EXT_GAUSSIAN_SPLATTING.to_string(),
            EXT_SPZ_COMPRESSION.to_string(),
        ];

        let uri = match mode {
            PayloadMode::External => PAYLOAD_FILE.to_string(),
            PayloadMode::Embedded => format!(
                "data:application/octet-stream;base64,{}",
                STANDARD.encode(&self.content.buffer)
            ),
        };

        Gltf {
            asset: GltfAsset {
                version: "2.0".into(),
                generator: Some(concat!("geosplat ", env!("CARGO_PKG_VERSION")).into()),
            },
            extensions_used: extensions.clone(),
            extensions_required: extensions,
            scene: 0,
            scenes: vec![Scene { nodes: vec![0] }],
            nodes: vec![Node { mesh: 0 }],
            meshes: vec![Mesh {
                primitives: vec![Primitive {
                    mode: GLTF_POINTS,
                    extensions: PrimitiveExtensions {
                        gaussian_splatting: GaussianSplatting {
                            extensions: SplatCompressionExtensions {
                                spz: SpzCompression { buffer: 0 },
                            },
                        },
                    },
                }],
            }],
            buffers: vec![Buffer {
                byte_length: self.content.encoded_byte_length,
                uri,
            }],
        }
    }

    /// Write the tile directory, creating it if needed.
    pub fn write_dir<P: AsRef<Path>>(&self, dir: P, mode: PayloadMode) -> Result<TileOutput> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| GeoSplatError::io(dir, e))?;

        let payload = match mode {
            PayloadMode::External => {
                let path = dir.join(PAYLOAD_FILE);
                fs::write(&path, &self.content.buffer).map_err(|e| GeoSplatError::io(&path, e))?;
                Some(path)
            }
            PayloadMode::Embedded => None,
        };

        let content = dir.join(CONTENT_FILE);
        write_pretty(&content, &self.gltf(mode))?;

        let tileset = dir.join(TILESET_FILE);
        write_pretty(&tileset, &self.tileset())?;

        info!(
            "Wrote {} ({} splats, {} payload bytes, {:?})",
            tileset.display(),
            self.splat_count,
            self.content.encoded_byte_length,
            mode
        );

        Ok(TileOutput {
            tileset,
            content,
            payload,
        })
    }
}

fn write_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).map_err(|e| GeoSplatError::io(path, e))?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

/// Copy a tile directory into `out_dir` with the root transform replaced by
/// `retarget(current)`. Returns `(current, replacement)`.
///
/// The source is never touched: tile outputs are write-once, so `out_dir`
/// must not already hold a tileset. The wrapper and any external payload it
/// references are copied alongside; every other tileset field is kept as-is.
fn derive_tileset<F>(
    tileset: &Path,
    out_dir: &Path,
    retarget: F,
) -> Result<(SimilarityTransform, SimilarityTransform)>
where
    F: FnOnce(&SimilarityTransform) -> Result<SimilarityTransform>,
{
    let target = out_dir.join(TILESET_FILE);
    if target.exists() {
        return Err(GeoSplatError::OutputExists(target));
    }

    let text = fs::read_to_string(tileset).map_err(|e| GeoSplatError::io(tileset, e))?;
    let mut doc: serde_json::Value = serde_json::from_str(&text)?;

    let slot = doc
        .get_mut("root")
        .and_then(|root| root.get_mut("transform"))
        .ok_or_else(|| GeoSplatError::schema("tileset root has no transform"))?;
    let values: Vec<f64> = serde_json::from_value(slot.clone())?;
    let current = SimilarityTransform::from_column_major(&values)?;
    let replacement = retarget(&current)?;
    *slot = serde_json::to_value(replacement.to_column_major().to_vec())?;

    let src_dir = tileset.parent().unwrap_or_else(|| Path::new("."));
    let mut companions = Vec::new();
    if let Some(uri) = doc.pointer("/root/content/uri").and_then(|u| u.as_str()) {
        let wrapper = src_dir.join(relative_uri(uri)?);
        let text = fs::read_to_string(&wrapper).map_err(|e| GeoSplatError::io(&wrapper, e))?;
        let gltf: serde_json::Value = serde_json::from_str(&text)?;
        for buffer in gltf["buffers"].as_array().into_iter().flatten() {
            match buffer["uri"].as_str() {
                Some(b) if !b.starts_with("data:") => companions.push(relative_uri(b)?.to_path_buf()),
                _ => {}
            }
        }
        companions.push(relative_uri(uri)?.to_path_buf());
    }

    fs::create_dir_all(out_dir).map_err(|e| GeoSplatError::io(out_dir, e))?;
    for rel in &companions {
        let (from, to) = (src_dir.join(rel), out_dir.join(rel));
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|e| GeoSplatError::io(parent, e))?;
        }
        fs::copy(&from, &to).map_err(|e| GeoSplatError::io(&from, e))?;
        debug!("Copied {} -> {}", from.display(), to.display());
    }

    write_pretty(&target, &doc)?;
    Ok((current, replacement))
}

/// Tile content URIs must stay inside the tile directory.
fn relative_uri(uri: &str) -> Result<&Path> {
    let path = Path::new(uri);
    let escapes = path
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir));
    if escapes {
        return Err(GeoSplatError::schema(format!(
            "content uri '{uri}' leaves the tile directory"
        )));
    }
    Ok(path)
}

/// Write a copy of a tile directory whose root transform carries
/// `new_scale`, keeping rotation and translation. Returns the previous scale.
///
/// The box lives in the tile frame and scales with the transform.
pub fn rescale_tileset<P: AsRef<Path>, Q: AsRef<Path>>(
    tileset: P,
    out_dir: Q,
    new_scale: f64,
) -> Result<f64> {
    let (tileset, out_dir) = (tileset.as_ref(), out_dir.as_ref());
    let (current, rescaled) = derive_tileset(tileset, out_dir, |t| t.with_scale(new_scale))?;

    info!(
        "Rescaled {} from {} to {} -> {}",
        tileset.display(),
        current.scale(),
        rescaled.scale(),
        out_dir.display()
    );
    Ok(current.scale())
}

/// Write a copy of a tile directory placed at a new anchor. The anchor's
/// scale wins; without one the current scale is kept. Returns the new
/// transform.
pub fn reanchor_tileset<P: AsRef<Path>, Q: AsRef<Path>>(
    tileset: P,
    out_dir: Q,
    anchor: &GeoAnchor,
) -> Result<SimilarityTransform> {
    let (tileset, out_dir) = (tileset.as_ref(), out_dir.as_ref());
    let (current, placed) = derive_tileset(tileset, out_dir, |t| {
        let anchor = anchor.with_scale(anchor.scale().unwrap_or(t.scale()));
        build_transform(&anchor, None, None)
    })?;

    let (lat, lon, h) = {
        let o = current.translation();
        ecef_to_geodetic(o.x, o.y, o.z)
    };
    info!(
        "Re-anchored {} from ({lat:.6}, {lon:.6}, {h:.2} m) to ({:.6}, {:.6}, {:.2} m), scale {}; wrote {}",
        tileset.display(),
        anchor.latitude_deg(),
        anchor.longitude_deg(),
        anchor.height_m(),
        placed.scale(),
        out_dir.display()
    );
    Ok(placed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::tests::sample_set;
    use crate::splat::{apply_transform, SplatLayout};
    use crate::transform::{build_transform, GeoAnchor};
    use approx::assert_relative_eq;

    fn payload() -> EncodedPayload {
        EncodedPayload {
            buffer: b"SPZ\x02opaque".to_vec(),
            original_byte_length: 368,
            encoded_byte_length: 10,
        }
    }

    fn anchored() -> SimilarityTransform {
        let anchor = GeoAnchor::new(37.7694, -122.4862, 10.0)
            .unwrap()
            .with_scale(11.5);
        build_transform(&anchor, None, None).unwrap()
    }

    #[test]
    fn test_empty_set_has_no_bounding_volume() {
        let empty = SplatSet::empty(SplatLayout::new(3));
        assert!(matches!(
            assemble(&empty, payload(), &anchored(), 100.0),
            Err(GeoSplatError::EmptyBoundingVolume)
        ));
    }

    #[test]
    fn test_identity_box_is_the_epsilon_expanded_aabb() {
        let set = sample_set();
        let tile = assemble(&set, payload(), &SimilarityTransform::identity(), 50.0).unwrap();
        let b = tile.bounding_volume.to_array();

        // x in [-0.8, 1.0], y in [-0.5, 0.9], z in [-0.3, 1.1]
        assert_relative_eq!(b[0], 0.1, epsilon = 1e-12);
        assert_relative_eq!(b[1], 0.2, epsilon = 1e-12);
        assert_relative_eq!(b[2], 0.4, epsilon = 1e-12);
        assert_relative_eq!(b[3], 0.9 + 1e-3, epsilon = 1e-12);
        assert_relative_eq!(b[7], 0.7 + 1e-3, epsilon = 1e-12);
        assert_relative_eq!(b[11], 0.7 + 1e-3, epsilon = 1e-12);
        for i in [4, 5, 6, 8, 9, 10] {
            assert_eq!(b[i], 0.0);
        }
    }

    #[test]
    fn test_box_maps_onto_the_transformed_extrema() {
        let t = anchored();
        let transformed = apply_transform(&sample_set(), &t).unwrap();
        let tile = assemble(&transformed, payload(), &t, 100.0).unwrap();

        let world = transformed.bounds().unwrap();
        let bv = tile.bounding_volume;
        assert_relative_eq!(t.apply_point(&bv.center), world.center(), epsilon = 1e-6);

        let h = world.half_extents().add_scalar(1e-3);
        assert_relative_eq!(t.apply_vector(&bv.half_axes[0]), Vector3::new(h.x, 0.0, 0.0), epsilon = 1e-6);
        assert_relative_eq!(t.apply_vector(&bv.half_axes[1]), Vector3::new(0.0, h.y, 0.0), epsilon = 1e-6);
        assert_relative_eq!(t.apply_vector(&bv.half_axes[2]), Vector3::new(0.0, 0.0, h.z), epsilon = 1e-6);

        // Every transformed splat lies inside the world box.
        for r in transformed.records() {
            let p = r.position;
            assert!((0..3).all(|i| p[i] >= tile.world_bounds.min[i] && p[i] <= tile.world_bounds.max[i]));
        }
    }

    #[test]
    fn test_tileset_document() {
        let t = anchored();
        let transformed = apply_transform(&sample_set(), &t).unwrap();
        let tile = assemble(&transformed, payload(), &t, 100.0).unwrap();

        let json = serde_json::to_value(tile.tileset()).unwrap();
        assert_eq!(json["asset"]["version"], "1.1");
        assert_eq!(json["asset"]["gltfUpAxis"], "Z");
        assert_eq!(json["root"]["refine"], "REPLACE");
        assert_eq!(json["root"]["geometricError"], 100.0);
        assert_eq!(json["root"]["content"]["uri"], "tile_0.gltf");
        assert_eq!(json["root"]["boundingVolume"]["box"].as_array().unwrap().len(), 12);

        let m: Vec<f64> = serde_json::from_value(json["root"]["transform"].clone()).unwrap();
        assert_eq!(m, t.to_column_major().to_vec());
        assert_eq!(&m[12..15], t.translation().as_slice());
    }

    #[test]
    fn test_wrapper_declares_both_extensions_and_no_indices() {
        let tile = assemble(&sample_set(), payload(), &SimilarityTransform::identity(), 1.0).unwrap();
        let json = serde_json::to_value(tile.gltf(PayloadMode::External)).unwrap();

        let expected = serde_json::json!([EXT_GAUSSIAN_SPLATTING, EXT_SPZ_COMPRESSION]);
        assert_eq!(json["extensionsUsed"], expected);
        assert_eq!(json["extensionsRequired"], expected);

        let prim = &json["meshes"][0]["primitives"][0];
        assert_eq!(prim["mode"], 0);
        assert!(prim.get("indices").is_none());
        assert_eq!(
            prim["extensions"][EXT_GAUSSIAN_SPLATTING]["extensions"][EXT_SPZ_COMPRESSION]["buffer"],
            0
        );
        assert_eq!(json["buffers"][0]["uri"], "tile_0.spz");
        assert_eq!(json["buffers"][0]["byteLength"], 10);
    }

    #[test]
    fn test_write_external_and_embedded() {
        let tile = assemble(&sample_set(), payload(), &anchored(), 100.0).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let ext = tile.write_dir(dir.path().join("ext"), PayloadMode::External).unwrap();
        assert_eq!(fs::read(ext.payload.unwrap()).unwrap(), payload().buffer);
        assert_eq!(Gltf::read_json(&ext.content).unwrap().embedded_payload().unwrap(), None);
        assert_eq!(Tileset::read_json(&ext.tileset).unwrap(), tile.tileset());

        let emb = tile.write_dir(dir.path().join("emb"), PayloadMode::Embedded).unwrap();
        assert!(emb.payload.is_none());
        assert!(!dir.path().join("emb").join(PAYLOAD_FILE).exists());
        let gltf = Gltf::read_json(&emb.content).unwrap();
        assert!(gltf.buffers[0].uri.starts_with("data:application/octet-stream;base64,"));
        assert_eq!(gltf.embedded_payload().unwrap(), Some(payload().buffer));
    }

    #[test]
    fn test_rescale_writes_a_new_tile_directory() {
        let t = anchored();
        let tile = assemble(&apply_transform(&sample_set(), &t).unwrap(), payload(), &t, 100.0).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = tile.write_dir(dir.path().join("v1"), PayloadMode::External).unwrap();
        let original = fs::read(&out.tileset).unwrap();

        let v2 = dir.path().join("v2");
        let previous = rescale_tileset(&out.tileset, &v2, 100.0).unwrap();
        assert_relative_eq!(previous, 11.5, epsilon = 1e-9);

        // Source untouched; the copy is complete on its own.
        assert_eq!(fs::read(&out.tileset).unwrap(), original);
        assert_eq!(fs::read(v2.join(PAYLOAD_FILE)).unwrap(), payload().buffer);
        assert_eq!(Gltf::read_json(v2.join(CONTENT_FILE)).unwrap(), tile.gltf(PayloadMode::External));

        let ts = Tileset::read_json(v2.join(TILESET_FILE)).unwrap();
        let rescaled = SimilarityTransform::from_column_major(&ts.root.transform).unwrap();
        assert_relative_eq!(rescaled.scale(), 100.0, epsilon = 1e-9);
        assert_relative_eq!(*rescaled.rotation(), *t.rotation(), epsilon = 1e-9);
        assert_eq!(rescaled.translation(), t.translation());
        assert_eq!(ts.root.bounding_volume, tile.tileset().root.bounding_volume);

        assert!(matches!(
            rescale_tileset(&out.tileset, dir.path().join("v3"), -1.0),
            Err(GeoSplatError::DegenerateScale { .. })
        ));
        assert!(!dir.path().join("v3").exists());
    }

    #[test]
    fn test_rescale_never_overwrites() {
        let tile = assemble(&sample_set(), payload(), &anchored(), 100.0).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = tile.write_dir(dir.path(), PayloadMode::Embedded).unwrap();
        let original = fs::read(&out.tileset).unwrap();

        let err = rescale_tileset(&out.tileset, dir.path(), 2.0).unwrap_err();
        assert!(matches!(err, GeoSplatError::OutputExists(_)), "{err}");
        assert_eq!(err.kind(), "OutputExistsError");
        assert_eq!(fs::read(&out.tileset).unwrap(), original);
    }

    #[test]
    fn test_reanchor_moves_the_tile() {
        let tile = assemble(&sample_set(), payload(), &anchored(), 100.0).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = tile.write_dir(dir.path().join("sf"), PayloadMode::Embedded).unwrap();

        // No scale on the new anchor: the current one carries over.
        let sydney = GeoAnchor::new(-33.8688, 151.2093, 58.0).unwrap();
        let placed = reanchor_tileset(&out.tileset, dir.path().join("syd"), &sydney).unwrap();
        assert_relative_eq!(placed.scale(), 11.5, epsilon = 1e-9);
        assert_eq!(
            *placed.translation(),
            crate::geodesy::geodetic_to_ecef(-33.8688, 151.2093, 58.0).unwrap()
        );

        let ts = Tileset::read_json(dir.path().join("syd").join(TILESET_FILE)).unwrap();
        assert_eq!(ts.root.transform, placed.to_column_major().to_vec());
        assert!(dir.path().join("syd").join(CONTENT_FILE).exists());
        assert!(!dir.path().join("syd").join(PAYLOAD_FILE).exists());

        let scaled = reanchor_tileset(&out.tileset, dir.path().join("syd2"), &sydney.with_scale(3.0)).unwrap();
        assert_relative_eq!(scaled.scale(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rescale_rejects_sheared_transform() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TILESET_FILE);
        let sheared = serde_json::json!({
            "asset": { "version": "1.1" },
            "geometricError": 1.0,
            "root": { "transform": [1.0, 0.0, 0.0, 0.0, 0.5, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0] }
        });
        fs::write(&path, sheared.to_string()).unwrap();
        assert!(matches!(
            rescale_tileset(&path, dir.path().join("out"), 2.0),
            Err(GeoSplatError::NonOrthonormalTransform { .. })
        ));
    }

    #[test]
    fn test_content_uri_must_stay_inside() {
        assert!(relative_uri("tile_0.gltf").is_ok());
        assert!(relative_uri("sub/tile_0.spz").is_ok());
        assert!(relative_uri("../elsewhere.gltf").is_err());
        assert!(relative_uri("/etc/passwd").is_err());
    }
}
