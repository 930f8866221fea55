//! Similarity transforms from local splat frames into WGS-84 ECEF.
//!
//! A [`SimilarityTransform`] maps a local point `p` to `R·(s·p) + t`, where `R`
//! is orthonormal (the ENU -> ECEF basis at the anchor when built from a
//! [`GeoAnchor`]), `s > 0` and `t` is the ECEF position of the local origin.
//! Externally it is a column-major 4x4 matrix `[[s·R, t], [0, 0, 0, 1]]`.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{debug, info, warn};
use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{GeoSplatError, Result};
use crate::geodesy::{check_lat_lon, ecef_basis, geodetic_to_ecef};

/// Tolerance on `max |RᵀR - I|` for a rotation block to count as orthonormal.
pub const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

/// Real-world anchor for the local origin of a splat scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoAnchor {
    latitude_deg: f64,
    longitude_deg: f64,
    height_m: f64,
    scale: Option<f64>,
    height_offset_m: f64,
}

impl GeoAnchor {
    /// Validated anchor without explicit scale.
    pub fn new(latitude_deg: f64, longitude_deg: f64, height_m: f64) -> Result<Self> {
        check_lat_lon(latitude_deg, longitude_deg)
            .map_err(|e| GeoSplatError::InvalidAnchor(e.to_string()))?;

        if !height_m.is_finite() {
            return Err(GeoSplatError::InvalidAnchor(format!(
                "height={height_m} is not finite"
            )));
        }

        Ok(Self {
            latitude_deg,
            longitude_deg,
            height_m,
            scale: None,
            height_offset_m: 0.0,
        })
    }

    /// Attach an explicit uniform scale. Validity is checked when the transform is built.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Raise (or lower) the anchor by `offset_m`, remembering the offset for traceability.
    pub fn with_height_offset(mut self, offset_m: f64) -> Result<Self> {
        if !offset_m.is_finite() {
            return Err(GeoSplatError::InvalidAnchor(format!(
                "heightOffset={offset_m} is not finite"
            )));
        }
        self.height_m += offset_m;
        self.height_offset_m += offset_m;
        Ok(self)
    }

    pub fn latitude_deg(&self) -> f64 {
        self.latitude_deg
    }

    pub fn longitude_deg(&self) -> f64 {
        self.longitude_deg
    }

    /// Height above the ellipsoid, offset included.
    pub fn height_m(&self) -> f64 {
        self.height_m
    }

    pub fn scale(&self) -> Option<f64> {
        self.scale
    }

    pub fn height_offset_m(&self) -> f64 {
        self.height_offset_m
    }
}

/// Anchor as it arrives from JSON or the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorInput {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_offset: Option<f64>,
}

impl AnchorInput {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GeoSplatError::io(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

impl TryFrom<AnchorInput> for GeoAnchor {
    type Error = GeoSplatError;

    fn try_from(input: AnchorInput) -> Result<Self> {
        let mut anchor = GeoAnchor::new(input.latitude, input.longitude, input.height)?;
        if let Some(offset) = input.height_offset {
            anchor = anchor.with_height_offset(offset)?;
        }
        if let Some(scale) = input.scale {
            anchor = anchor.with_scale(scale);
        }
        Ok(anchor)
    }
}

/// Operator-facing knobs for scale resolution.
///
/// `assumed_local_extent` encodes a guess about how the upstream trainer
/// normalises scenes; it is a starting estimate, not a measured quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePolicy {
    /// Scale used when neither an explicit scale nor both extents are known.
    pub default_scale: f64,
    /// Local scene diameter assumed when it was not measured.
    pub assumed_local_extent: f64,
}

impl Default for ScalePolicy {
    fn default() -> Self {
        Self {
            default_scale: 10.0,
            assumed_local_extent: 2.0,
        }
    }
}

/// Where a transform's scale came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScaleSource {
    /// `GeoAnchor::scale`.
    Explicit,
    /// Real extent over local extent.
    ExtentRatio,
    /// `ScalePolicy::default_scale`.
    Default,
    /// Least-squares fit to point correspondences.
    Estimated,
    /// Read back from a stored matrix.
    Stored,
}

impl ScaleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleSource::Explicit => "explicit",
            ScaleSource::ExtentRatio => "extentRatio",
            ScaleSource::Default => "default",
            ScaleSource::Estimated => "estimated",
            ScaleSource::Stored => "stored",
        }
    }
}

/// Rotation + uniform scale + translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    rotation: Matrix3<f64>,
    scale: f64,
    translation: Vector3<f64>,
}

/// Largest absolute entry of `RᵀR - I`.
pub fn orthonormality_error(r: &Matrix3<f64>) -> f64 {
    (r.transpose() * r - Matrix3::identity()).amax()
}

fn check_scale(value: f64, source: ScaleSource) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(GeoSplatError::DegenerateScale {
            value,
            source_name: source.as_str(),
        })
    }
}

impl SimilarityTransform {
    /// Build from components, enforcing `s > 0` and an orthonormal, proper rotation.
    pub fn new(rotation: Matrix3<f64>, scale: f64, translation: Vector3<f64>) -> Result<Self> {
        check_scale(scale, ScaleSource::Stored)?;

        let error = orthonormality_error(&rotation);
        if !(error <= ORTHONORMAL_TOLERANCE) || rotation.determinant() < 0.0 {
            return Err(GeoSplatError::NonOrthonormalTransform {
                error,
                tolerance: ORTHONORMAL_TOLERANCE,
            });
        }

        if !translation.iter().all(|v| v.is_finite()) {
            return Err(GeoSplatError::InvalidAnchor(format!(
                "translation {:?} is not finite",
                translation.as_slice()
            )));
        }

        Ok(Self {
            rotation,
            scale,
            translation,
        })
    }

    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            scale: 1.0,
            translation: Vector3::zeros(),
        }
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// `R·(s·p) + t`
    #[inline]
    pub fn apply_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * (p * self.scale) + self.translation
    }

    /// `R·(s·v)`, for directions and extents.
    #[inline]
    pub fn apply_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * (v * self.scale)
    }

    /// Same rotation and translation with a different scale.
    pub fn with_scale(&self, scale: f64) -> Result<Self> {
        Ok(Self {
            scale: check_scale(scale, ScaleSource::Explicit)?,
            ..*self
        })
    }

    /// Rotational component as a unit quaternion.
    pub fn rotation_quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(self.rotation))
    }

    /// `self ∘ other`: applies `other` first, then `self`.
    pub fn compose(&self, other: &SimilarityTransform) -> SimilarityTransform {
        SimilarityTransform {
            rotation: self.rotation * other.rotation,
            scale: self.scale * other.scale,
            translation: self.rotation * (other.translation * self.scale) + self.translation,
        }
    }

    pub fn inverse(&self) -> SimilarityTransform {
        let rt = self.rotation.transpose();
        let inv_s = self.scale.recip();
        SimilarityTransform {
            rotation: rt,
            scale: inv_s,
            translation: -(rt * self.translation) * inv_s,
        }
    }

    pub fn to_matrix4(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(self.rotation * self.scale));
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Flattened column-major 4x4 (glTF / 3D Tiles order).
    pub fn to_column_major(&self) -> [f64; 16] {
        let m = self.to_matrix4();
        let mut out = [0.0; 16];
        out.copy_from_slice(m.as_slice());
        out
    }

    /// Parse a column-major 4x4, recovering scale from the first column's norm.
    pub fn from_column_major(values: &[f64]) -> Result<Self> {
        if values.len() != 16 {
            return Err(GeoSplatError::schema(format!(
                "transform matrix has {} elements, expected 16",
                values.len()
            )));
        }

        let m = Matrix4::from_column_slice(values);
        let bottom = [m[(3, 0)], m[(3, 1)], m[(3, 2)], m[(3, 3)]];
        if bottom != [0.0, 0.0, 0.0, 1.0] {
            return Err(GeoSplatError::schema(format!(
                "transform bottom row is {bottom:?}, expected [0, 0, 0, 1]"
            )));
        }

        let block: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let scale = check_scale(block.column(0).norm(), ScaleSource::Stored)?;
        let translation: Vector3<f64> = m.fixed_view::<3, 1>(0, 3).into_owned();

        Self::new(block / scale, scale, translation)
    }
}

/// Transform plus how its scale was resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuiltTransform {
    pub transform: SimilarityTransform,
    pub scale_source: ScaleSource,
}

/// Builds anchor transforms under a [`ScalePolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformBuilder {
    pub policy: ScalePolicy,
}

impl TransformBuilder {
    pub fn new(policy: ScalePolicy) -> Self {
        Self { policy }
    }

    /// Scale resolution: explicit anchor scale, else `real / local` when both
    /// are known and `local > 0`, else the policy default.
    pub fn resolve_scale(
        &self,
        anchor: &GeoAnchor,
        scene_extent_local: Option<f64>,
        scene_extent_real: Option<f64>,
    ) -> Result<(f64, ScaleSource)> {
        if let Some(scale) = anchor.scale() {
            debug!("Using explicit scale {scale}");
            return Ok((check_scale(scale, ScaleSource::Explicit)?, ScaleSource::Explicit));
        }

        if let (Some(local), Some(real)) = (scene_extent_local, scene_extent_real) {
            if local > 0.0 {
                let scale = real / local;
                info!("Scale from extents: {real:.3} m / {local:.3} local units = {scale:.4}");
                return Ok((
                    check_scale(scale, ScaleSource::ExtentRatio)?,
                    ScaleSource::ExtentRatio,
                ));
            }
            warn!("Local scene extent {local} is not positive; ignoring extent ratio");
        }

        let scale = self.policy.default_scale;
        warn!("No scale information; falling back to default scale {scale}");
        Ok((check_scale(scale, ScaleSource::Default)?, ScaleSource::Default))
    }

    pub fn build(
        &self,
        anchor: &GeoAnchor,
        scene_extent_local: Option<f64>,
        scene_extent_real: Option<f64>,
    ) -> Result<BuiltTransform> {
        let as_anchor_error = |e: GeoSplatError| match e {
            GeoSplatError::Domain { .. } => GeoSplatError::InvalidAnchor(e.to_string()),
            other => other,
        };

        let rotation = ecef_basis(anchor.latitude_deg(), anchor.longitude_deg())
            .map_err(as_anchor_error)?;
        let translation = geodetic_to_ecef(
            anchor.latitude_deg(),
            anchor.longitude_deg(),
            anchor.height_m(),
        )
        .map_err(as_anchor_error)?;

        let (scale, scale_source) =
            self.resolve_scale(anchor, scene_extent_local, scene_extent_real)?;

        debug!(
            "Anchor ({:.7}, {:.7}, {:.3} m) -> ECEF ({:.3}, {:.3}, {:.3}), scale {scale} ({})",
            anchor.latitude_deg(),
            anchor.longitude_deg(),
            anchor.height_m(),
            translation.x,
            translation.y,
            translation.z,
            scale_source.as_str()
        );

        Ok(BuiltTransform {
            transform: SimilarityTransform::new(rotation, scale, translation)?,
            scale_source,
        })
    }
}

/// Anchor transform with the default [`ScalePolicy`].
pub fn build_transform(
    anchor: &GeoAnchor,
    scene_extent_local: Option<f64>,
    scene_extent_real: Option<f64>,
) -> Result<SimilarityTransform> {
    TransformBuilder::default()
        .build(anchor, scene_extent_local, scene_extent_real)
        .map(|built| built.transform)
}

/// Least-squares similarity mapping `local[i]` onto `world[i]` (Umeyama).
pub fn estimate_similarity(
    local: &[Vector3<f64>],
    world: &[Vector3<f64>],
) -> Result<SimilarityTransform> {
    if local.len() != world.len() {
        return Err(GeoSplatError::DegenerateCorrespondences(format!(
            "{} local points vs {} world points",
            local.len(),
            world.len()
        )));
    }
    if local.len() < 3 {
        return Err(GeoSplatError::DegenerateCorrespondences(format!(
            "need at least 3 point pairs, got {}",
            local.len()
        )));
    }

    let n = local.len() as f64;
    let mean_p = local.iter().sum::<Vector3<f64>>() / n;
    let mean_q = world.iter().sum::<Vector3<f64>>() / n;

    let mut h = Matrix3::zeros();
    let mut var_p = 0.0;
    for (p, q) in local.iter().zip(world) {
        let pc = p - mean_p;
        let qc = q - mean_q;
        h += pc * qc.transpose();
        var_p += pc.norm_squared();
    }

    let svd = h.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(GeoSplatError::DegenerateCorrespondences(
                "SVD did not converge".into(),
            ))
        }
    };

    let sv = svd.singular_values;
    let (s_max, s_min_mid) = (sv.max(), {
        let mut sorted = [sv[0], sv[1], sv[2]];
        sorted.sort_by(|a, b| b.total_cmp(a));
        sorted[1]
    });
    if var_p <= f64::EPSILON || s_max <= f64::EPSILON || s_min_mid <= s_max * 1e-9 {
        return Err(GeoSplatError::DegenerateCorrespondences(
            "local points are coincident or collinear".into(),
        ));
    }

    // R = V·Uᵀ, flipping the weakest axis if that would be a reflection.
    let v = v_t.transpose();
    let mut d = Matrix3::identity();
    if (v * u.transpose()).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let rotation = v * d * u.transpose();

    let scale = (Matrix3::from_diagonal(&sv) * d).trace() / var_p;
    let translation = mean_q - rotation * (mean_p * scale);

    let t = SimilarityTransform::new(rotation, check_scale(scale, ScaleSource::Estimated)?, translation)?;

    let rms = (local
        .iter()
        .zip(world)
        .map(|(p, q)| (t.apply_point(p) - q).norm_squared())
        .sum::<f64>()
        / n)
        .sqrt();
    info!("Estimated similarity from {} pairs: scale {scale:.6}, RMS residual {rms:.4} m", local.len());

    Ok(t)
}

/// Frame the `world` side of a correspondence file is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorldFrame {
    /// ECEF metres `[X, Y, Z]`.
    #[default]
    Ecef,
    /// Geodetic `[lat_deg, lon_deg, h_m]`.
    Geodetic,
}

/// Local/world point pairs used to estimate a transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correspondences {
    #[serde(alias = "nerf")]
    pub local: Vec<[f64; 3]>,
    pub world: Vec<[f64; 3]>,
    #[serde(default)]
    pub world_frame: WorldFrame,
}

impl Correspondences {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GeoSplatError::io(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn estimate(&self) -> Result<SimilarityTransform> {
        let local: Vec<Vector3<f64>> = self.local.iter().map(|&p| Vector3::from(p)).collect();
        let world = self
            .world
            .iter()
            .map(|&[a, b, c]| match self.world_frame {
                WorldFrame::Ecef => Ok(Vector3::new(a, b, c)),
                WorldFrame::Geodetic => geodetic_to_ecef(a, b, c),
            })
            .collect::<Result<Vec<_>>>()?;

        estimate_similarity(&local, &world)
    }
}

/// Anchor as recorded in a transform artifact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRecord {
    pub latitude: f64,
    pub longitude: f64,
    /// Height used for the transform, offset included.
    pub height: f64,
    pub height_offset: f64,
}

impl From<&GeoAnchor> for AnchorRecord {
    fn from(a: &GeoAnchor) -> Self {
        Self {
            latitude: a.latitude_deg(),
            longitude: a.longitude_deg(),
            height: a.height_m(),
            height_offset: a.height_offset_m(),
        }
    }
}

/// On-disk transform: the matrix plus what produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformArtifact {
    /// Column-major 4x4, local -> ECEF.
    pub matrix: Vec<f64>,
    pub scale: f64,
    pub scale_source: ScaleSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorRecord>,
    pub origin_ecef: [f64; 3],
}

/// Transform JSON as found on disk: a full artifact, or bare `{scale, R, t}` components.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TransformFile {
    Artifact(TransformArtifact),
    Components {
        scale: f64,
        #[serde(rename = "R")]
        r: [[f64; 3]; 3],
        t: [f64; 3],
    },
}

impl TransformArtifact {
    pub fn new(
        transform: &SimilarityTransform,
        scale_source: ScaleSource,
        anchor: Option<&GeoAnchor>,
    ) -> Self {
        let t = transform.translation();
        Self {
            matrix: transform.to_column_major().to_vec(),
            scale: transform.scale(),
            scale_source,
            anchor: anchor.map(AnchorRecord::from),
            origin_ecef: [t.x, t.y, t.z],
        }
    }

    /// Validated transform. The stored scale must agree with the matrix.
    pub fn transform(&self) -> Result<SimilarityTransform> {
        let t = SimilarityTransform::from_column_major(&self.matrix)?;
        if (t.scale() - self.scale).abs() > 1e-9 * self.scale.abs().max(1.0) {
            return Err(GeoSplatError::schema(format!(
                "artifact scale {} disagrees with matrix scale {}",
                self.scale,
                t.scale()
            )));
        }
        Ok(t)
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| GeoSplatError::io(path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read an artifact, also accepting bare `{"scale", "R", "t"}` files.
    pub fn read_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GeoSplatError::io(path, e))?;

        match serde_json::from_reader(BufReader::new(file))? {
            TransformFile::Artifact(artifact) => Ok(artifact),
            TransformFile::Components { scale, r, t } => {
                let rotation = Matrix3::from_fn(|i, j| r[i][j]);
                let transform = SimilarityTransform::new(rotation, scale, Vector3::from(t))?;
                Ok(Self::new(&transform, ScaleSource::Stored, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sf_anchor() -> GeoAnchor {
        GeoAnchor::new(37.7694, -122.4862, 10.0).unwrap()
    }

    #[test]
    fn test_explicit_scale_wins() {
        let anchor = sf_anchor().with_scale(100.0);
        let t = build_transform(&anchor, Some(2.0), Some(23.0)).unwrap();
        assert_eq!(t.scale(), 100.0);
    }

    #[test]
    fn test_scale_from_extent_ratio() {
        let built = TransformBuilder::default()
            .build(&sf_anchor(), Some(2.0), Some(23.0))
            .unwrap();
        assert_relative_eq!(built.transform.scale(), 11.5, epsilon = 1e-12);
        assert_eq!(built.scale_source, ScaleSource::ExtentRatio);
    }

    #[test]
    fn test_default_scale_when_extents_missing_or_local_zero() {
        let builder = TransformBuilder::new(ScalePolicy {
            default_scale: 7.0,
            ..ScalePolicy::default()
        });

        let built = builder.build(&sf_anchor(), None, Some(23.0)).unwrap();
        assert_eq!(built.transform.scale(), 7.0);
        assert_eq!(built.scale_source, ScaleSource::Default);

        let built = builder.build(&sf_anchor(), Some(0.0), Some(23.0)).unwrap();
        assert_eq!(built.scale_source, ScaleSource::Default);
    }

    #[test]
    fn test_degenerate_scales_are_rejected() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let anchor = sf_anchor().with_scale(bad);
            assert!(matches!(
                build_transform(&anchor, None, None),
                Err(GeoSplatError::DegenerateScale { .. })
            ));
        }

        // A single located image gives a zero real extent.
        assert!(matches!(
            build_transform(&sf_anchor(), Some(2.0), Some(0.0)),
            Err(GeoSplatError::DegenerateScale { source_name: "extentRatio", .. })
        ));
    }

    #[test]
    fn test_invalid_anchor() {
        assert!(matches!(
            GeoAnchor::new(91.0, 0.0, 0.0),
            Err(GeoSplatError::InvalidAnchor(_))
        ));
        assert!(matches!(
            GeoAnchor::new(0.0, 180.0, 0.0),
            Err(GeoSplatError::InvalidAnchor(_))
        ));
        let input = AnchorInput {
            latitude: 10.0,
            longitude: -200.0,
            height: 0.0,
            scale: None,
            height_offset: None,
        };
        assert!(GeoAnchor::try_from(input).is_err());
    }

    #[test]
    fn test_height_offset_is_added() {
        let input: AnchorInput = serde_json::from_str(
            r#"{"latitude": 37.7694, "longitude": -122.4862, "height": 10, "heightOffset": 2.5, "scale": 3}"#,
        )
        .unwrap();
        let anchor = GeoAnchor::try_from(input).unwrap();
        assert_eq!(anchor.height_m(), 12.5);
        assert_eq!(anchor.height_offset_m(), 2.5);
        assert_eq!(anchor.scale(), Some(3.0));
    }

    #[test]
    fn test_rotation_is_orthonormal_for_many_anchors() {
        for lat in (-90..=90).step_by(15) {
            for lon in (-180..180).step_by(30) {
                let anchor = GeoAnchor::new(lat as f64, lon as f64, 0.0).unwrap();
                let t = build_transform(&anchor, None, None).unwrap();
                assert!(orthonormality_error(t.rotation()) < 1e-12);
            }
        }
    }

    #[test]
    fn test_origin_maps_to_anchor_ecef() {
        let t = build_transform(&sf_anchor().with_scale(100.0), None, None).unwrap();
        let expected = geodetic_to_ecef(37.7694, -122.4862, 10.0).unwrap();
        assert_eq!(t.apply_point(&Vector3::zeros()), expected);
    }

    #[test]
    fn test_column_major_round_trip_and_layout() {
        let t = build_transform(&sf_anchor().with_scale(4.0), None, None).unwrap();
        let flat = t.to_column_major();

        // Translation occupies elements 12..15, bottom row zeros + 1.
        assert_eq!(flat[12], t.translation().x);
        assert_eq!(flat[13], t.translation().y);
        assert_eq!(flat[14], t.translation().z);
        assert_eq!([flat[3], flat[7], flat[11], flat[15]], [0.0, 0.0, 0.0, 1.0]);
        // First column is 4·East.
        assert_relative_eq!(flat[0], 4.0 * t.rotation()[(0, 0)], epsilon = 1e-12);
        assert_relative_eq!(flat[1], 4.0 * t.rotation()[(1, 0)], epsilon = 1e-12);

        let back = SimilarityTransform::from_column_major(&flat).unwrap();
        assert_relative_eq!(back.scale(), 4.0, epsilon = 1e-12);
        assert_relative_eq!(*back.rotation(), *t.rotation(), epsilon = 1e-12);
        assert_eq!(back.translation(), t.translation());
    }

    #[test]
    fn test_hand_edited_matrix_is_rejected() {
        let mut flat = SimilarityTransform::identity().to_column_major();
        flat[1] = 0.3; // shear
        assert!(matches!(
            SimilarityTransform::from_column_major(&flat),
            Err(GeoSplatError::NonOrthonormalTransform { .. })
        ));

        assert!(matches!(
            SimilarityTransform::from_column_major(&flat[..12]),
            Err(GeoSplatError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let a = build_transform(&sf_anchor().with_scale(3.0), None, None).unwrap();
        let b = SimilarityTransform::new(
            Rotation3::from_euler_angles(0.1, -0.4, 1.2).into_inner(),
            0.25,
            Vector3::new(5.0, -2.0, 0.5),
        )
        .unwrap();

        let ab = a.compose(&b);
        for p in [Vector3::new(1.0, 2.0, 3.0), Vector3::new(-0.3, 0.0, 9.0)] {
            assert_relative_eq!(ab.apply_point(&p), a.apply_point(&b.apply_point(&p)), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_inverse_undoes_transform() {
        let t = build_transform(&sf_anchor().with_scale(12.0), None, None).unwrap();
        let p = Vector3::new(0.5, -1.5, 2.0);
        let back = t.inverse().apply_point(&t.apply_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-8);
    }

    #[test]
    fn test_estimate_similarity_recovers_known_transform() {
        let truth = build_transform(&sf_anchor().with_scale(11.5), None, None).unwrap();
        let local = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.7, -0.2, 0.4),
        ];
        let world: Vec<_> = local.iter().map(|p| truth.apply_point(p)).collect();

        let est = estimate_similarity(&local, &world).unwrap();
        assert_relative_eq!(est.scale(), 11.5, epsilon = 1e-6);
        assert_relative_eq!(*est.rotation(), *truth.rotation(), epsilon = 1e-6);
        assert_relative_eq!(*est.translation(), *truth.translation(), epsilon = 1e-3);
    }

    #[test]
    fn test_estimate_similarity_rejects_collinear_points() {
        let local = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 0.0),
        ];
        assert!(matches!(
            estimate_similarity(&local, &local),
            Err(GeoSplatError::DegenerateCorrespondences(_))
        ));
        assert!(estimate_similarity(&local[..2], &local[..2]).is_err());
    }

    #[test]
    fn test_artifact_round_trip_and_component_form() {
        let dir = tempfile::tempdir().unwrap();
        let anchor = sf_anchor().with_scale(100.0);
        let built = TransformBuilder::default().build(&anchor, None, None).unwrap();

        let path = dir.path().join("transform.json");
        TransformArtifact::new(&built.transform, built.scale_source, Some(&anchor))
            .write_json(&path)
            .unwrap();
        let back = TransformArtifact::read_json(&path).unwrap();
        assert_eq!(back.scale_source, ScaleSource::Explicit);
        assert_eq!(back.anchor.unwrap().latitude, 37.7694);
        assert_relative_eq!(back.transform().unwrap().scale(), 100.0, epsilon = 1e-9);

        let legacy = dir.path().join("legacy.json");
        std::fs::write(
            &legacy,
            r#"{"scale": 2.0, "R": [[1,0,0],[0,1,0],[0,0,1]], "t": [1, 2, 3]}"#,
        )
        .unwrap();
        let t = TransformArtifact::read_json(&legacy).unwrap().transform().unwrap();
        assert_eq!(t.apply_point(&Vector3::new(1.0, 0.0, 0.0)), Vector3::new(3.0, 2.0, 3.0));
    }
}
