//! Gaussian splat records and the per-splat similarity transform.

use log::debug;
use nalgebra::{Quaternion, Vector3};
use rayon::prelude::*;

use crate::error::{GeoSplatError, Result};
use crate::transform::SimilarityTransform;

/// One Gaussian primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct SplatRecord {
    /// Centre in scene units.
    pub position: Vector3<f64>,
    /// Natural log of the per-axis standard deviation.
    pub log_scale: [f32; 3],
    /// Orientation quaternion `[w, x, y, z]`.
    pub rotation: [f32; 4],
    /// Opacity exactly as stored (pre-activation logit in trainer output).
    pub opacity: f32,
    /// Direct colour or spherical-harmonic coefficients, DC terms first.
    pub color: Vec<f32>,
}

impl SplatRecord {
    /// Reject values a transform would silently turn into garbage:
    /// non-finite attributes and rotations with no direction.
    pub fn validate(&self, index: usize) -> Result<()> {
        let bad = |field: &'static str, value: String| GeoSplatError::InvalidSplat {
            index,
            field,
            value,
        };

        if !self.position.iter().all(|v| v.is_finite()) {
            return Err(bad("position", format!("{:?}", self.position.as_slice())));
        }
        if !self.log_scale.iter().all(|v| v.is_finite()) {
            return Err(bad("log_scale", format!("{:?}", self.log_scale)));
        }
        if !self.opacity.is_finite() {
            return Err(bad("opacity", self.opacity.to_string()));
        }

        let norm = self
            .rotation
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt();
        if !norm.is_finite() || norm < MIN_ROTATION_NORM {
            return Err(bad("rotation", format!("{:?}", self.rotation)));
        }

        Ok(())
    }
}

/// Quaternions shorter than this carry no usable orientation.
const MIN_ROTATION_NORM: f64 = 1e-12;

/// Per-set record layout shared by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplatLayout {
    /// Colour coefficients per record.
    pub color_coeffs: usize,
    /// Whether the source file carried (unused) `nx ny nz` normals.
    pub normals: bool,
}

impl SplatLayout {
    pub fn new(color_coeffs: usize) -> Self {
        Self {
            color_coeffs,
            normals: false,
        }
    }

    /// Scalars per record in the flat codec schema (3 + 3 + 4 + 1 + N).
    pub fn flat_width(&self) -> usize {
        11 + self.color_coeffs
    }
}

/// Ordered splats with a fixed colour arity.
#[derive(Debug, Clone, PartialEq)]
pub struct SplatSet {
    layout: SplatLayout,
    records: Vec<SplatRecord>,
}

/// Axis-aligned bounds of splat centres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Bounds {
    pub fn center(&self) -> Vector3<f64> {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vector3<f64> {
        (self.max - self.min) * 0.5
    }

    /// Length of the box diagonal.
    pub fn diagonal(&self) -> f64 {
        (self.max - self.min).norm()
    }

    pub fn expanded(&self, margin: f64) -> Bounds {
        let m = Vector3::repeat(margin);
        Bounds {
            min: self.min - m,
            max: self.max + m,
        }
    }
}

impl SplatSet {
    /// Wrap records, checking every record has the layout's colour arity.
    pub fn new(layout: SplatLayout, records: Vec<SplatRecord>) -> Result<Self> {
        if let Some((index, bad)) = records
            .iter()
            .enumerate()
            .find(|(_, r)| r.color.len() != layout.color_coeffs)
        {
            return Err(GeoSplatError::schema(format!(
                "record {index} has {} colour coefficients, set declares {}",
                bad.color.len(),
                layout.color_coeffs
            )));
        }

        Ok(Self { layout, records })
    }

    pub fn empty(layout: SplatLayout) -> Self {
        Self {
            layout,
            records: Vec::new(),
        }
    }

    pub fn layout(&self) -> SplatLayout {
        self.layout
    }

    pub fn records(&self) -> &[SplatRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<SplatRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bounds of the splat centres, `None` when empty.
    pub fn bounds(&self) -> Option<Bounds> {
        let first = self.records.first()?.position;
        let (min, max) = self
            .records
            .iter()
            .fold((first, first), |(lo, hi), r| (lo.inf(&r.position), hi.sup(&r.position)));
        Some(Bounds { min, max })
    }

    /// First record failing [`SplatRecord::validate`], by index.
    pub fn validate(&self) -> Result<()> {
        match self
            .records
            .par_iter()
            .enumerate()
            .find_map_first(|(i, r)| r.validate(i).err())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Diagonal of the centre bounds, a measured local scene extent.
    pub fn extent(&self) -> Option<f64> {
        self.bounds().map(|b| b.diagonal())
    }

    /// Flatten into the fixed-width codec schema: position, log-scale,
    /// rotation, opacity, colour; one record after another.
    pub fn to_flat(&self) -> Vec<f32> {
        let width = self.layout.flat_width();
        let mut out = Vec::with_capacity(self.records.len() * width);

        for r in &self.records {
            out.extend(r.position.iter().map(|&v| v as f32));
            out.extend_from_slice(&r.log_scale);
            out.extend_from_slice(&r.rotation);
            out.push(r.opacity);
            out.extend_from_slice(&r.color);
        }

        out
    }
}

/// `normalize(q_t ⊗ q)`. `q` is non-zero after validation and `q_t` is unit.
#[inline]
fn compose_rotation(q_t: &Quaternion<f64>, q: [f32; 4]) -> [f32; 4] {
    let q = Quaternion::new(q[0] as f64, q[1] as f64, q[2] as f64, q[3] as f64);
    let unit = (q_t * q).normalize();
    [unit.w as f32, unit.i as f32, unit.j as f32, unit.k as f32]
}

fn transform_record(
    r: &SplatRecord,
    t: &SimilarityTransform,
    q_t: &Quaternion<f64>,
    ln_scale: f32,
) -> SplatRecord {
    SplatRecord {
        position: t.apply_point(&r.position),
        // Uniform scaling is additive in log space.
        log_scale: [
            r.log_scale[0] + ln_scale,
            r.log_scale[1] + ln_scale,
            r.log_scale[2] + ln_scale,
        ],
        rotation: compose_rotation(q_t, r.rotation),
        opacity: r.opacity,
        // Higher-order SH stay in the local frame; only the DC term is frame-free.
        color: r.color.clone(),
    }
}

/// Apply `t` to every splat. Output order equals input order.
pub fn apply_transform(set: &SplatSet, t: &SimilarityTransform) -> Result<SplatSet> {
    let q_t = *t.rotation_quaternion().quaternion();
    let ln_scale = t.scale().ln() as f32;

    debug!(
        "Transforming {} splats (scale {}, ln {ln_scale})",
        set.len(),
        t.scale()
    );

    set.validate()?;

    let records: Vec<SplatRecord> = set
        .records
        .par_iter()
        .map(|r| transform_record(r, t, &q_t, ln_scale))
        .collect();

    if records.len() != set.len() {
        return Err(GeoSplatError::RecordCountMismatch {
            expected: set.len(),
            actual: records.len(),
        });
    }

    Ok(SplatSet {
        layout: set.layout,
        records,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geodesy::geodetic_to_ecef;
    use crate::transform::{build_transform, GeoAnchor};
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, UnitQuaternion};

    pub(crate) fn record(position: [f64; 3], color_coeffs: usize) -> SplatRecord {
        let q = UnitQuaternion::from_euler_angles(0.3, -0.2, 0.9);
        SplatRecord {
            position: Vector3::from(position),
            log_scale: [-4.2, -3.1, -5.0],
            rotation: [q.w as f32, q.i as f32, q.j as f32, q.k as f32],
            opacity: 0.75,
            color: (0..color_coeffs).map(|i| i as f32 * 0.01).collect(),
        }
    }

    pub(crate) fn sample_set() -> SplatSet {
        let records = vec![
            record([0.0, 0.0, 0.0], 12),
            record([1.0, -0.5, 0.25], 12),
            record([-0.8, 0.9, -0.3], 12),
            record([0.1, 0.2, 1.1], 12),
        ];
        SplatSet::new(SplatLayout::new(12), records).unwrap()
    }

    fn quat_norm(q: [f32; 4]) -> f32 {
        q.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    fn assert_records_close(a: &SplatSet, b: &SplatSet) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.records().iter().zip(b.records()) {
            assert_relative_eq!(x.position, y.position, epsilon = 1e-6);
            for i in 0..3 {
                assert_relative_eq!(x.log_scale[i], y.log_scale[i], epsilon = 1e-5);
            }
            // q and -q are the same orientation.
            let dot: f32 = (0..4).map(|i| x.rotation[i] * y.rotation[i]).sum();
            assert_relative_eq!(dot.abs(), 1.0, epsilon = 1e-5);
            assert_eq!(x.opacity, y.opacity);
            assert_eq!(x.color, y.color);
        }
    }

    #[test]
    fn test_identity_is_idempotent() {
        let set = sample_set();
        let out = apply_transform(&set, &SimilarityTransform::identity()).unwrap();
        assert_records_close(&set, &out);
        for (a, b) in set.records().iter().zip(out.records()) {
            assert_eq!(a.position, b.position);
            assert_eq!(a.log_scale, b.log_scale);
        }
    }

    #[test]
    fn test_log_scale_is_shifted_by_ln_scale_exactly() {
        let t = build_transform(
            &GeoAnchor::new(37.7694, -122.4862, 10.0).unwrap().with_scale(100.0),
            None,
            None,
        )
        .unwrap();
        let set = sample_set();
        let out = apply_transform(&set, &t).unwrap();

        let ln_s = 100f64.ln() as f32;
        for (a, b) in set.records().iter().zip(out.records()) {
            for i in 0..3 {
                assert_eq!(b.log_scale[i], a.log_scale[i] + ln_s);
            }
            assert_eq!(a.opacity, b.opacity);
            assert_eq!(a.color, b.color);
        }
    }

    #[test]
    fn test_rotation_is_renormalised() {
        let mut r = record([0.0, 0.0, 0.0], 3);
        r.rotation = [1.3, 0.2, -0.1, 0.05]; // drifted, not unit
        let set = SplatSet::new(SplatLayout::new(3), vec![r]).unwrap();

        let t = SimilarityTransform::new(
            Rotation3::from_euler_angles(0.4, 0.1, -1.0).into_inner(),
            2.0,
            Vector3::new(1.0, 2.0, 3.0),
        )
        .unwrap();

        for rec in apply_transform(&set, &t).unwrap().records() {
            assert_relative_eq!(quat_norm(rec.rotation), 1.0, epsilon = 1e-6);
        }
        for rec in apply_transform(&set, &SimilarityTransform::identity()).unwrap().records() {
            assert_relative_eq!(quat_norm(rec.rotation), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_unusable_splats_are_rejected_by_index() {
        let cases: [(&str, fn(&mut SplatRecord)); 4] = [
            ("rotation", |r| r.rotation = [0.0; 4]),
            ("rotation", |r| r.rotation[2] = f32::NAN),
            ("position", |r| r.position.y = f64::INFINITY),
            ("log_scale", |r| r.log_scale[0] = f32::NEG_INFINITY),
        ];

        for (expected_field, corrupt) in cases {
            let mut records = sample_set().into_records();
            corrupt(&mut records[2]);
            let set = SplatSet::new(SplatLayout::new(12), records).unwrap();

            let err = apply_transform(&set, &SimilarityTransform::identity()).unwrap_err();
            match &err {
                GeoSplatError::InvalidSplat { index, field, .. } => {
                    assert_eq!(*index, 2);
                    assert_eq!(*field, expected_field);
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(err.kind(), "InvalidSplatError");
        }
    }

    #[test]
    fn test_composition_equals_sequential_application() {
        let a = build_transform(
            &GeoAnchor::new(-33.8688, 151.2093, 58.0).unwrap().with_scale(11.5),
            None,
            None,
        )
        .unwrap();
        let b = SimilarityTransform::new(
            Rotation3::from_euler_angles(-0.7, 0.2, 0.3).into_inner(),
            0.5,
            Vector3::new(0.25, -1.0, 4.0),
        )
        .unwrap();

        let set = sample_set();
        let sequential = apply_transform(&apply_transform(&set, &b).unwrap(), &a).unwrap();
        let composed = apply_transform(&set, &a.compose(&b)).unwrap();
        assert_records_close(&sequential, &composed);
    }

    #[test]
    fn test_splat_axes_follow_the_transform() {
        // The splat's local x axis, rotated by its quaternion then by R,
        // must match the axis of the output quaternion.
        let t = SimilarityTransform::new(
            Rotation3::from_euler_angles(0.2, 0.5, -0.3).into_inner(),
            3.0,
            Vector3::zeros(),
        )
        .unwrap();
        let set = sample_set();
        let out = apply_transform(&set, &t).unwrap();

        for (a, b) in set.records().iter().zip(out.records()) {
            let qa = UnitQuaternion::from_quaternion(Quaternion::new(
                a.rotation[0] as f64,
                a.rotation[1] as f64,
                a.rotation[2] as f64,
                a.rotation[3] as f64,
            ));
            let qb = UnitQuaternion::from_quaternion(Quaternion::new(
                b.rotation[0] as f64,
                b.rotation[1] as f64,
                b.rotation[2] as f64,
                b.rotation[3] as f64,
            ));
            let expected = t.rotation() * (qa * Vector3::x());
            assert_relative_eq!(qb * Vector3::x(), expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_origin_splat_lands_on_anchor() {
        let anchor = GeoAnchor::new(37.7694, -122.4862, 10.0).unwrap().with_scale(100.0);
        let t = build_transform(&anchor, None, None).unwrap();
        let set = SplatSet::new(SplatLayout::new(3), vec![record([0.0, 0.0, 0.0], 3)]).unwrap();

        let out = apply_transform(&set, &t).unwrap();
        assert_eq!(
            out.records()[0].position,
            geodetic_to_ecef(37.7694, -122.4862, 10.0).unwrap()
        );
    }

    #[test]
    fn test_mixed_arity_is_rejected() {
        let records = vec![record([0.0; 3], 3), record([1.0; 3], 12)];
        assert!(matches!(
            SplatSet::new(SplatLayout::new(3), records),
            Err(GeoSplatError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_bounds_and_flat_layout() {
        let set = sample_set();
        let b = set.bounds().unwrap();
        assert_eq!(b.min, Vector3::new(-0.8, -0.5, -0.3));
        assert_eq!(b.max, Vector3::new(1.0, 0.9, 1.1));

        let flat = set.to_flat();
        assert_eq!(flat.len(), set.len() * (11 + 12));
        assert_eq!(flat[23], 1.0); // second record x

        assert!(SplatSet::empty(SplatLayout::new(3)).bounds().is_none());
    }
}
