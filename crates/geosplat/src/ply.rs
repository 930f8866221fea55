//! Gaussian splat PLY reader/writer.
//!
//! Only the `vertex` element is interpreted and it must come first. The
//! property list must follow the splat convention exactly:
//!
//! ```text
//! x y z [nx ny nz] f_dc_0..f_dc_2 f_rest_0..f_rest_{N-4} opacity
//! scale_0 scale_1 scale_2 rot_0 rot_1 rot_2 rot_3
//! ```
//!
//! `x y z` may be `float` or `double` (all three alike); everything else is
//! `float`. `rot_0` is the quaternion's w component. Writing always produces
//! `binary_little_endian 1.0`; reading accepts ascii and both binary orders.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::debug;
use nalgebra::Vector3;

use crate::error::{GeoSplatError, Result};
use crate::splat::{SplatLayout, SplatRecord, SplatSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlyFormat {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

/// PLY scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ScalarType {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "char" | "int8" => ScalarType::I8,
            "uchar" | "uint8" => ScalarType::U8,
            "short" | "int16" => ScalarType::I16,
            "ushort" | "uint16" => ScalarType::U16,
            "int" | "int32" => ScalarType::I32,
            "uint" | "uint32" => ScalarType::U32,
            "float" | "float32" => ScalarType::F32,
            "double" | "float64" => ScalarType::F64,
            _ => return None,
        })
    }

    pub fn size(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }

    fn ply_name(self) -> &'static str {
        match self {
            ScalarType::I8 => "char",
            ScalarType::U8 => "uchar",
            ScalarType::I16 => "short",
            ScalarType::U16 => "ushort",
            ScalarType::I32 => "int",
            ScalarType::U32 => "uint",
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDecl {
    pub name: String,
    pub ty: ScalarType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlyHeader {
    pub format: PlyFormat,
    pub vertex_count: usize,
    pub properties: Vec<PropertyDecl>,
    /// Elements declared after `vertex`.
    pub other_elements: Vec<String>,
    /// Byte length of the header including `end_header\n`.
    pub len: usize,
}

/// Name of the i-th colour coefficient property.
pub fn color_property_name(i: usize) -> String {
    if i < 3 {
        format!("f_dc_{i}")
    } else {
        format!("f_rest_{}", i - 3)
    }
}

/// The exact per-vertex property layout of a splat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplatSchema {
    pub layout: SplatLayout,
    pub position_type: ScalarType,
}

impl SplatSchema {
    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        if self.layout.normals {
            names.extend(["nx", "ny", "nz"].iter().map(|s| s.to_string()));
        }
        names.extend((0..self.layout.color_coeffs).map(color_property_name));
        names.push("opacity".into());
        names.extend((0..3).map(|i| format!("scale_{i}")));
        names.extend((0..4).map(|i| format!("rot_{i}")));
        names
    }

    fn property_types(&self) -> Vec<ScalarType> {
        let n = self.property_names().len();
        (0..n)
            .map(|i| if i < 3 { self.position_type } else { ScalarType::F32 })
            .collect()
    }

    /// Derive the schema a header declares, then require an exact match.
    pub fn from_header(header: &PlyHeader) -> Result<Self> {
        let names: Vec<&str> = header.properties.iter().map(|p| p.name.as_str()).collect();

        let dc = names.iter().filter(|n| n.starts_with("f_dc_")).count();
        let rest = names.iter().filter(|n| n.starts_with("f_rest_")).count();
        if rest > 0 && dc != 3 {
            return Err(GeoSplatError::schema(format!(
                "{rest} f_rest_* properties require 3 f_dc_* properties, found {dc}"
            )));
        }

        let position_type = header
            .properties
            .first()
            .map(|p| p.ty)
            .ok_or_else(|| GeoSplatError::schema("vertex element has no properties"))?;
        if !matches!(position_type, ScalarType::F32 | ScalarType::F64) {
            return Err(GeoSplatError::schema(format!(
                "position type {} is not float or double",
                position_type.ply_name()
            )));
        }

        let schema = SplatSchema {
            layout: SplatLayout {
                color_coeffs: dc + rest,
                normals: names.contains(&"nx"),
            },
            position_type,
        };

        let expected = schema.property_names();
        let matches = expected.len() == names.len()
            && expected.iter().zip(&names).all(|(e, n)| e.as_str() == *n);
        if !matches {
            return Err(GeoSplatError::schema(format!(
                "vertex properties [{}] do not match the splat layout [{}]",
                names.join(" "),
                expected.join(" ")
            )));
        }

        for ((decl, ty), name) in header
            .properties
            .iter()
            .zip(schema.property_types())
            .zip(&expected)
        {
            if decl.ty != ty {
                return Err(GeoSplatError::schema(format!(
                    "property {name} is {}, expected {}",
                    decl.ty.ply_name(),
                    ty.ply_name()
                )));
            }
        }

        Ok(schema)
    }
}

/// Parse the textual header up to and including `end_header`.
pub fn parse_header(bytes: &[u8]) -> Result<PlyHeader> {
    const END: &[u8] = b"end_header";

    // `end` is where the end_header line starts, `len` where the body starts.
    let mut offset = 0;
    let mut found = None;
    for line in bytes.split_inclusive(|&b| b == b'\n') {
        let next = offset + line.len();
        let content = line.strip_suffix(b"\n").unwrap_or(line);
        let content = content.strip_suffix(b"\r").unwrap_or(content);
        if content == END {
            found = Some((offset, next));
            break;
        }
        offset = next;
    }
    let (end, len) = found.ok_or_else(|| GeoSplatError::schema("missing end_header"))?;

    let text = std::str::from_utf8(&bytes[..end])
        .map_err(|_| GeoSplatError::schema("header is not UTF-8"))?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some("ply") {
        return Err(GeoSplatError::schema("bad PLY magic"));
    }

    let mut format = None;
    let mut vertex_count = None;
    let mut properties = Vec::new();
    let mut other_elements = Vec::new();
    let mut current: Option<String> = None;

    for line in lines {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("format") => {
                format = Some(match parts.next() {
                    Some("ascii") => PlyFormat::Ascii,
                    Some("binary_little_endian") => PlyFormat::BinaryLittleEndian,
                    Some("binary_big_endian") => PlyFormat::BinaryBigEndian,
                    other => {
                        return Err(GeoSplatError::schema(format!(
                            "unknown PLY format {other:?}"
                        )))
                    }
                });
            }
            Some("comment") | Some("obj_info") => {}
            Some("element") => {
                let name = parts.next().unwrap_or_default().to_string();
                let count: usize = parts
                    .next()
                    .and_then(|c| c.parse().ok())
                    .ok_or_else(|| GeoSplatError::schema(format!("bad element line '{line}'")))?;

                if name == "vertex" {
                    if vertex_count.is_some() || !other_elements.is_empty() {
                        return Err(GeoSplatError::schema(
                            "vertex must be the first and only vertex element",
                        ));
                    }
                    vertex_count = Some(count);
                } else {
                    if vertex_count.is_none() {
                        return Err(GeoSplatError::schema(format!(
                            "element '{name}' precedes vertex"
                        )));
                    }
                    other_elements.push(name.clone());
                }
                current = Some(name);
            }
            Some("property") => {
                let in_vertex = current.as_deref() == Some("vertex");
                let ty = parts.next().unwrap_or_default();
                if ty == "list" {
                    if in_vertex {
                        return Err(GeoSplatError::schema("list properties in vertex element"));
                    }
                    continue;
                }
                let ty = ScalarType::parse(ty)
                    .ok_or_else(|| GeoSplatError::schema(format!("unknown type in '{line}'")))?;
                let name = parts
                    .next()
                    .ok_or_else(|| GeoSplatError::schema(format!("bad property line '{line}'")))?;
                if in_vertex {
                    properties.push(PropertyDecl {
                        name: name.to_string(),
                        ty,
                    });
                }
            }
            _ => {
                return Err(GeoSplatError::schema(format!(
                    "unexpected header line '{line}'"
                )))
            }
        }
    }

    Ok(PlyHeader {
        format: format.ok_or_else(|| GeoSplatError::schema("missing format line"))?,
        vertex_count: vertex_count.ok_or_else(|| GeoSplatError::schema("missing vertex element"))?,
        properties,
        other_elements,
        len,
    })
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> Result<()> {
    if buf.len() < want {
        Err(GeoSplatError::schema("truncated vertex data"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

/// Read one binary scalar as f64.
#[inline(always)]
fn scalar(buf: &mut &[u8], ty: ScalarType, big_endian: bool) -> Result<f64> {
    let b = take(buf, ty.size())?;
    macro_rules! num {
        ($t:ty) => {{
            let arr: [u8; std::mem::size_of::<$t>()] = b
                .try_into()
                .map_err(|_| GeoSplatError::schema("scalar size"))?;
            if big_endian {
                <$t>::from_be_bytes(arr) as f64
            } else {
                <$t>::from_le_bytes(arr) as f64
            }
        }};
    }
    Ok(match ty {
        ScalarType::I8 => b[0] as i8 as f64,
        ScalarType::U8 => b[0] as f64,
        ScalarType::I16 => num!(i16),
        ScalarType::U16 => num!(u16),
        ScalarType::I32 => num!(i32),
        ScalarType::U32 => num!(u32),
        ScalarType::F32 => num!(f32),
        ScalarType::F64 => num!(f64),
    })
}

fn record_from_values(v: &[f64], schema: &SplatSchema) -> SplatRecord {
    let mut i = 3 + if schema.layout.normals { 3 } else { 0 };
    let n = schema.layout.color_coeffs;

    let color = v[i..i + n].iter().map(|&c| c as f32).collect();
    i += n;
    let opacity = v[i] as f32;
    i += 1;
    let log_scale = [v[i] as f32, v[i + 1] as f32, v[i + 2] as f32];
    i += 3;
    let rotation = [v[i] as f32, v[i + 1] as f32, v[i + 2] as f32, v[i + 3] as f32];

    SplatRecord {
        position: Vector3::new(v[0], v[1], v[2]),
        log_scale,
        rotation,
        opacity,
        color,
    }
}

/// Parse a splat PLY from memory.
///
/// With `expected_color_coeffs` set, a file declaring any other colour arity
/// is rejected instead of being reinterpreted.
pub fn parse_splat_bytes(bytes: &[u8], expected_color_coeffs: Option<usize>) -> Result<SplatSet> {
    let header = parse_header(bytes)?;
    let schema = SplatSchema::from_header(&header)?;

    if let Some(expected) = expected_color_coeffs {
        if schema.layout.color_coeffs != expected {
            return Err(GeoSplatError::schema(format!(
                "file declares {} colour coefficients per splat, expected {expected}",
                schema.layout.color_coeffs
            )));
        }
    }

    debug!(
        "PLY {:?}: {} splats, {} colour coefficients, normals={}",
        header.format, header.vertex_count, schema.layout.color_coeffs, schema.layout.normals
    );

    let body = &bytes[header.len..];
    let types: Vec<ScalarType> = header.properties.iter().map(|p| p.ty).collect();
    let mut values = vec![0.0f64; types.len()];

    match header.format {
        PlyFormat::Ascii => {
            let text = std::str::from_utf8(body)
                .map_err(|_| GeoSplatError::schema("ascii body is not UTF-8"))?;
            let mut lines = text.lines().filter(|l| !l.trim().is_empty());

            // Every value takes at least a digit and a separator.
            let min_line = 2 * types.len().max(1);
            let mut records = Vec::with_capacity(header.vertex_count.min(body.len() / min_line));

            for index in 0..header.vertex_count {
                let line = lines.next().ok_or_else(|| {
                    GeoSplatError::schema(format!(
                        "expected {} vertices, found {index}",
                        header.vertex_count
                    ))
                })?;
                let count = line.split_whitespace().count();
                if count != types.len() {
                    return Err(GeoSplatError::schema(format!(
                        "vertex {index} has {count} values, expected {}",
                        types.len()
                    )));
                }
                for (slot, token) in values.iter_mut().zip(line.split_whitespace()) {
                    *slot = token.parse().map_err(|_| {
                        GeoSplatError::schema(format!("vertex {index}: bad number '{token}'"))
                    })?;
                }
                records.push(record_from_values(&values, &schema));
            }

            if header.other_elements.is_empty() && lines.next().is_some() {
                return Err(GeoSplatError::schema("trailing data after vertex element"));
            }

            SplatSet::new(schema.layout, records)
        }
        PlyFormat::BinaryLittleEndian | PlyFormat::BinaryBigEndian => {
            let big_endian = header.format == PlyFormat::BinaryBigEndian;
            let stride: usize = types.iter().map(|t| t.size()).sum();
            let total = header
                .vertex_count
                .checked_mul(stride)
                .ok_or_else(|| GeoSplatError::schema("vertex data size overflow"))?;
            need(body, total)?;

            let mut records = Vec::with_capacity(header.vertex_count);
            let mut p = body;
            for _ in 0..header.vertex_count {
                for (slot, &ty) in values.iter_mut().zip(&types) {
                    *slot = scalar(&mut p, ty, big_endian)?;
                }
                records.push(record_from_values(&values, &schema));
            }

            if header.other_elements.is_empty() && !p.is_empty() {
                return Err(GeoSplatError::schema(format!(
                    "{} trailing bytes after {} vertices of {stride} bytes",
                    p.len(),
                    header.vertex_count
                )));
            }

            SplatSet::new(schema.layout, records)
        }
    }
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_splat_file<P: AsRef<Path>>(
    path: P,
    expected_color_coeffs: Option<usize>,
) -> Result<SplatSet> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| GeoSplatError::io(path, e))?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file) }
        .map_err(|e| GeoSplatError::io(path, e))?;
    parse_splat_bytes(&map, expected_color_coeffs)
}

#[cfg(not(feature = "mmap"))]
pub fn read_splat_file<P: AsRef<Path>>(
    path: P,
    expected_color_coeffs: Option<usize>,
) -> Result<SplatSet> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| GeoSplatError::io(path, e))?;
    parse_splat_bytes(&bytes, expected_color_coeffs)
}

/// Writer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// `F64` keeps millimetre precision for ECEF-sized coordinates.
    pub position_type: ScalarType,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            position_type: ScalarType::F32,
        }
    }
}

/// Serialise a splat set as `binary_little_endian` PLY.
pub fn write_splat<W: Write>(w: &mut W, set: &SplatSet, opts: WriteOptions) -> io::Result<()> {
    let schema = SplatSchema {
        layout: set.layout(),
        position_type: opts.position_type,
    };
    if !matches!(opts.position_type, ScalarType::F32 | ScalarType::F64) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "positions must be float or double",
        ));
    }

    writeln!(w, "ply")?;
    writeln!(w, "format binary_little_endian 1.0")?;
    writeln!(w, "comment generated by geosplat")?;
    writeln!(w, "element vertex {}", set.len())?;
    for (name, ty) in schema.property_names().iter().zip(schema.property_types()) {
        writeln!(w, "property {} {name}", ty.ply_name())?;
    }
    writeln!(w, "end_header")?;

    for r in set.records() {
        for &c in r.position.iter() {
            match opts.position_type {
                ScalarType::F64 => w.write_all(&c.to_le_bytes())?,
                _ => w.write_all(&(c as f32).to_le_bytes())?,
            }
        }
        if schema.layout.normals {
            w.write_all(&[0u8; 12])?;
        }
        write_f32s(w, &r.color)?;
        w.write_all(&r.opacity.to_le_bytes())?;
        write_f32s(w, &r.log_scale)?;
        write_f32s(w, &r.rotation)?;
    }

    w.flush()
}

#[inline]
fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    #[cfg(target_endian = "little")]
    {
        w.write_all(bytemuck::cast_slice(values))
    }

    #[cfg(not(target_endian = "little"))]
    {
        for v in values {
            w.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }
}

pub fn write_splat_file<P: AsRef<Path>>(path: P, set: &SplatSet, opts: WriteOptions) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| GeoSplatError::io(path, e))?;
    write_splat(&mut BufWriter::new(file), set, opts).map_err(|e| GeoSplatError::io(path, e))
}
