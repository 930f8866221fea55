//! Boundary to an external compact splat codec.
//!
//! The core never looks inside the encoded buffer. It hands the codec one
//! fixed-width record per splat and takes back a single contiguous buffer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use log::{debug, info};

use crate::error::{GeoSplatError, Result};
use crate::ply::{write_splat_file, ScalarType, WriteOptions};
use crate::splat::SplatSet;

/// Compression quality in `1..=9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quality(u8);

impl Quality {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 9;

    pub fn new(q: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&q) {
            Ok(Self(q))
        } else {
            Err(GeoSplatError::InvalidQuality(q))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(7)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Quality {
    type Err = GeoSplatError;

    fn from_str(s: &str) -> Result<Self> {
        let q: u8 = s
            .trim()
            .parse()
            .map_err(|_| GeoSplatError::QualityNotANumber(s.to_string()))?;
        Quality::new(q)
    }
}

/// A compact splat codec.
pub trait SplatCodec {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// File extension of the encoded payload.
    fn file_extension(&self) -> &str {
        "spz"
    }

    /// Encode a non-empty splat set into one opaque buffer.
    fn encode(&self, set: &SplatSet, quality: Quality) -> Result<Vec<u8>>;
}

/// Codec output plus the byte counts reported alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub buffer: Vec<u8>,
    /// Size of the flat f32 record schema handed to the codec.
    pub original_byte_length: u64,
    pub encoded_byte_length: u64,
}

impl EncodedPayload {
    pub fn ratio(&self) -> f64 {
        if self.encoded_byte_length == 0 {
            0.0
        } else {
            self.original_byte_length as f64 / self.encoded_byte_length as f64
        }
    }
}

/// Run `codec` over `set`.
pub fn encode<C: SplatCodec + ?Sized>(
    set: &SplatSet,
    quality: Quality,
    codec: &C,
) -> Result<EncodedPayload> {
    if set.is_empty() {
        return Err(GeoSplatError::EmptyInput);
    }
    set.validate()?;

    let original_byte_length =
        (set.len() * set.layout().flat_width() * std::mem::size_of::<f32>()) as u64;

    let buffer = codec.encode(set, quality)?;
    if buffer.is_empty() {
        return Err(GeoSplatError::EncodingFailed {
            codec: codec.name().to_string(),
            diagnostic: "codec produced an empty buffer".into(),
        });
    }

    let payload = EncodedPayload {
        encoded_byte_length: buffer.len() as u64,
        buffer,
        original_byte_length,
    };

    info!(
        "Encoded {} splats with {} (quality {quality}): {} -> {} bytes ({:.1}x)",
        set.len(),
        codec.name(),
        payload.original_byte_length,
        payload.encoded_byte_length,
        payload.ratio()
    );

    Ok(payload)
}

/// Default external transcoder invocation.
pub const DEFAULT_CODEC_TEMPLATE: &str = "gsbox p2z -i {input} -o {output} -q {quality}";

/// File-based external codec run as a child process.
///
/// Arguments may contain `{input}`, `{output}` and `{quality}` placeholders.
/// Input and output files live in a temporary directory that is removed
/// when the call returns, on success and on failure.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    program: String,
    args: Vec<String>,
    temp_root: Option<PathBuf>,
}

impl CommandCodec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            temp_root: None,
        }
    }

    /// Parse a whitespace-separated command template.
    pub fn from_template(template: &str) -> Result<Self> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| GeoSplatError::EncodingFailed {
            codec: "<none>".into(),
            diagnostic: "empty codec command".into(),
        })?;
        Ok(Self::new(program, parts.collect()))
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    fn failed(&self, diagnostic: impl Into<String>) -> GeoSplatError {
        GeoSplatError::EncodingFailed {
            codec: self.program.clone(),
            diagnostic: diagnostic.into(),
        }
    }

    fn expand(&self, input: &Path, output: &Path, quality: Quality) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{quality}", &quality.to_string())
            })
            .collect()
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        let mut parts = DEFAULT_CODEC_TEMPLATE.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self::new(program, parts.collect())
    }
}

impl SplatCodec for CommandCodec {
    fn name(&self) -> &str {
        &self.program
    }

    fn encode(&self, set: &SplatSet, quality: Quality) -> Result<Vec<u8>> {
        let scratch = match &self.temp_root {
            Some(root) => tempfile::Builder::new().prefix("geosplat-").tempdir_in(root),
            None => tempfile::Builder::new().prefix("geosplat-").tempdir(),
        }
        .map_err(|e| self.failed(format!("cannot create scratch directory: {e}")))?;

        let input = scratch.path().join("input.ply");
        let output = scratch.path().join(format!("output.{}", self.file_extension()));

        // Codecs quantise positions; single precision is all they read.
        write_splat_file(
            &input,
            set,
            WriteOptions {
                position_type: ScalarType::F32,
            },
        )?;

        let args = self.expand(&input, &output, quality);
        debug!("Running {} {}", self.program, args.join(" "));

        let out = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| self.failed(format!("cannot run: {e}")))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output");
            return Err(self.failed(format!("{} ({})", detail.trim(), out.status)));
        }

        std::fs::read(&output)
            .map_err(|e| self.failed(format!("no output at {}: {e}", output.display())))
    }
}
