use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
};

use geosplat::{
    codec::{encode, CommandCodec, EncodedPayload, Quality, DEFAULT_CODEC_TEMPLATE},
    geodesy::ecef_to_geodetic,
    gps::{self, GpsSummary},
    pipeline::{convert, resolve_local_extent, ConvertConfig, Stage, StageContext, StageError},
    ply::{read_splat_file, write_splat_file, ScalarType, WriteOptions},
    splat::apply_transform,
    stats::SplatStats,
    tiles::{assemble_with, reanchor_tileset, rescale_tileset, PayloadMode, TileOptions},
    transform::{
        AnchorInput, AnchorRecord, Correspondences, GeoAnchor, ScalePolicy, ScaleSource,
        TransformArtifact, TransformBuilder,
    },
    GeoSplatError,
};

#[derive(Parser, Debug)]
#[command(name = "splat2tiles", version)]
#[command(about = "Georeference Gaussian splat scenes and package them as 3D Tiles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract GPS fixes from image EXIF and summarise the scene
    Gps {
        #[arg(long)]
        images: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// Image extensions, case-insensitive
        #[arg(long, num_args = 1.., default_values_t = ["jpg".to_string(), "jpeg".to_string()])]
        extensions: Vec<String>,
    },

    /// Build the local -> ECEF similarity transform
    Georef {
        #[arg(long)]
        output: PathBuf,

        #[command(flatten)]
        anchor: AnchorArgs,

        #[command(flatten)]
        scale: ScaleArgs,

        /// Fit the transform to `{ "local": [..], "world": [..] }` point pairs instead
        #[arg(long, conflicts_with_all = ["lat", "lon", "gps", "anchor"])]
        correspondences: Option<PathBuf>,
    },

    /// Apply a transform artifact to every splat
    Transform {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        transform: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// Expected colour coefficients per splat (3 = DC only, 48 = degree 3)
        #[arg(long)]
        sh_coeffs: Option<usize>,

        /// Write positions as float instead of double
        #[arg(long, default_value_t = false)]
        f32_positions: bool,
    },

    /// Encode a splat PLY with the external compact codec
    Encode {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,

        #[command(flatten)]
        codec: CodecArgs,

        #[arg(long)]
        sh_coeffs: Option<usize>,
    },

    /// Wrap an encoded payload into tileset.json + tile_0.gltf
    Assemble {
        /// Georeferenced splats, used for the bounding volume
        #[arg(long)]
        splats: PathBuf,

        /// Encoded scene-frame splats (output of `encode` on the untransformed PLY)
        #[arg(long)]
        payload: PathBuf,

        #[arg(long)]
        transform: PathBuf,

        /// Output directory
        #[arg(long)]
        output: PathBuf,

        #[command(flatten)]
        tile: TileArgs,
    },

    /// Run every stage: PLY -> georeferenced tile directory
    Convert {
        #[arg(long)]
        input: PathBuf,

        /// Output directory
        #[arg(long)]
        output: PathBuf,

        #[command(flatten)]
        anchor: AnchorArgs,

        #[command(flatten)]
        scale: ScaleArgs,

        #[command(flatten)]
        codec: CodecArgs,

        #[command(flatten)]
        tile: TileArgs,

        #[arg(long)]
        sh_coeffs: Option<usize>,

        /// Also write georeferenced.ply (ECEF, double positions)
        #[arg(long, default_value_t = false)]
        keep_georeferenced: bool,
    },

    /// Print splat scale statistics
    Inspect {
        #[arg(long)]
        input: PathBuf,

        /// Emit JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Copy a tile directory with a new root-transform scale
    RescaleTileset {
        #[arg(long)]
        tileset: PathBuf,

        /// New tile directory; must not already hold a tileset
        #[arg(long)]
        output: PathBuf,

        #[arg(long)]
        scale: f64,
    },

    /// Copy a tile directory placed at a new anchor
    ReanchorTileset {
        #[arg(long)]
        tileset: PathBuf,

        /// New tile directory; must not already hold a tileset
        #[arg(long)]
        output: PathBuf,

        #[command(flatten)]
        anchor: AnchorArgs,

        /// New scale; the current one is kept when omitted
        #[arg(long)]
        scale: Option<f64>,
    },
}

// === Shared argument groups ===

#[derive(Args, Debug, Clone)]
struct AnchorArgs {
    /// Anchor latitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lat: Option<f64>,

    /// Anchor longitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lon: Option<f64>,

    /// Height above the WGS-84 ellipsoid in metres (default 0, or the GPS centroid)
    #[arg(long, allow_hyphen_values = true)]
    height: Option<f64>,

    /// GPS summary from `gps`; its centroid is the anchor and its extent the real extent
    #[arg(long, conflicts_with_all = ["lat", "lon", "anchor"])]
    gps: Option<PathBuf>,

    /// Anchor JSON: { latitude, longitude, height, scale?, heightOffset? }
    #[arg(long, conflicts_with_all = ["lat", "lon"])]
    anchor: Option<PathBuf>,

    /// Metres added to the anchor height
    #[arg(long, allow_hyphen_values = true)]
    height_offset: Option<f64>,
}

#[derive(Args, Debug, Clone)]
struct ScaleArgs {
    /// Explicit uniform scale (local units -> metres)
    #[arg(long)]
    scale: Option<f64>,

    /// Local scene extent in scene units
    #[arg(long, conflicts_with = "measure")]
    local_extent: Option<f64>,

    /// Measure the local extent from this splat PLY
    #[arg(long)]
    measure: Option<PathBuf>,

    /// Real-world scene extent in metres (overrides the GPS estimate)
    #[arg(long)]
    real_extent: Option<f64>,

    /// Scale used when nothing else determines one
    #[arg(long, env = "SPLAT2TILES_DEFAULT_SCALE", default_value_t = 10.0)]
    default_scale: f64,

    /// Local extent assumed for normalised training output
    #[arg(long, env = "SPLAT2TILES_ASSUMED_LOCAL_EXTENT", default_value_t = 2.0)]
    assumed_local_extent: f64,
}

impl ScaleArgs {
    fn policy(&self) -> ScalePolicy {
        ScalePolicy {
            default_scale: self.default_scale,
            assumed_local_extent: self.assumed_local_extent,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct CodecArgs {
    /// Compression quality 1-9
    #[arg(long, default_value_t = 7)]
    quality: u8,

    /// Codec command; {input}, {output} and {quality} are substituted
    #[arg(long, env = "SPLAT2TILES_CODEC", default_value = DEFAULT_CODEC_TEMPLATE)]
    codec: String,
}

impl CodecArgs {
    fn build(&self) -> geosplat::Result<(CommandCodec, Quality)> {
        Ok((CommandCodec::from_template(&self.codec)?, Quality::new(self.quality)?))
    }
}

#[derive(Args, Debug, Clone)]
struct TileArgs {
    #[arg(long, default_value_t = 100.0)]
    geometric_error: f64,

    /// World-space margin around the splat bounds, metres
    #[arg(long, default_value_t = 1e-3)]
    box_epsilon: f64,

    /// Embed the payload in tile_0.gltf as a data URI instead of tile_0.spz
    #[arg(long, default_value_t = false)]
    embed: bool,
}

impl TileArgs {
    fn options(&self) -> TileOptions {
        TileOptions {
            geometric_error: self.geometric_error,
            box_epsilon: self.box_epsilon,
            payload_mode: if self.embed {
                PayloadMode::Embedded
            } else {
                PayloadMode::External
            },
        }
    }
}

// === Anchor resolution ===

/// Anchor plus the real-world extent that came with it, if any.
fn resolve_anchor(a: &AnchorArgs, real_extent: Option<f64>) -> geosplat::Result<(GeoAnchor, Option<f64>)> {
    let (mut input, mut real) = if let Some(path) = &a.gps {
        let summary = GpsSummary::read_json(path)?;
        info!(
            "Anchor from GPS centroid of {} images ({:.6}, {:.6}, {:.2} m)",
            summary.with_gps, summary.centroid.lat, summary.centroid.lon, summary.centroid.alt
        );
        (summary.anchor_input(), Some(summary.extent_meters))
    } else if let Some(path) = &a.anchor {
        (AnchorInput::from_json_file(path)?, None)
    } else {
        let (Some(latitude), Some(longitude)) = (a.lat, a.lon) else {
            return Err(GeoSplatError::InvalidAnchor(
                "--lat and --lon are required without --gps or --anchor".into(),
            ));
        };
        let input = AnchorInput {
            latitude,
            longitude,
            height: 0.0,
            scale: None,
            height_offset: None,
        };
        (input, None)
    };

    if let Some(h) = a.height {
        input.height = h;
    }
    if let Some(off) = a.height_offset {
        input.height_offset = Some(input.height_offset.unwrap_or(0.0) + off);
    }
    if real_extent.is_some() {
        real = real_extent;
    }

    Ok((GeoAnchor::try_from(input)?, real))
}

fn with_scale(anchor: GeoAnchor, scale: Option<f64>) -> GeoAnchor {
    match scale {
        Some(s) => anchor.with_scale(s),
        None => anchor,
    }
}

// === Commands ===

fn run_gps(images: &Path, output: &Path, extensions: &[String]) -> Result<(), StageError> {
    let exts: Vec<&str> = extensions.iter().map(String::as_str).collect();
    let summary = gps::scan_directory(images, &exts).stage(Stage::Gps)?;
    summary.write_json(output).stage(Stage::Gps)?;

    info!(
        "{} with GPS, {} without; centroid ({:.6}, {:.6}, {:.2} m); extent {:.2} m -> {}",
        summary.with_gps,
        summary.without_gps,
        summary.centroid.lat,
        summary.centroid.lon,
        summary.centroid.alt,
        summary.extent_meters,
        output.display()
    );
    Ok(())
}

fn run_georef(
    output: &Path,
    anchor: &AnchorArgs,
    scale: &ScaleArgs,
    correspondences: Option<&Path>,
) -> Result<(), StageError> {
    let artifact = if let Some(path) = correspondences {
        let t = Correspondences::from_json_file(path)
            .and_then(|c| c.estimate())
            .stage(Stage::Georef)?;

        let origin = t.translation();
        let (latitude, longitude, height) = ecef_to_geodetic(origin.x, origin.y, origin.z);
        let mut artifact = TransformArtifact::new(&t, ScaleSource::Estimated, None);
        artifact.anchor = Some(AnchorRecord {
            latitude,
            longitude,
            height,
            height_offset: 0.0,
        });
        artifact
    } else {
        let (geo, real) = resolve_anchor(anchor, scale.real_extent).stage(Stage::Georef)?;
        let geo = with_scale(geo, scale.scale);

        let measured = match &scale.measure {
            Some(ply) => read_splat_file(ply, None).stage(Stage::Read)?.extent(),
            None => None,
        };
        let policy = scale.policy();
        let local = resolve_local_extent(scale.local_extent, measured, real.is_some(), &policy);

        let built = TransformBuilder::new(policy)
            .build(&geo, local, real)
            .stage(Stage::Georef)?;
        TransformArtifact::new(&built.transform, built.scale_source, Some(&geo))
    };

    artifact.write_json(output).stage(Stage::Georef)?;
    info!(
        "Transform (scale {:.4}, {}) -> {}",
        artifact.scale,
        artifact.scale_source.as_str(),
        output.display()
    );
    Ok(())
}

fn run_transform(
    input: &Path,
    transform: &Path,
    output: &Path,
    sh_coeffs: Option<usize>,
    f32_positions: bool,
) -> Result<(), StageError> {
    let t = TransformArtifact::read_json(transform)
        .and_then(|a| a.transform())
        .stage(Stage::Transform)?;
    let set = read_splat_file(input, sh_coeffs).stage(Stage::Read)?;
    let out = apply_transform(&set, &t).stage(Stage::Transform)?;

    let position_type = if f32_positions {
        warn!("Writing ECEF positions as float loses sub-metre precision");
        ScalarType::F32
    } else {
        ScalarType::F64
    };
    write_splat_file(output, &out, WriteOptions { position_type }).stage(Stage::Transform)?;

    info!("Transformed {} splats -> {}", out.len(), output.display());
    Ok(())
}

fn run_encode(
    input: &Path,
    output: &Path,
    codec: &CodecArgs,
    sh_coeffs: Option<usize>,
) -> Result<(), StageError> {
    let (codec, quality) = codec.build().stage(Stage::Encode)?;
    let set = read_splat_file(input, sh_coeffs).stage(Stage::Read)?;
    let payload = encode(&set, quality, &codec).stage(Stage::Encode)?;

    fs::write(output, &payload.buffer)
        .map_err(|e| GeoSplatError::Io {
            path: output.to_path_buf(),
            source: e,
        })
        .stage(Stage::Encode)?;
    Ok(())
}

fn run_assemble(
    splats: &Path,
    payload: &Path,
    transform: &Path,
    output: &Path,
    tile: &TileArgs,
) -> Result<(), StageError> {
    let t = TransformArtifact::read_json(transform)
        .and_then(|a| a.transform())
        .stage(Stage::Assemble)?;
    let transformed = read_splat_file(splats, None).stage(Stage::Read)?;

    let buffer = fs::read(payload)
        .map_err(|e| GeoSplatError::Io {
            path: payload.to_path_buf(),
            source: e,
        })
        .stage(Stage::Assemble)?;
    let encoded = EncodedPayload {
        original_byte_length: (transformed.len() * transformed.layout().flat_width() * 4) as u64,
        encoded_byte_length: buffer.len() as u64,
        buffer,
    };

    let opts = tile.options();
    let asset = assemble_with(&transformed, encoded, &t, &opts).stage(Stage::Assemble)?;
    asset.write_dir(output, opts.payload_mode).stage(Stage::Assemble)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_convert(
    input: &Path,
    output: &Path,
    anchor: &AnchorArgs,
    scale: &ScaleArgs,
    codec: &CodecArgs,
    tile: &TileArgs,
    sh_coeffs: Option<usize>,
    keep_georeferenced: bool,
) -> Result<(), StageError> {
    let (geo, real) = resolve_anchor(anchor, scale.real_extent).stage(Stage::Georef)?;
    let (codec, quality) = codec.build().stage(Stage::Encode)?;

    let local_extent = match &scale.measure {
        Some(ply) => read_splat_file(ply, None).stage(Stage::Read)?.extent(),
        None => scale.local_extent,
    };

    let cfg = ConvertConfig {
        anchor: with_scale(geo, scale.scale),
        local_extent,
        // Without an explicit extent, measure the input itself.
        measure_local_extent: local_extent.is_none() && real.is_some(),
        real_extent: real,
        policy: scale.policy(),
        expected_color_coeffs: sh_coeffs,
        quality,
        tile: tile.options(),
        write_georeferenced: keep_georeferenced,
    };

    let report = convert(input, output, &cfg, &codec)?;
    info!(
        "Converted {} splats (scale {:.4}, {}) -> {}",
        report.splat_count,
        report.built.transform.scale(),
        report.built.scale_source.as_str(),
        report.output.tileset.display()
    );
    Ok(())
}

fn run_inspect(input: &Path, json: bool) -> Result<()> {
    let set = read_splat_file(input, None).stage(Stage::Read)?;
    let stats = SplatStats::compute(&set).stage(Stage::Inspect)?;

    let mut out = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &stats).context("writing JSON report")?;
        writeln!(out)?;
    } else {
        writeln!(out, "{stats}")?;
    }

    if let Some(r) = stats.relative_scale {
        if r < 1e-3 {
            warn!("Mean splat scale is {r:.2e} of the scene size; splats may render as points");
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Gps {
            images,
            output,
            extensions,
        } => run_gps(&images, &output, &extensions)?,
        Commands::Georef {
            output,
            anchor,
            scale,
            correspondences,
        } => run_georef(&output, &anchor, &scale, correspondences.as_deref())?,
        Commands::Transform {
            input,
            transform,
            output,
            sh_coeffs,
            f32_positions,
        } => run_transform(&input, &transform, &output, sh_coeffs, f32_positions)?,
        Commands::Encode {
            input,
            output,
            codec,
            sh_coeffs,
        } => run_encode(&input, &output, &codec, sh_coeffs)?,
        Commands::Assemble {
            splats,
            payload,
            transform,
            output,
            tile,
        } => run_assemble(&splats, &payload, &transform, &output, &tile)?,
        Commands::Convert {
            input,
            output,
            anchor,
            scale,
            codec,
            tile,
            sh_coeffs,
            keep_georeferenced,
        } => run_convert(
            &input,
            &output,
            &anchor,
            &scale,
            &codec,
            &tile,
            sh_coeffs,
            keep_georeferenced,
        )?,
        Commands::Inspect { input, json } => run_inspect(&input, json)?,
        Commands::RescaleTileset {
            tileset,
            output,
            scale,
        } => {
            let previous = rescale_tileset(&tileset, &output, scale).stage(Stage::Rescale)?;
            info!("Scale {previous} -> {scale}");
        }
        Commands::ReanchorTileset {
            tileset,
            output,
            anchor,
            scale,
        } => {
            let (geo, _) = resolve_anchor(&anchor, None).stage(Stage::Reanchor)?;
            reanchor_tileset(&tileset, &output, &with_scale(geo, scale)).stage(Stage::Reanchor)?;
        }
    }
    Ok(())
}

/// One line: `<stage>: <Kind>: <detail>` for pipeline failures.
fn diagnostic(err: &anyhow::Error) -> String {
    let line = match err.downcast_ref::<StageError>() {
        Some(e) => e.to_string(),
        None => format!("splat2tiles: {err:#}"),
    };
    line.replace(['\n', '\r'], " ")
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", diagnostic(&err));
            ExitCode::FAILURE
        }
    }
}
