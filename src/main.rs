//! Tree top detection and Voronoi crowns from a canopy height GeoTIFF.
//!
//! Usage:
//!   treeseg CHM.tif
//!   treeseg CHM.tif --method fixed --min-distance 2 --threshold 5 --crowns crowns.csv
//!
//! Writes:
//!   tree_tops.csv: id, row, col, x, y, h
//!   crowns.csv:    id, x, y, area, wkt   (with --crowns)

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use csv::Writer;
use log::{info, warn};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use treeseg::{
    Affine, Allometry, BorderExclusion, DetectionResult, FixedWindowMaxima, FixedWindowParams,
    HeightModel, HullCells, MaximaDetector, PeakLimit, SegmentationResult, VariableWindowMaxima,
    VariableWindowParams, VoronoiParams, VoronoiSegmenter,
};

const GDAL_NODATA: u16 = 42113;
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const USER_DEFINED: u16 = 32767;

// ==========================================================================
// GeoTIFF georeference
// ==========================================================================

/// Affine transform from ModelTransformation, or ModelPixelScale + ModelTiepoint.
fn geotiff_affine<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Result<Affine> {
    if let Some(m) = decoder.find_tag(Tag::ModelTransformationTag)? {
        let m = m.into_f64_vec()?;
        if m.len() >= 8 {
            return Ok(Affine::new(m[0], m[1], m[3], m[4], m[5], m[7]));
        }
    }

    let scale = match decoder.find_tag(Tag::ModelPixelScaleTag)? {
        Some(v) => v.into_f64_vec()?,
        None => bail!("missing ModelPixelScale (33550) tag"),
    };
    let tie = match decoder.find_tag(Tag::ModelTiepointTag)? {
        Some(v) => v.into_f64_vec()?,
        None => bail!("missing ModelTiepoint (33922) tag"),
    };
    if scale.len() < 2 || tie.len() < 6 {
        bail!("malformed GeoTIFF scale/tiepoint tags");
    }
    // tiepoint (i, j, k, x, y, z): raster (i, j) maps to (x, y)
    let (res_x, res_y) = (scale[0], scale[1]);
    let origin_x = tie[3] - tie[0] * res_x;
    let origin_y = tie[4] + tie[1] * res_y;
    Ok(Affine::north_up(origin_x, origin_y, res_x, res_y))
}

/// `EPSG:<code>` from the GeoKey directory, if it names one.
fn geotiff_crs<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Option<String> {
    let keys = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)
        .ok()??
        .into_u16_vec()
        .ok()?;
    // header (version, revision, minor, count), then (id, location, count, value)
    let mut projected = None;
    let mut geographic = None;
    for entry in keys.get(4..)?.chunks_exact(4) {
        let (id, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 || value == USER_DEFINED {
            continue;
        }
        match id {
            PROJECTED_CS_TYPE_KEY => projected = Some(value),
            GEOGRAPHIC_TYPE_KEY => geographic = Some(value),
            _ => {}
        }
    }
    projected.or(geographic).map(|code| format!("EPSG:{code}"))
}

fn geotiff_nodata<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder
        .find_tag(Tag::Unknown(GDAL_NODATA))
        .ok()??
        .into_string()
        .ok()?;
    text.trim_matches(char::from(0)).trim().parse().ok()
}

// ==========================================================================
// GeoTIFF loading
// ==========================================================================

fn load_geotiff(path: &Path, band: usize) -> Result<HeightModel> {
    let file = File::open(path).with_context(|| format!("cannot open '{}'", path.display()))?;
    let mut decoder = Decoder::new(BufReader::new(file)).context("TIFF decoding failed")?;

    let (width, height) = decoder.dimensions()?;
    let ncol = width as usize;
    let nrow = height as usize;

    let affine = geotiff_affine(&mut decoder)?;
    let crs = geotiff_crs(&mut decoder);
    let nodata = geotiff_nodata(&mut decoder);
    if crs.is_none() {
        warn!("no EPSG code in GeoKey directory, outputs carry no CRS");
    }

    let raw: Vec<f64> = match decoder.read_image().context("cannot read raster samples")? {
        DecodingResult::F64(v) => v,
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        _ => bail!("unsupported sample format"),
    };

    // Multi-band images are pixel-interleaved.
    let total = nrow * ncol;
    let n_bands = if total == 0 { 1 } else { raw.len() / total };
    if band >= n_bands {
        bail!("band {band} requested, image has {n_bands}");
    }
    let heights: Vec<f64> = (0..total)
        .map(|px| raw[px * n_bands + band])
        .map(|v| match nodata {
            Some(nd) if v == nd => f64::NAN,
            _ => v,
        })
        .collect();

    let model = HeightModel::new(nrow, ncol, heights)?.with_affine(affine)?;
    Ok(match crs {
        Some(crs) => model.with_crs(crs),
        None => model,
    })
}

// ==========================================================================
// CSV export
// ==========================================================================

fn export_tops(detections: &DetectionResult<'_>, path: &Path) -> Result<()> {
    let mut wtr = Writer::from_writer(BufWriter::new(File::create(path)?));
    wtr.write_record(["id", "row", "col", "x", "y", "h"])?;
    let coords = detections.coordinates()?;
    let heights = detections.heights();
    for (i, ((mark, p), h)) in detections
        .marks()
        .iter()
        .zip(&coords)
        .zip(&heights)
        .enumerate()
    {
        wtr.write_record([
            (i + 1).to_string(),
            mark.row.to_string(),
            mark.col.to_string(),
            format!("{:.2}", p.x),
            format!("{:.2}", p.y),
            format!("{:.2}", h),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn export_crowns(crowns: &SegmentationResult, path: &Path) -> Result<()> {
    let mut wtr = Writer::from_writer(BufWriter::new(File::create(path)?));
    wtr.write_record(["id", "x", "y", "area", "wkt"])?;
    for crown in crowns.crowns() {
        wtr.write_record([
            (crown.seed + 1).to_string(),
            format!("{:.2}", crown.apex.x),
            format!("{:.2}", crown.apex.y),
            format!("{:.2}", crown.polygon.area()),
            crown.polygon.to_wkt(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

// ==========================================================================
// CLI (clap)
// ==========================================================================

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    /// Fixed-window local maxima
    Fixed,
    /// Allometric variable-window local maxima
    Variable,
}

#[derive(Parser, Debug)]
#[command(
    name = "treeseg",
    about = "Tree top detection and Voronoi crowns on a canopy height GeoTIFF",
    after_help = "Writes tree tops (id, row, col, x, y, h) and optionally crowns (id, x, y, area, wkt) as CSV"
)]
struct Cli {
    /// Canopy height model GeoTIFF
    #[arg(value_name = "CHM.tif")]
    chm: PathBuf,

    /// Band to read (0-based)
    #[arg(long, default_value_t = 0)]
    band: usize,

    /// Detection method
    #[arg(long, value_enum, default_value_t = Method::Variable)]
    method: Method,

    /// Minimum distance between tops / candidate filter half-size (map units)
    #[arg(long, default_value_t = 1.0)]
    min_distance: f64,

    /// Minimum tree top height
    #[arg(long)]
    threshold: Option<f64>,

    /// Keep at most this many tops (fixed method)
    #[arg(long)]
    max_peaks: Option<usize>,

    /// Discard tops within this margin of the raster edge, map units (fixed method)
    #[arg(long)]
    border: Option<f64>,

    /// Allometry intercept: window = a + b·h²
    #[arg(long, default_value_t = Allometry::DEFAULT_A)]
    allometry_a: f64,

    /// Allometry quadratic coefficient
    #[arg(long, default_value_t = Allometry::DEFAULT_B)]
    allometry_b: f64,

    /// Do not clip crowns to the raster extent
    #[arg(long)]
    no_clip: bool,

    /// Close hull crowns against the raster extent instead of dropping them
    #[arg(long)]
    close_hull: bool,

    /// Tree top CSV output
    #[arg(long, default_value = "tree_tops.csv")]
    tops: PathBuf,

    /// Crown CSV output; crowns are only computed when set
    #[arg(long)]
    crowns: Option<PathBuf>,
}

fn build_detector(cli: &Cli) -> Result<Box<dyn MaximaDetector>> {
    Ok(match cli.method {
        Method::Fixed => Box::new(FixedWindowMaxima::new(FixedWindowParams {
            min_distance: cli.min_distance,
            threshold_abs: cli.threshold,
            exclude_border: cli
                .border
                .map_or(BorderExclusion::MinDistance, BorderExclusion::Margin),
            max_peaks: cli.max_peaks.map_or(PeakLimit::Unbounded, PeakLimit::AtMost),
        })?),
        Method::Variable => {
            let defaults = VariableWindowParams::default();
            Box::new(VariableWindowMaxima::new(VariableWindowParams {
                min_distance: cli.min_distance,
                threshold_abs: cli.threshold.or(defaults.threshold_abs),
                allometry: Allometry::quadratic(cli.allometry_a, cli.allometry_b),
            })?)
        }
    })
}

// ==========================================================================
// Main
// ==========================================================================

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let detector = build_detector(&cli)?;

    info!("loading '{}'", cli.chm.display());
    let chm = load_geotiff(&cli.chm, cli.band)?;
    let bbox = chm.bounding_box()?;
    let hectares = bbox.area() / 10_000.0;
    println!(
        "  {} x {} cells ({:.0} x {:.0} = {:.2} ha){}",
        chm.ncol(),
        chm.nrow(),
        bbox.width(),
        bbox.height(),
        hectares,
        chm.crs().map(|c| format!(", {c}")).unwrap_or_default()
    );

    let t0 = std::time::Instant::now();
    let tops = detector.detect(&chm)?;
    println!(
        "  {} tree tops ({:?}) in {:.2}s",
        tops.len(),
        cli.method,
        t0.elapsed().as_secs_f64()
    );
    if !tops.is_empty() {
        let hs = tops.heights();
        let h_min = hs.iter().copied().fold(f64::INFINITY, f64::min);
        let h_max = hs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let h_mean = hs.iter().sum::<f64>() / hs.len() as f64;
        println!("  heights: min={h_min:.1} mean={h_mean:.1} max={h_max:.1}");
        if hectares > 0.0 {
            println!("  density: {:.0} tops/ha", tops.len() as f64 / hectares);
        }
    }
    export_tops(&tops, &cli.tops)
        .with_context(|| format!("cannot write '{}'", cli.tops.display()))?;
    println!("  tops -> '{}'", cli.tops.display());

    if let Some(path) = &cli.crowns {
        let segmenter = VoronoiSegmenter::new(VoronoiParams {
            clip_to_extent: !cli.no_clip,
            hull_cells: if cli.close_hull {
                HullCells::CloseAtExtent
            } else {
                HullCells::Drop
            },
            ..Default::default()
        });
        let t0 = std::time::Instant::now();
        let crowns = segmenter.segment(&tops)?;
        println!(
            "  {} crowns in {:.2}s, {:.1} m² mean",
            crowns.len(),
            t0.elapsed().as_secs_f64(),
            if crowns.is_empty() {
                0.0
            } else {
                crowns.total_area() / crowns.len() as f64
            }
        );
        export_crowns(&crowns, path)
            .with_context(|| format!("cannot write '{}'", path.display()))?;
        println!("  crowns -> '{}'", path.display());
    }
    Ok(())
}
