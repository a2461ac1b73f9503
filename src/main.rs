use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use image::ImageFormat;
use tracing::{debug, info, warn};

use regionview::sampling::{DecodeOutcome, PixelBuffer, Rotation, SamplingDecoder, TileCache};
use regionview::{DecoderConfig, Rect, Size};

/// Longest side of the output when no display size is given.
const DEFAULT_DISPLAY_EDGE: u32 = 2048;

#[derive(Parser, Debug)]
#[command(name = "regionview", about = "Decode a region of a large image")]
struct Args {
    /// Encoded image to open
    input: PathBuf,
    /// Region to decode as x,y,w,h in displayed image pixels (default: whole image)
    #[arg(long, value_parser = parse_rect)]
    rect: Option<Rect>,
    /// Size the region is shown at, as WxH
    #[arg(long, value_parser = parse_size)]
    display: Option<Size>,
    /// Rotation in degrees, overriding the embedded orientation
    #[arg(long, allow_hyphen_values = true)]
    rotation: Option<i32>,
    /// Where to write the decoded region
    #[arg(long, default_value = "region.png")]
    out: PathBuf,
    /// Also write the placeholder thumbnail
    #[arg(long)]
    thumbnail: Option<PathBuf>,
    /// Decode the visible tiles of an N-block grid and report counts
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    tiles: Option<u32>,
    /// Target thumbnail width
    #[arg(long)]
    thumb_width: Option<u32>,
}

fn parse_rect(s: &str) -> Result<Rect, String> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid rect '{}': {}", s, e))?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(Rect::new(*x, *y, *w, *h)),
        _ => Err(format!("expected x,y,w,h but got '{}'", s)),
    }
}

fn parse_size(s: &str) -> Result<Size, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH but got '{}'", s))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid size '{}': {}", s, e))
    };
    Ok(Size::new(parse(w)?, parse(h)?))
}

/// Scale `rect` down so its longest side fits `edge`.
fn fit_within(rect: Rect, edge: u32) -> Size {
    let longest = rect.width.max(rect.height).max(1);
    if longest <= edge {
        return Size::new(rect.width, rect.height);
    }
    let scale = edge as f64 / longest as f64;
    Size::new(
        ((rect.width as f64 * scale).round() as u32).max(1),
        ((rect.height as f64 * scale).round() as u32).max(1),
    )
}

async fn write_png(buffer: Arc<PixelBuffer>, path: &Path) -> Result<()> {
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        buffer
            .as_image()
            .save_with_format(&target, ImageFormat::Png)
    })
    .await
    .context("PNG writer task failed")?
    .with_context(|| format!("failed to write {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("regionview=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let mut config = DecoderConfig::from_env();
    if let Some(width) = args.thumb_width {
        config.thumbnail_width = width;
    }
    if let Some(count) = args.tiles {
        config.max_block_count = count;
    }
    let rotation = args.rotation.map(Rotation::from_degrees).transpose()?;
    let cache = TileCache::new(config.tile_cache_mb);

    let decoder = tokio::task::spawn_blocking(move || {
        SamplingDecoder::builder()
            .rotation(rotation)
            .config(config)
            .cache(cache)
            .open(&bytes)
    })
    .await
    .context("decoder task failed")?
    .with_context(|| format!("failed to open {}", args.input.display()))?;

    let size = decoder.intrinsic_size();
    info!(
        width = size.width,
        height = size.height,
        rotation = decoder.rotation().degrees(),
        "Opened image"
    );
    println!(
        "{}: {}x{}, rotation {}",
        args.input.display(),
        size.width,
        size.height,
        decoder.rotation().degrees()
    );

    if let Some(path) = &args.thumbnail {
        let thumb = decoder.thumbnail()?;
        println!("thumbnail: {}x{}", thumb.width(), thumb.height());
        write_png(thumb, path).await?;
    }

    let rect = args
        .rect
        .unwrap_or_else(|| Rect::of_size(size.width, size.height));
    let display = args
        .display
        .unwrap_or_else(|| fit_within(rect, DEFAULT_DISPLAY_EDGE));

    if args.tiles.is_some() {
        let handles = decoder.request_tiles(rect, display)?;
        let total = handles.len();
        let (mut decoded, mut failed) = (0usize, 0usize);
        for (index, handle) in handles {
            match handle.outcome().await {
                DecodeOutcome::Decoded(region) => {
                    decoded += 1;
                    debug!(
                        col = index.col,
                        row = index.row,
                        width = region.buffer.width(),
                        height = region.buffer.height(),
                        "Decoded tile"
                    );
                }
                DecodeOutcome::Failed(err) => {
                    failed += 1;
                    warn!(col = index.col, row = index.row, error = %err, "Tile failed");
                }
                DecodeOutcome::Superseded | DecodeOutcome::Cancelled => {}
            }
        }
        println!(
            "tiles: {} visible, {} decoded, {} failed",
            total, decoded, failed
        );
    }

    let handle = decoder.request_region(rect, display)?;
    let sample_size = handle.sample_size();
    let region = match handle.outcome().await {
        DecodeOutcome::Decoded(region) => region,
        DecodeOutcome::Failed(err) => {
            return Err(err).with_context(|| format!("failed to decode {:?}", rect))
        }
        other => bail!("region request ended without pixels: {:?}", other),
    };
    println!(
        "region {:?} at sample size {}: {}x{}{}",
        rect,
        sample_size,
        region.buffer.width(),
        region.buffer.height(),
        if region.from_cache { " (cached)" } else { "" }
    );
    write_png(region.buffer, &args.out).await?;
    info!(path = %args.out.display(), "Wrote region");

    decoder.release();
    Ok(())
}
