use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufRead, BufReader, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context};
use futures::{future::join_all, StreamExt};
use image::{imageops::FilterType, ColorType, DynamicImage, ImageFormat};
use tokio::{sync::mpsc, task};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    images::ImageIndex,
    types::ArticleRecord,
    utils::existing_ids,
};

/// Directory under the dataset dir holding resized images until they are
/// moved into a partition.
pub const STAGING_DIR: &str = "staging";

/// One realized example. The image itself stays on disk at `staged`.
#[derive(Debug, Clone)]
pub struct DatasetItem {
    pub record_index: usize,
    // position of the image within its record's validated links
    pub position: usize,
    pub image_id: u64,
    pub pageid: u64,
    pub title: String,
    pub text: Option<String>,
    pub summary: Option<String>,
    pub staged: PathBuf,
}

/// Contiguous record ranges for `workers` shards over `len` records. The last
/// shard absorbs the remainder.
pub fn shard_ranges(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let chunk = len / workers;
    (0..workers)
        .map(|k| {
            let start = k * chunk;
            let end = if k == workers - 1 { len } else { (k + 1) * chunk };
            start..end
        })
        .collect()
}

/// Byte offset of every non-blank line, computed in one pass.
pub fn line_offsets(path: &Path) -> anyhow::Result<Vec<u64>> {
    let file = File::open(path).context(format!("could not open {:?}", path))?;
    let mut reader = BufReader::new(file);
    let mut offsets = vec![];
    let mut pos = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        if !line.trim().is_empty() {
            offsets.push(pos);
        }
        pos += n as u64;
    }
    Ok(offsets)
}

/// Downscales so the longest side is at most `max_side`, keeping the aspect
/// ratio. Smaller images are returned untouched; `max_side == 0` disables the cap.
pub fn fit_within(image: DynamicImage, max_side: u32) -> DynamicImage {
    if max_side == 0 || (image.width() <= max_side && image.height() <= max_side) {
        return image;
    }
    image.resize(max_side, max_side, FilterType::Triangle)
}

/// Maps float pixel types, which PNG cannot store, to 8 bits per channel.
pub fn encodable(image: DynamicImage) -> DynamicImage {
    match image.color() {
        ColorType::Rgb32F => DynamicImage::ImageRgb8(image.to_rgb8()),
        ColorType::Rgba32F => DynamicImage::ImageRgba8(image.to_rgba8()),
        _ => image,
    }
}

/// Resizes `image` and writes it as PNG to `path`.
pub fn stage_image(image: DynamicImage, max_side: u32, path: &Path) -> image::ImageResult<()> {
    encodable(fit_within(image, max_side)).save_with_format(path, ImageFormat::Png)
}

struct ShardContext {
    articles: PathBuf,
    offsets: Vec<u64>,
    index: ImageIndex,
    local: HashMap<u64, PathBuf>,
    staging: PathBuf,
    max_side: u32,
}

pub struct DatasetBuilder {
    articles: PathBuf,
    image_dir: PathBuf,
    staging: PathBuf,
    index: ImageIndex,
    workers: usize,
    max_side: u32,
}

impl DatasetBuilder {
    pub fn new(
        articles: &Path,
        image_dir: &Path,
        staging: &Path,
        index: ImageIndex,
        workers: usize,
        max_side: u32,
    ) -> Self {
        DatasetBuilder {
            articles: articles.into(),
            image_dir: image_dir.into(),
            staging: staging.into(),
            index,
            workers,
            max_side,
        }
    }

    /// Realizes every resolvable image of every record.
    ///
    /// Shards are decoded concurrently and each resized image is written to
    /// the staging dir right away, so only metadata is held in memory. The
    /// result is sorted by record and image position so downstream stages
    /// see a stable order.
    pub async fn build(self) -> anyhow::Result<Vec<DatasetItem>> {
        if self.staging.exists() {
            fs::remove_dir_all(&self.staging)
                .context(format!("could not clear staging dir {:?}", self.staging))?;
        }
        fs::create_dir_all(&self.staging)
            .context(format!("could not create staging dir {:?}", self.staging))?;

        let offsets = line_offsets(&self.articles)?;
        let local = existing_ids(&self.image_dir)?;
        let ranges = shard_ranges(offsets.len(), self.workers);
        info!(
            "building dataset from {} records and {} local images with {} workers",
            offsets.len(),
            local.len(),
            ranges.len()
        );

        let ctx = Arc::new(ShardContext {
            articles: self.articles,
            offsets,
            index: self.index,
            local,
            staging: self.staging,
            max_side: self.max_side,
        });

        let (tx, rx) = mpsc::channel::<DatasetItem>(256);
        let handles = ranges
            .into_iter()
            .enumerate()
            .map(|(shard, range)| {
                let ctx = ctx.clone();
                let tx = tx.clone();
                task::spawn_blocking(move || run_shard(&ctx, shard, range, tx))
            })
            .collect::<Vec<_>>();
        drop(tx);

        let mut items = ReceiverStream::new(rx).collect::<Vec<_>>().await;

        for res in join_all(handles).await {
            res.map_err(|e| anyhow!("shard worker panicked: {}", e))??;
        }

        items.sort_by_key(|i| (i.record_index, i.position));
        info!("dataset realized {} images", items.len());
        Ok(items)
    }
}

fn run_shard(
    ctx: &ShardContext,
    shard: usize,
    range: Range<usize>,
    tx: mpsc::Sender<DatasetItem>,
) -> anyhow::Result<usize> {
    if range.is_empty() {
        debug!("shard {} is empty", shard);
        return Ok(0);
    }
    debug!("shard {} reading records {:?}", shard, range);

    let mut file = File::open(&ctx.articles)
        .context(format!("could not open {:?}", ctx.articles))?;
    file.seek(SeekFrom::Start(ctx.offsets[range.start]))?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut produced = 0;

    for record_index in range {
        // blank lines were not indexed, step over them
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(anyhow!("{:?} ended before record {}", ctx.articles, record_index));
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        let record: ArticleRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("shard {}: skipping unparseable record {}: {}", shard, record_index, e);
                continue;
            }
        };

        for (position, url) in record.images.iter().enumerate() {
            let image_id = match ctx.index.id(url) {
                Some(id) => id,
                None => {
                    warn!("{} has no assigned id", url);
                    continue;
                }
            };
            let path = match ctx.local.get(&image_id) {
                Some(p) => p,
                None => {
                    debug!("no local image for id {} ({})", image_id, url);
                    continue;
                }
            };
            let image = match fs::read(path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| image::load_from_memory(&bytes).map_err(anyhow::Error::from))
            {
                Ok(img) => img,
                Err(e) => {
                    warn!("skipping unreadable image {:?}: {}", path, e);
                    continue;
                }
            };
            let staged = ctx
                .staging
                .join(format!("{}_{}.png", record_index, position));
            if let Err(e) = stage_image(image, ctx.max_side, &staged) {
                warn!("skipping image {:?} that cannot be re-encoded: {}", path, e);
                continue;
            }

            let item = DatasetItem {
                record_index,
                position,
                image_id,
                pageid: record.pageid,
                title: record.title.clone(),
                text: record.text.clone(),
                summary: record.summary.clone(),
                staged,
            };
            if tx.blocking_send(item).is_err() {
                return Err(anyhow!("dataset receiver closed during shard {}", shard));
            }
            produced += 1;
        }
    }

    debug!("shard {} produced {} images", shard, produced);
    Ok(produced)
}
