use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use tokio::time::sleep;

use crate::{
    blacklist::Blacklist,
    images::valid_images,
    retry::{retry_or_default, RetryPolicy},
    source::ContentSource,
    types::{
        ArticleAttributes, ArticleRecord, CuratorError, ExtractionResult, HierarchyTree,
        ImageLookup, TaxonomyNode,
    },
    utils::read_jsonl,
};

pub struct Extractor<'a> {
    source: &'a dyn ContentSource,
    blacklist: Blacklist,
    attribute_retry: RetryPolicy,
    image_retry: RetryPolicy,
    request_delay: Duration,
}

/// Mutable traversal state threaded through one extraction run.
#[derive(Debug, Default)]
pub struct ExtractionContext {
    pub visited: HashSet<u64>,
    pub result: ExtractionResult,
}

impl ExtractionContext {
    /// Rebuilds the visited set from an earlier run's output so no article is
    /// written twice.
    pub fn resume_from(output: &Path) -> anyhow::Result<Self> {
        let mut ctx = ExtractionContext::default();
        if !output.exists() {
            return Ok(ctx);
        }
        let records: Vec<ArticleRecord> = read_jsonl(output)?;
        for r in records {
            if ctx.visited.insert(r.pageid) {
                ctx.result.resumed += 1;
            }
        }
        info!(
            "resuming extraction with {} articles already in {:?}",
            ctx.result.resumed, output
        );
        Ok(ctx)
    }
}

/// Append-only JSON-lines sink, flushed after every record.
pub struct ArticleWriter {
    out: BufWriter<File>,
}

impl ArticleWriter {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(format!("could not open article output {:?}", path))?;
        let mut out = BufWriter::new(file);
        // a crash can leave a torn last line; start ours on a fresh one
        if path.metadata()?.len() > 0 && !ends_with_newline(path)? {
            out.write_all(b"\n")?;
        }
        Ok(ArticleWriter { out })
    }

    pub fn append(&mut self, record: &ArticleRecord) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

fn ends_with_newline(path: &Path) -> anyhow::Result<bool> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = File::open(path)?;
    f.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    f.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

impl<'a> Extractor<'a> {
    pub fn new(
        source: &'a dyn ContentSource,
        blacklist: Blacklist,
        attribute_retry: RetryPolicy,
        image_retry: RetryPolicy,
        request_delay: Duration,
    ) -> Extractor<'a> {
        Extractor {
            source,
            blacklist,
            attribute_retry,
            image_retry,
            request_delay,
        }
    }

    /// Walks `tree` depth-first and appends one record per new article to
    /// `output`. With `resume`, articles already present in `output` are
    /// skipped.
    pub async fn extract(
        &self,
        tree: &HierarchyTree,
        output: &Path,
        resume: bool,
        should_terminate: Arc<AtomicBool>,
    ) -> anyhow::Result<ExtractionResult> {
        let mut ctx = if resume {
            ExtractionContext::resume_from(output)?
        } else {
            ExtractionContext::default()
        };
        let mut writer = ArticleWriter::open(output)?;

        let leaves = tree.leaves();
        let total = leaves.len();
        for (i, (node, _)) in leaves.into_iter().enumerate() {
            if should_terminate.load(Ordering::Relaxed) {
                return Err(CuratorError::EarlyTermination.into());
            }
            if let Some(record) = self.visit(node, &mut ctx).await {
                writer.append(&record)?;
                ctx.result.written += 1;
                info!(
                    "[{}/{}] {} ({} images, {} kept)",
                    i + 1,
                    total,
                    record.title,
                    record.raw_images.len(),
                    record.images.len()
                );
            }
        }

        info!(
            "extraction done: {} written, {} rejected, {} already seen",
            ctx.result.written, ctx.result.rejected, ctx.result.duplicates
        );
        Ok(ctx.result)
    }

    /// Fetches one terminal, or `None` when it is blacklisted or already seen.
    pub async fn visit(
        &self,
        node: &TaxonomyNode,
        ctx: &mut ExtractionContext,
    ) -> Option<ArticleRecord> {
        if self.blacklist.matches(&node.title) {
            debug!("rejecting {}", node.title);
            ctx.result.rejected += 1;
            return None;
        }
        if !ctx.visited.insert(node.id) {
            debug!("{} (id {}) already extracted", node.title, node.id);
            ctx.result.duplicates += 1;
            return None;
        }

        let source = self.source;
        let pageid = node.id;
        let attrs = retry_or_default(
            &self.attribute_retry,
            &format!("attributes of {}", node.title),
            ArticleAttributes::default(),
            move || async move { source.attributes(pageid).await },
        )
        .await;

        if !self.request_delay.is_zero() {
            sleep(self.request_delay).await;
        }

        let lookup = retry_or_default(
            &self.image_retry,
            &format!("images of {}", node.title),
            ImageLookup::Found(vec![]),
            move || async move { source.images(pageid).await },
        )
        .await;
        let raw_images = match lookup {
            ImageLookup::Found(links) => links,
            ImageLookup::NotFound => {
                warn!("no image listing for {} (id {})", node.title, pageid);
                vec![]
            }
        };

        let images = valid_images(&raw_images);
        Some(ArticleRecord {
            pageid,
            title: attrs.title.unwrap_or_else(|| node.title.clone()),
            text: attrs.text,
            summary: attrs.summary,
            raw_images,
            images,
        })
    }
}
