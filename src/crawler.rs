use std::{
    fs,
    io::{BufReader, BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use tokio::time::sleep;

use crate::{
    blacklist::Blacklist,
    retry::{retry_or_default, RetryPolicy},
    source::TaxonomySource,
    types::{
        CrawlResult, CuratorError, HierarchyCheckpoint, HierarchyNode, HierarchyTree,
        TaxonomyNode,
    },
};

pub struct Crawler<'a> {
    source: &'a dyn TaxonomySource,
    max_depth: usize,
    blacklist: Blacklist,
    retry: RetryPolicy,
    request_delay: Duration,
}

// one open category on the traversal stack
struct Frame {
    tree: HierarchyTree,
    pending: std::vec::IntoIter<TaxonomyNode>,
    level: usize,
    leaf_count: usize,
}

enum Step {
    Skip,
    Descend,
    Leaf,
}

impl<'a> Crawler<'a> {
    pub fn new(
        source: &'a dyn TaxonomySource,
        max_depth: usize,
        blacklist: Blacklist,
        retry: RetryPolicy,
        request_delay: Duration,
    ) -> Crawler<'a> {
        Crawler {
            source,
            max_depth,
            blacklist,
            retry,
            request_delay,
        }
    }

    /// Resolves `root_title` and crawls the taxonomy below it.
    pub async fn crawl(
        &self,
        root_title: &str,
        should_terminate: Arc<AtomicBool>,
    ) -> anyhow::Result<CrawlResult> {
        let source = self.source;
        let root = retry_or_default(&self.retry, &format!("resolve {}", root_title), None, move || async move {
            source.resolve(root_title).await.map(Some)
        })
        .await
        .ok_or_else(|| anyhow!("could not resolve root category {}", root_title))?;

        info!(
            "crawling {} (id {}) with max depth {}",
            root.title, root.id, self.max_depth
        );
        let res = self.crawl_from(root, should_terminate).await?;
        info!("crawl found {} leaves", res.leaf_count);
        Ok(res)
    }

    /// Depth-bounded traversal below `root`.
    ///
    /// Blacklisted children are dropped with their whole subtree. A category at
    /// the depth limit is kept as a leaf. A category whose members cannot be
    /// fetched is treated as empty.
    pub async fn crawl_from(
        &self,
        root: TaxonomyNode,
        should_terminate: Arc<AtomicBool>,
    ) -> anyhow::Result<CrawlResult> {
        let children = self.fetch_children(&root).await;
        let mut stack = vec![Frame {
            tree: HierarchyTree::new(root),
            pending: children.into_iter(),
            level: 0,
            leaf_count: 0,
        }];

        loop {
            if should_terminate.load(Ordering::Relaxed) {
                return Err(CuratorError::EarlyTermination.into());
            }

            let top = match stack.last_mut() {
                Some(f) => f,
                None => return Err(anyhow!("crawl stack emptied before the root finished")),
            };

            let child = match top.pending.next() {
                Some(c) => c,
                None => {
                    // category exhausted, hand it to its parent
                    let done = match stack.pop() {
                        Some(f) => f,
                        None => continue,
                    };
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.leaf_count += done.leaf_count;
                            parent.tree.children.push(HierarchyNode::Category(done.tree));
                            continue;
                        }
                        None => {
                            return Ok(CrawlResult {
                                tree: done.tree,
                                leaf_count: done.leaf_count,
                            })
                        }
                    }
                }
            };

            let level = top.level;
            debug!(
                "{}: {} (ns: {:?})",
                "*".repeat(level + 1),
                child.title,
                child.kind
            );

            let step = if self.blacklist.matches(&child.title) {
                Step::Skip
            } else if child.is_category() && level < self.max_depth {
                Step::Descend
            } else {
                Step::Leaf
            };

            match step {
                Step::Skip => {
                    debug!("skipping blacklisted {}", child.title);
                    continue;
                }
                Step::Leaf => {
                    top.tree.children.push(HierarchyNode::Leaf(child));
                    top.leaf_count += 1;
                }
                Step::Descend => {
                    let members = self.fetch_children(&child).await;
                    stack.push(Frame {
                        tree: HierarchyTree::new(child),
                        pending: members.into_iter(),
                        level: level + 1,
                        leaf_count: 0,
                    });
                }
            }

            if !self.request_delay.is_zero() {
                sleep(self.request_delay).await;
            }
        }
    }

    async fn fetch_children(&self, node: &TaxonomyNode) -> Vec<TaxonomyNode> {
        let source = self.source;
        retry_or_default(
            &self.retry,
            &format!("members of {}", node.title),
            vec![],
            move || async move { source.children(node).await },
        )
        .await
    }
}

pub fn save_checkpoint(
    path: &Path,
    category: &str,
    tree: &HierarchyTree,
    max_depth: usize,
) -> anyhow::Result<()> {
    let checkpoint = HierarchyCheckpoint {
        created_at: Utc::now(),
        category: category.into(),
        max_depth,
        tree: tree.clone(),
    };
    let tmp = path.with_extension("json.tmp");
    {
        let file = fs::File::create(&tmp).context(format!("could not create {:?}", tmp))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer(&mut w, &checkpoint)?;
        w.flush()?;
    }
    fs::rename(&tmp, path).context(format!("could not move checkpoint to {:?}", path))?;
    debug!("hierarchy checkpoint written to {:?}", path);
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> anyhow::Result<HierarchyCheckpoint> {
    let file = fs::File::open(path).context(format!("could not open checkpoint {:?}", path))?;
    let checkpoint: HierarchyCheckpoint = serde_json::from_reader(BufReader::new(file))
        .context(format!("could not parse checkpoint {:?}", path))?;
    info!(
        "loaded hierarchy of {} (depth {}) from checkpoint taken {}",
        checkpoint.tree.node.title, checkpoint.max_depth, checkpoint.created_at
    );
    Ok(checkpoint)
}
