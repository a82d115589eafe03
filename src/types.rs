use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CuratorError {
    #[error("early_termination")]
    EarlyTermination,
    #[error("missing_input: {0:?}")]
    MissingInput(PathBuf),
    #[error("stale_checkpoint: {path:?} holds {root} crawled to depth {max_depth}, rerun with --no-resume or another output dir")]
    StaleCheckpoint {
        path: PathBuf,
        root: String,
        max_depth: usize,
    },
}

/// Failure of a single remote call.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rate limited with status {0}")]
    RateLimited(u16),
    #[error("server error with status {0}")]
    Server(u16),
    #[error("request rejected with status {0}")]
    Rejected(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("not an image: {0}")]
    NotAnImage(String),
}

impl SourceError {
    /// Whether a later attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            SourceError::RateLimited(_) | SourceError::Server(_) => true,
            SourceError::Rejected(_) | SourceError::Malformed(_) | SourceError::NotAnImage(_) => {
                false
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Http(_) => "http",
            SourceError::RateLimited(_) => "rate_limited",
            SourceError::Server(_) => "server",
            SourceError::Rejected(_) => "rejected",
            SourceError::Malformed(_) => "malformed",
            SourceError::NotAnImage(_) => "not_an_image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Category,
    Article,
    Other,
}

impl NodeKind {
    pub fn from_namespace(ns: i64) -> Self {
        match ns {
            0 => NodeKind::Article,
            14 => NodeKind::Category,
            _ => NodeKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub id: u64,
    pub title: String,
    pub kind: NodeKind,
}

impl TaxonomyNode {
    pub fn new(id: u64, title: &str, kind: NodeKind) -> Self {
        TaxonomyNode {
            id,
            title: title.into(),
            kind,
        }
    }

    pub fn is_category(&self) -> bool {
        self.kind == NodeKind::Category
    }
}

/// A child inside a crawled category: either a further category or a terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HierarchyNode {
    Category(HierarchyTree),
    Leaf(TaxonomyNode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyTree {
    pub node: TaxonomyNode,
    pub children: Vec<HierarchyNode>,
}

impl HierarchyTree {
    pub fn new(node: TaxonomyNode) -> Self {
        HierarchyTree {
            node,
            children: vec![],
        }
    }

    /// Number of terminals under this tree, counted from the structure itself.
    pub fn leaf_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(tree) = stack.pop() {
            for child in &tree.children {
                match child {
                    HierarchyNode::Category(sub) => stack.push(sub),
                    HierarchyNode::Leaf(_) => count += 1,
                }
            }
        }
        count
    }

    /// Terminals in depth-first order, each paired with its category depth.
    pub fn leaves(&self) -> Vec<(&TaxonomyNode, usize)> {
        let mut out = vec![];
        // children are pushed reversed so they pop in order
        let mut stack: Vec<(&HierarchyNode, usize)> =
            self.children.iter().rev().map(|c| (c, 1)).collect();
        while let Some((child, depth)) = stack.pop() {
            match child {
                HierarchyNode::Leaf(node) => out.push((node, depth)),
                HierarchyNode::Category(sub) => {
                    stack.extend(sub.children.iter().rev().map(|c| (c, depth + 1)));
                }
            }
        }
        out
    }
}

/// Serialized form of a finished crawl.
#[derive(Debug, Serialize, Deserialize)]
pub struct HierarchyCheckpoint {
    pub created_at: DateTime<Utc>,
    // root title as requested, before the source normalised it
    #[serde(default)]
    pub category: String,
    pub max_depth: usize,
    pub tree: HierarchyTree,
}

impl HierarchyCheckpoint {
    /// Whether this crawl answers a request for `category` at `max_depth`.
    pub fn matches(&self, category: &str, max_depth: usize) -> bool {
        self.max_depth == max_depth
            && (self.category == category || self.tree.node.title == category)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleAttributes {
    pub title: Option<String>,
    pub text: Option<String>,
    pub summary: Option<String>,
}

/// Result of asking the content source for an article's images.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageLookup {
    Found(Vec<String>),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub pageid: u64,
    pub title: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub raw_images: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug)]
pub struct CrawlResult {
    pub tree: HierarchyTree,
    pub leaf_count: usize,
}

impl From<HierarchyCheckpoint> for CrawlResult {
    fn from(checkpoint: HierarchyCheckpoint) -> Self {
        let leaf_count = checkpoint.tree.leaf_count();
        CrawlResult {
            tree: checkpoint.tree,
            leaf_count,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ExtractionResult {
    pub written: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub resumed: usize,
}

#[derive(Debug, Default, PartialEq)]
pub struct FetchResult {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct DatasetResult {
    pub train: usize,
    pub validation: usize,
    pub labels: usize,
    pub dataset_dir: PathBuf,
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf(id: u64, title: &str) -> HierarchyNode {
        HierarchyNode::Leaf(TaxonomyNode::new(id, title, NodeKind::Article))
    }

    fn tree() -> HierarchyTree {
        let mut sub = HierarchyTree::new(TaxonomyNode::new(2, "Category:Fruit salads", NodeKind::Category));
        sub.children.push(leaf(3, "Ambrosia"));
        sub.children.push(leaf(4, "Waldorf salad"));
        let mut root = HierarchyTree::new(TaxonomyNode::new(1, "Category:Salads", NodeKind::Category));
        root.children.push(leaf(5, "Greek salad"));
        root.children.push(HierarchyNode::Category(sub));
        root.children.push(leaf(6, "Caesar salad"));
        root
    }

    #[test]
    fn counts_leaves_recursively() {
        assert_eq!(tree().leaf_count(), 4);
        assert_eq!(HierarchyTree::new(TaxonomyNode::new(1, "x", NodeKind::Category)).leaf_count(), 0);
    }

    #[test]
    fn leaves_are_depth_first_in_order() {
        let t = tree();
        let titles = t
            .leaves()
            .iter()
            .map(|(n, d)| (n.title.as_str(), *d))
            .collect::<Vec<_>>();
        assert_eq!(
            titles,
            vec![
                ("Greek salad", 1),
                ("Ambrosia", 2),
                ("Waldorf salad", 2),
                ("Caesar salad", 1)
            ]
        );
    }

    #[test]
    fn tree_serialization_is_lossless() {
        let t = tree();
        let s = serde_json::to_string(&t).unwrap();
        let back: HierarchyTree = serde_json::from_str(&s).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn checkpoint_matches_requested_root_and_depth() {
        let cp = HierarchyCheckpoint {
            created_at: Utc::now(),
            category: "Category:salads".into(),
            max_depth: 3,
            tree: tree(),
        };
        assert!(cp.matches("Category:salads", 3));
        assert!(cp.matches("Category:Salads", 3));
        assert!(!cp.matches("Category:Soups", 3));
        assert!(!cp.matches("Category:Salads", 2));
    }

    #[test]
    fn namespaces_map_to_kinds() {
        assert_eq!(NodeKind::from_namespace(14), NodeKind::Category);
        assert_eq!(NodeKind::from_namespace(0), NodeKind::Article);
        assert_eq!(NodeKind::from_namespace(10), NodeKind::Other);
    }

    #[test]
    fn classifies_retryable_errors() {
        assert!(SourceError::RateLimited(429).is_retryable());
        assert!(SourceError::Server(503).is_retryable());
        assert!(!SourceError::Rejected(404).is_retryable());
        assert!(!SourceError::Malformed("x".into()).is_retryable());
    }
}
