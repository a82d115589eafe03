use async_trait::async_trait;

use crate::types::{ArticleAttributes, ImageLookup, SourceError, TaxonomyNode};

/// Paginated category tree.
#[async_trait]
pub trait TaxonomySource: Send + Sync {
    /// Looks up a node by its title, e.g. the root category of a crawl.
    async fn resolve(&self, title: &str) -> Result<TaxonomyNode, SourceError>;

    /// All direct members of a category, in source order.
    async fn children(&self, node: &TaxonomyNode) -> Result<Vec<TaxonomyNode>, SourceError>;
}

/// Per-article content.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn attributes(&self, pageid: u64) -> Result<ArticleAttributes, SourceError>;

    /// Raw image links of an article. A page the source cannot resolve is
    /// `ImageLookup::NotFound`, not an error.
    async fn images(&self, pageid: u64) -> Result<ImageLookup, SourceError>;
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}
