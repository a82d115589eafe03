use std::{
    collections::HashMap,
    io::Cursor,
    path::Path,
};

use async_trait::async_trait;
use curator::{
    dataset_writer::{DatasetRow, METADATA_FILE, TRAIN, VALIDATION},
    runner::{Runner, RunnerOptions},
    source::{ContentSource, ImageSource, TaxonomySource},
    types::{
        ArticleAttributes, ArticleRecord, CuratorError, ImageLookup, NodeKind, SourceError,
        TaxonomyNode,
    },
    utils::{read_jsonl, ARTICLES_FILE, LABEL_MAPPING_FILE, URL_MAPPING_FILE},
};
use image::{ImageFormat, Rgb, RgbImage};

macro_rules! aw {
    ($e:expr) => {
        tokio_test::block_on($e)
    };
}

const COMMONS: &str = "https://upload.wikimedia.org/wikipedia/commons";

/// In-memory stand-in for the encyclopedia: a salads root with one pruned
/// sub-category, one article and one list page, plus an unrelated soups root.
struct MockWiki {
    nodes: HashMap<u64, TaxonomyNode>,
    members: HashMap<u64, Vec<u64>>,
    links: HashMap<u64, Vec<String>>,
}

impl MockWiki {
    fn salads() -> Self {
        let nodes = [
            TaxonomyNode::new(1, "Category:Salads", NodeKind::Category),
            TaxonomyNode::new(2, "Category:Salads by country", NodeKind::Category),
            TaxonomyNode::new(10, "Greek Salad", NodeKind::Article),
            TaxonomyNode::new(11, "List of salads", NodeKind::Article),
            TaxonomyNode::new(20, "Italian salad", NodeKind::Article),
            TaxonomyNode::new(3, "Category:Soups", NodeKind::Category),
            TaxonomyNode::new(30, "Gazpacho", NodeKind::Article),
        ]
        .into_iter()
        .map(|n| (n.id, n))
        .collect();

        let mut members = HashMap::new();
        members.insert(1, vec![2, 10, 11]);
        members.insert(2, vec![20]);
        members.insert(3, vec![30]);

        let mut links = HashMap::new();
        links.insert(
            10,
            vec![
                format!("{}/a/a1/Greek_salad.jpg", COMMONS),
                format!("{}/b/b2/Horiatiki.png", COMMONS),
                format!("{}/c/c3/Feta.jpg", COMMONS),
                format!("{}/d/d4/Flag of Greece.jpg", COMMONS),
                format!("{}/e/e5/Wiki_letter_w.png", COMMONS),
                format!("{}/f/f6/Salad_icon.svg", COMMONS),
                "https://upload.wikimedia.org/wikipedia/en/x/Local_upload.jpg".to_string(),
            ],
        );

        MockWiki {
            nodes,
            members,
            links,
        }
    }
}

#[async_trait]
impl TaxonomySource for MockWiki {
    async fn resolve(&self, title: &str) -> Result<TaxonomyNode, SourceError> {
        self.nodes
            .values()
            .find(|n| n.title == title)
            .cloned()
            .ok_or_else(|| SourceError::Malformed(format!("no page {}", title)))
    }

    async fn children(&self, node: &TaxonomyNode) -> Result<Vec<TaxonomyNode>, SourceError> {
        Ok(self
            .members
            .get(&node.id)
            .map(|ids| ids.iter().map(|id| self.nodes[id].clone()).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ContentSource for MockWiki {
    async fn attributes(&self, pageid: u64) -> Result<ArticleAttributes, SourceError> {
        let node = &self.nodes[&pageid];
        Ok(ArticleAttributes {
            title: Some(node.title.clone()),
            text: Some(format!("{} is a salad.\n\nIt has feta.", node.title)),
            summary: Some(format!("{} is a salad.", node.title)),
        })
    }

    async fn images(&self, pageid: u64) -> Result<ImageLookup, SourceError> {
        Ok(match self.links.get(&pageid) {
            Some(l) => ImageLookup::Found(l.clone()),
            None => ImageLookup::NotFound,
        })
    }
}

#[async_trait]
impl ImageSource for MockWiki {
    async fn download(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let shade = (url.len() % 255) as u8;
        let mut out = Cursor::new(vec![]);
        RgbImage::from_pixel(40, 20, Rgb([shade, 128, 0]))
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        Ok(out.into_inner())
    }
}

fn options(dir: &Path) -> RunnerOptions {
    RunnerOptions::default_builder()
        .output_dir(dir)
        .retries(2usize)
        .content_retries(2usize)
        .retry_delay(0u64)
        .request_delay(0u64)
        .workers(2usize)
        .max_image_side(16u32)
        .seed(11u64)
        .build()
        .unwrap()
}

#[test]
fn articles_skip_pruned_categories_and_list_pages() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Runner::new(options(dir.path()), MockWiki::salads())?;

    let crawl = aw!(runner.run_crawl())?;
    assert_eq!(crawl.leaf_count, 2);

    let res = aw!(runner.run_articles())?;
    assert_eq!(res.written, 1);
    assert_eq!(res.rejected, 1);

    let records: Vec<ArticleRecord> = read_jsonl(&dir.path().join(ARTICLES_FILE))?;
    assert_eq!(records.len(), 1);
    let greek = &records[0];
    assert_eq!(greek.title, "Greek Salad");
    assert_eq!(greek.summary.as_deref(), Some("Greek Salad is a salad."));
    assert_eq!(greek.raw_images.len(), 7);
    assert_eq!(greek.images.len(), 3);
    assert!(greek.images.iter().all(|l| l.contains("/commons/")));
    Ok(())
}

#[test]
fn resumed_extraction_writes_no_duplicates() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Runner::new(options(dir.path()), MockWiki::salads())?;

    aw!(runner.run_articles())?;
    let again = aw!(runner.run_articles())?;
    assert_eq!(again.written, 0);
    assert_eq!(again.resumed, 1);

    let records: Vec<ArticleRecord> = read_jsonl(&dir.path().join(ARTICLES_FILE))?;
    assert_eq!(records.len(), 1);
    Ok(())
}

#[test]
fn full_pipeline_builds_a_split_dataset() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Runner::new(options(dir.path()), MockWiki::salads())?;

    let res = aw!(runner.run_all())?;
    assert_eq!(res.labels, 1);
    assert_eq!(res.train, 2);
    assert_eq!(res.validation, 1);

    let mapping: HashMap<String, u64> =
        serde_json::from_slice(&std::fs::read(dir.path().join(URL_MAPPING_FILE))?)?;
    let mut ids = mapping.values().copied().collect::<Vec<_>>();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2]);

    let labels: HashMap<String, usize> =
        serde_json::from_slice(&std::fs::read(dir.path().join(LABEL_MAPPING_FILE))?)?;
    assert_eq!(labels["Greek Salad"], 0);

    let train: Vec<DatasetRow> = read_jsonl(&res.dataset_dir.join(TRAIN).join(METADATA_FILE))?;
    let validation: Vec<DatasetRow> =
        read_jsonl(&res.dataset_dir.join(VALIDATION).join(METADATA_FILE))?;
    let mut seen = train
        .iter()
        .chain(&validation)
        .map(|r| r.image_id)
        .collect::<Vec<_>>();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
    assert!(!res.dataset_dir.join("staging").exists());
    for row in &train {
        let img = image::open(res.dataset_dir.join(TRAIN).join(&row.file))?;
        assert_eq!((img.width(), img.height()), (16, 8));
        assert_eq!(row.label_name, "Greek Salad");
    }
    Ok(())
}

#[test]
fn checkpoint_of_another_root_is_not_reused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let first = Runner::new(options(dir.path()), MockWiki::salads())?;
    aw!(first.run_crawl())?;

    let soups = RunnerOptions::default_builder()
        .output_dir(dir.path())
        .category("Category:Soups")
        .retry_delay(0u64)
        .request_delay(0u64)
        .build()?;
    let second = Runner::new(soups, MockWiki::salads())?;
    let err = aw!(second.run_articles()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CuratorError>(),
        Some(CuratorError::StaleCheckpoint { root, max_depth: 3, .. }) if root == "Category:Salads"
    ));
    assert!(!dir.path().join(ARTICLES_FILE).exists());

    let deeper = RunnerOptions::default_builder()
        .output_dir(dir.path())
        .max_depth(1usize)
        .build()?;
    let third = Runner::new(deeper, MockWiki::salads())?;
    assert!(aw!(third.run_crawl()).is_err());

    let fresh = RunnerOptions::default_builder()
        .output_dir(dir.path())
        .category("Category:Soups")
        .resume(false)
        .retry_delay(0u64)
        .request_delay(0u64)
        .build()?;
    let crawl = aw!(Runner::new(fresh, MockWiki::salads())?.run_crawl())?;
    assert_eq!(crawl.tree.node.title, "Category:Soups");
    assert_eq!(crawl.leaf_count, 1);
    Ok(())
}

#[test]
fn downloaded_images_are_not_fetched_again() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Runner::new(options(dir.path()), MockWiki::salads())?;

    aw!(runner.run_articles())?;
    let first = aw!(runner.run_images())?;
    assert_eq!(first.downloaded, 3);
    let second = aw!(runner.run_images())?;
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.skipped, 3);
    Ok(())
}

#[test]
fn images_require_extracted_articles() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let runner = Runner::new(options(dir.path()), MockWiki::salads())?;

    let err = aw!(runner.run_images()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CuratorError>(),
        Some(CuratorError::MissingInput(_))
    ));
    Ok(())
}

/*
RUST_LOG=debug cargo test --test pipeline -- salads_from_wikipedia --exact --ignored
 */
#[test]
#[ignore = "network"]
fn salads_from_wikipedia() -> anyhow::Result<()> {
    env_logger::init();
    let dir = tempfile::tempdir()?;
    let client = curator::wikipedia::WikipediaClient::new(
        curator::utils::API_URL.as_str(),
        "curator-tests/0.1",
    )?;
    let options = RunnerOptions::default_builder()
        .output_dir(dir.path())
        .max_depth(0usize)
        .retries(2usize)
        .retry_delay(5u64)
        .build()?;
    let runner = Runner::new(options, client)?;
    let res = aw!(runner.run_articles())?;
    println!("{res:#?}");
    assert!(res.written > 0);
    Ok(())
}
