use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use rand::{rngs::StdRng, SeedableRng};
use signal_hook::consts::{SIGINT, SIGTERM};

use crate::{
    blacklist::{Blacklist, DEFAULT_ARTICLE_BLACKLIST, DEFAULT_CATEGORY_BLACKLIST},
    crawler::{load_checkpoint, save_checkpoint, Crawler},
    dataset::{DatasetBuilder, STAGING_DIR},
    dataset_writer::DatasetWriter,
    extractor::Extractor,
    fetcher::ImageFetcher,
    images::ImageIndex,
    retry::RetryPolicy,
    source::{ContentSource, ImageSource, TaxonomySource},
    split::{stratified_split, LabelIndex},
    types::{
        ArticleRecord, CrawlResult, CuratorError, DatasetResult, ExtractionResult, FetchResult,
    },
    utils::{
        read_jsonl, ARTICLES_FILE, DATASET_DIR, HIERARCHY_FILE, IMAGE_DIR, LABEL_MAPPING_FILE,
        URL_MAPPING_FILE,
    },
};

pub struct Runner<S> {
    source: S,
    options: RunnerOptions,
    should_terminate: Arc<AtomicBool>,
}

#[derive(Builder, Debug, Clone)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct RunnerOptions {
    // directory holding every artifact of a run
    #[builder(default = "self.default_output_dir()")]
    output_dir: PathBuf,
    // title of the root category
    #[builder(default = "self.default_category()")]
    category: String,
    // category nesting below the root that is still descended into
    #[builder(default = "3")]
    max_depth: usize,
    #[builder(default = "self.default_category_blacklist()")]
    category_blacklist: Vec<String>,
    #[builder(default = "self.default_article_blacklist()")]
    article_blacklist: Vec<String>,
    // attempts for category listings and image downloads
    #[builder(default = "5")]
    retries: usize,
    // attempts for article attributes and image listings
    #[builder(default = "3")]
    content_retries: usize,
    // fixed wait between attempts in seconds
    #[builder(default = "120")]
    retry_delay: u64,
    // wait between consecutive requests in milliseconds
    #[builder(default = "1000")]
    request_delay: u64,
    // reuse the hierarchy checkpoint and the already written articles
    #[builder(default = "true")]
    resume: bool,
    #[builder(default = "true")]
    skip_downloaded: bool,
    #[builder(default = "4")]
    workers: usize,
    // longest image side in the dataset, 0 keeps the original size
    #[builder(default = "512")]
    max_image_side: u32,
    #[builder(default = "0.1")]
    test_size: f64,
    #[builder(default = "None")]
    seed: Option<u64>,
}

impl RunnerOptions {
    pub fn default_builder() -> RunnerOptionsBuilder {
        RunnerOptionsBuilder::default()
    }
}

impl RunnerOptionsBuilder {
    fn default_output_dir(&self) -> PathBuf {
        PathBuf::from("dataset/salads")
    }
    fn default_category(&self) -> String {
        String::from("Category:Salads")
    }
    fn default_category_blacklist(&self) -> Vec<String> {
        DEFAULT_CATEGORY_BLACKLIST.iter().map(|s| s.to_string()).collect()
    }
    fn default_article_blacklist(&self) -> Vec<String> {
        DEFAULT_ARTICLE_BLACKLIST.iter().map(|s| s.to_string()).collect()
    }
    fn validate(&self) -> Result<(), String> {
        if let Some(t) = self.test_size {
            if !(0.0..=1.0).contains(&t) {
                return Err(format!("test_size must be within [0, 1], got {}", t));
            }
        }
        if let Some(0) = self.workers {
            return Err("workers must be at least 1".into());
        }
        Ok(())
    }
}

impl<S> Runner<S>
where
    S: TaxonomySource + ContentSource + ImageSource,
{
    pub fn new(options: RunnerOptions, source: S) -> anyhow::Result<Self> {
        let should_terminate = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&should_terminate))?;

        fs::create_dir_all(&options.output_dir).context(format!(
            "could not create output dir {:?}",
            options.output_dir
        ))?;

        Ok(Runner {
            source,
            options,
            should_terminate,
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.options.output_dir.join(name)
    }

    fn retry(&self, attempts: usize) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_secs(self.options.retry_delay))
    }

    fn request_delay(&self) -> Duration {
        Duration::from_millis(self.options.request_delay)
    }

    fn require(&self, name: &str) -> anyhow::Result<PathBuf> {
        let p = self.path(name);
        if !p.exists() {
            return Err(CuratorError::MissingInput(p).into());
        }
        Ok(p)
    }

    pub async fn run_all(&self) -> anyhow::Result<DatasetResult> {
        self.run_articles().await?;
        if self.should_terminate.load(Ordering::Relaxed) {
            return Err(CuratorError::EarlyTermination.into());
        }
        self.run_images().await?;
        if self.should_terminate.load(Ordering::Relaxed) {
            return Err(CuratorError::EarlyTermination.into());
        }
        self.run_dataset().await
    }

    /// Crawls the taxonomy, or reloads the checkpoint of an earlier crawl.
    pub async fn run_crawl(&self) -> anyhow::Result<CrawlResult> {
        let checkpoint = self.path(HIERARCHY_FILE);
        if self.options.resume && checkpoint.exists() {
            let saved = load_checkpoint(&checkpoint)?;
            // articles.jsonl is shared across runs, so a different tree must not extend it
            if !saved.matches(&self.options.category, self.options.max_depth) {
                return Err(CuratorError::StaleCheckpoint {
                    path: checkpoint,
                    root: saved.tree.node.title,
                    max_depth: saved.max_depth,
                }
                .into());
            }
            return Ok(saved.into());
        }

        let crawler = Crawler::new(
            &self.source,
            self.options.max_depth,
            Blacklist::new(self.options.category_blacklist.iter().cloned()),
            self.retry(self.options.retries),
            self.request_delay(),
        );
        let crawl = crawler
            .crawl(&self.options.category, self.should_terminate.clone())
            .await?;
        save_checkpoint(
            &checkpoint,
            &self.options.category,
            &crawl.tree,
            self.options.max_depth,
        )?;
        Ok(crawl)
    }

    pub async fn run_articles(&self) -> anyhow::Result<ExtractionResult> {
        let crawl = self.run_crawl().await?;
        info!(
            "extracting up to {} articles below {}",
            crawl.leaf_count, crawl.tree.node.title
        );

        let extractor = Extractor::new(
            &self.source,
            Blacklist::new(self.options.article_blacklist.iter().cloned()),
            self.retry(self.options.content_retries),
            self.retry(self.options.content_retries),
            self.request_delay(),
        );
        extractor
            .extract(
                &crawl.tree,
                &self.path(ARTICLES_FILE),
                self.options.resume,
                self.should_terminate.clone(),
            )
            .await
    }

    /// Assigns image ids, persists the mapping, then downloads.
    pub async fn run_images(&self) -> anyhow::Result<FetchResult> {
        let articles = self.require(ARTICLES_FILE)?;
        let records: Vec<ArticleRecord> = read_jsonl(&articles)?;
        let index = ImageIndex::from_records(&records);
        index.save(&self.path(URL_MAPPING_FILE))?;

        let fetcher = ImageFetcher::new(
            &self.source,
            &self.path(IMAGE_DIR),
            self.retry(self.options.retries),
            self.request_delay(),
            self.options.skip_downloaded,
        );
        fetcher.fetch_all(&index, self.should_terminate.clone()).await
    }

    pub async fn run_dataset(&self) -> anyhow::Result<DatasetResult> {
        let articles = self.require(ARTICLES_FILE)?;
        let index = ImageIndex::load(&self.require(URL_MAPPING_FILE)?)?;
        let dataset_dir = self.path(DATASET_DIR);
        let staging = dataset_dir.join(STAGING_DIR);

        let items = DatasetBuilder::new(
            &articles,
            &self.path(IMAGE_DIR),
            &staging,
            index,
            self.options.workers,
            self.options.max_image_side,
        )
        .build()
        .await?;

        let labels = LabelIndex::from_labels(items.iter().map(|i| i.title.as_str()));
        labels.save(&self.path(LABEL_MAPPING_FILE))?;

        let label_ids = items
            .iter()
            .map(|i| labels.id(&i.title))
            .collect::<Option<Vec<_>>>()
            .context("item without a label")?;
        let mut rng = match self.options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let split = stratified_split(&label_ids, self.options.test_size, &mut rng);

        let res = DatasetWriter::new(&dataset_dir).write(&items, &labels, &split)?;
        fs::remove_dir_all(&staging).context(format!("could not remove {:?}", staging))?;
        Ok(res)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_the_salad_run() {
        let o = RunnerOptions::default_builder().build().unwrap();
        assert_eq!(o.category, "Category:Salads");
        assert_eq!(o.max_depth, 3);
        assert_eq!(o.retries, 5);
        assert_eq!(o.retry_delay, 120);
        assert_eq!(o.test_size, 0.1);
        assert!(o.resume);
        assert!(o.article_blacklist.contains(&"List of".to_string()));
    }

    #[test]
    fn rejects_invalid_options() {
        assert!(RunnerOptions::default_builder().test_size(1.5).build().is_err());
        assert!(RunnerOptions::default_builder().workers(0usize).build().is_err());
        assert!(RunnerOptions::default_builder().seed(3u64).build().is_ok());
    }
}
