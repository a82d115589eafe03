use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use tokio::{fs, time::sleep};

use crate::{
    images::ImageIndex,
    retry::{retry_or_default, RetryPolicy},
    source::ImageSource,
    types::{CuratorError, FetchResult, SourceError},
    utils::{existing_ids, image_file_name},
};

pub struct ImageFetcher<'a> {
    source: &'a dyn ImageSource,
    image_dir: PathBuf,
    retry: RetryPolicy,
    request_delay: Duration,
    skip_downloaded: bool,
}

/// True when a payload decodes as text carrying an HTML doctype, i.e. an
/// error page served in place of an image.
pub fn is_html_payload(data: &[u8]) -> bool {
    match std::str::from_utf8(data) {
        Ok(text) => text.to_ascii_lowercase().contains("<!doctype html"),
        Err(_) => false,
    }
}

impl<'a> ImageFetcher<'a> {
    pub fn new(
        source: &'a dyn ImageSource,
        image_dir: &Path,
        retry: RetryPolicy,
        request_delay: Duration,
        skip_downloaded: bool,
    ) -> ImageFetcher<'a> {
        ImageFetcher {
            source,
            image_dir: image_dir.into(),
            retry,
            request_delay,
            skip_downloaded,
        }
    }

    /// Downloads every indexed link into `image_dir` as `<id>.<ext>`.
    pub async fn fetch_all(
        &self,
        index: &ImageIndex,
        should_terminate: Arc<AtomicBool>,
    ) -> anyhow::Result<FetchResult> {
        fs::create_dir_all(&self.image_dir)
            .await
            .context(format!("could not create image dir {:?}", self.image_dir))?;
        let existing = existing_ids(&self.image_dir)?;
        let mut res = FetchResult::default();

        for (url, id) in index.iter() {
            if should_terminate.load(Ordering::Relaxed) {
                return Err(CuratorError::EarlyTermination.into());
            }
            let previous = existing.get(&id);
            if self.skip_downloaded && previous.is_some() {
                res.skipped += 1;
                continue;
            }

            match self.fetch_one(url, id).await? {
                Some(path) => {
                    // at most one artifact per id
                    if let Some(old) = previous.filter(|old| **old != path) {
                        fs::remove_file(old)
                            .await
                            .context(format!("could not remove stale image {:?}", old))?;
                    }
                    res.downloaded += 1;
                }
                None => res.failed += 1,
            }

            if !self.request_delay.is_zero() {
                sleep(self.request_delay).await;
            }
        }

        info!(
            "images: {} downloaded, {} already present, {} failed",
            res.downloaded, res.skipped, res.failed
        );
        Ok(res)
    }

    /// Fetches one link. `Ok(None)` means the download failed for good; only
    /// local I/O errors are returned as errors.
    pub async fn fetch_one(&self, url: &str, id: u64) -> anyhow::Result<Option<PathBuf>> {
        let source = self.source;
        let data = retry_or_default(
            &self.retry,
            &format!("download {}", url),
            None,
            move || async move {
                let data = source.download(url).await?;
                if is_html_payload(&data) {
                    return Err(SourceError::NotAnImage(url.into()));
                }
                Ok(Some(data))
            },
        )
        .await;

        let data = match data {
            Some(d) => d,
            None => return Ok(None),
        };
        let path = self.image_dir.join(image_file_name(id, url));
        fs::write(&path, data)
            .await
            .context(format!("could not write image {:?}", path))?;
        debug!("{} -> {:?}", url, path);
        Ok(Some(path))
    }
}
