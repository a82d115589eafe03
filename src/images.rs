use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

use anyhow::{anyhow, Context};

use crate::types::ArticleRecord;

/// Path segment of links hosted on the shared media repository.
pub const MEDIA_REPOSITORY_SEGMENT: &str = "/commons/";

pub fn is_valid_image(link: &str) -> bool {
    link.contains(MEDIA_REPOSITORY_SEGMENT)
        && !link.contains("Flag of")
        && !link.contains("Wiki")
        && !link.ends_with(".svg")
}

pub fn valid_images(links: &[String]) -> Vec<String> {
    links.iter().filter(|l| is_valid_image(l)).cloned().collect()
}

/// Bijection between validated image links and dense integer ids, assigned
/// in first-seen order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImageIndex {
    urls: Vec<String>,
    ids: HashMap<String, u64>,
}

impl ImageIndex {
    pub fn from_links<'a, I>(links: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut index = ImageIndex::default();
        for link in links {
            if !is_valid_image(link) || index.ids.contains_key(link) {
                continue;
            }
            index.ids.insert(link.to_string(), index.urls.len() as u64);
            index.urls.push(link.to_string());
        }
        index
    }

    /// Ids over the validated links of `records`, in record order.
    pub fn from_records(records: &[ArticleRecord]) -> Self {
        Self::from_links(
            records
                .iter()
                .flat_map(|r| r.images.iter().map(String::as_str)),
        )
    }

    pub fn id(&self, url: &str) -> Option<u64> {
        self.ids.get(url).copied()
    }

    pub fn url(&self, id: u64) -> Option<&str> {
        self.urls.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// (link, id) pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.urls
            .iter()
            .enumerate()
            .map(|(i, u)| (u.as_str(), i as u64))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let map = self.iter().collect::<BTreeMap<&str, u64>>();
        let data = serde_json::to_vec(&map)?;
        fs::write(path, data).context(format!("could not write url mapping {:?}", path))?;
        info!("wrote {} image ids to {:?}", self.len(), path);
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read(path).context(format!("could not read url mapping {:?}", path))?;
        let map: HashMap<String, u64> = serde_json::from_slice(&data)
            .context(format!("could not parse url mapping {:?}", path))?;

        let mut urls: Vec<Option<String>> = vec![None; map.len()];
        for (url, id) in &map {
            let slot = urls
                .get_mut(*id as usize)
                .filter(|s| s.is_none())
                .ok_or_else(|| anyhow!("url mapping {:?} is not dense at id {}", path, id))?;
            *slot = Some(url.clone());
        }
        Ok(ImageIndex {
            urls: urls.into_iter().flatten().collect(),
            ids: map,
        })
    }
}
