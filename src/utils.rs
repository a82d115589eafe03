use std::{
    collections::HashMap,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;

pub const HIERARCHY_FILE: &str = "hierarchy.json";
pub const ARTICLES_FILE: &str = "articles.jsonl";
pub const URL_MAPPING_FILE: &str = "url_to_id.json";
pub const LABEL_MAPPING_FILE: &str = "label_mapping.json";
pub const IMAGE_DIR: &str = "images";
pub const DATASET_DIR: &str = "dataset";

pub const ACCEPT_HEADER: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";

lazy_static! {
    pub static ref API_URL: String = {
        match std::env::var("WIKI_API_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => "https://en.wikipedia.org/w/api.php".into(),
        }
    };
}

/// Reads the user agent used for every remote request. A missing file is a
/// configuration error.
pub fn read_user_agent(path: &Path) -> anyhow::Result<String> {
    let ua = fs::read_to_string(path)
        .context(format!("could not read user agent file {:?}", path))?;
    let ua = ua.trim().to_string();
    if ua.is_empty() {
        return Err(anyhow!("user agent file {:?} is empty", path));
    }
    Ok(ua)
}

/// Extension of the trailing path segment of a link, e.g. `jpg` for
/// `https://host/a/b/Tomato.jpg`.
pub fn url_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next()?;
    match segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

pub fn image_file_name(id: u64, url: &str) -> String {
    match url_extension(url) {
        Some(ext) => format!("{}.{}", id, ext),
        None => id.to_string(),
    }
}

/// Indexes an image directory by the numeric id each file name starts with.
pub fn existing_ids(dir: &Path) -> anyhow::Result<HashMap<u64, PathBuf>> {
    let mut ids = HashMap::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(dir).context(format!("could not read image dir {:?}", dir))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(id) = id {
            ids.insert(id, path);
        }
    }
    Ok(ids)
}

/// Reads one JSON value per line, skipping blank lines.
///
/// A line that does not parse is logged and skipped: after a crash the last
/// line of an append-only file may be torn.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let file = fs::File::open(path).context(format!("could not open {:?}", path))?;
    let mut out = vec![];
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context(format!("could not read line {} of {:?}", i, path))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(v) => out.push(v),
            Err(e) => warn!("skipping unparseable line {} of {:?}: {}", i, path, e),
        }
    }
    Ok(out)
}
