use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT},
    Client, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    source::{ContentSource, ImageSource, TaxonomySource},
    types::{ArticleAttributes, ImageLookup, NodeKind, SourceError, TaxonomyNode},
    utils::ACCEPT_HEADER,
};

/// MediaWiki action API client covering categories, extracts and image links.
pub struct WikipediaClient {
    client: Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<Q> {
    query: Option<Q>,
    #[serde(rename = "continue")]
    cont: Option<HashMap<String, serde_json::Value>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    info: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page {
    pageid: Option<u64>,
    ns: Option<i64>,
    title: Option<String>,
    #[serde(default)]
    missing: bool,
    extract: Option<String>,
    #[serde(default)]
    imageinfo: Vec<ImageInfo>,
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PagesQuery {
    #[serde(default)]
    pages: Vec<Page>,
    #[serde(default)]
    badpageids: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct MembersQuery {
    #[serde(default)]
    categorymembers: Vec<Page>,
}

type Params = Vec<(String, String)>;

fn params(pairs: &[(&str, &str)]) -> Params {
    let mut p: Params = vec![
        ("action".into(), "query".into()),
        ("format".into(), "json".into()),
        ("formatversion".into(), "2".into()),
    ];
    p.extend(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    p
}

fn check_status(status: StatusCode) -> Result<(), SourceError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Err(SourceError::RateLimited(status.as_u16()))
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        Err(SourceError::Server(status.as_u16()))
    } else {
        Err(SourceError::Rejected(status.as_u16()))
    }
}

fn page_to_node(page: &Page) -> Option<TaxonomyNode> {
    Some(TaxonomyNode::new(
        page.pageid?,
        page.title.as_deref()?,
        NodeKind::from_namespace(page.ns.unwrap_or(-1)),
    ))
}

impl WikipediaClient {
    pub fn new(api_url: &str, user_agent: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HEADER));
        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .build()?;
        Ok(WikipediaClient {
            client,
            api_url: api_url.into(),
        })
    }

    async fn query<Q: DeserializeOwned>(&self, params: &Params) -> Result<ApiResponse<Q>, SourceError> {
        let res = self.client.get(self.api_url.as_str()).query(params).send().await?;
        check_status(res.status())?;
        let body = res.text().await?;
        let parsed: ApiResponse<Q> =
            serde_json::from_str(&body).map_err(|e| SourceError::Malformed(e.to_string()))?;
        if let Some(e) = &parsed.error {
            return match e.code.as_str() {
                "ratelimited" | "maxlag" => Err(SourceError::RateLimited(429)),
                _ => Err(SourceError::Malformed(format!(
                    "{}: {}",
                    e.code,
                    e.info.clone().unwrap_or_default()
                ))),
            };
        }
        Ok(parsed)
    }

    /// Follows `continue` tokens until the listing is exhausted.
    async fn query_all<Q: DeserializeOwned>(&self, base: Params) -> Result<Vec<Q>, SourceError> {
        let mut out = vec![];
        let mut cont: Option<HashMap<String, serde_json::Value>> = None;
        loop {
            let mut p = base.clone();
            if let Some(c) = cont.take() {
                for (k, v) in c {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    p.push((k, v));
                }
            }
            let res = self.query::<Q>(&p).await?;
            if let Some(q) = res.query {
                out.push(q);
            }
            match res.cont {
                Some(c) => cont = Some(c),
                None => break,
            }
        }
        Ok(out)
    }

    async fn extract(&self, pageid: u64, intro: bool) -> Result<Option<Page>, SourceError> {
        let id = pageid.to_string();
        let mut p = params(&[("prop", "extracts"), ("explaintext", "1"), ("pageids", id.as_str())]);
        if intro {
            p.push(("exintro".into(), "1".into()));
        }
        let res = self.query::<PagesQuery>(&p).await?;
        Ok(res
            .query
            .and_then(|q| q.pages.into_iter().find(|page| !page.missing)))
    }
}

#[async_trait]
impl TaxonomySource for WikipediaClient {
    async fn resolve(&self, title: &str) -> Result<TaxonomyNode, SourceError> {
        let res = self
            .query::<PagesQuery>(&params(&[("titles", title)]))
            .await?;
        let page = res
            .query
            .and_then(|q| q.pages.into_iter().next())
            .ok_or_else(|| SourceError::Malformed(format!("no page returned for {}", title)))?;
        if page.missing {
            return Err(SourceError::Malformed(format!("{} does not exist", title)));
        }
        page_to_node(&page)
            .ok_or_else(|| SourceError::Malformed(format!("{} has no page id", title)))
    }

    async fn children(&self, node: &TaxonomyNode) -> Result<Vec<TaxonomyNode>, SourceError> {
        let id = node.id.to_string();
        let batches = self
            .query_all::<MembersQuery>(params(&[
                ("list", "categorymembers"),
                ("cmpageid", id.as_str()),
                ("cmprop", "ids|title"),
                ("cmlimit", "max"),
            ]))
            .await?;
        Ok(batches
            .iter()
            .flat_map(|b| b.categorymembers.iter())
            .filter_map(page_to_node)
            .collect())
    }
}

#[async_trait]
impl ContentSource for WikipediaClient {
    async fn attributes(&self, pageid: u64) -> Result<ArticleAttributes, SourceError> {
        let full = self.extract(pageid, false).await?;
        let intro = self.extract(pageid, true).await?;
        let full = match full {
            Some(p) => p,
            None => return Err(SourceError::Malformed(format!("page {} is missing", pageid))),
        };
        Ok(ArticleAttributes {
            title: full.title,
            text: full.extract,
            summary: intro.and_then(|p| p.extract),
        })
    }

    async fn images(&self, pageid: u64) -> Result<ImageLookup, SourceError> {
        let id = pageid.to_string();
        let batches = self
            .query_all::<PagesQuery>(params(&[
                ("generator", "images"),
                ("gimlimit", "max"),
                ("pageids", id.as_str()),
                ("prop", "imageinfo"),
                ("iiprop", "url"),
            ]))
            .await?;
        if batches.iter().any(|b| b.badpageids.contains(&pageid)) {
            return Ok(ImageLookup::NotFound);
        }
        Ok(ImageLookup::Found(
            batches
                .iter()
                .flat_map(|b| b.pages.iter())
                .flat_map(|p| p.imageinfo.iter())
                .filter_map(|i| i.url.clone())
                .collect(),
        ))
    }
}

#[async_trait]
impl ImageSource for WikipediaClient {
    async fn download(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let res = self.client.get(url).send().await?;
        check_status(res.status())?;
        Ok(res.bytes().await?.to_vec())
    }
}
