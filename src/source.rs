//! Descriptor source: the remote listing of a course's files.
use crate::error::DescriptorError;
use crate::model::{Credential, ResourceDescriptor};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Guard against a server that keeps handing out `next` links.
const MAX_PAGES: usize = 500;

/// Descriptor as the remote reports it, before validation.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawDescriptor {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, alias = "displayName")]
    pub display_name: Option<String>,
    #[serde(default, alias = "fetchUrl")]
    pub url: Option<String>,
    #[serde(default, rename = "content-type", alias = "contentType", alias = "content_type")]
    pub content_type: Option<String>,
}

impl TryFrom<RawDescriptor> for ResourceDescriptor {
    type Error = DescriptorError;

    fn try_from(raw: RawDescriptor) -> Result<Self, Self::Error> {
        let external_id = match raw.id {
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => return Err(DescriptorError::Malformed("missing or invalid id")),
        };
        let display_name = raw
            .display_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(DescriptorError::Malformed("missing display name"))?;
        let fetch_url = raw
            .url
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(DescriptorError::Malformed("missing fetch url"))?;
        match Url::parse(&fetch_url) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            _ => return Err(DescriptorError::Malformed("fetch url must be absolute http(s)")),
        }
        let content_type = raw
            .content_type
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(ResourceDescriptor {
            external_id,
            display_name,
            fetch_url,
            content_type,
        })
    }
}

#[async_trait]
pub trait ResourceSource: Send + Sync {
    /// Full descriptor list for a course. Any failure fails the whole call.
    async fn list_resources(
        &self,
        course_ref: &str,
        credential: &Credential,
    ) -> Result<Vec<RawDescriptor>>;
}

/// Canvas-style LMS file listing over HTTP.
#[derive(Clone)]
pub struct LmsClient {
    http: Client,
    base_url: Url,
    page_size: u32,
}

impl fmt::Debug for LmsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmsClient")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl LmsClient {
    pub fn new(base_url: Url, page_size: u32, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("lecture-ingest/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build LMS http client")?;
        Ok(Self {
            http,
            base_url,
            page_size: page_size.max(1),
        })
    }

    pub fn from_config(cfg: &crate::config::Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.lms.base_url).context("invalid lms.base_url")?;
        Self::new(base_url, cfg.lms.page_size, cfg.fetch_timeout())
    }

    /// First page URL: `{base}/api/v1/courses/{course}/files?per_page=N`.
    pub fn files_url(&self, course_ref: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("lms base url cannot carry a path"))?
            .pop_if_empty()
            .extend(["api", "v1", "courses", course_ref, "files"]);
        url.query_pairs_mut()
            .append_pair("per_page", &self.page_size.to_string());
        Ok(url)
    }

    /// Follow a `next` link only on the same origin, so the bearer token never
    /// leaves the configured LMS.
    fn same_origin(&self, url: &Url) -> bool {
        url.origin() == self.base_url.origin()
    }
}

#[async_trait]
impl ResourceSource for LmsClient {
    #[instrument(skip_all, fields(course_ref = %course_ref))]
    async fn list_resources(
        &self,
        course_ref: &str,
        credential: &Credential,
    ) -> Result<Vec<RawDescriptor>> {
        let mut out = Vec::new();
        let mut next = Some(self.files_url(course_ref)?);
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(anyhow!("lms listing exceeded {} pages", MAX_PAGES));
            }
            debug!(url = %url, "fetching lms file page");
            let res = self
                .http
                .get(url)
                .bearer_auth(credential.expose())
                .send()
                .await
                .context("failed to reach LMS")?;

            if !res.status().is_success() {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                warn!(%status, "lms listing failed");
                return Err(anyhow!("lms error {}: {}", status, body));
            }

            next = match next_link(res.headers()) {
                Some(link) if self.same_origin(&link) => Some(link),
                Some(link) => {
                    warn!(url = %link, "ignoring cross-origin pagination link");
                    None
                }
                None => None,
            };

            let page: Vec<RawDescriptor> =
                res.json().await.context("invalid LMS file listing JSON")?;
            out.extend(page);
        }

        info!(count = out.len(), pages, "listed course files");
        Ok(out)
    }
}

/// Extract the `rel="next"` target from an RFC 8288 `Link` header.
pub fn next_link(headers: &HeaderMap) -> Option<Url> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|entry| {
            let mut parts = entry.split(';');
            let target = parts.next()?.trim();
            let target = target.strip_prefix('<')?.strip_suffix('>')?;
            let is_next = parts.any(|p| {
                let p = p.trim();
                p == "rel=\"next\"" || p == "rel=next"
            });
            if is_next {
                Url::parse(target).ok()
            } else {
                None
            }
        })
}
