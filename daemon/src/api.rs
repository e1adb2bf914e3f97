/// Remote link API: descriptor fetches, feedback responses, image downloads.
///
/// All network traffic goes through one shared [`reqwest::Client`] with
/// explicit timeouts so a stuck server can never wedge a poll cycle.  The
/// [`LinkApi`] trait is the seam the change detector and coordinator are
/// written against; tests substitute a scripted implementation.
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Per-request ceiling. The upstream behavior left timeouts unspecified; a
/// fixed value keeps cycle wall time bounded.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

const USER_AGENT: &str = concat!("linkwall-daemon/", env!("CARGO_PKG_VERSION"));

/// Remote state of one link subscription, as served by
/// `GET {base}/api/links/{id}.json`.
///
/// Only `post_url` drives change detection; the remaining fields enrich
/// history entries and are tolerated as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkDescriptor {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub post_url: Option<String>,
    #[serde(default)]
    pub post_thumbnail_url: Option<String>,
    #[serde(default)]
    pub post_description: Option<String>,
    #[serde(default)]
    pub set_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub blacklist: Option<String>,
    #[serde(default)]
    pub response_type: Option<String>,
    #[serde(default)]
    pub response_text: Option<String>,
}

/// The remote endpoint as seen by the rest of the daemon.
#[async_trait]
pub trait LinkApi: Send + Sync {
    /// Fetches the current descriptor for `id`.
    async fn fetch_descriptor(&self, base_url: &str, id: &str) -> Result<LinkDescriptor>;

    /// Posts a feedback response for `id`. Returns `(true, _)` on a 2xx
    /// status, `(false, detail)` on any other status; transport failures
    /// are `Err`.
    async fn post_response(
        &self,
        base_url: &str,
        id: &str,
        api_key: &str,
        response_type: &str,
        text: Option<&str>,
    ) -> Result<(bool, String)>;

    /// Downloads the raw bytes at `url`.
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

pub fn descriptor_url(base_url: &str, id: &str) -> String {
    format!("{}/api/links/{}.json", base_url.trim_end_matches('/'), id)
}

pub fn response_url(base_url: &str, id: &str) -> String {
    format!("{}/api/links/{}/response.json", base_url.trim_end_matches('/'), id)
}

/// Builds the feedback POST body. `text` is omitted entirely when absent
/// rather than sent as null.
pub fn response_body(api_key: &str, response_type: &str, text: Option<&str>) -> serde_json::Value {
    let mut body = json!({
        "api_key": api_key,
        "type": response_type,
    });
    if let Some(text) = text {
        body["text"] = json!(text);
    }
    body
}

/// Production [`LinkApi`] backed by reqwest.
pub struct HttpLinkApi {
    client: reqwest::Client,
}

impl HttpLinkApi {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: create_client()?,
        })
    }
}

fn create_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to create HTTP client")
}

#[async_trait]
impl LinkApi for HttpLinkApi {
    async fn fetch_descriptor(&self, base_url: &str, id: &str) -> Result<LinkDescriptor> {
        let url = descriptor_url(base_url, id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Descriptor fetch for link {id} returned {status}");
        }

        resp.json::<LinkDescriptor>()
            .await
            .with_context(|| format!("Failed to decode descriptor for link {id}"))
    }

    async fn post_response(
        &self,
        base_url: &str,
        id: &str,
        api_key: &str,
        response_type: &str,
        text: Option<&str>,
    ) -> Result<(bool, String)> {
        let url = response_url(base_url, id);
        let resp = self
            .client
            .post(&url)
            .json(&response_body(api_key, response_type, text))
            .send()
            .await
            .with_context(|| format!("Failed to post response to {url}"))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_success() {
            Ok((true, body))
        } else {
            let detail = if body.is_empty() {
                status.to_string()
            } else {
                body
            };
            Ok((false, detail))
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to download {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Download of {url} returned {status}");
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {url}"))?;
        Ok(bytes.to_vec())
    }
}
