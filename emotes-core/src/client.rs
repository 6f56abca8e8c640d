use std::io::Read;

use flate2::read::GzDecoder;
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::catalog::{RemoteEmote, RemoteSubreddit, Watermark};

const DEFAULT_BASE_URL: &str = "http://berrymotes.pew.cc/";
const SUBREDDITS_CATALOG: &str = "subreddits.json.gz";
const EMOTES_CATALOG: &str = "emotes.json.gz";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    InvalidBase(Url),
    #[error("unexpected HTTP response: {status}")]
    Status { status: StatusCode },
    #[error("failed to decompress catalog: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("malformed catalog: {0}")]
    Json(#[from] serde_json::Error),
}

impl CatalogError {
    /// Errors caused by the endpoint configuration rather than the network.
    pub fn is_malformed_endpoint(&self) -> bool {
        matches!(self, CatalogError::Url(_) | CatalogError::InvalidBase(_))
    }
}

/// Result of a conditional catalog fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogResult<T> {
    /// HTTP 304, the caller's watermark is still current.
    NotModified,
    /// HTTP 200 with the decoded entries and the response's watermark.
    Catalog {
        entries: Vec<T>,
        last_modified: Watermark,
    },
    /// HTTP 403/404, the catalog no longer exists upstream.
    Gone,
}

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: Url,
}

impl CatalogClient {
    pub fn new() -> Result<Self, CatalogError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, CatalogError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(CatalogError::InvalidBase(base_url));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn subreddits_url(&self) -> Result<Url, CatalogError> {
        self.endpoint([SUBREDDITS_CATALOG])
    }

    pub fn emotes_url(&self, subreddit: &str) -> Result<Url, CatalogError> {
        self.endpoint([subreddit, EMOTES_CATALOG])
    }

    pub fn image_url(&self, image_path: &str) -> Result<Url, CatalogError> {
        self.endpoint(image_path.split('/').filter(|part| !part.is_empty()))
    }

    pub async fn fetch_subreddits(
        &self,
        since: Watermark,
    ) -> Result<CatalogResult<RemoteSubreddit>, CatalogError> {
        let url = self.subreddits_url()?;
        self.fetch_catalog(url, since).await
    }

    pub async fn fetch_emotes(
        &self,
        subreddit: &str,
        since: Watermark,
    ) -> Result<CatalogResult<RemoteEmote>, CatalogError> {
        let url = self.emotes_url(subreddit)?;
        self.fetch_catalog(url, since).await
    }

    pub async fn fetch_catalog<T: DeserializeOwned>(
        &self,
        url: Url,
        since: Watermark,
    ) -> Result<CatalogResult<T>, CatalogError> {
        let mut request = self.http.get(url);
        if let Some(date) = since.to_http_date() {
            request = request.header(IF_MODIFIED_SINCE, date);
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                let last_modified = response
                    .headers()
                    .get(LAST_MODIFIED)
                    .and_then(|value| value.to_str().ok())
                    .and_then(Watermark::from_http_date)
                    .unwrap_or_default();
                let body = response.bytes().await?;
                let entries = decode_catalog(&body)?;
                Ok(CatalogResult::Catalog {
                    entries,
                    last_modified,
                })
            }
            StatusCode::NOT_MODIFIED => Ok(CatalogResult::NotModified),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(CatalogResult::Gone),
            status => Err(CatalogError::Status { status }),
        }
    }

    fn endpoint<'a, I>(&self, segments: I) -> Result<Url, CatalogError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CatalogError::InvalidBase(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Decodes a catalog body: a gzip-compressed JSON array. Plain JSON is
/// accepted too, and an empty body is an empty catalog.
pub fn decode_catalog<T: DeserializeOwned>(body: &[u8]) -> Result<Vec<T>, CatalogError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if !body.starts_with(&GZIP_MAGIC) {
        return Ok(serde_json::from_slice(body)?);
    }
    let mut json = Vec::with_capacity(body.len() * 4);
    GzDecoder::new(body)
        .read_to_end(&mut json)
        .map_err(CatalogError::Decompress)?;
    Ok(serde_json::from_slice(&json)?)
}
