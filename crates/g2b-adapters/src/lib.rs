//! Notice source contracts, the public-data-portal adapter, and the paginated
//! window fetcher.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use g2b_core::{FetchWindow, Notice, NoticeError};
use g2b_storage::{HttpError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "g2b-adapters";

pub const DEFAULT_BASE_URL: &str =
    "http://apis.data.go.kr/1230000/ao/PubDataOpnStdService/getDataSetOpnStdBidPblancInfo";
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Per-run values threaded through every page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

/// One API response worth of notices, in the order the API returned them.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub page_no: u32,
    pub notices: Vec<Notice>,
    /// Informational only; pagination never relies on it.
    pub total_count: Option<u64>,
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("api returned result code {code}: {message}")]
    Api { code: String, message: String },
    #[error("item {index}: {source}")]
    Item {
        index: usize,
        #[source]
        source: NoticeError,
    },
    #[error("pagination exceeded {max_pages} pages")]
    PageLimit { max_pages: u32 },
    #[error("reading recorded page: {0}")]
    Io(#[from] std::io::Error),
}

/// A failed run-level fetch. Whatever was fetched before the failure is discarded.
#[derive(Debug, Error)]
#[error("fetching window {window} failed at page {page} after {fetched_so_far} notices: {cause}")]
pub struct FetchError {
    pub window: FetchWindow,
    pub page: u32,
    pub fetched_so_far: usize,
    #[source]
    pub cause: PageError,
}

#[async_trait]
pub trait NoticeSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(
        &self,
        ctx: &FetchContext,
        window: &FetchWindow,
        page_no: u32,
    ) -> Result<Page, PageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub notices: Vec<Notice>,
    /// Requests issued, including the terminating empty page.
    pub pages_requested: u32,
    pub total_count: Option<u64>,
}

/// Walks pages 1, 2, ... until the first empty page. `max_pages` bounds the
/// non-empty pages; the terminating empty page may be request `max_pages + 1`.
pub async fn fetch_window(
    source: &dyn NoticeSource,
    ctx: &FetchContext,
    window: &FetchWindow,
    max_pages: u32,
) -> Result<FetchOutcome, FetchError> {
    let mut notices = Vec::new();
    let mut total_count = None;
    let mut page_no = 1u32;

    loop {
        let page = source
            .fetch_page(ctx, window, page_no)
            .await
            .map_err(|cause| FetchError {
                window: *window,
                page: page_no,
                fetched_so_far: notices.len(),
                cause,
            })?;

        if page.total_count.is_some() {
            total_count = page.total_count;
        }
        if page.notices.is_empty() {
            info!(
                source = source.source_id(),
                %window,
                pages = page_no,
                fetched = notices.len(),
                total_count,
                "pagination finished"
            );
            return Ok(FetchOutcome {
                notices,
                pages_requested: page_no,
                total_count,
            });
        }

        if page_no > max_pages {
            return Err(FetchError {
                window: *window,
                page: page_no,
                fetched_so_far: notices.len(),
                cause: PageError::PageLimit { max_pages },
            });
        }

        debug!(page_no, items = page.notices.len(), "page fetched");
        notices.extend(page.notices);
        page_no += 1;
    }
}

/// Decodes one portal response body (`response.body.items`).
pub fn parse_page(body: &[u8], page_no: u32) -> Result<Page, PageError> {
    let mut doc: JsonValue = serde_json::from_slice(body).map_err(|err| {
        PageError::Malformed(format!("body is not JSON ({err}): {}", snippet(body)))
    })?;

    let response = doc
        .get("response")
        .ok_or_else(|| PageError::Malformed("missing `response`".into()))?;
    if let Some(header) = response.get("header") {
        if let Some(code) = header.get("resultCode").and_then(scalar_text) {
            if code != "00" && code != "0" {
                let message = header
                    .get("resultMsg")
                    .and_then(scalar_text)
                    .unwrap_or_default();
                return Err(PageError::Api { code, message });
            }
        }
    }

    let body = response
        .get("body")
        .ok_or_else(|| PageError::Malformed("missing `response.body`".into()))?;
    let total_count = body.get("totalCount").and_then(|v| match v {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    });

    let items = doc
        .pointer_mut("/response/body/items")
        .map(JsonValue::take)
        .ok_or_else(|| PageError::Malformed("missing `response.body.items`".into()))?;
    let raw_items = match items {
        JsonValue::Array(items) => items,
        // The portal reports an exhausted listing as `null` or `""`.
        JsonValue::Null => Vec::new(),
        JsonValue::String(s) if s.trim().is_empty() => Vec::new(),
        JsonValue::Object(mut wrapper) => match wrapper.remove("item") {
            Some(JsonValue::Array(items)) => items,
            Some(single @ JsonValue::Object(_)) => vec![single],
            _ => {
                return Err(PageError::Malformed(
                    "`response.body.items` object without an `item` list".into(),
                ))
            }
        },
        other => {
            return Err(PageError::Malformed(format!(
                "`response.body.items` has unexpected shape: {other}"
            )))
        }
    };

    let notices = raw_items
        .into_iter()
        .enumerate()
        .map(|(index, raw)| Notice::from_raw(raw).map_err(|source| PageError::Item { index, source }))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Page {
        page_no,
        notices,
        total_count,
    })
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body).chars().take(200).collect()
}

#[derive(Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub service_key: String,
    pub page_size: u32,
    pub inquiry_div: String,
}

impl fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalConfig")
            .field("base_url", &self.base_url)
            .field("service_key", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("inquiry_div", &self.inquiry_div)
            .finish()
    }
}

/// Bid announcements from the public data portal's open-standard dataset service.
#[derive(Debug)]
pub struct PublicDataPortalAdapter {
    http: HttpFetcher,
    config: PortalConfig,
}

impl PublicDataPortalAdapter {
    pub fn new(http: HttpFetcher, config: PortalConfig) -> Self {
        Self { http, config }
    }

    pub fn query_params(&self, window: &FetchWindow, page_no: u32) -> Vec<(&'static str, String)> {
        vec![
            ("serviceKey", self.config.service_key.clone()),
            ("pageNo", page_no.to_string()),
            ("numOfRows", self.config.page_size.to_string()),
            ("inqryDiv", self.config.inquiry_div.clone()),
            ("type", "json".to_string()),
            ("bidNtceBgnDt", window.begin_param()),
            ("bidNtceEndDt", window.end_param()),
        ]
    }
}

#[async_trait]
impl NoticeSource for PublicDataPortalAdapter {
    fn source_id(&self) -> &'static str {
        "g2b-bid-notices"
    }

    async fn fetch_page(
        &self,
        ctx: &FetchContext,
        window: &FetchWindow,
        page_no: u32,
    ) -> Result<Page, PageError> {
        let params = self.query_params(window, page_no);
        let resp = self.http.get(ctx.run_id, &self.config.base_url, &params).await?;
        parse_page(&resp.body, page_no)
    }
}

/// Replays recorded portal responses (`page-1.json`, `page-2.json`, ...) from a
/// directory. A missing page file reads as an empty page.
#[derive(Debug, Clone)]
pub struct FixtureNoticeSource {
    dir: PathBuf,
}

impl FixtureNoticeSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn page_path(&self, page_no: u32) -> PathBuf {
        self.dir.join(format!("page-{page_no}.json"))
    }
}

#[async_trait]
impl NoticeSource for FixtureNoticeSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_page(
        &self,
        _ctx: &FetchContext,
        _window: &FetchWindow,
        page_no: u32,
    ) -> Result<Page, PageError> {
        let path = self.page_path(page_no);
        match fs::read(&path).await {
            Ok(bytes) => parse_page(&bytes, page_no),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Page {
                page_no,
                notices: Vec::new(),
                total_count: None,
            }),
            Err(err) => Err(PageError::Io(err)),
        }
    }
}
