//! Read-only Axum + Askama view over the collected notices.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{FixedOffset, NaiveDateTime, Offset, Utc};
use g2b_core::parse_notice_timestamp;
use g2b_storage::{NoticeListing, NoticeQuery, NoticeSort, NoticeStore, RunRecord, StoreOptions};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "g2b-web";

const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M";
const DEFAULT_RUNS_LIMIT: u32 = 20;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub database_url: String,
    pub port: u16,
    pub utc_offset: FixedOffset,
}

impl WebConfig {
    /// Lenient: anything unparseable falls back to its default.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://bids_raw.db".into()),
            port: var("G2B_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
            utc_offset: utc_offset_or_kst(var("G2B_UTC_OFFSET_HOURS").as_deref()),
        }
    }
}

fn utc_offset_or_kst(hours: Option<&str>) -> FixedOffset {
    hours
        .and_then(|v| v.trim().parse::<i32>().ok())
        .filter(|h| (-12..=14).contains(h))
        .and_then(|h| FixedOffset::east_opt(h * 3600))
        .unwrap_or_else(kst)
}

fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix())
}

/// Holds a lazily opened read-only store; a failed open is retried on the next request.
pub struct AppState {
    database_url: String,
    options: StoreOptions,
    utc_offset: FixedOffset,
    store: OnceCell<NoticeStore>,
}

impl AppState {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            options: StoreOptions::default(),
            utc_offset: kst(),
            store: OnceCell::new(),
        }
    }

    pub fn from_config(config: &WebConfig) -> Self {
        Self {
            utc_offset: config.utc_offset,
            ..Self::new(config.database_url.clone())
        }
    }

    async fn store(&self) -> anyhow::Result<&NoticeStore> {
        self.store
            .get_or_try_init(|| NoticeStore::open_read_only(&self.database_url, &self.options))
            .await
    }

    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.utc_offset).naive_local()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NoticeParams {
    q: Option<String>,
    division: Option<String>,
    sort: Option<String>,
    limit: Option<u32>,
    /// Posted on or after this date (`YYYY-MM-DD` or a portal timestamp).
    from: Option<String>,
    /// Only notices whose deadline has not passed.
    open: Option<bool>,
}

impl NoticeParams {
    fn to_query(&self, now: NaiveDateTime) -> NoticeQuery {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        NoticeQuery {
            keyword: non_empty(&self.q),
            division: non_empty(&self.division),
            posted_from: self.from.as_deref().and_then(parse_notice_timestamp),
            closing_after: self.open.unwrap_or(false).then_some(now),
            sort: match self.sort.as_deref().map(str::trim) {
                Some("closing") => NoticeSort::Closing,
                _ => NoticeSort::Posted,
            },
            limit: self.limit,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunsParams {
    limit: Option<u32>,
}

#[derive(Debug, Clone)]
struct NoticeRow {
    notice_no: String,
    title: String,
    institution: String,
    division: String,
    posted: String,
    closing: String,
    detail_url: String,
}

impl From<NoticeListing> for NoticeRow {
    fn from(n: NoticeListing) -> Self {
        let when = |ts: Option<NaiveDateTime>| {
            ts.map(|t| t.format(DISPLAY_FORMAT).to_string())
                .unwrap_or_default()
        };
        Self {
            posted: when(n.posted_at),
            closing: when(n.bid_close_at),
            notice_no: n.notice_no,
            title: n.title,
            institution: n.institution.unwrap_or_default(),
            division: n.business_division.unwrap_or_default(),
            detail_url: n.detail_url.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
struct DivisionOption {
    name: String,
    selected: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    banner: String,
    keyword: String,
    sort_closing: bool,
    divisions: Vec<DivisionOption>,
    rows: Vec<NoticeRow>,
}

#[derive(Debug, Serialize)]
struct NoticesResponse {
    notices: Vec<NoticeListing>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunsResponse {
    runs: Vec<RunRecord>,
    error: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/notices", get(notices_api_handler))
        .route("/api/runs", get(runs_api_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, database_url = %config.database_url, "display listening");
    axum::serve(listener, app(AppState::from_config(&config))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn load_listing(
    state: &AppState,
    query: &NoticeQuery,
) -> anyhow::Result<(Vec<NoticeListing>, Vec<String>)> {
    let store = state.store().await?;
    let notices = store.list(query).await?;
    let divisions = store.divisions().await?;
    Ok((notices, divisions))
}

async fn load_notices(state: &AppState, query: &NoticeQuery) -> anyhow::Result<Vec<NoticeListing>> {
    state.store().await?.list(query).await
}

async fn load_runs(state: &AppState, limit: u32) -> anyhow::Result<Vec<RunRecord>> {
    state.store().await?.recent_runs(limit).await
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NoticeParams>,
) -> Response {
    let query = params.to_query(state.now());
    let (notices, divisions, banner) = match load_listing(&state, &query).await {
        Ok((notices, divisions)) => (notices, divisions, String::new()),
        Err(err) => {
            warn!(error = %err, "display could not load notices");
            (Vec::new(), Vec::new(), format!("{err:#}"))
        }
    };

    let selected = query.division.clone().unwrap_or_default();
    render_html(IndexTemplate {
        banner,
        keyword: query.keyword.clone().unwrap_or_default(),
        sort_closing: query.sort == NoticeSort::Closing,
        divisions: divisions
            .into_iter()
            .map(|name| DivisionOption {
                selected: name == selected,
                name,
            })
            .collect(),
        rows: notices.into_iter().map(NoticeRow::from).collect(),
    })
}

async fn notices_api_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NoticeParams>,
) -> Json<NoticesResponse> {
    let query = params.to_query(state.now());
    Json(match load_notices(&state, &query).await {
        Ok(notices) => NoticesResponse {
            notices,
            error: None,
        },
        Err(err) => {
            warn!(error = %err, "display could not load notices");
            NoticesResponse {
                notices: Vec::new(),
                error: Some(format!("{err:#}")),
            }
        }
    })
}

async fn runs_api_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunsParams>,
) -> Json<RunsResponse> {
    let limit = params.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    Json(match load_runs(&state, limit).await {
        Ok(runs) => RunsResponse { runs, error: None },
        Err(err) => {
            warn!(error = %err, "display could not load run log");
            RunsResponse {
                runs: Vec::new(),
                error: Some(format!("{err:#}")),
            }
        }
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Template error: {err}")),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use g2b_core::Notice;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn notice(id: &str, title: &str, institution: &str, division: &str, posted: &str, closes: &str) -> Notice {
        Notice::from_raw(json!({
            "bidNtceNo": id,
            "bidNtceNm": title,
            "dminsttNm": institution,
            "bsnsDivNm": division,
            "bidNtceDt": posted,
            "bidNtceBgnDt": posted,
            "bidNtceEndDt": closes,
            "bidNtceDtlUrl": format!("https://www.g2b.go.kr/notice/{id}"),
        }))
        .expect("notice")
    }

    async fn seeded_db() -> (TempDir, String) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("bids_raw.db").display());
        let store = NoticeStore::open(&url, &StoreOptions::default()).await.expect("open");
        store.migrate().await.expect("migrate");
        store
            .upsert_batch(&[
                notice("N1", "Road paving works", "Busan City", "construction", "202401020900", "202401200000"),
                notice("N2", "Cloud hosting service", "Seoul Metropolitan Government", "service", "202401030900", "202401100000"),
                notice("N3", "Office chairs", "Daegu Office of Education", "goods", "202401010900", "202401300000"),
            ])
            .await
            .expect("seed");
        store.close().await;
        (dir, url)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn index_lists_stored_notices() {
        let (_dir, url) = seeded_db().await;
        let (status, html) = get(app(AppState::new(url)), "/").await;

        assert_eq!(status, StatusCode::OK);
        assert!(html.contains("G2B Bid Notices"));
        assert!(html.contains("Road paving works"));
        assert!(html.contains("Cloud hosting service"));
        assert!(html.contains("2024-01-03 09:00"));
        assert!(html.contains("https://www.g2b.go.kr/notice/N1"));
        assert!(!html.contains("Could not load notices"));
    }

    #[tokio::test]
    async fn keyword_matches_title_or_institution() {
        let (_dir, url) = seeded_db().await;
        let app = app(AppState::new(url));

        let (_, by_title) = get(app.clone(), "/?q=paving").await;
        assert!(by_title.contains("Road paving works"));
        assert!(!by_title.contains("Office chairs"));

        let (_, by_institution) = get(app, "/?q=Seoul").await;
        assert!(by_institution.contains("Cloud hosting service"));
        assert!(!by_institution.contains("Road paving works"));
    }

    #[tokio::test]
    async fn api_notices_sorts_by_deadline_and_filters_division() {
        let (_dir, url) = seeded_db().await;
        let app = app(AppState::new(url));

        let (status, body) = get(app.clone(), "/api/notices?sort=closing").await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_str(&body).unwrap();
        let ids: Vec<&str> = v["notices"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["notice_no"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["N2", "N1", "N3"]);
        assert!(v["error"].is_null());

        let (_, body) = get(app, "/api/notices?division=goods&limit=10").await;
        let v: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["notices"].as_array().unwrap().len(), 1);
        assert_eq!(v["notices"][0]["notice_no"], "N3");
    }

    #[tokio::test]
    async fn posted_from_filter_uses_date() {
        let (_dir, url) = seeded_db().await;
        let (_, body) = get(app(AppState::new(url)), "/api/notices?from=2024-01-02").await;
        let v: Value = serde_json::from_str(&body).unwrap();
        let ids: Vec<&str> = v["notices"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["notice_no"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["N2", "N1"]);
    }

    #[tokio::test]
    async fn missing_database_renders_banner_not_error() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("absent.db").display());
        let app = app(AppState::new(url));

        let (status, html) = get(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(html.contains("Could not load notices"));
        assert!(html.contains("0 notices shown"));

        let (status, body) = get(app, "/api/notices").await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_str(&body).unwrap();
        assert!(v["notices"].as_array().unwrap().is_empty());
        assert!(v["error"].is_string());
    }

    #[tokio::test]
    async fn display_never_creates_the_database() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("absent.db");
        let url = format!("sqlite://{}", path.display());

        let _ = get(app(AppState::new(url)), "/").await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn api_runs_reports_recorded_runs() {
        let (_dir, url) = seeded_db().await;
        let store = NoticeStore::open(&url, &StoreOptions::default()).await.unwrap();
        store
            .record_run(&RunRecord {
                run_id: "run-1".into(),
                started_at: Utc::now(),
                duration_ms: 42,
                window_start: parse_notice_timestamp("202401010000").unwrap(),
                window_end: parse_notice_timestamp("202401010010").unwrap(),
                pages: 2,
                fetched: 3,
                written: 3,
                watermark_after: Some("202401010009".into()),
                status: "completed".into(),
                error: None,
            })
            .await
            .unwrap();
        store.close().await;

        let (status, body) = get(app(AppState::new(url)), "/api/runs").await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["runs"][0]["run_id"], "run-1");
        assert_eq!(v["runs"][0]["status"], "completed");
    }

    #[test]
    fn utc_offset_outside_range_falls_back_to_kst() {
        assert_eq!(utc_offset_or_kst(Some("0")), FixedOffset::east_opt(0).unwrap());
        assert_eq!(utc_offset_or_kst(Some(" -5 ")), FixedOffset::east_opt(-5 * 3600).unwrap());
        for raw in [None, Some("abc"), Some("15"), Some("-13"), Some("2147483647"), Some("-2147483648")] {
            assert_eq!(utc_offset_or_kst(raw), kst(), "{raw:?}");
        }
    }

    #[test]
    fn unknown_sort_falls_back_to_posted() {
        let params = NoticeParams {
            sort: Some("random".into()),
            ..NoticeParams::default()
        };
        let now = parse_notice_timestamp("202401010000").unwrap();
        assert_eq!(params.to_query(now).sort, NoticeSort::Posted);

        let params = NoticeParams {
            open: Some(true),
            q: Some("  ".into()),
            ..NoticeParams::default()
        };
        let query = params.to_query(now);
        assert_eq!(query.closing_after, Some(now));
        assert_eq!(query.keyword, None);
    }
}
