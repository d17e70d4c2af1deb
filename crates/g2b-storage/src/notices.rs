//! SQLite-backed notice table: idempotent batch upsert for the pipeline and the
//! read projection consumed by the display.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use g2b_core::{collapse_duplicates, Notice};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, warn};

const UPSERT_NOTICE_SQL: &str = r#"
    INSERT INTO notices (
        notice_no,
        title,
        institution,
        business_division,
        posted_at,
        bid_open_at,
        bid_close_at,
        detail_url,
        raw_json
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (notice_no) DO UPDATE SET
        title = excluded.title,
        institution = excluded.institution,
        business_division = excluded.business_division,
        posted_at = excluded.posted_at,
        bid_open_at = excluded.bid_open_at,
        bid_close_at = excluded.bid_close_at,
        detail_url = excluded.detail_url,
        raw_json = excluded.raw_json
"#;

pub const DEFAULT_LISTING_LIMIT: u32 = 500;
const MAX_LISTING_LIMIT: u32 = 5_000;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// Upper bound for every individual store call.
    pub call_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteCause {
    #[error("encoding raw document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("opening write transaction: {0}")]
    Begin(#[source] WriteCause),
    #[error("writing notice {notice_no} (item {index}): {cause}")]
    Item {
        index: usize,
        notice_no: String,
        #[source]
        cause: WriteCause,
    },
    #[error("committing {items} notices: {cause}")]
    Commit {
        items: usize,
        #[source]
        cause: WriteCause,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    /// Notices handed to the writer, duplicates included.
    pub received: usize,
    /// Distinct identifiers written in the committed transaction.
    pub written: usize,
}

/// Full stored row.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StoredNotice {
    pub notice_no: String,
    pub title: String,
    pub institution: Option<String>,
    pub business_division: Option<String>,
    pub posted_at: Option<NaiveDateTime>,
    pub bid_open_at: Option<NaiveDateTime>,
    pub bid_close_at: Option<NaiveDateTime>,
    pub detail_url: Option<String>,
    pub raw_json: String,
}

/// The projection the display renders: one row per notice, no raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct NoticeListing {
    pub notice_no: String,
    pub title: String,
    pub institution: Option<String>,
    pub business_division: Option<String>,
    pub posted_at: Option<NaiveDateTime>,
    pub bid_close_at: Option<NaiveDateTime>,
    pub detail_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeSort {
    /// Newest posting first.
    #[default]
    Posted,
    /// Soonest deadline first.
    Closing,
}

#[derive(Debug, Clone, Default)]
pub struct NoticeQuery {
    /// Substring match on title or institution.
    pub keyword: Option<String>,
    pub division: Option<String>,
    pub posted_from: Option<NaiveDateTime>,
    pub closing_after: Option<NaiveDateTime>,
    pub sort: NoticeSort,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub window_start: NaiveDateTime,
    pub window_end: NaiveDateTime,
    pub pages: i64,
    pub fetched: i64,
    pub written: i64,
    pub watermark_after: Option<String>,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NoticeStore {
    pool: SqlitePool,
    call_timeout: Duration,
}

impl NoticeStore {
    /// Read-write handle; creates the database file when missing.
    pub async fn open(database_url: &str, options: &StoreOptions) -> anyhow::Result<Self> {
        let connect = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .busy_timeout(options.busy_timeout);
        Self::connect(connect, options).await
    }

    /// Handle for readers that must never write (the display).
    pub async fn open_read_only(database_url: &str, options: &StoreOptions) -> anyhow::Result<Self> {
        let connect = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .read_only(true)
            .busy_timeout(options.busy_timeout);
        Self::connect(connect, options).await
    }

    async fn connect(connect: SqliteConnectOptions, options: &StoreOptions) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .acquire_timeout(options.call_timeout)
            .connect_with(connect)
            .await
            .context("opening sqlite pool")?;
        Ok(Self {
            pool,
            call_timeout: options.call_timeout,
        })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running notice store migrations")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Writes the batch in one transaction; later duplicates win and nothing is
    /// committed unless every row succeeds.
    pub async fn upsert_batch(&self, notices: &[Notice]) -> Result<UpsertReport, WriteError> {
        let unique = collapse_duplicates(notices);
        let mut tx = self
            .bounded(self.pool.begin())
            .await
            .map_err(WriteError::Begin)?;

        for (index, notice) in unique.iter().enumerate() {
            if let Err(cause) = self.upsert_one(&mut tx, notice).await {
                if let Err(err) = tx.rollback().await {
                    warn!(error = %err, "rollback after failed notice write also failed");
                }
                return Err(WriteError::Item {
                    index,
                    notice_no: notice.notice_no.clone(),
                    cause,
                });
            }
        }

        self.bounded(tx.commit())
            .await
            .map_err(|cause| WriteError::Commit {
                items: unique.len(),
                cause,
            })?;

        debug!(received = notices.len(), written = unique.len(), "notice batch committed");
        Ok(UpsertReport {
            received: notices.len(),
            written: unique.len(),
        })
    }

    async fn upsert_one(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        notice: &Notice,
    ) -> Result<(), WriteCause> {
        let raw_json = serde_json::to_string(&notice.raw)?;
        let query = sqlx::query(UPSERT_NOTICE_SQL)
            .bind(&notice.notice_no)
            .bind(&notice.title)
            .bind(&notice.institution)
            .bind(&notice.business_division)
            .bind(notice.posted_at)
            .bind(notice.bid_open_at)
            .bind(notice.bid_close_at)
            .bind(&notice.detail_url)
            .bind(raw_json);
        self.bounded(query.execute(&mut **tx)).await?;
        Ok(())
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, WriteCause>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(WriteCause::Database),
            Err(_) => Err(WriteCause::Timeout(self.call_timeout)),
        }
    }

    async fn timed<T, F>(&self, what: &'static str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("{what} timed out after {:?}", self.call_timeout))?
            .context(what)
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        self.timed(
            "counting notices",
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notices").fetch_one(&self.pool),
        )
        .await
    }

    pub async fn get(&self, notice_no: &str) -> anyhow::Result<Option<StoredNotice>> {
        self.timed(
            "loading notice",
            sqlx::query_as::<_, StoredNotice>(
                r#"
                SELECT notice_no, title, institution, business_division,
                       posted_at, bid_open_at, bid_close_at, detail_url, raw_json
                  FROM notices
                 WHERE notice_no = ?
                "#,
            )
            .bind(notice_no)
            .fetch_optional(&self.pool),
        )
        .await
    }

    pub async fn list(&self, query: &NoticeQuery) -> anyhow::Result<Vec<NoticeListing>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT notice_no, title, institution, business_division, posted_at, bid_close_at, detail_url \
             FROM notices WHERE 1 = 1",
        );

        if let Some(keyword) = query.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            let pattern = format!("%{}%", escape_like(keyword));
            qb.push(" AND (title LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR institution LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        if let Some(division) = query.division.as_deref().filter(|d| !d.is_empty()) {
            qb.push(" AND business_division = ").push_bind(division.to_string());
        }
        if let Some(from) = query.posted_from {
            qb.push(" AND posted_at >= ").push_bind(from);
        }
        if let Some(after) = query.closing_after {
            qb.push(" AND bid_close_at >= ").push_bind(after);
        }

        qb.push(match query.sort {
            NoticeSort::Posted => " ORDER BY posted_at DESC, notice_no ASC",
            NoticeSort::Closing => " ORDER BY bid_close_at IS NULL, bid_close_at ASC, notice_no ASC",
        });
        let limit = query
            .limit
            .unwrap_or(DEFAULT_LISTING_LIMIT)
            .clamp(1, MAX_LISTING_LIMIT);
        qb.push(" LIMIT ").push_bind(i64::from(limit));

        self.timed(
            "listing notices",
            qb.build_query_as::<NoticeListing>().fetch_all(&self.pool),
        )
        .await
    }

    pub async fn divisions(&self) -> anyhow::Result<Vec<String>> {
        self.timed(
            "listing business divisions",
            sqlx::query_scalar::<_, String>(
                r#"
                SELECT DISTINCT business_division
                  FROM notices
                 WHERE business_division IS NOT NULL
                 ORDER BY business_division
                "#,
            )
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn record_run(&self, run: &RunRecord) -> anyhow::Result<()> {
        self.timed(
            "recording ingest run",
            sqlx::query(
                r#"
                INSERT INTO ingest_runs (
                    run_id, started_at, duration_ms, window_start, window_end,
                    pages, fetched, written, watermark_after, status, error
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (run_id) DO NOTHING
                "#,
            )
            .bind(&run.run_id)
            .bind(run.started_at)
            .bind(run.duration_ms)
            .bind(run.window_start)
            .bind(run.window_end)
            .bind(run.pages)
            .bind(run.fetched)
            .bind(run.written)
            .bind(&run.watermark_after)
            .bind(&run.status)
            .bind(&run.error)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: u32) -> anyhow::Result<Vec<RunRecord>> {
        self.timed(
            "listing ingest runs",
            sqlx::query_as::<_, RunRecord>(
                r#"
                SELECT run_id, started_at, duration_ms, window_start, window_end,
                       pages, fetched, written, watermark_after, status, error
                  FROM ingest_runs
                 ORDER BY started_at DESC
                 LIMIT ?
                "#,
            )
            .bind(i64::from(limit.max(1)))
            .fetch_all(&self.pool),
        )
        .await
    }
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use g2b_core::parse_notice_timestamp;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    async fn temp_store() -> (TempDir, String, NoticeStore) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("bids.db").display());
        let store = NoticeStore::open(&url, &StoreOptions::default())
            .await
            .expect("open store");
        store.migrate().await.expect("migrate");
        (dir, url, store)
    }

    fn notice(id: &str, title: &str, division: &str, posted: &str, closes: &str) -> Notice {
        Notice::from_raw(json!({
            "bidNtceNo": id,
            "bidNtceNm": title,
            "dminsttNm": format!("{title} office"),
            "bsnsDivNm": division,
            "bidNtceDt": posted,
            "bidNtceBgnDt": posted,
            "bidNtceEndDt": closes,
        }))
        .expect("notice")
    }

    async fn all_rows(store: &NoticeStore) -> Vec<StoredNotice> {
        sqlx::query_as::<_, StoredNotice>("SELECT * FROM notices ORDER BY notice_no")
            .fetch_all(store.pool())
            .await
            .expect("rows")
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_identifier() {
        let (_dir, _url, store) = temp_store().await;
        let batch = vec![
            notice("A1", "Bridge", "공사", "202401010003", "202401100000"),
            notice("A2", "Laptops", "물품", "202401010007", "202401120000"),
        ];

        store.upsert_batch(&batch).await.expect("first upsert");
        let once = all_rows(&store).await;
        store.upsert_batch(&batch).await.expect("second upsert");
        let twice = all_rows(&store).await;

        assert_eq!(once.len(), 2);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn later_duplicate_in_batch_wins() {
        let (_dir, _url, store) = temp_store().await;
        let batch = vec![
            notice("A1", "first title", "공사", "202401010003", "202401100000"),
            notice("A1", "second title", "공사", "202401010004", "202401100000"),
        ];

        let report = store.upsert_batch(&batch).await.expect("upsert");
        assert_eq!(report, UpsertReport { received: 2, written: 1 });

        let stored = store.get("A1").await.expect("get").expect("row");
        assert_eq!(stored.title, "second title");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reingest_replaces_every_column() {
        let (_dir, _url, store) = temp_store().await;
        store
            .upsert_batch(&[notice("A1", "draft", "공사", "202401010003", "202401100000")])
            .await
            .unwrap();

        let mut revised = Notice::from_raw(json!({"bidNtceNo": "A1", "bidNtceNm": "final"})).unwrap();
        revised.detail_url = Some("https://example.invalid/A1".into());
        store.upsert_batch(&[revised]).await.unwrap();

        let stored = store.get("A1").await.unwrap().unwrap();
        assert_eq!(stored.title, "final");
        assert_eq!(stored.institution, None);
        assert_eq!(stored.posted_at, None);
        assert_eq!(stored.detail_url.as_deref(), Some("https://example.invalid/A1"));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&stored.raw_json).unwrap(),
            json!({"bidNtceNo": "A1", "bidNtceNm": "final"})
        );
    }

    #[tokio::test]
    async fn failed_item_rolls_back_whole_batch() {
        let (_dir, _url, store) = temp_store().await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_bad BEFORE INSERT ON notices
            WHEN NEW.notice_no = 'BAD'
            BEGIN SELECT RAISE(ABORT, 'rejected by test'); END
            "#,
        )
        .execute(store.pool())
        .await
        .unwrap();

        let batch = vec![
            notice("A1", "ok", "공사", "202401010003", "202401100000"),
            notice("BAD", "boom", "공사", "202401010004", "202401100000"),
            notice("A3", "ok", "공사", "202401010005", "202401100000"),
        ];
        let err = store.upsert_batch(&batch).await.unwrap_err();
        match err {
            WriteError::Item { index, notice_no, .. } => {
                assert_eq!(index, 1);
                assert_eq!(notice_no, "BAD");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_only_handle_cannot_write() {
        let (_dir, url, store) = temp_store().await;
        store
            .upsert_batch(&[notice("A1", "ok", "공사", "202401010003", "202401100000")])
            .await
            .unwrap();

        let reader = NoticeStore::open_read_only(&url, &StoreOptions::default())
            .await
            .expect("open read-only");
        assert_eq!(reader.count().await.unwrap(), 1);
        let err = reader
            .upsert_batch(&[notice("A2", "nope", "공사", "202401010003", "202401100000")])
            .await;
        assert!(err.is_err());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn listing_filters_and_sorts() {
        let (_dir, _url, store) = temp_store().await;
        store
            .upsert_batch(&[
                notice("A1", "Bridge repair", "공사", "202401010003", "202401200000"),
                notice("A2", "Laptop purchase", "물품", "202401020003", "202401050000"),
                notice("A3", "Bridge design 100%", "용역", "202401030003", "202401150000"),
            ])
            .await
            .unwrap();

        let all = store.list(&NoticeQuery::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|n| n.notice_no.as_str()).collect();
        assert_eq!(ids, ["A3", "A2", "A1"]);

        let closing = store
            .list(&NoticeQuery {
                sort: NoticeSort::Closing,
                ..NoticeQuery::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = closing.iter().map(|n| n.notice_no.as_str()).collect();
        assert_eq!(ids, ["A2", "A3", "A1"]);

        let bridges = store
            .list(&NoticeQuery {
                keyword: Some("bridge".into()),
                ..NoticeQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(bridges.len(), 2);

        let by_institution = store
            .list(&NoticeQuery {
                keyword: Some("laptop purchase office".into()),
                ..NoticeQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(by_institution.len(), 1);

        let literal_percent = store
            .list(&NoticeQuery {
                keyword: Some("100%".into()),
                ..NoticeQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(literal_percent.len(), 1);

        let goods = store
            .list(&NoticeQuery {
                division: Some("물품".into()),
                ..NoticeQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(goods.len(), 1);
        assert_eq!(goods[0].notice_no, "A2");

        let still_open = store
            .list(&NoticeQuery {
                closing_after: parse_notice_timestamp("202401100000"),
                posted_from: parse_notice_timestamp("202401020000"),
                ..NoticeQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(still_open.len(), 1);
        assert_eq!(still_open[0].notice_no, "A3");

        assert_eq!(store.divisions().await.unwrap(), ["공사", "물품", "용역"]);
    }

    #[tokio::test]
    async fn run_log_round_trips_newest_first() {
        let (_dir, _url, store) = temp_store().await;
        let window_start = parse_notice_timestamp("202401010000").unwrap();
        let window_end = parse_notice_timestamp("202401010010").unwrap();
        for (idx, status) in ["completed", "failed"].iter().enumerate() {
            store
                .record_run(&RunRecord {
                    run_id: format!("run-{idx}"),
                    started_at: DateTime::parse_from_rfc3339(&format!("2024-01-01T00:1{idx}:00Z"))
                        .unwrap()
                        .with_timezone(&Utc),
                    duration_ms: 12,
                    window_start,
                    window_end,
                    pages: 2,
                    fetched: 3,
                    written: 3,
                    watermark_after: Some("202401010007".into()),
                    status: status.to_string(),
                    error: None,
                })
                .await
                .unwrap();
        }

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "run-1");
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[1].window_end, window_end);
    }
}
