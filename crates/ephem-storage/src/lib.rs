//! Persistence for ephemeris records: the store contract, a Postgres
//! backend, an in-memory backend, and the display read strategy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ephem_core::{Category, EphemerisRecord, PublicationKey, StoredEphemeris};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ephem-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context} failed: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("stored row is not a valid ephemeris: {0}")]
    Corrupt(String),
    #[error("applying migrations failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    fn query(context: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Query { context, source }
    }
}

/// What the writer does when the publication key already has a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    Overwrite,
    InsertOnly,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::InsertOnly => "insert-only",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "insert-only" | "insert_only" => Ok(ConflictPolicy::InsertOnly),
            other => Err(format!(
                "unknown conflict policy {other:?} (expected overwrite or insert-only)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// Insert-only write that found the key already taken.
    Unchanged,
}

/// Storage operations the pipeline and the read path need. Every write is
/// keyed by the `(day, month, year)` uniqueness constraint.
#[async_trait]
pub trait EphemerisStore: Send + Sync {
    /// `Ok(false)` is the normal "no rows" outcome, not an error.
    async fn exists(&self, key: PublicationKey) -> Result<bool, StoreError>;

    async fn find(&self, key: PublicationKey) -> Result<Option<StoredEphemeris>, StoreError>;

    /// Most recent record by publication key.
    async fn latest(&self) -> Result<Option<StoredEphemeris>, StoreError>;

    /// Single atomic write keyed on the publication key; never read-then-write.
    async fn upsert(
        &self,
        record: &EphemerisRecord,
        policy: ConflictPolicy,
    ) -> Result<WriteOutcome, StoreError>;

    /// Records of one publication month ordered by (year, month, day).
    async fn list_month(&self, year: i32, month: u32) -> Result<Vec<StoredEphemeris>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgEphemerisStore {
    pool: PgPool,
}

impl PgEphemerisStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StoreError::query("connecting to postgres"))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str = "id, day, month, year, title, description, category, \
                              display_date, source_url, created_at, updated_at";

fn row_to_stored(row: &PgRow) -> Result<StoredEphemeris, StoreError> {
    let get_err = |err: sqlx::Error| StoreError::Corrupt(err.to_string());

    let day: i16 = row.try_get("day").map_err(get_err)?;
    let month: i16 = row.try_get("month").map_err(get_err)?;
    let year: i32 = row.try_get("year").map_err(get_err)?;
    let key = PublicationKey::from_parts(day as u32, month as u32, year)
        .map_err(|err| StoreError::Corrupt(err.to_string()))?;

    let category: String = row.try_get("category").map_err(get_err)?;
    let category = category
        .parse::<Category>()
        .map_err(|err| StoreError::Corrupt(err.to_string()))?;

    Ok(StoredEphemeris {
        id: row.try_get("id").map_err(get_err)?,
        record: EphemerisRecord {
            key,
            title: row.try_get("title").map_err(get_err)?,
            description: row.try_get("description").map_err(get_err)?,
            category,
            display_date: row.try_get("display_date").map_err(get_err)?,
            source_url: row.try_get("source_url").map_err(get_err)?,
        },
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

#[async_trait]
impl EphemerisStore for PgEphemerisStore {
    async fn exists(&self, key: PublicationKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            SELECT id
              FROM ephemerides
             WHERE day = $1
               AND month = $2
               AND year = $3
            "#,
        )
        .bind(key.day() as i16)
        .bind(key.month() as i16)
        .bind(key.year())
        .fetch_one(&self.pool)
        .instrument(info_span!("existence_check", %key))
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::RowNotFound) => Ok(false),
            Err(source) => Err(StoreError::Query {
                context: "existence check",
                source,
            }),
        }
    }

    async fn find(&self, key: PublicationKey) -> Result<Option<StoredEphemeris>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM ephemerides WHERE day = $1 AND month = $2 AND year = $3"
        );
        let row = sqlx::query(&sql)
            .bind(key.day() as i16)
            .bind(key.month() as i16)
            .bind(key.year())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::query("exact lookup"))?;
        row.as_ref().map(row_to_stored).transpose()
    }

    async fn latest(&self) -> Result<Option<StoredEphemeris>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM ephemerides \
             ORDER BY year DESC, month DESC, day DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::query("latest lookup"))?;
        row.as_ref().map(row_to_stored).transpose()
    }

    async fn upsert(
        &self,
        record: &EphemerisRecord,
        policy: ConflictPolicy,
    ) -> Result<WriteOutcome, StoreError> {
        let span = info_span!("upsert", key = %record.key, %policy);
        let key = record.key;
        match policy {
            ConflictPolicy::Overwrite => {
                // xmax is zero only for a freshly inserted tuple.
                let row = sqlx::query(
                    r#"
                    INSERT INTO ephemerides (day, month, year, title, description,
                                             category, display_date, source_url)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (day, month, year) DO UPDATE SET
                        title = excluded.title,
                        description = excluded.description,
                        category = excluded.category,
                        display_date = excluded.display_date,
                        source_url = excluded.source_url,
                        updated_at = NOW()
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(key.day() as i16)
                .bind(key.month() as i16)
                .bind(key.year())
                .bind(&record.title)
                .bind(&record.description)
                .bind(record.category.as_str())
                .bind(&record.display_date)
                .bind(&record.source_url)
                .fetch_one(&self.pool)
                .instrument(span)
                .await
                .map_err(StoreError::query("upsert"))?;

                let inserted: bool = row
                    .try_get("inserted")
                    .map_err(|err| StoreError::Corrupt(err.to_string()))?;
                Ok(if inserted {
                    WriteOutcome::Inserted
                } else {
                    WriteOutcome::Updated
                })
            }
            ConflictPolicy::InsertOnly => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO ephemerides (day, month, year, title, description,
                                             category, display_date, source_url)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (day, month, year) DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(key.day() as i16)
                .bind(key.month() as i16)
                .bind(key.year())
                .bind(&record.title)
                .bind(&record.description)
                .bind(record.category.as_str())
                .bind(&record.display_date)
                .bind(&record.source_url)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await
                .map_err(StoreError::query("insert"))?;

                Ok(match row {
                    Some(_) => WriteOutcome::Inserted,
                    None => WriteOutcome::Unchanged,
                })
            }
        }
    }

    async fn list_month(&self, year: i32, month: u32) -> Result<Vec<StoredEphemeris>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM ephemerides WHERE year = $1 AND month = $2 \
             ORDER BY year ASC, month ASC, day ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(year)
            .bind(month as i16)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::query("month scan"))?;
        rows.iter().map(row_to_stored).collect()
    }
}

/// In-process store with the same keyed semantics as Postgres. Counts writes
/// and can be told to fail, which is what the pipeline tests lean on.
#[derive(Debug, Default)]
pub struct MemoryEphemerisStore {
    rows: Mutex<BTreeMap<PublicationKey, StoredEphemeris>>,
    writes: AtomicUsize,
    read_failure: Mutex<Option<String>>,
    find_failure: Mutex<Option<String>>,
    write_failure: Mutex<Option<String>>,
}

impl MemoryEphemerisStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts a row in place without counting it as a write.
    pub async fn seed(&self, record: EphemerisRecord, at: DateTime<Utc>) -> StoredEphemeris {
        let stored = StoredEphemeris {
            id: Uuid::new_v4(),
            record,
            created_at: at,
            updated_at: at,
        };
        self.rows
            .lock()
            .await
            .insert(stored.record.key, stored.clone());
        stored
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    pub async fn fail_reads(&self, message: Option<&str>) {
        *self.read_failure.lock().await = message.map(ToString::to_string);
    }

    /// Fails exact lookups only; `latest` and scans keep working.
    pub async fn fail_finds(&self, message: Option<&str>) {
        *self.find_failure.lock().await = message.map(ToString::to_string);
    }

    pub async fn fail_writes(&self, message: Option<&str>) {
        *self.write_failure.lock().await = message.map(ToString::to_string);
    }

    async fn check_reads(&self) -> Result<(), StoreError> {
        match self.read_failure.lock().await.as_ref() {
            Some(message) => Err(StoreError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EphemerisStore for MemoryEphemerisStore {
    async fn exists(&self, key: PublicationKey) -> Result<bool, StoreError> {
        self.check_reads().await?;
        Ok(self.rows.lock().await.contains_key(&key))
    }

    async fn find(&self, key: PublicationKey) -> Result<Option<StoredEphemeris>, StoreError> {
        self.check_reads().await?;
        if let Some(message) = self.find_failure.lock().await.as_ref() {
            return Err(StoreError::Backend(message.clone()));
        }
        Ok(self.rows.lock().await.get(&key).cloned())
    }

    async fn latest(&self) -> Result<Option<StoredEphemeris>, StoreError> {
        self.check_reads().await?;
        Ok(self
            .rows
            .lock()
            .await
            .last_key_value()
            .map(|(_, v)| v.clone()))
    }

    async fn upsert(
        &self,
        record: &EphemerisRecord,
        policy: ConflictPolicy,
    ) -> Result<WriteOutcome, StoreError> {
        if let Some(message) = self.write_failure.lock().await.as_ref() {
            return Err(StoreError::Backend(message.clone()));
        }

        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let outcome = match (rows.get_mut(&record.key), policy) {
            (Some(_), ConflictPolicy::InsertOnly) => return Ok(WriteOutcome::Unchanged),
            (Some(existing), ConflictPolicy::Overwrite) => {
                existing.record = record.clone();
                existing.updated_at = now;
                WriteOutcome::Updated
            }
            (None, _) => {
                rows.insert(
                    record.key,
                    StoredEphemeris {
                        id: Uuid::new_v4(),
                        record: record.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                WriteOutcome::Inserted
            }
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn list_month(&self, year: i32, month: u32) -> Result<Vec<StoredEphemeris>, StoreError> {
        self.check_reads().await?;
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|row| row.record.key.year() == year && row.record.key.month() == month)
            .cloned()
            .collect())
    }
}

/// How the display side answers "what is today's ephemeris".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadStrategy {
    /// No row for today means nothing to show.
    ExactOnly,
    /// No row for today falls back to the most recent record.
    #[default]
    ExactOrLatest,
}

impl FromStr for ReadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact-only" | "exact" => Ok(ReadStrategy::ExactOnly),
            "exact-or-latest" | "latest" => Ok(ReadStrategy::ExactOrLatest),
            other => Err(format!(
                "unknown read strategy {other:?} (expected exact-only or exact-or-latest)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DisplayRead {
    pub requested: PublicationKey,
    pub ephemeris: Option<StoredEphemeris>,
    pub is_fallback: bool,
}

/// Reads the record to display for `requested`. Storage errors degrade to
/// "nothing to show" instead of failing the page.
pub async fn read_for_display(
    store: &dyn EphemerisStore,
    strategy: ReadStrategy,
    requested: PublicationKey,
) -> DisplayRead {
    let exact = match store.find(requested).await {
        Ok(found) => found,
        Err(err) => {
            warn!(%requested, error = %err, "exact ephemeris lookup failed");
            None
        }
    };

    if exact.is_some() || strategy == ReadStrategy::ExactOnly {
        return DisplayRead {
            requested,
            ephemeris: exact,
            is_fallback: false,
        };
    }

    match store.latest().await {
        Ok(latest) => DisplayRead {
            requested,
            is_fallback: latest.is_some(),
            ephemeris: latest,
        },
        Err(err) => {
            warn!(%requested, error = %err, "latest ephemeris lookup failed");
            DisplayRead {
                requested,
                ephemeris: None,
                is_fallback: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PublicationKey {
        PublicationKey::parse(s).expect("key")
    }

    fn record(k: &str, title: &str) -> EphemerisRecord {
        let key = key(k);
        EphemerisRecord {
            key,
            title: title.to_string(),
            description: format!("{title} on {}", key.display_date()),
            category: Category::Computing,
            display_date: key.display_date(),
            source_url: "https://en.wikipedia.org/wiki/ENIAC".to_string(),
        }
    }

    #[tokio::test]
    async fn existence_distinguishes_absent_from_present() {
        let store = MemoryEphemerisStore::new();
        assert!(!store.exists(key("2026-01-14")).await.unwrap());
        store.upsert(&record("2026-01-14", "ENIAC"), ConflictPolicy::Overwrite).await.unwrap();
        assert!(store.exists(key("2026-01-14")).await.unwrap());
        assert!(!store.exists(key("2025-01-14")).await.unwrap());
    }

    #[tokio::test]
    async fn existence_surfaces_genuine_failures() {
        let store = MemoryEphemerisStore::new();
        store.fail_reads(Some("connection reset")).await;
        let err = store.exists(key("2026-01-14")).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn overwrite_converges_to_last_write_with_one_row() {
        let store = MemoryEphemerisStore::new();
        let first = store
            .upsert(&record("2026-01-14", "first"), ConflictPolicy::Overwrite)
            .await
            .unwrap();
        let created = store.find(key("2026-01-14")).await.unwrap().unwrap();
        let second = store
            .upsert(&record("2026-01-14", "second"), ConflictPolicy::Overwrite)
            .await
            .unwrap();

        assert_eq!(first, WriteOutcome::Inserted);
        assert_eq!(second, WriteOutcome::Updated);
        assert_eq!(store.len().await, 1);

        let row = store.find(key("2026-01-14")).await.unwrap().unwrap();
        assert_eq!(row.record.title, "second");
        assert_eq!(row.id, created.id);
        assert_eq!(row.created_at, created.created_at);
    }

    #[tokio::test]
    async fn insert_only_keeps_the_first_write() {
        let store = MemoryEphemerisStore::new();
        store
            .upsert(&record("2026-01-14", "first"), ConflictPolicy::InsertOnly)
            .await
            .unwrap();
        let outcome = store
            .upsert(&record("2026-01-14", "second"), ConflictPolicy::InsertOnly)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Unchanged);
        assert_eq!(store.write_count(), 1);
        let row = store.find(key("2026-01-14")).await.unwrap().unwrap();
        assert_eq!(row.record.title, "first");
    }

    #[tokio::test]
    async fn month_scan_is_filtered_and_ordered() {
        let store = MemoryEphemerisStore::new();
        for k in ["2026-01-20", "2026-02-01", "2026-01-03", "2025-01-10", "2026-01-11"] {
            store.upsert(&record(k, k), ConflictPolicy::Overwrite).await.unwrap();
        }
        let days: Vec<u32> = store
            .list_month(2026, 1)
            .await
            .unwrap()
            .iter()
            .map(|r| r.record.key.day())
            .collect();
        assert_eq!(days, vec![3, 11, 20]);
    }

    #[tokio::test]
    async fn read_strategies_disagree_only_on_absence() {
        let store = MemoryEphemerisStore::new();
        store.upsert(&record("2026-01-10", "older"), ConflictPolicy::Overwrite).await.unwrap();
        store.upsert(&record("2026-01-12", "newest"), ConflictPolicy::Overwrite).await.unwrap();

        let exact = read_for_display(&store, ReadStrategy::ExactOnly, key("2026-01-14")).await;
        assert!(exact.ephemeris.is_none());
        assert!(!exact.is_fallback);

        let fallback = read_for_display(&store, ReadStrategy::ExactOrLatest, key("2026-01-14")).await;
        assert!(fallback.is_fallback);
        assert_eq!(fallback.ephemeris.unwrap().record.title, "newest");

        let hit = read_for_display(&store, ReadStrategy::ExactOrLatest, key("2026-01-10")).await;
        assert!(!hit.is_fallback);
        assert_eq!(hit.ephemeris.unwrap().record.title, "older");
    }

    #[tokio::test]
    async fn read_path_degrades_on_storage_errors() {
        let store = MemoryEphemerisStore::new();
        store.upsert(&record("2026-01-12", "newest"), ConflictPolicy::Overwrite).await.unwrap();
        store.fail_reads(Some("boom")).await;
        let read = read_for_display(&store, ReadStrategy::ExactOrLatest, key("2026-01-12")).await;
        assert!(read.ephemeris.is_none());
        assert!(!read.is_fallback);
    }

    #[tokio::test]
    async fn failed_exact_lookup_still_falls_back_to_latest() {
        let store = MemoryEphemerisStore::new();
        store.upsert(&record("2026-01-10", "older"), ConflictPolicy::Overwrite).await.unwrap();
        store.upsert(&record("2026-01-12", "newest"), ConflictPolicy::Overwrite).await.unwrap();
        store.fail_finds(Some("statement timeout")).await;

        let read = read_for_display(&store, ReadStrategy::ExactOrLatest, key("2026-01-10")).await;
        assert!(read.is_fallback);
        assert_eq!(read.ephemeris.unwrap().record.title, "newest");

        let exact = read_for_display(&store, ReadStrategy::ExactOnly, key("2026-01-10")).await;
        assert!(exact.ephemeris.is_none());
        assert!(!exact.is_fallback);
    }

    #[test]
    fn policies_parse_from_config_strings() {
        assert_eq!("overwrite".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Overwrite));
        assert_eq!(" Insert-Only ".parse::<ConflictPolicy>(), Ok(ConflictPolicy::InsertOnly));
        assert!("upsert".parse::<ConflictPolicy>().is_err());
        assert_eq!("exact-only".parse::<ReadStrategy>(), Ok(ReadStrategy::ExactOnly));
        assert_eq!("exact-or-latest".parse::<ReadStrategy>(), Ok(ReadStrategy::ExactOrLatest));
        assert!("newest".parse::<ReadStrategy>().is_err());
    }

    // Runs only against a disposable database.
    #[tokio::test]
    async fn postgres_upsert_round_trip() {
        let Ok(url) = std::env::var("EPHEMERIS_TEST_DATABASE_URL") else {
            return;
        };
        let store = PgEphemerisStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        let k = key("1901-01-14");
        sqlx::query("DELETE FROM ephemerides WHERE day = 14 AND month = 1 AND year = 1901")
            .execute(store.pool())
            .await
            .expect("cleanup");

        assert!(!store.exists(k).await.unwrap());
        let first = store
            .upsert(&record("1901-01-14", "first"), ConflictPolicy::Overwrite)
            .await
            .unwrap();
        let second = store
            .upsert(&record("1901-01-14", "second"), ConflictPolicy::Overwrite)
            .await
            .unwrap();
        let skipped = store
            .upsert(&record("1901-01-14", "third"), ConflictPolicy::InsertOnly)
            .await
            .unwrap();
        assert_eq!(first, WriteOutcome::Inserted);
        assert_eq!(second, WriteOutcome::Updated);
        assert_eq!(skipped, WriteOutcome::Unchanged);
        assert!(store.exists(k).await.unwrap());

        let rows = store.list_month(1901, 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.title, "second");

        sqlx::query("DELETE FROM ephemerides WHERE day = 14 AND month = 1 AND year = 1901")
            .execute(store.pool())
            .await
            .expect("cleanup");
    }
}
