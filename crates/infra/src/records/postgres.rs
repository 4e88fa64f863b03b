//! Postgres-backed record store.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | RecordStoreError |
//! |------------|---------------|------------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (other) | any | `Database` |
//! | PoolClosed / Io / other | n/a | `Database` |
//! | Row decode failure | n/a | `Decode` |

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{info, instrument, Span};
use uuid::Uuid;

use async_trait::async_trait;
use orpheon_core::{AudioProcessingRecord, JobId, ResultUrls, UserId};

use super::{JobRecordStore, RecordStoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_audio_processings.sql");

const COLUMNS: &str = "id, user_id, name, size, duration, format, bitrate, \
     standard_audio_url, dynamic_audio_url, smooth_audio_url, manual_audio_url, \
     created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a small pool against `database_url`.
    #[instrument(skip(database_url), err)]
    pub async fn connect(database_url: &str) -> Result<Self, RecordStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error(None, "connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `audio_processings` table if it does not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), RecordStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(None, "ensure_schema", e))?;
        info!("audio_processings schema ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_one_updated(
        &self,
        id: JobId,
        operation: &'static str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<AudioProcessingRecord, RecordStoreError> {
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(Some(id), operation, e))?
            .ok_or(RecordStoreError::NotFound(id))?;
        decode(&row)
    }
}

#[async_trait]
impl JobRecordStore for PostgresRecordStore {
    #[instrument(skip(self, record), fields(job_id = %record.id, owner = %record.owner), err)]
    async fn insert(&self, record: &AudioProcessingRecord) -> Result<(), RecordStoreError> {
        sqlx::query(
            r#"
            INSERT INTO audio_processings (
                id, user_id, name, size, duration, format, bitrate,
                standard_audio_url, dynamic_audio_url, smooth_audio_url, manual_audio_url,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(*record.id.as_uuid())
        .bind(*record.owner.as_uuid())
        .bind(&record.name)
        .bind(record.size)
        .bind(record.duration)
        .bind(&record.format)
        .bind(record.bitrate)
        .bind(&record.standard_audio_url)
        .bind(&record.dynamic_audio_url)
        .bind(&record.smooth_audio_url)
        .bind(&record.manual_audio_url)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(Some(record.id), "insert", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<AudioProcessingRecord>, RecordStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM audio_processings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(Some(id), "get", e))?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), fields(owner = %owner, record_count = tracing::field::Empty), err)]
    async fn list_by_owner(
        &self,
        owner: UserId,
    ) -> Result<Vec<AudioProcessingRecord>, RecordStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM audio_processings \
             WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(*owner.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(None, "list_by_owner", e))?;

        let records = rows.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("record_count", records.len());
        Ok(records)
    }

    #[instrument(skip(self, urls), fields(job_id = %id), err)]
    async fn save_results(
        &self,
        id: JobId,
        urls: &ResultUrls,
        at: DateTime<Utc>,
    ) -> Result<AudioProcessingRecord, RecordStoreError> {
        let sql = format!(
            "UPDATE audio_processings \
             SET standard_audio_url = $2, dynamic_audio_url = $3, smooth_audio_url = $4, \
                 updated_at = $5 \
             WHERE id = $1 RETURNING {COLUMNS}"
        );
        let query = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .bind(&urls.standard)
            .bind(&urls.dynamic)
            .bind(&urls.smooth)
            .bind(at);
        self.fetch_one_updated(id, "save_results", query).await
    }

    #[instrument(skip(self, url), fields(job_id = %id), err)]
    async fn save_manual(
        &self,
        id: JobId,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<AudioProcessingRecord, RecordStoreError> {
        let sql = format!(
            "UPDATE audio_processings SET manual_audio_url = $2, updated_at = $3 \
             WHERE id = $1 RETURNING {COLUMNS}"
        );
        let query = sqlx::query(&sql).bind(*id.as_uuid()).bind(url).bind(at);
        self.fetch_one_updated(id, "save_manual", query).await
    }
}

fn decode(row: &PgRow) -> Result<AudioProcessingRecord, RecordStoreError> {
    AudioProcessingRow::from_row(row)
        .map(Into::into)
        .map_err(|e| RecordStoreError::Decode(e.to_string()))
}

fn map_sqlx_error(id: Option<JobId>, operation: &str, err: sqlx::Error) -> RecordStoreError {
    match err {
        sqlx::Error::Database(db_err) => match (db_err.code().as_deref(), id) {
            (Some("23505"), Some(id)) => RecordStoreError::Duplicate(id),
            _ => RecordStoreError::Database(format!(
                "database error in {operation}: {}",
                db_err.message()
            )),
        },
        sqlx::Error::PoolClosed => {
            RecordStoreError::Database(format!("connection pool closed during {operation}"))
        }
        other => RecordStoreError::Database(format!("{operation} failed: {other}")),
    }
}

#[derive(Debug, Clone)]
struct AudioProcessingRow {
    id: Uuid,
    user_id: Uuid,
    name: String,
    size: i64,
    duration: i32,
    format: String,
    bitrate: i32,
    standard_audio_url: Option<String>,
    dynamic_audio_url: Option<String>,
    smooth_audio_url: Option<String>,
    manual_audio_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AudioProcessingRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AudioProcessingRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            size: row.try_get("size")?,
            duration: row.try_get("duration")?,
            format: row.try_get("format")?,
            bitrate: row.try_get("bitrate")?,
            standard_audio_url: row.try_get("standard_audio_url")?,
            dynamic_audio_url: row.try_get("dynamic_audio_url")?,
            smooth_audio_url: row.try_get("smooth_audio_url")?,
            manual_audio_url: row.try_get("manual_audio_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<AudioProcessingRow> for AudioProcessingRecord {
    fn from(row: AudioProcessingRow) -> Self {
        AudioProcessingRecord {
            id: JobId::from_uuid(row.id),
            owner: UserId::from_uuid(row.user_id),
            name: row.name,
            size: row.size,
            duration: row.duration,
            format: row.format,
            bitrate: row.bitrate,
            standard_audio_url: row.standard_audio_url,
            dynamic_audio_url: row.dynamic_audio_url,
            smooth_audio_url: row.smooth_audio_url,
            manual_audio_url: row.manual_audio_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_the_record_table_idempotently() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS audio_processings"));
        assert!(SCHEMA.contains("CREATE INDEX IF NOT EXISTS"));
        for column in COLUMNS.split(',').map(str::trim) {
            assert!(SCHEMA.contains(column), "schema is missing column {column}");
        }
    }

    #[test]
    fn row_maps_onto_record() {
        let now = Utc::now();
        let row = AudioProcessingRow {
            id: Uuid::nil(),
            user_id: Uuid::from_u128(42),
            name: "take.flac".into(),
            size: 42,
            duration: 61,
            format: "flac".into(),
            bitrate: 900,
            standard_audio_url: Some("s".into()),
            dynamic_audio_url: None,
            smooth_audio_url: None,
            manual_audio_url: None,
            created_at: now,
            updated_at: now,
        };
        let record: AudioProcessingRecord = row.into();
        assert_eq!(record.id, JobId::from_uuid(Uuid::nil()));
        assert_eq!(record.owner, UserId::from_uuid(Uuid::from_u128(42)));
        assert_eq!(record.standard_audio_url.as_deref(), Some("s"));
        assert!(!record.has_all_results());
    }
}
