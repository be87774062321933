//! Seen-set persistence and HTTP fetch utilities.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use amibot_core::ImageRecord;
use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "amibot-storage";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS data (
  version TEXT,
  date TEXT,
  zone TEXT,
  ami_id TEXT,
  cpu_arch TEXT,
  instance_type TEXT
)
"#;

const CREATE_UNIQUE_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS data_amiid_unique ON data (ami_id)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("creating database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("seen-set {op}: {source}")]
    Sql {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

fn sql(op: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Sql { op, source }
}

/// Durable set of image ids that have already been processed, keyed by `ami_id`.
#[derive(Debug, Clone)]
pub struct SeenStore {
    pool: SqlitePool,
}

impl SeenStore {
    /// Opens (creating if missing) the SQLite database at `path` and ensures the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(sql("connect options"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        // Single writer process; one connection keeps commits strictly ordered.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(sql("connect"))?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Creates the table and unique index. Safe to call any number of times.
    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(sql("create table"))?;
        sqlx::query(CREATE_UNIQUE_INDEX)
            .execute(&self.pool)
            .await
            .map_err(sql("create unique index"))?;
        Ok(())
    }

    pub async fn contains(&self, ami_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM data WHERE ami_id = ?1 LIMIT 1")
            .bind(ami_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql("lookup"))?;
        Ok(row.is_some())
    }

    /// Inserts `record`, or refreshes the non-key columns when the id already exists.
    pub async fn upsert(&self, record: &ImageRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO data (version, date, zone, ami_id, cpu_arch, instance_type)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(ami_id) DO UPDATE SET
  version = excluded.version,
  date = excluded.date,
  zone = excluded.zone,
  cpu_arch = excluded.cpu_arch,
  instance_type = excluded.instance_type
"#,
        )
        .bind(&record.version)
        .bind(&record.date)
        .bind(&record.zone)
        .bind(&record.ami_id)
        .bind(&record.cpu_arch)
        .bind(&record.instance_type)
        .execute(&self.pool)
        .await
        .map_err(sql("upsert"))?;
        debug!(ami_id = %record.ami_id, "persisted image record");
        Ok(())
    }

    pub async fn get(&self, ami_id: &str) -> Result<Option<ImageRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT version, date, zone, ami_id, cpu_arch, instance_type FROM data WHERE ami_id = ?1",
        )
        .bind(ami_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql("get"))?;

        row.map(|row| -> Result<ImageRecord, sqlx::Error> {
            Ok(ImageRecord {
                version: row.try_get::<Option<String>, _>("version")?.unwrap_or_default(),
                date: row.try_get::<Option<String>, _>("date")?.unwrap_or_default(),
                zone: row.try_get::<Option<String>, _>("zone")?.unwrap_or_default(),
                ami_id: row.try_get("ami_id")?,
                cpu_arch: row.try_get::<Option<String>, _>("cpu_arch")?.unwrap_or_default(),
                instance_type: row
                    .try_get::<Option<String>, _>("instance_type")?
                    .unwrap_or_default(),
            })
        })
        .transpose()
        .map_err(sql("decode row"))
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM data")
            .fetch_one(&self.pool)
            .await
            .map_err(sql("count"))?;
        Ok(n.max(0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl HttpClientConfig {
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build().context("building reqwest client")
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Plain GET fetcher for the scrape source. Any non-2xx status is an error.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.get_text_inner(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn get_text_inner(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text().await?)
    }
}
