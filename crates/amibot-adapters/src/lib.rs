//! Releases-table source contracts, document parsing and row normalization.

use std::path::PathBuf;

use amibot_core::ImageRecord;
use amibot_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "amibot-adapters";

pub const DEFAULT_RELEASES_URL: &str = "https://cloud-images.ubuntu.com/locator/ec2/releasesTable";

const COL_ZONE: usize = 0;
const COL_VERSION: usize = 2;
const COL_CPU_ARCH: usize = 3;
const COL_INSTANCE_TYPE: usize = 4;
const COL_DATE: usize = 5;
const COL_AMI_LINK: usize = 6;

/// One positional row of the releases table, exactly as scraped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow {
    pub cells: Vec<JsonValue>,
}

impl RawRow {
    pub fn new(cells: Vec<JsonValue>) -> Self {
        Self { cells }
    }

    pub fn from_strs(cells: &[&str]) -> Self {
        Self {
            cells: cells
                .iter()
                .map(|c| JsonValue::String((*c).to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReleasesTable {
    #[serde(rename = "aaData")]
    aa_data: Vec<RawRow>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid releases table: {0}")]
    InvalidDocument(String),
}

/// A row that could not be turned into an [`ImageRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record: {reason}")]
pub struct MalformedRecord {
    pub reason: String,
}

impl MalformedRecord {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Parses the loosely formatted (JSON5: trailing commas etc.) releases table document.
pub fn parse_releases_table(text: &str) -> Result<Vec<RawRow>, AdapterError> {
    let table: ReleasesTable =
        json5::from_str(text).map_err(|e| AdapterError::InvalidDocument(e.to_string()))?;
    Ok(table.aa_data)
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn cell_str<'a>(row: &'a RawRow, index: usize, name: &str) -> Result<&'a str, MalformedRecord> {
    match row.cells.get(index) {
        Some(JsonValue::String(s)) => Ok(s.as_str()),
        Some(other) => Err(MalformedRecord::new(format!(
            "column {index} ({name}) is not a string: {other}"
        ))),
        None => Err(MalformedRecord::new(format!(
            "row has {} columns, missing column {index} ({name})",
            row.cells.len()
        ))),
    }
}

/// Visible text of the first anchor in an HTML snippet.
pub fn anchor_text(snippet: &str) -> Result<String, MalformedRecord> {
    let selector = Selector::parse("a").map_err(|e| MalformedRecord::new(e.to_string()))?;
    let fragment = Html::parse_fragment(snippet);
    let anchor = fragment
        .select(&selector)
        .next()
        .ok_or_else(|| MalformedRecord::new(format!("no anchor in {snippet:?}")))?;
    text_or_none(anchor.text().collect::<String>())
        .ok_or_else(|| MalformedRecord::new(format!("empty anchor text in {snippet:?}")))
}

pub fn normalize_row(row: &RawRow) -> Result<ImageRecord, MalformedRecord> {
    let ami_id = anchor_text(cell_str(row, COL_AMI_LINK, "ami link")?)?;
    Ok(ImageRecord {
        zone: cell_str(row, COL_ZONE, "zone")?.to_string(),
        version: cell_str(row, COL_VERSION, "version")?.to_string(),
        instance_type: cell_str(row, COL_INSTANCE_TYPE, "instance type")?.to_string(),
        cpu_arch: cell_str(row, COL_CPU_ARCH, "cpu arch")?.to_string(),
        date: cell_str(row, COL_DATE, "date")?.to_string(),
        ami_id,
    })
}

/// Anything that can hand the orchestrator a batch of raw rows.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_rows(&self) -> Result<Vec<RawRow>, AdapterError>;
}

/// The public Ubuntu cloud-image locator table, fetched over HTTP.
#[derive(Debug, Clone)]
pub struct LocatorReleasesTable {
    http: HttpFetcher,
    url: String,
}

impl LocatorReleasesTable {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReleaseSource for LocatorReleasesTable {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch_rows(&self) -> Result<Vec<RawRow>, AdapterError> {
        let text = self.http.get_text(&self.url).await?;
        let rows = parse_releases_table(&text)?;
        debug!(url = %self.url, rows = rows.len(), "fetched releases table");
        Ok(rows)
    }
}

/// Reads a previously captured releases table from disk.
#[derive(Debug, Clone)]
pub struct FixtureReleaseSource {
    path: PathBuf,
}

impl FixtureReleaseSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReleaseSource for FixtureReleaseSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch_rows(&self) -> Result<Vec<RawRow>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AdapterError::Read {
                path: self.path.display().to_string(),
                source,
            })?;
        parse_releases_table(&text)
    }
}

/// Fixed in-memory rows.
#[derive(Debug, Clone, Default)]
pub struct StaticReleaseSource {
    rows: Vec<RawRow>,
}

impl StaticReleaseSource {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl ReleaseSource for StaticReleaseSource {
    fn describe(&self) -> String {
        format!("static ({} rows)", self.rows.len())
    }

    async fn fetch_rows(&self) -> Result<Vec<RawRow>, AdapterError> {
        Ok(self.rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_row(link: &str) -> RawRow {
        RawRow::from_strs(&[
            "eu-west-1",
            "x",
            "16.04 LTS",
            "amd64",
            "hvm:ebs-ssd",
            "2020-01-01",
            link,
        ])
    }

    #[test]
    fn normalizes_example_row() {
        let record = normalize_row(&example_row("<a>ami-0123</a>")).unwrap();
        assert_eq!(
            record,
            ImageRecord {
                zone: "eu-west-1".into(),
                version: "16.04 LTS".into(),
                instance_type: "hvm:ebs-ssd".into(),
                cpu_arch: "amd64".into(),
                date: "2020-01-01".into(),
                ami_id: "ami-0123".into(),
            }
        );
    }

    #[test]
    fn anchor_with_href_yields_visible_text() {
        let link = r#"<a href="https://console.aws.amazon.com/ec2/home?region=eu-west-1#launchAmi=ami-0abc">ami-0abc</a>"#;
        assert_eq!(normalize_row(&example_row(link)).unwrap().ami_id, "ami-0abc");
    }

    #[test]
    fn empty_anchor_is_malformed() {
        let err = normalize_row(&example_row("<a></a>")).unwrap_err();
        assert!(err.reason.contains("empty anchor"), "{err}");
    }

    #[test]
    fn missing_anchor_is_malformed() {
        let err = normalize_row(&example_row("ami-0123")).unwrap_err();
        assert!(err.reason.contains("no anchor"), "{err}");
    }

    #[test]
    fn short_row_is_malformed() {
        let row = RawRow::from_strs(&["eu-west-1", "x", "16.04 LTS"]);
        assert!(normalize_row(&row).is_err());
    }

    #[test]
    fn non_string_cell_is_malformed() {
        let mut row = example_row("<a>ami-0123</a>");
        row.cells[COL_ZONE] = JsonValue::Null;
        let err = normalize_row(&row).unwrap_err();
        assert!(err.reason.contains("zone"), "{err}");
    }

    #[test]
    fn parses_table_with_trailing_commas() {
        let text = r##"{
  "aaData": [
    ["eu-west-1","xenial","16.04 LTS","amd64","hvm:ebs-ssd","20200101","<a href=\"#\">ami-1</a>","hvm"],
    ["eu-west-2","bionic","18.04 LTS","amd64","hvm:ebs-ssd","20200102","<a href=\"#\">ami-2</a>","hvm"],
  ],
}"##;
        let rows = parse_releases_table(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(normalize_row(&rows[1]).unwrap().ami_id, "ami-2");
    }

    #[test]
    fn document_without_rows_is_invalid() {
        assert!(matches!(
            parse_releases_table(r#"{"rows": []}"#),
            Err(AdapterError::InvalidDocument(_))
        ));
    }

    #[tokio::test]
    async fn fixture_source_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("releasesTable");
        std::fs::write(
            &path,
            r#"{"aaData": [["eu-west-1","xenial","16.04 LTS","amd64","hvm:ebs-ssd","20200101","<a>ami-1</a>"],]}"#,
        )
        .expect("write fixture");
        let rows = FixtureReleaseSource::new(&path).fetch_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn fixture_source_missing_file_is_read_error() {
        let err = FixtureReleaseSource::new("/nonexistent/releasesTable")
            .fetch_rows()
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Read { .. }));
    }
}
