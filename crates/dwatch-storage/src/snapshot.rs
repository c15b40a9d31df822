//! Flat CSV snapshot tables, one file per table, replaced atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dwatch_core::{
    CanonicalBatch, CompanyRecord, ContractItem, NewsItem, PricePoint, QuoteSnapshot, SourceId,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has columns {found:?}, expected {expected:?}")]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        StoreError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A row type with a fixed on-disk table name and column order.
pub trait SnapshotTable: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
}

impl SnapshotTable for NewsItem {
    const TABLE: &'static str = "news";
    const COLUMNS: &'static [&'static str] = &["company", "title", "link", "published"];
}

impl SnapshotTable for ContractItem {
    const TABLE: &'static str = "contracts";
    const COLUMNS: &'static [&'static str] = &["date", "title", "summary", "link"];
}

impl SnapshotTable for CompanyRecord {
    const TABLE: &'static str = "companies";
    const COLUMNS: &'static [&'static str] = &["name", "country", "sector", "ticker"];
}

/// Long-format quote row: one row per history point, quote fields repeated.
/// A quote without history is written as a single row with empty `timestamp` and `close`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRow {
    pub label: String,
    pub ticker: String,
    pub price: Option<f64>,
    pub change_percent: Option<f64>,
    pub market_cap: Option<f64>,
    pub beta: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub volume: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub close: Option<f64>,
}

impl SnapshotTable for QuoteRow {
    const TABLE: &'static str = "quotes";
    const COLUMNS: &'static [&'static str] = &[
        "label",
        "ticker",
        "price",
        "change_percent",
        "market_cap",
        "beta",
        "pe_ratio",
        "volume",
        "timestamp",
        "close",
    ];
}

impl QuoteRow {
    fn from_quote(quote: &QuoteSnapshot, point: Option<&PricePoint>) -> Self {
        Self {
            label: quote.label.clone(),
            ticker: quote.ticker.clone(),
            price: quote.price,
            change_percent: quote.change_percent,
            market_cap: quote.market_cap,
            beta: quote.beta,
            pe_ratio: quote.pe_ratio,
            volume: quote.volume,
            timestamp: point.map(|p| p.timestamp),
            close: point.map(|p| p.close),
        }
    }
}

pub fn quotes_to_rows(quotes: &[QuoteSnapshot]) -> Vec<QuoteRow> {
    let mut rows = Vec::new();
    for quote in quotes {
        if quote.history.is_empty() {
            rows.push(QuoteRow::from_quote(quote, None));
        } else {
            rows.extend(quote.history.iter().map(|p| QuoteRow::from_quote(quote, Some(p))));
        }
    }
    rows
}

/// Regroups long-format rows by ticker, keeping first-seen ticker order and row order.
pub fn rows_to_quotes(rows: Vec<QuoteRow>) -> Vec<QuoteSnapshot> {
    let mut quotes: Vec<QuoteSnapshot> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let slot = *index.entry(row.ticker.clone()).or_insert_with(|| {
            quotes.push(QuoteSnapshot {
                label: row.label.clone(),
                ticker: row.ticker.clone(),
                price: row.price,
                change_percent: row.change_percent,
                history: Vec::new(),
                market_cap: row.market_cap,
                beta: row.beta,
                pe_ratio: row.pe_ratio,
                volume: row.volume,
            });
            quotes.len() - 1
        });
        if let (Some(timestamp), Some(close)) = (row.timestamp, row.close) {
            quotes[slot].history.push(PricePoint { timestamp, close });
        }
    }
    quotes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub table: &'static str,
    pub path: PathBuf,
    pub rows: usize,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}.csv"))
    }

    pub fn source_path(&self, source_id: SourceId) -> PathBuf {
        self.table_path(table_for_source(source_id))
    }

    /// Overwrite a table. The file is written under a temp name and renamed into
    /// place, so readers see either the old or the new table, never a partial one.
    pub async fn save<T: SnapshotTable>(&self, rows: &[T]) -> Result<StoredSnapshot, StoreError> {
        let path = self.table_path(T::TABLE);
        let bytes = encode_table(&path, rows)?;
        let content_hash = Self::sha256_hex(&bytes);

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", T::TABLE, Uuid::new_v4()));
        if let Err(err) = write_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&path, err));
        }

        debug!(table = T::TABLE, rows = rows.len(), %content_hash, "snapshot written");
        Ok(StoredSnapshot {
            table: T::TABLE,
            path,
            rows: rows.len(),
            content_hash,
        })
    }

    /// Read a table; a missing file is an empty table.
    pub async fn load<T: SnapshotTable>(&self) -> Result<Vec<T>, StoreError> {
        self.load_from_path(self.table_path(T::TABLE)).await
    }

    /// Read a table from an explicit path (the company roster lives outside the data dir).
    pub async fn load_from_path<T: SnapshotTable>(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Vec<T>, StoreError> {
        let path = path.as_ref();
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(path, err)),
        };
        decode_table(path, &bytes)
    }

    pub async fn save_quotes(
        &self,
        quotes: &[QuoteSnapshot],
    ) -> Result<StoredSnapshot, StoreError> {
        let mut stored = self.save(&quotes_to_rows(quotes)).await?;
        stored.rows = quotes.len();
        Ok(stored)
    }

    pub async fn load_quotes(&self) -> Result<Vec<QuoteSnapshot>, StoreError> {
        Ok(rows_to_quotes(self.load::<QuoteRow>().await?))
    }

    pub async fn save_batch(&self, batch: &CanonicalBatch) -> Result<StoredSnapshot, StoreError> {
        match batch {
            CanonicalBatch::News(items) => self.save(items).await,
            CanonicalBatch::Contracts(items) => self.save(items).await,
            CanonicalBatch::Quotes(quotes) => self.save_quotes(quotes).await,
        }
    }

    pub async fn load_batch(&self, source_id: SourceId) -> Result<CanonicalBatch, StoreError> {
        Ok(match source_id {
            SourceId::News => CanonicalBatch::News(self.load().await?),
            SourceId::Contracts => CanonicalBatch::Contracts(self.load().await?),
            SourceId::Quotes => CanonicalBatch::Quotes(self.load_quotes().await?),
        })
    }

    /// Modification time of a source's table, `None` when it was never written.
    pub async fn last_written(
        &self,
        source_id: SourceId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let path = self.source_path(source_id);
        match fs::metadata(&path).await {
            Ok(meta) => {
                let modified = meta.modified().map_err(|e| StoreError::io(&path, e))?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }
}

pub fn table_for_source(source_id: SourceId) -> &'static str {
    match source_id {
        SourceId::News => NewsItem::TABLE,
        SourceId::Contracts => ContractItem::TABLE,
        SourceId::Quotes => QuoteRow::TABLE,
    }
}

fn encode_table<T: SnapshotTable>(path: &Path, rows: &[T]) -> Result<Vec<u8>, StoreError> {
    // Header is written by hand so that an empty table still carries it.
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(T::COLUMNS)
        .map_err(|e| StoreError::csv(path, e))?;
    for row in rows {
        writer.serialize(row).map_err(|e| StoreError::csv(path, e))?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::io(path, e.into_error()))
}

fn decode_table<T: SnapshotTable>(path: &Path, bytes: &[u8]) -> Result<Vec<T>, StoreError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let headers = reader.headers().map_err(|e| StoreError::csv(path, e))?;
    let found: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
    if found.iter().map(String::as_str).ne(T::COLUMNS.iter().copied()) {
        return Err(StoreError::SchemaMismatch {
            path: path.to_path_buf(),
            expected: T::COLUMNS.iter().map(ToString::to_string).collect(),
            found,
        });
    }
    reader
        .deserialize()
        .map(|row| row.map_err(|e| StoreError::csv(path, e)))
        .collect()
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(bytes).await.map_err(|e| StoreError::io(path, e))?;
    file.flush().await.map_err(|e| StoreError::io(path, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(path, e))?;
    Ok(())
}
