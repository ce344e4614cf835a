pub mod cells;
pub mod loader;
pub mod table;

use chrono::NaiveDate;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use table::{
    CurrencyConversion, ExclusionCounts, NormalizeOptions, NormalizedTable, TransactionRow,
};

/// Method label kept by the normalizer unless configured otherwise.
pub const DEFAULT_METHOD: &str = "Biochar Carbon Removal (BCR)";

/// USD -> EUR divisor used across the price reports.
pub const DEFAULT_EUR_RATE: f64 = 1.0718;

/// Largest decimal precision `price_precision` accepts; `10^p` stays exact up to here.
pub const MAX_PRICE_PRECISION: u32 = 15;

/// Columns every source export must carry.
pub const REQUIRED_COLUMNS: [&str; 10] = [
    "purchaser_name",
    "supplier_name",
    "marketplace_name",
    "status",
    "method",
    "tons_purchased",
    "price_usd",
    "announcement_date",
    "delivery_date",
    "tons_delivered",
];

/// One CSV row as text, before any cell is interpreted.
#[derive(Debug, Default, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub purchaser_name: Option<String>,
    #[serde(default)]
    pub supplier_name: Option<String>,
    #[serde(default)]
    pub marketplace_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub tons_purchased: Option<String>,
    #[serde(default)]
    pub price_usd: Option<String>,
    #[serde(default)]
    pub announcement_date: Option<String>,
    #[serde(default)]
    pub delivery_date: Option<String>,
    #[serde(default)]
    pub tons_delivered: Option<String>,
}

/// A purchase transaction that passed the method filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub purchaser_name: Option<String>,
    pub supplier_name: Option<String>,
    pub marketplace_name: Option<String>,
    pub status: Option<String>,
    pub method: Option<String>,
    pub tons_purchased: Option<f64>,
    pub price_usd: Option<f64>,
    pub announcement_date: Option<NaiveDate>,
    pub delivery_date: Option<NaiveDate>,
    pub tons_delivered: Option<f64>,
}

/// A cleaned transaction with its derived price fields.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTransaction {
    pub transaction: Transaction,
    pub price_per_ton_usd: f64,
    pub price_per_ton_target: Option<f64>,
    pub days_since_start: Option<i64>,
}

impl NormalizedTransaction {
    /// Price in the configured target currency, falling back to USD.
    pub fn price(&self) -> f64 {
        self.price_per_ton_target.unwrap_or(self.price_per_ton_usd)
    }

    pub fn announcement_date(&self) -> Option<NaiveDate> {
        self.transaction.announcement_date
    }
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("cannot open source {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("source contains no transaction rows")]
    SourceEmpty,
    #[error("malformed source: {0}")]
    SourceMalformed(String),
    #[error("Missing required column: {0}")]
    MissingColumn(String),
    #[error("invalid normalization option: {0}")]
    InvalidOption(String),
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
pub(crate) mod fixtures {
    use super::loader::TransactionLoader;
    use super::{NormalizeOptions, NormalizedTable};

    pub const HEADER: &str = "purchaser_name,supplier_name,marketplace_name,status,method,tons_purchased,price_usd,announcement_date,delivery_date,tons_delivered";

    /// Build a table from CSV rows (without header) using the default options.
    pub fn table(body: &str) -> NormalizedTable {
        let csv = format!("{HEADER}\n{body}");
        TransactionLoader::load_reader(csv.as_bytes(), &NormalizeOptions::default())
            .expect("fixture should load")
    }
}
