use super::cells::CellFailures;
use super::{NormalizedTransaction, Transaction, DEFAULT_EUR_RATE, DEFAULT_METHOD};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyConversion {
    pub code: String,
    /// Divisor applied to USD prices.
    pub rate: f64,
}

impl CurrencyConversion {
    pub fn eur() -> Self {
        Self {
            code: "EUR".to_string(),
            rate: DEFAULT_EUR_RATE,
        }
    }
}

/// Flat view of one cleaned row: source columns plus derived fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRow<'a> {
    pub purchaser_name: Option<&'a str>,
    pub supplier_name: Option<&'a str>,
    pub marketplace_name: Option<&'a str>,
    pub status: Option<&'a str>,
    pub method: Option<&'a str>,
    pub tons_purchased: Option<f64>,
    pub price_usd: Option<f64>,
    pub announcement_date: Option<NaiveDate>,
    pub delivery_date: Option<NaiveDate>,
    pub tons_delivered: Option<f64>,
    pub price_per_ton_usd: f64,
    pub price_per_ton_target: Option<f64>,
    pub days_since_start: Option<i64>,
}

impl<'a> From<&'a NormalizedTransaction> for TransactionRow<'a> {
    fn from(row: &'a NormalizedTransaction) -> Self {
        let t = &row.transaction;
        Self {
            purchaser_name: t.purchaser_name.as_deref(),
            supplier_name: t.supplier_name.as_deref(),
            marketplace_name: t.marketplace_name.as_deref(),
            status: t.status.as_deref(),
            method: t.method.as_deref(),
            tons_purchased: t.tons_purchased,
            price_usd: t.price_usd,
            announcement_date: t.announcement_date,
            delivery_date: t.delivery_date,
            tons_delivered: t.tons_delivered,
            price_per_ton_usd: row.price_per_ton_usd,
            price_per_ton_target: row.price_per_ton_target,
            days_since_start: row.days_since_start,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeOptions {
    pub method_filter: String,
    pub currency: Option<CurrencyConversion>,
    /// Decimal places kept on the USD price per ton, if any.
    pub price_precision: Option<u32>,
    pub days_since_start: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            method_filter: DEFAULT_METHOD.to_string(),
            currency: Some(CurrencyConversion::eur()),
            price_precision: None,
            days_since_start: true,
        }
    }
}

/// Rows dropped at each normalization stage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExclusionCounts {
    pub method_filtered_out: usize,
    pub price_undefined: usize,
    pub non_finite: usize,
}

impl ExclusionCounts {
    pub fn total(&self) -> usize {
        self.method_filtered_out + self.price_undefined + self.non_finite
    }
}

/// Output of the loader: the method-filtered rows and the cleaned subset.
///
/// The table is read-only once built; every accessor hands out borrows.
#[derive(Debug, Clone)]
pub struct NormalizedTable {
    raw_row_count: usize,
    filtered: Vec<Transaction>,
    rows: Vec<NormalizedTransaction>,
    exclusions: ExclusionCounts,
    cell_failures: CellFailures,
    currency: Option<CurrencyConversion>,
    method: String,
}

impl NormalizedTable {
    pub(crate) fn new(
        raw_row_count: usize,
        filtered: Vec<Transaction>,
        rows: Vec<NormalizedTransaction>,
        exclusions: ExclusionCounts,
        cell_failures: CellFailures,
        options: &NormalizeOptions,
    ) -> Self {
        Self {
            raw_row_count,
            filtered,
            rows,
            exclusions,
            cell_failures,
            currency: options.currency.clone(),
            method: options.method_filter.clone(),
        }
    }

    /// Number of data rows read from the source, before any filtering.
    pub fn raw_row_count(&self) -> usize {
        self.raw_row_count
    }

    /// Rows matching the method filter, including those without a usable price.
    pub fn filtered(&self) -> &[Transaction] {
        &self.filtered
    }

    /// Cleaned rows: every entry has a finite price per ton.
    pub fn rows(&self) -> &[NormalizedTransaction] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn exclusions(&self) -> ExclusionCounts {
        self.exclusions
    }

    pub fn cell_failures(&self) -> CellFailures {
        self.cell_failures
    }

    pub fn currency(&self) -> Option<&CurrencyConversion> {
        self.currency.as_ref()
    }

    /// Label for the price column used by the reports, e.g. "EUR".
    pub fn price_label(&self) -> &str {
        self.currency
            .as_ref()
            .map(|currency| currency.code.as_str())
            .unwrap_or("USD")
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Target-currency prices of the cleaned rows, in table order.
    pub fn prices(&self) -> Vec<f64> {
        self.rows.iter().map(NormalizedTransaction::price).collect()
    }

    /// The cleaned rows as flat records, ready for export.
    pub fn subset_rows(&self) -> Vec<TransactionRow<'_>> {
        self.rows.iter().map(TransactionRow::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures;
    use approx::assert_relative_eq;

    #[test]
    fn test_subset_rows_carry_derived_fields() {
        let table = fixtures::table(
            "\
A,S1,Puro,Contracted,Biochar Carbon Removal (BCR),10,1000,2023-01-05,2023-06-01,10
B,S2,,,Biochar Carbon Removal (BCR),4,1000,2023-01-07,,
C,S3,,,Biochar Carbon Removal (BCR),0,1000,2023-01-08,,
",
        );
        let rows = table.subset_rows();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].purchaser_name, Some("A"));
        assert_eq!(rows[0].marketplace_name, Some("Puro"));
        assert_eq!(rows[0].delivery_date, NaiveDate::from_ymd_opt(2023, 6, 1));
        assert_relative_eq!(rows[0].price_per_ton_usd, 100.0);
        assert_relative_eq!(rows[0].price_per_ton_target.unwrap(), 100.0 / DEFAULT_EUR_RATE);
        assert_eq!(rows[0].days_since_start, Some(0));
        assert_eq!(rows[1].marketplace_name, None);
        assert_relative_eq!(rows[1].price_per_ton_usd, 250.0);
        assert_eq!(rows[1].days_since_start, Some(2));
    }

    #[test]
    fn test_subset_rows_serialize_as_flat_csv() {
        let table = fixtures::table("A,S1,,,Biochar Carbon Removal (BCR),10,1000,2023-01-05,,\n");
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in table.subset_rows() {
            writer.serialize(row).unwrap();
        }
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let mut lines = text.lines();

        assert_eq!(
            lines.next(),
            Some(
                "purchaser_name,supplier_name,marketplace_name,status,method,tons_purchased,\
                 price_usd,announcement_date,delivery_date,tons_delivered,price_per_ton_usd,\
                 price_per_ton_target,days_since_start"
            )
        );
        let record = lines.next().unwrap();
        assert!(record.starts_with("A,S1,,,Biochar Carbon Removal (BCR),10.0,1000.0,"));
        assert!(record.contains(",2023-01-05,,,100.0,"));
        assert!(record.ends_with(",0"));
    }
}
