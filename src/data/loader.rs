use super::cells::{self, CellFailures};
use super::{
    DataError, ExclusionCounts, NormalizeOptions, NormalizedTable, NormalizedTransaction,
    RawRecord, Result, Transaction, MAX_PRICE_PRECISION, REQUIRED_COLUMNS,
};
use csv::{ReaderBuilder, StringRecord};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

pub struct TransactionLoader;

enum PriceOutcome {
    Priced { usd: f64, target: Option<f64> },
    Undefined,
    NonFinite,
}

impl TransactionLoader {
    fn verify_required_columns(headers: &StringRecord) -> Result<()> {
        let headers_set: HashSet<&str> = headers.iter().collect();

        for column in REQUIRED_COLUMNS {
            if !headers_set.contains(column) {
                return Err(DataError::MissingColumn(column.to_string()));
            }
        }
        Ok(())
    }

    fn verify_options(options: &NormalizeOptions) -> Result<()> {
        if let Some(currency) = &options.currency {
            if !(currency.rate.is_finite() && currency.rate > 0.0) {
                return Err(DataError::InvalidOption(format!(
                    "currency rate for {} must be positive and finite, got {}",
                    currency.code, currency.rate
                )));
            }
        }
        if let Some(precision) = options.price_precision {
            if precision > MAX_PRICE_PRECISION {
                return Err(DataError::InvalidOption(format!(
                    "price precision must be at most {MAX_PRICE_PRECISION}, got {precision}"
                )));
            }
        }
        Ok(())
    }

    /// Open a CSV export and normalize it.
    pub fn load_and_normalize<P: AsRef<Path>>(
        path: P,
        options: &NormalizeOptions,
    ) -> Result<NormalizedTable> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DataError::SourceUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loading transactions");
        Self::load_reader(file, options)
    }

    /// Normalize CSV data from any reader.
    pub fn load_reader<R: Read>(reader: R, options: &NormalizeOptions) -> Result<NormalizedTable> {
        Self::verify_options(options)?;
        let records = Self::read_records(reader)?;
        Ok(Self::normalize(records, options))
    }

    fn read_records<R: Read>(reader: R) -> Result<Vec<RawRecord>> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: StringRecord = rdr
            .headers()
            .map_err(|err| DataError::SourceMalformed(format!("unreadable header: {err}")))?
            .iter()
            .map(|name| name.trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect();
        if headers.iter().all(str::is_empty) {
            return Err(DataError::SourceEmpty);
        }
        Self::verify_required_columns(&headers)?;
        rdr.set_headers(headers);

        let mut records = Vec::new();
        for result in rdr.deserialize::<RawRecord>() {
            let record = result.map_err(|err| {
                let line = err
                    .position()
                    .map(|pos| pos.line().to_string())
                    .unwrap_or_else(|| "?".to_string());
                DataError::SourceMalformed(format!("line {line}: {err}"))
            })?;
            records.push(record);
        }

        if records.is_empty() {
            return Err(DataError::SourceEmpty);
        }
        Ok(records)
    }

    fn parse_transaction(record: RawRecord, failures: &mut CellFailures) -> Transaction {
        Transaction {
            tons_purchased: cells::number(record.tons_purchased.as_deref(), failures),
            price_usd: cells::number(record.price_usd.as_deref(), failures),
            tons_delivered: cells::number(record.tons_delivered.as_deref(), failures),
            announcement_date: cells::date(record.announcement_date.as_deref(), failures),
            delivery_date: cells::date(record.delivery_date.as_deref(), failures),
            purchaser_name: cells::text(record.purchaser_name),
            supplier_name: cells::text(record.supplier_name),
            marketplace_name: cells::text(record.marketplace_name),
            status: cells::text(record.status),
            method: cells::text(record.method),
        }
    }

    fn price_per_ton(transaction: &Transaction, options: &NormalizeOptions) -> PriceOutcome {
        let (price, tons) = match (transaction.price_usd, transaction.tons_purchased) {
            (Some(price), Some(tons)) if tons > 0.0 => (price, tons),
            _ => return PriceOutcome::Undefined,
        };

        let mut usd = price / tons;
        if let Some(precision) = options.price_precision {
            usd = round_to(usd, precision);
        }
        if !usd.is_finite() {
            return PriceOutcome::NonFinite;
        }

        let target = options.currency.as_ref().map(|currency| usd / currency.rate);
        if target.is_some_and(|value| !value.is_finite()) {
            return PriceOutcome::NonFinite;
        }
        PriceOutcome::Priced { usd, target }
    }

    /// Filter, price and clean parsed records.
    pub fn normalize(records: Vec<RawRecord>, options: &NormalizeOptions) -> NormalizedTable {
        let raw_row_count = records.len();
        let mut exclusions = ExclusionCounts::default();
        let mut failures = CellFailures::default();

        let mut filtered = Vec::new();
        for record in records {
            if record.method.as_deref() != Some(options.method_filter.as_str()) {
                exclusions.method_filtered_out += 1;
                continue;
            }
            filtered.push(Self::parse_transaction(record, &mut failures));
        }

        let mut rows = Vec::with_capacity(filtered.len());
        for (index, transaction) in filtered.iter().enumerate() {
            match Self::price_per_ton(transaction, options) {
                PriceOutcome::Priced { usd, target } => rows.push(NormalizedTransaction {
                    transaction: transaction.clone(),
                    price_per_ton_usd: usd,
                    price_per_ton_target: target,
                    days_since_start: None,
                }),
                PriceOutcome::Undefined => {
                    debug!(row = index, "price per ton undefined");
                    exclusions.price_undefined += 1;
                }
                PriceOutcome::NonFinite => {
                    debug!(row = index, "price per ton not finite");
                    exclusions.non_finite += 1;
                }
            }
        }

        if options.days_since_start {
            assign_days_since_start(&mut rows);
        }

        info!(
            raw = raw_row_count,
            method_filtered_out = exclusions.method_filtered_out,
            price_undefined = exclusions.price_undefined,
            non_finite = exclusions.non_finite,
            cleaned = rows.len(),
            cell_failures = failures.total(),
            "normalized transactions"
        );

        NormalizedTable::new(raw_row_count, filtered, rows, exclusions, failures, options)
    }
}

fn assign_days_since_start(rows: &mut [NormalizedTransaction]) {
    let Some(start) = rows.iter().filter_map(|row| row.announcement_date()).min() else {
        return;
    };
    for row in rows.iter_mut() {
        row.days_since_start = row
            .announcement_date()
            .map(|date| (date - start).num_days());
    }
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}
