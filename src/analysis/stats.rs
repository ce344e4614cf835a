use super::{require_points, AnalysisError, Result};
use crate::data::NormalizedTable;
use chrono::Datelike;
use ndarray::Array1;
use ndarray_stats::QuantileExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Descriptive summary of a sample (count, mean, spread, quartiles).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; undefined for a single observation.
    pub std: Option<f64>,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceBandShare {
    pub total_transactions: usize,
    pub in_band: usize,
    pub low: f64,
    pub high: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearlyPriceStats {
    /// `None` marks the all-years row.
    pub year: Option<i32>,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub mode: f64,
    pub priced_transactions: usize,
    pub total_transactions: usize,
}

impl YearlyPriceStats {
    /// Share of transactions that carried a usable price.
    pub fn price_coverage(&self) -> f64 {
        if self.total_transactions == 0 {
            return 0.0;
        }
        self.priced_transactions as f64 / self.total_transactions as f64
    }
}

/// Quantile with linear interpolation between closest ranks.
pub fn quantile(values: &[f64], q: f64) -> Result<f64> {
    require_points(values.len(), 1)?;
    if !(0.0..=1.0).contains(&q) {
        return Err(AnalysisError::InvalidParameter(format!(
            "quantile must lie in [0, 1], got {q}"
        )));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(sorted_quantile(&sorted, q))
}

fn sorted_quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

pub fn median(values: &[f64]) -> Result<f64> {
    quantile(values, 0.5)
}

pub fn mean(values: &[f64]) -> Result<f64> {
    require_points(values.len(), 1)?;
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (ddof = 1).
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    Some(Array1::from(values.to_vec()).std(1.0))
}

pub fn describe(values: &[f64]) -> Result<Summary> {
    require_points(values.len(), 1)?;

    let array = Array1::from(values.to_vec());
    let min = *array
        .min()
        .map_err(|err| AnalysisError::InvalidParameter(err.to_string()))?;
    let max = *array
        .max()
        .map_err(|err| AnalysisError::InvalidParameter(err.to_string()))?;

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    Ok(Summary {
        count: values.len(),
        mean: array.mean().unwrap_or(f64::NAN),
        std: std_dev(values),
        min,
        q25: sorted_quantile(&sorted, 0.25),
        median: sorted_quantile(&sorted, 0.5),
        q75: sorted_quantile(&sorted, 0.75),
        max,
    })
}

/// Most frequent values, ascending. With `precision`, values are rounded first.
pub fn modes(values: &[f64], precision: Option<u32>) -> Vec<f64> {
    let factor = precision.map(|p| 10f64.powi(p as i32));
    let mut counts: HashMap<u64, (f64, usize)> = HashMap::new();
    for &value in values {
        let value = match factor {
            Some(factor) => (value * factor).round() / factor,
            None => value,
        };
        counts.entry(value.to_bits()).or_insert((value, 0)).1 += 1;
    }

    let Some(best) = counts.values().map(|(_, count)| *count).max() else {
        return Vec::new();
    };
    let mut modes: Vec<f64> = counts
        .into_values()
        .filter(|(_, count)| *count == best)
        .map(|(value, _)| value)
        .collect();
    modes.sort_by(f64::total_cmp);
    modes
}

/// Count of cleaned transactions whose target price falls inside `[low, high]`.
pub fn price_band_share(table: &NormalizedTable, low: f64, high: f64) -> PriceBandShare {
    let total_transactions = table.len();
    let in_band = table
        .rows()
        .iter()
        .filter(|row| (low..=high).contains(&row.price()))
        .count();
    let percentage = if total_transactions == 0 {
        0.0
    } else {
        in_band as f64 / total_transactions as f64 * 100.0
    };

    PriceBandShare {
        total_transactions,
        in_band,
        low,
        high,
        percentage,
    }
}

fn year_stats(
    year: Option<i32>,
    prices: &[f64],
    total_transactions: usize,
) -> Result<YearlyPriceStats> {
    let summary = describe(prices)?;
    Ok(YearlyPriceStats {
        year,
        min: summary.min,
        max: summary.max,
        mean: summary.mean,
        median: summary.median,
        mode: modes(prices, None).first().copied().unwrap_or(f64::NAN),
        priced_transactions: prices.len(),
        total_transactions,
    })
}

/// Price statistics per announcement year, followed by an all-years row.
///
/// Totals count every method-filtered transaction of that year, priced or
/// not, so the gap between the two counts shows how many deals kept their
/// price private.
pub fn yearly_price_stats(table: &NormalizedTable) -> Result<Vec<YearlyPriceStats>> {
    require_points(table.len(), 1)?;

    let mut prices_by_year: BTreeMap<i32, Vec<f64>> = BTreeMap::new();
    for row in table.rows() {
        if let Some(date) = row.announcement_date() {
            prices_by_year.entry(date.year()).or_default().push(row.price());
        }
    }

    let mut totals_by_year: HashMap<i32, usize> = HashMap::new();
    for transaction in table.filtered() {
        if let Some(date) = transaction.announcement_date {
            *totals_by_year.entry(date.year()).or_default() += 1;
        }
    }

    let mut stats = Vec::with_capacity(prices_by_year.len() + 1);
    for (year, prices) in &prices_by_year {
        let total = totals_by_year.get(year).copied().unwrap_or(prices.len());
        stats.push(year_stats(Some(*year), prices, total)?);
    }
    stats.push(year_stats(None, &table.prices(), table.filtered().len())?);

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::loader::TransactionLoader;
    use crate::data::NormalizeOptions;
    use approx::assert_relative_eq;

    #[test]
    fn test_describe() {
        let summary = describe(&[1.0, 2.0, 3.0, 4.0]).unwrap();

        assert_eq!(summary.count, 4);
        assert_relative_eq!(summary.mean, 2.5, epsilon = 1e-12);
        assert_relative_eq!(summary.std.unwrap(), 1.2909944487358056, epsilon = 1e-12);
        assert_relative_eq!(summary.q25, 1.75, epsilon = 1e-12);
        assert_relative_eq!(summary.median, 2.5, epsilon = 1e-12);
        assert_relative_eq!(summary.q75, 3.25, epsilon = 1e-12);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 4.0);
    }

    #[test]
    fn test_describe_single_value_and_empty() {
        let summary = describe(&[7.0]).unwrap();
        assert_eq!(summary.std, None);
        assert_eq!(summary.median, 7.0);

        assert_eq!(
            describe(&[]),
            Err(AnalysisError::InsufficientData { needed: 1, got: 0 })
        );
    }

    #[test]
    fn test_modes_returns_all_ties_sorted() {
        assert_eq!(modes(&[3.0, 1.0, 3.0, 1.0, 2.0], None), vec![1.0, 3.0]);
        assert_eq!(modes(&[1.004, 1.001, 2.0], Some(2)), vec![1.0]);
        assert!(modes(&[], None).is_empty());
    }

    #[test]
    fn test_quantile_bounds() {
        assert!(quantile(&[1.0], 1.5).is_err());
        assert_eq!(quantile(&[5.0, 1.0, 3.0], 0.0).unwrap(), 1.0);
        assert_eq!(quantile(&[5.0, 1.0, 3.0], 1.0).unwrap(), 5.0);
    }

    fn sample_table() -> NormalizedTable {
        let csv = "\
purchaser_name,supplier_name,marketplace_name,status,method,tons_purchased,price_usd,announcement_date,delivery_date,tons_delivered
A,S,,,Biochar Carbon Removal (BCR),1,107.18,2022-03-01,,
B,S,,,Biochar Carbon Removal (BCR),1,214.36,2022-07-01,,
C,S,,,Biochar Carbon Removal (BCR),1,,2022-08-01,,
D,S,,,Biochar Carbon Removal (BCR),2,321.54,2023-01-01,,
";
        TransactionLoader::load_reader(csv.as_bytes(), &NormalizeOptions::default()).unwrap()
    }

    #[test]
    fn test_yearly_price_stats() {
        let stats = yearly_price_stats(&sample_table()).unwrap();

        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].year, Some(2022));
        assert_relative_eq!(stats[0].min, 100.0, epsilon = 1e-9);
        assert_relative_eq!(stats[0].max, 200.0, epsilon = 1e-9);
        assert_eq!(stats[0].priced_transactions, 2);
        assert_eq!(stats[0].total_transactions, 3);
        assert_relative_eq!(stats[0].price_coverage(), 2.0 / 3.0, epsilon = 1e-12);

        assert_eq!(stats[1].year, Some(2023));
        assert_relative_eq!(stats[1].mean, 150.0, epsilon = 1e-9);

        let overall = &stats[2];
        assert_eq!(overall.year, None);
        assert_eq!(overall.priced_transactions, 3);
        assert_eq!(overall.total_transactions, 4);
    }

    #[test]
    fn test_price_band_share() {
        let share = price_band_share(&sample_table(), 99.0, 160.0);

        assert_eq!(share.total_transactions, 3);
        assert_eq!(share.in_band, 2);
        assert_relative_eq!(share.percentage, 200.0 / 3.0, epsilon = 1e-9);
    }
}
