//! Interquartile-range outliers on the target-currency price.

use super::stats::quantile;
use super::{AnalysisError, Result};
use crate::data::{NormalizedTable, NormalizedTransaction};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

/// Label used for rows that were not sold through a marketplace.
pub const NO_MARKETPLACE: &str = "No Marketplace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutlierSide {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceOutlier {
    pub price: f64,
    pub marketplace: String,
    pub announcement_date: Option<NaiveDate>,
    pub side: OutlierSide,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketplaceCount {
    pub marketplace: String,
    pub transactions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutlierReport {
    pub q1: f64,
    pub q3: f64,
    pub lower: f64,
    pub upper: f64,
    pub outliers: Vec<PriceOutlier>,
    /// Lowest price above `upper`, or `upper` itself when nothing lies above.
    pub smallest_upper_outlier: f64,
    /// Transactions priced strictly above `smallest_upper_outlier`.
    pub above_by_marketplace: Vec<MarketplaceCount>,
}

impl OutlierReport {
    pub fn high_count(&self) -> usize {
        self.outliers
            .iter()
            .filter(|o| o.side == OutlierSide::High)
            .count()
    }
}

fn marketplace(row: &NormalizedTransaction) -> String {
    row.transaction
        .marketplace_name
        .clone()
        .unwrap_or_else(|| NO_MARKETPLACE.to_string())
}

/// Flag prices outside `[q1 - k*iqr, q3 + k*iqr]`.
pub fn iqr_outliers(table: &NormalizedTable, multiplier: f64) -> Result<OutlierReport> {
    if !multiplier.is_finite() || multiplier < 0.0 {
        return Err(AnalysisError::InvalidParameter(format!(
            "IQR multiplier must be a non-negative number, got {multiplier}"
        )));
    }

    let prices = table.prices();
    let q1 = quantile(&prices, 0.25)?;
    let q3 = quantile(&prices, 0.75)?;
    let iqr = q3 - q1;
    let lower = q1 - multiplier * iqr;
    let upper = q3 + multiplier * iqr;

    let outliers: Vec<PriceOutlier> = table
        .rows()
        .iter()
        .filter_map(|row| {
            let price = row.price();
            let side = if price < lower {
                OutlierSide::Low
            } else if price > upper {
                OutlierSide::High
            } else {
                return None;
            };
            Some(PriceOutlier {
                price,
                marketplace: marketplace(row),
                announcement_date: row.announcement_date(),
                side,
            })
        })
        .collect();

    let smallest_upper_outlier = outliers
        .iter()
        .filter(|o| o.side == OutlierSide::High)
        .map(|o| o.price)
        .min_by(f64::total_cmp)
        .unwrap_or(upper);

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for row in table.rows() {
        if row.price() > smallest_upper_outlier {
            *counts.entry(marketplace(row)).or_default() += 1;
        }
    }
    let above_by_marketplace = counts
        .into_iter()
        .map(|(marketplace, transactions)| MarketplaceCount {
            marketplace,
            transactions,
        })
        .collect();

    Ok(OutlierReport {
        q1,
        q3,
        lower,
        upper,
        outliers,
        smallest_upper_outlier,
        above_by_marketplace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures;
    use approx::assert_relative_eq;

    // EUR prices are USD / 1.0718; tons are 1 so USD price == price_usd.
    fn table() -> NormalizedTable {
        fixtures::table(
            "\
A,S,M1,,Biochar Carbon Removal (BCR),1,107.18,2023-01-01,,
A,S,M1,,Biochar Carbon Removal (BCR),1,117.898,2023-01-02,,
A,S,M2,,Biochar Carbon Removal (BCR),1,128.616,2023-01-03,,
A,S,M2,,Biochar Carbon Removal (BCR),1,139.334,2023-01-04,,
A,S,,,Biochar Carbon Removal (BCR),1,150.052,2023-01-05,,
A,S,M1,,Biochar Carbon Removal (BCR),1,1071.8,2023-01-06,,
A,S,,,Biochar Carbon Removal (BCR),1,2143.6,2023-01-07,,
",
        )
    }

    #[test]
    fn test_bounds_and_outliers() {
        // EUR: 100, 110, 120, 130, 140, 1000, 2000
        let report = iqr_outliers(&table(), 1.5).unwrap();

        assert_relative_eq!(report.q1, 115.0, epsilon = 1e-9);
        assert_relative_eq!(report.q3, 570.0, epsilon = 1e-9);
        assert_relative_eq!(report.upper, 570.0 + 1.5 * 455.0, epsilon = 1e-9);
        assert_eq!(report.outliers.len(), 1);
        assert_eq!(report.high_count(), 1);
        assert_eq!(report.outliers[0].marketplace, NO_MARKETPLACE);
        assert_relative_eq!(report.smallest_upper_outlier, 2000.0, epsilon = 1e-9);
        assert!(report.above_by_marketplace.is_empty());
    }

    #[test]
    fn test_tighter_multiplier_counts_marketplaces_above_threshold() {
        let report = iqr_outliers(&table(), 0.5).unwrap();

        // upper = 570 + 227.5 = 797.5, so 1000 and 2000 are high outliers.
        assert_eq!(report.high_count(), 2);
        assert_relative_eq!(report.smallest_upper_outlier, 1000.0, epsilon = 1e-9);
        assert_eq!(
            report.above_by_marketplace,
            vec![MarketplaceCount {
                marketplace: NO_MARKETPLACE.to_string(),
                transactions: 1
            }]
        );
    }

    #[test]
    fn test_rejects_negative_multiplier() {
        assert!(matches!(
            iqr_outliers(&table(), -1.0),
            Err(AnalysisError::InvalidParameter(_))
        ));
    }
}
