use super::stats::describe;
use super::Result;
use crate::data::NormalizedTable;
use chrono::Datelike;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearVolume {
    pub year: i32,
    pub total: f64,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeReport {
    pub years: Vec<YearVolume>,
    /// Tons over every filtered row with a tonnage, dated or not.
    pub overall_total: f64,
    pub undated: usize,
}

/// Tons purchased per announcement year over the method-filtered rows.
///
/// Rows only need a finite `tons_purchased`; a usable price is not required.
pub fn volume_by_year(table: &NormalizedTable) -> Result<VolumeReport> {
    let mut by_year: BTreeMap<i32, Vec<f64>> = BTreeMap::new();
    let mut overall_total = 0.0;
    let mut undated = 0;

    for transaction in table.filtered() {
        let Some(tons) = transaction.tons_purchased.filter(|t| t.is_finite()) else {
            continue;
        };
        overall_total += tons;
        match transaction.announcement_date {
            Some(date) => by_year.entry(date.year()).or_default().push(tons),
            None => undated += 1,
        }
    }

    let years = by_year
        .into_iter()
        .map(|(year, tons)| {
            let summary = describe(&tons)?;
            Ok(YearVolume {
                year,
                total: tons.iter().sum(),
                mean: summary.mean,
                median: summary.median,
                min: summary.min,
                max: summary.max,
                count: summary.count,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(VolumeReport {
        years,
        overall_total,
        undated,
    })
}
