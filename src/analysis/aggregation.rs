use super::stats::{self, quantile};
use super::Result;
use crate::data::{NormalizedTable, NormalizedTransaction};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How prices sharing one announcement date collapse into a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPolicy {
    #[default]
    Mean,
    Median,
}

impl AggregationPolicy {
    pub fn apply(&self, values: &[f64]) -> Result<f64> {
        match self {
            AggregationPolicy::Mean => stats::mean(values),
            AggregationPolicy::Median => stats::median(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub date: NaiveDate,
    /// Indices into `NormalizedTable::rows`.
    pub rows: Vec<usize>,
}

/// All transactions announced on one date, merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatedAggregate {
    pub date: NaiveDate,
    pub price: f64,
    pub transactions: usize,
    pub tons_purchased: f64,
    pub tons_delivered: f64,
    pub price_usd: f64,
    pub days_since_start: Option<i64>,
    pub purchasers: String,
    pub suppliers: String,
    pub marketplaces: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyAverage {
    pub year: i32,
    pub month: u32,
    pub mean_price: f64,
    pub dates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageStage {
    pub stage: &'static str,
    pub description: &'static str,
    pub transactions: usize,
    pub share_of_previous: f64,
    pub share_of_filtered: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKey {
    Purchaser,
    Supplier,
    Marketplace,
}

impl ActorKey {
    pub fn name_of<'a>(&self, row: &'a NormalizedTransaction) -> Option<&'a str> {
        let transaction = &row.transaction;
        match self {
            ActorKey::Purchaser => transaction.purchaser_name.as_deref(),
            ActorKey::Supplier => transaction.supplier_name.as_deref(),
            ActorKey::Marketplace => transaction.marketplace_name.as_deref(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActorKey::Purchaser => "buyer",
            ActorKey::Supplier => "supplier",
            ActorKey::Marketplace => "marketplace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActorSummary {
    pub name: String,
    pub mean_price: f64,
    pub transactions: usize,
    pub std_dev: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketplaceShare {
    pub marketplace: String,
    pub total_transactions: usize,
    pub above_threshold: usize,
    pub share_above_threshold: f64,
}

fn dated_rows(table: &NormalizedTable) -> BTreeMap<NaiveDate, Vec<usize>> {
    let mut by_date: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
    for (index, row) in table.rows().iter().enumerate() {
        if let Some(date) = row.announcement_date() {
            by_date.entry(date).or_default().push(index);
        }
    }
    by_date
}

/// Cleaned transactions whose announcement date is shared with another one.
pub fn find_duplicate_dates(table: &NormalizedTable) -> Vec<DuplicateGroup> {
    dated_rows(table)
        .into_iter()
        .filter(|(_, rows)| rows.len() > 1)
        .map(|(date, rows)| DuplicateGroup { date, rows })
        .collect()
}

pub fn duplicate_row_count(groups: &[DuplicateGroup]) -> usize {
    groups.iter().map(|group| group.rows.len()).sum()
}

fn sum_field(
    group: &[&NormalizedTransaction],
    field: impl Fn(&NormalizedTransaction) -> Option<f64>,
) -> f64 {
    group.iter().filter_map(|row| field(row)).sum()
}

fn join_unique<'a>(names: impl Iterator<Item = Option<&'a str>>) -> String {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    for name in names.flatten() {
        if seen.insert(name) {
            ordered.push(name);
        }
    }
    ordered.join(", ")
}

/// Collapse cleaned transactions to one point per announcement date.
///
/// Rows without a date are left out. The price of each point follows
/// `policy`; tonnage and dollar amounts are summed.
pub fn aggregate_by_date(
    table: &NormalizedTable,
    policy: AggregationPolicy,
) -> Result<Vec<DatedAggregate>> {
    let rows = table.rows();
    let mut points = Vec::new();

    for (date, indices) in dated_rows(table) {
        let group: Vec<&NormalizedTransaction> = indices.iter().map(|&i| &rows[i]).collect();
        let prices: Vec<f64> = group.iter().map(|row| row.price()).collect();

        points.push(DatedAggregate {
            date,
            price: policy.apply(&prices)?,
            transactions: group.len(),
            tons_purchased: sum_field(&group, |row| row.transaction.tons_purchased),
            tons_delivered: sum_field(&group, |row| row.transaction.tons_delivered),
            price_usd: sum_field(&group, |row| row.transaction.price_usd),
            days_since_start: group[0].days_since_start,
            purchasers: join_unique(
                group.iter().map(|row| row.transaction.purchaser_name.as_deref()),
            ),
            suppliers: join_unique(
                group.iter().map(|row| row.transaction.supplier_name.as_deref()),
            ),
            marketplaces: join_unique(
                group.iter().map(|row| row.transaction.marketplace_name.as_deref()),
            ),
        });
    }

    Ok(points)
}

/// How many transactions survive each stage, from the raw export to one
/// point per date.
pub fn coverage_report(table: &NormalizedTable, merged: usize) -> Vec<CoverageStage> {
    let total = table.raw_row_count();
    let filtered = table.filtered().len();
    let cleaned = table.len();
    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

    vec![
        CoverageStage {
            stage: "Data",
            description: "Total transactions in dataset",
            transactions: total,
            share_of_previous: ratio(total, total),
            share_of_filtered: ratio(total, total),
        },
        CoverageStage {
            stage: "Data Subset",
            description: "Filtered for the selected method",
            transactions: filtered,
            share_of_previous: ratio(filtered, total),
            share_of_filtered: ratio(filtered, filtered),
        },
        CoverageStage {
            stage: "Data Subset Cleaned",
            description: "Transactions with valid price per ton",
            transactions: cleaned,
            share_of_previous: ratio(cleaned, filtered),
            share_of_filtered: ratio(cleaned, filtered),
        },
        CoverageStage {
            stage: "Merged Data",
            description: "One point per announcement date",
            transactions: merged,
            share_of_previous: ratio(merged, cleaned),
            share_of_filtered: ratio(merged, filtered),
        },
    ]
}

/// Average price per calendar month, kept separate for each year.
pub fn monthly_seasonality(points: &[DatedAggregate]) -> Result<Vec<MonthlyAverage>> {
    let mut by_month: BTreeMap<(i32, u32), Vec<f64>> = BTreeMap::new();
    for point in points {
        by_month
            .entry((point.date.year(), point.date.month()))
            .or_default()
            .push(point.price);
    }

    by_month
        .into_iter()
        .map(|((year, month), prices)| {
            Ok(MonthlyAverage {
                year,
                month,
                mean_price: stats::mean(&prices)?,
                dates: prices.len(),
            })
        })
        .collect()
}

fn prices_by_actor(table: &NormalizedTable, key: ActorKey) -> HashMap<&str, Vec<f64>> {
    let mut groups: HashMap<&str, Vec<f64>> = HashMap::new();
    for row in table.rows() {
        if let Some(name) = key.name_of(row) {
            groups.entry(name).or_default().push(row.price());
        }
    }
    groups
}

/// Mean price, deal count and price spread per actor, highest mean first.
pub fn summarize_by_actor(table: &NormalizedTable, key: ActorKey) -> Result<Vec<ActorSummary>> {
    let mut summaries = prices_by_actor(table, key)
        .into_iter()
        .map(|(name, prices)| {
            Ok(ActorSummary {
                name: name.to_string(),
                mean_price: stats::mean(&prices)?,
                transactions: prices.len(),
                std_dev: stats::std_dev(&prices),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    summaries.sort_by(|a, b| {
        b.mean_price
            .total_cmp(&a.mean_price)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(summaries)
}

/// Actors whose price standard deviation exceeds the `q` quantile of all
/// defined standard deviations.
pub fn high_variability(summaries: &[ActorSummary], q: f64) -> Result<Vec<&ActorSummary>> {
    let spreads: Vec<f64> = summaries.iter().filter_map(|s| s.std_dev).collect();
    if spreads.is_empty() {
        return Ok(Vec::new());
    }
    let cutoff = quantile(&spreads, q)?;
    Ok(summaries
        .iter()
        .filter(|s| s.std_dev.is_some_and(|std| std > cutoff))
        .collect())
}

/// The `n` actors with the most cleaned transactions.
pub fn top_actors_by_count(
    table: &NormalizedTable,
    key: ActorKey,
    n: usize,
) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = prices_by_actor(table, key)
        .into_iter()
        .map(|(name, prices)| (name.to_string(), prices.len()))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.truncate(n);
    counts
}

/// Per marketplace, how many transactions were priced above `threshold`.
pub fn threshold_share_by_marketplace(
    table: &NormalizedTable,
    threshold: f64,
) -> Vec<MarketplaceShare> {
    let mut groups: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for row in table.rows() {
        if let Some(name) = ActorKey::Marketplace.name_of(row) {
            let entry = groups.entry(name).or_default();
            entry.0 += 1;
            if row.price() > threshold {
                entry.1 += 1;
            }
        }
    }

    groups
        .into_iter()
        .map(|(name, (total, above))| MarketplaceShare {
            marketplace: name.to_string(),
            total_transactions: total,
            above_threshold: above,
            share_above_threshold: above as f64 / total as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures;
    use approx::assert_relative_eq;

    // EUR prices: 100, 200, 300, 50, 150 (USD amounts are rate * EUR).
    const ROWS: &str = "\
Acme,Alpha,Puro,,Biochar Carbon Removal (BCR),1,107.18,2023-01-10,,1
Acme,Beta,Puro,,Biochar Carbon Removal (BCR),1,214.36,2023-01-10,,
Zeta,Alpha,,,Biochar Carbon Removal (BCR),2,643.08,2023-02-15,,2
Zeta,Gamma,Isometric,,Biochar Carbon Removal (BCR),2,107.18,2024-01-03,,
Acme,Gamma,Isometric,,Biochar Carbon Removal (BCR),1,160.77,,,
";

    #[test]
    fn test_duplicate_dates_report_every_row() {
        let table = fixtures::table(ROWS);
        let groups = find_duplicate_dates(&table);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].date, NaiveDate::from_ymd_opt(2023, 1, 10).unwrap());
        assert_eq!(groups[0].rows, vec![0, 1]);
        assert_eq!(duplicate_row_count(&groups), 2);
    }

    #[test]
    fn test_aggregate_by_date_policies() {
        let table = fixtures::table(ROWS);
        let mean = aggregate_by_date(&table, AggregationPolicy::Mean).unwrap();

        assert_eq!(mean.len(), 3);
        assert_relative_eq!(mean[0].price, 150.0, epsilon = 1e-9);
        assert_eq!(mean[0].transactions, 2);
        assert_relative_eq!(mean[0].tons_purchased, 2.0);
        assert_relative_eq!(mean[0].tons_delivered, 1.0);
        assert_eq!(mean[0].purchasers, "Acme");
        assert_eq!(mean[0].suppliers, "Alpha, Beta");
        assert_eq!(mean[0].days_since_start, Some(0));
        assert_eq!(mean[1].marketplaces, "");

        let median = aggregate_by_date(&table, AggregationPolicy::Median).unwrap();
        assert_relative_eq!(median[0].price, 150.0, epsilon = 1e-9);
    }

    #[test]
    fn test_policies_differ_on_odd_groups() {
        assert_relative_eq!(AggregationPolicy::Mean.apply(&[1.0, 2.0, 9.0]).unwrap(), 4.0);
        assert_relative_eq!(AggregationPolicy::Median.apply(&[1.0, 2.0, 9.0]).unwrap(), 2.0);
    }

    #[test]
    fn test_monthly_seasonality() {
        let table = fixtures::table(ROWS);
        let points = aggregate_by_date(&table, AggregationPolicy::Mean).unwrap();
        let monthly = monthly_seasonality(&points).unwrap();

        let keys: Vec<_> = monthly.iter().map(|m| (m.year, m.month)).collect();
        assert_eq!(keys, vec![(2023, 1), (2023, 2), (2024, 1)]);
        assert_relative_eq!(monthly[1].mean_price, 300.0, epsilon = 1e-9);
    }

    #[test]
    fn test_summarize_by_actor() {
        let table = fixtures::table(ROWS);
        let buyers = summarize_by_actor(&table, ActorKey::Purchaser).unwrap();

        assert_eq!(buyers.len(), 2);
        assert_eq!(buyers[0].name, "Zeta");
        assert_relative_eq!(buyers[0].mean_price, 175.0, epsilon = 1e-9);
        assert_eq!(buyers[1].name, "Acme");
        assert_eq!(buyers[1].transactions, 3);
        assert_relative_eq!(buyers[1].std_dev.unwrap(), 50.0, epsilon = 1e-9);

        let marketplaces = summarize_by_actor(&table, ActorKey::Marketplace).unwrap();
        assert_eq!(marketplaces.len(), 2);
    }

    #[test]
    fn test_high_variability() {
        let summaries = vec![
            ActorSummary {
                name: "a".into(),
                mean_price: 1.0,
                transactions: 2,
                std_dev: Some(1.0),
            },
            ActorSummary {
                name: "b".into(),
                mean_price: 1.0,
                transactions: 2,
                std_dev: Some(2.0),
            },
            ActorSummary {
                name: "c".into(),
                mean_price: 1.0,
                transactions: 2,
                std_dev: Some(10.0),
            },
            ActorSummary {
                name: "d".into(),
                mean_price: 1.0,
                transactions: 1,
                std_dev: None,
            },
        ];
        let high = high_variability(&summaries, 0.75).unwrap();

        assert_eq!(high.len(), 1);
        assert_eq!(high[0].name, "c");
    }

    #[test]
    fn test_top_actors_and_threshold_share() {
        let table = fixtures::table(ROWS);
        let top = top_actors_by_count(&table, ActorKey::Supplier, 2);
        assert_eq!(top, vec![("Alpha".to_string(), 2), ("Gamma".to_string(), 2)]);

        let shares = threshold_share_by_marketplace(&table, 120.0);
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].marketplace, "Isometric");
        assert_eq!(shares[0].above_threshold, 1);
        assert_relative_eq!(shares[0].share_above_threshold, 0.5);
        assert_eq!(shares[1].marketplace, "Puro");
        assert_eq!(shares[1].above_threshold, 1);
    }

    #[test]
    fn test_coverage_report() {
        let table = fixtures::table(ROWS);
        let stages = coverage_report(&table, 3);

        assert_eq!(stages[0].transactions, 5);
        assert_eq!(stages[2].transactions, 5);
        assert_eq!(stages[3].transactions, 3);
        assert_relative_eq!(stages[3].share_of_previous, 0.6);
    }
}
