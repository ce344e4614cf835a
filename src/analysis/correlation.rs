use super::aggregation::ActorSummary;
use super::{require_points, AnalysisError, Result};
use crate::data::NormalizedTable;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpearmanResult {
    pub coefficient: f64,
    pub p_value: f64,
    pub n: usize,
}

impl SpearmanResult {
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }
}

/// Ranks starting at 1, ties sharing the average of their positions.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Positions start..end (0-based) share rank mean(start+1..=end).
        let rank = (start + end + 1) as f64 / 2.0;
        for &index in &order[start..end] {
            ranks[index] = rank;
        }
        start = end;
    }
    ranks
}

fn pearson(x: &[f64], y: &[f64]) -> Result<f64> {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }

    if sxx == 0.0 || syy == 0.0 {
        return Err(AnalysisError::ConstantInput(
            "correlation is undefined when one variable does not vary".to_string(),
        ));
    }
    Ok((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

/// Two-sided p-value for a correlation coefficient via the t distribution.
pub(crate) fn correlation_p_value(r: f64, n: usize) -> Result<f64> {
    let df = (n - 2) as f64;
    let denominator = 1.0 - r * r;
    if denominator <= 0.0 {
        return Ok(0.0);
    }
    let t = r * (df / denominator).sqrt();
    let dist =
        StudentsT::new(0.0, 1.0, df).map_err(|err| AnalysisError::Distribution(err.to_string()))?;
    Ok((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
}

/// Spearman rank correlation with a two-sided significance test.
pub fn spearman(x: &[f64], y: &[f64]) -> Result<SpearmanResult> {
    if x.len() != y.len() {
        return Err(AnalysisError::InvalidParameter(format!(
            "paired samples differ in length: {} vs {}",
            x.len(),
            y.len()
        )));
    }
    require_points(x.len(), 3)?;

    let coefficient = pearson(&average_ranks(x), &average_ranks(y))?;
    let p_value = correlation_p_value(coefficient, x.len())?;

    Ok(SpearmanResult {
        coefficient,
        p_value,
        n: x.len(),
    })
}

/// Correlation between elapsed days and USD price per ton.
pub fn price_time_correlation(table: &NormalizedTable) -> Result<SpearmanResult> {
    let (days, prices): (Vec<f64>, Vec<f64>) = table
        .rows()
        .iter()
        .filter_map(|row| {
            row.days_since_start
                .map(|days| (days as f64, row.price_per_ton_usd))
        })
        .unzip();
    spearman(&days, &prices)
}

/// Correlation between an actor's number of deals and their mean price.
pub fn volume_price_correlation(summaries: &[ActorSummary]) -> Result<SpearmanResult> {
    let counts: Vec<f64> = summaries.iter().map(|s| s.transactions as f64).collect();
    let means: Vec<f64> = summaries.iter().map(|s| s.mean_price).collect();
    spearman(&counts, &means)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures;
    use approx::assert_relative_eq;

    #[test]
    fn test_average_ranks_with_ties() {
        assert_eq!(average_ranks(&[10.0, 20.0, 10.0, 30.0]), vec![1.5, 3.0, 1.5, 4.0]);
    }

    #[test]
    fn test_spearman_known_values() {
        let result = spearman(&[1.0, 2.0, 3.0, 4.0, 5.0], &[5.0, 6.0, 7.0, 8.0, 7.0]).unwrap();

        assert_relative_eq!(result.coefficient, 0.8207826816681233, epsilon = 1e-10);
        assert_relative_eq!(result.p_value, 0.0885870053135438, epsilon = 1e-6);
        assert!(!result.is_significant(0.05));
    }

    #[test]
    fn test_spearman_perfect_monotone() {
        let result = spearman(&[1.0, 2.0, 3.0, 4.0], &[1.0, 8.0, 27.0, 64.0]).unwrap();
        assert_relative_eq!(result.coefficient, 1.0);
        assert_eq!(result.p_value, 0.0);
        assert!(result.is_significant(0.05));
    }

    #[test]
    fn test_spearman_rejects_bad_input() {
        assert_eq!(
            spearman(&[1.0], &[2.0]),
            Err(AnalysisError::InsufficientData { needed: 3, got: 1 })
        );
        assert!(matches!(
            spearman(&[1.0, 2.0, 3.0], &[1.0, 2.0]),
            Err(AnalysisError::InvalidParameter(_))
        ));
        assert!(matches!(
            spearman(&[1.0, 2.0, 3.0], &[4.0, 4.0, 4.0]),
            Err(AnalysisError::ConstantInput(_))
        ));
    }

    #[test]
    fn test_price_time_correlation_skips_undated_rows() {
        let table = fixtures::table(
            "\
A,S,,,Biochar Carbon Removal (BCR),1,100,2023-01-01,,
A,S,,,Biochar Carbon Removal (BCR),1,150,2023-02-01,,
A,S,,,Biochar Carbon Removal (BCR),1,120,,,
A,S,,,Biochar Carbon Removal (BCR),1,210,2023-03-01,,
A,S,,,Biochar Carbon Removal (BCR),1,260,2023-04-01,,
",
        );
        let result = price_time_correlation(&table).unwrap();

        assert_eq!(result.n, 4);
        assert_relative_eq!(result.coefficient, 1.0);
    }

    #[test]
    fn test_volume_price_correlation_needs_three_actors() {
        let summaries = vec![
            ActorSummary {
                name: "a".into(),
                mean_price: 1.0,
                transactions: 2,
                std_dev: None,
            },
            ActorSummary {
                name: "b".into(),
                mean_price: 2.0,
                transactions: 1,
                std_dev: None,
            },
        ];
        assert!(matches!(
            volume_price_correlation(&summaries),
            Err(AnalysisError::InsufficientData { .. })
        ));
    }
}
