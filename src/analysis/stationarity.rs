//! Augmented Dickey-Fuller unit-root test.
//!
//! Regression with a constant only:
//! Δy_t = α + β·y_{t-1} + Σ γ_i·Δy_{t-i} + ε_t, testing H0: β = 0.

use super::regression::{design_with_intercept, ols};
use super::{require_points, AnalysisError, Result};
use ndarray::Array1;
use statrs::distribution::{ContinuousCDF, Normal};

// MacKinnon (1994) approximate p-value surface, constant term, one series.
const TAU_MAX: f64 = 2.74;
const TAU_MIN: f64 = -18.83;
const TAU_STAR: f64 = -1.61;
const TAU_SMALL_P: [f64; 3] = [2.1659, 1.4412, 0.038269];
const TAU_LARGE_P: [f64; 4] = [1.7339, 0.93202, -0.12745, -0.010368];

// MacKinnon (2010) response-surface coefficients for the critical values.
const CRIT_1PCT: [f64; 4] = [-3.43035, -6.5393, -16.786, -79.433];
const CRIT_5PCT: [f64; 4] = [-2.86154, -2.8903, -4.234, -40.040];
const CRIT_10PCT: [f64; 4] = [-2.56677, -1.5384, -2.809, 0.0];

const MIN_OBSERVATIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CriticalValues {
    pub cv_1pct: f64,
    pub cv_5pct: f64,
    pub cv_10pct: f64,
}

impl CriticalValues {
    pub fn for_sample(n_obs: usize) -> Self {
        let t = n_obs as f64;
        let surface = |b: [f64; 4]| b[0] + b[1] / t + b[2] / t.powi(2) + b[3] / t.powi(3);
        Self {
            cv_1pct: surface(CRIT_1PCT),
            cv_5pct: surface(CRIT_5PCT),
            cv_10pct: surface(CRIT_10PCT),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdfResult {
    pub statistic: f64,
    pub p_value: f64,
    pub used_lag: usize,
    pub n_obs: usize,
    pub critical_values: CriticalValues,
}

impl AdfResult {
    /// Whether the unit-root null is rejected at `alpha`.
    pub fn is_stationary(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }
}

fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Approximate p-value for an ADF statistic.
pub fn mackinnon_p_value(statistic: f64) -> Result<f64> {
    if statistic > TAU_MAX {
        return Ok(1.0);
    }
    if statistic < TAU_MIN {
        return Ok(0.0);
    }
    let z = if statistic <= TAU_STAR {
        polyval(&TAU_SMALL_P, statistic)
    } else {
        polyval(&TAU_LARGE_P, statistic)
    };
    let normal =
        Normal::new(0.0, 1.0).map_err(|err| AnalysisError::Distribution(err.to_string()))?;
    Ok(normal.cdf(z))
}

/// Rows `start..diff.len()` of the ADF regression with `lag` lagged differences.
fn regress(
    series: &[f64],
    diff: &[f64],
    start: usize,
    lag: usize,
) -> Result<(f64, f64, f64, usize)> {
    let rows = diff.len() - start;
    let mut columns = Vec::with_capacity(lag + 1);
    columns.push(series[start..diff.len()].to_vec());
    for i in 1..=lag {
        columns.push(diff[start - i..diff.len() - i].to_vec());
    }

    let design = design_with_intercept(&columns, rows);
    let target = Array1::from(diff[start..].to_vec());
    let fit = ols(design.view(), target.view())?;
    Ok((fit.coefficients[1], fit.std_errors[1], fit.rss, rows))
}

fn information_criterion(rss: f64, rows: usize, params: usize) -> f64 {
    let n = rows as f64;
    n * (rss / n).ln() + 2.0 * params as f64
}

/// Run the ADF test, picking the lag order by AIC over a common sample.
///
/// `max_lag` defaults to `ceil(12 * (n / 100)^(1/4))`, capped so the
/// regression keeps enough degrees of freedom.
pub fn adf_test(series: &[f64], max_lag: Option<usize>) -> Result<AdfResult> {
    let n = series.len();
    require_points(n, MIN_OBSERVATIONS)?;
    if series.iter().all(|&v| v == series[0]) {
        return Err(AnalysisError::ConstantInput(
            "ADF test is undefined for a constant series".to_string(),
        ));
    }

    let default_lag = (12.0 * (n as f64 / 100.0).powf(0.25)).ceil() as usize;
    let cap = (n / 2).saturating_sub(2);
    let max_lag = max_lag.unwrap_or(default_lag).min(cap);

    let diff: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();

    let mut best = (0, f64::INFINITY);
    for lag in 0..=max_lag {
        let (_, _, rss, rows) = regress(series, &diff, max_lag, lag)?;
        let aic = information_criterion(rss, rows, lag + 2);
        if aic < best.1 {
            best = (lag, aic);
        }
    }
    let used_lag = best.0;

    let (beta, se, _, n_obs) = regress(series, &diff, used_lag, used_lag)?;
    if se == 0.0 || !se.is_finite() {
        return Err(AnalysisError::ConstantInput(
            "ADF regression has a perfect fit".to_string(),
        ));
    }
    let statistic = beta / se;

    Ok(AdfResult {
        statistic,
        p_value: mackinnon_p_value(statistic)?,
        used_lag,
        n_obs,
        critical_values: CriticalValues::for_sample(n_obs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // Deterministic uniform noise in [-0.5, 0.5).
    fn noise(n: usize, seed: u64) -> Vec<f64> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 11) as f64 / (1u64 << 53) as f64 - 0.5
            })
            .collect()
    }

    #[test]
    fn test_p_value_at_critical_values() {
        assert_relative_eq!(mackinnon_p_value(-2.86154).unwrap(), 0.05, epsilon = 0.005);
        assert_relative_eq!(mackinnon_p_value(-3.43035).unwrap(), 0.01, epsilon = 0.003);
        assert_eq!(mackinnon_p_value(3.0).unwrap(), 1.0);
        assert_eq!(mackinnon_p_value(-20.0).unwrap(), 0.0);
    }

    #[test]
    fn test_critical_values_approach_asymptotic() {
        let cv = CriticalValues::for_sample(100_000);
        assert_relative_eq!(cv.cv_5pct, -2.86154, epsilon = 1e-3);
        let small = CriticalValues::for_sample(50);
        assert!(small.cv_1pct < cv.cv_1pct);
    }

    #[test]
    fn test_white_noise_is_stationary() {
        let series = noise(100, 7);
        let result = adf_test(&series, None).unwrap();

        assert!(result.statistic < result.critical_values.cv_5pct);
        assert!(result.is_stationary(0.05));
    }

    #[test]
    fn test_growing_series_is_not_stationary() {
        let series: Vec<f64> = noise(60, 11)
            .into_iter()
            .enumerate()
            .map(|(t, e)| (t * t) as f64 / 10.0 + e)
            .collect();
        let result = adf_test(&series, Some(0)).unwrap();

        assert_eq!(result.used_lag, 0);
        assert_eq!(result.n_obs, 59);
        assert!(!result.is_stationary(0.05));
    }

    #[test]
    fn test_short_and_constant_series() {
        assert_eq!(
            adf_test(&[1.0, 2.0, 3.0], None),
            Err(AnalysisError::InsufficientData { needed: 8, got: 3 })
        );
        assert!(matches!(
            adf_test(&[5.0; 20], None),
            Err(AnalysisError::ConstantInput(_))
        ));
    }
}
