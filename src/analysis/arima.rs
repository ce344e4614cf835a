use super::regression::{design_with_intercept, ols};
use super::{require_points, AnalysisError, Result};
use chrono::{Days, NaiveDate};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

impl Default for ArimaOrder {
    fn default() -> Self {
        Self { p: 1, d: 0, q: 1 }
    }
}

/// ARIMA model estimated by the Hannan-Rissanen two-stage regression.
#[derive(Debug, Clone)]
pub struct ArimaModel {
    pub order: ArimaOrder,
    pub constant: f64,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub sigma2: f64,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    /// Series after differencing `d` times.
    differenced: Vec<f64>,
    /// In-sample one-step residuals on the differenced series.
    residuals: Vec<f64>,
    /// Last observation of each differencing level below `d`.
    level_tails: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub step: usize,
    pub date: Option<NaiveDate>,
    pub value: f64,
}

fn difference(series: &[f64]) -> Vec<f64> {
    series.windows(2).map(|w| w[1] - w[0]).collect()
}

// Order of the long autoregression used to approximate the innovations.
fn long_ar_order(n: usize, order: ArimaOrder) -> usize {
    let by_length = 2 * (n as f64).ln().ceil() as usize;
    by_length.max(order.p + order.q + 1)
}

/// Column `t - lag` of `values` for `t` in `start..end`.
fn lagged(values: &[f64], start: usize, end: usize, lag: usize) -> Vec<f64> {
    values[start - lag..end - lag].to_vec()
}

impl ArimaModel {
    pub fn fit(series: &[f64], order: ArimaOrder) -> Result<Self> {
        let ArimaOrder { p, d, q } = order;

        let mut levels = vec![series.to_vec()];
        for _ in 0..d {
            let next = difference(levels.last().map(Vec::as_slice).unwrap_or(&[]));
            levels.push(next);
        }
        let level_tails: Vec<f64> = levels[..d]
            .iter()
            .map(|level| level.last().copied().unwrap_or(0.0))
            .collect();
        let w = levels.pop().unwrap_or_default();
        let n = w.len();

        let m = if q > 0 { long_ar_order(n, order) } else { 0 };
        let start = p.max(m + q);
        let params = 1 + p + q;
        require_points(series.len(), d + start + params + 3)?;
        if w.iter().all(|&v| v == w[0]) {
            return Err(AnalysisError::ConstantInput(
                "differenced series is constant".to_string(),
            ));
        }

        // Stage 1: innovations from a long autoregression.
        let mut innovations = vec![0.0; n];
        if q > 0 {
            let columns: Vec<Vec<f64>> = (1..=m).map(|lag| lagged(&w, m, n, lag)).collect();
            let design = design_with_intercept(&columns, n - m);
            let target = Array1::from(w[m..].to_vec());
            let fit = ols(design.view(), target.view())?;
            innovations[m..].copy_from_slice(fit.residuals.as_slice().unwrap_or(&[]));
        }

        // Stage 2: regress on lagged values and lagged innovations.
        let mut columns: Vec<Vec<f64>> = (1..=p).map(|lag| lagged(&w, start, n, lag)).collect();
        columns.extend((1..=q).map(|lag| lagged(&innovations, start, n, lag)));
        let design = design_with_intercept(&columns, n - start);
        let target = Array1::from(w[start..].to_vec());
        let fit = ols(design.view(), target.view())?;

        let constant = fit.coefficients[0];
        let ar: Vec<f64> = fit.coefficients.iter().skip(1).take(p).copied().collect();
        let ma: Vec<f64> = fit.coefficients.iter().skip(1 + p).take(q).copied().collect();

        let residuals = recursive_residuals(&w, constant, &ar, &ma);
        let used = &residuals[p.max(q)..];
        let n_used = used.len() as f64;
        let sigma2 = used.iter().map(|e| e * e).sum::<f64>() / n_used;
        if sigma2 <= 0.0 || !sigma2.is_finite() {
            return Err(AnalysisError::ConstantInput(
                "model reproduces the series exactly".to_string(),
            ));
        }

        let log_likelihood = -0.5 * n_used * ((2.0 * PI * sigma2).ln() + 1.0);
        let k = (params + 1) as f64;

        Ok(Self {
            order,
            constant,
            ar,
            ma,
            sigma2,
            log_likelihood,
            aic: -2.0 * log_likelihood + 2.0 * k,
            bic: -2.0 * log_likelihood + k * n_used.ln(),
            differenced: w,
            residuals,
            level_tails,
        })
    }

    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    /// Point forecasts for the next `steps` periods, on the scale of the input series.
    pub fn forecast(&self, steps: usize) -> Vec<f64> {
        let mut values = self.differenced.clone();
        let mut errors = self.residuals.clone();
        let mut forecasts = Vec::with_capacity(steps);

        for _ in 0..steps {
            let t = values.len();
            let mut next = self.constant;
            for (i, phi) in self.ar.iter().enumerate() {
                next += phi * values[t - 1 - i];
            }
            for (j, theta) in self.ma.iter().enumerate() {
                next += theta * errors[t - 1 - j];
            }
            values.push(next);
            errors.push(0.0);
            forecasts.push(next);
        }

        // Undo differencing, innermost level first.
        for &tail in self.level_tails.iter().rev() {
            let mut level = tail;
            for value in forecasts.iter_mut() {
                level += *value;
                *value = level;
            }
        }
        forecasts
    }

    /// Forecasts labelled with daily dates following `last_date`.
    pub fn forecast_points(
        &self,
        steps: usize,
        last_date: Option<NaiveDate>,
    ) -> Vec<ForecastPoint> {
        let dates = last_date.map(|last| forecast_dates(last, steps));
        self.forecast(steps)
            .into_iter()
            .enumerate()
            .map(|(i, value)| ForecastPoint {
                step: i + 1,
                date: dates.as_ref().and_then(|d| d.get(i).copied()),
                value,
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        let ArimaOrder { p, d, q } = self.order;
        let mut s = format!("ARIMA({p},{d},{q})\n");
        s.push_str(&format!("  constant: {:.4}\n", self.constant));
        for (i, phi) in self.ar.iter().enumerate() {
            s.push_str(&format!("  ar.L{}: {:.4}\n", i + 1, phi));
        }
        for (i, theta) in self.ma.iter().enumerate() {
            s.push_str(&format!("  ma.L{}: {:.4}\n", i + 1, theta));
        }
        s.push_str(&format!("  sigma2: {:.4}\n", self.sigma2));
        s.push_str(&format!("  log likelihood: {:.3}\n", self.log_likelihood));
        s.push_str(&format!("  AIC: {:.3}  BIC: {:.3}", self.aic, self.bic));
        s
    }
}

fn recursive_residuals(w: &[f64], constant: f64, ar: &[f64], ma: &[f64]) -> Vec<f64> {
    let start = ar.len().max(ma.len());
    let mut residuals = vec![0.0; w.len()];
    for t in start..w.len() {
        let mut fitted = constant;
        for (i, phi) in ar.iter().enumerate() {
            fitted += phi * w[t - 1 - i];
        }
        for (j, theta) in ma.iter().enumerate() {
            fitted += theta * residuals[t - 1 - j];
        }
        residuals[t] = w[t] - fitted;
    }
    residuals
}

/// Consecutive calendar days after `last`.
pub fn forecast_dates(last: NaiveDate, steps: usize) -> Vec<NaiveDate> {
    (1..=steps as u64)
        .filter_map(|i| last.checked_add_days(Days::new(i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

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

    fn simulate(n: usize, constant: f64, phi: f64, theta: f64, seed: u64) -> Vec<f64> {
        let shocks = noise(n + 50, seed);
        let mut y = vec![constant / (1.0 - phi)];
        for t in 1..shocks.len() {
            let value = constant + phi * y[t - 1] + shocks[t] + theta * shocks[t - 1];
            y.push(value);
        }
        y.split_off(50)
    }

    #[test]
    fn test_ar1_recovers_coefficient() {
        let series = simulate(400, 2.0, 0.6, 0.0, 3);
        let model = ArimaModel::fit(&series, ArimaOrder { p: 1, d: 0, q: 0 }).unwrap();

        assert_relative_eq!(model.ar[0], 0.6, epsilon = 0.1);
        assert_relative_eq!(model.constant / (1.0 - model.ar[0]), 5.0, epsilon = 0.2);
        assert!(model.ma.is_empty());
    }

    #[test]
    fn test_arma11_recovers_coefficients() {
        let series = simulate(600, 1.0, 0.5, 0.4, 5);
        let model = ArimaModel::fit(&series, ArimaOrder::default()).unwrap();

        assert_relative_eq!(model.ar[0], 0.5, epsilon = 0.15);
        assert_relative_eq!(model.ma[0], 0.4, epsilon = 0.15);
        assert!(model.aic.is_finite());
        assert!(model.bic > model.aic);
    }

    #[test]
    fn test_differenced_forecast_follows_drift() {
        let series: Vec<f64> = noise(80, 9)
            .into_iter()
            .enumerate()
            .map(|(t, e)| 5.0 + 2.0 * t as f64 + 0.01 * e)
            .collect();
        let model = ArimaModel::fit(&series, ArimaOrder { p: 0, d: 1, q: 0 }).unwrap();
        let forecast = model.forecast(3);
        let last = *series.last().unwrap();

        assert_eq!(forecast.len(), 3);
        assert_relative_eq!(forecast[0], last + 2.0, epsilon = 0.05);
        assert_relative_eq!(forecast[2], last + 6.0, epsilon = 0.1);
    }

    #[test]
    fn test_forecast_points_carry_daily_dates() {
        let series = simulate(100, 1.0, 0.3, 0.0, 1);
        let model = ArimaModel::fit(&series, ArimaOrder { p: 1, d: 0, q: 0 }).unwrap();
        let last = NaiveDate::from_ymd_opt(2024, 12, 30).unwrap();
        let points = model.forecast_points(3, Some(last));

        assert_eq!(points[0].date, NaiveDate::from_ymd_opt(2024, 12, 31));
        assert_eq!(points[2].date, NaiveDate::from_ymd_opt(2025, 1, 2));
        assert_eq!(points[2].step, 3);
    }

    #[test]
    fn test_short_series_is_rejected() {
        let err = ArimaModel::fit(&[1.0, 2.0, 1.5, 2.5], ArimaOrder::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData { .. }));
    }
}
