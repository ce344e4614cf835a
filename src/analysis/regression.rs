use super::{require_points, AnalysisError, Result};
use crate::data::NormalizedTable;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

// Smallest admissible ratio of singular values of X'X.
const CONDITION_TOLERANCE: f64 = 1e-13;

/// Least-squares fit of `y = X b`.
#[derive(Debug, Clone)]
pub struct OlsFit {
    pub coefficients: Array1<f64>,
    pub std_errors: Array1<f64>,
    pub residuals: Array1<f64>,
    pub rss: f64,
    pub df_resid: usize,
}

impl OlsFit {
    pub fn t_statistic(&self, index: usize) -> f64 {
        self.coefficients[index] / self.std_errors[index]
    }

    pub fn sigma2(&self) -> f64 {
        self.rss / self.df_resid as f64
    }
}

/// Inverse of the normal-equation matrix, rejecting rank-deficient designs.
fn normal_inverse(xtx: DMatrix<f64>) -> Result<DMatrix<f64>> {
    let singular = xtx.singular_values();
    if singular.min() <= CONDITION_TOLERANCE * singular.max() {
        return Err(AnalysisError::SingularMatrix);
    }
    xtx.try_inverse().ok_or(AnalysisError::SingularMatrix)
}

/// Ordinary least squares on an explicit design matrix.
pub fn ols(design: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<OlsFit> {
    let (n, k) = design.dim();
    if y.len() != n {
        return Err(AnalysisError::InvalidParameter(format!(
            "design has {} rows but target has {}",
            n,
            y.len()
        )));
    }
    require_points(n, k + 1)?;

    let x = DMatrix::from_row_iterator(n, k, design.iter().copied());
    let y_vec = DVector::from_iterator(n, y.iter().copied());

    // OLS: b = (X'X)^(-1) X'y
    let xtx_inv = normal_inverse(x.transpose() * &x)?;
    let beta = &xtx_inv * (x.transpose() * &y_vec);
    let resid = &y_vec - &x * &beta;

    let rss = resid.dot(&resid);
    let df_resid = n - k;
    let sigma2 = rss / df_resid as f64;

    Ok(OlsFit {
        coefficients: beta.iter().copied().collect(),
        std_errors: xtx_inv
            .diagonal()
            .iter()
            .map(|v| (sigma2 * v).max(0.0).sqrt())
            .collect(),
        residuals: resid.iter().copied().collect(),
        rss,
        df_resid,
    })
}

/// Build `[1, x]` design matrix for simple regression.
fn with_intercept(x: &[f64]) -> Array2<f64> {
    let mut design = Array2::ones((x.len(), 2));
    design.column_mut(1).assign(&ArrayView1::from(x));
    design
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub slope: f64,
    pub r_squared: Option<f64>,
    pub slope_std_error: f64,
    pub slope_p_value: f64,
    pub n: usize,
}

impl LinearModel {
    pub fn fit(x: &[f64], y: &[f64]) -> Result<Self> {
        if x.len() != y.len() {
            return Err(AnalysisError::InvalidParameter(format!(
                "paired samples differ in length: {} vs {}",
                x.len(),
                y.len()
            )));
        }
        require_points(x.len(), 3)?;
        if x.iter().all(|&v| v == x[0]) {
            return Err(AnalysisError::ConstantInput(
                "regressor does not vary".to_string(),
            ));
        }

        let y_view = ArrayView1::from(y);
        let fit = ols(with_intercept(x).view(), y_view)?;
        let slope_std_error = fit.std_errors[1];
        let slope_p_value = if slope_std_error == 0.0 {
            0.0
        } else {
            let dist = StudentsT::new(0.0, 1.0, fit.df_resid as f64)
                .map_err(|err| AnalysisError::Distribution(err.to_string()))?;
            (2.0 * (1.0 - dist.cdf(fit.t_statistic(1).abs()))).clamp(0.0, 1.0)
        };

        let y_mean = y_view.mean().unwrap_or(0.0);
        let tss = y_view.mapv(|v| (v - y_mean).powi(2)).sum();

        Ok(Self {
            intercept: fit.coefficients[0],
            slope: fit.coefficients[1],
            r_squared: (tss > 0.0).then(|| 1.0 - fit.rss / tss),
            slope_std_error,
            slope_p_value,
            n: x.len(),
        })
    }

    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionEvaluation {
    pub model: LinearModel,
    pub train_len: usize,
    pub test_len: usize,
    pub mse: f64,
    /// Out-of-sample R²; undefined when the held-out targets are constant.
    pub test_r_squared: Option<f64>,
}

pub fn mean_squared_error(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().max(1) as f64;
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum::<f64>()
        / n
}

pub fn r_squared(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    let n = actual.len() as f64;
    let mean = actual.iter().sum::<f64>() / n;
    let tss: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
    if tss == 0.0 {
        return None;
    }
    let rss: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    Some(1.0 - rss / tss)
}

/// Shuffle indices with a seeded generator and hold out `ceil(fraction * n)`.
pub fn train_test_split(
    n: usize,
    test_fraction: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>)> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(AnalysisError::InvalidParameter(format!(
            "test fraction must lie in (0, 1), got {test_fraction}"
        )));
    }
    let test_len = (test_fraction * n as f64).ceil() as usize;
    if test_len == 0 || test_len >= n {
        return Err(AnalysisError::InsufficientData {
            needed: test_len + 1,
            got: n,
        });
    }

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    let train = indices.split_off(test_len);
    Ok((train, indices))
}

/// Fit on a training split and score on the held-out rows.
pub fn train_test_evaluation(
    x: &[f64],
    y: &[f64],
    test_fraction: f64,
    seed: u64,
) -> Result<RegressionEvaluation> {
    if x.len() != y.len() {
        return Err(AnalysisError::InvalidParameter(format!(
            "paired samples differ in length: {} vs {}",
            x.len(),
            y.len()
        )));
    }
    let (train, test) = train_test_split(x.len(), test_fraction, seed)?;
    let pick =
        |values: &[f64], idx: &[usize]| -> Vec<f64> { idx.iter().map(|&i| values[i]).collect() };

    let model = LinearModel::fit(&pick(x, &train), &pick(y, &train))?;
    let actual = pick(y, &test);
    let predicted: Vec<f64> = pick(x, &test).into_iter().map(|v| model.predict(v)).collect();

    Ok(RegressionEvaluation {
        model,
        train_len: train.len(),
        test_len: test.len(),
        mse: mean_squared_error(&actual, &predicted),
        test_r_squared: r_squared(&actual, &predicted),
    })
}

/// Linear trend of the USD price per ton over days since the first announcement.
pub fn price_trend(
    table: &NormalizedTable,
    test_fraction: f64,
    seed: u64,
) -> Result<RegressionEvaluation> {
    let (days, prices): (Vec<f64>, Vec<f64>) = table
        .rows()
        .iter()
        .filter_map(|row| {
            row.days_since_start
                .map(|days| (days as f64, row.price_per_ton_usd))
        })
        .unzip();
    train_test_evaluation(&days, &prices, test_fraction, seed)
}

/// Column-stack the given series into a design matrix with a leading intercept.
pub(crate) fn design_with_intercept(columns: &[Vec<f64>], rows: usize) -> Array2<f64> {
    let mut design = Array2::ones((rows, columns.len() + 1));
    for (j, column) in columns.iter().enumerate() {
        design
            .column_mut(j + 1)
            .assign(&ArrayView1::from(&column[..rows]));
    }
    design
}
