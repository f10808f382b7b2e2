// Trend extrapolation over one aggregated series.
//
// The time axis is local to each series: `t` is the number of days between
// a period's first day and the first day of the series' earliest period.
// Forecasts of series with different starting months therefore live on
// different axes.

use crate::error::{PipelineError, PipelineResult};
use crate::types::{AggregatedSeries, GroupKey, Measure, PeriodKey};
use crate::util::days_between;
use nalgebra::{DMatrix, DVector};

const RELATIVE_RANK_TOLERANCE: f64 = 1e-10;

/// A trend model fitted on `(t, value)` points and evaluated at `at`.
pub trait TrendModel {
    fn name(&self) -> &'static str;

    fn fit_predict(&self, points: &[(f64, f64)], at: f64) -> PipelineResult<f64>;
}

/// Least-squares polynomial `value ~ t + t² + ... + t^degree` with intercept.
///
/// Features and target are centered before solving, and the solve uses the
/// SVD pseudo-inverse, so underdetermined fits (two points, degree 2) return
/// the minimum-norm solution instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolynomialTrend {
    degree: usize,
}

impl PolynomialTrend {
    pub fn new(degree: usize) -> PipelineResult<Self> {
        if degree == 0 {
            return Err(PipelineError::Config("polynomial degree must be at least 1".to_string()));
        }
        Ok(Self { degree })
    }

    pub fn quadratic() -> Self {
        Self { degree: 2 }
    }

    pub fn linear() -> Self {
        Self { degree: 1 }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }
}

impl Default for PolynomialTrend {
    fn default() -> Self {
        Self::quadratic()
    }
}

impl TrendModel for PolynomialTrend {
    fn name(&self) -> &'static str {
        match self.degree {
            1 => "linear",
            2 => "quadratic",
            _ => "polynomial",
        }
    }

    fn fit_predict(&self, points: &[(f64, f64)], at: f64) -> PipelineResult<f64> {
        let n = points.len();
        if n < 2 {
            return Err(PipelineError::InsufficientData { found: n });
        }
        let d = self.degree;
        let power = |t: f64, j: usize| t.powi(j as i32 + 1);

        let means: Vec<f64> = (0..d)
            .map(|j| points.iter().map(|p| power(p.0, j)).sum::<f64>() / n as f64)
            .collect();
        let y_mean = points.iter().map(|p| p.1).sum::<f64>() / n as f64;

        let design = DMatrix::from_fn(n, d, |i, j| power(points[i].0, j) - means[j]);
        let target = DVector::from_iterator(n, points.iter().map(|p| p.1 - y_mean));

        let svd = design.svd(true, true);
        // Singular values below this are rank-deficient directions.
        let tolerance = svd.singular_values.max() * RELATIVE_RANK_TOLERANCE;
        let coef = svd
            .solve(&target, tolerance)
            .map_err(|e| PipelineError::Numerical(e.to_string()))?;

        let intercept = y_mean - (0..d).map(|j| coef[j] * means[j]).sum::<f64>();
        let prediction = intercept + (0..d).map(|j| coef[j] * power(at, j)).sum::<f64>();
        if !prediction.is_finite() {
            return Err(PipelineError::Numerical(format!(
                "{} fit produced a non-finite prediction",
                self.name()
            )));
        }
        Ok(prediction)
    }
}

/// Projection of one series `horizon_days` past its last period.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastResult {
    pub key: GroupKey,
    pub measure: Measure,
    pub model: &'static str,
    pub last_period: PeriodKey,
    pub horizon_days: i64,
    /// Prediction clamped at zero.
    pub value: f64,
    /// Prediction as fitted, possibly negative.
    pub raw_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForecastOutcome {
    Value(ForecastResult),
    Unavailable { key: GroupKey, reason: String },
}

impl ForecastOutcome {
    pub fn key(&self) -> &GroupKey {
        match self {
            ForecastOutcome::Value(r) => &r.key,
            ForecastOutcome::Unavailable { key, .. } => key,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            ForecastOutcome::Value(r) => Some(r.value),
            ForecastOutcome::Unavailable { .. } => None,
        }
    }
}

/// Fits the default quadratic trend and predicts `horizon_days` ahead.
pub fn fit_and_predict(series: &AggregatedSeries, horizon_days: i64) -> PipelineResult<ForecastResult> {
    fit_and_predict_with(&PolynomialTrend::quadratic(), series, horizon_days)
}

pub fn fit_and_predict_with<M: TrendModel + ?Sized>(
    model: &M,
    series: &AggregatedSeries,
    horizon_days: i64,
) -> PipelineResult<ForecastResult> {
    if horizon_days <= 0 {
        return Err(PipelineError::Config(format!(
            "forecast horizon must be positive, got {} days",
            horizon_days
        )));
    }
    let observed: Vec<(PeriodKey, f64)> = series.points().filter(|(_, v)| v.is_finite()).collect();
    let (Some(first), Some(last)) = (observed.first(), observed.last()) else {
        return Err(PipelineError::InsufficientData { found: 0 });
    };
    if observed.len() < 2 {
        return Err(PipelineError::InsufficientData { found: observed.len() });
    }

    let origin = first.0.first_day();
    let points: Vec<(f64, f64)> = observed
        .iter()
        .map(|(p, v)| (days_between(origin, p.first_day()), *v))
        .collect();
    let last_t = days_between(origin, last.0.first_day());
    let at = last_t + horizon_days as f64;

    let raw_value = model.fit_predict(&points, at)?;
    log::debug!(
        "{} forecast for {}: {:.3} at t={} from {} points",
        model.name(),
        series.key,
        raw_value,
        at,
        points.len()
    );
    Ok(ForecastResult {
        key: series.key.clone(),
        measure: series.measure,
        model: model.name(),
        last_period: last.0,
        horizon_days,
        value: raw_value.max(0.0),
        raw_value,
    })
}

/// Like [`fit_and_predict_with`], but every failure becomes
/// [`ForecastOutcome::Unavailable`] rather than an error.
pub fn forecast<M: TrendModel + ?Sized>(
    model: &M,
    series: &AggregatedSeries,
    horizon_days: i64,
) -> ForecastOutcome {
    match fit_and_predict_with(model, series, horizon_days) {
        Ok(result) => ForecastOutcome::Value(result),
        Err(e) => {
            log::info!("no forecast for {}: {}", series.key, e);
            ForecastOutcome::Unavailable { key: series.key.clone(), reason: e.to_string() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(points: &[(&str, f64)]) -> AggregatedSeries {
        let mut s = AggregatedSeries::new(GroupKey::new(vec!["A".to_string()]), Measure::Count);
        for (p, v) in points {
            s.set(p.parse().unwrap(), *v);
        }
        s
    }

    #[test]
    fn quadratic_recovers_exact_parabola() {
        let model = PolynomialTrend::quadratic();
        let points: Vec<(f64, f64)> =
            (0..6).map(|i| i as f64 * 30.0).map(|t| (t, 3.0 + 0.5 * t + 0.01 * t * t)).collect();
        let at = 180.0;
        let expected = 3.0 + 0.5 * at + 0.01 * at * at;
        let got = model.fit_predict(&points, at).unwrap();
        assert!((got - expected).abs() < 1e-6, "got {got}, expected {expected}");
    }

    #[test]
    fn linear_model_is_a_drop_in_alternative() {
        let model = PolynomialTrend::linear();
        let points = [(0.0, 1.0), (10.0, 3.0), (20.0, 5.0)];
        let got = model.fit_predict(&points, 30.0).unwrap();
        assert!((got - 7.0).abs() < 1e-9);
        assert_eq!(model.name(), "linear");
        assert!(PolynomialTrend::new(0).is_err());
    }

    #[test]
    fn two_points_yield_a_prediction() {
        let s = series(&[("2022-01", 2.0), ("2022-02", 1.0)]);
        let result = fit_and_predict(&s, 30).unwrap();
        assert!(result.value >= 0.0);
        assert!(result.value.is_finite());
        assert_eq!(result.last_period.to_string(), "2022-02");
        assert_eq!(result.model, "quadratic");
    }

    #[test]
    fn fewer_than_two_points_is_insufficient() {
        let one = series(&[("2022-01", 5.0)]);
        assert!(matches!(
            fit_and_predict(&one, 30),
            Err(PipelineError::InsufficientData { found: 1 })
        ));
        let none = series(&[]);
        assert!(matches!(
            fit_and_predict(&none, 30),
            Err(PipelineError::InsufficientData { found: 0 })
        ));
        let nan = series(&[("2022-01", 5.0), ("2022-02", f64::NAN)]);
        assert!(matches!(
            fit_and_predict(&nan, 30),
            Err(PipelineError::InsufficientData { found: 1 })
        ));
    }

    #[test]
    fn steep_decline_is_clamped_at_zero() {
        let s = series(&[("2022-01", 100.0), ("2022-02", 50.0), ("2022-03", 5.0)]);
        let result = fit_and_predict_with(&PolynomialTrend::linear(), &s, 30).unwrap();
        assert!(result.raw_value < 0.0);
        assert_eq!(result.value, 0.0);
    }

    #[test]
    fn unavailable_is_distinct_from_zero() {
        let one = series(&[("2022-01", 5.0)]);
        let outcome = forecast(&PolynomialTrend::quadratic(), &one, 30);
        assert!(matches!(outcome, ForecastOutcome::Unavailable { .. }));
        assert_eq!(outcome.value(), None);
        assert_eq!(outcome.key().to_string(), "A");

        let flat = series(&[("2022-01", 0.0), ("2022-02", 0.0), ("2022-03", 0.0)]);
        let outcome = forecast(&PolynomialTrend::quadratic(), &flat, 30);
        assert_eq!(outcome.value(), Some(0.0));
    }

    #[test]
    fn time_axis_is_relative_to_the_series_start() {
        let early = series(&[("2022-01", 1.0), ("2022-02", 2.0), ("2022-03", 3.0)]);
        let late = series(&[("2023-01", 1.0), ("2023-02", 2.0), ("2023-03", 3.0)]);
        let a = fit_and_predict(&early, 30).unwrap();
        let b = fit_and_predict(&late, 30).unwrap();
        assert!((a.value - b.value).abs() < 1e-6);
    }

    #[test]
    fn gaps_are_not_zero_filled() {
        let gapped = series(&[("2022-01", 10.0), ("2022-06", 10.0)]);
        let result = fit_and_predict(&gapped, 30).unwrap();
        assert!((result.value - 10.0).abs() < 1e-6);
    }

    #[test]
    fn non_positive_horizon_is_rejected() {
        let s = series(&[("2022-01", 1.0), ("2022-02", 2.0)]);
        assert!(matches!(fit_and_predict(&s, 0), Err(PipelineError::Config(_))));
    }
}
