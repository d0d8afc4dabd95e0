//! Grouped standardization of raw factor series.
//!
//! Raw factor values are not comparable across dates or securities. Each
//! group (by default, all rows sharing a date) is winsorized to quantile
//! bounds, missing values are filled per policy, and the group is mapped
//! through the configured normalization method. Diagnostic statistics are
//! computed per group so callers can judge the distribution they fed in.

use crate::domain::FactorSeries;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Standardization failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    /// A variance-requiring method saw a group with fewer than two
    /// non-missing values.
    #[error("group '{group}' has {non_missing} non-missing values, need at least 2")]
    InsufficientGroup { group: String, non_missing: usize },

    /// The policy itself is malformed (e.g. winsor bounds out of order).
    #[error("invalid normalization policy: {0}")]
    InvalidPolicy(String),
}

/// Normalization method applied per group after winsorization and fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    ZScore,
    RobustZScore,
    Rank,
    MinMax,
}

impl Method {
    /// Whether the method divides by a spread estimate and therefore needs
    /// at least two non-missing values per group.
    fn requires_variance(self) -> bool {
        matches!(self, Method::ZScore | Method::RobustZScore)
    }
}

/// How missing values are treated after winsorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fill {
    /// Replace with the group median of the non-missing values.
    Median,
    /// Replace with zero.
    Zero,
    /// Leave missing; the row contributes nothing and stays missing.
    Drop,
}

/// Which component of the row key defines a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One group per date (cross-sectional standardization).
    Date,
    /// One group per security (time-series standardization).
    TsCode,
}

/// Full standardization recipe for one factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationPolicy {
    pub method: Method,
    /// Lower winsorization quantile in [0, 1].
    pub winsor_lower: f64,
    /// Upper winsorization quantile in [0, 1].
    pub winsor_upper: f64,
    pub fill: Fill,
    pub group_by: GroupBy,
}

impl Default for NormalizationPolicy {
    fn default() -> Self {
        Self {
            method: Method::ZScore,
            winsor_lower: 0.01,
            winsor_upper: 0.99,
            fill: Fill::Median,
            group_by: GroupBy::Date,
        }
    }
}

impl NormalizationPolicy {
    fn check(&self) -> Result<(), NormalizationError> {
        let (lo, hi) = (self.winsor_lower, self.winsor_upper);
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) {
            return Err(NormalizationError::InvalidPolicy(format!(
                "winsor quantiles must lie in [0, 1], got ({lo}, {hi})"
            )));
        }
        if lo > hi {
            return Err(NormalizationError::InvalidPolicy(format!(
                "winsor_lower {lo} exceeds winsor_upper {hi}"
            )));
        }
        Ok(())
    }
}

/// Per-group distribution diagnostics, computed after winsorization on the
/// non-missing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub group: String,
    /// Rows in the group, missing included.
    pub count: usize,
    /// Missing rows / total rows, before fill.
    pub missing_rate: f64,
    pub mean: f64,
    pub std: f64,
    pub skewness: f64,
    pub kurtosis: f64,
}

/// A standardized series together with its per-group diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Standardized {
    pub series: FactorSeries,
    pub group_stats: Vec<GroupStats>,
}

/// Standardize a raw factor series under the given policy.
///
/// Rows keep their position: the output series has the same index as the
/// input, with `Drop`-filled missing rows staying missing.
pub fn standardize(
    series: &FactorSeries,
    policy: &NormalizationPolicy,
) -> Result<Standardized, NormalizationError> {
    policy.check()?;

    // Group rows by the configured key component, preserving row order
    // within a group. BTreeMap keeps group iteration deterministic.
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (pos, key) in series.index.iter().enumerate() {
        let label = match policy.group_by {
            GroupBy::Date => key.date.format("%Y-%m-%d").to_string(),
            GroupBy::TsCode => key.ts_code.clone(),
        };
        groups.entry(label).or_default().push(pos);
    }

    let mut out = vec![None; series.values.len()];
    let mut group_stats = Vec::with_capacity(groups.len());

    for (label, positions) in groups {
        let raw: Vec<Option<f64>> = positions.iter().map(|&p| series.values[p]).collect();
        let missing = raw.iter().filter(|v| v.is_none()).count();

        let winsorized = winsorize(&raw, policy.winsor_lower, policy.winsor_upper);
        let filled = apply_fill(&winsorized, policy.fill);

        let present: Vec<f64> = filled.iter().filter_map(|v| *v).collect();
        if policy.method.requires_variance() && present.len() < 2 {
            return Err(NormalizationError::InsufficientGroup {
                group: label,
                non_missing: present.len(),
            });
        }

        group_stats.push(describe(&label, raw.len(), missing, &present));

        let transformed = match policy.method {
            Method::ZScore => zscore(&filled),
            Method::RobustZScore => robust_zscore(&filled),
            Method::Rank => rank(&filled),
            Method::MinMax => minmax(&filled),
        };
        for (&pos, value) in positions.iter().zip(transformed) {
            out[pos] = value;
        }
    }

    Ok(Standardized {
        series: FactorSeries::new(series.index.clone(), out),
        group_stats,
    })
}

// ─── Group-local transforms ─────────────────────────────────────────

/// Clip non-missing values to the [lower, upper] quantile boundaries.
/// Missing values pass through untouched.
fn winsorize(values: &[Option<f64>], lower: f64, upper: f64) -> Vec<Option<f64>> {
    let mut present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if present.is_empty() {
        return values.to_vec();
    }
    present.sort_by(|a, b| a.total_cmp(b));
    let lo = quantile(&present, lower);
    let hi = quantile(&present, upper);
    values
        .iter()
        .map(|v| v.map(|x| x.clamp(lo, hi)))
        .collect()
}

/// Linear-interpolation quantile over a sorted, non-empty slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = q * (n - 1) as f64;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = h - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

fn apply_fill(values: &[Option<f64>], fill: Fill) -> Vec<Option<f64>> {
    match fill {
        Fill::Drop => values.to_vec(),
        Fill::Zero => values.iter().map(|v| Some(v.unwrap_or(0.0))).collect(),
        Fill::Median => {
            let mut present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
            if present.is_empty() {
                return values.to_vec();
            }
            present.sort_by(|a, b| a.total_cmp(b));
            let med = median_sorted(&present);
            values.iter().map(|v| Some(v.unwrap_or(med))).collect()
        }
    }
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// `(x - mean) / std` with population std. Zero-variance groups map to
/// all zeros.
fn zscore(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    let mean = mean(&present);
    let std = population_std(&present, mean);
    values
        .iter()
        .map(|v| v.map(|x| if std < 1e-15 { 0.0 } else { (x - mean) / std }))
        .collect()
}

/// `(x - median) / (1.4826 × MAD)`. Zero-MAD groups map to all zeros.
fn robust_zscore(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    present.sort_by(|a, b| a.total_cmp(b));
    if present.is_empty() {
        return values.to_vec();
    }
    let med = median_sorted(&present);
    let mut deviations: Vec<f64> = present.iter().map(|x| (x - med).abs()).collect();
    deviations.sort_by(|a, b| a.total_cmp(b));
    let scale = 1.4826 * median_sorted(&deviations);
    values
        .iter()
        .map(|v| v.map(|x| if scale < 1e-15 { 0.0 } else { (x - med) / scale }))
        .collect()
}

/// Average ranks scaled to [0, 1]. Ties share the mean of their rank span;
/// a single-element group maps to 0.5.
fn rank(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let present: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|x| (i, x)))
        .collect();
    let n = present.len();
    let mut out = vec![None; values.len()];
    if n == 0 {
        return out;
    }
    if n == 1 {
        out[present[0].0] = Some(0.5);
        return out;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| present[a].1.total_cmp(&present[b].1));

    // Walk runs of equal values and assign each the mean 1-based rank.
    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && present[order[end]].1 == present[order[start]].1 {
            end += 1;
        }
        let avg_rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = avg_rank;
        }
        start = end;
    }

    for (slot, rank) in present.iter().zip(ranks) {
        out[slot.0] = Some((rank - 1.0) / (n - 1) as f64);
    }
    out
}

/// `(x - min) / (max - min)`. Zero-range groups map to all zeros.
fn minmax(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    let min = present.iter().copied().fold(f64::INFINITY, f64::min);
    let max = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    values
        .iter()
        .map(|v| {
            v.map(|x| {
                if !range.is_finite() || range < 1e-15 {
                    0.0
                } else {
                    (x - min) / range
                }
            })
        })
        .collect()
}

// ─── Diagnostics ────────────────────────────────────────────────────

fn describe(label: &str, count: usize, missing: usize, present: &[f64]) -> GroupStats {
    let mean = mean(present);
    let std = population_std(present, mean);
    let (skewness, kurtosis) = if std < 1e-15 || present.is_empty() {
        (0.0, 0.0)
    } else {
        let n = present.len() as f64;
        let m3 = present.iter().map(|x| (x - mean).powi(3)).sum::<f64>() / n;
        let m4 = present.iter().map(|x| (x - mean).powi(4)).sum::<f64>() / n;
        (m3 / std.powi(3), m4 / std.powi(4) - 3.0)
    };
    GroupStats {
        group: label.to_string(),
        count,
        missing_rate: if count == 0 {
            0.0
        } else {
            missing as f64 / count as f64
        },
        mean,
        std,
        skewness,
        kurtosis,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RowKey;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn series_on_dates(values: Vec<Option<f64>>, dates: &[u32]) -> FactorSeries {
        let index = dates
            .iter()
            .enumerate()
            .map(|(i, &day)| {
                RowKey::new(
                    format!("S{i:03}"),
                    NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
                )
            })
            .collect();
        FactorSeries::new(index, values)
    }

    fn policy(method: Method) -> NormalizationPolicy {
        NormalizationPolicy {
            method,
            winsor_lower: 0.0,
            winsor_upper: 1.0,
            fill: Fill::Drop,
            group_by: GroupBy::Date,
        }
    }

    #[test]
    fn zscore_is_centered_and_unit_scale_per_group() {
        let series = series_on_dates(
            vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(5.0), Some(6.0)],
            &[2, 2, 2, 3, 3, 3],
        );
        let result = standardize(&series, &policy(Method::ZScore)).unwrap();
        for day in [&result.series.values[..3], &result.series.values[3..]] {
            let vals: Vec<f64> = day.iter().map(|v| v.unwrap()).collect();
            let m = vals.iter().sum::<f64>() / 3.0;
            let s = (vals.iter().map(|x| (x - m).powi(2)).sum::<f64>() / 3.0).sqrt();
            assert!(m.abs() < 1e-12);
            assert!((s - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn zero_variance_group_maps_to_zeros() {
        let series = series_on_dates(vec![Some(7.0), Some(7.0), Some(7.0)], &[2, 2, 2]);
        let result = standardize(&series, &policy(Method::ZScore)).unwrap();
        assert_eq!(
            result.series.values,
            vec![Some(0.0), Some(0.0), Some(0.0)]
        );
    }

    #[test]
    fn insufficient_group_is_an_error_for_variance_methods() {
        let series = series_on_dates(vec![Some(1.0), None, None], &[2, 2, 2]);
        let err = standardize(&series, &policy(Method::ZScore)).unwrap_err();
        assert!(matches!(
            err,
            NormalizationError::InsufficientGroup { non_missing: 1, .. }
        ));
        // Rank tolerates the same group.
        assert!(standardize(&series, &policy(Method::Rank)).is_ok());
    }

    #[test]
    fn robust_zscore_uses_mad_scale() {
        let series = series_on_dates(
            vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(100.0)],
            &[2, 2, 2, 2, 2],
        );
        let result = standardize(&series, &policy(Method::RobustZScore)).unwrap();
        // median 3, MAD = median(|x-3|) = median(2,1,0,1,97) = 1.
        let expected = (2.0 - 3.0) / 1.4826;
        assert!((result.series.values[1].unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn rank_scales_average_ranks_to_unit_interval() {
        let series = series_on_dates(
            vec![Some(10.0), Some(30.0), Some(20.0), Some(20.0)],
            &[2, 2, 2, 2],
        );
        let result = standardize(&series, &policy(Method::Rank)).unwrap();
        let v = &result.series.values;
        assert_eq!(v[0], Some(0.0)); // rank 1
        assert_eq!(v[1], Some(1.0)); // rank 4
        // The tied pair shares rank (2+3)/2 = 2.5 → (2.5-1)/3 = 0.5.
        assert_eq!(v[2], Some(0.5));
        assert_eq!(v[3], Some(0.5));
    }

    #[test]
    fn rank_of_single_element_group_is_half() {
        let series = series_on_dates(vec![Some(42.0)], &[2]);
        let result = standardize(&series, &policy(Method::Rank)).unwrap();
        assert_eq!(result.series.values, vec![Some(0.5)]);
    }

    #[test]
    fn minmax_spans_unit_interval() {
        let series = series_on_dates(vec![Some(5.0), Some(15.0), Some(10.0)], &[2, 2, 2]);
        let result = standardize(&series, &policy(Method::MinMax)).unwrap();
        assert_eq!(
            result.series.values,
            vec![Some(0.0), Some(1.0), Some(0.5)]
        );
    }

    #[test]
    fn winsorization_clips_outliers_before_transform() {
        let mut p = policy(Method::MinMax);
        p.winsor_lower = 0.0;
        p.winsor_upper = 0.5;
        // Sorted group is [1, 2, 1000]; the 0.5 quantile is 2, so the
        // outlier collapses onto the upper bound.
        let series = series_on_dates(vec![Some(1.0), Some(2.0), Some(1000.0)], &[2, 2, 2]);
        let result = standardize(&series, &p).unwrap();
        assert_eq!(result.series.values[1], Some(1.0));
        assert_eq!(result.series.values[2], Some(1.0));
    }

    #[test]
    fn fill_median_replaces_missing_and_drop_keeps_missing() {
        let values = vec![Some(1.0), None, Some(3.0)];

        let mut p = policy(Method::MinMax);
        p.fill = Fill::Median;
        let filled = standardize(&series_on_dates(values.clone(), &[2, 2, 2]), &p).unwrap();
        // Median of {1, 3} is 2 → minmax maps it to 0.5.
        assert_eq!(filled.series.values[1], Some(0.5));

        p.fill = Fill::Drop;
        let dropped = standardize(&series_on_dates(values, &[2, 2, 2]), &p).unwrap();
        assert_eq!(dropped.series.values[1], None);
    }

    #[test]
    fn fill_zero_replaces_missing_with_zero() {
        let mut p = policy(Method::Rank);
        p.fill = Fill::Zero;
        let series = series_on_dates(vec![Some(-1.0), None, Some(1.0)], &[2, 2, 2]);
        let result = standardize(&series, &p).unwrap();
        // Zero ranks between -1 and 1.
        assert_eq!(result.series.values[1], Some(0.5));
    }

    #[test]
    fn grouping_by_ts_code_standardizes_along_time() {
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        let index = vec![
            RowKey::new("A", d(2)),
            RowKey::new("A", d(3)),
            RowKey::new("B", d(2)),
            RowKey::new("B", d(3)),
        ];
        let series = FactorSeries::new(index, vec![Some(1.0), Some(3.0), Some(10.0), Some(30.0)]);
        let mut p = policy(Method::MinMax);
        p.group_by = GroupBy::TsCode;
        let result = standardize(&series, &p).unwrap();
        assert_eq!(
            result.series.values,
            vec![Some(0.0), Some(1.0), Some(0.0), Some(1.0)]
        );
    }

    #[test]
    fn rejects_out_of_order_winsor_bounds() {
        let mut p = policy(Method::ZScore);
        p.winsor_lower = 0.9;
        p.winsor_upper = 0.1;
        let series = series_on_dates(vec![Some(1.0), Some(2.0)], &[2, 2]);
        assert!(matches!(
            standardize(&series, &p),
            Err(NormalizationError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn stats_report_missing_rate_and_moments() {
        let series = series_on_dates(vec![Some(1.0), Some(2.0), Some(3.0), None], &[2, 2, 2, 2]);
        let result = standardize(&series, &policy(Method::Rank)).unwrap();
        assert_eq!(result.group_stats.len(), 1);
        let stats = &result.group_stats[0];
        assert_eq!(stats.count, 4);
        assert!((stats.missing_rate - 0.25).abs() < 1e-12);
        assert!((stats.mean - 2.0).abs() < 1e-12);
        assert!(stats.skewness.abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn zscore_output_is_centered(values in proptest::collection::vec(-1e3..1e3f64, 3..40)) {
            let n = values.len();
            let series = series_on_dates(
                values.iter().map(|&v| Some(v)).collect(),
                &vec![2; n],
            );
            let result = standardize(&series, &policy(Method::ZScore)).unwrap();
            let out: Vec<f64> = result.series.values.iter().map(|v| v.unwrap()).collect();
            let mean = out.iter().sum::<f64>() / n as f64;
            prop_assert!(mean.abs() < 1e-8);
        }

        #[test]
        fn rank_output_stays_in_unit_interval(values in proptest::collection::vec(-1e6..1e6f64, 1..40)) {
            let n = values.len();
            let series = series_on_dates(
                values.iter().map(|&v| Some(v)).collect(),
                &vec![2; n],
            );
            let result = standardize(&series, &policy(Method::Rank)).unwrap();
            for v in result.series.values.iter().flatten() {
                prop_assert!((0.0..=1.0).contains(v));
            }
        }
    }
}
