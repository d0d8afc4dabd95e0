//! Composite scoring of standardized factors.
//!
//! Standardized factor series are combined with signed, L1-normalized
//! weights into one composite score per row, ranked deterministically,
//! and optionally judged against a forward outcome series (IC / RankIC).

use crate::domain::{FactorSeries, RowKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Scoring failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
    /// All weights are zero, or a weight is non-finite.
    #[error("invalid weight configuration: {0}")]
    WeightConfigInvalid(String),

    /// A factor series cannot be aligned to the scoring universe.
    #[error("factor '{factor}' cannot be aligned: {reason}")]
    IndexMismatch { factor: String, reason: String },
}

/// Signed weight per factor id. Weights are combined only after
/// L1 normalization, so the composite is scale-invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeightSet {
    weights: BTreeMap<String, f64>,
}

impl StrategyWeightSet {
    pub fn new(pairs: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            weights: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, factor: &str) -> Option<f64> {
        self.weights.get(factor).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Divide every weight by the L1 norm so |weights| sum to 1.
    /// Idempotent: normalizing an already-normalized set is a no-op
    /// within floating-point tolerance.
    pub fn normalized(&self) -> Result<Self, ScoreError> {
        if let Some((id, w)) = self.weights.iter().find(|(_, w)| !w.is_finite()) {
            return Err(ScoreError::WeightConfigInvalid(format!(
                "weight for '{id}' is {w}"
            )));
        }
        let l1: f64 = self.weights.values().map(|w| w.abs()).sum();
        if l1 == 0.0 {
            return Err(ScoreError::WeightConfigInvalid(
                "all weights are zero".into(),
            ));
        }
        Ok(Self {
            weights: self
                .weights
                .iter()
                .map(|(k, w)| (k.clone(), w / l1))
                .collect(),
        })
    }
}

/// How a row missing one factor's value enters the composite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    /// The row gets no composite score at all.
    #[default]
    Exclude,
    /// The missing factor contributes zero to that row's score.
    Zero,
}

/// Scoring knobs beyond the weights themselves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreOptions {
    pub missing: MissingPolicy,
    /// Global Top-N cutoff. `None` ranks every scored row.
    pub top_n: Option<usize>,
    /// Per-date Top-N cutoff. `None` skips per-group ranking.
    pub group_top_n: Option<usize>,
}

/// One ranked row of the composite output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRow {
    pub key: RowKey,
    pub score: f64,
    /// 1-based rank within its ranking scope.
    pub rank: usize,
}

/// Per-date predictive diagnostics against a forward outcome series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupIc {
    pub group: String,
    /// Pearson correlation between score and outcome.
    pub ic: f64,
    /// Spearman correlation (Pearson over average ranks).
    pub rank_ic: f64,
    /// Rows with both a score and an outcome in this group.
    pub n: usize,
}

/// Full output of one scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    /// Composite score per universe row, in universe order. `None` when
    /// the missing policy excluded the row.
    pub scores: Vec<(RowKey, Option<f64>)>,
    /// Globally ranked rows, best first, cut to `top_n` when set.
    pub top_n: Vec<RankedRow>,
    /// Per-date ranked rows, cut to `group_top_n`. Empty when not requested.
    pub group_top_n: BTreeMap<String, Vec<RankedRow>>,
    /// Scored rows / universe rows.
    pub coverage: f64,
    /// Only present when an outcome series was supplied.
    pub diagnostics: Option<Vec<GroupIc>>,
}

/// Combine standardized factor series into a ranked composite.
///
/// Every factor series is aligned to `universe` (exact match or a
/// reindexable subset). Ranking is a stable descending sort on score, so
/// ties resolve in universe order and Top-N output is reproducible.
pub fn score_strategy(
    universe: &[RowKey],
    factors: &BTreeMap<String, FactorSeries>,
    weights: &StrategyWeightSet,
    options: &ScoreOptions,
    outcome: Option<&FactorSeries>,
) -> Result<ScoringResult, ScoreError> {
    let weights = weights.normalized()?;

    // Align each weighted factor onto the universe index.
    let mut aligned: Vec<(f64, Vec<Option<f64>>)> = Vec::with_capacity(weights.len());
    for (id, weight) in weights.iter() {
        let series = factors.get(id).ok_or_else(|| ScoreError::IndexMismatch {
            factor: id.to_string(),
            reason: "no standardized series supplied for this weight".into(),
        })?;
        let reindexed = if series.index == universe {
            series.values.clone()
        } else {
            series
                .reindex(universe)
                .ok_or_else(|| ScoreError::IndexMismatch {
                    factor: id.to_string(),
                    reason: "series index is not a subset of the universe".into(),
                })?
                .values
        };
        aligned.push((weight, reindexed));
    }

    let scores: Vec<(RowKey, Option<f64>)> = universe
        .iter()
        .enumerate()
        .map(|(row, key)| (key.clone(), composite(row, &aligned, options.missing)))
        .collect();

    let scored = rank_rows(scores.iter().enumerate());
    let coverage = if universe.is_empty() {
        0.0
    } else {
        scored.len() as f64 / universe.len() as f64
    };

    let top_n = match options.top_n {
        Some(n) => scored.iter().take(n).cloned().collect(),
        None => scored.clone(),
    };

    let mut group_top_n = BTreeMap::new();
    if let Some(n) = options.group_top_n {
        let mut by_date: BTreeMap<String, Vec<(usize, &(RowKey, Option<f64>))>> = BTreeMap::new();
        for entry in scores.iter().enumerate() {
            by_date
                .entry(entry.1 .0.date.format("%Y-%m-%d").to_string())
                .or_default()
                .push(entry);
        }
        for (date, rows) in by_date {
            let ranked = rank_rows(rows.into_iter());
            group_top_n.insert(date, ranked.into_iter().take(n).collect());
        }
    }

    let diagnostics = outcome
        .map(|outcome| information_coefficients(&scores, outcome))
        .transpose()?;

    Ok(ScoringResult {
        scores,
        top_n,
        group_top_n,
        coverage,
        diagnostics,
    })
}

fn composite(row: usize, aligned: &[(f64, Vec<Option<f64>>)], missing: MissingPolicy) -> Option<f64> {
    let mut total = 0.0;
    for (weight, values) in aligned {
        match values[row] {
            Some(value) => total += weight * value,
            None => match missing {
                MissingPolicy::Exclude => return None,
                MissingPolicy::Zero => {}
            },
        }
    }
    Some(total)
}

/// Stable descending sort on score. The incoming iterator must be in
/// universe order so ties break deterministically by index position.
fn rank_rows<'a>(
    rows: impl Iterator<Item = (usize, &'a (RowKey, Option<f64>))>,
) -> Vec<RankedRow> {
    let mut scored: Vec<(usize, &RowKey, f64)> = rows
        .filter_map(|(pos, (key, score))| score.map(|s| (pos, key, s)))
        .collect();
    scored.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
    scored
        .into_iter()
        .enumerate()
        .map(|(i, (_, key, score))| RankedRow {
            key: key.clone(),
            score,
            rank: i + 1,
        })
        .collect()
}

// ─── Predictive diagnostics ─────────────────────────────────────────

fn information_coefficients(
    scores: &[(RowKey, Option<f64>)],
    outcome: &FactorSeries,
) -> Result<Vec<GroupIc>, ScoreError> {
    let universe: Vec<RowKey> = scores.iter().map(|(k, _)| k.clone()).collect();
    let outcome = if outcome.index == universe {
        outcome.values.clone()
    } else {
        outcome
            .reindex(&universe)
            .ok_or_else(|| ScoreError::IndexMismatch {
                factor: "outcome".into(),
                reason: "outcome index is not a subset of the universe".into(),
            })?
            .values
    };

    let mut by_date: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    for ((key, score), fwd) in scores.iter().zip(outcome) {
        if let (Some(s), Some(f)) = (score, fwd) {
            by_date
                .entry(key.date.format("%Y-%m-%d").to_string())
                .or_default()
                .push((*s, f));
        }
    }

    Ok(by_date
        .into_iter()
        .map(|(group, pairs)| {
            let xs: Vec<f64> = pairs.iter().map(|p| p.0).collect();
            let ys: Vec<f64> = pairs.iter().map(|p| p.1).collect();
            GroupIc {
                group,
                ic: pearson(&xs, &ys),
                rank_ic: pearson(&average_ranks(&xs), &average_ranks(&ys)),
                n: pairs.len(),
            }
        })
        .collect())
}

/// Pearson correlation. Returns 0.0 for fewer than 2 points or zero
/// variance on either side.
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len();
    if n < 2 {
        return 0.0;
    }
    let mx = xs.iter().sum::<f64>() / n as f64;
    let my = ys.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx < 1e-15 || vy < 1e-15 {
        return 0.0;
    }
    cov / (vx.sqrt() * vy.sqrt())
}

/// 1-based average ranks; ties share the mean rank of their span.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let avg = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = avg;
        }
        start = end;
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn key(code: &str, day: u32) -> RowKey {
        RowKey::new(code, NaiveDate::from_ymd_opt(2024, 1, day).unwrap())
    }

    fn series(index: Vec<RowKey>, values: Vec<Option<f64>>) -> FactorSeries {
        FactorSeries::new(index, values)
    }

    #[test]
    fn normalization_divides_by_l1_norm() {
        let weights = StrategyWeightSet::new([("a".into(), 3.0), ("b".into(), -2.0)]);
        let normalized = weights.normalized().unwrap();
        assert!((normalized.get("a").unwrap() - 0.6).abs() < 1e-12);
        assert!((normalized.get("b").unwrap() + 0.4).abs() < 1e-12);
    }

    #[test]
    fn normalization_rejects_all_zero_and_non_finite() {
        let zeros = StrategyWeightSet::new([("a".into(), 0.0), ("b".into(), 0.0)]);
        assert!(matches!(
            zeros.normalized(),
            Err(ScoreError::WeightConfigInvalid(_))
        ));
        let nan = StrategyWeightSet::new([("a".into(), f64::NAN)]);
        assert!(matches!(
            nan.normalized(),
            Err(ScoreError::WeightConfigInvalid(_))
        ));
    }

    #[test]
    fn two_factor_composite_matches_hand_computation() {
        let universe = vec![key("A", 2)];
        let mut factors = BTreeMap::new();
        factors.insert("alpha".to_string(), series(universe.clone(), vec![Some(1.0)]));
        factors.insert("beta".to_string(), series(universe.clone(), vec![Some(-1.0)]));
        let weights = StrategyWeightSet::new([("alpha".into(), 0.6), ("beta".into(), -0.4)]);

        let result = score_strategy(
            &universe,
            &factors,
            &weights,
            &ScoreOptions::default(),
            None,
        )
        .unwrap();
        // 0.6 × 1.0 + (-0.4) × -1.0 = 1.0
        assert!((result.scores[0].1.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ranking_is_descending_with_ties_in_universe_order() {
        let universe = vec![key("A", 2), key("B", 2), key("C", 2), key("D", 2)];
        let mut factors = BTreeMap::new();
        factors.insert(
            "f".to_string(),
            series(
                universe.clone(),
                vec![Some(1.0), Some(3.0), Some(3.0), Some(2.0)],
            ),
        );
        let weights = StrategyWeightSet::new([("f".into(), 1.0)]);
        let result = score_strategy(
            &universe,
            &factors,
            &weights,
            &ScoreOptions::default(),
            None,
        )
        .unwrap();

        let codes: Vec<&str> = result.top_n.iter().map(|r| r.key.ts_code.as_str()).collect();
        // B and C tie at 3.0; B comes first because it precedes C in the
        // universe.
        assert_eq!(codes, vec!["B", "C", "D", "A"]);
        assert_eq!(result.top_n[0].rank, 1);
        assert_eq!(result.top_n[3].rank, 4);
    }

    #[test]
    fn missing_policy_exclude_drops_the_row_zero_keeps_it() {
        let universe = vec![key("A", 2), key("B", 2)];
        let mut factors = BTreeMap::new();
        factors.insert(
            "f".to_string(),
            series(universe.clone(), vec![Some(2.0), None]),
        );
        factors.insert(
            "g".to_string(),
            series(universe.clone(), vec![Some(2.0), Some(4.0)]),
        );
        let weights = StrategyWeightSet::new([("f".into(), 0.5), ("g".into(), 0.5)]);

        let excluded = score_strategy(
            &universe,
            &factors,
            &weights,
            &ScoreOptions::default(),
            None,
        )
        .unwrap();
        assert_eq!(excluded.scores[1].1, None);
        assert!((excluded.coverage - 0.5).abs() < 1e-12);

        let zeroed = score_strategy(
            &universe,
            &factors,
            &weights,
            &ScoreOptions {
                missing: MissingPolicy::Zero,
                ..ScoreOptions::default()
            },
            None,
        )
        .unwrap();
        assert!((zeroed.scores[1].1.unwrap() - 2.0).abs() < 1e-12);
        assert!((zeroed.coverage - 1.0).abs() < 1e-12);
    }

    #[test]
    fn per_group_top_n_cuts_within_each_date() {
        let universe = vec![
            key("A", 2),
            key("B", 2),
            key("C", 2),
            key("A", 3),
            key("B", 3),
            key("C", 3),
        ];
        let mut factors = BTreeMap::new();
        factors.insert(
            "f".to_string(),
            series(
                universe.clone(),
                vec![Some(1.0), Some(2.0), Some(3.0), Some(6.0), Some(5.0), Some(4.0)],
            ),
        );
        let weights = StrategyWeightSet::new([("f".into(), 1.0)]);
        let result = score_strategy(
            &universe,
            &factors,
            &weights,
            &ScoreOptions {
                group_top_n: Some(1),
                ..ScoreOptions::default()
            },
            None,
        )
        .unwrap();

        assert_eq!(result.group_top_n.len(), 2);
        assert_eq!(result.group_top_n["2024-01-02"][0].key.ts_code, "C");
        assert_eq!(result.group_top_n["2024-01-03"][0].key.ts_code, "A");
    }

    #[test]
    fn monotonic_standardization_preserves_raw_order_in_ranking() {
        // Factor values 1..6 over two dates; within each date the ranking
        // must follow raw value order.
        let universe = vec![
            key("A", 2),
            key("B", 2),
            key("C", 2),
            key("A", 3),
            key("B", 3),
            key("C", 3),
        ];
        let raw = series(
            universe.clone(),
            vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(5.0), Some(6.0)],
        );
        let standardized = crate::standardize::standardize(
            &raw,
            &crate::standardize::NormalizationPolicy::default(),
        )
        .unwrap();

        let mut factors = BTreeMap::new();
        factors.insert("f".to_string(), standardized.series);
        let weights = StrategyWeightSet::new([("f".into(), 1.0)]);
        let result = score_strategy(
            &universe,
            &factors,
            &weights,
            &ScoreOptions {
                group_top_n: Some(3),
                ..ScoreOptions::default()
            },
            None,
        )
        .unwrap();

        for date in ["2024-01-02", "2024-01-03"] {
            let codes: Vec<&str> = result.group_top_n[date]
                .iter()
                .map(|r| r.key.ts_code.as_str())
                .collect();
            assert_eq!(codes, vec!["C", "B", "A"]);
        }
    }

    #[test]
    fn coverage_counts_scored_over_universe() {
        let universe: Vec<RowKey> = (0..100).map(|i| key(&format!("S{i:03}"), 2)).collect();
        let values: Vec<Option<f64>> = (0..100)
            .map(|i| if i < 80 { Some(i as f64) } else { None })
            .collect();
        let mut factors = BTreeMap::new();
        factors.insert("f".to_string(), series(universe.clone(), values));
        let weights = StrategyWeightSet::new([("f".into(), 1.0)]);
        let result = score_strategy(
            &universe,
            &factors,
            &weights,
            &ScoreOptions::default(),
            None,
        )
        .unwrap();
        assert!((result.coverage - 0.80).abs() < 1e-12);
    }

    #[test]
    fn diagnostics_report_perfect_ic_for_identical_series() {
        let universe = vec![key("A", 2), key("B", 2), key("C", 2)];
        let values = vec![Some(1.0), Some(2.0), Some(3.0)];
        let mut factors = BTreeMap::new();
        factors.insert("f".to_string(), series(universe.clone(), values.clone()));
        let weights = StrategyWeightSet::new([("f".into(), 1.0)]);
        let outcome = series(universe.clone(), values);

        let result = score_strategy(
            &universe,
            &factors,
            &weights,
            &ScoreOptions::default(),
            Some(&outcome),
        )
        .unwrap();
        let diags = result.diagnostics.unwrap();
        assert_eq!(diags.len(), 1);
        assert!((diags[0].ic - 1.0).abs() < 1e-12);
        assert!((diags[0].rank_ic - 1.0).abs() < 1e-12);
        assert_eq!(diags[0].n, 3);
    }

    #[test]
    fn rank_ic_ignores_nonlinearity() {
        let universe = vec![key("A", 2), key("B", 2), key("C", 2), key("D", 2)];
        let mut factors = BTreeMap::new();
        factors.insert(
            "f".to_string(),
            series(
                universe.clone(),
                vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)],
            ),
        );
        let weights = StrategyWeightSet::new([("f".into(), 1.0)]);
        // Outcome is a monotone but convex transform of the score.
        let outcome = series(
            universe.clone(),
            vec![Some(1.0), Some(8.0), Some(27.0), Some(64.0)],
        );
        let result = score_strategy(
            &universe,
            &factors,
            &weights,
            &ScoreOptions::default(),
            Some(&outcome),
        )
        .unwrap();
        let diags = result.diagnostics.unwrap();
        assert!((diags[0].rank_ic - 1.0).abs() < 1e-12);
        assert!(diags[0].ic < 1.0);
    }

    #[test]
    fn missing_weight_series_is_an_index_mismatch() {
        let universe = vec![key("A", 2)];
        let factors = BTreeMap::new();
        let weights = StrategyWeightSet::new([("ghost".into(), 1.0)]);
        assert!(matches!(
            score_strategy(&universe, &factors, &weights, &ScoreOptions::default(), None),
            Err(ScoreError::IndexMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn weight_normalization_is_idempotent(
            ws in proptest::collection::vec(-10.0..10.0f64, 1..8)
        ) {
            prop_assume!(ws.iter().any(|w| w.abs() > 1e-9));
            let set = StrategyWeightSet::new(
                ws.iter().enumerate().map(|(i, &w)| (format!("f{i}"), w)),
            );
            let once = set.normalized().unwrap();
            let twice = once.normalized().unwrap();
            for (id, w) in once.iter() {
                prop_assert!((w - twice.get(id).unwrap()).abs() < 1e-12);
            }
        }
    }
}
