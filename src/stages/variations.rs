//! Parameter variation axes and their combinations.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::CombinationStrategy;
use crate::domain::{ExampleFormat, VariationAxis};

/// One chosen value per axis, keyed by axis name
pub type Combination = BTreeMap<String, String>;

/// Axis values that mark an example as a corner case
pub const ADVERSARIAL_VALUES: [&str; 3] = ["profanity", "injection", "garbage"];

/// Suggested axes for a dataset case
///
/// Unknown cases get the support-bot axes.
pub fn axis_catalog(case: &str) -> Vec<VariationAxis> {
    match case {
        "operator_quality" => vec![
            VariationAxis::new("phrase_length", &["short", "medium", "long"]),
            VariationAxis::new("punctuation_errors", &["none", "minor", "severe"]),
            VariationAxis::new("slang_profanity_emoji", &["none", "moderate", "excessive"]),
            VariationAxis::new("medical_terms", &["none", "present"]),
            VariationAxis::new("user_aggression", &["neutral", "frustrated", "angry"]),
            VariationAxis::new("escalation_needed", &["no", "yes"]),
        ],
        _ => vec![
            VariationAxis::new("tone", &["neutral", "negative", "aggressive"]),
            VariationAxis::new("has_order_id", &["true", "false"]),
            VariationAxis::new("requires_account_access", &["true", "false"]),
            VariationAxis::new("language", &["ru", "en"]),
            VariationAxis::new("adversarial", &["none", "profanity", "injection", "garbage"]),
        ],
    }
}

/// Formats generated for a case when none are configured
pub fn default_formats(case: &str) -> Vec<ExampleFormat> {
    match case {
        "operator_quality" => vec![
            ExampleFormat::SingleUtteranceCorrection,
            ExampleFormat::DialogLastTurnCorrection,
        ],
        _ => vec![ExampleFormat::SingleTurnQa],
    }
}

/// Enumerate value combinations over `axes`
pub fn combinations(axes: &[VariationAxis], strategy: CombinationStrategy) -> Vec<Combination> {
    let axes: Vec<&VariationAxis> = axes.iter().filter(|a| !a.values.is_empty()).collect();
    if axes.is_empty() {
        return Vec::new();
    }

    let rows = match strategy {
        CombinationStrategy::Exhaustive => cross_product(&axes),
        CombinationStrategy::Pairwise if axes.len() < 3 => cross_product(&axes),
        CombinationStrategy::Pairwise => all_pairs(&axes),
    };

    rows.into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(axis, &value)| (axes[axis].name.clone(), axes[axis].values[value].clone()))
                .collect()
        })
        .collect()
}

/// Every combination, first axis varying slowest
fn cross_product(axes: &[&VariationAxis]) -> Vec<Vec<usize>> {
    let mut rows = vec![Vec::new()];
    for axis in axes {
        rows = rows
            .into_iter()
            .flat_map(|row| {
                (0..axis.values.len()).map(move |value| {
                    let mut next = row.clone();
                    next.push(value);
                    next
                })
            })
            .collect();
    }
    rows
}

type Pair = (usize, usize, usize, usize);

/// Greedy all-pairs construction
///
/// Each row is seeded with the smallest uncovered pair; every other axis takes
/// the value that covers the most still-uncovered pairs, lowest index on ties.
fn all_pairs(axes: &[&VariationAxis]) -> Vec<Vec<usize>> {
    let mut uncovered: BTreeSet<Pair> = BTreeSet::new();
    for a in 0..axes.len() {
        for b in (a + 1)..axes.len() {
            for va in 0..axes[a].values.len() {
                for vb in 0..axes[b].values.len() {
                    uncovered.insert((a, va, b, vb));
                }
            }
        }
    }

    let mut rows = Vec::new();
    while let Some((a, va, b, vb)) = uncovered.first().copied() {
        let mut row: Vec<Option<usize>> = vec![None; axes.len()];
        row[a] = Some(va);
        row[b] = Some(vb);

        for axis in 0..axes.len() {
            if row[axis].is_some() {
                continue;
            }
            let best = (0..axes[axis].values.len())
                .max_by_key(|&value| {
                    let gain = newly_covered(&row, axis, value, &uncovered);
                    // lowest index wins ties
                    (gain, std::cmp::Reverse(value))
                })
                .unwrap_or(0);
            row[axis] = Some(best);
        }

        let row: Vec<usize> = row.into_iter().map(|v| v.unwrap_or(0)).collect();
        for x in 0..row.len() {
            for y in (x + 1)..row.len() {
                uncovered.remove(&(x, row[x], y, row[y]));
            }
        }
        rows.push(row);
    }
    rows
}

fn newly_covered(row: &[Option<usize>], axis: usize, value: usize, uncovered: &BTreeSet<Pair>) -> usize {
    row.iter()
        .enumerate()
        .filter_map(|(other, v)| v.map(|v| (other, v)))
        .filter(|&(other, v)| {
            let pair = if other < axis {
                (other, v, axis, value)
            } else {
                (axis, value, other, v)
            };
            uncovered.contains(&pair)
        })
        .count()
}

/// Whether any chosen value is adversarial
pub fn is_adversarial(combination: &Combination) -> bool {
    combination
        .values()
        .any(|v| ADVERSARIAL_VALUES.contains(&v.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers_all_pairs(axes: &[VariationAxis], rows: &[Combination]) -> bool {
        for (i, a) in axes.iter().enumerate() {
            for b in &axes[i + 1..] {
                for va in &a.values {
                    for vb in &b.values {
                        let hit = rows
                            .iter()
                            .any(|r| r.get(&a.name) == Some(va) && r.get(&b.name) == Some(vb));
                        if !hit {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    #[test]
    fn test_exhaustive_is_full_cross_product() {
        let axes = vec![
            VariationAxis::new("tone", &["neutral", "angry"]),
            VariationAxis::new("language", &["ru", "en", "de"]),
        ];
        let rows = combinations(&axes, CombinationStrategy::Exhaustive);
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0]["tone"], "neutral");
        assert_eq!(rows[0]["language"], "ru");
        assert_eq!(rows[5]["tone"], "angry");
        assert_eq!(rows[5]["language"], "de");
    }

    #[test]
    fn test_pairwise_covers_every_pair_with_fewer_rows() {
        let axes = axis_catalog("support_bot");
        let exhaustive = combinations(&axes, CombinationStrategy::Exhaustive);
        let pairwise = combinations(&axes, CombinationStrategy::Pairwise);

        assert_eq!(exhaustive.len(), 3 * 2 * 2 * 2 * 4);
        assert!(pairwise.len() < exhaustive.len());
        assert!(pairwise.len() >= 12); // 3 tones x 4 adversarial values
        assert!(covers_all_pairs(&axes, &pairwise));
    }

    #[test]
    fn test_pairwise_is_deterministic() {
        let axes = axis_catalog("operator_quality");
        assert_eq!(
            combinations(&axes, CombinationStrategy::Pairwise),
            combinations(&axes, CombinationStrategy::Pairwise)
        );
        assert!(covers_all_pairs(&axes, &combinations(&axes, CombinationStrategy::Pairwise)));
    }

    #[test]
    fn test_default_formats_per_case() {
        assert_eq!(default_formats("support_bot"), vec![ExampleFormat::SingleTurnQa]);
        assert_eq!(default_formats("operator_quality").len(), 2);
        assert_eq!(axis_catalog("something_else"), axis_catalog("support_bot"));
    }

    #[test]
    fn test_adversarial_detection() {
        let mut combination = Combination::new();
        combination.insert("adversarial".into(), "none".into());
        assert!(!is_adversarial(&combination));
        combination.insert("adversarial".into(), "injection".into());
        assert!(is_adversarial(&combination));
    }

    #[test]
    fn test_empty_axes_produce_nothing() {
        assert!(combinations(&[], CombinationStrategy::Pairwise).is_empty());
    }
}
