//! Mann-Whitney U rank-sum test, the statistical primitive behind the
//! dynamic comparison between deployment variants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default significance level for the rank-sum test.
pub const DEFAULT_SIGNIFICANCE_LEVEL: f64 = 0.05;

/// Minimum samples per side below which the test reports insufficient data.
const MIN_SAMPLE_SIZE: usize = 2;

/// Which deviation direction of the experiment series fails the check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Deviation {
    #[default]
    Either,
    High,
    Low,
}

impl Deviation {
    /// Whether a detected deviation in the given direction violates this
    /// configuration.
    pub fn disallows(self, direction: DeviationDirection) -> bool {
        match self {
            Deviation::Either => true,
            Deviation::High => direction == DeviationDirection::High,
            Deviation::Low => direction == DeviationDirection::Low,
        }
    }
}

/// Direction of a detected significant deviation of experiment vs control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviationDirection {
    High,
    Low,
}

impl fmt::Display for DeviationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviationDirection::High => "high",
            DeviationDirection::Low => "low",
        };
        write!(f, "{label}")
    }
}

/// Raw statistics of one rank-sum comparison.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MannWhitneyResult {
    pub u_statistic: f64,
    pub z_score: f64,
    pub p_value: f64,
}

/// Outcome of comparing the experiment series against the control series.
#[derive(Debug, Clone, Copy)]
pub enum ComparisonOutcome {
    /// One of the samples is too small to compare.
    InsufficientData,
    /// No statistically significant difference between the samples.
    NoDeviation,
    /// A significant difference, together with its direction.
    Deviation {
        direction: DeviationDirection,
        result: MannWhitneyResult,
    },
}

/// Runs the tie-corrected Mann-Whitney U test on the two samples.
///
/// Ranks the pooled samples with average ranks for ties, computes
/// `U = R1 - n1(n1+1)/2` for the experiment side and converts it into a
/// two-sided p-value through the normal approximation. Identical samples
/// (zero variance) never deviate.
pub fn compare(
    experiment: &[f64],
    control: &[f64],
    significance_level: f64,
) -> ComparisonOutcome {
    let n1 = experiment.len();
    let n2 = control.len();
    if n1 < MIN_SAMPLE_SIZE || n2 < MIN_SAMPLE_SIZE {
        return ComparisonOutcome::InsufficientData;
    }

    let mut combined: Vec<(f64, bool)> = Vec::with_capacity(n1 + n2);
    for &value in experiment {
        combined.push((value, true));
    }
    for &value in control {
        combined.push((value, false));
    }
    combined.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Assign ranks, averaging within tie groups, and accumulate the
    // standard tie-adjustment term sum(t^3 - t).
    let n = combined.len();
    let mut ranks = vec![0.0; n];
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j < n && combined[j].0 == combined[i].0 {
            j += 1;
        }
        let avg_rank = (i + j + 1) as f64 / 2.0;
        for rank in ranks.iter_mut().take(j).skip(i) {
            *rank = avg_rank;
        }
        let ties = (j - i) as f64;
        tie_term += ties * ties * ties - ties;
        i = j;
    }

    let r1: f64 = combined
        .iter()
        .zip(ranks.iter())
        .filter(|((_, is_experiment), _)| *is_experiment)
        .map(|(_, rank)| *rank)
        .sum();

    let n1f = n1 as f64;
    let n2f = n2 as f64;
    let nf = n as f64;
    let u_statistic = r1 - n1f * (n1f + 1.0) / 2.0;
    let mean_u = n1f * n2f / 2.0;
    let variance = (n1f * n2f / 12.0) * ((nf + 1.0) - tie_term / (nf * (nf - 1.0)));
    if variance <= 0.0 {
        return ComparisonOutcome::NoDeviation;
    }

    let z_score = (u_statistic - mean_u) / variance.sqrt();
    let p_value = 2.0 * (1.0 - standard_normal_cdf(z_score.abs()));
    if p_value >= significance_level {
        return ComparisonOutcome::NoDeviation;
    }

    let direction = if mean(experiment) > mean(control) {
        DeviationDirection::High
    } else {
        DeviationDirection::Low
    };
    ComparisonOutcome::Deviation {
        direction,
        result: MannWhitneyResult {
            u_statistic,
            z_score,
            p_value,
        },
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / 2.0_f64.sqrt()))
}

/// Abramowitz and Stegun approximation of the error function.
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_samples_do_not_deviate() {
        let values = [0.1, 0.2, 0.3, 0.4, 0.5];
        let outcome = compare(&values, &values, DEFAULT_SIGNIFICANCE_LEVEL);
        assert!(matches!(outcome, ComparisonOutcome::NoDeviation));
    }

    #[test]
    fn constant_equal_samples_have_zero_variance() {
        let outcome = compare(&[1.0, 1.0, 1.0], &[1.0, 1.0, 1.0], DEFAULT_SIGNIFICANCE_LEVEL);
        assert!(matches!(outcome, ComparisonOutcome::NoDeviation));
    }

    #[test]
    fn detects_high_deviation() {
        let experiment = [10.1, 10.2, 10.3, 10.4, 10.5];
        let control = [0.1, 0.2, 0.3, 0.4, 0.5];
        match compare(&experiment, &control, DEFAULT_SIGNIFICANCE_LEVEL) {
            ComparisonOutcome::Deviation { direction, result } => {
                assert_eq!(direction, DeviationDirection::High);
                assert!(result.p_value < DEFAULT_SIGNIFICANCE_LEVEL);
                // The high deviation is disallowed only by HIGH and EITHER.
                assert!(Deviation::High.disallows(direction));
                assert!(Deviation::Either.disallows(direction));
                assert!(!Deviation::Low.disallows(direction));
            }
            other => panic!("expected a deviation, got {other:?}"),
        }
    }

    #[test]
    fn detects_low_deviation() {
        let experiment = [0.1, 0.2, 0.3, 0.4, 0.5];
        let control = [10.1, 10.2, 10.3, 10.4, 10.5];
        match compare(&experiment, &control, DEFAULT_SIGNIFICANCE_LEVEL) {
            ComparisonOutcome::Deviation { direction, .. } => {
                assert_eq!(direction, DeviationDirection::Low);
                assert!(Deviation::Low.disallows(direction));
                assert!(!Deviation::High.disallows(direction));
            }
            other => panic!("expected a deviation, got {other:?}"),
        }
    }

    #[test]
    fn detects_deviation_with_ties() {
        let experiment = [0.1, 0.2, 5.3, 0.2, 0.5];
        let control = [0.1, 0.1, 0.1, 0.1, 0.1];
        match compare(&experiment, &control, DEFAULT_SIGNIFICANCE_LEVEL) {
            ComparisonOutcome::Deviation { direction, .. } => {
                assert_eq!(direction, DeviationDirection::High);
            }
            other => panic!("expected a deviation, got {other:?}"),
        }
    }

    #[test]
    fn small_samples_report_insufficient_data() {
        let outcome = compare(&[1.0], &[1.0, 2.0, 3.0], DEFAULT_SIGNIFICANCE_LEVEL);
        assert!(matches!(outcome, ComparisonOutcome::InsufficientData));
        let outcome = compare(&[1.0, 2.0], &[], DEFAULT_SIGNIFICANCE_LEVEL);
        assert!(matches!(outcome, ComparisonOutcome::InsufficientData));
    }
}
