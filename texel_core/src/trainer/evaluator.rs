//! Snapshot selection from periodic held-out evaluations.

use serde::{Deserialize, Serialize};

/// Rule deciding whether an evaluation beats the best so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvaluationPolicy {
    /// Higher success rate wins; on a tie the error must not get worse.
    #[default]
    #[serde(rename = "MAXSUCCESSRATE_MINERROR")]
    MaxSuccessRateMinError,
    /// Success rate must strictly improve.
    #[serde(rename = "MAXSUCCESSRATE")]
    MaxSuccessRate,
    /// Error must strictly improve.
    #[serde(rename = "MINERROR")]
    MinError,
}

impl EvaluationPolicy {
    pub fn name(self) -> &'static str {
        match self {
            EvaluationPolicy::MaxSuccessRateMinError => "MAXSUCCESSRATE_MINERROR",
            EvaluationPolicy::MaxSuccessRate => "MAXSUCCESSRATE",
            EvaluationPolicy::MinError => "MINERROR",
        }
    }

    fn improves(self, success_rate: f32, error: f32, best_rate: f32, best_error: f32) -> bool {
        match self {
            EvaluationPolicy::MaxSuccessRateMinError => {
                success_rate > best_rate || (success_rate == best_rate && error <= best_error)
            }
            EvaluationPolicy::MaxSuccessRate => success_rate > best_rate,
            EvaluationPolicy::MinError => error < best_error,
        }
    }
}

/// Outcome of one held-out evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// Minibatches completed when the evaluation ran.
    pub minibatch: usize,
    pub success_rate: f32,
    pub error: f32,
    pub best: bool,
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    policy: EvaluationPolicy,
    best_success_rate: f32,
    best_error: f32,
    best_index: Option<usize>,
    history: Vec<EvaluationRecord>,
}

impl Evaluator {
    pub fn new(policy: EvaluationPolicy) -> Self {
        Self {
            policy,
            best_success_rate: f32::NEG_INFINITY,
            best_error: f32::INFINITY,
            best_index: None,
            history: Vec::new(),
        }
    }

    pub fn policy(&self) -> EvaluationPolicy {
        self.policy
    }

    /// Records an evaluation and reports whether it is the new best.
    pub fn consider(&mut self, minibatch: usize, success_rate: f32, error: f32) -> EvaluationRecord {
        let best = self
            .policy
            .improves(success_rate, error, self.best_success_rate, self.best_error);
        if best {
            self.best_success_rate = success_rate;
            self.best_error = error;
            self.best_index = Some(minibatch);
        }
        let record = EvaluationRecord {
            minibatch,
            success_rate,
            error,
            best,
        };
        self.history.push(record);
        record
    }

    pub fn best_success_rate(&self) -> Option<f32> {
        self.best_index.map(|_| self.best_success_rate)
    }

    pub fn best_error(&self) -> Option<f32> {
        self.best_index.map(|_| self.best_error)
    }

    /// Minibatch of the best snapshot.
    pub fn best_index(&self) -> Option<usize> {
        self.best_index
    }

    /// The evaluation that produced the current best snapshot.
    pub fn best_record(&self) -> Option<EvaluationRecord> {
        self.history.iter().rev().find(|record| record.best).copied()
    }

    pub fn history(&self) -> &[EvaluationRecord] {
        &self.history
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bests(policy: EvaluationPolicy, runs: &[(f32, f32)]) -> Vec<bool> {
        let mut evaluator = Evaluator::new(policy);
        runs.iter()
            .enumerate()
            .map(|(index, &(rate, error))| evaluator.consider(index, rate, error).best)
            .collect()
    }

    #[test]
    fn test_increasing_success_is_always_best() {
        let runs = [(0.1, 0.5), (0.2, 0.6), (0.5, 0.7), (0.9, 0.9)];
        assert_eq!(
            bests(EvaluationPolicy::MaxSuccessRateMinError, &runs),
            vec![true; 4]
        );
        assert_eq!(bests(EvaluationPolicy::MaxSuccessRate, &runs), vec![true; 4]);
    }

    #[test]
    fn test_tie_with_better_error() {
        let runs = [(0.5, 0.4), (0.5, 0.3)];
        assert_eq!(
            bests(EvaluationPolicy::MaxSuccessRateMinError, &runs),
            vec![true, true]
        );
        assert_eq!(bests(EvaluationPolicy::MaxSuccessRate, &runs), vec![true, false]);
    }

    #[test]
    fn test_tie_with_equal_error_counts_as_best() {
        let runs = [(0.5, 0.4), (0.5, 0.4), (0.5, 0.41)];
        assert_eq!(
            bests(EvaluationPolicy::MaxSuccessRateMinError, &runs),
            vec![true, true, false]
        );
    }

    #[test]
    fn test_min_error_ignores_success_rate() {
        let runs = [(0.9, 0.4), (0.1, 0.3), (1.0, 0.3)];
        assert_eq!(bests(EvaluationPolicy::MinError, &runs), vec![true, true, false]);
    }

    #[test]
    fn test_best_values_and_reset() {
        let mut evaluator = Evaluator::new(EvaluationPolicy::MaxSuccessRate);
        assert_eq!(evaluator.best_index(), None);
        evaluator.consider(10, 0.5, 0.2);
        evaluator.consider(20, 0.4, 0.1);
        assert_eq!(evaluator.best_index(), Some(10));
        assert_eq!(evaluator.best_success_rate(), Some(0.5));
        assert_eq!(evaluator.history().len(), 2);
        assert_eq!(evaluator.best_record().map(|r| r.minibatch), Some(10));
        evaluator.reset();
        assert_eq!(evaluator.best_error(), None);
        assert!(evaluator.history().is_empty());
        assert_eq!(evaluator.policy(), EvaluationPolicy::MaxSuccessRate);
    }

    #[test]
    fn test_policy_names_round_trip() {
        for policy in [
            EvaluationPolicy::MaxSuccessRateMinError,
            EvaluationPolicy::MaxSuccessRate,
            EvaluationPolicy::MinError,
        ] {
            let json = serde_json::to_string(&policy).unwrap();
            assert_eq!(json, format!("\"{}\"", policy.name()));
        }
    }
}
