//! Quality Gate.
//!
//! `score = valid / total`. With `accept >= reject`:
//!
//! | score | decision |
//! |---|---|
//! | `score >= accept` | [`GateDecision::Accepted`]: load every valid record |
//! | `reject < score < accept` | [`GateDecision::Partial`]: load the valid subset |
//! | `score <= reject` | [`GateDecision::Rejected`]: load nothing |
//!
//! Both boundaries are inclusive: a score equal to `accept` is accepted, one
//! equal to `reject` is rejected. When the thresholds coincide, acceptance
//! wins.

use crate::config::EtlConfig;
use crate::error::{EtlError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateDecision {
    Accepted,
    Partial,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    accept_threshold: f64,
    reject_threshold: f64,
}

impl QualityGate {
    /// # Errors
    /// [`EtlError::Config`] unless both thresholds are in `[0, 1]` and
    /// `accept >= reject`.
    pub fn new(accept_threshold: f64, reject_threshold: f64) -> Result<Self> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(accept_threshold) || !in_unit(reject_threshold) {
            return Err(EtlError::Config(format!(
                "gate thresholds must be within [0, 1] (accept {accept_threshold}, reject {reject_threshold})"
            )));
        }
        if accept_threshold < reject_threshold {
            return Err(EtlError::Config(format!(
                "accept_threshold {accept_threshold} is below reject_threshold {reject_threshold}"
            )));
        }
        Ok(Self {
            accept_threshold,
            reject_threshold,
        })
    }

    pub fn from_config(config: &EtlConfig) -> Result<Self> {
        Self::new(config.accept_threshold, config.reject_threshold)
    }

    pub fn accept_threshold(&self) -> f64 {
        self.accept_threshold
    }

    pub fn reject_threshold(&self) -> f64 {
        self.reject_threshold
    }

    /// Fraction of valid records. An empty batch scores 1.0.
    pub fn score(valid: usize, total: usize) -> f64 {
        if total == 0 {
            1.0
        } else {
            valid.min(total) as f64 / total as f64
        }
    }

    pub fn decide(&self, score: f64) -> GateDecision {
        if score >= self.accept_threshold {
            GateDecision::Accepted
        } else if score <= self.reject_threshold {
            GateDecision::Rejected
        } else {
            GateDecision::Partial
        }
    }

    pub fn evaluate(&self, valid: usize, total: usize) -> (f64, GateDecision) {
        let score = Self::score(valid, total);
        (score, self.decide(score))
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            accept_threshold: 0.95,
            reject_threshold: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_exact_ratio() {
        assert_eq!(QualityGate::score(8, 10), 0.8);
        assert_eq!(QualityGate::score(0, 3), 0.0);
        assert_eq!(QualityGate::score(0, 0), 1.0);
    }

    #[test]
    fn boundaries_are_inclusive() {
        let gate = QualityGate::new(0.9, 0.5).unwrap();
        assert_eq!(gate.decide(0.9), GateDecision::Accepted);
        assert_eq!(gate.decide(0.5), GateDecision::Rejected);
        assert_eq!(gate.decide(0.89), GateDecision::Partial);
        assert_eq!(gate.decide(0.51), GateDecision::Partial);
    }

    #[test]
    fn equal_thresholds_prefer_acceptance() {
        let gate = QualityGate::new(0.7, 0.7).unwrap();
        assert_eq!(gate.decide(0.7), GateDecision::Accepted);
        assert_eq!(gate.decide(0.69), GateDecision::Rejected);
    }

    #[test]
    fn invalid_thresholds_are_config_errors() {
        assert!(matches!(QualityGate::new(0.4, 0.6), Err(EtlError::Config(_))));
        assert!(QualityGate::new(1.5, 0.1).is_err());
    }
}
