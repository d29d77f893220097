//! Adaptive output precision.
//!
//! A tick's printed precision follows the spread (max - min) of the readings
//! it averaged, so a noisy channel never prints digits it cannot back up.

use serde::{Deserialize, Serialize};

/// One row of the precision table: spreads strictly below `below_spread`
/// print with `decimals` digits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrecisionStep {
    /// Exclusive upper bound on the spread.
    pub below_spread: f64,
    /// Decimal digits to print.
    pub decimals: usize,
}

/// Ordered thresholds mapping spread to decimal digits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionTable {
    steps: Vec<PrecisionStep>,
    fallback_decimals: usize,
}

impl Default for PrecisionTable {
    fn default() -> Self {
        let step = |below_spread, decimals| PrecisionStep {
            below_spread,
            decimals,
        };
        Self {
            steps: vec![
                step(1e-6, 8),
                step(1e-5, 7),
                step(1e-4, 6),
                step(1e-3, 5),
                step(1e-2, 4),
            ],
            fallback_decimals: 3,
        }
    }
}

impl PrecisionTable {
    /// Build a table, checking thresholds are positive and strictly increasing.
    pub fn new(steps: Vec<PrecisionStep>, fallback_decimals: usize) -> Result<Self, String> {
        let mut previous = 0.0;
        for step in &steps {
            if !step.below_spread.is_finite() || step.below_spread <= previous {
                return Err(format!(
                    "precision thresholds must be positive and strictly increasing (got {} after {})",
                    step.below_spread, previous
                ));
            }
            previous = step.below_spread;
        }
        Ok(Self {
            steps,
            fallback_decimals,
        })
    }

    /// Decimal digits for a given spread.
    pub fn decimals_for(&self, spread: f64) -> usize {
        self.steps
            .iter()
            .find(|step| spread < step.below_spread)
            .map_or(self.fallback_decimals, |step| step.decimals)
    }

    /// The thresholds in order.
    pub fn steps(&self) -> &[PrecisionStep] {
        &self.steps
    }

    /// Digits used when no threshold matches.
    pub fn fallback_decimals(&self) -> usize {
        self.fallback_decimals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let table = PrecisionTable::default();
        assert_eq!(table.decimals_for(0.0), 8);
        assert_eq!(table.decimals_for(5e-7), 8);
        assert_eq!(table.decimals_for(1e-6), 7);
        assert_eq!(table.decimals_for(5e-5), 6);
        assert_eq!(table.decimals_for(5e-4), 5);
        assert_eq!(table.decimals_for(5e-3), 4);
        assert_eq!(table.decimals_for(0.01), 3);
        assert_eq!(table.decimals_for(12.0), 3);
    }

    #[test]
    fn test_custom_table() {
        let table = PrecisionTable::new(
            vec![PrecisionStep {
                below_spread: 0.5,
                decimals: 1,
            }],
            0,
        )
        .unwrap();
        assert_eq!(table.decimals_for(0.1), 1);
        assert_eq!(table.decimals_for(0.7), 0);
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let step = |below_spread| PrecisionStep {
            below_spread,
            decimals: 2,
        };
        assert!(PrecisionTable::new(vec![step(1e-3), step(1e-4)], 3).is_err());
        assert!(PrecisionTable::new(vec![step(0.0)], 3).is_err());
        assert!(PrecisionTable::new(vec![step(f64::NAN)], 3).is_err());
    }
}
