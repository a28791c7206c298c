//! Divergences between the normalized integrand and the flow density.
//!
//! The integrand is a constant with respect to the flow parameters, so a
//! loss only needs to report how strongly each sample's `log q` should be
//! pushed. The flow turns these coefficients into a parameter gradient.

use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Divergence {
    /// `KL(p || q)` with `p = f / I`.
    #[default]
    KullbackLeibler,
    /// Relative variance of the importance weights, the Pearson chi-square
    /// divergence between `p` and `q`.
    Variance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput {
    pub loss: f64,
    /// Gradient of the loss is `sum_i coefficients[i] * d log q(x_i)`.
    pub coefficients: Vec<f64>,
    /// Batch estimate of the integral.
    pub integral: f64,
    pub std_error: f64,
    /// Samples that entered the loss.
    pub n_used: usize,
    /// Samples with a non-finite integrand value or density.
    pub n_nonfinite: usize,
    /// Negative integrand values clamped to zero.
    pub n_domain: usize,
}

impl Divergence {
    pub fn compute(&self, samples: &Batch, log_prob: &[f64], values: &[f64]) -> Result<LossOutput> {
        let n = samples.len();
        if log_prob.len() != n {
            return Err(FlowError::Shape {
                what: "log densities",
                expected: n,
                found: log_prob.len(),
            });
        }
        if values.len() != n {
            return Err(FlowError::Shape {
                what: "integrand values",
                expected: n,
                found: values.len(),
            });
        }

        let mut n_nonfinite = 0;
        let mut n_domain = 0;
        // Importance weight f / q per usable sample, `None` for excluded ones.
        let weights: Vec<Option<f64>> = values
            .iter()
            .zip(log_prob)
            .map(|(&f, &log_q)| {
                let weight = f * (-log_q).exp();
                if !f.is_finite() || !log_q.is_finite() || !weight.is_finite() {
                    n_nonfinite += 1;
                    return None;
                }
                if f < 0. && *self == Divergence::KullbackLeibler {
                    n_domain += 1;
                    return Some(0.);
                }
                Some(weight)
            })
            .collect();

        let used: Vec<f64> = weights.iter().flatten().copied().collect();
        let n_used = used.len();
        if n_used == 0 {
            return Ok(LossOutput {
                loss: f64::NAN,
                coefficients: vec![0.; n],
                integral: f64::NAN,
                std_error: f64::NAN,
                n_used,
                n_nonfinite,
                n_domain,
            });
        }

        let count = n_used as f64;
        let integral = used.iter().sum::<f64>() / count;
        let std_error = if n_used > 1 {
            let variance =
                used.iter().map(|w| (w - integral).powi(2)).sum::<f64>() / (count - 1.);
            (variance / count).sqrt()
        } else {
            f64::INFINITY
        };

        let norm = match self {
            Divergence::KullbackLeibler => integral,
            Divergence::Variance => integral.abs(),
        };
        if !(norm > 0.) {
            return Ok(LossOutput {
                loss: 0.,
                coefficients: vec![0.; n],
                integral,
                std_error,
                n_used,
                n_nonfinite,
                n_domain,
            });
        }

        let (loss, coefficients) = match self {
            Divergence::KullbackLeibler => {
                let loss = weights
                    .iter()
                    .flatten()
                    .map(|w| w / norm)
                    // ln p - ln q = ln(f / (I q))
                    .map(|ratio| if ratio == 0. { 0. } else { ratio * ratio.ln() })
                    .sum::<f64>()
                    / count;
                let coefficients = weights
                    .iter()
                    .map(|w| w.map_or(0., |w| -(w / norm - 1.) / count))
                    .collect();
                (loss, coefficients)
            }
            Divergence::Variance => {
                let second_moment =
                    used.iter().map(|w| (w / norm).powi(2)).sum::<f64>() / count;
                let coefficients = weights
                    .iter()
                    .map(|w| w.map_or(0., |w| -((w / norm).powi(2) - second_moment) / count))
                    .collect();
                (second_moment - 1., coefficients)
            }
        };

        Ok(LossOutput {
            loss,
            coefficients,
            integral,
            std_error,
            n_used,
            n_nonfinite,
            n_domain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn points(n: usize) -> Batch {
        Batch::from_vec(1, (0..n).map(|i| (i as f64 + 0.5) / n as f64).collect()).unwrap()
    }

    #[test]
    fn constant_integrand_on_uniform_flow() {
        let samples = points(8);
        let log_prob = vec![0.; 8];
        let values = vec![3.; 8];
        for divergence in [Divergence::KullbackLeibler, Divergence::Variance] {
            let out = divergence.compute(&samples, &log_prob, &values).unwrap();
            assert_eq!(out.coefficients, vec![0.; 8]);
            assert_abs_diff_eq!(out.loss, 0., epsilon = 1e-12);
            assert_abs_diff_eq!(out.integral, 3.);
            assert_eq!(out.std_error, 0.);
            assert_eq!(out.n_used, 8);
        }
    }

    #[test]
    fn kl_matches_definition() {
        let samples = points(4);
        let log_prob = vec![0.1, -0.2, 0.3, -0.4];
        let values = vec![0.5, 2., 1., 0.];
        let out = Divergence::KullbackLeibler
            .compute(&samples, &log_prob, &values)
            .unwrap();

        let weights: Vec<f64> = values
            .iter()
            .zip(&log_prob)
            .map(|(f, lq)| f * (-lq).exp())
            .collect();
        let integral = weights.iter().sum::<f64>() / 4.;
        let expected: f64 = kl_terms(&weights, &values, &log_prob, integral) / 4.;
        assert_abs_diff_eq!(out.integral, integral, epsilon = 1e-12);
        assert_abs_diff_eq!(out.loss, expected, epsilon = 1e-12);
        assert!(out.loss >= 0.);
        assert_abs_diff_eq!(out.coefficients.iter().sum::<f64>(), 0., epsilon = 1e-12);
    }

    fn kl_terms(weights: &[f64], values: &[f64], log_prob: &[f64], integral: f64) -> f64 {
        weights
            .iter()
            .zip(values)
            .zip(log_prob)
            .map(|((w, f), lq)| {
                if *f == 0. {
                    0.
                } else {
                    w / integral * ((f / integral).ln() - lq)
                }
            })
            .sum()
    }

    #[test]
    fn variance_is_relative_variance() {
        let samples = points(2);
        let out = Divergence::Variance
            .compute(&samples, &[0., 0.], &[1., 3.])
            .unwrap();
        // ratios 0.5 and 1.5
        assert_abs_diff_eq!(out.loss, 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(out.coefficients[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(out.coefficients[1], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn excludes_nonfinite_and_clamps_negative() {
        let samples = points(4);
        let log_prob = vec![0., f64::NEG_INFINITY, 0., 0.];
        let values = vec![f64::NAN, 1., -1., 2.];
        let out = Divergence::KullbackLeibler
            .compute(&samples, &log_prob, &values)
            .unwrap();
        assert_eq!(out.n_nonfinite, 2);
        assert_eq!(out.n_domain, 1);
        assert_eq!(out.n_used, 2);
        assert_abs_diff_eq!(out.integral, 1.);
        assert_eq!(out.coefficients[0], 0.);
        assert_eq!(out.coefficients[1], 0.);
        assert!(out.loss.is_finite());
    }

    #[test]
    fn empty_and_massless_batches() {
        let samples = points(2);
        let out = Divergence::KullbackLeibler
            .compute(&samples, &[0., 0.], &[f64::NAN, f64::INFINITY])
            .unwrap();
        assert_eq!(out.n_used, 0);
        assert!(out.integral.is_nan());

        let out = Divergence::KullbackLeibler
            .compute(&samples, &[0., 0.], &[0., -1.])
            .unwrap();
        assert_eq!(out.loss, 0.);
        assert_eq!(out.coefficients, vec![0., 0.]);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let samples = points(3);
        assert!(matches!(
            Divergence::Variance.compute(&samples, &[0.; 2], &[1.; 3]),
            Err(FlowError::Shape { .. })
        ));
        assert!(matches!(
            Divergence::Variance.compute(&samples, &[0.; 3], &[1.; 4]),
            Err(FlowError::Shape { .. })
        ));
    }
}
