//! Adam optimizer for the flow parameters.
//!
//! Moment estimates are kept per coupling layer, in the same flat layout
//! as the layer parameters. Gradients are clipped by their global norm
//! before the moments are updated.

use std::f64::consts::PI;

use itertools::izip;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::flow::FlowGradient;

/// Learning rate schedule, evaluated at the zero based optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRate {
    Constant(f64),
    /// `initial * decay_rate^(step / decay_steps)`
    ExponentialDecay {
        initial: f64,
        decay_steps: u64,
        decay_rate: f64,
    },
    /// Half a cosine period from `base` down to `eta_min` over
    /// `total_steps`, constant at `eta_min` afterwards.
    CosineAnnealing {
        base: f64,
        total_steps: u64,
        eta_min: f64,
    },
}

impl Default for LearningRate {
    fn default() -> Self {
        LearningRate::Constant(1e-3)
    }
}

impl LearningRate {
    pub fn rate(&self, step: u64) -> f64 {
        match *self {
            LearningRate::Constant(lr) => lr,
            LearningRate::ExponentialDecay {
                initial,
                decay_steps,
                decay_rate,
            } => initial * decay_rate.powf(step as f64 / decay_steps as f64),
            LearningRate::CosineAnnealing {
                base,
                total_steps,
                eta_min,
            } => {
                let progress = (step as f64 / total_steps as f64).min(1.);
                eta_min + (base - eta_min) * (1. + (PI * progress).cos()) / 2.
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let ok = match *self {
            LearningRate::Constant(lr) => lr.is_finite() && lr > 0.,
            LearningRate::ExponentialDecay {
                initial,
                decay_steps,
                decay_rate,
            } => initial > 0. && decay_steps > 0 && decay_rate > 0. && decay_rate.is_finite(),
            LearningRate::CosineAnnealing {
                base,
                total_steps,
                eta_min,
            } => base > 0. && total_steps > 0 && (0. ..=base).contains(&eta_min),
        };
        if !ok {
            return Err(FlowError::InvalidSettings(format!(
                "invalid learning rate schedule {self:?}"
            )));
        }
        Ok(())
    }
}

/// Settings for the Adam optimizer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamOptions {
    /// First moment decay rate (default: 0.9)
    pub beta1: f64,
    /// Second moment decay rate (default: 0.999)
    pub beta2: f64,
    /// Small constant for numerical stability (default: 1e-8)
    pub epsilon: f64,
    pub learning_rate: LearningRate,
    /// Rescale gradients whose global norm exceeds this value (default: 5)
    pub clip_norm: Option<f64>,
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            learning_rate: LearningRate::default(),
            clip_norm: Some(5.),
        }
    }
}

impl AdamOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0. ..1.).contains(&self.beta1) || !(0. ..1.).contains(&self.beta2) {
            return Err(FlowError::InvalidSettings(
                "adam decay rates must lie in [0, 1)".into(),
            ));
        }
        if !(self.epsilon > 0.) {
            return Err(FlowError::InvalidSettings("adam epsilon must be positive".into()));
        }
        if let Some(clip) = self.clip_norm {
            if !(clip > 0.) {
                return Err(FlowError::InvalidSettings(
                    "gradient clip norm must be positive".into(),
                ));
            }
        }
        self.learning_rate.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    /// First moment estimate
    m: Vec<Vec<f64>>,
    /// Second moment estimate
    v: Vec<Vec<f64>>,
    /// Iteration counter
    t: u64,
    settings: AdamOptions,
}

impl Adam {
    pub fn new(settings: AdamOptions) -> Self {
        Self {
            m: vec![],
            v: vec![],
            t: 0,
            settings,
        }
    }

    pub fn settings(&self) -> &AdamOptions {
        &self.settings
    }

    /// Number of updates applied so far.
    pub fn num_steps(&self) -> u64 {
        self.t
    }

    /// Learning rate of the next update.
    pub fn current_learning_rate(&self) -> f64 {
        self.settings.learning_rate.rate(self.t)
    }

    /// Apply one descent step to `params`, one slice per layer.
    ///
    /// Returns the learning rate that was used.
    pub fn update<'a>(
        &mut self,
        params: impl Iterator<Item = &'a mut [f64]>,
        gradient: &FlowGradient,
    ) -> Result<f64> {
        let layers = gradient.layers();
        if self.m.is_empty() {
            self.m = layers.iter().map(|g| vec![0f64; g.len()]).collect();
            self.v = self.m.clone();
        }
        if self.m.len() != layers.len() {
            return Err(FlowError::Shape {
                what: "optimizer state layers",
                expected: self.m.len(),
                found: layers.len(),
            });
        }

        let params: Vec<&mut [f64]> = params.collect();
        if params.len() != layers.len() {
            return Err(FlowError::Shape {
                what: "parameter layers",
                expected: layers.len(),
                found: params.len(),
            });
        }
        for (params, grad, m) in izip!(&params, layers, &self.m) {
            if params.len() != grad.len() || m.len() != grad.len() {
                return Err(FlowError::Shape {
                    what: "layer parameters",
                    expected: m.len(),
                    found: grad.len(),
                });
            }
        }

        let norm = gradient.norm();
        let scale = match self.settings.clip_norm {
            Some(clip) if norm > clip => clip / norm,
            _ => 1.,
        };

        let lr = self.current_learning_rate();
        self.t += 1;
        let AdamOptions {
            beta1,
            beta2,
            epsilon,
            ..
        } = self.settings;
        let bias1 = 1. - beta1.powi(self.t as i32);
        let bias2 = 1. - beta2.powi(self.t as i32);

        for (params, grad, m, v) in izip!(params, layers, &mut self.m, &mut self.v) {
            for (p, &g, m, v) in izip!(params.iter_mut(), grad, m.iter_mut(), v.iter_mut()) {
                let g = g * scale;
                *m = beta1 * *m + (1. - beta1) * g;
                *v = beta2 * *v + (1. - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            }
        }
        Ok(lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn schedules() {
        assert_eq!(LearningRate::Constant(0.1).rate(1000), 0.1);

        let decay = LearningRate::ExponentialDecay {
            initial: 1e-3,
            decay_steps: 100,
            decay_rate: 0.96,
        };
        assert_abs_diff_eq!(decay.rate(0), 1e-3);
        assert_abs_diff_eq!(decay.rate(100), 0.96e-3, epsilon = 1e-15);
        assert_abs_diff_eq!(decay.rate(50), 1e-3 * 0.96f64.sqrt(), epsilon = 1e-15);

        let cosine = LearningRate::CosineAnnealing {
            base: 1.,
            total_steps: 10,
            eta_min: 0.1,
        };
        assert_abs_diff_eq!(cosine.rate(0), 1.);
        assert_abs_diff_eq!(cosine.rate(5), 0.55, epsilon = 1e-12);
        assert_abs_diff_eq!(cosine.rate(10), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(cosine.rate(20), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn rejects_bad_options() {
        assert!(AdamOptions::default().validate().is_ok());
        let bad = AdamOptions {
            beta1: 1.,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = AdamOptions {
            learning_rate: LearningRate::Constant(-1.),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = AdamOptions {
            clip_norm: Some(0.),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(AdamOptions {
            learning_rate: LearningRate::Constant(0.1),
            clip_norm: None,
            ..Default::default()
        });
        let mut params = vec![vec![1., 2.], vec![3.]];
        let gradient = FlowGradient::from_layers(vec![vec![0.5, -2.], vec![0.]]);
        let lr = adam.update(params.iter_mut().map(|p| p.as_mut_slice()), &gradient).unwrap();
        assert_eq!(lr, 0.1);
        assert_eq!(adam.num_steps(), 1);
        assert_abs_diff_eq!(params[0][0], 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(params[0][1], 2.1, epsilon = 1e-6);
        assert_eq!(params[1][0], 3.);
    }

    #[test]
    fn minimizes_quadratic() {
        let mut adam = Adam::new(AdamOptions {
            learning_rate: LearningRate::Constant(0.05),
            ..Default::default()
        });
        let target = [0.7, -1.3, 2.5];
        let mut params = vec![vec![0f64; 3]];
        for _ in 0..2000 {
            let grad = params[0].iter().zip(target).map(|(p, t)| 2. * (p - t)).collect();
            let gradient = FlowGradient::from_layers(vec![grad]);
            adam.update(params.iter_mut().map(|p| p.as_mut_slice()), &gradient)
                .unwrap();
        }
        for (p, t) in params[0].iter().zip(target) {
            assert_abs_diff_eq!(*p, t, epsilon = 1e-3);
        }
    }

    #[test]
    fn clipping_bounds_large_gradients() {
        let options = AdamOptions {
            learning_rate: LearningRate::Constant(1.),
            clip_norm: Some(1.),
            ..Default::default()
        };
        let mut clipped = Adam::new(options);
        let mut params = vec![vec![0f64, 0.]];
        let gradient = FlowGradient::from_layers(vec![vec![3e6, 4e6]]);
        clipped
            .update(params.iter_mut().map(|p| p.as_mut_slice()), &gradient)
            .unwrap();
        assert!(params[0].iter().all(|p| p.is_finite() && p.abs() <= 1. + 1e-6));
    }

    #[test]
    fn rejects_mismatched_layers() {
        let mut adam = Adam::new(AdamOptions::default());
        let mut params = vec![vec![0f64; 2]];
        let gradient = FlowGradient::from_layers(vec![vec![1., 1., 1.]]);
        assert!(adam
            .update(params.iter_mut().map(|p| p.as_mut_slice()), &gradient)
            .is_err());
    }
}
