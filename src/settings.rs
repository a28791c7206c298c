//! Configuration of the flow, the training loop and the final integration.
//!
//! All structs deserialize with defaults for missing fields, so a host can
//! load partial configuration files.

use serde::{Deserialize, Serialize};

use crate::conditioner::ConditionerOptions;
use crate::coupling::MaskScheme;
use crate::error::{FlowError, Result};
use crate::loss::Divergence;
use crate::optimizer::AdamOptions;
use crate::spline::SplineOptions;

/// Architecture of a [`FlowModel`](crate::FlowModel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    /// Dimension of the integration space
    pub dim: usize,
    /// Number of coupling layers. Defaults to the number of masks of the
    /// partition scheme.
    pub num_layers: Option<usize>,
    pub masks: MaskScheme,
    pub spline: SplineOptions,
    pub conditioner: ConditionerOptions,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            dim: 2,
            num_layers: None,
            masks: MaskScheme::default(),
            spline: SplineOptions::default(),
            conditioner: ConditionerOptions::default(),
        }
    }
}

impl FlowSettings {
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(FlowError::InvalidSettings(
                "the integration space needs at least one dimension".into(),
            ));
        }
        self.spline.validate()?;
        self.conditioner.validate()?;
        self.masks.masks(self.dim, self.num_layers)?;
        Ok(())
    }
}

/// Settings of a [`Trainer`](crate::Trainer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSettings {
    /// Number of integrand evaluations per training step
    pub batch_size: usize,
    pub divergence: Divergence,
    pub adam: AdamOptions,
    /// Consecutive bad steps before the trainer gives up
    pub max_consecutive_failures: u64,
    /// Number of recent steps compared against the earlier best loss
    pub plateau_window: usize,
    /// Window of the moving average of the integral estimates
    pub ewma_window: usize,
    /// Save a checkpoint every this many steps, if a path is configured
    pub checkpoint_every: Option<u64>,
    /// Also write the parameters with the lowest batch loss seen by this
    /// trainer next to the checkpoint, see [`Checkpoint::best_path`](crate::Checkpoint::best_path).
    pub keep_best: bool,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            divergence: Divergence::default(),
            adam: AdamOptions::default(),
            max_consecutive_failures: 10,
            plateau_window: 50,
            ewma_window: 10,
            checkpoint_every: None,
            keep_best: false,
        }
    }
}

impl TrainSettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size < 2 {
            return Err(FlowError::InvalidSettings(
                "training batches need at least two points".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(FlowError::InvalidSettings(
                "max_consecutive_failures must be positive".into(),
            ));
        }
        if self.plateau_window == 0 || self.ewma_window == 0 {
            return Err(FlowError::InvalidSettings(
                "diagnostic windows must be positive".into(),
            ));
        }
        if self.checkpoint_every == Some(0) {
            return Err(FlowError::InvalidSettings(
                "checkpoint_every must be positive".into(),
            ));
        }
        self.adam.validate()
    }
}

/// Settings of the final integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    /// Total number of points
    pub n_samples: usize,
    /// The points are drawn and evaluated in this many batches
    pub n_batches: usize,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            n_samples: 10000,
            n_batches: 10,
        }
    }
}

impl IntegrationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.n_batches == 0 || self.n_samples < self.n_batches {
            return Err(FlowError::InvalidSettings(format!(
                "can not split {} samples into {} batches",
                self.n_samples, self.n_batches
            )));
        }
        Ok(())
    }

    /// Size of every batch; the remainder goes to the first batches.
    pub fn batch_sizes(&self) -> impl Iterator<Item = usize> {
        let base = self.n_samples / self.n_batches;
        let extra = self.n_samples % self.n_batches;
        (0..self.n_batches).map(move |i| base + usize::from(i < extra))
    }
}
