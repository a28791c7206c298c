//! Importance sampling estimates with a trained flow.
//!
//! Every point `x ~ q` contributes the weight `w = f(x) / q(x)`, whose mean
//! is an unbiased estimate of the integral of `f` over the unit hypercube.

use std::ops::ControlFlow;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FlowError, Result};
use crate::flow::FlowModel;
use crate::integrand::{Integrand, IntegrandError};
use crate::settings::IntegrationSettings;
use crate::Batch;

/// Streaming mean and variance of importance weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningEstimate {
    count: u64,
    mean: f64,
    /// Sum of squared deviations from the mean
    m2: f64,
    sum: f64,
    sum_sq: f64,
    max_weight: f64,
    excluded: u64,
}

impl RunningEstimate {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn excluded(&self) -> u64 {
        self.excluded
    }

    /// Add one weight. Non-finite weights are only counted.
    pub fn add(&mut self, weight: f64) {
        if !weight.is_finite() {
            self.excluded += 1;
            return;
        }
        self.count += 1;
        let delta = weight - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (weight - self.mean);
        self.sum += weight;
        self.sum_sq += weight * weight;
        self.max_weight = self.max_weight.max(weight.abs());
    }

    /// Add the weights `f / q` of a batch.
    pub fn add_batch(&mut self, values: &[f64], log_prob: &[f64]) {
        assert!(values.len() == log_prob.len());
        values
            .iter()
            .zip(log_prob)
            .for_each(|(f, log_q)| self.add(importance_weight(*f, *log_q)));
    }

    /// Record points whose weights are unknown.
    pub fn exclude(&mut self, count: u64) {
        self.excluded += count;
    }

    /// Combine with the accumulator of a disjoint set of weights.
    pub fn merge(&mut self, other: &RunningEstimate) {
        if other.count > 0 {
            let count = self.count + other.count;
            let delta = other.mean - self.mean;
            self.mean += delta * other.count as f64 / count as f64;
            self.m2 +=
                other.m2 + delta * delta * self.count as f64 * other.count as f64 / count as f64;
            self.count = count;
            self.sum += other.sum;
            self.sum_sq += other.sum_sq;
            self.max_weight = self.max_weight.max(other.max_weight);
        }
        self.excluded += other.excluded;
    }

    pub fn finalize(&self) -> Estimate {
        let n = self.count as f64;
        let mean = if self.count > 0 { self.mean } else { f64::NAN };
        let variance = if self.count > 1 {
            self.m2 / n / (n - 1.)
        } else {
            f64::INFINITY
        };
        let std_error = variance.sqrt();
        let weight_ess = if self.sum_sq > 0. {
            self.sum * self.sum / self.sum_sq
        } else {
            0.
        };
        let unweighting_efficiency = if self.max_weight > 0. {
            mean.abs() / self.max_weight
        } else {
            0.
        };
        Estimate {
            mean,
            variance,
            std_error,
            relative_error: std_error / mean.abs(),
            effective_sample_size: self.count,
            samples_drawn: self.count + self.excluded,
            n_excluded: self.excluded,
            weight_ess,
            max_weight: self.max_weight,
            unweighting_efficiency,
        }
    }
}

fn importance_weight(value: f64, log_prob: f64) -> f64 {
    if !value.is_finite() || !log_prob.is_finite() {
        return f64::NAN;
    }
    value * (-log_prob).exp()
}

/// Result of an importance sampling integration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub mean: f64,
    /// Variance of the mean
    pub variance: f64,
    pub std_error: f64,
    pub relative_error: f64,
    /// Number of points with a finite weight
    pub effective_sample_size: u64,
    pub samples_drawn: u64,
    /// Points excluded because of a non-finite weight or a failed batch
    pub n_excluded: u64,
    /// Kish effective sample size `(sum w)^2 / sum w^2`
    pub weight_ess: f64,
    pub max_weight: f64,
    /// Expected acceptance rate of hit-or-miss unweighting, `mean / max w`
    pub unweighting_efficiency: f64,
}

impl Estimate {
    fn is_usable(&self) -> bool {
        self.effective_sample_size > 0 && self.mean.is_finite() && self.std_error.is_finite()
    }
}

pub struct Integrator<'a> {
    flow: &'a FlowModel,
}

impl<'a> Integrator<'a> {
    pub fn new(flow: &'a FlowModel) -> Self {
        Self { flow }
    }

    pub fn flow(&self) -> &FlowModel {
        self.flow
    }

    /// Draw `n` points and return them with their importance weights.
    ///
    /// Points with a non-finite integrand value or density get a `NaN`
    /// weight.
    pub fn weights<I, R>(&self, n: usize, integrand: &mut I, rng: &mut R) -> Result<(Batch, Vec<f64>)>
    where
        I: Integrand + ?Sized,
        R: Rng + ?Sized,
    {
        self.check_dim(integrand)?;
        let (points, log_prob) = self.flow.sample(n, rng);
        let values = integrand
            .evaluate(&points)
            .map_err(|err| FlowError::Integrand(Box::new(err)))?;
        check_values(&values, n)?;
        let weights = values
            .iter()
            .zip(&log_prob)
            .map(|(f, log_q)| importance_weight(*f, *log_q))
            .collect();
        Ok((points, weights))
    }

    /// Evaluate one batch of `n` points into `running`.
    ///
    /// A recoverable integrand error excludes the whole batch.
    pub fn accumulate<I, R>(
        &self,
        running: &mut RunningEstimate,
        n: usize,
        integrand: &mut I,
        rng: &mut R,
    ) -> Result<()>
    where
        I: Integrand + ?Sized,
        R: Rng + ?Sized,
    {
        self.check_dim(integrand)?;
        let (points, log_prob) = self.flow.sample(n, rng);
        match integrand.evaluate(&points) {
            Ok(values) => {
                check_values(&values, n)?;
                running.add_batch(&values, &log_prob);
                Ok(())
            }
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, points = n, "integrand failed, discarding batch");
                running.exclude(n as u64);
                Ok(())
            }
            Err(err) => Err(FlowError::Integrand(Box::new(err))),
        }
    }

    pub fn estimate<I, R>(
        &self,
        integrand: &mut I,
        n_samples: usize,
        n_batches: usize,
        rng: &mut R,
    ) -> Result<Estimate>
    where
        I: Integrand + ?Sized,
        R: Rng + ?Sized,
    {
        self.estimate_with(integrand, n_samples, n_batches, rng, |_, _| {
            ControlFlow::Continue(())
        })
    }

    pub fn integrate<I, R>(
        &self,
        integrand: &mut I,
        settings: &IntegrationSettings,
        rng: &mut R,
    ) -> Result<Estimate>
    where
        I: Integrand + ?Sized,
        R: Rng + ?Sized,
    {
        self.estimate(integrand, settings.n_samples, settings.n_batches, rng)
    }

    /// Like [`Integrator::estimate`], calling `callback` with the batch index
    /// and the running estimate after every batch. `Break` stops early and
    /// returns the estimate so far.
    pub fn estimate_with<I, R, F>(
        &self,
        integrand: &mut I,
        n_samples: usize,
        n_batches: usize,
        rng: &mut R,
        mut callback: F,
    ) -> Result<Estimate>
    where
        I: Integrand + ?Sized,
        R: Rng + ?Sized,
        F: FnMut(usize, &Estimate) -> ControlFlow<()>,
    {
        let settings = IntegrationSettings {
            n_samples,
            n_batches,
        };
        settings.validate()?;
        let mut running = RunningEstimate::default();
        for (batch, size) in settings.batch_sizes().enumerate() {
            self.accumulate(&mut running, size, integrand, rng)?;
            let estimate = running.finalize();
            debug!(
                batch,
                mean = estimate.mean,
                std_error = estimate.std_error,
                "integration batch"
            );
            if callback(batch, &estimate).is_break() {
                info!(batch, "integration stopped by callback");
                break;
            }
        }
        let estimate = running.finalize();
        info!(
            mean = estimate.mean,
            std_error = estimate.std_error,
            excluded = estimate.n_excluded,
            efficiency = estimate.unweighting_efficiency,
            "integration finished"
        );
        Ok(estimate)
    }

    fn check_dim<I: Integrand + ?Sized>(&self, integrand: &I) -> Result<()> {
        if integrand.dim() != self.flow.dim() {
            return Err(FlowError::Shape {
                what: "integrand dimension",
                expected: self.flow.dim(),
                found: integrand.dim(),
            });
        }
        Ok(())
    }
}

fn check_values(values: &[f64], n: usize) -> Result<()> {
    if values.len() != n {
        return Err(FlowError::Shape {
            what: "integrand values",
            expected: n,
            found: values.len(),
        });
    }
    Ok(())
}

/// Inverse variance weighted combination of independent estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCombination {
    pub mean: f64,
    pub std_error: f64,
    /// Weight of every channel, zero for unusable ones
    pub weights: Vec<f64>,
    pub chi2_per_dof: f64,
    /// Number of channels with a non-zero weight
    pub n_used: usize,
}

/// Combine estimates of the same integral.
///
/// Channels without a finite mean and error get weight zero. If some
/// channels have zero variance they share all the weight.
pub fn combine_channels(channels: &[Estimate]) -> Result<ChannelCombination> {
    let usable: Vec<bool> = channels.iter().map(Estimate::is_usable).collect();
    if !usable.iter().any(|&u| u) {
        return Err(FlowError::NoUsableChannel);
    }

    let exact = channels
        .iter()
        .zip(&usable)
        .filter(|(c, &u)| u && c.std_error == 0.)
        .count();
    let weights: Vec<f64> = if exact > 0 {
        channels
            .iter()
            .zip(&usable)
            .map(|(c, &u)| if u && c.std_error == 0. { 1. / exact as f64 } else { 0. })
            .collect()
    } else {
        // Precisions relative to the most precise channel, so that tiny
        // errors do not overflow 1 / sigma^2.
        let sigma_min = channels
            .iter()
            .zip(&usable)
            .filter(|(_, &u)| u)
            .map(|(c, _)| c.std_error)
            .fold(f64::INFINITY, f64::min);
        let precision = |c: &Estimate| (sigma_min / c.std_error).powi(2);
        let total: f64 = channels
            .iter()
            .zip(&usable)
            .filter(|(_, &u)| u)
            .map(|(c, _)| precision(c))
            .sum();
        channels
            .iter()
            .zip(&usable)
            .map(|(c, &u)| if u { precision(c) / total } else { 0. })
            .collect()
    };

    let mean: f64 = channels
        .iter()
        .zip(&weights)
        .filter(|(_, &w)| w > 0.)
        .map(|(c, w)| c.mean * w)
        .sum();
    // With inverse variance weights, 1 / sum(1 / sigma^2) = sigma_c^2 w_c for any channel.
    let std_error = if exact > 0 {
        0.
    } else {
        channels
            .iter()
            .zip(&weights)
            .find(|(_, &w)| w > 0.)
            .map_or(f64::NAN, |(c, &w)| c.std_error * w.sqrt())
    };

    let n_used = weights.iter().filter(|&&w| w > 0.).count();
    let chi2: f64 = channels
        .iter()
        .zip(&usable)
        .filter(|(c, &u)| u && c.std_error > 0.)
        .map(|(c, _)| ((c.mean - mean) / c.std_error).powi(2))
        .sum();
    let dof = usable.iter().filter(|&&u| u).count().saturating_sub(1).max(1);

    Ok(ChannelCombination {
        mean,
        std_error,
        weights,
        chi2_per_dof: chi2 / dof as f64,
        n_used,
    })
}

/// Integrates one integrand with several flows and combines the results.
pub struct MultiChannelIntegrator<'a> {
    channels: Vec<&'a FlowModel>,
}

impl<'a> MultiChannelIntegrator<'a> {
    pub fn new(channels: Vec<&'a FlowModel>) -> Result<Self> {
        let Some(first) = channels.first() else {
            return Err(FlowError::InvalidSettings("no integration channels".into()));
        };
        let dim = first.dim();
        if let Some(other) = channels.iter().find(|flow| flow.dim() != dim) {
            return Err(FlowError::Shape {
                what: "channel dimension",
                expected: dim,
                found: other.dim(),
            });
        }
        Ok(Self { channels })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Estimate the integral with every channel using the same sample
    /// budget, returning the per-channel estimates and their combination.
    pub fn estimate<I, R>(
        &self,
        integrand: &mut I,
        settings: &IntegrationSettings,
        rng: &mut R,
    ) -> Result<(Vec<Estimate>, ChannelCombination)>
    where
        I: Integrand + ?Sized,
        R: Rng + ?Sized,
    {
        let estimates = self
            .channels
            .iter()
            .map(|flow| Integrator::new(flow).integrate(integrand, settings, rng))
            .collect::<Result<Vec<_>>>()?;
        let combination = combine_channels(&estimates)?;
        Ok((estimates, combination))
    }
}
