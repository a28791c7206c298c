use std::ops::AddAssign;

use itertools::izip;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::batch::Batch;
use crate::coupling::{unseparated_pairs, Bijector, CouplingLayer};
use crate::error::{FlowError, Result};
use crate::math::all_finite;
use crate::settings::FlowSettings;

/// Coupling layers applied one after the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouplingStack {
    dim: usize,
    layers: Vec<CouplingLayer>,
}

impl CouplingStack {
    pub fn new(dim: usize, layers: Vec<CouplingLayer>) -> Result<Self> {
        if let Some(layer) = layers.iter().find(|layer| layer.dim() != dim) {
            return Err(FlowError::Shape {
                what: "coupling layer",
                expected: dim,
                found: layer.dim(),
            });
        }
        Ok(Self { dim, layers })
    }

    pub fn layers(&self) -> &[CouplingLayer] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [CouplingLayer] {
        &mut self.layers
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(|layer| layer.num_params()).sum()
    }

    /// Accumulate the gradient of `grad_log_det * log |det dz/dx|` with
    /// respect to the layer parameters, where `z` is the inverse of `x`.
    ///
    /// The latent point gets no gradient, which holds for the uniform base.
    /// Returns the inverse log-determinant.
    fn inverse_backward(&self, x: &[f64], grad_log_det: f64, gradient: &mut FlowGradient) -> f64 {
        let num_layers = self.layers.len();
        let mut trace = Vec::with_capacity(num_layers);
        let mut current = x.to_vec();
        let mut log_det = 0f64;
        for layer in self.layers.iter().rev() {
            let mut next = vec![0f64; self.dim];
            log_det += layer.inverse(&current, &mut next);
            trace.push(std::mem::replace(&mut current, next));
        }
        if !log_det.is_finite() {
            return log_det;
        }

        let mut grad = vec![0f64; self.dim];
        let mut grad_input = vec![0f64; self.dim];
        // `trace[k]` is the input of the inverse of layer `num_layers - 1 - k`.
        for (l, layer) in self.layers.iter().enumerate() {
            let input = &trace[num_layers - 1 - l];
            layer.inverse_backward(
                input,
                &grad,
                grad_log_det,
                &mut grad_input,
                &mut gradient.layers[l],
            );
            std::mem::swap(&mut grad, &mut grad_input);
        }
        log_det
    }
}

impl Bijector for CouplingStack {
    fn dim(&self) -> usize {
        self.dim
    }

    fn forward(&self, x: &[f64], y: &mut [f64]) -> f64 {
        let mut current = x.to_vec();
        let log_det = self
            .layers
            .iter()
            .map(|layer| {
                let log_det = layer.forward(&current, y);
                current.copy_from_slice(y);
                log_det
            })
            .sum();
        y.copy_from_slice(&current);
        log_det
    }

    fn inverse(&self, y: &[f64], x: &mut [f64]) -> f64 {
        let mut current = y.to_vec();
        let log_det = self
            .layers
            .iter()
            .rev()
            .map(|layer| {
                let log_det = layer.inverse(&current, x);
                current.copy_from_slice(x);
                log_det
            })
            .sum();
        x.copy_from_slice(&current);
        log_det
    }
}

/// Gradient with respect to the parameters of a [`CouplingStack`], one
/// vector per layer.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowGradient {
    layers: Vec<Vec<f64>>,
}

impl FlowGradient {
    pub fn zeros(stack: &CouplingStack) -> Self {
        Self {
            layers: stack
                .layers
                .iter()
                .map(|layer| vec![0f64; layer.num_params()])
                .collect(),
        }
    }

    pub fn from_layers(layers: Vec<Vec<f64>>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[Vec<f64>] {
        &self.layers
    }

    /// Euclidean norm over all layers.
    pub fn norm(&self) -> f64 {
        self.layers
            .iter()
            .flatten()
            .map(|g| g * g)
            .sum::<f64>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.layers.iter().all(|layer| all_finite(layer))
    }
}

impl AddAssign<&FlowGradient> for FlowGradient {
    fn add_assign(&mut self, other: &FlowGradient) {
        assert!(self.layers.len() == other.layers.len());
        izip!(&mut self.layers, &other.layers).for_each(|(a, b)| {
            izip!(a, b).for_each(|(a, b)| *a += b);
        });
    }
}

/// A normalizing flow on the unit hypercube: a uniform base distribution
/// pushed through a coupling stack.
///
/// The density of a point `x = T(z)` is `q(x) = exp(-log |det dT/dz|)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowModel {
    settings: FlowSettings,
    stack: CouplingStack,
}

impl FlowModel {
    /// Build a flow that is the identity map until trained.
    pub fn new<R: Rng + ?Sized>(settings: FlowSettings, rng: &mut R) -> Result<Self> {
        settings.validate()?;
        let masks = settings.masks.masks(settings.dim, settings.num_layers)?;
        let unseparated = unseparated_pairs(&masks);
        if let Some(&(a, b)) = unseparated.first() {
            warn!(
                dim = settings.dim,
                masks = ?settings.masks,
                pairs = unseparated.len(),
                "coordinate {a} is never transformed conditioned on coordinate {b}"
            );
        }
        let layers = masks
            .into_iter()
            .map(|mask| CouplingLayer::new(mask, &settings.conditioner, settings.spline, rng))
            .collect::<Result<Vec<_>>>()?;
        let stack = CouplingStack::new(settings.dim, layers)?;
        Ok(Self { settings, stack })
    }

    /// Check a flow that was deserialized rather than built by [`FlowModel::new`].
    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        if self.stack.dim != self.settings.dim {
            return Err(FlowError::Shape {
                what: "coupling stack",
                expected: self.settings.dim,
                found: self.stack.dim,
            });
        }
        for layer in self.stack.layers.iter() {
            if layer.dim() != self.stack.dim {
                return Err(FlowError::Shape {
                    what: "coupling layer",
                    expected: self.stack.dim,
                    found: layer.dim(),
                });
            }
            layer.validate()?;
        }
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.settings.dim
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    pub fn stack(&self) -> &CouplingStack {
        &self.stack
    }

    pub fn num_params(&self) -> usize {
        self.stack.num_params()
    }

    pub(crate) fn parameters_mut(&mut self) -> impl Iterator<Item = &mut [f64]> {
        self.stack
            .layers_mut()
            .iter_mut()
            .map(|layer| layer.params_mut())
    }

    /// Draw `n` points and their log densities.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> (Batch, Vec<f64>) {
        let mut latent = Batch::zeros(n, self.dim());
        latent
            .as_mut_slice()
            .iter_mut()
            .for_each(|z| *z = rng.random::<f64>());
        let (points, log_det) = self.map_rows(&latent, false);
        let log_prob = log_det.into_iter().map(|ld| -ld).collect();
        (points, log_prob)
    }

    /// Map latent points to the integration space.
    ///
    /// Returns the points and the log-determinants of the forward map.
    pub fn forward(&self, latent: &Batch) -> Result<(Batch, Vec<f64>)> {
        latent.check_dim(self.dim())?;
        Ok(self.map_rows(latent, false))
    }

    /// Map points back to the latent space.
    ///
    /// Returns the latent points and the log-determinants of the inverse map.
    pub fn inverse(&self, points: &Batch) -> Result<(Batch, Vec<f64>)> {
        points.check_dim(self.dim())?;
        Ok(self.map_rows(points, true))
    }

    fn map_rows(&self, input: &Batch, inverse: bool) -> (Batch, Vec<f64>) {
        let dim = self.dim();
        let mut output = Batch::zeros(input.len(), dim);
        let mut log_det = vec![0f64; input.len()];
        output
            .as_mut_slice()
            .par_chunks_exact_mut(dim)
            .zip(input.as_slice().par_chunks_exact(dim))
            .zip(log_det.par_iter_mut())
            .for_each(|((out, row), log_det)| {
                *log_det = if inverse {
                    self.stack.inverse(row, out)
                } else {
                    self.stack.forward(row, out)
                };
            });
        (output, log_det)
    }

    /// Log density of every point, `-inf` outside the unit hypercube.
    pub fn log_prob(&self, points: &Batch) -> Result<Vec<f64>> {
        points.check_dim(self.dim())?;
        let dim = self.dim();
        Ok(points
            .as_slice()
            .par_chunks_exact(dim)
            .map(|row| {
                if !in_unit_cube(row) {
                    return f64::NEG_INFINITY;
                }
                let mut latent = vec![0f64; dim];
                self.stack.inverse(row, &mut latent)
            })
            .collect())
    }

    /// Log densities of `points` and the parameter gradient of
    /// `sum_i coefficients[i] * log q(points[i])`.
    ///
    /// Points are constants. Samples with a zero coefficient or a
    /// non-finite density contribute nothing.
    pub fn log_prob_gradient(
        &self,
        points: &Batch,
        coefficients: &[f64],
    ) -> Result<(Vec<f64>, FlowGradient)> {
        points.check_dim(self.dim())?;
        if coefficients.len() != points.len() {
            return Err(FlowError::Shape {
                what: "gradient coefficients",
                expected: points.len(),
                found: coefficients.len(),
            });
        }
        let dim = self.dim();
        let mut log_prob = vec![0f64; points.len()];
        let gradient = log_prob
            .par_iter_mut()
            .zip(points.as_slice().par_chunks_exact(dim))
            .zip(coefficients.par_iter())
            .fold(
                || FlowGradient::zeros(&self.stack),
                |mut gradient, ((log_q, row), &c)| {
                    *log_q = if !in_unit_cube(row) {
                        f64::NEG_INFINITY
                    } else if c == 0. || !c.is_finite() {
                        let mut latent = vec![0f64; dim];
                        self.stack.inverse(row, &mut latent)
                    } else {
                        self.stack.inverse_backward(row, c, &mut gradient)
                    };
                    gradient
                },
            )
            .reduce(
                || FlowGradient::zeros(&self.stack),
                |mut total, part| {
                    total += &part;
                    total
                },
            );
        Ok((log_prob, gradient))
    }
}

fn in_unit_cube(row: &[f64]) -> bool {
    row.iter().all(|x| (0f64..1f64).contains(x))
}
