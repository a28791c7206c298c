use itertools::{izip, Itertools};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::conditioner::{Activations, Conditioner, ConditionerOptions};
use crate::error::{FlowError, Result};
use crate::spline::{Spline, SplineOptions};

/// An invertible map of `[0, 1)^D` onto itself with a tractable Jacobian.
pub trait Bijector {
    fn dim(&self) -> usize;

    /// Map `x` to `y` and return `log |det dy/dx|`.
    fn forward(&self, x: &[f64], y: &mut [f64]) -> f64;

    /// Map `y` to `x` and return `log |det dx/dy|`.
    fn inverse(&self, y: &[f64], x: &mut [f64]) -> f64;
}

/// How coordinates are split into transformed and conditioning sets.
///
/// A mask entry is `true` for coordinates the layer transforms.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskScheme {
    /// Even coordinates, then odd coordinates.
    ///
    /// With more than two coordinates, coordinates of equal parity are never
    /// transformed conditioned on each other (0 and 2, for example).
    Alternating,
    /// First half, then second half.
    ///
    /// With more than two coordinates, coordinates in the same half are never
    /// transformed conditioned on each other.
    Split,
    /// For every bit of the coordinate index: coordinates with the bit set,
    /// then the complement. Every pair of coordinates is separated by at
    /// least one bit, so each coordinate is transformed conditioned on each
    /// other coordinate somewhere in the stack.
    #[default]
    Binary,
    Custom(Vec<Vec<bool>>),
}

impl MaskScheme {
    fn patterns(&self, dim: usize) -> Vec<Vec<bool>> {
        if dim == 1 {
            if let MaskScheme::Custom(masks) = self {
                return masks.clone();
            }
            return vec![vec![true]];
        }
        let with_complement = |mask: Vec<bool>| {
            let complement = mask.iter().map(|&m| !m).collect();
            [mask, complement]
        };
        match self {
            MaskScheme::Alternating => with_complement((0..dim).map(|i| i % 2 == 0).collect()).into(),
            MaskScheme::Split => with_complement((0..dim).map(|i| i < dim / 2).collect()).into(),
            MaskScheme::Binary => {
                let num_bits = (usize::BITS - (dim - 1).leading_zeros()) as usize;
                (0..num_bits)
                    .flat_map(|bit| with_complement((0..dim).map(|i| (i >> bit) & 1 == 1).collect()))
                    .collect()
            }
            MaskScheme::Custom(masks) => masks.clone(),
        }
    }

    /// The masks of a stack with `num_layers` layers.
    ///
    /// The scheme's pattern list is repeated until the requested number of
    /// layers is reached; `None` uses the pattern list once.
    pub fn masks(&self, dim: usize, num_layers: Option<usize>) -> Result<Vec<Vec<bool>>> {
        if dim == 0 {
            return Err(FlowError::InvalidSettings(
                "the integration space needs at least one dimension".into(),
            ));
        }
        let patterns = self.patterns(dim);
        if patterns.is_empty() {
            return Err(FlowError::InvalidSettings("no coupling masks".into()));
        }
        for mask in patterns.iter() {
            if mask.len() != dim {
                return Err(FlowError::Shape {
                    what: "coupling mask",
                    expected: dim,
                    found: mask.len(),
                });
            }
            if !mask.iter().any(|&m| m) {
                return Err(FlowError::InvalidSettings(
                    "every coupling mask must transform at least one coordinate".into(),
                ));
            }
        }
        let num_layers = num_layers.unwrap_or(patterns.len());
        if num_layers == 0 {
            return Err(FlowError::InvalidSettings(
                "a flow needs at least one coupling layer".into(),
            ));
        }
        Ok(patterns.into_iter().cycle().take(num_layers).collect())
    }
}

/// Ordered pairs `(a, b)` such that no mask transforms `a` while holding `b`.
///
/// An empty result means every coordinate depends on every other one
/// somewhere in the stack.
pub fn unseparated_pairs(masks: &[Vec<bool>]) -> Vec<(usize, usize)> {
    let dim = masks.first().map_or(0, Vec::len);
    (0..dim)
        .cartesian_product(0..dim)
        .filter(|&(a, b)| a != b && !masks.iter().any(|mask| mask[a] && !mask[b]))
        .collect()
}

/// A spline coupling transform.
///
/// Coordinates with a `false` mask entry pass through unchanged and are the
/// input of the conditioner, which emits the spline parameters of every
/// coordinate with a `true` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouplingLayer {
    mask: Vec<bool>,
    conditioner: Conditioner,
    spline: SplineOptions,
    params: Vec<f64>,
}

impl CouplingLayer {
    pub fn new<R: Rng + ?Sized>(
        mask: Vec<bool>,
        conditioner: &ConditionerOptions,
        spline: SplineOptions,
        rng: &mut R,
    ) -> Result<Self> {
        spline.validate()?;
        conditioner.validate()?;
        let num_transformed = mask.iter().filter(|&&m| m).count();
        let num_held = mask.len() - num_transformed;
        let conditioner = Conditioner::new(
            num_held,
            num_transformed * spline.num_params(),
            conditioner,
        );
        let params = conditioner.init_params(rng)?;
        Ok(Self {
            mask,
            conditioner,
            spline,
            params,
        })
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut [f64] {
        &mut self.params
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Check that the parameters fit the network and the mask, which only
    /// fails for layers restored from a corrupted checkpoint.
    pub(crate) fn validate(&self) -> Result<()> {
        let num_transformed = self.mask.iter().filter(|&&m| m).count();
        if self.conditioner.num_inputs() != self.mask.len() - num_transformed {
            return Err(FlowError::Shape {
                what: "conditioner inputs",
                expected: self.mask.len() - num_transformed,
                found: self.conditioner.num_inputs(),
            });
        }
        if self.conditioner.num_outputs() != num_transformed * self.spline.num_params() {
            return Err(FlowError::Shape {
                what: "conditioner outputs",
                expected: num_transformed * self.spline.num_params(),
                found: self.conditioner.num_outputs(),
            });
        }
        if self.params.len() != self.conditioner.num_params() {
            return Err(FlowError::Shape {
                what: "layer parameters",
                expected: self.conditioner.num_params(),
                found: self.params.len(),
            });
        }
        self.spline.validate()
    }

    fn held(&self, point: &[f64]) -> Vec<f64> {
        izip!(point, &self.mask)
            .filter(|(_, &m)| !m)
            .map(|(&x, _)| x)
            .collect()
    }

    fn transformed(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask
            .iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .map(|(i, _)| i)
    }

    fn splines(&self, point: &[f64], cache: &mut Activations) -> Vec<Spline> {
        let held = self.held(point);
        let raw = self.conditioner.forward(&self.params, &held, cache);
        raw.chunks_exact(self.spline.num_params())
            .map(|params| Spline::new(&self.spline, params))
            .collect()
    }

    fn apply(&self, input: &[f64], output: &mut [f64], inverse: bool) -> f64 {
        assert!(input.len() == self.mask.len());
        assert!(output.len() == self.mask.len());
        let mut cache = Activations::default();
        let splines = self.splines(input, &mut cache);
        output.copy_from_slice(input);
        izip!(self.transformed(), &splines)
            .map(|(i, spline)| {
                let (value, log_det) = if inverse {
                    spline.inverse(input[i])
                } else {
                    spline.forward(input[i])
                };
                output[i] = value;
                log_det
            })
            .sum()
    }

    /// Backpropagate through [`Bijector::inverse`] at `y`.
    ///
    /// `grad_x` is the gradient with respect to the inverse output and
    /// `grad_log_det` the gradient with respect to the inverse
    /// log-determinant. Writes the gradient with respect to `y` into
    /// `grad_y` and accumulates parameter gradients into `grad_params`.
    pub(crate) fn inverse_backward(
        &self,
        y: &[f64],
        grad_x: &[f64],
        grad_log_det: f64,
        grad_y: &mut [f64],
        grad_params: &mut [f64],
    ) {
        assert!(grad_params.len() == self.params.len());
        let mut cache = Activations::default();
        let held = self.held(y);
        let splines = self.splines(y, &mut cache);

        let per_spline = self.spline.num_params();
        let mut grad_raw = vec![0f64; self.conditioner.num_outputs()];
        grad_y.copy_from_slice(grad_x);
        izip!(self.transformed(), &splines, grad_raw.chunks_exact_mut(per_spline)).for_each(
            |(i, spline, grad_raw)| {
                grad_y[i] = spline.inverse_backward(y[i], grad_x[i], grad_log_det, grad_raw);
            },
        );

        let mut grad_held = vec![0f64; held.len()];
        self.conditioner.backward(
            &self.params,
            &held,
            &cache,
            &grad_raw,
            grad_params,
            &mut grad_held,
        );
        let held_indices = self.mask.iter().enumerate().filter(|(_, &m)| !m);
        izip!(held_indices, &grad_held).for_each(|((i, _), g)| grad_y[i] += g);
    }
}

impl Bijector for CouplingLayer {
    fn dim(&self) -> usize {
        self.mask.len()
    }

    fn forward(&self, x: &[f64], y: &mut [f64]) -> f64 {
        self.apply(x, y, false)
    }

    fn inverse(&self, y: &[f64], x: &mut [f64]) -> f64 {
        self.apply(y, x, true)
    }
}
