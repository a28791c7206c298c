//! Monotone piecewise-polynomial maps of the unit interval onto itself.
//!
//! The splines are parameterized by unconstrained values. Bin widths and
//! heights are pushed through a softmax (or an exponential followed by a
//! normalization) and shifted by a minimal size, so every parameter vector
//! describes a strictly increasing bijection of `[0, 1]`. With all
//! parameters equal to zero every spline kind is the identity.
//!
//! Only the inverse direction carries a reverse-mode adjoint: the flow
//! density of a fixed point is evaluated by inverting the flow, and that is
//! the quantity that gets differentiated during training.

use itertools::izip;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::math::{search_sorted, sigmoid, softmax, softmax_backward, softplus};

pub const DEFAULT_MIN_BIN_WIDTH: f64 = 1e-3;
pub const DEFAULT_MIN_BIN_HEIGHT: f64 = 1e-3;
pub const DEFAULT_MIN_DERIVATIVE: f64 = 1e-3;

/// The largest `f64` strictly below one.
pub(crate) const ONE_BELOW: f64 = 1. - f64::EPSILON / 2.;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplineKind {
    /// Equal-width bins with learned probability mass per bin.
    Linear,
    /// Learned bin widths and learned density at every knot.
    #[default]
    Quadratic,
    /// Monotone rational-quadratic segments with learned widths, heights
    /// and knot derivatives.
    RationalQuadratic,
}

impl SplineKind {
    /// Number of unconstrained parameters of one spline with `num_bins` bins.
    pub fn num_params(self, num_bins: usize) -> usize {
        match self {
            SplineKind::Linear => num_bins,
            SplineKind::Quadratic => 2 * num_bins + 1,
            SplineKind::RationalQuadratic => 3 * num_bins + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplineOptions {
    pub kind: SplineKind,
    pub num_bins: usize,
    pub min_bin_width: f64,
    pub min_bin_height: f64,
    /// Lower bound on the knot derivatives of rational-quadratic splines.
    pub min_derivative: f64,
}

impl Default for SplineOptions {
    fn default() -> Self {
        Self {
            kind: SplineKind::Quadratic,
            num_bins: 10,
            min_bin_width: DEFAULT_MIN_BIN_WIDTH,
            min_bin_height: DEFAULT_MIN_BIN_HEIGHT,
            min_derivative: DEFAULT_MIN_DERIVATIVE,
        }
    }
}

impl SplineOptions {
    pub fn num_params(&self) -> usize {
        self.kind.num_params(self.num_bins)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_bins == 0 {
            return Err(FlowError::InvalidSettings(
                "splines need at least one bin".into(),
            ));
        }
        // A zero minimum lets an underflowing softmax collapse a bin.
        let open_unit = f64::MIN_POSITIVE..1f64;
        if !open_unit.contains(&self.min_bin_width) || !open_unit.contains(&self.min_bin_height) {
            return Err(FlowError::InvalidSettings(
                "minimal bin sizes must lie in (0, 1)".into(),
            ));
        }
        if !(self.min_derivative >= f64::MIN_POSITIVE && self.min_derivative.is_finite()) {
            return Err(FlowError::InvalidSettings(
                "minimal derivative must be positive".into(),
            ));
        }
        if self.min_bin_width * self.num_bins as f64 >= 1. {
            return Err(FlowError::InvalidSettings(
                "minimal bin width too large for the number of bins".into(),
            ));
        }
        let normalized_heights = matches!(
            self.kind,
            SplineKind::Linear | SplineKind::RationalQuadratic
        );
        if normalized_heights && self.min_bin_height * self.num_bins as f64 >= 1. {
            return Err(FlowError::InvalidSettings(
                "minimal bin height too large for the number of bins".into(),
            ));
        }
        Ok(())
    }
}

/// A spline with its knots resolved from one parameter vector.
#[derive(Debug, Clone)]
pub enum Spline {
    Linear(LinearSpline),
    Quadratic(QuadraticSpline),
    RationalQuadratic(RationalQuadraticSpline),
}

impl Spline {
    pub fn new(options: &SplineOptions, params: &[f64]) -> Self {
        assert!(params.len() == options.num_params());
        match options.kind {
            SplineKind::Linear => Spline::Linear(LinearSpline::new(params, options.min_bin_height)),
            SplineKind::Quadratic => Spline::Quadratic(QuadraticSpline::new(
                params,
                options.min_bin_width,
                options.min_bin_height,
            )),
            SplineKind::RationalQuadratic => {
                Spline::RationalQuadratic(RationalQuadraticSpline::new(
                    params,
                    options.min_bin_width,
                    options.min_bin_height,
                    options.min_derivative,
                ))
            }
        }
    }

    /// Map `x` to `y`, returning `(y, log dy/dx)`.
    pub fn forward(&self, x: f64) -> (f64, f64) {
        match self {
            Spline::Linear(spline) => spline.forward(x),
            Spline::Quadratic(spline) => spline.forward(x),
            Spline::RationalQuadratic(spline) => spline.forward(x),
        }
    }

    /// Map `y` to `x`, returning `(x, log dx/dy)`.
    pub fn inverse(&self, y: f64) -> (f64, f64) {
        match self {
            Spline::Linear(spline) => spline.inverse(y),
            Spline::Quadratic(spline) => spline.inverse(y),
            Spline::RationalQuadratic(spline) => spline.inverse(y),
        }
    }

    /// Backpropagate through [`Spline::inverse`].
    ///
    /// Given the gradients of a scalar with respect to the inverse output
    /// and its log-determinant, accumulates the gradient with respect to the
    /// unconstrained parameters into `grad_params` and returns the gradient
    /// with respect to `y`.
    pub fn inverse_backward(
        &self,
        y: f64,
        grad_x: f64,
        grad_log_det: f64,
        grad_params: &mut [f64],
    ) -> f64 {
        match self {
            Spline::Linear(spline) => spline.inverse_backward(y, grad_x, grad_log_det, grad_params),
            Spline::Quadratic(spline) => {
                spline.inverse_backward(y, grad_x, grad_log_det, grad_params)
            }
            Spline::RationalQuadratic(spline) => {
                spline.inverse_backward(y, grad_x, grad_log_det, grad_params)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinearSpline {
    probs: Vec<f64>,
    masses: Vec<f64>,
    cdf: Vec<f64>,
    min_mass: f64,
}

impl LinearSpline {
    pub fn new(params: &[f64], min_mass: f64) -> Self {
        let (probs, masses) = shifted_softmax(params, min_mass);
        let cdf = cumulative(&masses);
        Self {
            probs,
            masses,
            cdf,
            min_mass,
        }
    }

    fn num_bins(&self) -> usize {
        self.masses.len()
    }

    pub fn forward(&self, x: f64) -> (f64, f64) {
        let bins = self.num_bins() as f64;
        let x = x.clamp(0., 1.);
        let bin = ((x * bins) as usize).min(self.num_bins() - 1);
        let alpha = x * bins - bin as f64;
        let mass = self.masses[bin];
        let y = self.cdf[bin] + alpha * mass;
        (y.clamp(0., ONE_BELOW), (bins * mass).ln())
    }

    fn locate(&self, y: f64) -> (usize, f64) {
        let bin = search_sorted(&self.cdf, y);
        let alpha = ((y - self.cdf[bin]) / self.masses[bin]).clamp(0., 1.);
        (bin, alpha)
    }

    pub fn inverse(&self, y: f64) -> (f64, f64) {
        let bins = self.num_bins() as f64;
        let (bin, alpha) = self.locate(y);
        let x = (bin as f64 + alpha) / bins;
        (x.min(ONE_BELOW), -(bins * self.masses[bin]).ln())
    }

    pub fn inverse_backward(
        &self,
        y: f64,
        grad_x: f64,
        grad_log_det: f64,
        grad_params: &mut [f64],
    ) -> f64 {
        let num_bins = self.num_bins();
        assert!(grad_params.len() == num_bins);
        let (bin, alpha) = self.locate(y);
        let mass = self.masses[bin];

        let grad_alpha = grad_x / num_bins as f64;
        let grad_y = grad_alpha / mass;

        let mut grad_masses = vec![0f64; num_bins];
        grad_masses[bin] -= grad_alpha * alpha / mass + grad_log_det / mass;
        let grad_cdf = -grad_alpha / mass;
        grad_masses[..bin].iter_mut().for_each(|g| *g += grad_cdf);

        let scale = 1. - self.min_mass * num_bins as f64;
        grad_masses.iter_mut().for_each(|g| *g *= scale);
        softmax_backward(&self.probs, &grad_masses, grad_params);
        grad_y
    }
}

#[derive(Debug, Clone)]
pub struct QuadraticSpline {
    probs: Vec<f64>,
    widths: Vec<f64>,
    knots: Vec<f64>,
    exp_heights: Vec<f64>,
    area: f64,
    heights: Vec<f64>,
    cdf: Vec<f64>,
    min_width: f64,
    min_height: f64,
}

impl QuadraticSpline {
    pub fn new(params: &[f64], min_width: f64, min_height: f64) -> Self {
        assert!(params.len() % 2 == 1);
        let num_bins = params.len() / 2;
        let (raw_widths, raw_heights) = params.split_at(num_bins);

        let (probs, widths) = shifted_softmax(raw_widths, min_width);
        let knots = cumulative(&widths);

        // The overall scale of the heights cancels in the normalization.
        let max = raw_heights
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let exp_heights: Vec<f64> = raw_heights.iter().map(|h| (h - max).exp()).collect();
        let area = trapezoid_areas(&exp_heights, &widths).sum::<f64>();
        let heights: Vec<f64> = exp_heights
            .iter()
            .map(|e| min_height + (1. - min_height) * e / area)
            .collect();

        let areas: Vec<f64> = trapezoid_areas(&heights, &widths).collect();
        let cdf = cumulative(&areas);

        Self {
            probs,
            widths,
            knots,
            exp_heights,
            area,
            heights,
            cdf,
            min_width,
            min_height,
        }
    }

    fn num_bins(&self) -> usize {
        self.widths.len()
    }

    pub fn forward(&self, x: f64) -> (f64, f64) {
        let x = x.clamp(0., 1.);
        let bin = search_sorted(&self.knots, x);
        let width = self.widths[bin];
        let alpha = ((x - self.knots[bin]) / width).clamp(0., 1.);
        let left = self.heights[bin];
        let slope = self.heights[bin + 1] - left;
        let y = self.cdf[bin] + width * (left * alpha + 0.5 * slope * alpha * alpha);
        let density = left + alpha * slope;
        (y.clamp(0., ONE_BELOW), density.ln())
    }

    /// Bin, position within the bin and density for an output value.
    fn solve(&self, y: f64) -> (usize, f64, f64) {
        let bin = search_sorted(&self.cdf, y);
        let width = self.widths[bin];
        let left = self.heights[bin];
        let slope = self.heights[bin + 1] - left;
        let offset = (y - self.cdf[bin]).max(0.);

        let a = 0.5 * slope * width;
        let b = left * width;
        let disc = (b * b + 4. * a * offset).max(0.);
        let alpha = (2. * offset / (b + disc.sqrt())).clamp(0., 1.);
        (bin, alpha, left + alpha * slope)
    }

    pub fn inverse(&self, y: f64) -> (f64, f64) {
        let (bin, alpha, density) = self.solve(y);
        let x = self.knots[bin] + alpha * self.widths[bin];
        (x.min(ONE_BELOW), -density.ln())
    }

    pub fn inverse_backward(
        &self,
        y: f64,
        grad_x: f64,
        grad_log_det: f64,
        grad_params: &mut [f64],
    ) -> f64 {
        let num_bins = self.num_bins();
        assert!(grad_params.len() == 2 * num_bins + 1);
        let (bin, alpha, density) = self.solve(y);
        let width = self.widths[bin];
        let left = self.heights[bin];
        let right = self.heights[bin + 1];
        let slope = right - left;

        let mut grad_widths = vec![0f64; num_bins];
        let mut grad_heights = vec![0f64; num_bins + 1];

        // x = knots[bin] + alpha * width
        grad_widths[..bin].iter_mut().for_each(|g| *g += grad_x);
        grad_widths[bin] += grad_x * alpha;

        // log_det = -ln(left * (1 - alpha) + right * alpha)
        grad_heights[bin] -= grad_log_det * (1. - alpha) / density;
        grad_heights[bin + 1] -= grad_log_det * alpha / density;

        // alpha solves cdf[bin] + width * (left * alpha + slope * alpha^2 / 2) = y
        // so d alpha = (dy - dG) / (width * density) for any knot perturbation dG.
        let grad_alpha = grad_x * width - grad_log_det * slope / density;
        let implicit = grad_alpha / (width * density);
        let grad_y = implicit;

        grad_widths[bin] -= implicit * (left * alpha + 0.5 * slope * alpha * alpha);
        for j in 0..bin {
            let w = self.widths[j];
            grad_widths[j] -= implicit * 0.5 * (self.heights[j] + self.heights[j + 1]);
            grad_heights[j] -= implicit * 0.5 * w;
            grad_heights[j + 1] -= implicit * 0.5 * w;
        }
        grad_heights[bin] -= implicit * width * (alpha - 0.5 * alpha * alpha);
        grad_heights[bin + 1] -= implicit * width * 0.5 * alpha * alpha;

        // heights = min_height + (1 - min_height) * exp_heights / area
        let scale = 1. - self.min_height;
        let area = self.area;
        let mut grad_exp: Vec<f64> = grad_heights.iter().map(|g| scale * g / area).collect();
        let grad_area = -izip!(&grad_heights, &self.exp_heights)
            .map(|(g, e)| scale * g * e)
            .sum::<f64>()
            / (area * area);

        // area = sum_k (e_k + e_{k+1}) / 2 * w_k
        for k in 0..num_bins {
            let w = self.widths[k];
            grad_exp[k] += grad_area * 0.5 * w;
            grad_exp[k + 1] += grad_area * 0.5 * w;
            grad_widths[k] += grad_area * 0.5 * (self.exp_heights[k] + self.exp_heights[k + 1]);
        }

        let (grad_raw_widths, grad_raw_heights) = grad_params.split_at_mut(num_bins);
        izip!(grad_raw_heights.iter_mut(), &grad_exp, &self.exp_heights)
            .for_each(|(out, g, e)| *out += g * e);

        let width_scale = 1. - self.min_width * num_bins as f64;
        grad_widths.iter_mut().for_each(|g| *g *= width_scale);
        softmax_backward(&self.probs, &grad_widths, grad_raw_widths);
        grad_y
    }
}

/// Knot derivatives are `(min_derivative + softplus(u)) / (min_derivative + ln 2)`,
/// so a zero parameter gives slope one.
#[derive(Debug, Clone)]
pub struct RationalQuadraticSpline {
    width_probs: Vec<f64>,
    height_probs: Vec<f64>,
    widths: Vec<f64>,
    heights: Vec<f64>,
    knots: Vec<f64>,
    cdf: Vec<f64>,
    raw_derivatives: Vec<f64>,
    derivatives: Vec<f64>,
    min_width: f64,
    min_height: f64,
    min_derivative: f64,
}

/// Quantities of one rational-quadratic segment at position `theta`.
struct Segment {
    width: f64,
    height: f64,
    slope: f64,
    d0: f64,
    d1: f64,
    theta: f64,
    numer: f64,
    denom: f64,
    q: f64,
}

impl Segment {
    fn t(&self) -> f64 {
        self.theta * (1. - self.theta)
    }

    fn sum(&self) -> f64 {
        self.d0 + self.d1 - 2. * self.slope
    }

    /// `dy/dx` inside the segment.
    fn derivative(&self) -> f64 {
        self.slope * self.slope * self.q / (self.denom * self.denom)
    }
}

impl RationalQuadraticSpline {
    pub fn new(params: &[f64], min_width: f64, min_height: f64, min_derivative: f64) -> Self {
        assert!(params.len() % 3 == 1);
        let num_bins = params.len() / 3;
        let (raw_widths, rest) = params.split_at(num_bins);
        let (raw_heights, raw_derivatives) = rest.split_at(num_bins);

        let (width_probs, widths) = shifted_softmax(raw_widths, min_width);
        let (height_probs, heights) = shifted_softmax(raw_heights, min_height);
        let knots = cumulative(&widths);
        let cdf = cumulative(&heights);

        let norm = min_derivative + std::f64::consts::LN_2;
        let derivatives = raw_derivatives
            .iter()
            .map(|&u| (min_derivative + softplus(u)) / norm)
            .collect();

        Self {
            width_probs,
            height_probs,
            widths,
            heights,
            knots,
            cdf,
            raw_derivatives: raw_derivatives.to_vec(),
            derivatives,
            min_width,
            min_height,
            min_derivative,
        }
    }

    fn num_bins(&self) -> usize {
        self.widths.len()
    }

    fn segment(&self, bin: usize, theta: f64) -> Segment {
        let width = self.widths[bin];
        let height = self.heights[bin];
        let slope = height / width;
        let d0 = self.derivatives[bin];
        let d1 = self.derivatives[bin + 1];
        let t = theta * (1. - theta);
        Segment {
            width,
            height,
            slope,
            d0,
            d1,
            theta,
            numer: height * (slope * theta * theta + d0 * t),
            denom: slope + (d0 + d1 - 2. * slope) * t,
            q: d1 * theta * theta + 2. * slope * t + d0 * (1. - theta) * (1. - theta),
        }
    }

    pub fn forward(&self, x: f64) -> (f64, f64) {
        let x = x.clamp(0., 1.);
        let bin = search_sorted(&self.knots, x);
        let theta = ((x - self.knots[bin]) / self.widths[bin]).clamp(0., 1.);
        let seg = self.segment(bin, theta);
        let y = self.cdf[bin] + seg.numer / seg.denom;
        (y.clamp(0., ONE_BELOW), seg.derivative().ln())
    }

    fn solve(&self, y: f64) -> (usize, Segment) {
        let bin = search_sorted(&self.cdf, y);
        let width = self.widths[bin];
        let height = self.heights[bin];
        let slope = height / width;
        let d0 = self.derivatives[bin];
        let d1 = self.derivatives[bin + 1];
        let offset = (y - self.cdf[bin]).clamp(0., height);

        let sum = d0 + d1 - 2. * slope;
        let a = height * (slope - d0) + offset * sum;
        let b = height * d0 - offset * sum;
        let c = -slope * offset;
        let disc = (b * b - 4. * a * c).max(0.);
        let theta = (2. * c / (-b - disc.sqrt())).clamp(0., 1.);
        (bin, self.segment(bin, theta))
    }

    pub fn inverse(&self, y: f64) -> (f64, f64) {
        let (bin, seg) = self.solve(y);
        let x = self.knots[bin] + seg.theta * seg.width;
        (x.min(ONE_BELOW), -seg.derivative().ln())
    }

    pub fn inverse_backward(
        &self,
        y: f64,
        grad_x: f64,
        grad_log_det: f64,
        grad_params: &mut [f64],
    ) -> f64 {
        let num_bins = self.num_bins();
        assert!(grad_params.len() == 3 * num_bins + 1);
        let (bin, seg) = self.solve(y);
        let Segment {
            width,
            height,
            slope,
            d0,
            theta,
            numer,
            denom,
            q,
            ..
        } = seg;
        let t = seg.t();
        let sum = seg.sum();
        let dt = 1. - 2. * theta;

        // log_det = -(2 ln slope + ln q - 2 ln denom)
        let dq_theta = 2. * seg.d1 * theta + 2. * slope * dt - 2. * d0 * (1. - theta);
        let dlog_theta = dq_theta / q - 2. * sum * dt / denom;
        let dlog_slope = 2. / slope + 2. * t / q - 2. * (1. - 2. * t) / denom;
        let dlog_d0 = (1. - theta) * (1. - theta) / q - 2. * t / denom;
        let dlog_d1 = theta * theta / q - 2. * t / denom;

        // theta solves cdf[bin] + numer / denom = y, and d(numer / denom) / d theta
        // equals width times the derivative.
        let grad_theta = grad_x * width - grad_log_det * dlog_theta;
        let implicit = grad_theta / (width * seg.derivative());
        let ratio = numer / (denom * denom);

        let grad_slope = -grad_log_det * dlog_slope
            - implicit * (height * theta * theta / denom - ratio * (1. - 2. * t));
        let grad_d0 = -grad_log_det * dlog_d0 - implicit * (height * t / denom - ratio * t);
        let grad_d1 = -grad_log_det * dlog_d1 + implicit * ratio * t;

        let mut grad_widths = vec![0f64; num_bins];
        let mut grad_heights = vec![0f64; num_bins];
        grad_widths[..bin].iter_mut().for_each(|g| *g += grad_x);
        grad_heights[..bin].iter_mut().for_each(|g| *g -= implicit);
        // slope = height / width
        grad_widths[bin] += grad_x * theta - grad_slope * slope / width;
        grad_heights[bin] +=
            -implicit * (slope * theta * theta + d0 * t) / denom + grad_slope / width;

        let (grad_raw_widths, rest) = grad_params.split_at_mut(num_bins);
        let (grad_raw_heights, grad_raw_derivatives) = rest.split_at_mut(num_bins);

        let width_scale = 1. - self.min_width * num_bins as f64;
        grad_widths.iter_mut().for_each(|g| *g *= width_scale);
        softmax_backward(&self.width_probs, &grad_widths, grad_raw_widths);

        let height_scale = 1. - self.min_height * num_bins as f64;
        grad_heights.iter_mut().for_each(|g| *g *= height_scale);
        softmax_backward(&self.height_probs, &grad_heights, grad_raw_heights);

        let norm = self.min_derivative + std::f64::consts::LN_2;
        grad_raw_derivatives[bin] += grad_d0 * sigmoid(self.raw_derivatives[bin]) / norm;
        grad_raw_derivatives[bin + 1] += grad_d1 * sigmoid(self.raw_derivatives[bin + 1]) / norm;
        implicit
    }
}

/// Softmax probabilities and the bin sizes `min + (1 - K * min) * p`.
fn shifted_softmax(raw: &[f64], min: f64) -> (Vec<f64>, Vec<f64>) {
    let mut probs = vec![0f64; raw.len()];
    softmax(raw, &mut probs);
    let scale = 1. - min * raw.len() as f64;
    let sizes = probs.iter().map(|p| min + scale * p).collect();
    (probs, sizes)
}

/// Prefix sums with a leading zero; the last entry is forced to one.
fn cumulative(sizes: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(sizes.len() + 1);
    let mut total = 0f64;
    out.push(0.);
    for size in sizes {
        total += size;
        out.push(total);
    }
    if let Some(last) = out.last_mut() {
        *last = 1.;
    }
    out
}

fn trapezoid_areas<'a>(heights: &'a [f64], widths: &'a [f64]) -> impl Iterator<Item = f64> + 'a {
    izip!(heights, &heights[1..], widths).map(|(l, r, w)| 0.5 * (l + r) * w)
}
