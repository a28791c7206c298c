//! Dense networks that emit spline parameters from the held-fixed coordinates.
//!
//! The network architecture lives in [`Conditioner`]; the weights live in a
//! flat parameter vector owned by the coupling layer. Per layer the vector
//! holds the `n_out x n_in` weight matrix (row major) followed by the bias.

use itertools::izip;
use rand::Rng;
use rand_distr::Uniform;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
}

impl Activation {
    fn apply(self, z: f64) -> f64 {
        match self {
            Activation::Relu => z.max(0.),
            Activation::Tanh => z.tanh(),
        }
    }

    /// Derivative given the pre-activation `z` and the activation `a`.
    fn derivative(self, z: f64, a: f64) -> f64 {
        match self {
            Activation::Relu => {
                if z > 0. {
                    1.
                } else {
                    0.
                }
            }
            Activation::Tanh => 1. - a * a,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionerOptions {
    pub hidden_layers: usize,
    pub hidden_width: usize,
    pub activation: Activation,
    /// Encode every input coordinate with this many one-blob bins.
    pub one_blob_bins: Option<usize>,
}

impl Default for ConditionerOptions {
    fn default() -> Self {
        Self {
            hidden_layers: 2,
            hidden_width: 32,
            activation: Activation::Relu,
            one_blob_bins: None,
        }
    }
}

impl ConditionerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.hidden_layers > 0 && self.hidden_width == 0 {
            return Err(FlowError::InvalidSettings(
                "hidden layers need a positive width".into(),
            ));
        }
        if self.one_blob_bins == Some(0) {
            return Err(FlowError::InvalidSettings(
                "one-blob encoding needs at least one bin".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditioner {
    num_inputs: usize,
    one_blob_bins: Option<usize>,
    sizes: Vec<usize>,
    activation: Activation,
}

/// Per-evaluation storage of the network state, reused by the backward pass.
#[derive(Debug, Clone, Default)]
pub(crate) struct Activations {
    pre: Vec<Vec<f64>>,
    post: Vec<Vec<f64>>,
}

impl Conditioner {
    pub fn new(num_inputs: usize, num_outputs: usize, options: &ConditionerOptions) -> Self {
        let encoded = num_inputs * options.one_blob_bins.unwrap_or(1);
        let mut sizes = vec![encoded];
        sizes.extend(std::iter::repeat(options.hidden_width).take(options.hidden_layers));
        sizes.push(num_outputs);
        Self {
            num_inputs,
            one_blob_bins: options.one_blob_bins,
            sizes,
            activation: options.activation,
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    fn num_layers(&self) -> usize {
        self.sizes.len() - 1
    }

    pub fn num_params(&self) -> usize {
        self.sizes
            .windows(2)
            .map(|pair| (pair[0] + 1) * pair[1])
            .sum()
    }

    /// Glorot-uniform hidden layers and a zero output layer, so that a fresh
    /// network emits all-zero spline parameters.
    pub fn init_params<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f64>> {
        let mut params = Vec::with_capacity(self.num_params());
        let last = self.num_layers() - 1;
        for (layer, pair) in self.sizes.windows(2).enumerate() {
            let (n_in, n_out) = (pair[0], pair[1]);
            if layer == last {
                params.extend(std::iter::repeat(0f64).take((n_in + 1) * n_out));
                continue;
            }
            let limit = (6. / (n_in + n_out) as f64).sqrt();
            let dist = Uniform::new_inclusive(-limit, limit)
                .map_err(|err| FlowError::InvalidSettings(err.to_string()))?;
            params.extend((0..n_in * n_out).map(|_| rng.sample(dist)));
            params.extend(std::iter::repeat(0f64).take(n_out));
        }
        Ok(params)
    }

    fn layer_slices<'a>(&self, params: &'a [f64], layer: usize) -> (&'a [f64], &'a [f64]) {
        let offset = self.layer_offset(layer);
        let (n_in, n_out) = (self.sizes[layer], self.sizes[layer + 1]);
        let weights = &params[offset..offset + n_in * n_out];
        let bias = &params[offset + n_in * n_out..offset + (n_in + 1) * n_out];
        (weights, bias)
    }

    fn layer_offset(&self, layer: usize) -> usize {
        self.sizes[..=layer]
            .windows(2)
            .map(|pair| (pair[0] + 1) * pair[1])
            .sum()
    }

    fn encode(&self, input: &[f64], out: &mut Vec<f64>) {
        out.clear();
        match self.one_blob_bins {
            None => out.extend_from_slice(input),
            Some(bins) => {
                let scale = bins as f64;
                for &u in input {
                    out.extend((0..bins).map(|k| {
                        let dist = scale * (u - (k as f64 + 0.5) / scale);
                        (-0.5 * dist * dist).exp()
                    }));
                }
            }
        }
    }

    fn encode_backward(&self, input: &[f64], encoded: &[f64], grad: &[f64], grad_input: &mut [f64]) {
        match self.one_blob_bins {
            None => izip!(grad_input.iter_mut(), grad).for_each(|(out, g)| *out += g),
            Some(bins) => {
                let scale = bins as f64;
                for (i, &u) in input.iter().enumerate() {
                    let range = i * bins..(i + 1) * bins;
                    let total: f64 = izip!(0..bins, &encoded[range.clone()], &grad[range])
                        .map(|(k, value, g)| {
                            let centre = (k as f64 + 0.5) / scale;
                            g * value * (-scale * scale * (u - centre))
                        })
                        .sum();
                    grad_input[i] += total;
                }
            }
        }
    }

    /// Evaluate the network, leaving every intermediate in `cache`.
    pub(crate) fn forward<'c>(
        &self,
        params: &[f64],
        input: &[f64],
        cache: &'c mut Activations,
    ) -> &'c [f64] {
        assert!(input.len() == self.num_inputs);
        assert!(params.len() == self.num_params());
        let num_layers = self.num_layers();
        cache.pre.resize(num_layers, vec![]);
        cache.post.resize(num_layers + 1, vec![]);
        self.encode(input, &mut cache.post[0]);

        for layer in 0..num_layers {
            let (weights, bias) = self.layer_slices(params, layer);
            let n_in = self.sizes[layer];
            let (head, tail) = cache.post.split_at_mut(layer + 1);
            let layer_input = &head[layer];
            let pre = &mut cache.pre[layer];
            pre.clear();
            if n_in == 0 {
                pre.extend_from_slice(bias);
            } else {
                pre.extend(izip!(weights.chunks_exact(n_in), bias).map(|(row, b)| {
                    b + izip!(row, layer_input).map(|(w, x)| w * x).sum::<f64>()
                }));
            }
            let post = &mut tail[0];
            post.clear();
            if layer == num_layers - 1 {
                post.extend_from_slice(pre);
            } else {
                post.extend(pre.iter().map(|&z| self.activation.apply(z)));
            }
        }
        &cache.post[num_layers]
    }

    /// Backpropagate `grad_output` through the evaluation stored in `cache`.
    ///
    /// Parameter gradients are accumulated into `grad_params`, input
    /// gradients into `grad_input`.
    pub(crate) fn backward(
        &self,
        params: &[f64],
        input: &[f64],
        cache: &Activations,
        grad_output: &[f64],
        grad_params: &mut [f64],
        grad_input: &mut [f64],
    ) {
        assert!(grad_output.len() == self.num_outputs());
        assert!(grad_params.len() == self.num_params());
        assert!(grad_input.len() == self.num_inputs);
        let num_layers = self.num_layers();
        let mut delta = grad_output.to_vec();

        for layer in (0..num_layers).rev() {
            if layer != num_layers - 1 {
                izip!(delta.iter_mut(), &cache.pre[layer], &cache.post[layer + 1])
                    .for_each(|(d, &z, &a)| *d *= self.activation.derivative(z, a));
            }
            let (n_in, n_out) = (self.sizes[layer], self.sizes[layer + 1]);
            let offset = self.layer_offset(layer);
            let (weights, _) = self.layer_slices(params, layer);
            let layer_input = &cache.post[layer];

            let grads = &mut grad_params[offset..offset + (n_in + 1) * n_out];
            let (grad_weights, grad_bias) = grads.split_at_mut(n_in * n_out);
            if n_in > 0 {
                izip!(grad_weights.chunks_exact_mut(n_in), &delta).for_each(|(row, &d)| {
                    izip!(row, layer_input).for_each(|(g, x)| *g += d * x);
                });
            }
            izip!(grad_bias.iter_mut(), &delta).for_each(|(g, d)| *g += d);

            let mut grad_layer_input = vec![0f64; n_in];
            if n_in > 0 {
                izip!(weights.chunks_exact(n_in), &delta).for_each(|(row, &d)| {
                    izip!(grad_layer_input.iter_mut(), row).for_each(|(g, w)| *g += w * d);
                });
            }
            delta = grad_layer_input;
        }

        self.encode_backward(input, &cache.post[0], &delta, grad_input);
    }
}
