use itertools::izip;

/// Numerically stable softmax of `logits` into `out`.
pub(crate) fn softmax(logits: &[f64], out: &mut [f64]) {
    assert!(logits.len() == out.len());
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut total = 0f64;
    izip!(logits, out.iter_mut()).for_each(|(&logit, out)| {
        *out = (logit - max).exp();
        total += *out;
    });
    out.iter_mut().for_each(|out| *out /= total);
}

/// Accumulate the gradient with respect to the logits of a softmax.
///
/// `probs` is the softmax output and `grad_probs` the gradient with
/// respect to it.
pub(crate) fn softmax_backward(probs: &[f64], grad_probs: &[f64], grad_logits: &mut [f64]) {
    assert!(probs.len() == grad_probs.len());
    assert!(probs.len() == grad_logits.len());
    let dot: f64 = izip!(probs, grad_probs).map(|(p, g)| p * g).sum();
    izip!(probs, grad_probs, grad_logits).for_each(|(&p, &g, out)| {
        *out += p * (g - dot);
    });
}

/// Index of the bin `[knots[i], knots[i + 1])` containing `value`.
///
/// `knots` must be non-decreasing with at least two entries. Values
/// outside the knot range are assigned to the first or last bin.
pub(crate) fn search_sorted(knots: &[f64], value: f64) -> usize {
    assert!(knots.len() >= 2);
    let num_bins = knots.len() - 1;
    let idx = knots.partition_point(|&knot| knot <= value);
    idx.saturating_sub(1).min(num_bins - 1)
}

/// `ln(1 + exp(x))` without overflow for large `x`.
pub(crate) fn softplus(x: f64) -> f64 {
    x.max(0.) + (-x.abs()).exp().ln_1p()
}

/// Derivative of [`softplus`].
pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

pub(crate) fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|val| val.is_finite())
}

/// Exponentially weighted moving average of the last `window` entries.
///
/// The weights are `exp(linspace(-1, 0, window))`, normalized, with the
/// most recent value receiving the largest weight. With fewer than
/// `window` values the last value is returned.
pub fn ewma(data: &[f64], window: usize) -> Option<f64> {
    let last = *data.last()?;
    if window < 2 || data.len() <= window {
        return Some(last);
    }

    let step = 1f64 / (window - 1) as f64;
    let weights = (0..window).map(|i| (-1f64 + i as f64 * step).exp());
    let total: f64 = weights.clone().sum();
    let tail = &data[data.len() - window..];
    let avg = izip!(tail, weights).map(|(&x, w)| x * w).sum::<f64>() / total;
    Some(avg)
}
