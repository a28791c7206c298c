use std::convert::Infallible;
use std::error::Error;
use std::fmt::Debug;

use crate::batch::Batch;

/// Errors that happen when we evaluate the integrand
pub trait IntegrandError: Error + Debug + Send + Sync + 'static {
    /// Unrecoverable errors stop training and integration, recoverable
    /// errors discard the batch.
    fn is_recoverable(&self) -> bool;
}

impl IntegrandError for Infallible {
    fn is_recoverable(&self) -> bool {
        match *self {}
    }
}

/// The function to integrate over the unit hypercube.
///
/// `evaluate` is called once per batch and must return one value per point.
/// Values may be non-finite; such points are excluded from losses and
/// estimates.
pub trait Integrand {
    type Err: IntegrandError;

    fn dim(&self) -> usize;
    fn evaluate(&mut self, points: &Batch) -> Result<Vec<f64>, Self::Err>;
}

impl<I: Integrand + ?Sized> Integrand for &mut I {
    type Err = I::Err;

    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn evaluate(&mut self, points: &Batch) -> Result<Vec<f64>, Self::Err> {
        (**self).evaluate(points)
    }
}

/// An infallible integrand defined by a function of a single point.
pub struct FnIntegrand<F> {
    dim: usize,
    func: F,
}

impl<F: FnMut(&[f64]) -> f64> FnIntegrand<F> {
    pub fn from_fn(dim: usize, func: F) -> Self {
        Self { dim, func }
    }
}

impl<F: FnMut(&[f64]) -> f64> Integrand for FnIntegrand<F> {
    type Err = Infallible;

    fn dim(&self) -> usize {
        self.dim
    }

    fn evaluate(&mut self, points: &Batch) -> Result<Vec<f64>, Self::Err> {
        Ok(points.rows().map(&mut self.func).collect())
    }
}
