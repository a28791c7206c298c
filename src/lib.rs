//! Monte Carlo integration with normalizing flows.
//!
//! A [`FlowModel`] is a stack of spline coupling layers on the unit
//! hypercube. The [`Trainer`] fits it to the shape of an [`Integrand`] by
//! minimizing a [`Divergence`] between the normalized integrand and the flow
//! density, using nothing but integrand evaluations at flow samples. The
//! trained flow is then used as the proposal of an importance sampling
//! [`Integrator`], which returns an unbiased [`Estimate`] with an error bar.
//!
//! ```no_run
//! use std::ops::ControlFlow;
//!
//! use flow_integrator::{
//!     FlowModel, FlowSettings, FnIntegrand, Integrator, TrainSettings, Trainer,
//! };
//! use rand::{rngs::SmallRng, SeedableRng};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut rng = SmallRng::seed_from_u64(42);
//! let mut integrand = FnIntegrand::from_fn(2, |x: &[f64]| {
//!     (-100. * ((x[0] - 0.5).powi(2) + (x[1] - 0.5).powi(2))).exp()
//! });
//!
//! let mut flow = FlowModel::new(FlowSettings::with_dim(2), &mut rng)?;
//! let mut trainer = Trainer::new(&mut flow, TrainSettings::default())?;
//! trainer.train(200, &mut integrand, &mut rng, |_| ControlFlow::Continue(()))?;
//! drop(trainer);
//!
//! let estimate = Integrator::new(&flow).estimate(&mut integrand, 100_000, 10, &mut rng)?;
//! println!("{} +- {}", estimate.mean, estimate.std_error);
//! # Ok(())
//! # }
//! ```

pub(crate) mod batch;
pub(crate) mod checkpoint;
pub(crate) mod conditioner;
pub(crate) mod coupling;
pub(crate) mod error;
pub(crate) mod flow;
pub(crate) mod integrand;
pub(crate) mod integrator;
pub(crate) mod loss;
pub(crate) mod math;
pub(crate) mod optimizer;
pub(crate) mod settings;
pub(crate) mod spline;
pub(crate) mod trainer;

pub use batch::Batch;
pub use checkpoint::{Checkpoint, CHECKPOINT_FORMAT_VERSION};
pub use conditioner::{Activation, Conditioner, ConditionerOptions};
pub use coupling::{unseparated_pairs, Bijector, CouplingLayer, MaskScheme};
pub use error::{FlowError, Result};
pub use flow::{CouplingStack, FlowGradient, FlowModel};
pub use integrand::{FnIntegrand, Integrand, IntegrandError};
pub use integrator::{
    combine_channels, ChannelCombination, Estimate, Integrator, MultiChannelIntegrator,
    RunningEstimate,
};
pub use loss::{Divergence, LossOutput};
pub use math::ewma;
pub use optimizer::{Adam, AdamOptions, LearningRate};
pub use settings::{FlowSettings, IntegrationSettings, TrainSettings};
pub use spline::{
    LinearSpline, QuadraticSpline, RationalQuadraticSpline, Spline, SplineKind, SplineOptions,
    DEFAULT_MIN_BIN_HEIGHT, DEFAULT_MIN_BIN_WIDTH, DEFAULT_MIN_DERIVATIVE,
};
pub use trainer::{ConvergenceWarning, TrainStep, Trainer, TrainerState};
