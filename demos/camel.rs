//! Train a flow on the two dimensional camel function and compare the
//! importance sampling estimate against plain uniform sampling.
//!
//! Run with `RUST_LOG=flow_integrator=debug` to see every training step.

use std::ops::ControlFlow;

use anyhow::Result;
use flow_integrator::{
    combine_channels, AdamOptions, Checkpoint, ConditionerOptions, FlowModel, FlowSettings,
    FnIntegrand, Integrator, LearningRate, MaskScheme, SplineKind, SplineOptions, TrainSettings,
    Trainer,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

const EPOCHS: u64 = 500;

fn camel(x: &[f64]) -> f64 {
    let bump = |center: f64| {
        let r2: f64 = x.iter().map(|xi| (xi - center).powi(2)).sum();
        (-r2 / 0.004).exp()
    };
    bump(0.25) + bump(0.75)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let mut integrand = FnIntegrand::from_fn(2, camel);

    let settings = FlowSettings {
        dim: 2,
        num_layers: Some(4),
        masks: MaskScheme::Alternating,
        spline: SplineOptions {
            kind: SplineKind::RationalQuadratic,
            num_bins: 32,
            ..Default::default()
        },
        conditioner: ConditionerOptions {
            hidden_layers: 3,
            hidden_width: 32,
            one_blob_bins: Some(16),
            ..Default::default()
        },
    };
    let uniform = FlowModel::new(settings.clone(), &mut rng)?;
    let mut flow = FlowModel::new(settings, &mut rng)?;

    let checkpoint_path = std::env::temp_dir().join("camel-flow.json");
    let train = TrainSettings {
        batch_size: 5000,
        keep_best: true,
        adam: AdamOptions {
            learning_rate: LearningRate::CosineAnnealing {
                base: 1e-2,
                total_steps: EPOCHS,
                eta_min: 1e-4,
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let mut trainer = Trainer::new(&mut flow, train)?.with_checkpoint(&checkpoint_path);
    trainer.train(EPOCHS, &mut integrand, &mut rng, |step| {
        if step.step_index % 10 == 0 {
            info!(
                epoch = step.step_index,
                loss = step.loss,
                integral = step.integral,
                error = step.std_error,
                "training"
            );
        }
        ControlFlow::Continue(())
    })?;
    if let Some(warning) = trainer.convergence_warning() {
        info!(?warning, "loss plateaued");
    }
    let ewma = trainer.ewma_integral(trainer.settings().ewma_window);
    drop(trainer);
    info!(?ewma, "moving average of the training estimates");

    let best = Checkpoint::load(Checkpoint::best_path(&checkpoint_path))?;
    info!(step = best.step, "integrating with the parameters of the lowest loss");
    let flow = best.flow;
    let trained = Integrator::new(&flow).estimate(&mut integrand, 100_000, 10, &mut rng)?;
    let plain = Integrator::new(&uniform).estimate(&mut integrand, 100_000, 10, &mut rng)?;
    let exact = 2. * 0.004 * std::f64::consts::PI;

    println!("exact     {exact:.6}");
    println!(
        "flow      {:.6} +- {:.6}  (unweighting efficiency {:.3})",
        trained.mean, trained.std_error, trained.unweighting_efficiency
    );
    println!(
        "uniform   {:.6} +- {:.6}  (unweighting efficiency {:.3})",
        plain.mean, plain.std_error, plain.unweighting_efficiency
    );

    let combined = combine_channels(&[trained, plain])?;
    println!(
        "combined  {:.6} +- {:.6}  (chi2/dof {:.2}, weights {:?})",
        combined.mean, combined.std_error, combined.chi2_per_dof, combined.weights
    );
    Ok(())
}
