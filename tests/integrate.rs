use std::ops::ControlFlow;

use anyhow::Result;
use flow_integrator::{
    AdamOptions, ConditionerOptions, FlowModel, FlowSettings, FnIntegrand, Integrator,
    LearningRate, TrainSettings, Trainer, TrainerState,
};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

fn gaussian_peak(x: &[f64]) -> f64 {
    let sigma2: f64 = 0.1 * 0.1;
    let r2: f64 = x.iter().map(|xi| (xi - 0.5).powi(2)).sum();
    (-r2 / (2. * sigma2)).exp()
}

/// Integral of `gaussian_peak` over the unit square.
fn gaussian_peak_integral() -> f64 {
    // erf(2.5 * sqrt(2)), the mass of a normal within 5 sigma
    let one_dim = 0.1 * (2. * std::f64::consts::PI).sqrt() * 0.999_999_426_696_856_3;
    one_dim * one_dim
}

#[test]
fn constant_integrand_with_identity_flow() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(0);
    let flow = FlowModel::new(FlowSettings::with_dim(2), &mut rng)?;
    let mut integrand = FnIntegrand::from_fn(2, |_: &[f64]| 1.);
    let estimate = Integrator::new(&flow).estimate(&mut integrand, 10_000, 10, &mut rng)?;
    assert!((estimate.mean - 1.).abs() < 1e-10);
    assert!(estimate.std_error < 1e-10);
    assert_eq!(estimate.effective_sample_size, 10_000);
    assert!((estimate.unweighting_efficiency - 1.).abs() < 1e-10);
    Ok(())
}

#[test]
fn single_nan_is_excluded() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(1);
    let flow = FlowModel::new(FlowSettings::with_dim(2), &mut rng)?;
    let mut calls = 0;
    let mut integrand = FnIntegrand::from_fn(2, |_: &[f64]| {
        calls += 1;
        if calls == 500 {
            f64::NAN
        } else {
            2.
        }
    });
    let estimate = Integrator::new(&flow).estimate(&mut integrand, 1000, 1, &mut rng)?;
    assert_eq!(estimate.effective_sample_size, 999);
    assert_eq!(estimate.n_excluded, 1);
    assert_eq!(estimate.samples_drawn, 1000);
    assert!((estimate.mean - 2.).abs() < 1e-10);
    Ok(())
}

#[test]
fn error_shrinks_with_sample_size() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(2);
    let flow = FlowModel::new(FlowSettings::with_dim(2), &mut rng)?;
    let mut integrand = FnIntegrand::from_fn(2, |x: &[f64]| x[0] * x[0] + x[1]);
    let integrator = Integrator::new(&flow);
    let small = integrator.estimate(&mut integrand, 1_000, 4, &mut rng)?;
    let large = integrator.estimate(&mut integrand, 100_000, 4, &mut rng)?;
    let ratio = small.std_error / large.std_error;
    assert!((ratio - 10.).abs() < 1.5, "ratio {ratio}");
    Ok(())
}

#[test]
fn estimates_are_unbiased() -> Result<()> {
    // A briefly trained flow is a valid, if poor, proposal.
    let mut rng = StdRng::seed_from_u64(3);
    let mut flow = FlowModel::new(FlowSettings::with_dim(3), &mut rng)?;
    let mut integrand = FnIntegrand::from_fn(3, |x: &[f64]| x[0] * x[1] * x[2] * 8.);
    {
        let settings = TrainSettings {
            batch_size: 200,
            ..Default::default()
        };
        let mut trainer = Trainer::new(&mut flow, settings)?;
        trainer.train(20, &mut integrand, &mut rng, |_| ControlFlow::Continue(()))?;
    }

    let integrator = Integrator::new(&flow);
    let mut within = 0;
    for _ in 0..20 {
        let estimate = integrator.estimate(&mut integrand, 2_000, 2, &mut rng)?;
        if (estimate.mean - 1.).abs() < 2. * estimate.std_error {
            within += 1;
        }
    }
    assert!(within >= 15, "only {within} of 20 estimates within two sigma");
    Ok(())
}

#[test]
fn training_reduces_variance() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(4);
    let settings = FlowSettings {
        conditioner: ConditionerOptions {
            hidden_width: 16,
            ..Default::default()
        },
        ..FlowSettings::with_dim(2)
    };
    let mut flow = FlowModel::new(settings, &mut rng)?;
    let mut integrand = FnIntegrand::from_fn(2, gaussian_peak);

    let before = Integrator::new(&flow).estimate(&mut integrand, 20_000, 4, &mut rng)?;

    let settings = TrainSettings {
        batch_size: 500,
        adam: AdamOptions {
            learning_rate: LearningRate::Constant(1e-2),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut trainer = Trainer::new(&mut flow, settings)?;
    trainer.train(300, &mut integrand, &mut rng, |_| ControlFlow::Continue(()))?;
    assert_eq!(trainer.state(), TrainerState::Training);
    let first_loss = trainer.history()[..10].iter().map(|s| s.loss).sum::<f64>();
    let last_loss = trainer.history()[290..].iter().map(|s| s.loss).sum::<f64>();
    assert!(last_loss < first_loss);
    drop(trainer);

    let after = Integrator::new(&flow).estimate(&mut integrand, 20_000, 4, &mut rng)?;
    assert!(
        after.std_error < 0.6 * before.std_error,
        "{} vs {}",
        after.std_error,
        before.std_error
    );
    let exact = gaussian_peak_integral();
    assert!((after.mean - exact).abs() < 4. * after.std_error);
    Ok(())
}

#[test]
fn volume_of_random_flow() -> Result<()> {
    // mean(1 / q) over flow samples estimates the volume of the cube
    let mut rng = StdRng::seed_from_u64(5);
    let mut flow = FlowModel::new(FlowSettings::with_dim(4), &mut rng)?;
    let noise = Normal::new(0., 1.)?;
    let mut integrand = FnIntegrand::from_fn(4, |x: &[f64]| 1. + x[3]);
    {
        let mut trainer = Trainer::new(&mut flow, TrainSettings::default())?;
        trainer.train(5, &mut integrand, &mut rng, |_| ControlFlow::Continue(()))?;
    }
    let mut unit = FnIntegrand::from_fn(4, |_: &[f64]| 1.);
    let estimate = Integrator::new(&flow).estimate(&mut unit, 20_000, 2, &mut rng)?;
    assert!((estimate.mean - 1.).abs() < 4. * estimate.std_error + 1e-12);

    // The same holds for any smooth integrand with a known integral.
    let shift = noise.sample(&mut rng);
    let mut shifted = FnIntegrand::from_fn(4, move |x: &[f64]| x[0] + shift);
    let estimate = Integrator::new(&flow).estimate(&mut shifted, 20_000, 2, &mut rng)?;
    assert!((estimate.mean - (0.5 + shift)).abs() < 4. * estimate.std_error + 1e-12);
    Ok(())
}
