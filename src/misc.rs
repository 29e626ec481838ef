// misc.rs - Synthetic observables: pseudo observables and correlated Markov chains

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{ObsError, Result};
use crate::obs::Obs;

/// Observable on ensemble `name` with central value `value` whose gamma-method
/// error (default settings) is exactly `dvalue`.
///
/// The samples are independent normal draws, rescaled after a first
/// analysis. A non-positive `dvalue` yields constant samples.
pub fn pseudo_obs<R: Rng + ?Sized>(
    value: f64,
    dvalue: f64,
    name: &str,
    samples: usize,
    rng: &mut R,
) -> Result<Obs> {
    if !value.is_finite() || !dvalue.is_finite() {
        return Err(ObsError::invalid_parameter("value and error must be finite"));
    }
    if dvalue <= 0.0 {
        return Obs::from_samples(vec![value; samples], name);
    }

    let mut deltas: Vec<f64> = (0..samples)
        .map(|_| rng.sample::<f64, _>(StandardNormal))
        .collect();
    let mean = deltas.iter().sum::<f64>() / samples.max(1) as f64;
    deltas.iter_mut().for_each(|d| *d -= mean);

    // the error estimate is linear in the scale of the deviations
    let draft = Obs::from_samples(deltas.clone(), name)?;
    let estimate = draft.dvalue();
    if estimate <= 0.0 {
        return Err(ObsError::invalid_samples("random draws have zero variance"));
    }
    let scale = dvalue / estimate;
    let out = Obs::from_samples(deltas.iter().map(|d| value + scale * d).collect(), name)?;
    Ok(Obs::from_parts(value, out.store().clone()))
}

/// Autoregressive chains with prescribed means, covariance and integrated
/// autocorrelation times, one observable per mean on the ensemble `name`.
///
/// `tau` holds either one value for all chains or one per chain; every entry
/// must be at least 0.5. Each chain is an AR(1) process with coefficient
/// `a = (2τ - 1) / (2τ + 1)`, shifted afterwards to reproduce its mean
/// exactly; for τ = 0.5 the returned observables have covariance `cov`, and
/// autocorrelation inflates the error of chain i by `sqrt(2 τ_i)`.
pub fn gen_correlated_data<R: Rng + ?Sized>(
    means: &[f64],
    cov: &DMatrix<f64>,
    name: &str,
    tau: &[f64],
    samples: usize,
    rng: &mut R,
) -> Result<Vec<Obs>> {
    let dim = means.len();
    if dim == 0 || cov.nrows() != dim || cov.ncols() != dim {
        return Err(ObsError::shape(format!(
            "covariance is {}x{} for {dim} means",
            cov.nrows(),
            cov.ncols()
        )));
    }
    let tau: Vec<f64> = match tau.len() {
        1 => vec![tau[0]; dim],
        n if n == dim => tau.to_vec(),
        n => return Err(ObsError::shape(format!("{n} autocorrelation times for {dim} means"))),
    };
    if let Some(t) = tau.iter().find(|&&t| !(t >= 0.5)) {
        return Err(ObsError::invalid_parameter(format!(
            "integrated autocorrelation times must be >= 0.5, got {t}"
        )));
    }
    let chol = cov
        .clone()
        .cholesky()
        .ok_or_else(|| ObsError::invalid_parameter("covariance is not positive definite"))?;
    let l = chol.l();

    // innovations with covariance `cov * samples`, normalised to exact sample variance
    let mut innovations: Vec<DVector<f64>> = (0..samples)
        .map(|_| {
            let z = DVector::from_fn(dim, |_, _| rng.sample::<f64, _>(StandardNormal));
            &l * z * (samples as f64).sqrt()
        })
        .collect();
    for i in 0..dim {
        let var = sample_variance(innovations.iter().map(|v| v[i]));
        if var > 0.0 {
            let norm = (cov[(i, i)] * samples as f64 / var).sqrt();
            innovations.iter_mut().for_each(|v| v[i] *= norm);
        }
    }

    let a: Vec<f64> = tau.iter().map(|t| (2.0 * t - 1.0) / (2.0 * t + 1.0)).collect();
    let mut chains = vec![Vec::with_capacity(samples); dim];
    let mut state = vec![0.0; dim];
    for (step, x) in innovations.iter().enumerate() {
        for i in 0..dim {
            state[i] = if step == 0 {
                x[i]
            } else {
                (1.0 - a[i] * a[i]).sqrt() * x[i] + a[i] * state[i]
            };
            chains[i].push(state[i]);
        }
    }

    chains
        .into_iter()
        .zip(means)
        .map(|(chain, &mean)| {
            let avg = chain.iter().sum::<f64>() / samples.max(1) as f64;
            Obs::from_samples(chain.into_iter().map(|x| x - avg + mean).collect(), name)
        })
        .collect()
}

fn sample_variance(xs: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = xs.clone().count();
    if n < 2 {
        return 0.0;
    }
    let mean = xs.clone().sum::<f64>() / n as f64;
    xs.map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
}
