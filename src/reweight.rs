// reweight.rs - Reweighting of observables with a weight observable

use tracing::debug;

use crate::error::{ObsError, Result};
use crate::idl::Idl;
use crate::obs::Obs;
use crate::store::ensemble_of;

/// Reweights each observable in `obs` with `weight`: `<w o> / <w>`, both
/// evaluated on the configurations of the observable.
///
/// Every replica of an observable must also be a replica of the weight and
/// cover a subset of its configurations. The results carry the reweighted
/// flag and keep the merged flags of their inputs.
pub fn reweight(weight: &Obs, obs: &[Obs]) -> Result<Vec<Obs>> {
    if weight.reweighted() {
        return Err(ObsError::InconsistentFlags {
            detail: "the weight itself is already reweighted".into(),
        });
    }
    obs.iter().map(|o| reweight_one(weight, o)).collect()
}

fn reweight_one(weight: &Obs, o: &Obs) -> Result<Obs> {
    if o.reweighted() {
        return Err(ObsError::InconsistentFlags {
            detail: "cannot reweight an observable that is already reweighted".into(),
        });
    }

    let mut names = Vec::new();
    let mut idls: Vec<Idl> = Vec::new();
    let mut weighted = Vec::new();
    let mut weights = Vec::new();
    for (name, rep) in o.store().replicas() {
        let w = weight.store().replica(name).ok_or_else(|| {
            ObsError::mismatch(ensemble_of(name), format!("replica '{name}' is not part of the weight"))
        })?;
        if !rep.idl().is_subset_of(w.idl()) {
            return Err(ObsError::mismatch(
                ensemble_of(name),
                format!("replica '{name}' has configurations the weight does not cover"),
            ));
        }
        let w_samples: Vec<f64> = w
            .idl()
            .restrict(w.deltas(), rep.idl())?
            .into_iter()
            .map(|d| d + w.r_value())
            .collect();
        weighted.push(
            w_samples
                .iter()
                .zip(rep.deltas())
                .map(|(w, d)| w * (d + rep.r_value()))
                .collect::<Vec<f64>>(),
        );
        weights.push(w_samples);
        names.push(name.to_string());
        idls.push(rep.idl().clone());
    }

    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let numerator = Obs::with_idl(weighted, &name_refs, idls.clone())?;
    let denominator = Obs::with_idl(weights.clone(), &name_refs, idls)?;
    let mut out = numerator.try_div(&denominator)?;

    let merged = o.is_merged();
    let store = out.store_mut();
    store.set_reweighted(true);
    store.set_merged(&merged);
    for ensemble in o.mc_names() {
        let per_ensemble: Vec<f64> = names
            .iter()
            .zip(&weights)
            .filter(|(n, _)| ensemble_of(n) == ensemble)
            .flat_map(|(_, w)| w.iter().copied())
            .collect();
        let fraction = kish_fraction(&per_ensemble);
        debug!(ensemble = %ensemble, fraction, "reweighting effective sample size");
        if let Some(ens) = store.ensemble_mut(&ensemble) {
            ens.set_ess_fraction(fraction);
        }
    }
    Ok(out)
}

/// Kish effective sample size divided by the number of samples,
/// `(Σw)² / (N Σw²)`.
pub fn kish_fraction(weights: &[f64]) -> f64 {
    let sum: f64 = weights.iter().sum();
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq == 0.0 {
        return 1.0;
    }
    (sum * sum / (weights.len() as f64 * sum_sq)).clamp(0.0, 1.0)
}
