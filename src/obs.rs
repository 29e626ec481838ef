// obs.rs - Real observable: central value, sample store and lazily computed error

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use rayon::prelude::*;
use tracing::debug;

use crate::derive::{derive, derive_operands, Combinable};
use crate::dual::Dual;
use crate::error::{ObsError, Result};
use crate::gamma::{self, GammaConfig, Uncertainty};
use crate::idl::Idl;
use crate::store::SampleStore;

/// Monte-Carlo estimator backed by per-configuration deviations.
///
/// Observables are immutable. The uncertainty is computed by the gamma
/// method on first request and cached; it is never recomputed.
#[derive(Debug, Clone)]
pub struct Obs {
    value: f64,
    store: Arc<SampleStore>,
    uncertainty: OnceLock<Uncertainty>,
    tag: Option<String>,
}

impl Obs {
    /// Primary observable from replica samples with ids `1..=n` per replica.
    ///
    /// A name `"ens|rep"` places the replica `rep` in ensemble `ens`.
    pub fn new(samples: Vec<Vec<f64>>, names: &[&str]) -> Result<Self> {
        let (store, value) = SampleStore::from_samples(samples, names, None)?;
        Ok(Self::from_store(value, store))
    }

    /// Primary observable with explicit configuration ids per replica.
    pub fn with_idl(samples: Vec<Vec<f64>>, names: &[&str], idl: Vec<Idl>) -> Result<Self> {
        let (store, value) = SampleStore::from_samples(samples, names, Some(idl))?;
        Ok(Self::from_store(value, store))
    }

    /// Single-chain shorthand for [`Obs::new`].
    pub fn from_samples(samples: Vec<f64>, ensemble: &str) -> Result<Self> {
        Self::new(vec![samples], &[ensemble])
    }

    /// Reassembles an observable from its stored fields.
    pub fn from_parts(value: f64, store: SampleStore) -> Self {
        Self::from_store(value, store)
    }

    pub(crate) fn from_store(value: f64, store: SampleStore) -> Self {
        Self {
            value,
            store: Arc::new(store),
            uncertainty: OnceLock::new(),
            tag: None,
        }
    }

    pub(crate) fn store_mut(&mut self) -> &mut SampleStore {
        self.uncertainty = OnceLock::new();
        Arc::make_mut(&mut self.store)
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Runs the gamma method with the default configuration (cached).
    pub fn gamma_method(&self) -> &Uncertainty {
        self.uncertainty
            .get_or_init(|| gamma::run(&self.store, &GammaConfig::default()))
    }

    /// Runs the gamma method with `config` unless already computed.
    ///
    /// The first computation wins: a later call with another configuration
    /// returns the cached result. Use [`Obs::analyse`] to explore settings.
    pub fn gamma_method_with(&self, config: &GammaConfig) -> Result<&Uncertainty> {
        if let Some(done) = self.uncertainty.get() {
            if done.config != *config {
                debug!("uncertainty already computed with a different configuration");
            }
            return Ok(done);
        }
        config.validate()?;
        Ok(self
            .uncertainty
            .get_or_init(|| gamma::run(&self.store, config)))
    }

    /// Uncached gamma method.
    pub fn analyse(&self, config: &GammaConfig) -> Result<Uncertainty> {
        gamma::analyse(&self.store, config)
    }

    /// Cached uncertainty, if it was computed already.
    pub fn uncertainty(&self) -> Option<&Uncertainty> {
        self.uncertainty.get()
    }

    pub fn is_computed(&self) -> bool {
        self.uncertainty.get().is_some()
    }

    /// Total error; triggers the gamma method if needed.
    pub fn dvalue(&self) -> f64 {
        self.gamma_method().dvalue
    }

    pub fn ddvalue(&self) -> f64 {
        self.gamma_method().ddvalue
    }

    /// Error contribution of each ensemble.
    pub fn e_dvalue(&self) -> BTreeMap<String, f64> {
        self.gamma_method()
            .ensembles
            .iter()
            .map(|(e, a)| (e.clone(), a.dvalue))
            .collect()
    }

    pub fn e_tauint(&self) -> BTreeMap<String, f64> {
        self.gamma_method()
            .ensembles
            .iter()
            .map(|(e, a)| (e.clone(), a.tauint))
            .collect()
    }

    pub fn e_windowsize(&self) -> BTreeMap<String, usize> {
        self.gamma_method()
            .ensembles
            .iter()
            .map(|(e, a)| (e.clone(), a.window))
            .collect()
    }

    /// Replica name -> deviations.
    pub fn deltas(&self) -> BTreeMap<String, Vec<f64>> {
        self.store
            .replicas()
            .map(|(n, r)| (n.to_string(), r.deltas().to_vec()))
            .collect()
    }

    /// Replica name -> configuration ids.
    pub fn idl(&self) -> BTreeMap<String, Idl> {
        self.store
            .replicas()
            .map(|(n, r)| (n.to_string(), r.idl().clone()))
            .collect()
    }

    /// Replica name -> central value on that replica.
    pub fn r_values(&self) -> BTreeMap<String, f64> {
        self.store
            .replicas()
            .map(|(n, r)| (n.to_string(), r.r_value()))
            .collect()
    }

    /// Replica name -> number of configurations.
    pub fn shape(&self) -> BTreeMap<String, usize> {
        self.store.replicas().map(|(n, r)| (n.to_string(), r.len())).collect()
    }

    pub fn ensemble_deltas(&self, ensemble: &str) -> Option<Vec<f64>> {
        self.store.ensemble_deltas(ensemble)
    }

    pub fn ensemble_idl(&self, ensemble: &str) -> Option<Vec<usize>> {
        self.store.ensemble_idl(ensemble)
    }

    /// All replica names.
    pub fn names(&self) -> Vec<String> {
        self.store.replicas().map(|(n, _)| n.to_string()).collect()
    }

    pub fn mc_names(&self) -> Vec<String> {
        self.store.mc_names()
    }

    pub fn e_content(&self) -> BTreeMap<String, Vec<String>> {
        self.store.e_content()
    }

    pub fn is_merged(&self) -> BTreeMap<String, bool> {
        self.store.is_merged()
    }

    pub fn reweighted(&self) -> bool {
        self.store.reweighted()
    }

    /// Total number of configurations over all ensembles.
    pub fn n_samples(&self) -> usize {
        self.store.ensembles().values().map(|e| e.n_samples()).sum()
    }

    pub fn same_configuration_set(&self, other: &Obs) -> bool {
        same_configuration_set(self, other)
    }

    /// True if value and every deviation vanish within `atol`.
    pub fn is_zero(&self, atol: f64) -> bool {
        self.value.abs() <= atol
            && self
                .store
                .replicas()
                .all(|(_, r)| r.deltas().iter().all(|d| d.abs() <= atol))
    }

    /// True if `|value| <= sigma * dvalue`.
    pub fn is_zero_within_error(&self, sigma: f64) -> bool {
        self.value.abs() <= sigma * self.dvalue()
    }

    /// Applies a one-argument function with its closed-form derivative.
    pub fn map(&self, f: impl Fn(Dual) -> Dual) -> Obs {
        let out = f(Dual::variable(self.value));
        let store = self.store.scaled(out.eps, |r| f(Dual::constant(r)).re);
        Obs::from_store(out.re, store)
    }

    /// Generic propagation over several operands (observables and scalars).
    pub fn combine(f: impl Fn(&[Dual]) -> Dual, operands: &[&dyn Combinable]) -> Result<Obs> {
        derive_operands(f, operands)
    }

    pub fn exp(&self) -> Obs {
        self.map(Dual::exp)
    }

    pub fn ln(&self) -> Obs {
        self.map(Dual::ln)
    }

    pub fn log10(&self) -> Obs {
        self.map(Dual::log10)
    }

    pub fn sqrt(&self) -> Obs {
        self.map(Dual::sqrt)
    }

    pub fn recip(&self) -> Obs {
        self.map(Dual::recip)
    }

    pub fn abs(&self) -> Obs {
        self.map(Dual::abs)
    }

    pub fn powi(&self, n: i32) -> Obs {
        self.map(|x| x.powi(n))
    }

    pub fn powf(&self, n: f64) -> Obs {
        self.map(|x| x.powf(n))
    }

    /// `self^exponent` with an observable exponent.
    pub fn pow(&self, exponent: &Obs) -> Result<Obs> {
        derive(|x| x[0].pow(x[1]), &[self, exponent])
    }

    pub fn sin(&self) -> Obs {
        self.map(Dual::sin)
    }

    pub fn cos(&self) -> Obs {
        self.map(Dual::cos)
    }

    pub fn tan(&self) -> Obs {
        self.map(Dual::tan)
    }

    pub fn asin(&self) -> Obs {
        self.map(Dual::asin)
    }

    pub fn acos(&self) -> Obs {
        self.map(Dual::acos)
    }

    pub fn atan(&self) -> Obs {
        self.map(Dual::atan)
    }

    pub fn atan2(&self, x: &Obs) -> Result<Obs> {
        derive(|v| v[0].atan2(v[1]), &[self, x])
    }

    pub fn sinh(&self) -> Obs {
        self.map(Dual::sinh)
    }

    pub fn cosh(&self) -> Obs {
        self.map(Dual::cosh)
    }

    pub fn tanh(&self) -> Obs {
        self.map(Dual::tanh)
    }

    pub fn asinh(&self) -> Obs {
        self.map(Dual::asinh)
    }

    pub fn acosh(&self) -> Obs {
        self.map(Dual::acosh)
    }

    pub fn atanh(&self) -> Obs {
        self.map(Dual::atanh)
    }

    /// Multi-line summary of value, error and per-ensemble diagnostics.
    pub fn details(&self) -> String {
        let u = self.gamma_method();
        let mut out = String::new();
        if let Some(tag) = &self.tag {
            out.push_str(&format!("Description: {tag}\n"));
        }
        let percent = if self.value != 0.0 {
            100.0 * u.dvalue / self.value.abs()
        } else {
            f64::NAN
        };
        out.push_str(&format!(
            "Result\t {:.8e} +/- {:.8e} +/- {:.8e} ({:.3}%)\n",
            self.value, u.dvalue, u.ddvalue, percent
        ));
        if self.reweighted() {
            out.push_str(" (reweighted)\n");
        }
        for (name, e) in &u.ensembles {
            out.push_str(&format!(
                " {name}: {:.8e} +/- {:.8e}  tau_int = {:.4} +/- {:.4}  W = {}  N = {}{}\n",
                e.dvalue,
                e.ddvalue,
                e.tauint,
                e.dtauint,
                e.window,
                e.n_samples,
                if self.store.ensemble(name).is_some_and(|x| x.is_merged()) {
                    "  (merged)"
                } else {
                    ""
                }
            ));
        }
        for w in &u.warnings {
            out.push_str(&format!(" warning: {w}\n"));
        }
        out
    }
}

impl PartialEq for Obs {
    fn eq(&self, other: &Obs) -> bool {
        self.value == other.value && self.store == other.store
    }
}

impl fmt::Display for Obs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uncertainty.get() {
            Some(u) => write!(f, "{}", format_value_error(self.value, u.dvalue, 2)),
            None => write!(f, "{}", self.value),
        }
    }
}

/// `value(error)` notation with `significance` digits of the error.
pub fn format_value_error(value: f64, dvalue: f64, significance: i32) -> String {
    if dvalue == 0.0 || !dvalue.is_finite() {
        return format!("{value}");
    }
    let sig = significance.max(1);
    let fexp = dvalue.log10().floor() as i32;
    if fexp < 0 {
        let digits = (sig - 1 - fexp) as usize;
        let err = (dvalue * 10f64.powi(sig - 1 - fexp)).round();
        format!("{value:.digits$}({err:.0})")
    } else if fexp < sig {
        let digits = (sig - 1 - fexp) as usize;
        format!("{value:.digits$}({dvalue:.digits$})")
    } else {
        format!("{value:.0}({dvalue:.0})")
    }
}

/// Same ensembles, replicas, id lists, merge flags and reweighting.
pub fn same_configuration_set(a: &Obs, b: &Obs) -> bool {
    a.store.same_configuration_set(&b.store)
}

/// Runs the default gamma method on all observables in parallel.
pub fn gamma_method_all(obs: &[Obs]) {
    obs.par_iter().for_each(|o| {
        o.gamma_method();
    });
}

/// Fails with the first property in which the observables differ.
pub fn check_same_configs(obs: &[Obs]) -> Result<()> {
    let Some((head, tail)) = obs.split_first() else {
        return Ok(());
    };
    for o in tail {
        if head.is_merged() != o.is_merged() || head.e_content() != o.e_content() {
            return Err(ObsError::mismatch(
                o.mc_names().join(","),
                "observables are not defined on the same set of ensembles",
            ));
        }
        if head.reweighted() != o.reweighted() {
            return Err(ObsError::InconsistentFlags {
                detail: "all observables must share the property 'reweighted'".to_string(),
            });
        }
        if head.idl() != o.idl() {
            return Err(ObsError::mismatch(
                o.mc_names().join(","),
                "observables are not defined on the same configurations",
            ));
        }
    }
    Ok(())
}
