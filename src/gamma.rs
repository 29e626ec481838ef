// gamma.rs - Autocorrelation-aware error estimation (gamma method, automatic windowing)

use std::collections::BTreeMap;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ObsError, Result};
use crate::idl::common_gap;
use crate::store::{Ensemble, SampleStore};

/// Default scale factor S of the automatic windowing procedure.
pub const DEFAULT_S: f64 = 2.0;

/// Lower bound of the running τ_int(W) for W >= 1.
const TAUINT_FLOOR: f64 = 0.5 + f64::EPSILON;

/// Stopping rule used to pick the summation window of ρ(t).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WindowRule {
    /// Wolff (hep-lat/0306017): first W with
    /// `exp(-W/τ) - τ/sqrt(W·N) < 0`, `τ = S / ln((2τ_int+1)/(2τ_int-1))`.
    #[default]
    Wolff,
    /// Sokal: first W with `W >= S · τ_int(W)`.
    Sokal,
}

/// Tuning parameters of the gamma method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GammaConfig {
    /// Scale factor S; `0` switches the autocorrelation analysis off.
    pub s: f64,
    /// Ensemble-specific overrides of `s`.
    pub s_per_ensemble: BTreeMap<String, f64>,
    pub rule: WindowRule,
    /// Exponential autocorrelation time attached as a tail; `0` disables it.
    pub tau_exp: f64,
    pub tau_exp_per_ensemble: BTreeMap<String, f64>,
    /// Significance (in δρ units) at which ρ(W) counts as vanished when a tail is attached.
    pub n_sigma: f64,
    /// Hard cap on the searched window, in configuration-id units.
    pub max_window: Option<usize>,
    /// Apply the finite-N bias correction of τ_int and Γ(0).
    pub bias_correction: bool,
}

impl Default for GammaConfig {
    fn default() -> Self {
        Self {
            s: DEFAULT_S,
            s_per_ensemble: BTreeMap::new(),
            rule: WindowRule::Wolff,
            tau_exp: 0.0,
            tau_exp_per_ensemble: BTreeMap::new(),
            n_sigma: 1.0,
            max_window: None,
            bias_correction: true,
        }
    }
}

impl GammaConfig {
    pub fn with_s(mut self, s: f64) -> Self {
        self.s = s;
        self
    }

    pub fn with_ensemble_s(mut self, ensemble: impl Into<String>, s: f64) -> Self {
        self.s_per_ensemble.insert(ensemble.into(), s);
        self
    }

    pub fn with_rule(mut self, rule: WindowRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_tau_exp(mut self, tau_exp: f64) -> Self {
        self.tau_exp = tau_exp;
        self
    }

    pub fn with_ensemble_tau_exp(mut self, ensemble: impl Into<String>, tau_exp: f64) -> Self {
        self.tau_exp_per_ensemble.insert(ensemble.into(), tau_exp);
        self
    }

    pub fn with_n_sigma(mut self, n_sigma: f64) -> Self {
        self.n_sigma = n_sigma;
        self
    }

    pub fn with_max_window(mut self, max_window: usize) -> Self {
        self.max_window = Some(max_window);
        self
    }

    pub fn with_bias_correction(mut self, on: bool) -> Self {
        self.bias_correction = on;
        self
    }

    pub fn s_for(&self, ensemble: &str) -> f64 {
        self.s_per_ensemble.get(ensemble).copied().unwrap_or(self.s)
    }

    pub fn tau_exp_for(&self, ensemble: &str) -> f64 {
        self.tau_exp_per_ensemble
            .get(ensemble)
            .copied()
            .unwrap_or(self.tau_exp)
    }

    pub fn validate(&self) -> Result<()> {
        let all_s = std::iter::once(self.s).chain(self.s_per_ensemble.values().copied());
        for s in all_s {
            if !(s >= 0.0 && s.is_finite()) {
                return Err(ObsError::invalid_parameter(format!("S must be >= 0, got {s}")));
            }
        }
        let all_tau = std::iter::once(self.tau_exp).chain(self.tau_exp_per_ensemble.values().copied());
        for t in all_tau {
            if !(t >= 0.0 && t.is_finite()) {
                return Err(ObsError::invalid_parameter(format!("tau_exp must be >= 0, got {t}")));
            }
        }
        if !(self.n_sigma >= 0.0) {
            return Err(ObsError::invalid_parameter("n_sigma must be >= 0"));
        }
        if self.max_window == Some(0) {
            return Err(ObsError::invalid_parameter("max_window must be positive"));
        }
        Ok(())
    }
}

/// Non-fatal diagnostic: no self-consistent window inside the searched range.
///
/// The error of the ensemble was computed with the largest searched window
/// and most likely underestimates the true uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutocorrelationWindowWarning {
    pub ensemble: String,
    /// Largest window tried, in configuration-id units.
    pub searched_window: usize,
    /// τ_int at that window.
    pub tauint: f64,
}

impl fmt::Display for AutocorrelationWindowWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ensemble '{}': no self-consistent window up to W = {} (tau_int = {:.3}); \
             the error is likely underestimated",
            self.ensemble, self.searched_window, self.tauint
        )
    }
}

/// Result of the gamma method for one ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleAnalysis {
    /// Number of configurations over all replicas.
    pub n_samples: usize,
    /// Configuration spacing the lags are measured in.
    pub gap: usize,
    /// Bias-corrected integrated autocorrelation time.
    pub tauint: f64,
    pub dtauint: f64,
    /// Contribution of this ensemble to the total error.
    pub dvalue: f64,
    /// Error of `dvalue`.
    pub ddvalue: f64,
    /// Error assuming no autocorrelation, `sqrt(Γ(0)/N)`.
    pub naive_dvalue: f64,
    /// Selected window in configuration-id units.
    pub window: usize,
    /// Normalised autocorrelation function ρ(t), t in units of `gap`.
    pub rho: Vec<f64>,
    /// Running τ_int(W) before bias correction, floored at 0.5.
    pub n_tauint: Vec<f64>,
    pub n_dtauint: Vec<f64>,
    /// δρ at the selected window.
    pub drho: f64,
    /// True when the window search hit its upper bound.
    pub window_exhausted: bool,
}

impl EnsembleAnalysis {
    fn trivial(n_samples: usize, gap: usize) -> Self {
        Self {
            n_samples,
            gap,
            tauint: 0.5,
            dtauint: 0.0,
            dvalue: 0.0,
            ddvalue: 0.0,
            naive_dvalue: 0.0,
            window: 0,
            rho: Vec::new(),
            n_tauint: Vec::new(),
            n_dtauint: Vec::new(),
            drho: 0.0,
            window_exhausted: false,
        }
    }
}

/// Total uncertainty of an observable with its per-ensemble breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uncertainty {
    pub dvalue: f64,
    pub ddvalue: f64,
    pub ensembles: BTreeMap<String, EnsembleAnalysis>,
    pub warnings: Vec<AutocorrelationWindowWarning>,
    pub config: GammaConfig,
}

impl Uncertainty {
    pub fn ensemble(&self, name: &str) -> Option<&EnsembleAnalysis> {
        self.ensembles.get(name)
    }

    /// Fraction of the total variance contributed by each ensemble.
    pub fn error_budget(&self) -> BTreeMap<String, f64> {
        let total = self.dvalue * self.dvalue;
        self.ensembles
            .iter()
            .map(|(name, e)| {
                let share = if total > 0.0 { e.dvalue * e.dvalue / total } else { 0.0 };
                (name.clone(), share)
            })
            .collect()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Runs the gamma method on every ensemble of `store`.
pub fn analyse(store: &SampleStore, config: &GammaConfig) -> Result<Uncertainty> {
    config.validate()?;
    Ok(run(store, config))
}

/// [`analyse`] for a configuration already known to be valid.
pub(crate) fn run(store: &SampleStore, config: &GammaConfig) -> Uncertainty {
    let reweighted = store.reweighted();
    let results: Vec<(String, EnsembleAnalysis)> = store
        .ensembles()
        .par_iter()
        .map(|(name, ens)| (name.clone(), analyse_ensemble(name, ens, reweighted, config)))
        .collect();

    let mut warnings = Vec::new();
    let mut variance = 0.0;
    let mut dd = 0.0;
    for (name, e) in &results {
        variance += e.dvalue * e.dvalue;
        dd += (e.dvalue * e.ddvalue).powi(2);
        if e.window_exhausted {
            let w = AutocorrelationWindowWarning {
                ensemble: name.clone(),
                searched_window: e.window,
                tauint: e.tauint,
            };
            warn!(
                ensemble = name.as_str(),
                window = e.window,
                tauint = e.tauint,
                "automatic windowing failed to find a self-consistent window"
            );
            warnings.push(w);
        }
    }
    let dvalue = variance.sqrt();
    let ddvalue = if dvalue > 0.0 { dd.sqrt() / dvalue } else { 0.0 };
    Uncertainty {
        dvalue,
        ddvalue,
        ensembles: results.into_iter().collect(),
        warnings,
        config: config.clone(),
    }
}

/// Autocorrelation function Γ(t) of an ensemble, t = 0..w_max in units of `gap`.
///
/// Replicas are zero-padded onto the regular grid and each lag is normalised
/// by the number of configuration pairs actually present.
pub fn gamma_function(ens: &Ensemble, gap: usize, w_max: usize) -> Vec<f64> {
    let chains: Vec<(Vec<f64>, Vec<f64>)> = ens
        .pooled_deltas()
        .into_iter()
        .map(|(idl, d)| {
            let ones = vec![1.0; d.len()];
            (idl.expand(&d, gap), idl.expand(&ones, gap))
        })
        .collect();

    (0..w_max)
        .into_par_iter()
        .map(|t| {
            let mut num = 0.0;
            let mut den = 0.0;
            for (d, m) in &chains {
                if t >= d.len() {
                    continue;
                }
                num += d[..d.len() - t].iter().zip(&d[t..]).map(|(a, b)| a * b).sum::<f64>();
                den += m[..m.len() - t].iter().zip(&m[t..]).map(|(a, b)| a * b).sum::<f64>();
            }
            num / den.max(1.0)
        })
        .collect()
}

fn analyse_ensemble(
    name: &str,
    ens: &Ensemble,
    reweighted: bool,
    config: &GammaConfig,
) -> EnsembleAnalysis {
    let n_samples = ens.n_samples();
    let gap = common_gap(ens.replicas().values().map(|r| r.idl()));
    let n = n_samples as f64;
    // Reweighting lowers the effective number of independent configurations.
    let n_eff = match (reweighted, ens.ess_fraction()) {
        (true, Some(f)) if f > 0.0 => n * f.min(1.0),
        _ => n,
    };

    let longest = ens
        .replicas()
        .values()
        .map(|r| r.idl().span(gap))
        .max()
        .unwrap_or(1);
    let mut w_max = (longest / 2).max(2);
    if let Some(cap) = config.max_window {
        w_max = w_max.min(cap / gap + 1).max(2);
    }

    let gamma = gamma_function(ens, gap, w_max);
    let gamma0 = gamma[0];
    // rounding noise of the replica means counts as zero variance
    let scale = ens
        .replicas()
        .values()
        .map(|r| r.r_value().abs())
        .fold(0.0, f64::max);
    let floor = (10.0 * f64::EPSILON * scale).powi(2).max(10.0 * f64::MIN_POSITIVE);
    if !(gamma0 > floor) {
        return EnsembleAnalysis::trivial(n_samples, gap);
    }
    let naive_dvalue = (gamma0 / n).sqrt();

    let rho: Vec<f64> = gamma.iter().map(|g| g / gamma0).collect();
    let mut n_tauint = Vec::with_capacity(w_max);
    let mut acc = 0.5;
    n_tauint.push(acc);
    for r in &rho[1..] {
        acc += r;
        // anticorrelation never shrinks the error below the naive estimate
        n_tauint.push(if acc > 0.5 { acc } else { TAUINT_FLOOR });
    }
    let mut n_dtauint: Vec<f64> = n_tauint
        .iter()
        .enumerate()
        .map(|(w, &tau)| 2.0 * tau * ((w as f64 + 0.5 - tau).abs() / n_eff).sqrt())
        .collect();
    n_dtauint[0] = 0.0;

    let bias = |w: usize| {
        if config.bias_correction {
            (1.0 + (2.0 * w as f64 + 1.0) / n_eff) / (1.0 + 1.0 / n_eff)
        } else {
            1.0
        }
    };
    let gamma_factor = if config.bias_correction { 1.0 + 1.0 / n_eff } else { 1.0 };

    let s = config.s_for(name);
    let tau_exp = config.tau_exp_for(name);

    let (w, tauint, dtauint, drho, exhausted) = if s == 0.0 {
        (0, 0.5, 0.0, 0.0, false)
    } else if tau_exp > 0.0 {
        let limit = (w_max / 2).clamp(2, w_max);
        let mut chosen = None;
        for w in 1..limit {
            let d = drho(&rho, w, n_eff);
            if rho[w] - config.n_sigma * d < 0.0 {
                chosen = Some((w, false));
                break;
            }
        }
        let (w, exhausted) = chosen.unwrap_or((limit - 1, true));
        let rho_next = rho.get(w + 1).copied().unwrap_or(0.0);
        let drho_next = if w + 1 < w_max { drho(&rho, w + 1, n_eff) } else { 0.0 };
        let tauint = n_tauint[w] * bias(w) + tau_exp * rho_next.abs();
        let dtauint = (n_dtauint[w].powi(2) + tau_exp.powi(2) * drho_next.powi(2)).sqrt();
        (w, tauint, dtauint, drho(&rho, w, n_eff), exhausted)
    } else {
        let (w, exhausted) = select_window(&n_tauint, s, n_eff, config.rule);
        (w, n_tauint[w] * bias(w), n_dtauint[w], drho(&rho, w, n_eff), exhausted)
    };

    let dvalue = (2.0 * tauint * gamma0 * gamma_factor / n).sqrt();
    let ddvalue = dvalue * ((w as f64 + 0.5) / n_eff).sqrt();
    debug!(
        ensemble = name,
        n_samples,
        gap,
        window = w * gap,
        tauint,
        dvalue,
        "gamma method"
    );

    EnsembleAnalysis {
        n_samples,
        gap,
        tauint,
        dtauint,
        dvalue,
        ddvalue,
        naive_dvalue,
        window: w * gap,
        rho,
        n_tauint,
        n_dtauint,
        drho,
        window_exhausted: exhausted,
    }
}

/// Automatic windowing over `n_tauint[1..]`. Returns the window (in lags)
/// and whether the search ran out of range without a self-consistent stop.
fn select_window(n_tauint: &[f64], s: f64, n: f64, rule: WindowRule) -> (usize, bool) {
    let w_max = n_tauint.len();
    for w in 1..w_max {
        let tau_w = n_tauint[w];
        let stop = match rule {
            WindowRule::Wolff => {
                let tau = if tau_w > 0.5 {
                    s / ((2.0 * tau_w + 1.0) / (2.0 * tau_w - 1.0)).ln()
                } else {
                    f64::EPSILON
                };
                let g = (-(w as f64) / tau).exp() - tau / (w as f64 * n).sqrt();
                g < 0.0
            }
            WindowRule::Sokal => w as f64 >= s * tau_w,
        };
        if stop {
            return (w, false);
        }
    }
    (w_max - 1, true)
}

/// Statistical error of ρ(w) (Madras-Sokal / Wolff eq. E.11), with ρ
/// truncated to zero beyond the computed range.
fn drho(rho: &[f64], w: usize, n: f64) -> f64 {
    let len = rho.len();
    if w == 0 || w >= len {
        return 0.0;
    }
    let sum: f64 = (1..len - w)
        .map(|k| {
            let t = rho[k + w] + rho[k.abs_diff(w)] - 2.0 * rho[w] * rho[k];
            t * t
        })
        .sum();
    (sum / n).sqrt()
}

/// Runs the gamma method on many stores in parallel.
pub fn analyse_all(stores: &[&SampleStore], config: &GammaConfig) -> Result<Vec<Uncertainty>> {
    config.validate()?;
    Ok(stores.par_iter().map(|s| run(s, config)).collect())
}
