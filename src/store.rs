// store.rs - Per-observable sample store and merge alignment across operands

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ObsError, Result};
use crate::idl::Idl;

/// Smallest replica length accepted for primary observables.
pub const MIN_SAMPLES: usize = 5;

/// Separator between ensemble and replica in a replica name (`"A654|r001"`).
pub const REPLICA_SEPARATOR: char = '|';

/// Ensemble part of a replica name.
pub fn ensemble_of(replica_name: &str) -> &str {
    replica_name
        .split(REPLICA_SEPARATOR)
        .next()
        .unwrap_or(replica_name)
}

/// Deviations of one replica chain together with its configuration ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawReplica")]
pub struct Replica {
    idl: Idl,
    deltas: Vec<f64>,
    r_value: f64,
}

impl Replica {
    pub fn new(idl: Idl, deltas: Vec<f64>, r_value: f64) -> Result<Self> {
        if idl.len() != deltas.len() {
            return Err(ObsError::invalid_samples(format!(
                "{} deviations for {} configuration ids",
                deltas.len(),
                idl.len()
            )));
        }
        Ok(Self {
            idl,
            deltas,
            r_value,
        })
    }

    pub fn idl(&self) -> &Idl {
        &self.idl
    }

    pub fn deltas(&self) -> &[f64] {
        &self.deltas
    }

    /// Central value of the observable on this replica alone.
    pub fn r_value(&self) -> f64 {
        self.r_value
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// All replicas of one ensemble that an observable is sampled on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnsemble")]
pub struct Ensemble {
    replicas: BTreeMap<String, Replica>,
    is_merged: bool,
    /// Kish effective-sample fraction of the reweighting factor, if any.
    ess_fraction: Option<f64>,
}

impl Ensemble {
    pub fn new(replicas: BTreeMap<String, Replica>) -> Self {
        Self {
            replicas,
            is_merged: false,
            ess_fraction: None,
        }
    }

    pub fn replicas(&self) -> &BTreeMap<String, Replica> {
        &self.replicas
    }

    pub fn replica(&self, name: &str) -> Option<&Replica> {
        self.replicas.get(name)
    }

    pub fn replica_names(&self) -> impl Iterator<Item = &str> {
        self.replicas.keys().map(String::as_str)
    }

    pub fn is_merged(&self) -> bool {
        self.is_merged
    }

    pub fn ess_fraction(&self) -> Option<f64> {
        self.ess_fraction
    }

    pub(crate) fn set_ess_fraction(&mut self, fraction: f64) {
        self.ess_fraction = Some(fraction);
    }

    /// Total number of configurations over all replicas.
    pub fn n_samples(&self) -> usize {
        self.replicas.values().map(Replica::len).sum()
    }

    /// Replica values averaged with replica lengths as weights.
    pub fn mean(&self) -> f64 {
        let n = self.n_samples() as f64;
        self.replicas
            .values()
            .map(|r| r.len() as f64 * r.r_value)
            .sum::<f64>()
            / n
    }

    /// Replica deviations re-centred on the ensemble mean, ready for pooling.
    pub fn pooled_deltas(&self) -> Vec<(&Idl, Vec<f64>)> {
        let mean = self.mean();
        self.replicas
            .values()
            .map(|r| {
                let shift = r.r_value - mean;
                let d = if shift == 0.0 {
                    r.deltas.clone()
                } else {
                    r.deltas.iter().map(|d| d + shift).collect()
                };
                (&r.idl, d)
            })
            .collect()
    }
}

/// Mapping ensemble name -> replicas, plus the store-wide reweighting flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSampleStore")]
pub struct SampleStore {
    ensembles: BTreeMap<String, Ensemble>,
    reweighted: bool,
}

impl SampleStore {
    /// Builds a primary store from raw replica samples.
    ///
    /// `names` are replica names (`"ens"` or `"ens|rep"`); `idl` defaults to
    /// `1..=n` for each replica. Returns the store and the central value,
    /// the length-weighted mean over all replicas.
    pub fn from_samples(
        samples: Vec<Vec<f64>>,
        names: &[&str],
        idl: Option<Vec<Idl>>,
    ) -> Result<(Self, f64)> {
        if samples.is_empty() {
            return Err(ObsError::invalid_samples("no samples given"));
        }
        if samples.len() != names.len() {
            return Err(ObsError::invalid_samples(format!(
                "{} sample sets for {} names",
                samples.len(),
                names.len()
            )));
        }
        let idl = match idl {
            Some(idl) if idl.len() != samples.len() => {
                return Err(ObsError::invalid_samples(format!(
                    "{} id lists for {} sample sets",
                    idl.len(),
                    samples.len()
                )))
            }
            Some(idl) => idl,
            None => samples
                .iter()
                .map(|s| Idl::contiguous(s.len()))
                .collect::<Result<Vec<_>>>()?,
        };
        let unique: BTreeSet<&str> = names.iter().copied().collect();
        if unique.len() != names.len() {
            return Err(ObsError::invalid_samples("replica names must be unique"));
        }

        let mut ensembles: BTreeMap<String, BTreeMap<String, Replica>> = BTreeMap::new();
        let mut total = 0.0;
        let mut n_total = 0usize;
        for ((sample, name), ids) in samples.into_iter().zip(names).zip(idl) {
            if name.is_empty() {
                return Err(ObsError::invalid_samples("empty replica name"));
            }
            if sample.len() < MIN_SAMPLES {
                return Err(ObsError::invalid_samples(format!(
                    "replica '{name}' has {} samples, at least {MIN_SAMPLES} required",
                    sample.len()
                )));
            }
            if sample.iter().any(|x| !x.is_finite()) {
                return Err(ObsError::invalid_samples(format!(
                    "replica '{name}' contains non-finite samples"
                )));
            }
            let n = sample.len();
            let r_value = sample.iter().sum::<f64>() / n as f64;
            let deltas = sample.into_iter().map(|x| x - r_value).collect();
            let replica = Replica::new(ids, deltas, r_value)?;
            total += n as f64 * r_value;
            n_total += n;
            ensembles
                .entry(ensemble_of(name).to_string())
                .or_default()
                .insert(name.to_string(), replica);
        }

        let store = Self {
            ensembles: ensembles
                .into_iter()
                .map(|(e, reps)| (e, Ensemble::new(reps)))
                .collect(),
            reweighted: false,
        };
        Ok((store, total / n_total as f64))
    }

    pub fn ensembles(&self) -> &BTreeMap<String, Ensemble> {
        &self.ensembles
    }

    pub fn ensemble(&self, name: &str) -> Option<&Ensemble> {
        self.ensembles.get(name)
    }

    pub(crate) fn ensemble_mut(&mut self, name: &str) -> Option<&mut Ensemble> {
        self.ensembles.get_mut(name)
    }

    /// Names of the Monte-Carlo ensembles.
    pub fn mc_names(&self) -> Vec<String> {
        self.ensembles.keys().cloned().collect()
    }

    /// Ensemble name -> names of its replicas.
    pub fn e_content(&self) -> BTreeMap<String, Vec<String>> {
        self.ensembles
            .iter()
            .map(|(e, ens)| (e.clone(), ens.replica_names().map(String::from).collect()))
            .collect()
    }

    /// Every replica keyed by its full name.
    pub fn replicas(&self) -> impl Iterator<Item = (&str, &Replica)> {
        self.ensembles
            .values()
            .flat_map(|e| e.replicas.iter().map(|(n, r)| (n.as_str(), r)))
    }

    pub fn replica(&self, name: &str) -> Option<&Replica> {
        self.ensembles.get(ensemble_of(name))?.replica(name)
    }

    pub fn is_merged(&self) -> BTreeMap<String, bool> {
        self.ensembles
            .iter()
            .map(|(e, ens)| (e.clone(), ens.is_merged))
            .collect()
    }

    pub fn reweighted(&self) -> bool {
        self.reweighted
    }

    pub(crate) fn set_reweighted(&mut self, reweighted: bool) {
        self.reweighted = reweighted;
    }

    pub(crate) fn set_merged(&mut self, merged: &BTreeMap<String, bool>) {
        for (e, ens) in self.ensembles.iter_mut() {
            ens.is_merged = merged.get(e).copied().unwrap_or(false);
        }
    }

    /// Store of `grad * self`, with per-replica values mapped through `f`.
    pub fn scaled(&self, grad: f64, f: impl Fn(f64) -> f64) -> SampleStore {
        let ensembles = self
            .ensembles
            .iter()
            .map(|(e, ens)| {
                let replicas = ens
                    .replicas
                    .iter()
                    .map(|(rn, r)| {
                        let replica = Replica {
                            idl: r.idl.clone(),
                            deltas: r.deltas.iter().map(|d| grad * d).collect(),
                            r_value: f(r.r_value),
                        };
                        (rn.clone(), replica)
                    })
                    .collect();
                let ensemble = Ensemble {
                    replicas,
                    is_merged: ens.is_merged,
                    ess_fraction: ens.ess_fraction,
                };
                (e.clone(), ensemble)
            })
            .collect();
        SampleStore {
            ensembles,
            reweighted: self.reweighted,
        }
    }

    /// Total number of configurations of ensemble `name` (0 if absent).
    pub fn n_samples(&self, name: &str) -> usize {
        self.ensembles.get(name).map_or(0, Ensemble::n_samples)
    }

    /// Deviations of an ensemble, replicas concatenated in name order.
    pub fn ensemble_deltas(&self, name: &str) -> Option<Vec<f64>> {
        let ens = self.ensembles.get(name)?;
        Some(ens.replicas.values().flat_map(|r| r.deltas.iter().copied()).collect())
    }

    /// Configuration ids of an ensemble, replicas concatenated in name order.
    pub fn ensemble_idl(&self, name: &str) -> Option<Vec<usize>> {
        let ens = self.ensembles.get(name)?;
        Some(ens.replicas.values().flat_map(|r| r.idl.iter()).collect())
    }

    /// True when both stores live on the same configurations: identical
    /// ensemble/replica content, id lists, merge flags and reweighting.
    pub fn same_configuration_set(&self, other: &SampleStore) -> bool {
        self.reweighted == other.reweighted
            && self.ensembles.len() == other.ensembles.len()
            && self.ensembles.iter().zip(&other.ensembles).all(|((ea, a), (eb, b))| {
                ea == eb
                    && a.is_merged == b.is_merged
                    && a.replicas.len() == b.replicas.len()
                    && a.replicas
                        .iter()
                        .zip(&b.replicas)
                        .all(|((na, ra), (nb, rb))| na == nb && ra.idl == rb.idl)
            })
    }
}

// Deserialisation goes through these mirrors so stored data meets the same
// invariants as freshly constructed stores.

#[derive(Deserialize)]
struct RawReplica {
    idl: Idl,
    deltas: Vec<f64>,
    r_value: f64,
}

impl TryFrom<RawReplica> for Replica {
    type Error = ObsError;

    fn try_from(raw: RawReplica) -> Result<Self> {
        if raw.deltas.iter().any(|d| !d.is_finite()) {
            return Err(ObsError::invalid_samples("replica contains non-finite deviations"));
        }
        Replica::new(raw.idl, raw.deltas, raw.r_value)
    }
}

#[derive(Deserialize)]
struct RawEnsemble {
    replicas: BTreeMap<String, Replica>,
    is_merged: bool,
    #[serde(default)]
    ess_fraction: Option<f64>,
}

impl TryFrom<RawEnsemble> for Ensemble {
    type Error = ObsError;

    fn try_from(raw: RawEnsemble) -> Result<Self> {
        if raw.replicas.is_empty() {
            return Err(ObsError::invalid_samples("ensemble without replicas"));
        }
        if let Some(f) = raw.ess_fraction {
            if !(f > 0.0 && f <= 1.0) {
                return Err(ObsError::invalid_samples(format!(
                    "effective sample fraction {f} outside (0, 1]"
                )));
            }
        }
        Ok(Ensemble {
            replicas: raw.replicas,
            is_merged: raw.is_merged,
            ess_fraction: raw.ess_fraction,
        })
    }
}

#[derive(Deserialize)]
struct RawSampleStore {
    ensembles: BTreeMap<String, Ensemble>,
    reweighted: bool,
}

impl TryFrom<RawSampleStore> for SampleStore {
    type Error = ObsError;

    fn try_from(raw: RawSampleStore) -> Result<Self> {
        if raw.ensembles.is_empty() {
            return Err(ObsError::invalid_samples("store without ensembles"));
        }
        for (name, ens) in &raw.ensembles {
            if let Some(rn) = ens.replica_names().find(|rn| ensemble_of(rn) != name.as_str()) {
                return Err(ObsError::invalid_samples(format!(
                    "replica '{rn}' filed under ensemble '{name}'"
                )));
            }
        }
        Ok(SampleStore {
            ensembles: raw.ensembles,
            reweighted: raw.reweighted,
        })
    }
}

/// How configuration-id lists of a shared replica may be reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Lists must agree wherever their spans overlap; the union pads the ends.
    #[default]
    Aligned,
    /// Any two lists are reconciled by their sorted union.
    Union,
}

#[derive(Debug, Clone)]
struct PlannedEnsemble {
    replicas: BTreeMap<String, Idl>,
    is_merged: bool,
    ess_fraction: Option<f64>,
}

/// Aligned layout of the output store of a combination of several stores.
#[derive(Debug, Clone)]
pub struct MergePlan {
    ensembles: BTreeMap<String, PlannedEnsemble>,
    reweighted: bool,
}

impl MergePlan {
    /// Checks the operands against each other and fixes the output layout.
    pub fn build(stores: &[&SampleStore], policy: MergePolicy) -> Result<Self> {
        let reweighted = match stores.split_first() {
            None => false,
            Some((head, tail)) => {
                if let Some(bad) = tail.iter().find(|s| s.reweighted != head.reweighted) {
                    return Err(ObsError::InconsistentFlags {
                        detail: format!(
                            "cannot combine reweighted and non-reweighted observables \
                             (reweighted: {} vs {})",
                            head.reweighted, bad.reweighted
                        ),
                    });
                }
                head.reweighted
            }
        };

        let names: BTreeSet<&String> = stores.iter().flat_map(|s| s.ensembles.keys()).collect();
        let mut ensembles = BTreeMap::new();
        for name in names {
            let members: Vec<&Ensemble> =
                stores.iter().filter_map(|s| s.ensembles.get(name)).collect();
            let planned = if members.iter().any(|m| m.is_merged) {
                Self::plan_onto_merged(name, &members)?
            } else {
                Self::plan_fresh(name, &members, policy)?
            };
            ensembles.insert(name.clone(), planned);
        }
        Ok(Self {
            ensembles,
            reweighted,
        })
    }

    /// A merged ensemble fixes the total union: every other operand has to
    /// lie within one merged operand's replicas and ids.
    fn plan_onto_merged(name: &str, members: &[&Ensemble]) -> Result<PlannedEnsemble> {
        let covers = |host: &Ensemble| {
            members.iter().all(|m| {
                m.replicas.iter().all(|(rn, r)| {
                    host.replicas
                        .get(rn)
                        .is_some_and(|h| r.idl.is_subset_of(&h.idl))
                })
            })
        };
        let host = members
            .iter()
            .filter(|m| m.is_merged)
            .find(|m| covers(**m))
            .ok_or_else(|| {
                ObsError::mismatch(
                    name,
                    "ensemble was merged before; operands must lie within its configuration set",
                )
            })?;
        Ok(PlannedEnsemble {
            replicas: host
                .replicas
                .iter()
                .map(|(rn, r)| (rn.clone(), r.idl.clone()))
                .collect(),
            is_merged: true,
            ess_fraction: min_fraction(members),
        })
    }

    fn plan_fresh(name: &str, members: &[&Ensemble], policy: MergePolicy) -> Result<PlannedEnsemble> {
        let replica_names: BTreeSet<&String> =
            members.iter().flat_map(|m| m.replicas.keys()).collect();
        let mut is_merged = false;
        let mut replicas = BTreeMap::new();
        for rn in replica_names {
            let idls: Vec<&Idl> = members
                .iter()
                .filter_map(|m| m.replicas.get(rn).map(|r| &r.idl))
                .collect();
            if idls.len() < members.len() {
                is_merged = true;
            }
            if policy == MergePolicy::Aligned {
                for (i, a) in idls.iter().enumerate() {
                    for b in &idls[i + 1..] {
                        if !a.overlap_consistent(b) {
                            return Err(ObsError::mismatch(
                                name,
                                format!(
                                    "replica '{rn}' has configuration lists that disagree inside \
                                     their common range ({} ids on {}..={} vs {} ids on {}..={})",
                                    a.len(),
                                    a.first(),
                                    a.last(),
                                    b.len(),
                                    b.first(),
                                    b.last()
                                ),
                            ));
                        }
                    }
                }
            }
            let merged = Idl::union(idls.iter().copied()).ok_or_else(|| {
                ObsError::mismatch(name, format!("replica '{rn}' has no configurations"))
            })?;
            if idls.iter().any(|l| **l != merged) {
                is_merged = true;
            }
            replicas.insert(rn.clone(), merged);
        }
        if is_merged {
            debug!(ensemble = name, replicas = replicas.len(), "merging configuration sets");
        }
        Ok(PlannedEnsemble {
            replicas,
            is_merged,
            ess_fraction: min_fraction(members),
        })
    }

    /// Replica names of the output, keyed by ensemble.
    pub fn replica_names(&self) -> impl Iterator<Item = &str> {
        self.ensembles
            .values()
            .flat_map(|e| e.replicas.keys().map(String::as_str))
    }

    pub fn reweighted(&self) -> bool {
        self.reweighted
    }

    /// Output store whose deviations are `sum_i grads[i] * deltas_i`.
    ///
    /// `stores` must be the operands the plan was built from, in order;
    /// `r_values` holds the output value on each replica.
    pub fn assemble(
        &self,
        stores: &[&SampleStore],
        grads: &[f64],
        r_values: &BTreeMap<String, f64>,
    ) -> SampleStore {
        let mut ensembles = BTreeMap::new();
        for (name, planned) in &self.ensembles {
            let mut replicas = BTreeMap::new();
            for (rn, idl) in &planned.replicas {
                let mut acc = vec![0.0; idl.len()];
                for (store, &g) in stores.iter().zip(grads) {
                    if g == 0.0 {
                        continue;
                    }
                    let Some(r) = store.replica(rn) else { continue };
                    if r.idl == *idl {
                        for (a, d) in acc.iter_mut().zip(&r.deltas) {
                            *a += g * d;
                        }
                    } else {
                        let padded = r.idl.scatter(&r.deltas, idl);
                        for (a, d) in acc.iter_mut().zip(padded) {
                            *a += g * d;
                        }
                    }
                }
                let r_value = r_values.get(rn).copied().unwrap_or(f64::NAN);
                replicas.insert(
                    rn.clone(),
                    Replica {
                        idl: idl.clone(),
                        deltas: acc,
                        r_value,
                    },
                );
            }
            ensembles.insert(
                name.clone(),
                Ensemble {
                    replicas,
                    is_merged: planned.is_merged,
                    ess_fraction: planned.ess_fraction,
                },
            );
        }
        SampleStore {
            ensembles,
            reweighted: self.reweighted,
        }
    }
}

fn min_fraction(members: &[&Ensemble]) -> Option<f64> {
    members
        .iter()
        .filter_map(|m| m.ess_fraction)
        .reduce(f64::min)
}
