// idl.rs - Configuration-id lists of a replica and their alignment

use serde::{Deserialize, Serialize};

use crate::error::{ObsError, Result};

/// Ordered, strictly increasing list of configuration ids of one replica.
///
/// Equally spaced lists are always stored as [`Idl::Range`], so two `Idl`s
/// holding the same ids compare equal regardless of how they were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawIdl")]
pub enum Idl {
    /// `start, start + step, ..., start + (len - 1) * step`
    Range { start: usize, step: usize, len: usize },
    /// Irregular ids (thinned or partially missing chains).
    List(Vec<usize>),
}

impl Idl {
    /// Ids `1..=n`, the default labelling of a chain of `n` configurations.
    pub fn contiguous(n: usize) -> Result<Self> {
        Self::range(1, n + 1, 1)
    }

    /// Python-style half-open range `start..stop` with the given step.
    pub fn range(start: usize, stop: usize, step: usize) -> Result<Self> {
        if step == 0 {
            return Err(ObsError::invalid_samples("configuration id step must be positive"));
        }
        if stop <= start {
            return Err(ObsError::invalid_samples("empty configuration id range"));
        }
        let len = (stop - start + step - 1) / step;
        Ok(Self::canonical_range(start, step, len))
    }

    /// Builds an id list, checking it is non-empty and strictly increasing.
    pub fn from_list(ids: Vec<usize>) -> Result<Self> {
        if ids.is_empty() {
            return Err(ObsError::invalid_samples("empty configuration id list"));
        }
        if let Some(w) = ids.windows(2).find(|w| w[1] <= w[0]) {
            return Err(ObsError::invalid_samples(format!(
                "configuration ids must be strictly increasing (found {} after {})",
                w[1], w[0]
            )));
        }
        Ok(Self::canonicalize(ids))
    }

    fn canonical_range(start: usize, step: usize, len: usize) -> Self {
        let step = if len == 1 { 1 } else { step };
        Idl::Range { start, step, len }
    }

    fn canonicalize(ids: Vec<usize>) -> Self {
        if ids.len() == 1 {
            return Self::canonical_range(ids[0], 1, 1);
        }
        let step = ids[1] - ids[0];
        if ids.windows(2).all(|w| w[1] - w[0] == step) {
            Self::canonical_range(ids[0], step, ids.len())
        } else {
            Idl::List(ids)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Idl::Range { len, .. } => *len,
            Idl::List(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id at position `i`.
    pub fn get(&self, i: usize) -> Option<usize> {
        match self {
            Idl::Range { start, step, len } => (i < *len).then(|| start + i * step),
            Idl::List(ids) => ids.get(i).copied(),
        }
    }

    pub fn first(&self) -> usize {
        self.get(0).unwrap_or(0)
    }

    pub fn last(&self) -> usize {
        self.get(self.len().saturating_sub(1)).unwrap_or(0)
    }

    pub fn iter(&self) -> IdlIter<'_> {
        IdlIter { idl: self, pos: 0 }
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }

    /// Position of configuration `id` in the list.
    pub fn position(&self, id: usize) -> Option<usize> {
        match self {
            Idl::Range { start, step, len } => {
                if id < *start || (id - start) % step != 0 {
                    return None;
                }
                let pos = (id - start) / step;
                (pos < *len).then_some(pos)
            }
            Idl::List(ids) => ids.binary_search(&id).ok(),
        }
    }

    pub fn contains(&self, id: usize) -> bool {
        self.position(id).is_some()
    }

    pub fn is_subset_of(&self, other: &Idl) -> bool {
        if self == other {
            return true;
        }
        self.iter().all(|id| other.contains(id))
    }

    /// True when both lists hold exactly the same ids inside the interval
    /// where their spans overlap. Lists with disjoint spans are consistent.
    pub fn overlap_consistent(&self, other: &Idl) -> bool {
        if self == other {
            return true;
        }
        let lo = self.first().max(other.first());
        let hi = self.last().min(other.last());
        if lo > hi {
            return true;
        }
        let a = self.iter().filter(|&id| id >= lo && id <= hi);
        let b = other.iter().filter(|&id| id >= lo && id <= hi);
        a.eq(b)
    }

    /// Sorted union of several id lists.
    pub fn union<'a>(lists: impl IntoIterator<Item = &'a Idl>) -> Option<Idl> {
        let lists: Vec<&Idl> = lists.into_iter().collect();
        let first = *lists.first()?;
        if lists.iter().all(|l| *l == first) {
            return Some(first.clone());
        }
        let mut ids: Vec<usize> = lists.iter().flat_map(|l| l.iter()).collect();
        ids.sort_unstable();
        ids.dedup();
        Some(Self::canonicalize(ids))
    }

    /// Greatest common divisor of consecutive id differences.
    pub fn gap(&self) -> Option<usize> {
        match self {
            Idl::Range { step, len, .. } => (*len > 1).then_some(*step),
            Idl::List(ids) => ids.windows(2).map(|w| w[1] - w[0]).reduce(gcd),
        }
    }

    /// Number of slots the chain occupies on a grid of spacing `gap`.
    pub fn span(&self, gap: usize) -> usize {
        (self.last() - self.first()) / gap + 1
    }

    /// Places `values` (one per id) on the regular grid of spacing `gap`
    /// starting at the first id, filling absent configurations with zero.
    pub fn expand(&self, values: &[f64], gap: usize) -> Vec<f64> {
        let first = self.first();
        let mut out = vec![0.0; self.span(gap)];
        for (id, &v) in self.iter().zip(values) {
            out[(id - first) / gap] = v;
        }
        out
    }

    /// Re-indexes `values` defined on `self` onto the superset `target`,
    /// writing zero where `self` has no entry.
    pub fn scatter(&self, values: &[f64], target: &Idl) -> Vec<f64> {
        if self == target {
            return values.to_vec();
        }
        let mut out = vec![0.0; target.len()];
        let mut t = target.iter().enumerate();
        for (id, &v) in self.iter().zip(values) {
            for (pos, tid) in t.by_ref() {
                if tid == id {
                    out[pos] = v;
                    break;
                }
            }
        }
        out
    }

    /// Restricts `values` defined on `self` to the subset `target`.
    pub fn restrict(&self, values: &[f64], target: &Idl) -> Result<Vec<f64>> {
        target
            .iter()
            .map(|id| {
                self.position(id).map(|p| values[p]).ok_or_else(|| {
                    ObsError::invalid_samples(format!("configuration {id} is not part of the chain"))
                })
            })
            .collect()
    }
}

/// Unchecked wire form of [`Idl`].
#[derive(Deserialize)]
enum RawIdl {
    Range { start: usize, step: usize, len: usize },
    List(Vec<usize>),
}

impl TryFrom<RawIdl> for Idl {
    type Error = ObsError;

    fn try_from(raw: RawIdl) -> Result<Self> {
        match raw {
            RawIdl::Range { start, step, len } => {
                let stop = step
                    .checked_mul(len)
                    .and_then(|span| span.checked_add(start))
                    .ok_or_else(|| ObsError::invalid_samples("configuration id range overflows"))?;
                Self::range(start, stop, step)
            }
            RawIdl::List(ids) => Self::from_list(ids),
        }
    }
}

/// Iterator over the ids of an [`Idl`].
pub struct IdlIter<'a> {
    idl: &'a Idl,
    pos: usize,
}

impl Iterator for IdlIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let id = self.idl.get(self.pos)?;
        self.pos += 1;
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.idl.len() - self.pos;
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for IdlIter<'_> {}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Common spacing of several chains (gcd of all their gaps).
pub(crate) fn common_gap<'a>(lists: impl IntoIterator<Item = &'a Idl>) -> usize {
    lists
        .into_iter()
        .filter_map(Idl::gap)
        .reduce(gcd)
        .unwrap_or(1)
}
