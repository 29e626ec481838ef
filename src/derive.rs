// derive.rs - Linearised error propagation through arbitrary functions of observables

use std::collections::BTreeMap;

use crate::complex::CObs;
use crate::dual::Dual;
use crate::error::{ObsError, Result};
use crate::obs::Obs;
use crate::store::{MergePlan, MergePolicy, SampleStore};

/// Knobs of the derivative combinator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeriveOptions {
    /// Reconciliation rule for shared replicas with different id lists.
    pub policy: MergePolicy,
    /// Initial finite-difference step of [`derive_numeric`], relative to |x|.
    pub relative_step: f64,
}

impl Default for DeriveOptions {
    fn default() -> Self {
        Self {
            policy: MergePolicy::Aligned,
            relative_step: 0.1,
        }
    }
}

impl DeriveOptions {
    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_relative_step(mut self, step: f64) -> Self {
        self.relative_step = step;
        self
    }
}

/// A value the combinator can consume.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Real(&'a Obs),
    Complex(&'a CObs),
    Scalar(f64),
}

impl Operand<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Operand::Real(_) => "Obs",
            Operand::Complex(_) => "CObs",
            Operand::Scalar(_) => "scalar",
        }
    }
}

/// Capability of taking part in a derived observable.
pub trait Combinable {
    fn operand(&self) -> Operand<'_>;
}

impl Combinable for Obs {
    fn operand(&self) -> Operand<'_> {
        Operand::Real(self)
    }
}

impl Combinable for CObs {
    fn operand(&self) -> Operand<'_> {
        Operand::Complex(self)
    }
}

impl Combinable for f64 {
    fn operand(&self) -> Operand<'_> {
        Operand::Scalar(*self)
    }
}

/// New observable `f(x_1, ..., x_n)` with exact first-order propagation.
///
/// `f` is evaluated on dual numbers, so every closed-form operation inside it
/// contributes its analytic derivative. Affine functions are propagated
/// exactly.
pub fn derive<F>(f: F, inputs: &[&Obs]) -> Result<Obs>
where
    F: Fn(&[Dual]) -> Dual,
{
    derive_with(f, inputs, DeriveOptions::default())
}

pub fn derive_with<F>(f: F, inputs: &[&Obs], options: DeriveOptions) -> Result<Obs>
where
    F: Fn(&[Dual]) -> Dual,
{
    let mut out = derive_array_with(|x| vec![f(x)], inputs, options)?;
    Ok(out.remove(0))
}

/// Array-valued variant: one output observable per component of `f`.
pub fn derive_array<F>(f: F, inputs: &[&Obs]) -> Result<Vec<Obs>>
where
    F: Fn(&[Dual]) -> Vec<Dual>,
{
    derive_array_with(f, inputs, DeriveOptions::default())
}

pub fn derive_array_with<F>(f: F, inputs: &[&Obs], options: DeriveOptions) -> Result<Vec<Obs>>
where
    F: Fn(&[Dual]) -> Vec<Dual>,
{
    if inputs.is_empty() {
        return Err(ObsError::invalid_parameter(
            "a derived observable needs at least one input observable",
        ));
    }
    let values: Vec<f64> = inputs.iter().map(|o| o.value()).collect();
    let mut args: Vec<Dual> = values.iter().copied().map(Dual::constant).collect();
    let central = f(&args);
    let m = central.len();

    let mut jacobian = vec![vec![0.0; inputs.len()]; m];
    for j in 0..inputs.len() {
        args[j].eps = 1.0;
        let out = f(&args);
        args[j].eps = 0.0;
        if out.len() != m {
            return Err(ObsError::shape(format!(
                "function returned {} components, expected {m}",
                out.len()
            )));
        }
        for (row, o) in jacobian.iter_mut().zip(&out) {
            row[j] = o.eps;
        }
    }

    let outputs: Vec<f64> = central.iter().map(|d| d.re).collect();
    let eval = |x: &[f64]| {
        let d: Vec<Dual> = x.iter().copied().map(Dual::constant).collect();
        f(&d).into_iter().map(|v| v.re).collect::<Vec<f64>>()
    };
    derive_with_jacobian(&outputs, &jacobian, eval, inputs, options)
}

/// Black-box variant for functions only available on plain floats.
///
/// Partial derivatives come from symmetric differences refined by Ridders'
/// extrapolation. Prefer [`derive`] whenever `f` can be written on [`Dual`].
pub fn derive_numeric<F>(f: F, inputs: &[&Obs], options: DeriveOptions) -> Result<Obs>
where
    F: Fn(&[f64]) -> f64,
{
    if !(options.relative_step > 0.0) {
        return Err(ObsError::invalid_parameter("relative_step must be positive"));
    }
    let values: Vec<f64> = inputs.iter().map(|o| o.value()).collect();
    let central = f(&values);
    let grad: Vec<f64> = (0..values.len())
        .map(|j| {
            let x = values[j];
            let h = options.relative_step * if x != 0.0 { x.abs() } else { 1.0 };
            let mut args = values.clone();
            ridders(
                |t| {
                    args[j] = t;
                    f(&args)
                },
                x,
                h,
            )
        })
        .collect();
    let eval = |x: &[f64]| vec![f(x)];
    let mut out = derive_with_jacobian(&[central], &[grad], eval, inputs, options)?;
    Ok(out.remove(0))
}

/// Core combinator: given output values, the Jacobian `d out_i / d x_j` and a
/// plain evaluation of the function (used for per-replica values), builds the
/// output observables on the merged sample store of `inputs`.
pub fn derive_with_jacobian<E>(
    values: &[f64],
    jacobian: &[Vec<f64>],
    eval: E,
    inputs: &[&Obs],
    options: DeriveOptions,
) -> Result<Vec<Obs>>
where
    E: Fn(&[f64]) -> Vec<f64>,
{
    if inputs.is_empty() {
        return Err(ObsError::invalid_parameter(
            "a derived observable needs at least one input observable",
        ));
    }
    if jacobian.len() != values.len() || jacobian.iter().any(|row| row.len() != inputs.len()) {
        return Err(ObsError::shape(format!(
            "jacobian must be {} x {}",
            values.len(),
            inputs.len()
        )));
    }
    let stores: Vec<&SampleStore> = inputs.iter().map(|o| o.store()).collect();
    let plan = MergePlan::build(&stores, options.policy)?;

    let mut r_values: Vec<BTreeMap<String, f64>> = vec![BTreeMap::new(); values.len()];
    for rn in plan.replica_names() {
        let args: Vec<f64> = inputs
            .iter()
            .map(|o| o.store().replica(rn).map_or(o.value(), |r| r.r_value()))
            .collect();
        let out = eval(&args);
        for (map, v) in r_values.iter_mut().zip(out) {
            map.insert(rn.to_string(), v);
        }
    }

    Ok(values
        .iter()
        .zip(jacobian)
        .zip(&r_values)
        .map(|((&value, grads), rv)| Obs::from_store(value, plan.assemble(&stores, grads, rv)))
        .collect())
}

/// Like [`derive`], over a mixed list of observables and plain numbers.
///
/// Complex operands cannot enter a real function and are rejected with
/// [`ObsError::TypeMismatch`].
pub fn derive_operands<F>(f: F, operands: &[&dyn Combinable]) -> Result<Obs>
where
    F: Fn(&[Dual]) -> Dual,
{
    enum Slot {
        Input(usize),
        Fixed(f64),
    }
    let mut inputs = Vec::new();
    let mut slots = Vec::with_capacity(operands.len());
    for op in operands {
        match op.operand() {
            Operand::Real(o) => {
                slots.push(Slot::Input(inputs.len()));
                inputs.push(o);
            }
            Operand::Scalar(x) => slots.push(Slot::Fixed(x)),
            other @ Operand::Complex(_) => {
                return Err(ObsError::TypeMismatch {
                    expected: "Obs or scalar".to_string(),
                    found: other.kind().to_string(),
                })
            }
        }
    }
    let g = |x: &[Dual]| {
        let args: Vec<Dual> = slots
            .iter()
            .map(|s| match s {
                Slot::Input(i) => x[*i],
                Slot::Fixed(v) => Dual::constant(*v),
            })
            .collect();
        f(&args)
    };
    derive(g, &inputs)
}

/// Ridders' extrapolated central difference of `g` at `x` with initial step `h`.
fn ridders(mut g: impl FnMut(f64) -> f64, x: f64, h: f64) -> f64 {
    const NTAB: usize = 10;
    const CON: f64 = 1.4;
    const CON2: f64 = CON * CON;
    const SAFE: f64 = 2.0;

    let mut a = [[0.0f64; NTAB]; NTAB];
    let mut h = h;
    a[0][0] = (g(x + h) - g(x - h)) / (2.0 * h);
    let mut best = a[0][0];
    let mut err = f64::INFINITY;
    for i in 1..NTAB {
        h /= CON;
        a[0][i] = (g(x + h) - g(x - h)) / (2.0 * h);
        let mut fac = CON2;
        for j in 1..=i {
            a[j][i] = (a[j - 1][i] * fac - a[j - 1][i - 1]) / (fac - 1.0);
            fac *= CON2;
            let errt = (a[j][i] - a[j - 1][i])
                .abs()
                .max((a[j][i] - a[j - 1][i - 1]).abs());
            if errt <= err {
                err = errt;
                best = a[j][i];
            }
        }
        if (a[i][i] - a[i - 1][i - 1]).abs() >= SAFE * err {
            break;
        }
    }
    best
}
