// linalg.rs - Matrix operations over observables and their covariance matrix

use nalgebra::DMatrix;

use crate::derive::{derive, derive_with_jacobian, DeriveOptions};
use crate::dual::Dual;
use crate::error::{ObsError, Result};
use crate::obs::Obs;

/// Matrix of central values.
pub fn values(a: &DMatrix<Obs>) -> DMatrix<f64> {
    a.map(|o| o.value())
}

/// Matrix product; every element is a single derived observable.
pub fn matmul(a: &DMatrix<Obs>, b: &DMatrix<Obs>) -> Result<DMatrix<Obs>> {
    if a.ncols() != b.nrows() {
        return Err(ObsError::shape(format!(
            "cannot multiply {}x{} by {}x{}",
            a.nrows(),
            a.ncols(),
            b.nrows(),
            b.ncols()
        )));
    }
    let k = a.ncols();
    let mut data = Vec::with_capacity(a.nrows() * b.ncols());
    // column-major, as DMatrix::from_vec expects
    for j in 0..b.ncols() {
        for i in 0..a.nrows() {
            let inputs: Vec<&Obs> = (0..k).map(|l| &a[(i, l)]).chain((0..k).map(|l| &b[(l, j)])).collect();
            let dot = derive(
                |x: &[Dual]| (0..k).map(|l| x[l] * x[k + l]).sum(),
                &inputs,
            )?;
            data.push(dot);
        }
    }
    Ok(DMatrix::from_vec(a.nrows(), b.ncols(), data))
}

fn square(a: &DMatrix<Obs>) -> Result<usize> {
    if a.nrows() != a.ncols() || a.nrows() == 0 {
        return Err(ObsError::shape(format!(
            "square matrix required, got {}x{}",
            a.nrows(),
            a.ncols()
        )));
    }
    Ok(a.nrows())
}

/// Matrix inverse with `d(A⁻¹) = -A⁻¹ dA A⁻¹`.
pub fn inv(a: &DMatrix<Obs>) -> Result<DMatrix<Obs>> {
    let n = square(a)?;
    let inverse = values(a)
        .try_inverse()
        .ok_or(ObsError::SingularMatrix)?;

    // inputs and outputs are both in column-major order: index = row + n * col
    let inputs: Vec<&Obs> = a.iter().collect();
    let outputs: Vec<f64> = inverse.iter().copied().collect();
    let mut jacobian = vec![vec![0.0; n * n]; n * n];
    for (out, row) in jacobian.iter_mut().enumerate() {
        let (i, j) = (out % n, out / n);
        for (inp, entry) in row.iter_mut().enumerate() {
            let (k, l) = (inp % n, inp / n);
            *entry = -inverse[(i, k)] * inverse[(l, j)];
        }
    }
    let eval = |x: &[f64]| {
        DMatrix::from_column_slice(n, n, x)
            .try_inverse()
            .map(|m| m.iter().copied().collect())
            .unwrap_or_else(|| vec![f64::NAN; n * n])
    };
    let data = derive_with_jacobian(&outputs, &jacobian, eval, &inputs, DeriveOptions::default())?;
    Ok(DMatrix::from_vec(n, n, data))
}

/// Determinant with `d det A = det A · tr(A⁻¹ dA)`.
pub fn det(a: &DMatrix<Obs>) -> Result<Obs> {
    let n = square(a)?;
    let central = values(a);
    let d = central.determinant();
    let inverse = central.try_inverse().ok_or(ObsError::SingularMatrix)?;
    let inputs: Vec<&Obs> = a.iter().collect();
    let grad: Vec<f64> = (0..n * n)
        .map(|inp| {
            let (k, l) = (inp % n, inp / n);
            d * inverse[(l, k)]
        })
        .collect();
    let eval = |x: &[f64]| vec![DMatrix::from_column_slice(n, n, x).determinant()];
    let mut out = derive_with_jacobian(&[d], &[grad], eval, &inputs, DeriveOptions::default())?;
    Ok(out.remove(0))
}

/// Naive (lag-zero) covariance of two observables, normalised per ensemble.
fn covariance_element(a: &Obs, b: &Obs) -> Result<f64> {
    let mut total = 0.0;
    for (name, ea) in a.store().ensembles() {
        let Some(eb) = b.store().ensemble(name) else { continue };
        let mut gamma = 0.0;
        let mut norm = 0.0;
        for (rn, ra) in ea.replicas() {
            let Some(rb) = eb.replica(rn) else { continue };
            let common: Vec<usize> = ra.idl().iter().filter(|&id| rb.idl().contains(id)).collect();
            if common.is_empty() {
                continue;
            }
            let common = crate::idl::Idl::from_list(common)?;
            let da = ra.idl().restrict(ra.deltas(), &common)?;
            let db = rb.idl().restrict(rb.deltas(), &common)?;
            gamma += da.iter().zip(&db).map(|(x, y)| x * y).sum::<f64>();
            norm += ((ra.len() * rb.len()) as f64).sqrt();
        }
        if gamma != 0.0 && norm > 0.0 {
            total += gamma / norm;
        }
    }
    Ok(total)
}

/// Covariance matrix `diag(σ) · ρ · diag(σ)` with σ from the gamma method
/// and ρ the lag-zero correlation of the deviations.
pub fn covariance_matrix(obs: &[Obs]) -> Result<DMatrix<f64>> {
    let n = obs.len();
    let mut naive = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        for j in i..n {
            let c = covariance_element(&obs[i], &obs[j])?;
            naive[(i, j)] = c;
            naive[(j, i)] = c;
        }
    }
    let inv_sd = DMatrix::from_diagonal(&naive.diagonal().map(|c: f64| if c > 0.0 { 1.0 / c.sqrt() } else { 0.0 }));
    let corr = &inv_sd * naive * &inv_sd;
    let errors = DMatrix::from_fn(n, n, |i, j| if i == j { obs[i].dvalue() } else { 0.0 });
    Ok(&errors * corr * &errors)
}

/// Covariance of two observables, see [`covariance_matrix`].
pub fn covariance(a: &Obs, b: &Obs) -> Result<f64> {
    let m = covariance_matrix(&[a.clone(), b.clone()])?;
    Ok(m[(0, 1)])
}
