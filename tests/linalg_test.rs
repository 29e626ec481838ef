use mc_errors::linalg::{covariance, covariance_matrix, det, inv, matmul, values};
use mc_errors::{Obs, ObsError};
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64;

fn noisy(mean: f64, n: usize, seed: u64) -> Obs {
    let mut rng = Pcg64::seed_from_u64(seed);
    let normal = Normal::new(mean, 0.05).unwrap();
    Obs::from_samples((0..n).map(|_| normal.sample(&mut rng)).collect(), "ens").unwrap()
}

fn sample_matrix() -> DMatrix<Obs> {
    DMatrix::from_row_slice(
        2,
        2,
        &[noisy(2.0, 200, 1), noisy(0.5, 200, 2), noisy(-0.3, 200, 3), noisy(1.5, 200, 4)],
    )
}

#[test]
fn test_inverse_times_matrix_is_exact_identity() {
    let a = sample_matrix();
    let a_inv = inv(&a).unwrap();
    let id = matmul(&a_inv, &a).unwrap();
    for i in 0..2 {
        for j in 0..2 {
            let e = &id[(i, j)];
            let expected = if i == j { 1.0 } else { 0.0 };
            assert!((e.value() - expected).abs() < 1e-12);
            assert!(e.deltas()["ens"].iter().all(|d| d.abs() < 1e-12), "entry ({i},{j}) fluctuates");
        }
    }
    let central_inv = values(&a).try_inverse().unwrap();
    assert!((values(&a_inv) - central_inv).amax() < 1e-14);
}

#[test]
fn test_determinant_follows_product_rule() {
    let a = sample_matrix();
    let d = det(&a).unwrap();
    let expected = &(&a[(0, 0)] * &a[(1, 1)]) - &(&a[(0, 1)] * &a[(1, 0)]);
    assert!((d.value() - expected.value()).abs() < 1e-12);
    let (dd, de) = (d.deltas(), expected.deltas());
    for (x, y) in dd["ens"].iter().zip(&de["ens"]) {
        assert!((x - y).abs() < 1e-12);
    }
}

#[test]
fn test_shape_and_singularity_errors() {
    let a = sample_matrix();
    let row = DMatrix::from_row_slice(1, 2, &[noisy(1.0, 20, 5), noisy(1.0, 20, 6)]);
    assert!(matches!(matmul(&a, &row), Err(ObsError::ShapeMismatch { .. })));
    assert!(matches!(inv(&row), Err(ObsError::ShapeMismatch { .. })));

    let x = noisy(1.0, 20, 7);
    let singular = DMatrix::from_row_slice(2, 2, &[x.clone(), x.clone(), x.clone(), x]);
    assert!(matches!(inv(&singular), Err(ObsError::SingularMatrix)));
}

#[test]
fn test_covariance_of_scaled_copy() {
    let a = noisy(1.0, 500, 8);
    let b = &a * 2.0;
    let cov = covariance_matrix(&[a.clone(), b.clone()]).unwrap();
    let sa = a.dvalue();
    assert!((cov[(0, 0)] - sa * sa).abs() < 1e-14);
    assert!((cov[(1, 1)] - 4.0 * sa * sa).abs() < 1e-13);
    assert!((cov[(0, 1)] - 2.0 * sa * sa).abs() < 1e-13);
    assert!((cov[(0, 1)] - cov[(1, 0)]).abs() < 1e-16);
    assert!((covariance(&a, &b).unwrap() - cov[(0, 1)]).abs() < 1e-15);
}

#[test]
fn test_independent_ensembles_do_not_correlate() {
    let a = noisy(1.0, 100, 9);
    let mut rng = Pcg64::seed_from_u64(10);
    let normal = Normal::new(1.0, 0.05).unwrap();
    let b = Obs::from_samples((0..100).map(|_| normal.sample(&mut rng)).collect(), "other").unwrap();
    let cov = covariance_matrix(&[a, b]).unwrap();
    assert_eq!(cov[(0, 1)], 0.0);
    assert!(cov[(0, 0)] > 0.0 && cov[(1, 1)] > 0.0);
}
