use mc_errors::gamma::{GammaConfig, WindowRule};
use mc_errors::idl::Idl;
use mc_errors::reweight::{kish_fraction, reweight};
use mc_errors::{Obs, ObsError};

fn chain(n: usize, f: impl Fn(usize) -> f64) -> Vec<f64> {
    (0..n).map(f).collect()
}

#[test]
fn test_constant_weight_leaves_observable_unchanged() {
    let weight = Obs::from_samples(vec![2.0; 40], "ens").unwrap();
    let o = Obs::from_samples(chain(40, |i| (i as f64 * 0.37).sin()), "ens").unwrap();
    let rw = reweight(&weight, &[o.clone()]).unwrap().remove(0);

    assert!((rw.value() - o.value()).abs() < 1e-14);
    let (a, b) = (rw.deltas(), o.deltas());
    for (x, y) in a["ens"].iter().zip(&b["ens"]) {
        assert!((x - y).abs() < 1e-14);
    }
    assert!(rw.reweighted());
    assert_eq!(rw.store().ensemble("ens").unwrap().ess_fraction(), Some(1.0));
}

#[test]
fn test_weighted_average() {
    let w = chain(10, |i| if i < 5 { 1.0 } else { 3.0 });
    let x = chain(10, |i| if i < 5 { 0.0 } else { 1.0 });
    let weight = Obs::from_samples(w, "ens").unwrap();
    let o = Obs::from_samples(x, "ens").unwrap();
    let rw = reweight(&weight, &[o]).unwrap().remove(0);
    // (5 * 0 * 1 + 5 * 1 * 3) / (5 * 1 + 5 * 3)
    assert!((rw.value() - 0.75).abs() < 1e-14);

    // (Σw)² / (N Σw²) = 400 / (10 * 50)
    let fraction = rw.store().ensemble("ens").unwrap().ess_fraction().unwrap();
    assert!((fraction - 0.8).abs() < 1e-14);
    assert!((kish_fraction(&chain(10, |i| if i < 5 { 1.0 } else { 3.0 })) - 0.8).abs() < 1e-14);
}

#[test]
fn test_reweighting_on_a_subset_of_configurations() {
    let weight = Obs::from_samples(chain(20, |i| 1.0 + 0.1 * (i % 3) as f64), "ens").unwrap();
    let thinned = Obs::with_idl(
        vec![chain(10, |i| i as f64)],
        &["ens"],
        vec![Idl::range(1, 21, 2).unwrap()],
    )
    .unwrap();
    let rw = reweight(&weight, &[thinned.clone()]).unwrap().remove(0);
    assert_eq!(rw.idl()["ens"], thinned.idl()["ens"]);
    assert!(rw.dvalue() > 0.0);
}

#[test]
fn test_weight_must_cover_the_observable() {
    let weight = Obs::from_samples(vec![1.0, 1.2, 0.8, 1.1, 0.9], "ens").unwrap();
    let longer = Obs::from_samples(chain(8, |i| i as f64), "ens").unwrap();
    assert!(matches!(
        reweight(&weight, &[longer]),
        Err(ObsError::ConfigurationMismatch { .. })
    ));

    let elsewhere = Obs::from_samples(chain(5, |i| i as f64), "other").unwrap();
    assert!(matches!(
        reweight(&weight, &[elsewhere]),
        Err(ObsError::ConfigurationMismatch { .. })
    ));
}

#[test]
fn test_reweighting_twice_is_rejected() {
    let weight = Obs::from_samples(vec![1.0, 1.2, 0.8, 1.1, 0.9], "ens").unwrap();
    let o = Obs::from_samples(vec![3.0, 1.0, 2.0, 5.0, 4.0], "ens").unwrap();
    let once = reweight(&weight, &[o]).unwrap();
    assert!(matches!(
        reweight(&weight, &once),
        Err(ObsError::InconsistentFlags { .. })
    ));
}

#[test]
fn test_reweighted_observables_combine() {
    let weight = Obs::from_samples(chain(30, |i| 1.0 + 0.05 * (i % 4) as f64), "ens").unwrap();
    let a = Obs::from_samples(chain(30, |i| (i as f64).cos()), "ens").unwrap();
    let b = Obs::from_samples(chain(30, |i| (i as f64 * 0.5).sin()), "ens").unwrap();
    let rw = reweight(&weight, &[a, b]).unwrap();
    let ratio = &rw[0] / &rw[1];
    assert!(ratio.reweighted());
    assert!(ratio.dvalue().is_finite());
    let e = ratio.gamma_method().ensemble("ens").unwrap();
    assert!(e.tauint >= 0.5);
}

#[test]
fn test_effective_sample_size_enters_the_error() {
    let n = 40;
    let weight = Obs::from_samples(chain(n, |i| if i < 20 { 1.0 } else { 3.0 }), "ens").unwrap();
    let o = Obs::from_samples(chain(n, |i| (i as f64 * 1.3).sin() + 0.1 * i as f64), "ens").unwrap();
    let rw = reweight(&weight, &[o]).unwrap().remove(0);

    let fraction = rw.store().ensemble("ens").unwrap().ess_fraction().unwrap();
    // (Σw)² / (N Σw²) = 80² / (40 * 200)
    assert!((fraction - 0.8).abs() < 1e-14);
    let n_eff = n as f64 * fraction;

    // same deviations without the reweighting flag
    let samples: Vec<f64> = rw.deltas()["ens"].iter().map(|d| d + rw.value()).collect();
    let plain = Obs::from_samples(samples, "ens").unwrap();

    // Sokal's stopping rule does not depend on N, so both pick the same window
    let config = GammaConfig::default().with_rule(WindowRule::Sokal);
    let ur = rw.analyse(&config).unwrap();
    let up = plain.analyse(&config).unwrap();
    let (er, ep) = (ur.ensemble("ens").unwrap(), up.ensemble("ens").unwrap());
    assert_eq!(er.window, ep.window);

    let w = er.window / er.gap;
    let bias = (1.0 + (2.0 * w as f64 + 1.0) / n_eff) / (1.0 + 1.0 / n_eff);
    assert!((er.tauint - er.n_tauint[w] * bias).abs() < 1e-12);
    let expected = er.naive_dvalue * (2.0 * er.tauint * (1.0 + 1.0 / n_eff)).sqrt();
    assert!((er.dvalue - expected).abs() < 1e-12 * expected);
    let expected_dd = er.dvalue * ((w as f64 + 0.5) / n_eff).sqrt();
    assert!((er.ddvalue - expected_dd).abs() < 1e-12 * expected_dd);

    assert!(ur.dvalue > up.dvalue, "{} vs {}", ur.dvalue, up.dvalue);
    assert!(ur.ddvalue > up.ddvalue, "{} vs {}", ur.ddvalue, up.ddvalue);
}
