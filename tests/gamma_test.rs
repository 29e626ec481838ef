use mc_errors::gamma::{analyse, analyse_all, gamma_function, GammaConfig, WindowRule};
use mc_errors::idl::Idl;
use mc_errors::{Obs, ObsError};
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rand_pcg::Pcg64;

/// AR(1) chain with unit variance and τ_int = (1 + a) / (2 (1 - a)).
fn ar1(a: f64, n: usize, seed: u64) -> Vec<f64> {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut x: f64 = StandardNormal.sample(&mut rng);
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(x);
        let e: f64 = StandardNormal.sample(&mut rng);
        x = a * x + (1.0 - a * a).sqrt() * e;
    }
    out
}

fn tau_to_a(tau: f64) -> f64 {
    (2.0 * tau - 1.0) / (2.0 * tau + 1.0)
}

#[test]
fn test_uncorrelated_error_matches_naive_estimate() {
    let n = 1000;
    let trials = 40;
    let mut sum_err = 0.0;
    let mut sum_tau = 0.0;
    for seed in 0..trials {
        let o = Obs::from_samples(ar1(0.0, n, seed), "ens").unwrap();
        sum_err += o.dvalue();
        sum_tau += o.gamma_method().ensemble("ens").unwrap().tauint;
    }
    let mean_err = sum_err / trials as f64;
    let mean_tau = sum_tau / trials as f64;
    let expected = 1.0 / (n as f64).sqrt();
    assert!(
        (mean_err / expected - 1.0).abs() < 0.1,
        "mean error {mean_err} vs sigma/sqrt(N) = {expected}"
    );
    assert!(mean_tau > 0.35 && mean_tau < 0.7, "tau_int of white noise is {mean_tau}");
}

#[test]
fn test_autocorrelated_chain_tauint() {
    let o = Obs::from_samples(ar1(tau_to_a(4.0), 20_000, 7), "ens").unwrap();
    let u = o.gamma_method();
    let e = u.ensemble("ens").unwrap();
    assert!(e.tauint > 3.0 && e.tauint < 5.0, "tau_int = {}", e.tauint);
    assert!(e.window > 0);
    assert!(!u.has_warnings());
    assert!(u.dvalue > 2.0 * e.naive_dvalue, "autocorrelation must inflate the error");
    assert_eq!(e.rho[0], 1.0);
    assert_eq!(e.n_tauint[0], 0.5);
    // ddvalue = dvalue * sqrt((W + 1/2) / N)
    let expected_dd = e.dvalue * ((e.window as f64 + 0.5) / 20_000.0).sqrt();
    assert!((e.ddvalue - expected_dd).abs() < 1e-14);
    assert!((u.ddvalue - e.ddvalue).abs() < 1e-14);
}

#[test]
fn test_window_exhaustion_is_reported() {
    let o = Obs::from_samples(ar1(0.995, 2000, 3), "ens").unwrap();
    let u = o.analyse(&GammaConfig::default().with_max_window(10)).unwrap();
    assert!(u.has_warnings(), "strongly correlated chain must exhaust a window of 10");
    let w = &u.warnings[0];
    assert_eq!(w.ensemble, "ens");
    assert_eq!(w.searched_window, 10);
    assert!(w.to_string().contains("ens"));
    let e = u.ensemble("ens").unwrap();
    assert!(e.window_exhausted);
    assert!(u.dvalue.is_finite() && u.dvalue > 0.0);
}

#[test]
fn test_constant_samples_have_zero_error() {
    let o = Obs::from_samples(vec![1.25; 50], "ens").unwrap();
    let u = o.gamma_method();
    assert_eq!(u.dvalue, 0.0);
    assert_eq!(u.ddvalue, 0.0);
    let e = u.ensemble("ens").unwrap();
    assert_eq!(e.tauint, 0.5);
    assert_eq!(e.window, 0);
    assert!(!u.has_warnings());
}

#[test]
fn test_zero_scale_factor_disables_windowing() {
    let n = 500;
    let o = Obs::from_samples(ar1(tau_to_a(3.0), n, 11), "ens").unwrap();
    let u = o.analyse(&GammaConfig::default().with_s(0.0)).unwrap();
    let e = u.ensemble("ens").unwrap();
    assert_eq!(e.window, 0);
    assert_eq!(e.tauint, 0.5);
    let expected = e.naive_dvalue * (1.0 + 1.0 / n as f64).sqrt();
    assert!((u.dvalue - expected).abs() < 1e-14);
}

#[test]
fn test_first_analysis_is_cached() {
    let o = Obs::from_samples(ar1(0.5, 300, 5), "ens").unwrap();
    assert!(!o.is_computed());
    let first = o.gamma_method();
    let second = o.gamma_method();
    assert!(std::ptr::eq(first, second));

    // a later request with other settings returns the cached result
    let other = GammaConfig::default().with_s(0.0);
    let cached = o.gamma_method_with(&other).unwrap();
    assert_eq!(cached.config, GammaConfig::default());

    let fresh = o.analyse(&other).unwrap();
    assert_eq!(fresh.ensemble("ens").unwrap().window, 0);
    assert!(std::ptr::eq(o.gamma_method(), first));
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let o = Obs::from_samples(ar1(0.0, 100, 1), "ens").unwrap();
    let bad = GammaConfig::default().with_s(-1.0);
    assert!(matches!(o.analyse(&bad), Err(ObsError::InvalidParameter { .. })));
    assert!(matches!(o.gamma_method_with(&bad), Err(ObsError::InvalidParameter { .. })));
    assert!(!o.is_computed());
    assert!(matches!(
        analyse(o.store(), &GammaConfig::default().with_tau_exp(-2.0)),
        Err(ObsError::InvalidParameter { .. })
    ));
}

#[test]
fn test_thinned_chain_uses_common_gap() {
    let n = 4000;
    let samples = ar1(tau_to_a(2.0), n, 17);
    let dense = Obs::from_samples(samples.clone(), "ens").unwrap();
    let thinned =
        Obs::with_idl(vec![samples], &["ens"], vec![Idl::range(1, 2 * n + 1, 2).unwrap()]).unwrap();

    let d = dense.gamma_method().ensemble("ens").unwrap().clone();
    let t = thinned.gamma_method().ensemble("ens").unwrap().clone();
    assert_eq!(d.gap, 1);
    assert_eq!(t.gap, 2);
    assert!((d.tauint - t.tauint).abs() < 1e-12);
    assert_eq!(t.window, 2 * d.window);
    assert!((dense.dvalue() - thinned.dvalue()).abs() < 1e-14);
}

#[test]
fn test_irregular_ids_are_normalised_by_pair_counts() {
    let ids: Vec<usize> = (1..=400).filter(|i| i % 7 != 0).collect();
    let samples = ar1(0.3, ids.len(), 23);
    let o = Obs::with_idl(vec![samples], &["ens"], vec![Idl::from_list(ids).unwrap()]).unwrap();
    let e = o.gamma_method().ensemble("ens").unwrap();
    assert_eq!(e.gap, 1);
    assert_eq!(e.rho[0], 1.0);
    assert!(e.rho.iter().all(|r| r.is_finite()));
    assert!(o.dvalue() > 0.0);
}

#[test]
fn test_gamma_function_of_alternating_chain() {
    let samples: Vec<f64> = (0..10).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
    let o = Obs::from_samples(samples, "ens").unwrap();
    let g = gamma_function(o.store().ensemble("ens").unwrap(), 1, 3);
    assert_eq!(g.len(), 3);
    assert!((g[0] - 1.0).abs() < 1e-14);
    assert!((g[1] + 1.0).abs() < 1e-14);
    assert!((g[2] - 1.0).abs() < 1e-14);
}

#[test]
fn test_replica_offsets_count_as_fluctuations() {
    let r0 = ar1(0.0, 500, 31);
    let r1 = ar1(0.0, 500, 32);
    let shifted: Vec<f64> = r1.iter().map(|x| x + 5.0).collect();

    let plain = Obs::new(vec![r0.clone(), r1], &["ens|r0", "ens|r1"]).unwrap();
    let offset = Obs::new(vec![r0, shifted], &["ens|r0", "ens|r1"]).unwrap();
    assert_eq!(plain.gamma_method().ensemble("ens").unwrap().n_samples, 1000);
    assert!(offset.dvalue() > 5.0 * plain.dvalue());
}

#[test]
fn test_anticorrelated_chains_keep_naive_error() {
    let alternating: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
    let chains = [
        Obs::from_samples(alternating, "ens").unwrap(),
        Obs::from_samples(ar1(-0.6, 2000, 71), "ens").unwrap(),
    ];
    for o in &chains {
        for rule in [WindowRule::Wolff, WindowRule::Sokal] {
            let u = o.analyse(&GammaConfig::default().with_rule(rule)).unwrap();
            let e = u.ensemble("ens").unwrap();
            assert!(u.dvalue.is_finite(), "{rule:?}: dvalue = {}", u.dvalue);
            assert!(e.tauint >= 0.5, "{rule:?}: tau_int = {}", e.tauint);
            assert!(e.n_tauint.iter().all(|&t| t >= 0.5));
            assert!(u.dvalue >= e.naive_dvalue, "{rule:?}: error below the naive estimate");
        }
        let tail = o.analyse(&GammaConfig::default().with_tau_exp(3.0)).unwrap();
        assert!(tail.dvalue.is_finite() && tail.ensemble("ens").unwrap().tauint >= 0.5);
    }
}

#[test]
fn test_sokal_rule_on_white_noise() {
    let o = Obs::from_samples(ar1(0.0, 2000, 41), "ens").unwrap();
    let u = o.analyse(&GammaConfig::default().with_rule(WindowRule::Sokal)).unwrap();
    let e = u.ensemble("ens").unwrap();
    assert!(!u.has_warnings());
    assert!(e.window >= 1);
    assert!(e.tauint > 0.3 && e.tauint < 0.8, "tau_int = {}", e.tauint);
}

#[test]
fn test_exponential_tail() {
    let o = Obs::from_samples(ar1(tau_to_a(4.0), 20_000, 43), "ens").unwrap();
    let plain = o.analyse(&GammaConfig::default()).unwrap();
    let tail = o
        .analyse(&GammaConfig::default().with_ensemble_tau_exp("ens", 6.0).with_n_sigma(1.0))
        .unwrap();
    let e = tail.ensemble("ens").unwrap();
    assert!(e.tauint > 3.0, "tau_int with tail = {}", e.tauint);
    assert!(e.dtauint > 0.0);
    assert!(!tail.has_warnings());
    assert!((tail.dvalue / plain.dvalue - 1.0).abs() < 0.3);
}

#[test]
fn test_error_budget_over_ensembles() {
    let a = Obs::from_samples(ar1(0.2, 400, 51), "a").unwrap();
    let b = Obs::from_samples(ar1(0.2, 400, 52), "b").unwrap();
    let c = &a + &(&b * 3.0);
    let u = c.gamma_method();
    let budget = u.error_budget();
    let total: f64 = budget.values().sum();
    assert!((total - 1.0).abs() < 1e-12);
    assert!(budget["b"] > budget["a"]);
    let quad = (a.dvalue().powi(2) + 9.0 * b.dvalue().powi(2)).sqrt();
    assert!((u.dvalue - quad).abs() < 1e-12);
}

#[test]
fn test_parallel_analysis_matches_sequential() {
    let obs: Vec<Obs> = (0..6)
        .map(|s| Obs::from_samples(ar1(0.4, 300, 60 + s), "ens").unwrap())
        .collect();
    let stores: Vec<_> = obs.iter().map(|o| o.store()).collect();
    let all = analyse_all(&stores, &GammaConfig::default()).unwrap();
    for (o, u) in obs.iter().zip(&all) {
        assert_eq!(u, o.gamma_method());
    }
    let json = serde_json::to_string(&all[0].config).unwrap();
    let back: GammaConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, GammaConfig::default());
}
