use mc_errors::derive::derive;
use mc_errors::idl::Idl;
use mc_errors::Obs;
use proptest::prelude::*;

fn samples(len: usize) -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-10.0f64..10.0, len)
}

fn id_list() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::btree_set(1usize..200, 1..40).prop_map(|s| s.into_iter().collect())
}

proptest! {
    #[test]
    fn linear_maps_propagate_exactly(
        xs in samples(12),
        ys in samples(12),
        a in -5.0f64..5.0,
        b in -5.0f64..5.0,
    ) {
        let x = Obs::from_samples(xs, "ens").unwrap();
        let y = Obs::from_samples(ys, "ens").unwrap();
        let z = derive(|v| a * v[0] + b * v[1], &[&x, &y]).unwrap();
        let (dx, dy, dz) = (x.deltas(), y.deltas(), z.deltas());
        for ((p, q), r) in dx["ens"].iter().zip(&dy["ens"]).zip(&dz["ens"]) {
            prop_assert!((r - (a * p + b * q)).abs() < 1e-10);
        }
        prop_assert!((z.value() - (a * x.value() + b * y.value())).abs() < 1e-10);
    }

    #[test]
    fn errors_are_non_negative_and_scale(xs in samples(30), c in 0.1f64..10.0) {
        let x = Obs::from_samples(xs, "ens").unwrap();
        let scaled = &x * c;
        prop_assert!(x.dvalue() >= 0.0);
        prop_assert!((scaled.dvalue() - c * x.dvalue()).abs() <= 1e-9 * (1.0 + x.dvalue()));
    }

    #[test]
    fn id_lists_are_canonical(ids in id_list()) {
        let idl = Idl::from_list(ids.clone()).unwrap();
        prop_assert_eq!(idl.to_vec(), ids.clone());
        prop_assert_eq!(idl.len(), ids.len());
        for (i, id) in ids.iter().enumerate() {
            prop_assert_eq!(idl.position(*id), Some(i));
        }
        let gap = idl.gap().unwrap_or(1);
        prop_assert!(ids.windows(2).all(|w| (w[1] - w[0]) % gap == 0));
    }

    #[test]
    fn union_contains_both_lists(a in id_list(), b in id_list()) {
        let ia = Idl::from_list(a).unwrap();
        let ib = Idl::from_list(b).unwrap();
        let u = Idl::union([&ia, &ib]).unwrap();
        prop_assert!(ia.is_subset_of(&u));
        prop_assert!(ib.is_subset_of(&u));
        prop_assert!(u.len() <= ia.len() + ib.len());
    }
}
