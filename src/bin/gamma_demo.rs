// src/bin/gamma_demo.rs - Coverage study of the gamma method on AR(1) chains
//
//  Compile & run:  `cargo run --release --bin gamma_demo -- --tau 4 --repeats 400`

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use mc_errors::gamma::{GammaConfig, WindowRule};
use mc_errors::rng::stream_rng;
use mc_errors::Obs;

#[derive(Parser)]
struct Cli {
    /// Samples per chain
    #[arg(long, default_value = "2000")]
    samples: usize,

    /// Integrated autocorrelation time of the generated chains (>= 0.5)
    #[arg(long, default_value = "4.0")]
    tau: f64,

    /// Number of independent chains
    #[arg(long, default_value = "200")]
    repeats: usize,

    /// Master seed
    #[arg(long, default_value = "2024")]
    seed: u64,

    /// Window scale factor S
    #[arg(long, default_value = "2.0")]
    s: f64,

    /// Use Sokal's window condition instead of Wolff's
    #[arg(long)]
    sokal: bool,
}

/// Stationary AR(1) chain with unit variance and the requested τ_int.
fn ar1_chain(rng: &mut impl Rng, tau: f64, n: usize) -> Vec<f64> {
    let a = (2.0 * tau - 1.0) / (2.0 * tau + 1.0);
    let mut x: f64 = rng.sample(StandardNormal);
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(x);
        let e: f64 = rng.sample(StandardNormal);
        x = a * x + (1.0 - a * a).sqrt() * e;
    }
    out
}

struct Trial {
    value: f64,
    dvalue: f64,
    tauint: f64,
    window_warning: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();
    let config = GammaConfig {
        s: args.s,
        rule: if args.sokal { WindowRule::Sokal } else { WindowRule::Wolff },
        ..GammaConfig::default()
    };
    config.validate()?;
    if !(args.tau >= 0.5) {
        return Err("tau must be at least 0.5".into());
    }

    let pb = ProgressBar::new(args.repeats as u64);
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} chains ({eta})")?
            .progress_chars("##-"),
    );

    let trials: Vec<Trial> = (0..args.repeats)
        .into_par_iter()
        .map(|r| -> mc_errors::Result<Trial> {
            let mut rng = stream_rng(args.seed, r);
            let obs = Obs::from_samples(ar1_chain(&mut rng, args.tau, args.samples), "chain")?;
            let u = obs.analyse(&config)?;
            pb.inc(1);
            Ok(Trial {
                value: obs.value(),
                dvalue: u.dvalue,
                tauint: u.ensembles.get("chain").map_or(0.5, |e| e.tauint),
                window_warning: u.has_warnings(),
            })
        })
        .collect::<mc_errors::Result<_>>()?;
    pb.finish_and_clear();

    let n = trials.len().max(1) as f64;
    // asymptotic error of the mean of a unit-variance chain
    let exact = (2.0 * args.tau / args.samples as f64).sqrt();
    let mean_dvalue = trials.iter().map(|t| t.dvalue).sum::<f64>() / n;
    let mean_tau = trials.iter().map(|t| t.tauint).sum::<f64>() / n;
    let spread = (trials.iter().map(|t| t.value * t.value).sum::<f64>() / n).sqrt();
    let covered = trials.iter().filter(|t| t.value.abs() <= t.dvalue).count();
    let warned = trials.iter().filter(|t| t.window_warning).count();

    println!("chains: {}  samples: {}  tau: {}", args.repeats, args.samples, args.tau);
    println!("exact error          {:.6e}", exact);
    println!("observed spread      {:.6e}", spread);
    println!("mean gamma error     {:.6e}", mean_dvalue);
    println!("mean tau_int         {:.4}", mean_tau);
    println!("1-sigma coverage     {:.1}%", 100.0 * covered as f64 / n);
    println!("window warnings      {warned}");
    Ok(())
}
