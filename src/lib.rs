pub mod complex;
pub mod derive;
pub mod dual;
pub mod error;
pub mod gamma;
pub mod idl;
pub mod linalg;
pub mod misc;
pub mod obs;
mod ops;
pub mod reweight;
pub mod rng;
pub mod store;

pub use complex::CObs;
pub use derive::{
    derive, derive_array, derive_array_with, derive_numeric, derive_operands, derive_with,
    derive_with_jacobian, Combinable, DeriveOptions, Operand,
};
pub use dual::Dual;
pub use error::{ObsError, Result};
pub use gamma::{AutocorrelationWindowWarning, EnsembleAnalysis, GammaConfig, Uncertainty, WindowRule};
pub use idl::Idl;
pub use misc::{gen_correlated_data, pseudo_obs};
pub use obs::{check_same_configs, gamma_method_all, same_configuration_set, Obs};
pub use reweight::reweight;
pub use store::{MergePolicy, SampleStore};
