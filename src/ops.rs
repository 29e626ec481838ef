// ops.rs - Operator overloads for observables
//
// Binary operators between two observables go through the derivative
// combinator and panic if the operands cannot be merged; the `try_*`
// methods return the error instead.

use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::derive::derive;
use crate::dual::Dual;
use crate::error::Result;
use crate::obs::Obs;

impl Obs {
    pub fn try_add(&self, rhs: &Obs) -> Result<Obs> {
        derive(|x| x[0] + x[1], &[self, rhs])
    }

    pub fn try_sub(&self, rhs: &Obs) -> Result<Obs> {
        derive(|x| x[0] - x[1], &[self, rhs])
    }

    pub fn try_mul(&self, rhs: &Obs) -> Result<Obs> {
        derive(|x| x[0] * x[1], &[self, rhs])
    }

    pub fn try_div(&self, rhs: &Obs) -> Result<Obs> {
        derive(|x| x[0] / x[1], &[self, rhs])
    }
}

fn expect_merged(r: Result<Obs>) -> Obs {
    match r {
        Ok(o) => o,
        Err(e) => panic!("{e}"),
    }
}

macro_rules! obs_binop {
    ($trait:ident, $method:ident, $try:ident) => {
        impl<'a, 'b> $trait<&'b Obs> for &'a Obs {
            type Output = Obs;
            /// # Panics
            ///
            /// Panics if the operands cannot be merged; use the `try_*`
            /// method of [`Obs`] to get the error instead.
            fn $method(self, rhs: &'b Obs) -> Obs {
                expect_merged(self.$try(rhs))
            }
        }
        impl $trait<Obs> for Obs {
            type Output = Obs;
            /// # Panics
            ///
            /// Panics if the operands cannot be merged; use the `try_*`
            /// method of [`Obs`] to get the error instead.
            fn $method(self, rhs: Obs) -> Obs {
                expect_merged(self.$try(&rhs))
            }
        }
        impl<'b> $trait<&'b Obs> for Obs {
            type Output = Obs;
            /// # Panics
            ///
            /// Panics if the operands cannot be merged; use the `try_*`
            /// method of [`Obs`] to get the error instead.
            fn $method(self, rhs: &'b Obs) -> Obs {
                expect_merged(self.$try(rhs))
            }
        }
        impl<'a> $trait<Obs> for &'a Obs {
            type Output = Obs;
            /// # Panics
            ///
            /// Panics if the operands cannot be merged; use the `try_*`
            /// method of [`Obs`] to get the error instead.
            fn $method(self, rhs: Obs) -> Obs {
                expect_merged(self.$try(&rhs))
            }
        }
    };
}

obs_binop!(Add, add, try_add);
obs_binop!(Sub, sub, try_sub);
obs_binop!(Mul, mul, try_mul);
obs_binop!(Div, div, try_div);

macro_rules! scalar_binop {
    ($trait:ident, $method:ident, $op:tt) => {
        impl<'a> $trait<f64> for &'a Obs {
            type Output = Obs;
            fn $method(self, rhs: f64) -> Obs {
                self.map(|x: Dual| x $op rhs)
            }
        }
        impl $trait<f64> for Obs {
            type Output = Obs;
            fn $method(self, rhs: f64) -> Obs {
                self.map(|x: Dual| x $op rhs)
            }
        }
        impl<'a> $trait<&'a Obs> for f64 {
            type Output = Obs;
            fn $method(self, rhs: &'a Obs) -> Obs {
                rhs.map(|x: Dual| self $op x)
            }
        }
        impl $trait<Obs> for f64 {
            type Output = Obs;
            fn $method(self, rhs: Obs) -> Obs {
                rhs.map(|x: Dual| self $op x)
            }
        }
    };
}

scalar_binop!(Add, add, +);
scalar_binop!(Sub, sub, -);
scalar_binop!(Mul, mul, *);
scalar_binop!(Div, div, /);

impl Neg for &Obs {
    type Output = Obs;
    fn neg(self) -> Obs {
        self.map(|x| -x)
    }
}

impl Neg for Obs {
    type Output = Obs;
    fn neg(self) -> Obs {
        -&self
    }
}
