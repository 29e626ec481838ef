// complex.rs - Complex observables as pairs of real observables

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use num_complex::Complex64;

use crate::derive::derive_array;
use crate::dual::Dual;
use crate::error::{ObsError, Result};
use crate::gamma::Uncertainty;
use crate::obs::{format_value_error, Obs};

/// Complex observable; each component keeps its own sample store.
#[derive(Debug, Clone, PartialEq)]
pub struct CObs {
    real: Obs,
    imag: Obs,
}

impl CObs {
    pub fn new(real: Obs, imag: Obs) -> Self {
        Self { real, imag }
    }

    /// Purely real observable, imaginary part zero on the same configurations.
    pub fn from_real(real: Obs) -> Self {
        let imag = real.map(|_| Dual::constant(0.0));
        Self { real, imag }
    }

    pub fn real(&self) -> &Obs {
        &self.real
    }

    pub fn imag(&self) -> &Obs {
        &self.imag
    }

    pub fn into_parts(self) -> (Obs, Obs) {
        (self.real, self.imag)
    }

    pub fn value(&self) -> Complex64 {
        Complex64::new(self.real.value(), self.imag.value())
    }

    /// Gamma method on both components.
    pub fn gamma_method(&self) -> (&Uncertainty, &Uncertainty) {
        (self.real.gamma_method(), self.imag.gamma_method())
    }

    /// Component-wise errors packed as a complex number.
    pub fn dvalue(&self) -> Complex64 {
        Complex64::new(self.real.dvalue(), self.imag.dvalue())
    }

    pub fn is_zero(&self, atol: f64) -> bool {
        self.real.is_zero(atol) && self.imag.is_zero(atol)
    }

    pub fn conj(&self) -> CObs {
        CObs::new(self.real.clone(), -&self.imag)
    }

    /// Modulus `sqrt(re² + im²)`.
    pub fn abs(&self) -> Result<Obs> {
        let mut out = derive_array(
            |x| vec![(x[0] * x[0] + x[1] * x[1]).sqrt()],
            &[&self.real, &self.imag],
        )?;
        Ok(out.remove(0))
    }

    /// Argument `atan2(im, re)`.
    pub fn arg(&self) -> Result<Obs> {
        self.imag.atan2(&self.real)
    }

    pub fn try_add(&self, rhs: &CObs) -> Result<CObs> {
        Ok(CObs::new(
            self.real.try_add(&rhs.real)?,
            self.imag.try_add(&rhs.imag)?,
        ))
    }

    pub fn try_sub(&self, rhs: &CObs) -> Result<CObs> {
        Ok(CObs::new(
            self.real.try_sub(&rhs.real)?,
            self.imag.try_sub(&rhs.imag)?,
        ))
    }

    pub fn try_mul(&self, rhs: &CObs) -> Result<CObs> {
        let out = derive_array(
            |x| {
                let (ar, ai, br, bi) = (x[0], x[1], x[2], x[3]);
                vec![ar * br - ai * bi, ar * bi + ai * br]
            },
            &[&self.real, &self.imag, &rhs.real, &rhs.imag],
        )?;
        Self::from_pair(out)
    }

    pub fn try_div(&self, rhs: &CObs) -> Result<CObs> {
        let out = derive_array(
            |x| {
                let (ar, ai, br, bi) = (x[0], x[1], x[2], x[3]);
                let norm = br * br + bi * bi;
                vec![(ar * br + ai * bi) / norm, (ai * br - ar * bi) / norm]
            },
            &[&self.real, &self.imag, &rhs.real, &rhs.imag],
        )?;
        Self::from_pair(out)
    }

    /// Product with a complex constant.
    pub fn scale(&self, c: Complex64) -> Result<CObs> {
        let out = derive_array(
            |x| vec![x[0] * c.re - x[1] * c.im, x[0] * c.im + x[1] * c.re],
            &[&self.real, &self.imag],
        )?;
        Self::from_pair(out)
    }

    /// Product with a real observable.
    pub fn try_mul_real(&self, rhs: &Obs) -> Result<CObs> {
        Ok(CObs::new(self.real.try_mul(rhs)?, self.imag.try_mul(rhs)?))
    }

    fn from_pair(out: Vec<Obs>) -> Result<CObs> {
        let [real, imag]: [Obs; 2] = out
            .try_into()
            .map_err(|v: Vec<Obs>| ObsError::shape(format!("{} components, expected 2", v.len())))?;
        Ok(CObs::new(real, imag))
    }
}

impl fmt::Display for CObs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let im = self.imag.value();
        let im_abs = match self.imag.uncertainty() {
            Some(u) => format_value_error(im.abs(), u.dvalue, 2),
            None => format!("{}", im.abs()),
        };
        let sign = if im < 0.0 { '-' } else { '+' };
        write!(f, "({}{sign}{im_abs}j)", self.real)
    }
}

fn expect_merged(r: Result<CObs>) -> CObs {
    match r {
        Ok(c) => c,
        Err(e) => panic!("{e}"),
    }
}

macro_rules! cobs_binop {
    ($trait:ident, $method:ident, $try:ident) => {
        impl<'a, 'b> $trait<&'b CObs> for &'a CObs {
            type Output = CObs;
            /// # Panics
            ///
            /// Panics if the operands cannot be merged; use the `try_*`
            /// method of [`CObs`] to get the error instead.
            fn $method(self, rhs: &'b CObs) -> CObs {
                expect_merged(self.$try(rhs))
            }
        }
        impl $trait<CObs> for CObs {
            type Output = CObs;
            /// # Panics
            ///
            /// Panics if the operands cannot be merged; use the `try_*`
            /// method of [`CObs`] to get the error instead.
            fn $method(self, rhs: CObs) -> CObs {
                expect_merged(self.$try(&rhs))
            }
        }
    };
}

cobs_binop!(Add, add, try_add);
cobs_binop!(Sub, sub, try_sub);
cobs_binop!(Mul, mul, try_mul);
cobs_binop!(Div, div, try_div);

impl Add<Complex64> for &CObs {
    type Output = CObs;
    fn add(self, rhs: Complex64) -> CObs {
        CObs::new(&self.real + rhs.re, &self.imag + rhs.im)
    }
}

impl Sub<Complex64> for &CObs {
    type Output = CObs;
    fn sub(self, rhs: Complex64) -> CObs {
        CObs::new(&self.real - rhs.re, &self.imag - rhs.im)
    }
}

impl Mul<Complex64> for &CObs {
    type Output = CObs;
    /// # Panics
    ///
    /// Panics if the operands cannot be merged; see [`CObs::scale`].
    fn mul(self, rhs: Complex64) -> CObs {
        expect_merged(self.scale(rhs))
    }
}

impl Div<Complex64> for &CObs {
    type Output = CObs;
    /// # Panics
    ///
    /// Panics if the operands cannot be merged; see [`CObs::scale`].
    fn div(self, rhs: Complex64) -> CObs {
        expect_merged(self.scale(rhs.inv()))
    }
}

impl Mul<f64> for &CObs {
    type Output = CObs;
    fn mul(self, rhs: f64) -> CObs {
        CObs::new(&self.real * rhs, &self.imag * rhs)
    }
}

impl Mul<&Obs> for &CObs {
    type Output = CObs;
    /// # Panics
    ///
    /// Panics if the operands cannot be merged; see [`CObs::try_mul_real`].
    fn mul(self, rhs: &Obs) -> CObs {
        expect_merged(self.try_mul_real(rhs))
    }
}

impl Neg for &CObs {
    type Output = CObs;
    fn neg(self) -> CObs {
        CObs::new(-&self.real, -&self.imag)
    }
}
