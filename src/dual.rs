// dual.rs - Forward-mode dual numbers carrying the closed-form derivative table

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// Number `re + eps·ε` with `ε² = 0`.
///
/// Evaluating a function on duals seeded with `eps = 1` for one argument
/// yields the exact partial derivative with respect to that argument in the
/// `eps` part. Every elementary function below applies its textbook
/// derivative, so no step size is involved.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Dual {
    pub re: f64,
    pub eps: f64,
}

impl Dual {
    pub const fn new(re: f64, eps: f64) -> Self {
        Self { re, eps }
    }

    /// A constant: derivative zero.
    pub const fn constant(re: f64) -> Self {
        Self { re, eps: 0.0 }
    }

    /// The differentiation variable: derivative one.
    pub const fn variable(re: f64) -> Self {
        Self { re, eps: 1.0 }
    }

    #[inline]
    fn chain(self, value: f64, derivative: f64) -> Self {
        Self::new(value, derivative * self.eps)
    }

    pub fn recip(self) -> Self {
        let inv = 1.0 / self.re;
        self.chain(inv, -inv * inv)
    }

    pub fn exp(self) -> Self {
        let e = self.re.exp();
        self.chain(e, e)
    }

    pub fn ln(self) -> Self {
        self.chain(self.re.ln(), 1.0 / self.re)
    }

    pub fn log10(self) -> Self {
        self.chain(self.re.log10(), 1.0 / (self.re * std::f64::consts::LN_10))
    }

    pub fn sqrt(self) -> Self {
        let s = self.re.sqrt();
        self.chain(s, 0.5 / s)
    }

    pub fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Self::constant(1.0);
        }
        self.chain(self.re.powi(n), n as f64 * self.re.powi(n - 1))
    }

    pub fn powf(self, n: f64) -> Self {
        if n == 0.0 {
            return Self::constant(1.0);
        }
        self.chain(self.re.powf(n), n * self.re.powf(n - 1.0))
    }

    /// `self^exponent` with both base and exponent varying.
    pub fn pow(self, exponent: Dual) -> Self {
        if exponent.eps == 0.0 {
            return self.powf(exponent.re);
        }
        let value = self.re.powf(exponent.re);
        let d_base = if self.eps == 0.0 {
            0.0
        } else {
            exponent.re * self.re.powf(exponent.re - 1.0) * self.eps
        };
        let d_exp = value * self.re.ln() * exponent.eps;
        Self::new(value, d_base + d_exp)
    }

    pub fn abs(self) -> Self {
        self.chain(self.re.abs(), self.re.signum())
    }

    pub fn sin(self) -> Self {
        self.chain(self.re.sin(), self.re.cos())
    }

    pub fn cos(self) -> Self {
        self.chain(self.re.cos(), -self.re.sin())
    }

    pub fn tan(self) -> Self {
        let c = self.re.cos();
        self.chain(self.re.tan(), 1.0 / (c * c))
    }

    pub fn asin(self) -> Self {
        self.chain(self.re.asin(), 1.0 / (1.0 - self.re * self.re).sqrt())
    }

    pub fn acos(self) -> Self {
        self.chain(self.re.acos(), -1.0 / (1.0 - self.re * self.re).sqrt())
    }

    pub fn atan(self) -> Self {
        self.chain(self.re.atan(), 1.0 / (1.0 + self.re * self.re))
    }

    /// Two-argument arctangent of `self / x`.
    pub fn atan2(self, x: Dual) -> Self {
        let r2 = self.re * self.re + x.re * x.re;
        Self::new(self.re.atan2(x.re), (x.re * self.eps - self.re * x.eps) / r2)
    }

    pub fn sinh(self) -> Self {
        self.chain(self.re.sinh(), self.re.cosh())
    }

    pub fn cosh(self) -> Self {
        self.chain(self.re.cosh(), self.re.sinh())
    }

    pub fn tanh(self) -> Self {
        let t = self.re.tanh();
        self.chain(t, 1.0 - t * t)
    }

    pub fn asinh(self) -> Self {
        self.chain(self.re.asinh(), 1.0 / (self.re * self.re + 1.0).sqrt())
    }

    pub fn acosh(self) -> Self {
        self.chain(self.re.acosh(), 1.0 / (self.re * self.re - 1.0).sqrt())
    }

    pub fn atanh(self) -> Self {
        self.chain(self.re.atanh(), 1.0 / (1.0 - self.re * self.re))
    }
}

impl From<f64> for Dual {
    fn from(re: f64) -> Self {
        Dual::constant(re)
    }
}

impl fmt::Display for Dual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} + {}ε", self.re, self.eps)
    }
}

impl Neg for Dual {
    type Output = Dual;
    fn neg(self) -> Dual {
        Dual::new(-self.re, -self.eps)
    }
}

impl Add for Dual {
    type Output = Dual;
    fn add(self, rhs: Dual) -> Dual {
        Dual::new(self.re + rhs.re, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Dual;
    fn sub(self, rhs: Dual) -> Dual {
        Dual::new(self.re - rhs.re, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Dual;
    fn mul(self, rhs: Dual) -> Dual {
        Dual::new(self.re * rhs.re, self.eps * rhs.re + self.re * rhs.eps)
    }
}

impl Div for Dual {
    type Output = Dual;
    fn div(self, rhs: Dual) -> Dual {
        let q = self.re / rhs.re;
        Dual::new(q, (self.eps - q * rhs.eps) / rhs.re)
    }
}

macro_rules! scalar_ops {
    ($($trait:ident $method:ident),*) => {$(
        impl $trait<f64> for Dual {
            type Output = Dual;
            fn $method(self, rhs: f64) -> Dual {
                $trait::$method(self, Dual::constant(rhs))
            }
        }
        impl $trait<Dual> for f64 {
            type Output = Dual;
            fn $method(self, rhs: Dual) -> Dual {
                $trait::$method(Dual::constant(self), rhs)
            }
        }
    )*};
}

scalar_ops!(Add add, Sub sub, Mul mul, Div div);

macro_rules! assign_ops {
    ($($trait:ident $method:ident $op:tt),*) => {$(
        impl $trait for Dual {
            fn $method(&mut self, rhs: Dual) {
                *self = *self $op rhs;
            }
        }
        impl $trait<f64> for Dual {
            fn $method(&mut self, rhs: f64) {
                *self = *self $op rhs;
            }
        }
    )*};
}

assign_ops!(AddAssign add_assign +, SubAssign sub_assign -, MulAssign mul_assign *, DivAssign div_assign /);

impl Sum for Dual {
    fn sum<I: Iterator<Item = Dual>>(iter: I) -> Dual {
        iter.fold(Dual::constant(0.0), |a, b| a + b)
    }
}
