use core::fmt::Debug;
use core::ops::{Add, Div, Mul, Neg, Sub};

use crate::ukr::{KernelTable, Kernels};

#[allow(non_camel_case_types)]
pub type c32 = num_complex::Complex32;
#[allow(non_camel_case_types)]
pub type c64 = num_complex::Complex64;

/// Storage datatype tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Dt {
    F32,
    F64,
    C32,
    C64,
}

impl Dt {
    #[inline]
    pub fn is_complex(self) -> bool {
        matches!(self, Dt::C32 | Dt::C64)
    }

    /// Real datatype of the same precision.
    #[inline]
    pub fn real(self) -> Dt {
        match self {
            Dt::F32 | Dt::C32 => Dt::F32,
            Dt::F64 | Dt::C64 => Dt::F64,
        }
    }

    #[inline]
    pub fn size_of(self) -> usize {
        match self {
            Dt::F32 => size_of::<f32>(),
            Dt::F64 => size_of::<f64>(),
            Dt::C32 => size_of::<c32>(),
            Dt::C64 => size_of::<c64>(),
        }
    }
}

pub trait Scalar:
    Copy
    + Send
    + Sync
    + Debug
    + Default
    + PartialEq
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    type Real: Scalar<Real = Self::Real> + PartialOrd;

    const DT: Dt;
    const IS_COMPLEX: bool;

    fn zero() -> Self;
    fn one() -> Self;
    fn conj(self) -> Self;
    fn recip(self) -> Self;

    /// `self * rhs + acc`
    fn mul_add(self, rhs: Self, acc: Self) -> Self;

    fn re(self) -> Self::Real;
    fn im(self) -> Self::Real;
    fn from_parts(re: Self::Real, im: Self::Real) -> Self;

    /// Compute primitives for this datatype.
    fn kernels(table: &KernelTable) -> Kernels<Self>;

    #[inline(always)]
    fn conj_if(self, conj: bool) -> Self {
        if conj {
            self.conj()
        } else {
            self
        }
    }

    #[inline(always)]
    fn from_real(re: Self::Real) -> Self {
        Self::from_parts(re, Self::Real::zero())
    }

    /// `i * self`, zero for real types.
    #[inline(always)]
    fn mul_i(self) -> Self {
        Self::from_parts(-self.im(), self.re())
    }

    #[inline(always)]
    fn is_zero(self) -> bool {
        self == Self::zero()
    }
}

macro_rules! impl_real {
    ($ty: ty, $dt: expr, $field: ident) => {
        impl Scalar for $ty {
            type Real = $ty;

            const DT: Dt = $dt;
            const IS_COMPLEX: bool = false;

            #[inline(always)]
            fn zero() -> Self {
                0.0
            }
            #[inline(always)]
            fn one() -> Self {
                1.0
            }
            #[inline(always)]
            fn conj(self) -> Self {
                self
            }
            #[inline(always)]
            fn recip(self) -> Self {
                <$ty>::recip(self)
            }
            #[inline(always)]
            fn mul_add(self, rhs: Self, acc: Self) -> Self {
                <$ty>::mul_add(self, rhs, acc)
            }
            #[inline(always)]
            fn re(self) -> Self {
                self
            }
            #[inline(always)]
            fn im(self) -> Self {
                0.0
            }
            #[inline(always)]
            fn from_parts(re: Self, _: Self) -> Self {
                re
            }
            #[inline]
            fn kernels(table: &KernelTable) -> Kernels<Self> {
                table.$field
            }
        }
    };
}

macro_rules! impl_complex {
    ($ty: ty, $real: ty, $dt: expr, $field: ident) => {
        impl Scalar for $ty {
            type Real = $real;

            const DT: Dt = $dt;
            const IS_COMPLEX: bool = true;

            #[inline(always)]
            fn zero() -> Self {
                <$ty>::new(0.0, 0.0)
            }
            #[inline(always)]
            fn one() -> Self {
                <$ty>::new(1.0, 0.0)
            }
            #[inline(always)]
            fn conj(self) -> Self {
                <$ty>::new(self.re, -self.im)
            }
            #[inline(always)]
            fn recip(self) -> Self {
                self.inv()
            }
            #[inline(always)]
            fn mul_add(self, rhs: Self, acc: Self) -> Self {
                <$ty>::new(
                    <$real>::mul_add(
                        self.re,
                        rhs.re,
                        <$real>::mul_add(-self.im, rhs.im, acc.re),
                    ),
                    <$real>::mul_add(self.re, rhs.im, <$real>::mul_add(self.im, rhs.re, acc.im)),
                )
            }
            #[inline(always)]
            fn re(self) -> $real {
                self.re
            }
            #[inline(always)]
            fn im(self) -> $real {
                self.im
            }
            #[inline(always)]
            fn from_parts(re: $real, im: $real) -> Self {
                <$ty>::new(re, im)
            }
            #[inline]
            fn kernels(table: &KernelTable) -> Kernels<Self> {
                table.$field
            }
        }
    };
}

impl_real!(f32, Dt::F32, s);
impl_real!(f64, Dt::F64, d);
impl_complex!(c32, f32, Dt::C32, c);
impl_complex!(c64, f64, Dt::C64, z);
