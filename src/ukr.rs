//! Compute primitives operating on packed micro-panels.
//!
//! The packed `A` micro-panel stores `mr` elements per depth step, the packed
//! `B` micro-panel `nr` elements per depth step. Padding is zero, so every
//! kernel may compute the full `mr x nr` tile and only store `m x n` of it.

use crate::scalar::{c32, c64, Scalar};

/// Largest register tile (`mr * nr`) the portable kernels accept.
pub const MAX_TILE: usize = 1024;

#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct MicrokernelInfo<T> {
    /// stored rows of the tile
    pub m: usize,
    /// stored columns of the tile
    pub n: usize,
    pub depth: usize,
    pub mr: usize,
    pub nr: usize,
    pub alpha: T,
    pub beta: T,

    // dst
    pub ptr: *mut T,
    pub rs: isize,
    pub cs: isize,
}

/// `C <- beta * C + alpha * A * B` on one tile. `C` is not read when
/// `beta == 0`.
pub type GemmUkr<T> = unsafe fn(a: *const T, b: *const T, info: &MicrokernelInfo<T>);

#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct TrsmInfo<T> {
    /// depth of the rank update preceding the solve
    pub k: usize,
    pub m: usize,
    pub n: usize,
    pub mr: usize,
    pub nr: usize,

    /// `mr x mr` diagonal block, inverted diagonal
    pub a11: *const T,
    /// `mr x nr` right-hand side, solved in place
    pub b11: *mut T,

    // dst
    pub ptr: *mut T,
    pub rs: isize,
    pub cs: isize,
}

/// `B11 <- inv(A11) * (B11 - A1x * Bx1)`, written to the packed `B11` and to
/// the `m x n` destination.
pub type GemmTrsmUkr<T> = unsafe fn(a1x: *const T, bx1: *const T, info: &TrsmInfo<T>);

pub struct Kernels<T> {
    pub gemm: GemmUkr<T>,
    pub gemmtrsm_l: GemmTrsmUkr<T>,
    pub gemmtrsm_u: GemmTrsmUkr<T>,
    /// whether the gemm kernel stores row-major tiles faster
    pub prefers_rows: bool,
}

impl<T> Clone for Kernels<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Kernels<T> {}

impl<T> core::fmt::Debug for Kernels<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernels")
            .field("prefers_rows", &self.prefers_rows)
            .finish_non_exhaustive()
    }
}

impl<T: Scalar> Kernels<T> {
    pub fn reference() -> Self {
        Self {
            gemm: gemm_ref::<T>,
            gemmtrsm_l: gemmtrsm_l_ref::<T>,
            gemmtrsm_u: gemmtrsm_u_ref::<T>,
            prefers_rows: false,
        }
    }
}

/// Compute primitives for every datatype.
#[derive(Copy, Clone, Debug)]
pub struct KernelTable {
    pub s: Kernels<f32>,
    pub d: Kernels<f64>,
    pub c: Kernels<c32>,
    pub z: Kernels<c64>,
}

impl Default for KernelTable {
    fn default() -> Self {
        Self {
            s: Kernels::reference(),
            d: Kernels::reference(),
            c: Kernels::reference(),
            z: Kernels::reference(),
        }
    }
}

#[inline(always)]
unsafe fn store<T: Scalar>(info: &MicrokernelInfo<T>, acc: &[T], ld: usize) {
    let beta_zero = info.beta.is_zero();
    for j in 0..info.n {
        for i in 0..info.m {
            let dst = info
                .ptr
                .wrapping_offset(i as isize * info.rs + j as isize * info.cs);
            let v = info.alpha * acc[i + ld * j];
            unsafe {
                *dst = if beta_zero {
                    v
                } else {
                    info.beta.mul_add(*dst, v)
                };
            }
        }
    }
}

pub unsafe fn gemm_ref<T: Scalar>(a: *const T, b: *const T, info: &MicrokernelInfo<T>) {
    let (mr, nr) = (info.mr, info.nr);
    assert!(mr * nr <= MAX_TILE, "{mr}x{nr} tile exceeds the reference kernel");

    let mut acc = [T::zero(); MAX_TILE];
    unsafe {
        for p in 0..info.depth {
            let a = a.add(p * mr);
            let b = b.add(p * nr);
            for j in 0..nr {
                let bj = *b.add(j);
                for i in 0..mr {
                    acc[i + mr * j] = (*a.add(i)).mul_add(bj, acc[i + mr * j]);
                }
            }
        }
        store(info, &acc, mr);
    }
}

/// Loads `B11 - A1x * Bx1` into an `mr x nr` column-major accumulator.
#[inline(always)]
unsafe fn trsm_rhs<T: Scalar>(a1x: *const T, bx1: *const T, info: &TrsmInfo<T>, acc: &mut [T]) {
    let (mr, nr) = (info.mr, info.nr);
    unsafe {
        for j in 0..nr {
            for i in 0..mr {
                acc[i + mr * j] = *info.b11.add(i * nr + j);
            }
        }
        for p in 0..info.k {
            let a = a1x.add(p * mr);
            let b = bx1.add(p * nr);
            for j in 0..nr {
                let bj = *b.add(j);
                for i in 0..mr {
                    acc[i + mr * j] = (-*a.add(i)).mul_add(bj, acc[i + mr * j]);
                }
            }
        }
    }
}

#[inline(always)]
unsafe fn trsm_store<T: Scalar>(info: &TrsmInfo<T>, acc: &[T]) {
    let (mr, nr) = (info.mr, info.nr);
    unsafe {
        for j in 0..nr {
            for i in 0..mr {
                *info.b11.add(i * nr + j) = acc[i + mr * j];
            }
        }
        for j in 0..info.n {
            for i in 0..info.m {
                *info
                    .ptr
                    .wrapping_offset(i as isize * info.rs + j as isize * info.cs) = acc[i + mr * j];
            }
        }
    }
}

pub unsafe fn gemmtrsm_l_ref<T: Scalar>(a10: *const T, b01: *const T, info: &TrsmInfo<T>) {
    let (mr, nr) = (info.mr, info.nr);
    assert!(mr * nr <= MAX_TILE, "{mr}x{nr} tile exceeds the reference kernel");

    let mut acc = [T::zero(); MAX_TILE];
    unsafe {
        trsm_rhs(a10, b01, info, &mut acc);
        let a11 = info.a11;
        for i in 0..mr {
            for j in 0..nr {
                let mut x = acc[i + mr * j];
                for l in 0..i {
                    x = (-*a11.add(i + mr * l)).mul_add(acc[l + mr * j], x);
                }
                acc[i + mr * j] = x * *a11.add(i + mr * i);
            }
        }
        trsm_store(info, &acc);
    }
}

pub unsafe fn gemmtrsm_u_ref<T: Scalar>(a12: *const T, b21: *const T, info: &TrsmInfo<T>) {
    let (mr, nr) = (info.mr, info.nr);
    assert!(mr * nr <= MAX_TILE, "{mr}x{nr} tile exceeds the reference kernel");

    let mut acc = [T::zero(); MAX_TILE];
    unsafe {
        trsm_rhs(a12, b21, info, &mut acc);
        let a11 = info.a11;
        for i in (0..mr).rev() {
            for j in 0..nr {
                let mut x = acc[i + mr * j];
                for l in i + 1..mr {
                    x = (-*a11.add(i + mr * l)).mul_add(acc[l + mr * j], x);
                }
                acc[i + mr * j] = x * *a11.add(i + mr * i);
            }
        }
        trsm_store(info, &acc);
    }
}

/// Complex tile computed by the real primitive of the same precision on
/// `OneE`/`OneR` packed panels.
///
/// The real kernel sees a `2mr x nr` tile of depth `2k` and produces the
/// real and imaginary parts of each row on consecutive rows.
pub unsafe fn gemm_1m<T: Scalar>(
    real: GemmUkr<T::Real>,
    a: *const T,
    b: *const T,
    info: &MicrokernelInfo<T>,
) {
    let mr_r = 2 * info.mr;
    let nr = info.nr;
    assert!(mr_r * nr <= MAX_TILE, "{mr_r}x{nr} tile exceeds the 1m buffer");

    let mut tile = [<T::Real as Scalar>::zero(); MAX_TILE];
    let rinfo = MicrokernelInfo {
        m: 2 * info.m,
        n: info.n,
        depth: 2 * info.depth,
        mr: mr_r,
        nr,
        alpha: <T::Real as Scalar>::one(),
        beta: <T::Real as Scalar>::zero(),
        ptr: tile.as_mut_ptr(),
        rs: 1,
        cs: mr_r as isize,
    };
    unsafe {
        real(a as *const T::Real, b as *const T::Real, &rinfo);
    }

    let beta_zero = info.beta.is_zero();
    for j in 0..info.n {
        for i in 0..info.m {
            let v = T::from_parts(tile[2 * i + mr_r * j], tile[2 * i + 1 + mr_r * j]);
            let v = info.alpha * v;
            let dst = info
                .ptr
                .wrapping_offset(i as isize * info.rs + j as isize * info.cs);
            unsafe {
                *dst = if beta_zero {
                    v
                } else {
                    info.beta.mul_add(*dst, v)
                };
            }
        }
    }
}

/// Gemm primitive as dispatched by the macrokernels.
pub(crate) enum Ukr<T: Scalar> {
    Native(GemmUkr<T>),
    OneM(GemmUkr<T::Real>),
}

impl<T: Scalar> Clone for Ukr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Scalar> Copy for Ukr<T> {}

impl<T: Scalar> Ukr<T> {
    #[inline(always)]
    pub unsafe fn call(&self, a: *const T, b: *const T, info: &MicrokernelInfo<T>) {
        unsafe {
            match *self {
                Ukr::Native(f) => f(a, b, info),
                Ukr::OneM(f) => gemm_1m::<T>(f, a, b, info),
            }
        }
    }
}
