//! Level-3 operations.
//!
//! Every operation normalizes its operands into a [`Problem`] in the
//! orientation the control trees expect, handles the trivial cases, and hands
//! the rest to the executor.

use crate::cntl::Family;
use crate::config::Config;
use crate::error::Result;
use crate::exec::{execute, Problem};
use crate::part::thread_range;
use crate::scalar::Scalar;
use crate::view::{MatMut, MatRef, Operand, Side, Struc, Uplo};

/// Outputs smaller than this are scaled on the calling thread.
const SCALE_PAR_THRESHOLD: usize = 64 * 64;

#[inline]
fn general<T>(op: Operand<T>) -> Operand<T> {
    Operand {
        struc: Struc::General,
        uplo: Uplo::Dense,
        ..op
    }
}

#[inline]
fn check_product<T>(a: &Operand<T>, b: &Operand<T>, c: &Operand<T>) {
    assert_eq!(a.nrows, c.nrows, "rows of A and C differ");
    assert_eq!(a.ncols, b.nrows, "inner dimensions differ");
    assert_eq!(b.ncols, c.ncols, "columns of B and C differ");
}

#[inline]
fn check_structure<T: Scalar>(a: &MatRef<'_, T>, struc: Struc) {
    assert_eq!(a.struc(), struc, "A must be tagged {struc:?}");
    assert_eq!(a.nrows(), a.ncols(), "{struc:?} A must be square");
}

/// `C = beta * C` over the referenced part of `c`. `beta == 0` writes exact
/// zeros.
fn scale<T: Scalar>(cfg: &Config, c: &Operand<T>, beta: T) {
    if beta == T::one() {
        return;
    }
    let n = c.ncols;
    let threads = if c.nrows * n < SCALE_PAR_THRESHOLD {
        1
    } else {
        Ord::min(cfg.threads(), n)
    };
    let beta_zero = beta.is_zero();

    let work = |w: usize| {
        for j in thread_range(n, 1, threads, w) {
            for i in 0..c.nrows {
                if !c.in_stored(j as isize - i as isize - c.diag_off) {
                    continue;
                }
                let p = c.ptr_at(i, j);
                unsafe { *p = if beta_zero { T::zero() } else { beta * *p } };
            }
        }
    };

    #[cfg(feature = "rayon")]
    {
        if threads > 1 {
            spindle::for_each_raw(threads, &work);
            return;
        }
    }
    (0..threads).for_each(work);
}

/// Zeroes the imaginary part of the diagonal of a Hermitian output.
fn real_diagonal<T: Scalar>(c: &Operand<T>) {
    if !T::IS_COMPLEX {
        return;
    }
    for i in 0..c.nrows {
        let j = i as isize + c.diag_off;
        if j < 0 || j >= c.ncols as isize {
            continue;
        }
        let p = c.ptr_at(i, j as usize);
        unsafe { *p = T::from_real((*p).re()) };
    }
}

fn run<T: Scalar>(cfg: &Config, family: Family, p: Problem<T>) -> Result<()> {
    let c = p.c;
    if c.is_empty() {
        return Ok(());
    }
    if p.alpha.is_zero() || p.a.ncols == 0 {
        log::debug!("{family:?} {}x{}: trivial, scaling C", c.nrows, c.ncols);
        scale(cfg, &c, p.beta);
        return Ok(());
    }

    let in_place = p.b.ptr == c.ptr || p.a.ptr == c.ptr;
    let mut p = p;
    if family != Family::Trsm && c.is_row_stored() && !cfg.kernels_for::<T>().prefers_rows {
        log::debug!("{family:?}: row-stored C, computing the transposed product");
        p = Problem {
            a: p.b.trans(),
            b: p.a.trans(),
            c: c.trans(),
            ..p
        };
    }
    execute(cfg, family, p, in_place)
}

/// `C = beta * C + alpha * A * B`.
///
/// Structure tags on the operands are ignored.
pub fn gemm<T: Scalar>(
    cfg: &Config,
    alpha: T,
    a: MatRef<'_, T>,
    b: MatRef<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
) -> Result<()> {
    let p = Problem {
        a: general(a.inner),
        b: general(b.inner),
        c: general(c.inner),
        alpha,
        beta,
    };
    check_product(&p.a, &p.b, &p.c);
    run(cfg, Family::Gemm, p)
}

/// [`gemm`] restricted to the triangle of `C` named by its [`Uplo`].
///
/// # Panics
/// if `c` does not name a triangle.
pub fn gemmt<T: Scalar>(
    cfg: &Config,
    alpha: T,
    a: MatRef<'_, T>,
    b: MatRef<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
) -> Result<()> {
    assert!(c.uplo() != Uplo::Dense, "gemmt needs an upper or lower C");
    let p = Problem {
        a: general(a.inner),
        b: general(b.inner),
        c: Operand {
            struc: Struc::General,
            ..c.inner
        },
        alpha,
        beta,
    };
    assert_eq!(p.c.nrows, p.c.ncols, "gemmt needs a square C");
    check_product(&p.a, &p.b, &p.c);
    run(cfg, Family::Gemmt, p)
}

fn structured_product<T: Scalar>(
    cfg: &Config,
    family: Family,
    side: Side,
    alpha: T,
    a: Operand<T>,
    b: Operand<T>,
    beta: T,
    c: Operand<T>,
) -> Result<()> {
    let (left, right) = match side {
        Side::Left => (a, general(b)),
        Side::Right => (general(b), a),
    };
    let p = Problem {
        a: left,
        b: right,
        c: general(c),
        alpha,
        beta,
    };
    check_product(&p.a, &p.b, &p.c);
    run(cfg, family, p)
}

/// `C = beta * C + alpha * A * B` (left) or `alpha * B * A` (right), with `A`
/// tagged Hermitian.
pub fn hemm<T: Scalar>(
    cfg: &Config,
    side: Side,
    alpha: T,
    a: MatRef<'_, T>,
    b: MatRef<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
) -> Result<()> {
    check_structure(&a, Struc::Hermitian);
    structured_product(cfg, Family::Gemm, side, alpha, a.inner, b.inner, beta, c.inner)
}

/// Like [`hemm`] with `A` tagged symmetric.
pub fn symm<T: Scalar>(
    cfg: &Config,
    side: Side,
    alpha: T,
    a: MatRef<'_, T>,
    b: MatRef<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
) -> Result<()> {
    check_structure(&a, Struc::Symmetric);
    structured_product(cfg, Family::Gemm, side, alpha, a.inner, b.inner, beta, c.inner)
}

/// `B = alpha * A * B` (left) or `alpha * B * A` (right) in place, with `A`
/// tagged triangular.
pub fn trmm<T: Scalar>(cfg: &Config, side: Side, alpha: T, a: MatRef<'_, T>, b: MatMut<'_, T>) -> Result<()> {
    check_structure(&a, Struc::Triangular);
    structured_product(cfg, Family::Trmm, side, alpha, a.inner, b.inner, T::zero(), b.inner)
}

/// `C = beta * C + alpha * A * B` (left) or `alpha * B * A` (right), with `A`
/// tagged triangular.
pub fn trmm3<T: Scalar>(
    cfg: &Config,
    side: Side,
    alpha: T,
    a: MatRef<'_, T>,
    b: MatRef<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
) -> Result<()> {
    check_structure(&a, Struc::Triangular);
    structured_product(cfg, Family::Trmm, side, alpha, a.inner, b.inner, beta, c.inner)
}

/// Solves `A * X = alpha * B` (left) or `X * A = alpha * B` (right), `X`
/// overwriting `B`, with `A` tagged triangular.
pub fn trsm<T: Scalar>(cfg: &Config, side: Side, alpha: T, a: MatRef<'_, T>, b: MatMut<'_, T>) -> Result<()> {
    check_structure(&a, Struc::Triangular);
    let (a, b) = match side {
        Side::Left => (a.inner, general(b.inner)),
        Side::Right => (a.inner.trans(), general(b.inner).trans()),
    };
    assert_eq!(a.ncols, b.nrows, "rows of B differ from the order of A");
    run(
        cfg,
        Family::Trsm,
        Problem {
            a,
            b,
            c: b,
            alpha,
            beta: T::zero(),
        },
    )
}

fn rank_k<T: Scalar>(cfg: &Config, alpha: T, a: Operand<T>, b: Operand<T>, beta: T, c: Operand<T>) -> Result<()> {
    assert!(c.uplo != Uplo::Dense, "rank-k updates need an upper or lower C");
    let p = Problem {
        a: general(a),
        b: general(b),
        c: Operand {
            struc: Struc::General,
            ..c
        },
        alpha,
        beta,
    };
    check_product(&p.a, &p.b, &p.c);
    run(cfg, Family::Gemmt, p)
}

/// `C = beta * C + alpha * A * A^H` over the triangle named by `c`, with a
/// real diagonal.
pub fn herk<T: Scalar>(cfg: &Config, alpha: T::Real, a: MatRef<'_, T>, beta: T::Real, c: MatMut<'_, T>) -> Result<()> {
    let c = c.inner;
    rank_k(cfg, T::from_real(alpha), a.inner, a.inner.trans().toggle_conj(), T::from_real(beta), c)?;
    real_diagonal(&c);
    Ok(())
}

/// `C = beta * C + alpha * A * A^T` over the triangle named by `c`.
pub fn syrk<T: Scalar>(cfg: &Config, alpha: T, a: MatRef<'_, T>, beta: T, c: MatMut<'_, T>) -> Result<()> {
    rank_k(cfg, alpha, a.inner, a.inner.trans(), beta, c.inner)
}

/// `C = beta * C + alpha * A * B^H + conj(alpha) * B * A^H` over the triangle
/// named by `c`, with a real diagonal.
pub fn her2k<T: Scalar>(
    cfg: &Config,
    alpha: T,
    a: MatRef<'_, T>,
    b: MatRef<'_, T>,
    beta: T::Real,
    c: MatMut<'_, T>,
) -> Result<()> {
    let (a, b, c) = (a.inner, b.inner, c.inner);
    rank_k(cfg, alpha, a, b.trans().toggle_conj(), T::from_real(beta), c)?;
    rank_k(cfg, alpha.conj(), b, a.trans().toggle_conj(), T::one(), c)?;
    real_diagonal(&c);
    Ok(())
}

/// `C = beta * C + alpha * A * B^T + alpha * B * A^T` over the triangle named
/// by `c`.
pub fn syr2k<T: Scalar>(
    cfg: &Config,
    alpha: T,
    a: MatRef<'_, T>,
    b: MatRef<'_, T>,
    beta: T,
    c: MatMut<'_, T>,
) -> Result<()> {
    let (a, b, c) = (a.inner, b.inner, c.inner);
    rank_k(cfg, alpha, a, b.trans(), beta, c)?;
    rank_k(cfg, alpha, b, a.trans(), T::one(), c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocksize::{BlocksizeTable, Blocksizes};
    use crate::config::Ways;
    use crate::error::Error;
    use crate::scalar::{c32, c64};
    use crate::view::Diag;
    use crate::workspace::Pool;
    use aligned_vec::avec;
    use rand::prelude::*;
    use std::sync::Arc;

    trait Sample: Scalar {
        const TOL: f64;
        fn sample(rng: &mut StdRng) -> Self;
        fn to_c64(self) -> c64;
    }

    macro_rules! real_sample {
        ($ty: ty, $tol: expr) => {
            impl Sample for $ty {
                const TOL: f64 = $tol;
                fn sample(rng: &mut StdRng) -> Self {
                    rng.random_range(-4i32..=4) as $ty
                }
                fn to_c64(self) -> c64 {
                    c64::new(self as f64, 0.0)
                }
            }
        };
    }

    macro_rules! complex_sample {
        ($ty: ty, $re: ty, $tol: expr) => {
            impl Sample for $ty {
                const TOL: f64 = $tol;
                fn sample(rng: &mut StdRng) -> Self {
                    <$ty>::new(rng.random_range(-4i32..=4) as $re, rng.random_range(-4i32..=4) as $re)
                }
                fn to_c64(self) -> c64 {
                    c64::new(self.re as f64, self.im as f64)
                }
            }
        };
    }

    real_sample!(f32, 1e-3);
    real_sample!(f64, 1e-9);
    complex_sample!(c32, f32, 1e-3);
    complex_sample!(c64, f64, 1e-9);

    fn random<T: Sample>(rng: &mut StdRng, len: usize) -> Vec<T> {
        (0..len).map(|_| T::sample(rng)).collect()
    }

    fn assert_close<T: Sample>(what: &str, got: &[T], want: &[T]) {
        assert_eq!(got.len(), want.len());
        for (idx, (&g, &w)) in got.iter().zip(want).enumerate() {
            let (g, w) = (g.to_c64(), w.to_c64());
            let err = (g - w).norm();
            if err > T::TOL * (1.0 + w.norm()) {
                dbg!(what, idx, g, w, err);
                panic!("{what}: mismatch at {idx}");
            }
        }
    }

    fn in_triangle(uplo: Uplo, i: usize, j: usize) -> bool {
        match uplo {
            Uplo::Lower => i >= j,
            Uplo::Upper => i <= j,
            Uplo::Dense => true,
        }
    }

    /// Column-major `C = beta * C + alpha * A * B` over the `uplo` triangle,
    /// reading `A` and `B` through their structure tags.
    fn naive<T: Scalar>(alpha: T, a: MatRef<'_, T>, b: MatRef<'_, T>, beta: T, c: &mut [T], uplo: Uplo) {
        let (m, n, k) = (a.nrows(), b.ncols(), a.ncols());
        for j in 0..n {
            for i in 0..m {
                if !in_triangle(uplo, i, j) {
                    continue;
                }
                let mut acc = T::zero();
                for p in 0..k {
                    acc = a.get(i, p).mul_add(b.get(p, j), acc);
                }
                let dst = &mut c[i + m * j];
                *dst = if beta.is_zero() {
                    alpha * acc
                } else {
                    beta.mul_add(*dst, alpha * acc)
                };
            }
        }
    }

    fn configs() -> Vec<Config> {
        let table = BlocksizeTable::uniform(8, 8, 8, 4, 2);
        let base = Config::new().with_blocksizes(table);
        // several M blocks per K block
        let tall_k = Config::new().with_blocksizes(BlocksizeTable::uniform(4, 8, 16, 4, 2));
        // edge blocks may grow past the nominal size
        let slack = Blocksizes::new(8, 12, 8, 4, 2);
        let slack = Config::new().with_blocksizes(BlocksizeTable {
            s: slack,
            d: slack,
            c: slack,
            z: slack,
        });
        vec![
            base.clone().with_threads(1),
            base.clone().with_threads(3),
            base.clone().with_threads(4).with_1m(true),
            base.with_ways(Ways {
                jc: 2,
                ic: 2,
                jr: 1,
                ir: 2,
                ..Ways::SERIAL
            })
            .with_threads(8),
            tall_k.clone().with_threads(2),
            tall_k.with_threads(3).with_1m(true),
            slack.clone().with_threads(1),
            slack.with_threads(4).with_1m(true),
            // detected block sizes
            Config::new().with_threads(2),
        ]
    }

    #[test]
    fn gemm_4x4_blocks_of_two() {
        let rng = &mut StdRng::seed_from_u64(0);
        let n = 4;
        let a = random::<f64>(rng, n * n);
        let b = random::<f64>(rng, n * n);
        let c = &mut *avec![0.0f64; n * n];
        for x in c.iter_mut() {
            *x = f64::sample(rng);
        }
        let mut target = c.to_vec();

        let cfg = Config::new()
            .with_threads(1)
            .with_blocksizes(BlocksizeTable::uniform(2, 2, 2, 2, 2));
        let a = MatRef::from_col_major(&a, n, n).unwrap();
        let b = MatRef::from_col_major(&b, n, n).unwrap();
        naive(2.0, a, b, 3.0, &mut target, Uplo::Dense);
        gemm(&cfg, 2.0, a, b, 3.0, MatMut::from_col_major_mut(c, n, n).unwrap()).unwrap();

        if *c != *target {
            dbg!(&*c, &target);
            panic!();
        }
    }

    #[test]
    fn trsm_3x3_unit_lower() {
        let n = 3;
        let nrhs = 2;
        // the diagonal and the upper part hold garbage the solve must not read
        #[rustfmt::skip]
        let a = [
            99.0, 2.0, -1.0,
            99.0, 99.0, 3.0,
            99.0, 99.0, 99.0,
        ];
        let b = [1.0, 4.0, -2.0, 0.5, -1.0, 2.0];
        let x = &mut *avec![0.0f64; n * nrhs];
        x.copy_from_slice(&b);

        let cfg = Config::new()
            .with_threads(1)
            .with_blocksizes(BlocksizeTable::uniform(1, 1, 1, 1, 1));
        let a_view = MatRef::from_col_major(&a, n, n)
            .unwrap()
            .triangular(Uplo::Lower, Diag::Unit);
        trsm(&cfg, Side::Left, 1.0, a_view, MatMut::from_col_major_mut(x, n, nrhs).unwrap()).unwrap();

        // back-substitution
        let mut target = b;
        for j in 0..nrhs {
            for i in 0..n {
                for l in 0..i {
                    target[i + n * j] -= a[i + n * l] * target[l + n * j];
                }
            }
        }
        assert_close("trsm", x, &target);
    }

    #[test]
    fn zero_alpha_writes_zeros() {
        let n = 5;
        let a = vec![f64::NAN; n * n];
        let c = &mut *avec![f64::NAN; n * n];
        let a = MatRef::from_col_major(&a, n, n).unwrap();
        let cfg = Config::new().with_threads(1);
        gemm(&cfg, 0.0, a, a, 0.0, MatMut::from_col_major_mut(c, n, n).unwrap()).unwrap();
        assert!(c.iter().all(|&x| x == 0.0));

        // beta == 0 never reads C, even through a partial triangle
        let rng = &mut StdRng::seed_from_u64(1);
        let a = random::<f64>(rng, n * n);
        let a = MatRef::from_col_major(&a, n, n).unwrap();
        let c = &mut *avec![f64::NAN; n * n];
        let cfg = cfg.with_blocksizes(BlocksizeTable::uniform(2, 2, 2, 2, 2));
        syrk(&cfg, 1.0, a, 0.0, MatMut::from_col_major_mut(c, n, n).unwrap().with_uplo(Uplo::Lower)).unwrap();
        for j in 0..n {
            for i in 0..n {
                assert_eq!(c[i + n * j].is_nan(), i < j, "({i}, {j})");
            }
        }
    }

    #[test]
    fn thread_count_invariance() {
        let rng = &mut StdRng::seed_from_u64(2);
        let (m, n, k) = (37, 29, 41);
        let a = (0..m * k).map(|_| rng.random::<f64>()).collect::<Vec<_>>();
        let b = (0..k * n).map(|_| rng.random::<f64>()).collect::<Vec<_>>();
        let c0 = (0..m * n).map(|_| rng.random::<f64>()).collect::<Vec<_>>();
        let a = MatRef::from_col_major(&a, m, k).unwrap();
        let b = MatRef::from_col_major(&b, k, n).unwrap();

        let table = BlocksizeTable::uniform(8, 8, 16, 4, 4);
        let mut results = vec![];
        for threads in [1, 4] {
            let cfg = Config::new().with_blocksizes(table).with_threads(threads);
            let c = &mut *avec![0.0f64; m * n];
            c.copy_from_slice(&c0);
            gemm(&cfg, 0.5, a, b, 2.0, MatMut::from_col_major_mut(c, m, n).unwrap()).unwrap();
            results.push(c.to_vec());
        }
        assert!(results[0] == results[1]);
    }

    #[test]
    fn workspace_exhaustion() {
        let n = 16;
        let a = vec![1.0f32; n * n];
        let c = &mut *avec![0.0f32; n * n];
        let a = MatRef::from_col_major(&a, n, n).unwrap();
        let pool = Arc::new(Pool::with_capacity(64));
        let cfg = Config::new()
            .with_threads(1)
            .with_blocksizes(BlocksizeTable::uniform(8, 8, 8, 4, 4))
            .with_pool(pool.clone());

        let err = gemm(&cfg, 1.0, a, a, 0.0, MatMut::from_col_major_mut(c, n, n).unwrap()).unwrap_err();
        assert!(matches!(err, Error::WorkspaceExhausted { available: 64, .. }), "{err}");
        assert_eq!(pool.in_use(), 0);
        // untouched on failure
        assert!(c.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn row_stored_output() {
        let rng = &mut StdRng::seed_from_u64(3);
        let (m, n, k) = (9, 6, 7);
        let a = random::<c64>(rng, m * k);
        let b = random::<c64>(rng, k * n);
        let c0 = random::<c64>(rng, m * n);
        let a = MatRef::from_col_major(&a, m, k).unwrap();
        let b = MatRef::from_col_major(&b, k, n).unwrap();
        let alpha = c64::new(1.0, -2.0);
        let beta = c64::new(0.5, 0.0);

        for cfg in configs() {
            let c = &mut *avec![c64::default(); m * n];
            c.copy_from_slice(&c0);
            gemm(&cfg, alpha, a, b, beta, MatMut::try_from_mut_slice(c, m, n, n, 1).unwrap()).unwrap();

            let mut target = vec![c64::default(); m * n];
            for j in 0..n {
                for i in 0..m {
                    target[i + m * j] = c0[i * n + j];
                }
            }
            naive(alpha, a, b, beta, &mut target, Uplo::Dense);
            let got = (0..m * n).map(|idx| c[(idx % m) * n + idx / m]).collect::<Vec<_>>();
            assert_close("row-stored gemm", &got, &target);
        }
    }

    fn check_operations<T: Sample>(seed: u64, (m, n, k): (usize, usize, usize)) {
        let rng = &mut StdRng::seed_from_u64(seed);
        let alpha = T::sample(rng);
        let alpha = if alpha.is_zero() { T::one() } else { alpha };
        let beta = T::sample(rng);

        for cfg in configs() {
            let cfg = &cfg;

            // gemm
            {
                let a = random::<T>(rng, m * k);
                let b = random::<T>(rng, k * n);
                let c0 = random::<T>(rng, m * n);
                let a = MatRef::from_col_major(&a, m, k).unwrap();
                let b = MatRef::from_col_major(&b, k, n).unwrap();
                let c = &mut *avec![T::zero(); m * n];
                c.copy_from_slice(&c0);
                gemm(cfg, alpha, a, b, beta, MatMut::from_col_major_mut(c, m, n).unwrap()).unwrap();
                let mut target = c0.clone();
                naive(alpha, a, b, beta, &mut target, Uplo::Dense);
                assert_close("gemm", c, &target);
            }

            // gemmt, syrk, herk, syr2k, her2k: the other triangle stays put
            for uplo in [Uplo::Lower, Uplo::Upper] {
                let a = random::<T>(rng, m * k);
                let b = random::<T>(rng, k * m);
                let c0 = random::<T>(rng, m * m);
                let a = MatRef::from_col_major(&a, m, k).unwrap();
                let b = MatRef::from_col_major(&b, k, m).unwrap();

                let c = &mut *avec![T::zero(); m * m];
                c.copy_from_slice(&c0);
                let cp = c.as_mut_ptr();
                let cv = || unsafe { MatMut::from_raw_parts_mut(cp, m, m, 1, m as isize) };
                gemmt(cfg, alpha, a, b, beta, cv().with_uplo(uplo)).unwrap();
                let mut target = c0.clone();
                naive(alpha, a, b, beta, &mut target, uplo);
                assert_close("gemmt", c, &target);

                c.copy_from_slice(&c0);
                syrk(cfg, alpha, a, beta, cv().with_uplo(uplo)).unwrap();
                let mut target = c0.clone();
                naive(alpha, a, a.trans(), beta, &mut target, uplo);
                assert_close("syrk", c, &target);

                let a2 = random::<T>(rng, m * k);
                let a2 = MatRef::from_col_major(&a2, m, k).unwrap();
                c.copy_from_slice(&c0);
                syr2k(cfg, alpha, a, a2, beta, cv().with_uplo(uplo)).unwrap();
                let mut target = c0.clone();
                naive(alpha, a, a2.trans(), beta, &mut target, uplo);
                naive(alpha, a2, a.trans(), T::one(), &mut target, uplo);
                assert_close("syr2k", c, &target);

                let (ra, rb) = (alpha.re(), beta.re());
                c.copy_from_slice(&c0);
                herk(cfg, ra, a, rb, cv().with_uplo(uplo)).unwrap();
                let mut target = c0.clone();
                naive(T::from_real(ra), a, a.adjoint(), T::from_real(rb), &mut target, uplo);
                for i in 0..m {
                    target[i + m * i] = T::from_real(target[i + m * i].re());
                }
                assert_close("herk", c, &target);

                c.copy_from_slice(&c0);
                her2k(cfg, alpha, a, a2, rb, cv().with_uplo(uplo)).unwrap();
                let mut target = c0.clone();
                naive(alpha, a, a2.adjoint(), T::from_real(rb), &mut target, uplo);
                naive(alpha.conj(), a2, a.adjoint(), T::one(), &mut target, uplo);
                for i in 0..m {
                    target[i + m * i] = T::from_real(target[i + m * i].re());
                }
                assert_close("her2k", c, &target);
                for i in 0..m {
                    assert!(c[i + m * i].im() == <T::Real as Scalar>::zero());
                }
            }

            for side in [Side::Left, Side::Right] {
                // dimension of the structured operand
                let s = match side {
                    Side::Left => m,
                    Side::Right => n,
                };
                let product = |a: MatRef<'_, T>, b: MatRef<'_, T>, beta: T, c: &mut [T]| match side {
                    Side::Left => naive(alpha, a, b, beta, c, Uplo::Dense),
                    Side::Right => naive(alpha, b, a, beta, c, Uplo::Dense),
                };
                let sa = random::<T>(rng, s * s);
                let b = random::<T>(rng, m * n);
                let c0 = random::<T>(rng, m * n);
                let b = MatRef::from_col_major(&b, m, n).unwrap();
                let c = &mut *avec![T::zero(); m * n];

                for uplo in [Uplo::Lower, Uplo::Upper] {
                    let full = MatRef::from_col_major(&sa, s, s).unwrap();

                    // hemm, symm
                    for (herm, a) in [(true, full.hermitian(uplo)), (false, full.symmetric(uplo))] {
                        c.copy_from_slice(&c0);
                        let cv = MatMut::from_col_major_mut(c, m, n).unwrap();
                        if herm {
                            hemm(cfg, side, alpha, a, b, beta, cv).unwrap();
                        } else {
                            symm(cfg, side, alpha, a, b, beta, cv).unwrap();
                        }
                        let mut target = c0.clone();
                        product(a, b, beta, &mut target);
                        assert_close(if herm { "hemm" } else { "symm" }, c, &target);
                    }

                    for diag in [Diag::NonUnit, Diag::Unit] {
                        let a = full.triangular(uplo, diag);

                        c.copy_from_slice(&c0);
                        trmm3(cfg, side, alpha, a, b, beta, MatMut::from_col_major_mut(c, m, n).unwrap()).unwrap();
                        let mut target = c0.clone();
                        product(a, b, beta, &mut target);
                        assert_close("trmm3", c, &target);

                        c.copy_from_slice(&c0);
                        trmm(cfg, side, alpha, a, MatMut::from_col_major_mut(c, m, n).unwrap()).unwrap();
                        let b0 = MatRef::from_col_major(&c0, m, n).unwrap();
                        let mut target = c0.clone();
                        product(a, b0, T::zero(), &mut target);
                        assert_close("trmm", c, &target);
                    }

                    // well-conditioned triangle for the solve
                    let mut tri = random::<T>(rng, s * s);
                    for i in 0..s {
                        tri[i + s * i] = T::from_real(solve_diag::<T>(i));
                    }
                    let a = MatRef::from_col_major(&tri, s, s)
                        .unwrap()
                        .triangular(uplo, Diag::NonUnit);
                    c.copy_from_slice(&c0);
                    trsm(cfg, side, alpha, a, MatMut::from_col_major_mut(c, m, n).unwrap()).unwrap();
                    // A * X must give alpha * B back
                    let x = MatRef::from_col_major(c, m, n).unwrap();
                    let mut residual = vec![T::zero(); m * n];
                    match side {
                        Side::Left => naive(T::one(), a, x, T::zero(), &mut residual, Uplo::Dense),
                        Side::Right => naive(T::one(), x, a, T::zero(), &mut residual, Uplo::Dense),
                    }
                    let target = c0.iter().map(|&v| alpha * v).collect::<Vec<_>>();
                    assert_close("trsm", &residual, &target);
                }
            }
        }
    }

    /// Diagonal entries large enough for a stable solve.
    fn solve_diag<T: Scalar>(i: usize) -> T::Real {
        let mut x = <T::Real as Scalar>::one();
        for _ in 0..(8 + i % 3) {
            x = x + <T::Real as Scalar>::one();
        }
        x
    }

    #[test]
    fn operations_f32() {
        check_operations::<f32>(10, (11, 9, 10));
    }

    #[test]
    fn operations_f64() {
        check_operations::<f64>(11, (11, 9, 10));
    }

    #[test]
    fn operations_c32() {
        check_operations::<c32>(12, (11, 9, 10));
    }

    #[test]
    fn operations_c64() {
        check_operations::<c64>(13, (11, 9, 10));
    }

    #[test]
    fn operations_odd_shapes() {
        for shape in [(1, 1, 1), (37, 29, 41)] {
            check_operations::<f64>(14, shape);
            check_operations::<c32>(15, shape);
        }
    }

    #[test]
    #[should_panic]
    fn mismatched_inner_dimensions() {
        let a = [1.0f64; 6];
        let b = [1.0f64; 4];
        let c = &mut [0.0f64; 4];
        let cfg = Config::new().with_threads(1);
        gemm(
            &cfg,
            1.0,
            MatRef::from_col_major(&a, 2, 3).unwrap(),
            MatRef::from_col_major(&b, 2, 2).unwrap(),
            0.0,
            MatMut::from_col_major_mut(c, 2, 2).unwrap(),
        )
        .unwrap();
    }

    #[test]
    #[should_panic]
    fn hemm_needs_a_hermitian_operand() {
        let a = [c64::new(1.0, 0.0); 4];
        let c = &mut [c64::default(); 4];
        let a = MatRef::from_col_major(&a, 2, 2).unwrap();
        let cfg = Config::new().with_threads(1);
        hemm(&cfg, Side::Left, c64::new(1.0, 0.0), a, a, c64::default(), MatMut::from_col_major_mut(c, 2, 2).unwrap())
            .unwrap();
    }

    #[test]
    fn one_m_matches_native() {
        let rng = &mut StdRng::seed_from_u64(4);
        let (m, n, k) = (13, 10, 17);
        let a = random::<c64>(rng, m * k);
        let b = random::<c64>(rng, k * n);
        let c0 = random::<c64>(rng, m * n);
        let a = MatRef::from_col_major(&a, m, k).unwrap();
        let b = MatRef::from_col_major(&b, k, n).unwrap();
        let alpha = c64::new(0.5, 1.5);
        let beta = c64::new(-1.0, 2.0);

        let base = Config::new()
            .with_threads(2)
            .with_blocksizes(BlocksizeTable::uniform(8, 8, 8, 4, 4));
        let mut out = vec![];
        for cfg in [base.clone(), base.with_1m(true)] {
            let c = &mut *avec![c64::default(); m * n];
            c.copy_from_slice(&c0);
            gemm(&cfg, alpha, a, b, beta, MatMut::from_col_major_mut(c, m, n).unwrap()).unwrap();
            out.push(c.to_vec());
        }
        // integer-valued inputs: both paths are exact
        assert!(out[0] == out[1]);
    }
}
