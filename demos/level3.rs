use std::time::Instant;

use aligned_vec::avec;
use private_level3::*;
use rand::prelude::*;
use reborrow::*;

fn time(label: &str, n: usize, flops: f64, mut f: impl FnMut()) {
    f();
    let iters = 5;
    let start = Instant::now();
    for _ in 0..iters {
        f();
    }
    let secs = start.elapsed().as_secs_f64() / iters as f64;
    println!("{label:>8} n={n:<5} {:>8.3} ms {:>8.2} GFLOP/s", secs * 1e3, flops / secs * 1e-9);
}

fn main() -> Result<()> {
    let rng = &mut StdRng::seed_from_u64(0);
    let cfg = Config::from_env();
    println!("{} threads, 1m: {}", cfg.threads(), cfg.is_1m_enabled());

    for n in [64, 256, 512, 1024] {
        let a = &mut *avec![0.0f64; n * n];
        let b = &mut *avec![0.0f64; n * n];
        let c = &mut *avec![0.0f64; n * n];
        rng.fill(a);
        rng.fill(b);
        for i in 0..n {
            // keeps the solve well conditioned
            a[i + n * i] += n as f64;
        }

        let a = MatRef::from_col_major(a, n, n)?;
        let b = MatRef::from_col_major(b, n, n)?;
        let mut c = MatMut::from_col_major_mut(c, n, n)?;
        let nf = n as f64;

        time("gemm", n, 2.0 * nf * nf * nf, || {
            gemm(&cfg, 1.0, a, b, 0.0, c.rb_mut()).unwrap();
        });
        time("syrk", n, nf * nf * nf, || {
            syrk(&cfg, 1.0, a, 0.0, c.rb_mut().with_uplo(Uplo::Lower)).unwrap();
        });
        time("trmm3", n, nf * nf * nf, || {
            trmm3(&cfg, Side::Left, 1.0, a.triangular(Uplo::Lower, Diag::NonUnit), b, 0.0, c.rb_mut()).unwrap();
        });
        time("trsm", n, nf * nf * nf, || {
            trsm(&cfg, Side::Left, 1.0, a.triangular(Uplo::Upper, Diag::NonUnit), c.rb_mut()).unwrap();
        });
    }

    let n = 512;
    let a = (0..n * n)
        .map(|_| c64::new(rng.random(), rng.random()))
        .collect::<Vec<_>>();
    let c = &mut *avec![c64::default(); n * n];
    let a = MatRef::from_col_major(&a, n, n)?;
    let mut c = MatMut::from_col_major_mut(c, n, n)?;
    let nf = n as f64;
    for enable in [false, true] {
        let cfg = cfg.clone().with_1m(enable);
        let label = if enable { "zgemm 1m" } else { "zgemm" };
        time(label, n, 8.0 * nf * nf * nf, || {
            gemm(&cfg, c64::new(1.0, 0.0), a, a.adjoint(), c64::default(), c.rb_mut()).unwrap();
        });
    }
    Ok(())
}
