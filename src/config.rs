use std::sync::{Arc, OnceLock};

use crate::blocksize::{BlocksizeTable, Blocksizes};
use crate::scalar::Scalar;
use crate::ukr::{KernelTable, Kernels};
use crate::workspace::Pool;

/// Number of thread groups along each loop of the blocked nest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ways {
    pub jc: usize,
    pub pc: usize,
    pub ic: usize,
    pub jr: usize,
    pub ir: usize,
}

impl Ways {
    pub const SERIAL: Ways = Ways {
        jc: 1,
        pc: 1,
        ic: 1,
        jr: 1,
        ir: 1,
    };

    #[inline]
    pub fn product(&self) -> usize {
        self.jc * self.pc * self.ic * self.jr * self.ir
    }
}

impl Default for Ways {
    fn default() -> Self {
        Self::SERIAL
    }
}

/// Immutable runtime settings threaded through every operation.
#[derive(Clone, Debug)]
pub struct Config {
    threads: usize,
    ways: Option<Ways>,
    enable_1m: bool,
    blocksizes: BlocksizeTable,
    kernels: KernelTable,
    pool: Option<Arc<Pool>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Detected block sizes, reference kernels, one thread per logical CPU.
    pub fn new() -> Self {
        Self {
            threads: num_cpus::get(),
            ways: None,
            enable_1m: false,
            blocksizes: BlocksizeTable::detect(),
            kernels: KernelTable::default(),
            pool: None,
        }
    }

    /// Process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static Config {
        static CONFIG: OnceLock<Config> = OnceLock::new();
        CONFIG.get_or_init(Config::from_env)
    }

    /// [`Config::new`] overridden by `LEVEL3_NUM_THREADS`, the per-loop
    /// `LEVEL3_{JC,PC,IC,JR,IR}_NT` and `LEVEL3_ENABLE_1M`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let count = |name: &str| -> Option<usize> {
            let value = lookup(name)?;
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    log::warn!("ignoring {name}={value:?}, expected a positive integer");
                    None
                }
            }
        };

        let mut cfg = Self::new();
        if let Some(n) = count("LEVEL3_NUM_THREADS") {
            cfg.threads = n;
        }

        let loops = [
            count("LEVEL3_JC_NT"),
            count("LEVEL3_PC_NT"),
            count("LEVEL3_IC_NT"),
            count("LEVEL3_JR_NT"),
            count("LEVEL3_IR_NT"),
        ];
        if loops.iter().any(Option::is_some) {
            let [jc, pc, ic, jr, ir] = loops.map(|w| w.unwrap_or(1));
            let ways = Ways { jc, pc, ic, jr, ir };
            if lookup("LEVEL3_NUM_THREADS").is_none() {
                cfg.threads = ways.product();
            }
            cfg.ways = Some(ways);
        }

        if let Some(v) = lookup("LEVEL3_ENABLE_1M") {
            cfg.enable_1m = matches!(v.trim(), "1" | "true" | "TRUE" | "yes");
        }
        cfg
    }

    pub fn with_threads(self, threads: usize) -> Self {
        Self {
            threads: Ord::max(threads, 1),
            ..self
        }
    }

    /// Explicit thread groups per loop instead of the automatic split.
    pub fn with_ways(self, ways: Ways) -> Self {
        Self {
            ways: Some(ways),
            ..self
        }
    }

    /// Compute complex gemm-family operations through the real kernels.
    pub fn with_1m(self, enable: bool) -> Self {
        Self {
            enable_1m: enable,
            ..self
        }
    }

    /// # Panics
    /// if the table cannot drive the blocked algorithm.
    pub fn with_blocksizes(self, blocksizes: BlocksizeTable) -> Self {
        blocksizes.validate();
        Self { blocksizes, ..self }
    }

    pub fn with_kernels(self, kernels: KernelTable) -> Self {
        Self { kernels, ..self }
    }

    /// Draw packing buffers from `pool` instead of the process-wide one.
    pub fn with_pool(self, pool: Arc<Pool>) -> Self {
        Self {
            pool: Some(pool),
            ..self
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn ways(&self) -> Option<Ways> {
        self.ways
    }

    pub fn is_1m_enabled(&self) -> bool {
        self.enable_1m
    }

    pub fn blocksizes(&self) -> &BlocksizeTable {
        &self.blocksizes
    }

    pub fn kernels(&self) -> &KernelTable {
        &self.kernels
    }

    pub fn pool(&self) -> &Pool {
        match &self.pool {
            Some(pool) => pool,
            None => Pool::global(),
        }
    }

    /// Whether complex `T` runs gemm-family operations through the 1m method.
    pub(crate) fn use_1m<T: Scalar>(&self) -> bool {
        T::IS_COMPLEX && self.enable_1m
    }

    /// Block sizes for `T`, induced from the real row under the 1m method.
    pub(crate) fn blocksizes_for<T: Scalar>(&self, induced: bool) -> Blocksizes {
        if induced {
            Blocksizes::induced_1m(self.blocksizes.for_dt(T::DT.real()))
        } else {
            *self.blocksizes.for_dt(T::DT)
        }
    }

    pub(crate) fn kernels_for<T: Scalar>(&self) -> Kernels<T> {
        T::kernels(&self.kernels)
    }
}
