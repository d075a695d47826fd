use crate::scalar::Dt;

/// Blocking parameter names.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BszId {
    Mc,
    Nc,
    Kc,
    Mr,
    Nr,
}

/// Algorithmic (`def`) and maximum (`max`) size of one blocking parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlkSz {
    pub def: usize,
    pub max: usize,
}

impl BlkSz {
    pub const fn new(def: usize, max: usize) -> Self {
        Self { def, max }
    }

    pub const fn fixed(size: usize) -> Self {
        Self {
            def: size,
            max: size,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Blocksizes {
    pub mc: BlkSz,
    pub nc: BlkSz,
    pub kc: BlkSz,
    pub mr: BlkSz,
    pub nr: BlkSz,
}

impl Blocksizes {
    pub const fn new(mc: usize, nc: usize, kc: usize, mr: usize, nr: usize) -> Self {
        Self {
            mc: BlkSz::new(mc, mc + mc / 4),
            nc: BlkSz::new(nc, nc + nc / 4),
            kc: BlkSz::new(kc, kc + kc / 4),
            mr: BlkSz::fixed(mr),
            nr: BlkSz::fixed(nr),
        }
    }

    /// Sizes with no slack between algorithmic and maximum values.
    pub const fn exact(mc: usize, nc: usize, kc: usize, mr: usize, nr: usize) -> Self {
        Self {
            mc: BlkSz::fixed(mc),
            nc: BlkSz::fixed(nc),
            kc: BlkSz::fixed(kc),
            mr: BlkSz::fixed(mr),
            nr: BlkSz::fixed(nr),
        }
    }

    #[inline]
    pub fn get(&self, id: BszId) -> BlkSz {
        match id {
            BszId::Mc => self.mc,
            BszId::Nc => self.nc,
            BszId::Kc => self.kc,
            BszId::Mr => self.mr,
            BszId::Nr => self.nr,
        }
    }

    /// Panics when the sizes cannot drive the blocked algorithm.
    ///
    /// Cache blocks must be whole multiples of the register blocks, otherwise
    /// a diagonal could end up crossing the short side of a micro-panel.
    pub fn validate(&self) {
        for (id, b) in [
            (BszId::Mc, self.mc),
            (BszId::Nc, self.nc),
            (BszId::Kc, self.kc),
            (BszId::Mr, self.mr),
            (BszId::Nr, self.nr),
        ] {
            assert!(b.def > 0, "block size {id:?} is zero");
            assert!(b.def <= b.max, "block size {id:?}: {} > max {}", b.def, b.max);
        }
        let mr = self.mr.def;
        let nr = self.nr.def;
        assert!(
            self.mc.def % mr == 0,
            "MC ({}) is not a multiple of MR ({mr})",
            self.mc.def
        );
        assert!(
            self.nc.def % nr == 0,
            "NC ({}) is not a multiple of NR ({nr})",
            self.nc.def
        );
        assert!(
            self.kc.def % mr == 0 && self.kc.def % nr == 0,
            "KC ({}) is not a multiple of MR ({mr}) and NR ({nr})",
            self.kc.def
        );
    }

    /// Sizes for a complex type computed through the real primitive ("1m").
    ///
    /// A complex `MR x NR` tile maps to a real `2MR x NR` tile and every
    /// complex depth step to two real ones.
    pub fn induced_1m(real: &Blocksizes) -> Blocksizes {
        let mr = real.mr.def;
        assert!(mr % 2 == 0, "1m requires an even real MR, got {mr}");
        let half = |b: BlkSz| BlkSz::new(b.def / 2, b.max / 2);
        Blocksizes {
            mc: real.mc,
            nc: real.nc,
            kc: half(real.kc),
            mr: half(real.mr),
            nr: real.nr,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arch {
    Generic,
    Avx2,
    Avx512,
}

impl Arch {
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            let cpuid = raw_cpuid::CpuId::new();
            let ext = cpuid.get_extended_feature_info();
            let fma = cpuid.get_feature_info().is_some_and(|f| f.has_fma());

            if ext.as_ref().is_some_and(|f| f.has_avx512f()) {
                return Arch::Avx512;
            }
            if fma && ext.as_ref().is_some_and(|f| f.has_avx2()) {
                return Arch::Avx2;
            }
        }
        Arch::Generic
    }
}

/// Block sizes for every datatype.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlocksizeTable {
    pub s: Blocksizes,
    pub d: Blocksizes,
    pub c: Blocksizes,
    pub z: Blocksizes,
}

impl BlocksizeTable {
    pub fn for_arch(arch: Arch) -> Self {
        match arch {
            Arch::Generic => Self {
                s: Blocksizes::new(128, 4096, 256, 8, 4),
                d: Blocksizes::new(96, 4096, 256, 4, 4),
                c: Blocksizes::new(64, 4096, 256, 4, 2),
                z: Blocksizes::new(64, 2048, 128, 2, 2),
            },
            Arch::Avx2 => Self {
                s: Blocksizes::new(144, 4080, 256, 16, 4),
                d: Blocksizes::new(72, 4080, 256, 8, 4),
                c: Blocksizes::new(72, 4080, 256, 8, 2),
                z: Blocksizes::new(36, 4080, 256, 4, 2),
            },
            Arch::Avx512 => Self {
                s: Blocksizes::new(480, 3072, 384, 32, 8),
                d: Blocksizes::new(240, 3072, 384, 16, 8),
                c: Blocksizes::new(240, 3072, 384, 16, 4),
                z: Blocksizes::new(120, 3072, 192, 8, 4),
            },
        }
    }

    pub fn detect() -> Self {
        let arch = Arch::detect();
        log::debug!("block sizes selected for {arch:?}");
        Self::for_arch(arch)
    }

    /// Same sizes for all datatypes.
    pub fn uniform(mc: usize, nc: usize, kc: usize, mr: usize, nr: usize) -> Self {
        let b = Blocksizes::exact(mc, nc, kc, mr, nr);
        Self {
            s: b,
            d: b,
            c: b,
            z: b,
        }
    }

    #[inline]
    pub fn for_dt(&self, dt: Dt) -> &Blocksizes {
        match dt {
            Dt::F32 => &self.s,
            Dt::F64 => &self.d,
            Dt::C32 => &self.c,
            Dt::C64 => &self.z,
        }
    }

    #[inline]
    pub fn lookup(&self, dt: Dt, id: BszId) -> BlkSz {
        self.for_dt(dt).get(id)
    }

    pub fn with(mut self, dt: Dt, sizes: Blocksizes) -> Self {
        match dt {
            Dt::F32 => self.s = sizes,
            Dt::F64 => self.d = sizes,
            Dt::C32 => self.c = sizes,
            Dt::C64 => self.z = sizes,
        }
        self
    }

    pub fn validate(&self) {
        self.s.validate();
        self.d.validate();
        self.c.validate();
        self.z.validate();
    }
}

impl Default for BlocksizeTable {
    fn default() -> Self {
        Self::detect()
    }
}
