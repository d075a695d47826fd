//! Packing of operand blocks into contiguous, zero-padded micro-panels.
//!
//! A micro-panel is `panel_dim_max` elements wide (the register block) and
//! `panel_len_max` columns long. Packed column `j` starts at `j * ldp`, with
//! `ldp` depending on the [`Schema`].

use crate::scalar::Scalar;
use crate::view::{Diag, Operand, Struc, Uplo};

/// Layout of the packed elements.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Schema {
    Native,
    /// Complex A-side panel for a real compute primitive: every packed
    /// column holds `x` followed by `i * x`.
    OneE,
    /// Complex B-side panel for a real compute primitive: every packed
    /// column holds the real parts followed by the imaginary parts.
    OneR,
}

impl Schema {
    /// Elements of the storage type between consecutive packed columns.
    #[inline]
    pub fn ld(self, panel_dim_max: usize) -> usize {
        match self {
            Schema::OneE => 2 * panel_dim_max,
            Schema::Native | Schema::OneR => panel_dim_max,
        }
    }
}

/// Shape and interpretation of one micro-panel.
#[derive(Copy, Clone, Debug)]
pub struct MicroPanel<T> {
    pub struc: Struc,
    pub uplo: Uplo,
    pub diag: Diag,
    pub conj: bool,
    pub schema: Schema,
    pub invdiag: bool,
    pub panel_dim: usize,
    pub panel_len: usize,
    pub panel_dim_max: usize,
    pub panel_len_max: usize,
    /// `panel_dim_off - panel_len_off`: column of the diagonal on the first row.
    pub diagoff: isize,
    pub kappa: T,
}

#[inline(always)]
unsafe fn put<T: Scalar>(schema: Schema, p: *mut T, ldp: usize, dim_max: usize, i: usize, j: usize, v: T) {
    unsafe {
        match schema {
            Schema::Native => *p.add(i + j * ldp) = v,
            Schema::OneE => {
                *p.add(i + j * ldp) = v;
                *p.add(dim_max + i + j * ldp) = v.mul_i();
            }
            Schema::OneR => {
                let col = (p as *mut T::Real).add(2 * j * ldp);
                *col.add(i) = v.re();
                *col.add(dim_max + i) = v.im();
            }
        }
    }
}

#[inline(always)]
unsafe fn zero_cols<T>(p: *mut T, ldp: usize, len: usize) {
    unsafe { core::ptr::write_bytes(p, 0, ldp * len) };
}

/// Moves the source origin so that element `(i, j)` reads the element
/// mirrored across a diagonal at column `diagoff` of row 0.
#[inline(always)]
fn reflect_to_stored_part<T>(diagoff: isize, c: &mut *const T, incc: &mut isize, ldc: &mut isize) {
    *c = c.wrapping_offset(diagoff * (*ldc - *incc));
    core::mem::swap(incc, ldc);
}

/// Dense copy of a `dim x len` region, zero padded to `dim_max x len_max`.
#[inline(never)]
unsafe fn pack_cxk<T: Scalar>(
    conj: bool,
    schema: Schema,
    dim: usize,
    dim_max: usize,
    len: usize,
    len_max: usize,
    kappa: T,
    c: *const T,
    incc: isize,
    ldc: isize,
    p: *mut T,
) {
    let ldp = schema.ld(dim_max);
    unsafe {
        zero_cols(p, ldp, len_max);
        for j in 0..len {
            let c = c.wrapping_offset(j as isize * ldc);
            for i in 0..dim {
                let v = kappa * (*c.wrapping_offset(i as isize * incc)).conj_if(conj);
                put(schema, p, ldp, dim_max, i, j, v);
            }
        }
    }
}

/// Diagonal block: element `(i, j)` sits on the diagonal when `i == j`.
#[inline(never)]
unsafe fn pack_cxc_diag<T: Scalar>(
    mp: &MicroPanel<T>,
    len_max: usize,
    c: *const T,
    incc: isize,
    ldc: isize,
    p: *mut T,
) {
    let schema = mp.schema;
    let dim = mp.panel_dim;
    let dim_max = mp.panel_dim_max;
    let ldp = schema.ld(dim_max);
    let herm = mp.struc == Struc::Hermitian;
    let tri = mp.struc == Struc::Triangular;

    let at = |i: usize, j: usize| c.wrapping_offset(i as isize * incc + j as isize * ldc);

    unsafe {
        zero_cols(p, ldp, len_max);
        for j in 0..Ord::min(dim, len_max) {
            for i in 0..dim {
                let stored = match mp.uplo {
                    Uplo::Upper => j >= i,
                    Uplo::Lower => j <= i,
                    Uplo::Dense => true,
                };

                let v = if i == j {
                    let x = (*at(i, j)).conj_if(mp.conj);
                    let x = if tri && mp.diag == Diag::Unit {
                        T::one()
                    } else if herm {
                        T::from_real(x.re())
                    } else {
                        x
                    };
                    let x = mp.kappa * x;
                    if mp.invdiag {
                        x.recip()
                    } else {
                        x
                    }
                } else if stored {
                    mp.kappa * (*at(i, j)).conj_if(mp.conj)
                } else if tri {
                    T::zero()
                } else {
                    mp.kappa * (*at(j, i)).conj_if(mp.conj != herm)
                };
                put(schema, p, ldp, dim_max, i, j, v);
            }
        }
        if tri && mp.invdiag {
            for i in dim..Ord::min(dim_max, len_max) {
                put(schema, p, ldp, dim_max, i, i, T::one());
            }
        }
    }
}

/// Packs one micro-panel whose element `(i, j)` lives at
/// `c + i * incc + j * ldc`.
///
/// # Safety
/// `p` must hold `ldp * panel_len_max` elements and every source element the
/// structure refers to must be readable.
///
/// # Panics
/// when the diagonal crosses the short side of the micro-panel: the cache
/// block sizes were not multiples of the register block sizes.
pub unsafe fn pack_micropanel<T: Scalar>(
    mp: &MicroPanel<T>,
    c: *const T,
    incc: isize,
    ldc: isize,
    p: *mut T,
) {
    let dim = mp.panel_dim as isize;
    let len = mp.panel_len as isize;
    let len_pad = mp.panel_len_max - mp.panel_len;
    let ldp = mp.schema.ld(mp.panel_dim_max);

    if mp.struc == Struc::General {
        unsafe {
            pack_cxk(
                mp.conj,
                mp.schema,
                mp.panel_dim,
                mp.panel_dim_max,
                mp.panel_len,
                mp.panel_len_max,
                mp.kappa,
                c,
                incc,
                ldc,
                p,
            )
        };
        return;
    }

    let d = mp.diagoff;
    if (-dim < d && d < 0) || (len - dim < d && d < len) {
        panic!(
            "diagonal at offset {d} crosses the short side of a {}x{} micro-panel",
            mp.panel_dim, mp.panel_len
        );
    }

    let herm = mp.struc == Struc::Hermitian;
    let tri = mp.struc == Struc::Triangular;

    unsafe {
        if 0 < d {
            let p10_len = Ord::min(d, len) as usize;
            let p10_len_max = if p10_len == mp.panel_len {
                mp.panel_len_max
            } else {
                p10_len
            };
            let (mut c10, mut incc10, mut ldc10) = (c, incc, ldc);
            let mut conj10 = mp.conj;

            if mp.uplo == Uplo::Upper {
                reflect_to_stored_part(d, &mut c10, &mut incc10, &mut ldc10);
                conj10 ^= herm;
            }

            if mp.uplo == Uplo::Upper && tri {
                zero_cols(p, ldp, p10_len_max);
            } else {
                pack_cxk(
                    conj10,
                    mp.schema,
                    mp.panel_dim,
                    mp.panel_dim_max,
                    p10_len,
                    p10_len_max,
                    mp.kappa,
                    c10,
                    incc10,
                    ldc10,
                    p,
                );
            }
        }

        if 0 <= d && d + dim <= len {
            let i = d as usize;
            let p11_len_max = mp.panel_dim + if d + dim == len { len_pad } else { 0 };
            pack_cxc_diag(
                mp,
                p11_len_max,
                c.wrapping_offset(d * ldc),
                incc,
                ldc,
                p.add(i * ldp),
            );
        }

        if d + dim < len {
            let i = Ord::max(0, d + dim) as usize;
            let p12_len = mp.panel_len - i;
            let p12_len_max = p12_len + len_pad;
            let (mut c12, mut incc12, mut ldc12) = (c.wrapping_offset(i as isize * ldc), incc, ldc);
            let mut conj12 = mp.conj;

            if mp.uplo == Uplo::Lower {
                reflect_to_stored_part(d - i as isize, &mut c12, &mut incc12, &mut ldc12);
                conj12 ^= herm;
            }

            let p12 = p.add(i * ldp);
            if mp.uplo == Uplo::Lower && tri {
                zero_cols(p12, ldp, p12_len_max);
            } else {
                pack_cxk(
                    conj12,
                    mp.schema,
                    mp.panel_dim,
                    mp.panel_dim_max,
                    p12_len,
                    p12_len_max,
                    mp.kappa,
                    c12,
                    incc12,
                    ldc12,
                    p12,
                );
            }
        }
    }
}

/// Where and how a block was packed.
#[derive(Copy, Clone, Debug)]
pub struct Packed<T> {
    pub ptr: *mut T,
    /// elements between consecutive micro-panels
    pub ps: usize,
    /// elements between consecutive packed columns
    pub ldp: usize,
    pub bmult: usize,
    pub dim: usize,
    pub len: usize,
    pub len_max: usize,
    pub schema: Schema,
    pub struc: Struc,
    pub uplo: Uplo,
    /// `col - row` of the diagonal relative to the block origin
    pub diag_off: isize,
}

unsafe impl<T: Sync> Sync for Packed<T> {}
unsafe impl<T: Send> Send for Packed<T> {}

impl<T> Packed<T> {
    #[inline(always)]
    pub fn panel(&self, idx: usize) -> *mut T {
        self.ptr.wrapping_add(idx * self.ps)
    }

    #[inline]
    pub fn n_panels(&self) -> usize {
        self.dim.div_ceil(self.bmult)
    }

    /// Column of the diagonal on the first row of micro-panel `idx`.
    #[inline(always)]
    pub fn panel_diagoff(&self, idx: usize) -> isize {
        self.diag_off + (idx * self.bmult) as isize
    }

    /// Whether a structure makes the zero or reflected region matter.
    #[inline]
    pub fn is_triangular(&self) -> bool {
        self.struc == Struc::Triangular
    }
}

/// Elements needed to pack a `dim x len_max` block with register block `bmult`.
pub fn packed_len(dim: usize, len_max: usize, bmult: usize, schema: Schema) -> usize {
    dim.div_ceil(bmult) * schema.ld(bmult) * len_max
}

impl<T: Scalar> Packed<T> {
    /// Layout `pack_block` produces for `src` at `p`, without packing.
    pub(crate) fn describe(src: &Operand<T>, bmult: usize, len_max: usize, schema: Schema, p: *mut T) -> Self {
        debug_assert!(len_max >= src.ncols);
        let ldp = schema.ld(bmult);
        Packed {
            ptr: p,
            ps: ldp * len_max,
            ldp,
            bmult,
            dim: src.nrows,
            len: src.ncols,
            len_max,
            schema,
            struc: src.struc,
            uplo: src.uplo,
            diag_off: src.diag_off,
        }
    }
}

/// Packs `src` (oriented so that its rows are the short side of the
/// micro-panels) into `dim.div_ceil(bmult)` consecutive micro-panels.
///
/// # Safety
/// `p` must hold [`packed_len`] elements.
pub(crate) unsafe fn pack_block<T: Scalar>(
    src: &Operand<T>,
    bmult: usize,
    len_max: usize,
    kappa: T,
    invdiag: bool,
    schema: Schema,
    p: *mut T,
) -> Packed<T> {
    let packed = Packed::describe(src, bmult, len_max, schema, p);
    let dim = packed.dim;
    let len = packed.len;

    for idx in 0..packed.n_panels() {
        let off = idx * bmult;
        let mp = MicroPanel {
            struc: src.struc,
            uplo: src.uplo,
            diag: src.diag,
            conj: src.conj,
            schema,
            invdiag,
            panel_dim: Ord::min(bmult, dim - off),
            panel_len: len,
            panel_dim_max: bmult,
            panel_len_max: len_max,
            diagoff: packed.panel_diagoff(idx),
            kappa,
        };
        unsafe { pack_micropanel(&mp, src.ptr_at(off, 0), src.rs, src.cs, packed.panel(idx)) };
    }
    packed
}
