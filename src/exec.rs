//! Tree walker and macrokernels.

use core::ops::Range;

use crate::blocksize::Blocksizes;
use crate::cntl::{self, Claim, Desc, Family, Loop, Node, Role, Span};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pack::{pack_block, packed_len, Packed, Schema};
use crate::part::{thread_range, thread_range_weighted, Block, Partition};
use crate::scalar::Scalar;
use crate::thread::{self, Team, Thread};
use crate::ukr::{Kernels, MicrokernelInfo, TrsmInfo, Ukr, MAX_TILE};
use crate::view::{Operand, Struc, Uplo};

/// `C = beta * C + alpha * A * B` after side and orientation have been
/// normalized. For the solve, `A * X = alpha * B` with `b` and `c` both
/// naming `B`.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Problem<T> {
    pub a: Operand<T>,
    pub b: Operand<T>,
    pub c: Operand<T>,
    pub alpha: T,
    pub beta: T,
}

struct Buffers<T> {
    a: *mut T,
    a_len: usize,
    b: *mut T,
    b_len: usize,
}

unsafe impl<T: Sync> Sync for Buffers<T> {}

impl<T> Buffers<T> {
    #[inline]
    fn block_a(&self, group: usize) -> *mut T {
        self.a.wrapping_add(group * self.a_len)
    }

    #[inline]
    fn panel_b(&self, group: usize) -> *mut T {
        self.b.wrapping_add(group * self.b_len)
    }
}

/// Read-only state shared by all workers of one operation.
struct Env<T: Scalar> {
    bs: Blocksizes,
    ukr: Ukr<T>,
    kernels: Kernels<T>,
    schema_a: Schema,
    schema_b: Schema,
    solve: bool,
    alpha: T,
    beta: T,
    bufs: Buffers<T>,
}

/// Per-worker view of the current position in the loop nest.
#[derive(Copy, Clone)]
struct Ctx<T> {
    a: Operand<T>,
    b: Operand<T>,
    c: Operand<T>,
    alpha: T,
    beta: T,
    kappa_b: T,
    /// current `K` block, in the row space of `c`
    kb: Block,
    /// first row of the current `M` block within `c` at the `Ic` level
    row_off: usize,
    rev_ir: bool,
    pa: Option<Packed<T>>,
    pb: Option<Packed<T>>,
}

fn desc<T>(op: &Operand<T>) -> Desc {
    Desc {
        struc: op.struc,
        uplo: op.uplo,
    }
}

/// Whether a triangular operand references no element of `op`.
fn is_unreferenced<T>(op: &Operand<T>) -> bool {
    if op.struc != Struc::Triangular || op.nrows == 0 || op.ncols == 0 {
        return false;
    }
    let d = op.diag_off;
    match op.uplo {
        Uplo::Lower => 1 - (op.nrows as isize) > d,
        Uplo::Upper => op.ncols as isize - 1 < d,
        Uplo::Dense => false,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Overlap {
    Stored,
    Diag,
    Unstored,
}

/// Position of a `dim x len` strip with diagonal offset `d` relative to the
/// stored triangle.
fn classify_strip(uplo: Uplo, d: isize, dim: usize, len: usize) -> Overlap {
    let (dim, len) = (dim as isize, len as isize);
    let (before, after) = match uplo {
        Uplo::Lower => (Overlap::Unstored, Overlap::Stored),
        Uplo::Upper => (Overlap::Stored, Overlap::Unstored),
        Uplo::Dense => return Overlap::Stored,
    };
    if d + dim <= 0 {
        before
    } else if d >= len {
        after
    } else {
        Overlap::Diag
    }
}

/// Depth range holding the non-zero part of a strip crossed by the diagonal.
fn nonzero_depth(uplo: Uplo, d: isize, dim: usize, len: usize) -> Range<usize> {
    match uplo {
        Uplo::Lower => 0..Ord::min(len as isize, d + dim as isize) as usize,
        Uplo::Upper => Ord::max(d, 0) as usize..len,
        Uplo::Dense => 0..len,
    }
}

/// Position of an `m x n` output tile relative to the stored triangle.
fn classify_tile(uplo: Uplo, d: isize, m: usize, n: usize) -> Overlap {
    let (m, n) = (m as isize, n as isize);
    match uplo {
        Uplo::Lower if n - 1 <= d => Overlap::Stored,
        Uplo::Lower if 1 - m > d => Overlap::Unstored,
        Uplo::Upper if 1 - m >= d => Overlap::Stored,
        Uplo::Upper if n - 1 < d => Overlap::Unstored,
        Uplo::Dense => Overlap::Stored,
        _ => Overlap::Diag,
    }
}

/// Rows of `c` whose stored part meets any of its columns.
fn stored_rows<T>(c: &Operand<T>) -> (usize, usize) {
    let (m, n) = (c.nrows as isize, c.ncols as isize);
    let d = c.diag_off;
    match c.uplo {
        Uplo::Lower => ((-d).clamp(0, m) as usize, m as usize),
        Uplo::Upper => (0, (n - d).clamp(0, m) as usize),
        Uplo::Dense => (0, m as usize),
    }
}

unsafe fn walk<T: Scalar>(env: &Env<T>, thr: &Thread<'_>, node: &Node, ctx: Ctx<T>) {
    unsafe {
        match node {
            Node::Partition {
                lp,
                bsz,
                mult,
                pad,
                dir,
                weighted,
                claim,
                span,
                sub,
            } => {
                let bsz = env.bs.get(*bsz);
                let mult = mult.map_or(1, |id| env.bs.get(id).def);
                let ways = thr.ways();
                let blocks = |n: usize| {
                    let mut part = Partition::new(n, bsz, mult, *dir);
                    if *weighted {
                        part = part.weighted();
                    }
                    if let Some(pad) = pad {
                        part = part.padded(env.bs.get(*pad).def);
                    }
                    part
                };

                match lp {
                    Loop::Jc => {
                        let c = ctx.c;
                        let range = if !claim.contains(Claim::NC) {
                            0..c.ncols
                        } else if c.uplo != Uplo::Dense {
                            thread_range_weighted(
                                c.nrows, c.ncols, c.diag_off, c.uplo, mult, ways.jc, thr.jc_id,
                            )
                        } else {
                            thread_range(c.ncols, mult, ways.jc, thr.jc_id)
                        };

                        for blk in &blocks(range.len()) {
                            let j = range.start + blk.off;
                            let sub_ctx = Ctx {
                                b: ctx.b.submatrix(0, j, ctx.b.nrows, blk.len),
                                c: c.submatrix(0, j, c.nrows, blk.len),
                                ..ctx
                            };
                            walk(env, thr, sub, sub_ctx);
                        }
                    }
                    Loop::Pc => {
                        let k = ctx.a.ncols;
                        let one = T::one();
                        let mut first = true;

                        for blk in &blocks(k) {
                            // only the edge block may be padded
                            debug_assert!(blk.is_last || blk.len_max == blk.len);
                            let a = ctx.a.submatrix(0, blk.off, ctx.a.nrows, blk.len);
                            let b = ctx.b.submatrix(blk.off, 0, blk.len, ctx.b.ncols);
                            if is_unreferenced(&a) || is_unreferenced(&b) {
                                continue;
                            }

                            let (alpha, beta, kappa_b) = match (env.solve, first) {
                                (true, true) => (-one, env.alpha, env.alpha),
                                (true, false) => (-one, one, one),
                                (false, true) => (env.alpha, env.beta, one),
                                (false, false) => (env.alpha, one, one),
                            };
                            first = false;

                            let sub_ctx = Ctx {
                                a,
                                b,
                                alpha,
                                beta,
                                kappa_b,
                                kb: blk,
                                ..ctx
                            };
                            walk(env, thr, sub, sub_ctx);
                        }
                    }
                    Loop::Ic => {
                        let c = ctx.c;
                        let (kb_off, kb_len) = (ctx.kb.off, ctx.kb.len);
                        let (r0, r1) = match span {
                            Span::Full => stored_rows(&c),
                            Span::DiagBlock => (kb_off, kb_off + kb_len),
                            Span::OffDiag => match ctx.a.uplo {
                                Uplo::Upper => (0, kb_off),
                                _ => (kb_off + kb_len, c.nrows),
                            },
                        };
                        let range = if claim.contains(Claim::MC) {
                            let r = thread_range(r1 - r0, mult, ways.ic, thr.ic_id);
                            r0 + r.start..r0 + r.end
                        } else {
                            r0..r1
                        };

                        for blk in &blocks(range.len()) {
                            let i = range.start + blk.off;
                            let sub_ctx = Ctx {
                                a: ctx.a.submatrix(i, 0, blk.len, ctx.a.ncols),
                                c: c.submatrix(i, 0, blk.len, c.ncols),
                                row_off: i,
                                ..ctx
                            };
                            walk(env, thr, sub, sub_ctx);
                        }
                    }
                }
            }

            Node::Pack {
                role,
                bmult_m,
                bmult_n,
                invert_diag,
                rev_iter_if_upper,
                rev_iter_if_lower,
                pre,
                sub,
            } => {
                let bmult = env.bs.get(*bmult_m).def;
                // packed length: the padded K block when the tree asks for it
                let padded = |len: usize| match bmult_n {
                    Some(id) => {
                        debug_assert_eq!(len, ctx.kb.len);
                        debug_assert_eq!(ctx.kb.len_max % env.bs.get(*id).def, 0);
                        ctx.kb.len_max
                    }
                    None => len,
                };

                match role {
                    Role::PanelB => {
                        let src = ctx.b.trans();
                        let len_max = padded(src.ncols);
                        let buf = env.bufs.panel_b(thr.jc_id);
                        let packed = if thr.is_jc_chief() {
                            pack_block(&src, bmult, len_max, ctx.kappa_b, *invert_diag, env.schema_b, buf)
                        } else {
                            Packed::describe(&src, bmult, len_max, env.schema_b, buf)
                        };
                        thr.jc_barrier();

                        let ctx = Ctx {
                            pb: Some(packed),
                            ..ctx
                        };
                        if let Some(pre) = pre {
                            walk(env, thr, pre, ctx);
                            thr.jc_barrier();
                        }
                        walk(env, thr, sub, ctx);
                        thr.jc_barrier();
                    }
                    Role::BlockA => {
                        let src = ctx.a;
                        let len_max = padded(src.ncols);
                        let buf = env.bufs.block_a(thr.ic_group());
                        let packed = if thr.is_ic_chief() {
                            pack_block(&src, bmult, len_max, T::one(), *invert_diag, env.schema_a, buf)
                        } else {
                            Packed::describe(&src, bmult, len_max, env.schema_a, buf)
                        };
                        thr.ic_barrier();

                        let rev_ir = match src.uplo {
                            Uplo::Upper => *rev_iter_if_upper,
                            Uplo::Lower => *rev_iter_if_lower,
                            Uplo::Dense => false,
                        };
                        let ctx = Ctx {
                            pa: Some(packed),
                            rev_ir,
                            ..ctx
                        };
                        if let Some(pre) = pre {
                            walk(env, thr, pre, ctx);
                            thr.ic_barrier();
                        }
                        walk(env, thr, sub, ctx);
                        thr.ic_barrier();
                    }
                }
            }

            Node::Compute { family, claim } => {
                let (Some(pa), Some(pb)) = (ctx.pa, ctx.pb) else {
                    panic!("compute node outside of the A and B pack nodes");
                };
                match family {
                    Family::Trsm => macro_trsm(env, thr, *claim, &ctx, &pa, &pb),
                    _ => macro_gemm(env, thr, *family, *claim, &ctx, &pa, &pb),
                }
            }
        }
    }
}

/// Ways and id of this worker along a register loop, serial unless `claim`
/// covers `level`.
#[inline]
fn register_split(claim: Claim, level: Claim, ways: usize, id: usize) -> (usize, usize) {
    if claim.contains(level) {
        (ways, id)
    } else {
        debug_assert_eq!(ways, 1, "{level:?} split without a claim");
        (1, 0)
    }
}

unsafe fn macro_gemm<T: Scalar>(
    env: &Env<T>,
    thr: &Thread<'_>,
    family: Family,
    claim: Claim,
    ctx: &Ctx<T>,
    pa: &Packed<T>,
    pb: &Packed<T>,
) {
    let c = ctx.c;
    let (mr, nr) = (pa.bmult, pb.bmult);
    let (jr_ways, jr_id) = register_split(claim, Claim::NR, thr.ways().jr, thr.jr_id);
    let (ir_ways, ir_id) = register_split(claim, Claim::MR, thr.ways().ir, thr.ir_id);

    let jr = if family == Family::Gemmt {
        let cols = thread_range_weighted(c.nrows, c.ncols, c.diag_off, c.uplo, nr, jr_ways, jr_id);
        cols.start / nr..cols.end.div_ceil(nr)
    } else {
        thread_range(pb.n_panels(), 1, jr_ways, jr_id)
    };
    let ir = thread_range(pa.n_panels(), 1, ir_ways, ir_id);

    let tri_a = family == Family::Trmm && pa.is_triangular();
    let tri_b = family == Family::Trmm && pb.is_triangular();
    let mut tile = [T::zero(); MAX_TILE];

    for jp in jr {
        let n = Ord::min(nr, c.ncols - jp * nr);
        let mut depth_b = 0..pb.len;
        let mut beta_b = None;
        if tri_b {
            let d = pb.panel_diagoff(jp);
            match classify_strip(pb.uplo, d, n, pb.len) {
                Overlap::Unstored => continue,
                Overlap::Stored => beta_b = Some(T::one()),
                Overlap::Diag => {
                    beta_b = Some(env.beta);
                    depth_b = nonzero_depth(pb.uplo, d, n, pb.len);
                }
            }
        }

        for ip in ir.clone() {
            let m = Ord::min(mr, c.nrows - ip * mr);
            let mut depth = depth_b.clone();
            let mut beta = beta_b.unwrap_or(ctx.beta);
            if tri_a {
                let d = pa.panel_diagoff(ip);
                match classify_strip(pa.uplo, d, m, pa.len) {
                    Overlap::Unstored => continue,
                    Overlap::Stored => beta = T::one(),
                    Overlap::Diag => {
                        beta = env.beta;
                        depth = nonzero_depth(pa.uplo, d, m, pa.len);
                    }
                }
            }
            let depth = depth.start..Ord::max(depth.start, depth.end);

            let a = pa.panel(ip).wrapping_add(depth.start * pa.ldp);
            let b = pb.panel(jp).wrapping_add(depth.start * pb.ldp);
            let mut info = MicrokernelInfo {
                m,
                n,
                depth: depth.len(),
                mr,
                nr,
                alpha: ctx.alpha,
                beta,
                ptr: c.ptr_at(ip * mr, jp * nr),
                rs: c.rs,
                cs: c.cs,
            };

            let overlap = if family == Family::Gemmt {
                let d = c.diag_off + (ip * mr) as isize - (jp * nr) as isize;
                classify_tile(c.uplo, d, m, n)
            } else {
                Overlap::Stored
            };

            match overlap {
                Overlap::Unstored => {}
                Overlap::Stored => unsafe { env.ukr.call(a, b, &info) },
                Overlap::Diag => {
                    let dst = info.ptr;
                    info.ptr = tile.as_mut_ptr();
                    info.rs = 1;
                    info.cs = mr as isize;
                    info.beta = T::zero();
                    unsafe { env.ukr.call(a, b, &info) };

                    let d = c.diag_off + (ip * mr) as isize - (jp * nr) as isize;
                    let beta_zero = beta.is_zero();
                    for j in 0..n {
                        for i in 0..m {
                            let dist = j as isize - i as isize - d;
                            let stored = match c.uplo {
                                Uplo::Lower => dist <= 0,
                                Uplo::Upper => dist >= 0,
                                Uplo::Dense => true,
                            };
                            if !stored {
                                continue;
                            }
                            let dst = dst.wrapping_offset(i as isize * c.rs + j as isize * c.cs);
                            let t = tile[i + mr * j];
                            unsafe { *dst = if beta_zero { t } else { beta.mul_add(*dst, t) } };
                        }
                    }
                }
            }
        }
    }
}

unsafe fn macro_trsm<T: Scalar>(
    env: &Env<T>,
    thr: &Thread<'_>,
    claim: Claim,
    ctx: &Ctx<T>,
    pa: &Packed<T>,
    pb: &Packed<T>,
) {
    let c = ctx.c;
    let (mr, nr) = (pa.bmult, pb.bmult);
    let upper = pa.uplo == Uplo::Upper;
    let gemmtrsm = if upper {
        env.kernels.gemmtrsm_u
    } else {
        env.kernels.gemmtrsm_l
    };

    // row of this block inside the current K block
    let r_rel = ctx.row_off - ctx.kb.off;
    let n_ir = pa.n_panels();
    let (jr_ways, jr_id) = register_split(claim, Claim::NR, thr.ways().jr, thr.jr_id);
    let jr = thread_range(pb.n_panels(), 1, jr_ways, jr_id);

    for jp in jr {
        let n = Ord::min(nr, c.ncols - jp * nr);
        let b_panel = pb.panel(jp);

        for step in 0..n_ir {
            let ip = if ctx.rev_ir { n_ir - 1 - step } else { step };
            let m = Ord::min(mr, c.nrows - ip * mr);
            let r = r_rel + ip * mr;
            let a_panel = pa.panel(ip);

            let (k, a1x, bx1) = if upper {
                let next = r + mr;
                (
                    pa.len_max - next,
                    a_panel.wrapping_add(next * pa.ldp),
                    b_panel.wrapping_add(next * pb.ldp),
                )
            } else {
                (r, a_panel, b_panel)
            };

            let info = TrsmInfo {
                k,
                m,
                n,
                mr,
                nr,
                a11: a_panel.wrapping_add(r * pa.ldp),
                b11: b_panel.wrapping_add(r * pb.ldp),
                ptr: c.ptr_at(ip * mr, jp * nr),
                rs: c.rs,
                cs: c.cs,
            };
            unsafe { gemmtrsm(a1x, bx1, &info) };
        }
    }
}

/// Runs `problem` through the tree of `family` on the configured team.
/// `in_place` marks a `c` aliasing one of the operands.
pub(crate) fn execute<T: Scalar>(cfg: &Config, family: Family, problem: Problem<T>, in_place: bool) -> Result<()> {
    let solve = family == Family::Trsm;
    let induced = !solve && cfg.use_1m::<T>();
    let bs = cfg.blocksizes_for::<T>(induced);
    bs.validate();

    let tree = cntl::build(family, desc(&problem.a), desc(&problem.b), in_place, T::DT, T::DT, T::DT);

    let (m, n, k) = (problem.c.nrows, problem.c.ncols, problem.a.ncols);
    let ways = thread::resolve_ways(cfg, m, n, tree.claims(), &bs);
    log::debug!(
        "{family:?} {m}x{n}x{k} {:?}{}: {ways:?}",
        T::DT,
        if induced { " (1m)" } else { "" },
    );

    let (schema_a, schema_b) = if induced {
        (Schema::OneE, Schema::OneR)
    } else {
        (Schema::Native, Schema::Native)
    };
    let kernels = cfg.kernels_for::<T>();
    let ukr = if induced {
        Ukr::OneM(<T::Real as Scalar>::kernels(cfg.kernels()).gemm)
    } else {
        Ukr::Native(kernels.gemm)
    };

    let (mr, nr) = (bs.mr.def, bs.nr.def);
    let kc = Ord::min(bs.kc.max, k) + Ord::max(mr, nr);
    let b_len = packed_len(Ord::min(bs.nc.max, n), kc, nr, schema_b);
    let a_len = packed_len(Ord::min(bs.mc.max, m), kc, mr, schema_a);

    let elems = ways.jc * b_len + ways.jc * ways.ic * a_len;
    let bytes = elems
        .checked_mul(size_of::<T>())
        .ok_or(Error::Alloc { bytes: usize::MAX })?;
    let mut ws = cfg.pool().acquire(bytes)?;
    debug_assert!(ws.len_bytes() >= bytes);
    let base = ws.as_mut_ptr::<T>();

    let env = Env {
        bs,
        ukr,
        kernels,
        schema_a,
        schema_b,
        solve,
        alpha: problem.alpha,
        beta: problem.beta,
        bufs: Buffers {
            b: base,
            b_len,
            a: base.wrapping_add(ways.jc * b_len),
            a_len,
        },
    };
    let ctx = Ctx {
        a: problem.a,
        b: problem.b,
        c: problem.c,
        alpha: problem.alpha,
        beta: problem.beta,
        kappa_b: T::one(),
        kb: Block {
            off: 0,
            len: 0,
            len_max: 0,
            is_last: true,
        },
        row_off: 0,
        rev_ir: false,
        pa: None,
        pb: None,
    };

    let team = Team::new(ways);
    thread::launch(&team, &|thr| unsafe { walk(&env, thr, &tree, ctx) })
}
