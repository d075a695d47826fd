//! Control trees: the blocked loop nest of one operation as data.

use crate::blocksize::BszId;
use crate::part::Dir;
use crate::scalar::Dt;
use crate::view::{Side, Struc, Uplo};

/// Loop levels a node may hand over to the thread decorator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Claim(u8);

impl Claim {
    pub const NONE: Claim = Claim(0);
    pub const NC: Claim = Claim(1 << 0);
    pub const KC: Claim = Claim(1 << 1);
    pub const MC: Claim = Claim(1 << 2);
    pub const NR: Claim = Claim(1 << 3);
    pub const MR: Claim = Claim(1 << 4);

    #[inline]
    pub const fn union(self, other: Claim) -> Claim {
        Claim(self.0 | other.0)
    }

    #[inline]
    pub const fn contains(self, other: Claim) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Loop {
    Jc,
    Pc,
    Ic,
}

/// Rows an `Ic` partition covers, relative to the current `K` block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Span {
    Full,
    /// rows of the current `K` block
    DiagBlock,
    /// rows not yet solved against the current `K` block
    OffDiag,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    BlockA,
    PanelB,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
    Gemm,
    Gemmt,
    Trmm,
    Trsm,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Partition {
        lp: Loop,
        bsz: BszId,
        mult: Option<BszId>,
        /// multiple each block's `len_max` is padded to
        pad: Option<BszId>,
        dir: Dir,
        /// spread the range evenly over the blocks
        weighted: bool,
        claim: Claim,
        span: Span,
        sub: Box<Node>,
    },
    Pack {
        role: Role,
        /// register block along the short side of the micro-panels
        bmult_m: BszId,
        /// multiple the packed length is padded to
        bmult_n: Option<BszId>,
        invert_diag: bool,
        rev_iter_if_upper: bool,
        rev_iter_if_lower: bool,
        /// run on the packed buffer before `sub`
        pre: Option<Box<Node>>,
        sub: Box<Node>,
    },
    Compute {
        family: Family,
        claim: Claim,
    },
}

/// Structural tags of one operand as seen by the tree builder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Desc {
    pub struc: Struc,
    pub uplo: Uplo,
}

impl Desc {
    pub const GENERAL: Desc = Desc {
        struc: Struc::General,
        uplo: Uplo::Dense,
    };
}

fn pack(role: Role, bmult_n: Option<BszId>, sub: Node) -> Node {
    Node::Pack {
        role,
        bmult_m: match role {
            Role::BlockA => BszId::Mr,
            Role::PanelB => BszId::Nr,
        },
        bmult_n,
        invert_diag: false,
        rev_iter_if_upper: false,
        rev_iter_if_lower: false,
        pre: None,
        sub: Box::new(sub),
    }
}

fn partition(lp: Loop, mult: Option<BszId>, dir: Dir, claim: Claim, span: Span, sub: Node) -> Node {
    Node::Partition {
        lp,
        bsz: match lp {
            Loop::Jc => BszId::Nc,
            Loop::Pc => BszId::Kc,
            Loop::Ic => BszId::Mc,
        },
        mult,
        pad: None,
        dir,
        weighted: false,
        claim,
        span,
        sub: Box::new(sub),
    }
}

fn weighted(mut node: Node) -> Node {
    if let Node::Partition { weighted, .. } = &mut node {
        *weighted = true;
    }
    node
}

fn padded(mut node: Node, id: BszId) -> Node {
    if let Node::Partition { pad, .. } = &mut node {
        *pad = Some(id);
    }
    node
}

/// Builds the tree of `family` for operands `a` (left) and `b` (right).
///
/// At most one of `a`, `b` may be structured; for [`Family::Trsm`], `a` is
/// the triangular matrix on the left. `in_place` marks an output aliasing
/// one of the operands.
///
/// # Panics
/// on mixed datatypes.
pub fn build(family: Family, a: Desc, b: Desc, in_place: bool, dt_a: Dt, dt_b: Dt, dt_comp: Dt) -> Node {
    assert!(
        dt_a == dt_b && dt_a == dt_comp,
        "mixed datatypes are not supported: {dt_a:?} x {dt_b:?} -> {dt_comp:?}"
    );
    debug_assert!(a.struc == Struc::General || b.struc == Struc::General);

    match family {
        Family::Trsm => build_trsm(a.uplo),
        _ => build_gemm(family, a, b, in_place),
    }
}

fn build_gemm(family: Family, a: Desc, b: Desc, in_place: bool) -> Node {
    let (side, tri) = if a.struc != Struc::General {
        (Some(Side::Left), a)
    } else if b.struc != Struc::General {
        (Some(Side::Right), b)
    } else {
        (None, Desc::GENERAL)
    };

    let mut jdir = Dir::Fwd;
    let mut kdir = Dir::Fwd;
    if family == Family::Trmm {
        match (side, tri.uplo) {
            (Some(Side::Left), Uplo::Lower) => kdir = Dir::Bwd,
            (Some(Side::Right), Uplo::Upper) => {
                jdir = Dir::Bwd;
                kdir = Dir::Bwd;
            }
            _ => {}
        }
    }

    // K blocks of a structured operand stay aligned to its micro-panels
    let kmult = match side {
        Some(Side::Left) => Some(BszId::Mr),
        Some(Side::Right) => Some(BszId::Nr),
        None => None,
    };

    let compute = Node::Compute {
        family,
        claim: Claim::NR.union(Claim::MR),
    };
    // an N split would let one group read columns of the in-place operand
    // that another group is overwriting
    let nc = if family == Family::Trmm && in_place && side == Some(Side::Right) {
        Claim::NONE
    } else {
        Claim::NC
    };
    // loops over a triangle are balanced by area
    let even = |node| match family {
        Family::Gemmt | Family::Trmm => weighted(node),
        _ => node,
    };

    let block_a = pack(Role::BlockA, None, compute);
    let ic = even(partition(Loop::Ic, Some(BszId::Mr), Dir::Fwd, Claim::MC, Span::Full, block_a));
    let panel_b = pack(Role::PanelB, None, ic);
    let pc = partition(Loop::Pc, kmult, kdir, Claim::NONE, Span::Full, panel_b);
    even(partition(Loop::Jc, Some(BszId::Nr), jdir, nc, Span::Full, pc))
}

fn build_trsm(uplo: Uplo) -> Node {
    let dir = match uplo {
        Uplo::Upper => Dir::Bwd,
        _ => Dir::Fwd,
    };

    let solve = Node::Pack {
        role: Role::BlockA,
        bmult_m: BszId::Mr,
        bmult_n: Some(BszId::Mr),
        invert_diag: true,
        rev_iter_if_upper: true,
        rev_iter_if_lower: false,
        pre: None,
        sub: Box::new(Node::Compute {
            family: Family::Trsm,
            claim: Claim::NR,
        }),
    };
    let diag = partition(Loop::Ic, Some(BszId::Mr), dir, Claim::NONE, Span::DiagBlock, solve);

    let update = pack(
        Role::BlockA,
        Some(BszId::Mr),
        Node::Compute {
            family: Family::Gemm,
            claim: Claim::NR,
        },
    );
    let rest = partition(Loop::Ic, Some(BszId::Mr), Dir::Fwd, Claim::NONE, Span::OffDiag, update);

    let panel_b = Node::Pack {
        role: Role::PanelB,
        bmult_m: BszId::Nr,
        bmult_n: Some(BszId::Mr),
        invert_diag: false,
        rev_iter_if_upper: false,
        rev_iter_if_lower: false,
        pre: Some(Box::new(diag)),
        sub: Box::new(rest),
    };
    let pc = padded(
        partition(Loop::Pc, Some(BszId::Mr), dir, Claim::NONE, Span::Full, panel_b),
        BszId::Mr,
    );
    partition(Loop::Jc, Some(BszId::Nr), Dir::Fwd, Claim::NC, Span::Full, pc)
}

impl Node {
    /// Union of the claims of every node in the tree.
    pub fn claims(&self) -> Claim {
        match self {
            Node::Partition { claim, sub, .. } => claim.union(sub.claims()),
            Node::Pack { pre, sub, .. } => {
                let pre = pre.as_ref().map_or(Claim::NONE, |p| p.claims());
                pre.union(sub.claims())
            }
            Node::Compute { claim, .. } => *claim,
        }
    }

    /// Direction of the first partition over `lp`.
    pub fn dir_of(&self, lp: Loop) -> Option<Dir> {
        match self {
            Node::Partition {
                lp: this, dir, sub, ..
            } => {
                if *this == lp {
                    Some(*dir)
                } else {
                    sub.dir_of(lp)
                }
            }
            Node::Pack { sub, .. } => sub.dir_of(lp),
            Node::Compute { .. } => None,
        }
    }
}
