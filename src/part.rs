use core::ops::Range;

use crate::blocksize::BlkSz;
use crate::view::Uplo;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dir {
    Fwd,
    Bwd,
}

/// One block produced by a [`Partition`].
///
/// `off` is relative to the start of the partitioned range. `len_max` is the
/// padded length handed to the compute side, `is_last` marks the block that
/// sits at the end of the range (the edge block), whatever the direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub off: usize,
    pub len: usize,
    pub len_max: usize,
    pub is_last: bool,
}

/// Blocked iteration over one dimension.
#[derive(Copy, Clone, Debug)]
pub struct Partition {
    n: usize,
    b: usize,
    b_max: usize,
    mult: usize,
    pad: usize,
    dir: Dir,
    weighted: bool,
}

impl Partition {
    /// Panics if `mult` is zero or larger than the block size: such a
    /// partition cannot produce aligned blocks.
    pub fn new(n: usize, bsz: BlkSz, mult: usize, dir: Dir) -> Self {
        assert!(mult > 0, "block-size multiple is zero");
        assert!(
            bsz.def >= mult,
            "block size {} is smaller than its multiple {mult}",
            bsz.def
        );
        let b = bsz.def - bsz.def % mult;
        Self {
            n,
            b,
            b_max: Ord::max(bsz.max, b),
            mult,
            pad: 1,
            dir,
            weighted: false,
        }
    }

    /// Spread the length evenly over the minimal number of blocks.
    pub fn weighted(self) -> Self {
        Self {
            weighted: true,
            ..self
        }
    }

    /// Round every block's `len_max` up to a multiple of `pad`.
    pub fn padded(self, pad: usize) -> Self {
        assert!(pad > 0);
        Self { pad, ..self }
    }

    /// Length of weighted block `i` when `rem` elements are left.
    fn weighted_len(&self, i: usize, rem: usize) -> usize {
        let left = self.n.div_ceil(self.b) - i;
        if left <= 1 {
            rem
        } else {
            Ord::min(rem.div_ceil(left).next_multiple_of(self.mult), rem)
        }
    }

    /// Offset and length of block `idx` of the forward decomposition.
    fn nth_forward(&self, idx: usize) -> (usize, usize) {
        if self.weighted {
            let mut off = 0;
            let mut rem = self.n;
            let mut i = 0;
            loop {
                let len = self.weighted_len(i, rem);
                if i == idx {
                    return (off, len);
                }
                off += len;
                rem -= len;
                i += 1;
            }
        } else {
            let off = idx * self.b;
            let rem = self.n - off;
            let len = if rem <= self.b_max { rem } else { self.b };
            (off, len)
        }
    }

    /// Number of blocks.
    pub fn count(&self) -> usize {
        if self.n == 0 {
            return 0;
        }
        if self.weighted {
            // rounding up to the multiple can exhaust the range early
            let mut rem = self.n;
            let mut i = 0;
            while rem > 0 {
                rem -= self.weighted_len(i, rem);
                i += 1;
            }
            i
        } else if self.n <= self.b_max {
            1
        } else {
            // full blocks until the remainder fits in b_max
            let mut count = 1;
            let mut rem = self.n - self.b;
            while rem > self.b_max {
                rem -= self.b;
                count += 1;
            }
            count + 1
        }
    }

    pub fn iter(&self) -> Blocks {
        let count = self.count();
        Blocks {
            part: *self,
            front: 0,
            back: count,
            count,
        }
    }

    fn block(&self, idx: usize, count: usize) -> Block {
        let (off, len) = self.nth_forward(idx);
        Block {
            off,
            len,
            len_max: len.next_multiple_of(self.pad),
            is_last: idx + 1 == count,
        }
    }
}

impl IntoIterator for &Partition {
    type Item = Block;
    type IntoIter = Blocks;

    fn into_iter(self) -> Blocks {
        self.iter()
    }
}

/// Lazy, restartable block sequence. Cloning restarts from the current state.
#[derive(Clone, Debug)]
pub struct Blocks {
    part: Partition,
    front: usize,
    back: usize,
    count: usize,
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.front == self.back {
            return None;
        }
        let idx = match self.part.dir {
            Dir::Fwd => {
                self.front += 1;
                self.front - 1
            }
            Dir::Bwd => {
                self.back -= 1;
                self.back
            }
        };
        Some(self.part.block(idx, self.count))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.back - self.front;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Blocks {}

/// Sub-range of `[0, n)` assigned to `work_id` out of `n_way` workers, split
/// at `mult` granularity. Earlier workers get the extra units.
pub fn thread_range(n: usize, mult: usize, n_way: usize, work_id: usize) -> Range<usize> {
    debug_assert!(work_id < n_way);
    let units = n.div_ceil(mult);
    let per = units / n_way;
    let extra = units % n_way;

    let start = work_id * per + Ord::min(work_id, extra);
    let len = per + (work_id < extra) as usize;
    let start = Ord::min(n, start * mult);
    let end = Ord::min(n, start + len * mult);
    start..end
}

/// Like [`thread_range`] over the columns of an `m x n` region whose
/// referenced part is bounded by a diagonal, balancing the number of
/// referenced elements instead of the number of columns.
///
/// `diag_off` is `col - row` of the diagonal elements.
pub fn thread_range_weighted(
    m: usize,
    n: usize,
    diag_off: isize,
    uplo: Uplo,
    mult: usize,
    n_way: usize,
    work_id: usize,
) -> Range<usize> {
    debug_assert!(work_id < n_way);
    if uplo == Uplo::Dense || n_way == 1 {
        return thread_range(n, mult, n_way, work_id);
    }

    let col_weight = |j: usize| -> usize {
        // referenced rows of column j
        let lim = j as isize - diag_off;
        match uplo {
            Uplo::Lower => (m as isize - Ord::max(lim, 0)).clamp(0, m as isize) as usize,
            Uplo::Upper => (lim + 1).clamp(0, m as isize) as usize,
            Uplo::Dense => m,
        }
    };

    let units = n.div_ceil(mult);
    let unit_weight = |u: usize| -> usize {
        let start = u * mult;
        let end = Ord::min(n, start + mult);
        (start..end).map(col_weight).sum()
    };
    let total: usize = (0..units).map(unit_weight).sum();

    // boundary t lies after the first unit whose prefix weight reaches
    // t * total / n_way
    let boundary = |t: usize| -> usize {
        if t == 0 {
            return 0;
        }
        if t == n_way {
            return units;
        }
        let target = (total * t).div_ceil(n_way);
        let mut acc = 0;
        for u in 0..units {
            if acc >= target {
                return u;
            }
            acc += unit_weight(u);
        }
        units
    };

    let start = Ord::min(n, boundary(work_id) * mult);
    let end = Ord::min(n, boundary(work_id + 1) * mult);
    start..Ord::max(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn check_cover(part: &Partition, n: usize, b: usize, m: usize) {
        let mut blocks: Vec<Block> = part.iter().collect();
        if part.dir == Dir::Bwd {
            blocks.reverse();
        }
        let mut next = 0;
        for (i, blk) in blocks.iter().enumerate() {
            assert_eq!(blk.off, next);
            assert!(blk.len > 0);
            assert!(blk.len_max >= blk.len);
            if i + 1 < blocks.len() {
                assert!(!blk.is_last);
                assert_eq!(blk.len % m, 0);
                assert!(blk.len <= b);
            } else {
                assert!(blk.is_last);
            }
            next += blk.len;
        }
        assert_eq!(next, n);
    }

    #[test]
    fn covers_range_exactly() {
        let rng = &mut StdRng::seed_from_u64(0);
        for _ in 0..2000 {
            let m = rng.random_range(1..8usize);
            let b = m * rng.random_range(1..10usize) + rng.random_range(0..m);
            let b_max = b + rng.random_range(0..2 * b);
            let n = rng.random_range(0..200usize);
            for dir in [Dir::Fwd, Dir::Bwd] {
                for weighted in [false, true] {
                    let mut part = Partition::new(n, BlkSz::new(b, b_max), m, dir);
                    if weighted {
                        part = part.weighted();
                    }
                    check_cover(&part, n, b, m);
                    assert_eq!(part.iter().len(), part.count());
                }
            }
        }
    }

    #[test]
    fn forward_blocks() {
        let part = Partition::new(10, BlkSz::fixed(4), 1, Dir::Fwd).padded(4);
        let blocks: Vec<_> = part.iter().collect();
        assert_eq!(
            blocks,
            [
                Block { off: 0, len: 4, len_max: 4, is_last: false },
                Block { off: 4, len: 4, len_max: 4, is_last: false },
                Block { off: 8, len: 2, len_max: 4, is_last: true },
            ]
        );
    }

    #[test]
    fn backward_keeps_alignment() {
        let part = Partition::new(10, BlkSz::fixed(4), 2, Dir::Bwd);
        let offs: Vec<_> = part.iter().map(|b| (b.off, b.len)).collect();
        assert_eq!(offs, [(8, 2), (4, 4), (0, 4)]);
    }

    #[test]
    fn max_absorbs_small_tail() {
        let part = Partition::new(10, BlkSz::new(4, 6), 1, Dir::Fwd);
        let lens: Vec<_> = part.iter().map(|b| b.len).collect();
        assert_eq!(lens, [4, 6]);
    }

    #[test]
    fn weighted_evens_out() {
        let part = Partition::new(10, BlkSz::fixed(4), 1, Dir::Fwd).weighted();
        let lens: Vec<_> = part.iter().map(|b| b.len).collect();
        assert_eq!(lens, [4, 3, 3]);
    }

    #[test]
    fn restartable() {
        let part = Partition::new(7, BlkSz::fixed(2), 1, Dir::Fwd);
        let a: Vec<_> = part.iter().collect();
        let b: Vec<_> = (&part).into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic]
    fn block_smaller_than_multiple() {
        Partition::new(10, BlkSz::fixed(2), 4, Dir::Fwd);
    }

    #[test]
    fn thread_ranges_cover() {
        for n in 0..50 {
            for mult in 1..5 {
                for n_way in 1..6 {
                    let mut next = 0;
                    for id in 0..n_way {
                        let r = thread_range(n, mult, n_way, id);
                        assert_eq!(r.start, next);
                        assert!(r.start % mult == 0 || r.start == n);
                        next = r.end;
                    }
                    assert_eq!(next, n);

                    for uplo in [Uplo::Lower, Uplo::Upper] {
                        let mut next = 0;
                        for id in 0..n_way {
                            let r = thread_range_weighted(n, n, 0, uplo, mult, n_way, id);
                            assert_eq!(r.start, next);
                            next = r.end;
                        }
                        assert_eq!(next, n);
                    }
                }
            }
        }
    }

    #[test]
    fn weighted_thread_range_balances_triangle() {
        // lower triangle: the first columns are the heavy ones
        let r0 = thread_range_weighted(100, 100, 0, Uplo::Lower, 1, 2, 0);
        let r1 = thread_range_weighted(100, 100, 0, Uplo::Lower, 1, 2, 1);
        assert!(r0.len() < r1.len());
        assert_eq!(r0.end, r1.start);
    }
}
