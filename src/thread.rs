//! Thread decorator: splits the claimed loops of a tree over a team of
//! workers and provides the barriers shared within each group.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

use crate::blocksize::Blocksizes;
use crate::cntl::Claim;
use crate::config::{Config, Ways};
use crate::error::Result;

/// Sense-reversing barrier over a fixed number of participants.
pub(crate) struct Comm {
    count: CachePadded<AtomicUsize>,
    sense: CachePadded<AtomicBool>,
    size: usize,
}

impl Comm {
    pub fn new(size: usize) -> Self {
        Self {
            count: CachePadded::new(AtomicUsize::new(0)),
            sense: CachePadded::new(AtomicBool::new(false)),
            size,
        }
    }

    /// Blocks until all `size` participants arrived. Panics instead of
    /// waiting forever once `poisoned` is raised.
    pub fn barrier(&self, poisoned: &AtomicBool) {
        if self.size <= 1 {
            return;
        }
        let sense = self.sense.load(Ordering::Acquire);
        if self.count.fetch_add(1, Ordering::AcqRel) + 1 == self.size {
            self.count.store(0, Ordering::Relaxed);
            self.sense.store(!sense, Ordering::Release);
        } else {
            let backoff = Backoff::new();
            while self.sense.load(Ordering::Acquire) == sense {
                if poisoned.load(Ordering::Relaxed) {
                    panic!("a worker of the same operation panicked");
                }
                backoff.snooze();
            }
        }
    }
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

/// Automatic split of `threads` over the loops in `claims` for an `m x n`
/// output.
///
/// Factors go to whichever of N and M has the larger extent per way. A tree
/// claiming N but not M hands factors to the `NR` loop once the N blocks
/// would drop below `NC`.
pub(crate) fn factor_ways(threads: usize, m: usize, n: usize, claims: Claim, bs: &Blocksizes) -> Ways {
    let jc = claims.contains(Claim::NC);
    let ic = claims.contains(Claim::MC);
    let jr = claims.contains(Claim::NR);
    let ir = claims.contains(Claim::MR);

    let mut ways = Ways::SERIAL;
    for p in prime_factors(threads).into_iter().rev() {
        if jc && ic {
            if n * ways.ic >= m * ways.jc {
                ways.jc *= p;
            } else {
                ways.ic *= p;
            }
        } else if jc {
            if jr && n.div_ceil(ways.jc * p) < bs.nc.def {
                ways.jr *= p;
            } else {
                ways.jc *= p;
            }
        } else if ic {
            ways.ic *= p;
        } else if jr {
            ways.jr *= p;
        } else if ir {
            ways.ir *= p;
        }
    }
    ways
}

/// Ways for one operation: explicit configuration if any, with the ways of
/// unclaimed loops moved to a claimed one, otherwise [`factor_ways`].
///
/// # Panics
/// if the explicit ways need more threads than configured.
pub(crate) fn resolve_ways(cfg: &Config, m: usize, n: usize, claims: Claim, bs: &Blocksizes) -> Ways {
    let threads = cfg.threads();
    let Some(mut ways) = cfg.ways() else {
        return factor_ways(threads, m, n, claims, bs);
    };

    assert!(
        ways.product() <= threads,
        "{ways:?} needs {} threads, only {threads} configured",
        ways.product()
    );
    if ways.pc > 1 {
        log::warn!("K is never split, running with pc = 1 instead of {}", ways.pc);
        ways.pc = 1;
    }

    let mut spare = 1;
    for (claim, w) in [
        (Claim::NC, &mut ways.jc),
        (Claim::MC, &mut ways.ic),
        (Claim::NR, &mut ways.jr),
        (Claim::MR, &mut ways.ir),
    ] {
        if !claims.contains(claim) {
            spare *= *w;
            *w = 1;
        }
    }
    if spare > 1 {
        let target = [
            (Claim::MC, &mut ways.ic),
            (Claim::NR, &mut ways.jr),
            (Claim::NC, &mut ways.jc),
            (Claim::MR, &mut ways.ir),
        ]
        .into_iter()
        .find(|(claim, _)| claims.contains(*claim));
        match target {
            Some((claim, w)) => {
                log::debug!("moving {spare} unclaimed ways to {claim:?}");
                *w *= spare;
            }
            None => log::warn!("no loop is claimed, dropping {spare} ways"),
        }
    }

    if ways.product() < threads {
        log::warn!(
            "{ways:?} uses {} of {threads} configured threads",
            ways.product()
        );
    }
    ways
}

/// Barriers of one operation's workers.
pub(crate) struct Team {
    pub ways: Ways,
    /// one per `jc` group
    jc: Box<[Comm]>,
    /// one per `(jc, ic)` group
    ic: Box<[Comm]>,
    poisoned: AtomicBool,
}

impl Team {
    pub fn new(ways: Ways) -> Self {
        debug_assert_eq!(ways.pc, 1);
        let per_jc = ways.ic * ways.jr * ways.ir;
        let per_ic = ways.jr * ways.ir;
        Self {
            ways,
            jc: (0..ways.jc).map(|_| Comm::new(per_jc)).collect(),
            ic: (0..ways.jc * ways.ic).map(|_| Comm::new(per_ic)).collect(),
            poisoned: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.ways.product()
    }

    pub fn thread(&self, id: usize) -> Thread<'_> {
        let w = self.ways;
        Thread {
            id,
            ir_id: id % w.ir,
            jr_id: (id / w.ir) % w.jr,
            ic_id: (id / (w.ir * w.jr)) % w.ic,
            jc_id: id / (w.ir * w.jr * w.ic),
            team: self,
        }
    }
}

/// Position of one worker in the thread grid.
pub(crate) struct Thread<'a> {
    pub id: usize,
    pub jc_id: usize,
    pub ic_id: usize,
    pub jr_id: usize,
    pub ir_id: usize,
    team: &'a Team,
}

impl Thread<'_> {
    #[inline]
    pub fn ways(&self) -> Ways {
        self.team.ways
    }

    /// Index of this worker's `(jc, ic)` group.
    #[inline]
    pub fn ic_group(&self) -> usize {
        self.jc_id * self.team.ways.ic + self.ic_id
    }

    #[inline]
    pub fn is_jc_chief(&self) -> bool {
        self.ic_id == 0 && self.jr_id == 0 && self.ir_id == 0
    }

    #[inline]
    pub fn is_ic_chief(&self) -> bool {
        self.jr_id == 0 && self.ir_id == 0
    }

    pub fn jc_barrier(&self) {
        self.team.jc[self.jc_id].barrier(&self.team.poisoned);
    }

    pub fn ic_barrier(&self) {
        self.team.ic[self.ic_group()].barrier(&self.team.poisoned);
    }
}

/// Raises the team's poison flag if the worker unwinds.
struct PoisonOnUnwind<'a>(&'a AtomicBool);

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(true, Ordering::Relaxed);
        }
    }
}

/// A rayon pool whose workers all take part in one broadcast at a time.
#[cfg(feature = "rayon")]
struct Workers {
    pool: rayon::ThreadPool,
    busy: std::sync::Mutex<()>,
}

/// Pools kept alive between operations, most recently used last.
#[cfg(feature = "rayon")]
const MAX_POOLS: usize = 4;

#[cfg(feature = "rayon")]
static POOLS: std::sync::Mutex<Vec<(usize, std::sync::Arc<Workers>)>> = std::sync::Mutex::new(Vec::new());

/// Pool of `n_threads` workers. The least recently used pool is dropped once
/// more than [`MAX_POOLS`] sizes are cached; its threads exit when the last
/// operation using it returns.
#[cfg(feature = "rayon")]
fn worker_pool(n_threads: usize) -> Result<std::sync::Arc<Workers>> {
    use std::sync::{Arc, Mutex};

    let mut pools = POOLS.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(pos) = pools.iter().position(|(n, _)| *n == n_threads) {
        let entry = pools.remove(pos);
        let workers = entry.1.clone();
        pools.push(entry);
        return Ok(workers);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .thread_name(|i| format!("level3-worker-{i}"))
        .build()
        .map_err(|e| crate::Error::ThreadPool(e.to_string()))?;
    log::debug!("started a pool of {n_threads} workers");
    let workers = Arc::new(Workers {
        pool,
        busy: Mutex::new(()),
    });
    if pools.len() == MAX_POOLS {
        let (n, _) = pools.remove(0);
        log::debug!("dropping the pool of {n} workers");
    }
    pools.push((n_threads, workers.clone()));
    Ok(workers)
}

/// Runs `f(thread)` for every member of `team`, all of them concurrently.
pub(crate) fn launch(team: &Team, f: &(dyn Fn(&Thread<'_>) + Sync)) -> Result<()> {
    let run = |id: usize| {
        let _guard = PoisonOnUnwind(&team.poisoned);
        f(&team.thread(id));
    };

    let n_threads = team.size();
    if n_threads == 1 {
        run(0);
        return Ok(());
    }

    #[cfg(feature = "rayon")]
    {
        let workers = worker_pool(n_threads)?;
        // interleaved broadcasts would deadlock in the barriers
        let _busy = workers.busy.lock().unwrap_or_else(|e| e.into_inner());
        // unwind outside of the lock
        let mut result = Ok(());
        spindle::with_lock(n_threads, || {
            result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                workers.pool.broadcast(|ctx| run(ctx.index()));
            }));
        });
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    #[cfg(not(feature = "rayon"))]
    std::thread::scope(|s| {
        let run = &run;
        for id in 1..n_threads {
            s.spawn(move || run(id));
        }
        run(0);
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocksize::Blocksizes;

    #[test]
    fn barrier_orders_phases() {
        let ways = Ways {
            jc: 2,
            ic: 2,
            ..Ways::SERIAL
        };
        let team = Team::new(ways);
        let counter = AtomicUsize::new(0);
        let seen = (0..4).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();

        launch(&team, &|thr| {
            for round in 0..50 {
                if thr.is_jc_chief() {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                thr.jc_barrier();
                // both chiefs may have counted by now, but ours has
                assert!(counter.load(Ordering::Relaxed) > round);
                seen[thr.id].fetch_add(1, Ordering::Relaxed);
                thr.jc_barrier();
            }
        })
        .unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 100);
        assert!(seen.iter().all(|s| s.load(Ordering::Relaxed) == 50));
    }

    #[test]
    fn grid_ids() {
        let team = Team::new(Ways {
            jc: 2,
            pc: 1,
            ic: 3,
            jr: 2,
            ir: 1,
        });
        let mut groups = std::collections::HashSet::new();
        for id in 0..team.size() {
            let thr = team.thread(id);
            assert!(thr.jc_id < 2 && thr.ic_id < 3 && thr.jr_id < 2);
            groups.insert((thr.jc_id, thr.ic_id, thr.jr_id));
            assert!(thr.ic_group() < 6);
        }
        assert_eq!(groups.len(), 12);
    }

    const GEMM: Claim = Claim::NC.union(Claim::MC).union(Claim::NR).union(Claim::MR);
    const SOLVE: Claim = Claim::NC.union(Claim::NR);
    const NO_NC: Claim = Claim::MC.union(Claim::NR).union(Claim::MR);

    #[test]
    fn factorisation() {
        let bs = Blocksizes::exact(8, 8, 8, 4, 4);
        assert_eq!(factor_ways(1, 100, 100, GEMM, &bs), Ways::SERIAL);

        let w = factor_ways(12, 1000, 10, GEMM, &bs);
        assert_eq!(w.product(), 12);
        assert!(w.ic > w.jc);

        let w = factor_ways(6, 10, 1000, GEMM, &bs);
        assert_eq!((w.jc, w.ic), (6, 1));

        let w = factor_ways(4, 100, 4, SOLVE, &bs);
        assert_eq!((w.jc, w.ic, w.jr), (1, 1, 4));

        let w = factor_ways(4, 100, 100, NO_NC, &bs);
        assert_eq!((w.jc, w.ic), (1, 4));

        // nothing claimed, nothing split
        assert_eq!(factor_ways(4, 100, 100, Claim::NONE, &bs), Ways::SERIAL);
    }

    #[test]
    fn explicit_ways() {
        let bs = Blocksizes::exact(8, 8, 8, 4, 4);
        let cfg = Config::new().with_threads(8).with_ways(Ways {
            ic: 2,
            ir: 2,
            ..Ways::SERIAL
        });
        let w = resolve_ways(&cfg, 10, 10, SOLVE, &bs);
        assert_eq!((w.ic, w.ir, w.jr), (1, 1, 4));
        assert_eq!(resolve_ways(&cfg, 10, 10, GEMM, &bs).product(), 4);

        let cfg = cfg.with_ways(Ways {
            jc: 2,
            ir: 2,
            ..Ways::SERIAL
        });
        let w = resolve_ways(&cfg, 10, 10, NO_NC, &bs);
        assert_eq!((w.jc, w.ic, w.ir), (1, 2, 2));
    }

    #[test]
    #[should_panic]
    fn too_many_ways() {
        let bs = Blocksizes::exact(8, 8, 8, 4, 4);
        let cfg = Config::new().with_threads(2).with_ways(Ways {
            jc: 4,
            ..Ways::SERIAL
        });
        resolve_ways(&cfg, 10, 10, GEMM, &bs);
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn pool_cache_is_bounded() {
        for n in 2..2 + 2 * MAX_POOLS {
            let workers = worker_pool(n).unwrap();
            assert_eq!(workers.pool.current_num_threads(), n);
        }
        let pools = POOLS.lock().unwrap_or_else(|e| e.into_inner());
        assert!(pools.len() <= MAX_POOLS);
    }

    #[test]
    fn sibling_panic_does_not_hang() {
        let team = Team::new(Ways {
            jc: 2,
            ..Ways::SERIAL
        });
        let team2 = Team::new(Ways {
            ic: 2,
            ..Ways::SERIAL
        });
        // independent groups never wait on each other
        launch(&team, &|thr| thr.jc_barrier()).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            launch(&team2, &|thr| {
                if thr.id == 1 {
                    panic!("worker failure");
                }
                thr.jc_barrier();
            })
        }));
        assert!(result.is_err());
    }
}
