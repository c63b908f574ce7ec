//! Bounded pool of reusable virtual users, one per scenario.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    runner::RunContext,
    vu::{Vu, VuState},
};

/// Every VU is busy and the pool already holds `max` of them.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("all {max} virtual users are busy")]
pub struct PoolExhausted {
    pub max: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<Vu>,
    allocated: usize,
    active: usize,
    peak_active: usize,
    pending_shrink: usize,
}

/// Hands out idle VUs and allocates new ones lazily up to `max`.
///
/// Active VUs never exceed `max`, and allocated VUs never exceed `max` either: a VU
/// is allocated at most once and only destroyed by a pending shrink or at teardown.
#[derive(Debug)]
pub struct VuPool {
    scenario: Arc<str>,
    run: Arc<RunContext>,
    pre_allocated: usize,
    max: usize,
    state: Mutex<PoolState>,
}

impl VuPool {
    /// Creates the pool with `pre_allocated` idle VUs.
    pub fn new(
        scenario: Arc<str>,
        run: Arc<RunContext>,
        pre_allocated: usize,
        max: usize,
    ) -> Self {
        let max = max.max(1);
        let pre_allocated = pre_allocated.min(max);
        let idle = (0..pre_allocated)
            .map(|_| Vu::new(run.next_vu_id(), Arc::clone(&scenario), Arc::clone(&run)))
            .collect();
        tracing::debug!("Pre-allocated {pre_allocated} VUs for scenario {scenario}");

        Self {
            scenario,
            run,
            pre_allocated,
            max,
            state: Mutex::new(PoolState {
                idle,
                allocated: pre_allocated,
                ..Default::default()
            }),
        }
    }

    /// Takes an idle VU, allocating one if the pool is still below `max`.
    pub fn acquire(&self) -> Result<Vu, PoolExhausted> {
        let mut state = self.state.lock();
        let mut vu = match state.idle.pop() {
            Some(vu) => vu,
            None if state.allocated < self.max => {
                state.allocated += 1;
                let vu = Vu::new(
                    self.run.next_vu_id(),
                    Arc::clone(&self.scenario),
                    Arc::clone(&self.run),
                );
                tracing::debug!("Allocated VU {} for scenario {}", vu.id(), self.scenario);
                vu
            }
            None => return Err(PoolExhausted { max: self.max }),
        };
        // demand is back, cancel one outstanding shrink
        state.pending_shrink = state.pending_shrink.saturating_sub(1);
        state.active += 1;
        state.peak_active = state.peak_active.max(state.active);
        self.run.vus_activated(1);
        vu.set_state(VuState::Active);
        Ok(vu)
    }

    /// Returns a VU after its iteration (or its loop) ended.
    ///
    /// The VU is destroyed instead when a shrink is pending and the pool is above
    /// `pre_allocated`.
    pub fn release(&self, mut vu: Vu) {
        vu.discard();
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        self.run.vus_released(1);
        if state.pending_shrink > 0 && state.allocated > self.pre_allocated {
            state.pending_shrink -= 1;
            state.allocated -= 1;
            vu.set_state(VuState::Stopped);
            tracing::debug!("Destroyed VU {} of scenario {}", vu.id(), self.scenario);
            return;
        }
        vu.set_state(VuState::Idle);
        state.idle.push(vu);
    }

    /// Asks the pool to destroy the next `n` released VUs, down to `pre_allocated`.
    pub fn shrink(&self, n: usize) {
        self.state.lock().pending_shrink += n;
    }

    /// Forgets `n` VUs whose iterations were aborted at graceful stop.
    pub fn abandoned(&self, n: usize) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(n);
        state.allocated = state.allocated.saturating_sub(n);
        self.run.vus_released(n);
    }

    /// Tears the pool down, returning how many idle VUs were stopped.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        let stopped = state.idle.len();
        for mut vu in state.idle.drain(..) {
            vu.set_state(VuState::Stopped);
        }
        state.allocated -= stopped;
        stopped
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn pre_allocated(&self) -> usize {
        self.pre_allocated
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Highest number of simultaneously active VUs seen so far.
    pub fn peak_active(&self) -> usize {
        self.state.lock().peak_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, run_context};

    fn pool(pre: usize, max: usize) -> VuPool {
        let run = run_context(FakeTransport::ok(200, ""), None);
        VuPool::new(Arc::from("pool"), run, pre, max)
    }

    #[test]
    fn pre_allocates_and_grows_lazily_up_to_max() {
        let pool = pool(2, 3);
        assert_eq!((pool.allocated(), pool.idle()), (2, 2));

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.allocated(), 2);
        let c = pool.acquire().unwrap();
        assert_eq!(pool.allocated(), 3);

        assert_eq!(pool.acquire().unwrap_err(), PoolExhausted { max: 3 });
        assert_eq!(pool.active(), 3);
        assert_eq!(c.state(), VuState::Active);

        for vu in [a, b, c] {
            pool.release(vu);
        }
        assert_eq!((pool.active(), pool.idle()), (0, 3));
        assert_eq!(pool.peak_active(), 3);
    }

    #[test]
    fn released_vus_are_reused() {
        let pool = pool(1, 1);
        let vu = pool.acquire().unwrap();
        let id = vu.id();
        pool.release(vu);

        let again = pool.acquire().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn shrink_destroys_down_to_pre_allocated() {
        let pool = pool(1, 3);
        let vus: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();

        pool.shrink(3);
        for vu in vus {
            pool.release(vu);
        }

        // two destroyed, the last one kept because the pool hit pre_allocated
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn acquire_cancels_a_pending_shrink() {
        let pool = pool(0, 2);
        let a = pool.acquire().unwrap();
        pool.shrink(1);
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn abandoned_vus_free_their_slots() {
        let pool = pool(0, 1);
        let vu = pool.acquire().unwrap();
        drop(vu);
        pool.abandoned(1);

        assert_eq!(pool.active(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn close_stops_idle_vus() {
        let pool = pool(3, 3);
        assert_eq!(pool.close(), 3);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn vu_ids_are_unique_across_the_run() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let a = VuPool::new(Arc::from("a"), Arc::clone(&run), 2, 2);
        let b = VuPool::new(Arc::from("b"), run, 2, 2);

        let mut ids: Vec<u64> = (0..2)
            .flat_map(|_| [a.acquire().unwrap().id(), b.acquire().unwrap().id()])
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }
}
