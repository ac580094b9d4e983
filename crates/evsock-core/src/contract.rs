//! Work contracts: schedulable units of deferred work
//!
//! A [`ContractGroup`] owns a fixed number of contract slots. Each live
//! [`Contract`] is bound to a work callback and a release callback.
//!
//! - `schedule()` makes the contract runnable. Scheduling an already
//!   scheduled contract is a no-op; scheduling one that is currently
//!   executing causes exactly one more execution afterwards.
//! - `execute_next_contract()` pops one runnable contract and runs it. A
//!   given contract never executes on two threads at once.
//! - `release()` asks for the contract to be retired. The release callback
//!   runs exactly once, from inside `execute_next_contract()`, when no
//!   execution of the work callback is in flight. No work runs after it.
//!
//! Handles carry the slot generation. Once a slot is retired and reused,
//! old handles for it are inert.
//!
//! # Slot state
//!
//! ```text
//! 63            32 31              0
//! +---------------+----------------+
//! |  generation   |     flags      |
//! +---------------+----------------+
//! ```
//!
//! `SCHEDULED` means the slot index is in the ready queue, or is executing
//! and must be re-queued when it finishes. The index is therefore in the
//! ready queue at most once, so a ready queue sized to the slot count can
//! never overflow.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::ContractError;

const ALLOCATED: u64 = 1 << 0;
const SCHEDULED: u64 = 1 << 1;
const EXECUTING: u64 = 1 << 2;
const RELEASED: u64 = 1 << 3;
const FLAG_MASK: u64 = 0xFFFF_FFFF;

#[inline]
const fn generation_of(state: u64) -> u32 {
    (state >> 32) as u32
}

#[inline]
const fn pack(generation: u32, flags: u64) -> u64 {
    ((generation as u64) << 32) | (flags & FLAG_MASK)
}

type WorkFn = Box<dyn FnMut() + Send>;
type ReleaseFn = Box<dyn FnOnce() + Send>;

struct Slot {
    state: AtomicU64,
    work: Mutex<Option<WorkFn>>,
    on_release: Mutex<Option<ReleaseFn>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(pack(0, 0)),
            work: Mutex::new(None),
            on_release: Mutex::new(None),
        }
    }
}

struct GroupInner {
    slots: Box<[Slot]>,
    /// Indices of unallocated slots
    free: ArrayQueue<u32>,
    /// Indices of runnable slots
    ready: ArrayQueue<u32>,
    live: AtomicUsize,
    stopped: AtomicBool,
}

impl GroupInner {
    #[inline]
    fn enqueue(&self, index: u32) {
        let pushed = self.ready.push(index).is_ok();
        debug_assert!(pushed, "ready queue overflow for slot {index}");
    }

    /// Set `flags` on slot `index` if it is still at `generation`.
    ///
    /// Returns `None` for a stale handle, otherwise the previous state.
    fn set_flags(&self, index: u32, generation: u32, flags: u64) -> Option<u64> {
        let slot = &self.slots[index as usize];
        let mut current = slot.state.load(Ordering::Acquire);
        loop {
            if generation_of(current) != generation || current & ALLOCATED == 0 {
                return None;
            }
            if current & flags == flags {
                return Some(current);
            }
            match slot.state.compare_exchange_weak(
                current,
                current | flags,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return Some(prev),
                Err(actual) => current = actual,
            }
        }
    }

    fn schedule(&self, index: u32, generation: u32) -> bool {
        match self.set_flags(index, generation, SCHEDULED) {
            None => false,
            Some(prev) => {
                if prev & (SCHEDULED | EXECUTING) == 0 {
                    self.enqueue(index);
                }
                true
            }
        }
    }

    fn release(&self, index: u32, generation: u32) -> bool {
        match self.set_flags(index, generation, RELEASED | SCHEDULED) {
            None => false,
            Some(prev) => {
                if prev & RELEASED != 0 {
                    return false;
                }
                if prev & (SCHEDULED | EXECUTING) == 0 {
                    self.enqueue(index);
                }
                true
            }
        }
    }

    fn execute_next(&self) -> bool {
        let Some(index) = self.ready.pop() else {
            return false;
        };
        let slot = &self.slots[index as usize];

        // ── Claim: SCHEDULED -> EXECUTING ──
        let mut current = slot.state.load(Ordering::Acquire);
        loop {
            let next = (current | EXECUTING) & !SCHEDULED;
            match slot.state.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let generation = generation_of(current);

        // ── Retire ──
        if current & RELEASED != 0 {
            drop(slot.work.lock().take());
            let on_release = slot.on_release.lock().take();
            if let Some(f) = on_release {
                f();
            }
            slot.state.store(pack(generation.wrapping_add(1), 0), Ordering::Release);
            self.live.fetch_sub(1, Ordering::AcqRel);
            let freed = self.free.push(index).is_ok();
            debug_assert!(freed, "free list overflow for slot {index}");
            return true;
        }

        // ── Run ──
        {
            let mut work = slot.work.lock();
            if let Some(f) = work.as_mut() {
                f();
            }
        }

        // ── Finish: re-queue if scheduled (or released) meanwhile ──
        let prev = slot.state.fetch_and(!EXECUTING, Ordering::AcqRel);
        if prev & SCHEDULED != 0 {
            self.enqueue(index);
        }
        true
    }
}

/// A fixed-capacity group of work contracts
///
/// Cloning yields another handle to the same group.
#[derive(Clone)]
pub struct ContractGroup {
    inner: Arc<GroupInner>,
}

impl ContractGroup {
    /// Create a group with room for `capacity` live contracts
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots: Box<[Slot]> = (0..capacity).map(|_| Slot::new()).collect();
        let free = ArrayQueue::new(capacity);
        for index in 0..capacity as u32 {
            let _ = free.push(index);
        }
        Self {
            inner: Arc::new(GroupInner {
                slots,
                free,
                ready: ArrayQueue::new(capacity),
                live: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Reserve an unbound contract. Attach callbacks with [`Contract::bind`].
    pub fn reserve_contract(&self) -> Result<Contract, ContractError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(ContractError::Stopped);
        }
        let Some(index) = self.inner.free.pop() else {
            trace!(capacity = self.capacity(), "contract group full");
            return Err(ContractError::GroupFull);
        };
        self.inner.live.fetch_add(1, Ordering::AcqRel);

        let slot = &self.inner.slots[index as usize];
        let generation = generation_of(slot.state.load(Ordering::Acquire));
        slot.state.store(pack(generation, ALLOCATED), Ordering::Release);

        Ok(Contract {
            group: Arc::clone(&self.inner),
            index,
            generation,
        })
    }

    /// Create a contract bound to `work` and `on_release`
    pub fn create_contract<W, R>(&self, work: W, on_release: R) -> Result<Contract, ContractError>
    where
        W: FnMut() + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        let contract = self.reserve_contract()?;
        contract.bind(work, on_release);
        Ok(contract)
    }

    /// Run at most one runnable contract. Returns true if one was run.
    #[inline]
    pub fn execute_next_contract(&self) -> bool {
        self.inner.execute_next()
    }

    /// Release every live contract and drain until all are retired
    ///
    /// Idempotent. Other threads may keep calling `execute_next_contract`
    /// concurrently; this returns once every release callback has run.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!(live = self.live_contracts(), "stopping contract group");
        }

        while self.inner.live.load(Ordering::Acquire) > 0 {
            for (index, slot) in self.inner.slots.iter().enumerate() {
                let state = slot.state.load(Ordering::Acquire);
                if state & ALLOCATED != 0 && state & RELEASED == 0 {
                    self.inner.release(index as u32, generation_of(state));
                }
            }
            while self.inner.execute_next() {}
            if self.inner.live.load(Ordering::Acquire) > 0 {
                std::thread::yield_now();
            }
        }
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Number of contracts not yet retired
    #[inline]
    pub fn live_contracts(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }
}

impl fmt::Debug for ContractGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractGroup")
            .field("capacity", &self.capacity())
            .field("live", &self.live_contracts())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Handle to one contract in a [`ContractGroup`]
///
/// Handles are cheap to clone. Dropping a handle does not release the
/// contract; call [`release`](Contract::release).
#[derive(Clone)]
pub struct Contract {
    group: Arc<GroupInner>,
    index: u32,
    generation: u32,
}

impl Contract {
    /// Attach the work and release callbacks
    ///
    /// Must not be called from inside this contract's own work callback.
    pub fn bind<W, R>(&self, work: W, on_release: R)
    where
        W: FnMut() + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        let slot = &self.group.slots[self.index as usize];
        if generation_of(slot.state.load(Ordering::Acquire)) != self.generation {
            return;
        }
        *slot.work.lock() = Some(Box::new(work));
        *slot.on_release.lock() = Some(Box::new(on_release));
    }

    /// Make the contract runnable. Returns false for a retired handle.
    #[inline]
    pub fn schedule(&self) -> bool {
        self.group.schedule(self.index, self.generation)
    }

    /// Request retirement. Returns true only for the call that initiated it.
    #[inline]
    pub fn release(&self) -> bool {
        self.group.release(self.index, self.generation)
    }

    /// True until release has been requested
    pub fn is_valid(&self) -> bool {
        let state = self.group.slots[self.index as usize].state.load(Ordering::Acquire);
        generation_of(state) == self.generation && state & ALLOCATED != 0 && state & RELEASED == 0
    }
}

impl fmt::Debug for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contract")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[test]
    fn test_schedule_executes_once() {
        let group = ContractGroup::new(4);
        let runs = counter();
        let r = runs.clone();
        let c = group.create_contract(move || { r.fetch_add(1, Ordering::SeqCst); }, || {}).unwrap();

        assert!(!group.execute_next_contract());
        assert!(c.schedule());
        assert!(c.schedule());
        assert!(group.execute_next_contract());
        assert!(!group.execute_next_contract());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_during_execution_runs_again() {
        let group = ContractGroup::new(4);
        let runs = counter();
        let c = group.reserve_contract().unwrap();
        let me = c.clone();
        let r = runs.clone();
        c.bind(
            move || {
                if r.fetch_add(1, Ordering::SeqCst) < 2 {
                    me.schedule();
                }
            },
            || {},
        );

        c.schedule();
        while group.execute_next_contract() {}
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_release_runs_callback_once_and_stops_work() {
        let group = ContractGroup::new(2);
        let runs = counter();
        let released = counter();
        let (r, rel) = (runs.clone(), released.clone());
        let c = group
            .create_contract(
                move || { r.fetch_add(1, Ordering::SeqCst); },
                move || { rel.fetch_add(1, Ordering::SeqCst); },
            )
            .unwrap();

        c.schedule();
        assert!(c.release());
        assert!(!c.release());
        assert!(!c.is_valid());
        while group.execute_next_contract() {}

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(group.live_contracts(), 0);
        assert!(!c.schedule());
    }

    #[test]
    fn test_stale_handle_is_inert_after_reuse() {
        let group = ContractGroup::new(1);
        let old = group.create_contract(|| {}, || {}).unwrap();
        old.release();
        while group.execute_next_contract() {}

        let runs = counter();
        let r = runs.clone();
        let fresh = group.create_contract(move || { r.fetch_add(1, Ordering::SeqCst); }, || {}).unwrap();
        assert!(!old.schedule());
        assert!(!old.release());
        assert!(fresh.is_valid());
        assert!(!group.execute_next_contract());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_group_full() {
        let group = ContractGroup::new(2);
        let _a = group.reserve_contract().unwrap();
        let _b = group.reserve_contract().unwrap();
        assert_eq!(group.reserve_contract().unwrap_err(), ContractError::GroupFull);
    }

    #[test]
    fn test_stop_retires_everything() {
        let group = ContractGroup::new(8);
        let released = counter();
        let contracts: Vec<_> = (0..5)
            .map(|_| {
                let rel = released.clone();
                group.create_contract(|| {}, move || { rel.fetch_add(1, Ordering::SeqCst); }).unwrap()
            })
            .collect();
        contracts[0].schedule();

        group.stop();
        group.stop();
        assert_eq!(released.load(Ordering::SeqCst), 5);
        assert_eq!(group.live_contracts(), 0);
        assert_eq!(group.reserve_contract().unwrap_err(), ContractError::Stopped);
    }

    #[test]
    fn test_no_concurrent_execution() {
        let group = ContractGroup::new(4);
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = counter();
        let runs = counter();
        let c = group.reserve_contract().unwrap();
        let (b, o, r) = (busy.clone(), overlaps.clone(), runs.clone());
        c.bind(
            move || {
                if b.swap(true, Ordering::SeqCst) {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                r.fetch_add(1, Ordering::SeqCst);
                std::hint::spin_loop();
                b.store(false, Ordering::SeqCst);
            },
            || {},
        );

        std::thread::scope(|s| {
            for _ in 0..4 {
                let g = group.clone();
                s.spawn(move || {
                    for _ in 0..20_000 {
                        g.execute_next_contract();
                    }
                });
            }
            let c = c.clone();
            s.spawn(move || {
                for _ in 0..20_000 {
                    c.schedule();
                }
            });
        });
        while group.execute_next_contract() {}

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_release_races_schedule() {
        for _ in 0..200 {
            let group = ContractGroup::new(2);
            let after_release = Arc::new(AtomicBool::new(false));
            let violations = counter();
            let c = group.reserve_contract().unwrap();
            let (ar, v) = (after_release.clone(), violations.clone());
            let ar2 = after_release.clone();
            c.bind(
                move || {
                    if ar.load(Ordering::SeqCst) {
                        v.fetch_add(1, Ordering::SeqCst);
                    }
                },
                move || ar2.store(true, Ordering::SeqCst),
            );

            std::thread::scope(|s| {
                let g = group.clone();
                s.spawn(move || for _ in 0..500 { g.execute_next_contract(); });
                let sc = c.clone();
                s.spawn(move || for _ in 0..500 { sc.schedule(); });
                let rc = c.clone();
                s.spawn(move || { rc.release(); });
            });
            group.stop();

            assert!(after_release.load(Ordering::SeqCst));
            assert_eq!(violations.load(Ordering::SeqCst), 0);
        }
    }
}
