// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel synchronization primitives.
//!
//! `IrqSpinlock` pairs a spin lock word with storage for the caller's
//! previous interrupt-mask state: acquisition disables interrupts first,
//! then takes the lock; release restores them after the lock drops. On this
//! uniprocessor the lock word is uncontended -- the lock's essential job is
//! to make a critical section atomic against interrupt handlers. Holding
//! one across a yield or across a user-space copy is forbidden.
//!
//! `Semaphore` and `Barrier` block *kernel threads* through the scheduler;
//! they are not reachable from user code.

use alloc::collections::VecDeque;

use crate::arch;
use crate::pool::Pool;
use crate::thread::{ReadyQueues, SchedState, Thread, ThreadRef};

/// A spinlock guarding a `T`, disabling interrupts for as long as it is
/// held.
pub struct IrqSpinlock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Disables interrupts, then acquires the lock. The returned guard
    /// restores the previous interrupt state when dropped.
    pub fn lock(&self) -> IrqGuard<'_, T> {
        let token = arch::disable_interrupts();
        IrqGuard {
            guard: Some(self.inner.lock()),
            token,
        }
    }
}

pub struct IrqGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    token: arch::IrqSave,
}

impl<'a, T> core::ops::Deref for IrqGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> core::ops::DerefMut for IrqGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T> Drop for IrqGuard<'a, T> {
    fn drop(&mut self) {
        // The lock word must clear before interrupts come back on.
        self.guard.take();
        arch::restore_interrupts(self.token);
    }
}

/// Counting semaphore for kernel threads. Used for handshakes like the
/// spawner/spawnee baton at process creation.
#[derive(Debug)]
pub struct Semaphore {
    count: u32,
    waiters: VecDeque<ThreadRef>,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: initial,
            waiters: VecDeque::new(),
        }
    }

    /// Releases one unit. The longest-waiting thread, if any, takes it and
    /// becomes ready.
    pub fn up(&mut self, threads: &mut Pool<Thread>, ready: &mut ReadyQueues) {
        match self.waiters.pop_front() {
            Some(t) => ready.enqueue(threads, t),
            None => self.count += 1,
        }
    }

    /// Attempts to take one unit for `current`. Returns `true` on success;
    /// otherwise marks `current` blocked and returns `false`, in which case
    /// the caller must yield without requeueing itself.
    pub fn down(
        &mut self,
        threads: &mut Pool<Thread>,
        current: ThreadRef,
    ) -> bool {
        if self.count > 0 {
            self.count -= 1;
            true
        } else {
            threads.get_mut(current).expect("sem wait by stale thread").state =
                SchedState::Waiting;
            self.waiters.push_back(current);
            false
        }
    }
}

/// Counting barrier: the first `required - 1` arrivals block; the last one
/// releases everybody.
#[derive(Debug)]
pub struct Barrier {
    required: u32,
    arrived: u32,
    waiters: VecDeque<ThreadRef>,
}

impl Barrier {
    pub fn new(required: u32) -> Self {
        Self {
            required,
            arrived: 0,
            waiters: VecDeque::new(),
        }
    }

    /// Records `current`'s arrival. Returns `true` if the barrier tripped
    /// (the caller proceeds and all waiters are readied); `false` if the
    /// caller must yield without requeueing itself.
    pub fn arrive(
        &mut self,
        threads: &mut Pool<Thread>,
        ready: &mut ReadyQueues,
        current: ThreadRef,
    ) -> bool {
        self.arrived += 1;
        if self.arrived >= self.required {
            self.arrived = 0;
            while let Some(t) = self.waiters.pop_front() {
                ready.enqueue(threads, t);
            }
            true
        } else {
            threads
                .get_mut(current)
                .expect("barrier wait by stale thread")
                .state = SchedState::Waiting;
            self.waiters.push_back(current);
            false
        }
    }
}
