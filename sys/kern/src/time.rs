// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time and the periodic preemption timer.
//!
//! The hardware timer is an external driver behind `TimerDevice`, owned by
//! the kernel root object. The manager starts it at boot; every tick bumps
//! the kernel timestamp and sets the need-resched flag, which the syscall
//! return path turns into a yield-with-requeue.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::kernel::KernState;
use crate::thread;

/// In-kernel timestamp, measured in timer ticks since boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Timestamp(pub u32);

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Driver model implemented by whatever provides the main system
/// programmable timer.
pub trait TimerDevice: Send {
    fn init(&mut self);
    fn start_periodic(&mut self, period_ms: u32);
    fn clear_interrupt(&mut self);
}

/// Starts the periodic preemption tick.
pub fn start_periodic(ks: &mut KernState, period_ms: u32) {
    if let Some(d) = ks.timer.as_mut() {
        d.start_periodic(period_ms);
    }
}

/// Body of the timer's in-kernel IRQ handler.
pub fn report_periodic_interrupt(ks: &mut KernState) {
    if let Some(d) = ks.timer.as_mut() {
        d.clear_interrupt();
    }
    TICKS.fetch_add(1, Ordering::Relaxed);
    thread::set_need_resched();
}

pub fn now() -> Timestamp {
    Timestamp(TICKS.load(Ordering::Relaxed))
}
