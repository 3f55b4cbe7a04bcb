// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The boot shim (outside this crate) brings RAM and the debug serial up,
//! initializes the kernel heap, collects the platform drivers into a
//! `Platform`, and calls `start_kernel`. The portable half of bring-up,
//! `init_kernel`, is also what the simulation uses to stand a kernel up
//! under test.

use alloc::boxed::Box;

use abi::{Priority, FIRST_CHANNEL_ID, PROCMGR_PID};

use crate::interrupt::{self, InterruptController};
use crate::ipc;
use crate::kernel::Kernel;
use crate::process;
use crate::procmgr;
use crate::time::{self, TimerDevice};
use crate::vm::PageSource;

/// The externally supplied pieces the kernel builds on.
pub struct Platform {
    /// Physical page allocator.
    pub pages: Box<dyn PageSource>,
    /// Interrupt controller bindings.
    pub controller: Box<dyn InterruptController>,
    /// The system timer, if the platform has one wired for preemption.
    pub timer: Option<Box<dyn TimerDevice>>,
    /// IRQ line the timer raises.
    pub timer_irq: Option<u32>,
}

/// Portable bring-up: builds the kernel state, spawns the process manager
/// with its well-known channel, and hooks the preemption timer.
pub fn init_kernel(platform: Platform) -> Kernel {
    let kern = Kernel::new();
    {
        let mut st = kern.state.lock();
        let ks = &mut *st;

        ks.pages = Some(platform.pages);
        interrupt::register_controller(ks, platform.controller);

        // The manager is the first process and owns the first channel.
        let mgr = process::create(ks, "procmgr", None, None)
            .expect("manager creation cannot fail");
        uassert!(mgr == PROCMGR_PID);
        let t = process::add_thread(
            ks,
            mgr,
            Priority::Normal,
            procmgr::manager_entry,
            0,
        );
        uassert!(t.is_some());
        let chid = ipc::channel_create(ks, mgr)
            .expect("manager channel creation cannot fail");
        uassert!(chid == FIRST_CHANNEL_ID);

        if let Some(irq) = platform.timer_irq {
            interrupt::attach_kernel_handler(ks, irq, timer_tick);
        }
        if let Some(mut t) = platform.timer {
            t.init();
            ks.timer = Some(t);
        }
    }
    procmgr::register_default_handlers();
    kern
}

/// In-kernel handler for the preemption timer's IRQ line.
fn timer_tick(ks: &mut crate::kernel::KernState) {
    time::report_periodic_interrupt(ks);
}

#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: linked_list_allocator::LockedHeap =
    linked_list_allocator::LockedHeap::empty();

/// Hands the kernel heap its backing region. Must happen before anything
/// allocates, i.e. before `Platform` is even assembled.
///
/// # Safety
///
/// `base..base+len` must be unused, writable RAM, and this must be called
/// exactly once.
#[cfg(target_os = "none")]
pub unsafe fn init_heap(base: *mut u8, len: usize) {
    KERNEL_HEAP.lock().init(base, len);
}

/// The main kernel entry point: finish bring-up, become the idle thread,
/// and hand the processor to the manager.
///
/// # Safety
///
/// This can be called exactly once per boot, after `init_heap`, in
/// supervisor mode with interrupts disabled.
#[cfg(target_os = "none")]
pub unsafe fn start_kernel(platform: Platform) -> ! {
    use crate::thread::{SchedState, Thread};

    crate::arch::init_exception_stacks();

    let kern: &'static Kernel = Box::leak(Box::new(init_kernel(platform)));

    // Adopt the boot context as the idle thread, so the very first
    // reschedule has something to switch away from.
    {
        let mut st = kern.state.lock();
        let ks = &mut *st;
        let idle = ks
            .threads
            .insert(Thread {
                save: Default::default(),
                stack: None,
                state: SchedState::Running,
                process: None,
                assigned_priority: Priority::Normal,
                effective_priority: Priority::Normal,
                joiner: None,
                recv_dest: None,
            })
            .expect("idle thread");
        ks.current = Some(idle);
    }
    crate::arch::set_kernel(kern);

    klog!("starting: manager");
    crate::arch::reschedule(true);

    // From here on this context only soaks up idle time.
    loop {
        if crate::thread::reset_need_resched() {
            crate::arch::reschedule(true);
        }
        crate::arch::wait_for_interrupt();
    }
}
