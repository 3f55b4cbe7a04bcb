// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the kernel scenario tests: seam doubles for the
//! platform traits, plus a small harness that stands a kernel up and plays
//! the role of the dispatcher.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use abi::{Pid, Priority, Sysnum};
use kern::interrupt::InterruptController;
use kern::kernel::{Kernel, KernState};
use kern::process;
use kern::startup::{self, Platform};
use kern::syscalls::{self, SyscallDisposition};
use kern::thread::{ArchState, SchedState, ThreadRef};
use kern::time::TimerDevice;
use kern::vm::{AccessRights, AddressSpace, Page, PageSource, PAGE_SIZE};

/// Observable state of the fake interrupt controller.
#[derive(Default)]
pub struct CtrlState {
    /// Line the next `raised_irq` call reports.
    pub raised: Option<u32>,
    /// Current mask status per line, as driven by mask/unmask calls.
    pub masked: [bool; 32],
    pub mask_calls: Vec<u32>,
    pub unmask_calls: Vec<u32>,
}

pub struct SharedController(pub Arc<Mutex<CtrlState>>);

impl InterruptController for SharedController {
    fn init(&mut self) {}

    fn raised_irq(&mut self) -> Option<u32> {
        self.0.lock().unwrap().raised.take()
    }

    fn mask(&mut self, irq: u32) {
        let mut s = self.0.lock().unwrap();
        s.masked[irq as usize] = true;
        s.mask_calls.push(irq);
    }

    fn unmask(&mut self, irq: u32) {
        let mut s = self.0.lock().unwrap();
        s.masked[irq as usize] = false;
        s.unmask_calls.push(irq);
    }
}

/// Page source handing out fake page addresses; nothing on the host ever
/// dereferences a thread stack.
pub struct TestPages {
    next: usize,
    pub freed: Arc<Mutex<usize>>,
}

impl TestPages {
    pub fn new() -> Self {
        Self {
            next: 0x8000_0000,
            freed: Arc::new(Mutex::new(0)),
        }
    }
}

impl PageSource for TestPages {
    fn alloc(&mut self) -> Option<Page> {
        let base = self.next;
        self.next += PAGE_SIZE;
        Some(Page { base_address: base })
    }

    fn free(&mut self, _page: Page) {
        *self.freed.lock().unwrap() += 1;
    }
}

/// Page source that is already exhausted.
pub struct NoPages;

impl PageSource for NoPages {
    fn alloc(&mut self) -> Option<Page> {
        None
    }
    fn free(&mut self, _page: Page) {}
}

/// Address space that admits every access; test buffers live in host
/// memory, which is all "user memory" as far as the harness cares.
pub struct OpenSpace;

impl AddressSpace for OpenSpace {
    fn map_page(&mut self, _vaddr: usize, _paddr: usize) -> bool {
        true
    }
    fn set_user(&self) {}
    fn flush_tlb(&self) {}
    fn can_access(&self, _: usize, _: usize, _: AccessRights) -> bool {
        true
    }
    fn map_phys(&mut self, physaddr: usize, _len: usize) -> Option<usize> {
        Some(0x4000_0000 + (physaddr & (PAGE_SIZE - 1)))
    }
}

/// Address space that denies one range and admits the rest.
pub struct WalledSpace {
    pub deny_base: usize,
    pub deny_len: usize,
}

impl AddressSpace for WalledSpace {
    fn map_page(&mut self, _vaddr: usize, _paddr: usize) -> bool {
        true
    }
    fn set_user(&self) {}
    fn flush_tlb(&self) {}
    fn can_access(&self, base: usize, len: usize, _: AccessRights) -> bool {
        if len == 0 {
            return true;
        }
        let end = base + len;
        let deny_end = self.deny_base + self.deny_len;
        end <= self.deny_base || base >= deny_end
    }
    fn map_phys(&mut self, _physaddr: usize, _len: usize) -> Option<usize> {
        None
    }
}

/// Timer double that records programming calls.
#[derive(Default)]
pub struct TimerState {
    pub period: Option<u32>,
    pub clears: usize,
}

pub struct SharedTimer(pub Arc<Mutex<TimerState>>);

impl TimerDevice for SharedTimer {
    fn init(&mut self) {}
    fn start_periodic(&mut self, period_ms: u32) {
        self.0.lock().unwrap().period = Some(period_ms);
    }
    fn clear_interrupt(&mut self) {
        self.0.lock().unwrap().clears += 1;
    }
}

pub fn noop(_: usize) {}

/// A booted kernel plus handles on the seam doubles.
pub struct Sim {
    pub kern: Kernel,
    pub ctrl: Arc<Mutex<CtrlState>>,
    pub timer: Arc<Mutex<TimerState>>,
    pub freed_pages: Arc<Mutex<usize>>,
}

pub fn boot() -> Sim {
    boot_with_timer_irq(None)
}

pub fn boot_with_timer_irq(timer_irq: Option<u32>) -> Sim {
    let ctrl = Arc::new(Mutex::new(CtrlState::default()));
    let timer = Arc::new(Mutex::new(TimerState::default()));
    let pages = TestPages::new();
    let freed_pages = pages.freed.clone();
    let kern = startup::init_kernel(Platform {
        pages: Box::new(pages),
        controller: Box::new(SharedController(ctrl.clone())),
        timer: Some(Box::new(SharedTimer(timer.clone()))),
        timer_irq,
    });
    Sim {
        kern,
        ctrl,
        timer,
        freed_pages,
    }
}

impl Sim {
    pub fn with_state<R>(&self, f: impl FnOnce(&mut KernState) -> R) -> R {
        let mut st = self.kern.state.lock();
        f(&mut *st)
    }

    /// Creates a process with one Normal-priority thread and a wide-open
    /// address space.
    pub fn spawn(&self, name: &str, parent: Option<Pid>) -> (Pid, ThreadRef) {
        self.spawn_prio(name, parent, Priority::Normal)
    }

    pub fn spawn_prio(
        &self,
        name: &str,
        parent: Option<Pid>,
        prio: Priority,
    ) -> (Pid, ThreadRef) {
        self.with_state(|ks| {
            let pid =
                process::create(ks, name, parent, Some(Box::new(OpenSpace)))
                    .expect("process creation failed");
            let t = process::add_thread(ks, pid, prio, noop, 0)
                .expect("thread creation failed");
            (pid, t)
        })
    }

    pub fn spawn_with_space(
        &self,
        name: &str,
        space: Box<dyn AddressSpace>,
    ) -> (Pid, ThreadRef) {
        self.with_state(|ks| {
            let pid = process::create(ks, name, None, Some(space))
                .expect("process creation failed");
            let t = process::add_thread(ks, pid, Priority::Normal, noop, 0)
                .expect("thread creation failed");
            (pid, t)
        })
    }

    /// Makes `t` the running thread, the way the dispatcher would before a
    /// syscall.
    pub fn make_current(&self, t: ThreadRef) {
        self.with_state(|ks| {
            ks.ready.remove(t);
            ks.threads.get_mut(t).unwrap().state = SchedState::Running;
            ks.current = Some(t);
        });
    }

    /// Stages and executes a syscall on behalf of `t`.
    pub fn sys(
        &self,
        t: ThreadRef,
        nr: Sysnum,
        args: [usize; 5],
    ) -> SyscallDisposition {
        self.make_current(t);
        self.with_state(|ks| {
            ks.threads
                .get_mut(t)
                .unwrap()
                .save
                .stage_syscall(nr as u32, args);
        });
        syscalls::syscall_entry(&self.kern, t)
    }

    /// Reads back `t`'s syscall return register.
    pub fn ret(&self, t: ThreadRef) -> isize {
        self.with_state(|ks| ks.threads.get(t).unwrap().save.ret)
    }

    pub fn state_of(&self, t: ThreadRef) -> SchedState {
        self.with_state(|ks| ks.threads.get(t).unwrap().state)
    }

    pub fn mgr_thread(&self) -> ThreadRef {
        self.with_state(|ks| {
            *ks.process(abi::PROCMGR_PID).unwrap().threads.first().unwrap()
        })
    }
}
