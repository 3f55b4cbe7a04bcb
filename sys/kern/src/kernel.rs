// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel root object.
//!
//! Everything mutable in the kernel hangs off one `Kernel`: the thread pool
//! and ready queues, the pid map, the IPC object pools, and the interrupt
//! dispatch tables. The whole state sits behind a single IRQ-disabling
//! spinlock; on a uniprocessor that is exactly the atomicity the original
//! design bought with its per-structure locks, without the lock-ordering
//! rules. Nothing holds the lock across a yield or a user-space copy fault
//! boundary that could re-enter.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use abi::Pid;

use crate::interrupt::IrqState;
use crate::ipc::{Channel, Connection, Message};
use crate::pool::Pool;
use crate::process::Process;
use crate::sync::IrqSpinlock;
use crate::thread::{ReadyQueues, Thread, ThreadRef};
use crate::time::TimerDevice;
use crate::vm::PageSource;

pub struct Kernel {
    pub state: IrqSpinlock<KernState>,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            state: IrqSpinlock::new(KernState::new()),
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KernState {
    pub threads: Pool<Thread>,
    pub ready: ReadyQueues,
    /// Thread currently on the processor. Maintained by the dispatcher (the
    /// context-switch path on hardware; tests set it directly).
    pub current: Option<ThreadRef>,
    pub processes: BTreeMap<Pid, Process>,
    next_pid: i32,
    pub channels: Pool<Channel>,
    pub connections: Pool<Connection>,
    pub messages: Pool<Message>,
    pub irq: IrqState,
    /// Physical page allocator, installed at boot.
    pub pages: Option<Box<dyn PageSource>>,
    /// The system timer driver, if the platform wired one up.
    pub timer: Option<Box<dyn TimerDevice>>,
}

impl KernState {
    pub fn new() -> Self {
        Self {
            threads: Pool::new(),
            ready: ReadyQueues::new(),
            current: None,
            processes: BTreeMap::new(),
            next_pid: abi::PROCMGR_PID.0,
            channels: Pool::new(),
            connections: Pool::new(),
            messages: Pool::new(),
            irq: IrqState::new(),
            pages: None,
            timer: None,
        }
    }

    /// Allocates the next monotonic pid.
    pub fn take_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// Resolves the process a thread belongs to.
    pub fn process_of(&self, t: ThreadRef) -> Option<&Process> {
        let pid = self.threads.get(t)?.process?;
        self.processes.get(&pid)
    }

    /// Pid of the process a thread belongs to.
    pub fn pid_of(&self, t: ThreadRef) -> Option<Pid> {
        self.threads.get(t)?.process
    }
}

impl Default for KernState {
    fn default() -> Self {
        Self::new()
    }
}
