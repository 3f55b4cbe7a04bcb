// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted (simulation/test) architecture support.
//!
//! On a development machine there is no user mode and no interrupt
//! controller; "kernel entry" is a test staging arguments into a thread's
//! `SavedState` and calling the dispatcher, and "return to user" is the
//! test reading the return register back out. Interrupt masking is a
//! no-op because nothing asynchronous exists.

macro_rules! klog {
    ($($tt:tt)*) => {
        eprintln!($($tt)*)
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

use crate::thread::ArchState;

/// On the simulator, the register file is just the syscall in/out record.
#[derive(Debug, Default)]
pub struct SavedState {
    pub nr: u32,
    pub args: [usize; 5],
    pub ret: isize,
}

impl ArchState for SavedState {
    fn syscall_number(&self) -> u32 {
        self.nr
    }

    fn arg0(&self) -> usize {
        self.args[0]
    }
    fn arg1(&self) -> usize {
        self.args[1]
    }
    fn arg2(&self) -> usize {
        self.args[2]
    }
    fn arg3(&self) -> usize {
        self.args[3]
    }
    fn arg4(&self) -> usize {
        self.args[4]
    }

    fn set_return(&mut self, v: isize) {
        self.ret = v;
    }

    fn stage_syscall(&mut self, nr: u32, args: [usize; 5]) {
        self.nr = nr;
        self.args = args;
        self.ret = 0;
    }
}

/// Saved interrupt state. Nothing to save on the host.
#[derive(Copy, Clone, Debug)]
pub struct IrqSave(());

pub fn disable_interrupts() -> IrqSave {
    IrqSave(())
}

pub fn restore_interrupts(_: IrqSave) {}

/// Threads don't execute on the host; there is nothing to prepare.
pub fn prepare_thread(
    _save: &mut SavedState,
    _entry: fn(usize),
    _param: usize,
    _stack_top: usize,
) {
}
