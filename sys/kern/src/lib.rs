// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Microkernel core: threads, synchronous message passing, pulses, and
//! interrupt dispatch for single-processor ARMv6-class hardware.
//!
//! The code outside the `arch` module is portable: it builds and runs
//! hosted (with std) so the scheduler and the whole IPC state machine can
//! be exercised by ordinary tests, and `no_std` on the real target, where
//! `arch::arm_v6` supplies the context switch and exception plumbing.
//!
//! # Design notes
//!
//! 1. A strong preference for safe code where reasonable; `unsafe` is
//!    confined to the user-memory transfer primitives and the arch layer.
//! 2. Simple, clear algorithms over fast, clever ones. Object tables are
//!    generational arenas and queues are plain deques; nothing here is
//!    proud of its asymptotics.
//! 3. External hardware (MMU, page allocator, interrupt controller, timer,
//!    serial) stays behind traits, which is also what makes the hosted
//!    build honest rather than a pile of stubs.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
pub mod arch;

pub mod err;
pub mod fail;
pub mod interrupt;
pub mod ipc;
pub mod kernel;
pub mod pool;
pub mod process;
pub mod procmgr;
pub mod startup;
pub mod sync;
pub mod syscalls;
pub mod thread;
pub mod time;
pub mod umem;
pub mod vm;
