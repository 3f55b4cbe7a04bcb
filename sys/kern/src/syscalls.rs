// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! This builds on architecture-specific parts defined in the `arch::*`
//! modules: by the time `syscall_entry` runs, the caller's arguments are
//! staged in its `SavedState` and its number is readable there too.
//!
//! # Syscall implementations
//!
//! Each syscall is implemented by a function with the signature:
//!
//! ```ignore
//! fn syscall(ks: &mut KernState, caller: ThreadRef) -> Result<Completion, UserError>;
//! ```
//!
//! A `Completion` either carries the value to return or records that the
//! caller blocked (in which case its return value materializes later, when
//! a server replies or the channel dies). A `UserError` is either returned
//! as a negated response code or, for buffer faults, tears the calling
//! process down -- the kernel never aborts user space on a mere protocol
//! error, only on a detected fault.

use abi::{Error, Sysnum};

use crate::err::UserError;
use crate::ipc::{self, RecvOutcome};
use crate::kernel::{Kernel, KernState};
use crate::process;
use crate::thread::{ArchState, NextThread, ThreadRef};

/// What the arch layer should do with the caller after a syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallDisposition {
    /// Return to the caller; its return register is set.
    Resume,
    /// The caller blocked; run somebody else (the hint may name whom).
    CallerBlocked(NextThread),
    /// The calling process was torn down; there is nothing to return to.
    CallerDied,
}

/// Result of a syscall implementation that did not error.
enum Completion {
    Value(isize),
    Blocked(NextThread),
}

/// Entry point accessed by the arch-specific entry sequence (and driven
/// directly by the simulation).
pub fn syscall_entry(kern: &Kernel, caller: ThreadRef) -> SyscallDisposition {
    let mut st = kern.state.lock();
    let ks = &mut *st;

    let nr = match ks.threads.get(caller) {
        Some(t) => t.save.syscall_number(),
        None => return SyscallDisposition::Resume,
    };

    match dispatch(ks, caller, nr) {
        Ok(Completion::Value(v)) => {
            if let Some(t) = ks.threads.get_mut(caller) {
                t.save.set_return(v);
            }
            SyscallDisposition::Resume
        }
        Ok(Completion::Blocked(hint)) => {
            SyscallDisposition::CallerBlocked(hint)
        }
        Err(UserError::Recoverable(Error::Exiting)) => {
            // The internal sentinel: tear the caller down instead of
            // returning.
            if let Some(pid) = ks.pid_of(caller) {
                process::terminate(ks, pid);
            }
            SyscallDisposition::CallerDied
        }
        Err(UserError::Recoverable(e)) => {
            if let Some(t) = ks.threads.get_mut(caller) {
                t.save.set_return(e.as_return());
            }
            SyscallDisposition::Resume
        }
        Err(UserError::Fault(f)) => {
            // A detected buffer fault aborts the errant process.
            klog!(
                "fault in syscall {:#x}: {:#x}+{:#x}",
                nr,
                f.address,
                f.len
            );
            if let Some(pid) = ks.pid_of(caller) {
                process::terminate(ks, pid);
            }
            SyscallDisposition::CallerDied
        }
    }
}

fn dispatch(
    ks: &mut KernState,
    caller: ThreadRef,
    nr: u32,
) -> Result<Completion, UserError> {
    match Sysnum::try_from(nr) {
        Ok(Sysnum::ChannelCreate) => channel_create(ks, caller),
        Ok(Sysnum::ChannelDestroy) => channel_destroy(ks, caller),
        Ok(Sysnum::Connect) => connect(ks, caller),
        Ok(Sysnum::Disconnect) => disconnect(ks, caller),
        Ok(Sysnum::MsgSend) => msg_send(ks, caller, false),
        Ok(Sysnum::MsgSendV) => msg_send(ks, caller, true),
        Ok(Sysnum::MsgReceive) => msg_receive(ks, caller, false),
        Ok(Sysnum::MsgReceiveV) => msg_receive(ks, caller, true),
        Ok(Sysnum::MsgReply) => msg_reply(ks, caller, false),
        Ok(Sysnum::MsgReplyV) => msg_reply(ks, caller, true),
        Ok(Sysnum::MsgGetLen) => msg_getlen(ks, caller),
        Ok(Sysnum::MsgRead) => msg_read(ks, caller, false),
        Ok(Sysnum::MsgReadV) => msg_read(ks, caller, true),
        // Unknown number: not implemented.
        Err(_) => Err(Error::NoSys.into()),
    }
}

fn caller_pid(
    ks: &KernState,
    caller: ThreadRef,
) -> Result<abi::Pid, UserError> {
    ks.pid_of(caller).ok_or_else(|| Error::Invalid.into())
}

fn channel_create(
    ks: &mut KernState,
    caller: ThreadRef,
) -> Result<Completion, UserError> {
    let pid = caller_pid(ks, caller)?;
    let chid = ipc::channel_create(ks, pid)?;
    Ok(Completion::Value(chid as isize))
}

fn channel_destroy(
    ks: &mut KernState,
    caller: ThreadRef,
) -> Result<Completion, UserError> {
    let pid = caller_pid(ks, caller)?;
    let chid = ks.threads.get(caller).unwrap().save.arg0() as i32;
    ipc::channel_destroy(ks, pid, chid)?;
    Ok(Completion::Value(0))
}

fn connect(
    ks: &mut KernState,
    caller: ThreadRef,
) -> Result<Completion, UserError> {
    let pid = caller_pid(ks, caller)?;
    let (target, chid) = {
        let args = ks.threads.get(caller).unwrap().save.as_connect_args();
        (args.pid(), args.chid())
    };
    let coid = ipc::connect(ks, pid, target, chid)?;
    Ok(Completion::Value(coid as isize))
}

fn disconnect(
    ks: &mut KernState,
    caller: ThreadRef,
) -> Result<Completion, UserError> {
    let pid = caller_pid(ks, caller)?;
    let coid = ks.threads.get(caller).unwrap().save.arg0() as i32;
    ipc::disconnect(ks, pid, coid)?;
    Ok(Completion::Value(0))
}

fn msg_send(
    ks: &mut KernState,
    caller: ThreadRef,
    vectored: bool,
) -> Result<Completion, UserError> {
    let (coid, send, reply) = {
        let args = ks.threads.get(caller).unwrap().save.as_send_args();
        if vectored {
            (args.coid(), args.request_vec(), args.reply_vec())
        } else {
            (args.coid(), args.request(), args.reply_buffer())
        }
    };
    let hint = ipc::msg_send(ks, caller, coid, send, reply)?;
    Ok(Completion::Blocked(hint))
}

fn msg_receive(
    ks: &mut KernState,
    caller: ThreadRef,
    vectored: bool,
) -> Result<Completion, UserError> {
    let (chid, dest, msgid_out) = {
        let args = ks.threads.get(caller).unwrap().save.as_recv_args();
        let dest = if vectored {
            args.buffer_vec()
        } else {
            args.buffer()
        };
        (args.chid(), dest, args.msgid_out())
    };
    match ipc::msg_receive(ks, caller, chid, dest, msgid_out)? {
        RecvOutcome::Done(n) => Ok(Completion::Value(n as isize)),
        RecvOutcome::Blocked => Ok(Completion::Blocked(NextThread::Other)),
    }
}

fn msg_reply(
    ks: &mut KernState,
    caller: ThreadRef,
    vectored: bool,
) -> Result<Completion, UserError> {
    let (msgid, status, payload) = {
        let args = ks.threads.get(caller).unwrap().save.as_reply_args();
        let payload = if vectored {
            args.payload_vec()
        } else {
            args.payload()
        };
        (args.msgid(), args.status(), payload)
    };
    let n = ipc::msg_reply(ks, caller, msgid, status, payload)?;
    Ok(Completion::Value(n as isize))
}

fn msg_getlen(
    ks: &mut KernState,
    caller: ThreadRef,
) -> Result<Completion, UserError> {
    let msgid = ks.threads.get(caller).unwrap().save.arg0() as i32;
    let n = ipc::msg_getlen(ks, caller, msgid)?;
    Ok(Completion::Value(n as isize))
}

fn msg_read(
    ks: &mut KernState,
    caller: ThreadRef,
    vectored: bool,
) -> Result<Completion, UserError> {
    let (msgid, offset, dest) = {
        let args = ks.threads.get(caller).unwrap().save.as_read_args();
        let dest = if vectored {
            args.buffer_vec()
        } else {
            args.buffer()
        };
        (args.msgid(), args.offset(), dest)
    };
    let n = ipc::msg_read(ks, caller, msgid, offset, dest)?;
    Ok(Completion::Value(n as isize))
}
