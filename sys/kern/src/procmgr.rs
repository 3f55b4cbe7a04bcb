// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process manager: an in-kernel server holding the well-known channel
//! every process can reach at connection id 1.
//!
//! Requests are `abi::ProcMgrRequest` records; the first word of each is
//! the operation tag. Dispatch goes through an explicit handler registry
//! populated at boot by `register_default_handlers` -- a handler is looked
//! up by tag, deserializes the payload with `ssmarshal`, does its work, and
//! replies. Unknown or unregistered tags reply `NO_SYS`; short or mangled
//! payloads reply `INVALID`.

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use abi::{
    Error, MsgId, Pid, ProcMgrRequest, Pulse, PROCMGR_PID,
    PULSE_TYPE_CHILD_FINISH,
};

use crate::interrupt;
use crate::ipc;
use crate::kernel::KernState;
use crate::process;
use crate::sync::IrqSpinlock;
use crate::thread::{SchedState, ThreadRef};
use crate::umem::VecDesc;

/// Period of the preemption tick the manager starts at boot, in
/// milliseconds.
pub const PREEMPT_TICK_MS: u32 = 5;

/// Number of operation tags, for sizing the registry.
pub const OP_COUNT: usize = 9;

/// A request as seen by an operation handler.
pub struct Request<'a> {
    pub msgid: MsgId,
    /// Raw received bytes, tag word included.
    pub data: &'a [u8],
    /// The process the request came from.
    pub sender_pid: Pid,
}

pub type OpHandler = fn(&mut KernState, &Request<'_>);

static HANDLERS: IrqSpinlock<[Option<OpHandler>; OP_COUNT]> =
    IrqSpinlock::new([None; OP_COUNT]);

/// Installs a handler for an operation tag.
pub fn register_handler(tag: u32, f: OpHandler) {
    let mut table = HANDLERS.lock();
    if let Some(slot) = table.get_mut(tag as usize) {
        *slot = Some(f);
    }
}

/// Populates the registry with the stock operations. Called at boot.
pub fn register_default_handlers() {
    register_handler(0, op_exit);
    register_handler(1, op_signal);
    register_handler(2, op_getpid);
    register_handler(3, op_interrupt_attach);
    register_handler(4, op_interrupt_detach);
    register_handler(5, op_interrupt_complete);
    register_handler(6, op_map_phys);
    register_handler(7, op_child_wait_attach);
    register_handler(8, op_child_wait_detach);
}

/// The manager's own thread, which is the replier for every request.
fn manager_thread(ks: &KernState) -> ThreadRef {
    *ks.process(PROCMGR_PID)
        .expect("no manager process")
        .threads
        .first()
        .expect("manager has no thread")
}

/// Replies to `msgid` with a bare status and no payload.
fn reply_status(ks: &mut KernState, msgid: MsgId, status: Error) {
    let me = manager_thread(ks);
    let _ = ipc::msg_reply(ks, me, msgid, status as u32, VecDesc::flat(0, 0));
}

/// Replies to `msgid` with `OK` and a serialized payload.
fn reply_payload<T: Serialize>(ks: &mut KernState, msgid: MsgId, val: &T) {
    let mut buf = [0u8; abi::PROCMGR_MSG_BUF_LEN];
    let n = match ssmarshal::serialize(&mut buf, val) {
        Ok(n) => n,
        Err(_) => {
            reply_status(ks, msgid, Error::Invalid);
            return;
        }
    };
    let me = manager_thread(ks);
    let _ = ipc::msg_reply(
        ks,
        me,
        msgid,
        Error::Ok as u32,
        VecDesc::flat(buf.as_ptr() as usize, n),
    );
}

/// Dispatches one received synchronous message.
pub fn dispatch_message(ks: &mut KernState, msgid: MsgId, data: &[u8]) {
    if data.len() < 4 {
        reply_status(ks, msgid, Error::NoSys);
        return;
    }
    let tag = LittleEndian::read_u32(&data[0..4]);
    let handler = HANDLERS
        .lock()
        .get(tag as usize)
        .copied()
        .flatten();
    let handler = match handler {
        Some(f) => f,
        None => {
            reply_status(ks, msgid, Error::NoSys);
            return;
        }
    };

    let sender_pid = {
        let msg = ks
            .process(PROCMGR_PID)
            .and_then(|p| p.lookup_message(msgid));
        let sender = msg
            .and_then(|m| ks.messages.get(m))
            .map(|m| m.sender);
        sender
            .and_then(|s| ks.threads.get(s))
            .and_then(|t| t.process)
    };
    let sender_pid = match sender_pid {
        Some(p) => p,
        None => {
            reply_status(ks, msgid, Error::NoSys);
            return;
        }
    };

    handler(
        ks,
        &Request {
            msgid,
            data,
            sender_pid,
        },
    );
}

/// Handles a pulse from the manager's queue. Returns `false` if the pulse
/// is not yet actionable (the terminee's thread hasn't finished) and should
/// be retried after a yield.
pub fn handle_pulse(ks: &mut KernState, pulse: Pulse) -> bool {
    if pulse.ptype != PULSE_TYPE_CHILD_FINISH {
        return true;
    }
    let pid = Pid(pulse.value);

    // Make sure the terminee is completely done executing before we let
    // the parent (or its reaper) observe the death.
    let finished = match ks.process(pid) {
        None => return true,
        Some(p) => p.threads.iter().all(|&t| {
            matches!(
                ks.threads.get(t).map(|x| x.state),
                Some(SchedState::Finished) | None
            )
        }),
    };
    if !finished {
        return false;
    }
    process::report_child_finished(ks, pid);
    true
}

fn parse(req: &Request<'_>) -> Option<ProcMgrRequest> {
    ssmarshal::deserialize::<ProcMgrRequest>(req.data)
        .ok()
        .map(|(m, _)| m)
}

/// Handler for `ProcMgrRequest::Exit`.
///
/// The reply carries the `EXITING` status, which the reply path turns into
/// teardown of the sender.
fn op_exit(ks: &mut KernState, req: &Request<'_>) {
    reply_status(ks, req.msgid, Error::Exiting);
}

/// Handler for `ProcMgrRequest::Signal`.
fn op_signal(ks: &mut KernState, req: &Request<'_>) {
    let pid = match parse(req) {
        Some(ProcMgrRequest::Signal { pid }) => pid,
        _ => {
            reply_status(ks, req.msgid, Error::Invalid);
            return;
        }
    };
    if pid == req.sender_pid {
        reply_status(ks, req.msgid, Error::Exiting);
    } else {
        // Remote signal is not implemented.
        reply_status(ks, req.msgid, Error::Invalid);
    }
}

/// Handler for `ProcMgrRequest::Getpid`.
fn op_getpid(ks: &mut KernState, req: &Request<'_>) {
    let pid = req.sender_pid;
    reply_payload(ks, req.msgid, &abi::GetpidReply { pid });
}

/// Handler for `ProcMgrRequest::InterruptAttach`.
fn op_interrupt_attach(ks: &mut KernState, req: &Request<'_>) {
    let (coid, irq, param) = match parse(req) {
        Some(ProcMgrRequest::InterruptAttach { coid, irq, param }) => {
            (coid, irq, param)
        }
        _ => {
            reply_status(ks, req.msgid, Error::Invalid);
            return;
        }
    };
    match interrupt::attach(ks, req.sender_pid, coid, irq, param) {
        Ok(id) => {
            reply_payload(ks, req.msgid, &abi::InterruptAttachReply { id })
        }
        Err(e) => reply_status(ks, req.msgid, e),
    }
}

/// Handler for `ProcMgrRequest::InterruptDetach`.
fn op_interrupt_detach(ks: &mut KernState, req: &Request<'_>) {
    let id = match parse(req) {
        Some(ProcMgrRequest::InterruptDetach { id }) => id,
        _ => {
            reply_status(ks, req.msgid, Error::Invalid);
            return;
        }
    };
    match interrupt::detach(ks, req.sender_pid, id) {
        Ok(()) => reply_status(ks, req.msgid, Error::Ok),
        Err(e) => reply_status(ks, req.msgid, e),
    }
}

/// Handler for `ProcMgrRequest::InterruptComplete`.
fn op_interrupt_complete(ks: &mut KernState, req: &Request<'_>) {
    let id = match parse(req) {
        Some(ProcMgrRequest::InterruptComplete { id }) => id,
        _ => {
            reply_status(ks, req.msgid, Error::Invalid);
            return;
        }
    };
    match interrupt::complete(ks, req.sender_pid, id) {
        Ok(()) => reply_status(ks, req.msgid, Error::Ok),
        Err(e) => reply_status(ks, req.msgid, e),
    }
}

/// Handler for `ProcMgrRequest::MapPhys`.
fn op_map_phys(ks: &mut KernState, req: &Request<'_>) {
    let (physaddr, len) = match parse(req) {
        Some(ProcMgrRequest::MapPhys { physaddr, len }) => (physaddr, len),
        _ => {
            reply_status(ks, req.msgid, Error::Invalid);
            return;
        }
    };
    let mapped = ks
        .process_mut(req.sender_pid)
        .and_then(|p| p.aspace.as_mut())
        .and_then(|a| a.map_phys(physaddr as usize, len as usize));
    match mapped {
        Some(vaddr) => reply_payload(
            ks,
            req.msgid,
            &abi::MapPhysReply {
                vaddr: vaddr as u32,
            },
        ),
        None => reply_status(ks, req.msgid, Error::NoMem),
    }
}

/// Handler for `ProcMgrRequest::ChildWaitAttach`.
fn op_child_wait_attach(ks: &mut KernState, req: &Request<'_>) {
    let (pid, count, coid) = match parse(req) {
        Some(ProcMgrRequest::ChildWaitAttach { pid, count, coid }) => {
            (pid, count, coid)
        }
        _ => {
            reply_status(ks, req.msgid, Error::Invalid);
            return;
        }
    };
    let filter = if pid.0 < 0 { None } else { Some(pid) };
    match process::register_reaper(ks, req.sender_pid, filter, count, coid) {
        Ok(id) => {
            reply_payload(ks, req.msgid, &abi::ChildWaitAttachReply { id })
        }
        Err(e) => reply_status(ks, req.msgid, e),
    }
}

/// Handler for `ProcMgrRequest::ChildWaitDetach`.
fn op_child_wait_detach(ks: &mut KernState, req: &Request<'_>) {
    let id = match parse(req) {
        Some(ProcMgrRequest::ChildWaitDetach { id }) => id,
        _ => {
            reply_status(ks, req.msgid, Error::Invalid);
            return;
        }
    };
    let removed = ks
        .process_mut(req.sender_pid)
        .map(|p| p.remove_reaper(id))
        .unwrap_or(false);
    reply_status(
        ks,
        req.msgid,
        if removed { Error::Ok } else { Error::Invalid },
    );
}

/// Body of the manager's kernel thread on real hardware: start the
/// preemption tick, then serve the channel forever.
#[cfg(target_os = "none")]
pub fn manager_entry(_: usize) {
    let kern = crate::arch::kernel();
    {
        let mut st = kern.state.lock();
        crate::time::start_periodic(&mut *st, PREEMPT_TICK_MS);
    }

    loop {
        let mut buf = [0u8; abi::PROCMGR_MSG_BUF_LEN];
        let mut msgid: MsgId = 0;

        let received = {
            let mut st = kern.state.lock();
            let ks = &mut *st;
            let me = manager_thread(ks);
            ipc::msg_receive(
                ks,
                me,
                abi::FIRST_CHANNEL_ID,
                VecDesc::flat(buf.as_mut_ptr() as usize, buf.len()),
                Some(core::ptr::addr_of_mut!(msgid) as usize),
            )
        };
        let n = match received {
            Ok(ipc::RecvOutcome::Done(n)) => n,
            Ok(ipc::RecvOutcome::Blocked) => {
                crate::arch::reschedule(false);
                // Resumed: the delivery wrote our return register.
                let mut st = kern.state.lock();
                let ks = &mut *st;
                let me = manager_thread(ks);
                ks.threads.get(me).unwrap().save.registers
                    [crate::arch::REGISTER_INDEX_ARG0]
                    as usize
            }
            Err(_) => panic!("manager receive failed"),
        };

        if msgid == 0 {
            let p = match Pulse::decode(&buf[..n]) {
                Some(p) => p,
                None => continue,
            };
            // The terminee may still be on its way down; yield until its
            // thread has actually finished.
            loop {
                let done = {
                    let mut st = kern.state.lock();
                    handle_pulse(&mut *st, p)
                };
                if done {
                    break;
                }
                crate::arch::reschedule(true);
            }
        } else {
            let mut st = kern.state.lock();
            dispatch_message(&mut *st, msgid, &buf[..n]);
        }
    }
}

/// Under simulation the manager thread never runs; the tests drive
/// `dispatch_message` and `handle_pulse` directly.
#[cfg(not(target_os = "none"))]
pub fn manager_entry(_: usize) {}
