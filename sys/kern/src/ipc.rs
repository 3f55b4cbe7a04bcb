// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Channels, connections, messages, pulses, and the synchronous IPC state
//! machine.
//!
//! A client thread sends on a *connection*; the message lands on the
//! connection's *channel*; a server thread of the channel's owning process
//! receives it, works, and replies. The sender stays blocked for the whole
//! round trip: `InSend` while the message is queued, `InReply` once a server
//! has picked it up. Payload bytes move directly between the two address
//! spaces -- see `umem` -- and the kernel holds only descriptors.
//!
//! *Pulses* are the asynchronous cousin: fixed-size two-word records
//! appended to a channel's pulse queue. They never block the producer, and
//! receivers always see pending pulses before any queued synchronous
//! message.

use alloc::collections::VecDeque;

use abi::{ChannelId, ConnectionId, Error, MsgId, Pid, Pulse};

use crate::err::{InteractFault, UserError};
use crate::kernel::KernState;
use crate::pool::ObjRef;
use crate::process;
use crate::thread::{
    self, ArchState, NextThread, RecvDest, SchedState, ThreadRef,
};
use crate::umem::{self, VecDesc};

pub type ChanRef = ObjRef<Channel>;
pub type ConnRef = ObjRef<Connection>;
pub type MsgRef = ObjRef<Message>;

/// Bound on pending pulses per channel. Arrivals past this are dropped with
/// a diagnostic; see `pulse_to_channel`.
pub const PULSE_QUEUE_DEPTH: usize = 64;

/// A receive endpoint owned by a process.
///
/// Invariant: at most one of `send_queue`, `recv_queue` is non-empty at any
/// instant.
pub struct Channel {
    pub owner: Pid,
    /// Set once the owner has destroyed its handle (or died); a dead channel
    /// refuses new traffic but lingers until the last connection drops.
    pub dead: bool,
    /// Messages waiting for a server, in send order.
    pub send_queue: VecDeque<MsgRef>,
    /// Server threads blocked in receive, in block order.
    pub recv_queue: VecDeque<ThreadRef>,
    /// Pending pulses, in insertion order.
    pub pulses: heapless::Deque<Pulse, PULSE_QUEUE_DEPTH>,
}

impl Channel {
    fn new(owner: Pid) -> Self {
        Self {
            owner,
            dead: false,
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            pulses: heapless::Deque::new(),
        }
    }
}

/// A client-side binding to exactly one channel; the unit of addressing for
/// sends and pulses.
pub struct Connection {
    pub channel: ChanRef,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MsgState {
    /// Queued on the channel, sender `InSend`.
    Unsent,
    /// Picked up by a server, sender `InReply`, id registered in the
    /// server's pending-message table.
    Delivered,
    /// Completed; the record is moments from deallocation.
    Replied,
    /// The sender died mid-transaction. A server still holding the id sees
    /// its reply turn into a no-op.
    Cancelled,
}

/// A synchronous in-flight request/reply transaction.
pub struct Message {
    /// Sending thread (weak: the sender may die first).
    pub sender: ThreadRef,
    /// Target channel (counted edge).
    pub channel: ChanRef,
    /// Connection the send went through (weak; used to cancel queued
    /// messages when the connection closes).
    pub via: Option<ConnRef>,
    /// The request payload descriptors, in the sender's space.
    pub send_vec: VecDesc,
    /// Where the reply should land, in the sender's space.
    pub reply_vec: VecDesc,
    pub state: MsgState,
    /// Server thread that received this message, once `Delivered`.
    pub receiver: Option<ThreadRef>,
}

/// Outcome of a receive attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecvOutcome {
    /// Something was delivered; the value is the byte count. The message id
    /// (zero for a pulse) went out through the caller's msgid pointer.
    Done(usize),
    /// Nothing pending; the caller is now blocked on the channel.
    Blocked,
}

/// Creates a channel owned by `pid` and installs it in the process's handle
/// table.
pub fn channel_create(
    ks: &mut KernState,
    pid: Pid,
) -> Result<ChannelId, Error> {
    let chan = ks
        .channels
        .insert(Channel::new(pid))
        .ok_or(Error::NoMem)?;
    let proc = match ks.process_mut(pid) {
        Some(p) => p,
        None => {
            let _ = ks.channels.release(chan);
            return Err(Error::Invalid);
        }
    };
    Ok(proc.register_channel(chan))
}

/// Destroys the caller's handle on a channel. Queued messages are completed
/// with `NO_SYS`, blocked receivers are woken with `NO_SYS`, and pending
/// pulses are discarded. Connections still referencing the channel keep the
/// husk alive, but it accepts no new traffic.
pub fn channel_destroy(
    ks: &mut KernState,
    pid: Pid,
    chid: ChannelId,
) -> Result<(), Error> {
    let chan = ks
        .process_mut(pid)
        .ok_or(Error::Invalid)?
        .unregister_channel(chid)
        .ok_or(Error::Invalid)?;
    flush_channel(ks, chan);
    release_channel(ks, chan);
    Ok(())
}

/// Connects the caller to channel `chid` of process `target`.
pub fn connect(
    ks: &mut KernState,
    caller: Pid,
    target: Pid,
    chid: ChannelId,
) -> Result<ConnectionId, Error> {
    let chan = ks
        .process(target)
        .ok_or(Error::Invalid)?
        .lookup_channel(chid)
        .ok_or(Error::Invalid)?;
    if ks.channels.get(chan).map_or(true, |c| c.dead) {
        return Err(Error::Invalid);
    }
    // Connection -> Channel edge.
    ks.channels.retain(chan);
    let conn = match ks.connections.insert(Connection { channel: chan }) {
        Some(c) => c,
        None => {
            release_channel(ks, chan);
            return Err(Error::NoMem);
        }
    };
    let proc = match ks.process_mut(caller) {
        Some(p) => p,
        None => {
            release_connection(ks, conn);
            return Err(Error::Invalid);
        }
    };
    Ok(proc.register_connection(conn))
}

/// Closes a connection handle.
pub fn disconnect(
    ks: &mut KernState,
    pid: Pid,
    coid: ConnectionId,
) -> Result<(), Error> {
    let conn = ks
        .process_mut(pid)
        .ok_or(Error::Invalid)?
        .unregister_connection(coid)
        .ok_or(Error::Invalid)?;
    release_connection(ks, conn);
    Ok(())
}

/// Implementation of the MSGSEND/MSGSENDV primitive.
///
/// On success the sender is left blocked (`InSend` or `InReply`); its return
/// value materializes when the server replies.
pub fn msg_send(
    ks: &mut KernState,
    sender: ThreadRef,
    coid: ConnectionId,
    send: VecDesc,
    reply: VecDesc,
) -> Result<NextThread, UserError> {
    let sender_pid = ks.pid_of(sender).ok_or(Error::Invalid)?;
    let conn = ks
        .process(sender_pid)
        .ok_or(Error::Invalid)?
        .lookup_connection(coid)
        .ok_or(Error::Invalid)?;
    let chan = ks.connections.get(conn).ok_or(Error::Invalid)?.channel;
    match ks.channels.get(chan) {
        Some(c) if !c.dead => (),
        // The server side is gone.
        _ => return Err(Error::NoSys.into()),
    }

    // Message -> Channel edge.
    ks.channels.retain(chan);
    let msg = match ks.messages.insert(Message {
        sender,
        channel: chan,
        via: Some(conn),
        send_vec: send,
        reply_vec: reply,
        state: MsgState::Unsent,
        receiver: None,
    }) {
        Some(m) => m,
        None => {
            release_channel(ks, chan);
            return Err(Error::NoMem.into());
        }
    };

    // Check for a waiting server.
    while let Some(recv) =
        ks.channels.get_mut(chan).unwrap().recv_queue.pop_front()
    {
        if !matches!(
            ks.threads.get(recv).map(|t| t.state),
            Some(SchedState::InRecv(c)) if c == chan
        ) {
            // Stale queue entry; drop it and look again.
            continue;
        }
        match deliver(ks, msg, recv, DeliverTarget::Blocked) {
            Ok(_) => {
                // Delivery succeeded! The sender is now blocked in reply;
                // propose switching directly to the unblocked server.
                return Ok(NextThread::Specific(recv));
            }
            Err(interact) => {
                if let Some(f) = interact.src {
                    // The sender's own descriptors are bogus. The server
                    // stays blocked; the caller's process gets torn down by
                    // the syscall layer.
                    ks.channels
                        .get_mut(chan)
                        .unwrap()
                        .recv_queue
                        .push_front(recv);
                    cancel_message(ks, msg);
                    return Err(UserError::Fault(f));
                }
                if interact.dst.is_some() {
                    // The server's receive buffer is bogus: its process is
                    // aborted, which also unblocks any sibling receivers.
                    // Fall through to queue the message.
                    if let Some(rp) = ks.pid_of(recv) {
                        process::terminate(ks, rp);
                    }
                    break;
                }
            }
        }
    }

    // The receiver teardown above may have killed the channel with it.
    if ks.channels.get(chan).map_or(true, |c| c.dead) {
        cancel_message(ks, msg);
        return Err(Error::NoSys.into());
    }

    // No server available; queue and block.
    ks.channels.get_mut(chan).unwrap().send_queue.push_back(msg);
    ks.threads.get_mut(sender).unwrap().state = SchedState::InSend(chan);
    Ok(NextThread::Other)
}

/// Implementation of the MSGRECEIVE/MSGRECEIVEV primitive.
pub fn msg_receive(
    ks: &mut KernState,
    caller: ThreadRef,
    chid: ChannelId,
    dest: VecDesc,
    msgid_out: Option<usize>,
) -> Result<RecvOutcome, UserError> {
    let pid = ks.pid_of(caller).ok_or(Error::Invalid)?;
    let chan = ks
        .process(pid)
        .ok_or(Error::Invalid)?
        .lookup_channel(chid)
        .ok_or(Error::Invalid)?;

    // Pulses preempt synchronous messages.
    if let Some(p) = ks.channels.get_mut(chan).unwrap().pulses.pop_front() {
        let n = deliver_pulse_to_running(ks, pid, p, dest, msgid_out)
            .map_err(UserError::Fault)?;
        return Ok(RecvOutcome::Done(n));
    }

    loop {
        let msg = ks.channels.get_mut(chan).unwrap().send_queue.pop_front();
        let msg = match msg {
            Some(m) => m,
            None => {
                // Nothing pending: block on the channel.
                let th = ks.threads.get_mut(caller).unwrap();
                th.state = SchedState::InRecv(chan);
                th.recv_dest = Some(RecvDest {
                    desc: dest,
                    msgid_out,
                });
                ks.channels
                    .get_mut(chan)
                    .unwrap()
                    .recv_queue
                    .push_back(caller);
                return Ok(RecvOutcome::Blocked);
            }
        };
        match ks.messages.get(msg).map(|m| m.state) {
            Some(MsgState::Unsent) => (),
            _ => {
                // Cancelled en route; reap the record and look again.
                release_message(ks, msg);
                continue;
            }
        }
        match deliver(
            ks,
            msg,
            caller,
            DeliverTarget::Running { dest, msgid_out },
        ) {
            Ok(n) => return Ok(RecvOutcome::Done(n)),
            Err(interact) => {
                if let Some(f) = interact.dst {
                    // Our caller's buffer is bad. Put the message back where
                    // it was and let the syscall layer abort the caller.
                    ks.channels
                        .get_mut(chan)
                        .unwrap()
                        .send_queue
                        .push_front(msg);
                    return Err(UserError::Fault(f));
                }
                if interact.src.is_some() {
                    // Sender handed us unreadable memory; its process is
                    // aborted (which cancels this message) and the search
                    // continues.
                    let spid = ks
                        .messages
                        .get(msg)
                        .and_then(|m| ks.threads.get(m.sender))
                        .and_then(|t| t.process);
                    if let Some(spid) = spid {
                        process::terminate(ks, spid);
                    } else {
                        cancel_message(ks, msg);
                    }
                }
            }
        }
    }
}

/// Implementation of the MSGREPLY/MSGREPLYV primitive. Returns the number
/// of bytes written into the sender's reply buffer.
pub fn msg_reply(
    ks: &mut KernState,
    caller: ThreadRef,
    msgid: MsgId,
    status: u32,
    src: VecDesc,
) -> Result<usize, UserError> {
    let pid = ks.pid_of(caller).ok_or(Error::Invalid)?;
    let msg = ks
        .process_mut(pid)
        .ok_or(Error::Invalid)?
        .take_message(msgid)
        .ok_or(Error::Invalid)?;

    let (sender, reply_vec, state) = {
        let m = ks.messages.get(msg).expect("pending table held stale msg");
        (m.sender, m.reply_vec, m.state)
    };

    match state {
        MsgState::Delivered => (),
        MsgState::Cancelled => {
            // The client died mid-transaction; replying is a no-op.
            release_message(ks, msg);
            recompute_inherited(ks, caller);
            return Ok(0);
        }
        _ => {
            release_message(ks, msg);
            return Err(Error::Invalid.into());
        }
    }

    let sender_pid = ks.threads.get(sender).and_then(|t| t.process);

    if status == Error::Exiting as u32 {
        // The special exit status: the sender's process is torn down
        // instead of being resumed.
        if let Some(m) = ks.messages.get_mut(msg) {
            m.state = MsgState::Replied;
        }
        release_message(ks, msg);
        recompute_inherited(ks, caller);
        if let Some(spid) = sender_pid {
            process::terminate(ks, spid);
        }
        return Ok(0);
    }

    // Copy the reply payload into the sender's reply buffer.
    let copied = {
        let sp = sender_pid.and_then(|p| ks.process(p));
        let rp = ks.process(pid);
        match (rp, sp) {
            (Some(rp), Some(sp)) => {
                umem::copy_vectored(rp, src, 0, sp, reply_vec)
            }
            // Sender evaporated between checks; treat as no-op reply.
            _ => Ok(0),
        }
    };

    let copied = match copied {
        Ok(n) => n,
        Err(interact) => {
            if let Some(f) = interact.src {
                // The replier's own payload is unreadable: put the
                // transaction back and abort the replier.
                let _ = ks
                    .process_mut(pid)
                    .map(|p| p.reinsert_message(msgid, msg));
                return Err(UserError::Fault(f));
            }
            // The sender's reply buffer is bogus. A buffer fault aborts
            // user space: tear the sender down.
            if let Some(m) = ks.messages.get_mut(msg) {
                m.state = MsgState::Replied;
            }
            release_message(ks, msg);
            recompute_inherited(ks, caller);
            if let Some(spid) = sender_pid {
                process::terminate(ks, spid);
            }
            return Ok(0);
        }
    };

    // Complete the transaction: store the status, ready the sender.
    if let Some(m) = ks.messages.get_mut(msg) {
        m.state = MsgState::Replied;
    }
    let ret = if status == Error::Ok as u32 {
        copied as isize
    } else {
        -(status as isize)
    };
    let sender_alive = match ks.threads.get_mut(sender) {
        Some(th) => {
            uassert!(th.state == SchedState::InReply(msg));
            th.save.set_return(ret);
            true
        }
        None => false,
    };
    if sender_alive {
        ks.ready.enqueue(&mut ks.threads, sender);
    }
    release_message(ks, msg);
    recompute_inherited(ks, caller);
    Ok(copied)
}

/// Implementation of MSGGETLEN: total byte length of a pending message's
/// request payload.
pub fn msg_getlen(
    ks: &mut KernState,
    caller: ThreadRef,
    msgid: MsgId,
) -> Result<usize, UserError> {
    let (send_vec, sender_pid) = pending_message(ks, caller, msgid)?;
    let sp = ks.process(sender_pid).ok_or(Error::NoSys)?;
    umem::total_len(sp, send_vec).map_err(|_| Error::NoSys.into())
}

/// Implementation of MSGREAD/MSGREADV: copies from a pending message's
/// request payload, starting `offset` bytes in, into the caller's buffer.
pub fn msg_read(
    ks: &mut KernState,
    caller: ThreadRef,
    msgid: MsgId,
    offset: usize,
    dest: VecDesc,
) -> Result<usize, UserError> {
    let (send_vec, sender_pid) = pending_message(ks, caller, msgid)?;
    let pid = ks.pid_of(caller).ok_or(Error::Invalid)?;
    let sp = ks.process(sender_pid).ok_or(Error::NoSys)?;
    let dp = ks.process(pid).ok_or(Error::Invalid)?;
    match umem::copy_vectored(sp, send_vec, offset, dp, dest) {
        Ok(n) => Ok(n),
        Err(interact) => {
            if let Some(f) = interact.dst {
                // Caller's own buffer.
                Err(UserError::Fault(f))
            } else {
                // Sender's payload went bad underneath us.
                Err(Error::NoSys.into())
            }
        }
    }
}

/// Looks up a message pending in the caller's process, returning its
/// request vector and the sender's pid.
fn pending_message(
    ks: &KernState,
    caller: ThreadRef,
    msgid: MsgId,
) -> Result<(VecDesc, Pid), UserError> {
    let proc = ks.process_of(caller).ok_or(Error::Invalid)?;
    let msg = proc.lookup_message(msgid).ok_or(Error::Invalid)?;
    let m = ks.messages.get(msg).ok_or(Error::Invalid)?;
    if m.state != MsgState::Delivered {
        return Err(Error::Invalid.into());
    }
    let sender_pid = ks
        .threads
        .get(m.sender)
        .and_then(|t| t.process)
        .ok_or(Error::NoSys)?;
    Ok((m.send_vec, sender_pid))
}

/// Sends a pulse through one of `pid`'s connections. Never blocks.
pub fn send_pulse(
    ks: &mut KernState,
    pid: Pid,
    coid: ConnectionId,
    ptype: i32,
    value: i32,
) -> Result<bool, Error> {
    let conn = ks
        .process(pid)
        .ok_or(Error::Invalid)?
        .lookup_connection(coid)
        .ok_or(Error::Invalid)?;
    let chan = ks.connections.get(conn).ok_or(Error::Invalid)?.channel;
    pulse_to_channel(ks, chan, Pulse { ptype, value })
}

/// Appends `pulse` to `chan`'s queue, readying one blocked receiver if any.
/// Returns whether a receiver was woken (a scheduling hint for the caller).
///
/// If the queue is full the pulse is dropped with a diagnostic rather than
/// blocking the producer; interrupt context cannot wait.
pub fn pulse_to_channel(
    ks: &mut KernState,
    chan: ChanRef,
    pulse: Pulse,
) -> Result<bool, Error> {
    match ks.channels.get(chan) {
        Some(c) if !c.dead => (),
        _ => return Err(Error::NoSys),
    }

    while let Some(recv) =
        ks.channels.get_mut(chan).unwrap().recv_queue.pop_front()
    {
        if !matches!(
            ks.threads.get(recv).map(|t| t.state),
            Some(SchedState::InRecv(c)) if c == chan
        ) {
            continue;
        }
        let rd = ks
            .threads
            .get_mut(recv)
            .unwrap()
            .recv_dest
            .take()
            .expect("InRecv thread without recv_dest");
        let pid = ks.threads.get(recv).unwrap().process;
        let copy = {
            let proc = pid.and_then(|p| ks.process(p));
            match proc {
                Some(proc) => {
                    let mut wire = [0u8; Pulse::WIRE_LEN];
                    pulse.encode(&mut wire);
                    umem::copy_from_kernel(proc, rd.desc, &wire).and_then(
                        |n| {
                            if let Some(out) = rd.msgid_out {
                                umem::write_user(proc, out, 0 as MsgId)?;
                            }
                            Ok(n)
                        },
                    )
                }
                None => Ok(0),
            }
        };
        match copy {
            Ok(n) => {
                ks.threads
                    .get_mut(recv)
                    .unwrap()
                    .save
                    .set_return(n as isize);
                ks.ready.enqueue(&mut ks.threads, recv);
                return Ok(true);
            }
            Err(_) => {
                // Receiver's buffer went bad while it slept. Abort it and
                // offer the pulse to the next receiver.
                if let Some(p) = pid {
                    process::terminate(ks, p);
                }
            }
        }
    }

    let chan_mut = ks.channels.get_mut(chan).unwrap();
    if chan_mut.pulses.push_back(pulse).is_err() {
        klog!(
            "pulse queue overflow on channel of pid {}; dropping type {}",
            chan_mut.owner.0,
            pulse.ptype
        );
        return Err(Error::NoMem);
    }
    Ok(false)
}

/// Delivers a pulse straight to the running caller of receive.
fn deliver_pulse_to_running(
    ks: &KernState,
    pid: Pid,
    pulse: Pulse,
    dest: VecDesc,
    msgid_out: Option<usize>,
) -> Result<usize, crate::err::FaultInfo> {
    let proc = ks.process(pid).ok_or(crate::err::FaultInfo {
        address: 0,
        len: 0,
    })?;
    let mut wire = [0u8; Pulse::WIRE_LEN];
    pulse.encode(&mut wire);
    let n = umem::copy_from_kernel(proc, dest, &wire)?;
    if let Some(out) = msgid_out {
        umem::write_user(proc, out, 0 as MsgId)?;
    }
    Ok(n)
}

/// Who a message is being delivered to.
enum DeliverTarget {
    /// A thread blocked in receive; its destination was stashed when it
    /// blocked, and its return registers need to be written.
    Blocked,
    /// The currently running caller of receive.
    Running {
        dest: VecDesc,
        msgid_out: Option<usize>,
    },
}

/// Transfers a message into a receiver and commits the state transitions:
/// sender to `InReply`, message to `Delivered`, id registered in the
/// receiver's process, priority lent to the receiver.
///
/// On fault, no state transition has happened: a `Blocked` receiver keeps
/// its (restored) receive destination, and the message is untouched. The
/// caller decides who to blame using the returned `InteractFault`.
fn deliver(
    ks: &mut KernState,
    msg: MsgRef,
    receiver: ThreadRef,
    target: DeliverTarget,
) -> Result<usize, InteractFault> {
    let (sender, send_vec) = {
        let m = ks.messages.get(msg).expect("delivering stale message");
        (m.sender, m.send_vec)
    };
    let sender_pid = ks
        .threads
        .get(sender)
        .and_then(|t| t.process)
        .expect("sender without process");
    let receiver_pid = ks
        .threads
        .get(receiver)
        .and_then(|t| t.process)
        .expect("receiver without process");

    let (dest, msgid_out, blocked) = match target {
        DeliverTarget::Running { dest, msgid_out } => {
            (dest, msgid_out, false)
        }
        DeliverTarget::Blocked => {
            let rd = ks
                .threads
                .get_mut(receiver)
                .unwrap()
                .recv_dest
                .take()
                .expect("InRecv thread without recv_dest");
            (rd.desc, rd.msgid_out, true)
        }
    };

    let restore = |ks: &mut KernState| {
        if blocked {
            ks.threads.get_mut(receiver).unwrap().recv_dest =
                Some(RecvDest {
                    desc: dest,
                    msgid_out,
                });
        }
    };

    // The cross-space copy, bounded by the shorter side.
    let copied = {
        let sp = ks.process(sender_pid).expect("sender process vanished");
        let rp = ks
            .process(receiver_pid)
            .expect("receiver process vanished");
        umem::copy_vectored(sp, send_vec, 0, rp, dest)
    };
    let copied = match copied {
        Ok(n) => n,
        Err(f) => {
            restore(ks);
            return Err(f);
        }
    };

    // Register the id and report it to the receiver.
    let msgid = ks
        .process_mut(receiver_pid)
        .unwrap()
        .register_message(msg);
    if let Some(out) = msgid_out {
        let wrote = {
            let rp = ks.process(receiver_pid).unwrap();
            umem::write_user(rp, out, msgid)
        };
        if let Err(f) = wrote {
            let _ = ks
                .process_mut(receiver_pid)
                .unwrap()
                .take_message(msgid);
            restore(ks);
            return Err(InteractFault::in_dst(f));
        }
    }

    // Commit.
    let sender_prio = {
        let m = ks.messages.get_mut(msg).unwrap();
        m.state = MsgState::Delivered;
        m.receiver = Some(receiver);
        ks.threads.get(sender).unwrap().assigned_priority
    };
    ks.threads.get_mut(sender).unwrap().state = SchedState::InReply(msg);
    thread::lend_priority(
        &mut ks.threads,
        &mut ks.ready,
        receiver,
        sender_prio,
    );

    if blocked {
        ks.threads
            .get_mut(receiver)
            .unwrap()
            .save
            .set_return(copied as isize);
        // Put the server at the head of its queue so the dispatcher runs it
        // next, per the direct-handoff discipline.
        ks.ready.enqueue_first(&mut ks.threads, receiver);
    }
    Ok(copied)
}

/// Ceiling-recomputation half of priority inheritance: after a reply, a
/// server's effective priority falls back to the ceiling over the senders
/// of the messages it still holds.
fn recompute_inherited(ks: &mut KernState, t: ThreadRef) {
    let assigned = match ks.threads.get(t) {
        Some(th) => th.assigned_priority,
        None => return,
    };
    let mut ceil = assigned;
    for (_, m) in ks.messages.iter() {
        if m.receiver == Some(t) && m.state == MsgState::Delivered {
            if let Some(s) = ks.threads.get(m.sender) {
                ceil = ceil.ceiling(s.assigned_priority);
            }
        }
    }
    let requeue = {
        let th = ks.threads.get_mut(t).unwrap();
        if th.effective_priority == ceil {
            return;
        }
        th.effective_priority = ceil;
        th.state == SchedState::Ready
    };
    if requeue {
        ks.ready.remove(t);
        ks.threads.get_mut(t).unwrap().state = SchedState::Waiting;
        ks.ready.enqueue(&mut ks.threads, t);
    }
}

/// Completes an unsent message with an error: the sender is readied with
/// the negated code and the record is reclaimed. Safe to call for messages
/// already off their channel's queue.
pub fn complete_unsent_with(ks: &mut KernState, msg: MsgRef, err: Error) {
    let (sender, chan, state) = match ks.messages.get(msg) {
        Some(m) => (m.sender, m.channel, m.state),
        None => return,
    };
    if state == MsgState::Unsent {
        if let Some(c) = ks.channels.get_mut(chan) {
            c.send_queue.retain(|&m2| m2 != msg);
        }
    }
    let wake = match ks.threads.get_mut(sender) {
        Some(th) if th.state == SchedState::InSend(chan) => {
            th.save.set_return(err.as_return());
            true
        }
        _ => false,
    };
    if wake {
        ks.ready.enqueue(&mut ks.threads, sender);
    }
    if let Some(m) = ks.messages.get_mut(msg) {
        m.state = MsgState::Cancelled;
    }
    release_message(ks, msg);
}

/// Cancels a message on behalf of a dying sender. Unsent messages leave
/// their queue and die immediately; delivered ones linger (cancelled) in
/// the server's pending table until the server replies into the void.
pub fn cancel_message(ks: &mut KernState, msg: MsgRef) {
    let (chan, state) = match ks.messages.get(msg) {
        Some(m) => (m.channel, m.state),
        None => return,
    };
    match state {
        MsgState::Unsent => {
            if let Some(c) = ks.channels.get_mut(chan) {
                c.send_queue.retain(|&m2| m2 != msg);
            }
            if let Some(m) = ks.messages.get_mut(msg) {
                m.state = MsgState::Cancelled;
            }
            release_message(ks, msg);
        }
        MsgState::Delivered => {
            if let Some(m) = ks.messages.get_mut(msg) {
                m.state = MsgState::Cancelled;
            }
            // The server's table still holds the reference; its reply will
            // reap the record.
        }
        _ => (),
    }
}

/// Drops one reference to a message, running disposal on the last one.
pub fn release_message(ks: &mut KernState, msg: MsgRef) {
    if let Some(m) = ks.messages.release(msg) {
        release_channel(ks, m.channel);
    }
}

/// Drops one reference to a connection. Final release cancels this
/// connection's still-unreceived messages and drops its channel edge.
pub fn release_connection(ks: &mut KernState, conn: ConnRef) {
    if let Some(c) = ks.connections.release(conn) {
        let victims = ks.messages.refs_where(|m| {
            m.via == Some(conn) && m.state == MsgState::Unsent
        });
        for v in victims {
            complete_unsent_with(ks, v, Error::NoSys);
        }
        release_channel(ks, c.channel);
    }
}

/// Drops one reference to a channel; the value simply evaporates on final
/// release because `flush_channel` has already emptied a dead channel's
/// queues by then.
pub fn release_channel(ks: &mut KernState, chan: ChanRef) {
    if let Some(c) = ks.channels.release(chan) {
        uassert!(c.send_queue.is_empty());
        uassert!(c.recv_queue.is_empty());
    }
}

/// Marks a channel dead and flushes it: queued messages complete with
/// `NO_SYS`, blocked receivers wake with `NO_SYS`, pulses are discarded.
pub fn flush_channel(ks: &mut KernState, chan: ChanRef) {
    let (sends, recvs) = match ks.channels.get_mut(chan) {
        Some(c) => {
            c.dead = true;
            while c.pulses.pop_front().is_some() {}
            (
                core::mem::take(&mut c.send_queue),
                core::mem::take(&mut c.recv_queue),
            )
        }
        None => return,
    };
    for m in sends {
        complete_unsent_with(ks, m, Error::NoSys);
    }
    for r in recvs {
        let wake = match ks.threads.get_mut(r) {
            Some(th) if th.state == SchedState::InRecv(chan) => {
                th.recv_dest = None;
                th.save.set_return(Error::NoSys.as_return());
                true
            }
            _ => false,
        };
        if wake {
            ks.ready.enqueue(&mut ks.threads, r);
        }
    }
}
