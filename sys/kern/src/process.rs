// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of processes.
//!
//! A process is a pid, a name, an (optional) address space, and a set of id
//! tables mapping small per-process integers to kernel objects: channels,
//! connections, pending received messages, interrupt-handler records, and
//! reapers. Id namespaces are per-process and allocated monotonically;
//! connection id 1 is pre-wired to the process manager in every process but
//! the manager itself.
//!
//! Termination replaces cancellation in this system: `terminate` walks every
//! table, completes or cancels every in-flight transaction, and leaves a
//! zombie record that the manager reaps after notifying the parent.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use abi::{
    ChannelId, ConnectionId, Error, HandlerId, MsgId, Pid, Priority,
    ReaperId, FIRST_CHANNEL_ID, FIRST_CONNECTION_ID, INIT_PID,
    PROCMGR_CONNECTION_ID, PROCMGR_PID, PULSE_TYPE_CHILD_FINISH,
};

use crate::interrupt::{self, IhRef};
use crate::ipc::{self, ChanRef, ConnRef, MsgRef, MsgState};
use crate::kernel::KernState;
use crate::thread::{self, ArchState, SchedState, ThreadRef};
use crate::umem::MemAccess;
use crate::vm::{AccessRights, AddressSpace};

/// A parent's subscription to child-termination notifications.
#[derive(Debug)]
pub struct Reaper {
    pub id: ReaperId,
    /// Which child pids this subscription handles; `None` means any child.
    pub filter: Option<Pid>,
    /// How many children it will still reap.
    pub count: u32,
    /// Connection (in the parent's table) to emit the pulse on.
    pub coid: ConnectionId,
}

impl Reaper {
    pub fn handles(&self, child: Pid) -> bool {
        match self.filter {
            None => true,
            Some(p) => p == child,
        }
    }
}

pub struct Process {
    pid: Pid,
    name: heapless::String<32>,
    /// Page tables; `None` for the manager, which runs purely in kernel
    /// space and passes every access check.
    pub aspace: Option<Box<dyn AddressSpace>>,
    /// Set once `terminate` has run; a dead process is a zombie awaiting
    /// reap and refuses new activity.
    pub dead: bool,

    channels: BTreeMap<ChannelId, ChanRef>,
    connections: BTreeMap<ConnectionId, ConnRef>,
    messages: BTreeMap<MsgId, MsgRef>,
    handlers: BTreeMap<HandlerId, IhRef>,
    reapers: Vec<Reaper>,

    next_chid: ChannelId,
    next_coid: ConnectionId,
    next_msgid: MsgId,
    next_handler_id: HandlerId,
    next_reaper_id: ReaperId,

    pub parent: Option<Pid>,
    pub alive_children: Vec<Pid>,
    pub dead_children: Vec<Pid>,

    /// This process's threads; index 0 is the initial thread.
    pub threads: Vec<ThreadRef>,
}

impl Process {
    fn new(
        pid: Pid,
        name: &str,
        parent: Option<Pid>,
        aspace: Option<Box<dyn AddressSpace>>,
    ) -> Self {
        let mut comm = heapless::String::new();
        for ch in name.chars().take(31) {
            let _ = comm.push(ch);
        }
        Self {
            pid,
            name: comm,
            aspace,
            dead: false,
            channels: BTreeMap::new(),
            connections: BTreeMap::new(),
            messages: BTreeMap::new(),
            handlers: BTreeMap::new(),
            reapers: Vec::new(),
            next_chid: FIRST_CHANNEL_ID,
            next_coid: FIRST_CONNECTION_ID,
            next_msgid: 1,
            next_handler_id: 1,
            next_reaper_id: 1,
            parent,
            alive_children: Vec::new(),
            dead_children: Vec::new(),
            threads: Vec::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_channel(&mut self, c: ChanRef) -> ChannelId {
        let id = self.next_chid;
        self.next_chid += 1;
        self.channels.insert(id, c);
        id
    }

    pub fn unregister_channel(&mut self, id: ChannelId) -> Option<ChanRef> {
        self.channels.remove(&id)
    }

    pub fn lookup_channel(&self, id: ChannelId) -> Option<ChanRef> {
        self.channels.get(&id).copied()
    }

    pub fn register_connection(&mut self, c: ConnRef) -> ConnectionId {
        let id = self.next_coid;
        self.next_coid += 1;
        self.connections.insert(id, c);
        id
    }

    pub fn unregister_connection(
        &mut self,
        id: ConnectionId,
    ) -> Option<ConnRef> {
        self.connections.remove(&id)
    }

    pub fn lookup_connection(&self, id: ConnectionId) -> Option<ConnRef> {
        self.connections.get(&id).copied()
    }

    pub fn register_message(&mut self, m: MsgRef) -> MsgId {
        let id = self.next_msgid;
        self.next_msgid += 1;
        self.messages.insert(id, m);
        id
    }

    pub fn take_message(&mut self, id: MsgId) -> Option<MsgRef> {
        self.messages.remove(&id)
    }

    pub fn reinsert_message(&mut self, id: MsgId, m: MsgRef) {
        self.messages.insert(id, m);
    }

    pub fn lookup_message(&self, id: MsgId) -> Option<MsgRef> {
        self.messages.get(&id).copied()
    }

    pub fn pending_message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn register_handler(&mut self, h: IhRef) -> HandlerId {
        let id = self.next_handler_id;
        self.next_handler_id += 1;
        self.handlers.insert(id, h);
        id
    }

    pub fn unregister_handler(&mut self, id: HandlerId) -> Option<IhRef> {
        self.handlers.remove(&id)
    }

    pub fn lookup_handler(&self, id: HandlerId) -> Option<IhRef> {
        self.handlers.get(&id).copied()
    }

    pub fn add_reaper(
        &mut self,
        filter: Option<Pid>,
        count: u32,
        coid: ConnectionId,
    ) -> ReaperId {
        let id = self.next_reaper_id;
        self.next_reaper_id += 1;
        self.reapers.push(Reaper {
            id,
            filter,
            count,
            coid,
        });
        id
    }

    pub fn remove_reaper(&mut self, id: ReaperId) -> bool {
        let before = self.reapers.len();
        self.reapers.retain(|r| r.id != id);
        self.reapers.len() != before
    }

    fn reaper_for(&self, child: Pid) -> Option<(ReaperId, ConnectionId)> {
        self.reapers
            .iter()
            .find(|r| r.handles(child) && r.count > 0)
            .map(|r| (r.id, r.coid))
    }

    fn consume_reaper_slot(&mut self, id: ReaperId) {
        if let Some(r) = self.reapers.iter_mut().find(|r| r.id == id) {
            r.count -= 1;
        }
    }
}

impl MemAccess for Process {
    fn can_access(
        &self,
        base: usize,
        len: usize,
        rights: AccessRights,
    ) -> bool {
        match &self.aspace {
            // Kernel-space process: all of memory is its memory.
            None => true,
            Some(a) => a.can_access(base, len, rights),
        }
    }
}

/// Creates a process and registers it in the pid map. Every process other
/// than the manager gets connection id 1 wired to the manager's channel.
pub fn create(
    ks: &mut KernState,
    name: &str,
    parent: Option<Pid>,
    aspace: Option<Box<dyn AddressSpace>>,
) -> Result<Pid, Error> {
    let pid = ks.take_pid();
    ks.processes
        .insert(pid, Process::new(pid, name, parent, aspace));
    if let Some(par) = parent {
        if let Some(pp) = ks.process_mut(par) {
            pp.alive_children.push(pid);
        }
    }
    if pid != PROCMGR_PID {
        let coid = ipc::connect(ks, pid, PROCMGR_PID, FIRST_CHANNEL_ID)?;
        uassert!(coid == PROCMGR_CONNECTION_ID);
    }
    Ok(pid)
}

/// Adds a thread to `pid`, allocating its stack from the installed page
/// source. Returns `None` if no page (or pool slot) was available.
pub fn add_thread(
    ks: &mut KernState,
    pid: Pid,
    priority: Priority,
    entry: fn(usize),
    param: usize,
) -> Option<ThreadRef> {
    let t = match ks.pages {
        Some(ref mut pages) => thread::create(
            &mut ks.threads,
            &mut ks.ready,
            pages.as_mut(),
            Some(pid),
            priority,
            entry,
            param,
        )?,
        None => return None,
    };
    ks.process_mut(pid)?.threads.push(t);
    Some(t)
}

/// Tears a process down: every in-flight transaction it owns is completed
/// or cancelled, its objects are disposed, its threads finish, and the
/// manager is notified with a `CHILD_FINISH` pulse. The zombie process
/// record stays in the pid map until the manager reaps it.
///
/// Teardown is best-effort and cannot fail; resources that already went
/// away are silently absorbed.
pub fn terminate(ks: &mut KernState, pid: Pid) {
    // The manager does not die.
    if pid == PROCMGR_PID {
        return;
    }

    let (channels, connections, messages, handlers, threads, alive, dead) = {
        let p = match ks.process_mut(pid) {
            Some(p) if !p.dead => p,
            _ => return,
        };
        p.dead = true;
        p.reapers.clear();
        (
            core::mem::take(&mut p.channels),
            core::mem::take(&mut p.connections),
            core::mem::take(&mut p.messages),
            core::mem::take(&mut p.handlers),
            p.threads.clone(),
            core::mem::take(&mut p.alive_children),
            core::mem::take(&mut p.dead_children),
        )
    };

    // Children are reparented to init.
    for child in alive {
        if let Some(c) = ks.process_mut(child) {
            c.parent = Some(INIT_PID);
        }
        if let Some(init) = ks.process_mut(INIT_PID) {
            init.alive_children.push(child);
        }
    }
    for child in dead {
        if let Some(c) = ks.process_mut(child) {
            c.parent = Some(INIT_PID);
        }
        if let Some(init) = ks.process_mut(INIT_PID) {
            init.dead_children.push(child);
        }
        try_reap_one(ks, INIT_PID, child);
    }

    // Unlink and finish every thread first, so queue flushes below don't
    // wake the dead.
    for t in threads {
        unlink_thread(ks, t);
    }

    // Connections go next; final release cancels their queued messages.
    for (_, conn) in connections {
        ipc::release_connection(ks, conn);
    }

    // Channels: flush queues, then drop the owner's handle edge.
    for (_, chan) in channels {
        ipc::flush_channel(ks, chan);
        ipc::release_channel(ks, chan);
    }

    // Messages this process had received but not yet replied to: answer
    // NO_SYS so the senders unblock.
    for (_, msg) in messages {
        complete_received_with_nosys(ks, msg);
    }

    // Interrupt handlers detach from their lines.
    for (_, h) in handlers {
        interrupt::detach_record(ks, h);
    }

    // Let the manager know, so it can sequence the parent notification.
    let mgr_chan = ks
        .process(PROCMGR_PID)
        .and_then(|p| p.lookup_channel(FIRST_CHANNEL_ID));
    if let Some(chan) = mgr_chan {
        let _ = ipc::pulse_to_channel(
            ks,
            chan,
            abi::Pulse {
                ptype: PULSE_TYPE_CHILD_FINISH,
                value: pid.0,
            },
        );
    }
}

/// Completes a message sitting in a dead receiver's pending table: the
/// sender unblocks with `NO_SYS`.
fn complete_received_with_nosys(ks: &mut KernState, msg: MsgRef) {
    let (sender, state) = match ks.messages.get(msg) {
        Some(m) => (m.sender, m.state),
        None => return,
    };
    if state == MsgState::Delivered {
        let wake = match ks.threads.get_mut(sender) {
            Some(th) if th.state == SchedState::InReply(msg) => {
                th.save.set_return(Error::NoSys.as_return());
                true
            }
            _ => false,
        };
        if wake {
            ks.ready.enqueue(&mut ks.threads, sender);
        }
    }
    if let Some(m) = ks.messages.get_mut(msg) {
        m.state = MsgState::Replied;
    }
    ipc::release_message(ks, msg);
}

/// Removes a thread from whatever it is linked into and marks it Finished.
fn unlink_thread(ks: &mut KernState, t: ThreadRef) {
    let state = match ks.threads.get(t) {
        Some(th) => th.state,
        None => return,
    };
    match state {
        SchedState::Ready => ks.ready.remove(t),
        SchedState::InRecv(chan) => {
            if let Some(c) = ks.channels.get_mut(chan) {
                c.recv_queue.retain(|&r| r != t);
            }
        }
        SchedState::InSend(_) | SchedState::InReply(_) => {
            let mine = ks.messages.refs_where(|m| {
                m.sender == t
                    && matches!(
                        m.state,
                        MsgState::Unsent | MsgState::Delivered
                    )
            });
            for m in mine {
                ipc::cancel_message(ks, m);
            }
        }
        SchedState::Running
        | SchedState::Waiting
        | SchedState::Finished => (),
    }
    let joiner = {
        let th = ks.threads.get_mut(t).unwrap();
        th.state = SchedState::Finished;
        th.recv_dest = None;
        th.joiner.take()
    };
    if let Some(j) = joiner {
        if matches!(
            ks.threads.get(j).map(|x| x.state),
            Some(SchedState::Waiting)
        ) {
            ks.ready.enqueue(&mut ks.threads, j);
        }
    }
}

/// Manager-side bookkeeping once a terminated process's thread has reached
/// `Finished`: move the child to the parent's dead list and run a matching
/// reaper, if any.
pub fn report_child_finished(ks: &mut KernState, child: Pid) {
    let parent = match ks.process(child).and_then(|p| p.parent) {
        Some(p) => p,
        None => return,
    };
    let reap = {
        let pp = match ks.process_mut(parent) {
            Some(pp) => pp,
            None => return,
        };
        pp.alive_children.retain(|&c| c != child);
        if !pp.dead_children.contains(&child) {
            pp.dead_children.push(child);
        }
        pp.reaper_for(child)
    };
    if let Some((rid, coid)) = reap {
        if let Some(pp) = ks.process_mut(parent) {
            pp.consume_reaper_slot(rid);
        }
        reap_child(ks, parent, child, coid);
    }
}

/// Registers a child-wait subscription for `parent` and immediately reaps
/// any already-dead matching children against its count.
pub fn register_reaper(
    ks: &mut KernState,
    parent: Pid,
    filter: Option<Pid>,
    count: u32,
    coid: ConnectionId,
) -> Result<ReaperId, Error> {
    let id = {
        let pp = ks.process_mut(parent).ok_or(Error::Invalid)?;
        if pp.lookup_connection(coid).is_none() {
            return Err(Error::Invalid);
        }
        pp.add_reaper(filter, count, coid)
    };
    // Children that died before the subscription existed count too.
    let dead: Vec<Pid> = ks
        .process(parent)
        .map(|p| p.dead_children.clone())
        .unwrap_or_default();
    for child in dead {
        try_reap_one(ks, parent, child);
    }
    Ok(id)
}

fn try_reap_one(ks: &mut KernState, parent: Pid, child: Pid) {
    let reap = ks.process(parent).and_then(|p| p.reaper_for(child));
    if let Some((rid, coid)) = reap {
        if let Some(pp) = ks.process_mut(parent) {
            pp.consume_reaper_slot(rid);
        }
        reap_child(ks, parent, child, coid);
    }
}

/// Final disposal of a dead child: the pid stops resolving, thread stacks
/// go back to the page pool, and the parent's subscription connection gets
/// the `CHILD_FINISH` pulse.
fn reap_child(
    ks: &mut KernState,
    parent: Pid,
    child: Pid,
    coid: ConnectionId,
) {
    if let Some(pp) = ks.process_mut(parent) {
        pp.dead_children.retain(|&c| c != child);
    }
    if let Some(zombie) = ks.processes.remove(&child) {
        for t in zombie.threads {
            reclaim_thread(ks, t);
        }
    }
    let _ =
        ipc::send_pulse(ks, parent, coid, PULSE_TYPE_CHILD_FINISH, child.0);
}

/// Reclaims a Finished thread: its pool slot and its stack page.
pub fn reclaim_thread(ks: &mut KernState, t: ThreadRef) {
    if let Some(th) = ks.threads.get(t) {
        uassert!(th.state == SchedState::Finished);
    }
    if let Some(th) = ks.threads.release(t) {
        if let (Some(page), Some(pages)) = (th.stack, ks.pages.as_mut()) {
            pages.free(page);
        }
    }
}
