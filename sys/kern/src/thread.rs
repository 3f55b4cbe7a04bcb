// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of threads and the ready queues.
//!
//! Threads are the only schedulable unit. Each one owns a single-page kernel
//! stack (allocated from the external page source) and a saved register
//! file; everything else the scheduler needs lives in the `Thread` record in
//! the thread pool.
//!
//! Scheduling is strict priority with FIFO within a priority: one ready
//! queue per priority class, and the dispatcher always takes the head of the
//! most important non-empty queue.

use core::sync::atomic::{AtomicBool, Ordering};

use abi::{ChannelId, ConnectionId, MsgId, Pid, Priority};

use crate::ipc::{Channel, Message};
use crate::pool::{ObjRef, Pool};
use crate::umem::VecDesc;
use crate::vm::{Page, PageSource, PAGE_SIZE};

pub type ThreadRef = ObjRef<Thread>;

/// Scheduling state of a thread.
///
/// The queue-linkage invariant: a thread is in a ready queue iff its state
/// is `Ready`, and in a channel's receive queue iff its state is `InRecv`
/// naming that channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedState {
    /// Eligible to run; linked in exactly one ready queue.
    Ready,
    /// Currently executing on the processor.
    Running,
    /// Blocked delivering a message; the message sits on the channel's send
    /// queue.
    InSend(ObjRef<Channel>),
    /// Message delivered; blocked awaiting the server's reply.
    InReply(ObjRef<Message>),
    /// Blocked waiting for messages or pulses on the channel.
    InRecv(ObjRef<Channel>),
    /// Blocked on a kernel synchronization primitive (semaphore, barrier,
    /// join). Not reachable from user code.
    Waiting,
    /// Done executing; stack reclaimable once joined or reaped.
    Finished,
}

/// Where a receive-blocked thread wants its next delivery to land.
#[derive(Copy, Clone, Debug)]
pub struct RecvDest {
    pub desc: VecDesc,
    /// User address to store the message id (0 for a pulse) through, if the
    /// caller supplied one.
    pub msgid_out: Option<usize>,
}

/// Internal representation of a thread.
#[derive(Debug)]
pub struct Thread {
    /// Saved machine state of the thread.
    pub save: crate::arch::SavedState,
    /// Kernel stack page, if dynamically allocated. The boot thread runs on
    /// a static stack and has `None` here.
    pub stack: Option<Page>,
    /// State used to make status and scheduling decisions.
    pub state: SchedState,
    /// Owning process; `None` for bare kernel threads.
    pub process: Option<Pid>,
    /// "Natural" priority of this thread.
    pub assigned_priority: Priority,
    /// Ceiling of the priorities of all threads blocked on this one.
    pub effective_priority: Priority,
    /// Thread that will wait for and reap this one.
    pub joiner: Option<ThreadRef>,
    /// Receive destination, valid while `InRecv`.
    pub recv_dest: Option<RecvDest>,
}

impl Thread {
    /// The priority used for queue selection: a thread runs at the more
    /// important of its assigned and inherited priorities.
    pub fn run_priority(&self) -> Priority {
        self.assigned_priority.ceiling(self.effective_priority)
    }

    pub fn is_runnable(&self) -> bool {
        self.state == SchedState::Ready
    }
}

/// The pair of ready queues, one per priority class.
#[derive(Debug, Default)]
pub struct ReadyQueues {
    normal: alloc::collections::VecDeque<ThreadRef>,
    io: alloc::collections::VecDeque<ThreadRef>,
}

impl ReadyQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_for(&mut self, prio: Priority) -> &mut alloc::collections::VecDeque<ThreadRef> {
        match prio {
            Priority::Io => &mut self.io,
            Priority::Normal => &mut self.normal,
        }
    }

    /// Appends `t` to the tail of its priority's queue and marks it Ready.
    pub fn enqueue(&mut self, threads: &mut Pool<Thread>, t: ThreadRef) {
        let prio = {
            let th = threads.get_mut(t).expect("enqueue of stale thread");
            uassert!(th.state != SchedState::Ready);
            th.state = SchedState::Ready;
            th.run_priority()
        };
        self.queue_for(prio).push_back(t);
    }

    /// Prepends `t` to the head of its priority's queue and marks it Ready.
    pub fn enqueue_first(&mut self, threads: &mut Pool<Thread>, t: ThreadRef) {
        let prio = {
            let th = threads.get_mut(t).expect("enqueue of stale thread");
            uassert!(th.state != SchedState::Ready);
            th.state = SchedState::Ready;
            th.run_priority()
        };
        self.queue_for(prio).push_front(t);
    }

    /// Pops the most important runnable thread: the head of the IO queue if
    /// any, else the head of the Normal queue. The returned thread remains
    /// `Ready` until the dispatcher marks it `Running`.
    pub fn dequeue(&mut self) -> Option<ThreadRef> {
        self.io.pop_front().or_else(|| self.normal.pop_front())
    }

    /// Unlinks `t` wherever it is queued. Used when a thread's effective
    /// priority changes or its process dies.
    pub fn remove(&mut self, t: ThreadRef) {
        self.io.retain(|&x| x != t);
        self.normal.retain(|&x| x != t);
    }

    pub fn contains(&self, t: ThreadRef) -> bool {
        self.io.contains(&t) || self.normal.contains(&t)
    }

    pub fn is_empty(&self) -> bool {
        self.io.is_empty() && self.normal.is_empty()
    }
}

/// Creates a thread, allocating its single-page kernel stack from `pages`.
///
/// Returns `None` if the stack page cannot be allocated. The new thread is
/// left `Ready` and enqueued.
pub fn create(
    threads: &mut Pool<Thread>,
    ready: &mut ReadyQueues,
    pages: &mut dyn PageSource,
    process: Option<Pid>,
    priority: Priority,
    entry: fn(usize),
    param: usize,
) -> Option<ThreadRef> {
    let stack = pages.alloc()?;

    let mut save = crate::arch::SavedState::default();
    crate::arch::prepare_thread(
        &mut save,
        entry,
        param,
        stack.base_address + PAGE_SIZE,
    );

    let t = threads.insert(Thread {
        save,
        stack: Some(stack),
        state: SchedState::Finished, // placeholder; enqueue sets Ready
        process,
        assigned_priority: priority,
        effective_priority: priority,
        joiner: None,
        recv_dest: None,
    });
    let t = t?;
    ready.enqueue(threads, t);
    Some(t)
}

/// Raises `target`'s effective priority to at least `prio` (priority
/// inheritance). If the target is Ready it is re-enqueued so it sorts into
/// the right queue.
pub fn lend_priority(
    threads: &mut Pool<Thread>,
    ready: &mut ReadyQueues,
    target: ThreadRef,
    prio: Priority,
) {
    let needs_requeue = {
        let th = match threads.get_mut(target) {
            Some(th) => th,
            None => return,
        };
        if !prio.is_more_important_than(th.effective_priority) {
            return;
        }
        th.effective_priority = prio;
        th.state == SchedState::Ready
    };
    if needs_requeue {
        ready.remove(target);
        // Transiently off-queue while we re-sort it.
        threads.get_mut(target).unwrap().state = SchedState::Waiting;
        ready.enqueue(threads, target);
    }
}

/// Return value for operations that can have scheduling implications. This
/// is marked `must_use` because forgetting to actually update the scheduler
/// after performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextThread {
    /// It's fine to keep running whatever thread we were just running.
    Same,
    /// We need to switch, but this routine has not concluded who should now
    /// run. The scheduler needs to figure it out.
    Other,
    /// We need to switch, and we already know who should run next. This is
    /// an optimization available in certain IPC cases.
    Specific(ThreadRef),
}

impl NextThread {
    pub fn combine(self, other: Self) -> Self {
        use NextThread::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific recommendations that *don't* agree get downgraded.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            (Same, Same) => Same,
        }
    }
}

/// Set by interrupt handlers when something has happened that makes the
/// scheduler need to re-run at the next syscall return.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

pub fn set_need_resched() {
    NEED_RESCHED.store(true, Ordering::Relaxed);
}

/// Atomically observes and clears the need-resched flag.
pub fn reset_need_resched() -> bool {
    NEED_RESCHED.swap(false, Ordering::Relaxed)
}

//
// Syscall argument proxies.
//
// Arguments to syscalls are read from the calling thread's saved register
// file. Each class of syscall has an *argument proxy* type assigning names
// and types to the raw argument registers, e.g. `t.save.as_send_args()`.
//

/// Interface implemented by the `arch::SavedState` types. Gives
/// architecture-independent access to the syscall registers.
pub trait ArchState: Default {
    /// Reads the syscall number.
    fn syscall_number(&self) -> u32;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> usize;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> usize;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> usize;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> usize;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> usize;

    /// Writes the syscall return register.
    fn set_return(&mut self, v: isize);

    /// Stages a syscall into the register file, as the user-mode stub (or a
    /// kernel thread, or a test) would.
    fn stage_syscall(&mut self, nr: u32, args: [usize; 5]);

    /// Returns a proxied reference naming the CONNECT arguments.
    fn as_connect_args(&self) -> AsConnectArgs<&Self> {
        AsConnectArgs(self)
    }

    /// Returns a proxied reference naming the MSGSEND/MSGSENDV arguments.
    fn as_send_args(&self) -> AsSendArgs<&Self> {
        AsSendArgs(self)
    }

    /// Returns a proxied reference naming the MSGRECEIVE/MSGRECEIVEV
    /// arguments.
    fn as_recv_args(&self) -> AsRecvArgs<&Self> {
        AsRecvArgs(self)
    }

    /// Returns a proxied reference naming the MSGREPLY/MSGREPLYV arguments.
    fn as_reply_args(&self) -> AsReplyArgs<&Self> {
        AsReplyArgs(self)
    }

    /// Returns a proxied reference naming the MSGREAD/MSGREADV arguments.
    fn as_read_args(&self) -> AsReadArgs<&Self> {
        AsReadArgs(self)
    }
}

/// Reference proxy for CONNECT argument registers.
pub struct AsConnectArgs<T>(T);

impl<'a, T: ArchState> AsConnectArgs<&'a T> {
    /// Pid owning the channel the caller wants to reach.
    pub fn pid(&self) -> Pid {
        Pid(self.0.arg0() as i32)
    }

    /// Channel id within that process.
    pub fn chid(&self) -> ChannelId {
        self.0.arg1() as ChannelId
    }
}

/// Reference proxy for MSGSEND/MSGSENDV argument registers.
pub struct AsSendArgs<T>(T);

impl<'a, T: ArchState> AsSendArgs<&'a T> {
    /// Connection the message is addressed to.
    pub fn coid(&self) -> ConnectionId {
        self.0.arg0() as ConnectionId
    }

    /// The request payload, for the flat form.
    pub fn request(&self) -> VecDesc {
        VecDesc::flat(self.0.arg1(), self.0.arg2())
    }

    /// The reply buffer, for the flat form.
    pub fn reply_buffer(&self) -> VecDesc {
        VecDesc::flat(self.0.arg3(), self.0.arg4())
    }

    /// The request vector, for the vectored form.
    pub fn request_vec(&self) -> VecDesc {
        VecDesc::User {
            base: self.0.arg1(),
            count: self.0.arg2(),
        }
    }

    /// The reply vector, for the vectored form.
    pub fn reply_vec(&self) -> VecDesc {
        VecDesc::User {
            base: self.0.arg3(),
            count: self.0.arg4(),
        }
    }
}

/// Reference proxy for MSGRECEIVE/MSGRECEIVEV argument registers.
pub struct AsRecvArgs<T>(T);

impl<'a, T: ArchState> AsRecvArgs<&'a T> {
    /// Channel to receive on.
    pub fn chid(&self) -> ChannelId {
        self.0.arg0() as ChannelId
    }

    /// User address to store the delivered message id through; null means
    /// the caller doesn't want it.
    pub fn msgid_out(&self) -> Option<usize> {
        match self.0.arg1() {
            0 => None,
            p => Some(p),
        }
    }

    /// Receive buffer, flat form.
    pub fn buffer(&self) -> VecDesc {
        VecDesc::flat(self.0.arg2(), self.0.arg3())
    }

    /// Receive vector, vectored form.
    pub fn buffer_vec(&self) -> VecDesc {
        VecDesc::User {
            base: self.0.arg2(),
            count: self.0.arg3(),
        }
    }
}

/// Reference proxy for MSGREPLY/MSGREPLYV argument registers.
pub struct AsReplyArgs<T>(T);

impl<'a, T: ArchState> AsReplyArgs<&'a T> {
    /// Message being replied to.
    pub fn msgid(&self) -> MsgId {
        self.0.arg0() as MsgId
    }

    /// Status code to complete the sender with.
    pub fn status(&self) -> u32 {
        self.0.arg1() as u32
    }

    /// Reply payload, flat form.
    pub fn payload(&self) -> VecDesc {
        VecDesc::flat(self.0.arg2(), self.0.arg3())
    }

    /// Reply vector, vectored form.
    pub fn payload_vec(&self) -> VecDesc {
        VecDesc::User {
            base: self.0.arg2(),
            count: self.0.arg3(),
        }
    }
}

/// Reference proxy for MSGREAD/MSGREADV argument registers.
pub struct AsReadArgs<T>(T);

impl<'a, T: ArchState> AsReadArgs<&'a T> {
    /// Message whose request payload is being read.
    pub fn msgid(&self) -> MsgId {
        self.0.arg0() as MsgId
    }

    /// Byte offset into the request payload.
    pub fn offset(&self) -> usize {
        self.0.arg1()
    }

    /// Destination buffer, flat form.
    pub fn buffer(&self) -> VecDesc {
        VecDesc::flat(self.0.arg2(), self.0.arg3())
    }

    /// Destination vector, vectored form.
    pub fn buffer_vec(&self) -> VecDesc {
        VecDesc::User {
            base: self.0.arg2(),
            count: self.0.arg3(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SavedState;

    struct NoPages;
    impl PageSource for NoPages {
        fn alloc(&mut self) -> Option<Page> {
            None
        }
        fn free(&mut self, _: Page) {}
    }

    struct FakePages(usize);
    impl PageSource for FakePages {
        fn alloc(&mut self) -> Option<Page> {
            self.0 += PAGE_SIZE;
            Some(Page {
                base_address: self.0,
            })
        }
        fn free(&mut self, _: Page) {}
    }

    fn idle(_: usize) {}

    #[test]
    fn create_fails_without_stack_page() {
        let mut threads = Pool::new();
        let mut ready = ReadyQueues::new();
        let t = create(
            &mut threads,
            &mut ready,
            &mut NoPages,
            None,
            Priority::Normal,
            idle,
            0,
        );
        assert!(t.is_none());
        assert_eq!(threads.live(), 0);
    }

    #[test]
    fn io_queue_preempts_normal_and_fifo_within_class() {
        let mut threads = Pool::new();
        let mut ready = ReadyQueues::new();
        let mut pages = FakePages(0);

        let n1 = create(&mut threads, &mut ready, &mut pages, None, Priority::Normal, idle, 0).unwrap();
        let n2 = create(&mut threads, &mut ready, &mut pages, None, Priority::Normal, idle, 0).unwrap();
        let i1 = create(&mut threads, &mut ready, &mut pages, None, Priority::Io, idle, 0).unwrap();

        assert_eq!(ready.dequeue(), Some(i1));
        assert_eq!(ready.dequeue(), Some(n1));
        assert_eq!(ready.dequeue(), Some(n2));
        assert_eq!(ready.dequeue(), None);
    }

    #[test]
    fn ready_linkage_matches_state() {
        let mut threads = Pool::new();
        let mut ready = ReadyQueues::new();
        let mut pages = FakePages(0);
        let t = create(&mut threads, &mut ready, &mut pages, None, Priority::Normal, idle, 0).unwrap();

        assert!(ready.contains(t));
        assert_eq!(threads.get(t).unwrap().state, SchedState::Ready);

        let got = ready.dequeue().unwrap();
        assert_eq!(got, t);
        threads.get_mut(t).unwrap().state = SchedState::Running;
        assert!(!ready.contains(t));
    }

    #[test]
    fn lending_priority_requeues_ready_thread() {
        let mut threads = Pool::new();
        let mut ready = ReadyQueues::new();
        let mut pages = FakePages(0);

        let victim = create(&mut threads, &mut ready, &mut pages, None, Priority::Normal, idle, 0).unwrap();
        let other = create(&mut threads, &mut ready, &mut pages, None, Priority::Normal, idle, 0).unwrap();

        lend_priority(&mut threads, &mut ready, victim, Priority::Io);

        // The boosted thread now dispatches ahead of its class peer.
        assert_eq!(ready.dequeue(), Some(victim));
        assert_eq!(ready.dequeue(), Some(other));
        assert_eq!(
            threads.get(victim).unwrap().effective_priority,
            Priority::Io
        );
    }

    #[test]
    fn need_resched_latches_until_reset() {
        assert!(!reset_need_resched());
        set_need_resched();
        assert!(reset_need_resched());
        assert!(!reset_need_resched());
    }

    #[test]
    fn staged_args_read_back_through_proxies() {
        let mut save = SavedState::default();
        save.stage_syscall(abi::Sysnum::MsgSend as u32, [3, 0x1000, 6, 0x2000, 8]);
        let args = save.as_send_args();
        assert_eq!(args.coid(), 3);
        let req = args.request();
        match req {
            VecDesc::Flat(iov) => {
                assert_eq!(iov.base, 0x1000);
                assert_eq!(iov.len, 6);
            }
            _ => panic!(),
        }
    }
}
