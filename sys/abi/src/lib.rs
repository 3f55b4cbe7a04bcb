// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and user programs.
//!
//! Everything in here is part of the contract with user code: error codes,
//! syscall numbers, the pulse wire layout, I/O vector descriptors, and the
//! process-manager message protocol. Kernel-internal types (thread and object
//! arenas, queues, etc.) deliberately do not appear here.

#![no_std]

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Process identifier. Pids are allocated monotonically at process creation
/// and are never reused within a boot.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Pid(pub i32);

/// The process manager holds the lowest pid.
pub const PROCMGR_PID: Pid = Pid(0);

/// Pid of the init process, which inherits orphaned children.
pub const INIT_PID: Pid = Pid(1);

/// Channel identifiers are small integers scoped to the owning process.
pub type ChannelId = i32;

/// Connection identifiers are small integers scoped to the owning process.
pub type ConnectionId = i32;

/// Message identifiers name a received-but-unreplied message within the
/// receiving process.
pub type MsgId = i32;

/// Interrupt-handler record identifier, scoped to the owning process.
pub type HandlerId = i32;

/// Reaper (child-wait subscription) identifier, scoped to the owning process.
pub type ReaperId = i32;

/// First channel id handed out by a process. The process manager's sole
/// channel always has this id.
pub const FIRST_CHANNEL_ID: ChannelId = 1;

/// First connection id handed out by a process. In every process other than
/// the manager itself, this connection is pre-wired to the process manager's
/// channel.
pub const FIRST_CONNECTION_ID: ConnectionId = 1;

/// Alias making the procmgr wiring explicit at call sites.
pub const PROCMGR_CONNECTION_ID: ConnectionId = FIRST_CONNECTION_ID;

/// Scheduling priority of a thread.
///
/// There are exactly two priority classes; `Io` is more important than
/// `Normal`. This type deliberately does not implement `Ord`, to keep us from
/// confusing "numerically greater" with "more important" at call sites --
/// use `is_more_important_than` and `ceiling`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum Priority {
    #[default]
    Normal = 0,
    Io = 1,
}

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        (self as u8) > (other as u8)
    }

    /// Returns the more important of the two priorities.
    pub fn ceiling(self, other: Self) -> Self {
        if other.is_more_important_than(self) {
            other
        } else {
            self
        }
    }
}

/// Error codes shared across the syscall boundary.
///
/// Syscalls indicate failure by returning the negated code; `Ok` is zero and
/// never appears negated. `Exiting` is a kernel-internal sentinel used on the
/// syscall return path to trigger process teardown, and is never surfaced to
/// user code as a literal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Error {
    Ok = 0,
    /// Addressed party terminated, or call not implemented.
    NoSys = 1,
    /// Invalid handle/id or malformed request.
    Invalid = 2,
    /// Allocation exhaustion.
    NoMem = 3,
    /// Memory fault during a user-buffer copy.
    Fault = 4,
    /// Internal sentinel: the calling process must be torn down.
    Exiting = 5,
}

impl Error {
    /// Encodes this error as a syscall return value.
    pub fn as_return(self) -> isize {
        -(self as u32 as isize)
    }
}

/// Syscalls are numbered from here, in the order of the `Sysnum` variants;
/// renumbering is an ABI break.
pub const SYS_BASE: u32 = 0x100;

/// Enumeration of syscall numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    ChannelCreate = SYS_BASE,
    ChannelDestroy = SYS_BASE + 1,
    Connect = SYS_BASE + 2,
    Disconnect = SYS_BASE + 3,
    MsgSend = SYS_BASE + 4,
    MsgSendV = SYS_BASE + 5,
    MsgReceive = SYS_BASE + 6,
    MsgReceiveV = SYS_BASE + 7,
    MsgReply = SYS_BASE + 8,
    MsgReplyV = SYS_BASE + 9,
    MsgGetLen = SYS_BASE + 10,
    MsgRead = SYS_BASE + 11,
    MsgReadV = SYS_BASE + 12,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of a derive
/// because the ABI crate doesn't otherwise need `num-traits` and this seems
/// okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        match x.wrapping_sub(SYS_BASE) {
            0 => Ok(Self::ChannelCreate),
            1 => Ok(Self::ChannelDestroy),
            2 => Ok(Self::Connect),
            3 => Ok(Self::Disconnect),
            4 => Ok(Self::MsgSend),
            5 => Ok(Self::MsgSendV),
            6 => Ok(Self::MsgReceive),
            7 => Ok(Self::MsgReceiveV),
            8 => Ok(Self::MsgReply),
            9 => Ok(Self::MsgReplyV),
            10 => Ok(Self::MsgGetLen),
            11 => Ok(Self::MsgRead),
            12 => Ok(Self::MsgReadV),
            _ => Err(()),
        }
    }
}

/// One fragment of a vectored message buffer: a base address and a length in
/// bytes, in the owning process's address space.
///
/// At `msgsendv`/`msgreceivev`/`msgreplyv`, the caller gives us the base and
/// length of an array it *claims* contains structs of this type; the kernel
/// validates access before walking it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct IoVec {
    pub base: usize,
    pub len: usize,
}

/// An asynchronous, non-blocking two-word record delivered to a channel.
///
/// Both words are 32 bits, little-endian on the wire.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, FromZeroes, FromBytes, AsBytes,
)]
#[repr(C)]
pub struct Pulse {
    pub ptype: i32,
    pub value: i32,
}

/// Pulse delivered for each hardware interrupt a process has attached to;
/// `value` carries the caller-supplied scalar from the attach call.
pub const PULSE_TYPE_IRQ: i32 = 1;

/// Pulse delivered when a child process has finished; `value` carries the
/// child's pid.
pub const PULSE_TYPE_CHILD_FINISH: i32 = 2;

impl Pulse {
    pub const WIRE_LEN: usize = 8;

    /// Encodes the pulse into `buf` in wire order.
    ///
    /// # Panics
    ///
    /// If `buf` is shorter than `WIRE_LEN`.
    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(&mut buf[0..4], self.ptype);
        LittleEndian::write_i32(&mut buf[4..8], self.value);
    }

    /// Decodes a pulse from wire order. Returns `None` if `buf` is short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Pulse {
            ptype: LittleEndian::read_i32(&buf[0..4]),
            value: LittleEndian::read_i32(&buf[4..8]),
        })
    }
}

/// Requests understood by the process manager.
///
/// The wire format is the `ssmarshal` encoding of this enum: a little-endian
/// 32-bit discriminant (declaration order below, starting at zero) followed
/// by the variant's payload fields in order. Addresses and lengths are 32
/// bits on the wire regardless of the kernel's host pointer width.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProcMgrRequest {
    /// Terminate the calling process.
    Exit,
    /// Deliver a signal. Only self-signal is implemented; it is equivalent
    /// to `Exit`.
    Signal { pid: Pid },
    /// Ask for the caller's pid.
    Getpid,
    /// Attach a user interrupt handler: pulses with `value = param` will be
    /// delivered on `coid` each time `irq` fires.
    InterruptAttach {
        coid: ConnectionId,
        irq: u32,
        param: i32,
    },
    /// Remove a previously attached interrupt handler.
    InterruptDetach { id: HandlerId },
    /// Acknowledge an interrupt, unmasking the line for this handler.
    InterruptComplete { id: HandlerId },
    /// Map a physical range into the caller's address space.
    MapPhys { physaddr: u32, len: u32 },
    /// Subscribe to child-termination pulses on `coid`. A negative `pid`
    /// matches any child; `count` bounds how many children this subscription
    /// will reap.
    ChildWaitAttach {
        pid: Pid,
        count: u32,
        coid: ConnectionId,
    },
    /// Remove a child-wait subscription.
    ChildWaitDetach { id: ReaperId },
}

/// Reply payload for `ProcMgrRequest::Getpid`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GetpidReply {
    pub pid: Pid,
}

/// Reply payload for `ProcMgrRequest::InterruptAttach`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InterruptAttachReply {
    pub id: HandlerId,
}

/// Reply payload for `ProcMgrRequest::MapPhys`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MapPhysReply {
    pub vaddr: u32,
}

/// Reply payload for `ProcMgrRequest::ChildWaitAttach`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChildWaitAttachReply {
    pub id: ReaperId,
}

/// Size of the receive buffer the process manager loop uses: big enough for
/// the largest request above and for a pulse.
pub const PROCMGR_MSG_BUF_LEN: usize = 32;
