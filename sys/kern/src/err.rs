// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.

use abi::Error;

/// An error committed by user code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error, indicated to the errant caller by returning the
    /// negated response code.
    Recoverable(Error),
    /// The caller handed the kernel a buffer it cannot access. The caller's
    /// process is torn down; nothing is returned to it.
    Fault(FaultInfo),
}

impl From<Error> for UserError {
    fn from(e: Error) -> Self {
        Self::Recoverable(e)
    }
}

impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Fault(f)
    }
}

/// A record describing a memory fault detected while the kernel accessed a
/// user buffer on a process's behalf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FaultInfo {
    /// Problematic base address the process asked the kernel to access.
    pub address: usize,
    /// Length of the rejected access.
    pub len: usize,
}

/// A fault that arose in the interaction between two processes (i.e. during
/// message transfer).
///
/// This can assign fault to either or both sides. By convention, an
/// `InteractFault` won't contain both fields as `None`, though the type
/// system doesn't prevent this.
#[derive(Copy, Clone, Debug)]
pub struct InteractFault {
    /// Fault in the source side of a transfer.
    pub src: Option<FaultInfo>,
    /// Fault in the destination side of a transfer.
    pub dst: Option<FaultInfo>,
}

impl InteractFault {
    /// Convenience mapping to take a `FaultInfo` and turn it into an
    /// `InteractFault` blaming the source.
    pub fn in_src(fi: FaultInfo) -> Self {
        Self {
            src: Some(fi),
            dst: None,
        }
    }

    /// Convenience mapping to take a `FaultInfo` and turn it into an
    /// `InteractFault` blaming the destination.
    pub fn in_dst(fi: FaultInfo) -> Self {
        Self {
            src: None,
            dst: Some(fi),
        }
    }
}
