// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted/unprivileged/user memory.
//!
//! The transfer primitives here are what move message payloads between
//! address spaces. Both sides of a transfer present a *vector*: either a
//! single `(base, len)` fragment, or an array of fragments resident in the
//! owning process's memory. The copy walks both vectors in parallel,
//! advancing each independently, until either side is exhausted; the bytes
//! transferred are a prefix of the source concatenation laid out in order
//! over the destination concatenation. Payloads are never staged in kernel
//! memory.

use abi::IoVec;
use zerocopy::FromBytes;

use crate::err::{FaultInfo, InteractFault};
use crate::vm::AccessRights;

/// Upper bound on the number of fragments one side of a transfer may name.
/// Caps the work an errant process can demand from a single copy.
pub const MAX_FRAGMENTS: usize = 16;

/// Something that can vouch for (or deny) access to ranges of user memory.
/// Implemented by `Process`; tests substitute simple doubles.
pub trait MemAccess {
    fn can_access(&self, base: usize, len: usize, rights: AccessRights)
        -> bool;
}

/// A (user, untrusted, unprivileged) slice.
///
/// A `USlice` references memory outside the kernel. The slice is alleged to
/// contain values of type `T`, but is not guaranteed to be correctly aligned,
/// etc.
///
/// The existence of a `USlice` only tells you one thing: that a process has
/// asserted that it has access to a range of memory addresses, and that the
/// addresses are correctly aligned for `T`. It does not *prove* that the
/// process has this access. The result must be used carefully.
pub struct USlice<T> {
    /// Base address of the slice.
    base_address: usize,
    /// Number of `T` elements in the slice.
    length: usize,
    /// since we don't actually use T...
    _marker: core::marker::PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Constructs a `USlice` given a base address and length passed from
    /// untrusted code.
    ///
    /// This will only succeed if such a slice would not overlap the top of
    /// the address space, and if `base_address` is correctly aligned for `T`.
    ///
    /// This method will categorically reject zero-sized T.
    pub fn from_raw(
        base_address: usize,
        length: usize,
    ) -> Result<Self, FaultInfo> {
        uassert!(core::mem::size_of::<T>() != 0);

        let fault = FaultInfo {
            address: base_address,
            len: length,
        };
        // Alignment check:
        if base_address % core::mem::align_of::<T>() != 0 {
            return Err(fault);
        }
        // Check that a slice of `length` `T`s can even exist starting at
        // `base_address`, without wrapping around. This check is slightly
        // complicated by a desire to _allow_ slices that end at the top of
        // the address space.
        let size_in_bytes = length
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(fault)?;
        let highest_possible_base = usize::MAX - size_in_bytes;
        if base_address <= highest_possible_base {
            Ok(Self {
                base_address,
                length,
                _marker: core::marker::PhantomData,
            })
        } else {
            Err(fault)
        }
    }

    /// Returns `true` if this slice is zero-length, `false` otherwise.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of `T`s in this slice.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns the bottom address of this slice as a `usize`.
    pub fn base_addr(&self) -> usize {
        self.base_address
    }

    /// Length of the slice in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.length * core::mem::size_of::<T>()
    }
}

impl<T> USlice<T>
where
    T: FromBytes,
{
    /// Converts this into an _actual_ slice that can be directly read by the
    /// kernel.
    ///
    /// # Safety
    ///
    /// This operation is totally unchecked, so to use it safely, you must
    /// first convince yourself that the memory region this `USlice`
    /// describes is real memory legally readable by whatever process you're
    /// doing work on behalf of, and that it does not alias any kernel memory
    /// you hold a `&mut` to. Checking `MemAccess::can_access` establishes
    /// the former.
    pub unsafe fn assume_readable(&self) -> &[T] {
        core::slice::from_raw_parts(self.base_address as *const T, self.length)
    }
}

/// One side of a vectored transfer, as captured at the syscall boundary.
#[derive(Copy, Clone, Debug)]
pub enum VecDesc {
    /// A single contiguous fragment. Also used for kernel-resident buffers
    /// (the manager thread's receive buffer), which belong to a process with
    /// no address space and therefore pass every access check.
    Flat(IoVec),
    /// `count` `IoVec` descriptors starting at `base` in the owner's memory.
    User { base: usize, count: usize },
}

impl VecDesc {
    pub fn flat(base: usize, len: usize) -> Self {
        VecDesc::Flat(IoVec { base, len })
    }
}

/// Lazy walk over the fragments of one side of a transfer.
///
/// For the `User` form, descriptors are read out of the owner's memory one
/// at a time, so a blocked sender's descriptor array is consulted only while
/// the transfer actually runs.
struct Fragments {
    /// The validated descriptor table, for the `User` form.
    table: Option<USlice<IoVec>>,
    flat: Option<IoVec>,
    next: usize,
}

/// Opens a fragment walk over `desc`, validating the descriptor table
/// itself (for the `User` form) against its owner up front; elements are
/// read lazily as the walk advances.
fn fragments<M: MemAccess>(
    owner: &M,
    desc: VecDesc,
) -> Result<Fragments, FaultInfo> {
    let (table, flat) = match desc {
        VecDesc::Flat(iov) => (None, Some(iov)),
        VecDesc::User { base, count } => {
            if count > MAX_FRAGMENTS {
                return Err(FaultInfo {
                    address: base,
                    len: count,
                });
            }
            let table = USlice::<IoVec>::from_raw(base, count)?;
            if !owner.can_access(
                table.base_addr(),
                table.size_in_bytes(),
                AccessRights::READ,
            ) {
                return Err(FaultInfo {
                    address: base,
                    len: table.size_in_bytes(),
                });
            }
            (Some(table), None)
        }
    };
    Ok(Fragments {
        table,
        flat,
        next: 0,
    })
}

impl Fragments {
    /// Produces the next non-empty fragment, or `None` when the vector is
    /// exhausted.
    fn next_fragment(&mut self) -> Option<IoVec> {
        loop {
            let frag = match &self.table {
                None => {
                    if self.next > 0 {
                        return None;
                    }
                    self.flat?
                }
                Some(table) => {
                    if self.next >= table.len() {
                        return None;
                    }
                    // Safety: the table was bounds- and access-checked when
                    // the walk was opened.
                    unsafe { table.assume_readable()[self.next] }
                }
            };
            self.next += 1;
            if frag.len != 0 {
                return Some(frag);
            }
        }
    }
}

/// Sums the byte lengths of all fragments of `desc`.
pub fn total_len<M: MemAccess>(
    owner: &M,
    desc: VecDesc,
) -> Result<usize, FaultInfo> {
    let mut frags = fragments(owner, desc)?;
    let mut total = 0usize;
    while let Some(f) = frags.next_fragment() {
        total = total.saturating_add(f.len);
    }
    Ok(total)
}

/// Copies bytes from `src_desc` in `src`'s memory into `dst_desc` in `dst`'s
/// memory, checking memory access fragment-by-fragment before touching
/// anything. The first `src_skip` source bytes are passed over without being
/// copied.
///
/// The number of bytes copied is
/// `min(total(src) - src_skip, total(dst))`, and is returned.
///
/// If either side names memory its owner can't read or write (respectively),
/// the copy stops at the offending fragment and an `InteractFault` reports
/// which side(s) messed this up; bytes already transferred stay transferred.
pub fn copy_vectored<S: MemAccess, D: MemAccess>(
    src: &S,
    src_desc: VecDesc,
    src_skip: usize,
    dst: &D,
    dst_desc: VecDesc,
) -> Result<usize, InteractFault> {
    let mut src_frags =
        fragments(src, src_desc).map_err(InteractFault::in_src)?;
    let mut dst_frags =
        fragments(dst, dst_desc).map_err(InteractFault::in_dst)?;

    let mut skip = src_skip;
    let mut copied = 0usize;

    // Current positions within the active fragment on each side.
    let mut src_cur: Option<(IoVec, usize)> = None;
    let mut dst_cur: Option<(IoVec, usize)> = None;

    loop {
        // Refill the source side, discarding skipped bytes.
        if src_cur.is_none() {
            match src_frags.next_fragment() {
                None => break,
                Some(f) => {
                    if skip >= f.len {
                        skip -= f.len;
                        continue;
                    }
                    check_side(src, &f, AccessRights::READ)
                        .map_err(InteractFault::in_src)?;
                    src_cur = Some((f, skip));
                    skip = 0;
                }
            }
        }
        // Refill the destination side.
        if dst_cur.is_none() {
            match dst_frags.next_fragment() {
                None => break,
                Some(f) => {
                    check_side(dst, &f, AccessRights::WRITE)
                        .map_err(InteractFault::in_dst)?;
                    dst_cur = Some((f, 0));
                }
            }
        }

        // Both sides were just refilled, or we'd have broken out above.
        let (sf, so) = match src_cur.take() {
            Some(x) => x,
            None => break,
        };
        let (df, dof) = match dst_cur.take() {
            Some(x) => x,
            None => break,
        };

        let chunk = (sf.len - so).min(df.len - dof);
        // Safety: both fragments were just validated against their owners'
        // address spaces. `copy` tolerates overlap, so a process sending to
        // itself cannot produce UB, just funny data.
        unsafe {
            core::ptr::copy(
                (sf.base + so) as *const u8,
                (df.base + dof) as *mut u8,
                chunk,
            );
        }
        copied += chunk;

        if so + chunk < sf.len {
            src_cur = Some((sf, so + chunk));
        }
        if dof + chunk < df.len {
            dst_cur = Some((df, dof + chunk));
        }
    }

    Ok(copied)
}

/// Copies a kernel-resident byte slice into `dst_desc`. Used for pulse
/// delivery, where the payload is a kernel-built record.
pub fn copy_from_kernel<D: MemAccess>(
    dst: &D,
    dst_desc: VecDesc,
    bytes: &[u8],
) -> Result<usize, FaultInfo> {
    let mut frags = fragments(dst, dst_desc)?;
    let mut offset = 0usize;
    while offset < bytes.len() {
        let f = match frags.next_fragment() {
            None => break,
            Some(f) => f,
        };
        check_side(dst, &f, AccessRights::WRITE)?;
        let chunk = f.len.min(bytes.len() - offset);
        // Safety: fragment validated above; source is kernel memory distinct
        // from any user range.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(offset),
                f.base as *mut u8,
                chunk,
            );
        }
        offset += chunk;
    }
    Ok(offset)
}

/// Writes a single `T` value at `addr` in `dst`'s memory. Used for the
/// msgid out-parameter of receive.
pub fn write_user<D: MemAccess, T: FromBytes>(
    dst: &D,
    addr: usize,
    value: T,
) -> Result<(), FaultInfo> {
    let slice = USlice::<T>::from_raw(addr, 1)?;
    if !dst.can_access(
        slice.base_addr(),
        slice.size_in_bytes(),
        AccessRights::WRITE,
    ) {
        return Err(FaultInfo {
            address: addr,
            len: core::mem::size_of::<T>(),
        });
    }
    // Safety: range checked for write access just above.
    unsafe {
        (addr as *mut T).write(value);
    }
    Ok(())
}

fn check_side<M: MemAccess>(
    owner: &M,
    frag: &IoVec,
    rights: AccessRights,
) -> Result<(), FaultInfo> {
    // Reject fragments that wrap the address space, then consult the owner.
    USlice::<u8>::from_raw(frag.base, frag.len)?;
    if owner.can_access(frag.base, frag.len, rights) {
        Ok(())
    } else {
        Err(FaultInfo {
            address: frag.base,
            len: frag.len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Access checker that admits everything, like a kernel-owned buffer.
    struct Open;

    impl MemAccess for Open {
        fn can_access(&self, _: usize, _: usize, _: AccessRights) -> bool {
            true
        }
    }

    /// Access checker that denies everything.
    struct Walled;

    impl MemAccess for Walled {
        fn can_access(&self, _: usize, _: usize, _: AccessRights) -> bool {
            false
        }
    }

    fn flat(buf: &[u8]) -> VecDesc {
        VecDesc::flat(buf.as_ptr() as usize, buf.len())
    }

    fn flat_mut(buf: &mut [u8]) -> VecDesc {
        VecDesc::flat(buf.as_mut_ptr() as usize, buf.len())
    }

    #[test]
    fn flat_to_flat_truncates_to_shorter_side() {
        let src = *b"Artoo\0";
        let mut dst = [0u8; 4];
        let n =
            copy_vectored(&Open, flat(&src), 0, &Open, flat_mut(&mut dst))
                .unwrap();
        assert_eq!(n, 4);
        assert_eq!(&dst, b"Arto");
    }

    #[test]
    fn skip_crosses_fragment_boundaries() {
        let src = *b"abcdef";
        let iovs = [
            abi::IoVec {
                base: src.as_ptr() as usize,
                len: 2,
            },
            abi::IoVec {
                base: src.as_ptr() as usize + 2,
                len: 4,
            },
        ];
        let mut dst = [0u8; 6];
        let n = copy_vectored(
            &Open,
            VecDesc::User {
                base: iovs.as_ptr() as usize,
                count: iovs.len(),
            },
            3,
            &Open,
            flat_mut(&mut dst),
        )
        .unwrap();
        assert_eq!(n, 3);
        assert_eq!(&dst[..3], b"def");
    }

    #[test]
    fn inaccessible_destination_is_blamed_on_dst() {
        let src = *b"xy";
        let mut dst = [0u8; 2];
        let err =
            copy_vectored(&Open, flat(&src), 0, &Walled, flat_mut(&mut dst))
                .unwrap_err();
        assert!(err.src.is_none());
        assert!(err.dst.is_some());
    }

    #[test]
    fn fragment_count_is_bounded() {
        let err = total_len(
            &Open,
            VecDesc::User {
                base: 8,
                count: MAX_FRAGMENTS + 1,
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn zero_length_fragments_are_skipped() {
        let src = *b"ok";
        let iovs = [
            abi::IoVec { base: 4, len: 0 },
            abi::IoVec {
                base: src.as_ptr() as usize,
                len: 2,
            },
        ];
        let mut dst = [0u8; 2];
        let n = copy_vectored(
            &Open,
            VecDesc::User {
                base: iovs.as_ptr() as usize,
                count: iovs.len(),
            },
            0,
            &Open,
            flat_mut(&mut dst),
        )
        .unwrap();
        assert_eq!(n, 2);
        assert_eq!(&dst, b"ok");
    }
}
