// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be
//! found by tooling.
//!
//! - `KERNEL_HAS_FAILED` is a `bool`, cleared before entry to kernel main
//!   and set if the kernel reaches `die` (explicitly or via `panic!`).
//! - `KERNEL_EPITAPH` records as much of the failure reason (as UTF-8) as
//!   fits, truncating if the buffer fills; trailing NULs are padding.
//!
//! On hosted builds (simulation and tests) panics propagate to std as
//! usual.

#[cfg(target_os = "none")]
use core::fmt::{Display, Write};

/// Flag that gets set by all failure reporting functions, giving tools a
/// one-stop shop for kernel triage.
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: this is reached at most once per boot, with interrupts
    // disabled on the way down; a second entry spins instead of writing.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Recursive panic; don't make it worse.
        loop {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }

    // Safety: only the one successful flag-setter gets here.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` and halts.
#[cfg(target_os = "none")]
pub fn die(msg: impl Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{}", msg).ok();
    klog!("kernel died");

    loop {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(target_os = "none")]
struct Eulogist {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
