// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names: `SavedState`, `IrqSave`, `disable_interrupts`,
//! `restore_interrupts`, `prepare_thread`, plus the `klog!`/`uassert!`
//! macros. Bare-metal ARMv6 additionally provides the syscall and IRQ entry
//! sequences and the context-switch routine; the hosted module provides
//! inert stand-ins so the whole kernel state machine runs under the host's
//! test harness.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        #[macro_use]
        pub mod arm_v6;
        pub use arm_v6::*;
    } else {
        #[macro_use]
        pub mod hosted;
        pub use hosted::*;
    }
}
