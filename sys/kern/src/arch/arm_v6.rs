// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv6 (classic ARM, ARM11-class).
//!
//! # Exception model
//!
//! Syscalls arrive via `SWI` in supervisor mode on the calling thread's
//! kernel stack; hardware interrupts arrive in IRQ mode on a dedicated
//! one-page IRQ stack (with a second page for abort mode). The IRQ handler
//! never context-switches directly: it delivers pulses and sets the
//! need-resched flag, and the switch happens on the next syscall boundary.
//!
//! # Context switch
//!
//! `switch_context` implements the discipline the scheduler depends on: it
//! runs with interrupts disabled, records the interrupt-enable state that
//! was in force *before* the switch into the outgoing thread's saved PSR,
//! patches the outgoing saved PC to the resume point, and restores the
//! incoming thread's full register file with an `ldm ^` so the incoming
//! PSR (and therefore its interrupt state) takes effect atomically.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::kernel::Kernel;
use crate::thread::ArchState;

/// Number of saved registers: r0-r15 plus the PSR.
pub const REGISTER_COUNT: usize = 17;

pub const REGISTER_INDEX_ARG0: usize = 0;
pub const REGISTER_INDEX_ARG1: usize = 1;
pub const REGISTER_INDEX_R12: usize = 12;
pub const REGISTER_INDEX_SP: usize = 13;
pub const REGISTER_INDEX_PC: usize = 15;
pub const REGISTER_INDEX_PSR: usize = 16;

/// CPSR I and F bits (IRQ/FIQ disable).
pub const CPSR_INT_BITS: u32 = (1 << 7) | (1 << 6);
/// Supervisor-mode bits for a fresh kernel thread's PSR.
pub const CPSR_SVC_MODE: u32 = 0x13;
/// IRQ- and abort-mode bits, for exception stack installation.
pub const CPSR_IRQ_MODE: u32 = 0x12;
pub const CPSR_ABT_MODE: u32 = 0x17;

macro_rules! klog {
    ($($tt:tt)*) => {{
        $crate::arch::arm_v6::klog_str(&{
            let mut s: heapless::String<128> = heapless::String::new();
            let _ = core::fmt::Write::write_fmt(&mut s, format_args!($($tt)*));
            s
        });
    }};
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("assertion failed");
        }
    };
}

/// Debug-serial sink installed by the platform's serial driver.
static DEBUG_SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn set_debug_sink(sink: fn(&str)) {
    DEBUG_SINK.store(sink as *mut (), Ordering::Relaxed);
}

#[doc(hidden)]
pub fn klog_str(s: &str) {
    let p = DEBUG_SINK.load(Ordering::Relaxed);
    if !p.is_null() {
        // Safety: only ever stored from a `fn(&str)` in `set_debug_sink`.
        let f: fn(&str) = unsafe { core::mem::transmute(p) };
        f(s);
    }
}

/// The kernel root object, stashed at boot for the exception paths.
static KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

pub fn set_kernel(k: &'static Kernel) {
    KERNEL.store(k as *const Kernel as *mut Kernel, Ordering::Release);
}

pub fn kernel() -> &'static Kernel {
    let p = KERNEL.load(Ordering::Acquire);
    uassert!(!p.is_null());
    // Safety: set once at boot from a &'static.
    unsafe { &*p }
}

/// Saved machine state of a thread.
///
/// Two distinct register areas live here. `registers` is the *user frame*:
/// the register file captured at kernel entry, where syscall arguments are
/// read and return values written (including by a server replying to a
/// blocked sender). `kcontext` is the *kernel switch context*: the
/// supervisor-mode registers saved by `switch_context` while the thread is
/// suspended inside the kernel. Conflating the two would let a context
/// switch clobber a pending syscall result.
#[repr(C)]
#[derive(Debug)]
pub struct SavedState {
    // NOTE: offsets are known to the assembly below; keep r0..r15,psr order
    // in both arrays.
    pub registers: [u32; REGISTER_COUNT],
    pub kcontext: [u32; REGISTER_COUNT],
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            registers: [0; REGISTER_COUNT],
            kcontext: [0; REGISTER_COUNT],
        }
    }
}

impl ArchState for SavedState {
    fn syscall_number(&self) -> u32 {
        self.registers[REGISTER_INDEX_R12]
    }

    fn arg0(&self) -> usize {
        self.registers[0] as usize
    }
    fn arg1(&self) -> usize {
        self.registers[1] as usize
    }
    fn arg2(&self) -> usize {
        self.registers[2] as usize
    }
    fn arg3(&self) -> usize {
        self.registers[3] as usize
    }
    fn arg4(&self) -> usize {
        self.registers[4] as usize
    }

    fn set_return(&mut self, v: isize) {
        self.registers[REGISTER_INDEX_ARG0] = v as u32;
    }

    fn stage_syscall(&mut self, nr: u32, args: [usize; 5]) {
        self.registers[REGISTER_INDEX_R12] = nr;
        for (i, a) in args.iter().enumerate() {
            self.registers[i] = *a as u32;
        }
    }
}

/// Saved interrupt state, as returned by `disable_interrupts`: the I/F bits
/// of the CPSR at the time of the call.
#[derive(Copy, Clone, Debug)]
pub struct IrqSave(pub u32);

#[inline(always)]
pub fn disable_interrupts() -> IrqSave {
    let prev: u32;
    // Safety: reading CPSR and setting the I bit has no memory effects.
    unsafe {
        core::arch::asm!(
            "mrs {prev}, cpsr",
            "cpsid i",
            prev = out(reg) prev,
            options(nomem, nostack, preserves_flags),
        );
    }
    IrqSave(prev & CPSR_INT_BITS)
}

#[inline(always)]
pub fn restore_interrupts(token: IrqSave) {
    // Safety: rewrites only the interrupt-mask bits of CPSR.
    unsafe {
        core::arch::asm!(
            "mrs {tmp}, cpsr",
            "bic {tmp}, {tmp}, {bits}",
            "orr {tmp}, {tmp}, {saved}",
            "msr cpsr_c, {tmp}",
            tmp = out(reg) _,
            bits = in(reg) CPSR_INT_BITS,
            saved = in(reg) token.0,
            options(nomem, nostack),
        );
    }
}

/// Sets up a fresh kernel thread's register file: it will begin execution
/// at `thread_entry` with the body and parameter in r0/r1, in supervisor
/// mode with interrupts enabled, on its own stack.
pub fn prepare_thread(
    save: &mut SavedState,
    entry: fn(usize),
    param: usize,
    stack_top: usize,
) {
    save.kcontext = [0; REGISTER_COUNT];
    // Stack pointers must stay 8-aligned per AAPCS.
    save.kcontext[REGISTER_INDEX_SP] = (stack_top & !7) as u32;
    save.kcontext[REGISTER_INDEX_PC] = thread_entry as usize as u32;
    save.kcontext[REGISTER_INDEX_ARG0] = entry as usize as u32;
    save.kcontext[REGISTER_INDEX_ARG1] = param as u32;
    save.kcontext[REGISTER_INDEX_PSR] = CPSR_SVC_MODE;
}

/// First code a fresh kernel thread runs: call the body, then retire the
/// thread.
extern "C" fn thread_entry(body: fn(usize), param: usize) -> ! {
    body(param);

    let kern = kernel();
    {
        let mut st = kern.state.lock();
        let ks = &mut *st;
        let me = ks.current.expect("thread exit with no current");
        let joiner = {
            let th = ks.threads.get_mut(me).unwrap();
            th.state = crate::thread::SchedState::Finished;
            th.joiner.take()
        };
        if let Some(j) = joiner {
            ks.ready.enqueue(&mut ks.threads, j);
        }
    }
    // Never coming back.
    reschedule(false);
    unreachable!();
}

/// The context switch itself. Both pointers are to `kcontext[0]` of the
/// respective `SavedState`.
///
/// # Safety
///
/// Interrupts must be disabled; `outgoing` must be the register file of the
/// thread executing this call, and `incoming` a thread whose saved state is
/// resumable.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(
    outgoing: *mut u32,
    incoming: *const u32,
    prev_irq_bits: u32,
) {
    core::arch::naked_asm!(
        // Store the normal registers of the outgoing thread.
        "stm r0, {{r0 - r15}}",
        // Store CPSR modulo the interrupt mask, which is replaced by the
        // pre-switch state handed to us in r2.
        "mrs r3, cpsr",
        "bic r3, r3, #0xC0",
        "orr r3, r3, r2",
        "str r3, [r0, #64]",
        // Patch the stored PC to the resume point below.
        "adr r3, 2f",
        "str r3, [r0, #60]",
        // Restore the incoming thread: saved PSR goes into SPSR, then the
        // banked load moves SPSR into CPSR together with the registers.
        "ldr r3, [r1, #64]",
        "msr spsr_cxsf, r3",
        "ldm r1, {{r0 - r15}}^",
        "2:",
        "bx lr",
    );
}

/// Picks the next runnable thread and switches to it.
///
/// With `requeue_current` the caller goes back on the ready queue first
/// (the voluntary yield); without it the caller must already be parked on
/// some wait list or finished, and somebody else had better be runnable.
pub fn reschedule(requeue_current: bool) {
    let kern = kernel();
    let token = disable_interrupts();

    let regs = {
        let mut st = kern.state.lock();
        let ks = &mut *st;
        let current = ks.current.expect("reschedule with no current");

        if requeue_current {
            ks.ready.enqueue(&mut ks.threads, current);
        }
        let next = ks.ready.dequeue().expect("no runnable threads");
        if next == current {
            // Nobody else to run; take ourselves straight back.
            ks.threads.get_mut(current).unwrap().state =
                crate::thread::SchedState::Running;
            None
        } else {
            // Install the incoming address space, flushing translations
            // only on an actual change.
            let cur_pid = ks.threads.get(current).and_then(|t| t.process);
            let next_pid = ks.threads.get(next).and_then(|t| t.process);
            if cur_pid != next_pid {
                if let Some(p) = next_pid
                    .and_then(|p| ks.process(p))
                    .and_then(|p| p.aspace.as_ref())
                {
                    p.set_user();
                    p.flush_tlb();
                }
            }

            ks.threads.get_mut(next).unwrap().state =
                crate::thread::SchedState::Running;
            ks.current = Some(next);

            let out = ks
                .threads
                .get_mut(current)
                .unwrap()
                .save
                .kcontext
                .as_mut_ptr();
            let inp = ks.threads.get(next).unwrap().save.kcontext.as_ptr();
            Some((out, inp))
        }
    };

    if let Some((out_regs, in_regs)) = regs {
        // Safety: interrupts are off, `out_regs` belongs to the executing
        // thread, and `in_regs` was saved by this same discipline.
        unsafe {
            switch_context(out_regs, in_regs, token.0);
        }
    }
    restore_interrupts(token);
}

/// One-page stacks for the IRQ and abort exception modes.
#[repr(align(4096))]
struct ExceptionStack([u8; 4096]);

static mut IRQ_STACK: ExceptionStack = ExceptionStack([0; 4096]);
static mut ABT_STACK: ExceptionStack = ExceptionStack([0; 4096]);

/// Installs stack pointers for the IRQ and abort execution modes. Called
/// once during boot, before interrupts are enabled.
///
/// # Safety
///
/// Must run in supervisor mode with interrupts disabled.
pub unsafe fn init_exception_stacks() {
    let irq_top =
        core::ptr::addr_of!(IRQ_STACK) as usize + core::mem::size_of::<ExceptionStack>();
    let abt_top =
        core::ptr::addr_of!(ABT_STACK) as usize + core::mem::size_of::<ExceptionStack>();
    core::arch::asm!(
        // Save current execution mode.
        "mrs {save}, cpsr",
        // Switch to IRQ mode and install its stack pointer.
        "cps #0x12",
        "mov sp, {irq_sp}",
        // Switch to ABT mode and install its stack pointer.
        "cps #0x17",
        "mov sp, {abt_sp}",
        // Restore the previous execution mode.
        "msr cpsr_c, {save}",
        save = out(reg) _,
        irq_sp = in(reg) irq_top,
        abt_sp = in(reg) abt_top,
        options(nostack),
    );
}

// Exception veneers. The SWI veneer builds a 17-word frame in `SavedState`
// register order on the supervisor stack and hands it to Rust; on return
// the (possibly rewritten) frame flows back into the user registers. The
// IRQ veneer is lighter: interrupts never context-switch directly here, so
// only the caller-save registers need to survive.
core::arch::global_asm!(
    ".global _swi_vector",
    "_swi_vector:",
    "    sub sp, sp, #68",
    "    stm sp, {r0 - r12}",
    "    add r0, sp, #52",
    "    stm r0, {sp, lr}^",
    "    str lr, [sp, #60]",
    "    mrs r0, spsr",
    "    str r0, [sp, #64]",
    "    mov r0, sp",
    "    bl arm_syscall_entry",
    "    ldr r0, [sp, #64]",
    "    msr spsr_cxsf, r0",
    "    add r0, sp, #52",
    "    ldm r0, {sp, lr}^",
    "    ldm sp, {r0 - r12}",
    "    ldr lr, [sp, #60]",
    "    add sp, sp, #68",
    "    movs pc, lr",
    ".global _irq_vector",
    "_irq_vector:",
    "    sub lr, lr, #4",
    "    stmdb sp!, {r0 - r3, r12, lr}",
    "    bl arm_irq_entry",
    "    ldmia sp!, {r0 - r3, r12, lr}",
    "    movs pc, lr",
);

/// Rust half of the SWI vector: `frame` holds the user registers in
/// `SavedState` order. Dispatch, then let the frame carry the results (or
/// a different thread's state, after a switch and switch-back) back out.
///
/// # Safety
///
/// Called only from the SWI veneer with a properly built frame.
#[no_mangle]
pub unsafe extern "C" fn arm_syscall_entry(frame: *mut u32) {
    use crate::syscalls::{self, SyscallDisposition};

    let kern = kernel();
    let caller = {
        let mut st = kern.state.lock();
        let ks = &mut *st;
        let caller = ks.current.expect("syscall with no current thread");
        let save = &mut ks.threads.get_mut(caller).unwrap().save;
        for i in 0..REGISTER_COUNT {
            save.registers[i] = *frame.add(i);
        }
        caller
    };

    match syscalls::syscall_entry(kern, caller) {
        SyscallDisposition::Resume => {
            // Preemption check: the timer may have fired while we worked.
            if crate::thread::reset_need_resched() {
                reschedule(true);
            }
        }
        SyscallDisposition::CallerBlocked(_)
        | SyscallDisposition::CallerDied => {
            reschedule(false);
        }
    }

    // By the time control returns here this thread is Running again (its
    // blocked state, if any, was resolved before the switch back). Export
    // its register file to the frame for the return to user.
    {
        let mut st = kern.state.lock();
        let ks = &mut *st;
        let save = &ks.threads.get(caller).unwrap().save;
        for i in 0..REGISTER_COUNT {
            *frame.add(i) = save.registers[i];
        }
    }
}

/// Rust half of the IRQ vector. Runs on the IRQ stack; never switches
/// directly, only marks the need.
#[no_mangle]
pub extern "C" fn arm_irq_entry() {
    let kern = kernel();
    let woke = {
        let mut st = kern.state.lock();
        crate::interrupt::dispatch(&mut *st)
    };
    if woke {
        crate::thread::set_need_resched();
    }
}

/// Idle loop body: sleep until the next interrupt.
#[inline(always)]
pub fn wait_for_interrupt() {
    // Safety: WFI via the ARMv6 cp15 encoding; no memory effects.
    unsafe {
        core::arch::asm!(
            "mov r0, #0",
            "mcr p15, 0, r0, c7, c0, 4",
            out("r0") _,
            options(nostack, preserves_flags),
        );
    }
}
