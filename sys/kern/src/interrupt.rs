// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interrupt dispatcher: routes hardware IRQs to user processes as
//! pulses, with per-line mask accounting.
//!
//! Each line carries an optional in-kernel handler function plus a list of
//! user handler records. Delivering to a user handler masks the line until
//! that handler acknowledges completion, so a slow handler cannot be
//! re-interrupted by its own device. The mask is counted: a line stays
//! masked while any attached handler still owes an acknowledgement.

use alloc::boxed::Box;
use alloc::vec::Vec;

use abi::{ConnectionId, Error, HandlerId, Pid, PULSE_TYPE_IRQ};

use crate::ipc;
use crate::kernel::KernState;
use crate::pool::{ObjRef, Pool};

/// Number of interrupt lines the controller exposes.
pub const NUM_IRQS: usize = 32;

pub type IhRef = ObjRef<HandlerRecord>;

/// In-kernel handler for an IRQ line (e.g. the preemption timer).
pub type KernelIrqHandler = fn(&mut KernState);

/// One user process's subscription to an IRQ line.
///
/// The record is shared between the owning process's handler table and the
/// per-line dispatch list; it dies when both edges drop. Process and
/// connection are named by id, not held alive: a handler whose owner died
/// simply stops firing.
#[derive(Debug)]
pub struct HandlerRecord {
    pub pid: Pid,
    pub coid: ConnectionId,
    pub irq: u32,
    /// Caller-supplied scalar, delivered as the pulse value.
    pub param: i32,
    /// Whether this record currently owes the line an acknowledgement.
    pub masked: bool,
}

/// Seam onto the hardware interrupt controller.
pub trait InterruptController: Send {
    fn init(&mut self);
    /// Identifies the currently raised line, if any.
    fn raised_irq(&mut self) -> Option<u32>;
    fn mask(&mut self, irq: u32);
    fn unmask(&mut self, irq: u32);
}

pub struct IrqState {
    pub controller: Option<Box<dyn InterruptController>>,
    kernel_handlers: [Option<KernelIrqHandler>; NUM_IRQS],
    lines: [Vec<IhRef>; NUM_IRQS],
    mask_counts: [u32; NUM_IRQS],
    pub records: Pool<HandlerRecord>,
}

impl IrqState {
    pub fn new() -> Self {
        Self {
            controller: None,
            kernel_handlers: [None; NUM_IRQS],
            lines: core::array::from_fn(|_| Vec::new()),
            mask_counts: [0; NUM_IRQS],
            records: Pool::new(),
        }
    }

    /// Raises the mask count; the 0 -> 1 transition masks the line at the
    /// controller.
    pub fn increment_mask(&mut self, irq: usize) {
        self.mask_counts[irq] += 1;
        if self.mask_counts[irq] == 1 {
            if let Some(c) = self.controller.as_mut() {
                c.mask(irq as u32);
            }
        }
    }

    /// Lowers the mask count; the 1 -> 0 transition unmasks the line.
    pub fn decrement_mask(&mut self, irq: usize) {
        uassert!(self.mask_counts[irq] > 0);
        self.mask_counts[irq] -= 1;
        if self.mask_counts[irq] == 0 {
            if let Some(c) = self.controller.as_mut() {
                c.unmask(irq as u32);
            }
        }
    }

    pub fn mask_count(&self, irq: usize) -> u32 {
        self.mask_counts[irq]
    }

    pub fn line(&self, irq: usize) -> &[IhRef] {
        &self.lines[irq]
    }
}

impl Default for IrqState {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the interrupt controller and initializes it. Called once at
/// boot.
pub fn register_controller(
    ks: &mut KernState,
    mut controller: Box<dyn InterruptController>,
) {
    uassert!(ks.irq.controller.is_none());
    controller.init();
    ks.irq.controller = Some(controller);
}

/// Installs a dedicated in-kernel handler for a line.
pub fn attach_kernel_handler(
    ks: &mut KernState,
    irq: u32,
    f: KernelIrqHandler,
) {
    uassert!((irq as usize) < NUM_IRQS);
    ks.irq.kernel_handlers[irq as usize] = Some(f);
}

/// Attaches a user handler: pulses with value `param` will be sent on
/// `coid` each time `irq` fires. Returns the handler id scoped to `pid`.
pub fn attach(
    ks: &mut KernState,
    pid: Pid,
    coid: ConnectionId,
    irq: u32,
    param: i32,
) -> Result<HandlerId, Error> {
    if irq as usize >= NUM_IRQS {
        return Err(Error::Invalid);
    }
    {
        let proc = ks.process(pid).ok_or(Error::Invalid)?;
        if proc.lookup_connection(coid).is_none() {
            return Err(Error::Invalid);
        }
    }
    let rec = ks
        .irq
        .records
        .insert(HandlerRecord {
            pid,
            coid,
            irq,
            param,
            masked: false,
        })
        .ok_or(Error::NoMem)?;
    // Second edge: the owning process's table.
    ks.irq.records.retain(rec);
    ks.irq.lines[irq as usize].push(rec);

    // Blip the mask count up and then down again to trigger the controller
    // to re-learn the unmask if there are no other masks against the line
    // right now.
    ks.irq.increment_mask(irq as usize);
    ks.irq.decrement_mask(irq as usize);

    let id = ks
        .process_mut(pid)
        .ok_or(Error::Invalid)?
        .register_handler(rec);
    Ok(id)
}

/// Detaches a handler by id, on behalf of its owner.
pub fn detach(
    ks: &mut KernState,
    pid: Pid,
    id: HandlerId,
) -> Result<(), Error> {
    let rec = ks
        .process_mut(pid)
        .ok_or(Error::Invalid)?
        .unregister_handler(id)
        .ok_or(Error::Invalid)?;
    detach_record(ks, rec);
    Ok(())
}

/// Unhooks a record from its line, settles its mask debt, and drops both
/// reference edges. If the line is left with no handlers at all it is
/// hard-masked, and the count had better be zero.
pub fn detach_record(ks: &mut KernState, rec: IhRef) {
    let (irq, masked) = match ks.irq.records.get(rec) {
        Some(r) => (r.irq as usize, r.masked),
        None => return,
    };
    ks.irq.lines[irq].retain(|&r| r != rec);

    // Flush out any outstanding per-handler mask.
    if masked {
        ks.irq.decrement_mask(irq);
    }

    // Mask the line if nobody is listening anymore.
    if ks.irq.lines[irq].is_empty() && ks.irq.kernel_handlers[irq].is_none() {
        uassert!(ks.irq.mask_count(irq) == 0);
        if let Some(c) = ks.irq.controller.as_mut() {
            c.mask(irq as u32);
        }
    }

    let _ = ks.irq.records.release(rec);
    let _ = ks.irq.records.release(rec);
}

/// User-space acknowledgement that an interrupt has been handled.
pub fn complete(
    ks: &mut KernState,
    pid: Pid,
    id: HandlerId,
) -> Result<(), Error> {
    let rec = ks
        .process(pid)
        .ok_or(Error::Invalid)?
        .lookup_handler(id)
        .ok_or(Error::Invalid)?;
    let irq = {
        let r = ks.irq.records.get_mut(rec).ok_or(Error::Invalid)?;
        if !r.masked {
            return Err(Error::Invalid);
        }
        r.masked = false;
        r.irq as usize
    };
    ks.irq.decrement_mask(irq);
    Ok(())
}

/// The IRQ entry point: identifies the raised line and delivers to its
/// handlers. Returns `true` if a receiver was woken, meaning the interrupt
/// return path should request a reschedule.
pub fn dispatch(ks: &mut KernState) -> bool {
    let which = match ks.irq.controller.as_mut().and_then(|c| c.raised_irq())
    {
        Some(w) => w as usize,
        None => return false,
    };
    if which >= NUM_IRQS {
        return false;
    }

    // Dedicated kernel handlers run first (the preemption timer lives
    // here).
    let kernel_handler = ks.irq.kernel_handlers[which];
    if let Some(f) = kernel_handler {
        f(ks);
    }

    let records = ks.irq.lines[which].clone();
    let mut woke = false;
    for rec in records {
        let (pid, coid, param, masked) = match ks.irq.records.get(rec) {
            Some(r) => (r.pid, r.coid, r.param, r.masked),
            None => continue,
        };
        if masked {
            // Still owes an ack from a previous firing; the line should
            // have been masked, but a shared line can get here.
            continue;
        }
        match ipc::send_pulse(ks, pid, coid, PULSE_TYPE_IRQ, param) {
            Ok(w) => {
                woke |= w;
                if let Some(r) = ks.irq.records.get_mut(rec) {
                    r.masked = true;
                }
                ks.irq.increment_mask(which);
            }
            // Owner or connection gone, or pulse queue full: the handler
            // just doesn't hear about this one.
            Err(_) => (),
        }
    }
    woke
}
