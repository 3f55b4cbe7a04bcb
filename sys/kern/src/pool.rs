// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-shape object pools with explicit reference counts.
//!
//! Kernel objects (threads, channels, connections, messages, interrupt
//! records) live in one `Pool` per type. An `ObjRef` names a slot by index
//! plus a generation number, so a stale reference held after the slot is
//! reused is detected rather than silently resolving to the wrong object.
//!
//! Reference counting is explicit: `insert` creates a slot with one
//! reference, `retain`/`release` adjust it, and the slot is vacated when the
//! count reaches zero. `release` hands the final value back so the caller
//! can run type-specific disposal (cancelling queued transactions, dropping
//! edges to other objects) outside the pool.

use alloc::vec::Vec;
use core::marker::PhantomData;

/// Reference to a pooled object. Cheap to copy; does not itself keep the
/// object alive.
pub struct ObjRef<T> {
    index: u32,
    gen: u32,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls: derived ones would put bounds on T.
impl<T> Copy for ObjRef<T> {}
impl<T> Clone for ObjRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> PartialEq for ObjRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.gen == other.gen
    }
}
impl<T> Eq for ObjRef<T> {}

impl<T> core::fmt::Debug for ObjRef<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ObjRef({}v{})", self.index, self.gen)
    }
}

enum Slot<T> {
    Free { gen: u32, next_free: Option<u32> },
    Used { gen: u32, refs: u32, value: T },
}

/// A growable pool of `T` slots.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    live: usize,
}

impl<T> Pool<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            live: 0,
        }
    }

    /// Number of live (referenced) objects.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Allocates a slot for `value` with a reference count of one.
    ///
    /// Returns `None` on allocation failure or if the pool is full; the
    /// caller maps that to `NO_MEM`.
    pub fn insert(&mut self, value: T) -> Option<ObjRef<T>> {
        let index = match self.free_head {
            Some(i) => {
                let (gen, next) = match self.slots[i as usize] {
                    Slot::Free { gen, next_free } => (gen, next_free),
                    Slot::Used { .. } => unreachable!(),
                };
                self.free_head = next;
                self.slots[i as usize] = Slot::Used {
                    gen,
                    refs: 1,
                    value,
                };
                i
            }
            None => {
                let i = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot::Used {
                    gen: 0,
                    refs: 1,
                    value,
                });
                i
            }
        };
        self.live += 1;
        let gen = match self.slots[index as usize] {
            Slot::Used { gen, .. } => gen,
            Slot::Free { .. } => unreachable!(),
        };
        Some(ObjRef {
            index,
            gen,
            _marker: PhantomData,
        })
    }

    /// Resolves `r`, returning `None` if it is stale or was never valid.
    pub fn get(&self, r: ObjRef<T>) -> Option<&T> {
        match self.slots.get(r.index as usize) {
            Some(Slot::Used { gen, value, .. }) if *gen == r.gen => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Resolves `r` mutably, returning `None` if it is stale.
    pub fn get_mut(&mut self, r: ObjRef<T>) -> Option<&mut T> {
        match self.slots.get_mut(r.index as usize) {
            Some(Slot::Used { gen, value, .. }) if *gen == r.gen => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Current reference count of `r`, or zero if stale.
    pub fn refs(&self, r: ObjRef<T>) -> u32 {
        match self.slots.get(r.index as usize) {
            Some(Slot::Used { gen, refs, .. }) if *gen == r.gen => *refs,
            _ => 0,
        }
    }

    /// Adds a reference to `r`.
    ///
    /// # Panics
    ///
    /// If `r` is stale: taking a new reference to a dead object is always a
    /// kernel bug.
    pub fn retain(&mut self, r: ObjRef<T>) {
        match self.slots.get_mut(r.index as usize) {
            Some(Slot::Used { gen, refs, .. }) if *gen == r.gen => {
                *refs += 1;
            }
            _ => panic!("retain of stale ref"),
        }
    }

    /// Drops one reference to `r`. If that was the last reference, vacates
    /// the slot and returns the value so the caller can dispose of it.
    ///
    /// Releasing a stale reference is a no-op; teardown paths are allowed to
    /// be sloppy about objects that were already cascaded away.
    pub fn release(&mut self, r: ObjRef<T>) -> Option<T> {
        match self.slots.get_mut(r.index as usize) {
            Some(Slot::Used { gen, refs, .. }) if *gen == r.gen => {
                *refs -= 1;
                if *refs > 0 {
                    return None;
                }
            }
            _ => return None,
        }
        // Last reference: vacate, bumping the generation so outstanding
        // refs go stale.
        let next_gen = r.gen.wrapping_add(1);
        let old = core::mem::replace(
            &mut self.slots[r.index as usize],
            Slot::Free {
                gen: next_gen,
                next_free: self.free_head,
            },
        );
        self.free_head = Some(r.index);
        self.live -= 1;
        match old {
            Slot::Used { value, .. } => Some(value),
            Slot::Free { .. } => unreachable!(),
        }
    }

    /// Iterates over live objects.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Used { gen, value, .. } => Some((
                ObjRef {
                    index: i as u32,
                    gen: *gen,
                    _marker: PhantomData,
                },
                value,
            )),
            Slot::Free { .. } => None,
        })
    }

    /// Collects the refs of live objects satisfying `pred`. Handy for
    /// delete-safe sweeps: collect first, then mutate.
    pub fn refs_where(
        &self,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Vec<ObjRef<T>> {
        self.iter()
            .filter(|(_, v)| pred(v))
            .map(|(r, _)| r)
            .collect()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_release() {
        let mut p = Pool::new();
        let r = p.insert(7u32).unwrap();
        assert_eq!(p.get(r), Some(&7));
        assert_eq!(p.refs(r), 1);
        assert_eq!(p.release(r), Some(7));
        assert_eq!(p.get(r), None);
        assert_eq!(p.live(), 0);
    }

    #[test]
    fn stale_refs_do_not_resolve_after_reuse() {
        let mut p = Pool::new();
        let a = p.insert(1u32).unwrap();
        p.release(a);
        let b = p.insert(2u32).unwrap();
        // Slot is reused but the generation moved on.
        assert_eq!(p.get(a), None);
        assert_eq!(p.get(b), Some(&2));
    }

    #[test]
    fn retain_defers_disposal() {
        let mut p = Pool::new();
        let r = p.insert("x").unwrap();
        p.retain(r);
        assert_eq!(p.refs(r), 2);
        assert_eq!(p.release(r), None);
        assert_eq!(p.get(r), Some(&"x"));
        assert_eq!(p.release(r), Some("x"));
    }

    #[test]
    fn release_of_stale_ref_is_noop() {
        let mut p = Pool::new();
        let r = p.insert(0u8).unwrap();
        p.release(r);
        assert_eq!(p.release(r), None);
    }
}
