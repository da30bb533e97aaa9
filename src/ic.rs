//! Inline caches for virtual and interface call sites.
//!
//! A cache moves `Clean -> Monomorphic -> Megamorphic`. The speculation lives
//! in an immutable [`IcCell`] published through a single atomic pointer, so a
//! reader sees either the old cell or the new one in full. Replaced cells are
//! retired rather than freed: a dispatching thread may still be reading one.
//! They are reclaimed when the owning artifact is dropped or by
//! [`InlineCache::purge_retired`] once no thread can hold a stale pointer.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::guard::PatchScope;
use crate::metadata::{ClassHandle, ClassId, MethodId};

/// Cache state for inline caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// No speculation; the call goes through the resolve stub
    Clean,
    /// One receiver class observed; the call goes straight to its target
    Monomorphic,
    /// Speculation abandoned; the call goes through table dispatch
    Megamorphic,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheState::Clean => "clean",
            CacheState::Monomorphic => "monomorphic",
            CacheState::Megamorphic => "megamorphic",
        };
        f.write_str(name)
    }
}

/// Interface dispatch pair: the interface named at the call site and the
/// class that declares the selected implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ItablePair {
    pub refc: ClassId,
    pub defc: ClassId,
}

/// One published speculation. Never mutated after publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcCell {
    state: CacheState,
    class: Option<ClassHandle>,
    target: Option<MethodId>,
    entry: u64,
    itable: Option<ItablePair>,
    initialized: bool,
}

impl IcCell {
    fn monomorphic(class: ClassHandle, target: MethodId, entry: u64, itable: Option<ItablePair>) -> Self {
        Self {
            state: CacheState::Monomorphic,
            class: Some(class),
            target: Some(target),
            entry,
            itable,
            initialized: true,
        }
    }

    fn megamorphic(itable: Option<ItablePair>) -> Self {
        Self {
            state: CacheState::Megamorphic,
            class: None,
            target: None,
            entry: 0,
            itable,
            initialized: true,
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// The speculated receiver class. May refer to an unloaded class.
    pub fn speculated_class(&self) -> Option<ClassHandle> {
        self.class
    }

    pub fn target(&self) -> Option<MethodId> {
        self.target
    }

    /// Entry the call site is bound to while monomorphic.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn itable(&self) -> Option<ItablePair> {
        self.itable
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// What a call site must be repointed to after [`InlineCache::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcTransition {
    /// Speculation unchanged; no patching
    Unchanged,
    /// Bind the site to the speculated entry
    Monomorphic { entry: u64 },
    /// Bind the site to the table dispatch stub
    Megamorphic,
}

struct Retired(Vec<NonNull<IcCell>>);

// Retired cells are only dereferenced by readers that loaded them before
// they were swapped out; ownership here is for deallocation only.
unsafe impl Send for Retired {}

pub struct InlineCache {
    interface: bool,
    cell: AtomicPtr<IcCell>,
    retired: Mutex<Retired>,
}

impl InlineCache {
    pub fn new(interface: bool) -> Self {
        Self {
            interface,
            cell: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Retired(Vec::new())),
        }
    }

    pub fn is_interface(&self) -> bool {
        self.interface
    }

    /// A snapshot of the current cell. Lock-free.
    pub fn cell(&self) -> Option<IcCell> {
        let ptr = self.cell.load(Ordering::Acquire);
        // SAFETY: published cells are freed only when the cache is dropped or
        // by `purge_retired`, whose caller guarantees no reader is active.
        unsafe { ptr.as_ref() }.copied()
    }

    pub fn state(&self) -> CacheState {
        self.cell().map_or(CacheState::Clean, |c| c.state)
    }

    /// The cached target for `receiver`, if the speculation matches.
    #[inline]
    pub fn lookup(&self, receiver: ClassHandle) -> Option<(MethodId, u64)> {
        let cell = self.cell()?;
        match (cell.state, cell.class, cell.target) {
            (CacheState::Monomorphic, Some(class), Some(target)) if class == receiver => {
                Some((target, cell.entry))
            }
            _ => None,
        }
    }

    /// Record an observed receiver and its resolved target.
    pub fn update(
        &self,
        receiver: ClassHandle,
        target: MethodId,
        entry: u64,
        itable: Option<ItablePair>,
        scope: &PatchScope<'_>,
    ) -> IcTransition {
        match self.cell() {
            None => {
                self.publish(IcCell::monomorphic(receiver, target, entry, itable), scope);
                IcTransition::Monomorphic { entry }
            }
            Some(cell) => match cell.state {
                CacheState::Clean => {
                    self.publish(IcCell::monomorphic(receiver, target, entry, itable), scope);
                    IcTransition::Monomorphic { entry }
                }
                CacheState::Monomorphic if cell.class == Some(receiver) => {
                    if cell.target == Some(target) && cell.entry == entry {
                        IcTransition::Unchanged
                    } else {
                        // Same receiver, newer code for the target.
                        self.publish(IcCell::monomorphic(receiver, target, entry, itable), scope);
                        IcTransition::Monomorphic { entry }
                    }
                }
                CacheState::Monomorphic => {
                    self.publish(IcCell::megamorphic(cell.itable), scope);
                    IcTransition::Megamorphic
                }
                CacheState::Megamorphic => IcTransition::Unchanged,
            },
        }
    }

    /// Drop a speculation on `class`. The call site keeps its destination;
    /// the next call misses and re-resolves.
    pub fn invalidate_if_speculating(&self, class: ClassId, scope: &PatchScope<'_>) -> bool {
        match self.cell() {
            Some(cell) if cell.class.is_some_and(|c| c.id() == class) => {
                self.clear(scope);
                true
            }
            _ => false,
        }
    }

    /// Remove any speculation. Idempotent.
    pub fn set_to_clean(&self, scope: &PatchScope<'_>) -> bool {
        if self.cell.load(Ordering::Acquire).is_null() {
            return false;
        }
        self.clear(scope);
        true
    }

    fn clear(&self, _scope: &PatchScope<'_>) {
        let old = self.cell.swap(ptr::null_mut(), Ordering::AcqRel);
        self.retire(old);
    }

    fn publish(&self, cell: IcCell, _scope: &PatchScope<'_>) {
        let fresh = Box::into_raw(Box::new(cell));
        let old = self.cell.swap(fresh, Ordering::AcqRel);
        self.retire(old);
    }

    fn retire(&self, old: *mut IcCell) {
        if let Some(old) = NonNull::new(old) {
            self.retired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .0
                .push(old);
        }
    }

    pub fn retired_cells(&self) -> usize {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner).0.len()
    }

    /// Free retired cells.
    ///
    /// # Safety
    ///
    /// No thread may still hold a cell pointer loaded before the cells were
    /// retired, which holds once every mutator has been stopped.
    pub unsafe fn purge_retired(&self) -> usize {
        let cells = std::mem::take(&mut self.retired.lock().unwrap_or_else(PoisonError::into_inner).0);
        let count = cells.len();
        for cell in cells {
            // SAFETY: each pointer came from `Box::into_raw` and is retired once.
            drop(unsafe { Box::from_raw(cell.as_ptr()) });
        }
        count
    }
}

impl Drop for InlineCache {
    fn drop(&mut self) {
        let current = *self.cell.get_mut();
        if !current.is_null() {
            // SAFETY: exclusive access; the pointer came from `Box::into_raw`.
            drop(unsafe { Box::from_raw(current) });
        }
        // SAFETY: `&mut self` rules out concurrent readers.
        unsafe {
            self.purge_retired();
        }
    }
}

impl fmt::Debug for InlineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineCache")
            .field("interface", &self.interface)
            .field("cell", &self.cell())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::PatchingLock;
    use crate::metadata::MetadataRegistry;
    use proptest::prelude::*;

    fn classes(n: usize) -> (MetadataRegistry, Vec<ClassId>) {
        let registry = MetadataRegistry::new();
        let ids = (0..n)
            .map(|i| registry.add_class(&format!("C{i}"), None).unwrap())
            .collect();
        (registry, ids)
    }

    #[test]
    fn test_ic_clean() {
        let ic = InlineCache::new(false);
        assert_eq!(ic.state(), CacheState::Clean);
        assert!(ic.cell().is_none());
    }

    #[test]
    fn test_ic_monomorphic() {
        let (registry, ids) = classes(2);
        let a = registry.handle(ids[0]).unwrap();
        let b = registry.handle(ids[1]).unwrap();
        let lock = PatchingLock::new();
        let ic = InlineCache::new(false);

        let scope = lock.lock();
        assert_eq!(
            ic.update(a, MethodId(4), 0x1000, None, &scope),
            IcTransition::Monomorphic { entry: 0x1000 }
        );
        assert_eq!(ic.update(a, MethodId(4), 0x1000, None, &scope), IcTransition::Unchanged);
        drop(scope);

        assert_eq!(ic.state(), CacheState::Monomorphic);
        assert_eq!(ic.lookup(a), Some((MethodId(4), 0x1000)));
        assert_eq!(ic.lookup(b), None);
        assert!(ic.cell().unwrap().is_initialized());
    }

    #[test]
    fn test_ic_refresh_on_new_entry() {
        let (registry, ids) = classes(1);
        let a = registry.handle(ids[0]).unwrap();
        let lock = PatchingLock::new();
        let ic = InlineCache::new(false);
        let scope = lock.lock();
        ic.update(a, MethodId(1), 0x1000, None, &scope);
        assert_eq!(
            ic.update(a, MethodId(1), 0x2000, None, &scope),
            IcTransition::Monomorphic { entry: 0x2000 }
        );
        assert_eq!(ic.state(), CacheState::Monomorphic);
        assert_eq!(ic.retired_cells(), 1);
    }

    #[test]
    fn test_ic_megamorphic_is_sticky() {
        let (registry, ids) = classes(3);
        let h: Vec<_> = ids.iter().map(|&id| registry.handle(id).unwrap()).collect();
        let lock = PatchingLock::new();
        let pair = ItablePair {
            refc: ids[2],
            defc: ids[0],
        };
        let ic = InlineCache::new(true);
        let scope = lock.lock();
        ic.update(h[0], MethodId(1), 0x1000, Some(pair), &scope);
        assert_eq!(ic.update(h[1], MethodId(2), 0x2000, Some(pair), &scope), IcTransition::Megamorphic);
        assert_eq!(ic.update(h[0], MethodId(1), 0x1000, Some(pair), &scope), IcTransition::Unchanged);
        assert_eq!(ic.state(), CacheState::Megamorphic);
        assert_eq!(ic.lookup(h[0]), None);
        assert_eq!(ic.cell().unwrap().itable(), Some(pair));
    }

    #[test]
    fn test_ic_invalidation_and_clean() {
        let (registry, ids) = classes(2);
        let a = registry.handle(ids[0]).unwrap();
        let lock = PatchingLock::new();
        let ic = InlineCache::new(false);
        let scope = lock.lock();
        ic.update(a, MethodId(1), 0x1000, None, &scope);
        assert!(!ic.invalidate_if_speculating(ids[1], &scope));
        assert!(ic.invalidate_if_speculating(ids[0], &scope));
        assert_eq!(ic.state(), CacheState::Clean);

        assert!(!ic.set_to_clean(&scope));
        assert!(!ic.set_to_clean(&scope));
        drop(scope);
        assert_eq!(unsafe { ic.purge_retired() }, 1);
        assert_eq!(ic.retired_cells(), 0);
    }

    #[test]
    fn test_unloaded_class_yields_no_handle() {
        let (registry, ids) = classes(1);
        let a = registry.handle(ids[0]).unwrap();
        let lock = PatchingLock::new();
        let ic = InlineCache::new(false);
        ic.update(a, MethodId(1), 0x1000, None, &lock.lock());
        registry.unload_class(ids[0]).unwrap();
        assert!(!registry.is_live(a));
        // no receiver of the unloaded class can reach the cached target
        assert!(registry.handle(ids[0]).is_err());
        let scope = lock.lock();
        assert!(ic.invalidate_if_speculating(ids[0], &scope));
    }

    #[derive(Debug, Clone)]
    enum Event {
        Call(usize),
        Unload(usize),
        Clean,
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            (0usize..3).prop_map(Event::Call),
            (0usize..3).prop_map(Event::Unload),
            Just(Event::Clean),
        ]
    }

    proptest! {
        #[test]
        fn state_machine_is_total(events in proptest::collection::vec(event(), 1..40)) {
            let (registry, ids) = classes(3);
            let handles: Vec<_> = ids.iter().map(|&id| registry.handle(id).unwrap()).collect();
            let lock = PatchingLock::new();
            let ic = InlineCache::new(false);
            let mut went_mega = false;

            for event in events {
                let scope = lock.lock();
                let before = ic.state();
                match event {
                    Event::Call(i) => {
                        let target = MethodId(i as u32);
                        let entry = 0x1000 * (i as u64 + 1);
                        let transition = ic.update(handles[i], target, entry, None, &scope);
                        match before {
                            CacheState::Megamorphic => prop_assert_eq!(transition, IcTransition::Unchanged),
                            CacheState::Clean => prop_assert_eq!(transition, IcTransition::Monomorphic { entry }),
                            CacheState::Monomorphic => {}
                        }
                        if transition == IcTransition::Megamorphic {
                            went_mega = true;
                        }
                        // Never dispatch to another class's target.
                        for (j, &h) in handles.iter().enumerate() {
                            if let Some((t, _)) = ic.lookup(h) {
                                prop_assert_eq!(t, MethodId(j as u32));
                            }
                        }
                    }
                    Event::Unload(i) => {
                        ic.invalidate_if_speculating(ids[i], &scope);
                        prop_assert!(ic.cell().is_none_or(|c| c.speculated_class().map(|h| h.id()) != Some(ids[i])));
                    }
                    Event::Clean => {
                        ic.set_to_clean(&scope);
                        prop_assert_eq!(ic.state(), CacheState::Clean);
                        went_mega = false;
                    }
                }
                if went_mega && !matches!(ic.state(), CacheState::Clean) {
                    prop_assert_eq!(ic.state(), CacheState::Megamorphic);
                }
                let cell = ic.cell();
                match ic.state() {
                    CacheState::Clean => prop_assert!(cell.is_none()),
                    CacheState::Monomorphic => prop_assert!(cell.is_some_and(|c| c.speculated_class().is_some() && c.target().is_some())),
                    CacheState::Megamorphic => prop_assert!(cell.is_some_and(|c| c.speculated_class().is_none())),
                }
            }
        }
    }
}
