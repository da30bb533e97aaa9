//! Class and method metadata as seen by the linker.
//!
//! This is the slice of a class hierarchy the call-site machinery needs:
//! vtables for virtual selection, implemented interfaces for interface
//! selection, compiled entry points, and class unloading. Inline caches never
//! hold a strong reference to a class; they hold a [`ClassHandle`] that goes
//! stale when the class is unloaded.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use serde::Serialize;
use tracing::debug;

use crate::adapters::AdapterEntry;
use crate::error::LinkError;
use crate::signature::Signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MethodId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// A reference from compiled code to runtime metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataRef {
    Class(ClassId),
    Method(MethodId),
}

/// Resolves metadata references to stable addresses at install time.
pub trait MetadataResolver: Send + Sync {
    fn resolve_metadata(&self, reference: MetadataRef) -> Option<u64>;
}

/// Notified after a class has been unloaded.
pub trait ClassUnloadListener: Send + Sync {
    fn class_unloaded(&self, class: ClassId);
}

/// A weak reference to a loaded class.
///
/// The generation changes when the class is unloaded, so a handle taken
/// before unloading never matches again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassHandle {
    id: ClassId,
    generation: u32,
}

impl ClassHandle {
    pub fn id(&self) -> ClassId {
        self.id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodFlags {
    pub is_static: bool,
    pub is_native: bool,
    pub is_abstract: bool,
}

impl MethodFlags {
    pub const INSTANCE: Self = Self {
        is_static: false,
        is_native: false,
        is_abstract: false,
    };
    pub const STATIC: Self = Self {
        is_static: true,
        is_native: false,
        is_abstract: false,
    };
    pub const ABSTRACT: Self = Self {
        is_static: false,
        is_native: false,
        is_abstract: true,
    };
}

/// Offset of [`Method::compiled_entry`], read by interpreted-to-compiled adapters.
pub const COMPILED_ENTRY_OFFSET: i32 = std::mem::offset_of!(Method, compiled_entry) as i32;

#[repr(C)]
pub struct Method {
    /// Verified entry of the current compiled code, 0 when interpreted.
    compiled_entry: AtomicU64,
    id: MethodId,
    holder: ClassId,
    name: String,
    signature: Signature,
    flags: MethodFlags,
    vtable_index: Option<u32>,
    native_function: AtomicU64,
    adapter: OnceLock<Arc<AdapterEntry>>,
}

impl Method {
    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn holder(&self) -> ClassId {
        self.holder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_static(&self) -> bool {
        self.flags.is_static
    }

    pub fn vtable_index(&self) -> Option<u32> {
        self.vtable_index
    }

    /// Stable address of this method's metadata.
    pub fn address(&self) -> u64 {
        self as *const Method as u64
    }

    pub fn compiled_entry(&self) -> Option<u64> {
        match self.compiled_entry.load(Ordering::Acquire) {
            0 => None,
            entry => Some(entry),
        }
    }

    pub fn set_compiled_entry(&self, entry: u64) {
        self.compiled_entry.store(entry, Ordering::Release);
    }

    /// Clear the compiled entry if it still points at `entry`.
    pub fn clear_compiled_entry(&self, entry: u64) -> bool {
        self.compiled_entry
            .compare_exchange(entry, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn native_function(&self) -> Option<u64> {
        match self.native_function.load(Ordering::Acquire) {
            0 => None,
            f => Some(f),
        }
    }

    pub fn set_native_function(&self, function: u64) {
        self.native_function.store(function, Ordering::Release);
    }

    pub fn adapter(&self) -> Option<&Arc<AdapterEntry>> {
        self.adapter.get()
    }

    /// Record the adapter; the first one set wins.
    pub fn set_adapter(&self, adapter: Arc<AdapterEntry>) -> Arc<AdapterEntry> {
        self.adapter.get_or_init(|| adapter).clone()
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("signature", &format_args!("{}", self.signature))
            .field("compiled_entry", &self.compiled_entry())
            .finish()
    }
}

pub struct Klass {
    id: ClassId,
    name: String,
    superclass: Option<ClassId>,
    is_interface: bool,
    interfaces: RwLock<Vec<ClassId>>,
    vtable: RwLock<Vec<MethodId>>,
    generation: AtomicU32,
    loaded: AtomicBool,
}

impl Klass {
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn superclass(&self) -> Option<ClassId> {
        self.superclass
    }

    pub fn is_interface(&self) -> bool {
        self.is_interface
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn vtable(&self) -> Vec<MethodId> {
        self.vtable.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn vtable_entry(&self, index: u32) -> Option<MethodId> {
        self.vtable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index as usize)
            .copied()
    }

    fn handle(&self) -> ClassHandle {
        ClassHandle {
            id: self.id,
            generation: self.generation.load(Ordering::Acquire),
        }
    }
}

impl fmt::Debug for Klass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Klass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// All classes and methods known to the runtime.
///
/// Classes are defined top-down: a method added to a superclass after a
/// subclass was defined is not seen by that subclass's vtable.
#[derive(Default)]
pub struct MetadataRegistry {
    classes: RwLock<Vec<Arc<Klass>>>,
    methods: RwLock<Vec<Arc<Method>>>,
    listeners: Mutex<Vec<Weak<dyn ClassUnloadListener>>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&self, name: &str, superclass: Option<ClassId>) -> Result<ClassId, LinkError> {
        let vtable = match superclass {
            Some(sup) => self.class(sup)?.vtable(),
            None => Vec::new(),
        };
        Ok(self.define(name, superclass, false, vtable))
    }

    pub fn add_interface(&self, name: &str) -> ClassId {
        self.define(name, None, true, Vec::new())
    }

    fn define(
        &self,
        name: &str,
        superclass: Option<ClassId>,
        is_interface: bool,
        vtable: Vec<MethodId>,
    ) -> ClassId {
        let mut classes = self.classes.write().unwrap_or_else(PoisonError::into_inner);
        let id = ClassId(classes.len() as u32);
        classes.push(Arc::new(Klass {
            id,
            name: name.to_string(),
            superclass,
            is_interface,
            interfaces: RwLock::new(Vec::new()),
            vtable: RwLock::new(vtable),
            generation: AtomicU32::new(0),
            loaded: AtomicBool::new(true),
        }));
        id
    }

    pub fn implement_interface(&self, class: ClassId, interface: ClassId) -> Result<(), LinkError> {
        let klass = self.class(class)?;
        if !self.class(interface)?.is_interface() {
            return Err(LinkError::NoSuchClass(interface));
        }
        klass
            .interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interface);
        Ok(())
    }

    /// Define a method on `holder`.
    ///
    /// An instance method whose name and signature match an inherited vtable
    /// entry overrides that entry; otherwise it gets a new vtable slot.
    pub fn add_method(
        &self,
        holder: ClassId,
        name: &str,
        signature: Signature,
        flags: MethodFlags,
    ) -> Result<MethodId, LinkError> {
        let klass = self.class(holder)?;
        let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
        let id = MethodId(methods.len() as u32);

        let vtable_index = if flags.is_static || klass.is_interface {
            None
        } else {
            let mut vtable = klass.vtable.write().unwrap_or_else(PoisonError::into_inner);
            let inherited = vtable.iter().position(|m| {
                let m = &methods[m.0 as usize];
                m.name == name && m.signature == signature
            });
            match inherited {
                Some(index) => {
                    vtable[index] = id;
                    Some(index as u32)
                }
                None => {
                    vtable.push(id);
                    Some(vtable.len() as u32 - 1)
                }
            }
        };

        methods.push(Arc::new(Method {
            compiled_entry: AtomicU64::new(0),
            id,
            holder,
            name: name.to_string(),
            signature,
            flags,
            vtable_index,
            native_function: AtomicU64::new(0),
            adapter: OnceLock::new(),
        }));
        Ok(id)
    }

    pub fn class(&self, id: ClassId) -> Result<Arc<Klass>, LinkError> {
        self.classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0 as usize)
            .cloned()
            .ok_or(LinkError::NoSuchClass(id))
    }

    pub fn method(&self, id: MethodId) -> Result<Arc<Method>, LinkError> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0 as usize)
            .cloned()
            .ok_or(LinkError::NoSuchMethod(id))
    }

    /// A weak handle to a loaded class.
    pub fn handle(&self, id: ClassId) -> Result<ClassHandle, LinkError> {
        let klass = self.class(id)?;
        if !klass.is_loaded() {
            return Err(LinkError::ClassUnloaded(id));
        }
        Ok(klass.handle())
    }

    /// Whether the class behind `handle` is still the one the handle was taken from.
    pub fn is_live(&self, handle: ClassHandle) -> bool {
        self.class(handle.id)
            .map(|klass| klass.is_loaded() && klass.handle() == handle)
            .unwrap_or(false)
    }

    pub fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.class(id).ok().and_then(|k| k.superclass());
        }
        false
    }

    pub fn implements(&self, class: ClassId, interface: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            let Ok(klass) = self.class(id) else {
                return false;
            };
            if klass
                .interfaces
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&interface)
            {
                return true;
            }
            current = klass.superclass();
        }
        false
    }

    /// Select the implementation of `method` for a receiver of class `receiver`.
    pub fn select_virtual(&self, receiver: ClassId, method: MethodId) -> Result<MethodId, LinkError> {
        let declared = self.method(method)?;
        if declared.is_static() {
            return Ok(method);
        }
        if self.class(declared.holder())?.is_interface() {
            return self.select_interface(receiver, method);
        }
        let klass = self.live_class(receiver)?;
        if !self.is_subclass_of(receiver, declared.holder()) {
            return Err(LinkError::IncompatibleClassChange {
                class: receiver,
                method,
            });
        }
        let Some(index) = declared.vtable_index() else {
            return Ok(method);
        };
        let selected = klass
            .vtable_entry(index)
            .ok_or(LinkError::AbstractMethod {
                class: receiver,
                method,
            })?;
        if self.method(selected)?.flags().is_abstract {
            return Err(LinkError::AbstractMethod {
                class: receiver,
                method,
            });
        }
        Ok(selected)
    }

    /// Select the implementation of interface method `method` for `receiver`.
    pub fn select_interface(&self, receiver: ClassId, method: MethodId) -> Result<MethodId, LinkError> {
        let declared = self.method(method)?;
        let klass = self.live_class(receiver)?;
        if !self.implements(receiver, declared.holder()) {
            return Err(LinkError::IncompatibleClassChange {
                class: receiver,
                method,
            });
        }
        let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
        klass
            .vtable()
            .into_iter()
            .find(|m| {
                let m = &methods[m.0 as usize];
                !m.flags.is_abstract && m.name == declared.name && m.signature == declared.signature
            })
            .ok_or(LinkError::AbstractMethod {
                class: receiver,
                method,
            })
    }

    fn live_class(&self, id: ClassId) -> Result<Arc<Klass>, LinkError> {
        let klass = self.class(id)?;
        if !klass.is_loaded() {
            return Err(LinkError::ClassUnloaded(id));
        }
        Ok(klass)
    }

    pub fn add_unload_listener(&self, listener: Weak<dyn ClassUnloadListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Unload a class and notify listeners.
    pub fn unload_class(&self, id: ClassId) -> Result<(), LinkError> {
        let klass = self.live_class(id)?;
        klass.loaded.store(false, Ordering::Release);
        klass.generation.fetch_add(1, Ordering::AcqRel);
        debug!(class = %klass.name(), "class unloaded");

        let listeners: Vec<_> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.class_unloaded(id);
        }
        Ok(())
    }
}

impl MetadataResolver for MetadataRegistry {
    fn resolve_metadata(&self, reference: MetadataRef) -> Option<u64> {
        match reference {
            MetadataRef::Class(id) => {
                let klass = self.live_class(id).ok()?;
                Some(Arc::as_ptr(&klass) as u64)
            }
            MetadataRef::Method(id) => self.method(id).ok().map(|m| m.address()),
        }
    }
}
