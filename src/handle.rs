//! Ownership primitives shared by every driver object.
//!
//! * [`Handle`] is the opaque, copyable name a client holds. It is an index into
//!   a type-specific [`Arena`] plus a generation counter, so a handle that
//!   outlives its object is detected instead of aliasing a newer one.
//! * [`ScopedHandle`] is shared ownership of a resource with a destroy callback
//!   that runs exactly once, when the last clone drops. Holding a clone keeps a
//!   dependency alive, which is how teardown order is made dependency-safe.

use crate::error::{UmdError, UmdResult};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

// ===============================================================================================
// Handle
// ===============================================================================================

pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Packs the handle into the pointer-sized value handed across the C boundary.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Rebuilds a handle from its raw form. Validity is checked on use, not here.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_raw(raw: u64) -> Self {
        Self::new(raw as u32, (raw >> 32) as u32)
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_raw().hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

// ===============================================================================================
// Arena
// ===============================================================================================

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct ArenaInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// A generation-checked slot arena for one object type.
pub struct Arena<T> {
    kind: &'static str,
    inner: RwLock<ArenaInner<T>>,
}

impl<T> Arena<T> {
    #[must_use]
    pub const fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: RwLock::new(ArenaInner {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Inserts an object built from its own handle.
    pub fn insert_with(
        &self,
        build: impl FnOnce(Handle<T>) -> T,
    ) -> UmdResult<(Handle<T>, Arc<T>)> {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(i) => i,
            None => {
                let i = u32::try_from(inner.slots.len()).map_err(|_| UmdError::OutOfMemory)?;
                // Generation 0 is never handed out, so a zeroed raw handle is always invalid.
                inner.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                i
            }
        };

        let slot = &mut inner.slots[index as usize];
        let handle = Handle::new(index, slot.generation);
        let value = Arc::new(build(handle));
        slot.value = Some(value.clone());
        inner.live += 1;
        Ok((handle, value))
    }

    /// Resolves a handle, rejecting stale and foreign ones.
    pub fn get(&self, handle: Handle<T>) -> UmdResult<Arc<T>> {
        let inner = self.inner.read();
        inner
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.clone())
            .ok_or_else(|| UmdError::stale(self.kind, handle))
    }

    /// Removes an object if `check` approves. A rejected removal leaves the
    /// object in place and returns the check's error.
    pub fn remove_if(
        &self,
        handle: Handle<T>,
        check: impl FnOnce(&T) -> UmdResult<()>,
    ) -> UmdResult<Arc<T>> {
        let mut inner = self.inner.write();
        let slot = inner
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
            .ok_or_else(|| UmdError::stale(self.kind, handle))?;

        if let Some(value) = slot.value.as_deref() {
            check(value)?;
        }

        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        inner.free.push(handle.index);
        inner.live -= 1;
        value.ok_or_else(|| UmdError::stale(self.kind, handle))
    }

    pub fn remove(&self, handle: Handle<T>) -> UmdResult<Arc<T>> {
        self.remove_if(handle, |_| Ok(()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live objects.
    #[must_use]
    pub fn values(&self) -> Vec<Arc<T>> {
        self.inner
            .read()
            .slots
            .iter()
            .filter_map(|slot| slot.value.clone())
            .collect()
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("kind", &self.kind)
            .field("live", &self.len())
            .finish()
    }
}

// ===============================================================================================
// ScopedHandle
// ===============================================================================================

type DestroyFn<T> = Box<dyn FnOnce(&T) + Send>;

struct ScopedInner<T> {
    value: T,
    on_destroy: Mutex<Option<DestroyFn<T>>>,
}

impl<T> Drop for ScopedInner<T> {
    fn drop(&mut self) {
        if let Some(destroy) = self.on_destroy.get_mut().take() {
            destroy(&self.value);
        }
    }
}

/// Reference-counted ownership with an exactly-once destroy callback.
pub struct ScopedHandle<T> {
    inner: Arc<ScopedInner<T>>,
}

impl<T> ScopedHandle<T> {
    pub fn new(value: T, on_destroy: impl FnOnce(&T) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(ScopedInner {
                value,
                on_destroy: Mutex::new(Some(Box::new(on_destroy))),
            }),
        }
    }

    /// Number of live clones, including this one.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for ScopedHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Deref for ScopedHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: fmt::Debug> fmt::Debug for ScopedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedHandle")
            .field("value", &self.inner.value)
            .field("refs", &self.ref_count())
            .finish()
    }
}
