//! Installable interception points
//!
//! Host clients are reached through [`Slot`]s: a handle resolves the slot's
//! current implementation on every call. A [`PatchTarget`] groups the slots
//! of one host client under attribute names, and the [`PatchRegistry`] swaps
//! a slot's implementation for a wrapping one while remembering the original
//! so the change can be reverted.
//!
//! Installing is idempotent per slot: installing again first reverts the live
//! patch, so wrappers never stack.

use std::any::{self, Any};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("target '{target}' has no attribute '{attribute}'")]
    MissingAttribute { target: String, attribute: String },

    #[error("attribute '{attribute}' of target '{target}' does not hold a {expected}")]
    SlotType {
        target: String,
        attribute: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Swappable shared implementation
pub struct Slot<T: ?Sized> {
    current: RwLock<Arc<T>>,
}

impl<T: ?Sized> Slot<T> {
    pub fn new(value: Arc<T>) -> Self {
        Self {
            current: RwLock::new(value),
        }
    }

    /// Current implementation
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a new implementation, returning the previous one
    pub fn replace(&self, value: Arc<T>) -> Arc<T> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        mem::replace(&mut *current, value)
    }

    fn holds(&self, value: &Arc<T>) -> bool {
        Arc::ptr_eq(&self.load(), value)
    }
}

impl<T: ?Sized> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("type", &any::type_name::<T>())
            .finish_non_exhaustive()
    }
}

/// Named collection of slots belonging to one host client
pub struct PatchTarget {
    package: String,
    service: String,
    name: String,
    slots: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl PatchTarget {
    pub fn new(
        package: impl Into<String>,
        service: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            service: service.into(),
            name: name.into(),
            slots: HashMap::new(),
        }
    }

    /// Expose a slot under an attribute name
    pub fn with_slot<T>(mut self, attribute: &str, slot: Arc<Slot<T>>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.slots
            .insert(attribute.to_string(), slot as Arc<dyn Any + Send + Sync>);
        self
    }

    /// Typed slot lookup
    pub fn slot<T>(&self, attribute: &str) -> Result<Arc<Slot<T>>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let slot = self
            .slots
            .get(attribute)
            .ok_or_else(|| PatchError::MissingAttribute {
                target: self.name.clone(),
                attribute: attribute.to_string(),
            })?;
        Arc::clone(slot)
            .downcast::<Slot<T>>()
            .map_err(|_| PatchError::SlotType {
                target: self.name.clone(),
                attribute: attribute.to_string(),
                expected: any::type_name::<Slot<T>>(),
            })
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.slots.contains_key(attribute)
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut attributes: Vec<&String> = self.slots.keys().collect();
        attributes.sort();
        f.debug_struct("PatchTarget")
            .field("package", &self.package)
            .field("service", &self.service)
            .field("name", &self.name)
            .field("attributes", &attributes)
            .finish()
    }
}

trait AppliedPatch: Send + Sync {
    fn revert(&self);

    /// Identity of the patched slot
    fn slot_id(&self) -> usize;
}

struct SlotPatch<T: ?Sized> {
    slot: Arc<Slot<T>>,
    original: Arc<T>,
    replacement: Arc<T>,
}

impl<T: ?Sized + Send + Sync> AppliedPatch for SlotPatch<T> {
    fn revert(&self) {
        if !self.slot.holds(&self.replacement) {
            tracing::debug!(
                slot = any::type_name::<T>(),
                "slot was replaced after patching, restoring original"
            );
        }
        self.slot.replace(Arc::clone(&self.original));
    }

    fn slot_id(&self) -> usize {
        Arc::as_ptr(&self.slot) as usize
    }
}

struct PatchRecord {
    component: String,
    target: String,
    attribute: String,
    patch: Box<dyn AppliedPatch>,
}

/// Live patches grouped by component
#[derive(Default)]
pub struct PatchRegistry {
    /// In install order
    applied: Mutex<Vec<PatchRecord>>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `target.attribute` with `wrap(original)`
    ///
    /// A live patch on the same slot, from any component, is reverted first.
    pub fn install<T, F>(
        &self,
        component: &str,
        target: &PatchTarget,
        attribute: &str,
        wrap: F,
    ) -> Result<()>
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce(Arc<T>) -> Arc<T>,
    {
        let slot = target.slot::<T>(attribute)?;
        let slot_id = Arc::as_ptr(&slot) as usize;

        let mut applied = self.lock();
        if let Some(pos) = applied.iter().position(|r| r.patch.slot_id() == slot_id) {
            let stale = applied.remove(pos);
            tracing::debug!(
                component = %stale.component,
                target = %stale.target,
                attribute = %stale.attribute,
                "reverting live patch before reinstalling"
            );
            stale.patch.revert();
        }

        let original = slot.load();
        let replacement = wrap(Arc::clone(&original));
        slot.replace(Arc::clone(&replacement));

        applied.push(PatchRecord {
            component: component.to_string(),
            target: target.name().to_string(),
            attribute: attribute.to_string(),
            patch: Box::new(SlotPatch {
                slot,
                original,
                replacement,
            }),
        });
        Ok(())
    }

    /// Restore every slot patched under `component`; returns how many
    pub fn revert(&self, component: &str) -> usize {
        let mut applied = self.lock();
        let (reverted, kept): (Vec<_>, Vec<_>) = mem::take(&mut *applied)
            .into_iter()
            .partition(|record| record.component == component);
        *applied = kept;
        drop(applied);

        for record in reverted.iter().rev() {
            record.patch.revert();
        }
        if !reverted.is_empty() {
            tracing::debug!(component, count = reverted.len(), "reverted patches");
        }
        reverted.len()
    }

    /// Restore every live patch
    pub fn revert_all(&self) -> usize {
        let applied = mem::take(&mut *self.lock());
        for record in applied.iter().rev() {
            record.patch.revert();
        }
        applied.len()
    }

    /// Number of live patches for a component
    pub fn applied(&self, component: &str) -> usize {
        self.lock()
            .iter()
            .filter(|record| record.component == component)
            .count()
    }

    /// Whether `target.attribute` currently carries a patch
    pub fn is_patched(&self, target: &PatchTarget, attribute: &str) -> bool {
        self.lock()
            .iter()
            .any(|record| record.target == target.name() && record.attribute == attribute)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PatchRecord>> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let applied = self.lock();
        let records: Vec<String> = applied
            .iter()
            .map(|r| format!("{}:{}.{}", r.component, r.target, r.attribute))
            .collect();
        f.debug_struct("PatchRegistry")
            .field("applied", &records)
            .finish()
    }
}
