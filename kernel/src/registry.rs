// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Type and instance registries.
//!
//! The type registry maps the portable numeric id of every concrete kernel
//! class to a constructor; it is the single source of truth for cross-node
//! identity and is immutable after composition. The instance registry is
//! the per-process table of live kernels addressable by id: parked parents
//! awaiting children and kernels saved for remote delivery.

use crate::errors::KernelError;
use crate::kernel::{Kernel, KernelPtr};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::any::TypeId;

type Ctor = Box<dyn Fn() -> KernelPtr + Send + Sync>;

struct KernelType {
    name: &'static str,
    ctor: Ctor,
}

#[derive(Default)]
pub struct TypeRegistry {
    by_id: AHashMap<u16, KernelType>,
    by_index: AHashMap<TypeId, u16>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a default-constructible kernel class under `id`.
    pub fn register<K>(&mut self, id: u16) -> Result<(), KernelError>
    where
        K: Kernel + Default + 'static,
    {
        self.register_ctor::<K>(id, || Box::new(K::default()))
    }

    /// Register with an explicit constructor; used by kernel classes that
    /// capture shared daemon state.
    pub fn register_ctor<K>(
        &mut self,
        id: u16,
        ctor: impl Fn() -> KernelPtr + Send + Sync + 'static,
    ) -> Result<(), KernelError>
    where
        K: Kernel + 'static,
    {
        if id == 0 || self.by_id.contains_key(&id) {
            return Err(KernelError::DuplicateType(id));
        }
        self.by_id.insert(
            id,
            KernelType { name: std::any::type_name::<K>(), ctor: Box::new(ctor) },
        );
        self.by_index.insert(TypeId::of::<K>(), id);
        Ok(())
    }

    pub fn contains(&self, id: u16) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn construct(&self, id: u16) -> Result<KernelPtr, KernelError> {
        let ty = self.by_id.get(&id).ok_or(KernelError::UnknownType(id))?;
        Ok((ty.ctor)())
    }

    /// Portable id of a live kernel's concrete class.
    pub fn id_of(&self, k: &dyn Kernel) -> Option<u16> {
        self.by_index.get(&k.as_any().type_id()).copied()
    }

    pub fn name_of(&self, id: u16) -> Option<&'static str> {
        self.by_id.get(&id).map(|ty| ty.name)
    }
}

#[derive(Default)]
struct Instances {
    parked: AHashMap<u64, KernelPtr>,
    /// Ids taken out by a worker for `react` and not yet re-parked.
    /// `contains` keeps answering true for them, so routing does not
    /// misdirect a sibling arriving mid-react.
    checked_out: ahash::AHashSet<u64>,
}

#[derive(Default)]
pub struct InstanceRegistry {
    instances: Mutex<Instances>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, k: KernelPtr) -> Result<(), KernelError> {
        if !k.base().has_id() {
            return Err(KernelError::MissingId);
        }
        let mut guard = self.instances.lock();
        guard.checked_out.remove(&k.base().id());
        guard.parked.insert(k.base().id(), k);
        Ok(())
    }

    pub fn take(&self, id: u64) -> Option<KernelPtr> {
        let mut guard = self.instances.lock();
        let k = guard.parked.remove(&id)?;
        guard.checked_out.insert(id);
        Some(k)
    }

    /// A taken kernel will not come back; forget its checked-out marker.
    pub fn discard(&self, id: u64) {
        self.instances.lock().checked_out.remove(&id);
    }

    pub fn contains(&self, id: u64) -> bool {
        let guard = self.instances.lock();
        guard.parked.contains_key(&id) || guard.checked_out.contains(&id)
    }

    /// Borrow a registered kernel under the registry lock.
    pub fn with<R>(&self, id: u64, f: impl FnOnce(Option<&dyn Kernel>) -> R) -> R {
        let guard = self.instances.lock();
        f(guard.parked.get(&id).map(|k| &**k))
    }

    pub fn len(&self) -> usize {
        self.instances.lock().parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().parked.is_empty()
    }

    /// Remove every kernel, e.g. into the shutdown sack.
    pub fn drain(&self) -> Vec<KernelPtr> {
        let mut guard = self.instances.lock();
        guard.checked_out.clear();
        guard.parked.drain().map(|(_, k)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelBase;
    use crate::kernel_base;

    #[derive(Default)]
    struct Ping {
        base: KernelBase,
    }

    impl Kernel for Ping {
        kernel_base!(base);
    }

    #[derive(Default)]
    struct Pong {
        base: KernelBase,
    }

    impl Kernel for Pong {
        kernel_base!(base);
    }

    #[test]
    fn type_lookup_both_directions() {
        let mut types = TypeRegistry::new();
        types.register::<Ping>(10).unwrap();
        types.register::<Pong>(11).unwrap();

        let ping = types.construct(10).unwrap();
        assert_eq!(types.id_of(&*ping), Some(10));
        let pong: Box<dyn Kernel> = Box::new(Pong::default());
        assert_eq!(types.id_of(&*pong), Some(11));
        assert!(types.construct(12).is_err());
    }

    #[test]
    fn duplicate_type_ids_are_rejected() {
        let mut types = TypeRegistry::new();
        types.register::<Ping>(10).unwrap();
        assert!(types.register::<Pong>(10).is_err());
        assert!(types.register::<Pong>(0).is_err());
    }

    #[test]
    fn instances_are_parked_and_taken_once() {
        let instances = InstanceRegistry::new();
        let mut k = Ping::default();
        k.base_mut().set_id(77);
        instances.insert(Box::new(k)).unwrap();
        assert!(instances.contains(77));
        let taken = instances.take(77).unwrap();
        assert!(instances.take(77).is_none());
        // checked out still counts as present until discarded
        assert!(instances.contains(77));
        instances.insert(taken).unwrap();
        assert!(instances.contains(77));
        let _ = instances.take(77);
        instances.discard(77);
        assert!(!instances.contains(77));
    }

    #[test]
    fn insert_requires_an_id() {
        let instances = InstanceRegistry::new();
        assert!(instances.insert(Box::new(Ping::default())).is_err());
    }
}
