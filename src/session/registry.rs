//! Attached objects of one session.
//!
//! Slots live in a generational arena so a stale [`ObjectKey`] held after a
//! detach can never reach an object attached later in the same slot. The
//! receiver thread is the only writer; other threads read through the
//! session's lock.

use crate::object::ObjectCore;
use crate::types::{InstanceId, ObjectId, INSTANCE_MAX};
use ahash::AHashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObjectKey {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

struct Entry {
    id: ObjectId,
    instance_id: InstanceId,
    core: Arc<ObjectCore>,
}

pub(crate) struct ObjectRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_id: AHashMap<ObjectId, Vec<(InstanceId, ObjectKey)>>,
    next_instance: InstanceId,
    #[cfg(debug_assertions)]
    writer: Option<std::thread::ThreadId>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        ObjectRegistry {
            slots: Vec::new(),
            free: Vec::new(),
            by_id: AHashMap::new(),
            next_instance: 0,
            #[cfg(debug_assertions)]
            writer: None,
        }
    }

    #[cfg(debug_assertions)]
    fn check_writer(&mut self) {
        let current = std::thread::current().id();
        let writer = *self.writer.get_or_insert(current);
        debug_assert_eq!(writer, current, "object registry mutated from two threads");
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn check_writer(&mut self) {}

    fn next_instance_id(&mut self) -> InstanceId {
        let id = self.next_instance;
        self.next_instance = if id >= INSTANCE_MAX { 0 } else { id + 1 };
        id
    }

    /// Attach `core` under `id` and return its key and instance id.
    pub fn insert(&mut self, id: ObjectId, core: Arc<ObjectCore>) -> (ObjectKey, InstanceId) {
        self.check_writer();
        let instance_id = self.next_instance_id();
        let entry = Entry {
            id,
            instance_id,
            core,
        };

        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                ObjectKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                ObjectKey {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.by_id.entry(id).or_default().push((instance_id, key));
        (key, instance_id)
    }

    pub fn remove(&mut self, key: ObjectKey) -> Option<Arc<ObjectCore>> {
        self.check_writer();
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);

        if let Some(instances) = self.by_id.get_mut(&entry.id) {
            instances.retain(|(_, k)| *k != key);
            if instances.is_empty() {
                self.by_id.remove(&entry.id);
            }
        }
        Some(entry.core)
    }

    pub fn get(&self, key: ObjectKey) -> Option<&Arc<ObjectCore>> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_ref().map(|e| &e.core)
    }

    pub fn instance(&self, id: ObjectId, instance_id: InstanceId) -> Option<Arc<ObjectCore>> {
        self.by_id
            .get(&id)?
            .iter()
            .find(|(iid, _)| *iid == instance_id)
            .and_then(|(_, key)| self.get(*key))
            .cloned()
    }

    pub fn instances(&self, id: ObjectId) -> Vec<Arc<ObjectCore>> {
        self.by_id
            .get(&id)
            .map(|instances| {
                instances
                    .iter()
                    .filter_map(|(_, key)| self.get(*key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The local master instance of `id`, if any.
    pub fn master(&self, id: ObjectId) -> Option<Arc<ObjectCore>> {
        self.instances(id).into_iter().find(|core| core.is_master())
    }

    pub fn masters(&self) -> Vec<Arc<ObjectCore>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|entry| entry.core.is_master())
            .map(|entry| entry.core.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, returning the cores for teardown.
    pub fn drain(&mut self) -> Vec<Arc<ObjectCore>> {
        self.by_id.clear();
        self.free.clear();
        let cores = self
            .slots
            .drain(..)
            .filter_map(|slot| slot.entry.map(|e| e.core))
            .collect();
        #[cfg(debug_assertions)]
        {
            self.writer = None;
        }
        cores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Distributable, Distributed, Object};
    use crate::stream::{DataIStream, DataOStream, StreamError};

    struct Unit;

    impl Distributable for Unit {
        fn get_instance_data(&self, _os: &mut DataOStream) -> Result<(), StreamError> {
            Ok(())
        }

        fn apply_instance_data(&mut self, _is: &mut DataIStream) -> Result<(), StreamError> {
            Ok(())
        }
    }

    fn core() -> Arc<ObjectCore> {
        Object::new(Unit).core().clone()
    }

    #[test]
    fn test_instances_of_one_id() {
        let mut registry = ObjectRegistry::new();
        let (_, first) = registry.insert(ObjectId(7), core());
        let (_, second) = registry.insert(ObjectId(7), core());
        registry.insert(ObjectId(8), core());

        assert_ne!(first, second);
        assert_eq!(registry.instances(ObjectId(7)).len(), 2);
        assert!(registry.instance(ObjectId(7), second).is_some());
        assert!(registry.instance(ObjectId(8), second).is_none());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_stale_key_misses_reused_slot() {
        let mut registry = ObjectRegistry::new();
        let (old_key, _) = registry.insert(ObjectId(1), core());
        assert!(registry.remove(old_key).is_some());
        assert!(registry.instances(ObjectId(1)).is_empty());

        let (new_key, _) = registry.insert(ObjectId(2), core());
        assert_eq!(new_key.index, old_key.index);
        assert!(registry.get(old_key).is_none());
        assert!(registry.remove(old_key).is_none());
        assert!(registry.get(new_key).is_some());
    }

    #[test]
    fn test_no_master_among_unattached_cores() {
        let mut registry = ObjectRegistry::new();
        registry.insert(ObjectId(3), core());
        assert!(registry.master(ObjectId(3)).is_none());
        assert!(registry.masters().is_empty());
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }
}
