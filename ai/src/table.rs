//! The table of objects resident on this node.

use crate::object::ObjectEntry;
use shared::DoId;
use std::collections::HashMap;

#[derive(Default)]
pub struct ObjectTable {
    objects: HashMap<DoId, ObjectEntry>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing any previous entry with the same id.
    pub fn insert(&mut self, entry: ObjectEntry) -> Option<ObjectEntry> {
        self.objects.insert(entry.core.do_id, entry)
    }

    pub fn remove(&mut self, do_id: DoId) -> Option<ObjectEntry> {
        self.objects.remove(&do_id)
    }

    pub fn get(&self, do_id: DoId) -> Option<&ObjectEntry> {
        self.objects.get(&do_id)
    }

    pub fn get_mut(&mut self, do_id: DoId) -> Option<&mut ObjectEntry> {
        self.objects.get_mut(&do_id)
    }

    pub fn contains(&self, do_id: DoId) -> bool {
        self.objects.contains_key(&do_id)
    }

    pub fn class_of(&self, do_id: DoId) -> Option<u16> {
        self.get(do_id).map(|entry| entry.core.class_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = DoId> + '_ {
        self.objects.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
