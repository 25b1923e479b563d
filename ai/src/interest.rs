//! Parent/zone containment and arrival/departure notifications.
//!
//! [`change_location`] is the only way an object's membership changes. Its
//! notification order is observable by game code and must not be reordered:
//! leave-parent, leave-zone, arrive-parent, arrive-zone.

use crate::object::{ChildRef, Location};
use crate::table::ObjectTable;
use shared::DoId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct InterestTable {
    zone_members: HashMap<u32, HashSet<DoId>>,
    parent_children: HashMap<DoId, HashSet<DoId>>,
}

impl InterestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zone_members(&self, zone: u32) -> Option<&HashSet<DoId>> {
        self.zone_members.get(&zone)
    }

    pub fn children_of(&self, parent: DoId) -> Option<&HashSet<DoId>> {
        self.parent_children.get(&parent)
    }

    pub fn is_in_zone(&self, do_id: DoId, zone: u32) -> bool {
        self.zone_members(zone).is_some_and(|members| members.contains(&do_id))
    }

    pub fn is_child_of(&self, do_id: DoId, parent: DoId) -> bool {
        self.children_of(parent).is_some_and(|children| children.contains(&do_id))
    }

    /// Number of zones with at least one member.
    pub fn zone_count(&self) -> usize {
        self.zone_members.len()
    }

    pub fn parent_count(&self) -> usize {
        self.parent_children.len()
    }
}

fn remove_member<K>(map: &mut HashMap<K, HashSet<DoId>>, key: K, do_id: DoId)
where
    K: std::hash::Hash + Eq + Copy,
{
    if let Some(members) = map.get_mut(&key) {
        members.remove(&do_id);
        if members.is_empty() {
            map.remove(&key);
        }
    }
}

/// Moves `do_id` from `old` to `new`, updating the interest maps and the
/// object's stored location and firing the parents' hooks.
///
/// Parents that are not resident on this node are skipped silently.
pub fn change_location(
    objects: &mut ObjectTable,
    interest: &mut InterestTable,
    do_id: DoId,
    old: Location,
    new: Location,
) {
    if do_id == 0 {
        return;
    }

    let child = ChildRef {
        do_id,
        class_id: objects.class_of(do_id),
    };

    if old.parent != new.parent {
        if let Some(parent) = objects.get_mut(old.parent) {
            parent.behavior.handle_child_leave(&mut parent.core, &child, old.zone);
        }
    }

    if old.parent != 0 {
        remove_member(&mut interest.parent_children, old.parent, do_id);
    }

    if old.zone != new.zone {
        if let Some(parent) = objects.get_mut(old.parent) {
            parent.behavior.handle_child_leave_zone(&mut parent.core, &child, old.zone);
        }
    }

    if old.zone != 0 {
        remove_member(&mut interest.zone_members, old.zone, do_id);
    }

    if let Some(entry) = objects.get_mut(do_id) {
        entry.core.location = new;
    }

    if new.zone != 0 {
        interest.zone_members.entry(new.zone).or_default().insert(do_id);
    }

    if new.parent != 0 {
        interest.parent_children.entry(new.parent).or_default().insert(do_id);
    }

    if new.parent != old.parent {
        if let Some(parent) = objects.get_mut(new.parent) {
            parent.behavior.handle_child_arrive(&mut parent.core, &child, new.zone);
        }
    }

    if new.zone != old.zone {
        if let Some(parent) = objects.get_mut(new.parent) {
            parent.behavior.handle_child_arrive_zone(&mut parent.core, &child, new.zone);
        }
    }
}
