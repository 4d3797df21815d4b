//! Item group tracking for one service.
//!
//! Groups live in an arena and refer to their merge target by index, so a
//! merge chain is an index walk. An update addressed to a group reaches
//! every group whose chain passes through it.

use std::collections::HashMap;

use feedwatch_core::{GroupId, State};

use crate::state::AggregateId;

pub type GroupHandle = usize;

#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub id: GroupId,
    pub status: Option<State>,
    pub merged_to: Option<GroupHandle>,
    /// Aggregates whose latest refresh/status carried this group id.
    pub items: Vec<AggregateId>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupTable {
    records: Vec<GroupRecord>,
    index: HashMap<GroupId, GroupHandle>,
}

impl GroupTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn handle(&self, id: &GroupId) -> Option<GroupHandle> {
        self.index.get(id).copied()
    }

    pub fn record(&self, handle: GroupHandle) -> Option<&GroupRecord> {
        self.records.get(handle)
    }

    /// Returns the handle for `id`, inserting an empty record if unknown.
    pub fn handle_or_insert(&mut self, id: &GroupId) -> GroupHandle {
        if let Some(handle) = self.index.get(id) {
            return *handle;
        }
        let handle = self.records.len();
        self.records.push(GroupRecord {
            id: id.clone(),
            status: None,
            merged_to: None,
            items: Vec::new(),
        });
        self.index.insert(id.clone(), handle);
        handle
    }

    pub fn add_item(&mut self, id: &GroupId, aggregate: AggregateId) {
        let handle = self.handle_or_insert(id);
        let items = &mut self.records[handle].items;
        if !items.contains(&aggregate) {
            items.push(aggregate);
        }
    }

    pub fn remove_item(&mut self, id: &GroupId, aggregate: AggregateId) {
        if let Some(handle) = self.index.get(id) {
            self.records[*handle].items.retain(|item| *item != aggregate);
        }
    }

    /// Records that `from` now merges into `to`. A merge that would close a
    /// cycle is ignored.
    pub fn merge(&mut self, from: &GroupId, to: &GroupId) {
        let from_handle = self.handle_or_insert(from);
        let to_handle = self.handle_or_insert(to);
        if from_handle == to_handle || self.chain_reaches(to_handle, from_handle) {
            return;
        }
        self.records[from_handle].merged_to = Some(to_handle);
    }

    fn chain_reaches(&self, start: GroupHandle, target: GroupHandle) -> bool {
        let mut current = Some(start);
        let mut steps = 0;
        while let Some(handle) = current {
            if handle == target {
                return true;
            }
            steps += 1;
            if steps > self.records.len() {
                return false;
            }
            current = self.records.get(handle).and_then(|record| record.merged_to);
        }
        false
    }

    /// Items reached by an update addressed to `id`: its own items plus the
    /// items of every group chaining into it, in arena order.
    pub fn affected_items(&self, id: &GroupId) -> Vec<AggregateId> {
        let Some(target) = self.handle(id) else {
            return Vec::new();
        };
        let mut items = Vec::new();
        for (handle, record) in self.records.iter().enumerate() {
            if !self.chain_reaches(handle, target) {
                continue;
            }
            for item in &record.items {
                if !items.contains(item) {
                    items.push(*item);
                }
            }
        }
        items
    }

    pub fn set_status(&mut self, id: &GroupId, status: State) {
        let handle = self.handle_or_insert(id);
        self.records[handle].status = Some(status);
    }
}

#[cfg(test)]
mod tests {
    use super::GroupTable;
    use feedwatch_core::{GroupId, State};

    #[test]
    fn unknown_group_is_recorded_without_items() {
        let mut table = GroupTable::default();
        table.set_status(&GroupId::from_u16(9), State::open_suspect("down"));
        assert_eq!(table.len(), 1);
        assert!(table.affected_items(&GroupId::from_u16(9)).is_empty());
    }

    #[test]
    fn update_to_merge_target_reaches_merged_groups() {
        let mut table = GroupTable::default();
        let a = GroupId::from_u16(1);
        let b = GroupId::from_u16(2);
        let c = GroupId::from_u16(3);
        table.add_item(&a, 10);
        table.add_item(&b, 20);
        table.add_item(&c, 30);

        table.merge(&a, &b);
        table.merge(&b, &c);

        assert_eq!(table.affected_items(&c), vec![10, 20, 30]);
        assert_eq!(table.affected_items(&b), vec![10, 20]);
        assert_eq!(table.affected_items(&a), vec![10]);
    }

    #[test]
    fn cyclic_merge_is_ignored() {
        let mut table = GroupTable::default();
        let a = GroupId::from_u16(1);
        let b = GroupId::from_u16(2);
        table.add_item(&a, 1);
        table.add_item(&b, 2);
        table.merge(&a, &b);
        table.merge(&b, &a);
        assert_eq!(table.affected_items(&b), vec![1, 2]);
        assert_eq!(table.affected_items(&a), vec![1]);
    }

    #[test]
    fn removed_items_are_no_longer_affected() {
        let mut table = GroupTable::default();
        let a = GroupId::from_u16(1);
        table.add_item(&a, 1);
        table.add_item(&a, 1);
        table.add_item(&a, 2);
        table.remove_item(&a, 1);
        assert_eq!(table.affected_items(&a), vec![2]);
    }
}
