//! Capacity-bounded member set, the storage unit inside a label.
//!
//! A group holds up to `capacity` members (transiently more, until the label
//! expands) keyed by identity. Groups support bulk extraction for rebalance
//! and shrink, and two broadcast flavors: plain fan-out and inner-join
//! fan-out filtered by tag membership.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::member::MemberRef;
use crate::now_unix;

/// Result of inserting a single member into a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// The identity was already present; the entry was overwritten and the
    /// member count did not change.
    pub replaced: bool,
    /// The post-insert count exceeds the declared capacity.
    pub over_capacity: bool,
}

/// Point-in-time view of one group, exposed by the labels endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    /// Members currently stored.
    pub online: usize,
    /// Remaining headroom, `capacity - online`. Negative while overfull.
    pub load: i64,
    /// Unix seconds at which the group was (re)issued from the pool.
    pub created_unix: u64,
}

/// A bounded sub-container of a label.
pub struct Group {
    capacity: usize,
    created_unix: u64,
    set: RwLock<HashMap<String, MemberRef>>,
}

impl Group {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            created_unix: now_unix(),
            set: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Declared member capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current member count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.set.read().len()
    }

    /// Inserts one member, overwriting any entry with the same identity.
    pub fn add(&self, member: MemberRef) -> AddOutcome {
        let mut set = self.set.write();
        let replaced = set.insert(member.identity().to_string(), member).is_some();
        AddOutcome {
            replaced,
            over_capacity: set.len() > self.capacity,
        }
    }

    /// Bulk insert. Idempotent per identity: existing entries are overwritten
    /// without changing the count.
    pub fn add_many(&self, members: Vec<MemberRef>) {
        let mut set = self.set.write();
        for member in members {
            set.insert(member.identity().to_string(), member);
        }
    }

    /// Removes the given identities, returning those actually removed and the
    /// remaining count.
    pub fn delete(&self, identities: &[String]) -> (Vec<String>, usize) {
        let mut set = self.set.write();
        let mut removed = Vec::new();
        for identity in identities {
            if set.remove(identity).is_some() {
                removed.push(identity.clone());
            }
        }
        (removed, set.len())
    }

    /// Atomically extracts up to `n` members in map iteration order.
    ///
    /// The order is arbitrary but stable for a given map state, which is all
    /// rebalance and shrink require.
    pub fn move_out(&self, n: usize) -> Vec<MemberRef> {
        let mut set = self.set.write();
        let take = n.min(set.len());
        let keys: Vec<String> = set.keys().take(take).cloned().collect();
        let mut moved = Vec::with_capacity(take);
        for key in keys {
            if let Some(member) = set.remove(&key) {
                moved.push(member);
            }
        }
        moved
    }

    /// Extracts every member. Equivalent to `move_out(count)`.
    pub fn free(&self) -> Vec<MemberRef> {
        let count = self.set.read().len();
        self.move_out(count)
    }

    /// Delivers `payload` to every member, returning the identities whose
    /// delivery failed (closed or saturated).
    pub fn broadcast(&self, payload: &Bytes) -> Vec<String> {
        let set = self.set.read();
        let mut failed = Vec::new();
        for (identity, member) in set.iter() {
            if member.deliver(payload).is_err() {
                failed.push(identity.clone());
            }
        }
        failed
    }

    /// Delivers `payload` only to members holding every tag in `tags`,
    /// returning the identities whose delivery failed.
    pub fn broadcast_inner_join(&self, payload: &Bytes, tags: &[String]) -> Vec<String> {
        let set = self.set.read();
        let mut failed = Vec::new();
        for (identity, member) in set.iter() {
            if member.holds_all(tags) && member.deliver(payload).is_err() {
                failed.push(identity.clone());
            }
        }
        failed
    }

    /// Snapshot for monitoring.
    #[must_use]
    pub fn info(&self) -> GroupInfo {
        let online = self.set.read().len();
        GroupInfo {
            online,
            load: self.capacity as i64 - online as i64,
            created_unix: self.created_unix,
        }
    }

    fn reset(&mut self) {
        self.set.get_mut().clear();
        self.capacity = 0;
        self.created_unix = 0;
    }
}

/// Process-wide reuse pool for groups.
///
/// `put` resets the group before storing it; `get` re-arms capacity and the
/// creation stamp. The backing map keeps its allocation across reuse.
#[derive(Default)]
pub struct GroupPool {
    slots: Mutex<Vec<Group>>,
}

impl GroupPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a group with the given capacity, reusing a pooled one if
    /// available.
    #[must_use]
    pub fn get(&self, capacity: usize) -> Group {
        if let Some(mut group) = self.slots.lock().pop() {
            debug_assert!(group.set.get_mut().is_empty(), "pooled group not reset");
            group.capacity = capacity;
            group.created_unix = now_unix();
            group
        } else {
            Group::new(capacity)
        }
    }

    /// Resets and stores a group for reuse.
    pub fn put(&self, mut group: Group) {
        group.reset();
        self.slots.lock().push(group);
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::testutil::FakeMember;
    use crate::member::DeliverError;

    fn payload() -> Bytes {
        Bytes::from_static(b"frame")
    }

    #[test]
    fn add_reports_replacement_and_overflow() {
        let group = Group::new(2);
        let first = group.add(FakeMember::new("a").as_member());
        assert!(!first.replaced);
        assert!(!first.over_capacity);

        let again = group.add(FakeMember::new("a").as_member());
        assert!(again.replaced);
        assert_eq!(group.count(), 1);

        group.add(FakeMember::new("b").as_member());
        let third = group.add(FakeMember::new("c").as_member());
        assert!(third.over_capacity);
        assert_eq!(group.count(), 3);
    }

    #[test]
    fn delete_returns_removed_and_remaining() {
        let group = Group::new(4);
        group.add(FakeMember::new("a").as_member());
        group.add(FakeMember::new("b").as_member());

        let (removed, remaining) =
            group.delete(&["a".to_string(), "missing".to_string()]);
        assert_eq!(removed, vec!["a".to_string()]);
        assert_eq!(remaining, 1);
    }

    #[test]
    fn move_out_caps_at_count_and_marks_extraction() {
        let group = Group::new(4);
        for id in ["a", "b", "c"] {
            group.add(FakeMember::new(id).as_member());
        }
        let moved = group.move_out(10);
        assert_eq!(moved.len(), 3);
        assert_eq!(group.count(), 0);
    }

    #[test]
    fn free_empties_the_group() {
        let group = Group::new(4);
        group.add(FakeMember::new("a").as_member());
        group.add(FakeMember::new("b").as_member());
        assert_eq!(group.free().len(), 2);
        assert_eq!(group.count(), 0);
    }

    #[test]
    fn broadcast_collects_failed_identities() {
        let group = Group::new(4);
        let ok = FakeMember::new("ok");
        let weak = FakeMember::new("weak");
        weak.fail_with(DeliverError::Saturated);
        group.add(ok.as_member());
        group.add(weak.as_member());

        let failed = group.broadcast(&payload());
        assert_eq!(failed, vec!["weak".to_string()]);
        assert_eq!(ok.delivered(), 1);
    }

    #[test]
    fn inner_join_filters_by_tags() {
        let group = Group::new(4);
        let both = FakeMember::with_tags("both", &["v1", "room1"]);
        let one = FakeMember::with_tags("one", &["v1"]);
        group.add(both.as_member());
        group.add(one.as_member());

        let tags = vec!["v1".to_string(), "room1".to_string()];
        let failed = group.broadcast_inner_join(&payload(), &tags);
        assert!(failed.is_empty());
        assert_eq!(both.delivered(), 1);
        assert_eq!(one.delivered(), 0);
    }

    #[test]
    fn pool_resets_before_reuse() {
        let pool = GroupPool::new();
        let group = pool.get(8);
        group.add(FakeMember::new("a").as_member());
        let drained = group.free();
        assert_eq!(drained.len(), 1);
        pool.put(group);
        assert_eq!(pool.pooled(), 1);

        let reused = pool.get(16);
        assert_eq!(reused.capacity(), 16);
        assert_eq!(reused.count(), 0);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn info_reports_load() {
        let group = Group::new(4);
        group.add(FakeMember::new("a").as_member());
        let info = group.info();
        assert_eq!(info.online, 1);
        assert_eq!(info.load, 3);
    }
}
