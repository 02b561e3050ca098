//! One tag: a self-balancing collection of groups.
//!
//! A label owns an insertion-ordered list of groups and a round-robin cursor
//! used for inserts. Structural reorganization (expansion, shrink, rebalance,
//! destruction) is driven externally: `status()` classifies the label, and a
//! single worker applies the matching operation. The label's own lock
//! serializes structural ops against adds, deletes, and broadcasts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::info;

use super::group::{GroupInfo, GroupPool};
use super::list::GroupList;
use super::LabelError;
use crate::member::MemberRef;
use crate::now_unix;

/// Seconds an empty label may linger before it is marked for destruction.
pub const DESTROY_AGE_SECS: u64 = 30;

/// Classification computed by [`Label::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelStatus {
    /// Group count and distribution are acceptable.
    Normal,
    /// More groups are needed to stay within per-group capacity.
    ShouldExpand,
    /// Fewer groups suffice; sparse remainders should be concentrated.
    ShouldShrink,
    /// Group count is right but per-group counts drifted too far apart.
    ShouldRebalance,
    /// The label has been empty long enough to be torn down.
    ShouldDestroy,
}

/// Point-in-time view of one label.
#[derive(Debug, Clone, Serialize)]
pub struct LabelInfo {
    pub name: String,
    pub online: usize,
    pub limit: usize,
    pub created_unix: u64,
    pub status: LabelStatus,
    pub group_count: usize,
    pub change: u64,
    pub groups: Vec<GroupInfo>,
}

struct LabelInner {
    groups: GroupList,
    /// Node index of the next insert target. Always a live node while the
    /// list is non-empty.
    cursor: usize,
    /// Members across all groups.
    num: usize,
    /// Target group count computed by the previous `status()` pass.
    prev_target: usize,
    /// Structural mutations applied so far.
    change: u64,
    flag: LabelStatus,
}

/// A named, self-balancing set of groups.
pub struct Label {
    name: String,
    limit: usize,
    created_unix: AtomicU64,
    pool: Arc<GroupPool>,
    inner: RwLock<LabelInner>,
}

impl Label {
    /// Creates a label with a single empty group.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::BadParam`] for an empty tag or zero capacity.
    pub fn new(name: &str, limit: usize, pool: Arc<GroupPool>) -> Result<Self, LabelError> {
        if name.is_empty() || limit == 0 {
            return Err(LabelError::BadParam);
        }
        let mut groups = GroupList::new();
        let cursor = groups.push_back(pool.get(limit));
        Ok(Self {
            name: name.to_string(),
            limit,
            created_unix: AtomicU64::new(now_unix()),
            pool,
            inner: RwLock::new(LabelInner {
                groups,
                cursor,
                num: 0,
                prev_target: 1,
                change: 0,
                flag: LabelStatus::Normal,
            }),
        })
    }

    /// The tag this label serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-group member capacity.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Members across all groups.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().num
    }

    /// Live group count.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.inner.read().groups.len()
    }

    /// Inserts a member into the group at the cursor and advances the cursor
    /// round-robin. Re-adding an identity overwrites in place without
    /// changing the count. Never fails on capacity; overflow is absorbed by
    /// the status machine and a later expansion.
    pub fn add(&self, member: MemberRef) {
        let mut inner = self.inner.write();
        let index = if inner.groups.contains(inner.cursor) {
            inner.cursor
        } else {
            match inner.groups.head() {
                Some(head) => head,
                None => return,
            }
        };
        let outcome = match inner.groups.get(index) {
            Some(group) => group.add(member),
            None => return,
        };
        if !outcome.replaced {
            inner.num += 1;
        }
        if let Some(next) = inner.groups.next_wrapping(index) {
            inner.cursor = next;
        }
    }

    /// Removes the given identities from every group, returning those
    /// actually removed and the remaining member count.
    pub fn delete(&self, identities: &[String]) -> (Vec<String>, usize) {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        for (_, group) in inner.groups.iter() {
            let (hit, _) = group.delete(identities);
            removed.extend(hit);
        }
        inner.num = inner.num.saturating_sub(removed.len());
        let remaining = inner.num;
        (removed, remaining)
    }

    /// Fans `payload` out across every group. With a non-empty `tags` set the
    /// fan-out is an inner join: only members holding every tag receive the
    /// frame. Returns the identities whose delivery failed.
    pub fn broadcast(&self, payload: &Bytes, tags: &[String]) -> Vec<String> {
        let inner = self.inner.read();
        let mut failed = Vec::new();
        for (_, group) in inner.groups.iter() {
            if tags.is_empty() {
                failed.extend(group.broadcast(payload));
            } else {
                failed.extend(group.broadcast_inner_join(payload, tags));
            }
        }
        failed
    }

    /// Classifies the label for the supervisor.
    ///
    /// The rebalance check only fires at steady state: the current group
    /// count must equal both the freshly computed target and the target from
    /// the previous pass, so a label is never rebalanced while an expansion
    /// or shrink is still pending.
    pub fn status(&self) -> LabelStatus {
        let mut inner = self.inner.write();
        if inner.num == 0 && self.age_secs() > DESTROY_AGE_SECS {
            inner.flag = LabelStatus::ShouldDestroy;
            return inner.flag;
        }

        let target = inner.num / self.limit + 1;
        let current = inner.groups.len();
        if target == current && target == inner.prev_target && inner.num > 0 {
            let mut max = 0usize;
            let mut min = usize::MAX;
            for (_, group) in inner.groups.iter() {
                let count = group.count();
                max = max.max(count);
                min = min.min(count);
            }
            inner.flag = if max - min >= self.limit / 3 {
                LabelStatus::ShouldRebalance
            } else {
                LabelStatus::Normal
            };
            return inner.flag;
        }

        inner.prev_target = target;
        inner.flag = if target > current {
            LabelStatus::ShouldExpand
        } else if target < current {
            LabelStatus::ShouldShrink
        } else {
            LabelStatus::Normal
        };
        inner.flag
    }

    /// Appends fresh groups until the group count reaches the target. The
    /// cursor is untouched.
    pub fn expansion(&self) {
        let mut inner = self.inner.write();
        let target = inner.num / self.limit + 1;
        let before = inner.groups.len();
        while inner.groups.len() < target {
            let group = self.pool.get(self.limit);
            inner.groups.push_back(group);
        }
        if inner.groups.len() > before {
            inner.change += 1;
            info!(
                label = %self.name,
                groups = inner.groups.len(),
                "label expanded"
            );
        }
    }

    /// Frees groups from the head until the group count reaches the target,
    /// then concentrates the freed members into the new head group.
    pub fn shrinks(&self) {
        let mut inner = self.inner.write();
        let target = inner.num / self.limit + 1;
        if inner.groups.len() <= target {
            return;
        }
        let mut freed = Vec::new();
        while inner.groups.len() > target {
            let Some(head) = inner.groups.head() else {
                break;
            };
            if let Some(group) = inner.groups.remove(head) {
                freed.extend(group.free());
                self.pool.put(group);
            }
        }
        if let Some(head) = inner.groups.head() {
            if let Some(group) = inner.groups.get(head) {
                group.add_many(freed);
            }
            if !inner.groups.contains(inner.cursor) {
                inner.cursor = head;
            }
        }
        inner.change += 1;
        info!(
            label = %self.name,
            groups = inner.groups.len(),
            "label shrunk"
        );
    }

    /// Single-pass rebalance.
    ///
    /// With `fill = num / groups`, overfull groups shed down to `fill` into a
    /// carry list and underfull groups draw up to `fill` from it. A group
    /// that finds the carry empty (its donor appears later in the list) is
    /// deferred onto a low-load list and topped up after the pass. The
    /// division remainder is then sprinkled one member per group, so every
    /// group ends at `fill` or `fill + 1`.
    pub fn balance(&self) {
        let mut inner = self.inner.write();
        let current = inner.groups.len();
        if current == 0 || inner.num == 0 {
            return;
        }
        let fill = inner.num / current;
        let avg = fill + 1;

        let order: Vec<usize> = inner.groups.iter().map(|(index, _)| index).collect();
        let mut steals: Vec<MemberRef> = Vec::new();
        let mut low_load: Vec<usize> = Vec::new();

        for index in &order {
            let Some(group) = inner.groups.get(*index) else {
                continue;
            };
            let count = group.count();
            if count > fill {
                steals.extend(group.move_out(count - fill));
            } else if count < fill {
                let want = fill - count;
                let take = want.min(steals.len());
                if take > 0 {
                    group.add_many(steals.drain(..take).collect());
                }
                if take < want {
                    low_load.push(*index);
                }
            }
        }

        // Deferred groups: their donors appeared later in the walk, so the
        // carry now holds enough for all of them.
        for index in &low_load {
            if steals.is_empty() {
                break;
            }
            let Some(group) = inner.groups.get(*index) else {
                continue;
            };
            let want = fill.saturating_sub(group.count());
            let take = want.min(steals.len());
            if take > 0 {
                group.add_many(steals.drain(..take).collect());
            }
        }

        // Remainder of the division: at most one extra member per group.
        while !steals.is_empty() {
            let mut placed = false;
            for index in &order {
                if steals.is_empty() {
                    break;
                }
                let Some(group) = inner.groups.get(*index) else {
                    continue;
                };
                if group.count() < avg {
                    if let Some(member) = steals.pop() {
                        group.add_many(vec![member]);
                        placed = true;
                    }
                }
            }
            if !placed {
                if let Some(group) = inner.groups.head().and_then(|head| inner.groups.get(head)) {
                    group.add_many(std::mem::take(&mut steals));
                }
                break;
            }
        }

        inner.change += 1;
        info!(label = %self.name, groups = current, online = inner.num, "label rebalanced");
    }

    /// Tears the label down, returning its groups to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::GroupNotClear`] while any member remains.
    pub fn destroy(&self) -> Result<(), LabelError> {
        let mut inner = self.inner.write();
        if inner.num > 0 {
            return Err(LabelError::GroupNotClear);
        }
        while let Some(head) = inner.groups.head() {
            if let Some(group) = inner.groups.remove(head) {
                group.free();
                self.pool.put(group);
            }
        }
        Ok(())
    }

    /// Snapshot for the labels endpoint.
    #[must_use]
    pub fn info(&self) -> LabelInfo {
        let inner = self.inner.read();
        LabelInfo {
            name: self.name.clone(),
            online: inner.num,
            limit: self.limit,
            created_unix: self.created_unix.load(Ordering::Relaxed),
            status: inner.flag,
            group_count: inner.groups.len(),
            change: inner.change,
            groups: inner.groups.iter().map(|(_, group)| group.info()).collect(),
        }
    }

    /// Largest and smallest per-group member counts.
    #[must_use]
    pub fn group_spread(&self) -> (usize, usize) {
        let inner = self.inner.read();
        let mut max = 0usize;
        let mut min = usize::MAX;
        for (_, group) in inner.groups.iter() {
            let count = group.count();
            max = max.max(count);
            min = min.min(count);
        }
        if min == usize::MAX {
            (0, 0)
        } else {
            (max, min)
        }
    }

    fn age_secs(&self) -> u64 {
        now_unix().saturating_sub(self.created_unix.load(Ordering::Relaxed))
    }

    fn reinit(&mut self, name: &str, limit: usize) {
        self.name = name.to_string();
        self.limit = limit;
        self.created_unix.store(now_unix(), Ordering::Relaxed);
        let inner = self.inner.get_mut();
        debug_assert!(inner.groups.is_empty(), "pooled label not reset");
        let cursor = inner.groups.push_back(self.pool.get(limit));
        inner.cursor = cursor;
        inner.num = 0;
        inner.prev_target = 1;
        inner.change = 0;
        inner.flag = LabelStatus::Normal;
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, secs: u64) {
        self.created_unix
            .fetch_sub(secs, Ordering::Relaxed);
    }
}

/// Reuse pool for labels.
///
/// A label is only pooled once every outstanding handle to it is gone, so a
/// stale handle can never reach a reused label.
#[derive(Default)]
pub struct LabelPool {
    slots: Mutex<Vec<Label>>,
}

impl LabelPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a label for `name`, reusing a pooled one when available.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::BadParam`] for an empty tag or zero capacity.
    pub fn get(
        &self,
        name: &str,
        limit: usize,
        pool: &Arc<GroupPool>,
    ) -> Result<Label, LabelError> {
        if name.is_empty() || limit == 0 {
            return Err(LabelError::BadParam);
        }
        if let Some(mut label) = self.slots.lock().pop() {
            label.reinit(name, limit);
            Ok(label)
        } else {
            Label::new(name, limit, Arc::clone(pool))
        }
    }

    /// Stores a destroyed label for reuse. The caller must have called
    /// [`Label::destroy`] first.
    pub fn put(&self, label: Label) {
        self.slots.lock().push(label);
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.slots.lock().len()
    }
}
