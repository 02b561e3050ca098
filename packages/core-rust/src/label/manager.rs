//! Tag → label map and the supervisor scan.
//!
//! The manager owns every label in the process. Its lock story is small: the
//! sharded map serializes tag creation and removal, while each label's own
//! lock serializes the operations on it. The periodic tasks that drive the
//! lifecycle live in the server crate; `scan` performs one supervisor pass
//! and returns the structural work it found.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::group::GroupPool;
use super::target::{Label, LabelInfo, LabelPool, LabelStatus};
use super::LabelError;
use crate::member::MemberRef;

/// Per-group member capacity used when the embedder does not override it.
pub const DEFAULT_GROUP_CAPACITY: usize = 20;

/// Structural work discovered by one supervisor pass.
pub enum LifecycleEvent {
    Expand(Arc<Label>),
    Shrink(Arc<Label>),
    Rebalance(Arc<Label>),
}

/// A member-side handle onto one label.
///
/// Connections keep one handle per tag they hold; when the registry reaps a
/// connection it walks the handles and detaches the identity, keeping labels
/// consistent with the registry without a global lookup.
#[derive(Clone)]
pub struct LabelHandle {
    label: Arc<Label>,
}

impl LabelHandle {
    /// The tag this handle detaches from.
    #[must_use]
    pub fn tag(&self) -> &str {
        self.label.name()
    }

    /// Removes the identities from the label, returning those actually
    /// removed and the label's remaining member count.
    pub fn delete(&self, identities: &[String]) -> (Vec<String>, usize) {
        self.label.delete(identities)
    }
}

/// Owner of every label in the process.
pub struct LabelManager {
    labels: DashMap<String, Arc<Label>>,
    limit: usize,
    groups: Arc<GroupPool>,
    pool: LabelPool,
}

impl LabelManager {
    /// Creates a manager whose labels use `group_capacity` members per
    /// group. A zero capacity falls back to [`DEFAULT_GROUP_CAPACITY`].
    #[must_use]
    pub fn new(group_capacity: usize) -> Self {
        Self {
            labels: DashMap::new(),
            limit: if group_capacity == 0 {
                DEFAULT_GROUP_CAPACITY
            } else {
                group_capacity
            },
            groups: Arc::new(GroupPool::new()),
            pool: LabelPool::new(),
        }
    }

    /// Attaches a member to `tag`, creating the label on first use.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::BadParam`] for an empty tag.
    pub fn add(&self, tag: &str, member: MemberRef) -> Result<LabelHandle, LabelError> {
        if tag.is_empty() {
            return Err(LabelError::BadParam);
        }
        let label = match self.labels.entry(tag.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let label = Arc::new(self.pool.get(tag, self.limit, &self.groups)?);
                entry.insert(Arc::clone(&label));
                label
            }
        };
        label.add(member);
        Ok(LabelHandle { label })
    }

    /// Number of live labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Snapshot of every label.
    #[must_use]
    pub fn list(&self) -> Vec<LabelInfo> {
        self.labels.iter().map(|entry| entry.value().info()).collect()
    }

    /// Snapshot of one label.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::NotExist`] for an unknown tag.
    pub fn info(&self, tag: &str) -> Result<LabelInfo, LabelError> {
        self.labels
            .get(tag)
            .map(|entry| entry.value().info())
            .ok_or(LabelError::NotExist)
    }

    /// Fans a distinct payload out to each named label. Unknown tags are
    /// skipped. Returns the identities whose delivery failed.
    #[must_use]
    pub fn broadcast_by_label(&self, frames: &HashMap<String, Bytes>) -> Vec<String> {
        let mut failed = Vec::new();
        for (tag, payload) in frames {
            if let Some(label) = self.labels.get(tag) {
                failed.extend(label.broadcast(payload, &[]));
            }
        }
        failed
    }

    /// Delivers `payload` to members holding *all* of `tags`.
    ///
    /// The scan runs over the smallest participating label, capping the work
    /// at the minimum cardinality across the set; each member is then asked
    /// for the remaining tags. Returns the identities whose delivery failed.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::BadParam`] for an empty tag set.
    pub fn broadcast_inner_join(
        &self,
        payload: &Bytes,
        tags: &[String],
    ) -> Result<Vec<String>, LabelError> {
        if tags.is_empty() {
            return Err(LabelError::BadParam);
        }
        let mut smallest: Option<Arc<Label>> = None;
        for tag in tags {
            if let Some(label) = self.labels.get(tag) {
                let candidate = Arc::clone(label.value());
                let replace = smallest
                    .as_ref()
                    .map_or(true, |current| candidate.count() < current.count());
                if replace {
                    smallest = Some(candidate);
                }
            }
        }
        Ok(match smallest {
            Some(label) => label.broadcast(payload, tags),
            None => Vec::new(),
        })
    }

    /// One supervisor pass: destroys aged-out empty labels inline and
    /// returns the expansion/shrink/rebalance work for the lifecycle worker.
    #[must_use]
    pub fn scan(&self) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        let mut doomed = Vec::new();
        for entry in &self.labels {
            match entry.value().status() {
                LabelStatus::Normal => {}
                LabelStatus::ShouldExpand => {
                    events.push(LifecycleEvent::Expand(Arc::clone(entry.value())));
                }
                LabelStatus::ShouldShrink => {
                    events.push(LifecycleEvent::Shrink(Arc::clone(entry.value())));
                }
                LabelStatus::ShouldRebalance => {
                    events.push(LifecycleEvent::Rebalance(Arc::clone(entry.value())));
                }
                LabelStatus::ShouldDestroy => doomed.push(entry.key().clone()),
            }
        }
        for tag in doomed {
            // Re-check emptiness under the shard lock: a member may have
            // arrived between the status pass and now.
            let removed = self
                .labels
                .remove_if(&tag, |_, label| label.count() == 0);
            if let Some((_, label)) = removed {
                debug!(label = %tag, "destroying idle label");
                if label.destroy().is_ok() {
                    if let Ok(label) = Arc::try_unwrap(label) {
                        self.pool.put(label);
                    }
                }
            }
        }
        events
    }
}
