use crate::{
    error::{RebacError, Result},
    models::*,
};
use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

/// Relationships matching a read, taken from one snapshot
pub type RelationshipIter = Box<dyn Iterator<Item = Relationship> + Send>;

/// Range of revisions a store can still serve reads at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionBounds {
    pub oldest_retained: Revision,
    pub head: Revision,
}

impl RevisionBounds {
    pub fn contains(&self, revision: Revision) -> bool {
        revision >= self.oldest_retained && revision <= self.head
    }
}

/// Versioned storage for relationship tuples
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Identifies this store instance; bound into consistency tokens
    fn store_id(&self) -> Uuid;

    /// Apply a batch atomically and return the revision it committed at.
    /// Touch upserts, delete removes if present. The last update for a key wins.
    async fn write(&self, updates: Vec<RelationshipUpdate>) -> Result<Revision>;

    /// Relationships matching the filter as of `at`
    async fn read(&self, filter: &RelationshipFilter, at: Revision) -> Result<RelationshipIter>;

    /// Relationships whose subject is exactly `subject`, optionally narrowed
    /// by relation and resource type, as of `at`
    async fn reverse_read(
        &self,
        subject: &SubjectReference,
        relation: Option<&str>,
        resource_type: Option<&str>,
        at: Revision,
    ) -> Result<RelationshipIter>;

    /// Distinct resources of a type that have at least one relationship as of `at`
    async fn resources_of_type(&self, resource_type: &str, at: Revision) -> Result<Vec<ObjectReference>>;

    async fn revision_bounds(&self) -> Result<RevisionBounds>;
}

type RecordId = u64;

#[derive(Debug, Clone)]
struct VersionedRelationship {
    relationship: Relationship,
    created_at: Revision,
    deleted_at: Option<Revision>,
}

impl VersionedRelationship {
    fn visible_at(&self, revision: Revision) -> bool {
        self.created_at <= revision && self.deleted_at.map_or(true, |deleted| deleted > revision)
    }
}

#[derive(Default)]
struct StoreState {
    records: BTreeMap<RecordId, VersionedRelationship>,
    next_id: RecordId,

    /// Records alive at head, by key
    live: AHashMap<Relationship, RecordId>,

    /// (resource, relation) -> records
    forward: AHashMap<(ObjectReference, String), Vec<RecordId>>,

    /// subject object -> records
    reverse: AHashMap<ObjectReference, Vec<RecordId>>,

    /// resource type -> records
    by_type: AHashMap<String, Vec<RecordId>>,

    /// Deletion revision -> records deleted at it, for garbage collection
    tombstones: BTreeMap<Revision, Vec<RecordId>>,

    head: Revision,
    oldest_retained: Revision,
}

impl StoreState {
    fn bounds(&self) -> RevisionBounds {
        RevisionBounds {
            oldest_retained: self.oldest_retained,
            head: self.head,
        }
    }

    fn ensure_readable(&self, at: Revision) -> Result<()> {
        if at < self.oldest_retained {
            return Err(RebacError::StaleToken {
                revision: at,
                oldest_retained: self.oldest_retained,
            });
        }
        if at > self.head {
            return Err(RebacError::InvalidToken(format!(
                "revision {} is ahead of head revision {}",
                at, self.head
            )));
        }
        Ok(())
    }

    fn insert(&mut self, relationship: Relationship, revision: Revision) {
        let id = self.next_id;
        self.next_id += 1;

        self.forward
            .entry((relationship.resource.clone(), relationship.relation.clone()))
            .or_default()
            .push(id);
        self.reverse
            .entry(relationship.subject.object.clone())
            .or_default()
            .push(id);
        self.by_type
            .entry(relationship.resource.object_type.clone())
            .or_default()
            .push(id);
        self.live.insert(relationship.clone(), id);
        self.records.insert(
            id,
            VersionedRelationship {
                relationship,
                created_at: revision,
                deleted_at: None,
            },
        );
    }

    fn remove(&mut self, relationship: &Relationship, revision: Revision) {
        if let Some(id) = self.live.remove(relationship) {
            if let Some(record) = self.records.get_mut(&id) {
                record.deleted_at = Some(revision);
            }
            self.tombstones.entry(revision).or_default().push(id);
        }
    }

    /// Drop records no retained revision can observe
    fn collect_garbage(&mut self, retention: u64) -> usize {
        self.oldest_retained = Revision(self.head.0.saturating_sub(retention));

        let expired: Vec<Revision> = self
            .tombstones
            .range(..=self.oldest_retained)
            .map(|(revision, _)| *revision)
            .collect();

        let mut removed = AHashSet::new();
        for revision in expired {
            if let Some(ids) = self.tombstones.remove(&revision) {
                removed.extend(ids);
            }
        }
        if removed.is_empty() {
            return 0;
        }

        for id in &removed {
            let Some(record) = self.records.remove(id) else {
                continue;
            };
            let rel = record.relationship;
            prune(&mut self.forward, &(rel.resource.clone(), rel.relation.clone()), &removed);
            prune(&mut self.reverse, &rel.subject.object, &removed);
            prune(&mut self.by_type, &rel.resource.object_type, &removed);
        }
        removed.len()
    }

    fn collect_visible<'a>(
        &self,
        ids: impl Iterator<Item = &'a RecordId>,
        at: Revision,
        predicate: impl Fn(&Relationship) -> bool,
    ) -> Vec<Relationship> {
        ids.filter_map(|id| self.records.get(id))
            .filter(|record| record.visible_at(at) && predicate(&record.relationship))
            .map(|record| record.relationship.clone())
            .collect()
    }
}

fn prune<K>(index: &mut AHashMap<K, Vec<RecordId>>, key: &K, removed: &AHashSet<RecordId>)
where
    K: std::hash::Hash + Eq,
{
    let emptied = match index.get_mut(key) {
        Some(ids) => {
            ids.retain(|id| !removed.contains(id));
            ids.is_empty()
        }
        None => false,
    };
    if emptied {
        index.remove(key);
    }
}

/// In-memory MVCC relationship store.
///
/// Every committed batch gets a new revision; records carry the revision they
/// were created and deleted at, so reads at any retained revision see a stable
/// snapshot while writes continue. Writers are serialized by the state lock.
pub struct InMemoryRelationshipStore {
    id: Uuid,
    retention: u64,
    state: RwLock<StoreState>,
}

impl InMemoryRelationshipStore {
    /// `retention` is the number of revisions behind head that stay readable
    pub fn new(retention: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            retention,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Number of stored record versions, live or awaiting collection
    pub fn record_count(&self) -> usize {
        self.state.read().records.len()
    }
}

impl Default for InMemoryRelationshipStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl RelationshipStore for InMemoryRelationshipStore {
    fn store_id(&self) -> Uuid {
        self.id
    }

    async fn write(&self, updates: Vec<RelationshipUpdate>) -> Result<Revision> {
        // Collapse to the final operation per key, keeping first-seen order
        let mut positions: AHashMap<Relationship, usize> = AHashMap::new();
        let mut batch: Vec<(Relationship, UpdateOperation)> = Vec::with_capacity(updates.len());
        for update in updates {
            match positions.get(&update.relationship) {
                Some(&pos) => {
                    if let Some(entry) = batch.get_mut(pos) {
                        entry.1 = update.operation;
                    }
                }
                None => {
                    positions.insert(update.relationship.clone(), batch.len());
                    batch.push((update.relationship, update.operation));
                }
            }
        }

        let mut state = self.state.write();
        let revision = state.head.next();

        let mut touched = 0usize;
        let mut deleted = 0usize;
        for (relationship, operation) in batch {
            match operation {
                UpdateOperation::Touch => {
                    if !state.live.contains_key(&relationship) {
                        state.insert(relationship, revision);
                        touched += 1;
                    }
                }
                UpdateOperation::Delete => {
                    if state.live.contains_key(&relationship) {
                        state.remove(&relationship, revision);
                        deleted += 1;
                    }
                }
            }
        }

        state.head = revision;
        let collected = state.collect_garbage(self.retention);

        debug!(
            revision = %revision,
            inserted = touched,
            deleted = deleted,
            collected = collected,
            "Committed relationship batch"
        );
        Ok(revision)
    }

    async fn read(&self, filter: &RelationshipFilter, at: Revision) -> Result<RelationshipIter> {
        let state = self.state.read();
        state.ensure_readable(at)?;

        let matches = |rel: &Relationship| filter.matches(rel);
        let results = match (filter.exact_resource(), &filter.relation) {
            (Some(resource), Some(relation)) => {
                let ids = state.forward.get(&(resource, relation.clone()));
                state.collect_visible(ids.into_iter().flatten(), at, matches)
            }
            _ => match filter.subject.as_ref().and_then(|s| s.object()) {
                Some(subject) => {
                    let ids = state.reverse.get(&subject);
                    state.collect_visible(ids.into_iter().flatten(), at, matches)
                }
                None => match filter.resource_type {
                    Some(ref resource_type) => {
                        let ids = state.by_type.get(resource_type);
                        state.collect_visible(ids.into_iter().flatten(), at, matches)
                    }
                    None => state.collect_visible(state.records.keys(), at, matches),
                },
            },
        };

        Ok(Box::new(results.into_iter()))
    }

    async fn reverse_read(
        &self,
        subject: &SubjectReference,
        relation: Option<&str>,
        resource_type: Option<&str>,
        at: Revision,
    ) -> Result<RelationshipIter> {
        let state = self.state.read();
        state.ensure_readable(at)?;

        let ids = state.reverse.get(&subject.object);
        let results = state.collect_visible(ids.into_iter().flatten(), at, |rel| {
            rel.subject == *subject
                && relation.map_or(true, |r| rel.relation == r)
                && resource_type.map_or(true, |t| rel.resource.object_type == t)
        });

        Ok(Box::new(results.into_iter()))
    }

    async fn resources_of_type(&self, resource_type: &str, at: Revision) -> Result<Vec<ObjectReference>> {
        let state = self.state.read();
        state.ensure_readable(at)?;

        let resources: BTreeSet<ObjectReference> = state
            .by_type
            .get(resource_type)
            .into_iter()
            .flatten()
            .filter_map(|id| state.records.get(id))
            .filter(|record| record.visible_at(at))
            .map(|record| record.relationship.resource.clone())
            .collect();

        Ok(resources.into_iter().collect())
    }

    async fn revision_bounds(&self) -> Result<RevisionBounds> {
        Ok(self.state.read().bounds())
    }
}
