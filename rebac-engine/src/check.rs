use crate::{
    error::{RebacError, Result},
    models::*,
    schema::{Expression, Member, Schema},
    store::RelationshipStore,
};
use ahash::{AHashMap, AHashSet};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A (resource, relation-or-permission) pair on the evaluation path
type PathKey = (ObjectReference, String);

/// Limits applied to a single check
#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub max_depth: u32,
    pub max_concurrent_expansions: usize,
    pub deadline: Option<Instant>,
    pub cancellation: CancellationToken,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_concurrent_expansions: 16,
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Result of evaluating one node. `cycle_cut` is set when the answer relied
/// on a branch that was cut short because it re-entered the evaluation path;
/// such answers are path dependent and must not be memoized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outcome {
    allowed: bool,
    cycle_cut: bool,
}

impl Outcome {
    fn resolved(allowed: bool) -> Self {
        Self {
            allowed,
            cycle_cut: false,
        }
    }

    fn cut() -> Self {
        Self {
            allowed: false,
            cycle_cut: true,
        }
    }
}

/// Permission checker for a single subject at a single revision.
///
/// Evaluates permission expressions as set operations over the relationship
/// graph:
/// - Direct relationships
/// - Subject-set expansion (e.g. "members of group:eng are viewers")
/// - Arrows that walk to related objects (e.g. "viewers of the parent folder")
/// - Union, intersection and exclusion
///
/// Re-entering a pair already on the current path yields NO_PERMISSION for
/// that branch; hops beyond `max_depth` fail with `RecursionLimit`.
pub struct PermissionChecker {
    store: Arc<dyn RelationshipStore>,
    schema: Arc<Schema>,
    revision: Revision,
    subject: SubjectReference,
    options: CheckOptions,
    /// Settled answers with the path length they were computed at
    memo: Mutex<AHashMap<PathKey, (bool, usize)>>,
}

impl PermissionChecker {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        schema: Arc<Schema>,
        revision: Revision,
        subject: SubjectReference,
        options: CheckOptions,
    ) -> Self {
        Self {
            store,
            schema,
            revision,
            subject,
            options,
            memo: Mutex::new(AHashMap::new()),
        }
    }

    /// Check whether the subject holds `permission` on `resource`.
    ///
    /// Fails with `NotFound` if the resource type or the permission is not
    /// defined in the schema.
    pub async fn check(
        &self,
        permission: &str,
        resource: &ObjectReference,
    ) -> Result<Permissionship> {
        let definition = self.schema.definition(&resource.object_type).ok_or_else(|| {
            RebacError::NotFound(format!("object type '{}'", resource.object_type))
        })?;
        if !definition.has_member(permission) {
            return Err(RebacError::NotFound(format!(
                "permission '{}' on type '{}'",
                permission, resource.object_type
            )));
        }

        let outcome = self
            .evaluate_member(resource.clone(), permission.to_string(), Vec::new())
            .await?;

        debug!(
            subject = %self.subject,
            permission = %permission,
            resource = %resource,
            revision = %self.revision,
            allowed = outcome.allowed,
            "Check complete"
        );
        Ok(Permissionship::from(outcome.allowed))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.options.cancellation.is_cancelled() {
            return Err(RebacError::Cancelled("check cancelled by caller".to_string()));
        }
        if let Some(deadline) = self.options.deadline {
            if Instant::now() >= deadline {
                return Err(RebacError::Cancelled("check deadline exceeded".to_string()));
            }
        }
        Ok(())
    }

    fn evaluate_member<'a>(
        &'a self,
        resource: ObjectReference,
        name: String,
        path: Vec<PathKey>,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            self.ensure_active()?;

            let key = (resource, name);
            if path.contains(&key) {
                debug!(resource = %key.0, name = %key.1, "Cycle detected, cutting branch");
                return Ok(Outcome::cut());
            }
            if path.len() as u32 > self.options.max_depth {
                return Err(RebacError::RecursionLimit {
                    max_depth: self.options.max_depth,
                });
            }
            // An answer settled with more depth budget left may hide a
            // recursion limit this path would hit
            let memoized = self.memo.lock().get(&key).copied();
            if let Some((allowed, depth)) = memoized {
                if path.len() <= depth {
                    return Ok(Outcome::resolved(allowed));
                }
            }

            let member = match self.schema.member(&key.0.object_type, &key.1) {
                Some(member) => member,
                None => {
                    warn!(
                        resource = %key.0,
                        name = %key.1,
                        "Relationship points at an undefined type or relation"
                    );
                    return Ok(Outcome::resolved(false));
                }
            };

            let depth = path.len();
            let mut path = path;
            path.push(key.clone());

            let outcome = match member {
                Member::Relation(_) => self.evaluate_relation(&key.0, &key.1, &path).await?,
                Member::Permission(permission) => {
                    self.evaluate_expression(&key.0, &permission.expression, &path)
                        .await?
                }
            };

            if !outcome.cycle_cut {
                let mut memo = self.memo.lock();
                let entry = memo.entry(key).or_insert((outcome.allowed, depth));
                if depth < entry.1 {
                    *entry = (outcome.allowed, depth);
                }
            }
            Ok(outcome)
        }
        .boxed()
    }

    fn evaluate_expression<'a>(
        &'a self,
        resource: &'a ObjectReference,
        expression: &'a Expression,
        path: &'a [PathKey],
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            match expression {
                Expression::Relation(name) => {
                    self.evaluate_member(resource.clone(), name.clone(), path.to_vec())
                        .await
                }
                Expression::Arrow { tupleset, computed } => {
                    self.evaluate_arrow(resource, tupleset, computed, path).await
                }
                Expression::Union(left, right) => {
                    let left = self.evaluate_expression(resource, left, path).await?;
                    if left.allowed {
                        return Ok(left);
                    }
                    let right = self.evaluate_expression(resource, right, path).await?;
                    Ok(Outcome {
                        allowed: right.allowed,
                        cycle_cut: left.cycle_cut || right.cycle_cut,
                    })
                }
                Expression::Intersection(left, right) => {
                    let left = self.evaluate_expression(resource, left, path).await?;
                    if !left.allowed {
                        return Ok(left);
                    }
                    let right = self.evaluate_expression(resource, right, path).await?;
                    Ok(Outcome {
                        allowed: right.allowed,
                        cycle_cut: left.cycle_cut || right.cycle_cut,
                    })
                }
                Expression::Exclusion { base, subtracted } => {
                    let base = self.evaluate_expression(resource, base, path).await?;
                    if !base.allowed {
                        return Ok(base);
                    }
                    let subtracted = self.evaluate_expression(resource, subtracted, path).await?;
                    Ok(Outcome {
                        allowed: !subtracted.allowed,
                        cycle_cut: base.cycle_cut || subtracted.cycle_cut,
                    })
                }
            }
        }
        .boxed()
    }

    async fn evaluate_relation(
        &self,
        resource: &ObjectReference,
        relation: &str,
        path: &[PathKey],
    ) -> Result<Outcome> {
        let filter = RelationshipFilter::new().resource(resource).relation(relation);
        let relationships = self.store.read(&filter, self.revision).await?;

        let mut expansions = Vec::new();
        for relationship in relationships {
            if relationship.subject == self.subject {
                debug!(relationship = %relationship, "Direct relationship found");
                return Ok(Outcome::resolved(true));
            }
            if let Some(subject_relation) = relationship.subject.relation {
                expansions.push((relationship.subject.object, subject_relation));
            }
        }

        self.any_of(expansions, path).await
    }

    async fn evaluate_arrow(
        &self,
        resource: &ObjectReference,
        tupleset: &str,
        computed: &str,
        path: &[PathKey],
    ) -> Result<Outcome> {
        let filter = RelationshipFilter::new().resource(resource).relation(tupleset);
        let relationships = self.store.read(&filter, self.revision).await?;

        let mut seen = AHashSet::new();
        let mut targets = Vec::new();
        for relationship in relationships {
            let object = relationship.subject.object;
            if self.schema.member(&object.object_type, computed).is_none() {
                continue;
            }
            if seen.insert(object.clone()) {
                targets.push((object, computed.to_string()));
            }
        }

        self.any_of(targets, path).await
    }

    /// Evaluates every target concurrently, bounded by
    /// `max_concurrent_expansions`. Any proven branch wins; otherwise the
    /// error from the earliest target is returned.
    async fn any_of(&self, targets: Vec<PathKey>, path: &[PathKey]) -> Result<Outcome> {
        if targets.is_empty() {
            return Ok(Outcome::resolved(false));
        }

        let mut branches = stream::iter(targets.into_iter().enumerate())
            .map(|(index, (object, name))| {
                let path = path.to_vec();
                async move { (index, self.evaluate_member(object, name, path).await) }
            })
            .buffer_unordered(self.options.max_concurrent_expansions.max(1));

        let mut first_error: Option<(usize, RebacError)> = None;
        let mut cycle_cut = false;

        while let Some((index, result)) = branches.next().await {
            match result {
                Ok(outcome) if outcome.allowed => {
                    if let Some((_, ref error)) = first_error {
                        warn!(error = %error, "Branch error masked by a granted sibling branch");
                    }
                    return Ok(outcome);
                }
                Ok(outcome) => cycle_cut |= outcome.cycle_cut,
                Err(error) => {
                    let earlier = first_error
                        .as_ref()
                        .map_or(true, |(current, _)| index < *current);
                    if earlier {
                        first_error = Some((index, error));
                    }
                }
            }
        }

        match first_error {
            Some((_, error)) => Err(error),
            None => Ok(Outcome {
                allowed: false,
                cycle_cut,
            }),
        }
    }
}
