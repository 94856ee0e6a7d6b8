use crate::{
    check::{CheckOptions, PermissionChecker},
    compiler,
    config::EngineConfig,
    consistency::{Consistency, ConsistencyTokenManager},
    error::{RebacError, Result},
    expand::{PermissionTree, SubjectExpander},
    models::*,
    schema::Schema,
    store::{InMemoryRelationshipStore, RelationshipStore},
};
use ahash::AHashMap;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Installed schema plus the generation it was written at
#[derive(Clone)]
struct SchemaSnapshot {
    schema: Arc<Schema>,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CheckCacheKey {
    generation: u64,
    revision: Revision,
    subject: SubjectReference,
    permission: String,
    resource: ObjectReference,
}

#[derive(Debug, Clone, Copy)]
struct CachedCheck {
    permissionship: Permissionship,
    /// Evaluated for an exact snapshot, which may be asked for again after
    /// head moves on
    pinned: bool,
}

/// Relationship-based authorization engine.
///
/// Owns the installed schema, the relationship store and the check cache.
/// Every read pins one store revision and one schema snapshot, so concurrent
/// writers never produce torn results.
pub struct AuthorizationEngine {
    /// Storage for relationships
    store: Arc<dyn RelationshipStore>,

    /// Issues and resolves consistency tokens for `store`
    tokens: ConsistencyTokenManager,

    /// Current schema, if one has been written
    schema: RwLock<Option<SchemaSnapshot>>,

    /// Results of completed checks
    cache: DashMap<CheckCacheKey, CachedCheck>,

    /// Serializes schema and relationship writes
    writes: Mutex<()>,

    config: EngineConfig,
}

impl AuthorizationEngine {
    /// Create an engine backed by an in-memory store
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(InMemoryRelationshipStore::new(config.revision_retention));
        Self::with_store(store, config)
    }

    /// Create an engine over an existing store
    pub fn with_store(store: Arc<dyn RelationshipStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tokens: ConsistencyTokenManager::new(store.clone()),
            store,
            schema: RwLock::new(None),
            cache: DashMap::new(),
            writes: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =============================================================================
    // Schema Management
    // =============================================================================

    /// Compile and install a schema, replacing the previous one entirely
    pub async fn write_schema(&self, source: &str) -> Result<WriteSchemaResponse> {
        let schema = Arc::new(compiler::compile(source)?);

        let _writes = self.writes.lock().await;
        let generation = {
            let mut current = self.schema.write();
            let generation = current.as_ref().map_or(1, |snapshot| snapshot.generation + 1);
            *current = Some(SchemaSnapshot {
                schema: schema.clone(),
                generation,
            });
            generation
        };
        self.cache.clear();

        info!(
            generation = generation,
            definitions = schema.definitions.len(),
            "Schema written"
        );
        Ok(WriteSchemaResponse {
            generation,
            written_at: Utc::now(),
        })
    }

    /// Source text of the installed schema
    pub async fn read_schema(&self) -> Result<String> {
        Ok(self.current_schema()?.schema.source.clone())
    }

    /// Get the installed schema
    pub fn schema(&self) -> Option<Arc<Schema>> {
        self.schema.read().as_ref().map(|snapshot| snapshot.schema.clone())
    }

    fn current_schema(&self) -> Result<SchemaSnapshot> {
        self.schema
            .read()
            .clone()
            .ok_or_else(|| RebacError::NotFound("no schema has been written".to_string()))
    }

    fn generation(&self) -> Option<u64> {
        self.schema.read().as_ref().map(|snapshot| snapshot.generation)
    }

    /// Pin a read revision together with the schema that was installed when
    /// it was pinned
    async fn pin(&self, consistency: &Consistency) -> Result<(SchemaSnapshot, Revision)> {
        loop {
            let snapshot = self.current_schema()?;
            let revision = self.tokens.select_revision(consistency).await?;
            if self.generation() == Some(snapshot.generation) {
                return Ok((snapshot, revision));
            }
            debug!("Schema changed while pinning a revision, retrying");
        }
    }

    // =============================================================================
    // Relationship Management
    // =============================================================================

    /// Validate and atomically apply a batch of updates.
    ///
    /// Any invalid relationship rejects the whole batch.
    pub async fn write_relationships(
        &self,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<WriteRelationshipsResponse> {
        let _writes = self.writes.lock().await;
        let snapshot = self
            .current_schema()
            .map_err(|_| RebacError::Write("no schema has been written".to_string()))?;
        for update in &updates {
            snapshot.schema.validate_relationship(&update.relationship)?;
        }

        let count = updates.len();
        let revision = self.store.write(updates).await?;
        self.evict_checks().await?;

        info!(revision = %revision, updates = count, "Relationships written");
        Ok(WriteRelationshipsResponse {
            revision,
            written_at: self.tokens.issue(revision),
            committed_at: Utc::now(),
        })
    }

    /// Drop results no read can ask for again: anything below the retention
    /// floor, and unpinned results now that head has moved past them
    async fn evict_checks(&self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let floor = self.store.revision_bounds().await?.oldest_retained;
        self.cache.retain(|key, cached| cached.pinned && key.revision >= floor);
        Ok(())
    }

    fn cache_check(&self, key: CheckCacheKey, cached: CachedCheck) {
        if self.cache.len() >= self.config.check_cache_capacity {
            let revision = key.revision;
            self.cache.retain(|existing, _| existing.revision >= revision);
            if self.cache.len() >= self.config.check_cache_capacity {
                debug!(entries = self.cache.len(), "Check cache full, clearing");
                self.cache.clear();
            }
        }
        self.cache.insert(key, cached);
    }

    /// Relationships matching `filter`
    pub async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
        consistency: &Consistency,
    ) -> Result<Vec<Relationship>> {
        let revision = self.tokens.select_revision(consistency).await?;
        Ok(self.store.read(filter, revision).await?.collect())
    }

    /// Relationships whose subject is exactly `subject`
    pub async fn read_relationships_by_subject(
        &self,
        subject: &SubjectReference,
        relation: Option<&str>,
        resource_type: Option<&str>,
        consistency: &Consistency,
    ) -> Result<Vec<Relationship>> {
        let revision = self.tokens.select_revision(consistency).await?;
        Ok(self
            .store
            .reverse_read(subject, relation, resource_type, revision)
            .await?
            .collect())
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Check a permission at the latest revision
    pub async fn check(
        &self,
        subject: &SubjectReference,
        permission: &str,
        resource: &ObjectReference,
    ) -> Result<bool> {
        let request = CheckRequest::new(subject.clone(), permission, resource.clone());
        Ok(self.check_permission(request).await?.permissionship.is_allowed())
    }

    pub async fn check_permission(&self, request: CheckRequest) -> Result<CheckResponse> {
        self.check_permission_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Check a permission, failing with `Cancelled` once `cancellation` fires
    pub async fn check_permission_with_cancellation(
        &self,
        request: CheckRequest,
        cancellation: CancellationToken,
    ) -> Result<CheckResponse> {
        let (snapshot, revision) = self.pin(&request.consistency).await?;

        let permissionship = self
            .evaluate(&snapshot, revision, &request, cancellation)
            .await?;

        Ok(CheckResponse {
            permissionship,
            checked_at: self.tokens.issue(revision),
        })
    }

    /// Check many permissions. Requests sharing a consistency requirement are
    /// evaluated at the same revision.
    pub async fn batch_check(&self, requests: Vec<CheckRequest>) -> Result<Vec<CheckResponse>> {
        let (snapshot, revisions) = loop {
            let snapshot = self.current_schema()?;
            let mut revisions: AHashMap<Consistency, Revision> = AHashMap::new();
            for request in &requests {
                if !revisions.contains_key(&request.consistency) {
                    let revision = self.tokens.select_revision(&request.consistency).await?;
                    revisions.insert(request.consistency.clone(), revision);
                }
            }
            if self.generation() == Some(snapshot.generation) {
                break (snapshot, revisions);
            }
        };

        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let revision = revisions
                .get(&request.consistency)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no revision pinned for batch request"))?;

            let permissionship = self
                .evaluate(&snapshot, revision, &request, CancellationToken::new())
                .await?;
            responses.push(CheckResponse {
                permissionship,
                checked_at: self.tokens.issue(revision),
            });
        }

        debug!(checks = responses.len(), "Batch check complete");
        Ok(responses)
    }

    async fn evaluate(
        &self,
        snapshot: &SchemaSnapshot,
        revision: Revision,
        request: &CheckRequest,
        cancellation: CancellationToken,
    ) -> Result<Permissionship> {
        let key = CheckCacheKey {
            generation: snapshot.generation,
            revision,
            subject: request.subject.clone(),
            permission: request.permission.clone(),
            resource: request.resource.clone(),
        };

        if self.config.check_cache_enabled {
            if let Some(cached) = self.cache.get(&key).map(|entry| entry.permissionship) {
                debug!(resource = %request.resource, permission = %request.permission, "Check cache hit");
                return Ok(cached);
            }
        }

        let checker = self.checker(snapshot, revision, &request.subject, request.timeout, cancellation);
        match checker.check(&request.permission, &request.resource).await {
            Ok(permissionship) => {
                if self.config.check_cache_enabled {
                    let pinned = matches!(request.consistency, Consistency::AtExactSnapshot(_));
                    self.cache_check(
                        key,
                        CachedCheck {
                            permissionship,
                            pinned,
                        },
                    );
                }
                Ok(permissionship)
            }
            Err(err) => {
                if err.is_fatal() {
                    error!(
                        subject = %request.subject,
                        permission = %request.permission,
                        resource = %request.resource,
                        error = %err,
                        "Check aborted"
                    );
                }
                Err(err)
            }
        }
    }

    fn checker(
        &self,
        snapshot: &SchemaSnapshot,
        revision: Revision,
        subject: &SubjectReference,
        timeout: Option<Duration>,
        cancellation: CancellationToken,
    ) -> PermissionChecker {
        let deadline = timeout
            .or_else(|| self.config.check_timeout())
            .map(|timeout| Instant::now() + timeout);
        PermissionChecker::new(
            self.store.clone(),
            snapshot.schema.clone(),
            revision,
            subject.clone(),
            CheckOptions {
                max_depth: self.config.max_depth,
                max_concurrent_expansions: self.config.max_concurrent_expansions,
                deadline,
                cancellation,
            },
        )
    }

    // =============================================================================
    // Permission Expansion
    // =============================================================================

    /// Tree of relations and subjects that make up `permission` on `resource`
    pub async fn expand(
        &self,
        permission: &str,
        resource: &ObjectReference,
        consistency: &Consistency,
    ) -> Result<PermissionTree> {
        let (snapshot, revision) = self.pin(consistency).await?;
        SubjectExpander::new(
            self.store.clone(),
            snapshot.schema,
            revision,
            self.config.max_depth,
        )
        .expand(permission, resource)
        .await
    }

    /// All resources of `resource_type` on which `subject` holds `permission`,
    /// sorted by id
    pub async fn lookup_resources(
        &self,
        subject: &SubjectReference,
        permission: &str,
        resource_type: &str,
        consistency: &Consistency,
    ) -> Result<Vec<ObjectReference>> {
        let (snapshot, revision) = self.pin(consistency).await?;

        let defined = snapshot
            .schema
            .definition(resource_type)
            .map_or(false, |definition| definition.has_member(permission));
        if !defined {
            return Err(RebacError::NotFound(format!(
                "permission '{}' on type '{}'",
                permission, resource_type
            )));
        }

        // One checker for every candidate so memoized sub-results are shared
        let checker = self.checker(&snapshot, revision, subject, None, CancellationToken::new());
        let mut resources = Vec::new();
        for candidate in self.store.resources_of_type(resource_type, revision).await? {
            if checker.check(permission, &candidate).await?.is_allowed() {
                resources.push(candidate);
            }
        }

        debug!(
            subject = %subject,
            permission = %permission,
            resource_type = %resource_type,
            found = resources.len(),
            "Lookup resources complete"
        );
        Ok(resources)
    }
}
