use crate::{
    error::{RebacError, Result},
    models::*,
    schema::{Expression, Member, Schema},
    store::RelationshipStore,
};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Structure of a permission on one resource, with the subjects found at
/// each relation. Subject sets are listed as they are stored, not expanded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PermissionTree {
    Leaf {
        resource: ObjectReference,
        relation: String,
        subjects: Vec<SubjectReference>,
    },
    Union {
        left: Box<PermissionTree>,
        right: Box<PermissionTree>,
    },
    Intersection {
        left: Box<PermissionTree>,
        right: Box<PermissionTree>,
    },
    Exclusion {
        base: Box<PermissionTree>,
        subtracted: Box<PermissionTree>,
    },
    Arrow {
        resource: ObjectReference,
        tupleset: String,
        computed: String,
        children: Vec<PermissionTree>,
    },
    /// A (resource, name) pair that was already being expanded higher up
    Cycle {
        resource: ObjectReference,
        name: String,
    },
}

impl PermissionTree {
    /// All subjects listed in leaves, in first-seen order
    pub fn leaf_subjects(&self) -> Vec<SubjectReference> {
        let mut subjects = Vec::new();
        self.collect_subjects(&mut subjects);
        subjects
    }

    fn collect_subjects(&self, out: &mut Vec<SubjectReference>) {
        match self {
            Self::Leaf { subjects, .. } => {
                for subject in subjects {
                    if !out.contains(subject) {
                        out.push(subject.clone());
                    }
                }
            }
            Self::Union { left, right } | Self::Intersection { left, right } => {
                left.collect_subjects(out);
                right.collect_subjects(out);
            }
            Self::Exclusion { base, subtracted } => {
                base.collect_subjects(out);
                subtracted.collect_subjects(out);
            }
            Self::Arrow { children, .. } => {
                for child in children {
                    child.collect_subjects(out);
                }
            }
            Self::Cycle { .. } => {}
        }
    }
}

/// Subject expander builds the permission tree of a resource at one revision
pub struct SubjectExpander {
    store: Arc<dyn RelationshipStore>,
    schema: Arc<Schema>,
    revision: Revision,
    max_depth: u32,
}

impl SubjectExpander {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        schema: Arc<Schema>,
        revision: Revision,
        max_depth: u32,
    ) -> Self {
        Self {
            store,
            schema,
            revision,
            max_depth,
        }
    }

    /// Expand `permission` on `resource`
    pub async fn expand(&self, permission: &str, resource: &ObjectReference) -> Result<PermissionTree> {
        if self.schema.member(&resource.object_type, permission).is_none() {
            return Err(RebacError::NotFound(format!(
                "permission '{}' on type '{}'",
                permission, resource.object_type
            )));
        }
        self.expand_member(resource.clone(), permission.to_string(), Vec::new())
            .await
    }

    fn expand_member<'a>(
        &'a self,
        resource: ObjectReference,
        name: String,
        path: Vec<(ObjectReference, String)>,
    ) -> BoxFuture<'a, Result<PermissionTree>> {
        async move {
            let key = (resource, name);
            if path.contains(&key) {
                return Ok(PermissionTree::Cycle {
                    resource: key.0,
                    name: key.1,
                });
            }
            if path.len() as u32 > self.max_depth {
                return Err(RebacError::RecursionLimit {
                    max_depth: self.max_depth,
                });
            }

            debug!(resource = %key.0, name = %key.1, "Expanding");

            let mut path = path;
            path.push(key.clone());
            let (resource, name) = key;

            match self.schema.member(&resource.object_type, &name) {
                Some(Member::Permission(permission)) => {
                    self.expand_expression(&resource, &permission.expression, &path)
                        .await
                }
                Some(Member::Relation(_)) => {
                    let filter = RelationshipFilter::new().resource(&resource).relation(&name);
                    let subjects = self
                        .store
                        .read(&filter, self.revision)
                        .await?
                        .map(|relationship| relationship.subject)
                        .collect();
                    Ok(PermissionTree::Leaf {
                        resource,
                        relation: name,
                        subjects,
                    })
                }
                None => Ok(PermissionTree::Leaf {
                    resource,
                    relation: name,
                    subjects: Vec::new(),
                }),
            }
        }
        .boxed()
    }

    fn expand_expression<'a>(
        &'a self,
        resource: &'a ObjectReference,
        expression: &'a Expression,
        path: &'a [(ObjectReference, String)],
    ) -> BoxFuture<'a, Result<PermissionTree>> {
        async move {
            match expression {
                Expression::Relation(name) => {
                    self.expand_member(resource.clone(), name.clone(), path.to_vec())
                        .await
                }
                Expression::Arrow { tupleset, computed } => {
                    let filter = RelationshipFilter::new().resource(resource).relation(tupleset);
                    let targets: Vec<ObjectReference> = self
                        .store
                        .read(&filter, self.revision)
                        .await?
                        .map(|relationship| relationship.subject.object)
                        .filter(|object| self.schema.member(&object.object_type, computed).is_some())
                        .collect();

                    let mut children = Vec::with_capacity(targets.len());
                    for target in targets {
                        children.push(
                            self.expand_member(target, computed.clone(), path.to_vec())
                                .await?,
                        );
                    }
                    Ok(PermissionTree::Arrow {
                        resource: resource.clone(),
                        tupleset: tupleset.clone(),
                        computed: computed.clone(),
                        children,
                    })
                }
                Expression::Union(left, right) => Ok(PermissionTree::Union {
                    left: Box::new(self.expand_expression(resource, left, path).await?),
                    right: Box::new(self.expand_expression(resource, right, path).await?),
                }),
                Expression::Intersection(left, right) => Ok(PermissionTree::Intersection {
                    left: Box::new(self.expand_expression(resource, left, path).await?),
                    right: Box::new(self.expand_expression(resource, right, path).await?),
                }),
                Expression::Exclusion { base, subtracted } => Ok(PermissionTree::Exclusion {
                    base: Box::new(self.expand_expression(resource, base, path).await?),
                    subtracted: Box::new(self.expand_expression(resource, subtracted, path).await?),
                }),
            }
        }
        .boxed()
    }
}
