use crate::consistency::{Consistency, ConsistencyToken};
use crate::error::RebacError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A concrete object in the authorization graph, identified by `(type, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectReference {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectReference {
    pub fn new(object_type: &str, object_id: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
        }
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

impl FromStr for ObjectReference {
    type Err = RebacError;

    /// Parses `type:id`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((object_type, object_id)) if !object_type.is_empty() && !object_id.is_empty() => {
                Ok(Self::new(object_type, object_id))
            }
            _ => Err(RebacError::Write(format!(
                "malformed object reference '{}', expected type:id",
                s
            ))),
        }
    }
}

/// The subject side of a relationship.
///
/// Without a relation the subject is the object itself. With a relation it
/// denotes the set of subjects holding that relation on the object, e.g.
/// `group:eng#member`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectReference {
    pub object: ObjectReference,
    pub relation: Option<String>,
}

impl SubjectReference {
    pub fn new(object_type: &str, object_id: &str) -> Self {
        Self {
            object: ObjectReference::new(object_type, object_id),
            relation: None,
        }
    }

    pub fn subject_set(object_type: &str, object_id: &str, relation: &str) -> Self {
        Self {
            object: ObjectReference::new(object_type, object_id),
            relation: Some(relation.to_string()),
        }
    }

    pub fn is_subject_set(&self) -> bool {
        self.relation.is_some()
    }
}

impl From<ObjectReference> for SubjectReference {
    fn from(object: ObjectReference) -> Self {
        Self {
            object,
            relation: None,
        }
    }
}

impl fmt::Display for SubjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref relation) => write!(f, "{}#{}", self.object, relation),
            None => write!(f, "{}", self.object),
        }
    }
}

impl FromStr for SubjectReference {
    type Err = RebacError;

    /// Parses `type:id` or `type:id#relation`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('#') {
            Some((_, "")) => Err(RebacError::Write(format!(
                "malformed subject reference '{}', empty relation",
                s
            ))),
            Some((object, relation)) => Ok(Self {
                object: object.parse()?,
                relation: Some(relation.to_string()),
            }),
            None => Ok(Self::from(s.parse::<ObjectReference>()?)),
        }
    }
}

/// A relationship fact: `resource#relation@subject`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relationship {
    pub resource: ObjectReference,
    pub relation: String,
    pub subject: SubjectReference,
}

impl Relationship {
    pub fn new(resource: ObjectReference, relation: &str, subject: SubjectReference) -> Self {
        Self {
            resource,
            relation: relation.to_string(),
            subject,
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.resource, self.relation, self.subject)
    }
}

impl FromStr for Relationship {
    type Err = RebacError;

    /// Parses `type:id#relation@subject_type:subject_id[#subject_relation]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (left, subject) = s.split_once('@').ok_or_else(|| {
            RebacError::Write(format!("malformed relationship '{}', missing '@'", s))
        })?;
        let (resource, relation) = left.split_once('#').ok_or_else(|| {
            RebacError::Write(format!("malformed relationship '{}', missing '#'", s))
        })?;
        if relation.is_empty() {
            return Err(RebacError::Write(format!(
                "malformed relationship '{}', empty relation",
                s
            )));
        }
        Ok(Self {
            resource: resource.parse()?,
            relation: relation.to_string(),
            subject: subject.parse()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateOperation {
    /// Insert, or keep if already present
    Touch,
    /// Remove if present
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    pub operation: UpdateOperation,
    pub relationship: Relationship,
}

impl RelationshipUpdate {
    pub fn touch(relationship: Relationship) -> Self {
        Self {
            operation: UpdateOperation::Touch,
            relationship,
        }
    }

    pub fn delete(relationship: Relationship) -> Self {
        Self {
            operation: UpdateOperation::Delete,
            relationship,
        }
    }
}

/// Store revision. Revision 0 is the empty store; every committed batch
/// advances it by one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permissionship {
    HasPermission,
    NoPermission,
}

impl Permissionship {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::HasPermission)
    }
}

impl From<bool> for Permissionship {
    fn from(allowed: bool) -> Self {
        if allowed {
            Self::HasPermission
        } else {
            Self::NoPermission
        }
    }
}

impl fmt::Display for Permissionship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HasPermission => write!(f, "PERMISSIONSHIP_HAS_PERMISSION"),
            Self::NoPermission => write!(f, "PERMISSIONSHIP_NO_PERMISSION"),
        }
    }
}

/// How a subject filter treats the subject's relation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectRelationFilter {
    /// Concrete subjects and subject sets alike
    #[default]
    Any,
    /// Concrete subjects only
    Absent,
    /// Subject sets with exactly this relation
    Exactly(String),
}

impl SubjectRelationFilter {
    pub fn matches(&self, relation: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Absent => relation.is_none(),
            Self::Exactly(expected) => relation == Some(expected.as_str()),
        }
    }
}

/// Subject side of a read filter. `None` ids and types match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFilter {
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    #[serde(default)]
    pub relation: SubjectRelationFilter,
}

impl SubjectFilter {
    /// Matches exactly `subject`: a concrete subject never matches a subject
    /// set on the same object, and vice versa.
    pub fn for_subject(subject: &SubjectReference) -> Self {
        Self {
            subject_type: Some(subject.object.object_type.clone()),
            subject_id: Some(subject.object.object_id.clone()),
            relation: match subject.relation {
                Some(ref relation) => SubjectRelationFilter::Exactly(relation.clone()),
                None => SubjectRelationFilter::Absent,
            },
        }
    }

    pub fn matches(&self, subject: &SubjectReference) -> bool {
        if let Some(ref subject_type) = self.subject_type {
            if subject.object.object_type != *subject_type {
                return false;
            }
        }
        if let Some(ref subject_id) = self.subject_id {
            if subject.object.object_id != *subject_id {
                return false;
            }
        }
        self.relation.matches(subject.relation.as_deref())
    }

    /// The concrete subject object, when both type and id are pinned
    pub fn object(&self) -> Option<ObjectReference> {
        match (&self.subject_type, &self.subject_id) {
            (Some(object_type), Some(object_id)) => Some(ObjectReference::new(object_type, object_id)),
            _ => None,
        }
    }
}

/// Relationship read filter. `None` fields act as wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipFilter {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub relation: Option<String>,
    pub subject: Option<SubjectFilter>,
}

impl RelationshipFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(mut self, resource: &ObjectReference) -> Self {
        self.resource_type = Some(resource.object_type.clone());
        self.resource_id = Some(resource.object_id.clone());
        self
    }

    pub fn resource_type(mut self, resource_type: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self
    }

    pub fn relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    pub fn subject(mut self, subject: SubjectFilter) -> Self {
        self.subject = Some(subject);
        self
    }

    /// The concrete resource, when both type and id are pinned
    pub fn exact_resource(&self) -> Option<ObjectReference> {
        match (&self.resource_type, &self.resource_id) {
            (Some(object_type), Some(object_id)) => Some(ObjectReference::new(object_type, object_id)),
            _ => None,
        }
    }

    pub fn matches(&self, relationship: &Relationship) -> bool {
        if let Some(ref resource_type) = self.resource_type {
            if relationship.resource.object_type != *resource_type {
                return false;
            }
        }
        if let Some(ref resource_id) = self.resource_id {
            if relationship.resource.object_id != *resource_id {
                return false;
            }
        }
        if let Some(ref relation) = self.relation {
            if relationship.relation != *relation {
                return false;
            }
        }
        match self.subject {
            Some(ref subject) => subject.matches(&relationship.subject),
            None => true,
        }
    }
}

/// Authorization check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub subject: SubjectReference,
    pub permission: String,
    pub resource: ObjectReference,
    #[serde(default)]
    pub consistency: Consistency,
    /// Overrides the configured check deadline
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl CheckRequest {
    pub fn new(subject: SubjectReference, permission: &str, resource: ObjectReference) -> Self {
        Self {
            subject,
            permission: permission.to_string(),
            resource,
            consistency: Consistency::default(),
            timeout: None,
        }
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Authorization check response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub permissionship: Permissionship,
    /// Token for the revision the check was evaluated at
    pub checked_at: ConsistencyToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSchemaResponse {
    /// Increments on every successful schema write
    pub generation: u64,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRelationshipsResponse {
    pub revision: Revision,
    pub written_at: ConsistencyToken,
    pub committed_at: DateTime<Utc>,
}
