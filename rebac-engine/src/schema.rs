use crate::{error::RebacError, models::*};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Compiled permission schema.
///
/// Produced only by the compiler, so every reference inside it has already
/// been resolved. A schema is immutable; rewriting the schema swaps in a new
/// instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Object type definitions keyed by type name (e.g. "namespace/user")
    pub definitions: BTreeMap<String, ObjectDefinition>,
    /// Source text the schema was compiled from
    pub source: String,
}

/// Definition of an object type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDefinition {
    pub name: String,
    pub relations: BTreeMap<String, RelationDefinition>,
    pub permissions: BTreeMap<String, PermissionDefinition>,
}

/// A relation and the subject types it accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    pub allowed_subjects: Vec<AllowedSubjectType>,
}

/// `type` or `type#relation` in a relation declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowedSubjectType {
    pub object_type: String,
    pub relation: Option<String>,
}

impl fmt::Display for AllowedSubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref relation) => write!(f, "{}#{}", self.object_type, relation),
            None => write!(f, "{}", self.object_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub name: String,
    pub expression: Expression,
}

/// Permission expression tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expression {
    /// Reference to a relation or permission on the same object
    Relation(String),
    /// `tupleset->computed`: evaluate `computed` on every subject of `tupleset`
    Arrow { tupleset: String, computed: String },
    Union(Box<Expression>, Box<Expression>),
    Intersection(Box<Expression>, Box<Expression>),
    Exclusion {
        base: Box<Expression>,
        subtracted: Box<Expression>,
    },
}

impl Expression {
    pub fn relation(name: &str) -> Self {
        Self::Relation(name.to_string())
    }

    pub fn union(left: Expression, right: Expression) -> Self {
        Self::Union(Box::new(left), Box::new(right))
    }

    pub fn intersection(left: Expression, right: Expression) -> Self {
        Self::Intersection(Box::new(left), Box::new(right))
    }

    pub fn exclusion(base: Expression, subtracted: Expression) -> Self {
        Self::Exclusion {
            base: Box::new(base),
            subtracted: Box::new(subtracted),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relation(name) => write!(f, "{}", name),
            Self::Arrow { tupleset, computed } => write!(f, "{}->{}", tupleset, computed),
            Self::Union(left, right) => write!(f, "({} + {})", left, right),
            Self::Intersection(left, right) => write!(f, "({} & {})", left, right),
            Self::Exclusion { base, subtracted } => write!(f, "({} - {})", base, subtracted),
        }
    }
}

/// A named member of an object definition
#[derive(Debug, Clone, Copy)]
pub enum Member<'a> {
    Relation(&'a RelationDefinition),
    Permission(&'a PermissionDefinition),
}

impl ObjectDefinition {
    pub fn member(&self, name: &str) -> Option<Member<'_>> {
        if let Some(relation) = self.relations.get(name) {
            return Some(Member::Relation(relation));
        }
        self.permissions.get(name).map(Member::Permission)
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.relations.contains_key(name) || self.permissions.contains_key(name)
    }
}

impl Schema {
    pub fn definition(&self, object_type: &str) -> Option<&ObjectDefinition> {
        self.definitions.get(object_type)
    }

    /// Look up a relation or permission on a type
    pub fn member(&self, object_type: &str, name: &str) -> Option<Member<'_>> {
        self.definitions.get(object_type)?.member(name)
    }

    /// Validate that a relationship conforms to the schema
    pub fn validate_relationship(&self, relationship: &Relationship) -> Result<(), RebacError> {
        let resource = &relationship.resource;
        let subject = &relationship.subject;

        if resource.object_id.is_empty() {
            return Err(RebacError::Write(format!(
                "empty resource id in '{}'",
                relationship
            )));
        }
        if subject.object.object_id.is_empty() {
            return Err(RebacError::Write(format!(
                "empty subject id in '{}'",
                relationship
            )));
        }

        let definition = self.definitions.get(&resource.object_type).ok_or_else(|| {
            RebacError::Write(format!("unknown resource type '{}'", resource.object_type))
        })?;

        let relation = match definition.member(&relationship.relation) {
            Some(Member::Relation(relation)) => relation,
            Some(Member::Permission(_)) => {
                return Err(RebacError::Write(format!(
                    "'{}' is a permission on '{}'; relationships can only be written to relations",
                    relationship.relation, resource.object_type
                )));
            }
            None => {
                return Err(RebacError::Write(format!(
                    "unknown relation '{}' on type '{}'",
                    relationship.relation, resource.object_type
                )));
            }
        };

        let allowed = relation.allowed_subjects.iter().any(|allowed| {
            allowed.object_type == subject.object.object_type && allowed.relation == subject.relation
        });
        if !allowed {
            let expected: Vec<String> = relation
                .allowed_subjects
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(RebacError::Write(format!(
                "subject '{}' is not allowed on {}#{}; expected one of [{}]",
                subject,
                resource.object_type,
                relation.name,
                expected.join(", ")
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment_schema() -> Schema {
        let user = ObjectDefinition {
            name: "namespace/user".to_string(),
            relations: BTreeMap::new(),
            permissions: BTreeMap::new(),
        };
        let mut relations = BTreeMap::new();
        for name in ["payer", "collector"] {
            relations.insert(
                name.to_string(),
                RelationDefinition {
                    name: name.to_string(),
                    allowed_subjects: vec![AllowedSubjectType {
                        object_type: "namespace/user".to_string(),
                        relation: None,
                    }],
                },
            );
        }
        let mut permissions = BTreeMap::new();
        permissions.insert(
            "view".to_string(),
            PermissionDefinition {
                name: "view".to_string(),
                expression: Expression::union(
                    Expression::relation("payer"),
                    Expression::relation("collector"),
                ),
            },
        );
        let payment = ObjectDefinition {
            name: "namespace/payment".to_string(),
            relations,
            permissions,
        };

        let mut definitions = BTreeMap::new();
        definitions.insert(user.name.clone(), user);
        definitions.insert(payment.name.clone(), payment);
        Schema {
            definitions,
            source: String::new(),
        }
    }

    #[test]
    fn test_member_lookup() {
        let schema = payment_schema();
        assert!(matches!(
            schema.member("namespace/payment", "payer"),
            Some(Member::Relation(_))
        ));
        assert!(matches!(
            schema.member("namespace/payment", "view"),
            Some(Member::Permission(_))
        ));
        assert!(schema.member("namespace/payment", "edit").is_none());
        assert!(schema.member("namespace/invoice", "view").is_none());
    }

    #[test]
    fn test_validate_relationship() {
        let schema = payment_schema();

        let valid: Relationship = "namespace/payment:p1#payer@namespace/user:bob".parse().unwrap();
        assert!(schema.validate_relationship(&valid).is_ok());

        let cases = [
            "namespace/invoice:i1#payer@namespace/user:bob",
            "namespace/payment:p1#owner@namespace/user:bob",
            "namespace/payment:p1#view@namespace/user:bob",
            "namespace/payment:p1#payer@namespace/payment:p2",
            "namespace/payment:p1#payer@namespace/user:bob#member",
        ];
        for case in cases {
            let rel: Relationship = case.parse().unwrap();
            assert!(
                matches!(schema.validate_relationship(&rel), Err(RebacError::Write(_))),
                "expected write error for {}",
                case
            );
        }
    }

    #[test]
    fn test_expression_display() {
        let expr = Expression::exclusion(
            Expression::union(
                Expression::relation("viewer"),
                Expression::Arrow {
                    tupleset: "parent".into(),
                    computed: "view".into(),
                },
            ),
            Expression::relation("banned"),
        );
        assert_eq!(expr.to_string(), "((viewer + parent->view) - banned)");
    }
}
