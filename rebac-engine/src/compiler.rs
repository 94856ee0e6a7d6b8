//! Schema compiler.
//!
//! Parses schema source with the pest grammar in `schema.pest`, lowers the
//! parse tree into a [`Schema`] and validates every reference. Compilation is
//! all-or-nothing: the first problem found aborts with a positioned
//! [`RebacError::Compile`].

use crate::{
    error::{RebacError, Result, SourcePosition},
    schema::*,
};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Parser)]
#[grammar = "schema.pest"]
struct SchemaParser;

struct ParsedDefinition {
    name: String,
    position: SourcePosition,
    members: Vec<ParsedMember>,
}

enum ParsedMember {
    Relation {
        name: String,
        position: SourcePosition,
        subjects: Vec<(AllowedSubjectType, SourcePosition)>,
    },
    Permission {
        name: String,
        position: SourcePosition,
        expression: Expression,
        references: Vec<Reference>,
    },
}

/// Identifier used inside a permission expression
enum Reference {
    Member {
        name: String,
        position: SourcePosition,
    },
    Arrow {
        tupleset: String,
        computed: String,
        position: SourcePosition,
    },
}

/// Compile schema source into a validated [`Schema`]
pub fn compile(source: &str) -> Result<Schema> {
    let mut pairs = SchemaParser::parse(Rule::schema, source).map_err(syntax_error)?;
    let root = pairs
        .next()
        .ok_or_else(|| RebacError::compile(SourcePosition::new(1, 1), "empty input"))?;

    let mut parsed = Vec::new();
    for pair in root.into_inner() {
        if pair.as_rule() == Rule::definition {
            parsed.push(parse_definition(pair)?);
        }
    }

    if parsed.is_empty() {
        return Err(RebacError::compile(
            SourcePosition::new(1, 1),
            "schema contains no definitions",
        ));
    }

    let (schema, permission_positions) = lower(parsed, source)?;
    ensure_grounded(&schema, &permission_positions)?;

    debug!(
        definitions = schema.definitions.len(),
        "Compiled schema"
    );
    Ok(schema)
}

fn syntax_error(error: pest::error::Error<Rule>) -> RebacError {
    let (line, column) = match error.line_col {
        LineColLocation::Pos(position) => position,
        LineColLocation::Span(start, _) => start,
    };
    let error = error.renamed_rules(|rule| match rule {
        Rule::identifier => "identifier".to_string(),
        Rule::type_name => "type name".to_string(),
        Rule::subject_type => "subject type".to_string(),
        Rule::definition | Rule::kw_definition => "`definition`".to_string(),
        Rule::relation_decl | Rule::kw_relation => "`relation`".to_string(),
        Rule::permission_decl | Rule::kw_permission => "`permission`".to_string(),
        Rule::operator => "operator".to_string(),
        Rule::expression | Rule::arrow => "expression".to_string(),
        other => format!("{:?}", other),
    });
    RebacError::compile(
        SourcePosition::new(line, column),
        error.variant.message().into_owned(),
    )
}

fn position_of(pair: &Pair<'_, Rule>) -> SourcePosition {
    let (line, column) = pair.as_span().start_pos().line_col();
    SourcePosition::new(line, column)
}

fn parse_definition(pair: Pair<'_, Rule>) -> Result<ParsedDefinition> {
    let position = position_of(&pair);
    let mut name = None;
    let mut members = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::type_name => name = Some(inner.as_str().to_string()),
            Rule::relation_decl => members.push(parse_relation(inner)?),
            Rule::permission_decl => members.push(parse_permission(inner)?),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| RebacError::compile(position, "expected type name"))?;
    Ok(ParsedDefinition {
        name,
        position,
        members,
    })
}

fn parse_relation(pair: Pair<'_, Rule>) -> Result<ParsedMember> {
    let declared_at = position_of(&pair);
    let mut name = None;
    let mut subjects = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::identifier => name = Some((inner.as_str().to_string(), position_of(&inner))),
            Rule::subject_type => {
                let position = position_of(&inner);
                let mut parts = inner.into_inner();
                let object_type = parts
                    .next()
                    .ok_or_else(|| RebacError::compile(position, "expected subject type"))?
                    .as_str()
                    .to_string();
                let relation = parts.next().map(|part| part.as_str().to_string());
                subjects.push((
                    AllowedSubjectType {
                        object_type,
                        relation,
                    },
                    position,
                ));
            }
            _ => {}
        }
    }

    let (name, position) =
        name.ok_or_else(|| RebacError::compile(declared_at, "expected relation name"))?;
    Ok(ParsedMember::Relation {
        name,
        position,
        subjects,
    })
}

fn parse_permission(pair: Pair<'_, Rule>) -> Result<ParsedMember> {
    let declared_at = position_of(&pair);
    let mut name = None;
    let mut expression = None;
    let mut references = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::identifier => name = Some((inner.as_str().to_string(), position_of(&inner))),
            Rule::expression => expression = Some(parse_expression(inner, &mut references)?),
            _ => {}
        }
    }

    let (name, position) =
        name.ok_or_else(|| RebacError::compile(declared_at, "expected permission name"))?;
    let expression = expression
        .ok_or_else(|| RebacError::compile(position, "expected permission expression"))?;
    Ok(ParsedMember::Permission {
        name,
        position,
        expression,
        references,
    })
}

/// Folds `t0 op t1 op t2 ...` from the left; all operators bind equally.
fn parse_expression(pair: Pair<'_, Rule>, references: &mut Vec<Reference>) -> Result<Expression> {
    let position = position_of(&pair);
    let mut inner = pair.into_inner();

    let first = inner
        .next()
        .ok_or_else(|| RebacError::compile(position, "expected expression"))?;
    let mut expression = parse_term(first, references)?;

    while let Some(operator) = inner.next() {
        let operator_position = position_of(&operator);
        let operand = inner.next().ok_or_else(|| {
            RebacError::compile(
                operator_position,
                format!("expected operand after `{}`", operator.as_str()),
            )
        })?;
        let right = parse_term(operand, references)?;

        expression = match operator.as_str() {
            "+" => Expression::union(expression, right),
            "&" => Expression::intersection(expression, right),
            "-" => Expression::exclusion(expression, right),
            other => {
                return Err(RebacError::compile(
                    operator_position,
                    format!("unknown operator `{}`", other),
                ))
            }
        };
    }

    Ok(expression)
}

fn parse_term(pair: Pair<'_, Rule>, references: &mut Vec<Reference>) -> Result<Expression> {
    let position = position_of(&pair);
    match pair.as_rule() {
        Rule::identifier => {
            let name = pair.as_str().to_string();
            references.push(Reference::Member {
                name: name.clone(),
                position,
            });
            Ok(Expression::Relation(name))
        }
        Rule::arrow => {
            let mut parts = pair.into_inner();
            let mut next_name = || {
                parts
                    .next()
                    .map(|part| part.as_str().to_string())
                    .ok_or_else(|| RebacError::compile(position, "incomplete arrow"))
            };
            let tupleset = next_name()?;
            let computed = next_name()?;
            references.push(Reference::Arrow {
                tupleset: tupleset.clone(),
                computed: computed.clone(),
                position,
            });
            Ok(Expression::Arrow { tupleset, computed })
        }
        Rule::expression => parse_expression(pair, references),
        rule => Err(RebacError::compile(
            position,
            format!("unexpected {:?} in expression", rule),
        )),
    }
}

type PermissionPositions = HashMap<(String, String), SourcePosition>;

/// Builds the schema from parsed definitions, then checks every reference
/// against the complete set of definitions so declaration order never matters.
fn lower(parsed: Vec<ParsedDefinition>, source: &str) -> Result<(Schema, PermissionPositions)> {
    let mut definitions: BTreeMap<String, ObjectDefinition> = BTreeMap::new();
    let mut subject_checks = Vec::new();
    let mut reference_checks = Vec::new();
    let mut permission_positions = HashMap::new();

    for parsed_definition in parsed {
        if definitions.contains_key(&parsed_definition.name) {
            return Err(RebacError::compile(
                parsed_definition.position,
                format!("duplicate definition `{}`", parsed_definition.name),
            ));
        }

        let mut object = ObjectDefinition {
            name: parsed_definition.name.clone(),
            relations: BTreeMap::new(),
            permissions: BTreeMap::new(),
        };

        for member in parsed_definition.members {
            match member {
                ParsedMember::Relation {
                    name,
                    position,
                    subjects,
                } => {
                    if object.has_member(&name) {
                        return Err(duplicate_member(position, &object.name, &name));
                    }
                    let allowed_subjects = subjects.iter().map(|(s, _)| s.clone()).collect();
                    subject_checks.extend(subjects);
                    object.relations.insert(
                        name.clone(),
                        RelationDefinition {
                            name,
                            allowed_subjects,
                        },
                    );
                }
                ParsedMember::Permission {
                    name,
                    position,
                    expression,
                    references,
                } => {
                    if object.has_member(&name) {
                        return Err(duplicate_member(position, &object.name, &name));
                    }
                    permission_positions.insert((object.name.clone(), name.clone()), position);
                    reference_checks.push((object.name.clone(), references));
                    object
                        .permissions
                        .insert(name.clone(), PermissionDefinition { name, expression });
                }
            }
        }

        definitions.insert(object.name.clone(), object);
    }

    let schema = Schema {
        definitions,
        source: source.to_string(),
    };

    for (subject, position) in &subject_checks {
        validate_subject_type(&schema, subject, *position)?;
    }
    for (object_type, references) in &reference_checks {
        for reference in references {
            validate_reference(&schema, object_type, reference)?;
        }
    }

    Ok((schema, permission_positions))
}

fn duplicate_member(position: SourcePosition, object_type: &str, name: &str) -> RebacError {
    RebacError::compile(
        position,
        format!("duplicate name `{}` in definition `{}`", name, object_type),
    )
}

fn validate_subject_type(
    schema: &Schema,
    subject: &AllowedSubjectType,
    position: SourcePosition,
) -> Result<()> {
    let definition = schema.definition(&subject.object_type).ok_or_else(|| {
        RebacError::compile(
            position,
            format!("undefined type `{}`", subject.object_type),
        )
    })?;

    if let Some(ref relation) = subject.relation {
        if !definition.has_member(relation) {
            return Err(RebacError::compile(
                position,
                format!(
                    "undefined relation `{}` on type `{}`",
                    relation, subject.object_type
                ),
            ));
        }
    }
    Ok(())
}

fn validate_reference(schema: &Schema, object_type: &str, reference: &Reference) -> Result<()> {
    let definition = schema.definition(object_type).ok_or_else(|| {
        RebacError::Internal(anyhow::anyhow!("definition `{}` vanished", object_type))
    })?;

    match reference {
        Reference::Member { name, position } => {
            if definition.has_member(name) {
                Ok(())
            } else {
                Err(RebacError::compile(
                    *position,
                    format!(
                        "undefined relation or permission `{}` on type `{}`",
                        name, object_type
                    ),
                ))
            }
        }
        Reference::Arrow {
            tupleset,
            computed,
            position,
        } => match definition.member(tupleset) {
            Some(Member::Relation(relation)) => {
                let reachable = relation.allowed_subjects.iter().any(|subject| {
                    schema
                        .definition(&subject.object_type)
                        .map_or(false, |target| target.has_member(computed))
                });
                if reachable {
                    Ok(())
                } else {
                    Err(RebacError::compile(
                        *position,
                        format!(
                            "`{}` is not defined on any subject type of `{}#{}`",
                            computed, object_type, tupleset
                        ),
                    ))
                }
            }
            Some(Member::Permission(_)) => Err(RebacError::compile(
                *position,
                format!(
                    "arrow source `{}` on type `{}` must be a relation, not a permission",
                    tupleset, object_type
                ),
            )),
            None => Err(RebacError::compile(
                *position,
                format!("undefined relation `{}` on type `{}`", tupleset, object_type),
            )),
        },
    }
}

fn collect_references<'a>(expression: &'a Expression, names: &mut Vec<&'a str>) {
    match expression {
        Expression::Relation(name) => names.push(name),
        Expression::Arrow { tupleset, .. } => names.push(tupleset),
        Expression::Union(left, right) | Expression::Intersection(left, right) => {
            collect_references(left, names);
            collect_references(right, names);
        }
        Expression::Exclusion { base, subtracted } => {
            collect_references(base, names);
            collect_references(subtracted, names);
        }
    }
}

/// Rejects permissions that only reference each other and never reach a
/// relation. Reports the earliest offending declaration.
fn ensure_grounded(schema: &Schema, positions: &PermissionPositions) -> Result<()> {
    // Node weight: true for relations
    let mut graph: DiGraph<bool, ()> = DiGraph::new();
    let mut nodes: HashMap<(&str, &str), NodeIndex> = HashMap::new();

    for definition in schema.definitions.values() {
        for name in definition.relations.keys() {
            nodes.insert((definition.name.as_str(), name.as_str()), graph.add_node(true));
        }
        for name in definition.permissions.keys() {
            nodes.insert((definition.name.as_str(), name.as_str()), graph.add_node(false));
        }
    }

    for definition in schema.definitions.values() {
        for permission in definition.permissions.values() {
            let from = match nodes.get(&(definition.name.as_str(), permission.name.as_str())) {
                Some(&node) => node,
                None => continue,
            };
            let mut names = Vec::new();
            collect_references(&permission.expression, &mut names);
            for name in names {
                if let Some(&to) = nodes.get(&(definition.name.as_str(), name)) {
                    graph.update_edge(from, to, ());
                }
            }
        }
    }

    let mut ungrounded: Option<(SourcePosition, String)> = None;
    for definition in schema.definitions.values() {
        for permission in definition.permissions.values() {
            let start = match nodes.get(&(definition.name.as_str(), permission.name.as_str())) {
                Some(&node) => node,
                None => continue,
            };

            let mut dfs = Dfs::new(&graph, start);
            let mut grounded = false;
            while let Some(node) = dfs.next(&graph) {
                if graph[node] {
                    grounded = true;
                    break;
                }
            }
            if grounded {
                continue;
            }

            let position = positions
                .get(&(definition.name.clone(), permission.name.clone()))
                .copied()
                .unwrap_or_else(|| SourcePosition::new(1, 1));
            let earlier = ungrounded
                .as_ref()
                .map_or(true, |(current, _)| position < *current);
            if earlier {
                ungrounded = Some((
                    position,
                    format!(
                        "permission `{}#{}` does not resolve to any relation",
                        definition.name, permission.name
                    ),
                ));
            }
        }
    }

    match ungrounded {
        Some((position, message)) => Err(RebacError::compile(position, message)),
        None => Ok(()),
    }
}
