//! Building the construction of a mapped type from its member values.

use std::sync::Arc;

use query_engine_metadata::metadata::{Constructor, MappedMember};
use query_engine_sql::sql::ast::{ExprRef, Expression, MemberBinding};
use query_engine_sql::sql::helpers;

use crate::translation::error::Error;

/// The value computed for one mapped member.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub member: String,
    pub read_only: bool,
    pub expression: ExprRef,
}

impl Assignment {
    pub fn of(member: &MappedMember, expression: ExprRef) -> Self {
        Assignment {
            member: member.name.clone(),
            read_only: member.read_only,
            expression,
        }
    }
}

struct BoundConstructor {
    index: usize,
    arguments: Vec<MemberBinding>,
    remaining: Vec<Assignment>,
}

/// Bind `assignments` to `constructor`, or `None` when one of its parameters
/// names neither an assignment nor a known member.
fn bind_constructor(
    index: usize,
    constructor: &Constructor,
    assignments: &[Assignment],
    known_members: &[MappedMember],
) -> Option<BoundConstructor> {
    let mut remaining: Vec<Assignment> = assignments.to_vec();
    let mut arguments = Vec::with_capacity(constructor.parameters.len());

    for parameter in &constructor.parameters {
        let position = match &parameter.member {
            Some(member) => remaining.iter().position(|a| a.member == *member),
            None => remaining
                .iter()
                .position(|a| a.member == parameter.name)
                .or_else(|| {
                    remaining
                        .iter()
                        .position(|a| a.member.eq_ignore_ascii_case(&parameter.name))
                }),
        };
        match position {
            Some(position) => {
                let assignment = remaining.remove(position);
                arguments.push(MemberBinding {
                    member: assignment.member,
                    expression: assignment.expression,
                });
            }
            None => {
                // a member without a value takes its default
                let target = parameter.member.as_deref().unwrap_or(&parameter.name);
                let member = known_members
                    .iter()
                    .find(|member| member.name.eq_ignore_ascii_case(target))?;
                arguments.push(MemberBinding {
                    member: member.name.clone(),
                    expression: helpers::null(),
                });
            }
        }
    }

    Some(BoundConstructor {
        index,
        arguments,
        remaining,
    })
}

/// Construct `type_name` from `assignments`.
///
/// Read-only members can only be set through a constructor. The first constructor,
/// in declared order, that binds every read-only member is used; the members it
/// leaves over are initialised after construction.
pub fn build_construction(
    type_name: &str,
    constructors: &[Constructor],
    known_members: &[MappedMember],
    assignments: Vec<Assignment>,
) -> Result<ExprRef, Error> {
    let read_only: Vec<Assignment> = assignments
        .iter()
        .filter(|assignment| assignment.read_only)
        .cloned()
        .collect();
    let has_default_constructor = constructors.is_empty()
        || constructors
            .iter()
            .any(|constructor| constructor.parameters.is_empty());

    if read_only.is_empty() && has_default_constructor {
        return Ok(construction(type_name, None, vec![], assignments));
    }

    let chosen = constructors
        .iter()
        .enumerate()
        .find_map(|(index, constructor)| {
            bind_constructor(index, constructor, &read_only, known_members)
                .filter(|bound| bound.remaining.is_empty())
                .map(|bound| bound.index)
        })
        .ok_or_else(|| Error::UnbindableConstructor(type_name.to_string()))?;

    let bound = bind_constructor(chosen, &constructors[chosen], &assignments, known_members)
        .ok_or_else(|| Error::UnbindableConstructor(type_name.to_string()))?;
    Ok(construction(
        type_name,
        Some(bound.index),
        bound.arguments,
        bound.remaining,
    ))
}

fn construction(
    type_name: &str,
    constructor: Option<usize>,
    arguments: Vec<MemberBinding>,
    remaining: Vec<Assignment>,
) -> ExprRef {
    Arc::new(Expression::Construct {
        type_name: type_name.to_string(),
        constructor,
        arguments,
        bindings: remaining
            .into_iter()
            .map(|assignment| MemberBinding {
                member: assignment.member,
                expression: assignment.expression,
            })
            .collect(),
    })
}

/// The expression a construction assigns to `member`, whether through its
/// constructor or a member initialisation.
pub fn constructed_member<'e>(construction: &'e Expression, member: &str) -> Option<&'e ExprRef> {
    match construction {
        Expression::Construct {
            arguments,
            bindings,
            ..
        } => arguments
            .iter()
            .chain(bindings)
            .find(|binding| binding.member == member)
            .map(|binding| &binding.expression),
        Expression::Entity { expression, .. } => constructed_member(expression, member),
        _ => None,
    }
}
