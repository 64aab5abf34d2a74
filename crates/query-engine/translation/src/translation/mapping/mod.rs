//! Lowering mapped entities into relational IR.

pub mod binder;
pub mod commands;
pub mod construct;

use std::collections::BTreeMap;
use std::sync::Arc;

use query_engine_metadata::metadata::{
    AssociationMapping, Cardinality, ColumnMapping, Constructor, MappedEntity, MappedMember,
    MemberMapping, MetadataError,
};
use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::types::Type;

use super::column_projector::project_columns;
use super::error::Error;
use super::helpers::{Env, State};
use construct::{build_construction, constructed_member, Assignment};

/// Table aliases of one occurrence of an entity's tables.
pub struct TableAliases<'m> {
    aliases: BTreeMap<&'m str, TableAlias>,
}

impl<'m> TableAliases<'m> {
    pub fn single(table: &'m str, alias: TableAlias) -> Self {
        TableAliases {
            aliases: BTreeMap::from([(table, alias)]),
        }
    }

    pub fn alias_of(&self, table: &str) -> Option<TableAlias> {
        self.aliases.get(table).copied()
    }
}

/// A column expression for a column member read through `aliases`.
pub fn column_expression(
    entity: &MappedEntity,
    mapping: &ColumnMapping,
    aliases: &TableAliases,
) -> Result<ExprRef, Error> {
    let table = entity.table_of(mapping);
    let alias = aliases.alias_of(table).ok_or_else(|| Error::MemberNotResolved {
        type_name: entity.type_name.clone(),
        member: mapping.column.clone(),
    })?;
    let db_type = mapping.parsed_type()?;
    Ok(helpers::typed_column(
        alias,
        &mapping.column,
        Type::of_column(&db_type),
        Some(db_type),
    ))
}

/// The construction of an entity from the columns of its tables.
///
/// Associations are left out; the policy decides which ones are loaded.
pub fn get_entity_expression(
    entity: &MappedEntity,
    aliases: &TableAliases,
) -> Result<ExprRef, Error> {
    let construction = build_members(
        entity,
        entity.runtime_type(),
        &entity.members,
        &entity.constructors,
        aliases,
    )?;
    Ok(Arc::new(Expression::Entity {
        entity: entity.entity_id.clone(),
        expression: construction,
    }))
}

fn build_members(
    entity: &MappedEntity,
    type_name: &str,
    members: &[MappedMember],
    constructors: &[Constructor],
    aliases: &TableAliases,
) -> Result<ExprRef, Error> {
    let mut assignments = vec![];
    for member in members {
        match &member.mapping {
            MemberMapping::Column(mapping) => {
                let column = column_expression(entity, mapping, aliases)?;
                assignments.push(Assignment::of(member, column));
            }
            MemberMapping::Nested(nested) => {
                let inner = build_members(
                    entity,
                    &nested.type_name,
                    &nested.members,
                    &nested.constructors,
                    aliases,
                )?;
                assignments.push(Assignment::of(member, inner));
            }
            MemberMapping::Association(_) => {}
        }
    }
    build_construction(type_name, constructors, members, assignments)
}

/// The canonical query of every mapped column of an entity.
///
/// Extension tables are attached with singleton left outer joins on their key
/// columns, so a missing extension row yields nulls rather than no row.
pub fn get_query_expression(state: &mut State, entity: &MappedEntity) -> Result<ExprRef, Error> {
    let tables = entity.dependency_ordered_tables()?;
    let mut aliases = TableAliases {
        aliases: BTreeMap::new(),
    };
    let mut from: Option<ExprRef> = None;

    for table in tables {
        let alias = state.next_alias();
        let table_ref = Arc::new(Expression::Table(TableRef {
            alias,
            entity: Some(entity.entity_id.clone()),
            name: table.to_string(),
        }));
        from = Some(match (from, entity.extension_table(table)) {
            (Some(left), Some(extension)) => {
                let related = extension.related_table(&entity.primary_table);
                let related_alias =
                    aliases
                        .alias_of(related)
                        .ok_or_else(|| MetadataError::TableNotFound {
                            entity: entity.entity_id.clone(),
                            table: related.to_string(),
                        })?;
                let condition = helpers::and_all(extension.key_columns.iter().map(|pair| {
                    helpers::equal(
                        key_column(entity, table, &pair.column, alias),
                        key_column(entity, related, &pair.related_column, related_alias),
                    )
                }));
                Arc::new(Expression::Join {
                    kind: JoinKind::SingletonLeftOuter,
                    left,
                    right: table_ref,
                    condition,
                })
            }
            (_, _) => table_ref,
        });
        aliases.aliases.insert(table, alias);
    }

    let projector = get_entity_expression(entity, &aliases)?;
    let select_alias = state.next_alias();
    let table_aliases: Vec<TableAlias> = aliases.aliases.values().copied().collect();
    let projected = project_columns(&projector, select_alias, &table_aliases);
    tracing::trace!(entity = %entity.entity_id, columns = projected.columns.len(), "entity query");
    Ok(helpers::projection(
        Select::new(select_alias, projected.columns, from),
        projected.projector,
        None,
    ))
}

fn key_column(entity: &MappedEntity, table: &str, column: &str, alias: TableAlias) -> ExprRef {
    let db_type = entity
        .member_for_column(table, column)
        .and_then(|member| match &member.mapping {
            MemberMapping::Column(mapping) => mapping.parsed_type().ok(),
            _ => None,
        });
    match db_type {
        Some(db_type) => {
            helpers::typed_column(alias, column, Type::of_column(&db_type), Some(db_type))
        }
        None => helpers::column(alias, column, Type::Any),
    }
}

/// The expression for `member` of the entity constructed by `root`.
pub fn get_member_expression(
    env: &Env,
    state: &mut State,
    root: &ExprRef,
    entity: &MappedEntity,
    member: &str,
) -> Result<ExprRef, Error> {
    let mapped = entity.lookup_member(member)?;
    let bound = constructed_member(root, member);
    match &mapped.mapping {
        MemberMapping::Association(association) => match bound {
            Some(bound) if !helpers::is_null_constant(bound) => Ok(bound.clone()),
            _ => get_association_expression(env, state, root, entity, mapped, association),
        },
        MemberMapping::Column(_) | MemberMapping::Nested(_) => {
            bound.cloned().ok_or_else(|| Error::MemberNotResolved {
                type_name: entity.type_name.clone(),
                member: member.to_string(),
            })
        }
    }
}

/// A correlated query of the related entity, joined back on the key members.
fn get_association_expression(
    env: &Env,
    state: &mut State,
    root: &ExprRef,
    entity: &MappedEntity,
    member: &MappedMember,
    association: &AssociationMapping,
) -> Result<ExprRef, Error> {
    let related = env.lookup_entity(&association.related_entity)?;
    let query = get_query_expression(state, related)?;
    let Expression::Projection {
        select, projector, ..
    } = &*query
    else {
        return Err(Error::NotASequence(query.kind_name()));
    };

    let mut predicates = vec![];
    for (key, related_key) in association
        .key_members
        .iter()
        .zip(&association.related_key_members)
    {
        let outer = get_member_expression(env, state, root, entity, key)?;
        let inner = get_member_expression(env, state, projector, related, related_key)?;
        predicates.push(helpers::equal(inner, outer));
    }

    let alias = state.next_alias();
    let projected = project_columns(projector, alias, &[select.alias]);
    let correlated = Select {
        where_: helpers::and_all(predicates),
        ..Select::new(
            alias,
            projected.columns,
            Some(Arc::new(Expression::Select(select.clone()))),
        )
    };
    let aggregator = match association.cardinality {
        Cardinality::One => Some(Aggregator::SingleOrDefault),
        Cardinality::Many => None,
    };
    let mut result = helpers::projection(correlated, projected.projector, aggregator);

    if let Some(operation) = env.policy.operation(&entity.entity_id, &member.name) {
        result = binder::apply_operation(env, state, &result, operation)?;
        if let (Some(aggregator), Expression::Projection { select, projector, .. }) =
            (aggregator, &*result)
        {
            result = helpers::projection((**select).clone(), projector.clone(), Some(aggregator));
        }
    }
    Ok(result)
}

/// The primary key member expressions of the entity constructed by `root`.
pub fn primary_key_expressions(
    env: &Env,
    state: &mut State,
    root: &ExprRef,
    entity: &MappedEntity,
) -> Result<Vec<ExprRef>, Error> {
    if entity.primary_key_members.is_empty() {
        return Err(Error::NoPrimaryKey(entity.entity_id.clone()));
    }
    entity
        .primary_key_members
        .iter()
        .map(|key| get_member_expression(env, state, root, entity, key))
        .collect()
}
