//! Insert, update and delete commands for mapped entities.
//!
//! Commands touch the tables of an entity in dependency order, deletes in reverse.
//! Keys generated by the database are read back through a `Declaration` of the
//! dialect's generated-id expression, whose variables later statements can use.

use std::collections::BTreeMap;
use std::sync::Arc;

use query_engine_metadata::metadata::{ColumnMapping, MappedEntity, MappedMember, MemberMapping};
use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::types::Type;

use super::binder::{as_sequence, select_source, Arguments, QueryBinder};
use super::{get_entity_expression, get_member_expression, get_query_expression, TableAliases};
use crate::translation::column_projector::project_columns;
use crate::translation::error::Error;

/// A column member and the member path leading to it from the entity.
struct ColumnPath<'m> {
    path: Vec<&'m str>,
    member: &'m MappedMember,
    mapping: &'m ColumnMapping,
}

fn column_paths(entity: &MappedEntity) -> Vec<ColumnPath<'_>> {
    fn collect<'m>(members: &'m [MappedMember], prefix: &[&'m str], into: &mut Vec<ColumnPath<'m>>) {
        for member in members {
            let mut path = prefix.to_vec();
            path.push(member.name.as_str());
            match &member.mapping {
                MemberMapping::Column(mapping) => into.push(ColumnPath {
                    path,
                    member,
                    mapping,
                }),
                MemberMapping::Nested(nested) => collect(&nested.members, &path, into),
                MemberMapping::Association(_) => {}
            }
        }
    }
    let mut paths = vec![];
    collect(&entity.members, &[], &mut paths);
    paths
}

fn table_column(alias: TableAlias, mapping: &ColumnMapping) -> Result<ExprRef, Error> {
    let db_type = mapping.parsed_type()?;
    Ok(helpers::typed_column(
        alias,
        &mapping.column,
        Type::of_column(&db_type),
        Some(db_type),
    ))
}

fn table_ref(entity: &MappedEntity, table: &str, alias: TableAlias) -> TableRef {
    TableRef {
        alias,
        entity: Some(entity.entity_id.clone()),
        name: table.to_string(),
    }
}

fn block(mut commands: Vec<ExprRef>) -> ExprRef {
    if commands.len() == 1 {
        if let Some(command) = commands.pop() {
            return command;
        }
    }
    Arc::new(Expression::Block(commands))
}

impl<'a> QueryBinder<'a, '_> {
    pub(super) fn bind_command(
        &mut self,
        operator: QueryOperator,
        args: &Arguments,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let entity = self.command_entity(args.required(0))?;
        match operator {
            QueryOperator::Insert => {
                let instance = self.bind(args.required(1))?;
                self.insert_command(entity, &instance, args.optional(2), name)
            }
            QueryOperator::Update => {
                let instance = self.bind(args.required(1))?;
                self.update_command(entity, &instance, args.optional(2), args.optional(3), None, name)
            }
            QueryOperator::InsertOrUpdate => {
                let instance = self.bind(args.required(1))?;
                self.insert_or_update_command(entity, &instance, args.optional(2), args.optional(3), name)
            }
            QueryOperator::Delete => {
                let instance = self.bind(args.required(1))?;
                self.delete_command(entity, &instance, args.optional(2), name)
            }
            QueryOperator::DeleteWhere => self.delete_where_command(entity, args.required(1), name),
            _ => self.batch_command(args, name),
        }
    }

    fn command_entity(&self, set: &ExprRef) -> Result<&'a MappedEntity, Error> {
        match &**set {
            Expression::EntitySet { entity, .. } => self.env.lookup_entity(entity),
            other => Err(Error::NotSupported(format!(
                "commands over '{}' rather than an entity set",
                other.kind_name()
            ))),
        }
    }

    fn member_value(&mut self, instance: &ExprRef, path: &[&str]) -> Result<ExprRef, Error> {
        let mut value = instance.clone();
        for member in path {
            value = self.bind_member(&value, member)?;
        }
        Ok(value)
    }

    /// The value a key column of `table` takes: the column of the related table it
    /// equals, read from a generated-id variable when there is one.
    fn related_key_value(
        &mut self,
        entity: &MappedEntity,
        related_table: &str,
        related_column: &str,
        instance: &ExprRef,
        variables: &BTreeMap<String, ExprRef>,
    ) -> Result<ExprRef, Error> {
        let paths = column_paths(entity);
        let path = paths
            .iter()
            .find(|path| {
                entity.table_of(path.mapping) == related_table && path.mapping.column == related_column
            })
            .ok_or_else(|| Error::MemberNotResolved {
                type_name: entity.type_name.clone(),
                member: related_column.to_string(),
            })?;
        match variables.get(&path.member.name) {
            Some(variable) => Ok(variable.clone()),
            None => self.member_value(instance, &path.path),
        }
    }

    /// Key equality of one table of the entity against the instance.
    fn identity_check(
        &mut self,
        entity: &MappedEntity,
        table: &str,
        alias: TableAlias,
        instance: &ExprRef,
    ) -> Result<Option<ExprRef>, Error> {
        let mut predicates = vec![];
        match entity.extension_table(table) {
            Some(extension) => {
                let related = extension.related_table(&entity.primary_table);
                for pair in &extension.key_columns {
                    let column = super::key_column(entity, table, &pair.column, alias);
                    let value = self.related_key_value(
                        entity,
                        related,
                        &pair.related_column,
                        instance,
                        &BTreeMap::new(),
                    )?;
                    predicates.push(helpers::equal(column, value));
                }
            }
            None => {
                if entity.primary_key_members.is_empty() {
                    return Err(Error::NoPrimaryKey(entity.entity_id.clone()));
                }
                for key in &entity.primary_key_members {
                    let MemberMapping::Column(mapping) = &entity.lookup_member(key)?.mapping else {
                        return Err(Error::NoPrimaryKey(entity.entity_id.clone()));
                    };
                    let column = table_column(alias, mapping)?;
                    let value = self.member_value(instance, &[key.as_str()])?;
                    predicates.push(helpers::equal(column, value));
                }
            }
        }
        Ok(helpers::and_all(predicates))
    }

    /// An entity query restricted by `predicate`, projected through `selector`.
    fn entity_result(
        &mut self,
        entity: &MappedEntity,
        selector: &ExprRef,
        name: &str,
        predicate: impl FnOnce(&mut Self, &ExprRef) -> Result<Option<ExprRef>, Error>,
    ) -> Result<ExprRef, Error> {
        let query = get_query_expression(self.state, entity)?;
        let sequence = as_sequence(&query)?;
        let where_ = predicate(self, &sequence.projector)?;
        let selection = self.bind_lambda(selector, name, 2, &[sequence.projector.clone()])?;
        let alias = self.state.next_alias();
        let projected = project_columns(&selection, alias, &[sequence.select.alias]);
        Ok(helpers::projection(
            Select {
                where_,
                ..Select::new(alias, projected.columns, Some(select_source(&sequence.select)))
            },
            projected.projector,
            Some(Aggregator::Single),
        ))
    }

    fn key_predicate(
        &mut self,
        entity: &MappedEntity,
        projector: &ExprRef,
        instance: &ExprRef,
    ) -> Result<Option<ExprRef>, Error> {
        let mut predicates = vec![];
        for key in &entity.primary_key_members {
            let column = get_member_expression(&self.env, self.state, projector, entity, key)?;
            let value = self.member_value(instance, &[key.as_str()])?;
            predicates.push(helpers::equal(column, value));
        }
        Ok(helpers::and_all(predicates))
    }

    /// Whether the stored row of the instance exists and satisfies `check`.
    fn entity_state_test(
        &mut self,
        entity: &MappedEntity,
        instance: &ExprRef,
        check: Option<&ExprRef>,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let query = get_query_expression(self.state, entity)?;
        let sequence = as_sequence(&query)?;
        let mut where_ = self.key_predicate(entity, &sequence.projector, instance)?;
        if let Some(check) = check {
            let predicate = self.bind_lambda(check, name, 2, &[sequence.projector.clone()])?;
            where_ = helpers::and_option(where_, Some(predicate));
        }
        let alias = self.state.next_alias();
        Ok(Arc::new(Expression::Exists(Arc::new(Select {
            where_,
            ..Select::new(alias, vec![], Some(select_source(&sequence.select)))
        }))))
    }

    /// Read back generated keys into variables named after their members.
    fn generated_id_declaration(
        &mut self,
        entity: &MappedEntity,
        members: &[&ColumnPath],
    ) -> Result<(ExprRef, Arc<Select>, BTreeMap<String, ExprRef>), Error> {
        let alias = self.state.next_alias();
        let mut columns = vec![];
        let mut declarations = vec![];
        let mut variables = BTreeMap::new();
        for path in members {
            let db_type = path.mapping.parsed_type()?;
            if !db_type.scalar.is_integral() {
                return Err(Error::MissingGeneratedIdStrategy {
                    entity: entity.entity_id.clone(),
                    member: path.member.name.clone(),
                });
            }
            let r#type = Type::Scalar(db_type.scalar);
            let generated = self.env.dialect.generated_id_expression(r#type.clone());
            let name = path.member.name.clone();
            columns.push(ColumnDeclaration {
                name: name.clone(),
                expression: generated.clone(),
                query_type: Some(db_type.clone()),
            });
            declarations.push(VariableDeclaration {
                name: name.clone(),
                r#type: r#type.clone(),
                query_type: Some(db_type.clone()),
                expression: generated,
            });
            variables.insert(
                name.clone(),
                Arc::new(Expression::Variable {
                    name,
                    r#type,
                    query_type: Some(db_type),
                }),
            );
        }
        let source = Arc::new(Select::new(alias, columns, None));
        let declaration = Arc::new(Expression::Declaration {
            variables: declarations,
            source: Some(source.clone()),
        });
        Ok((declaration, source, variables))
    }

    fn insert_command(
        &mut self,
        entity: &MappedEntity,
        instance: &ExprRef,
        selector: Option<&ExprRef>,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let tables = entity.dependency_ordered_tables()?;
        let paths = column_paths(entity);
        let mut variables: BTreeMap<String, ExprRef> = BTreeMap::new();
        let mut commands = vec![];

        for (index, table) in tables.iter().enumerate() {
            let alias = self.state.next_alias();
            let mut assignments = vec![];
            for path in paths.iter().filter(|path| {
                entity.table_of(path.mapping) == *table
                    && !path.mapping.generated
                    && !path.mapping.computed
            }) {
                assignments.push(ColumnAssignment {
                    column: table_column(alias, path.mapping)?,
                    expression: self.member_value(instance, &path.path)?,
                });
            }
            if let Some(extension) = entity.extension_table(table) {
                let related = extension.related_table(&entity.primary_table);
                for pair in &extension.key_columns {
                    let value = self.related_key_value(
                        entity,
                        related,
                        &pair.related_column,
                        instance,
                        &variables,
                    )?;
                    let column = super::key_column(entity, table, &pair.column, alias);
                    assignments.retain(|assignment| match &*assignment.column {
                        Expression::Column { name, .. } => *name != pair.column,
                        _ => true,
                    });
                    assignments.push(ColumnAssignment {
                        column,
                        expression: value,
                    });
                }
            }
            commands.push(Arc::new(Expression::Insert {
                table: table_ref(entity, table, alias),
                assignments,
            }));

            // keys generated here that a later table refers to
            let later_tables = &tables[index + 1..];
            let needed: Vec<&ColumnPath> = paths
                .iter()
                .filter(|path| {
                    path.mapping.generated
                        && entity.table_of(path.mapping) == *table
                        && entity.extension_tables.iter().any(|extension| {
                            later_tables.contains(&extension.name.as_str())
                                && extension.related_table(&entity.primary_table) == *table
                                && extension
                                    .key_columns
                                    .iter()
                                    .any(|pair| pair.related_column == path.mapping.column)
                        })
                })
                .collect();
            if !needed.is_empty() {
                let (declaration, _, declared) = self.generated_id_declaration(entity, &needed)?;
                commands.push(declaration);
                variables.extend(declared);
            }
        }

        if let Some(selector) = selector {
            let result = self.insert_result(entity, instance, selector, &paths, &mut variables, &mut commands, name)?;
            commands.push(result);
        }
        Ok(block(commands))
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_result(
        &mut self,
        entity: &MappedEntity,
        instance: &ExprRef,
        selector: &ExprRef,
        paths: &[ColumnPath],
        variables: &mut BTreeMap<String, ExprRef>,
        commands: &mut Vec<ExprRef>,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let generated: Vec<&ColumnPath> = paths
            .iter()
            .filter(|path| path.mapping.generated && entity.is_primary_key(&path.member.name))
            .collect();
        if generated.is_empty() {
            return self.entity_result(entity, selector, name, |binder, projector| {
                binder.key_predicate(entity, projector, instance)
            });
        }

        let missing: Vec<&ColumnPath> = generated
            .iter()
            .copied()
            .filter(|path| !variables.contains_key(&path.member.name))
            .collect();
        let fresh = if missing.is_empty() {
            None
        } else {
            Some(self.generated_id_declaration(entity, &missing)?)
        };

        // reading back just the generated key needs no further query
        if let Some(member) = selected_member(selector) {
            if let Some(path) = generated.iter().find(|path| path.member.name == member) {
                return match &fresh {
                    Some((_, source, _)) => {
                        let column = source
                            .column(&path.member.name)
                            .map(|declaration| helpers::column_of(source.alias, declaration))
                            .ok_or_else(|| Error::MemberNotResolved {
                                type_name: entity.type_name.clone(),
                                member: path.member.name.clone(),
                            })?;
                        Ok(helpers::projection(
                            (**source).clone(),
                            column,
                            Some(Aggregator::Single),
                        ))
                    }
                    None => {
                        let variable = variables.get(&path.member.name).cloned().ok_or_else(|| {
                            Error::MemberNotResolved {
                                type_name: entity.type_name.clone(),
                                member: path.member.name.clone(),
                            }
                        })?;
                        let alias = self.state.next_alias();
                        let declaration = helpers::column_declaration(&path.member.name, variable);
                        let column = helpers::column_of(alias, &declaration);
                        Ok(helpers::projection(
                            Select::new(alias, vec![declaration], None),
                            column,
                            Some(Aggregator::Single),
                        ))
                    }
                };
            }
        }

        if let Some((declaration, _, declared)) = fresh {
            commands.push(declaration);
            variables.extend(declared);
        }
        let keys: Vec<(String, ExprRef)> = generated
            .iter()
            .filter_map(|path| {
                variables
                    .get(&path.member.name)
                    .map(|variable| (path.member.name.clone(), variable.clone()))
            })
            .collect();
        self.entity_result(entity, selector, name, |binder, projector| {
            let mut predicates = vec![];
            for (member, variable) in keys {
                let column = get_member_expression(&binder.env, binder.state, projector, entity, &member)?;
                predicates.push(helpers::equal(column, variable));
            }
            Ok(helpers::and_all(predicates))
        })
    }

    fn update_command(
        &mut self,
        entity: &MappedEntity,
        instance: &ExprRef,
        check: Option<&ExprRef>,
        selector: Option<&ExprRef>,
        otherwise: Option<ExprRef>,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let tables = entity.dependency_ordered_tables()?;
        let single_table = tables.len() == 1;
        let paths = column_paths(entity);
        let mut commands = vec![];

        for table in &tables {
            let alias = self.state.next_alias();
            let mut assignments = vec![];
            for path in paths.iter().filter(|path| {
                entity.table_of(path.mapping) == *table
                    && !path.mapping.primary_key
                    && !entity.is_primary_key(&path.member.name)
                    && !path.mapping.generated
                    && !path.mapping.computed
            }) {
                assignments.push(ColumnAssignment {
                    column: table_column(alias, path.mapping)?,
                    expression: self.member_value(instance, &path.path)?,
                });
            }
            if assignments.is_empty() && !single_table {
                continue;
            }
            let mut where_ = self.identity_check(entity, table, alias, instance)?;
            if let (true, Some(check)) = (single_table, check) {
                let row = get_entity_expression(entity, &TableAliases::single(table, alias))?;
                let predicate = self.bind_lambda(check, name, 2, &[row])?;
                where_ = helpers::and_option(where_, Some(predicate));
            }
            commands.push(Arc::new(Expression::Update {
                table: table_ref(entity, table, alias),
                where_,
                assignments,
            }));
        }

        let rows_affected = self.env.dialect.rows_affected_expression();
        if let Some(selector) = selector {
            let result = self.entity_result(entity, selector, name, |binder, projector| {
                binder.key_predicate(entity, projector, instance)
            })?;
            commands.push(Arc::new(Expression::If {
                check: helpers::greater_than(rows_affected, helpers::constant(0)),
                if_true: result,
                if_false: otherwise,
            }));
        } else if let Some(otherwise) = otherwise {
            commands.push(Arc::new(Expression::If {
                check: helpers::binary(
                    BinaryOperator::LessThanOrEqual,
                    rows_affected,
                    helpers::constant(0),
                ),
                if_true: otherwise,
                if_false: None,
            }));
        }

        let update = block(commands);
        match check {
            Some(check) if !single_table => Ok(Arc::new(Expression::If {
                check: self.entity_state_test(entity, instance, Some(check), name)?,
                if_true: update,
                if_false: None,
            })),
            _ => Ok(update),
        }
    }

    fn insert_or_update_command(
        &mut self,
        entity: &MappedEntity,
        instance: &ExprRef,
        check: Option<&ExprRef>,
        selector: Option<&ExprRef>,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let insert = self.insert_command(entity, instance, selector, name)?;
        match check {
            Some(check) => {
                let update = self.update_command(entity, instance, Some(check), selector, None, name)?;
                Ok(Arc::new(Expression::If {
                    check: self.entity_state_test(entity, instance, None, name)?,
                    if_true: update,
                    if_false: Some(insert),
                }))
            }
            None => self.update_command(entity, instance, None, selector, Some(insert), name),
        }
    }

    fn delete_command(
        &mut self,
        entity: &MappedEntity,
        instance: &ExprRef,
        check: Option<&ExprRef>,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let tables = entity.dependency_ordered_tables()?;
        let single_table = tables.len() == 1;
        let mut commands = vec![];
        for table in tables.iter().rev() {
            let alias = self.state.next_alias();
            let mut where_ = self.identity_check(entity, table, alias, instance)?;
            if let (true, Some(check)) = (single_table, check) {
                let row = get_entity_expression(entity, &TableAliases::single(table, alias))?;
                let predicate = self.bind_lambda(check, name, 2, &[row])?;
                where_ = helpers::and_option(where_, Some(predicate));
            }
            commands.push(Arc::new(Expression::Delete {
                table: table_ref(entity, table, alias),
                where_,
            }));
        }
        let delete = block(commands);
        match check {
            Some(check) if !single_table => Ok(Arc::new(Expression::If {
                check: self.entity_state_test(entity, instance, Some(check), name)?,
                if_true: delete,
                if_false: None,
            })),
            _ => Ok(delete),
        }
    }

    fn delete_where_command(
        &mut self,
        entity: &MappedEntity,
        predicate: &ExprRef,
        name: &str,
    ) -> Result<ExprRef, Error> {
        if !entity.extension_tables.is_empty() {
            return Err(Error::NotSupported(format!(
                "deleting '{}' by predicate across several tables",
                entity.entity_id
            )));
        }
        let alias = self.state.next_alias();
        let row = get_entity_expression(
            entity,
            &TableAliases::single(&entity.primary_table, alias),
        )?;
        let where_ = self.bind_lambda(predicate, name, 1, &[row])?;
        Ok(Arc::new(Expression::Delete {
            table: table_ref(entity, &entity.primary_table, alias),
            where_: Some(where_),
        }))
    }

    /// The operation is bound once with its parameter left open; it is applied to
    /// each input element when the plan runs.
    fn batch_command(&mut self, args: &Arguments, name: &str) -> Result<ExprRef, Error> {
        let input = self.bind(args.required(1))?;
        let operation = self.bind_open_lambda(args.required(2), name)?;
        let batch_size = match &**args.required(3) {
            Expression::Constant { value, .. } => value
                .as_i64()
                .and_then(|size| usize::try_from(size).ok())
                .filter(|size| *size > 0)
                .unwrap_or(1),
            _ => 1,
        };
        let stream = matches!(
            &**args.required(4),
            Expression::Constant { value, .. } if value.as_bool() == Some(true)
        );
        Ok(Arc::new(Expression::Batch {
            input,
            operation,
            batch_size,
            stream,
        }))
    }
}

/// The member read by a selector of the form `x => x.Member`.
fn selected_member(selector: &ExprRef) -> Option<&str> {
    let Expression::Lambda { parameters, body } = &**selector else {
        return None;
    };
    match (&**body, parameters.as_slice()) {
        (
            Expression::Member {
                expression, member, ..
            },
            [parameter],
        ) if matches!(&**expression, Expression::Parameter(p) if p.name == parameter.name) => {
            Some(member.as_str())
        }
        _ => None,
    }
}
