//! Splitting a projector into the columns a new select must declare and the
//! client-side expression reading those columns.

use std::collections::BTreeSet;
use std::sync::Arc;

use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::checks;
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::visitor::{walk, walk_select, Rewriter};

/// The outcome of projecting an expression: the rewritten projector and the
/// columns of the select it now reads from.
#[derive(Debug, Clone)]
pub struct ProjectedColumns {
    pub projector: ExprRef,
    pub columns: Vec<ColumnDeclaration>,
}

/// Moves the server-side parts of an expression into column declarations of a
/// select with alias `new_alias`.
///
/// Columns of the existing aliases are re-declared wherever they appear, nested
/// selects included. Aggregates and subquery nodes outside nested projections
/// always become columns. In nominating mode, whole server-evaluable subtrees of
/// the top-level construction become columns as well.
pub struct ColumnProjector {
    new_alias: TableAlias,
    existing_aliases: BTreeSet<TableAlias>,
    nominate: bool,
    columns: Vec<ColumnDeclaration>,
    nested: usize,
    top_level: bool,
    generated: usize,
}

impl ColumnProjector {
    pub fn new(new_alias: TableAlias, existing_aliases: impl IntoIterator<Item = TableAlias>) -> Self {
        ColumnProjector {
            new_alias,
            existing_aliases: existing_aliases.into_iter().collect(),
            nominate: false,
            columns: vec![],
            nested: 0,
            top_level: true,
            generated: 0,
        }
    }

    #[must_use]
    pub fn nominating(mut self) -> Self {
        self.nominate = true;
        self
    }

    /// Start from columns the target select already declares; equal expressions reuse them.
    #[must_use]
    pub fn with_columns(mut self, columns: Vec<ColumnDeclaration>) -> Self {
        self.columns = columns;
        self
    }

    pub fn project(&mut self, expression: &ExprRef) -> ExprRef {
        self.top_level = true;
        self.nested = 0;
        self.rewrite(expression)
    }

    pub fn finish(self) -> Vec<ColumnDeclaration> {
        self.columns
    }

    fn declare(&mut self, expression: &ExprRef, base: Option<&str>) -> ExprRef {
        if let Some(existing) = self
            .columns
            .iter()
            .find(|column| column.expression == *expression)
        {
            return helpers::column_of(self.new_alias, existing);
        }
        let name = match base {
            Some(base) => available_column_name(&self.columns, base),
            None => loop {
                let candidate = format!("c{}", self.generated);
                self.generated += 1;
                if !self.columns.iter().any(|column| column.name == candidate) {
                    break candidate;
                }
            },
        };
        let declaration = helpers::column_declaration(&name, expression.clone());
        let column = helpers::column_of(self.new_alias, &declaration);
        self.columns.push(declaration);
        column
    }

    fn within_nested<F: FnOnce(&mut Self) -> ExprRef>(&mut self, f: F) -> ExprRef {
        self.nested += 1;
        let result = f(self);
        self.nested -= 1;
        result
    }
}

/// Nodes that can only be computed by the database.
fn must_be_column(expression: &Expression) -> bool {
    matches!(
        expression,
        Expression::Aggregate { .. }
            | Expression::AggregateSubquery { .. }
            | Expression::Scalar { .. }
            | Expression::Exists(_)
            | Expression::In { .. }
            | Expression::Between { .. }
            | Expression::IsNull(_)
            | Expression::RowNumber { .. }
            | Expression::DbFunction { .. }
    )
}

/// Whether the whole subtree can be sent to the database as one column.
pub fn is_server_expression(expression: &Expression) -> bool {
    fn admissible(expression: &Expression) -> bool {
        match expression {
            Expression::Column { .. }
            | Expression::Constant { .. }
            | Expression::Argument { .. }
            | Expression::ClientParameter { .. } => true,
            Expression::Member { expression, .. } => !checks::contains_database_nodes(expression),
            Expression::Binary { left, right, .. } => admissible(left) && admissible(right),
            Expression::Unary { operand, .. } => admissible(operand),
            Expression::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => admissible(test) && admissible(if_true) && admissible(if_false),
            Expression::Function { arguments, .. } => arguments.iter().all(|a| admissible(a)),
            other => must_be_column(other),
        }
    }
    checks::contains_database_nodes(expression) && admissible(expression)
}

impl Rewriter for ColumnProjector {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Column { alias, name, .. } => {
                if self.existing_aliases.contains(alias) {
                    let name = name.clone();
                    self.declare(expression, Some(&name))
                } else {
                    expression.clone()
                }
            }
            other if self.nested == 0 && must_be_column(other) => self.declare(expression, None),
            other if self.nested == 0 && self.nominate && self.top_level && is_server_expression(other) => {
                self.declare(expression, None)
            }
            Expression::Construct { .. } | Expression::Entity { .. } | Expression::OuterJoined { .. } => {
                walk(self, expression)
            }
            Expression::Grouping { key, group, r#type } => {
                let new_key = self.rewrite(key);
                let new_group = self.within_nested(|projector| projector.rewrite(group));
                if Arc::ptr_eq(key, &new_key) && Arc::ptr_eq(group, &new_group) {
                    expression.clone()
                } else {
                    Arc::new(Expression::Grouping {
                        key: new_key,
                        group: new_group,
                        r#type: r#type.clone(),
                    })
                }
            }
            Expression::Projection { .. } | Expression::ClientJoin { .. } => {
                self.within_nested(|projector| walk(projector, expression))
            }
            _ => {
                let saved = self.top_level;
                self.top_level = false;
                let result = walk(self, expression);
                self.top_level = saved;
                result
            }
        }
    }

    fn rewrite_select(&mut self, select: &Arc<Select>) -> Arc<Select> {
        self.nested += 1;
        let result = walk_select(self, select);
        self.nested -= 1;
        result
    }
}

/// Project `expression` onto a new select `new_alias` reading from `existing_aliases`.
pub fn project_columns(
    expression: &ExprRef,
    new_alias: TableAlias,
    existing_aliases: &[TableAlias],
) -> ProjectedColumns {
    let mut projector = ColumnProjector::new(new_alias, existing_aliases.iter().copied());
    let projected = projector.project(expression);
    ProjectedColumns {
        projector: projected,
        columns: projector.finish(),
    }
}

/// As `project_columns`, declaring whole server-evaluable subtrees as columns.
pub fn project_columns_nominating(
    expression: &ExprRef,
    new_alias: TableAlias,
    existing_aliases: &[TableAlias],
) -> ProjectedColumns {
    let mut projector =
        ColumnProjector::new(new_alias, existing_aliases.iter().copied()).nominating();
    let projected = projector.project(expression);
    ProjectedColumns {
        projector: projected,
        columns: projector.finish(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_metadata::metadata::ScalarType;
    use query_engine_sql::sql::types::Type;

    fn int() -> Type {
        Type::Scalar(ScalarType::Integer)
    }

    #[test]
    fn repeated_columns_are_declared_once() {
        let source = TableAlias(0);
        let target = TableAlias(1);
        let id = helpers::column(source, "Id", int());
        let projector = helpers::construct(
            "Pair",
            vec![("First", id.clone()), ("Second", id.clone())],
        );
        let projected = project_columns(&projector, target, &[source]);
        assert_eq!(projected.columns.len(), 1);
        assert_eq!(projected.columns[0].name, "Id");
        let Expression::Construct { bindings, .. } = &*projected.projector else {
            panic!("expected construct");
        };
        assert_eq!(bindings[0].expression, helpers::column(target, "Id", int()));
    }

    #[test]
    fn nominating_declares_server_arithmetic_as_one_column() {
        let source = TableAlias(0);
        let target = TableAlias(1);
        let doubled = helpers::binary(
            BinaryOperator::Multiply,
            helpers::column(source, "Total", int()),
            helpers::constant(2),
        );
        let projector = helpers::construct("Row", vec![("Doubled", doubled.clone())]);

        let plain = project_columns(&projector, target, &[source]);
        assert_eq!(plain.columns[0].name, "Total");

        let nominated = project_columns_nominating(&projector, target, &[source]);
        assert_eq!(nominated.columns.len(), 1);
        assert_eq!(nominated.columns[0].name, "c0");
        assert_eq!(nominated.columns[0].expression, doubled);
    }

    #[test]
    fn columns_of_other_aliases_are_left_alone() {
        let outer = TableAlias(7);
        let projector = helpers::column(outer, "Id", int());
        let projected = project_columns(&projector, TableAlias(1), &[TableAlias(0)]);
        assert!(projected.columns.is_empty());
        assert_eq!(projected.projector, projector);
    }
}
