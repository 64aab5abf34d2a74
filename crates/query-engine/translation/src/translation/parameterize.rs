//! Turn constants and host values in a statement into named parameters.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use query_engine_metadata::metadata::DbType;
use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::evaluate::{depends_on_inputs, is_host_evaluable};
use query_engine_sql::sql::value::Value;
use query_engine_sql::sql::visitor::{walk, walk_visit, Rewriter, Visitor};

/// Parameterize one statement. Names are `p0`, `p1`, ... in first-use order.
///
/// Inline numeric, boolean and null literals are kept. Equal values share one
/// parameter; projectors are host code and are left alone.
pub fn parameterize(expression: &ExprRef) -> ExprRef {
    Parameterizer::new("p").rewrite(expression)
}

/// Replace references to the columns of `outer` by parameters named `n0`, `n1`, ...
///
/// Used for a nested query that runs once per row of the query enclosing it; the
/// parameter values are read from that row.
pub fn parameterize_outer(expression: &ExprRef, outer: &BTreeSet<TableAlias>) -> ExprRef {
    OuterParameterizer {
        outer,
        names: IndexMap::new(),
    }
    .rewrite(expression)
}

/// The client parameters of a statement with the host expression computing each,
/// in first-use order.
pub fn client_parameters(expression: &Expression) -> Vec<(String, ExprRef)> {
    struct Collector {
        found: IndexMap<String, ExprRef>,
    }

    impl Visitor for Collector {
        fn visit(&mut self, expression: &Expression) {
            match expression {
                Expression::ClientParameter { name, value, .. } => {
                    self.found
                        .entry(name.clone())
                        .or_insert_with(|| value.clone());
                }
                // host values of the projector
                Expression::Projection { select, .. } => self.visit_select(select),
                _ => walk_visit(self, expression),
            }
        }
    }

    let mut collector = Collector {
        found: IndexMap::new(),
    };
    collector.visit(expression);
    collector.found.into_iter().collect()
}

struct Parameterizer {
    prefix: &'static str,
    names: IndexMap<ExprRef, String>,
}

impl Parameterizer {
    fn new(prefix: &'static str) -> Self {
        Parameterizer {
            prefix,
            names: IndexMap::new(),
        }
    }

    fn parameter(&mut self, value: &ExprRef, query_type: Option<DbType>) -> ExprRef {
        let next = self.names.len();
        let name = self
            .names
            .entry(value.clone())
            .or_insert_with(|| format!("{}{next}", self.prefix))
            .clone();
        Arc::new(Expression::ClientParameter {
            name,
            r#type: value.r#type(),
            query_type,
            value: value.clone(),
        })
    }

    /// Rewrite `operand`, typing a resulting parameter like `column`.
    fn typed_like(&mut self, operand: &ExprRef, column: &Expression) -> ExprRef {
        let rewritten = self.rewrite(operand);
        match (&*rewritten, column) {
            (
                Expression::ClientParameter {
                    name,
                    r#type,
                    query_type: None,
                    value,
                },
                Expression::Column {
                    query_type: Some(query_type),
                    ..
                },
            ) => Arc::new(Expression::ClientParameter {
                name: name.clone(),
                r#type: r#type.clone(),
                query_type: Some(query_type.clone()),
                value: value.clone(),
            }),
            _ => rewritten,
        }
    }
}

fn is_comparison(operator: BinaryOperator) -> bool {
    matches!(
        operator,
        BinaryOperator::Equal
            | BinaryOperator::NotEqual
            | BinaryOperator::LessThan
            | BinaryOperator::LessThanOrEqual
            | BinaryOperator::GreaterThan
            | BinaryOperator::GreaterThanOrEqual
    )
}

fn stays_inline(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_)
    )
}

impl Rewriter for Parameterizer {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Constant { value, .. } if stays_inline(value) => expression.clone(),
            Expression::Constant { .. } => self.parameter(expression, None),
            Expression::ClientParameter { .. } | Expression::Variable { .. } => expression.clone(),
            Expression::Projection {
                select,
                projector,
                aggregator,
                deferred,
            } => {
                let new_select = self.rewrite_select(select);
                if Arc::ptr_eq(&new_select, select) {
                    expression.clone()
                } else {
                    Arc::new(Expression::Projection {
                        select: new_select,
                        projector: projector.clone(),
                        aggregator: *aggregator,
                        deferred: *deferred,
                    })
                }
            }
            Expression::ClientJoin {
                outer_key,
                inner_key,
                projection,
            } => {
                let new_projection = self.rewrite(projection);
                if Arc::ptr_eq(&new_projection, projection) {
                    expression.clone()
                } else {
                    Arc::new(Expression::ClientJoin {
                        outer_key: outer_key.clone(),
                        inner_key: inner_key.clone(),
                        projection: new_projection,
                    })
                }
            }
            Expression::Declaration { variables, source } => {
                let new_source = source.as_ref().map(|source| self.rewrite_select(source));
                if new_source == *source {
                    expression.clone()
                } else {
                    Arc::new(Expression::Declaration {
                        variables: variables.clone(),
                        source: new_source,
                    })
                }
            }
            Expression::Binary {
                operator,
                left,
                right,
                r#type,
            } if is_comparison(*operator) => {
                let new_left = self.typed_like(left, right);
                let new_right = self.typed_like(right, left);
                if Arc::ptr_eq(&new_left, left) && Arc::ptr_eq(&new_right, right) {
                    expression.clone()
                } else {
                    Arc::new(Expression::Binary {
                        operator: *operator,
                        left: new_left,
                        right: new_right,
                        r#type: r#type.clone(),
                    })
                }
            }
            Expression::Insert { table, assignments } => {
                let new_assignments = self.rewrite_assignments(assignments);
                if same_assignments(&new_assignments, assignments) {
                    expression.clone()
                } else {
                    Arc::new(Expression::Insert {
                        table: table.clone(),
                        assignments: new_assignments,
                    })
                }
            }
            Expression::Update {
                table,
                where_,
                assignments,
            } => {
                let new_where = where_.as_ref().map(|where_| self.rewrite(where_));
                let new_assignments = self.rewrite_assignments(assignments);
                let same_where = match (&new_where, where_) {
                    (Some(new), Some(old)) => Arc::ptr_eq(new, old),
                    (None, None) => true,
                    _ => false,
                };
                if same_where && same_assignments(&new_assignments, assignments) {
                    expression.clone()
                } else {
                    Arc::new(Expression::Update {
                        table: table.clone(),
                        where_: new_where,
                        assignments: new_assignments,
                    })
                }
            }
            other if is_host_evaluable(other) && depends_on_inputs(other) => {
                self.parameter(expression, None)
            }
            _ => walk(self, expression),
        }
    }
}

impl Parameterizer {
    fn rewrite_assignments(&mut self, assignments: &[ColumnAssignment]) -> Vec<ColumnAssignment> {
        assignments
            .iter()
            .map(|assignment| ColumnAssignment {
                column: assignment.column.clone(),
                expression: self.typed_like(&assignment.expression, &assignment.column),
            })
            .collect()
    }
}

fn same_assignments(new: &[ColumnAssignment], old: &[ColumnAssignment]) -> bool {
    new.iter()
        .zip(old)
        .all(|(new, old)| Arc::ptr_eq(&new.expression, &old.expression))
}

struct OuterParameterizer<'o> {
    outer: &'o BTreeSet<TableAlias>,
    names: IndexMap<ExprRef, String>,
}

impl Rewriter for OuterParameterizer<'_> {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Column {
                alias,
                r#type,
                query_type,
                ..
            } if self.outer.contains(alias) => {
                let next = self.names.len();
                let name = self
                    .names
                    .entry(expression.clone())
                    .or_insert_with(|| format!("n{next}"))
                    .clone();
                Arc::new(Expression::ClientParameter {
                    name,
                    r#type: r#type.clone(),
                    query_type: query_type.clone(),
                    value: expression.clone(),
                })
            }
            // the projector reads the outer row itself
            Expression::Projection {
                select,
                projector,
                aggregator,
                deferred,
            } => Arc::new(Expression::Projection {
                select: self.rewrite_select(select),
                projector: projector.clone(),
                aggregator: *aggregator,
                deferred: *deferred,
            }),
            _ => walk(self, expression),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_metadata::metadata::ScalarType;
    use query_engine_sql::sql::helpers;
    use query_engine_sql::sql::types::Type;

    fn customers(filter: impl FnOnce(ExprRef) -> ExprRef) -> ExprRef {
        let table = TableAlias(0);
        let select = TableAlias(1);
        let city = helpers::typed_column(
            table,
            "City",
            Type::Scalar(ScalarType::String),
            DbType::parse("nvarchar(30)").ok(),
        );
        let columns = vec![helpers::column_declaration("City", city.clone())];
        helpers::projection(
            Select {
                where_: Some(filter(city)),
                ..Select::new(select, columns, Some(helpers::table(table, "Customers")))
            },
            helpers::column(select, "City", Type::Scalar(ScalarType::String)),
            None,
        )
    }

    fn parameters_of(expression: &ExprRef) -> Vec<String> {
        client_parameters(expression)
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    fn insert_order(customer: ExprRef, total: ExprRef) -> ExprRef {
        let table = TableRef {
            alias: TableAlias(0),
            entity: None,
            name: "Orders".to_string(),
        };
        let column = |name: &str| {
            helpers::typed_column(
                TableAlias(0),
                name,
                Type::Scalar(ScalarType::Integer),
                DbType::parse("int").ok(),
            )
        };
        Arc::new(Expression::Insert {
            table,
            assignments: vec![
                ColumnAssignment {
                    column: column("CustomerId"),
                    expression: customer,
                },
                ColumnAssignment {
                    column: column("Total"),
                    expression: total,
                },
            ],
        })
    }

    #[test]
    fn statements_without_parameters_are_returned_as_is() {
        let insert = insert_order(helpers::constant(1), helpers::constant(5));
        assert!(Arc::ptr_eq(&parameterize(&insert), &insert));
    }

    #[test]
    fn inserted_strings_become_parameters() {
        let insert = insert_order(helpers::constant(1), helpers::constant("5"));
        let parameterized = parameterize(&insert);
        assert!(!Arc::ptr_eq(&parameterized, &insert));
        assert_eq!(parameters_of(&parameterized), vec!["p0".to_string()]);
    }

    #[test]
    fn equal_constants_share_one_parameter() {
        let query = customers(|city| {
            helpers::or(
                helpers::equal(city.clone(), helpers::constant("London")),
                helpers::equal(helpers::constant("London"), city),
            )
        });
        let parameterized = parameterize(&query);
        assert_eq!(parameters_of(&parameterized), vec!["p0"]);
    }

    #[test]
    fn numeric_and_boolean_literals_stay_inline() {
        let query = customers(|city| {
            helpers::and(
                helpers::greater_than(
                    helpers::function(Function::Length, vec![city]),
                    helpers::constant(3),
                ),
                helpers::true_expr(),
            )
        });
        let parameterized = parameterize(&query);
        assert!(parameters_of(&parameterized).is_empty());
        assert!(Arc::ptr_eq(&parameterized, &query));
    }

    #[test]
    fn compared_parameters_take_the_column_type() {
        let query = customers(|city| helpers::equal(city, helpers::constant("Paris")));
        let parameterized = parameterize(&query);
        let Expression::Projection { select, .. } = &*parameterized else {
            panic!("expected a projection");
        };
        let Some(Expression::Binary { right, .. }) = select.where_.as_deref() else {
            panic!("expected a comparison");
        };
        let Expression::ClientParameter { query_type, .. } = &**right else {
            panic!("expected a parameter");
        };
        assert_eq!(query_type.as_ref().map(|t| t.name.as_str()), Some("nvarchar"));
    }

    #[test]
    fn argument_reads_become_parameters() {
        let query = customers(|city| {
            helpers::equal(
                city,
                helpers::member(
                    &helpers::argument("filter", Type::Object("Filter".to_string())),
                    "City",
                ),
            )
        });
        let parameterized = parameterize(&query);
        let parameters = client_parameters(&parameterized);
        assert_eq!(parameters.len(), 1);
        assert!(matches!(&*parameters[0].1, Expression::Member { .. }));
    }

    #[test]
    fn outer_columns_become_row_parameters() {
        let outer = TableAlias(7);
        let query = customers(|city| {
            helpers::equal(
                city,
                helpers::column(outer, "City", Type::Scalar(ScalarType::String)),
            )
        });
        let parameterized = parameterize_outer(&query, &BTreeSet::from([outer]));
        assert_eq!(parameters_of(&parameterized), vec!["n0"]);
    }
}
