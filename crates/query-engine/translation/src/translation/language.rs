//! Dialect adaptation of translated IR.
//!
//! Apply joins whose right side does not read the left side become ordinary joins,
//! and cross joins take their conditions from the enclosing WHERE clause. Dialects
//! that reject cross joins get an inner join on a true condition instead.

use std::collections::BTreeSet;
use std::sync::Arc;

use query_engine_metadata::metadata::ScalarType;
use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::checks;
use query_engine_sql::sql::dialect::Dialect;
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::types::Type;
use query_engine_sql::sql::visitor::{walk, walk_select, Rewriter};

use super::column_projector::ColumnProjector;
use super::reduce;

/// Adapt `expression` to what `dialect` can express.
pub fn translate(dialect: &dyn Dialect, expression: &ExprRef) -> ExprRef {
    let expression = reduce::reduce(expression);
    let rewritten = CrossApplyRewriter.rewrite(&expression);
    let rewritten = CrossJoinRewriter {
        where_: None,
        allows_cross_join: dialect.allows_cross_join(),
    }
    .rewrite(&rewritten);
    if rewritten == expression {
        return expression;
    }
    tracing::trace!("joins rewritten for {}", dialect.name());
    reduce::reduce(&rewritten)
}

/// Mark the rows an outer join matched: the projector becomes null where the test
/// column is null.
///
/// The test is a column of the joined select already compared for equality in its
/// WHERE clause, otherwise a constant column added for the purpose.
pub fn add_outer_join_test(select: &Select, projector: &ExprRef) -> (Select, ExprRef) {
    let test = outer_join_test(select);
    let mut select = select.clone();
    let column = match select.columns.iter().find(|column| column.expression == test) {
        Some(existing) => helpers::column_of(select.alias, existing),
        None => {
            let name = select.available_column_name("Test");
            let declaration = helpers::column_declaration(&name, test);
            let column = helpers::column_of(select.alias, &declaration);
            select.columns.push(declaration);
            column
        }
    };
    let projector = Arc::new(Expression::OuterJoined {
        test: column,
        expression: projector.clone(),
    });
    (select, projector)
}

fn outer_join_test(select: &Select) -> ExprRef {
    let inner = select
        .from
        .as_deref()
        .map(checks::source_aliases)
        .unwrap_or_default();
    let join_columns: Vec<ExprRef> = select
        .where_
        .iter()
        .flat_map(helpers::split_and)
        .filter_map(|conjunct| join_column(&conjunct, &inner))
        .collect();
    if let Some(preferred) = join_columns
        .iter()
        .find(|column| select.columns.iter().any(|c| c.expression == **column))
        .or_else(|| join_columns.first())
    {
        return preferred.clone();
    }
    helpers::typed_constant(1.into(), Type::optional(Type::Scalar(ScalarType::Integer)))
}

/// The inner column of an equality between an inner column and an outer one.
fn join_column(conjunct: &ExprRef, inner: &BTreeSet<TableAlias>) -> Option<ExprRef> {
    let Expression::Binary {
        operator: BinaryOperator::Equal,
        left,
        right,
        ..
    } = &**conjunct
    else {
        return None;
    };
    let is_inner = |e: &Expression| matches!(e, Expression::Column { alias, .. } if inner.contains(alias));
    let is_outer = |e: &Expression| matches!(e, Expression::Column { alias, .. } if !inner.contains(alias));
    if is_inner(left) && is_outer(right) {
        Some(left.clone())
    } else if is_inner(right) && is_outer(left) {
        Some(right.clone())
    } else {
        None
    }
}

/// A condition that can move into a join without dragging a subquery along.
fn is_plain_condition(expression: &Expression) -> bool {
    match expression {
        Expression::Column { .. } | Expression::Constant { .. } | Expression::ClientParameter { .. } => {
            true
        }
        Expression::Binary { left, right, .. } => is_plain_condition(left) && is_plain_condition(right),
        Expression::Unary { operand, .. } | Expression::IsNull(operand) => is_plain_condition(operand),
        Expression::Function { arguments, .. } => arguments.iter().all(|a| is_plain_condition(a)),
        Expression::Between {
            expression,
            lower,
            upper,
        } => is_plain_condition(expression) && is_plain_condition(lower) && is_plain_condition(upper),
        _ => false,
    }
}

struct CrossApplyRewriter;

/// The ordinary join equivalent to an apply whose right side stands alone.
fn unapplied(kind: JoinKind, left: &ExprRef, right: ExprRef, condition: Option<ExprRef>) -> ExprRef {
    let (kind, condition) = match (kind, condition) {
        (JoinKind::CrossApply, None) => (JoinKind::Cross, None),
        (JoinKind::CrossApply, Some(condition)) => (JoinKind::Inner, Some(condition)),
        // unmatched left rows are kept
        (_, condition) => (
            JoinKind::LeftOuter,
            Some(condition.unwrap_or_else(helpers::true_expr)),
        ),
    };
    Arc::new(Expression::Join {
        kind,
        left: left.clone(),
        right,
        condition,
    })
}

impl CrossApplyRewriter {
    fn rewrite_apply(
        kind: JoinKind,
        left: &ExprRef,
        right: &ExprRef,
        condition: &Option<ExprRef>,
    ) -> Option<ExprRef> {
        match &**right {
            Expression::Table(_) => Some(unapplied(kind, left, right.clone(), condition.clone())),
            Expression::Select(select)
                if select.take.is_none()
                    && select.skip.is_none()
                    && select.group_by.is_empty()
                    && !checks::has_aggregates(select)
                    && select.where_.as_deref().is_none_or(is_plain_condition) =>
            {
                let without_where = Select {
                    where_: None,
                    ..(**select).clone()
                };
                let left_aliases = checks::declared_aliases(left);
                let referenced = checks::referenced_aliases_of_select(&without_where);
                if !referenced.is_disjoint(&left_aliases) {
                    return None;
                }
                let inner_aliases = without_where
                    .from
                    .as_deref()
                    .map(checks::source_aliases)
                    .unwrap_or_default();
                let mut projector = ColumnProjector::new(select.alias, inner_aliases)
                    .with_columns(without_where.columns.clone());
                let on = select.where_.as_ref().map(|where_| projector.project(where_));
                let joined = Select {
                    columns: projector.finish(),
                    ..without_where
                };
                Some(unapplied(kind, left, helpers::select_expression(joined), on))
            }
            _ => None,
        }
    }
}

impl Rewriter for CrossApplyRewriter {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        let expression = walk(self, expression);
        match &*expression {
            Expression::Join {
                kind,
                left,
                right,
                condition,
            } if kind.is_apply() => {
                Self::rewrite_apply(*kind, left, right, condition).unwrap_or_else(|| expression.clone())
            }
            _ => expression.clone(),
        }
    }
}

/// Turns cross joins into inner joins on the WHERE conjuncts that relate both sides.
struct CrossJoinRewriter {
    where_: Option<ExprRef>,
    allows_cross_join: bool,
}

fn can_be_join_condition(
    conjunct: &Expression,
    left: &BTreeSet<TableAlias>,
    right: &BTreeSet<TableAlias>,
) -> bool {
    let referenced = checks::referenced_aliases(conjunct);
    !referenced.is_disjoint(left)
        && !referenced.is_disjoint(right)
        && referenced.iter().all(|alias| left.contains(alias) || right.contains(alias))
}

impl Rewriter for CrossJoinRewriter {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        let expression = walk(self, expression);
        let Expression::Join {
            kind: JoinKind::Cross,
            left,
            right,
            ..
        } = &*expression
        else {
            return expression;
        };
        if let Some(where_) = self.where_.take() {
            let left_aliases = checks::declared_aliases(left);
            let right_aliases = checks::declared_aliases(right);
            let (conditions, rest): (Vec<ExprRef>, Vec<ExprRef>) = helpers::split_and(&where_)
                .into_iter()
                .partition(|conjunct| can_be_join_condition(conjunct, &left_aliases, &right_aliases));
            self.where_ = helpers::and_all(rest);
            if let Some(condition) = helpers::and_all(conditions) {
                return Arc::new(Expression::Join {
                    kind: JoinKind::Inner,
                    left: left.clone(),
                    right: right.clone(),
                    condition: Some(condition),
                });
            }
        }
        if self.allows_cross_join {
            expression.clone()
        } else {
            Arc::new(Expression::Join {
                kind: JoinKind::Inner,
                left: left.clone(),
                right: right.clone(),
                condition: Some(helpers::true_expr()),
            })
        }
    }

    fn rewrite_select(&mut self, select: &Arc<Select>) -> Arc<Select> {
        let saved = std::mem::replace(&mut self.where_, select.where_.clone());
        let walked = walk_select(self, select);
        let where_ = std::mem::replace(&mut self.where_, saved);
        if where_ == walked.where_ {
            walked
        } else {
            Arc::new(Select {
                where_,
                ..(*walked).clone()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_sql::sql::dialect::Postgres;

    fn int() -> Type {
        Type::Scalar(ScalarType::Integer)
    }

    fn orders_of(customer: TableAlias, table: TableAlias, alias: TableAlias) -> Select {
        Select {
            where_: Some(helpers::equal(
                helpers::column(table, "CustomerId", int()),
                helpers::column(customer, "Id", int()),
            )),
            ..Select::new(
                alias,
                vec![helpers::column_declaration(
                    "Total",
                    helpers::column(table, "Total", int()),
                )],
                Some(helpers::table(table, "Orders")),
            )
        }
    }

    #[test]
    fn correlated_applies_become_joins_on_their_filter() {
        let join = Arc::new(Expression::Join {
            kind: JoinKind::OuterApply,
            left: helpers::table(TableAlias(0), "Customers"),
            right: helpers::select_expression(orders_of(TableAlias(0), TableAlias(1), TableAlias(2))),
            condition: None,
        });
        let rewritten = CrossApplyRewriter.rewrite(&join);
        let Expression::Join {
            kind,
            right,
            condition,
            ..
        } = &*rewritten
        else {
            panic!("expected a join");
        };
        assert_eq!(*kind, JoinKind::LeftOuter);
        let Expression::Select(right) = &**right else {
            panic!("expected a select");
        };
        assert!(right.where_.is_none());
        assert!(right.column("CustomerId").is_some());
        assert_eq!(
            condition.as_ref(),
            Some(&helpers::equal(
                helpers::column(TableAlias(2), "CustomerId", int()),
                helpers::column(TableAlias(0), "Id", int()),
            ))
        );
    }

    #[test]
    fn limited_applies_are_kept() {
        let right = Select {
            take: Some(helpers::constant(1)),
            ..orders_of(TableAlias(0), TableAlias(1), TableAlias(2))
        };
        let join = Arc::new(Expression::Join {
            kind: JoinKind::CrossApply,
            left: helpers::table(TableAlias(0), "Customers"),
            right: helpers::select_expression(right),
            condition: None,
        });
        assert_eq!(CrossApplyRewriter.rewrite(&join), join);
    }

    fn cross_select() -> ExprRef {
        helpers::select_expression(Select {
            where_: Some(helpers::and(
                helpers::equal(
                    helpers::column(TableAlias(1), "CustomerId", int()),
                    helpers::column(TableAlias(0), "Id", int()),
                ),
                helpers::greater_than(helpers::column(TableAlias(1), "Total", int()), helpers::constant(5)),
            )),
            ..Select::new(
                TableAlias(2),
                vec![helpers::column_declaration(
                    "Total",
                    helpers::column(TableAlias(1), "Total", int()),
                )],
                Some(Arc::new(Expression::Join {
                    kind: JoinKind::Cross,
                    left: helpers::table(TableAlias(0), "Customers"),
                    right: helpers::table(TableAlias(1), "Orders"),
                    condition: None,
                })),
            )
        })
    }

    #[test]
    fn cross_joins_take_their_condition_from_the_filter() {
        let rewritten = CrossJoinRewriter {
            where_: None,
            allows_cross_join: true,
        }
        .rewrite(&cross_select());
        let Expression::Select(select) = &*rewritten else {
            panic!("expected a select");
        };
        let Some(Expression::Join { kind, condition, .. }) = select.from.as_deref() else {
            panic!("expected a join");
        };
        assert_eq!(*kind, JoinKind::Inner);
        assert!(condition.is_some());
        assert_eq!(
            select.where_,
            Some(helpers::greater_than(
                helpers::column(TableAlias(1), "Total", int()),
                helpers::constant(5)
            ))
        );
    }

    #[test]
    fn outer_join_tests_prefer_the_join_column() {
        let select = orders_of(TableAlias(0), TableAlias(1), TableAlias(2));
        let (select, projector) = add_outer_join_test(&select, &helpers::column(TableAlias(2), "Total", int()));
        let Expression::OuterJoined { test, .. } = &*projector else {
            panic!("expected an outer-joined projector");
        };
        assert_eq!(*test, helpers::column(TableAlias(2), "Test", int()));
        assert_eq!(
            select.column("Test").map(|c| c.expression.clone()),
            Some(helpers::column(TableAlias(1), "CustomerId", int()))
        );

        let unfiltered = Select {
            where_: None,
            ..orders_of(TableAlias(0), TableAlias(1), TableAlias(2))
        };
        let (select, _) = add_outer_join_test(&unfiltered, &helpers::null());
        assert!(matches!(
            &*select.columns[1].expression,
            Expression::Constant { .. }
        ));
    }

    #[test]
    fn unconditioned_cross_joins_join_on_true_where_required() {
        let join = Arc::new(Expression::Join {
            kind: JoinKind::Cross,
            left: helpers::table(TableAlias(0), "Customers"),
            right: helpers::table(TableAlias(1), "Orders"),
            condition: None,
        });
        let projection = helpers::projection(
            Select::new(
                TableAlias(2),
                vec![helpers::column_declaration(
                    "Total",
                    helpers::column(TableAlias(1), "Total", int()),
                )],
                Some(join),
            ),
            helpers::column(TableAlias(2), "Total", int()),
            None,
        );
        let kind_of = |expression: &ExprRef| match &**expression {
            Expression::Projection { select, .. } => match select.from.as_deref() {
                Some(Expression::Join { kind, condition, .. }) => Some((*kind, condition.clone())),
                _ => None,
            },
            _ => None,
        };
        assert_eq!(
            kind_of(&translate(&Postgres, &projection)),
            Some((JoinKind::Cross, None))
        );
        let strict = CrossJoinRewriter {
            where_: None,
            allows_cross_join: false,
        }
        .rewrite(&projection);
        assert_eq!(
            kind_of(&strict),
            Some((JoinKind::Inner, Some(helpers::true_expr())))
        );
    }
}
