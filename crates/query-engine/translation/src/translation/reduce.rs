//! Reducers that simplify the IR between translation stages.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::checks;
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::visitor::{rewrite_list, rewrite_option, walk, walk_select, Rewriter};

use super::aliasing::remove_subqueries;

/// Run every reducer once, in the order later ones expect.
pub fn reduce(expression: &ExprRef) -> ExprRef {
    let expression = rewrite_aggregates(expression);
    let expression = remove_unused_columns(&expression);
    let expression = remove_redundant_subqueries(&expression);
    let expression = merge_subqueries(&expression);
    remove_unused_columns(&expression)
}

/// Lift every `AggregateSubquery` into a column of the select that groups it.
pub fn rewrite_aggregates(expression: &ExprRef) -> ExprRef {
    let mut gatherer = AggregateGatherer::default();
    gatherer.rewrite(expression);
    if gatherer.by_alias.is_empty() {
        return expression.clone();
    }
    let mut lifter = AggregateLifter {
        by_alias: gatherer.by_alias,
        lifted: vec![],
    };
    let lifted = lifter.rewrite(expression);
    AggregateReplacer {
        lifted: lifter.lifted,
    }
    .rewrite(&lifted)
}

#[derive(Default)]
struct AggregateGatherer {
    by_alias: BTreeMap<TableAlias, Vec<ExprRef>>,
}

impl Rewriter for AggregateGatherer {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        if let Expression::AggregateSubquery { group_by_alias, .. } = &**expression {
            let gathered = self.by_alias.entry(*group_by_alias).or_default();
            if !gathered.contains(expression) {
                gathered.push(expression.clone());
            }
        }
        walk(self, expression)
    }
}

struct AggregateLifter {
    by_alias: BTreeMap<TableAlias, Vec<ExprRef>>,
    lifted: Vec<(ExprRef, ExprRef)>,
}

impl Rewriter for AggregateLifter {
    fn rewrite_select(&mut self, select: &Arc<Select>) -> Arc<Select> {
        let select = walk_select(self, select);
        let Some(aggregates) = self.by_alias.remove(&select.alias) else {
            return select;
        };
        let mut columns = select.columns.clone();
        for aggregate_subquery in aggregates {
            let Expression::AggregateSubquery { aggregate, .. } = &*aggregate_subquery else {
                continue;
            };
            let name = available_column_name(&columns, &format!("agg{}", columns.len()));
            let declaration = helpers::column_declaration(&name, aggregate.clone());
            self.lifted
                .push((aggregate_subquery.clone(), helpers::column_of(select.alias, &declaration)));
            columns.push(declaration);
        }
        Arc::new(Select {
            columns,
            ..(*select).clone()
        })
    }
}

struct AggregateReplacer {
    lifted: Vec<(ExprRef, ExprRef)>,
}

impl Rewriter for AggregateReplacer {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::AggregateSubquery { subquery, .. } => {
                match self.lifted.iter().find(|(original, _)| original == expression) {
                    Some((_, column)) => column.clone(),
                    None => self.rewrite(subquery),
                }
            }
            _ => walk(self, expression),
        }
    }
}

/// Drop the columns of nested selects that nothing reads, and singleton outer
/// joins whose right side is not read at all.
pub fn remove_unused_columns(expression: &ExprRef) -> ExprRef {
    UnusedColumnRemover::default().rewrite(expression)
}

#[derive(Default)]
struct UnusedColumnRemover {
    used: BTreeMap<TableAlias, BTreeSet<String>>,
    retain_all: bool,
}

impl UnusedColumnRemover {
    fn mark(&mut self, alias: TableAlias, name: &str) {
        self.used.entry(alias).or_default().insert(name.to_string());
    }

    fn is_used(&self, alias: TableAlias, name: &str) -> bool {
        self.used
            .get(&alias)
            .is_some_and(|columns| columns.contains(name))
    }

    fn is_alias_read(&self, source: &Expression) -> bool {
        checks::source_aliases(source)
            .iter()
            .any(|alias| self.used.get(alias).is_some_and(|columns| !columns.is_empty()))
    }

    fn rewrite_join(&mut self, expression: &ExprRef) -> ExprRef {
        let Expression::Join {
            kind,
            left,
            right,
            condition,
        } = &**expression
        else {
            return walk(self, expression);
        };
        if *kind == JoinKind::SingletonLeftOuter && !self.is_alias_read(right) {
            return self.rewrite(left);
        }
        // the condition reads both sides and is visited first
        let new_condition = rewrite_option(self, condition);
        let new_right = self.rewrite(right);
        let new_left = self.rewrite(left);
        Arc::new(Expression::Join {
            kind: *kind,
            left: new_left,
            right: new_right,
            condition: new_condition,
        })
    }
}

impl Rewriter for UnusedColumnRemover {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Column { alias, name, .. } => {
                self.mark(*alias, name);
                expression.clone()
            }
            Expression::Scalar { select, .. }
            | Expression::In {
                source: InSource::Select(select),
                ..
            } => {
                if let Some(first) = select.columns.first() {
                    self.mark(select.alias, &first.name);
                }
                walk(self, expression)
            }
            Expression::Aggregate {
                function: AggregateFunction::Count,
                argument: None,
                ..
            } => {
                self.retain_all = true;
                expression.clone()
            }
            Expression::Projection {
                select,
                projector,
                aggregator,
                deferred,
            } => {
                let new_projector = self.rewrite(projector);
                let new_select = self.rewrite_select(select);
                Arc::new(Expression::Projection {
                    select: new_select,
                    projector: new_projector,
                    aggregator: *aggregator,
                    deferred: *deferred,
                })
            }
            Expression::ClientJoin {
                outer_key,
                inner_key,
                projection,
            } => {
                let new_inner = rewrite_list(self, inner_key);
                let new_outer = rewrite_list(self, outer_key);
                let new_projection = self.rewrite(projection);
                Arc::new(Expression::ClientJoin {
                    outer_key: new_outer,
                    inner_key: new_inner,
                    projection: new_projection,
                })
            }
            Expression::Join { .. } => self.rewrite_join(expression),
            // declared variables are read by name
            Expression::Declaration { .. } => expression.clone(),
            _ => walk(self, expression),
        }
    }

    fn rewrite_select(&mut self, select: &Arc<Select>) -> Arc<Select> {
        let was_retained = self.retain_all;
        self.retain_all = false;

        let mut columns = vec![];
        for column in &select.columns {
            if was_retained || select.distinct || self.is_used(select.alias, &column.name) {
                columns.push(ColumnDeclaration {
                    expression: self.rewrite(&column.expression),
                    ..column.clone()
                });
            }
        }
        let take = rewrite_option(self, &select.take);
        let skip = rewrite_option(self, &select.skip);
        let group_by = rewrite_list(self, &select.group_by);
        let order_by = select
            .order_by
            .iter()
            .map(|ordering| OrderExpression {
                ordering: ordering.ordering,
                expression: self.rewrite(&ordering.expression),
            })
            .collect();
        let where_ = rewrite_option(self, &select.where_);
        let from = rewrite_option(self, &select.from);

        self.used.remove(&select.alias);
        self.retain_all = was_retained;

        let rebuilt = Select {
            alias: select.alias,
            columns,
            from,
            where_,
            group_by,
            order_by,
            distinct: select.distinct,
            skip,
            take,
        };
        if rebuilt == **select {
            select.clone()
        } else {
            Arc::new(rebuilt)
        }
    }
}

/// A select that only renames the columns of its source, with nothing else applied.
pub fn is_redundant_subquery(select: &Select) -> bool {
    (is_simple_projection(select) || is_name_map_projection(select))
        && !select.distinct
        && select.take.is_none()
        && select.skip.is_none()
        && select.where_.is_none()
        && select.order_by.is_empty()
        && select.group_by.is_empty()
}

fn is_simple_projection(select: &Select) -> bool {
    select.columns.iter().all(|column| {
        matches!(&*column.expression, Expression::Column { name, .. } if *name == column.name)
    })
}

pub fn is_name_map_projection(select: &Select) -> bool {
    let Some(Expression::Select(from)) = select.from.as_deref() else {
        return false;
    };
    select.columns.len() == from.columns.len()
        && select.columns.iter().zip(&from.columns).all(|(column, inner)| {
            matches!(&*column.expression, Expression::Column { name, .. } if *name == inner.name)
        })
}

/// Remove selects that only pass their source through.
pub fn remove_redundant_subqueries(expression: &ExprRef) -> ExprRef {
    RedundantSubqueryRemover.rewrite(expression)
}

struct RedundantSubqueryRemover;

fn gather_redundant(source: &Expression, into: &mut Vec<Arc<Select>>) {
    match source {
        Expression::Select(select) if select.from.is_some() && is_redundant_subquery(select) => {
            into.push(select.clone());
        }
        Expression::Join { left, right, .. } => {
            gather_redundant(left, into);
            gather_redundant(right, into);
        }
        _ => {}
    }
}

impl Rewriter for RedundantSubqueryRemover {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        let expression = walk(self, expression);
        match &*expression {
            Expression::Projection {
                select,
                projector,
                aggregator,
                deferred,
            } if matches!(select.from.as_deref(), Some(Expression::Select(_)))
                && is_redundant_subquery(select) =>
            {
                let Some(Expression::Select(inner)) = select.from.as_deref() else {
                    return expression.clone();
                };
                // the projection reads the inner select through the outer one's columns
                let mut remover = super::aliasing::SubqueryRemover::new([select]);
                let projector = remover.rewrite(projector);
                Arc::new(Expression::Projection {
                    select: inner.clone(),
                    projector,
                    aggregator: *aggregator,
                    deferred: *deferred,
                })
            }
            _ => expression.clone(),
        }
    }

    fn rewrite_select(&mut self, select: &Arc<Select>) -> Arc<Select> {
        let select = walk_select(self, select);
        let mut redundant = vec![];
        if let Some(from) = &select.from {
            gather_redundant(from, &mut redundant);
        }
        if redundant.is_empty() {
            select
        } else {
            remove_subqueries(&select, &redundant)
        }
    }
}

/// Merge a select with the leftmost select of its source where the clauses combine
/// without changing the result.
pub fn merge_subqueries(expression: &ExprRef) -> ExprRef {
    SubqueryMerger { top_level: true }.rewrite(expression)
}

struct SubqueryMerger {
    top_level: bool,
}

fn left_most_select(source: &Expression) -> Option<&Arc<Select>> {
    match source {
        Expression::Select(select) => Some(select),
        Expression::Join { left, .. } => left_most_select(left),
        _ => None,
    }
}

fn is_column_projection(select: &Select) -> bool {
    select.columns.iter().all(|column| {
        matches!(
            &*column.expression,
            Expression::Column { .. } | Expression::Constant { .. }
        )
    })
}

fn can_merge_with_from(select: &Select, top_level: bool) -> bool {
    let Some(from) = select.from.as_deref().and_then(left_most_select) else {
        return false;
    };
    if from.from.is_none() || !is_column_projection(from) {
        return false;
    }
    let has_order_by = !select.order_by.is_empty();
    let has_group_by = !select.group_by.is_empty();
    let has_aggregates = checks::has_aggregates(select);
    let has_join = matches!(select.from.as_deref(), Some(Expression::Join { .. }));
    let from_has_order_by = !from.order_by.is_empty();
    let from_has_group_by = !from.group_by.is_empty();
    let from_limited = from.take.is_some() || from.skip.is_some();

    if has_order_by && from_has_order_by {
        return false;
    }
    if from_has_group_by || checks::has_aggregates(from) {
        return false;
    }
    if from_has_order_by && (has_group_by || has_aggregates || select.distinct) {
        return false;
    }
    // a filter applies after the inner row limit
    if from_limited && select.where_.is_some() {
        return false;
    }
    if from.take.is_some()
        && (select.take.is_some()
            || select.skip.is_some()
            || select.distinct
            || has_aggregates
            || has_group_by
            || has_join)
    {
        return false;
    }
    if from.skip.is_some()
        && (select.skip.is_some() || select.distinct || has_aggregates || has_group_by || has_join)
    {
        return false;
    }
    if from.distinct
        && (select.take.is_some()
            || select.skip.is_some()
            || !is_name_map_projection(select)
            || has_group_by
            || has_aggregates
            || (has_order_by && !top_level)
            || has_join)
    {
        return false;
    }
    true
}

impl Rewriter for SubqueryMerger {
    fn rewrite_select(&mut self, select: &Arc<Select>) -> Arc<Select> {
        let was_top_level = self.top_level;
        self.top_level = false;
        let mut select = walk_select(self, select);

        while can_merge_with_from(&select, was_top_level) {
            let Some(from) = select.from.as_deref().and_then(left_most_select).cloned() else {
                break;
            };
            let removed = remove_subqueries(&select, std::slice::from_ref(&from));
            let where_ = match (&from.where_, &removed.where_) {
                (Some(inner), Some(outer)) => Some(helpers::and(inner.clone(), outer.clone())),
                (Some(inner), None) => Some(inner.clone()),
                (None, outer) => outer.clone(),
            };
            select = Arc::new(Select {
                where_,
                order_by: if removed.order_by.is_empty() {
                    from.order_by.clone()
                } else {
                    removed.order_by.clone()
                },
                group_by: if removed.group_by.is_empty() {
                    from.group_by.clone()
                } else {
                    removed.group_by.clone()
                },
                skip: removed.skip.clone().or_else(|| from.skip.clone()),
                take: removed.take.clone().or_else(|| from.take.clone()),
                distinct: removed.distinct || from.distinct,
                ..(*removed).clone()
            });
        }

        self.top_level = was_top_level;
        select
    }
}
