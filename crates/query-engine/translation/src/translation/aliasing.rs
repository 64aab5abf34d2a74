//! Rewrites that move column references between aliases.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::checks;
use query_engine_sql::sql::visitor::{walk, walk_select, Rewriter};

use super::helpers::State;

/// Re-point columns of any of `old_aliases` at `new_alias`, keeping their names.
pub struct ColumnMapper {
    new_alias: TableAlias,
    old_aliases: BTreeSet<TableAlias>,
}

impl ColumnMapper {
    pub fn new(new_alias: TableAlias, old_aliases: impl IntoIterator<Item = TableAlias>) -> Self {
        ColumnMapper {
            new_alias,
            old_aliases: old_aliases.into_iter().collect(),
        }
    }
}

impl Rewriter for ColumnMapper {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Column {
                alias,
                name,
                r#type,
                query_type,
            } if self.old_aliases.contains(alias) => Arc::new(Expression::Column {
                alias: self.new_alias,
                name: name.clone(),
                r#type: r#type.clone(),
                query_type: query_type.clone(),
            }),
            _ => walk(self, expression),
        }
    }
}

pub fn map_columns(expression: &ExprRef, new_alias: TableAlias, old_alias: TableAlias) -> ExprRef {
    ColumnMapper::new(new_alias, [old_alias]).rewrite(expression)
}

pub fn map_select_columns(
    select: &Arc<Select>,
    new_alias: TableAlias,
    old_alias: TableAlias,
) -> Arc<Select> {
    ColumnMapper::new(new_alias, [old_alias]).rewrite_select(select)
}

/// Copy a select, giving every table and select it declares a fresh alias.
pub fn duplicate(select: &Arc<Select>, state: &mut State) -> Arc<Select> {
    let mut declared = checks::declared_aliases(&Expression::Select(select.clone()));
    declared.insert(select.alias);
    let renames = declared
        .into_iter()
        .map(|alias| (alias, state.next_alias()))
        .collect();
    QueryDuplicator { renames }.rewrite_select(select)
}

struct QueryDuplicator {
    renames: BTreeMap<TableAlias, TableAlias>,
}

impl QueryDuplicator {
    fn renamed(&self, alias: TableAlias) -> TableAlias {
        self.renames.get(&alias).copied().unwrap_or(alias)
    }
}

impl Rewriter for QueryDuplicator {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Table(table) => Arc::new(Expression::Table(TableRef {
                alias: self.renamed(table.alias),
                ..table.clone()
            })),
            Expression::Column {
                alias,
                name,
                r#type,
                query_type,
            } => Arc::new(Expression::Column {
                alias: self.renamed(*alias),
                name: name.clone(),
                r#type: r#type.clone(),
                query_type: query_type.clone(),
            }),
            Expression::AggregateSubquery {
                group_by_alias,
                aggregate,
                subquery,
            } => Arc::new(Expression::AggregateSubquery {
                group_by_alias: self.renamed(*group_by_alias),
                aggregate: self.rewrite(aggregate),
                subquery: self.rewrite(subquery),
            }),
            _ => walk(self, expression),
        }
    }

    fn rewrite_select(&mut self, select: &Arc<Select>) -> Arc<Select> {
        let walked = walk_select(self, select);
        Arc::new(Select {
            alias: self.renamed(select.alias),
            ..(*walked).clone()
        })
    }
}

/// Splice selects out of the tree: each removed select is replaced by its FROM
/// source and reads of its columns by the expressions they declare.
pub struct SubqueryRemover {
    removed: BTreeMap<TableAlias, Arc<Select>>,
}

impl SubqueryRemover {
    pub fn new<'s>(subqueries: impl IntoIterator<Item = &'s Arc<Select>>) -> Self {
        SubqueryRemover {
            removed: subqueries
                .into_iter()
                .filter(|select| select.from.is_some())
                .map(|select| (select.alias, select.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

impl Rewriter for SubqueryRemover {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Select(select) => match self.removed.get(&select.alias).cloned() {
                Some(removed) => match &removed.from {
                    Some(from) => self.rewrite(from),
                    None => expression.clone(),
                },
                None => walk(self, expression),
            },
            Expression::Column { alias, name, .. } => {
                match self
                    .removed
                    .get(alias)
                    .and_then(|removed| removed.column(name))
                    .map(|column| column.expression.clone())
                {
                    Some(declared) => self.rewrite(&declared),
                    None => expression.clone(),
                }
            }
            _ => walk(self, expression),
        }
    }
}

/// Remove `subqueries` from the FROM tree of `select`.
pub fn remove_subqueries(select: &Arc<Select>, subqueries: &[Arc<Select>]) -> Arc<Select> {
    let mut remover = SubqueryRemover::new(subqueries);
    if remover.is_empty() {
        return select.clone();
    }
    remover.rewrite_select(select)
}
