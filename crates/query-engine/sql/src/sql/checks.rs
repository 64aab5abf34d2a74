//! Void checkers over the IR.

use std::collections::BTreeSet;

use super::ast::*;
use super::visitor::{walk_visit, walk_visit_select, Visitor};

/// Whether a select computes an aggregate, ignoring aggregates of nested subqueries.
pub fn has_aggregates(select: &Select) -> bool {
    struct AggregateChecker {
        found: bool,
    }

    impl Visitor for AggregateChecker {
        fn visit(&mut self, expression: &Expression) {
            match expression {
                Expression::Aggregate { .. } | Expression::AggregateSubquery { .. } => {
                    self.found = true;
                }
                _ if !self.found => walk_visit(self, expression),
                _ => {}
            }
        }

        // subqueries aggregate on their own
        fn visit_select(&mut self, _select: &Select) {}
    }

    let mut checker = AggregateChecker { found: false };
    for column in &select.columns {
        checker.visit(&column.expression);
    }
    if let Some(where_) = &select.where_ {
        checker.visit(where_);
    }
    for ordering in &select.order_by {
        checker.visit(&ordering.expression);
    }
    checker.found
}

/// Every alias read by a column anywhere inside `expression`.
pub fn referenced_aliases(expression: &Expression) -> BTreeSet<TableAlias> {
    let mut gatherer = AliasGatherer::default();
    gatherer.visit(expression);
    gatherer.referenced
}

/// Every alias read by a column anywhere inside `select`.
pub fn referenced_aliases_of_select(select: &Select) -> BTreeSet<TableAlias> {
    let mut gatherer = AliasGatherer::default();
    gatherer.visit_select(select);
    gatherer.referenced
}

/// Every alias declared by a table or select inside `expression`, the node included.
pub fn declared_aliases(expression: &Expression) -> BTreeSet<TableAlias> {
    let mut gatherer = AliasGatherer::default();
    gatherer.visit(expression);
    gatherer.declared
}

/// The aliases a FROM tree makes visible to the select that owns it.
///
/// Unlike `declared_aliases` this does not descend into the selects it names.
pub fn source_aliases(source: &Expression) -> BTreeSet<TableAlias> {
    let mut aliases = BTreeSet::new();
    fn gather(source: &Expression, into: &mut BTreeSet<TableAlias>) {
        match source {
            Expression::Table(table) => {
                into.insert(table.alias);
            }
            Expression::Select(select) => {
                into.insert(select.alias);
            }
            Expression::Join { left, right, .. } => {
                gather(left, into);
                gather(right, into);
            }
            _ => {}
        }
    }
    gather(source, &mut aliases);
    aliases
}

/// Whether `expression` reads a column of any alias outside `allowed`.
pub fn references_outside(expression: &Expression, allowed: &BTreeSet<TableAlias>) -> bool {
    let mut gatherer = AliasGatherer::default();
    gatherer.visit(expression);
    gatherer
        .referenced
        .iter()
        .any(|alias| !allowed.contains(alias) && !gatherer.declared.contains(alias))
}

#[derive(Default)]
struct AliasGatherer {
    referenced: BTreeSet<TableAlias>,
    declared: BTreeSet<TableAlias>,
}

impl Visitor for AliasGatherer {
    fn visit(&mut self, expression: &Expression) {
        match expression {
            Expression::Column { alias, .. } => {
                self.referenced.insert(*alias);
            }
            Expression::Table(table) => {
                self.declared.insert(table.alias);
            }
            // the aggregate is only meaningful inside the grouping select
            Expression::AggregateSubquery { subquery, .. } => self.visit(subquery),
            _ => walk_visit(self, expression),
        }
    }

    fn visit_select(&mut self, select: &Select) {
        self.declared.insert(select.alias);
        walk_visit_select(self, select);
    }
}

/// Whether `expression` contains a node evaluated by the database.
pub fn contains_database_nodes(expression: &Expression) -> bool {
    struct Finder {
        found: bool,
    }

    impl Visitor for Finder {
        fn visit(&mut self, expression: &Expression) {
            if self.found {
                return;
            }
            match expression {
                Expression::Column { .. }
                | Expression::Aggregate { .. }
                | Expression::AggregateSubquery { .. }
                | Expression::Exists(_)
                | Expression::Scalar { .. }
                | Expression::In { .. }
                | Expression::RowNumber { .. }
                | Expression::DbFunction { .. }
                | Expression::Select(_)
                | Expression::Variable { .. } => self.found = true,
                _ => walk_visit(self, expression),
            }
        }

        fn visit_select(&mut self, _select: &Select) {
            self.found = true;
        }
    }

    let mut finder = Finder { found: false };
    finder.visit(expression);
    finder.found
}
