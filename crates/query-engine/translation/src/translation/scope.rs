//! Alias soundness: every column must read an alias declared by exactly one
//! enclosing source.

use std::collections::BTreeSet;

use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::diagnostics::Diagnostic;
use query_engine_sql::sql::visitor::{walk_visit, Visitor};

/// Report every column reading an alias that no enclosing source declares, and
/// every alias declared again inside its own scope.
pub fn check_aliases(expression: &Expression) -> Vec<Diagnostic> {
    let mut checker = ScopeChecker {
        scopes: vec![],
        diagnostics: vec![],
    };
    checker.visit(expression);
    checker.diagnostics
}

struct ScopeChecker {
    scopes: Vec<BTreeSet<TableAlias>>,
    diagnostics: Vec<Diagnostic>,
}

impl ScopeChecker {
    fn in_scope(&self, alias: TableAlias) -> bool {
        self.scopes.iter().any(|scope| scope.contains(&alias))
    }

    fn declare(&mut self, alias: TableAlias, declared: &mut BTreeSet<TableAlias>) {
        if self.in_scope(alias) || !declared.insert(alias) {
            self.diagnostics.push(Diagnostic::new(format!(
                "The alias {alias:?} is declared more than once in the same scope"
            )));
        }
    }

    fn scoped(&mut self, aliases: BTreeSet<TableAlias>, body: impl FnOnce(&mut Self)) {
        self.scopes.push(aliases);
        body(self);
        self.scopes.pop();
    }

    /// Check a FROM tree and return the aliases it declares.
    fn visit_source(&mut self, source: &Expression) -> BTreeSet<TableAlias> {
        let mut declared = BTreeSet::new();
        match source {
            Expression::Table(table) => self.declare(table.alias, &mut declared),
            Expression::Select(select) => {
                self.visit_select(select);
                self.declare(select.alias, &mut declared);
            }
            Expression::Join {
                kind,
                left,
                right,
                condition,
            } => {
                let left_aliases = self.visit_source(left);
                let right_aliases = if kind.is_apply() {
                    self.scopes.push(left_aliases.clone());
                    let right_aliases = self.visit_source(right);
                    self.scopes.pop();
                    right_aliases
                } else {
                    self.visit_source(right)
                };
                for alias in left_aliases.into_iter().chain(right_aliases) {
                    self.declare(alias, &mut declared);
                }
                if let Some(condition) = condition {
                    self.scoped(declared.clone(), |this| this.visit(condition));
                }
            }
            other => self.visit(other),
        }
        declared
    }
}

impl Visitor for ScopeChecker {
    fn visit(&mut self, expression: &Expression) {
        match expression {
            Expression::Column { alias, name, .. } if !self.in_scope(*alias) => {
                self.diagnostics.push(Diagnostic::new(format!(
                    "The column '{name}' reads the undeclared alias {alias:?}"
                )));
            }
            Expression::Select(select) | Expression::Exists(select) => self.visit_select(select),
            Expression::Scalar { select, .. } => self.visit_select(select),
            Expression::Projection {
                select, projector, ..
            } => {
                self.visit_select(select);
                self.scoped(BTreeSet::from([select.alias]), |this| this.visit(projector));
            }
            Expression::ClientJoin {
                outer_key,
                inner_key,
                projection,
            } => {
                for key in outer_key {
                    self.visit(key);
                }
                self.visit(projection);
                if let Expression::Projection { select, .. } = &**projection {
                    self.scoped(BTreeSet::from([select.alias]), |this| {
                        for key in inner_key {
                            this.visit(key);
                        }
                    });
                }
            }
            Expression::Insert { table, .. }
            | Expression::Update { table, .. }
            | Expression::Delete { table, .. } => {
                self.scoped(BTreeSet::from([table.alias]), |this| walk_visit(this, expression));
            }
            Expression::Declaration { variables, source } => {
                let declared = match source {
                    Some(source) => {
                        self.visit_select(source);
                        BTreeSet::from([source.alias])
                    }
                    None => BTreeSet::new(),
                };
                self.scoped(declared, |this| {
                    for variable in variables {
                        this.visit(&variable.expression);
                    }
                });
            }
            // the aggregate is read through the grouping select
            Expression::AggregateSubquery { subquery, .. } => self.visit(subquery),
            _ => walk_visit(self, expression),
        }
    }

    fn visit_select(&mut self, select: &Select) {
        let declared = match &select.from {
            Some(from) => self.visit_source(from),
            None => BTreeSet::new(),
        };
        self.scoped(declared, |this| {
            for column in &select.columns {
                this.visit(&column.expression);
            }
            for expression in select
                .where_
                .iter()
                .chain(&select.group_by)
                .chain(select.order_by.iter().map(|ordering| &ordering.expression))
                .chain(&select.skip)
                .chain(&select.take)
            {
                this.visit(expression);
            }
        });
    }
}
