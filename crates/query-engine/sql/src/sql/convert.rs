//! Convert IR to dialect SQL text.
//!
//! Formatting never fails: a node the dialect cannot express is written as an
//! `<<UNSUPPORTED kind>>` placeholder and reported as a diagnostic. Table aliases are
//! named `t0`, `t1`, ... in the order the FROM trees declare them.

use std::collections::{BTreeMap, BTreeSet};

use query_engine_metadata::metadata::{DbType, ScalarType};

use super::ast::*;
use super::diagnostics::Diagnostic;
use super::dialect::{ApplySupport, Dialect, LimitStyle};
use super::string::{QueryCommand, QueryParameter, SQL};
use super::types::Type;
use super::value::Value;

/// The text of one command and what could not be expressed in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedCommand {
    pub command: QueryCommand,
    pub diagnostics: Vec<Diagnostic>,
}

/// Format a statement: a select, a projection's select, or a command.
pub fn format(expression: &Expression, dialect: &dyn Dialect) -> FormattedCommand {
    let mut formatter = Formatter::new(dialect);
    formatter.write_statement(expression);
    FormattedCommand {
        command: formatter.sql.into_command(),
        diagnostics: formatter.diagnostics,
    }
}

struct Formatter<'a> {
    dialect: &'a dyn Dialect,
    sql: SQL,
    names: BTreeMap<TableAlias, String>,
    scopes: Vec<Vec<TableAlias>>,
    /// The table an UPDATE or DELETE modifies; its columns are written without an alias.
    command_table: Option<TableRef>,
    select_depth: usize,
    diagnostics: Vec<Diagnostic>,
    reported: BTreeSet<TableAlias>,
}

impl<'a> Formatter<'a> {
    fn new(dialect: &'a dyn Dialect) -> Self {
        Formatter {
            dialect,
            sql: SQL::new(),
            names: BTreeMap::new(),
            scopes: vec![],
            command_table: None,
            select_depth: 0,
            diagnostics: vec![],
            reported: BTreeSet::new(),
        }
    }

    fn unsupported(&mut self, kind: &str) {
        self.diagnostics.push(Diagnostic::unsupported(kind));
        self.sql.append_syntax(&format!("<<UNSUPPORTED {kind}>>"));
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn quote_table(&self, name: &str) -> String {
        name.split('.')
            .map(|part| self.quote(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn declare(&mut self, alias: TableAlias) -> String {
        let next = self.names.len();
        self.names
            .entry(alias)
            .or_insert_with(|| format!("t{next}"))
            .clone()
    }

    fn alias_name(&mut self, alias: TableAlias) -> String {
        let visible = self.scopes.iter().any(|scope| scope.contains(&alias));
        if !visible && self.reported.insert(alias) {
            self.diagnostics.push(Diagnostic::new(format!(
                "Table alias {} is referenced outside the scope declaring it",
                alias.0
            )));
        }
        self.declare(alias)
    }

    fn push_sources(&mut self, source: Option<&ExprRef>) {
        let mut aliases = vec![];
        if let Some(source) = source {
            collect_sources(source, &mut aliases);
        }
        for alias in &aliases {
            self.declare(*alias);
        }
        self.scopes.push(aliases);
    }

    // statements

    fn write_statement(&mut self, expression: &Expression) {
        match expression {
            Expression::Select(select) | Expression::Projection { select, .. } => {
                self.sql.columns = select.columns.iter().map(|column| column.name.clone()).collect();
                self.write_select(select);
            }
            Expression::Insert { table, assignments } => self.write_insert(table, assignments),
            Expression::Update {
                table,
                where_,
                assignments,
            } => self.write_update(table, where_.as_ref(), assignments),
            Expression::Delete { table, where_ } => self.write_delete(table, where_.as_ref()),
            Expression::Block(commands) => {
                for (index, command) in commands.iter().enumerate() {
                    if index > 0 {
                        self.sql.append_syntax(";");
                        self.sql.new_line();
                    }
                    self.write_statement(command);
                }
            }
            Expression::If {
                check,
                if_true,
                if_false,
            } => self.write_if(check, if_true, if_false.as_ref()),
            Expression::Declaration { variables, source } => {
                self.write_declaration(variables, source.as_deref());
            }
            other => {
                self.sql.append_syntax("SELECT ");
                self.write_value(other);
            }
        }
    }

    fn write_select(&mut self, select: &Select) {
        self.select_depth += 1;
        self.push_sources(select.from.as_ref());

        let limit_style = self.dialect.limit_style();
        self.sql.append_syntax("SELECT ");
        if select.distinct {
            self.sql.append_syntax("DISTINCT ");
        }
        if let (LimitStyle::TopOrOffsetFetch, Some(take), None) =
            (limit_style, &select.take, &select.skip)
        {
            self.sql.append_syntax("TOP (");
            self.write_value(take);
            self.sql.append_syntax(") ");
        }

        if select.columns.is_empty() {
            self.sql.append_syntax("NULL AS ");
            let tmp = self.quote("tmp");
            self.sql.append_identifier(&tmp);
        }
        for (index, column) in select.columns.iter().enumerate() {
            if index > 0 {
                self.sql.append_syntax(", ");
            }
            self.write_column_declaration(column);
        }

        match &select.from {
            Some(from) => {
                self.sql.new_line();
                self.sql.append_syntax("FROM ");
                self.write_source(from);
            }
            None => {
                if let Some(dummy) = self.dialect.dummy_from_clause() {
                    self.sql.new_line();
                    self.sql.append_syntax(dummy);
                }
            }
        }

        if let Some(where_) = &select.where_ {
            self.sql.new_line();
            self.sql.append_syntax("WHERE ");
            self.write_predicate(where_);
        }

        if !select.group_by.is_empty() {
            self.sql.new_line();
            self.sql.append_syntax("GROUP BY ");
            for (index, group) in select.group_by.iter().enumerate() {
                if index > 0 {
                    self.sql.append_syntax(", ");
                }
                self.write_value(group);
            }
        }

        if !select.order_by.is_empty() {
            self.sql.new_line();
            self.sql.append_syntax("ORDER BY ");
            self.write_orderings(&select.order_by);
        }

        match limit_style {
            LimitStyle::LimitOffset {
                offset_requires_limit,
            } => {
                if let Some(take) = &select.take {
                    self.sql.new_line();
                    self.sql.append_syntax("LIMIT ");
                    self.write_value(take);
                }
                if let Some(skip) = &select.skip {
                    if select.take.is_none() && offset_requires_limit {
                        self.sql.new_line();
                        self.sql.append_syntax("LIMIT -1");
                    }
                    self.sql.new_line();
                    self.sql.append_syntax("OFFSET ");
                    self.write_value(skip);
                }
            }
            LimitStyle::TopOrOffsetFetch => {
                if let Some(skip) = &select.skip {
                    if select.order_by.is_empty() {
                        self.sql.new_line();
                        self.sql.append_syntax("ORDER BY (SELECT NULL)");
                    }
                    self.sql.new_line();
                    self.sql.append_syntax("OFFSET ");
                    self.write_value(skip);
                    self.sql.append_syntax(" ROWS");
                    if let Some(take) = &select.take {
                        self.sql.append_syntax(" FETCH NEXT ");
                        self.write_value(take);
                        self.sql.append_syntax(" ROWS ONLY");
                    }
                }
            }
        }

        self.scopes.pop();
        self.select_depth -= 1;
    }

    fn write_orderings(&mut self, order_by: &[OrderExpression]) {
        for (index, ordering) in order_by.iter().enumerate() {
            if index > 0 {
                self.sql.append_syntax(", ");
            }
            self.write_value(&ordering.expression);
            if ordering.ordering == Ordering::Descending {
                self.sql.append_syntax(" DESC");
            }
        }
    }

    fn write_column_declaration(&mut self, column: &ColumnDeclaration) {
        self.write_value(&column.expression);
        let same_name = matches!(
            &*column.expression,
            Expression::Column { name, .. } if *name == column.name
        );
        if !same_name {
            self.sql.append_syntax(" AS ");
            let quoted = self.quote(&column.name);
            self.sql.append_identifier(&quoted);
        }
    }

    fn write_subquery(&mut self, select: &Select) {
        self.sql.append_syntax("(");
        self.sql.indent();
        self.sql.new_line();
        self.write_select(select);
        self.sql.outdent();
        self.sql.new_line();
        self.sql.append_syntax(")");
    }

    fn write_source(&mut self, source: &Expression) {
        match source {
            Expression::Table(table) => {
                let quoted = self.quote_table(&table.name);
                self.sql.append_identifier(&quoted);
                self.sql.append_syntax(" AS ");
                let name = self.declare(table.alias);
                self.sql.append_syntax(&name);
            }
            Expression::Select(select) => {
                self.write_subquery(select);
                self.sql.append_syntax(" AS ");
                let name = self.declare(select.alias);
                self.sql.append_syntax(&name);
            }
            Expression::Join {
                kind,
                left,
                right,
                condition,
            } => self.write_join(*kind, left, right, condition.as_ref()),
            other => self.unsupported(other.kind_name()),
        }
    }

    fn write_join(
        &mut self,
        kind: JoinKind,
        left: &Expression,
        right: &Expression,
        condition: Option<&ExprRef>,
    ) {
        self.write_source(left);
        self.sql.new_line();
        let apply = self.dialect.apply_support();
        // whether an ON clause must follow even without a condition
        let needs_on = match (kind, apply) {
            (JoinKind::Inner | JoinKind::LeftOuter | JoinKind::SingletonLeftOuter, _) => {
                self.sql.append_syntax(if kind == JoinKind::Inner {
                    "INNER JOIN "
                } else {
                    "LEFT OUTER JOIN "
                });
                true
            }
            (JoinKind::Cross, _) => {
                self.sql.append_syntax("CROSS JOIN ");
                false
            }
            (JoinKind::CrossApply, ApplySupport::Native) => {
                self.sql.append_syntax("CROSS APPLY ");
                false
            }
            (JoinKind::OuterApply, ApplySupport::Native) => {
                self.sql.append_syntax("OUTER APPLY ");
                false
            }
            (JoinKind::CrossApply, ApplySupport::Lateral) => {
                self.sql.append_syntax("CROSS JOIN LATERAL ");
                false
            }
            (JoinKind::OuterApply, ApplySupport::Lateral) => {
                self.sql.append_syntax("LEFT OUTER JOIN LATERAL ");
                true
            }
            (JoinKind::CrossApply | JoinKind::OuterApply, ApplySupport::None) => {
                self.unsupported(kind.name());
                self.sql.append_syntax(" ");
                false
            }
        };
        self.write_source(right);
        if needs_on || condition.is_some() {
            self.sql.indent();
            self.sql.new_line();
            self.sql.append_syntax("ON ");
            match condition {
                Some(condition) => self.write_predicate(condition),
                None => self.write_boolean_predicate(true),
            }
            self.sql.outdent();
        }
    }

    // expressions

    fn write_boolean_predicate(&mut self, value: bool) {
        if self.dialect.predicates_are_values() {
            let literal = self.dialect.boolean_literal(value);
            self.sql.append_syntax(literal);
        } else {
            self.sql
                .append_syntax(if value { "(1 = 1)" } else { "(1 = 0)" });
        }
    }

    fn write_predicate(&mut self, expression: &Expression) {
        if expression.is_predicate() {
            self.write_expression(expression);
        } else if let Expression::Constant {
            value: Value::Bool(value),
            ..
        } = expression
        {
            self.write_boolean_predicate(*value);
        } else if self.dialect.predicates_are_values() {
            self.write_expression(expression);
        } else {
            self.sql.append_syntax("(");
            self.write_expression(expression);
            self.sql.append_syntax(" <> 0)");
        }
    }

    fn write_value(&mut self, expression: &Expression) {
        if expression.is_predicate() && !self.dialect.predicates_are_values() {
            self.sql.append_syntax("CASE WHEN ");
            self.write_expression(expression);
            self.sql.append_syntax(" THEN 1 ELSE 0 END");
        } else {
            self.write_expression(expression);
        }
    }

    fn write_list(&mut self, items: &[ExprRef]) {
        for (index, item) in items.iter().enumerate() {
            if index > 0 {
                self.sql.append_syntax(", ");
            }
            self.write_value(item);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn write_expression(&mut self, expression: &Expression) {
        match expression {
            Expression::Constant { value, .. } => self.write_constant(value),
            Expression::Binary {
                operator,
                left,
                right,
                ..
            } => self.write_binary(*operator, left, right),
            Expression::Unary {
                operator,
                operand,
                r#type,
            } => match operator {
                UnaryOperator::Not => {
                    self.sql.append_syntax("NOT ");
                    self.write_predicate(operand);
                }
                UnaryOperator::Negate => {
                    self.sql.append_syntax("-");
                    self.write_value(operand);
                }
                UnaryOperator::Convert => match r#type.scalar() {
                    Some(scalar) => {
                        self.sql.append_syntax("CAST(");
                        self.write_value(operand);
                        self.sql.append_syntax(" AS ");
                        let name = self.dialect.scalar_type_name(scalar);
                        self.sql.append_syntax(name);
                        self.sql.append_syntax(")");
                    }
                    None => self.write_value(operand),
                },
            },
            Expression::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => {
                self.sql.append_syntax("CASE WHEN ");
                self.write_predicate(test);
                self.sql.append_syntax(" THEN ");
                self.write_value(if_true);
                self.sql.append_syntax(" ELSE ");
                self.write_value(if_false);
                self.sql.append_syntax(" END");
            }
            Expression::Function {
                function,
                arguments,
                ..
            } => match self.dialect.function_template(*function, arguments.len()) {
                Some(template) => self.write_template(template, arguments),
                None => self.unsupported(&format!("{function:?}")),
            },
            Expression::Column { alias, name, .. } => self.write_column(*alias, name),
            Expression::Select(select) | Expression::Scalar { select, .. } => {
                self.write_subquery(select);
            }
            Expression::Aggregate {
                function,
                argument,
                distinct,
                ..
            } => {
                self.sql.append_syntax(match function {
                    AggregateFunction::Count => "COUNT(",
                    AggregateFunction::Sum => "SUM(",
                    AggregateFunction::Min => "MIN(",
                    AggregateFunction::Max => "MAX(",
                    AggregateFunction::Average => "AVG(",
                });
                if *distinct {
                    self.sql.append_syntax("DISTINCT ");
                }
                match argument {
                    Some(argument) => self.write_value(argument),
                    None => self.sql.append_syntax("*"),
                }
                self.sql.append_syntax(")");
            }
            Expression::AggregateSubquery { subquery, .. } => self.write_expression(subquery),
            Expression::Exists(select) => {
                self.sql.append_syntax("EXISTS");
                self.write_subquery(select);
            }
            Expression::In { expression, source } => match source {
                InSource::Values(values) if values.is_empty() => {
                    self.write_boolean_predicate(false);
                }
                InSource::Values(values) => {
                    self.sql.append_syntax("(");
                    self.write_value(expression);
                    self.sql.append_syntax(" IN (");
                    self.write_list(values);
                    self.sql.append_syntax("))");
                }
                InSource::Select(select) => {
                    self.sql.append_syntax("(");
                    self.write_value(expression);
                    self.sql.append_syntax(" IN ");
                    self.write_subquery(select);
                    self.sql.append_syntax(")");
                }
            },
            Expression::Between {
                expression,
                lower,
                upper,
            } => {
                self.sql.append_syntax("(");
                self.write_value(expression);
                self.sql.append_syntax(" BETWEEN ");
                self.write_value(lower);
                self.sql.append_syntax(" AND ");
                self.write_value(upper);
                self.sql.append_syntax(")");
            }
            Expression::IsNull(operand) => {
                self.sql.append_syntax("(");
                self.write_value(operand);
                self.sql.append_syntax(" IS NULL)");
            }
            Expression::RowNumber { order_by } => {
                self.sql.append_syntax("ROW_NUMBER() OVER(ORDER BY ");
                if order_by.is_empty() {
                    self.sql.append_syntax("(SELECT 1)");
                } else {
                    self.write_orderings(order_by);
                }
                self.sql.append_syntax(")");
            }
            Expression::DbFunction {
                name, arguments, ..
            } => {
                self.sql.append_syntax(name);
                if let Some(arguments) = arguments {
                    self.sql.append_syntax("(");
                    self.write_list(arguments);
                    self.sql.append_syntax(")");
                }
            }
            Expression::ClientParameter {
                name,
                r#type,
                query_type,
                ..
            } => {
                let ordinal = self.sql.append_param(
                    QueryParameter {
                        name: name.clone(),
                        r#type: r#type.clone(),
                        query_type: query_type.clone(),
                    },
                    self.dialect.requires_parameter_per_occurrence(),
                );
                let marker = self.dialect.parameter_marker(name, ordinal);
                self.sql.append_syntax(&marker);
            }
            Expression::Variable { name, .. } if self.dialect.supports_variables() => {
                let variable = self.dialect.variable_name(name);
                self.sql.append_syntax(&variable);
            }
            Expression::Variable { .. }
            | Expression::Argument { .. }
            | Expression::Parameter(_)
            | Expression::Lambda { .. }
            | Expression::Member { .. }
            | Expression::Construct { .. }
            | Expression::Call { .. }
            | Expression::EntitySet { .. }
            | Expression::Grouping { .. }
            | Expression::Table(_)
            | Expression::Join { .. }
            | Expression::Projection { .. }
            | Expression::ClientJoin { .. }
            | Expression::Entity { .. }
            | Expression::OuterJoined { .. }
            | Expression::Insert { .. }
            | Expression::Update { .. }
            | Expression::Delete { .. }
            | Expression::Block(_)
            | Expression::If { .. }
            | Expression::Declaration { .. }
            | Expression::Batch { .. } => self.unsupported(expression.kind_name()),
        }
    }

    fn write_binary(&mut self, operator: BinaryOperator, left: &Expression, right: &Expression) {
        // comparisons against null are null tests
        if matches!(operator, BinaryOperator::Equal | BinaryOperator::NotEqual) {
            let tested = match (left, right) {
                (_, Expression::Constant { value: Value::Null, .. }) => Some(left),
                (Expression::Constant { value: Value::Null, .. }, _) => Some(right),
                _ => None,
            };
            if let Some(tested) = tested {
                self.sql.append_syntax("(");
                self.write_value(tested);
                self.sql.append_syntax(if operator == BinaryOperator::Equal {
                    " IS NULL)"
                } else {
                    " IS NOT NULL)"
                });
                return;
            }
        }

        if operator == BinaryOperator::Coalesce {
            self.sql.append_syntax("COALESCE(");
            self.write_value(left);
            self.sql.append_syntax(", ");
            self.write_value(right);
            self.sql.append_syntax(")");
            return;
        }

        let is_string = |expression: &Expression| {
            expression.r#type().scalar() == Some(ScalarType::String)
        };
        let symbol = match operator {
            BinaryOperator::Add if is_string(left) || is_string(right) => {
                self.dialect.concat_operator()
            }
            BinaryOperator::Concat => self.dialect.concat_operator(),
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Equal => "=",
            BinaryOperator::NotEqual => "<>",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanOrEqual => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanOrEqual => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
            BinaryOperator::Coalesce => "",
        };

        self.sql.append_syntax("(");
        if operator.is_logical() {
            self.write_predicate(left);
        } else {
            self.write_value(left);
        }
        self.sql.append_syntax(" ");
        self.sql.append_syntax(symbol);
        self.sql.append_syntax(" ");
        if operator.is_logical() {
            self.write_predicate(right);
        } else {
            self.write_value(right);
        }
        self.sql.append_syntax(")");
    }

    fn write_template(&mut self, template: &str, arguments: &[ExprRef]) {
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            self.sql.append_syntax(&rest[..open]);
            let after = &rest[open + 1..];
            let index = after
                .find('}')
                .and_then(|close| after[..close].parse::<usize>().ok().map(|index| (close, index)));
            match index {
                Some((close, index)) => {
                    match arguments.get(index) {
                        Some(argument) => self.write_value(argument),
                        None => self.unsupported("FunctionArgument"),
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    self.sql.append_syntax("{");
                    rest = after;
                }
            }
        }
        self.sql.append_syntax(rest);
    }

    fn write_column(&mut self, alias: TableAlias, name: &str) {
        let quoted = self.quote(name);
        if let Some(table) = &self.command_table {
            if table.alias == alias {
                if self.select_depth > 0 {
                    let table = self.quote_table(&table.name);
                    self.sql.append_identifier(&table);
                    self.sql.append_syntax(".");
                }
                self.sql.append_identifier(&quoted);
                return;
            }
        }
        let alias = self.alias_name(alias);
        self.sql.append_syntax(&alias);
        self.sql.append_syntax(".");
        self.sql.append_identifier(&quoted);
    }

    fn write_constant(&mut self, value: &Value) {
        match value {
            Value::Null => self.sql.append_syntax("NULL"),
            Value::Bool(value) => {
                let literal = self.dialect.boolean_literal(*value);
                self.sql.append_syntax(literal);
            }
            Value::Int(value) => self.sql.append_syntax(&value.to_string()),
            Value::Float(value) if value.is_finite() => {
                self.sql.append_syntax(&format!("{value:?}"));
            }
            Value::String(value) => {
                self.sql
                    .append_syntax(&format!("'{}'", value.replace('\'', "''")));
            }
            Value::Float(_)
            | Value::Bytes(_)
            | Value::List(_)
            | Value::Object(_)
            | Value::Deferred(_) => self.unsupported("Constant"),
        }
    }

    // commands

    fn assignment_column(&mut self, column: &Expression) {
        match column {
            Expression::Column { name, .. } => {
                let quoted = self.quote(name);
                self.sql.append_identifier(&quoted);
            }
            other => self.unsupported(other.kind_name()),
        }
    }

    fn write_insert(&mut self, table: &TableRef, assignments: &[ColumnAssignment]) {
        self.sql.append_syntax("INSERT INTO ");
        let quoted = self.quote_table(&table.name);
        self.sql.append_identifier(&quoted);
        self.scopes.push(vec![]);
        if assignments.is_empty() {
            self.sql.new_line();
            self.sql.append_syntax("DEFAULT VALUES");
        } else {
            self.sql.append_syntax("(");
            for (index, assignment) in assignments.iter().enumerate() {
                if index > 0 {
                    self.sql.append_syntax(", ");
                }
                self.assignment_column(&assignment.column);
            }
            self.sql.append_syntax(")");
            self.sql.new_line();
            self.sql.append_syntax("VALUES (");
            for (index, assignment) in assignments.iter().enumerate() {
                if index > 0 {
                    self.sql.append_syntax(", ");
                }
                self.write_value(&assignment.expression);
            }
            self.sql.append_syntax(")");
        }
        self.scopes.pop();
    }

    fn write_update(
        &mut self,
        table: &TableRef,
        where_: Option<&ExprRef>,
        assignments: &[ColumnAssignment],
    ) {
        let previous = self.command_table.replace(table.clone());
        self.scopes.push(vec![table.alias]);
        self.sql.append_syntax("UPDATE ");
        let quoted = self.quote_table(&table.name);
        self.sql.append_identifier(&quoted);
        self.sql.new_line();
        self.sql.append_syntax("SET ");
        if assignments.is_empty() {
            self.diagnostics.push(Diagnostic::new(format!(
                "Update of table '{}' assigns no columns",
                table.name
            )));
        }
        for (index, assignment) in assignments.iter().enumerate() {
            if index > 0 {
                self.sql.append_syntax(", ");
            }
            self.assignment_column(&assignment.column);
            self.sql.append_syntax(" = ");
            self.write_value(&assignment.expression);
        }
        if let Some(where_) = where_ {
            self.sql.new_line();
            self.sql.append_syntax("WHERE ");
            self.write_predicate(where_);
        }
        self.scopes.pop();
        self.command_table = previous;
    }

    fn write_delete(&mut self, table: &TableRef, where_: Option<&ExprRef>) {
        let previous = self.command_table.replace(table.clone());
        self.scopes.push(vec![table.alias]);
        self.sql.append_syntax("DELETE FROM ");
        let quoted = self.quote_table(&table.name);
        self.sql.append_identifier(&quoted);
        if let Some(where_) = where_ {
            self.sql.new_line();
            self.sql.append_syntax("WHERE ");
            self.write_predicate(where_);
        }
        self.scopes.pop();
        self.command_table = previous;
    }

    fn write_if(&mut self, check: &Expression, if_true: &Expression, if_false: Option<&ExprRef>) {
        if !self.dialect.allows_multiple_commands() {
            self.unsupported("If");
            return;
        }
        self.sql.append_syntax("IF ");
        self.write_predicate(check);
        self.write_begin_end(if_true);
        if let Some(if_false) = if_false {
            self.sql.new_line();
            self.sql.append_syntax("ELSE");
            self.write_begin_end(if_false);
        }
    }

    fn write_begin_end(&mut self, body: &Expression) {
        self.sql.new_line();
        self.sql.append_syntax("BEGIN");
        self.sql.indent();
        self.sql.new_line();
        self.write_statement(body);
        self.sql.outdent();
        self.sql.new_line();
        self.sql.append_syntax("END");
    }

    fn write_declaration(&mut self, variables: &[VariableDeclaration], source: Option<&Select>) {
        if !self.dialect.supports_variables() {
            self.unsupported("Declaration");
            return;
        }
        self.sql.append_syntax("DECLARE ");
        for (index, variable) in variables.iter().enumerate() {
            if index > 0 {
                self.sql.append_syntax(", ");
            }
            let name = self.dialect.variable_name(&variable.name);
            self.sql.append_syntax(&name);
            self.sql.append_syntax(" ");
            let type_name = self.declared_type_name(&variable.r#type, variable.query_type.as_ref());
            self.sql.append_syntax(&type_name);
        }
        self.sql.append_syntax(";");
        self.sql.new_line();

        self.select_depth += 1;
        self.push_sources(source.and_then(|source| source.from.as_ref()));
        self.sql.append_syntax("SELECT ");
        for (index, variable) in variables.iter().enumerate() {
            if index > 0 {
                self.sql.append_syntax(", ");
            }
            let name = self.dialect.variable_name(&variable.name);
            self.sql.append_syntax(&name);
            self.sql.append_syntax(" = ");
            self.write_value(&variable.expression);
        }
        if let Some(source) = source {
            if let Some(from) = &source.from {
                self.sql.new_line();
                self.sql.append_syntax("FROM ");
                self.write_source(from);
            }
            if let Some(where_) = &source.where_ {
                self.sql.new_line();
                self.sql.append_syntax("WHERE ");
                self.write_predicate(where_);
            }
        }
        self.scopes.pop();
        self.select_depth -= 1;
    }

    fn declared_type_name(&self, r#type: &Type, query_type: Option<&DbType>) -> String {
        match (query_type, r#type.scalar()) {
            (Some(query_type), _) => self.dialect.type_name(query_type),
            (None, Some(scalar)) => self.dialect.scalar_type_name(scalar).to_string(),
            (None, None) => "sql_variant".to_string(),
        }
    }
}

/// The aliases a FROM tree declares to its select, left to right.
fn collect_sources(source: &Expression, into: &mut Vec<TableAlias>) {
    match source {
        Expression::Table(table) => into.push(table.alias),
        Expression::Select(select) => into.push(select.alias),
        Expression::Join { left, right, .. } => {
            collect_sources(left, into);
            collect_sources(right, into);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::sql::dialect::{Postgres, SqlServer, Sqlite};
    use crate::sql::helpers::*;

    fn int() -> Type {
        Type::Scalar(ScalarType::Integer)
    }

    fn client_parameter(name: &str, value: ExprRef) -> ExprRef {
        Arc::new(Expression::ClientParameter {
            name: name.to_string(),
            r#type: value.r#type(),
            query_type: None,
            value,
        })
    }

    fn customers_by_city(take: Option<ExprRef>) -> Select {
        let customers = TableAlias(5);
        Select {
            where_: Some(equal(
                column(customers, "City", Type::Scalar(ScalarType::String)),
                client_parameter("p0", constant("London")),
            )),
            take,
            ..Select::new(
                TableAlias(6),
                vec![
                    column_declaration("Id", column(customers, "Id", int())),
                    column_declaration("Name", column(customers, "Name", Type::Any)),
                ],
                Some(table(customers, "Customers")),
            )
        }
    }

    #[test]
    fn selects_are_written_one_clause_per_line() {
        let formatted = format(&Expression::Select(Arc::new(customers_by_city(None))), &Postgres);
        assert_eq!(
            formatted.command.text,
            "SELECT t0.\"Id\", t0.\"Name\"\nFROM \"Customers\" AS t0\nWHERE (t0.\"City\" = $1)"
        );
        assert_eq!(formatted.command.parameters.len(), 1);
        assert!(formatted.diagnostics.is_empty());
    }

    #[test]
    fn row_limits_follow_the_dialect() {
        let select = Expression::Select(Arc::new(customers_by_city(Some(constant(10)))));
        let postgres = format(&select, &Postgres).command.text;
        let sqlserver = format(&select, &SqlServer).command.text;
        assert!(postgres.ends_with("\nLIMIT 10"));
        assert!(sqlserver.starts_with("SELECT TOP (10) t0.[Id], t0.[Name]"));
        assert!(sqlserver.contains("WHERE (t0.[City] = @p0)"));
    }

    #[test]
    fn skipping_without_ordering_gets_a_neutral_order_on_sqlserver() {
        let select = Select {
            skip: Some(constant(20)),
            ..customers_by_city(Some(constant(10)))
        };
        let text = format(&Expression::Select(Arc::new(select)), &SqlServer).command.text;
        assert!(text.ends_with("ORDER BY (SELECT NULL)\nOFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"));
    }

    #[test]
    fn subqueries_are_indented() {
        let customers = TableAlias(7);
        let inner = Select::new(
            TableAlias(8),
            vec![column_declaration("Id", column(customers, "Id", int()))],
            Some(table(customers, "Customers")),
        );
        let outer = Select::new(
            TableAlias(9),
            vec![column_declaration("Id", column(TableAlias(8), "Id", int()))],
            Some(select_expression(inner)),
        );
        let formatted = format(&Expression::Select(Arc::new(outer)), &Postgres);
        assert_eq!(
            formatted.command.text,
            "SELECT t0.\"Id\"\nFROM (\n  SELECT t1.\"Id\"\n  FROM \"Customers\" AS t1\n) AS t0"
        );
    }

    #[test]
    fn join_conditions_sit_on_their_own_line() {
        let (orders, customers) = (TableAlias(0), TableAlias(1));
        let select = Select::new(
            TableAlias(2),
            vec![
                column_declaration("Id", column(orders, "Id", int())),
                column_declaration("Name", column(customers, "Name", Type::Any)),
            ],
            Some(Arc::new(Expression::Join {
                kind: JoinKind::LeftOuter,
                left: table(orders, "Orders"),
                right: table(customers, "Customers"),
                condition: Some(equal(
                    column(customers, "Id", int()),
                    column(orders, "CustomerId", int()),
                )),
            })),
        );
        let formatted = format(&Expression::Select(Arc::new(select)), &Postgres);
        assert_eq!(
            formatted.command.text,
            "SELECT t0.\"Id\", t1.\"Name\"\nFROM \"Orders\" AS t0\nLEFT OUTER JOIN \"Customers\" AS t1\n  ON (t1.\"Id\" = t0.\"CustomerId\")"
        );
    }

    #[test]
    fn unsupported_joins_yield_one_diagnostic_and_a_placeholder() {
        let (customers, orders) = (TableAlias(0), TableAlias(1));
        let inner = Select {
            where_: Some(equal(
                column(orders, "CustomerId", int()),
                column(customers, "Id", int()),
            )),
            take: Some(constant(1)),
            ..Select::new(
                TableAlias(2),
                vec![column_declaration("Total", column(orders, "Total", Type::Any))],
                Some(table(orders, "Orders")),
            )
        };
        let select = Select::new(
            TableAlias(3),
            vec![column_declaration("Total", column(TableAlias(2), "Total", Type::Any))],
            Some(Arc::new(Expression::Join {
                kind: JoinKind::CrossApply,
                left: table(customers, "Customers"),
                right: select_expression(inner),
                condition: None,
            })),
        );
        let expression = Expression::Select(Arc::new(select));

        let sqlite = format(&expression, &Sqlite);
        assert_eq!(sqlite.diagnostics.len(), 1);
        assert!(sqlite.diagnostics[0].message.contains("CrossApply"));
        assert!(sqlite.command.text.contains("<<UNSUPPORTED CrossApply>>"));

        let sqlserver = format(&expression, &SqlServer);
        assert!(sqlserver.diagnostics.is_empty());
        assert!(sqlserver.command.text.contains("\nCROSS APPLY (\n"));
    }

    #[test]
    fn undeclared_aliases_are_reported() {
        let select = Select::new(
            TableAlias(1),
            vec![column_declaration("Id", column(TableAlias(42), "Id", int()))],
            Some(table(TableAlias(0), "Customers")),
        );
        let formatted = format(&Expression::Select(Arc::new(select)), &Postgres);
        assert_eq!(formatted.diagnostics.len(), 1);
    }

    #[test]
    fn repeated_parameters_follow_the_marker_style() {
        let alias = TableAlias(0);
        let p0 = client_parameter("p0", constant("x"));
        let select = Select {
            where_: Some(or(
                equal(column(alias, "A", Type::Any), p0.clone()),
                equal(column(alias, "B", Type::Any), p0),
            )),
            ..Select::new(
                TableAlias(1),
                vec![column_declaration("A", column(alias, "A", Type::Any))],
                Some(table(alias, "T")),
            )
        };
        let expression = Expression::Select(Arc::new(select));

        let postgres = format(&expression, &Postgres).command;
        assert!(postgres.text.ends_with("((t0.\"A\" = $1) OR (t0.\"B\" = $1))"));
        assert_eq!(postgres.parameters.len(), 1);

        let sqlite = format(&expression, &Sqlite).command;
        assert!(sqlite.text.ends_with("((t0.\"A\" = ?) OR (t0.\"B\" = ?))"));
        assert_eq!(sqlite.parameters.len(), 2);
    }

    #[test]
    fn predicates_and_values_are_coerced_on_sqlserver() {
        let alias = TableAlias(0);
        let active = column(alias, "Active", Type::Scalar(ScalarType::Boolean));
        let select = Select {
            where_: Some(active.clone()),
            ..Select::new(
                TableAlias(1),
                vec![column_declaration(
                    "Big",
                    greater_than(column(alias, "Total", int()), constant(100)),
                )],
                Some(table(alias, "Orders")),
            )
        };
        let expression = Expression::Select(Arc::new(select));
        let text = format(&expression, &SqlServer).command.text;
        assert!(text.starts_with("SELECT CASE WHEN (t0.[Total] > 100) THEN 1 ELSE 0 END AS [Big]"));
        assert!(text.ends_with("WHERE (t0.[Active] <> 0)"));
        let text = format(&expression, &Postgres).command.text;
        assert!(text.starts_with("SELECT (t0.\"Total\" > 100) AS \"Big\""));
        assert!(text.ends_with("WHERE t0.\"Active\""));
    }

    #[test]
    fn commands_write_bare_column_names() {
        let orders = TableRef {
            alias: TableAlias(0),
            entity: None,
            name: "Orders".to_string(),
        };
        let update = Expression::Update {
            table: orders.clone(),
            where_: Some(equal(
                column(orders.alias, "Id", int()),
                client_parameter("p1", constant(7)),
            )),
            assignments: vec![ColumnAssignment {
                column: column(orders.alias, "Total", Type::Any),
                expression: client_parameter("p0", constant(1.5)),
            }],
        };
        let formatted = format(&update, &SqlServer);
        assert_eq!(
            formatted.command.text,
            "UPDATE [Orders]\nSET [Total] = @p0\nWHERE ([Id] = @p1)"
        );
        assert!(formatted.diagnostics.is_empty());
    }

    #[test]
    fn generated_keys_are_declared_as_variables() {
        let orders = TableRef {
            alias: TableAlias(0),
            entity: None,
            name: "Orders".to_string(),
        };
        let block = Expression::Block(vec![
            Arc::new(Expression::Insert {
                table: orders.clone(),
                assignments: vec![ColumnAssignment {
                    column: column(orders.alias, "Total", Type::Any),
                    expression: client_parameter("p0", constant(1.5)),
                }],
            }),
            Arc::new(Expression::Declaration {
                variables: vec![VariableDeclaration {
                    name: "Id".to_string(),
                    r#type: int(),
                    query_type: None,
                    expression: SqlServer.generated_id_expression(int()),
                }],
                source: None,
            }),
        ]);
        let formatted = format(&block, &SqlServer);
        assert_eq!(
            formatted.command.text,
            "INSERT INTO [Orders]([Total])\nVALUES (@p0);\nDECLARE @Id int;\nSELECT @Id = SCOPE_IDENTITY()"
        );
        let sqlite = format(&block, &Sqlite);
        assert_eq!(sqlite.diagnostics.len(), 1);
        assert!(sqlite.diagnostics[0].message.contains("Declaration"));
    }

    #[test]
    fn formatting_is_deterministic() {
        let select = Expression::Select(Arc::new(customers_by_city(Some(constant(3)))));
        assert_eq!(format(&select, &Postgres), format(&select, &Postgres));
    }
}
