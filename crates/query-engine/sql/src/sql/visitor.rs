//! Traversal of the IR.
//!
//! `Rewriter` is the value-returning flavour: `walk` rebuilds a node only when one
//! of its children changed and otherwise hands back the input `Arc`, so a pass that
//! changes nothing allocates nothing. `Visitor` is the void flavour used by checkers.
//! Both dispatch through exhaustive matches over every node kind.

use std::sync::Arc;

use super::ast::*;

/// A value-returning rewrite over the IR.
pub trait Rewriter {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        walk(self, expression)
    }

    fn rewrite_select(&mut self, select: &Arc<Select>) -> Arc<Select> {
        walk_select(self, select)
    }
}

fn same(a: &ExprRef, b: &ExprRef) -> bool {
    Arc::ptr_eq(a, b)
}

fn same_option(a: &Option<ExprRef>, b: &Option<ExprRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn same_list(a: &[ExprRef], b: &[ExprRef]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| Arc::ptr_eq(a, b))
}

pub fn rewrite_option<R: Rewriter + ?Sized>(
    rewriter: &mut R,
    expression: &Option<ExprRef>,
) -> Option<ExprRef> {
    expression.as_ref().map(|expression| rewriter.rewrite(expression))
}

pub fn rewrite_list<R: Rewriter + ?Sized>(rewriter: &mut R, items: &[ExprRef]) -> Vec<ExprRef> {
    items.iter().map(|item| rewriter.rewrite(item)).collect()
}

fn rewrite_bindings<R: Rewriter + ?Sized>(
    rewriter: &mut R,
    bindings: &[MemberBinding],
) -> (Vec<MemberBinding>, bool) {
    let mut changed = false;
    let rewritten = bindings
        .iter()
        .map(|binding| {
            let expression = rewriter.rewrite(&binding.expression);
            changed |= !same(&expression, &binding.expression);
            MemberBinding {
                member: binding.member.clone(),
                expression,
            }
        })
        .collect();
    (rewritten, changed)
}

fn rewrite_orderings<R: Rewriter + ?Sized>(
    rewriter: &mut R,
    orderings: &[OrderExpression],
) -> (Vec<OrderExpression>, bool) {
    let mut changed = false;
    let rewritten = orderings
        .iter()
        .map(|ordering| {
            let expression = rewriter.rewrite(&ordering.expression);
            changed |= !same(&expression, &ordering.expression);
            OrderExpression {
                ordering: ordering.ordering,
                expression,
            }
        })
        .collect();
    (rewritten, changed)
}

fn rewrite_assignments<R: Rewriter + ?Sized>(
    rewriter: &mut R,
    assignments: &[ColumnAssignment],
) -> (Vec<ColumnAssignment>, bool) {
    let mut changed = false;
    let rewritten = assignments
        .iter()
        .map(|assignment| {
            let column = rewriter.rewrite(&assignment.column);
            let expression = rewriter.rewrite(&assignment.expression);
            changed |= !same(&column, &assignment.column) || !same(&expression, &assignment.expression);
            ColumnAssignment { column, expression }
        })
        .collect();
    (rewritten, changed)
}

/// Rebuild a select from rewritten children, keeping the input when nothing changed.
pub fn walk_select<R: Rewriter + ?Sized>(rewriter: &mut R, select: &Arc<Select>) -> Arc<Select> {
    let mut changed = false;
    let columns: Vec<ColumnDeclaration> = select
        .columns
        .iter()
        .map(|column| {
            let expression = rewriter.rewrite(&column.expression);
            changed |= !same(&expression, &column.expression);
            ColumnDeclaration {
                name: column.name.clone(),
                expression,
                query_type: column.query_type.clone(),
            }
        })
        .collect();
    let from = rewrite_option(rewriter, &select.from);
    let where_ = rewrite_option(rewriter, &select.where_);
    let group_by = rewrite_list(rewriter, &select.group_by);
    let (order_by, order_changed) = rewrite_orderings(rewriter, &select.order_by);
    let skip = rewrite_option(rewriter, &select.skip);
    let take = rewrite_option(rewriter, &select.take);

    changed |= order_changed
        || !same_option(&from, &select.from)
        || !same_option(&where_, &select.where_)
        || !same_list(&group_by, &select.group_by)
        || !same_option(&skip, &select.skip)
        || !same_option(&take, &select.take);

    if changed {
        Arc::new(Select {
            alias: select.alias,
            columns,
            from,
            where_,
            group_by,
            order_by,
            distinct: select.distinct,
            skip,
            take,
        })
    } else {
        select.clone()
    }
}

/// Rebuild a node from rewritten children, keeping the input when nothing changed.
pub fn walk<R: Rewriter + ?Sized>(rewriter: &mut R, expression: &ExprRef) -> ExprRef {
    match &**expression {
        Expression::Constant { .. }
        | Expression::Argument { .. }
        | Expression::Parameter(_)
        | Expression::EntitySet { .. }
        | Expression::Table(_)
        | Expression::Column { .. }
        | Expression::Variable { .. } => expression.clone(),

        Expression::Lambda { parameters, body } => {
            let new_body = rewriter.rewrite(body);
            if same(body, &new_body) {
                expression.clone()
            } else {
                Arc::new(Expression::Lambda {
                    parameters: parameters.clone(),
                    body: new_body,
                })
            }
        }
        Expression::Member {
            expression: inner,
            member,
            r#type,
        } => {
            let new_inner = rewriter.rewrite(inner);
            if same(inner, &new_inner) {
                expression.clone()
            } else {
                Arc::new(Expression::Member {
                    expression: new_inner,
                    member: member.clone(),
                    r#type: r#type.clone(),
                })
            }
        }
        Expression::Binary {
            operator,
            left,
            right,
            r#type,
        } => {
            let new_left = rewriter.rewrite(left);
            let new_right = rewriter.rewrite(right);
            if same(left, &new_left) && same(right, &new_right) {
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
        Expression::Unary {
            operator,
            operand,
            r#type,
        } => {
            let new_operand = rewriter.rewrite(operand);
            if same(operand, &new_operand) {
                expression.clone()
            } else {
                Arc::new(Expression::Unary {
                    operator: *operator,
                    operand: new_operand,
                    r#type: r#type.clone(),
                })
            }
        }
        Expression::Conditional {
            test,
            if_true,
            if_false,
            r#type,
        } => {
            let new_test = rewriter.rewrite(test);
            let new_true = rewriter.rewrite(if_true);
            let new_false = rewriter.rewrite(if_false);
            if same(test, &new_test) && same(if_true, &new_true) && same(if_false, &new_false) {
                expression.clone()
            } else {
                Arc::new(Expression::Conditional {
                    test: new_test,
                    if_true: new_true,
                    if_false: new_false,
                    r#type: r#type.clone(),
                })
            }
        }
        Expression::Construct {
            type_name,
            constructor,
            arguments,
            bindings,
        } => {
            let (new_arguments, arguments_changed) = rewrite_bindings(rewriter, arguments);
            let (new_bindings, bindings_changed) = rewrite_bindings(rewriter, bindings);
            if arguments_changed || bindings_changed {
                Arc::new(Expression::Construct {
                    type_name: type_name.clone(),
                    constructor: *constructor,
                    arguments: new_arguments,
                    bindings: new_bindings,
                })
            } else {
                expression.clone()
            }
        }
        Expression::Call {
            operator,
            arguments,
            r#type,
        } => {
            let new_arguments = rewrite_list(rewriter, arguments);
            if same_list(arguments, &new_arguments) {
                expression.clone()
            } else {
                Arc::new(Expression::Call {
                    operator: *operator,
                    arguments: new_arguments,
                    r#type: r#type.clone(),
                })
            }
        }
        Expression::Function {
            function,
            arguments,
            r#type,
        } => {
            let new_arguments = rewrite_list(rewriter, arguments);
            if same_list(arguments, &new_arguments) {
                expression.clone()
            } else {
                Arc::new(Expression::Function {
                    function: *function,
                    arguments: new_arguments,
                    r#type: r#type.clone(),
                })
            }
        }
        Expression::Grouping { key, group, r#type } => {
            let new_key = rewriter.rewrite(key);
            let new_group = rewriter.rewrite(group);
            if same(key, &new_key) && same(group, &new_group) {
                expression.clone()
            } else {
                Arc::new(Expression::Grouping {
                    key: new_key,
                    group: new_group,
                    r#type: r#type.clone(),
                })
            }
        }
        Expression::Select(select) => {
            let new_select = rewriter.rewrite_select(select);
            if Arc::ptr_eq(select, &new_select) {
                expression.clone()
            } else {
                Arc::new(Expression::Select(new_select))
            }
        }
        Expression::Join {
            kind,
            left,
            right,
            condition,
        } => {
            let new_left = rewriter.rewrite(left);
            let new_right = rewriter.rewrite(right);
            let new_condition = rewrite_option(rewriter, condition);
            if same(left, &new_left) && same(right, &new_right) && same_option(condition, &new_condition)
            {
                expression.clone()
            } else {
                Arc::new(Expression::Join {
                    kind: *kind,
                    left: new_left,
                    right: new_right,
                    condition: new_condition,
                })
            }
        }
        Expression::Aggregate {
            function,
            argument,
            distinct,
            r#type,
        } => {
            let new_argument = rewrite_option(rewriter, argument);
            if same_option(argument, &new_argument) {
                expression.clone()
            } else {
                Arc::new(Expression::Aggregate {
                    function: *function,
                    argument: new_argument,
                    distinct: *distinct,
                    r#type: r#type.clone(),
                })
            }
        }
        Expression::AggregateSubquery {
            group_by_alias,
            aggregate,
            subquery,
        } => {
            let new_subquery = rewriter.rewrite(subquery);
            if same(subquery, &new_subquery) {
                expression.clone()
            } else {
                Arc::new(Expression::AggregateSubquery {
                    group_by_alias: *group_by_alias,
                    aggregate: aggregate.clone(),
                    subquery: new_subquery,
                })
            }
        }
        Expression::Exists(select) => {
            let new_select = rewriter.rewrite_select(select);
            if Arc::ptr_eq(select, &new_select) {
                expression.clone()
            } else {
                Arc::new(Expression::Exists(new_select))
            }
        }
        Expression::In {
            expression: operand,
            source,
        } => {
            let new_operand = rewriter.rewrite(operand);
            let (new_source, source_changed) = match source {
                InSource::Select(select) => {
                    let new_select = rewriter.rewrite_select(select);
                    let changed = !Arc::ptr_eq(select, &new_select);
                    (InSource::Select(new_select), changed)
                }
                InSource::Values(values) => {
                    let new_values = rewrite_list(rewriter, values);
                    let changed = !same_list(values, &new_values);
                    (InSource::Values(new_values), changed)
                }
            };
            if same(operand, &new_operand) && !source_changed {
                expression.clone()
            } else {
                Arc::new(Expression::In {
                    expression: new_operand,
                    source: new_source,
                })
            }
        }
        Expression::Scalar { select, r#type } => {
            let new_select = rewriter.rewrite_select(select);
            if Arc::ptr_eq(select, &new_select) {
                expression.clone()
            } else {
                Arc::new(Expression::Scalar {
                    select: new_select,
                    r#type: r#type.clone(),
                })
            }
        }
        Expression::Between {
            expression: operand,
            lower,
            upper,
        } => {
            let new_operand = rewriter.rewrite(operand);
            let new_lower = rewriter.rewrite(lower);
            let new_upper = rewriter.rewrite(upper);
            if same(operand, &new_operand) && same(lower, &new_lower) && same(upper, &new_upper) {
                expression.clone()
            } else {
                Arc::new(Expression::Between {
                    expression: new_operand,
                    lower: new_lower,
                    upper: new_upper,
                })
            }
        }
        Expression::IsNull(operand) => {
            let new_operand = rewriter.rewrite(operand);
            if same(operand, &new_operand) {
                expression.clone()
            } else {
                Arc::new(Expression::IsNull(new_operand))
            }
        }
        Expression::RowNumber { order_by } => {
            let (new_order_by, changed) = rewrite_orderings(rewriter, order_by);
            if changed {
                Arc::new(Expression::RowNumber {
                    order_by: new_order_by,
                })
            } else {
                expression.clone()
            }
        }
        Expression::DbFunction {
            name,
            arguments,
            r#type,
        } => match arguments {
            None => expression.clone(),
            Some(arguments) => {
                let new_arguments = rewrite_list(rewriter, arguments);
                if same_list(arguments, &new_arguments) {
                    expression.clone()
                } else {
                    Arc::new(Expression::DbFunction {
                        name: name.clone(),
                        arguments: Some(new_arguments),
                        r#type: r#type.clone(),
                    })
                }
            }
        },
        Expression::Projection {
            select,
            projector,
            aggregator,
            deferred,
        } => {
            let new_select = rewriter.rewrite_select(select);
            let new_projector = rewriter.rewrite(projector);
            if Arc::ptr_eq(select, &new_select) && same(projector, &new_projector) {
                expression.clone()
            } else {
                Arc::new(Expression::Projection {
                    select: new_select,
                    projector: new_projector,
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
            let new_outer = rewrite_list(rewriter, outer_key);
            let new_inner = rewrite_list(rewriter, inner_key);
            let new_projection = rewriter.rewrite(projection);
            if same_list(outer_key, &new_outer)
                && same_list(inner_key, &new_inner)
                && same(projection, &new_projection)
            {
                expression.clone()
            } else {
                Arc::new(Expression::ClientJoin {
                    outer_key: new_outer,
                    inner_key: new_inner,
                    projection: new_projection,
                })
            }
        }
        Expression::Entity {
            entity,
            expression: inner,
        } => {
            let new_inner = rewriter.rewrite(inner);
            if same(inner, &new_inner) {
                expression.clone()
            } else {
                Arc::new(Expression::Entity {
                    entity: entity.clone(),
                    expression: new_inner,
                })
            }
        }
        Expression::OuterJoined {
            test,
            expression: inner,
        } => {
            let new_test = rewriter.rewrite(test);
            let new_inner = rewriter.rewrite(inner);
            if same(test, &new_test) && same(inner, &new_inner) {
                expression.clone()
            } else {
                Arc::new(Expression::OuterJoined {
                    test: new_test,
                    expression: new_inner,
                })
            }
        }
        Expression::ClientParameter {
            name,
            r#type,
            query_type,
            value,
        } => {
            let new_value = rewriter.rewrite(value);
            if same(value, &new_value) {
                expression.clone()
            } else {
                Arc::new(Expression::ClientParameter {
                    name: name.clone(),
                    r#type: r#type.clone(),
                    query_type: query_type.clone(),
                    value: new_value,
                })
            }
        }
        Expression::Insert { table, assignments } => {
            let (new_assignments, changed) = rewrite_assignments(rewriter, assignments);
            if changed {
                Arc::new(Expression::Insert {
                    table: table.clone(),
                    assignments: new_assignments,
                })
            } else {
                expression.clone()
            }
        }
        Expression::Update {
            table,
            where_,
            assignments,
        } => {
            let new_where = rewrite_option(rewriter, where_);
            let (new_assignments, changed) = rewrite_assignments(rewriter, assignments);
            if changed || !same_option(where_, &new_where) {
                Arc::new(Expression::Update {
                    table: table.clone(),
                    where_: new_where,
                    assignments: new_assignments,
                })
            } else {
                expression.clone()
            }
        }
        Expression::Delete { table, where_ } => {
            let new_where = rewrite_option(rewriter, where_);
            if same_option(where_, &new_where) {
                expression.clone()
            } else {
                Arc::new(Expression::Delete {
                    table: table.clone(),
                    where_: new_where,
                })
            }
        }
        Expression::Block(commands) => {
            let new_commands = rewrite_list(rewriter, commands);
            if same_list(commands, &new_commands) {
                expression.clone()
            } else {
                Arc::new(Expression::Block(new_commands))
            }
        }
        Expression::If {
            check,
            if_true,
            if_false,
        } => {
            let new_check = rewriter.rewrite(check);
            let new_true = rewriter.rewrite(if_true);
            let new_false = rewrite_option(rewriter, if_false);
            if same(check, &new_check) && same(if_true, &new_true) && same_option(if_false, &new_false)
            {
                expression.clone()
            } else {
                Arc::new(Expression::If {
                    check: new_check,
                    if_true: new_true,
                    if_false: new_false,
                })
            }
        }
        Expression::Declaration { variables, source } => {
            let new_source = source.as_ref().map(|select| rewriter.rewrite_select(select));
            let mut changed = match (source, &new_source) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                _ => false,
            };
            let new_variables: Vec<VariableDeclaration> = variables
                .iter()
                .map(|variable| {
                    let new_expression = rewriter.rewrite(&variable.expression);
                    changed |= !same(&variable.expression, &new_expression);
                    VariableDeclaration {
                        expression: new_expression,
                        ..variable.clone()
                    }
                })
                .collect();
            if changed {
                Arc::new(Expression::Declaration {
                    variables: new_variables,
                    source: new_source,
                })
            } else {
                expression.clone()
            }
        }
        Expression::Batch {
            input,
            operation,
            batch_size,
            stream,
        } => {
            let new_input = rewriter.rewrite(input);
            let new_operation = rewriter.rewrite(operation);
            if same(input, &new_input) && same(operation, &new_operation) {
                expression.clone()
            } else {
                Arc::new(Expression::Batch {
                    input: new_input,
                    operation: new_operation,
                    batch_size: *batch_size,
                    stream: *stream,
                })
            }
        }
    }
}

/// A child of a node, as seen by a `Visitor`.
pub enum Child<'a> {
    Expression(&'a ExprRef),
    Select(&'a Arc<Select>),
}

/// The children of a node in visiting order.
pub fn children(expression: &Expression) -> Vec<Child<'_>> {
    let mut exprs: Vec<&ExprRef> = vec![];
    match expression {
        Expression::Constant { .. }
        | Expression::Argument { .. }
        | Expression::Parameter(_)
        | Expression::EntitySet { .. }
        | Expression::Table(_)
        | Expression::Column { .. }
        | Expression::Variable { .. } => {}
        Expression::Lambda { body, .. } => exprs.push(body),
        Expression::Member { expression, .. } => exprs.push(expression),
        Expression::Binary { left, right, .. } => {
            exprs.push(left);
            exprs.push(right);
        }
        Expression::Unary { operand, .. } | Expression::IsNull(operand) => exprs.push(operand),
        Expression::Conditional {
            test,
            if_true,
            if_false,
            ..
        } => {
            exprs.push(test);
            exprs.push(if_true);
            exprs.push(if_false);
        }
        Expression::Construct {
            arguments,
            bindings,
            ..
        } => {
            for binding in arguments.iter().chain(bindings) {
                exprs.push(&binding.expression);
            }
        }
        Expression::Call { arguments, .. } | Expression::Function { arguments, .. } => {
            exprs.extend(arguments.iter());
        }
        Expression::Grouping { key, group, .. } => {
            exprs.push(key);
            exprs.push(group);
        }
        Expression::Join {
            left,
            right,
            condition,
            ..
        } => {
            exprs.push(left);
            exprs.push(right);
            if let Some(condition) = condition {
                exprs.push(condition);
            }
        }
        Expression::Aggregate { argument, .. } => {
            if let Some(argument) = argument {
                exprs.push(argument);
            }
        }
        Expression::AggregateSubquery { subquery, .. } => exprs.push(subquery),
        Expression::Between {
            expression,
            lower,
            upper,
        } => {
            exprs.push(expression);
            exprs.push(lower);
            exprs.push(upper);
        }
        Expression::RowNumber { order_by } => {
            for ordering in order_by {
                exprs.push(&ordering.expression);
            }
        }
        Expression::DbFunction { arguments, .. } => {
            if let Some(arguments) = arguments {
                exprs.extend(arguments.iter());
            }
        }
        Expression::ClientJoin {
            outer_key,
            inner_key,
            projection,
        } => {
            exprs.extend(outer_key.iter().chain(inner_key));
            exprs.push(projection);
        }
        Expression::Entity { expression, .. } => exprs.push(expression),
        Expression::OuterJoined { test, expression } => {
            exprs.push(test);
            exprs.push(expression);
        }
        Expression::ClientParameter { value, .. } => exprs.push(value),
        Expression::Insert { assignments, .. } => {
            for assignment in assignments {
                exprs.push(&assignment.column);
                exprs.push(&assignment.expression);
            }
        }
        Expression::Update {
            where_,
            assignments,
            ..
        } => {
            if let Some(where_) = where_ {
                exprs.push(where_);
            }
            for assignment in assignments {
                exprs.push(&assignment.column);
                exprs.push(&assignment.expression);
            }
        }
        Expression::Delete { where_, .. } => {
            if let Some(where_) = where_ {
                exprs.push(where_);
            }
        }
        Expression::Block(commands) => exprs.extend(commands.iter()),
        Expression::If {
            check,
            if_true,
            if_false,
        } => {
            exprs.push(check);
            exprs.push(if_true);
            if let Some(if_false) = if_false {
                exprs.push(if_false);
            }
        }
        Expression::Declaration { .. } => {}
        Expression::Batch {
            input, operation, ..
        } => {
            exprs.push(input);
            exprs.push(operation);
        }
        Expression::Select(_)
        | Expression::Exists(_)
        | Expression::Scalar { .. }
        | Expression::In { .. }
        | Expression::Projection { .. } => {}
    }
    let mut children: Vec<Child<'_>> = exprs.into_iter().map(Child::Expression).collect();
    // nodes mixing selects and expressions are appended in order
    match expression {
        Expression::Select(select) | Expression::Exists(select) | Expression::Scalar { select, .. } => {
            children.push(Child::Select(select));
        }
        Expression::In { expression, source } => {
            children.push(Child::Expression(expression));
            match source {
                InSource::Select(select) => children.push(Child::Select(select)),
                InSource::Values(values) => {
                    children.extend(values.iter().map(Child::Expression));
                }
            }
        }
        Expression::Projection {
            select, projector, ..
        } => {
            children.push(Child::Select(select));
            children.push(Child::Expression(projector));
        }
        Expression::Declaration { variables, source } => {
            if let Some(source) = source {
                children.push(Child::Select(source));
            }
            children.extend(variables.iter().map(|variable| Child::Expression(&variable.expression)));
        }
        _ => {}
    }
    children
}

/// A void traversal over the IR.
pub trait Visitor {
    fn visit(&mut self, expression: &Expression) {
        walk_visit(self, expression);
    }

    fn visit_select(&mut self, select: &Select) {
        walk_visit_select(self, select);
    }
}

pub fn walk_visit<V: Visitor + ?Sized>(visitor: &mut V, expression: &Expression) {
    for child in children(expression) {
        match child {
            Child::Expression(child) => visitor.visit(child),
            Child::Select(select) => visitor.visit_select(select),
        }
    }
}

pub fn walk_visit_select<V: Visitor + ?Sized>(visitor: &mut V, select: &Select) {
    for column in &select.columns {
        visitor.visit(&column.expression);
    }
    if let Some(from) = &select.from {
        visitor.visit(from);
    }
    if let Some(where_) = &select.where_ {
        visitor.visit(where_);
    }
    for group in &select.group_by {
        visitor.visit(group);
    }
    for ordering in &select.order_by {
        visitor.visit(&ordering.expression);
    }
    if let Some(skip) = &select.skip {
        visitor.visit(skip);
    }
    if let Some(take) = &select.take {
        visitor.visit(take);
    }
}
