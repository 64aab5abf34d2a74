//! Helpers for building IR in certain shapes and patterns.
//!
//! The host query tree handed to the translator is plain IR built with these
//! functions, e.g. `where_(entity_set("Customer"), lambda("c", |c| ...))`.

use std::sync::Arc;

use query_engine_metadata::metadata::{DbType, EntityId, ScalarType};

use super::ast::*;
use super::types::Type;
use super::value::Value;

// Values //

/// The host type naturally carried by a value.
pub fn type_of_value(value: &Value) -> Type {
    match value {
        Value::Null | Value::Deferred(_) => Type::Any,
        Value::Bool(_) => Type::Scalar(ScalarType::Boolean),
        Value::Int(_) => Type::Scalar(ScalarType::Integer),
        Value::Float(_) => Type::Scalar(ScalarType::Double),
        Value::String(_) => Type::Scalar(ScalarType::String),
        Value::Bytes(_) => Type::Scalar(ScalarType::Binary),
        Value::List(_) => Type::sequence(Type::Any),
        Value::Object(object) => Type::Object(object.type_name.clone()),
    }
}

pub fn constant(value: impl Into<Value>) -> ExprRef {
    let value = value.into();
    let r#type = type_of_value(&value);
    Arc::new(Expression::Constant { value, r#type })
}

pub fn typed_constant(value: Value, r#type: Type) -> ExprRef {
    Arc::new(Expression::Constant { value, r#type })
}

pub fn null() -> ExprRef {
    typed_constant(Value::Null, Type::Any)
}

/// Marks an optional operator argument that was not supplied.
pub fn absent() -> ExprRef {
    typed_constant(Value::Null, Type::Unit)
}

pub fn is_absent(expression: &Expression) -> bool {
    matches!(
        expression,
        Expression::Constant {
            value: Value::Null,
            r#type: Type::Unit
        }
    )
}

pub fn is_null_constant(expression: &Expression) -> bool {
    matches!(
        expression,
        Expression::Constant {
            value: Value::Null,
            ..
        }
    )
}

pub fn true_expr() -> ExprRef {
    constant(true)
}

/// A value supplied when the plan runs.
pub fn argument(name: &str, r#type: Type) -> ExprRef {
    Arc::new(Expression::Argument {
        name: name.to_string(),
        r#type,
    })
}

// Host expressions //

pub fn parameter(name: &str) -> ExprRef {
    Arc::new(Expression::Parameter(ParameterRef {
        name: name.to_string(),
        r#type: Type::Any,
    }))
}

/// A one-parameter lambda; `body` receives the parameter expression.
pub fn lambda(name: &str, body: impl FnOnce(ExprRef) -> ExprRef) -> ExprRef {
    let parameter_ref = ParameterRef {
        name: name.to_string(),
        r#type: Type::Any,
    };
    let body = body(Arc::new(Expression::Parameter(parameter_ref.clone())));
    Arc::new(Expression::Lambda {
        parameters: vec![parameter_ref],
        body,
    })
}

/// A two-parameter lambda.
pub fn lambda2(
    first: &str,
    second: &str,
    body: impl FnOnce(ExprRef, ExprRef) -> ExprRef,
) -> ExprRef {
    let first = ParameterRef {
        name: first.to_string(),
        r#type: Type::Any,
    };
    let second = ParameterRef {
        name: second.to_string(),
        r#type: Type::Any,
    };
    let body = body(
        Arc::new(Expression::Parameter(first.clone())),
        Arc::new(Expression::Parameter(second.clone())),
    );
    Arc::new(Expression::Lambda {
        parameters: vec![first, second],
        body,
    })
}

pub fn member(expression: &ExprRef, name: &str) -> ExprRef {
    Arc::new(Expression::Member {
        expression: expression.clone(),
        member: name.to_string(),
        r#type: Type::Any,
    })
}

pub fn binary(operator: BinaryOperator, left: ExprRef, right: ExprRef) -> ExprRef {
    let r#type = if operator.is_comparison() || operator.is_logical() {
        Type::Scalar(ScalarType::Boolean)
    } else {
        left.r#type()
    };
    Arc::new(Expression::Binary {
        operator,
        left,
        right,
        r#type,
    })
}

pub fn equal(left: ExprRef, right: ExprRef) -> ExprRef {
    binary(BinaryOperator::Equal, left, right)
}

pub fn not_equal(left: ExprRef, right: ExprRef) -> ExprRef {
    binary(BinaryOperator::NotEqual, left, right)
}

pub fn greater_than(left: ExprRef, right: ExprRef) -> ExprRef {
    binary(BinaryOperator::GreaterThan, left, right)
}

pub fn less_than(left: ExprRef, right: ExprRef) -> ExprRef {
    binary(BinaryOperator::LessThan, left, right)
}

pub fn add(left: ExprRef, right: ExprRef) -> ExprRef {
    binary(BinaryOperator::Add, left, right)
}

pub fn and(left: ExprRef, right: ExprRef) -> ExprRef {
    binary(BinaryOperator::And, left, right)
}

pub fn or(left: ExprRef, right: ExprRef) -> ExprRef {
    binary(BinaryOperator::Or, left, right)
}

pub fn not(operand: ExprRef) -> ExprRef {
    Arc::new(Expression::Unary {
        operator: UnaryOperator::Not,
        operand,
        r#type: Type::Scalar(ScalarType::Boolean),
    })
}

pub fn function(function: Function, arguments: Vec<ExprRef>) -> ExprRef {
    let r#type = match function {
        Function::Length | Function::Year | Function::Month | Function::Day => {
            Type::Scalar(ScalarType::Integer)
        }
        Function::StartsWith | Function::EndsWith | Function::Contains => {
            Type::Scalar(ScalarType::Boolean)
        }
        Function::Now => Type::Scalar(ScalarType::DateTime),
        _ => arguments.first().map_or(Type::Any, |first| first.r#type()),
    };
    Arc::new(Expression::Function {
        function,
        arguments,
        r#type,
    })
}

/// An anonymous construction initialising the given members.
pub fn construct(type_name: &str, bindings: Vec<(&str, ExprRef)>) -> ExprRef {
    Arc::new(Expression::Construct {
        type_name: type_name.to_string(),
        constructor: None,
        arguments: vec![],
        bindings: bindings
            .into_iter()
            .map(|(member, expression)| MemberBinding {
                member: member.to_string(),
                expression,
            })
            .collect(),
    })
}

// Query operators //

pub fn entity_set(entity: &str) -> ExprRef {
    Arc::new(Expression::EntitySet {
        entity: EntityId::new(entity),
        r#type: Type::sequence(Type::Object(entity.to_string())),
    })
}

pub fn call(operator: QueryOperator, arguments: Vec<ExprRef>) -> ExprRef {
    Arc::new(Expression::Call {
        operator,
        arguments,
        r#type: Type::Any,
    })
}

pub fn where_(source: ExprRef, predicate: ExprRef) -> ExprRef {
    call(QueryOperator::Where, vec![source, predicate])
}

pub fn select(source: ExprRef, selector: ExprRef) -> ExprRef {
    call(QueryOperator::Select, vec![source, selector])
}

pub fn select_many(source: ExprRef, collection: ExprRef, result: Option<ExprRef>) -> ExprRef {
    call(
        QueryOperator::SelectMany,
        vec![source, collection, result.unwrap_or_else(absent)],
    )
}

pub fn join(
    outer: ExprRef,
    inner: ExprRef,
    outer_key: ExprRef,
    inner_key: ExprRef,
    result: ExprRef,
) -> ExprRef {
    call(
        QueryOperator::Join,
        vec![outer, inner, outer_key, inner_key, result],
    )
}

pub fn group_by(source: ExprRef, key: ExprRef, element: Option<ExprRef>) -> ExprRef {
    call(
        QueryOperator::GroupBy,
        vec![source, key, element.unwrap_or_else(absent)],
    )
}

pub fn order_by(source: ExprRef, key: ExprRef) -> ExprRef {
    call(QueryOperator::OrderBy, vec![source, key])
}

pub fn order_by_descending(source: ExprRef, key: ExprRef) -> ExprRef {
    call(QueryOperator::OrderByDescending, vec![source, key])
}

pub fn then_by(source: ExprRef, key: ExprRef) -> ExprRef {
    call(QueryOperator::ThenBy, vec![source, key])
}

pub fn then_by_descending(source: ExprRef, key: ExprRef) -> ExprRef {
    call(QueryOperator::ThenByDescending, vec![source, key])
}

pub fn take(source: ExprRef, count: ExprRef) -> ExprRef {
    call(QueryOperator::Take, vec![source, count])
}

pub fn skip(source: ExprRef, count: ExprRef) -> ExprRef {
    call(QueryOperator::Skip, vec![source, count])
}

pub fn distinct(source: ExprRef) -> ExprRef {
    call(QueryOperator::Distinct, vec![source])
}

/// `First`, `Single` and their `OrDefault` forms, with an optional predicate.
pub fn element(operator: QueryOperator, source: ExprRef, predicate: Option<ExprRef>) -> ExprRef {
    call(operator, vec![source, predicate.unwrap_or_else(absent)])
}

pub fn any(source: ExprRef, predicate: Option<ExprRef>) -> ExprRef {
    call(
        QueryOperator::Any,
        vec![source, predicate.unwrap_or_else(absent)],
    )
}

pub fn all(source: ExprRef, predicate: ExprRef) -> ExprRef {
    call(QueryOperator::All, vec![source, predicate])
}

pub fn contains(source: ExprRef, value: ExprRef) -> ExprRef {
    call(QueryOperator::Contains, vec![source, value])
}

/// `Count`, `Sum`, `Min`, `Max` or `Average`, with an optional selector
/// (a predicate for `Count`).
pub fn aggregate(operator: QueryOperator, source: ExprRef, argument: Option<ExprRef>) -> ExprRef {
    call(operator, vec![source, argument.unwrap_or_else(absent)])
}

pub fn count(source: ExprRef) -> ExprRef {
    aggregate(QueryOperator::Count, source, None)
}

// Commands //

pub fn insert(set: ExprRef, instance: ExprRef, result: Option<ExprRef>) -> ExprRef {
    call(
        QueryOperator::Insert,
        vec![set, instance, result.unwrap_or_else(absent)],
    )
}

pub fn update(
    set: ExprRef,
    instance: ExprRef,
    check: Option<ExprRef>,
    result: Option<ExprRef>,
) -> ExprRef {
    call(
        QueryOperator::Update,
        vec![
            set,
            instance,
            check.unwrap_or_else(absent),
            result.unwrap_or_else(absent),
        ],
    )
}

pub fn insert_or_update(
    set: ExprRef,
    instance: ExprRef,
    check: Option<ExprRef>,
    result: Option<ExprRef>,
) -> ExprRef {
    call(
        QueryOperator::InsertOrUpdate,
        vec![
            set,
            instance,
            check.unwrap_or_else(absent),
            result.unwrap_or_else(absent),
        ],
    )
}

pub fn delete(set: ExprRef, instance: ExprRef, check: Option<ExprRef>) -> ExprRef {
    call(
        QueryOperator::Delete,
        vec![set, instance, check.unwrap_or_else(absent)],
    )
}

pub fn delete_where(set: ExprRef, predicate: ExprRef) -> ExprRef {
    call(QueryOperator::DeleteWhere, vec![set, predicate])
}

/// Apply `operation`, a lambda over one element, to every element of `items`.
pub fn batch(
    set: ExprRef,
    items: ExprRef,
    operation: ExprRef,
    batch_size: usize,
    stream: bool,
) -> ExprRef {
    call(
        QueryOperator::Batch,
        vec![
            set,
            items,
            operation,
            constant(i64::try_from(batch_size).unwrap_or(i64::MAX)),
            constant(stream),
        ],
    )
}

// Database nodes //

pub fn table(alias: TableAlias, name: &str) -> ExprRef {
    Arc::new(Expression::Table(TableRef {
        alias,
        entity: None,
        name: name.to_string(),
    }))
}

pub fn column(alias: TableAlias, name: &str, r#type: Type) -> ExprRef {
    Arc::new(Expression::Column {
        alias,
        name: name.to_string(),
        r#type,
        query_type: None,
    })
}

pub fn typed_column(alias: TableAlias, name: &str, r#type: Type, query_type: Option<DbType>) -> ExprRef {
    Arc::new(Expression::Column {
        alias,
        name: name.to_string(),
        r#type,
        query_type,
    })
}

pub fn column_declaration(name: &str, expression: ExprRef) -> ColumnDeclaration {
    let query_type = match &*expression {
        Expression::Column { query_type, .. } => query_type.clone(),
        _ => None,
    };
    ColumnDeclaration {
        name: name.to_string(),
        expression,
        query_type,
    }
}

/// A column reading the declaration `declaration` of the select with alias `alias`.
pub fn column_of(alias: TableAlias, declaration: &ColumnDeclaration) -> ExprRef {
    Arc::new(Expression::Column {
        alias,
        name: declaration.name.clone(),
        r#type: declaration.expression.r#type(),
        query_type: declaration.query_type.clone(),
    })
}

pub fn select_expression(select: Select) -> ExprRef {
    Arc::new(Expression::Select(Arc::new(select)))
}

pub fn projection(select: Select, projector: ExprRef, aggregator: Option<Aggregator>) -> ExprRef {
    Arc::new(Expression::Projection {
        select: Arc::new(select),
        projector,
        aggregator,
        deferred: false,
    })
}

/// The conjunction of all predicates, or `None` when there are none.
pub fn and_all(predicates: impl IntoIterator<Item = ExprRef>) -> Option<ExprRef> {
    predicates.into_iter().reduce(and)
}

/// Combine an optional predicate with another.
pub fn and_option(left: Option<ExprRef>, right: Option<ExprRef>) -> Option<ExprRef> {
    match (left, right) {
        (Some(left), Some(right)) => Some(and(left, right)),
        (left, None) => left,
        (None, right) => right,
    }
}

/// Split a predicate into its conjuncts.
pub fn split_and(predicate: &ExprRef) -> Vec<ExprRef> {
    match &**predicate {
        Expression::Binary {
            operator: BinaryOperator::And,
            left,
            right,
            ..
        } => {
            let mut parts = split_and(left);
            parts.extend(split_and(right));
            parts
        }
        _ => vec![predicate.clone()],
    }
}

/// The type of a database primitive such as a generated id.
pub fn db_function(name: &str, arguments: Option<Vec<ExprRef>>, r#type: Type) -> ExprRef {
    Arc::new(Expression::DbFunction {
        name: name.to_string(),
        arguments,
        r#type,
    })
}
