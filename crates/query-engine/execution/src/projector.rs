//! Compiled projectors: how one result value is built from the current row and the
//! rows of the queries enclosing it.

use std::sync::Arc;

use query_engine_metadata::metadata::ScalarType;
use query_engine_sql::sql::ast::{Aggregator, BinaryOperator, ExprRef, Function, UnaryOperator};
use query_engine_sql::sql::evaluate::{apply_binary, apply_function, apply_unary};
use query_engine_sql::sql::types::Type;
use query_engine_sql::sql::value::{Object, Value};

use crate::error::Error;
use crate::execution::{aggregate, ExecutionContext};
use crate::executor::{BoxError, RowReader};
use crate::plan::QueryStep;

/// The typed getter used for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Read {
    Bool,
    Int,
    Float,
    String,
    Value,
}

impl Read {
    pub(crate) fn of(r#type: &Type) -> Read {
        match r#type.scalar() {
            Some(ScalarType::Boolean) => Read::Bool,
            Some(ScalarType::SmallInt | ScalarType::Integer | ScalarType::BigInt) => Read::Int,
            Some(ScalarType::Decimal | ScalarType::Double) => Read::Float,
            Some(ScalarType::String) => Read::String,
            _ => Read::Value,
        }
    }
}

/// Read the fields of the current row, nulls included.
pub(crate) fn read_row(row: &dyn RowReader, reads: &[Read]) -> Result<Vec<Value>, BoxError> {
    let found = row.field_count();
    if found < reads.len() {
        return Err(Error::FieldCount {
            expected: reads.len(),
            found,
        }
        .into());
    }
    reads
        .iter()
        .enumerate()
        .map(|(ordinal, read)| {
            if row.is_null(ordinal)? {
                return Ok(Value::Null);
            }
            Ok(match read {
                Read::Bool => Value::Bool(row.get_bool(ordinal)?),
                Read::Int => Value::Int(row.get_i64(ordinal)?),
                Read::Float => Value::Float(row.get_f64(ordinal)?),
                Read::String => Value::String(row.get_string(ordinal)?),
                Read::Value => row.get_value(ordinal)?,
            })
        })
        .collect()
}

/// The field at `ordinal` of the row `depth` levels out from the innermost one.
pub(crate) fn field(rows: &[&[Value]], depth: usize, ordinal: usize) -> Result<Value, Error> {
    let row = rows
        .len()
        .checked_sub(depth + 1)
        .and_then(|index| rows.get(index))
        .copied()
        .unwrap_or_default();
    row.get(ordinal).cloned().ok_or(Error::FieldCount {
        expected: ordinal + 1,
        found: row.len(),
    })
}

#[derive(Debug)]
pub(crate) enum Projector {
    /// A field of the current or an enclosing row. A null read for a non-optional
    /// scalar takes the given default.
    Column {
        depth: usize,
        ordinal: usize,
        default: Option<Value>,
    },
    /// A value computed from arguments and bound parameters alone.
    Host(ExprRef),
    Construct {
        type_name: String,
        members: Vec<(String, Projector)>,
    },
    List(Vec<Projector>),
    Binary {
        operator: BinaryOperator,
        left: Box<Projector>,
        right: Box<Projector>,
    },
    Unary {
        operator: UnaryOperator,
        operand: Box<Projector>,
        r#type: Type,
    },
    Conditional {
        test: Box<Projector>,
        if_true: Box<Projector>,
        if_false: Box<Projector>,
    },
    Function {
        function: Function,
        arguments: Vec<Projector>,
    },
    /// `expression`, or `default` when `test` reads null.
    OuterJoined {
        test: Box<Projector>,
        expression: Box<Projector>,
        default: Value,
    },
    /// A query run once per row, with the enclosing rows as parameters.
    Nested(Arc<QueryStep>),
    /// A nested query whose rows are read when the result is enumerated.
    Deferred(Arc<QueryStep>),
    /// The group of a client-joined lookup matching `keys`.
    Lookup {
        slot: usize,
        keys: Vec<Projector>,
        aggregator: Option<Aggregator>,
        default: Value,
    },
}

impl Projector {
    pub(crate) fn evaluate(&self, context: &ExecutionContext<'_>, rows: &[&[Value]]) -> Result<Value, Error> {
        match self {
            Projector::Column {
                depth,
                ordinal,
                default,
            } => {
                let value = field(rows, *depth, *ordinal)?;
                match (value, default) {
                    (Value::Null, Some(default)) => Ok(default.clone()),
                    (value, _) => Ok(value),
                }
            }
            Projector::Host(expression) => context.evaluate(expression),
            Projector::Construct { type_name, members } => {
                let mut object = Object::new(type_name.clone());
                for (name, member) in members {
                    object
                        .fields
                        .insert(name.clone(), member.evaluate(context, rows)?);
                }
                Ok(Value::Object(object))
            }
            Projector::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| item.evaluate(context, rows))
                    .collect::<Result<_, _>>()?,
            )),
            Projector::Binary {
                operator,
                left,
                right,
            } => {
                let left = left.evaluate(context, rows)?;
                let right = right.evaluate(context, rows)?;
                Ok(apply_binary(*operator, &left, &right)?)
            }
            Projector::Unary {
                operator,
                operand,
                r#type,
            } => Ok(apply_unary(*operator, &operand.evaluate(context, rows)?, r#type)?),
            Projector::Conditional {
                test,
                if_true,
                if_false,
            } => {
                if test.evaluate(context, rows)?.as_bool().unwrap_or(false) {
                    if_true.evaluate(context, rows)
                } else {
                    if_false.evaluate(context, rows)
                }
            }
            Projector::Function {
                function,
                arguments,
            } => {
                let values = arguments
                    .iter()
                    .map(|argument| argument.evaluate(context, rows))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(apply_function(*function, &values)?)
            }
            Projector::OuterJoined {
                test,
                expression,
                default,
            } => {
                if test.evaluate(context, rows)?.is_null() {
                    Ok(default.clone())
                } else {
                    expression.evaluate(context, rows)
                }
            }
            Projector::Nested(step) => context.run_query(step, rows),
            Projector::Deferred(step) => context.run_deferred(step, rows),
            Projector::Lookup {
                slot,
                keys,
                aggregator,
                default,
            } => {
                let key = keys
                    .iter()
                    .map(|key| key.evaluate(context, rows))
                    .collect::<Result<Vec<_>, _>>()?;
                aggregate(context.lookup(*slot, &key), *aggregator, default)
            }
        }
    }

    /// The queries this projector runs, in evaluation order.
    pub(crate) fn collect_queries<'p>(&'p self, into: &mut Vec<&'p QueryStep>) {
        match self {
            Projector::Column { .. } | Projector::Host(_) | Projector::Lookup { .. } => {}
            Projector::Construct { members, .. } => {
                for (_, member) in members {
                    member.collect_queries(into);
                }
            }
            Projector::List(items)
            | Projector::Function {
                arguments: items, ..
            } => {
                for item in items {
                    item.collect_queries(into);
                }
            }
            Projector::Binary { left, right, .. } => {
                left.collect_queries(into);
                right.collect_queries(into);
            }
            Projector::Unary { operand, .. } => operand.collect_queries(into),
            Projector::Conditional {
                test,
                if_true,
                if_false,
            } => {
                test.collect_queries(into);
                if_true.collect_queries(into);
                if_false.collect_queries(into);
            }
            Projector::OuterJoined {
                test, expression, ..
            } => {
                test.collect_queries(into);
                expression.collect_queries(into);
            }
            Projector::Nested(step) | Projector::Deferred(step) => step.collect_queries(into),
        }
    }
}
