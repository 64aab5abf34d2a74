//! Evaluation of host expressions: folding constants during translation and
//! computing parameter values when a plan runs.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;

use query_engine_metadata::metadata::ScalarType;

use super::ast::*;
use super::types::Type;
use super::value::{Object, Value};
use super::visitor::{walk_visit, Visitor};

/// Values supplied for the `Argument` nodes of a plan, by name.
pub type Arguments = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("No value was supplied for argument '{0}'")]
    MissingArgument(String),
    #[error("Parameter '{0}' is not bound")]
    UnboundParameter(String),
    #[error("Value has no member '{0}'")]
    MemberNotFound(String),
    #[error("'{0}' cannot be evaluated on the client")]
    NotEvaluable(&'static str),
    #[error("Invalid operands for {operator}: {left} and {right}")]
    InvalidOperands {
        operator: String,
        left: String,
        right: String,
    },
    #[error("Arithmetic overflow in {0}")]
    Overflow(String),
    #[error("Division by zero")]
    DivisionByZero,
}

/// Argument values plus the lambda parameters bound so far.
#[derive(Debug, Clone)]
pub struct Bindings<'a> {
    arguments: &'a Arguments,
    parameters: Vec<(String, Value)>,
}

impl<'a> Bindings<'a> {
    pub fn new(arguments: &'a Arguments) -> Self {
        Bindings {
            arguments,
            parameters: vec![],
        }
    }

    /// These bindings plus `name` bound to `value`, shadowing earlier bindings.
    pub fn with(&self, name: &str, value: Value) -> Self {
        let mut parameters = self.parameters.clone();
        parameters.push((name.to_string(), value));
        Bindings {
            arguments: self.arguments,
            parameters,
        }
    }

    pub fn arguments(&self) -> &'a Arguments {
        self.arguments
    }

    pub fn evaluate(&self, expression: &Expression) -> Result<Value, EvaluationError> {
        match expression {
            Expression::Constant { value, .. } => Ok(value.clone()),
            Expression::Argument { name, .. } => self
                .arguments
                .get(name)
                .cloned()
                .ok_or_else(|| EvaluationError::MissingArgument(name.clone())),
            Expression::Parameter(parameter) => self
                .parameters
                .iter()
                .rev()
                .find(|(name, _)| *name == parameter.name)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| EvaluationError::UnboundParameter(parameter.name.clone())),
            Expression::ClientParameter { value, .. } => self.evaluate(value),
            Expression::Member {
                expression, member, ..
            } => {
                let value = self.evaluate(expression)?;
                match value {
                    // navigation through a missing object yields nothing
                    Value::Null => Ok(Value::Null),
                    Value::Object(object) => object
                        .fields
                        .get(member)
                        .cloned()
                        .ok_or_else(|| EvaluationError::MemberNotFound(member.clone())),
                    _ => Err(EvaluationError::MemberNotFound(member.clone())),
                }
            }
            Expression::Binary {
                operator,
                left,
                right,
                ..
            } => {
                let left = self.evaluate(left)?;
                // short-circuit the logical operators
                match (operator, left.as_bool()) {
                    (BinaryOperator::And, Some(false)) => return Ok(Value::Bool(false)),
                    (BinaryOperator::Or, Some(true)) => return Ok(Value::Bool(true)),
                    _ => {}
                }
                let right = self.evaluate(right)?;
                apply_binary(*operator, &left, &right)
            }
            Expression::Unary {
                operator,
                operand,
                r#type,
            } => apply_unary(*operator, &self.evaluate(operand)?, r#type),
            Expression::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => {
                if self.evaluate(test)?.as_bool().unwrap_or(false) {
                    self.evaluate(if_true)
                } else {
                    self.evaluate(if_false)
                }
            }
            Expression::Construct {
                type_name,
                arguments,
                bindings,
                ..
            } => {
                let mut object = Object::new(type_name.clone());
                for binding in arguments.iter().chain(bindings) {
                    object
                        .fields
                        .insert(binding.member.clone(), self.evaluate(&binding.expression)?);
                }
                Ok(Value::Object(object))
            }
            Expression::Function {
                function,
                arguments,
                ..
            } => {
                let values = arguments
                    .iter()
                    .map(|argument| self.evaluate(argument))
                    .collect::<Result<Vec<_>, _>>()?;
                apply_function(*function, &values)
            }
            Expression::Entity { expression, .. } => self.evaluate(expression),
            other => Err(EvaluationError::NotEvaluable(other.kind_name())),
        }
    }
}

/// Whether `expression` can be computed on the client from arguments and bound parameters.
pub fn is_host_evaluable(expression: &Expression) -> bool {
    struct Checker {
        evaluable: bool,
    }

    impl Visitor for Checker {
        fn visit(&mut self, expression: &Expression) {
            if !self.evaluable {
                return;
            }
            match expression {
                Expression::Constant { .. }
                | Expression::Argument { .. }
                | Expression::Parameter(_)
                | Expression::ClientParameter { .. }
                | Expression::Member { .. }
                | Expression::Binary { .. }
                | Expression::Unary { .. }
                | Expression::Conditional { .. }
                | Expression::Construct { .. }
                | Expression::Entity { .. } => walk_visit(self, expression),
                Expression::Function { function, .. } if *function != Function::Now => {
                    walk_visit(self, expression);
                }
                _ => self.evaluable = false,
            }
        }

        fn visit_select(&mut self, _select: &Select) {
            self.evaluable = false;
        }
    }

    let mut checker = Checker { evaluable: true };
    checker.visit(expression);
    checker.evaluable
}

/// Whether `expression` reads a plan argument or a lambda parameter.
pub fn depends_on_inputs(expression: &Expression) -> bool {
    struct Finder {
        found: bool,
    }

    impl Visitor for Finder {
        fn visit(&mut self, expression: &Expression) {
            match expression {
                Expression::Argument { .. } | Expression::Parameter(_) => self.found = true,
                _ if !self.found => walk_visit(self, expression),
                _ => {}
            }
        }
    }

    let mut finder = Finder { found: false };
    finder.visit(expression);
    finder.found
}

fn invalid(operator: impl std::fmt::Debug, left: &Value, right: &Value) -> EvaluationError {
    EvaluationError::InvalidOperands {
        operator: format!("{operator:?}"),
        left: format!("{left:?}"),
        right: format!("{right:?}"),
    }
}

/// Compare two values the way the host does: numbers across kinds, nulls equal to nulls.
pub fn compare(left: &Value, right: &Value) -> Option<CmpOrdering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(CmpOrdering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => {
                if left == right {
                    Some(CmpOrdering::Equal)
                } else {
                    None
                }
            }
        },
    }
}

pub fn apply_binary(
    operator: BinaryOperator,
    left: &Value,
    right: &Value,
) -> Result<Value, EvaluationError> {
    let arithmetic = |ints: fn(i64, i64) -> Option<i64>, floats: fn(f64, f64) -> f64| {
        match (left, right) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (Value::Int(a), Value::Int(b)) => ints(*a, *b)
                .map(Value::Int)
                .ok_or_else(|| EvaluationError::Overflow(format!("{operator:?}"))),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(floats(a, b))),
                _ => Err(invalid(operator, left, right)),
            },
        }
    };

    match operator {
        BinaryOperator::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => arithmetic(i64::checked_add, |a, b| a + b),
        },
        BinaryOperator::Subtract => arithmetic(i64::checked_sub, |a, b| a - b),
        BinaryOperator::Multiply => arithmetic(i64::checked_mul, |a, b| a * b),
        BinaryOperator::Divide | BinaryOperator::Modulo => {
            if matches!(right, Value::Int(0)) {
                return Err(EvaluationError::DivisionByZero);
            }
            if operator == BinaryOperator::Divide {
                arithmetic(i64::checked_div, |a, b| a / b)
            } else {
                arithmetic(i64::checked_rem, |a, b| a % b)
            }
        }
        BinaryOperator::Equal => Ok(Value::Bool(compare(left, right) == Some(CmpOrdering::Equal))),
        BinaryOperator::NotEqual => {
            Ok(Value::Bool(compare(left, right) != Some(CmpOrdering::Equal)))
        }
        BinaryOperator::LessThan => Ok(Value::Bool(compare(left, right) == Some(CmpOrdering::Less))),
        BinaryOperator::LessThanOrEqual => Ok(Value::Bool(matches!(
            compare(left, right),
            Some(CmpOrdering::Less | CmpOrdering::Equal)
        ))),
        BinaryOperator::GreaterThan => {
            Ok(Value::Bool(compare(left, right) == Some(CmpOrdering::Greater)))
        }
        BinaryOperator::GreaterThanOrEqual => Ok(Value::Bool(matches!(
            compare(left, right),
            Some(CmpOrdering::Greater | CmpOrdering::Equal)
        ))),
        BinaryOperator::And | BinaryOperator::Or => match (left.as_bool(), right.as_bool()) {
            (Some(a), Some(b)) => Ok(Value::Bool(if operator == BinaryOperator::And {
                a && b
            } else {
                a || b
            })),
            _ => Err(invalid(operator, left, right)),
        },
        BinaryOperator::Coalesce => Ok(if left.is_null() {
            right.clone()
        } else {
            left.clone()
        }),
        BinaryOperator::Concat => match (left, right) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => Err(invalid(operator, left, right)),
        },
    }
}

#[allow(clippy::cast_possible_truncation)]
pub fn apply_unary(
    operator: UnaryOperator,
    operand: &Value,
    r#type: &Type,
) -> Result<Value, EvaluationError> {
    match (operator, operand) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOperator::Not, value) => value
            .as_bool()
            .map(|b| Value::Bool(!b))
            .ok_or_else(|| invalid(operator, value, &Value::Null)),
        (UnaryOperator::Negate, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| EvaluationError::Overflow("Negate".to_string())),
        (UnaryOperator::Negate, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOperator::Negate, value) => Err(invalid(operator, value, &Value::Null)),
        (UnaryOperator::Convert, value) => Ok(match (r#type.scalar(), value) {
            (Some(ScalarType::SmallInt | ScalarType::Integer | ScalarType::BigInt), Value::Float(f)) => {
                Value::Int(f.trunc() as i64)
            }
            (Some(ScalarType::Decimal | ScalarType::Double), value) => {
                value.as_f64().map_or_else(|| value.clone(), Value::Float)
            }
            (Some(ScalarType::Boolean), Value::Int(i)) => Value::Bool(*i != 0),
            (Some(ScalarType::String), Value::Int(i)) => Value::String(i.to_string()),
            (Some(ScalarType::String), Value::Float(f)) => Value::String(f.to_string()),
            (_, value) => value.clone(),
        }),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn apply_function(function: Function, arguments: &[Value]) -> Result<Value, EvaluationError> {
    if arguments.first().is_some_and(Value::is_null) {
        return Ok(Value::Null);
    }
    let text = |index: usize| arguments.get(index).and_then(Value::as_str);
    let wrong = || EvaluationError::InvalidOperands {
        operator: format!("{function:?}"),
        left: format!("{:?}", arguments.first()),
        right: format!("{:?}", arguments.get(1)),
    };
    // date parts are read from an ISO-8601 text value
    let date_part = |range: std::ops::Range<usize>| {
        text(0)
            .and_then(|date| date.get(range))
            .and_then(|part| part.parse::<i64>().ok())
            .map(Value::Int)
            .ok_or_else(wrong)
    };

    match function {
        Function::Upper => text(0).map(|s| Value::String(s.to_uppercase())).ok_or_else(wrong),
        Function::Lower => text(0).map(|s| Value::String(s.to_lowercase())).ok_or_else(wrong),
        Function::Trim => text(0).map(|s| Value::String(s.trim().to_string())).ok_or_else(wrong),
        Function::Length => text(0)
            .map(|s| Value::Int(s.chars().count() as i64))
            .ok_or_else(wrong),
        Function::Substring => {
            let s = text(0).ok_or_else(wrong)?;
            let start = arguments.get(1).and_then(Value::as_i64).ok_or_else(wrong)?;
            let start = usize::try_from(start).map_err(|_| wrong())?;
            let chars = s.chars().skip(start);
            Ok(Value::String(match arguments.get(2).and_then(Value::as_i64) {
                Some(length) => chars.take(usize::try_from(length).map_err(|_| wrong())?).collect(),
                None => chars.collect(),
            }))
        }
        Function::StartsWith | Function::EndsWith | Function::Contains => {
            let (Some(s), Some(pattern)) = (text(0), text(1)) else {
                return Err(wrong());
            };
            Ok(Value::Bool(match function {
                Function::StartsWith => s.starts_with(pattern),
                Function::EndsWith => s.ends_with(pattern),
                _ => s.contains(pattern),
            }))
        }
        Function::Replace => match (text(0), text(1), text(2)) {
            (Some(s), Some(from), Some(to)) => Ok(Value::String(s.replace(from, to))),
            _ => Err(wrong()),
        },
        Function::Abs => match arguments.first() {
            Some(Value::Int(i)) => Ok(Value::Int(i.abs())),
            Some(Value::Float(f)) => Ok(Value::Float(f.abs())),
            _ => Err(wrong()),
        },
        Function::Round | Function::Floor | Function::Ceiling => match arguments.first() {
            Some(Value::Int(i)) => Ok(Value::Int(*i)),
            Some(Value::Float(f)) => Ok(Value::Float(match function {
                Function::Round => f.round(),
                Function::Floor => f.floor(),
                _ => f.ceil(),
            })),
            _ => Err(wrong()),
        },
        Function::Year => date_part(0..4),
        Function::Month => date_part(5..7),
        Function::Day => date_part(8..10),
        Function::Now => Err(EvaluationError::NotEvaluable("Now")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::helpers::*;

    #[test]
    fn arguments_and_parameters_are_looked_up_by_name() {
        let arguments = Arguments::from([("limit".to_string(), Value::Int(10))]);
        let bindings = Bindings::new(&arguments).with("x", Value::Int(5));
        let expression = add(
            argument("limit", Type::Scalar(ScalarType::Integer)),
            parameter("x"),
        );
        assert_eq!(bindings.evaluate(&expression), Ok(Value::Int(15)));
        assert_eq!(
            Bindings::new(&arguments).evaluate(&expression),
            Err(EvaluationError::UnboundParameter("x".to_string()))
        );
    }

    #[test]
    fn members_of_missing_objects_are_null() {
        let arguments = Arguments::new();
        let bindings = Bindings::new(&arguments).with("o", Value::Null);
        assert_eq!(
            bindings.evaluate(&member(&parameter("o"), "Id")),
            Ok(Value::Null)
        );
    }

    #[test]
    fn numbers_compare_across_kinds() {
        assert_eq!(
            apply_binary(BinaryOperator::LessThan, &Value::Int(1), &Value::Float(1.5)),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            apply_binary(BinaryOperator::Equal, &Value::Null, &Value::Null),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            apply_binary(BinaryOperator::Divide, &Value::Int(1), &Value::Int(0)),
            Err(EvaluationError::DivisionByZero)
        );
    }

    #[test]
    fn server_nodes_are_not_host_evaluable() {
        assert!(is_host_evaluable(&equal(constant(1), argument("a", Type::Any))));
        assert!(!is_host_evaluable(&column(
            TableAlias(0),
            "Id",
            Type::Any
        )));
        assert!(!is_host_evaluable(&function(Function::Now, vec![])));
        assert!(depends_on_inputs(&member(&parameter("c"), "Id")));
        assert!(!depends_on_inputs(&constant(1)));
    }

    #[test]
    fn string_functions_follow_host_semantics() {
        assert_eq!(
            apply_function(
                Function::Substring,
                &[Value::from("relational"), Value::Int(3), Value::Int(3)]
            ),
            Ok(Value::from("ati"))
        );
        assert_eq!(
            apply_function(Function::Year, &[Value::from("2024-05-06T00:00:00")]),
            Ok(Value::Int(2024))
        );
    }
}
