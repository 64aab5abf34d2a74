//! Host-side types carried by IR nodes.

use std::fmt;

use query_engine_metadata::metadata::{DbType, ScalarType};

use super::value::Value;

/// The host type of an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Scalar(ScalarType),
    /// A value that may be absent.
    Optional(Box<Type>),
    /// An object of the named type.
    Object(String),
    Sequence(Box<Type>),
    Grouping { key: Box<Type>, element: Box<Type> },
    Unit,
    Any,
}

impl Type {
    pub fn optional(inner: Type) -> Type {
        match inner {
            Type::Optional(_) | Type::Object(_) | Type::Sequence(_) | Type::Any => inner,
            other => Type::Optional(Box::new(other)),
        }
    }

    pub fn sequence(element: Type) -> Type {
        Type::Sequence(Box::new(element))
    }

    /// The host type of a column with the given database type.
    pub fn of_column(db_type: &DbType) -> Type {
        if db_type.not_null {
            Type::Scalar(db_type.scalar)
        } else {
            Type::optional(Type::Scalar(db_type.scalar))
        }
    }

    pub fn scalar(&self) -> Option<ScalarType> {
        match self {
            Type::Scalar(scalar) => Some(*scalar),
            Type::Optional(inner) => inner.scalar(),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.scalar().is_some_and(ScalarType::is_numeric)
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, Type::Sequence(_))
    }

    pub fn element_type(&self) -> Type {
        match self {
            Type::Sequence(element) => (**element).clone(),
            Type::Grouping { element, .. } => (**element).clone(),
            _ => Type::Any,
        }
    }

    /// The value an absent instance of this type takes, e.g. for a missing outer-joined row.
    pub fn default_value(&self) -> Value {
        match self {
            Type::Scalar(ScalarType::Boolean) => Value::Bool(false),
            Type::Scalar(
                ScalarType::SmallInt | ScalarType::Integer | ScalarType::BigInt,
            ) => Value::Int(0),
            Type::Scalar(ScalarType::Decimal | ScalarType::Double) => Value::Float(0.0),
            Type::Scalar(_)
            | Type::Optional(_)
            | Type::Object(_)
            | Type::Sequence(_)
            | Type::Grouping { .. }
            | Type::Unit
            | Type::Any => Value::Null,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(scalar) => write!(f, "{scalar}"),
            Type::Optional(inner) => write!(f, "{inner}?"),
            Type::Object(name) => write!(f, "{name}"),
            Type::Sequence(element) => write!(f, "[{element}]"),
            Type::Grouping { key, element } => write!(f, "group<{key}, {element}>"),
            Type::Unit => write!(f, "unit"),
            Type::Any => write!(f, "any"),
        }
    }
}
