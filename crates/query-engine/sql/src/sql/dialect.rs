//! Target dialects: the syntax and capabilities the formatter and the language
//! rules consult.

use std::fmt;
use std::sync::Arc;

use enum_iterator::Sequence;
use query_engine_metadata::metadata::{DbType, ScalarType};

use super::ast::{ExprRef, Expression, Function};
use super::helpers;
use super::types::Type;

/// How a dialect spells joins whose right side reads the left side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplySupport {
    /// `CROSS APPLY` / `OUTER APPLY`.
    Native,
    /// `CROSS JOIN LATERAL` / `LEFT OUTER JOIN LATERAL ... ON TRUE`.
    Lateral,
    None,
}

/// Where a dialect places its row limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle {
    /// `LIMIT n OFFSET m` after the ORDER BY clause.
    LimitOffset { offset_requires_limit: bool },
    /// `SELECT TOP (n)`, or `OFFSET m ROWS FETCH NEXT n ROWS ONLY` when skipping.
    TopOrOffsetFetch,
}

/// The built-in dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum DialectKind {
    Postgres,
    SqlServer,
    Sqlite,
}

impl DialectKind {
    pub fn dialect(self) -> Arc<dyn Dialect> {
        match self {
            DialectKind::Postgres => Arc::new(Postgres),
            DialectKind::SqlServer => Arc::new(SqlServer),
            DialectKind::Sqlite => Arc::new(Sqlite),
        }
    }

    pub fn parse(name: &str) -> Option<DialectKind> {
        enum_iterator::all::<DialectKind>()
            .find(|kind| kind.dialect().name().eq_ignore_ascii_case(name))
    }
}

/// A target SQL dialect.
pub trait Dialect: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// The marker for a parameter; `ordinal` is its 1-based position in the command.
    fn parameter_marker(&self, name: &str, ordinal: usize) -> String;

    /// Whether every occurrence of a parameter needs its own marker and value.
    fn requires_parameter_per_occurrence(&self) -> bool {
        false
    }

    /// Whether several statements can be sent in one round trip.
    fn allows_multiple_commands(&self) -> bool {
        false
    }

    fn allows_distinct_in_aggregates(&self) -> bool {
        true
    }

    /// A FROM clause for selects that read no table, when one is required.
    fn dummy_from_clause(&self) -> Option<&'static str> {
        None
    }

    fn allows_cross_join(&self) -> bool {
        true
    }

    fn apply_support(&self) -> ApplySupport;

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::LimitOffset {
            offset_requires_limit: false,
        }
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    /// Whether predicates are values and boolean values are predicates, so no
    /// coercion is needed between the two positions.
    fn predicates_are_values(&self) -> bool {
        true
    }

    fn concat_operator(&self) -> &'static str {
        "||"
    }

    /// The template for a scalar function; `{0}`, `{1}` ... stand for the arguments.
    fn function_template(&self, function: Function, arity: usize) -> Option<&'static str> {
        standard_function_template(function, arity)
    }

    /// The type name used to declare or cast to a scalar kind.
    fn scalar_type_name(&self, scalar: ScalarType) -> &'static str {
        scalar.default_db_name()
    }

    fn type_name(&self, db_type: &DbType) -> String {
        db_type.to_string()
    }

    /// The value of the key generated by the most recent insert.
    fn generated_id_expression(&self, r#type: Type) -> ExprRef;

    /// The number of rows the previous statement affected.
    fn rows_affected_expression(&self) -> ExprRef;

    fn is_rows_affected(&self, expression: &Expression) -> bool {
        *expression == *self.rows_affected_expression()
    }

    /// Whether `DECLARE`d variables can carry values between statements.
    fn supports_variables(&self) -> bool {
        false
    }

    fn variable_name(&self, name: &str) -> String {
        format!("@{name}")
    }
}

fn rows_affected_type() -> Type {
    Type::Scalar(ScalarType::Integer)
}

/// PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn parameter_marker(&self, _name: &str, ordinal: usize) -> String {
        format!("${ordinal}")
    }

    fn apply_support(&self) -> ApplySupport {
        ApplySupport::Lateral
    }

    fn function_template(&self, function: Function, arity: usize) -> Option<&'static str> {
        match (function, arity) {
            (Function::Ceiling, 1) => Some("CEIL({0})"),
            (Function::Now, 0) => Some("NOW()"),
            _ => standard_function_template(function, arity),
        }
    }

    fn scalar_type_name(&self, scalar: ScalarType) -> &'static str {
        match scalar {
            ScalarType::Boolean => "boolean",
            ScalarType::Double => "double precision",
            ScalarType::String => "text",
            ScalarType::DateTime => "timestamp",
            ScalarType::Guid => "uuid",
            ScalarType::Binary => "bytea",
            other => other.default_db_name(),
        }
    }

    fn generated_id_expression(&self, r#type: Type) -> ExprRef {
        helpers::db_function("lastval", Some(vec![]), r#type)
    }

    fn rows_affected_expression(&self) -> ExprRef {
        helpers::db_function("ROW_COUNT", None, rows_affected_type())
    }
}

/// Microsoft SQL Server.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServer;

impl Dialect for SqlServer {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn parameter_marker(&self, name: &str, _ordinal: usize) -> String {
        format!("@{name}")
    }

    fn allows_multiple_commands(&self) -> bool {
        true
    }

    fn apply_support(&self) -> ApplySupport {
        ApplySupport::Native
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::TopOrOffsetFetch
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn predicates_are_values(&self) -> bool {
        false
    }

    fn concat_operator(&self) -> &'static str {
        "+"
    }

    fn function_template(&self, function: Function, arity: usize) -> Option<&'static str> {
        match (function, arity) {
            (Function::Length, 1) => Some("LEN({0})"),
            (Function::Trim, 1) => Some("LTRIM(RTRIM({0}))"),
            (Function::Substring, 2) => Some("SUBSTRING({0}, ({1} + 1), 8000)"),
            (Function::StartsWith, 2) => Some("({0} LIKE ({1} + '%'))"),
            (Function::EndsWith, 2) => Some("({0} LIKE ('%' + {1}))"),
            (Function::Contains, 2) => Some("({0} LIKE ('%' + {1} + '%'))"),
            (Function::Round, 1) => Some("ROUND({0}, 0)"),
            (Function::Now, 0) => Some("GETDATE()"),
            (Function::Year, 1) => Some("DATEPART(year, {0})"),
            (Function::Month, 1) => Some("DATEPART(month, {0})"),
            (Function::Day, 1) => Some("DATEPART(day, {0})"),
            _ => standard_function_template(function, arity),
        }
    }

    fn generated_id_expression(&self, r#type: Type) -> ExprRef {
        helpers::db_function("SCOPE_IDENTITY", Some(vec![]), r#type)
    }

    fn rows_affected_expression(&self) -> ExprRef {
        helpers::db_function("@@ROWCOUNT", None, rows_affected_type())
    }

    fn supports_variables(&self) -> bool {
        true
    }
}

/// SQLite.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

impl Dialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn parameter_marker(&self, _name: &str, _ordinal: usize) -> String {
        "?".to_string()
    }

    fn requires_parameter_per_occurrence(&self) -> bool {
        true
    }

    fn apply_support(&self) -> ApplySupport {
        ApplySupport::None
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::LimitOffset {
            offset_requires_limit: true,
        }
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn function_template(&self, function: Function, arity: usize) -> Option<&'static str> {
        match (function, arity) {
            (Function::Substring, 2) => Some("SUBSTR({0}, ({1} + 1))"),
            (Function::Substring, 3) => Some("SUBSTR({0}, ({1} + 1), {2})"),
            (Function::Ceiling, 1) => Some("CEIL({0})"),
            (Function::Year, 1) => Some("CAST(STRFTIME('%Y', {0}) AS INTEGER)"),
            (Function::Month, 1) => Some("CAST(STRFTIME('%m', {0}) AS INTEGER)"),
            (Function::Day, 1) => Some("CAST(STRFTIME('%d', {0}) AS INTEGER)"),
            _ => standard_function_template(function, arity),
        }
    }

    fn scalar_type_name(&self, scalar: ScalarType) -> &'static str {
        match scalar {
            ScalarType::Boolean
            | ScalarType::SmallInt
            | ScalarType::Integer
            | ScalarType::BigInt => "INTEGER",
            ScalarType::Decimal | ScalarType::Double => "REAL",
            ScalarType::Binary => "BLOB",
            ScalarType::String | ScalarType::DateTime | ScalarType::Guid => "TEXT",
        }
    }

    fn generated_id_expression(&self, r#type: Type) -> ExprRef {
        helpers::db_function("last_insert_rowid", Some(vec![]), r#type)
    }

    fn rows_affected_expression(&self) -> ExprRef {
        helpers::db_function("changes", Some(vec![]), rows_affected_type())
    }
}

/// Function templates in standard SQL, for dialects that override only some of them.
pub fn standard_function_template(function: Function, arity: usize) -> Option<&'static str> {
    Some(match (function, arity) {
        (Function::Upper, 1) => "UPPER({0})",
        (Function::Lower, 1) => "LOWER({0})",
        (Function::Length, 1) => "LENGTH({0})",
        (Function::Trim, 1) => "TRIM({0})",
        (Function::Substring, 2) => "SUBSTRING({0}, ({1} + 1))",
        (Function::Substring, 3) => "SUBSTRING({0}, ({1} + 1), {2})",
        (Function::StartsWith, 2) => "({0} LIKE ({1} || '%'))",
        (Function::EndsWith, 2) => "({0} LIKE ('%' || {1}))",
        (Function::Contains, 2) => "({0} LIKE ('%' || {1} || '%'))",
        (Function::Replace, 3) => "REPLACE({0}, {1}, {2})",
        (Function::Abs, 1) => "ABS({0})",
        (Function::Round, 1) => "ROUND({0})",
        (Function::Floor, 1) => "FLOOR({0})",
        (Function::Ceiling, 1) => "CEILING({0})",
        (Function::Now, 0) => "CURRENT_TIMESTAMP",
        (Function::Year, 1) => "EXTRACT(YEAR FROM {0})",
        (Function::Month, 1) => "EXTRACT(MONTH FROM {0})",
        (Function::Day, 1) => "EXTRACT(DAY FROM {0})",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_dialect_parses_from_its_name() {
        for kind in enum_iterator::all::<DialectKind>() {
            assert_eq!(DialectKind::parse(kind.dialect().name()), Some(kind));
        }
        assert_eq!(DialectKind::parse("SQLServer"), Some(DialectKind::SqlServer));
        assert_eq!(DialectKind::parse("oracle"), None);
    }

    #[test]
    fn quoting_escapes_the_closing_quote() {
        assert_eq!(Postgres.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(SqlServer.quote_identifier("a]b"), "[a]]b]");
    }

    #[test]
    fn rows_affected_primitives_are_recognized() {
        for kind in enum_iterator::all::<DialectKind>() {
            let dialect = kind.dialect();
            assert!(dialect.is_rows_affected(&dialect.rows_affected_expression()));
            assert!(!dialect.is_rows_affected(
                &dialect.generated_id_expression(Type::Scalar(ScalarType::Integer))
            ));
        }
    }

    #[test]
    fn overridden_templates_fall_back_to_the_defaults() {
        assert_eq!(
            Sqlite.function_template(Function::Upper, 1),
            Some("UPPER({0})")
        );
        assert_eq!(SqlServer.function_template(Function::Length, 1), Some("LEN({0})"));
        assert_eq!(Postgres.function_template(Function::Upper, 2), None);
    }
}
