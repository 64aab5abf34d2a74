//! Metadata information regarding column types.

use std::fmt;

use enum_iterator::Sequence;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::MetadataError;

/// The scalar kinds a mapped column can hold.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Sequence,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Decimal,
    Double,
    String,
    DateTime,
    Guid,
    Binary,
}

impl ScalarType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ScalarType::SmallInt
                | ScalarType::Integer
                | ScalarType::BigInt
                | ScalarType::Decimal
                | ScalarType::Double
        )
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ScalarType::SmallInt | ScalarType::Integer | ScalarType::BigInt
        )
    }

    /// The type name used when no declared database type is known.
    pub fn default_db_name(self) -> &'static str {
        match self {
            ScalarType::Boolean => "bit",
            ScalarType::SmallInt => "smallint",
            ScalarType::Integer => "int",
            ScalarType::BigInt => "bigint",
            ScalarType::Decimal => "decimal",
            ScalarType::Double => "float",
            ScalarType::String => "nvarchar",
            ScalarType::DateTime => "datetime",
            ScalarType::Guid => "uniqueidentifier",
            ScalarType::Binary => "varbinary",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Boolean => "boolean",
            ScalarType::SmallInt => "smallint",
            ScalarType::Integer => "integer",
            ScalarType::BigInt => "bigint",
            ScalarType::Decimal => "decimal",
            ScalarType::Double => "double",
            ScalarType::String => "string",
            ScalarType::DateTime => "datetime",
            ScalarType::Guid => "guid",
            ScalarType::Binary => "binary",
        };
        write!(f, "{name}")
    }
}

/// A declared database column type, e.g. `VarChar(50) NOT NULL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbType {
    pub scalar: ScalarType,
    /// Declared type name, as written.
    pub name: String,
    pub length: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub not_null: bool,
}

/// Known type names and the scalar kind they hold.
const TYPE_NAMES: &[(&str, ScalarType)] = &[
    ("bit", ScalarType::Boolean),
    ("bool", ScalarType::Boolean),
    ("boolean", ScalarType::Boolean),
    ("tinyint", ScalarType::SmallInt),
    ("smallint", ScalarType::SmallInt),
    ("int2", ScalarType::SmallInt),
    ("int", ScalarType::Integer),
    ("integer", ScalarType::Integer),
    ("int4", ScalarType::Integer),
    ("bigint", ScalarType::BigInt),
    ("int8", ScalarType::BigInt),
    ("decimal", ScalarType::Decimal),
    ("numeric", ScalarType::Decimal),
    ("money", ScalarType::Decimal),
    ("float", ScalarType::Double),
    ("real", ScalarType::Double),
    ("double", ScalarType::Double),
    ("double precision", ScalarType::Double),
    ("float8", ScalarType::Double),
    ("char", ScalarType::String),
    ("nchar", ScalarType::String),
    ("varchar", ScalarType::String),
    ("nvarchar", ScalarType::String),
    ("character varying", ScalarType::String),
    ("text", ScalarType::String),
    ("ntext", ScalarType::String),
    ("date", ScalarType::DateTime),
    ("datetime", ScalarType::DateTime),
    ("datetime2", ScalarType::DateTime),
    ("timestamp", ScalarType::DateTime),
    ("time", ScalarType::DateTime),
    ("uniqueidentifier", ScalarType::Guid),
    ("uuid", ScalarType::Guid),
    ("binary", ScalarType::Binary),
    ("varbinary", ScalarType::Binary),
    ("blob", ScalarType::Binary),
    ("bytea", ScalarType::Binary),
    ("image", ScalarType::Binary),
];

impl DbType {
    /// The default database type for a scalar kind.
    pub fn of(scalar: ScalarType) -> DbType {
        DbType {
            scalar,
            name: scalar.default_db_name().to_string(),
            length: None,
            precision: None,
            scale: None,
            not_null: false,
        }
    }

    /// Parse db-type text such as `Int NOT NULL`, `NVarChar(40)` or `Decimal(18,2)`.
    pub fn parse(text: &str) -> Result<DbType, MetadataError> {
        let invalid = || MetadataError::InvalidDbType(text.to_string());
        let mut rest = text.trim();

        let mut not_null = false;
        let upper = rest.to_ascii_uppercase();
        if upper.ends_with("NOT NULL") {
            not_null = true;
            rest = rest[..rest.len() - "NOT NULL".len()].trim_end();
        } else if upper.ends_with(" NULL") {
            rest = rest[..rest.len() - "NULL".len()].trim_end();
        }

        let (name, arguments) = match rest.find('(') {
            None => (rest, None),
            Some(open) => {
                let close = rest.rfind(')').filter(|close| *close > open).ok_or_else(invalid)?;
                if !rest[close + 1..].trim().is_empty() {
                    return Err(invalid());
                }
                (rest[..open].trim_end(), Some(&rest[open + 1..close]))
            }
        };

        let lowered = name.to_ascii_lowercase();
        let scalar = TYPE_NAMES
            .iter()
            .find(|(known, _)| *known == lowered)
            .map(|(_, scalar)| *scalar)
            .ok_or_else(invalid)?;

        let mut db_type = DbType {
            scalar,
            name: name.to_string(),
            length: None,
            precision: None,
            scale: None,
            not_null,
        };

        if let Some(arguments) = arguments {
            let parts: Vec<&str> = arguments.split(',').map(str::trim).collect();
            match scalar {
                ScalarType::String | ScalarType::Binary => match parts.as_slice() {
                    [length] if length.eq_ignore_ascii_case("max") => {}
                    [length] => db_type.length = Some(length.parse().map_err(|_| invalid())?),
                    _ => return Err(invalid()),
                },
                ScalarType::Decimal | ScalarType::Double => match parts.as_slice() {
                    [precision] => {
                        db_type.precision = Some(precision.parse().map_err(|_| invalid())?);
                    }
                    [precision, scale] => {
                        db_type.precision = Some(precision.parse().map_err(|_| invalid())?);
                        db_type.scale = Some(scale.parse().map_err(|_| invalid())?);
                    }
                    _ => return Err(invalid()),
                },
                _ => {
                    // precision on temporal types and similar modifiers carry no meaning here
                    if parts.iter().any(|part| part.parse::<u32>().is_err()) {
                        return Err(invalid());
                    }
                }
            }
        }

        Ok(db_type)
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        match (self.length, self.precision, self.scale) {
            (Some(length), _, _) => write!(f, "({length})"),
            (None, Some(precision), Some(scale)) => write!(f, "({precision},{scale})"),
            (None, Some(precision), None) => write!(f, "({precision})"),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_names_case_insensitively() {
        let db_type = DbType::parse("Int").unwrap();
        assert_eq!(db_type.scalar, ScalarType::Integer);
        assert!(!db_type.not_null);
        assert_eq!(db_type.name, "Int");
    }

    #[test]
    fn parses_length_and_nullability() {
        let db_type = DbType::parse("NVarChar(40) NOT NULL").unwrap();
        assert_eq!(db_type.scalar, ScalarType::String);
        assert_eq!(db_type.length, Some(40));
        assert!(db_type.not_null);
        assert_eq!(db_type.to_string(), "NVarChar(40)");
    }

    #[test]
    fn parses_precision_and_scale() {
        let db_type = DbType::parse("decimal(18, 2)").unwrap();
        assert_eq!(db_type.scalar, ScalarType::Decimal);
        assert_eq!(db_type.precision, Some(18));
        assert_eq!(db_type.scale, Some(2));
        assert_eq!(db_type.to_string(), "decimal(18,2)");
    }

    #[test]
    fn max_length_is_unbounded() {
        let db_type = DbType::parse("varchar(MAX) NULL").unwrap();
        assert_eq!(db_type.length, None);
        assert!(!db_type.not_null);
    }

    #[test]
    fn multi_word_names_are_known() {
        let db_type = DbType::parse("double precision NOT NULL").unwrap();
        assert_eq!(db_type.scalar, ScalarType::Double);
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert_eq!(
            DbType::parse("geography"),
            Err(MetadataError::InvalidDbType("geography".to_string()))
        );
        assert!(DbType::parse("varchar(abc)").is_err());
        assert!(DbType::parse("varchar(10").is_err());
    }

    #[test]
    fn every_scalar_type_has_a_parseable_default() {
        for scalar in enum_iterator::all::<ScalarType>() {
            let db_type = DbType::parse(scalar.default_db_name()).unwrap();
            assert_eq!(db_type.scalar, scalar);
        }
    }
}
