//! Type definitions of a low-level SQL string representation.

use query_engine_metadata::metadata::DbType;

use super::types::Type;

/// A parameter declared by a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryParameter {
    pub name: String,
    pub r#type: Type,
    pub query_type: Option<DbType>,
}

/// A command ready to be sent: its text and the parameters it reads, in marker order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryCommand {
    pub text: String,
    pub parameters: Vec<QueryParameter>,
    /// The names of the result columns, in order; empty for commands returning no rows.
    pub columns: Vec<String>,
}

/// A SQL string under construction.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SQL {
    pub sql: String,
    pub params: Vec<QueryParameter>,
    pub columns: Vec<String>,
    depth: usize,
}

impl SQL {
    pub fn new() -> SQL {
        SQL {
            sql: String::new(),
            params: vec![],
            columns: vec![],
            depth: 0,
        }
    }

    pub fn append_syntax(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Append an identifier already quoted by the dialect.
    pub fn append_identifier(&mut self, quoted: &str) {
        self.sql.push_str(quoted);
    }

    /// Register a parameter and return its 1-based ordinal in the parameter list.
    ///
    /// A parameter already registered under the same name is reused unless every
    /// occurrence must get its own marker.
    pub fn append_param(&mut self, param: QueryParameter, per_occurrence: bool) -> usize {
        if !per_occurrence {
            if let Some(index) = self.params.iter().position(|p| p.name == param.name) {
                return index + 1;
            }
        }
        self.params.push(param);
        self.params.len()
    }

    /// Start a new line at the current depth.
    pub fn new_line(&mut self) {
        self.sql.push('\n');
        for _ in 0..self.depth {
            self.sql.push_str("  ");
        }
    }

    pub fn indent(&mut self) {
        self.depth += 1;
    }

    pub fn outdent(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn into_command(self) -> QueryCommand {
        QueryCommand {
            text: self.sql,
            parameters: self.params,
            columns: self.columns,
        }
    }
}
