//! The seam between plans and a database driver.

use std::sync::Arc;

use query_engine_metadata::metadata::EntityId;
use query_engine_sql::sql::string::QueryCommand;
use query_engine_sql::sql::value::{Deferred, Value};

use crate::error::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Turns the current row of a result into a value.
pub type RowProjector<'p> = &'p dyn Fn(&dyn RowReader) -> Result<Value, BoxError>;

/// A row projector that can outlive the call producing it, for deferred results.
pub type SharedRowProjector = Arc<dyn Fn(&dyn RowReader) -> Result<Value, BoxError> + Send + Sync>;

/// Typed access to the fields of the current row, by ordinal.
pub trait RowReader {
    fn field_count(&self) -> usize;

    fn is_null(&self, ordinal: usize) -> Result<bool, BoxError>;

    fn get_value(&self, ordinal: usize) -> Result<Value, BoxError>;

    fn get_bool(&self, ordinal: usize) -> Result<bool, BoxError> {
        let value = self.get_value(ordinal)?;
        value
            .as_bool()
            .ok_or_else(|| format!("field {ordinal} is not a boolean: {value:?}").into())
    }

    fn get_i64(&self, ordinal: usize) -> Result<i64, BoxError> {
        let value = self.get_value(ordinal)?;
        value
            .as_i64()
            .ok_or_else(|| format!("field {ordinal} is not an integer: {value:?}").into())
    }

    fn get_f64(&self, ordinal: usize) -> Result<f64, BoxError> {
        let value = self.get_value(ordinal)?;
        value
            .as_f64()
            .ok_or_else(|| format!("field {ordinal} is not a number: {value:?}").into())
    }

    fn get_string(&self, ordinal: usize) -> Result<String, BoxError> {
        match self.get_value(ordinal)? {
            Value::String(string) => Ok(string),
            other => Err(format!("field {ordinal} is not a string: {other:?}").into()),
        }
    }
}

/// Runs commands against a database.
///
/// Parameter values are passed in the order of `command.parameters`. The entity,
/// when known, names what the rows are read for, e.g. for a driver that caches
/// instances by identity.
pub trait Executor {
    /// Run a query to completion and project each row.
    fn execute(
        &self,
        command: &QueryCommand,
        projector: RowProjector<'_>,
        entity: Option<&EntityId>,
        parameters: &[Value],
    ) -> Result<Vec<Value>, BoxError>;

    /// Run a query whose rows are only read when the result is enumerated.
    fn execute_deferred(
        &self,
        command: &QueryCommand,
        projector: SharedRowProjector,
        entity: Option<&EntityId>,
        parameters: &[Value],
    ) -> Result<Deferred, BoxError>;

    /// Run one command once per parameter set, `batch_size` sets per round trip.
    ///
    /// With a projector each execution yields the rows it returns; without one it
    /// yields its rows-affected count.
    fn execute_batch(
        &self,
        command: &QueryCommand,
        parameter_sets: &[Vec<Value>],
        batch_size: usize,
        stream: bool,
        projector: Option<RowProjector<'_>>,
    ) -> Result<Vec<Value>, BoxError>;

    /// Run a command and return the number of rows it affected.
    fn execute_command(&self, command: &QueryCommand, parameters: &[Value]) -> Result<i64, BoxError>;

    /// The rows affected by the most recent command.
    fn rows_affected(&self) -> i64;

    /// Whether a connection is already open around the plan's run. Deferred
    /// results then stream from it; otherwise they are read before the run
    /// releases the connection it opened.
    fn is_connected(&self) -> bool {
        false
    }

    /// Run `action` on one open connection.
    fn do_connected(&self, action: &mut dyn FnMut() -> Result<Value, Error>) -> Result<Value, Error> {
        action()
    }

    /// Run `action` in one transaction, rolled back when it fails.
    fn do_transacted(&self, action: &mut dyn FnMut() -> Result<Value, Error>) -> Result<Value, Error> {
        action()
    }
}
