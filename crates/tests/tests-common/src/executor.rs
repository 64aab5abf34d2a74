//! An executor answering from a script, recording every call it receives.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use query_engine_execution::executor::{RowProjector, SharedRowProjector};
use query_engine_execution::{BoxError, Error, Executor, RowReader};
use query_engine_metadata::metadata::EntityId;
use query_engine_sql::sql::string::QueryCommand;
use query_engine_sql::sql::value::{Deferred, DeferredError, DeferredSource, Value, ValueIter};

/// A scripted answer to the next round trip.
#[derive(Debug, Clone)]
pub enum Response {
    /// Rows given as named values. Result columns missing from a row read null.
    Rows {
        rows: Vec<Vec<(String, Value)>>,
        /// Whether a column named like `Id1` may read the value given for `Id`.
        match_suffixed: bool,
    },
    Affected(i64),
}

impl Response {
    pub fn rows<'a>(rows: impl IntoIterator<Item = Vec<(&'a str, Value)>>) -> Response {
        Response::Rows {
            rows: named(rows),
            match_suffixed: false,
        }
    }

    /// Rows whose values also answer the columns renamed with a numeric suffix to
    /// keep their names apart.
    pub fn rows_matching_suffixes<'a>(rows: impl IntoIterator<Item = Vec<(&'a str, Value)>>) -> Response {
        Response::Rows {
            rows: named(rows),
            match_suffixed: true,
        }
    }

    pub fn empty() -> Response {
        Response::rows([])
    }
}

fn named<'a>(rows: impl IntoIterator<Item = Vec<(&'a str, Value)>>) -> Vec<Vec<(String, Value)>> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect()
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Query,
    Deferred,
    Batch,
    Command,
    Connected,
    Transacted,
}

/// One call received by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    pub text: String,
    pub parameters: Vec<Value>,
    pub entity: Option<EntityId>,
}

/// Answers queries and commands from a queue of responses, in order.
///
/// A query with no response left returns no rows; a command affects one row.
/// Deferred rows can only be read while the connection is open.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    responses: RefCell<VecDeque<Response>>,
    calls: RefCell<Vec<Call>>,
    rows_affected: Cell<i64>,
    already_connected: bool,
    open: Arc<AtomicBool>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        ScriptedExecutor::default()
    }

    /// An executor whose connection was opened by the caller and outlives any plan run.
    pub fn connected() -> Self {
        let executor = ScriptedExecutor {
            already_connected: true,
            ..ScriptedExecutor::default()
        };
        executor.open.store(true, Ordering::SeqCst);
        executor
    }

    /// Close a connection opened by the caller.
    pub fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn then(self, response: Response) -> Self {
        self.responses.borrow_mut().push_back(response);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    /// The number of times the database was reached.
    pub fn round_trips(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| !matches!(call.kind, CallKind::Connected | CallKind::Transacted))
            .count()
    }

    fn record(&self, kind: CallKind, command: &QueryCommand, parameters: &[Value], entity: Option<&EntityId>) {
        tracing::debug!(?kind, sql = %command.text, "Scripted call");
        self.calls.borrow_mut().push(Call {
            kind,
            text: command.text.clone(),
            parameters: parameters.to_vec(),
            entity: entity.cloned(),
        });
    }

    fn next_rows(&self, command: &QueryCommand) -> Vec<Vec<Value>> {
        match self.responses.borrow_mut().pop_front() {
            Some(Response::Rows {
                rows,
                match_suffixed,
            }) => rows
                .iter()
                .map(|row| {
                    command
                        .columns
                        .iter()
                        .map(|column| lookup(row, column, match_suffixed))
                        .collect()
                })
                .collect(),
            Some(Response::Affected(affected)) => {
                self.rows_affected.set(affected);
                vec![]
            }
            None => vec![],
        }
    }

    fn next_affected(&self) -> i64 {
        let affected = match self.responses.borrow_mut().pop_front() {
            Some(Response::Affected(affected)) => affected,
            Some(Response::Rows { rows, .. }) => i64::try_from(rows.len()).unwrap_or(i64::MAX),
            None => 1,
        };
        self.rows_affected.set(affected);
        affected
    }
}

fn lookup(row: &[(String, Value)], column: &str, match_suffixed: bool) -> Value {
    let find = |name: &str| row.iter().find(|(given, _)| given == name).map(|(_, value)| value.clone());
    find(column)
        .or_else(|| {
            let base = column.trim_end_matches(|c: char| c.is_ascii_digit());
            (match_suffixed && base != column).then(|| find(base)).flatten()
        })
        .unwrap_or(Value::Null)
}

/// The current row of a scripted result.
pub struct VecRow<'r>(pub &'r [Value]);

impl RowReader for VecRow<'_> {
    fn field_count(&self) -> usize {
        self.0.len()
    }

    fn is_null(&self, ordinal: usize) -> Result<bool, BoxError> {
        Ok(self.get_value(ordinal)?.is_null())
    }

    fn get_value(&self, ordinal: usize) -> Result<Value, BoxError> {
        self.0
            .get(ordinal)
            .cloned()
            .ok_or_else(|| format!("no field {ordinal}").into())
    }
}

struct ScriptedRows {
    rows: Vec<Vec<Value>>,
    projector: SharedRowProjector,
    open: Arc<AtomicBool>,
}

impl DeferredSource for ScriptedRows {
    fn enumerate(&self) -> Result<ValueIter, DeferredError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(DeferredError {
                message: "connection closed".to_string(),
            });
        }
        let projector = self.projector.clone();
        Ok(Box::new(self.rows.clone().into_iter().map(move |row| {
            projector(&VecRow(&row)).map_err(|error| DeferredError {
                message: error.to_string(),
            })
        })))
    }
}

impl Executor for ScriptedExecutor {
    fn execute(
        &self,
        command: &QueryCommand,
        projector: RowProjector<'_>,
        entity: Option<&EntityId>,
        parameters: &[Value],
    ) -> Result<Vec<Value>, BoxError> {
        self.record(CallKind::Query, command, parameters, entity);
        self.next_rows(command)
            .iter()
            .map(|row| projector(&VecRow(row)))
            .collect()
    }

    fn execute_deferred(
        &self,
        command: &QueryCommand,
        projector: SharedRowProjector,
        entity: Option<&EntityId>,
        parameters: &[Value],
    ) -> Result<Deferred, BoxError> {
        self.record(CallKind::Deferred, command, parameters, entity);
        Ok(Deferred(Arc::new(ScriptedRows {
            rows: self.next_rows(command),
            projector,
            open: self.open.clone(),
        })))
    }

    fn execute_batch(
        &self,
        command: &QueryCommand,
        parameter_sets: &[Vec<Value>],
        batch_size: usize,
        _stream: bool,
        projector: Option<RowProjector<'_>>,
    ) -> Result<Vec<Value>, BoxError> {
        let mut results = vec![];
        for chunk in parameter_sets.chunks(batch_size.max(1)) {
            self.record(CallKind::Batch, command, &chunk.concat(), None);
            for _ in chunk {
                match projector {
                    Some(projector) => {
                        let rows = self
                            .next_rows(command)
                            .iter()
                            .map(|row| projector(&VecRow(row)))
                            .collect::<Result<Vec<_>, _>>()?;
                        results.push(Value::List(rows));
                    }
                    None => results.push(Value::Int(self.next_affected())),
                }
            }
        }
        Ok(results)
    }

    fn execute_command(&self, command: &QueryCommand, parameters: &[Value]) -> Result<i64, BoxError> {
        self.record(CallKind::Command, command, parameters, None);
        Ok(self.next_affected())
    }

    fn rows_affected(&self) -> i64 {
        self.rows_affected.get()
    }

    fn is_connected(&self) -> bool {
        self.already_connected
    }

    fn do_connected(&self, action: &mut dyn FnMut() -> Result<Value, Error>) -> Result<Value, Error> {
        self.calls.borrow_mut().push(Call {
            kind: CallKind::Connected,
            text: String::new(),
            parameters: vec![],
            entity: None,
        });
        if self.already_connected {
            return action();
        }
        self.open.store(true, Ordering::SeqCst);
        let result = action();
        self.open.store(false, Ordering::SeqCst);
        result
    }

    fn do_transacted(&self, action: &mut dyn FnMut() -> Result<Value, Error>) -> Result<Value, Error> {
        self.calls.borrow_mut().push(Call {
            kind: CallKind::Transacted,
            text: String::new(),
            parameters: vec![],
            entity: None,
        });
        action()
    }
}
