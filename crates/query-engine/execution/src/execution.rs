//! Run a plan's steps against an executor.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use query_engine_sql::sql::ast::{Aggregator, ExprRef};
use query_engine_sql::sql::evaluate::{apply_binary, Arguments, Bindings, EvaluationError};
use query_engine_sql::sql::value::Value;

use crate::deferred::{buffered, single_pass};
use crate::error::Error;
use crate::executor::{BoxError, Executor, RowReader, SharedRowProjector};
use crate::lookup::Lookup;
use crate::plan::{BatchBody, Check, LookupStep, ParameterSource, QueryStep, Statement, Step};
use crate::projector::{field, read_row};

/// State of one run of a plan.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    lookups: RefCell<BTreeMap<usize, Lookup>>,
    variables: RefCell<BTreeMap<String, Value>>,
    /// Deferred results are read before the run ends.
    buffer_deferred: bool,
}

impl RunState {
    pub(crate) fn new(buffer_deferred: bool) -> Self {
        RunState {
            buffer_deferred,
            ..RunState::default()
        }
    }
}

pub(crate) struct ExecutionContext<'e> {
    /// Absent while projecting the rows of a deferred result.
    executor: Option<&'e dyn Executor>,
    arguments: &'e Arguments,
    /// Lambda parameters bound by a batch.
    parameters: Vec<(String, Value)>,
    state: &'e RunState,
}

impl<'e> ExecutionContext<'e> {
    pub(crate) fn new(executor: &'e dyn Executor, arguments: &'e Arguments, state: &'e RunState) -> Self {
        ExecutionContext {
            executor: Some(executor),
            arguments,
            parameters: vec![],
            state,
        }
    }

    fn with_parameter(&self, name: &str, value: Value) -> ExecutionContext<'e> {
        let mut parameters = self.parameters.clone();
        parameters.push((name.to_string(), value));
        ExecutionContext {
            executor: self.executor,
            arguments: self.arguments,
            parameters,
            state: self.state,
        }
    }

    fn executor(&self) -> Result<&'e dyn Executor, Error> {
        self.executor.ok_or(Error::Detached)
    }

    fn bindings(&self) -> Bindings<'e> {
        self.parameters
            .iter()
            .fold(Bindings::new(self.arguments), |bindings, (name, value)| {
                bindings.with(name, value.clone())
            })
    }

    pub(crate) fn evaluate(&self, expression: &ExprRef) -> Result<Value, Error> {
        Ok(self.bindings().evaluate(expression)?)
    }

    pub(crate) fn lookup(&self, slot: usize, key: &[Value]) -> Vec<Value> {
        self.state
            .lookups
            .borrow()
            .get(&slot)
            .map(|lookup| lookup.get(key))
            .unwrap_or_default()
    }

    pub(crate) fn run_step(&self, step: &Step) -> Result<Value, Error> {
        match step {
            Step::Value(expression) => self.evaluate(expression),
            Step::Query(query) => self.run_query(query, &[]),
            Step::Command(statement) => {
                let parameters = self.parameter_values(statement, &[])?;
                tracing::info!(sql = %statement.command.text, ?parameters, "Executing command");
                let affected = self
                    .executor()?
                    .execute_command(&statement.command, &parameters)
                    .map_err(Error::from_executor)?;
                Ok(Value::Int(affected))
            }
            Step::Sequence(steps) => {
                let mut last = Value::Null;
                for step in steps {
                    last = self.run_step(step)?;
                }
                Ok(last)
            }
            Step::If {
                check,
                if_true,
                if_false,
            } => {
                if self.check(check)? {
                    self.run_step(if_true)
                } else if let Some(if_false) = if_false {
                    self.run_step(if_false)
                } else {
                    Ok(Value::Null)
                }
            }
            Step::Declare(query) => {
                if let Value::Object(object) = self.run_query(query, &[])? {
                    tracing::debug!(variables = ?object.fields, "Read back variables");
                    self.state.variables.borrow_mut().extend(object.fields);
                }
                Ok(Value::Null)
            }
            Step::Batch {
                input,
                parameter,
                body,
            } => {
                let elements = match self.run_step(input)? {
                    Value::List(elements) => elements,
                    Value::Deferred(deferred) => deferred
                        .collect()
                        .map_err(|error| Error::Executor(Box::new(error)))?,
                    other => return Err(Error::NotASequence(format!("{other:?}"))),
                };
                match body {
                    BatchBody::Command {
                        statement,
                        batch_size,
                        stream,
                    } => {
                        let parameter_sets = elements
                            .into_iter()
                            .map(|element| {
                                self.with_parameter(parameter, element)
                                    .parameter_values(statement, &[])
                            })
                            .collect::<Result<Vec<_>, _>>()?;
                        tracing::info!(
                            sql = %statement.command.text,
                            sets = parameter_sets.len(),
                            batch_size,
                            "Executing batch"
                        );
                        let results = self
                            .executor()?
                            .execute_batch(&statement.command, &parameter_sets, *batch_size, *stream, None)
                            .map_err(Error::from_executor)?;
                        Ok(Value::List(results))
                    }
                    BatchBody::PerElement(step) => Ok(Value::List(
                        elements
                            .into_iter()
                            .map(|element| self.with_parameter(parameter, element).run_step(step))
                            .collect::<Result<_, _>>()?,
                    )),
                }
            }
        }
    }

    fn check(&self, check: &Check) -> Result<bool, Error> {
        let value = match check {
            Check::RowsAffected { operator, value } => {
                let affected = Value::Int(self.executor()?.rows_affected());
                apply_binary(*operator, &affected, value)?
            }
            Check::Query(query) => self.run_query(query, &[])?,
        };
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Run a query with `rows` as the enclosing rows, after building its lookups.
    pub(crate) fn run_query(&self, step: &QueryStep, rows: &[&[Value]]) -> Result<Value, Error> {
        self.build_lookups(&step.lookups)?;
        let parameters = self.parameter_values(&step.statement, rows)?;
        tracing::info!(sql = %step.statement.command.text, ?parameters, "Executing query");

        let project = |row: &dyn RowReader| -> Result<Value, BoxError> {
            let values = read_row(row, &step.reads)?;
            let mut stack: Vec<&[Value]> = rows.iter().copied().collect();
            stack.push(&values);
            Ok(step.projector.evaluate(self, &stack)?)
        };
        let values = self
            .executor()?
            .execute(&step.statement.command, &project, step.entity.as_ref(), &parameters)
            .map_err(Error::from_executor)?;
        aggregate(values, step.aggregator, &step.default)
    }

    /// Start a query whose rows are projected when the result is enumerated.
    ///
    /// The projection may run after this run has finished, so it sees copies of
    /// the arguments and the enclosing rows.
    pub(crate) fn run_deferred(&self, step: &Arc<QueryStep>, rows: &[&[Value]]) -> Result<Value, Error> {
        let parameters = self.parameter_values(&step.statement, rows)?;
        tracing::info!(sql = %step.statement.command.text, ?parameters, "Executing deferred query");

        let query = step.clone();
        let arguments = self.arguments.clone();
        let bound = self.parameters.clone();
        let outer: Vec<Vec<Value>> = rows.iter().map(|row| row.to_vec()).collect();
        let project: SharedRowProjector = Arc::new(move |row: &dyn RowReader| -> Result<Value, BoxError> {
            let values = read_row(row, &query.reads)?;
            let state = RunState::default();
            let context = ExecutionContext {
                executor: None,
                arguments: &arguments,
                parameters: bound.clone(),
                state: &state,
            };
            let mut stack: Vec<&[Value]> = outer.iter().map(Vec::as_slice).collect();
            stack.push(&values);
            Ok(query.projector.evaluate(&context, &stack)?)
        });
        let deferred = self
            .executor()?
            .execute_deferred(&step.statement.command, project, step.entity.as_ref(), &parameters)
            .map_err(Error::from_executor)?;
        if self.state.buffer_deferred {
            tracing::debug!("Buffering deferred results");
            return Ok(Value::Deferred(single_pass(buffered(&deferred)?)));
        }
        Ok(Value::Deferred(single_pass(deferred)))
    }

    fn build_lookups(&self, lookups: &[LookupStep]) -> Result<(), Error> {
        for lookup in lookups {
            let mut built = Lookup::new();
            if let Value::List(rows) = self.run_query(&lookup.query, &[])? {
                for row in rows {
                    let Value::List(parts) = row else { continue };
                    let Ok([Value::List(key), element, test]) = <[Value; 3]>::try_from(parts) else {
                        continue;
                    };
                    if !test.is_null() {
                        built.insert(key, element);
                    }
                }
            }
            tracing::debug!(slot = lookup.slot, "Built lookup");
            self.state.lookups.borrow_mut().insert(lookup.slot, built);
        }
        Ok(())
    }

    /// The values of a statement's parameters in marker order.
    fn parameter_values(&self, statement: &Statement, rows: &[&[Value]]) -> Result<Vec<Value>, Error> {
        let bindings = self.bindings();
        let mut named = Vec::with_capacity(statement.parameters.len());
        for (name, source) in &statement.parameters {
            let value = match source {
                ParameterSource::Host(expression) => bindings.evaluate(expression)?,
                ParameterSource::Variable(variable) => self
                    .state
                    .variables
                    .borrow()
                    .get(variable)
                    .cloned()
                    .ok_or_else(|| EvaluationError::UnboundParameter(variable.clone()))?,
                ParameterSource::Row { depth, ordinal } => field(rows, *depth, *ordinal)?,
            };
            named.push((name.as_str(), value));
        }
        statement
            .command
            .parameters
            .iter()
            .map(|parameter| {
                named
                    .iter()
                    .find(|(name, _)| *name == parameter.name)
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| EvaluationError::UnboundParameter(parameter.name.clone()).into())
            })
            .collect()
    }
}

/// Reduce the rows of a query the way its aggregator asks.
pub(crate) fn aggregate(
    values: Vec<Value>,
    aggregator: Option<Aggregator>,
    default: &Value,
) -> Result<Value, Error> {
    let mut values = values.into_iter();
    match aggregator {
        None | Some(Aggregator::List) => Ok(Value::List(values.collect())),
        Some(Aggregator::First) => values.next().ok_or(Error::NoElements),
        Some(Aggregator::FirstOrDefault) => Ok(values.next().unwrap_or_else(|| default.clone())),
        Some(Aggregator::Single) => match (values.next(), values.next()) {
            (Some(value), None) => Ok(value),
            (None, _) => Err(Error::NoElements),
            (Some(_), Some(_)) => Err(Error::MoreThanOneElement),
        },
        Some(Aggregator::SingleOrDefault) => match (values.next(), values.next()) {
            (Some(value), None) => Ok(value),
            (None, _) => Ok(default.clone()),
            (Some(_), Some(_)) => Err(Error::MoreThanOneElement),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_requires_exactly_one_row() {
        assert!(matches!(
            aggregate(vec![], Some(Aggregator::Single), &Value::Null),
            Err(Error::NoElements)
        ));
        assert!(matches!(
            aggregate(vec![Value::Int(1), Value::Int(2)], Some(Aggregator::Single), &Value::Null),
            Err(Error::MoreThanOneElement)
        ));
        assert_eq!(
            aggregate(vec![Value::Int(1)], Some(Aggregator::Single), &Value::Null).unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn defaults_fill_empty_results() {
        assert_eq!(
            aggregate(vec![], Some(Aggregator::SingleOrDefault), &Value::Int(0)).unwrap(),
            Value::Int(0)
        );
        assert_eq!(
            aggregate(vec![], Some(Aggregator::FirstOrDefault), &Value::Null).unwrap(),
            Value::Null
        );
        assert_eq!(
            aggregate(vec![Value::Int(3), Value::Int(4)], Some(Aggregator::First), &Value::Null).unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn lists_keep_every_row() {
        assert_eq!(
            aggregate(vec![Value::Int(3), Value::Int(4)], None, &Value::Null).unwrap(),
            Value::List(vec![Value::Int(3), Value::Int(4)])
        );
    }
}
