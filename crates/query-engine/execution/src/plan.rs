//! Query plans: the translated tree lowered to formatted commands, the projectors
//! that read their rows, and the order they run in.

use std::collections::BTreeSet;
use std::mem;
use std::sync::Arc;

use query_engine_metadata::metadata::EntityId;
use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::checks::declared_aliases;
use query_engine_sql::sql::convert;
use query_engine_sql::sql::dialect::Dialect;
use query_engine_sql::sql::diagnostics::Diagnostic;
use query_engine_sql::sql::evaluate::{is_host_evaluable, Arguments};
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::string::QueryCommand;
use query_engine_sql::sql::types::Type;
use query_engine_sql::sql::value::Value;
use query_engine_sql::sql::visitor::{walk, walk_visit, Rewriter, Visitor};
use query_engine_translation::translation;
use query_engine_translation::translation::helpers::Env;
use query_engine_translation::translation::parameterize::{
    client_parameters, parameterize, parameterize_outer,
};

use crate::error::Error;
use crate::execution::{ExecutionContext, RunState};
use crate::executor::Executor;
use crate::projector::{Projector, Read};

/// A plan ready to run, or the diagnostics explaining why it cannot.
///
/// Plans hold no state of their own and can be executed any number of times, from
/// any thread.
#[derive(Debug)]
pub struct QueryPlan {
    executable: Option<Executable>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug)]
struct Executable {
    root: Step,
    mode: Mode,
}

/// What the plan needs from the executor around its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Direct,
    /// Nested queries and lookups share one connection.
    Connected,
    /// Several commands that succeed or fail together.
    Transacted,
}

impl QueryPlan {
    fn failed(diagnostics: Vec<Diagnostic>) -> QueryPlan {
        QueryPlan {
            executable: None,
            diagnostics,
        }
    }

    pub fn is_executable(&self) -> bool {
        self.executable.is_some() && self.diagnostics.is_empty()
    }

    /// The text of every command the plan may send, in the order they first run.
    pub fn commands(&self) -> Vec<&QueryCommand> {
        let mut commands = vec![];
        if let Some(executable) = &self.executable {
            executable.root.collect_commands(&mut commands);
        }
        commands
    }

    /// Run the plan. A plan built with diagnostics fails without touching the
    /// executor.
    pub fn execute(&self, executor: &dyn Executor, arguments: &Arguments) -> Result<Value, Error> {
        if let Some(diagnostic) = self.diagnostics.first() {
            return Err(Error::OutstandingDiagnostics(diagnostic.message.clone()));
        }
        let Some(executable) = &self.executable else {
            return Err(Error::OutstandingDiagnostics(
                "The plan has no executable form".to_string(),
            ));
        };

        tracing::info_span!("Execute plan", mode = ?executable.mode).in_scope(|| {
            // the run must not leave results reading from a connection it releases
            let state = RunState::new(!executor.is_connected());
            let context = ExecutionContext::new(executor, arguments, &state);
            let mut run = || context.run_step(&executable.root);
            match executable.mode {
                Mode::Direct => run(),
                Mode::Connected => executor.do_connected(&mut run),
                Mode::Transacted => executor.do_transacted(&mut run),
            }
        })
    }
}

/// Where the value of a command parameter comes from.
#[derive(Debug)]
pub(crate) enum ParameterSource {
    Host(ExprRef),
    /// A variable read back by an earlier statement of the plan.
    Variable(String),
    /// A field of an enclosing row.
    Row { depth: usize, ordinal: usize },
}

/// A formatted command and the sources of its parameters, by name.
#[derive(Debug)]
pub(crate) struct Statement {
    pub(crate) command: QueryCommand,
    pub(crate) parameters: Vec<(String, ParameterSource)>,
}

#[derive(Debug)]
pub(crate) struct QueryStep {
    pub(crate) statement: Statement,
    pub(crate) reads: Vec<Read>,
    pub(crate) projector: Projector,
    pub(crate) aggregator: Option<Aggregator>,
    /// The result of an `OrDefault` aggregator over no rows.
    pub(crate) default: Value,
    pub(crate) entity: Option<EntityId>,
    /// Client-joined lookups built before the query runs.
    pub(crate) lookups: Vec<LookupStep>,
}

impl QueryStep {
    pub(crate) fn collect_queries<'p>(&'p self, into: &mut Vec<&'p QueryStep>) {
        for lookup in &self.lookups {
            lookup.query.collect_queries(into);
        }
        into.push(self);
        self.projector.collect_queries(into);
    }
}

/// A query whose rows yield `[key, element, test]`; rows with a null test are
/// skipped.
#[derive(Debug)]
pub(crate) struct LookupStep {
    pub(crate) slot: usize,
    pub(crate) query: QueryStep,
}

#[derive(Debug)]
pub(crate) enum Check {
    /// Compare the executor's rows-affected count with a constant.
    RowsAffected {
        operator: BinaryOperator,
        value: Value,
    },
    Query(QueryStep),
}

#[derive(Debug)]
pub(crate) enum Step {
    Value(ExprRef),
    Query(QueryStep),
    Command(Statement),
    /// Statements run one round trip each; the last one gives the result.
    Sequence(Vec<Step>),
    If {
        check: Check,
        if_true: Box<Step>,
        if_false: Option<Box<Step>>,
    },
    /// A query whose single row holds the values of the declared variables.
    Declare(QueryStep),
    Batch {
        input: Box<Step>,
        parameter: String,
        body: BatchBody,
    },
}

#[derive(Debug)]
pub(crate) enum BatchBody {
    /// One command sent with a parameter set per element.
    Command {
        statement: Statement,
        batch_size: usize,
        stream: bool,
    },
    PerElement(Box<Step>),
}

impl Step {
    fn collect_commands<'p>(&'p self, into: &mut Vec<&'p QueryCommand>) {
        let mut queries = vec![];
        match self {
            Step::Value(_) => {}
            Step::Query(query) | Step::Declare(query) => query.collect_queries(&mut queries),
            Step::Command(statement) => into.push(&statement.command),
            Step::Sequence(steps) => {
                for step in steps {
                    step.collect_commands(into);
                }
            }
            Step::If {
                check,
                if_true,
                if_false,
            } => {
                if let Check::Query(query) = check {
                    query.collect_queries(&mut queries);
                    into.extend(queries.drain(..).map(|query| &query.statement.command));
                }
                if_true.collect_commands(into);
                if let Some(if_false) = if_false {
                    if_false.collect_commands(into);
                }
            }
            Step::Batch { input, body, .. } => {
                input.collect_commands(into);
                match body {
                    BatchBody::Command { statement, .. } => into.push(&statement.command),
                    BatchBody::PerElement(step) => step.collect_commands(into),
                }
            }
        }
        into.extend(queries.into_iter().map(|query| &query.statement.command));
    }
}

/// Translate `expression` and lower it to a plan for `env.dialect`.
///
/// Translation errors and diagnostics are kept on the returned plan, which then
/// cannot be executed. Diagnostics raised while formatting leave the commands in
/// place, with placeholders for what the dialect cannot express.
pub fn build_plan(env: &Env, expression: &ExprRef) -> QueryPlan {
    let translated = match translation::translate(env, expression) {
        Ok(translated) => translated,
        Err(error) => {
            tracing::warn!("Translation failed: {error}");
            return QueryPlan::failed(vec![error.to_diagnostic()]);
        }
    };
    if !translated.diagnostics.is_empty() {
        return QueryPlan::failed(translated.diagnostics);
    }

    let mut builder = PlanBuilder::new(env.dialect, &translated.expression);
    let root = builder.step(&translated.expression);
    for diagnostic in &builder.diagnostics {
        tracing::warn!("{}", diagnostic.message);
    }

    let mode = match &*translated.expression {
        Expression::Block(_) | Expression::If { .. } | Expression::Batch { .. } => Mode::Transacted,
        _ if builder.nested => Mode::Connected,
        _ => Mode::Direct,
    };
    let plan = QueryPlan {
        executable: Some(Executable { root, mode }),
        diagnostics: builder.diagnostics,
    };
    tracing::info!(commands = plan.commands().len(), ?mode, "Built query plan");
    plan
}

/// The rows visible to a projector, innermost last: each enclosing query's alias
/// and the names of the columns it reads.
#[derive(Debug, Clone, Default)]
struct Scopes(Vec<(TableAlias, Vec<String>)>);

impl Scopes {
    fn pushed(&self, select: &Select) -> Scopes {
        let mut scopes = self.clone();
        scopes.0.push((
            select.alias,
            select.columns.iter().map(|column| column.name.clone()).collect(),
        ));
        scopes
    }

    fn aliases(&self) -> BTreeSet<TableAlias> {
        self.0.iter().map(|(alias, _)| *alias).collect()
    }

    /// The depth and ordinal of a column, searching outward.
    fn resolve(&self, alias: TableAlias, name: &str) -> Option<(usize, usize)> {
        self.0
            .iter()
            .rev()
            .enumerate()
            .find(|(_, (declared, _))| *declared == alias)
            .and_then(|(depth, (_, columns))| {
                columns
                    .iter()
                    .position(|column| column == name)
                    .map(|ordinal| (depth, ordinal))
            })
    }
}

struct PlanBuilder<'a> {
    dialect: &'a dyn Dialect,
    diagnostics: Vec<Diagnostic>,
    next_alias: u64,
    next_slot: usize,
    /// Lookups of the query being compiled.
    lookups: Vec<LookupStep>,
    /// Whether any projector runs queries of its own.
    nested: bool,
}

impl<'a> PlanBuilder<'a> {
    fn new(dialect: &'a dyn Dialect, expression: &Expression) -> Self {
        PlanBuilder {
            dialect,
            diagnostics: vec![],
            next_alias: declared_aliases(expression)
                .last()
                .map_or(0, |alias| alias.0 + 1),
            next_slot: 0,
            lookups: vec![],
            nested: false,
        }
    }

    fn fresh_alias(&mut self) -> TableAlias {
        let alias = TableAlias(self.next_alias);
        self.next_alias += 1;
        alias
    }

    fn step(&mut self, expression: &ExprRef) -> Step {
        match &**expression {
            Expression::Projection {
                select,
                projector,
                aggregator,
                ..
            } => Step::Query(self.query(
                expression,
                select,
                projector,
                *aggregator,
                &Scopes::default(),
                false,
            )),
            Expression::Block(_) | Expression::If { .. } if self.can_batch(expression) => {
                self.batched(expression)
            }
            Expression::Block(statements) => {
                Step::Sequence(statements.iter().map(|statement| self.step(statement)).collect())
            }
            Expression::If {
                check,
                if_true,
                if_false,
            } => Step::If {
                check: self.check(check),
                if_true: Box::new(self.step(if_true)),
                if_false: if_false.as_ref().map(|if_false| Box::new(self.step(if_false))),
            },
            Expression::Insert { .. } | Expression::Update { .. } | Expression::Delete { .. } => {
                Step::Command(self.statement(expression, &Scopes::default(), false))
            }
            Expression::Declaration { variables, source } => {
                Step::Declare(self.declaration(variables, source.as_ref()))
            }
            Expression::Batch {
                input,
                operation,
                batch_size,
                stream,
            } => self.batch(expression, input, operation, *batch_size, *stream),
            other if is_host_evaluable(other) => Step::Value(expression.clone()),
            other => {
                self.diagnostics.push(Diagnostic::unsupported(other.kind_name()));
                Step::Value(helpers::null())
            }
        }
    }

    /// Whether a block or conditional can go to the database as one batch.
    fn can_batch(&self, expression: &Expression) -> bool {
        if !self.dialect.allows_multiple_commands() {
            return false;
        }
        let census = Census::of(expression);
        census.projections.len() <= 1
            && census.client_joins == 0
            && census.batches == 0
            && (census.declarations == 0 || self.dialect.supports_variables())
    }

    fn batched(&mut self, expression: &ExprRef) -> Step {
        let census = Census::of(expression);
        match census.projections.first() {
            Some((select, projector, aggregator)) => Step::Query(self.query(
                expression,
                select,
                projector,
                *aggregator,
                &Scopes::default(),
                true,
            )),
            None => Step::Command(self.statement(expression, &Scopes::default(), true)),
        }
    }

    fn check(&mut self, check: &ExprRef) -> Check {
        if let Expression::Binary {
            operator,
            left,
            right,
            ..
        } = &**check
        {
            if let (true, Expression::Constant { value, .. }) =
                (self.dialect.is_rows_affected(left), &**right)
            {
                return Check::RowsAffected {
                    operator: *operator,
                    value: value.clone(),
                };
            }
        }
        let alias = self.fresh_alias();
        let declaration = helpers::column_declaration("value", check.clone());
        let projector = helpers::column_of(alias, &declaration);
        let select = Select::new(alias, vec![declaration], None);
        let statement = helpers::projection(select.clone(), projector.clone(), Some(Aggregator::Single));
        Check::Query(self.query(
            &statement,
            &select,
            &projector,
            Some(Aggregator::Single),
            &Scopes::default(),
            false,
        ))
    }

    fn declaration(
        &mut self,
        variables: &[VariableDeclaration],
        source: Option<&Arc<Select>>,
    ) -> QueryStep {
        let select = match source {
            Some(source) => (**source).clone(),
            None => Select::new(
                self.fresh_alias(),
                variables
                    .iter()
                    .map(|variable| helpers::column_declaration(&variable.name, variable.expression.clone()))
                    .collect(),
                None,
            ),
        };
        let projector = helpers::construct(
            "Variables",
            variables
                .iter()
                .map(|variable| {
                    (
                        variable.name.as_str(),
                        helpers::column(select.alias, &variable.name, variable.r#type.clone()),
                    )
                })
                .collect(),
        );
        let statement = helpers::projection(select.clone(), projector.clone(), Some(Aggregator::Single));
        self.query(
            &statement,
            &select,
            &projector,
            Some(Aggregator::Single),
            &Scopes::default(),
            false,
        )
    }

    fn batch(
        &mut self,
        expression: &ExprRef,
        input: &ExprRef,
        operation: &ExprRef,
        batch_size: usize,
        stream: bool,
    ) -> Step {
        let (parameter, body) = match &**operation {
            Expression::Lambda { parameters, body } if parameters.len() == 1 => {
                (parameters[0].name.clone(), body)
            }
            _ => {
                self.diagnostics.push(Diagnostic::unsupported(expression.kind_name()));
                return Step::Value(helpers::null());
            }
        };
        let body = match &**body {
            Expression::Insert { .. } | Expression::Update { .. } | Expression::Delete { .. } => {
                BatchBody::Command {
                    statement: self.statement(body, &Scopes::default(), false),
                    batch_size,
                    stream,
                }
            }
            _ => BatchBody::PerElement(Box::new(self.step(body))),
        };
        Step::Batch {
            input: Box::new(self.step(input)),
            parameter,
            body,
        }
    }

    /// Compile a query: format `statement` and the projector reading the rows of
    /// `select`, which `statement` returns.
    fn query(
        &mut self,
        statement: &ExprRef,
        select: &Select,
        projector: &ExprRef,
        aggregator: Option<Aggregator>,
        outer: &Scopes,
        keep_variables: bool,
    ) -> QueryStep {
        let enclosing = mem::take(&mut self.lookups);
        let formatted = self.statement(statement, outer, keep_variables);
        let compiled = self.projector(projector, &outer.pushed(select));
        let lookups = mem::replace(&mut self.lookups, enclosing);
        QueryStep {
            statement: formatted,
            reads: reads_of(select),
            projector: compiled,
            aggregator,
            default: projector.r#type().default_value(),
            entity: entity_of(select),
            lookups,
        }
    }

    /// Parameterize and format one statement.
    ///
    /// Columns of the `outer` rows become parameters read from those rows. Unless
    /// the statement runs in one batch with its declarations, variables become
    /// parameters holding the values read back earlier.
    fn statement(&mut self, statement: &ExprRef, outer: &Scopes, keep_variables: bool) -> Statement {
        let outer_aliases = outer.aliases();
        let mut statement = if outer_aliases.is_empty() {
            statement.clone()
        } else {
            parameterize_outer(statement, &outer_aliases)
        };
        if !keep_variables {
            statement = VariableReads.rewrite(&statement);
        }
        let statement = parameterize(&statement);
        let formatted = convert::format(&statement, self.dialect);
        tracing::debug!(
            dialect = self.dialect.name(),
            sql = %formatted.command.text,
            "Formatted statement"
        );
        self.diagnostics.extend(formatted.diagnostics);

        let parameters = client_parameters(&statement)
            .into_iter()
            .map(|(name, value)| {
                let source = self.parameter_source(&value, outer);
                (name, source)
            })
            .collect();
        Statement {
            command: formatted.command,
            parameters,
        }
    }

    fn parameter_source(&mut self, value: &ExprRef, outer: &Scopes) -> ParameterSource {
        match &**value {
            Expression::Column { alias, name, .. } => match outer.resolve(*alias, name) {
                Some((depth, ordinal)) => ParameterSource::Row { depth, ordinal },
                None => {
                    self.diagnostics.push(unread_column(*alias, name));
                    ParameterSource::Host(helpers::null())
                }
            },
            Expression::Variable { name, .. } => ParameterSource::Variable(name.clone()),
            _ => ParameterSource::Host(value.clone()),
        }
    }

    fn projector(&mut self, expression: &ExprRef, scopes: &Scopes) -> Projector {
        match &**expression {
            Expression::Column {
                alias,
                name,
                r#type,
                ..
            } => self.column(*alias, name, scopes, non_optional_default(r#type)),
            Expression::Entity { expression, .. } => self.projector(expression, scopes),
            Expression::Construct {
                type_name,
                arguments,
                bindings,
                ..
            } => Projector::Construct {
                type_name: type_name.clone(),
                members: arguments
                    .iter()
                    .chain(bindings)
                    .map(|binding| (binding.member.clone(), self.projector(&binding.expression, scopes)))
                    .collect(),
            },
            Expression::OuterJoined { test, expression } => Projector::OuterJoined {
                test: Box::new(self.test(test, scopes)),
                expression: Box::new(self.projector(expression, scopes)),
                default: expression.r#type().default_value(),
            },
            Expression::Projection {
                select,
                projector,
                aggregator,
                deferred,
            } => {
                self.nested = true;
                if *deferred && Census::of(projector).runs_queries() {
                    self.diagnostics.push(Diagnostic::new(
                        "A deferred projection cannot contain queries of its own",
                    ));
                }
                let step = Arc::new(self.query(expression, select, projector, *aggregator, scopes, false));
                if *deferred {
                    Projector::Deferred(step)
                } else {
                    Projector::Nested(step)
                }
            }
            Expression::ClientJoin {
                outer_key,
                inner_key,
                projection,
            } => self.client_join(outer_key, inner_key, projection, scopes),
            other if is_host_evaluable(other) => Projector::Host(expression.clone()),
            Expression::Binary {
                operator,
                left,
                right,
                ..
            } => Projector::Binary {
                operator: *operator,
                left: Box::new(self.projector(left, scopes)),
                right: Box::new(self.projector(right, scopes)),
            },
            Expression::Unary {
                operator,
                operand,
                r#type,
            } => Projector::Unary {
                operator: *operator,
                operand: Box::new(self.projector(operand, scopes)),
                r#type: r#type.clone(),
            },
            Expression::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => Projector::Conditional {
                test: Box::new(self.projector(test, scopes)),
                if_true: Box::new(self.projector(if_true, scopes)),
                if_false: Box::new(self.projector(if_false, scopes)),
            },
            Expression::Function {
                function,
                arguments,
                ..
            } => Projector::Function {
                function: *function,
                arguments: arguments
                    .iter()
                    .map(|argument| self.projector(argument, scopes))
                    .collect(),
            },
            other => {
                self.diagnostics.push(Diagnostic::unsupported(other.kind_name()));
                Projector::Host(helpers::null())
            }
        }
    }

    /// An outer-join test: reads the raw field so that a missing row stays null.
    fn test(&mut self, test: &ExprRef, scopes: &Scopes) -> Projector {
        match &**test {
            Expression::Column { alias, name, .. } => self.column(*alias, name, scopes, None),
            _ => self.projector(test, scopes),
        }
    }

    fn column(&mut self, alias: TableAlias, name: &str, scopes: &Scopes, default: Option<Value>) -> Projector {
        match scopes.resolve(alias, name) {
            Some((depth, ordinal)) => Projector::Column {
                depth,
                ordinal,
                default,
            },
            None => {
                self.diagnostics.push(unread_column(alias, name));
                Projector::Host(helpers::null())
            }
        }
    }

    /// Compile the joined query into a lookup built before the enclosing query runs,
    /// and read the group matching the outer key.
    fn client_join(
        &mut self,
        outer_key: &[ExprRef],
        inner_key: &[ExprRef],
        projection: &ExprRef,
        scopes: &Scopes,
    ) -> Projector {
        let Expression::Projection {
            select,
            projector,
            aggregator,
            ..
        } = &**projection
        else {
            self.diagnostics.push(Diagnostic::unsupported(projection.kind_name()));
            return Projector::Host(helpers::null());
        };
        self.nested = true;
        let slot = self.next_slot;
        self.next_slot += 1;

        let enclosing = mem::take(&mut self.lookups);
        let statement = self.statement(projection, &Scopes::default(), false);
        let inner = Scopes::default().pushed(select);
        let key = Projector::List(inner_key.iter().map(|key| self.projector(key, &inner)).collect());
        let (element, test) = match &**projector {
            Expression::OuterJoined { test, expression } => {
                (self.projector(expression, &inner), self.test(test, &inner))
            }
            _ => (
                self.projector(projector, &inner),
                Projector::Host(helpers::true_expr()),
            ),
        };
        let lookups = mem::replace(&mut self.lookups, enclosing);
        self.lookups.push(LookupStep {
            slot,
            query: QueryStep {
                statement,
                reads: reads_of(select),
                projector: Projector::List(vec![key, element, test]),
                aggregator: None,
                default: Value::Null,
                entity: entity_of(select),
                lookups,
            },
        });

        Projector::Lookup {
            slot,
            keys: outer_key.iter().map(|key| self.projector(key, scopes)).collect(),
            aggregator: *aggregator,
            default: projector.r#type().default_value(),
        }
    }
}

fn unread_column(alias: TableAlias, name: &str) -> Diagnostic {
    Diagnostic::new(format!(
        "The column '{name}' of {alias:?} is not read by any enclosing query"
    ))
}

fn non_optional_default(r#type: &Type) -> Option<Value> {
    match r#type {
        Type::Scalar(_) => Some(r#type.default_value()),
        _ => None,
    }
}

fn reads_of(select: &Select) -> Vec<Read> {
    select
        .columns
        .iter()
        .map(|column| Read::of(&column.expression.r#type()))
        .collect()
}

/// The entity of the first mapped table a select reads.
fn entity_of(select: &Select) -> Option<EntityId> {
    fn find(source: &Expression) -> Option<EntityId> {
        match source {
            Expression::Table(table) => table.entity.clone(),
            Expression::Select(select) => select.from.as_deref().and_then(find),
            Expression::Join { left, right, .. } => find(left).or_else(|| find(right)),
            _ => None,
        }
    }
    select.from.as_deref().and_then(find)
}

/// Variables become parameters whose values are looked up when the plan runs.
struct VariableReads;

impl Rewriter for VariableReads {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Variable {
                name,
                r#type,
                query_type,
            } => Arc::new(Expression::ClientParameter {
                name: format!("v{name}"),
                r#type: r#type.clone(),
                query_type: query_type.clone(),
                value: expression.clone(),
            }),
            _ => walk(self, expression),
        }
    }
}

/// What a statement contains that decides how it can be sent.
#[derive(Default)]
struct Census {
    projections: Vec<(Arc<Select>, ExprRef, Option<Aggregator>)>,
    client_joins: usize,
    batches: usize,
    declarations: usize,
}

impl Census {
    fn of(expression: &Expression) -> Census {
        let mut census = Census::default();
        census.visit(expression);
        census
    }

    fn runs_queries(&self) -> bool {
        !self.projections.is_empty() || self.client_joins > 0
    }
}

impl Visitor for Census {
    fn visit(&mut self, expression: &Expression) {
        match expression {
            Expression::Projection {
                select,
                projector,
                aggregator,
                ..
            } => self
                .projections
                .push((select.clone(), projector.clone(), *aggregator)),
            Expression::ClientJoin { .. } => self.client_joins += 1,
            Expression::Batch { .. } => self.batches += 1,
            Expression::Declaration { .. } => self.declarations += 1,
            _ => {}
        }
        walk_visit(self, expression);
    }
}
