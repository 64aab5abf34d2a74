//! Binding host query operators to relational IR.
//!
//! Every sequence operator produces a `Projection` whose select reads the select
//! of its source. Lambda parameters are bound by value: a lambda body sees the
//! outer bindings plus its own parameters, and the map is restored afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use query_engine_metadata::metadata::{MappedEntity, ScalarType};
use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::checks;
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::types::Type;
use query_engine_sql::sql::value::Value;

use super::construct::constructed_member;
use crate::translation::aliasing;
use crate::translation::column_projector::{project_columns, project_columns_nominating};
use crate::translation::error::Error;
use crate::translation::helpers::{Env, State};

/// Bind a whole host query tree.
pub fn bind(env: &Env, state: &mut State, expression: &ExprRef) -> Result<ExprRef, Error> {
    let mut binder = QueryBinder::new(*env, state, Some(expression.clone()));
    binder.bind(expression)
}

/// Apply a one-parameter operation lambda to an already bound sequence.
pub fn apply_operation(
    env: &Env,
    state: &mut State,
    source: &ExprRef,
    operation: &ExprRef,
) -> Result<ExprRef, Error> {
    let mut binder = QueryBinder::new(*env, state, None);
    binder.bind_lambda(operation, "operation", 0, &[source.clone()])
}

#[derive(Debug, Clone)]
struct GroupByInfo {
    alias: TableAlias,
    element: ExprRef,
}

/// A bound sequence: the projection node and its parts.
pub(super) struct Sequence {
    pub expression: ExprRef,
    pub select: Arc<Select>,
    pub projector: ExprRef,
}

pub struct QueryBinder<'a, 's> {
    pub(super) env: Env<'a>,
    pub(super) state: &'s mut State,
    map: BTreeMap<String, ExprRef>,
    // keyed by the identity of the element projection; the Arcs are kept alive here
    group_by_map: Vec<(ExprRef, GroupByInfo)>,
    then_bys: Option<Vec<(Ordering, ExprRef)>>,
    root: Option<ExprRef>,
}

/// The required and maximum argument counts of an operator.
fn arity(operator: QueryOperator) -> (usize, usize) {
    match operator {
        QueryOperator::Distinct => (1, 1),
        QueryOperator::Where
        | QueryOperator::Select
        | QueryOperator::OrderBy
        | QueryOperator::OrderByDescending
        | QueryOperator::ThenBy
        | QueryOperator::ThenByDescending
        | QueryOperator::Take
        | QueryOperator::Skip
        | QueryOperator::All
        | QueryOperator::Contains
        | QueryOperator::DeleteWhere => (2, 2),
        QueryOperator::First
        | QueryOperator::FirstOrDefault
        | QueryOperator::Single
        | QueryOperator::SingleOrDefault
        | QueryOperator::Any
        | QueryOperator::Count
        | QueryOperator::Sum
        | QueryOperator::Min
        | QueryOperator::Max
        | QueryOperator::Average => (1, 2),
        QueryOperator::SelectMany | QueryOperator::GroupBy => (2, 3),
        QueryOperator::Insert => (2, 3),
        QueryOperator::Update | QueryOperator::InsertOrUpdate => (2, 4),
        QueryOperator::Delete => (2, 3),
        QueryOperator::Join | QueryOperator::Batch => (5, 5),
    }
}

/// Operator arguments, with omitted optional arguments read as `None`.
pub(super) struct Arguments<'e> {
    arguments: &'e [ExprRef],
}

impl Arguments<'_> {
    pub fn required(&self, index: usize) -> &ExprRef {
        &self.arguments[index]
    }

    pub fn optional(&self, index: usize) -> Option<&ExprRef> {
        self.arguments
            .get(index)
            .filter(|argument| !helpers::is_absent(argument))
    }
}

impl<'a, 's> QueryBinder<'a, 's> {
    fn new(env: Env<'a>, state: &'s mut State, root: Option<ExprRef>) -> Self {
        QueryBinder {
            env,
            state,
            map: BTreeMap::new(),
            group_by_map: vec![],
            then_bys: None,
            root,
        }
    }

    fn is_root(&self, expression: &ExprRef) -> bool {
        self.root
            .as_ref()
            .is_some_and(|root| Arc::ptr_eq(root, expression))
    }

    pub(super) fn bind(&mut self, expression: &ExprRef) -> Result<ExprRef, Error> {
        match &**expression {
            Expression::Call {
                operator,
                arguments,
                ..
            } => self.bind_call(expression, *operator, arguments),
            Expression::EntitySet { entity, .. } => {
                let entity = self.env.lookup_entity(entity)?;
                super::get_query_expression(self.state, entity)
            }
            Expression::Parameter(parameter) => Ok(self
                .map
                .get(&parameter.name)
                .cloned()
                .unwrap_or_else(|| expression.clone())),
            Expression::Member {
                expression: inner,
                member,
                ..
            } => {
                let source = self.bind(inner)?;
                self.bind_member(&source, member)
            }
            Expression::Binary {
                operator,
                left,
                right,
                r#type,
            } => {
                let left = self.bind(left)?;
                let right = self.bind(right)?;
                self.bind_binary(*operator, left, right, r#type)
            }
            Expression::Unary {
                operator,
                operand,
                r#type,
            } => Ok(Arc::new(Expression::Unary {
                operator: *operator,
                operand: self.bind(operand)?,
                r#type: r#type.clone(),
            })),
            Expression::Conditional {
                test,
                if_true,
                if_false,
                r#type,
            } => Ok(Arc::new(Expression::Conditional {
                test: self.bind(test)?,
                if_true: self.bind(if_true)?,
                if_false: self.bind(if_false)?,
                r#type: r#type.clone(),
            })),
            Expression::Construct {
                type_name,
                constructor,
                arguments,
                bindings,
            } => Ok(Arc::new(Expression::Construct {
                type_name: type_name.clone(),
                constructor: *constructor,
                arguments: self.bind_members(arguments)?,
                bindings: self.bind_members(bindings)?,
            })),
            Expression::Function {
                function,
                arguments,
                r#type,
            } => Ok(Arc::new(Expression::Function {
                function: *function,
                arguments: arguments
                    .iter()
                    .map(|argument| self.bind(argument))
                    .collect::<Result<_, _>>()?,
                r#type: r#type.clone(),
            })),
            _ => Ok(expression.clone()),
        }
    }

    fn bind_members(&mut self, bindings: &[MemberBinding]) -> Result<Vec<MemberBinding>, Error> {
        bindings
            .iter()
            .map(|binding| {
                Ok(MemberBinding {
                    member: binding.member.clone(),
                    expression: self.bind(&binding.expression)?,
                })
            })
            .collect()
    }

    /// Bind the body of `lambda` with its parameters mapped to `values`.
    pub(super) fn bind_lambda(
        &mut self,
        lambda: &ExprRef,
        operator: &str,
        index: usize,
        values: &[ExprRef],
    ) -> Result<ExprRef, Error> {
        let Expression::Lambda { parameters, body } = &**lambda else {
            return Err(Error::LambdaExpected {
                operator: operator.to_string(),
                index,
                arity: values.len(),
            });
        };
        if parameters.len() != values.len() {
            return Err(Error::LambdaExpected {
                operator: operator.to_string(),
                index,
                arity: values.len(),
            });
        }
        let saved = self.map.clone();
        for (parameter, value) in parameters.iter().zip(values) {
            self.map.insert(parameter.name.clone(), value.clone());
        }
        let result = self.bind(body);
        self.map = saved;
        result
    }

    /// Bind a lambda whose parameters stay unbound host parameters.
    pub(super) fn bind_open_lambda(&mut self, lambda: &ExprRef, operator: &str) -> Result<ExprRef, Error> {
        let Expression::Lambda { parameters, body } = &**lambda else {
            return Err(Error::LambdaExpected {
                operator: operator.to_string(),
                index: 0,
                arity: 1,
            });
        };
        let saved = self.map.clone();
        for parameter in parameters {
            self.map.remove(&parameter.name);
        }
        let result = self.bind(body);
        self.map = saved;
        Ok(Arc::new(Expression::Lambda {
            parameters: parameters.clone(),
            body: result?,
        }))
    }

    pub(super) fn visit_sequence(&mut self, source: &ExprRef) -> Result<Sequence, Error> {
        let bound = self.bind(source)?;
        as_sequence(&bound)
    }

    fn bind_call(
        &mut self,
        call: &ExprRef,
        operator: QueryOperator,
        arguments: &[ExprRef],
    ) -> Result<ExprRef, Error> {
        let name = format!("{operator:?}");
        let (required, maximum) = arity(operator);
        if arguments.len() < required || arguments.len() > maximum {
            return Err(Error::ArgumentCount {
                operator: name,
                expected: maximum,
            });
        }
        let is_root = self.is_root(call);
        let args = Arguments { arguments };

        match operator {
            QueryOperator::Where => self.bind_where(args.required(0), args.required(1), &name),
            QueryOperator::Select => self.bind_select(args.required(0), args.required(1), &name),
            QueryOperator::SelectMany => self.bind_select_many(
                args.required(0),
                args.required(1),
                args.optional(2),
                &name,
            ),
            QueryOperator::Join => self.bind_join(arguments, &name),
            QueryOperator::GroupBy => {
                self.bind_group_by(args.required(0), args.required(1), args.optional(2), &name)
            }
            QueryOperator::OrderBy => {
                self.bind_order_by(args.required(0), args.required(1), Ordering::Ascending, &name)
            }
            QueryOperator::OrderByDescending => {
                self.bind_order_by(args.required(0), args.required(1), Ordering::Descending, &name)
            }
            QueryOperator::ThenBy => {
                self.bind_then_by(args.required(0), args.required(1), Ordering::Ascending)
            }
            QueryOperator::ThenByDescending => {
                self.bind_then_by(args.required(0), args.required(1), Ordering::Descending)
            }
            QueryOperator::Take => self.bind_limit(args.required(0), args.required(1), true),
            QueryOperator::Skip => self.bind_limit(args.required(0), args.required(1), false),
            QueryOperator::Distinct => self.bind_distinct(args.required(0)),
            QueryOperator::First
            | QueryOperator::FirstOrDefault
            | QueryOperator::Single
            | QueryOperator::SingleOrDefault => {
                self.bind_first(args.required(0), args.optional(1), operator, is_root, &name)
            }
            QueryOperator::Any => self.bind_any_all(args.required(0), args.optional(1), false, is_root, &name),
            QueryOperator::All => {
                self.bind_any_all(args.required(0), Some(args.required(1)), true, is_root, &name)
            }
            QueryOperator::Contains => {
                self.bind_contains(args.required(0), args.required(1), is_root)
            }
            QueryOperator::Count
            | QueryOperator::Sum
            | QueryOperator::Min
            | QueryOperator::Max
            | QueryOperator::Average => {
                self.bind_aggregate(args.required(0), operator, args.optional(1), is_root, &name)
            }
            QueryOperator::Insert
            | QueryOperator::Update
            | QueryOperator::InsertOrUpdate
            | QueryOperator::Delete
            | QueryOperator::DeleteWhere
            | QueryOperator::Batch => self.bind_command(operator, &args, &name),
        }
    }

    fn next_projection(
        &mut self,
        source: &Sequence,
        projector: &ExprRef,
        nominate: bool,
    ) -> (Select, ExprRef) {
        let alias = self.state.next_alias();
        let projected = if nominate {
            project_columns_nominating(projector, alias, &[source.select.alias])
        } else {
            project_columns(projector, alias, &[source.select.alias])
        };
        (
            Select::new(alias, projected.columns, Some(select_source(&source.select))),
            projected.projector,
        )
    }

    fn bind_where(&mut self, source: &ExprRef, predicate: &ExprRef, name: &str) -> Result<ExprRef, Error> {
        let sequence = self.visit_sequence(source)?;
        let where_ = self.bind_lambda(predicate, name, 1, &[sequence.projector.clone()])?;
        let (select, projector) = self.next_projection(&sequence, &sequence.projector, false);
        Ok(helpers::projection(
            Select {
                where_: Some(where_),
                ..select
            },
            projector,
            None,
        ))
    }

    fn bind_select(&mut self, source: &ExprRef, selector: &ExprRef, name: &str) -> Result<ExprRef, Error> {
        let sequence = self.visit_sequence(source)?;
        let selection = self.bind_lambda(selector, name, 1, &[sequence.projector.clone()])?;
        let (select, projector) = self.next_projection(&sequence, &selection, true);
        Ok(helpers::projection(select, projector, None))
    }

    fn bind_select_many(
        &mut self,
        source: &ExprRef,
        collection: &ExprRef,
        result: Option<&ExprRef>,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let sequence = self.visit_sequence(source)?;
        let bound = self.bind_lambda(collection, name, 1, &[sequence.projector.clone()])?;
        let inner = as_sequence(&bound)?;
        let correlated =
            checks::references_outside(&Expression::Select(inner.select.clone()), &BTreeSet::new());
        let kind = if correlated {
            JoinKind::CrossApply
        } else {
            JoinKind::Cross
        };
        let join = Arc::new(Expression::Join {
            kind,
            left: select_source(&sequence.select),
            right: select_source(&inner.select),
            condition: None,
        });
        let selection = match result {
            Some(result) => self.bind_lambda(
                result,
                name,
                2,
                &[sequence.projector.clone(), inner.projector.clone()],
            )?,
            None => inner.projector.clone(),
        };
        let alias = self.state.next_alias();
        let projected = project_columns_nominating(
            &selection,
            alias,
            &[sequence.select.alias, inner.select.alias],
        );
        Ok(helpers::projection(
            Select::new(alias, projected.columns, Some(join)),
            projected.projector,
            None,
        ))
    }

    fn bind_join(&mut self, arguments: &[ExprRef], name: &str) -> Result<ExprRef, Error> {
        let outer = self.visit_sequence(&arguments[0])?;
        let inner = self.visit_sequence(&arguments[1])?;
        let outer_key = self.bind_lambda(&arguments[2], name, 2, &[outer.projector.clone()])?;
        let inner_key = self.bind_lambda(&arguments[3], name, 3, &[inner.projector.clone()])?;
        let selection = self.bind_lambda(
            &arguments[4],
            name,
            4,
            &[outer.projector.clone(), inner.projector.clone()],
        )?;
        let condition = self.bind_binary(
            BinaryOperator::Equal,
            outer_key,
            inner_key,
            &Type::Scalar(ScalarType::Boolean),
        )?;
        let join = Arc::new(Expression::Join {
            kind: JoinKind::Inner,
            left: select_source(&outer.select),
            right: select_source(&inner.select),
            condition: Some(condition),
        });
        let alias = self.state.next_alias();
        let projected =
            project_columns_nominating(&selection, alias, &[outer.select.alias, inner.select.alias]);
        Ok(helpers::projection(
            Select::new(alias, projected.columns, Some(join)),
            projected.projector,
            None,
        ))
    }

    fn bind_order_by(
        &mut self,
        source: &ExprRef,
        key: &ExprRef,
        ordering: Ordering,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let then_bys = self.then_bys.take();
        let sequence = self.visit_sequence(source)?;

        let mut order_by = vec![];
        let bound = self.bind_lambda(key, name, 1, &[sequence.projector.clone()])?;
        push_orderings(&mut order_by, ordering, &bound);
        // then-bys were gathered outermost first
        for (ordering, key) in then_bys.iter().flatten().rev() {
            let bound = self.bind_lambda(key, name, 1, &[sequence.projector.clone()])?;
            push_orderings(&mut order_by, *ordering, &bound);
        }

        let (select, projector) = self.next_projection(&sequence, &sequence.projector, false);
        Ok(helpers::projection(
            Select { order_by, ..select },
            projector,
            None,
        ))
    }

    fn bind_then_by(&mut self, source: &ExprRef, key: &ExprRef, ordering: Ordering) -> Result<ExprRef, Error> {
        self.then_bys
            .get_or_insert_with(Vec::new)
            .push((ordering, key.clone()));
        self.bind(source)
    }

    fn bind_limit(&mut self, source: &ExprRef, count: &ExprRef, take: bool) -> Result<ExprRef, Error> {
        let sequence = self.visit_sequence(source)?;
        let count = self.bind(count)?;
        let (select, projector) = self.next_projection(&sequence, &sequence.projector, false);
        let select = if take {
            Select {
                take: Some(count),
                ..select
            }
        } else {
            Select {
                skip: Some(count),
                ..select
            }
        };
        Ok(helpers::projection(select, projector, None))
    }

    fn bind_distinct(&mut self, source: &ExprRef) -> Result<ExprRef, Error> {
        let sequence = self.visit_sequence(source)?;
        let (select, projector) = self.next_projection(&sequence, &sequence.projector, false);
        Ok(helpers::projection(
            Select {
                distinct: true,
                ..select
            },
            projector,
            None,
        ))
    }

    fn bind_first(
        &mut self,
        source: &ExprRef,
        predicate: Option<&ExprRef>,
        operator: QueryOperator,
        is_root: bool,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let sequence = self.visit_sequence(source)?;
        let where_ = match predicate {
            Some(predicate) => Some(self.bind_lambda(predicate, name, 1, &[sequence.projector.clone()])?),
            None => None,
        };
        let (aggregator, limit) = match operator {
            QueryOperator::First => (Aggregator::First, 1),
            QueryOperator::FirstOrDefault => (Aggregator::FirstOrDefault, 1),
            // a second row at the top level proves the sequence is not single
            QueryOperator::Single => (Aggregator::Single, if is_root { 2 } else { 1 }),
            _ => (Aggregator::SingleOrDefault, if is_root { 2 } else { 1 }),
        };
        let (select, projector) = self.next_projection(&sequence, &sequence.projector, false);
        Ok(helpers::projection(
            Select {
                where_,
                take: Some(helpers::constant(limit)),
                ..select
            },
            projector,
            Some(aggregator),
        ))
    }

    fn bind_any_all(
        &mut self,
        source: &ExprRef,
        predicate: Option<&ExprRef>,
        is_all: bool,
        is_root: bool,
        name: &str,
    ) -> Result<ExprRef, Error> {
        if let Expression::Constant {
            value: Value::List(items),
            ..
        } = &**source
        {
            return self.bind_any_all_over_values(items, predicate, is_all, name);
        }

        let sequence = match predicate {
            Some(predicate) => {
                let predicate = if is_all {
                    negate_lambda(predicate, name)?
                } else {
                    predicate.clone()
                };
                self.visit_sequence(&helpers::where_(source.clone(), predicate))?
            }
            None => self.visit_sequence(source)?,
        };
        let exists = Arc::new(Expression::Exists(sequence.select));
        let result = if is_all { helpers::not(exists) } else { exists };
        if is_root {
            return Ok(self.singleton_value(result));
        }
        Ok(result)
    }

    fn bind_any_all_over_values(
        &mut self,
        items: &[Value],
        predicate: Option<&ExprRef>,
        is_all: bool,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let Some(predicate) = predicate else {
            return Ok(helpers::constant(!items.is_empty()));
        };
        let mut tests = vec![];
        for item in items {
            tests.push(self.bind_lambda(predicate, name, 1, &[helpers::constant(item.clone())])?);
        }
        let combine = if is_all { helpers::and } else { helpers::or };
        Ok(tests
            .into_iter()
            .reduce(combine)
            .unwrap_or_else(|| helpers::constant(is_all)))
    }

    fn bind_contains(&mut self, source: &ExprRef, value: &ExprRef, is_root: bool) -> Result<ExprRef, Error> {
        let bound = self.bind(source)?;
        let value = self.bind(value)?;
        let result = match &*bound {
            Expression::Constant {
                value: Value::List(items),
                ..
            } => Arc::new(Expression::In {
                expression: value,
                source: InSource::Values(items.iter().cloned().map(helpers::constant).collect()),
            }),
            Expression::Argument { name, .. } => {
                return Err(Error::NotSupported(format!(
                    "Contains over the argument list '{name}'"
                )));
            }
            _ => {
                let sequence = as_sequence(&bound)?;
                let alias = self.state.next_alias();
                let select = Select::new(
                    alias,
                    vec![helpers::column_declaration("value", sequence.projector.clone())],
                    Some(select_source(&sequence.select)),
                );
                Arc::new(Expression::In {
                    expression: value,
                    source: InSource::Select(Arc::new(select)),
                })
            }
        };
        if is_root {
            return Ok(self.singleton_value(result));
        }
        Ok(result)
    }

    /// A one-row projection computing `value` without a source.
    fn singleton_value(&mut self, value: ExprRef) -> ExprRef {
        let alias = self.state.next_alias();
        let declaration = helpers::column_declaration("value", value);
        let column = helpers::column_of(alias, &declaration);
        helpers::projection(
            Select::new(alias, vec![declaration], None),
            column,
            Some(Aggregator::SingleOrDefault),
        )
    }

    fn bind_aggregate(
        &mut self,
        source: &ExprRef,
        operator: QueryOperator,
        argument: Option<&ExprRef>,
        is_root: bool,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let function = match operator {
            QueryOperator::Count => AggregateFunction::Count,
            QueryOperator::Sum => AggregateFunction::Sum,
            QueryOperator::Min => AggregateFunction::Min,
            QueryOperator::Max => AggregateFunction::Max,
            _ => AggregateFunction::Average,
        };
        let predicate_argument = function == AggregateFunction::Count;

        let mut source = source.clone();
        let mut argument = argument.cloned();
        let mut distinct = false;
        if let Expression::Call {
            operator: QueryOperator::Distinct,
            arguments,
            ..
        } = &*source.clone()
        {
            if argument.is_none() && !predicate_argument && self.env.dialect.allows_distinct_in_aggregates()
            {
                if let Some(inner) = arguments.first() {
                    source = inner.clone();
                    distinct = true;
                }
            }
        }
        let mut argument_was_predicate = false;
        if predicate_argument {
            if let Some(predicate) = argument.take() {
                source = helpers::where_(source, predicate);
                argument_was_predicate = true;
            }
        }

        let sequence = self.visit_sequence(&source)?;
        let bound_argument = match &argument {
            Some(selector) => Some(self.bind_lambda(selector, name, 1, &[sequence.projector.clone()])?),
            None if !predicate_argument => Some(sequence.projector.clone()),
            None => None,
        };
        let r#type = aggregate_type(function, bound_argument.as_ref());
        let aggregate = Arc::new(Expression::Aggregate {
            function,
            argument: bound_argument,
            distinct,
            r#type: r#type.clone(),
        });
        let alias = self.state.next_alias();
        let select = Select::new(
            alias,
            vec![helpers::column_declaration("agg", aggregate)],
            Some(select_source(&sequence.select)),
        );

        if is_root {
            return Ok(helpers::projection(
                select,
                helpers::column(alias, "agg", r#type),
                Some(Aggregator::Single),
            ));
        }

        let subquery = Arc::new(Expression::Scalar {
            select: Arc::new(select),
            r#type: r#type.clone(),
        });
        if argument_was_predicate {
            return Ok(subquery);
        }
        let Some(info) = self
            .group_by_map
            .iter()
            .find(|(group, _)| Arc::ptr_eq(group, &sequence.expression))
            .map(|(_, info)| info.clone())
        else {
            return Ok(subquery);
        };
        // the same aggregate computed inside the grouping select
        let group_argument = match &argument {
            Some(selector) => Some(self.bind_lambda(selector, name, 1, &[info.element.clone()])?),
            None if !predicate_argument => Some(info.element.clone()),
            None => None,
        };
        Ok(Arc::new(Expression::AggregateSubquery {
            group_by_alias: info.alias,
            aggregate: Arc::new(Expression::Aggregate {
                function,
                argument: group_argument,
                distinct,
                r#type,
            }),
            subquery,
        }))
    }

    fn bind_group_by(
        &mut self,
        source: &ExprRef,
        key: &ExprRef,
        element: Option<&ExprRef>,
        name: &str,
    ) -> Result<ExprRef, Error> {
        let sequence = self.visit_sequence(source)?;
        let key_expression = self.bind_lambda(key, name, 1, &[sequence.projector.clone()])?;
        let element_expression = match element {
            Some(element) => self.bind_lambda(element, name, 2, &[sequence.projector.clone()])?,
            None => sequence.projector.clone(),
        };
        let key_projection = project_columns_nominating(
            &key_expression,
            sequence.select.alias,
            &[sequence.select.alias],
        );
        let group_expressions: Vec<ExprRef> = key_projection
            .columns
            .iter()
            .map(|column| column.expression.clone())
            .collect();

        // the elements of one group: a copy of the source correlated on the key
        let basis_select = aliasing::duplicate(&sequence.select, self.state);
        let basis_projector =
            aliasing::map_columns(&sequence.projector, basis_select.alias, sequence.select.alias);
        let sub_key = self.bind_lambda(key, name, 1, &[basis_projector.clone()])?;
        let sub_key_projection =
            project_columns_nominating(&sub_key, basis_select.alias, &[basis_select.alias]);
        let sub_group_expressions: Vec<ExprRef> = sub_key_projection
            .columns
            .iter()
            .map(|column| column.expression.clone())
            .collect();
        let correlation = nulls_equal(&sub_group_expressions, &group_expressions);
        let sub_element = match element {
            Some(element) => self.bind_lambda(element, name, 2, &[basis_projector.clone()])?,
            None => basis_projector,
        };
        let element_alias = self.state.next_alias();
        let element_projection = project_columns(&sub_element, element_alias, &[basis_select.alias]);
        let element_subquery = helpers::projection(
            Select {
                where_: correlation,
                ..Select::new(
                    element_alias,
                    element_projection.columns,
                    Some(select_source(&basis_select)),
                )
            },
            element_projection.projector,
            None,
        );

        let alias = self.state.next_alias();
        let info = GroupByInfo {
            alias,
            element: element_expression.clone(),
        };
        self.group_by_map
            .push((element_subquery.clone(), info.clone()));

        let grouping = Arc::new(Expression::Grouping {
            r#type: Type::Grouping {
                key: Box::new(key_expression.r#type()),
                element: Box::new(element_expression.r#type()),
            },
            key: key_expression,
            group: element_subquery,
        });
        let projected = project_columns(&grouping, alias, &[sequence.select.alias]);
        if let Expression::Grouping { group, .. } = &*projected.projector {
            self.group_by_map.push((group.clone(), info));
        }
        Ok(helpers::projection(
            Select {
                group_by: group_expressions,
                ..Select::new(alias, projected.columns, Some(select_source(&sequence.select)))
            },
            projected.projector,
            None,
        ))
    }

    pub(super) fn bind_member(&mut self, source: &ExprRef, member: &str) -> Result<ExprRef, Error> {
        match &**source {
            Expression::Entity { entity, .. } => {
                let entity = self.env.lookup_entity(entity)?;
                super::get_member_expression(&self.env, self.state, source, entity, member)
            }
            Expression::Construct { type_name, .. } => constructed_member(source, member)
                .cloned()
                .ok_or_else(|| Error::MemberNotResolved {
                    type_name: type_name.clone(),
                    member: member.to_string(),
                }),
            Expression::Grouping { key, .. } if member == "Key" => Ok(key.clone()),
            Expression::OuterJoined { test, expression } => {
                let inner = self.bind_member(expression, member)?;
                if matches!(&*inner, Expression::Column { .. }) {
                    Ok(inner)
                } else {
                    Ok(Arc::new(Expression::OuterJoined {
                        test: test.clone(),
                        expression: inner,
                    }))
                }
            }
            Expression::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => {
                let if_true = self.bind_member(if_true, member)?;
                let if_false = self.bind_member(if_false, member)?;
                Ok(Arc::new(Expression::Conditional {
                    test: test.clone(),
                    r#type: if_true.r#type(),
                    if_true,
                    if_false,
                }))
            }
            Expression::Constant { value, .. } => match value {
                Value::Object(object) => Ok(object
                    .fields
                    .get(member)
                    .cloned()
                    .map_or_else(helpers::null, helpers::constant)),
                Value::Null => Ok(helpers::null()),
                other => Err(Error::MemberNotResolved {
                    type_name: format!("{other:?}"),
                    member: member.to_string(),
                }),
            },
            Expression::Projection {
                select,
                projector,
                aggregator: Some(aggregator),
                deferred,
            } if aggregator.is_singleton() => {
                let bound = self.bind_member(projector, member)?;
                if is_plain_value(&bound) {
                    // one value of the single row
                    let alias = self.state.next_alias();
                    let r#type = Type::optional(bound.r#type());
                    let select = Select::new(
                        alias,
                        vec![helpers::column_declaration("value", bound)],
                        Some(select_source(select)),
                    );
                    Ok(Arc::new(Expression::Scalar {
                        select: Arc::new(select),
                        r#type,
                    }))
                } else {
                    Ok(Arc::new(Expression::Projection {
                        select: select.clone(),
                        projector: bound,
                        aggregator: Some(*aggregator),
                        deferred: *deferred,
                    }))
                }
            }
            Expression::Projection { .. } => Err(Error::NotSupported(format!(
                "member '{member}' of a sequence"
            ))),
            _ => Ok(Arc::new(Expression::Member {
                expression: source.clone(),
                member: member.to_string(),
                r#type: Type::Any,
            })),
        }
    }

    pub(super) fn bind_binary(
        &mut self,
        operator: BinaryOperator,
        left: ExprRef,
        right: ExprRef,
        r#type: &Type,
    ) -> Result<ExprRef, Error> {
        if matches!(operator, BinaryOperator::Equal | BinaryOperator::NotEqual) {
            let negate = operator == BinaryOperator::NotEqual;
            let finish = |test: ExprRef| if negate { helpers::not(test) } else { test };

            if helpers::is_null_constant(&right) || helpers::is_null_constant(&left) {
                let operand = if helpers::is_null_constant(&right) { &left } else { &right };
                return Ok(finish(self.null_test(operand)?));
            }
            if let Some(equality) = self.entity_equality(&left, &right)? {
                return Ok(finish(equality));
            }
            if let (Expression::Construct { .. }, Expression::Construct { .. }) = (&*left, &*right) {
                if let Some(equality) = self.member_wise_equality(&left, &right)? {
                    return Ok(finish(equality));
                }
            }
        }
        Ok(Arc::new(Expression::Binary {
            operator,
            left,
            right,
            r#type: r#type.clone(),
        }))
    }

    fn null_test(&mut self, operand: &ExprRef) -> Result<ExprRef, Error> {
        match &**operand {
            Expression::OuterJoined { test, .. } => Ok(Arc::new(Expression::IsNull(test.clone()))),
            Expression::Entity { entity, .. } => {
                let mapped = self.env.lookup_entity(entity)?;
                let key = super::primary_key_expressions(&self.env, self.state, operand, mapped)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::NoPrimaryKey(entity.clone()))?;
                Ok(Arc::new(Expression::IsNull(key)))
            }
            Expression::Projection {
                select,
                aggregator: Some(aggregator),
                ..
            } if aggregator.is_singleton() => Ok(helpers::not(Arc::new(Expression::Exists(
                select.clone(),
            )))),
            _ => Ok(Arc::new(Expression::IsNull(operand.clone()))),
        }
    }

    /// Entities compare by primary key.
    fn entity_equality(&mut self, left: &ExprRef, right: &ExprRef) -> Result<Option<ExprRef>, Error> {
        let entity_id = match (&**left, &**right) {
            (Expression::Entity { entity, .. }, _) | (_, Expression::Entity { entity, .. }) => {
                entity.clone()
            }
            _ => return Ok(None),
        };
        let entity = self.env.lookup_entity(&entity_id)?;
        let left_keys = self.key_values(left, entity)?;
        let right_keys = self.key_values(right, entity)?;
        Ok(helpers::and_all(
            left_keys
                .into_iter()
                .zip(right_keys)
                .map(|(left, right)| helpers::equal(left, right)),
        ))
    }

    fn key_values(
        &mut self,
        value: &ExprRef,
        entity: &MappedEntity,
    ) -> Result<Vec<ExprRef>, Error> {
        match &**value {
            Expression::Entity { .. } | Expression::Construct { .. } => {
                super::primary_key_expressions(&self.env, self.state, value, entity)
            }
            _ => entity
                .primary_key_members
                .iter()
                .map(|key| self.bind_member(value, key))
                .collect(),
        }
    }

    fn member_wise_equality(&mut self, left: &ExprRef, right: &ExprRef) -> Result<Option<ExprRef>, Error> {
        let Expression::Construct {
            arguments,
            bindings,
            ..
        } = &**left
        else {
            return Ok(None);
        };
        let mut equalities = vec![];
        for binding in arguments.iter().chain(bindings) {
            let Some(other) = constructed_member(right, &binding.member) else {
                return Ok(None);
            };
            equalities.push(self.bind_binary(
                BinaryOperator::Equal,
                binding.expression.clone(),
                other.clone(),
                &Type::Scalar(ScalarType::Boolean),
            )?);
        }
        Ok(helpers::and_all(equalities))
    }
}

pub(super) fn as_sequence(bound: &ExprRef) -> Result<Sequence, Error> {
    match &**bound {
        Expression::Projection {
            select, projector, ..
        } => Ok(Sequence {
            expression: bound.clone(),
            select: select.clone(),
            projector: projector.clone(),
        }),
        Expression::Grouping { group, .. } => as_sequence(group),
        Expression::ClientJoin { projection, .. } => as_sequence(projection),
        other => Err(Error::NotASequence(other.kind_name())),
    }
}

pub(super) fn select_source(select: &Arc<Select>) -> ExprRef {
    Arc::new(Expression::Select(select.clone()))
}

fn push_orderings(order_by: &mut Vec<OrderExpression>, ordering: Ordering, key: &ExprRef) {
    match &**key {
        Expression::Construct {
            arguments,
            bindings,
            ..
        } => {
            for binding in arguments.iter().chain(bindings) {
                push_orderings(order_by, ordering, &binding.expression);
            }
        }
        Expression::Entity { expression, .. } => push_orderings(order_by, ordering, expression),
        _ => order_by.push(OrderExpression {
            ordering,
            expression: key.clone(),
        }),
    }
}

fn negate_lambda(lambda: &ExprRef, name: &str) -> Result<ExprRef, Error> {
    match &**lambda {
        Expression::Lambda { parameters, body } => Ok(Arc::new(Expression::Lambda {
            parameters: parameters.clone(),
            body: helpers::not(body.clone()),
        })),
        _ => Err(Error::LambdaExpected {
            operator: name.to_string(),
            index: 1,
            arity: 1,
        }),
    }
}

/// Pairwise equality of group keys, treating two nulls as equal.
fn nulls_equal(left: &[ExprRef], right: &[ExprRef]) -> Option<ExprRef> {
    helpers::and_all(left.iter().zip(right).map(|(left, right)| {
        let equal = helpers::equal(left.clone(), right.clone());
        if matches!(left.r#type(), Type::Optional(_) | Type::Any) {
            helpers::or(
                helpers::and(
                    Arc::new(Expression::IsNull(left.clone())),
                    Arc::new(Expression::IsNull(right.clone())),
                ),
                equal,
            )
        } else {
            equal
        }
    }))
}

/// Whether a bound member is a value rather than an object or a query.
fn is_plain_value(expression: &Expression) -> bool {
    !matches!(
        expression,
        Expression::Projection { .. }
            | Expression::Entity { .. }
            | Expression::Construct { .. }
            | Expression::Grouping { .. }
            | Expression::OuterJoined { .. }
            | Expression::ClientJoin { .. }
    ) && !expression.r#type().is_sequence()
}

fn aggregate_type(function: AggregateFunction, argument: Option<&ExprRef>) -> Type {
    let argument_type = argument.map_or(Type::Any, |argument| argument.r#type());
    match function {
        AggregateFunction::Count => Type::Scalar(ScalarType::Integer),
        AggregateFunction::Sum => argument_type,
        AggregateFunction::Min | AggregateFunction::Max => Type::optional(argument_type),
        AggregateFunction::Average => match argument_type.scalar() {
            Some(ScalarType::Decimal) => Type::optional(Type::Scalar(ScalarType::Decimal)),
            _ => Type::optional(Type::Scalar(ScalarType::Double)),
        },
    }
}
