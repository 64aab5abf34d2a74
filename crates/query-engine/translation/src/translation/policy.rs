//! Which associations are loaded with their owner, and how.
//!
//! Included singleton associations are joined on the server; included plural ones
//! become client joins that fetch every element for all owners in one extra query.

use std::collections::BTreeSet;
use std::sync::Arc;

use query_engine_metadata::metadata::{EntityId, MemberMapping, Metadata};
use query_engine_sql::sql::ast::*;
use query_engine_sql::sql::checks;
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::visitor::{walk, Rewriter};

use super::aliasing::{duplicate, map_columns, map_select_columns};
use super::column_projector::ColumnProjector;
use super::error::Error;
use super::helpers::{Env, State};
use super::language::add_outer_join_test;
use super::mapping::get_member_expression;
use super::reduce;

/// An association loaded together with its owning entity.
#[derive(Debug, Clone, PartialEq)]
pub struct IncludeRule {
    pub entity: EntityId,
    pub member: String,
    /// Loaded on first enumeration instead of with the owner.
    pub deferred: bool,
    /// A one-parameter lambda applied to the association's query.
    pub operation: Option<ExprRef>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
    rules: Vec<IncludeRule>,
}

impl Policy {
    pub fn new() -> Self {
        Policy::default()
    }

    fn rule_mut(&mut self, entity: &EntityId, member: &str) -> &mut IncludeRule {
        let position = self
            .rules
            .iter()
            .position(|rule| rule.entity == *entity && rule.member == member);
        let index = match position {
            Some(index) => index,
            None => {
                self.rules.push(IncludeRule {
                    entity: entity.clone(),
                    member: member.to_string(),
                    deferred: false,
                    operation: None,
                });
                self.rules.len() - 1
            }
        };
        &mut self.rules[index]
    }

    pub fn include(&mut self, entity: &EntityId, member: &str) -> &mut Self {
        self.rule_mut(entity, member);
        self
    }

    pub fn include_deferred(&mut self, entity: &EntityId, member: &str) -> &mut Self {
        self.rule_mut(entity, member).deferred = true;
        self
    }

    /// Include an association and filter, order or page its query with `operation`.
    pub fn include_with(&mut self, entity: &EntityId, member: &str, operation: ExprRef) -> &mut Self {
        self.rule_mut(entity, member).operation = Some(operation);
        self
    }

    /// Include every association along a dotted path such as `Customer.Orders.Lines`.
    ///
    /// The first segment names an entity, each further segment an association of the
    /// entity reached so far.
    pub fn include_path(
        &mut self,
        metadata: &Metadata,
        path: &str,
        deferred: bool,
    ) -> Result<&mut Self, Error> {
        for (entity, member) in path_hops(metadata, path)? {
            self.include(&entity, member);
            if deferred {
                self.include_deferred(&entity, member);
            }
        }
        Ok(self)
    }

    /// Include a dotted path and load at most `count` elements of its last association.
    pub fn include_path_limited(
        &mut self,
        metadata: &Metadata,
        path: &str,
        deferred: bool,
        count: u32,
    ) -> Result<&mut Self, Error> {
        self.include_path(metadata, path, deferred)?;
        if let Some((entity, member)) = path_hops(metadata, path)?.pop() {
            let operation = helpers::lambda("elements", |elements| {
                helpers::take(elements, helpers::constant(i64::from(count)))
            });
            self.include_with(&entity, member, operation);
        }
        Ok(self)
    }

    pub fn is_included(&self, entity: &EntityId, member: &str) -> bool {
        self.rule(entity, member).is_some()
    }

    pub fn is_deferred(&self, entity: &EntityId, member: &str) -> bool {
        self.rule(entity, member).is_some_and(|rule| rule.deferred)
    }

    pub fn operation(&self, entity: &EntityId, member: &str) -> Option<&ExprRef> {
        self.rule(entity, member)
            .and_then(|rule| rule.operation.as_ref())
    }

    pub fn rules(&self) -> &[IncludeRule] {
        &self.rules
    }

    fn rule(&self, entity: &EntityId, member: &str) -> Option<&IncludeRule> {
        self.rules
            .iter()
            .find(|rule| rule.entity == *entity && rule.member == member)
    }
}

/// The `(entity, association)` hops named by a dotted include path.
fn path_hops<'p>(metadata: &Metadata, path: &'p str) -> Result<Vec<(EntityId, &'p str)>, Error> {
    let invalid = |reason: String| Error::InvalidIncludePath {
        path: path.to_string(),
        reason,
    };
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut entity = metadata
        .lookup_entity(&EntityId::new(first))
        .or_else(|_| {
            metadata
                .entities
                .values()
                .find(|entity| entity.type_name == first)
                .ok_or_else(|| invalid(format!("'{first}' is not a mapped entity")))
        })?;

    let mut hops = vec![];
    for segment in segments {
        let member = entity
            .member(segment)
            .ok_or_else(|| invalid(format!("'{}' has no member '{segment}'", entity.entity_id)))?;
        let MemberMapping::Association(association) = &member.mapping else {
            return Err(invalid(format!(
                "'{}.{segment}' is not an association",
                entity.entity_id
            )));
        };
        hops.push((entity.entity_id.clone(), segment));
        entity = metadata
            .lookup_entity(&association.related_entity)
            .map_err(|error| invalid(error.to_string()))?;
    }
    if hops.is_empty() {
        return Err(invalid("an association is required after the entity".to_string()));
    }
    Ok(hops)
}

/// Apply the policy to bound IR: include associations, then join singleton
/// projections on the server and plural ones on the client.
pub fn translate(env: &Env, state: &mut State, expression: &ExprRef) -> Result<ExprRef, Error> {
    let mut includer = Includer {
        env: *env,
        state,
        scope: BTreeSet::new(),
        error: None,
    };
    let mut expression = changed_then_reduce(expression, includer.rewrite(expression));
    if let Some(error) = includer.error {
        return Err(error);
    }

    let singletons = SingletonProjectionRewriter {
        state,
        current: None,
        top_level: true,
    }
    .rewrite(&expression);
    expression = changed_then_reduce(&expression, singletons);

    let client_joined = ClientJoinedProjectionRewriter {
        state,
        current: None,
        top_level: true,
        can_join_on_client: true,
        in_member: false,
    }
    .rewrite(&expression);
    Ok(changed_then_reduce(&expression, client_joined))
}

fn changed_then_reduce(before: &ExprRef, after: ExprRef) -> ExprRef {
    if Arc::ptr_eq(before, &after) {
        after
    } else {
        reduce::reduce(&after)
    }
}

/// Adds the included associations to every entity construction.
///
/// `scope` holds the associations being expanded on the current path, so a
/// self-referential mapping stops after one level.
struct Includer<'e, 's> {
    env: Env<'e>,
    state: &'s mut State,
    scope: BTreeSet<(EntityId, String)>,
    error: Option<Error>,
}

impl Includer<'_, '_> {
    fn include_members(&mut self, expression: &ExprRef, entity_id: &EntityId) -> Result<ExprRef, Error> {
        let entity = self.env.lookup_entity(entity_id)?;
        let policy = self.env.policy;
        let members: Vec<&IncludeRule> = policy
            .rules
            .iter()
            .filter(|rule| {
                rule.entity == *entity_id
                    && !self.scope.contains(&(rule.entity.clone(), rule.member.clone()))
            })
            .collect();
        if members.is_empty() {
            return Ok(walk(self, expression));
        }

        let mut included = expression.clone();
        let mut scope = self.scope.clone();
        for rule in members {
            let mut value = get_member_expression(&self.env, self.state, &included, entity, &rule.member)?;
            if rule.deferred {
                value = deferred(&value);
            }
            included = with_binding(&included, &rule.member, value);
            scope.insert((rule.entity.clone(), rule.member.clone()));
        }

        let saved = std::mem::replace(&mut self.scope, scope);
        let result = walk(self, &included);
        self.scope = saved;
        Ok(result)
    }
}

impl Rewriter for Includer<'_, '_> {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            _ if self.error.is_some() => expression.clone(),
            Expression::Entity { entity, .. } => {
                let entity = entity.clone();
                self.include_members(expression, &entity).unwrap_or_else(|error| {
                    self.error = Some(error);
                    expression.clone()
                })
            }
            _ => walk(self, expression),
        }
    }
}

fn deferred(expression: &ExprRef) -> ExprRef {
    match &**expression {
        Expression::Projection {
            select,
            projector,
            aggregator,
            ..
        } => Arc::new(Expression::Projection {
            select: select.clone(),
            projector: projector.clone(),
            aggregator: *aggregator,
            deferred: true,
        }),
        _ => expression.clone(),
    }
}

/// The entity with `member` bound to `value`, replacing any earlier binding.
fn with_binding(entity: &ExprRef, member: &str, value: ExprRef) -> ExprRef {
    match &**entity {
        Expression::Entity { entity, expression } => Arc::new(Expression::Entity {
            entity: entity.clone(),
            expression: with_binding(expression, member, value),
        }),
        Expression::Construct {
            type_name,
            constructor,
            arguments,
            bindings,
        } => {
            let mut bindings: Vec<MemberBinding> = bindings
                .iter()
                .filter(|binding| binding.member != member)
                .cloned()
                .collect();
            bindings.push(MemberBinding {
                member: member.to_string(),
                expression: value,
            });
            Arc::new(Expression::Construct {
                type_name: type_name.clone(),
                constructor: *constructor,
                arguments: arguments.clone(),
                bindings,
            })
        }
        _ => entity.clone(),
    }
}

fn can_join_on_server(select: &Select) -> bool {
    !select.distinct && select.group_by.is_empty() && !checks::has_aggregates(select)
}

/// Nested singleton projections become OUTER APPLY joins of the enclosing select.
struct SingletonProjectionRewriter<'s> {
    state: &'s mut State,
    current: Option<Select>,
    top_level: bool,
}

impl SingletonProjectionRewriter<'_> {
    fn rewrite_top_level(&mut self, expression: &ExprRef) -> ExprRef {
        let Expression::Projection {
            select,
            projector,
            aggregator,
            deferred,
        } = &**expression
        else {
            return walk(self, expression);
        };
        let saved_current = self.current.replace((**select).clone());
        self.top_level = false;
        let new_projector = self.rewrite(projector);
        let current = std::mem::replace(&mut self.current, saved_current);
        self.top_level = true;
        match current {
            Some(current) if current != **select || !Arc::ptr_eq(&new_projector, projector) => {
                Arc::new(Expression::Projection {
                    select: Arc::new(current),
                    projector: new_projector,
                    aggregator: *aggregator,
                    deferred: *deferred,
                })
            }
            _ => expression.clone(),
        }
    }

    /// Join the singleton `select` to the current select and return the projector
    /// reading the joined columns.
    fn join_singleton(&mut self, current: Select, select: &Arc<Select>, projector: &ExprRef) -> ExprRef {
        let outer_alias = current.alias;
        let inner_alias = self.state.next_alias();
        let (passed_through, inner, order_by) = add_redundant_select(current, inner_alias);
        let source = map_select_columns(select, inner_alias, outer_alias);
        let projector = map_columns(projector, inner_alias, outer_alias);
        let (tested, projector) = add_outer_join_test(&source, &projector);

        let mut columns =
            ColumnProjector::new(outer_alias, [inner_alias, tested.alias]).with_columns(passed_through);
        let projector = columns.project(&projector);
        let join = Arc::new(Expression::Join {
            kind: JoinKind::OuterApply,
            left: helpers::select_expression(inner),
            right: helpers::select_expression(tested),
            condition: None,
        });
        self.current = Some(Select {
            order_by,
            ..Select::new(outer_alias, columns.finish(), Some(join))
        });
        projector
    }
}

/// Move the contents of `select` into a select named `inner_alias`.
///
/// Returns the columns passing the inner ones through, the inner select, and the
/// orderings that move out of it. Orderings stay inside when a row limit depends
/// on them.
fn add_redundant_select(
    select: Select,
    inner_alias: TableAlias,
) -> (Vec<ColumnDeclaration>, Select, Vec<OrderExpression>) {
    let mut inner = Select {
        alias: inner_alias,
        ..select.clone()
    };
    let mut order_by = vec![];
    if inner.take.is_none() && inner.skip.is_none() {
        for ordering in std::mem::take(&mut inner.order_by) {
            let name = match inner.columns.iter().find(|c| c.expression == ordering.expression) {
                Some(existing) => existing.name.clone(),
                None => {
                    let name = inner.available_column_name("o");
                    inner
                        .columns
                        .push(helpers::column_declaration(&name, ordering.expression.clone()));
                    name
                }
            };
            let declaration = inner.column(&name).cloned();
            if let Some(declaration) = declaration {
                order_by.push(OrderExpression {
                    ordering: ordering.ordering,
                    expression: helpers::column_of(inner_alias, &declaration),
                });
            }
        }
    }
    let columns = select
        .columns
        .iter()
        .map(|column| ColumnDeclaration {
            name: column.name.clone(),
            expression: helpers::column_of(inner_alias, column),
            query_type: column.query_type.clone(),
        })
        .collect();
    (columns, inner, order_by)
}

impl Rewriter for SingletonProjectionRewriter<'_> {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Projection { .. } if self.top_level => self.rewrite_top_level(expression),
            Expression::Projection {
                select,
                projector,
                aggregator,
                deferred,
            } => {
                let joinable = aggregator.is_some_and(Aggregator::is_singleton)
                    && !*deferred
                    && self.current.as_ref().is_some_and(can_join_on_server);
                match self.current.take() {
                    Some(current) if joinable => {
                        let projector = self.join_singleton(current, select, projector);
                        self.rewrite(&projector)
                    }
                    saved => {
                        // a nested sequence is its own query
                        self.top_level = true;
                        let result = self.rewrite(expression);
                        self.top_level = false;
                        self.current = saved;
                        result
                    }
                }
            }
            Expression::ClientJoin { .. } => {
                let saved_top = std::mem::replace(&mut self.top_level, true);
                let saved = self.current.take();
                let result = walk(self, expression);
                self.top_level = saved_top;
                self.current = saved;
                result
            }
            _ => walk(self, expression),
        }
    }
}

/// Nested plural projections become client joins: one query of every element
/// with its owner's key, grouped in memory by the plan.
struct ClientJoinedProjectionRewriter<'s> {
    state: &'s mut State,
    current: Option<Arc<Select>>,
    top_level: bool,
    can_join_on_client: bool,
    in_member: bool,
}

impl ClientJoinedProjectionRewriter<'_> {
    fn can_join(&self, select: &Select, deferred: bool) -> bool {
        self.can_join_on_client
            && self.in_member
            && !deferred
            && can_join_on_server(select)
    }

    fn client_join(
        &mut self,
        outer: &Arc<Select>,
        select: &Arc<Select>,
        projector: &ExprRef,
        aggregator: Option<Aggregator>,
    ) -> Option<ExprRef> {
        let new_outer = duplicate(outer, self.state);
        let inner = map_select_columns(select, new_outer.alias, outer.alias);
        let (outer_keys, inner_keys) = equi_join_keys(inner.where_.as_ref()?, new_outer.alias)?;

        // inner keys become columns of the inner select
        let inner_from = inner
            .from
            .as_deref()
            .map(checks::source_aliases)
            .unwrap_or_default();
        let mut key_columns =
            ColumnProjector::new(inner.alias, inner_from).with_columns(inner.columns.clone());
        let inner_keys: Vec<ExprRef> = inner_keys.iter().map(|key| key_columns.project(key)).collect();
        let inner = Select {
            columns: key_columns.finish(),
            ..(*inner).clone()
        };

        let joined_alias = self.state.next_alias();
        let mut columns = ColumnProjector::new(joined_alias, [new_outer.alias, inner.alias]);
        let projector = columns.project(&map_columns(projector, new_outer.alias, outer.alias));
        let inner_keys: Vec<ExprRef> = inner_keys.iter().map(|key| columns.project(key)).collect();
        let outer_keys = outer_keys
            .iter()
            .map(|key| map_columns(key, outer.alias, new_outer.alias))
            .collect();

        let joined = Arc::new(Select {
            distinct: aggregator.is_some_and(Aggregator::is_singleton),
            ..Select::new(
                joined_alias,
                columns.finish(),
                Some(Arc::new(Expression::Join {
                    kind: JoinKind::CrossApply,
                    left: Arc::new(Expression::Select(new_outer)),
                    right: helpers::select_expression(inner),
                    condition: None,
                })),
            )
        });

        let saved = self.current.replace(joined.clone());
        let projector = self.rewrite(&projector);
        self.current = saved;

        Some(Arc::new(Expression::ClientJoin {
            outer_key: outer_keys,
            inner_key: inner_keys,
            projection: Arc::new(Expression::Projection {
                select: joined,
                projector,
                aggregator,
                deferred: false,
            }),
        }))
    }
}

/// The outer and inner key expressions of a conjunction of column equalities
/// against `outer_alias`.
fn equi_join_keys(predicate: &ExprRef, outer_alias: TableAlias) -> Option<(Vec<ExprRef>, Vec<ExprRef>)> {
    let mut outer = vec![];
    let mut inner = vec![];
    for conjunct in helpers::split_and(predicate) {
        if !checks::referenced_aliases(&conjunct).contains(&outer_alias) {
            continue;
        }
        let Expression::Binary {
            operator: BinaryOperator::Equal,
            left,
            right,
            ..
        } = &*conjunct
        else {
            return None;
        };
        match (&**left, &**right) {
            (Expression::Column { alias: l, .. }, Expression::Column { alias: r, .. }) if *l == outer_alias && *r != outer_alias => {
                outer.push(left.clone());
                inner.push(right.clone());
            }
            (Expression::Column { alias: l, .. }, Expression::Column { alias: r, .. }) if *r == outer_alias && *l != outer_alias => {
                outer.push(right.clone());
                inner.push(left.clone());
            }
            _ => return None,
        }
    }
    if outer.is_empty() {
        None
    } else {
        Some((outer, inner))
    }
}

impl Rewriter for ClientJoinedProjectionRewriter<'_> {
    fn rewrite(&mut self, expression: &ExprRef) -> ExprRef {
        match &**expression {
            Expression::Projection {
                select,
                projector,
                aggregator,
                deferred,
            } => {
                let in_member = std::mem::replace(&mut self.in_member, false);
                let saved = self.current.replace(select.clone());
                let result = if self.top_level {
                    self.top_level = false;
                    let result = walk(self, expression);
                    self.top_level = true;
                    result
                } else {
                    self.in_member = in_member;
                    let joined = match &saved {
                        Some(outer) if self.can_join(select, *deferred) => {
                            self.client_join(outer, select, projector, *aggregator)
                        }
                        _ => None,
                    };
                    self.in_member = false;
                    joined.unwrap_or_else(|| {
                        let can_join = std::mem::replace(&mut self.can_join_on_client, false);
                        let result = walk(self, expression);
                        self.can_join_on_client = can_join;
                        result
                    })
                };
                self.current = saved;
                self.in_member = in_member;
                result
            }
            Expression::Construct {
                type_name,
                constructor,
                arguments,
                bindings,
            } => {
                let saved = self.in_member;
                let rebind = |bindings: &[MemberBinding], this: &mut Self| -> Vec<MemberBinding> {
                    bindings
                        .iter()
                        .map(|binding| {
                            this.in_member = true;
                            MemberBinding {
                                member: binding.member.clone(),
                                expression: this.rewrite(&binding.expression),
                            }
                        })
                        .collect()
                };
                let new_arguments = rebind(arguments, self);
                let new_bindings = rebind(bindings, self);
                self.in_member = saved;
                if new_arguments == *arguments && new_bindings == *bindings {
                    expression.clone()
                } else {
                    Arc::new(Expression::Construct {
                        type_name: type_name.clone(),
                        constructor: *constructor,
                        arguments: new_arguments,
                        bindings: new_bindings,
                    })
                }
            }
            // the value of a member all the same
            Expression::Entity { .. } | Expression::OuterJoined { .. } => walk(self, expression),
            // subqueries are evaluated by the database
            Expression::Exists(_) | Expression::Scalar { .. } | Expression::In { .. } | Expression::Select(_) => {
                expression.clone()
            }
            _ => {
                let saved = std::mem::replace(&mut self.in_member, false);
                let result = walk(self, expression);
                self.in_member = saved;
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_metadata::metadata::{
        AssociationMapping, Cardinality, ColumnMapping, MappedEntity, MappedMember,
    };

    fn column(name: &str, db_type: &str) -> MappedMember {
        let primary_key = name == "Id";
        MappedMember {
            name: name.to_string(),
            read_only: false,
            mapping: MemberMapping::Column(ColumnMapping {
                table: None,
                column: name.to_string(),
                db_type: db_type.to_string(),
                generated: false,
                computed: false,
                primary_key,
            }),
        }
    }

    fn association(name: &str, related: &str, key: &str, related_key: &str, cardinality: Cardinality) -> MappedMember {
        MappedMember {
            name: name.to_string(),
            read_only: false,
            mapping: MemberMapping::Association(AssociationMapping {
                key_members: vec![key.to_string()],
                related_entity: EntityId::new(related),
                related_key_members: vec![related_key.to_string()],
                foreign_key: false,
                cardinality,
            }),
        }
    }

    fn entity(name: &str, members: Vec<MappedMember>) -> MappedEntity {
        MappedEntity {
            entity_id: EntityId::new(name),
            type_name: name.to_string(),
            constructed_type: None,
            primary_table: name.to_string(),
            extension_tables: vec![],
            primary_key_members: vec!["Id".to_string()],
            members,
            constructors: vec![],
        }
    }

    fn metadata() -> Metadata {
        Metadata::from_entities([
            entity(
                "Customer",
                vec![
                    column("Id", "int NOT NULL"),
                    association("Orders", "Order", "Id", "CustomerId", Cardinality::Many),
                ],
            ),
            entity(
                "Order",
                vec![
                    column("Id", "int NOT NULL"),
                    column("CustomerId", "int NOT NULL"),
                    association("Customer", "Customer", "CustomerId", "Id", Cardinality::One),
                    column("Total", "decimal(10,2)"),
                ],
            ),
        ])
    }

    #[test]
    fn include_paths_are_validated_hop_by_hop() {
        let metadata = metadata();
        let mut policy = Policy::new();
        policy
            .include_path(&metadata, "Order.Customer.Orders", false)
            .unwrap();
        assert!(policy.is_included(&EntityId::new("Order"), "Customer"));
        assert!(policy.is_included(&EntityId::new("Customer"), "Orders"));
        assert!(!policy.is_deferred(&EntityId::new("Customer"), "Orders"));

        let error = Policy::new()
            .include_path(&metadata, "Order.Total", false)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(error, Error::InvalidIncludePath { .. }));
        assert!(Policy::new().include_path(&metadata, "Order", false).is_err());
        assert!(Policy::new().include_path(&metadata, "Invoice.Lines", false).is_err());
    }

    #[test]
    fn later_settings_refine_the_same_rule() {
        let mut policy = Policy::new();
        let customer = EntityId::new("Customer");
        policy.include(&customer, "Orders").include_deferred(&customer, "Orders");
        assert_eq!(policy.rules().len(), 1);
        assert!(policy.is_deferred(&customer, "Orders"));
        assert!(policy.operation(&customer, "Orders").is_none());
    }

    #[test]
    fn limited_paths_page_their_last_association() {
        let metadata = metadata();
        let mut policy = Policy::new();
        policy
            .include_path_limited(&metadata, "Order.Customer.Orders", false, 2)
            .unwrap();
        assert!(policy.operation(&EntityId::new("Order"), "Customer").is_none());
        assert!(policy.operation(&EntityId::new("Customer"), "Orders").is_some());

        let translated = translated(&policy, "Customer");
        assert_eq!(count_kinds(&translated, "ClientJoin"), 1);
    }

    fn count_kinds(expression: &Expression, kind: &str) -> usize {
        struct Counter<'k> {
            kind: &'k str,
            count: usize,
        }
        impl query_engine_sql::sql::visitor::Visitor for Counter<'_> {
            fn visit(&mut self, expression: &Expression) {
                if expression.kind_name() == self.kind {
                    self.count += 1;
                }
                query_engine_sql::sql::visitor::walk_visit(self, expression);
            }
        }
        let mut counter = Counter { kind, count: 0 };
        query_engine_sql::sql::visitor::Visitor::visit(&mut counter, expression);
        counter.count
    }

    fn translated(policy: &Policy, set: &str) -> ExprRef {
        let metadata = metadata();
        let env = Env::new(&metadata, policy, &query_engine_sql::sql::dialect::Postgres);
        let mut state = State::new();
        let bound = super::super::mapping::binder::bind(&env, &mut state, &helpers::entity_set(set)).unwrap();
        translate(&env, &mut state, &bound).unwrap()
    }

    #[test]
    fn included_plural_associations_become_client_joins() {
        let mut policy = Policy::new();
        policy.include(&EntityId::new("Customer"), "Orders");
        let translated = translated(&policy, "Customer");
        assert_eq!(count_kinds(&translated, "ClientJoin"), 1);
    }

    #[test]
    fn included_singleton_associations_are_outer_applied() {
        let mut policy = Policy::new();
        policy.include(&EntityId::new("Order"), "Customer");
        let translated = translated(&policy, "Order");
        assert_eq!(count_kinds(&translated, "ClientJoin"), 0);
        assert_eq!(count_kinds(&translated, "OuterJoined"), 1);
        let Expression::Projection { projector, .. } = &*translated else {
            panic!("expected a projection");
        };
        assert_eq!(count_kinds(projector, "Projection"), 0);
    }

    #[test]
    fn self_referential_includes_stop_after_one_level() {
        let mut policy = Policy::new();
        policy
            .include(&EntityId::new("Order"), "Customer")
            .include(&EntityId::new("Customer"), "Orders");
        let translated = translated(&policy, "Customer");
        // Customer.Orders, then Order.Customer, then the scope stops Customer.Orders again
        assert_eq!(count_kinds(&translated, "ClientJoin"), 1);
        assert_eq!(count_kinds(&translated, "OuterJoined"), 1);
    }
}
