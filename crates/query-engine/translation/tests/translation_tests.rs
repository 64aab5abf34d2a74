use query_engine_metadata::metadata::{EntityId, ScalarType};
use query_engine_sql::sql::ast::{Expression, QueryOperator};
use query_engine_sql::sql::dialect::{Postgres, SqlServer, Sqlite};
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::types::Type;
use query_engine_sql::sql::value::Value;
use query_engine_translation::translation;
use query_engine_translation::translation::helpers::Env;
use query_engine_translation::translation::policy::Policy;

mod common;

fn customers_named(name: &str) -> query_engine_sql::sql::ast::ExprRef {
    helpers::where_(
        helpers::entity_set("Customer"),
        helpers::lambda("c", |c| {
            helpers::or(
                helpers::equal(helpers::member(&c, "City"), helpers::constant(name)),
                helpers::equal(helpers::member(&c, "Name"), helpers::constant(name)),
            )
        }),
    )
}

#[test]
fn translating_twice_gives_the_same_text() {
    let query = customers_named("London");
    let first = common::pretty_sql(&query, &Postgres, &Policy::default()).unwrap();
    let second = common::pretty_sql(&query, &Postgres, &Policy::default()).unwrap();
    similar_asserts::assert_eq!(first, second);

    let metadata = common::metadata();
    let policy = Policy::default();
    let env = Env::new(&metadata, &policy, &Postgres);
    assert_eq!(
        translation::translate(&env, &query).unwrap(),
        translation::translate(&env, &query).unwrap()
    );
}

#[test]
fn equal_constants_are_declared_once() {
    let (_, parameters, diagnostics) =
        common::translate_sql(&customers_named("London"), &Postgres, &Policy::default()).unwrap();
    assert_eq!(diagnostics, 0);
    let names: Vec<&str> = parameters.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["p0"]);
}

#[test]
fn positional_dialects_repeat_the_parameter_per_marker() {
    let (text, parameters, _) =
        common::translate_sql(&customers_named("London"), &Sqlite, &Policy::default()).unwrap();
    assert_eq!(parameters.len(), 2);
    assert!(parameters.iter().all(|p| p.name == "p0"));
    assert_eq!(text.matches('?').count(), 2);
}

#[test]
fn row_limits_follow_the_dialect() {
    let query = helpers::take(
        helpers::order_by(
            helpers::entity_set("Customer"),
            helpers::lambda("c", |c| helpers::member(&c, "Name")),
        ),
        helpers::constant(5),
    );
    let (postgres, _, postgres_diagnostics) =
        common::translate_sql(&query, &Postgres, &Policy::default()).unwrap();
    let (sql_server, _, sql_server_diagnostics) =
        common::translate_sql(&query, &SqlServer, &Policy::default()).unwrap();

    assert_eq!(postgres_diagnostics, 0);
    assert_eq!(sql_server_diagnostics, 0);
    assert_ne!(postgres, sql_server);
    assert!(postgres.contains("LIMIT"));
    assert!(sql_server.contains("TOP"));
}

#[test]
fn included_orders_are_not_joined_into_the_customer_query() {
    let mut policy = Policy::default();
    policy.include(&EntityId::new("Customer"), "Orders");
    let metadata = common::metadata();
    let env = Env::new(&metadata, &policy, &Postgres);
    let translated = translation::translate(&env, &helpers::entity_set("Customer")).unwrap();
    assert!(translated.diagnostics.is_empty());

    let Expression::Projection { projector, .. } = &*translated.expression else {
        panic!("expected a projection");
    };
    let Expression::Entity { expression, .. } = &**projector else {
        panic!("expected an entity");
    };
    let Expression::Construct { bindings, arguments, .. } = &**expression else {
        panic!("expected a construction");
    };
    let orders = arguments
        .iter()
        .chain(bindings)
        .find(|binding| binding.member == "Orders")
        .unwrap();
    assert_eq!(orders.expression.kind_name(), "ClientJoin");

    let (text, _, _) =
        common::translate_sql(&helpers::entity_set("Customer"), &Postgres, &policy).unwrap();
    assert!(!text.contains("\"Orders\""));
}

#[test]
fn included_customers_are_joined_into_the_order_query() {
    let mut policy = Policy::default();
    policy.include(&EntityId::new("Order"), "Customer");
    let (text, _, diagnostics) =
        common::translate_sql(&helpers::entity_set("Order"), &Postgres, &policy).unwrap();
    assert_eq!(diagnostics, 0);
    assert!(text.contains("\"Customers\""));
    assert!(text.contains("\"Orders\""));
}

#[test]
fn inserting_with_a_generated_key_reads_it_back() {
    let order = helpers::argument("order", Type::Object("Order".to_string()));
    let query = helpers::insert(
        helpers::entity_set("Order"),
        order,
        Some(helpers::lambda("o", |o| helpers::member(&o, "Id"))),
    );
    let metadata = common::metadata();
    let policy = Policy::default();
    let env = Env::new(&metadata, &policy, &SqlServer);
    let translated = translation::translate(&env, &query).unwrap();
    assert!(translated.diagnostics.is_empty());

    let Expression::Block(commands) = &*translated.expression else {
        panic!("expected a block, got {:?}", translated.expression);
    };
    let kinds: Vec<&str> = commands.iter().map(|command| command.kind_name()).collect();
    assert_eq!(kinds, vec!["Insert", "Projection"]);
}

#[test]
fn commands_over_unmapped_sources_are_rejected() {
    let query = helpers::call(
        QueryOperator::DeleteWhere,
        vec![
            helpers::argument("orders", Type::Any),
            helpers::lambda("o", |o| {
                helpers::greater_than(helpers::member(&o, "Total"), helpers::constant(0))
            }),
        ],
    );
    let metadata = common::metadata();
    let policy = Policy::default();
    let env = Env::new(&metadata, &policy, &Postgres);
    assert!(matches!(
        translation::translate(&env, &query),
        Err(translation::error::Error::NotSupported(_))
    ));
}

#[test]
fn deleting_by_predicate_filters_the_primary_table() {
    let query = helpers::delete_where(
        helpers::entity_set("Order"),
        helpers::lambda("o", |o| {
            helpers::greater_than(
                helpers::member(&o, "Total"),
                helpers::typed_constant(Value::Int(100), Type::Scalar(ScalarType::Decimal)),
            )
        }),
    );
    let (text, parameters, diagnostics) =
        common::translate_sql(&query, &Postgres, &Policy::default()).unwrap();
    assert_eq!(diagnostics, 0);
    assert!(text.starts_with("DELETE FROM \"Orders\""));
    assert!(text.contains("100"));
    assert!(parameters.is_empty());
}
