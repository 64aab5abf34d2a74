use query_engine_execution::{Error, QueryPlan};
use query_engine_sql::sql::dialect::{Dialect, Postgres, SqlServer, Sqlite};
use query_engine_sql::sql::evaluate::Arguments;
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::types::Type;
use query_engine_sql::sql::value::{Object, Value};
use query_engine_translation::translation::policy::Policy;
use serde_json::json;
use tests_common::executor::{CallKind, Response, ScriptedExecutor};
use tests_common::fixtures;

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

fn customer_row() -> Vec<(&'static str, Value)> {
    vec![
        ("Id", Value::Int(1)),
        ("Name", Value::from("Ann")),
        ("City", Value::from("London")),
    ]
}

fn order_argument() -> Arguments {
    Arguments::from([(
        "order".to_string(),
        Value::Object(
            Object::new("Order")
                .with("CustomerId", Value::Int(1))
                .with("Total", Value::Float(5.0)),
        ),
    )])
}

fn insert_order_returning_id() -> query_engine_sql::sql::ast::ExprRef {
    helpers::insert(
        helpers::entity_set("Order"),
        helpers::argument("order", Type::Object("Order".to_string())),
        Some(helpers::lambda("o", |o| helpers::member(&o, "Id"))),
    )
}

#[test]
fn planning_twice_gives_the_same_commands() {
    let policy = fixtures::including(&["Customer.Orders"]).unwrap();
    let texts = |dialect: &dyn Dialect| -> Vec<String> {
        fixtures::plan(&customers_named("London"), &policy, dialect)
            .commands()
            .into_iter()
            .map(|command| command.text.clone())
            .collect()
    };
    similar_asserts::assert_eq!(texts(&Postgres), texts(&Postgres));
    similar_asserts::assert_eq!(texts(&SqlServer), texts(&SqlServer));
}

#[test]
fn a_repeated_constant_is_sent_once_where_parameters_are_named() {
    let plan = fixtures::plan(&customers_named("London"), &Policy::default(), &Postgres);
    let executor = ScriptedExecutor::new().then(Response::rows([customer_row()]));
    plan.execute(&executor, &Arguments::new()).unwrap();

    let calls = executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].parameters, vec![Value::from("London")]);
}

#[test]
fn positional_parameters_repeat_the_value_per_marker() {
    let plan = fixtures::plan(&customers_named("London"), &Policy::default(), &Sqlite);
    let executor = ScriptedExecutor::new().then(Response::empty());
    plan.execute(&executor, &Arguments::new()).unwrap();

    assert_eq!(
        executor.calls()[0].parameters,
        vec![Value::from("London"), Value::from("London")]
    );
}

#[test]
fn the_same_query_runs_on_every_dialect() {
    for dialect in [&Postgres as &dyn Dialect, &SqlServer, &Sqlite] {
        let plan = fixtures::plan(&customers_named("London"), &Policy::default(), dialect);
        assert!(plan.is_executable(), "{}: {:?}", dialect.name(), plan.diagnostics);

        let executor = ScriptedExecutor::new().then(Response::rows([customer_row()]));
        let result = plan.execute(&executor, &Arguments::new()).unwrap();
        assert_eq!(
            result.to_json(),
            json!([{ "Id": 1, "Name": "Ann", "City": "London" }]),
            "{}",
            dialect.name()
        );
        assert_eq!(executor.round_trips(), 1);
    }
}

#[test]
fn included_orders_take_two_round_trips() {
    let policy = fixtures::including(&["Customer.Orders"]).unwrap();
    let plan = fixtures::plan(&helpers::entity_set("Customer"), &policy, &Postgres);
    assert!(plan.is_executable(), "{:?}", plan.diagnostics);

    // the orders are read first, then grouped under each customer
    let executor = ScriptedExecutor::new()
        .then(Response::rows_matching_suffixes([
            vec![
                ("Id", Value::Int(10)),
                ("CustomerId", Value::Int(1)),
                ("Total", Value::Float(5.0)),
            ],
            vec![
                ("Id", Value::Int(11)),
                ("CustomerId", Value::Int(1)),
                ("Total", Value::Float(7.5)),
            ],
            vec![
                ("Id", Value::Int(12)),
                ("CustomerId", Value::Int(2)),
                ("Total", Value::Float(1.0)),
            ],
        ]))
        .then(Response::rows([
            customer_row(),
            vec![
                ("Id", Value::Int(3)),
                ("Name", Value::from("Bo")),
                ("City", Value::from("Oslo")),
            ],
        ]));
    let result = plan.execute(&executor, &Arguments::new()).unwrap();
    assert_eq!(executor.round_trips(), 2);

    let Value::List(customers) = result else {
        panic!("expected a list, got {result:?}");
    };
    assert_eq!(customers.len(), 2);
    let ids = |customer: &Value| -> Vec<Value> {
        match customer.field("Orders") {
            Some(Value::List(orders)) => orders
                .iter()
                .filter_map(|order| order.field("Id").cloned())
                .collect(),
            other => panic!("expected orders, got {other:?}"),
        }
    };
    assert_eq!(ids(&customers[0]), vec![Value::Int(10), Value::Int(11)]);
    assert_eq!(ids(&customers[1]), vec![]);
}

#[test]
fn a_missing_singleton_child_reads_as_null() {
    let policy = fixtures::including(&["Parent.Child"]).unwrap();
    let plan = fixtures::plan(&helpers::entity_set("Parent"), &policy, &SqlServer);
    assert!(plan.is_executable(), "{:?}", plan.diagnostics);
    assert_eq!(plan.commands().len(), 1);

    let executor = ScriptedExecutor::new().then(Response::rows([vec![
        ("Id", Value::Int(1)),
        ("Name", Value::from("Pat")),
    ]]));
    let result = plan.execute(&executor, &Arguments::new()).unwrap();
    assert_eq!(executor.round_trips(), 1);

    let Value::List(parents) = result else {
        panic!("expected a list, got {result:?}");
    };
    assert_eq!(parents[0].field("Name"), Some(&Value::from("Pat")));
    assert_eq!(parents[0].field("Child"), Some(&Value::Null));
}

#[test]
fn a_present_singleton_child_is_constructed() {
    let policy = fixtures::including(&["Parent.Child"]).unwrap();
    let plan = fixtures::plan(&helpers::entity_set("Parent"), &policy, &Postgres);

    let executor = ScriptedExecutor::new().then(Response::rows_matching_suffixes([vec![
        ("Id", Value::Int(1)),
        ("Name", Value::from("Pat")),
        ("ParentId", Value::Int(1)),
        ("Test", Value::Int(1)),
    ]]));
    let result = plan.execute(&executor, &Arguments::new()).unwrap();

    let Value::List(parents) = result else {
        panic!("expected a list, got {result:?}");
    };
    let child = parents[0].field("Child").cloned().unwrap_or(Value::Null);
    assert_eq!(child.field("ParentId"), Some(&Value::Int(1)));
}

#[test]
fn a_generated_key_comes_back_with_the_insert_where_batches_are_allowed() {
    let plan = fixtures::plan(&insert_order_returning_id(), &Policy::default(), &SqlServer);
    assert!(plan.is_executable(), "{:?}", plan.diagnostics);

    let executor = ScriptedExecutor::new().then(Response::rows([vec![("Id", Value::Int(42))]]));
    let result = plan.execute(&executor, &order_argument()).unwrap();

    assert_eq!(result, Value::Int(42));
    assert_eq!(executor.round_trips(), 1);
    assert_eq!(executor.calls()[0].kind, CallKind::Transacted);
    assert_eq!(
        executor.calls()[1].parameters,
        vec![Value::Int(1), Value::Float(5.0)]
    );
}

#[test]
fn a_generated_key_is_read_by_a_second_query_elsewhere() {
    for dialect in [&Postgres as &dyn Dialect, &Sqlite] {
        let plan = fixtures::plan(&insert_order_returning_id(), &Policy::default(), dialect);
        assert!(plan.is_executable(), "{}: {:?}", dialect.name(), plan.diagnostics);

        let executor = ScriptedExecutor::new()
            .then(Response::Affected(1))
            .then(Response::rows([vec![("Id", Value::Int(42))]]));
        let result = plan.execute(&executor, &order_argument()).unwrap();

        assert_eq!(result, Value::Int(42), "{}", dialect.name());
        assert_eq!(executor.round_trips(), 2, "{}", dialect.name());
        let kinds: Vec<CallKind> = executor.calls().iter().map(|call| call.kind).collect();
        assert_eq!(
            kinds,
            vec![CallKind::Transacted, CallKind::Command, CallKind::Query]
        );
    }
}

#[test]
fn extension_rows_reuse_the_generated_key() {
    let person = Arguments::from([(
        "person".to_string(),
        Value::Object(
            Object::new("Person")
                .with("Name", Value::from("Kim"))
                .with("Bio", Value::from("Writes")),
        ),
    )]);
    let query = helpers::insert(
        helpers::entity_set("Person"),
        helpers::argument("person", Type::Object("Person".to_string())),
        None,
    );
    let plan = fixtures::plan(&query, &Policy::default(), &Postgres);
    assert!(plan.is_executable(), "{:?}", plan.diagnostics);

    let executor = ScriptedExecutor::new()
        .then(Response::Affected(1))
        .then(Response::rows([vec![("Id", Value::Int(7))]]))
        .then(Response::Affected(1));
    plan.execute(&executor, &person).unwrap();

    let calls = executor.calls();
    assert_eq!(executor.round_trips(), 3);
    let details = calls.last().unwrap();
    assert!(details.text.contains("PersonDetails"), "{}", details.text);
    assert!(details.parameters.contains(&Value::Int(7)));
}

#[test]
fn batched_inserts_share_round_trips() {
    let orders = Value::List(
        (1..=3)
            .map(|id| {
                Value::Object(
                    Object::new("Order")
                        .with("CustomerId", Value::Int(id))
                        .with("Total", Value::Float(1.0)),
                )
            })
            .collect(),
    );
    let query = helpers::batch(
        helpers::entity_set("Order"),
        helpers::argument("orders", Type::Sequence(Box::new(Type::Object("Order".to_string())))),
        helpers::lambda("o", |o| helpers::insert(helpers::entity_set("Order"), o, None)),
        2,
        false,
    );
    let plan = fixtures::plan(&query, &Policy::default(), &Postgres);
    assert!(plan.is_executable(), "{:?}", plan.diagnostics);

    let executor = ScriptedExecutor::new();
    let result = plan
        .execute(&executor, &Arguments::from([("orders".to_string(), orders)]))
        .unwrap();

    assert_eq!(result, Value::List(vec![Value::Int(1); 3]));
    let batches: Vec<Vec<Value>> = executor
        .calls()
        .into_iter()
        .filter(|call| call.kind == CallKind::Batch)
        .map(|call| call.parameters)
        .collect();
    assert_eq!(batches.len(), 2);
    assert!(batches[0].contains(&Value::Int(2)));
    assert!(batches[1].contains(&Value::Int(3)));
}

#[test]
fn unsupported_constructs_fail_before_reaching_the_database() {
    // one order per customer keeps the apply, which sqlite has no join for
    let mut policy = Policy::new();
    policy
        .include_path_limited(&fixtures::sales(), "Customer.Orders", false, 1)
        .unwrap();
    let plan = fixtures::plan(&helpers::entity_set("Customer"), &policy, &Sqlite);
    assert_eq!(plan.diagnostics.len(), 1, "{:?}", plan.diagnostics);
    assert!(plan.diagnostics[0].message.contains("CrossApply"));
    assert!(plan
        .commands()
        .iter()
        .any(|command| command.text.contains("<<UNSUPPORTED CrossApply>>")));

    let executor = ScriptedExecutor::new();
    let error = plan.execute(&executor, &Arguments::new()).unwrap_err();
    assert!(matches!(error, Error::OutstandingDiagnostics(_)), "{error}");
    assert!(executor.calls().is_empty());
}

#[test]
fn deferred_orders_can_be_enumerated_once() {
    let mut policy = Policy::new();
    policy
        .include_path(&fixtures::sales(), "Customer.Orders", true)
        .unwrap();
    let plan = fixtures::plan(&helpers::entity_set("Customer"), &policy, &Postgres);
    assert!(plan.is_executable(), "{:?}", plan.diagnostics);

    let executor = ScriptedExecutor::new()
        .then(Response::rows([customer_row()]))
        .then(Response::rows([vec![
            ("Id", Value::Int(10)),
            ("CustomerId", Value::Int(1)),
            ("Total", Value::Float(5.0)),
        ]]));
    let result = plan.execute(&executor, &Arguments::new()).unwrap();
    assert_eq!(executor.calls()[0].kind, CallKind::Connected);
    assert_eq!(executor.calls()[2].kind, CallKind::Deferred);
    assert_eq!(executor.calls()[2].parameters, vec![Value::Int(1)]);

    let Value::List(customers) = result else {
        panic!("expected a list, got {result:?}");
    };
    let Some(Value::Deferred(orders)) = customers[0].field("Orders") else {
        panic!("expected deferred orders");
    };
    let first = orders.collect().unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].field("Id"), Some(&Value::Int(10)));
    assert!(orders.collect().is_err());
}

fn deferred_orders_plan() -> QueryPlan {
    let mut policy = Policy::new();
    policy
        .include_path(&fixtures::sales(), "Customer.Orders", true)
        .unwrap();
    fixtures::plan(&helpers::entity_set("Customer"), &policy, &Postgres)
}

fn scripted_orders(executor: ScriptedExecutor) -> ScriptedExecutor {
    executor
        .then(Response::rows([customer_row()]))
        .then(Response::rows([vec![
            ("Id", Value::Int(10)),
            ("CustomerId", Value::Int(1)),
            ("Total", Value::Float(5.0)),
        ]]))
}

fn first_orders(result: &Value) -> query_engine_sql::sql::value::Deferred {
    let Value::List(customers) = result else {
        panic!("expected a list, got {result:?}");
    };
    let Some(Value::Deferred(orders)) = customers[0].field("Orders") else {
        panic!("expected deferred orders");
    };
    orders.clone()
}

#[test]
fn deferred_orders_are_buffered_when_the_plan_opens_the_connection() {
    let executor = scripted_orders(ScriptedExecutor::new());
    let result = deferred_orders_plan()
        .execute(&executor, &Arguments::new())
        .unwrap();

    // the plan's connection is closed by now
    let orders = first_orders(&result).collect().unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].field("Id"), Some(&Value::Int(10)));
}

#[test]
fn deferred_orders_stream_from_an_open_connection() {
    let executor = scripted_orders(ScriptedExecutor::connected());
    let result = deferred_orders_plan()
        .execute(&executor, &Arguments::new())
        .unwrap();
    let orders = first_orders(&result);

    executor.disconnect();
    let error = orders.collect().unwrap_err();
    assert_eq!(error.message, "connection closed");
}

#[test]
fn plans_can_be_shared_between_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<QueryPlan>();

    let plan = fixtures::plan(&insert_order_returning_id(), &Policy::default(), &SqlServer);
    std::thread::scope(|scope| {
        for id in 1..=2 {
            let plan = &plan;
            scope.spawn(move || {
                let executor = ScriptedExecutor::new().then(Response::rows([vec![("Id", Value::Int(id))]]));
                assert_eq!(plan.execute(&executor, &order_argument()).unwrap(), Value::Int(id));
            });
        }
    });
}

#[test]
fn each_run_sends_its_own_arguments() {
    let plan = fixtures::plan(&insert_order_returning_id(), &Policy::default(), &SqlServer);
    let order = |customer: i64, total: f64| {
        Arguments::from([(
            "order".to_string(),
            Value::Object(
                Object::new("Order")
                    .with("CustomerId", Value::Int(customer))
                    .with("Total", Value::Float(total)),
            ),
        )])
    };

    let first = ScriptedExecutor::new().then(Response::rows([vec![("Id", Value::Int(41))]]));
    let second = ScriptedExecutor::new().then(Response::rows([vec![("Id", Value::Int(42))]]));
    assert_eq!(plan.execute(&first, &order(1, 5.0)).unwrap(), Value::Int(41));
    assert_eq!(plan.execute(&second, &order(2, 7.5)).unwrap(), Value::Int(42));

    assert_eq!(
        first.calls()[1].parameters,
        vec![Value::Int(1), Value::Float(5.0)]
    );
    assert_eq!(
        second.calls()[1].parameters,
        vec![Value::Int(2), Value::Float(7.5)]
    );
}

#[test]
fn a_failed_update_check_skips_the_result_query() {
    let order = Arguments::from([(
        "order".to_string(),
        Value::Object(
            Object::new("Order")
                .with("Id", Value::Int(10))
                .with("CustomerId", Value::Int(1))
                .with("Total", Value::Float(9.0)),
        ),
    )]);
    let query = helpers::update(
        helpers::entity_set("Order"),
        helpers::argument("order", Type::Object("Order".to_string())),
        None,
        Some(helpers::lambda("o", |o| helpers::member(&o, "Total"))),
    );
    let plan = fixtures::plan(&query, &Policy::default(), &Postgres);
    assert!(plan.is_executable(), "{:?}", plan.diagnostics);

    let executor = ScriptedExecutor::new().then(Response::Affected(0));
    let result = plan.execute(&executor, &order).unwrap();
    assert_eq!(result, Value::Null);
    assert_eq!(executor.round_trips(), 1);
}
