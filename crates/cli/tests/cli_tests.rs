use std::path::Path;

use clap::Parser;
use relquery_cli::{run, Cli};
use relquery_configuration::environment::{FixedEnvironment, DIALECT_VARIABLE};
use relquery_configuration::{parse_configuration, write_parsed_configuration};
use tests_common::deployment::sales_configuration_dir;

fn cli(arguments: &[&str]) -> Cli {
    cli_in(&sales_configuration_dir(), arguments)
}

fn cli_in(directory: &Path, arguments: &[&str]) -> Cli {
    let mut all = vec![
        "relquery".to_string(),
        "--configuration".to_string(),
        directory.display().to_string(),
    ];
    all.extend(arguments.iter().map(ToString::to_string));
    Cli::parse_from(all)
}

#[tokio::test]
async fn included_orders_add_a_second_command() {
    let output = run(cli(&["select", "Customer"]), &FixedEnvironment::empty())
        .await
        .unwrap();
    assert!(
        output.starts_with("-- select Customer (postgres): 2 command(s)"),
        "{output}"
    );
    assert!(output.contains("\"Customers\""));
    assert!(output.contains("\"Orders\""));
}

#[tokio::test]
async fn inserts_list_their_parameters() {
    let output = run(cli(&["insert", "Order"]), &FixedEnvironment::empty())
        .await
        .unwrap();
    assert!(output.contains("INSERT INTO \"Orders\""), "{output}");
    assert!(output.contains("-- parameters: [p0, p1]"), "{output}");
}

#[tokio::test]
async fn the_environment_can_switch_dialects() {
    let environment = FixedEnvironment::from([(DIALECT_VARIABLE, "sqlserver")]);
    let output = run(cli(&["--pretty", "delete", "Child"]), &environment)
        .await
        .unwrap();
    assert!(output.starts_with("-- delete Child (sqlserver)"), "{output}");
    assert!(output.contains("[Children]"), "{output}");
}

#[tokio::test]
async fn untranslatable_requests_report_their_diagnostics() {
    // a limited plural include keeps its apply, which sqlite cannot express
    let directory = tempfile::tempdir().unwrap();
    let mut parsed = parse_configuration(&sales_configuration_dir()).await.unwrap();
    parsed.includes[0].limit = Some(1);
    write_parsed_configuration(&parsed, directory.path()).await.unwrap();

    let environment = FixedEnvironment::from([(DIALECT_VARIABLE, "sqlite")]);
    let error = run(cli_in(directory.path(), &["select", "Customer"]), &environment)
        .await
        .unwrap_err();
    assert!(error.to_string().starts_with("select Customer cannot be translated"), "{error}");
    assert!(error.to_string().contains("CrossApply"), "{error}");

    let output = run(cli_in(directory.path(), &["select", "Customer"]), &FixedEnvironment::empty())
        .await
        .unwrap();
    assert!(output.contains("LATERAL"), "{output}");
}

#[tokio::test]
async fn unknown_entities_are_errors() {
    assert!(run(cli(&["select", "Invoice"]), &FixedEnvironment::empty())
        .await
        .is_err());
}

#[tokio::test]
async fn the_schema_describes_the_configuration_file() {
    let output = run(Cli::parse_from(["relquery", "schema"]), &FixedEnvironment::empty())
        .await
        .unwrap();
    let schema: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(schema["title"], "ParsedConfiguration");
    assert!(schema["properties"]["dialect"].is_object());
}
