use query_engine_metadata::metadata::EntityId;
use relquery_configuration::environment::FixedEnvironment;
use relquery_configuration::{make_runtime_configuration, parse_configuration, DialectName};
use tests_common::{deployment, fixtures};

#[tokio::test]
async fn the_sales_configuration_matches_the_fixture_mapping() -> anyhow::Result<()> {
    let parsed = parse_configuration(deployment::sales_configuration_dir()).await?;
    assert_eq!(parsed.dialect, DialectName::Postgres);
    similar_asserts::assert_eq!(parsed.metadata, fixtures::sales());
    similar_asserts::assert_eq!(
        deployment::read_metadata("static/sales/configuration.json")?,
        fixtures::sales()
    );
    Ok(())
}

#[tokio::test]
async fn the_sales_configuration_is_valid_at_runtime() -> anyhow::Result<()> {
    let parsed = parse_configuration(deployment::sales_configuration_dir()).await?;
    let configuration = make_runtime_configuration(parsed, &FixedEnvironment::empty())?;
    assert!(configuration
        .policy
        .is_included(&EntityId::new("Customer"), "Orders"));
    assert_eq!(configuration.metadata.entities.len(), 5);
    Ok(())
}
