//! Convert a parsed configuration into the runtime configuration.

use query_engine_sql::sql::dialect::DialectKind;
use query_engine_translation::translation::policy::Policy;

use crate::configuration::Configuration;
use crate::environment::{Environment, DIALECT_VARIABLE};
use crate::error::MakeRuntimeConfigurationError;
use crate::version1::ParsedConfiguration;

/// Validate the mapping, build the inclusion policy, and resolve the dialect.
///
/// `RELQUERY_DIALECT`, when set, overrides the configured dialect.
pub fn make_runtime_configuration(
    parsed_config: ParsedConfiguration,
    environment: &impl Environment,
) -> Result<Configuration, MakeRuntimeConfigurationError> {
    parsed_config.metadata.validate()?;

    let mut policy = Policy::new();
    for include in &parsed_config.includes {
        let metadata = &parsed_config.metadata;
        let included = match include.limit {
            Some(count) => policy.include_path_limited(metadata, &include.path, include.deferred, count),
            None => policy.include_path(metadata, &include.path, include.deferred),
        };
        included.map_err(MakeRuntimeConfigurationError::InvalidIncludePath)?;
    }

    let dialect_kind = match environment.read(DIALECT_VARIABLE)? {
        Some(value) => {
            DialectKind::parse(&value).ok_or_else(|| MakeRuntimeConfigurationError::UnknownDialect {
                variable: DIALECT_VARIABLE.to_string(),
                value,
            })?
        }
        None => parsed_config.dialect.kind(),
    };
    tracing::info!(dialect = ?dialect_kind, includes = parsed_config.includes.len(), "Configured");

    Ok(Configuration {
        metadata: parsed_config.metadata,
        policy,
        dialect_kind,
        dialect: dialect_kind.dialect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::FixedEnvironment;
    use crate::version1::{DialectName, IncludeSetting};
    use query_engine_metadata::metadata::EntityId;

    fn sales() -> ParsedConfiguration {
        ParsedConfiguration {
            dialect: DialectName::Postgres,
            metadata: tests_common::fixtures::sales(),
            includes: vec![IncludeSetting {
                path: "Customer.Orders".to_string(),
                deferred: false,
                limit: None,
            }],
            ..ParsedConfiguration::initial()
        }
    }

    #[test]
    fn includes_become_policy_rules() {
        let configuration = make_runtime_configuration(sales(), &FixedEnvironment::empty()).unwrap();
        assert!(configuration
            .policy
            .is_included(&EntityId::new("Customer"), "Orders"));
        assert_eq!(configuration.dialect_kind, DialectKind::Postgres);
        assert_eq!(configuration.env().dialect.name(), "postgres");
    }

    #[test]
    fn the_environment_overrides_the_dialect() {
        let environment = FixedEnvironment::from([(DIALECT_VARIABLE, "sqlserver")]);
        let configuration = make_runtime_configuration(sales(), &environment).unwrap();
        assert_eq!(configuration.dialect_kind, DialectKind::SqlServer);

        let environment = FixedEnvironment::from([(DIALECT_VARIABLE, "db2")]);
        assert!(matches!(
            make_runtime_configuration(sales(), &environment),
            Err(MakeRuntimeConfigurationError::UnknownDialect { .. })
        ));
    }

    #[test]
    fn limited_includes_carry_an_operation() {
        let mut parsed = sales();
        parsed.includes[0].limit = Some(1);
        let configuration = make_runtime_configuration(parsed, &FixedEnvironment::empty()).unwrap();
        assert!(configuration
            .policy
            .operation(&EntityId::new("Customer"), "Orders")
            .is_some());
    }

    #[test]
    fn include_paths_must_follow_associations() {
        let mut parsed = sales();
        parsed.includes.push(IncludeSetting {
            path: "Customer.Name".to_string(),
            deferred: false,
            limit: None,
        });
        assert!(matches!(
            make_runtime_configuration(parsed, &FixedEnvironment::empty()),
            Err(MakeRuntimeConfigurationError::InvalidIncludePath(_))
        ));
    }
}
