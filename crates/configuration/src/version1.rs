//! The configuration file format, version 1.

use std::path::Path;

use schemars::{gen::SchemaSettings, schema::RootSchema, JsonSchema};
use serde::{Deserialize, Serialize};
use tokio::fs;

use query_engine_metadata::metadata;
use query_engine_sql::sql::dialect::DialectKind;

use crate::error::{ParseConfigurationError, WriteParsedConfigurationError};

pub const CURRENT_VERSION: u32 = 1;
pub const CONFIGURATION_FILENAME: &str = "configuration.json";
pub const CONFIGURATION_JSONSCHEMA_FILENAME: &str = "schema.json";

/// The dialect commands are written in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DialectName {
    Postgres,
    #[value(name = "sqlserver")]
    SqlServer,
    Sqlite,
}

impl DialectName {
    pub fn kind(self) -> DialectKind {
        match self {
            DialectName::Postgres => DialectKind::Postgres,
            DialectName::SqlServer => DialectKind::SqlServer,
            DialectName::Sqlite => DialectKind::Sqlite,
        }
    }
}

/// An association path loaded together with the entity it starts from,
/// such as `Customer.Orders`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IncludeSetting {
    pub path: String,
    /// Load the last association when it is first enumerated rather than with
    /// its owner.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deferred: bool,
    /// Load at most this many elements of the last association.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// The configuration as it is stored in `configuration.json`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParsedConfiguration {
    // Which version of the configuration format are we using
    pub version: u32,
    pub dialect: DialectName,
    #[serde(default)]
    pub metadata: metadata::Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<IncludeSetting>,
}

impl ParsedConfiguration {
    pub fn initial() -> Self {
        ParsedConfiguration::empty()
    }

    pub fn empty() -> Self {
        Self {
            version: CURRENT_VERSION,
            dialect: DialectName::Postgres,
            metadata: metadata::Metadata::empty(),
            includes: vec![],
        }
    }
}

/// The JSON schema of `configuration.json`.
pub fn configuration_jsonschema() -> RootSchema {
    SchemaSettings::draft07()
        .into_generator()
        .into_root_schema_for::<ParsedConfiguration>()
}

/// Parse the configuration format from a directory.
pub async fn parse_configuration(
    configuration_dir: impl AsRef<Path>,
) -> Result<ParsedConfiguration, ParseConfigurationError> {
    let configuration_file = configuration_dir.as_ref().join(CONFIGURATION_FILENAME);

    let configuration_file_contents =
        fs::read_to_string(&configuration_file)
            .await
            .map_err(|err| {
                ParseConfigurationError::IoErrorButStringified(format!(
                    "{}: {}",
                    &configuration_file.display(),
                    err
                ))
            })?;

    let parsed_config: ParsedConfiguration = serde_json::from_str(&configuration_file_contents)
        .map_err(|error| ParseConfigurationError::ParseError {
            file_path: configuration_file.clone(),
            line: error.line(),
            column: error.column(),
            message: error.to_string(),
        })?;
    if parsed_config.version != CURRENT_VERSION {
        return Err(ParseConfigurationError::UnsupportedVersion(
            parsed_config.version,
        ));
    }

    tracing::debug!(
        file = %configuration_file.display(),
        entities = parsed_config.metadata.entities.len(),
        "Parsed configuration"
    );
    Ok(parsed_config)
}

/// Write the parsed configuration, and its JSON schema, into a directory on disk.
pub async fn write_parsed_configuration(
    parsed_config: &ParsedConfiguration,
    out_dir: impl AsRef<Path>,
) -> Result<(), WriteParsedConfigurationError> {
    let configuration_file = out_dir.as_ref().join(CONFIGURATION_FILENAME);
    fs::create_dir_all(out_dir.as_ref()).await?;

    // create the configuration file
    fs::write(
        configuration_file,
        serde_json::to_string_pretty(parsed_config)? + "\n",
    )
    .await?;

    // create the jsonschema file
    let configuration_jsonschema_file_path = out_dir
        .as_ref()
        .join(CONFIGURATION_JSONSCHEMA_FILENAME);
    fs::write(
        &configuration_jsonschema_file_path,
        serde_json::to_string_pretty(&configuration_jsonschema())? + "\n",
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn written_configurations_parse_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut parsed = ParsedConfiguration::initial();
        parsed.dialect = DialectName::SqlServer;
        parsed.includes.push(IncludeSetting {
            path: "Customer.Orders".to_string(),
            deferred: true,
            limit: Some(3),
        });

        write_parsed_configuration(&parsed, dir.path()).await?;
        assert!(dir.path().join(CONFIGURATION_JSONSCHEMA_FILENAME).exists());
        assert_eq!(parse_configuration(dir.path()).await?, parsed);
        Ok(())
    }

    #[tokio::test]
    async fn parse_errors_report_their_position() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join(CONFIGURATION_FILENAME),
            "{\n  \"version\": 1,\n  \"dialect\": \"oracle\"\n}\n",
        )?;

        match parse_configuration(dir.path()).await {
            Err(ParseConfigurationError::ParseError { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected a parse error, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn later_versions_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join(CONFIGURATION_FILENAME),
            r#"{ "version": 2, "dialect": "sqlite" }"#,
        )?;

        assert!(matches!(
            parse_configuration(dir.path()).await,
            Err(ParseConfigurationError::UnsupportedVersion(2))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn missing_directories_are_io_errors() {
        assert!(matches!(
            parse_configuration("/nonexistent/relquery").await,
            Err(ParseConfigurationError::IoErrorButStringified(_))
        ));
    }
}
