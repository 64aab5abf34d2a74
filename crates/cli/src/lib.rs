//! The `relquery` command line: show the commands a configuration produces.

use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use query_engine_execution::build_plan;
use query_engine_metadata::metadata::EntityId;
use query_engine_sql::sql::ast::ExprRef;
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::types::Type;
use relquery_configuration::environment::Environment;
use relquery_configuration::{make_runtime_configuration, parse_configuration, Configuration};

#[derive(Debug, Parser)]
#[command(name = "relquery", version, about = "Show the SQL translated for mapped entities")]
pub struct Cli {
    /// The directory holding `configuration.json`.
    #[arg(long, env = "RELQUERY_CONFIGURATION", default_value = ".")]
    pub configuration: PathBuf,

    /// Lay out each command over several lines.
    #[arg(long)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Read every instance of an entity, with its included associations.
    Select { entity: String },
    /// Insert an instance given as the `instance` argument.
    Insert { entity: String },
    /// Update an instance given as the `instance` argument.
    Update { entity: String },
    /// Delete an instance given as the `instance` argument.
    Delete { entity: String },
    /// Print the JSON schema of the configuration file.
    Schema,
}

/// Run one command and return what it prints.
pub async fn run(cli: Cli, environment: &impl Environment) -> anyhow::Result<String> {
    let (verb, entity) = match &cli.command {
        Command::Select { entity } => ("select", entity),
        Command::Insert { entity } => ("insert", entity),
        Command::Update { entity } => ("update", entity),
        Command::Delete { entity } => ("delete", entity),
        Command::Schema => {
            let schema = relquery_configuration::configuration_jsonschema();
            return Ok(serde_json::to_string_pretty(&schema)? + "\n");
        }
    };

    let parsed = parse_configuration(&cli.configuration).await?;
    let configuration = make_runtime_configuration(parsed, environment)?;
    let query = query_for(&configuration, &cli.command, entity)?;
    tracing::debug!(verb, entity = %entity, "Planning");
    show_commands(&configuration, &query, verb, entity, cli.pretty)
}

fn query_for(configuration: &Configuration, command: &Command, entity: &str) -> anyhow::Result<ExprRef> {
    let mapped = configuration.metadata.lookup_entity(&EntityId::new(entity))?;
    let set = helpers::entity_set(entity);
    let instance = helpers::argument("instance", Type::Object(mapped.type_name.clone()));
    Ok(match command {
        Command::Insert { .. } => helpers::insert(set, instance, None),
        Command::Update { .. } => helpers::update(set, instance, None, None),
        Command::Delete { .. } => helpers::delete(set, instance, None),
        Command::Select { .. } | Command::Schema => set,
    })
}

fn show_commands(
    configuration: &Configuration,
    query: &ExprRef,
    verb: &str,
    entity: &str,
    pretty: bool,
) -> anyhow::Result<String> {
    let plan = build_plan(&configuration.env(), query);
    if !plan.is_executable() {
        let messages: Vec<&str> = plan
            .diagnostics
            .iter()
            .map(|diagnostic| diagnostic.message.as_str())
            .collect();
        anyhow::bail!("{verb} {entity} cannot be translated:\n  {}", messages.join("\n  "));
    }

    let commands = plan.commands();
    let mut out = String::new();
    writeln!(
        out,
        "-- {verb} {entity} ({}): {} command(s)",
        configuration.dialect.name(),
        commands.len()
    )?;
    for command in commands {
        let text = if pretty {
            sqlformat::format(
                &command.text,
                &sqlformat::QueryParams::None,
                sqlformat::FormatOptions::default(),
            )
        } else {
            command.text.clone()
        };
        writeln!(out, "{text}")?;
        let names: Vec<&str> = command
            .parameters
            .iter()
            .map(|parameter| parameter.name.as_str())
            .collect();
        writeln!(out, "-- parameters: [{}]", names.join(", "))?;
    }
    Ok(out)
}
