pub mod configuration;
pub mod environment;
pub mod error;
pub mod to_runtime_configuration;
pub mod version1;

pub use configuration::Configuration;
pub use version1::{
    configuration_jsonschema, parse_configuration, write_parsed_configuration, DialectName,
    IncludeSetting, ParsedConfiguration,
};

pub use to_runtime_configuration::make_runtime_configuration;
