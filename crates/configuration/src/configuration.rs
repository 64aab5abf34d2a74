//! Configuration for the query engine.

use std::sync::Arc;

use query_engine_metadata::metadata;
use query_engine_sql::sql::dialect::{Dialect, DialectKind};
use query_engine_translation::translation::helpers::Env;
use query_engine_translation::translation::policy::Policy;

/// The 'Configuration' type collects all the information necessary to translate
/// queries at runtime.
///
/// Values of this type are produced from a 'ParsedConfiguration' using
/// 'make_runtime_configuration', which resolves the dialect and validates the
/// include paths against the mapping.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub metadata: metadata::Metadata,
    pub policy: Policy,
    pub dialect_kind: DialectKind,
    pub dialect: Arc<dyn Dialect>,
}

impl Configuration {
    /// The translation environment over this configuration.
    pub fn env(&self) -> Env<'_> {
        Env::new(&self.metadata, &self.policy, self.dialect.as_ref())
    }
}
