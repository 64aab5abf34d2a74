//! Access to the process environment, replaceable in tests.

use std::collections::BTreeMap;

/// The variable that, when set, overrides the configured dialect.
pub const DIALECT_VARIABLE: &str = "RELQUERY_DIALECT";

/// Read environment variables.
pub trait Environment {
    /// The value of `variable`, or `None` when it is unset.
    fn read(&self, variable: &str) -> Result<Option<String>, Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the environment variable {0} is not valid unicode")]
    NotUnicode(String),
}

/// The environment of the running process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn read(&self, variable: &str) -> Result<Option<String>, Error> {
        match std::env::var(variable) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(Error::NotUnicode(variable.to_string())),
        }
    }
}

/// A fixed set of variables.
#[derive(Debug, Clone, Default)]
pub struct FixedEnvironment(BTreeMap<String, String>);

impl FixedEnvironment {
    pub fn empty() -> Self {
        Self::default()
    }
}

impl<const N: usize> From<[(String, String); N]> for FixedEnvironment {
    fn from(value: [(String, String); N]) -> Self {
        Self(value.into())
    }
}

impl<'a, const N: usize> From<[(&'a str, &'a str); N]> for FixedEnvironment {
    fn from(value: [(&'a str, &'a str); N]) -> Self {
        Self(
            value
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        )
    }
}

impl Environment for FixedEnvironment {
    fn read(&self, variable: &str) -> Result<Option<String>, Error> {
        Ok(self.0.get(variable).cloned())
    }
}
