//! Non-fatal notes collected while translating and formatting.

use std::fmt;

/// Something in the IR that could not be represented, or a translation failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    pub message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
        }
    }

    /// The diagnostic reported for a node kind the active dialect cannot express.
    pub fn unsupported(kind: &str) -> Self {
        Diagnostic::new(format!("The construct '{kind}' is not supported"))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
