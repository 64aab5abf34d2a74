//! Translate a host query tree into relational IR ready to be formatted for a dialect.

pub mod aliasing;
pub mod column_projector;
pub mod error;
pub mod evaluator;
pub mod helpers;
pub mod language;
pub mod mapping;
pub mod parameterize;
pub mod policy;
pub mod reduce;
pub mod scope;

use query_engine_sql::sql::ast::ExprRef;
use query_engine_sql::sql::diagnostics::Diagnostic;

use helpers::{Env, State};

/// The translated IR and whatever the translation could not vouch for.
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    pub expression: ExprRef,
    pub diagnostics: Vec<Diagnostic>,
}

/// Run every translation stage over `expression`.
///
/// Aliases are minted from a fresh [`State`], so translating equal trees gives
/// equal IR.
pub fn translate(env: &Env, expression: &ExprRef) -> Result<Translated, error::Error> {
    let mut state = State::new();

    let evaluated = evaluator::partially_evaluate(expression);
    let bound = mapping::binder::bind(env, &mut state, &evaluated)?;
    let mapped = reduce::reduce(&bound);
    tracing::debug!(dialect = env.dialect.name(), "Mapped IR: {:?}", mapped);

    let with_policy = policy::translate(env, &mut state, &mapped)?;
    tracing::debug!("IR after policy: {:?}", with_policy);

    let translated = language::translate(env.dialect, &with_policy);
    tracing::debug!("Translated IR: {:?}", translated);

    let diagnostics = scope::check_aliases(&translated);
    for diagnostic in &diagnostics {
        tracing::warn!("{}", diagnostic.message);
    }
    Ok(Translated {
        expression: translated,
        diagnostics,
    })
}
