//! Build query plans from host query trees and run them through an [`Executor`].
//!
//! A plan is immutable and can be shared between threads; the state of one run
//! (lookups built for client joins, variables read back from the database) lives
//! in a context created per call.

mod deferred;
pub mod error;
mod execution;
pub mod executor;
mod lookup;
pub mod plan;
mod projector;

pub use error::Error;
pub use executor::{BoxError, Executor, RowReader};
pub use plan::{build_plan, QueryPlan};
