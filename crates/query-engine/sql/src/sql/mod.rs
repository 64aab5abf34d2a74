//! The SQL-shaped intermediate representation shared by every translation stage.

pub mod ast;
pub mod checks;
pub mod convert;
pub mod diagnostics;
pub mod dialect;
pub mod evaluate;
pub mod helpers;
pub mod string;
pub mod types;
pub mod value;
pub mod visitor;
