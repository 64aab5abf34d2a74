//! Translation of host query trees into relational IR.

pub mod translation;
