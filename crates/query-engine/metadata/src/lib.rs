//! Read-only mapping metadata consumed by the query engine.

pub mod metadata;
