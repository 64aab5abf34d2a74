//! The query IR, its visitors, and the conversion of IR to dialect SQL.

pub mod sql;
