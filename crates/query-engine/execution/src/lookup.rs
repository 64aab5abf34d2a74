//! In-memory groupings of client-joined rows by their join key.

use multimap::MultiMap;
use query_engine_sql::sql::value::Value;

/// The rows of a client-joined query grouped by inner key, in query order.
#[derive(Debug, Default)]
pub(crate) struct Lookup {
    groups: MultiMap<Vec<Value>, Value>,
}

impl Lookup {
    pub(crate) fn new() -> Self {
        Lookup::default()
    }

    /// Add an element under `key`. Keys containing a null never match.
    pub(crate) fn insert(&mut self, key: Vec<Value>, element: Value) {
        if key.iter().any(Value::is_null) {
            return;
        }
        self.groups.insert(key, element);
    }

    /// The elements grouped under `key`, empty when there are none.
    pub(crate) fn get(&self, key: &[Value]) -> Vec<Value> {
        self.groups.get_vec(key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_keep_query_order() {
        let mut lookup = Lookup::new();
        lookup.insert(vec![Value::Int(1)], Value::from("a"));
        lookup.insert(vec![Value::Int(2)], Value::from("b"));
        lookup.insert(vec![Value::Int(1)], Value::from("c"));
        assert_eq!(
            lookup.get(&[Value::Int(1)]),
            vec![Value::from("a"), Value::from("c")]
        );
        assert!(lookup.get(&[Value::Int(3)]).is_empty());
    }

    #[test]
    fn null_keys_never_match() {
        let mut lookup = Lookup::new();
        lookup.insert(vec![Value::Null], Value::from("a"));
        assert!(lookup.get(&[Value::Null]).is_empty());
    }
}
