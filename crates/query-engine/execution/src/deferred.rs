//! Deferred query results, readable once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use query_engine_sql::sql::value::{Deferred, DeferredError, DeferredSource, Value, ValueIter};

use crate::error::Error;

struct SinglePass {
    inner: Deferred,
    enumerated: AtomicBool,
}

impl DeferredSource for SinglePass {
    fn enumerate(&self) -> Result<ValueIter, DeferredError> {
        if self.enumerated.swap(true, Ordering::SeqCst) {
            return Err(DeferredError {
                message: Error::AlreadyEnumerated.to_string(),
            });
        }
        self.inner.enumerate()
    }
}

/// Rows read ahead of time.
struct Buffered(Vec<Value>);

impl DeferredSource for Buffered {
    fn enumerate(&self) -> Result<ValueIter, DeferredError> {
        Ok(Box::new(self.0.clone().into_iter().map(Ok)))
    }
}

/// Read every row of `inner` now.
pub(crate) fn buffered(inner: &Deferred) -> Result<Deferred, Error> {
    let rows = inner
        .collect()
        .map_err(|error| Error::Deferred(error.message))?;
    Ok(Deferred(Arc::new(Buffered(rows))))
}

/// Wrap the rows of a deferred query so that a second enumeration fails.
pub(crate) fn single_pass(inner: Deferred) -> Deferred {
    Deferred(Arc::new(SinglePass {
        inner,
        enumerated: AtomicBool::new(false),
    }))
}
