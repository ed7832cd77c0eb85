//! Module: session
//! Responsibility: the auto-tx wrapper. Read-only operations invoked
//! without an explicit transaction get a short-lived read transaction
//! bound to the lifetime of their output iterator; an explicit
//! transaction is used verbatim.
//! Does not own: write transactions; `Database::save`/`ensure_index`
//! take `Option<&mut heed::RwTxn>` directly rather than through this
//! type, since they are single point operations, not iterators.

use crate::db::store::RoTxn;

/// Either a transaction the caller already holds open, or one this
/// session opened for itself and will close on drop.
enum Inner<'env> {
    Borrowed(&'env RoTxn<'env>),
    Owned(RoTxn<'env>),
}

///
/// AutoTxn
///
/// Bound to the lifetime of whatever output iterator it backs. Dropping it
/// (by dropping that iterator, whether exhausted or abandoned early)
/// releases the owned read transaction, if any, immediately;
/// `heed::RoTxn::drop` returns the reader slot to the environment.
///

pub struct AutoTxn<'env> {
    inner: Inner<'env>,
}

impl<'env> AutoTxn<'env> {
    #[must_use]
    pub fn borrowed(txn: &'env RoTxn<'env>) -> Self {
        Self { inner: Inner::Borrowed(txn) }
    }

    #[must_use]
    pub fn owned(txn: RoTxn<'env>) -> Self {
        tracing::debug!("auto-tx: opened implicit read transaction");
        Self { inner: Inner::Owned(txn) }
    }

    #[must_use]
    pub fn txn(&self) -> &RoTxn<'env> {
        match &self.inner {
            Inner::Borrowed(t) => t,
            Inner::Owned(t) => t,
        }
    }
}

impl Drop for AutoTxn<'_> {
    fn drop(&mut self) {
        if matches!(self.inner, Inner::Owned(_)) {
            tracing::debug!("auto-tx: released implicit read transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    // `AutoTxn` needs a live `heed::Env` to construct either variant, so
    // its release-on-drop behavior is exercised by the integration tests
    // in `tests/` rather than here.
}
