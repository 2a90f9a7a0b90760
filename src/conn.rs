//! The interface for connections held by the pool.

use crate::dialer;
use crate::endpoint::Endpoint;

/// A live connection to a server endpoint.
///
/// The pool stores connections behind [`std::sync::Arc`] and identifies them
/// by reference, so the same handle a caller received from
/// [`crate::pool::Pool::get`] can later be recognized in
/// [`crate::pool::Pool::on_conn_closed`].
pub trait Conn: Send + Sync + 'static {
    /// The address of the peer this connection is bound to.
    ///
    /// Returns `None` once the peer has torn the connection down. The pool
    /// tolerates such connections transiently and evicts them on its next
    /// traversal.
    fn remote_addr(&self) -> Option<Endpoint>;

    /// Closes the connection. The pool ignores close failures.
    fn close(&self) -> Result<(), dialer::Error>;
}
