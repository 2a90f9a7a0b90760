//! The interface for establishing connections to endpoints.

use crate::conn::Conn;
use crate::endpoint::Endpoint;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Describes how a connection to an endpoint should be constructed.
///
/// The pool treats any dial error as "endpoint unreachable" and quarantines
/// the endpoint under backoff. Dial timeouts are the dialer's responsibility.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: Conn;

    /// Creates a connection to an endpoint.
    async fn dial(&self, endpoint: &Endpoint) -> Result<Self::Conn, Error>;
}

pub type SharedDialer<C> = Arc<dyn Dialer<Conn = C>>;
