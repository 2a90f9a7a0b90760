//! corral is an endpoint-restricted connection pooling crate.
//!
//! A [pool::Pool] holds connections to a service whose set of server
//! endpoints can change at runtime. A connection's remote address must be in
//! the current endpoint list; when an endpoint is removed, its pooled
//! connections are evicted and closed after a grace period so in-flight work
//! can drain. Endpoints that cannot be dialed are quarantined under
//! exponential backoff and probed by a background maintenance task, which
//! also keeps the connection count balanced across reachable endpoints.
//!
//! It uses the following terminology:
//! * Endpoints are opaque address strings (e.g. `"host:port"`) the pool may
//!   dial.
//! * Connections are whatever the [dialer::Dialer] produces; the pool only
//!   requires the small [conn::Conn] interface from them.
//!
//! # Usage
//!
//! * The main interface for this crate is [pool::Pool].
//! * To construct a pool, you must supply a [dialer::Dialer], which specifies
//!   how to create a connection to an endpoint. Endpoint updates are pushed
//!   in by the application (typically from a service-discovery watcher)
//!   through [pool::Pool::update_endpoints].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use corral::dialers::tcp::TcpDialer;
//! use corral::endpoint::Endpoint;
//! use corral::pool::{Pool, PoolOptions};
//!
//! let options = PoolOptions {
//!     conns_per_endpoint: 2,
//!     log: Some(log.clone()),
//!     ..Default::default()
//! };
//! let pool = Pool::new(
//!     vec![Endpoint::from("10.0.0.1:7000"), Endpoint::from("10.0.0.2:7000")],
//!     Arc::new(TcpDialer {}),
//!     options,
//! )
//! .await?;
//!
//! let conn = pool.get().await?;
//! // ... use the connection ...
//! pool.put(conn, None);
//!
//! // Later, when discovery reports a change:
//! pool.update_endpoints(all, &added, &deleted);
//! ```

// Public API
pub mod backoff;
pub mod conn;
pub mod dialer;
pub mod endpoint;
pub mod pool;

// Necessary for implementation
mod health;
mod inventory;
mod queue;
mod registry;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod dialers;
