//! Utilities to help with testing corral

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::conn::Conn;
use crate::dialer::{self, Dialer};
use crate::endpoint::Endpoint;

/// A test-only connection that reports the endpoint it was dialed to as its
/// remote address, until it is closed.
pub struct TestConn {
    addr: RwLock<Option<Endpoint>>,
    closes: Arc<AtomicUsize>,
}

impl TestConn {
    fn new(addr: Endpoint, closes: Arc<AtomicUsize>) -> Self {
        Self {
            addr: RwLock::new(Some(addr)),
            closes,
        }
    }
}

impl Conn for TestConn {
    fn remote_addr(&self) -> Option<Endpoint> {
        self.addr.read().unwrap().clone()
    }

    fn close(&self) -> Result<(), dialer::Error> {
        self.addr.write().unwrap().take();
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A scriptable dialer: endpoints can be switched between succeeding and
/// failing at runtime, dials are counted per endpoint, and closes of the
/// connections it produced are counted globally.
pub struct TestDialer {
    failing: DashSet<Endpoint>,
    dials: DashMap<Endpoint, usize>,
    closes: Arc<AtomicUsize>,
}

impl TestDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failing: DashSet::new(),
            dials: DashMap::new(),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Makes future dials to `endpoint` fail.
    pub fn fail(&self, endpoint: &str) {
        self.failing.insert(Endpoint::from(endpoint));
    }

    /// Makes future dials to `endpoint` succeed again.
    pub fn succeed(&self, endpoint: &str) {
        self.failing.remove(endpoint);
    }

    pub fn dials_to(&self, endpoint: &str) -> usize {
        self.dials.get(endpoint).map(|count| *count).unwrap_or(0)
    }

    pub fn closed(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for TestDialer {
    type Conn = TestConn;

    async fn dial(&self, endpoint: &Endpoint) -> Result<TestConn, dialer::Error> {
        self.dials
            .entry(endpoint.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);
        if self.failing.contains(endpoint) {
            return Err(anyhow::anyhow!("connection refused: {}", endpoint).into());
        }
        Ok(TestConn::new(endpoint.clone(), self.closes.clone()))
    }
}
