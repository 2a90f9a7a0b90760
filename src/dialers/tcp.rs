//! Implementation of [Dialer] for TCP.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::conn::Conn;
use crate::dialer::{Dialer, Error};
use crate::endpoint::Endpoint;

/// A TCP connection as produced by [TcpDialer].
///
/// The remote address is captured at dial time and reported until the
/// connection is closed, after which [Conn::remote_addr] returns `None`.
pub struct TcpConn {
    peer: RwLock<Option<Endpoint>>,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpConn {
    fn new(stream: TcpStream, peer: Endpoint) -> Self {
        Self {
            peer: RwLock::new(Some(peer)),
            stream: Mutex::new(Some(stream)),
        }
    }

    /// Detaches the underlying stream, e.g. to hand it to an I/O driver.
    /// A later [Conn::close] then only blanks the stored address.
    pub fn take_stream(&self) -> Option<TcpStream> {
        self.stream.lock().ok().and_then(|mut stream| stream.take())
    }
}

impl Conn for TcpConn {
    fn remote_addr(&self) -> Option<Endpoint> {
        self.peer.read().ok().and_then(|peer| peer.clone())
    }

    fn close(&self) -> Result<(), Error> {
        if let Ok(mut peer) = self.peer.write() {
            peer.take();
        }
        // Dropping the stream closes the socket.
        if let Ok(mut stream) = self.stream.lock() {
            stream.take();
        }
        Ok(())
    }
}

pub struct TcpDialer {}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpConn;

    async fn dial(&self, endpoint: &Endpoint) -> Result<TcpConn, Error> {
        let stream = TcpStream::connect(endpoint.as_str())
            .await
            .map_err(anyhow::Error::new)?;
        let peer = stream.peer_addr().map_err(anyhow::Error::new)?;
        Ok(TcpConn::new(stream, Endpoint::new(peer)))
    }
}
