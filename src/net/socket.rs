//! UDP socket factory over the port pool.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ports::PortPool;

const LOOPBACK: &str = "127.0.0.1";
const MAX_DATAGRAM: usize = 1500;

/// One loopback UDP endpoint on a pool port.
///
/// Server endpoints are bound and receive; client endpoints are bound to
/// their own pool port and connected to a server endpoint's port. The
/// port is returned to the pool exactly once, by [`SocketFactory::close`].
#[derive(Debug)]
pub struct UdpEndpoint {
    port: u16,
    socket: Arc<UdpSocket>,
    is_client: bool,
    read_task: Option<JoinHandle<()>>,
}

impl UdpEndpoint {
    /// Pool port this endpoint is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Shared handle for non-owning adoption by the pipeline.
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Best-effort datagram send on a connected endpoint; errors are
    /// swallowed (the media path drops silently).
    pub fn send_best_effort(&self, buf: &[u8]) {
        let _ = self.socket.try_send(buf);
    }
}

/// Creates and closes [`UdpEndpoint`]s against a shared [`PortPool`].
#[derive(Debug, Clone)]
pub struct SocketFactory {
    pool: Arc<PortPool>,
}

impl SocketFactory {
    pub fn new(pool: Arc<PortPool>) -> SocketFactory {
        SocketFactory { pool }
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Opens a server endpoint: binds loopback on a pool port.
    pub async fn open_server(&self) -> Result<UdpEndpoint> {
        self.open(None).await
    }

    /// Opens a client endpoint: binds loopback on its own pool port, then
    /// connects to `loopback:peer_port`.
    pub async fn open_client(&self, peer_port: u16) -> Result<UdpEndpoint> {
        self.open(Some(peer_port)).await
    }

    async fn open(&self, connect_to: Option<u16>) -> Result<UdpEndpoint> {
        // A pool port can still be held by a lingering socket the pipeline
        // has not dropped yet; retry with different ports up to capacity.
        let attempts = self.pool.capacity();
        for _ in 0..attempts {
            let port = self.pool.acquire(None)?;
            let socket = match UdpSocket::bind((LOOPBACK, port)).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(port, error = %e, "bind failed, retrying on another port");
                    self.pool.release(port);
                    continue;
                }
            };
            if let Some(peer_port) = connect_to {
                if let Err(e) = socket.connect((LOOPBACK, peer_port)).await {
                    warn!(port, peer_port, error = %e, "connect failed, retrying");
                    self.pool.release(port);
                    continue;
                }
            }
            debug!(port, client = connect_to.is_some(), "opened udp endpoint");
            return Ok(UdpEndpoint {
                port,
                socket: Arc::new(socket),
                is_client: connect_to.is_some(),
                read_task: None,
            });
        }
        Err(Error::socket("no bindable port left in the pool"))
    }

    /// Registers `on_datagram` to run for every datagram arriving on the
    /// endpoint until it returns `false` or the read is detached. Any
    /// previous registration is replaced.
    pub fn attach_read<F>(&self, endpoint: &mut UdpEndpoint, mut on_datagram: F)
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        self.detach_read(endpoint);
        let socket = Arc::clone(&endpoint.socket);
        endpoint.read_task = Some(tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(len) => {
                        if !on_datagram(&buf[..len]) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "udp read source stopped");
                        break;
                    }
                }
            }
        }));
    }

    /// Removes a read registration, if any. Idempotent.
    pub fn detach_read(&self, endpoint: &mut UdpEndpoint) {
        if let Some(task) = endpoint.read_task.take() {
            task.abort();
        }
    }

    /// Closes an endpoint: detaches the read source and returns the port
    /// to the pool.
    pub fn close(&self, mut endpoint: UdpEndpoint) {
        self.detach_read(&mut endpoint);
        self.pool.release(endpoint.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn factory(min: u16, max: u16) -> SocketFactory {
        SocketFactory::new(Arc::new(PortPool::new(min, max)))
    }

    #[tokio::test]
    async fn server_and_client_pair_talks_over_loopback() {
        let factory = factory(42000, 42063);
        let server = factory.open_server().await.unwrap();
        let client = factory.open_client(server.port()).await.unwrap();
        assert!(!server.is_client());
        assert!(client.is_client());
        assert_ne!(server.port(), client.port());

        client.send_best_effort(b"ping");
        let mut buf = [0u8; 16];
        let len = tokio::time::timeout(Duration::from_secs(1), server.socket().recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"ping");

        factory.close(client);
        factory.close(server);
        assert_eq!(factory.pool().allocated(), 0);
    }

    #[tokio::test]
    async fn read_callback_runs_until_it_declines() {
        let factory = factory(42100, 42163);
        let mut server = factory.open_server().await.unwrap();
        let client = factory.open_client(server.port()).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_cb = Arc::clone(&seen);
        factory.attach_read(&mut server, move |_| {
            seen_in_cb.fetch_add(1, Ordering::SeqCst) < 1
        });

        client.send_best_effort(b"a");
        client.send_best_effort(b"b");
        client.send_best_effort(b"c");
        tokio::time::sleep(Duration::from_millis(200)).await;
        // The callback declined after the second datagram.
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        factory.close(client);
        factory.close(server);
    }

    #[tokio::test]
    async fn tiny_pool_cannot_cover_a_session() {
        let factory = factory(42200, 42200);
        let first = factory.open_server().await.unwrap();
        assert!(factory.open_server().await.is_err());
        factory.close(first);
    }
}
