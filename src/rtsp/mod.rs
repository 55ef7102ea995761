//! Embedded RTSP server runtime.
//!
//! The runtime is a single-consumer actor: a dedicated OS thread runs a
//! current-thread reactor plus a `LocalSet`, and every server mutation —
//! mountpoint add/remove, client connections, media lifecycle — happens
//! on that thread. Other threads interact only by submitting typed
//! commands; the underlying server state never leaves the actor.

mod connection;
pub mod media;
mod server;

pub use connection::{ClientDirective, ClientHandle};
pub use media::{ClientTransport, MediaFactory, MediaPipeline, MediaState, RtspProfile};

use std::sync::Arc;
use std::thread;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::session::PipelineContext;

/// Work submitted to the RTSP thread.
pub enum Command {
    /// Publish `factory` under `/<id>`.
    AddMountpoint {
        id: String,
        factory: MediaFactory,
        ctx: Arc<PipelineContext>,
    },
    /// Tear the mountpoint down: TEARDOWN to every client, close them,
    /// drop the media and the factory. Acked so teardown is observable.
    RemoveMountpoint {
        id: String,
        ctx: Arc<PipelineContext>,
        done: oneshot::Sender<()>,
    },
    /// Quit the server loop.
    Shutdown,
}

/// Cross-thread handle onto the RTSP server runtime.
pub struct RtspServerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    port: u16,
    thread: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
}

impl RtspServerHandle {
    /// Spawns the server thread and binds the listener; returns once the
    /// server is accepting. `port` 0 binds an ephemeral port.
    pub fn start(advertised_host: &str, port: u16) -> Result<RtspServerHandle> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<u16>>(1);
        let host = advertised_host.to_string();

        let thread = thread::Builder::new()
            .name("rtsp-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::rtsp(format!(
                            "cannot build rtsp runtime: {e}"
                        ))));
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = ready_tx.send(Err(Error::rtsp(format!(
                                "cannot bind rtsp port {port}: {e}"
                            ))));
                            return;
                        }
                    };
                    let actual_port = listener
                        .local_addr()
                        .map(|addr| addr.port())
                        .unwrap_or(port);
                    let shared = std::rc::Rc::new(std::cell::RefCell::new(server::Inner::new(
                        host,
                        actual_port,
                    )));
                    let _ = ready_tx.send(Ok(actual_port));
                    server::run(shared, listener, cmd_rx).await;
                });
            })
            .map_err(|e| Error::rtsp(format!("cannot spawn rtsp thread: {e}")))?;

        let port = ready_rx
            .recv()
            .map_err(|_| Error::rtsp("rtsp thread died before becoming ready"))??;
        info!(port, "rtsp server started");
        Ok(RtspServerHandle {
            cmd_tx,
            port,
            thread: std::sync::Mutex::new(Some(thread)),
        })
    }

    /// Actual listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn add_mountpoint(
        &self,
        id: String,
        factory: MediaFactory,
        ctx: Arc<PipelineContext>,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::AddMountpoint { id, factory, ctx })
            .map_err(|_| Error::rtsp("rtsp server is gone"))
    }

    /// Submits a removal; the returned receiver fires when the RTSP
    /// thread finished tearing the mountpoint down.
    pub fn remove_mountpoint(
        &self,
        id: String,
        ctx: Arc<PipelineContext>,
    ) -> Result<oneshot::Receiver<()>> {
        let (done, ack) = oneshot::channel();
        self.cmd_tx
            .send(Command::RemoveMountpoint { id, ctx, done })
            .map_err(|_| Error::rtsp("rtsp server is gone"))?;
        Ok(ack)
    }

    /// Quits the loop and joins the server thread. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("rtsp server thread panicked");
            }
        }
    }
}

impl Drop for RtspServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
