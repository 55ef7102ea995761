//! The RTSP server actor.
//!
//! All server state lives on one dedicated thread; the rest of the plugin
//! talks to it exclusively through the typed command queue. Mountpoint
//! mutations, client connections and media lifecycle all execute here.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::rtsp::connection;
use crate::rtsp::media::{MediaFactory, MediaPipeline};
use crate::rtsp::Command;
use crate::session::PipelineContext;

/// One published mountpoint.
pub(crate) struct Mount {
    pub factory: MediaFactory,
    pub ctx: Arc<PipelineContext>,
    /// Shared media, created on the first SETUP.
    pub media: Option<Box<dyn MediaPipeline>>,
}

pub(crate) struct Inner {
    pub mounts: HashMap<String, Mount>,
    pub advertised_host: String,
    pub port: u16,
    next_conn_id: u64,
}

impl Inner {
    pub fn new(advertised_host: String, port: u16) -> Inner {
        Inner {
            mounts: HashMap::new(),
            advertised_host,
            port,
            next_conn_id: 0,
        }
    }

    fn next_conn_id(&mut self) -> u64 {
        self.next_conn_id += 1;
        self.next_conn_id
    }
}

pub(crate) type Shared = Rc<RefCell<Inner>>;

pub(crate) async fn run(
    shared: Shared,
    listener: TcpListener,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    info!(port = shared.borrow().port, "rtsp server loop running");
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::AddMountpoint { id, factory, ctx }) => {
                        add_mountpoint(&shared, id, factory, ctx);
                    }
                    Some(Command::RemoveMountpoint { id, ctx, done }) => {
                        remove_mountpoint(&shared, &id, &ctx);
                        let _ = done.send(());
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let conn_id = shared.borrow_mut().next_conn_id();
                        debug!(conn_id, %peer, "accepted rtsp connection");
                        tokio::task::spawn_local(connection::serve(
                            stream,
                            Rc::clone(&shared),
                            conn_id,
                        ));
                    }
                    Err(e) => warn!(error = %e, "rtsp accept failed"),
                }
            }
        }
    }
    shutdown(&shared);
    info!("rtsp server loop finished");
    // Dropping the LocalSet cancels the remaining connection tasks.
}

fn add_mountpoint(shared: &Shared, id: String, factory: MediaFactory, ctx: Arc<PipelineContext>) {
    {
        let mut subscriptions = ctx.subscriptions.lock().unwrap();
        subscriptions.media_configure = true;
        subscriptions.client_connected = true;
    }
    let mut inner = shared.borrow_mut();
    if let Some(previous) = inner.mounts.insert(
        id.clone(),
        Mount {
            factory,
            ctx,
            media: None,
        },
    ) {
        warn!(mount = %id, "replacing an existing mountpoint");
        teardown_mount(previous);
    }
    info!(mount = %id, "mountpoint added");
}

fn remove_mountpoint(shared: &Shared, id: &str, ctx: &Arc<PipelineContext>) {
    // Direct a TEARDOWN at every still-connected client, then close it.
    for client in ctx.take_clients() {
        client.send_teardown(&ctx.rtsp_url);
        client.close();
    }
    if let Some(mount) = shared.borrow_mut().mounts.remove(id) {
        teardown_mount(mount);
        info!(mount = %id, "mountpoint removed");
    }
    ctx.subscriptions.lock().unwrap().clear();
}

fn teardown_mount(mut mount: Mount) {
    if let Some(mut media) = mount.media.take() {
        media.teardown();
    }
    mount.ctx.subscriptions.lock().unwrap().clear();
}

fn shutdown(shared: &Shared) {
    let mounts: Vec<(String, Mount)> = shared.borrow_mut().mounts.drain().collect();
    for (id, mount) in mounts {
        for client in mount.ctx.take_clients() {
            client.send_teardown(&mount.ctx.rtsp_url);
            client.close();
        }
        debug!(mount = %id, "mountpoint closed at shutdown");
        teardown_mount(mount);
    }
}
