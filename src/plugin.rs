//! The host-facing plugin surface.
//!
//! One [`Plugin`] owns everything process-wide the original design kept in
//! globals: the configuration, the port pool, the sessions map, the RTSP
//! runtime, the registry clients, the message-handler task and the
//! keepalive/watchdog tasks. Tests can therefore instantiate as many
//! plugins as they like.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::config::PluginConfig;
use crate::error::{Error, Result};
use crate::net::SocketFactory;
use crate::ports::PortPool;
use crate::registry::RegistryClient;
use crate::rtsp::RtspServerHandle;
use crate::session::Session;

/// Host plugin API generation this crate implements.
pub const API_COMPATIBILITY: u32 = 10;
pub const PLUGIN_VERSION: u32 = 1;
pub const PLUGIN_VERSION_STRING: &str = env!("CARGO_PKG_VERSION");
pub const PLUGIN_NAME: &str = "RTSP source plugin";
pub const PLUGIN_DESCRIPTION: &str =
    "Bridges WebRTC peers to dynamically published RTSP mountpoints";
pub const PLUGIN_PACKAGE: &str = "plugin.rtsp-source";

/// Callbacks into the hosting gateway. All of them are synchronous and
/// must not block; the relay pair is called on the media path.
pub trait GatewayCallbacks: Send + Sync + 'static {
    fn relay_rtp(&self, handle: u64, video: bool, buf: &[u8]);
    fn relay_rtcp(&self, handle: u64, video: bool, buf: &[u8]);
    fn push_event(
        &self,
        handle: u64,
        transaction: Option<&str>,
        event: Value,
        jsep: Option<Value>,
    );
}

/// Synchronous outcome of `handle_message`; the real answer arrives later
/// as a pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageResult {
    /// The message was queued for asynchronous handling.
    OkWait(&'static str),
    /// The message could not even be queued.
    Error(String),
}

/// A queued peer message.
pub(crate) struct SessionMessage {
    pub handle: u64,
    pub transaction: Option<String>,
    pub message: Option<Value>,
    pub jsep: Option<Value>,
}

pub(crate) enum QueuedItem {
    Message(SessionMessage),
    Exit,
}

/// Process-wide state shared by every task of one plugin instance.
pub(crate) struct PluginInner {
    pub config: PluginConfig,
    pub gateway: Arc<dyn GatewayCallbacks>,
    pub sessions: DashMap<u64, Arc<Session>>,
    pub old_sessions: Mutex<Vec<Arc<Session>>>,
    pub factory: SocketFactory,
    pub registry: RegistryClient,
    pub rtsp: RtspServerHandle,
    pub stopping: AtomicBool,
    pub shutdown: Notify,
    pub pid: String,
}

impl PluginInner {
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn lookup(&self, handle: u64) -> Option<Arc<Session>> {
        self.sessions.get(&handle).map(|entry| entry.value().clone())
    }
}

/// The plugin instance the host drives.
pub struct Plugin {
    runtime: tokio::runtime::Runtime,
    inner: Arc<PluginInner>,
    msg_tx: mpsc::UnboundedSender<QueuedItem>,
    handler: Option<tokio::task::JoinHandle<()>>,
    keepalive: Option<tokio::task::JoinHandle<()>>,
    watchdog: Option<tokio::task::JoinHandle<()>>,
    destroyed: bool,
}

impl Plugin {
    /// Initializes the plugin: configuration, port pool, RTSP runtime,
    /// message handler, watchdog and keepalive. A failure here means the
    /// host should unload the plugin.
    pub fn init(gateway: Arc<dyn GatewayCallbacks>, config_dir: &Path) -> Result<Plugin> {
        let config = PluginConfig::load(config_dir, PLUGIN_PACKAGE)?;
        Self::init_with_config(gateway, config)
    }

    /// Like [`Plugin::init`], with an already-built configuration.
    pub fn init_with_config(
        gateway: Arc<dyn GatewayCallbacks>,
        config: PluginConfig,
    ) -> Result<Plugin> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("rtsp-source-worker")
            .enable_all()
            .build()
            .map_err(|e| Error::config(format!("cannot build runtime: {e}")))?;

        let pool = Arc::new(PortPool::new(config.udp_min_port, config.udp_max_port));
        let factory = SocketFactory::new(pool);
        let rtsp = RtspServerHandle::start(&config.rtsp_interface, config.rtsp_port)?;
        let pid = rand::random::<u32>().to_string();

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PluginInner {
            config,
            gateway,
            sessions: DashMap::new(),
            old_sessions: Mutex::new(Vec::new()),
            factory,
            registry: RegistryClient::new(),
            rtsp,
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            pid,
        });

        let handler = runtime.spawn(message_loop(Arc::clone(&inner), msg_rx));
        let watchdog = runtime.spawn(watchdog_loop(Arc::clone(&inner)));
        let keepalive = inner
            .config
            .keepalive_service_url
            .is_some()
            .then(|| runtime.spawn(keepalive_loop(Arc::clone(&inner))));

        info!(name = PLUGIN_NAME, pid = %inner.pid, "plugin initialized");
        Ok(Plugin {
            runtime,
            inner,
            msg_tx,
            handler: Some(handler),
            keepalive,
            watchdog: Some(watchdog),
            destroyed: false,
        })
    }

    /// Actual RTSP listening port (useful when configured as 0).
    pub fn rtsp_port(&self) -> u16 {
        self.inner.rtsp.port()
    }

    /// Ports currently held out of the UDP pool.
    pub fn allocated_udp_ports(&self) -> usize {
        self.inner.factory.pool().allocated()
    }

    pub fn api_compatibility(&self) -> u32 {
        API_COMPATIBILITY
    }

    pub fn version(&self) -> u32 {
        PLUGIN_VERSION
    }

    pub fn version_string(&self) -> &'static str {
        PLUGIN_VERSION_STRING
    }

    pub fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    pub fn description(&self) -> &'static str {
        PLUGIN_DESCRIPTION
    }

    pub fn package(&self) -> &'static str {
        PLUGIN_PACKAGE
    }

    /// Attaches a new peer under the host-supplied opaque handle.
    pub fn create_session(&self, handle: u64) -> Result<()> {
        if self.inner.is_stopping() {
            return Err(Error::Stopping);
        }
        let session = Arc::new(Session::new(handle));
        if self.inner.sessions.insert(handle, session).is_some() {
            warn!(handle, "replacing an existing session for this handle");
        }
        debug!(handle, "session created");
        Ok(())
    }

    /// Detaches a peer: tears the mountpoint down, releases sockets and
    /// parks the session for the lazy-free watchdog. A second call for
    /// the same handle is a no-op.
    pub fn destroy_session(&self, handle: u64) -> Result<()> {
        if self.inner.is_stopping() {
            return Err(Error::Stopping);
        }
        let Some((_, session)) = self.inner.sessions.remove(&handle) else {
            // Destroying an already-destroyed session is a no-op.
            let lingering = self
                .inner
                .old_sessions
                .lock()
                .unwrap()
                .iter()
                .any(|s| s.handle() == handle);
            return if lingering {
                Ok(())
            } else {
                Err(Error::SessionNotFound)
            };
        };
        let inner = Arc::clone(&self.inner);
        self.runtime.block_on(async move {
            inner.close_session(&session).await;
            inner.old_sessions.lock().unwrap().push(session);
        });
        Ok(())
    }

    pub fn query_session(&self, handle: u64) -> Result<Value> {
        if self.inner.is_stopping() {
            return Err(Error::Stopping);
        }
        let session = self.inner.lookup(handle).ok_or(Error::SessionNotFound)?;
        Ok(session.query())
    }

    /// Queues a peer message; the reply arrives as a pushed event with
    /// the same transaction.
    pub fn handle_message(
        &self,
        handle: u64,
        transaction: Option<String>,
        message: Option<Value>,
        jsep: Option<Value>,
    ) -> MessageResult {
        if self.inner.is_stopping() {
            return MessageResult::Error("Shutting down".to_string());
        }
        let queued = QueuedItem::Message(SessionMessage {
            handle,
            transaction,
            message,
            jsep,
        });
        match self.msg_tx.send(queued) {
            Ok(()) => MessageResult::OkWait("I'm taking my time!"),
            Err(_) => MessageResult::Error("Message queue is gone".to_string()),
        }
    }

    /// WebRTC media is up for this peer.
    pub fn setup_media(&self, handle: u64) {
        if self.inner.is_stopping() {
            return;
        }
        if let Some(session) = self.inner.lookup(handle) {
            if session.is_destroyed() {
                return;
            }
            session.clear_hangup();
            info!(handle, "webrtc media is now available");
        }
    }

    /// RTP from the peer; forwarded onto the pipeline when the stream is
    /// active. Never blocks, never allocates.
    pub fn incoming_rtp(&self, handle: u64, video: bool, buf: &[u8]) {
        if self.inner.is_stopping() {
            return;
        }
        if let Some(session) = self.inner.lookup(handle) {
            session.relay_rtp(video, buf);
        }
    }

    /// RTCP from the peer; forwarded onto the pipeline.
    pub fn incoming_rtcp(&self, handle: u64, video: bool, buf: &[u8]) {
        if self.inner.is_stopping() {
            return;
        }
        if let Some(session) = self.inner.lookup(handle) {
            session.relay_rtcp(video, buf);
        }
    }

    /// Data-channel traffic is accepted and ignored.
    pub fn incoming_data(&self, handle: u64, buf: &[u8]) {
        if self.inner.is_stopping() || buf.is_empty() {
            return;
        }
        if let Some(session) = self.inner.lookup(handle) {
            if !session.is_destroyed() {
                debug!(handle, len = buf.len(), "ignoring data channel message");
            }
        }
    }

    /// The gateway saw too many NACKs on this peer's link.
    pub fn slow_link(&self, handle: u64, uplink: bool, video: bool) {
        if self.inner.is_stopping() {
            return;
        }
        if let Some(session) = self.inner.lookup(handle) {
            if !session.is_destroyed() {
                self.inner.slow_link(&session, uplink, video);
            }
        }
    }

    /// The peer's media is gone; pushes `done` and resets the controls.
    pub fn hangup_media(&self, handle: u64) {
        if self.inner.is_stopping() {
            return;
        }
        if let Some(session) = self.inner.lookup(handle) {
            self.inner.hangup_media(&session);
        }
    }

    /// Tears the whole plugin down in the documented order: message
    /// handler, live sessions, RTSP runtime, keepalive (deregistering the
    /// process id), watchdog.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();

        let _ = self.msg_tx.send(QueuedItem::Exit);
        if let Some(handler) = self.handler.take() {
            let _ = self.runtime.block_on(handler);
        }

        // Close every live session.
        let handles: Vec<u64> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        for handle in handles {
            if let Some((_, session)) = self.inner.sessions.remove(&handle) {
                let inner = Arc::clone(&self.inner);
                self.runtime.block_on(async move {
                    inner.close_session(&session).await;
                });
            }
        }

        self.inner.rtsp.shutdown();

        if let Some(keepalive) = self.keepalive.take() {
            let _ = self.runtime.block_on(keepalive);
            if let Some(url) = &self.inner.config.keepalive_service_url {
                let registry = RegistryClient::new();
                let pid = self.inner.pid.clone();
                let url = url.clone();
                self.runtime.block_on(async move {
                    if let Err(e) = registry.delete(&url, &pid).await {
                        warn!(error = %e, "could not deregister process id");
                    }
                });
            }
        }

        if let Some(watchdog) = self.watchdog.take() {
            let _ = self.runtime.block_on(watchdog);
        }

        self.inner.old_sessions.lock().unwrap().clear();
        info!(name = PLUGIN_NAME, "plugin destroyed");
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Single consumer of the message queue; every SDP rewrite, socket
/// provisioning and registry create runs here, in per-session FIFO order.
async fn message_loop(
    inner: Arc<PluginInner>,
    mut rx: mpsc::UnboundedReceiver<QueuedItem>,
) {
    debug!("message handler running");
    while let Some(item) = rx.recv().await {
        match item {
            QueuedItem::Exit => break,
            QueuedItem::Message(message) => {
                if inner.is_stopping() {
                    break;
                }
                inner.handle_queued_message(message).await;
            }
        }
    }
    debug!("message handler finished");
}

/// Posts the process id to the registry every interval.
async fn keepalive_loop(inner: Arc<PluginInner>) {
    let Some(url) = inner.config.keepalive_service_url.clone() else {
        return;
    };
    let interval = inner.config.keepalive_interval;
    let registry = RegistryClient::new();
    info!(interval_secs = interval.as_secs(), "keepalive running");
    loop {
        if inner.is_stopping() {
            break;
        }
        if let Err(e) = registry
            .keepalive(&url, &inner.pid, interval.as_secs())
            .await
        {
            error!(error = %e, "could not send the keepalive request");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = inner.shutdown.notified() => break,
        }
    }
    info!("keepalive stopped");
}

/// Frees destroyed sessions a few seconds after their teardown.
async fn watchdog_loop(inner: Arc<PluginInner>) {
    const SCAN_INTERVAL: Duration = Duration::from_millis(500);
    const LINGER: Duration = Duration::from_secs(5);
    debug!("session watchdog running");
    loop {
        if inner.is_stopping() {
            break;
        }
        {
            let mut old = inner.old_sessions.lock().unwrap();
            let before = old.len();
            old.retain(|session| match session.destroyed_at() {
                Some(at) => at.elapsed() < LINGER,
                None => true,
            });
            if old.len() != before {
                debug!(freed = before - old.len(), "freed old sessions");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(SCAN_INTERVAL) => {}
            _ = inner.shutdown.notified() => break,
        }
    }
    debug!("session watchdog stopped");
}
