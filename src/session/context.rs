//! Per-mountpoint pipeline context.
//!
//! Owned by the session controller and consulted by the RTSP thread: it
//! carries the pre-bound pipeline-side sockets the media adopts, the RTCP
//! return bindings, and the list of currently-SETUP RTSP clients so
//! mountpoint teardown can direct a TEARDOWN at each of them.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Weak};

use tokio::net::UdpSocket;

use crate::rtsp::ClientHandle;
use crate::session::Session;

/// Non-owning views of the four server sockets the pipeline's UDP
/// sources adopt. The session controller remains the sole closer.
#[derive(Debug, Clone)]
pub struct PipelineSockets {
    pub video_rtp: Arc<UdpSocket>,
    pub video_rtcp: Arc<UdpSocket>,
    pub audio_rtp: Arc<UdpSocket>,
    pub audio_rtcp: Arc<UdpSocket>,
}

/// Binding consulted by an RTCP return reader; the weak reference is
/// validated against the live session on every datagram.
#[derive(Debug, Clone)]
pub struct RtcpReturnBinding {
    pub session: Weak<Session>,
    pub is_video: bool,
}

/// Event subscriptions held for the lifetime of a mountpoint; each is
/// cleared idempotently on teardown.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    pub media_configure: bool,
    pub client_connected: bool,
    pub target_state: bool,
}

impl SubscriptionSet {
    pub fn clear(&mut self) {
        self.media_configure = false;
        self.client_connected = false;
        self.target_state = false;
    }

    pub fn any(&self) -> bool {
        self.media_configure || self.client_connected || self.target_state
    }
}

/// Companion state of one published mountpoint.
#[derive(Debug)]
pub struct PipelineContext {
    /// Stream id; the mount lives at `/<id>`.
    pub id: String,
    /// Full advertised URL of the mount.
    pub rtsp_url: String,
    pub sockets: PipelineSockets,
    pub rtcp_video: RtcpReturnBinding,
    pub rtcp_audio: RtcpReturnBinding,
    /// Currently-SETUP RTSP clients of this mount.
    pub clients: Mutex<Vec<ClientHandle>>,
    pub subscriptions: Mutex<SubscriptionSet>,
    /// Set once the mount's media started playing; consulted by the
    /// keyframe-request workaround.
    pub playing: AtomicBool,
}

impl PipelineContext {
    /// Adds a client once; repeated SETUPs on the same connection keep a
    /// single entry.
    pub fn add_client(&self, handle: ClientHandle) {
        let mut clients = self.clients.lock().unwrap();
        if !clients.iter().any(|c| c.conn_id() == handle.conn_id()) {
            clients.push(handle);
        }
    }

    /// Removes a client; absent clients are ignored.
    pub fn remove_client(&self, conn_id: u64) {
        self.clients
            .lock()
            .unwrap()
            .retain(|c| c.conn_id() != conn_id);
    }

    /// Drains the client list for teardown.
    pub fn take_clients(&self) -> Vec<ClientHandle> {
        std::mem::take(&mut *self.clients.lock().unwrap())
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}
