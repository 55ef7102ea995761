//! Per-peer session state and the controller driving it.

mod context;
mod controller;

pub use context::{PipelineContext, PipelineSockets, RtcpReturnBinding, SubscriptionSet};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::net::UdpSocket;

use crate::net::{SocketFactory, UdpEndpoint};
use crate::sdp::Codec;

/// Bitrate assumed when a slow link arrives with no cap configured.
pub const DEFAULT_SLOWLINK_BITRATE: u64 = 512_000;

/// Floor the slow-link halving never goes below.
pub const MIN_SLOWLINK_BITRATE: u64 = 64_000;

/// The five sockets gluing one stream to the pipeline.
///
/// Server sockets live on the pipeline side (two feed RTP/RTCP in, one
/// receives the pipeline's RTCP out); client sockets are the gateway-side
/// senders connected to their server counterparts.
#[derive(Debug)]
pub struct StreamSockets {
    pub rtp_srv: UdpEndpoint,
    pub rtp_cli: UdpEndpoint,
    pub rtcp_rcv_srv: UdpEndpoint,
    pub rtcp_rcv_cli: UdpEndpoint,
    pub rtcp_snd_srv: UdpEndpoint,
}

impl StreamSockets {
    fn close_all(self, factory: &SocketFactory) {
        factory.close(self.rtp_srv);
        factory.close(self.rtp_cli);
        factory.close(self.rtcp_rcv_srv);
        factory.close(self.rtcp_rcv_cli);
        factory.close(self.rtcp_snd_srv);
    }

    fn ports(&self) -> [u16; 5] {
        [
            self.rtp_srv.port(),
            self.rtp_cli.port(),
            self.rtcp_rcv_srv.port(),
            self.rtcp_rcv_cli.port(),
            self.rtcp_snd_srv.port(),
        ]
    }
}

/// All ten sockets of a session, both streams.
#[derive(Debug)]
pub struct SessionSockets {
    pub video: StreamSockets,
    pub audio: StreamSockets,
}

impl SessionSockets {
    pub fn count(&self) -> usize {
        10
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports = self.video.ports().to_vec();
        ports.extend(self.audio.ports());
        ports
    }

    pub(crate) fn close_all(self, factory: &SocketFactory) {
        self.video.close_all(factory);
        self.audio.close_all(factory);
    }
}

/// Negotiated codec state per stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Negotiated {
    pub video: Codec,
    pub video_pt: i32,
    pub audio: Codec,
    pub audio_pt: i32,
}

impl Default for Negotiated {
    fn default() -> Self {
        Negotiated {
            video: Codec::Invalid,
            video_pt: -1,
            audio: Codec::Invalid,
            audio_pt: -1,
        }
    }
}

/// Gateway-side sender sockets kept aside so the synchronous relay entry
/// points never touch the full socket table.
#[derive(Debug)]
struct RelayPaths {
    video_rtp: Arc<UdpSocket>,
    audio_rtp: Arc<UdpSocket>,
    video_rtcp: Arc<UdpSocket>,
    audio_rtcp: Arc<UdpSocket>,
}

/// One attached peer.
///
/// The relay-path flags are atomics: `incoming_rtp`/`incoming_rtcp` run on
/// the gateway's threads and must neither block nor allocate. Everything
/// negotiated lives behind plain mutexes touched only by the message
/// handler and destroy paths.
#[derive(Debug)]
pub struct Session {
    handle: u64,
    id: Mutex<Option<String>>,
    rtsp_url: Mutex<Option<String>>,
    registry_id: Mutex<Option<String>>,
    audio_active: AtomicBool,
    video_active: AtomicBool,
    bitrate: AtomicU64,
    slowlink_count: AtomicU64,
    hanging_up: AtomicBool,
    destroyed: AtomicBool,
    destroyed_at: Mutex<Option<Instant>>,
    codecs: Mutex<Negotiated>,
    sockets: Mutex<Option<SessionSockets>>,
    relay: RwLock<Option<RelayPaths>>,
    pipeline_ctx: Mutex<Option<Arc<PipelineContext>>>,
}

impl Session {
    pub fn new(handle: u64) -> Session {
        Session {
            handle,
            id: Mutex::new(None),
            rtsp_url: Mutex::new(None),
            registry_id: Mutex::new(None),
            audio_active: AtomicBool::new(true),
            video_active: AtomicBool::new(true),
            bitrate: AtomicU64::new(0),
            slowlink_count: AtomicU64::new(0),
            hanging_up: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            destroyed_at: Mutex::new(None),
            codecs: Mutex::new(Negotiated::default()),
            sockets: Mutex::new(None),
            relay: RwLock::new(None),
            pipeline_ctx: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn id(&self) -> Option<String> {
        self.id.lock().unwrap().clone()
    }

    pub fn set_id(&self, id: String) {
        *self.id.lock().unwrap() = Some(id);
    }

    pub fn rtsp_url(&self) -> Option<String> {
        self.rtsp_url.lock().unwrap().clone()
    }

    pub fn set_rtsp_url(&self, url: String) {
        *self.rtsp_url.lock().unwrap() = Some(url);
    }

    pub fn registry_id(&self) -> Option<String> {
        self.registry_id.lock().unwrap().clone()
    }

    pub fn set_registry_id(&self, id: Option<String>) {
        *self.registry_id.lock().unwrap() = id;
    }

    pub fn audio_active(&self) -> bool {
        self.audio_active.load(Ordering::Relaxed)
    }

    pub fn set_audio_active(&self, active: bool) {
        self.audio_active.store(active, Ordering::Relaxed);
    }

    pub fn video_active(&self) -> bool {
        self.video_active.load(Ordering::Relaxed)
    }

    pub fn set_video_active(&self, active: bool) {
        self.video_active.store(active, Ordering::Relaxed);
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::Relaxed)
    }

    pub fn set_bitrate(&self, bitrate: u64) {
        self.bitrate.store(bitrate, Ordering::Relaxed);
    }

    pub fn slowlink_count(&self) -> u64 {
        self.slowlink_count.load(Ordering::Relaxed)
    }

    pub fn bump_slowlink(&self) -> u64 {
        self.slowlink_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_hanging_up(&self) -> bool {
        self.hanging_up.load(Ordering::Relaxed)
    }

    /// Flags the hangup; returns whether it was already in progress.
    pub fn begin_hangup(&self) -> bool {
        self.hanging_up.swap(true, Ordering::SeqCst)
    }

    pub fn clear_hangup(&self) {
        self.hanging_up.store(false, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Flags destruction; returns whether it was already destroyed.
    pub(crate) fn begin_destroy(&self) -> bool {
        self.destroyed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn stamp_destroyed(&self) {
        *self.destroyed_at.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn destroyed_at(&self) -> Option<Instant> {
        *self.destroyed_at.lock().unwrap()
    }

    pub(crate) fn codecs(&self) -> Negotiated {
        *self.codecs.lock().unwrap()
    }

    pub(crate) fn set_codecs(&self, negotiated: Negotiated) {
        *self.codecs.lock().unwrap() = negotiated;
    }

    pub fn socket_count(&self) -> usize {
        self.sockets
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.count())
            .unwrap_or(0)
    }

    pub fn socket_ports(&self) -> Vec<u16> {
        self.sockets
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.ports())
            .unwrap_or_default()
    }

    pub(crate) fn install_sockets(&self, sockets: SessionSockets) {
        let paths = RelayPaths {
            video_rtp: sockets.video.rtp_cli.socket(),
            audio_rtp: sockets.audio.rtp_cli.socket(),
            video_rtcp: sockets.video.rtcp_rcv_cli.socket(),
            audio_rtcp: sockets.audio.rtcp_rcv_cli.socket(),
        };
        *self.sockets.lock().unwrap() = Some(sockets);
        *self.relay.write().unwrap() = Some(paths);
    }

    pub(crate) fn take_sockets(&self) -> Option<SessionSockets> {
        *self.relay.write().unwrap() = None;
        self.sockets.lock().unwrap().take()
    }

    pub(crate) fn pipeline_ctx(&self) -> Option<Arc<PipelineContext>> {
        self.pipeline_ctx.lock().unwrap().clone()
    }

    pub(crate) fn set_pipeline_ctx(&self, ctx: Arc<PipelineContext>) {
        *self.pipeline_ctx.lock().unwrap() = Some(ctx);
    }

    pub(crate) fn take_pipeline_ctx(&self) -> Option<Arc<PipelineContext>> {
        self.pipeline_ctx.lock().unwrap().take()
    }

    /// Drops the identifying strings on teardown.
    pub(crate) fn clear_identity(&self) {
        *self.id.lock().unwrap() = None;
        *self.rtsp_url.lock().unwrap() = None;
        *self.registry_id.lock().unwrap() = None;
    }

    /// Resets the peer-controllable knobs after a hangup.
    pub fn reset_controls(&self) {
        self.set_audio_active(true);
        self.set_video_active(true);
        self.set_bitrate(0);
    }

    /// Best-effort RTP toward the pipeline; honours the active flags.
    pub fn relay_rtp(&self, video: bool, buf: &[u8]) {
        if self.is_destroyed() || self.is_hanging_up() {
            return;
        }
        if video && !self.video_active() {
            return;
        }
        if !video && !self.audio_active() {
            return;
        }
        if let Some(paths) = &*self.relay.read().unwrap() {
            let socket = if video {
                &paths.video_rtp
            } else {
                &paths.audio_rtp
            };
            let _ = socket.try_send(buf);
        }
    }

    /// Best-effort RTCP toward the pipeline.
    pub fn relay_rtcp(&self, video: bool, buf: &[u8]) {
        if self.is_destroyed() || self.is_hanging_up() {
            return;
        }
        if let Some(paths) = &*self.relay.read().unwrap() {
            let socket = if video {
                &paths.video_rtcp
            } else {
                &paths.audio_rtcp
            };
            let _ = socket.try_send(buf);
        }
    }

    /// Snapshot reported through the host's query surface.
    pub fn query(&self) -> Value {
        json!({
            "audio_active": self.audio_active(),
            "video_active": self.video_active(),
            "bitrate": self.bitrate(),
            "slowlink_count": self.slowlink_count(),
            "destroyed": self
                .destroyed_at()
                .map(|at| at.elapsed().as_micros() as u64)
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_a_fresh_attach() {
        let session = Session::new(7);
        assert_eq!(session.handle(), 7);
        assert!(session.audio_active());
        assert!(session.video_active());
        assert_eq!(session.bitrate(), 0);
        assert_eq!(session.slowlink_count(), 0);
        assert!(!session.is_destroyed());
        assert_eq!(session.socket_count(), 0);
        let codecs = session.codecs();
        assert_eq!(codecs.video, Codec::Invalid);
        assert_eq!(codecs.video_pt, -1);
    }

    #[test]
    fn hangup_and_destroy_flags_latch() {
        let session = Session::new(1);
        assert!(!session.begin_hangup());
        assert!(session.begin_hangup());
        session.clear_hangup();
        assert!(!session.begin_hangup());

        assert!(!session.begin_destroy());
        assert!(session.begin_destroy());
    }

    #[test]
    fn query_reports_the_control_state() {
        let session = Session::new(1);
        session.set_bitrate(128_000);
        session.set_video_active(false);
        let info = session.query();
        assert_eq!(info["bitrate"], 128_000);
        assert_eq!(info["video_active"], false);
        assert_eq!(info["audio_active"], true);
        assert_eq!(info["destroyed"], 0);
    }

    #[test]
    fn relay_is_a_no_op_without_sockets() {
        let session = Session::new(1);
        // Nothing to send on; must simply not panic or block.
        session.relay_rtp(true, &[0x80, 0x60]);
        session.relay_rtcp(false, &[0x80, 0xc8]);
    }
}
