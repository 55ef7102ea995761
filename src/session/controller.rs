//! Session controller: drives negotiation, socket provisioning,
//! mountpoint publishing, RTCP return plumbing and teardown. All message
//! handling runs on the plugin's single message-handler task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, Error, Result};
use crate::net::{SocketFactory, UdpEndpoint};
use crate::pipeline::{LaunchSpec, StreamWiring};
use crate::plugin::{PluginInner, SessionMessage};
use crate::rtcp;
use crate::rtsp::MediaFactory;
use crate::sdp::{self, Codec};
use crate::session::{
    Negotiated, PipelineContext, PipelineSockets, RtcpReturnBinding, Session, SessionSockets,
    StreamSockets, SubscriptionSet, DEFAULT_SLOWLINK_BITRATE, MIN_SLOWLINK_BITRATE,
};

impl PluginInner {
    /// Handles one queued peer message: validation, control knobs, and
    /// (when a JSEP offer rides along) the whole media setup.
    pub(crate) async fn handle_queued_message(&self, msg: SessionMessage) {
        let transaction = msg.transaction.as_deref();
        let Some(session) = self.lookup(msg.handle) else {
            warn!(handle = msg.handle, "no session associated with this handle");
            return;
        };
        if session.is_destroyed() {
            return;
        }

        let root = match &msg.message {
            Some(root) => root,
            None => {
                self.push_error(msg.handle, transaction, ApiError::NoMessage, "No message??");
                return;
            }
        };
        if !root.is_object() {
            self.push_error(
                msg.handle,
                transaction,
                ApiError::InvalidJson,
                "JSON error: not an object",
            );
            return;
        }

        let audio = root.get("audio");
        if audio.is_some_and(|v| !v.is_boolean()) {
            self.push_error(
                msg.handle,
                transaction,
                ApiError::InvalidElement,
                "Invalid value (audio should be a boolean)",
            );
            return;
        }
        let video = root.get("video");
        if video.is_some_and(|v| !v.is_boolean()) {
            self.push_error(
                msg.handle,
                transaction,
                ApiError::InvalidElement,
                "Invalid value (video should be a boolean)",
            );
            return;
        }
        let bitrate = root.get("bitrate");
        if bitrate.is_some_and(|v| !v.is_u64()) {
            self.push_error(
                msg.handle,
                transaction,
                ApiError::InvalidElement,
                "Invalid value (bitrate should be a positive integer)",
            );
            return;
        }
        let record = root.get("record");
        if record.is_some_and(|v| !v.is_boolean()) {
            self.push_error(
                msg.handle,
                transaction,
                ApiError::InvalidElement,
                "Invalid value (record should be a boolean)",
            );
            return;
        }
        if root.get("filename").is_some_and(|v| !v.is_string()) {
            self.push_error(
                msg.handle,
                transaction,
                ApiError::InvalidElement,
                "Invalid value (filename should be a string)",
            );
            return;
        }
        let id = root.get("id");
        if id.is_some_and(|v| !v.is_string()) {
            self.push_error(
                msg.handle,
                transaction,
                ApiError::InvalidElement,
                "Invalid value (id should be a string)",
            );
            return;
        }

        // Enforce the request.
        if let Some(flag) = audio.and_then(Value::as_bool) {
            session.set_audio_active(flag);
            debug!(audio = flag, "setting audio property");
        }
        if let Some(flag) = video.and_then(Value::as_bool) {
            if flag && !session.video_active() {
                debug!("video re-enabled, sending a PLI to recover it");
                self.gateway
                    .relay_rtcp(session.handle(), true, &rtcp::pli());
            }
            session.set_video_active(flag);
            debug!(video = flag, "setting video property");
        }
        if let Some(value) = bitrate.and_then(Value::as_u64) {
            session.set_bitrate(value);
            debug!(bitrate = value, "setting video bitrate");
            if value > 0 {
                self.gateway
                    .relay_rtcp(session.handle(), true, &rtcp::remb(value));
            }
        }
        if let Some(value) = id.and_then(Value::as_str) {
            session.set_id(value.to_string());
        }

        let jsep_type = msg
            .jsep
            .as_ref()
            .and_then(|j| j.get("type"))
            .and_then(Value::as_str);
        let jsep_sdp = msg
            .jsep
            .as_ref()
            .and_then(|j| j.get("sdp"))
            .and_then(Value::as_str);

        if audio.is_none()
            && video.is_none()
            && bitrate.is_none()
            && record.is_none()
            && id.is_none()
            && jsep_sdp.is_none()
        {
            self.push_error(
                msg.handle,
                transaction,
                ApiError::InvalidElement,
                "Message error: no supported attributes (audio, video, bitrate, record, id, jsep) found",
            );
            return;
        }

        let event = json!({ "source": "event", "result": "ok" });
        let (jsep_type, jsep_sdp) = match (jsep_type, jsep_sdp) {
            (Some(t), Some(s)) => (t, s),
            _ => {
                self.gateway
                    .push_event(session.handle(), transaction, event, None);
                return;
            }
        };

        // Bounce the description back with the type flipped.
        let answer_type = if jsep_type.eq_ignore_ascii_case("offer") {
            "answer"
        } else {
            "offer"
        };
        let sanitized = sdp::sanitize_offer(jsep_sdp);
        session.clear_hangup();

        match self.setup_streaming(&session, &sanitized).await {
            Ok(answer_sdp) => {
                let jsep = json!({ "type": answer_type, "sdp": answer_sdp });
                self.gateway
                    .push_event(session.handle(), transaction, event, Some(jsep));
            }
            Err(Error::DuplicateStreamId(id)) => {
                warn!(%id, "stream id already exists in the registry");
                self.push_id_error(&session);
                self.hangup_media(&session);
            }
            Err(e) => {
                // The session stays alive; the peer can retry or detach.
                error!(error = %e, "media setup failed");
            }
        }
    }

    /// Negotiates codecs against the sanitized offer, provisions the ten
    /// loopback sockets, registers the stream and publishes the
    /// mountpoint. Returns the answer SDP.
    async fn setup_streaming(&self, session: &Arc<Session>, offered: &str) -> Result<String> {
        let chosen = sdp::select_video_codec_by_priority(offered, &self.config.codec_priority);
        let sdp = sdp::rewrite_video_line(offered, chosen);

        let video = sdp::get_video_codec(&sdp);
        let audio = sdp::get_audio_codec(&sdp);
        let negotiated = Negotiated {
            video,
            video_pt: sdp::get_pt(&sdp, video),
            audio,
            audio_pt: sdp::get_pt(&sdp, audio),
        };
        session.set_codecs(negotiated);
        info!(video = %negotiated.video, audio = %negotiated.audio, "codecs negotiated");

        if !video.is_valid() && !audio.is_valid() {
            info!("offer carries no media to bridge, not publishing a mountpoint");
            return Ok(sdp);
        }

        let id = match session.id() {
            Some(id) => id,
            None => {
                let generated = uuid::Uuid::new_v4().simple().to_string();
                warn!(%generated, "no stream id supplied, generating one");
                session.set_id(generated.clone());
                generated
            }
        };
        let rtsp_url = format!(
            "rtsp://{}:{}/{}",
            self.config.rtsp_interface,
            self.rtsp.port(),
            id
        );
        session.set_rtsp_url(rtsp_url.clone());

        let mut sockets = provision_session_sockets(&self.factory).await?;

        let video_wiring = video.is_valid().then(|| StreamWiring {
            codec: video,
            pt: negotiated.video_pt as u8,
            rtp_port: sockets.video.rtp_srv.port(),
            rtcp_rcv_port: sockets.video.rtcp_rcv_srv.port(),
            rtcp_snd_port: sockets.video.rtcp_snd_srv.port(),
        });
        let audio_wiring = (audio == Codec::Opus).then(|| StreamWiring {
            codec: audio,
            pt: negotiated.audio_pt as u8,
            rtp_port: sockets.audio.rtp_srv.port(),
            rtcp_rcv_port: sockets.audio.rtcp_rcv_srv.port(),
            rtcp_snd_port: sockets.audio.rtcp_snd_srv.port(),
        });
        let spec = LaunchSpec::build(video_wiring, audio_wiring)
            .ok_or_else(|| Error::sdp("negotiated codecs produced no pipeline"))?;
        debug!(launch = %spec.launch, "launch pipeline built");

        self.attach_rtcp_return(session, &mut sockets.video.rtcp_snd_srv, true);
        self.attach_rtcp_return(session, &mut sockets.audio.rtcp_snd_srv, false);

        let ctx = Arc::new(PipelineContext {
            id: id.clone(),
            rtsp_url: rtsp_url.clone(),
            sockets: PipelineSockets {
                video_rtp: sockets.video.rtp_srv.socket(),
                video_rtcp: sockets.video.rtcp_rcv_srv.socket(),
                audio_rtp: sockets.audio.rtp_srv.socket(),
                audio_rtcp: sockets.audio.rtcp_rcv_srv.socket(),
            },
            rtcp_video: RtcpReturnBinding {
                session: Arc::downgrade(session),
                is_video: true,
            },
            rtcp_audio: RtcpReturnBinding {
                session: Arc::downgrade(session),
                is_video: false,
            },
            clients: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(SubscriptionSet::default()),
            playing: AtomicBool::new(false),
        });
        session.install_sockets(sockets);

        if let Some(base) = &self.config.status_service_url {
            match self.registry.create(base, &rtsp_url, &id).await {
                Ok(response) if response.is_duplicate() => {
                    return Err(Error::DuplicateStreamId(id));
                }
                Ok(response) => session.set_registry_id(response.id),
                Err(e) => {
                    // The registry is advisory on create; the mountpoint
                    // is still published.
                    warn!(error = %e, "registry create failed, publishing anyway");
                }
            }
        }

        session.set_pipeline_ctx(Arc::clone(&ctx));
        self.rtsp
            .add_mountpoint(id.clone(), MediaFactory::new(spec), Arc::clone(&ctx))?;
        info!(%rtsp_url, "mountpoint submitted");

        if self.config.pli_workaround {
            self.spawn_pli_workaround(session, &ctx);
        }

        Ok(sdp)
    }

    /// Forwards RTCP arriving on a `*_rtcp_snd_srv` socket back toward
    /// the peer. The weak binding is validated on every datagram.
    fn attach_rtcp_return(&self, session: &Arc<Session>, endpoint: &mut UdpEndpoint, is_video: bool) {
        let binding = RtcpReturnBinding {
            session: Arc::downgrade(session),
            is_video,
        };
        let gateway = Arc::clone(&self.gateway);
        self.factory.attach_read(endpoint, move |buf| {
            let Some(session) = binding.session.upgrade() else {
                return false;
            };
            if session.is_destroyed() {
                return false;
            }
            if rtcp::has_pli(buf) {
                debug!(video = binding.is_video, "pipeline sent a PLI");
            }
            gateway.relay_rtcp(session.handle(), binding.is_video, buf);
            true
        });
    }

    /// Keeps requesting keyframes until the mount actually plays; only
    /// armed when `pli_workaround` is configured.
    fn spawn_pli_workaround(&self, session: &Arc<Session>, ctx: &Arc<PipelineContext>) {
        let session = Arc::downgrade(session);
        let ctx = Arc::downgrade(ctx);
        let gateway = Arc::clone(&self.gateway);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let (Some(session), Some(ctx)) = (session.upgrade(), ctx.upgrade()) else {
                    break;
                };
                if session.is_destroyed() || session.is_hanging_up() {
                    break;
                }
                if ctx.playing.load(Ordering::Relaxed) {
                    break;
                }
                debug!("media not playing yet, requesting a keyframe");
                gateway.relay_rtcp(session.handle(), true, &rtcp::pli());
            }
        });
    }

    /// Slow-link report from the gateway: count it, and when the peer
    /// encodes video for us, halve the cap and tell both sides.
    pub(crate) fn slow_link(&self, session: &Arc<Session>, uplink: bool, video: bool) {
        session.bump_slowlink();
        if uplink && !video && !session.audio_active() {
            debug!("NACKs for disabled audio are expected, ignoring");
        } else if uplink && video && !session.video_active() {
            debug!("NACKs for disabled video are expected, ignoring");
        } else if video {
            let current = session.bitrate();
            let base = if current > 0 {
                current
            } else {
                DEFAULT_SLOWLINK_BITRATE
            };
            let capped = (base / 2).max(MIN_SLOWLINK_BITRATE);
            session.set_bitrate(capped);
            warn!(
                uplink,
                bitrate = capped,
                "lots of NACKs, forcing a lower REMB"
            );
            self.gateway
                .relay_rtcp(session.handle(), true, &rtcp::remb(capped));

            let event = json!({
                "source": "event",
                "result": { "status": "slow_link", "bitrate": capped },
            });
            self.gateway.push_event(session.handle(), None, event, None);
        }
    }

    /// Peer media is gone: push `done` once and reset the controls.
    pub(crate) fn hangup_media(&self, session: &Arc<Session>) {
        if session.is_destroyed() || session.begin_hangup() {
            return;
        }
        info!(handle = session.handle(), "no webrtc media anymore");
        let event = json!({ "source": "event", "result": "done" });
        self.gateway.push_event(session.handle(), None, event, None);
        session.reset_controls();
    }

    /// Full teardown: mountpoint removal (awaited), registry delete,
    /// socket closure, identity cleanup. Idempotent.
    pub(crate) async fn close_session(&self, session: &Arc<Session>) {
        if session.begin_destroy() {
            return;
        }
        info!(handle = session.handle(), id = ?session.id(), "closing source session");

        if let Some(ctx) = session.take_pipeline_ctx() {
            match self.rtsp.remove_mountpoint(ctx.id.clone(), Arc::clone(&ctx)) {
                Ok(ack) => {
                    if tokio::time::timeout(Duration::from_secs(5), ack).await.is_err() {
                        warn!("mountpoint removal was not acknowledged in time");
                    }
                }
                Err(e) => warn!(error = %e, "could not submit mountpoint removal"),
            }
        }

        if let Some(base) = &self.config.status_service_url {
            if let Some(registry_id) = session.registry_id() {
                if let Err(e) = self.registry.delete(base, &registry_id).await {
                    warn!(error = %e, "registry delete failed");
                }
            }
        }

        if let Some(sockets) = session.take_sockets() {
            debug!("closing session sockets");
            sockets.close_all(&self.factory);
        }
        session.clear_identity();
        session.stamp_destroyed();
    }

    pub(crate) fn push_error(
        &self,
        handle: u64,
        transaction: Option<&str>,
        code: ApiError,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        error!(code = code.code(), %reason, "request error");
        let event = json!({
            "source": "event",
            "error_code": code.code(),
            "error": reason,
        });
        self.gateway.push_event(handle, transaction, event, None);
    }

    /// Duplicate-id error pushed after the registry refused the stream.
    pub(crate) fn push_id_error(&self, session: &Arc<Session>) {
        if session.is_destroyed() {
            return;
        }
        let reason = format!(
            "JSON error: URL ID {} already exist in the system.",
            session.id().unwrap_or_default()
        );
        let event = json!({
            "source": "event",
            "error_code": ApiError::InvalidUrlId.code(),
            "error": reason,
        });
        self.gateway.push_event(session.handle(), None, event, None);
    }
}

/// Opens the ten session sockets in role order, both streams; any
/// failure closes everything already opened before propagating.
async fn provision_session_sockets(factory: &SocketFactory) -> Result<SessionSockets> {
    struct Guard<'a> {
        factory: &'a SocketFactory,
        opened: Vec<UdpEndpoint>,
    }

    impl Guard<'_> {
        async fn server(&mut self) -> Result<u16> {
            let endpoint = self.factory.open_server().await?;
            let port = endpoint.port();
            self.opened.push(endpoint);
            Ok(port)
        }

        async fn client(&mut self, peer_port: u16) -> Result<()> {
            let endpoint = self.factory.open_client(peer_port).await?;
            self.opened.push(endpoint);
            Ok(())
        }
    }

    impl Drop for Guard<'_> {
        fn drop(&mut self) {
            for endpoint in self.opened.drain(..) {
                self.factory.close(endpoint);
            }
        }
    }

    let mut guard = Guard {
        factory,
        opened: Vec::with_capacity(10),
    };
    for _ in 0..2 {
        let rtp_port = guard.server().await?;
        guard.client(rtp_port).await?;
        let rtcp_port = guard.server().await?;
        guard.client(rtcp_port).await?;
        guard.server().await?;
    }

    let mut opened = std::mem::take(&mut guard.opened).into_iter();
    let mut stream = || StreamSockets {
        rtp_srv: opened.next().expect("ten sockets were just opened"),
        rtp_cli: opened.next().expect("ten sockets were just opened"),
        rtcp_rcv_srv: opened.next().expect("ten sockets were just opened"),
        rtcp_rcv_cli: opened.next().expect("ten sockets were just opened"),
        rtcp_snd_srv: opened.next().expect("ten sockets were just opened"),
    };
    Ok(SessionSockets {
        video: stream(),
        audio: stream(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortPool;

    #[tokio::test]
    async fn provisioning_opens_ten_distinct_ports() {
        let pool = Arc::new(PortPool::new(45000, 45063));
        let factory = SocketFactory::new(Arc::clone(&pool));
        let sockets = provision_session_sockets(&factory).await.unwrap();
        assert_eq!(sockets.count(), 10);
        let ports = sockets.ports();
        let unique: std::collections::HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), 10);
        assert!(ports.iter().all(|p| (45000..=45063).contains(p)));
        assert_eq!(pool.allocated(), 10);

        sockets.close_all(&factory);
        assert_eq!(pool.allocated(), 0);
    }

    #[tokio::test]
    async fn provisioning_failure_releases_every_port() {
        // Nine ports cannot cover the ten sockets of a session.
        let pool = Arc::new(PortPool::new(45100, 45108));
        let factory = SocketFactory::new(Arc::clone(&pool));
        assert!(provision_session_sockets(&factory).await.is_err());
        assert_eq!(pool.allocated(), 0);
    }

    #[tokio::test]
    async fn single_port_range_fails_port_exhaustion() {
        let pool = Arc::new(PortPool::new(45200, 45200));
        let factory = SocketFactory::new(Arc::clone(&pool));
        assert!(provision_session_sockets(&factory).await.is_err());
        assert_eq!(pool.allocated(), 0);
    }
}
