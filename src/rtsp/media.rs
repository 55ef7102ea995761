//! Per-mountpoint media lifecycle.
//!
//! A mount's media walks `Provisioned → Prepared → Playing → TornDown`.
//! The Provisioned→Prepared edge happens exactly once and adopts the
//! session's pre-bound server sockets into the pipeline's named UDP
//! sources; the adoption is non-owning, so tearing the media down never
//! closes a socket the session still uses.
//!
//! The crate ships one pipeline implementation, [`LoopbackRelay`]: it
//! forwards RTP from the adopted sockets to every SETUP client (payload
//! type rewritten to the repay PT) and client RTCP back onto the mount's
//! `*_rtcp_snd_srv` loopback port. Anything beyond that — real codec
//! depay/repay — belongs to an external media framework implementing
//! [`MediaPipeline`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pipeline::{LaunchSpec, StreamWiring, AUDIO_PAY_PT, VIDEO_PAY_PT};
use crate::sdp::MediaKind;
use crate::session::PipelineContext;

/// RTP profile advertised by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspProfile {
    Avp,
    Avpf,
}

impl RtspProfile {
    pub fn as_sdp(self) -> &'static str {
        match self {
            RtspProfile::Avp => "RTP/AVP",
            RtspProfile::Avpf => "RTP/AVPF",
        }
    }
}

/// Media lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Provisioned,
    Prepared,
    Playing,
    TornDown,
}

/// Where a client asked its stream to be delivered.
#[derive(Debug, Clone, Copy)]
pub struct ClientTransport {
    pub rtp: SocketAddr,
    pub rtcp: Option<SocketAddr>,
}

/// Produces the media for a mountpoint on demand.
#[derive(Debug, Clone)]
pub struct MediaFactory {
    pub spec: LaunchSpec,
    pub latency_ms: u32,
    pub profile: RtspProfile,
    pub retransmission_window: Duration,
    pub shared: bool,
}

impl MediaFactory {
    pub fn new(spec: LaunchSpec) -> MediaFactory {
        MediaFactory {
            spec,
            latency_ms: 0,
            profile: RtspProfile::Avpf,
            retransmission_window: Duration::from_millis(100),
            shared: true,
        }
    }

    /// Instantiates the built-in pipeline for this factory.
    pub fn create_media(&self) -> Box<dyn MediaPipeline> {
        Box::new(LoopbackRelay::new(self.spec.clone()))
    }
}

/// The pipeline seam toward the media framework.
///
/// Implementations run on the RTSP server thread; every call happens
/// there, so the trait is deliberately not `Send`.
#[async_trait(?Send)]
pub trait MediaPipeline {
    /// Transitions `Provisioned → Prepared`: adopts the context's server
    /// sockets into the named UDP sources and allocates the client-facing
    /// delivery sockets. Only the first call does work.
    async fn prepare(&mut self, ctx: &PipelineContext) -> Result<()>;

    /// Registers a client output for one stream; returns the
    /// `(rtp, rtcp)` server ports delivery happens from.
    fn attach_output(
        &mut self,
        conn_id: u64,
        kind: MediaKind,
        transport: ClientTransport,
    ) -> Result<(u16, u16)>;

    /// Starts or stops delivery toward one client.
    fn set_output_active(&mut self, conn_id: u64, active: bool);

    /// Forgets a client's outputs on every stream.
    fn detach_output(&mut self, conn_id: u64);

    /// Transitions to `Playing` (first PLAY on the mount).
    fn play(&mut self);

    fn state(&self) -> MediaState;

    /// Stops every relay task and drops the adopted sockets without
    /// closing them.
    fn teardown(&mut self);
}

struct StreamRelay {
    wiring: StreamWiring,
    pay_pt: u8,
    /// Ports of the client-facing delivery sockets (the sockets
    /// themselves live inside the relay tasks).
    rtp_out_port: u16,
    rtcp_out_port: u16,
    outputs: Arc<Mutex<HashMap<u64, Output>>>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
struct Output {
    transport: ClientTransport,
    active: bool,
}

/// Built-in [`MediaPipeline`]: RTP/RTCP relay over the adopted sockets.
pub struct LoopbackRelay {
    spec: LaunchSpec,
    state: MediaState,
    playing: Arc<AtomicBool>,
    video: Option<StreamRelay>,
    audio: Option<StreamRelay>,
}

impl LoopbackRelay {
    pub fn new(spec: LaunchSpec) -> LoopbackRelay {
        LoopbackRelay {
            spec,
            state: MediaState::Provisioned,
            playing: Arc::new(AtomicBool::new(false)),
            video: None,
            audio: None,
        }
    }

    async fn build_stream(
        &self,
        wiring: StreamWiring,
        pay_pt: u8,
        adopted_rtp: Arc<UdpSocket>,
        adopted_rtcp: Arc<UdpSocket>,
    ) -> Result<StreamRelay> {
        let rtp_out = Arc::new(bind_ephemeral().await?);
        let rtcp_out = Arc::new(bind_ephemeral().await?);
        let rtp_out_port = local_port(&rtp_out)?;
        let rtcp_out_port = local_port(&rtcp_out)?;
        let outputs: Arc<Mutex<HashMap<u64, Output>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = Vec::with_capacity(3);

        // RTP fan-out: adopted source socket -> every active client.
        {
            let source = adopted_rtp;
            let out = Arc::clone(&rtp_out);
            let outputs = Arc::clone(&outputs);
            let playing = Arc::clone(&self.playing);
            tasks.push(tokio::task::spawn_local(async move {
                let mut buf = [0u8; 1500];
                loop {
                    let len = match source.recv(&mut buf).await {
                        Ok(len) => len,
                        Err(_) => break,
                    };
                    if len < 2 || !playing.load(Ordering::Relaxed) {
                        continue;
                    }
                    // Repackage: keep the marker bit, rewrite the PT.
                    buf[1] = (buf[1] & 0x80) | pay_pt;
                    let dests: Vec<SocketAddr> = {
                        let outputs = outputs.lock().unwrap();
                        outputs
                            .values()
                            .filter(|o| o.active)
                            .map(|o| o.transport.rtp)
                            .collect()
                    };
                    for dest in dests {
                        let _ = out.try_send_to(&buf[..len], dest);
                    }
                }
            }));
        }

        // RTCP from the pipeline side (the gateway's reports) is consumed
        // by the session's own readers; what travels here is the clients'
        // RTCP, forwarded onto the mount's rtcp_snd loopback port.
        {
            let rtcp_out = Arc::clone(&rtcp_out);
            let snd_addr = SocketAddr::from(([127, 0, 0, 1], wiring.rtcp_snd_port));
            tasks.push(tokio::task::spawn_local(async move {
                let mut buf = [0u8; 1500];
                loop {
                    let len = match rtcp_out.recv_from(&mut buf).await {
                        Ok((len, _)) => len,
                        Err(_) => break,
                    };
                    let _ = rtcp_out.try_send_to(&buf[..len], snd_addr);
                }
            }));
        }

        // The adopted RTCP-receive socket stays owned by the session; the
        // relay only drains it so the kernel buffer cannot grow unbounded
        // while no real framework consumes it.
        {
            tasks.push(tokio::task::spawn_local(async move {
                let mut buf = [0u8; 1500];
                while adopted_rtcp.recv(&mut buf).await.is_ok() {}
            }));
        }

        Ok(StreamRelay {
            wiring,
            pay_pt,
            rtp_out_port,
            rtcp_out_port,
            outputs,
            tasks,
        })
    }

    fn stream_mut(&mut self, kind: MediaKind) -> Option<&mut StreamRelay> {
        match kind {
            MediaKind::Video => self.video.as_mut(),
            MediaKind::Audio => self.audio.as_mut(),
        }
    }
}

#[async_trait(?Send)]
impl MediaPipeline for LoopbackRelay {
    async fn prepare(&mut self, ctx: &PipelineContext) -> Result<()> {
        if self.state != MediaState::Provisioned {
            return Ok(());
        }

        if let Some(wiring) = self.spec.video {
            let relay = self
                .build_stream(
                    wiring,
                    VIDEO_PAY_PT,
                    Arc::clone(&ctx.sockets.video_rtp),
                    Arc::clone(&ctx.sockets.video_rtcp),
                )
                .await?;
            self.video = Some(relay);
        }
        if let Some(wiring) = self.spec.audio {
            let relay = self
                .build_stream(
                    wiring,
                    AUDIO_PAY_PT,
                    Arc::clone(&ctx.sockets.audio_rtp),
                    Arc::clone(&ctx.sockets.audio_rtcp),
                )
                .await?;
            self.audio = Some(relay);
        }

        // The socket injection happened; the target-state subscription has
        // served its purpose.
        ctx.subscriptions.lock().unwrap().target_state = false;
        self.state = MediaState::Prepared;
        info!(id = %ctx.id, "media prepared, sockets adopted");
        Ok(())
    }

    fn attach_output(
        &mut self,
        conn_id: u64,
        kind: MediaKind,
        transport: ClientTransport,
    ) -> Result<(u16, u16)> {
        let relay = self
            .stream_mut(kind)
            .ok_or_else(|| Error::rtsp(format!("mount carries no {} stream", kind.prefix())))?;
        relay.outputs.lock().unwrap().insert(
            conn_id,
            Output {
                transport,
                active: false,
            },
        );
        debug!(conn_id, kind = kind.prefix(), pt = relay.pay_pt, "client output attached");
        Ok((relay.rtp_out_port, relay.rtcp_out_port))
    }

    fn set_output_active(&mut self, conn_id: u64, active: bool) {
        for relay in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            if let Some(output) = relay.outputs.lock().unwrap().get_mut(&conn_id) {
                output.active = active;
            }
        }
    }

    fn detach_output(&mut self, conn_id: u64) {
        for relay in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            relay.outputs.lock().unwrap().remove(&conn_id);
        }
    }

    fn play(&mut self) {
        if self.state == MediaState::Prepared {
            self.state = MediaState::Playing;
        }
        self.playing.store(true, Ordering::Relaxed);
    }

    fn state(&self) -> MediaState {
        self.state
    }

    fn teardown(&mut self) {
        self.playing.store(false, Ordering::Relaxed);
        for relay in [self.video.take(), self.audio.take()].into_iter().flatten() {
            for task in relay.tasks {
                task.abort();
            }
            // Dropping the relay drops the adopted Arc clones; the owning
            // session closes the sockets themselves.
            debug!(rtp_port = relay.wiring.rtp_port, "stream relay torn down");
        }
        self.state = MediaState::TornDown;
    }
}

async fn bind_ephemeral() -> Result<UdpSocket> {
    UdpSocket::bind(("0.0.0.0", 0))
        .await
        .map_err(|e| Error::socket(format!("cannot bind delivery socket: {e}")))
}

fn local_port(socket: &UdpSocket) -> Result<u16> {
    socket
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| Error::socket(format!("cannot read local addr: {e}")))
}

impl Drop for LoopbackRelay {
    fn drop(&mut self) {
        if self.state != MediaState::TornDown {
            warn!("media dropped without teardown");
            self.teardown();
        }
    }
}
