//! One task per accepted RTSP client connection.
//!
//! The connection task parses requests off the TCP stream, serves the
//! control methods against the shared mountpoint table, and listens for
//! server-side directives (a TEARDOWN aimed at a mount being removed, or
//! an outright close). Everything runs on the RTSP server thread.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use rtsp_types::{headers, Message, Method, ParseError, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::rtsp::media::{ClientTransport, MediaFactory, MediaState};
use crate::rtsp::server::Shared;
use crate::sdp::MediaKind;

/// Server→client directives, delivered through the client handle.
#[derive(Debug)]
pub enum ClientDirective {
    /// Send a TEARDOWN request directed at `uri`, ahead of a close.
    Teardown { uri: String },
    /// Drop the connection.
    Close,
}

/// Cross-thread handle onto a connected RTSP client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<ClientDirective>,
}

impl ClientHandle {
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn send_teardown(&self, uri: &str) {
        let _ = self.tx.send(ClientDirective::Teardown {
            uri: uri.to_string(),
        });
    }

    pub fn close(&self) {
        let _ = self.tx.send(ClientDirective::Close);
    }
}

/// A request reduced to the pieces the server acts on.
#[derive(Debug)]
struct OwnedRequest {
    method: Method,
    uri: Option<Url>,
    cseq: Option<String>,
    session: Option<String>,
    transport: Option<String>,
}

enum Taken {
    Request(OwnedRequest),
    /// A response or interleaved data frame; both are ignored.
    Ignored,
    Incomplete,
    Invalid,
}

fn take_message(buf: &mut BytesMut) -> Taken {
    let parsed: std::result::Result<(Message<&[u8]>, usize), ParseError> =
        Message::parse(&buf[..]);
    match parsed {
        Ok((Message::Request(req), len)) => {
            let owned = OwnedRequest {
                method: req.method().clone(),
                uri: req.request_uri().cloned(),
                cseq: req
                    .header(&headers::CSEQ)
                    .map(|v| v.as_str().to_string()),
                session: req
                    .header(&headers::SESSION)
                    .map(|v| v.as_str().to_string()),
                transport: req
                    .header(&headers::TRANSPORT)
                    .map(|v| v.as_str().to_string()),
            };
            buf.advance(len);
            Taken::Request(owned)
        }
        Ok((_, len)) => {
            buf.advance(len);
            Taken::Ignored
        }
        Err(ParseError::Incomplete(_)) => Taken::Incomplete,
        Err(ParseError::Error) => Taken::Invalid,
    }
}

/// Per-connection serving state.
struct Conn {
    conn_id: u64,
    peer_ip: IpAddr,
    shared: Shared,
    handle: ClientHandle,
    /// RTSP session id handed out on the first SETUP.
    session_id: Option<String>,
    /// Mount ids this connection did a SETUP on.
    touched: HashSet<String>,
    /// CSeq for server-originated requests.
    server_cseq: u32,
}

pub(crate) async fn serve(stream: TcpStream, shared: Shared, conn_id: u64) {
    let peer_ip = match stream.peer_addr() {
        Ok(addr) => addr.ip(),
        Err(_) => return,
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = Conn {
        conn_id,
        peer_ip,
        shared,
        handle: ClientHandle { conn_id, tx },
        session_id: None,
        touched: HashSet::new(),
        server_cseq: 0,
    };
    info!(conn_id, peer = %peer_ip, "rtsp client connected");

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);
    'outer: loop {
        tokio::select! {
            directive = rx.recv() => {
                match directive {
                    Some(ClientDirective::Teardown { uri }) => {
                        conn.server_cseq += 1;
                        if let Err(e) = send_teardown(&mut write_half, &uri, &conn).await {
                            debug!(conn_id, error = %e, "failed to send TEARDOWN");
                        }
                    }
                    Some(ClientDirective::Close) | None => break 'outer,
                }
            }
            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break 'outer,
                    Ok(_) => {}
                }
                loop {
                    match take_message(&mut buf) {
                        Taken::Request(req) => {
                            let response = conn.handle_request(&req).await;
                            if write_response(&mut write_half, response).await.is_err() {
                                break 'outer;
                            }
                        }
                        Taken::Ignored => continue,
                        Taken::Incomplete => break,
                        Taken::Invalid => {
                            let response = simple_response(StatusCode::BadRequest, None);
                            let _ = write_response(&mut write_half, response).await;
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    conn.disconnect();
    info!(conn_id, "rtsp client disconnected");
}

async fn send_teardown(writer: &mut OwnedWriteHalf, uri: &str, conn: &Conn) -> Result<()> {
    let url =
        Url::parse(uri).map_err(|e| Error::rtsp(format!("bad teardown uri {uri}: {e}")))?;
    let mut builder = rtsp_types::Request::builder(Method::Teardown, Version::V1_0)
        .request_uri(url)
        .header(headers::CSEQ, conn.server_cseq.to_string());
    if let Some(session) = &conn.session_id {
        builder = builder.header(headers::SESSION, session.clone());
    }
    let request = builder.build(String::new());
    let mut out = Vec::new();
    Message::Request(request)
        .write(&mut out)
        .map_err(|e| Error::rtsp(format!("cannot serialize TEARDOWN: {e}")))?;
    writer
        .write_all(&out)
        .await
        .map_err(|e| Error::rtsp(format!("cannot write TEARDOWN: {e}")))?;
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: rtsp_types::Response<String>,
) -> std::io::Result<()> {
    let mut out = Vec::new();
    Message::Response(response)
        .write(&mut out)
        .expect("serializing into a Vec cannot fail");
    writer.write_all(&out).await
}

fn simple_response(status: StatusCode, cseq: Option<&str>) -> rtsp_types::Response<String> {
    let mut builder = rtsp_types::Response::builder(Version::V1_0, status);
    if let Some(cseq) = cseq {
        builder = builder.header(headers::CSEQ, cseq.to_string());
    }
    builder.build(String::new())
}

/// `rtsp://host/<mount>[/stream=<n>]` → mount id and optional track.
fn split_mount_uri(uri: &Url) -> Option<(String, Option<usize>)> {
    let mut segments = uri.path_segments()?;
    let mount = segments.next().filter(|s| !s.is_empty())?.to_string();
    let track = segments
        .next()
        .and_then(|s| s.strip_prefix("stream=")?.parse().ok());
    Some((mount, track))
}

/// `Transport: RTP/AVP;unicast;client_port=a-b` → delivery addresses.
fn parse_transport(value: &str, peer_ip: IpAddr) -> Option<ClientTransport> {
    if value.contains("interleaved") || value.to_ascii_uppercase().contains("/TCP") {
        return None;
    }
    let ports = value
        .split(';')
        .find_map(|p| p.trim().strip_prefix("client_port="))?;
    let (rtp, rtcp) = match ports.split_once('-') {
        Some((rtp, rtcp)) => (rtp, Some(rtcp)),
        None => (ports, None),
    };
    let rtp: u16 = rtp.trim().parse().ok()?;
    let rtcp: Option<u16> = rtcp.and_then(|p| p.trim().parse().ok());
    Some(ClientTransport {
        rtp: (peer_ip, rtp).into(),
        rtcp: rtcp.map(|p| (peer_ip, p).into()),
    })
}

impl Conn {
    async fn handle_request(&mut self, req: &OwnedRequest) -> rtsp_types::Response<String> {
        let cseq = req.cseq.clone();
        let result = match req.method {
            Method::Options => Ok(self.options(cseq.as_deref())),
            Method::Describe => self.describe(req),
            Method::Setup => self.setup(req).await,
            Method::Play => self.play(req),
            Method::Pause => self.pause(req),
            Method::Teardown => self.teardown(req),
            _ => Ok(simple_response(StatusCode::NotImplemented, cseq.as_deref())),
        };
        match result {
            Ok(response) => response,
            Err(status) => simple_response(status, cseq.as_deref()),
        }
    }

    fn options(&self, cseq: Option<&str>) -> rtsp_types::Response<String> {
        let mut builder = rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok).header(
            headers::PUBLIC,
            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN",
        );
        if let Some(cseq) = cseq {
            builder = builder.header(headers::CSEQ, cseq.to_string());
        }
        builder.build(String::new())
    }

    fn mount_of(&self, req: &OwnedRequest) -> std::result::Result<(String, Option<usize>), StatusCode> {
        let uri = req.uri.as_ref().ok_or(StatusCode::BadRequest)?;
        split_mount_uri(uri).ok_or(StatusCode::NotFound)
    }

    fn describe(
        &mut self,
        req: &OwnedRequest,
    ) -> std::result::Result<rtsp_types::Response<String>, StatusCode> {
        let (mount_id, _) = self.mount_of(req)?;
        let inner = self.shared.borrow();
        let mount = inner.mounts.get(&mount_id).ok_or(StatusCode::NotFound)?;
        let sdp = match describe_sdp(&mount.factory, &inner.advertised_host) {
            Ok(sdp) => sdp,
            Err(e) => {
                // Refuse this client; the mount and its other clients are
                // untouched.
                warn!(mount = %mount_id, error = %e, "could not create SDP");
                return Err(StatusCode::InternalServerError);
            }
        };
        let mut builder = rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::CONTENT_TYPE, "application/sdp")
            .header(headers::CONTENT_BASE, format!("{}/", mount.ctx.rtsp_url));
        if let Some(cseq) = &req.cseq {
            builder = builder.header(headers::CSEQ, cseq.clone());
        }
        Ok(builder.build(sdp))
    }

    async fn setup(
        &mut self,
        req: &OwnedRequest,
    ) -> std::result::Result<rtsp_types::Response<String>, StatusCode> {
        let (mount_id, track) = self.mount_of(req)?;
        let transport = req.transport.as_deref().ok_or(StatusCode::BadRequest)?;
        let transport =
            parse_transport(transport, self.peer_ip).ok_or(StatusCode::UnsupportedTransport)?;

        self.ensure_media(&mount_id).await?;

        let (ports, ctx) = {
            let mut inner = self.shared.borrow_mut();
            let mount = inner.mounts.get_mut(&mount_id).ok_or(StatusCode::NotFound)?;
            let kind = kind_for_track(&mount.factory, track).ok_or(StatusCode::NotFound)?;
            let media = mount.media.as_mut().ok_or(StatusCode::InternalServerError)?;
            let ports = media
                .attach_output(self.conn_id, kind, transport)
                .map_err(|_| StatusCode::NotFound)?;
            (ports, Arc::clone(&mount.ctx))
        };

        let session_id = self
            .session_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string())
            .clone();
        ctx.add_client(self.handle.clone());
        self.touched.insert(mount_id.clone());
        debug!(conn_id = self.conn_id, mount = %mount_id, "client SETUP");

        let transport_line = format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
            transport.rtp.port(),
            transport
                .rtcp
                .map(|a| a.port())
                .unwrap_or_else(|| transport.rtp.port() + 1),
            ports.0,
            ports.1,
        );
        let mut builder = rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::TRANSPORT, transport_line)
            .header(headers::SESSION, session_id);
        if let Some(cseq) = &req.cseq {
            builder = builder.header(headers::CSEQ, cseq.clone());
        }
        Ok(builder.build(String::new()))
    }

    /// Creates and prepares the shared media on the first SETUP.
    async fn ensure_media(&mut self, mount_id: &str) -> std::result::Result<(), StatusCode> {
        let needs_media = {
            let inner = self.shared.borrow();
            match inner.mounts.get(mount_id) {
                Some(mount) => mount.media.is_none(),
                None => return Err(StatusCode::NotFound),
            }
        };
        if !needs_media {
            return Ok(());
        }

        let (factory, ctx) = {
            let inner = self.shared.borrow();
            let mount = inner.mounts.get(mount_id).ok_or(StatusCode::NotFound)?;
            (mount.factory.clone(), Arc::clone(&mount.ctx))
        };
        ctx.subscriptions.lock().unwrap().target_state = true;
        let mut media = factory.create_media();
        if let Err(e) = media.prepare(&ctx).await {
            warn!(mount = %mount_id, error = %e, "media prepare failed");
            ctx.subscriptions.lock().unwrap().target_state = false;
            return Err(StatusCode::InternalServerError);
        }
        debug_assert_eq!(media.state(), MediaState::Prepared);

        let mut inner = self.shared.borrow_mut();
        match inner.mounts.get_mut(mount_id) {
            Some(mount) if mount.media.is_none() => {
                mount.media = Some(media);
                Ok(())
            }
            Some(_) => {
                // Another connection prepared it first.
                media.teardown();
                Ok(())
            }
            None => {
                media.teardown();
                Err(StatusCode::NotFound)
            }
        }
    }

    fn check_session(&self, req: &OwnedRequest) -> std::result::Result<(), StatusCode> {
        match (&self.session_id, &req.session) {
            (Some(ours), Some(theirs)) if theirs.split(';').next() == Some(ours.as_str()) => Ok(()),
            _ => Err(StatusCode::SessionNotFound),
        }
    }

    fn play(
        &mut self,
        req: &OwnedRequest,
    ) -> std::result::Result<rtsp_types::Response<String>, StatusCode> {
        let (mount_id, _) = self.mount_of(req)?;
        self.check_session(req)?;
        let ctx = {
            let mut inner = self.shared.borrow_mut();
            let mount = inner.mounts.get_mut(&mount_id).ok_or(StatusCode::NotFound)?;
            let media = mount.media.as_mut().ok_or(StatusCode::SessionNotFound)?;
            media.play();
            media.set_output_active(self.conn_id, true);
            Arc::clone(&mount.ctx)
        };
        ctx.add_client(self.handle.clone());
        ctx.playing.store(true, std::sync::atomic::Ordering::Relaxed);
        info!(conn_id = self.conn_id, mount = %mount_id, "client PLAY");

        let mut builder = rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::SESSION, self.session_id.clone().unwrap_or_default())
            .header(headers::RANGE, "npt=0.000-");
        if let Some(cseq) = &req.cseq {
            builder = builder.header(headers::CSEQ, cseq.clone());
        }
        Ok(builder.build(String::new()))
    }

    fn pause(
        &mut self,
        req: &OwnedRequest,
    ) -> std::result::Result<rtsp_types::Response<String>, StatusCode> {
        let (mount_id, _) = self.mount_of(req)?;
        self.check_session(req)?;
        {
            let mut inner = self.shared.borrow_mut();
            let mount = inner.mounts.get_mut(&mount_id).ok_or(StatusCode::NotFound)?;
            if let Some(media) = mount.media.as_mut() {
                media.set_output_active(self.conn_id, false);
            }
            // A paused client no longer counts as subscribed.
            mount.ctx.remove_client(self.conn_id);
        }
        debug!(conn_id = self.conn_id, mount = %mount_id, "client PAUSE");

        let mut builder = rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::SESSION, self.session_id.clone().unwrap_or_default());
        if let Some(cseq) = &req.cseq {
            builder = builder.header(headers::CSEQ, cseq.clone());
        }
        Ok(builder.build(String::new()))
    }

    fn teardown(
        &mut self,
        req: &OwnedRequest,
    ) -> std::result::Result<rtsp_types::Response<String>, StatusCode> {
        let (mount_id, _) = self.mount_of(req)?;
        self.check_session(req)?;
        {
            let mut inner = self.shared.borrow_mut();
            if let Some(mount) = inner.mounts.get_mut(&mount_id) {
                if let Some(media) = mount.media.as_mut() {
                    media.detach_output(self.conn_id);
                }
                mount.ctx.remove_client(self.conn_id);
            }
        }
        self.touched.remove(&mount_id);
        info!(conn_id = self.conn_id, mount = %mount_id, "client TEARDOWN");
        Ok(simple_response(StatusCode::Ok, req.cseq.as_deref()))
    }

    /// Drops every trace of the connection from the mounts it touched.
    fn disconnect(&mut self) {
        let mut inner = self.shared.borrow_mut();
        for mount_id in self.touched.drain() {
            if let Some(mount) = inner.mounts.get_mut(&mount_id) {
                if let Some(media) = mount.media.as_mut() {
                    media.detach_output(self.conn_id);
                }
                mount.ctx.remove_client(self.conn_id);
            }
        }
    }
}

fn kind_for_track(factory: &MediaFactory, track: Option<usize>) -> Option<MediaKind> {
    let has_video = factory.spec.video.is_some();
    let has_audio = factory.spec.audio.is_some();
    match (track.unwrap_or(0), has_video, has_audio) {
        (0, true, _) => Some(MediaKind::Video),
        (0, false, true) => Some(MediaKind::Audio),
        (1, true, true) => Some(MediaKind::Audio),
        _ => None,
    }
}

/// SDP handed to DESCRIBE clients: fixed session-level attributes plus
/// the negotiated streams, with the RTCP feedback capabilities the
/// gateway side expects.
fn describe_sdp(factory: &MediaFactory, host: &str) -> Result<String> {
    use std::fmt::Write;

    if factory.spec.video.is_none() && factory.spec.audio.is_none() {
        return Err(Error::rtsp("mount has no negotiated stream"));
    }

    let origin_id: u64 = rand::random();
    let profile = factory.profile.as_sdp();
    let mut sdp = String::new();
    let _ = writeln!(sdp, "v=0\r");
    let _ = writeln!(sdp, "o=- {origin_id} 1 IN IP4 {host}\r");
    let _ = writeln!(sdp, "s=Source session\r");
    let _ = writeln!(sdp, "i=rtsp-server\r");
    let _ = writeln!(sdp, "t=0 0\r");
    let _ = writeln!(sdp, "a=tool:rtsp-source\r");
    let _ = writeln!(sdp, "a=type:broadcast\r");
    let _ = writeln!(sdp, "a=control:*\r");

    let mut track = 0;
    if let Some(video) = &factory.spec.video {
        let pt = crate::pipeline::VIDEO_PAY_PT;
        let _ = writeln!(sdp, "m=video 0 {profile} {pt}\r");
        let _ = writeln!(sdp, "a=rtpmap:{pt} {}/90000\r", video.codec.name());
        let _ = writeln!(sdp, "a=rtcp-fb:{pt} ccm fir\r");
        let _ = writeln!(sdp, "a=rtcp-fb:{pt} nack\r");
        let _ = writeln!(sdp, "a=rtcp-fb:{pt} nack pli\r");
        let _ = writeln!(sdp, "a=control:stream={track}\r");
        track += 1;
    }
    if factory.spec.audio.is_some() {
        let pt = crate::pipeline::AUDIO_PAY_PT;
        let _ = writeln!(sdp, "m=audio 0 {profile} {pt}\r");
        let _ = writeln!(sdp, "a=rtpmap:{pt} OPUS/48000\r");
        let _ = writeln!(sdp, "a=control:stream={track}\r");
    }
    Ok(sdp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{LaunchSpec, StreamWiring};
    use crate::sdp::Codec;

    fn factory(video: bool, audio: bool) -> MediaFactory {
        let video = video.then_some(StreamWiring {
            codec: Codec::Vp8,
            pt: 100,
            rtp_port: 4001,
            rtcp_rcv_port: 4003,
            rtcp_snd_port: 4005,
        });
        let audio = audio.then_some(StreamWiring {
            codec: Codec::Opus,
            pt: 111,
            rtp_port: 4011,
            rtcp_rcv_port: 4013,
            rtcp_snd_port: 4015,
        });
        MediaFactory::new(LaunchSpec::build(video, audio).unwrap())
    }

    #[test]
    fn mount_uris_split_into_mount_and_track() {
        let url = Url::parse("rtsp://127.0.0.1:8554/cam1").unwrap();
        assert_eq!(split_mount_uri(&url), Some(("cam1".into(), None)));
        let url = Url::parse("rtsp://127.0.0.1:8554/cam1/stream=1").unwrap();
        assert_eq!(split_mount_uri(&url), Some(("cam1".into(), Some(1))));
    }

    #[test]
    fn transport_parsing() {
        let peer: IpAddr = "10.0.0.9".parse().unwrap();
        let t = parse_transport("RTP/AVP;unicast;client_port=5000-5001", peer).unwrap();
        assert_eq!(t.rtp.port(), 5000);
        assert_eq!(t.rtcp.unwrap().port(), 5001);
        assert_eq!(t.rtp.ip(), peer);
        assert!(parse_transport("RTP/AVP/TCP;interleaved=0-1", peer).is_none());
        assert!(parse_transport("RTP/AVP;unicast", peer).is_none());
    }

    #[test]
    fn track_mapping_follows_stream_presence() {
        let both = factory(true, true);
        assert_eq!(kind_for_track(&both, None), Some(MediaKind::Video));
        assert_eq!(kind_for_track(&both, Some(0)), Some(MediaKind::Video));
        assert_eq!(kind_for_track(&both, Some(1)), Some(MediaKind::Audio));
        assert_eq!(kind_for_track(&both, Some(2)), None);

        let audio_only = factory(false, true);
        assert_eq!(kind_for_track(&audio_only, Some(0)), Some(MediaKind::Audio));
        assert_eq!(kind_for_track(&audio_only, Some(1)), None);
    }

    #[test]
    fn describe_sdp_advertises_feedback() {
        let sdp = describe_sdp(&factory(true, true), "127.0.0.1").unwrap();
        assert!(sdp.contains("m=video 0 RTP/AVPF 96"));
        assert!(sdp.contains("a=rtcp-fb:96 ccm fir"));
        assert!(sdp.contains("a=rtcp-fb:96 nack"));
        assert!(sdp.contains("a=rtcp-fb:96 nack pli"));
        assert!(sdp.contains("m=audio 0 RTP/AVPF 127"));
        assert!(sdp.contains("a=control:stream=1"));
        assert!(sdp.contains("a=type:broadcast"));
    }
}
