//! Declarative launch-pipeline construction for a mountpoint.
//!
//! The launch string is what the media framework consumes; the only
//! load-bearing pieces are the four UDP-source element names (the server
//! rebinds their sockets once the media reaches its prepared state) and
//! the RTCP-out sink ports, which must land on the session's
//! `*_rtcp_snd_srv` sockets.

use crate::sdp::Codec;

/// Named UDP source feeding video RTP into the pipeline.
pub const VIDEO_RTP_SRC_NAME: &str = "udpsrc_rtp_video";
/// Named UDP source feeding video RTCP into the pipeline.
pub const VIDEO_RTCP_SRC_NAME: &str = "udpsrc_rtcp_receive_video";
/// Named UDP source feeding audio RTP into the pipeline.
pub const AUDIO_RTP_SRC_NAME: &str = "udpsrc_rtp_audio";
/// Named UDP source feeding audio RTCP into the pipeline.
pub const AUDIO_RTCP_SRC_NAME: &str = "udpsrc_rtcp_receive_audio";

/// Payload type the video stream is repackaged to.
pub const VIDEO_PAY_PT: u8 = 96;
/// Payload type the audio stream is repackaged to.
pub const AUDIO_PAY_PT: u8 = 127;

/// Ports and negotiated codec wiring one stream into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWiring {
    pub codec: Codec,
    /// Payload type negotiated with the peer.
    pub pt: u8,
    /// Port of the stream's `*_rtp_srv` socket.
    pub rtp_port: u16,
    /// Port of the stream's `*_rtcp_rcv_srv` socket.
    pub rtcp_rcv_port: u16,
    /// Port of the stream's `*_rtcp_snd_srv` socket.
    pub rtcp_snd_port: u16,
}

/// A built pipeline: the launch string plus the typed wiring the RTSP
/// runtime rebinds and relays against.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub video: Option<StreamWiring>,
    pub audio: Option<StreamWiring>,
    pub launch: String,
}

impl LaunchSpec {
    /// Builds the launch pipeline for the negotiated streams. `None` when
    /// neither stream negotiated a codec (no mountpoint is published).
    pub fn build(video: Option<StreamWiring>, audio: Option<StreamWiring>) -> Option<LaunchSpec> {
        let video = video.filter(|w| w.codec.is_video());
        let audio = audio.filter(|w| w.codec == Codec::Opus);

        let video_part = video.map(|w| video_subpipeline(&w));
        let audio_part = audio.map(|w| audio_subpipeline(&w));

        let launch = match (video_part, audio_part) {
            (Some(v), Some(a)) => format!("( {v} name=pay0  {a} name=pay1 )"),
            (Some(v), None) => format!("( {v} name=pay0 )"),
            (None, Some(a)) => format!("( {a} name=pay0 )"),
            (None, None) => return None,
        };

        Some(LaunchSpec {
            video,
            audio,
            launch,
        })
    }
}

fn video_depay_pay(codec: Codec) -> (&'static str, &'static str) {
    match codec {
        Codec::Vp8 => ("rtpvp8depay", "rtpvp8pay"),
        Codec::Vp9 => ("rtpvp9depay", "rtpvp9pay"),
        Codec::H264 => ("rtph264depay", "rtph264pay"),
        _ => unreachable!("not a video codec"),
    }
}

fn video_subpipeline(w: &StreamWiring) -> String {
    let (depay, pay) = video_depay_pay(w.codec);
    format!(
        "rtpbin name=sess_vid rtp-profile=3 \
         udpsrc port={rtp_port} caps=\"application/x-rtp, media=video, payload={pt}, \
         encoding-name={codec}, clock-rate=90000, rtcp-fb-nack-pli=1, rtcp-fb-nack=1, \
         rtcp-fb-ccm-fir=1, rtp-profile=3\" name={rtp_name} \
         ! sess_vid.recv_rtp_sink_0 \
         sess_vid. ! {depay} name=depay_vid \
         udpsrc port={rtcp_port} name={rtcp_name} ! sess_vid.recv_rtcp_sink_0 \
         sess_vid.send_rtcp_src_0 ! udpsink host=127.0.0.1 port={rtcp_out} sync=false async=false \
         depay_vid. ! {pay} pt={pay_pt}",
        rtp_port = w.rtp_port,
        pt = w.pt,
        codec = w.codec.name(),
        rtp_name = VIDEO_RTP_SRC_NAME,
        depay = depay,
        rtcp_port = w.rtcp_rcv_port,
        rtcp_name = VIDEO_RTCP_SRC_NAME,
        rtcp_out = w.rtcp_snd_port,
        pay = pay,
        pay_pt = VIDEO_PAY_PT,
    )
}

fn audio_subpipeline(w: &StreamWiring) -> String {
    format!(
        "udpsrc port={rtp_port} caps=\"application/x-rtp, media=audio, payload={pt}, \
         encoding-name=OPUS, clock-rate=48000, rtp-profile=3\" name={rtp_name} \
         ! .recv_rtp_sink rtpsession name=sess_aud \
         .recv_rtp_src ! rtpopusdepay name=depay_aud \
         udpsrc port={rtcp_port} name={rtcp_name} ! sess_aud.recv_rtcp_sink \
         sess_aud.send_rtcp_src ! udpsink host=127.0.0.1 port={rtcp_out} \
         depay_aud. ! audio/x-opus, channels=1 ! rtpopuspay pt={pay_pt}",
        rtp_port = w.rtp_port,
        pt = w.pt,
        rtp_name = AUDIO_RTP_SRC_NAME,
        rtcp_port = w.rtcp_rcv_port,
        rtcp_name = AUDIO_RTCP_SRC_NAME,
        rtcp_out = w.rtcp_snd_port,
        pay_pt = AUDIO_PAY_PT,
    )
}
