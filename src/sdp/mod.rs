//! SDP inspection and rewriting.
//!
//! The plugin never needs a full session-description model: it inspects the
//! payload types enumerated on the audio/video `m=` lines, maps them to
//! codecs through the `a=rtpmap` attributes, reorders the video line so a
//! preferred codec comes first, and sanitizes the bounced-back offer
//! (media direction and FEC/retransmission leftovers).

mod parse;

pub use parse::{media_line, rtpmap_line, MediaLine, RtpMap};

/// The two stream kinds a session can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn is_video(self) -> bool {
        self == MediaKind::Video
    }

    /// Role-name prefix of the stream's sockets.
    pub fn prefix(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// Codecs the plugin can bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Opus,
    Vp8,
    Vp9,
    H264,
    /// No codec negotiated / unknown payload type.
    Invalid,
}

impl Codec {
    /// Canonical encoding name as it appears in `a=rtpmap` lines.
    pub fn name(self) -> &'static str {
        match self {
            Codec::H264 => "H264",
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
            Codec::Opus => "opus",
            Codec::Invalid => "INVALID",
        }
    }

    /// Inverse of [`Codec::name`]; unknown names map to `Invalid`.
    pub fn from_name(name: &str) -> Codec {
        match name {
            "H264" => Codec::H264,
            "VP8" => Codec::Vp8,
            "VP9" => Codec::Vp9,
            "opus" => Codec::Opus,
            _ => Codec::Invalid,
        }
    }

    pub fn is_valid(self) -> bool {
        self != Codec::Invalid
    }

    pub fn is_video(self) -> bool {
        matches!(self, Codec::Vp8 | Codec::Vp9 | Codec::H264)
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// First payload type declared by an `a=rtpmap:<pt> <name>/...` line for
/// `codec`, or -1 when the codec is not offered.
pub fn get_pt(sdp: &str, codec: Codec) -> i32 {
    if !codec.is_valid() {
        return -1;
    }
    for line in sdp.lines() {
        if let Some(map) = rtpmap_line(line) {
            if map.encoding == codec.name() {
                return map.pt as i32;
            }
        }
    }
    -1
}

/// Codec behind the first payload type on the video `m=` line.
pub fn get_video_codec(sdp: &str) -> Codec {
    codec_for_kind(sdp, "video")
}

/// Codec behind the first payload type on the audio `m=` line.
pub fn get_audio_codec(sdp: &str) -> Codec {
    codec_for_kind(sdp, "audio")
}

fn codec_for_kind(sdp: &str, kind: &str) -> Codec {
    match first_pt_for_kind(sdp, kind) {
        Some(pt) => pt_to_codec(sdp, pt),
        None => Codec::Invalid,
    }
}

fn first_pt_for_kind(sdp: &str, kind: &str) -> Option<u16> {
    sdp.lines()
        .find_map(|line| media_line(line).filter(|m| m.media == kind))
        .and_then(|m| m.payloads.first().copied())
}

fn pt_to_codec(sdp: &str, pt: u16) -> Codec {
    for line in sdp.lines() {
        if let Some(map) = rtpmap_line(line) {
            if map.pt == pt {
                return Codec::from_name(&map.encoding);
            }
        }
    }
    Codec::Invalid
}

/// Walks `priority` in order and returns the first codec whose payload
/// type appears in `sdp`; `Invalid` when none matches (or the list is
/// empty, which disables prioritization).
pub fn select_video_codec_by_priority(sdp: &str, priority: &[Codec]) -> Codec {
    for codec in priority {
        if get_pt(sdp, *codec) != -1 {
            return *codec;
        }
    }
    Codec::Invalid
}

/// Reorders the payload types on the video `m=` line so `chosen` comes
/// first; the other payload types keep their relative order.
///
/// The SDP is returned unchanged when `chosen` is invalid or not offered,
/// already first, or the video line cannot be parsed.
pub fn rewrite_video_line(sdp: &str, chosen: Codec) -> String {
    let chosen_pt = get_pt(sdp, chosen);
    if chosen_pt < 0 {
        return sdp.to_string();
    }
    let chosen_pt = chosen_pt as u16;

    let original = match sdp.lines().find(|l| l.starts_with("m=video")) {
        Some(line) => line,
        None => return sdp.to_string(),
    };
    let parsed = match media_line(original) {
        Some(m) => m,
        None => return sdp.to_string(),
    };
    if parsed.payloads.first() == Some(&chosen_pt) || !parsed.payloads.contains(&chosen_pt) {
        return sdp.to_string();
    }

    let mut reordered = Vec::with_capacity(parsed.payloads.len());
    reordered.push(chosen_pt);
    reordered.extend(parsed.payloads.iter().copied().filter(|pt| *pt != chosen_pt));

    let pts = reordered
        .iter()
        .map(|pt| pt.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let rewritten = format!(
        "m=video {} {} {}",
        parsed.port, parsed.proto, pts
    );
    sdp.replacen(original, &rewritten, 1)
}

/// Payload-type references the original offers drag along for FEC and
/// retransmission; stripped together with their rtpmap/fmtp lines.
const STRIPPED_PTS: [u16; 5] = [116, 117, 96, 97, 98];

const STRIPPED_LINES: [&str; 8] = [
    "a=rtpmap:116 red/90000\r\n",
    "a=rtpmap:117 ulpfec/90000\r\n",
    "a=rtpmap:96 rtx/90000\r\n",
    "a=fmtp:96 apt=100\r\n",
    "a=rtpmap:97 rtx/90000\r\n",
    "a=fmtp:97 apt=101\r\n",
    "a=rtpmap:98 rtx/90000\r\n",
    "a=fmtp:98 apt=116\r\n",
];

/// Rewrites a bounced-back offer: `recvonly` becomes `inactive`,
/// `sendonly` becomes `recvonly`, and (only when the offer carries
/// ulpfec) the red/ulpfec/rtx lines and their payload-type references are
/// removed from the media lines.
pub fn sanitize_offer(sdp: &str) -> String {
    let mut sdp = if sdp.contains("a=recvonly") {
        sdp.replace("a=recvonly", "a=inactive")
    } else if sdp.contains("a=sendonly") {
        sdp.replace("a=sendonly", "a=recvonly")
    } else {
        sdp.to_string()
    };

    if sdp.contains("ulpfec") {
        for line in STRIPPED_LINES {
            sdp = sdp.replace(line, "");
        }
        sdp = strip_media_line_pts(&sdp, &STRIPPED_PTS);
    }
    sdp
}

fn strip_media_line_pts(sdp: &str, pts: &[u16]) -> String {
    let mut out = sdp.to_string();
    let media_lines: Vec<String> = sdp
        .lines()
        .filter(|l| l.starts_with("m="))
        .map(|l| l.to_string())
        .collect();
    for line in media_lines {
        if let Some(parsed) = media_line(&line) {
            let kept: Vec<u16> = parsed
                .payloads
                .iter()
                .copied()
                .filter(|pt| !pts.contains(pt))
                .collect();
            if kept.len() != parsed.payloads.len() && !kept.is_empty() {
                let joined = kept
                    .iter()
                    .map(|pt| pt.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                let rewritten = format!(
                    "m={} {} {} {}",
                    parsed.media, parsed.port, parsed.proto, joined
                );
                out = out.replacen(&line, &rewritten, 1);
            }
        }
    }
    out
}
