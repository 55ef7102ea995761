//! Line parsers for the two SDP line shapes the plugin inspects.

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, space1, u16 as parse_u16},
    multi::separated_list1,
    sequence::{preceded, tuple},
    IResult,
};

/// A parsed `m=` line: `m=<media> <port> <proto> <pt> [<pt> ...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    pub media: String,
    pub port: u16,
    pub proto: String,
    pub payloads: Vec<u16>,
}

/// A parsed `a=rtpmap:` line: `a=rtpmap:<pt> <encoding>/<clock>[/...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub pt: u16,
    pub encoding: String,
    pub clock_rate: u32,
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace())(input)
}

fn media_line_parser(input: &str) -> IResult<&str, MediaLine> {
    let (rest, (_, media, _, port, _, proto, _, payloads)) = tuple((
        tag("m="),
        take_while1(|c: char| c.is_ascii_alphanumeric()),
        space1,
        parse_u16,
        space1,
        token,
        space1,
        separated_list1(space1, parse_u16),
    ))(input)?;
    Ok((
        rest,
        MediaLine {
            media: media.to_string(),
            port,
            proto: proto.to_string(),
            payloads,
        },
    ))
}

fn rtpmap_parser(input: &str) -> IResult<&str, RtpMap> {
    let (rest, (_, pt, _, encoding, clock_rate)) = tuple((
        tag("a=rtpmap:"),
        parse_u16,
        space1,
        take_while1(|c: char| c != '/'),
        preceded(char('/'), nom::character::complete::u32),
    ))(input)?;
    Ok((
        rest,
        RtpMap {
            pt,
            encoding: encoding.to_string(),
            clock_rate,
        },
    ))
}

/// Parses an `m=` line; `None` when the line has another shape.
pub fn media_line(line: &str) -> Option<MediaLine> {
    media_line_parser(line.trim_end()).ok().map(|(_, m)| m)
}

/// Parses an `a=rtpmap:` line; `None` when the line has another shape.
pub fn rtpmap_line(line: &str) -> Option<RtpMap> {
    rtpmap_parser(line.trim_end()).ok().map(|(_, m)| m)
}
