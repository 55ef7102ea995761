//! Minimal RTCP feedback support for the return path toward the peer.
//!
//! The plugin only ever originates two feedback shapes: REMB (to cap the
//! encoder bitrate) and PLI (to request a keyframe), both as
//! payload-specific feedback packets per RFC 4585; and it scans forwarded
//! compound packets for PLI so the event can be logged.

use bytes::{BufMut, Bytes, BytesMut};

/// RTCP version, always 2.
const RTCP_VERSION: u8 = 2;

/// Payload-specific feedback packet type (RFC 4585).
const PT_PSFB: u8 = 206;

/// Picture Loss Indication FMT (RFC 4585 §6.3.1).
const FMT_PLI: u8 = 1;

/// Application layer feedback FMT; REMB lives here (RFC 4585 §6.4).
const FMT_AFB: u8 = 15;

/// Builds a 24-byte REMB packet capping the encoder at `bitrate` bits/s.
pub fn remb(bitrate: u64) -> Bytes {
    let mut exponent = 0u8;
    let mut mantissa = bitrate;
    while mantissa > 0x3ffff {
        mantissa >>= 1;
        exponent += 1;
    }

    let mut buf = BytesMut::with_capacity(24);
    buf.put_u8((RTCP_VERSION << 6) | FMT_AFB);
    buf.put_u8(PT_PSFB);
    buf.put_u16(5); // length in words minus one
    buf.put_u32(0); // sender SSRC, rewritten by the gateway
    buf.put_u32(0); // media SSRC
    buf.put_slice(b"REMB");
    buf.put_u8(1); // one SSRC entry
    buf.put_u8((exponent << 2) | ((mantissa >> 16) as u8 & 0x03));
    buf.put_u16((mantissa & 0xffff) as u16);
    buf.put_u32(0); // feedback SSRC
    buf.freeze()
}

/// Builds a 12-byte PLI packet.
pub fn pli() -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8((RTCP_VERSION << 6) | FMT_PLI);
    buf.put_u8(PT_PSFB);
    buf.put_u16(2);
    buf.put_u32(0); // sender SSRC
    buf.put_u32(0); // media SSRC
    buf.freeze()
}

/// Scans a (possibly compound) RTCP packet for a PLI.
pub fn has_pli(buf: &[u8]) -> bool {
    let mut offset = 0;
    while offset + 4 <= buf.len() {
        let header = buf[offset];
        if header >> 6 != RTCP_VERSION {
            return false;
        }
        let fmt = header & 0x1f;
        let pt = buf[offset + 1];
        if pt == PT_PSFB && fmt == FMT_PLI {
            return true;
        }
        let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += (words + 1) * 4;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remb_packet_shape() {
        let pkt = remb(128_000);
        assert_eq!(pkt.len(), 24);
        assert_eq!(pkt[0], 0x8f);
        assert_eq!(pkt[1], 206);
        assert_eq!(&pkt[12..16], b"REMB");
        assert_eq!(pkt[16], 1);
    }

    #[test]
    fn remb_round_trips_the_bitrate() {
        for bitrate in [64_000u64, 128_000, 256_000, 2_500_000] {
            let pkt = remb(bitrate);
            let exponent = pkt[17] >> 2;
            let mantissa =
                ((pkt[17] as u64 & 0x03) << 16) | ((pkt[18] as u64) << 8) | pkt[19] as u64;
            assert_eq!(mantissa << exponent, bitrate);
        }
    }

    #[test]
    fn pli_packet_shape() {
        let pkt = pli();
        assert_eq!(pkt.len(), 12);
        assert_eq!(pkt[0], 0x81);
        assert_eq!(pkt[1], 206);
        assert!(has_pli(&pkt));
    }

    #[test]
    fn detects_pli_inside_a_compound_packet() {
        // Receiver report (empty) followed by a PLI.
        let mut compound = BytesMut::new();
        compound.put_u8(0x80);
        compound.put_u8(201);
        compound.put_u16(1);
        compound.put_u32(0x1234);
        compound.extend_from_slice(&pli());
        assert!(has_pli(&compound));

        let mut rr_only = BytesMut::new();
        rr_only.put_u8(0x80);
        rr_only.put_u8(201);
        rr_only.put_u16(1);
        rr_only.put_u32(0x1234);
        assert!(!has_pli(&rr_only));
        assert!(!has_pli(&[]));
    }
}
