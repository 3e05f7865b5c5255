//! RTCP report shaping (RFC 3550 §6): the 5-second compound report of
//! Sender Report, Source Description and the SAT>IP APP block.
//!
//! All three packets go out back-to-back in one datagram (or one
//! interleaved chunk). Every 16-bit length field counts 32-bit words
//! minus one.

/// CNAME carried in the SDES block.
const CNAME: &[u8; 6] = b"satip\0";

/// Sender Report (PT=200): NTP wallclock seconds in the integer half
/// (fractional half zero), the current RTP timestamp, and the sender's
/// packet and octet counts.
pub fn sender_report(ssrc: u32, ntp_secs: u32, rtp_timestamp: u32, spc: u32, soc: u32) -> [u8; 28] {
    let mut sr = [0u8; 28];
    sr[0] = 0x80; // version: 2, padding: 0, report blocks: 0
    sr[1] = 200; // payload type: SR
    let words = (sr.len() / 4 - 1) as u16;
    sr[2..4].copy_from_slice(&words.to_be_bytes());
    sr[4..8].copy_from_slice(&ssrc.to_be_bytes());
    sr[8..12].copy_from_slice(&ntp_secs.to_be_bytes());
    // NTP fractional half stays zero
    sr[16..20].copy_from_slice(&rtp_timestamp.to_be_bytes());
    sr[20..24].copy_from_slice(&spc.to_be_bytes());
    sr[24..28].copy_from_slice(&soc.to_be_bytes());
    sr
}

/// Source Description (PT=202) with a single CNAME item.
pub fn source_description(ssrc: u32) -> [u8; 20] {
    let mut sdes = [0u8; 20];
    sdes[0] = 0x81; // version: 2, source count: 1
    sdes[1] = 202; // payload type: SDES
    let words = (sdes.len() / 4 - 1) as u16;
    sdes[2..4].copy_from_slice(&words.to_be_bytes());
    sdes[4..8].copy_from_slice(&ssrc.to_be_bytes());
    sdes[8] = 1; // CNAME
    sdes[9] = CNAME.len() as u8;
    sdes[10..10 + CNAME.len()].copy_from_slice(CNAME);
    sdes
}

/// APP block (PT=204), name "SES1", carrying the stream's attribute
/// describe string padded out to a 32-bit boundary. The inner 16-bit
/// string length counts only the unpadded describe bytes.
pub fn app_packet(ssrc: u32, describe: &str) -> Vec<u8> {
    let desc = describe.as_bytes();
    let mut len = 16 + desc.len();
    if len % 4 != 0 {
        len += 4 - (len % 4);
    }

    let mut app = vec![0u8; len];
    app[0] = 0x80; // version: 2, padding: 0, subtype: 0
    app[1] = 204; // payload type: APP
    let words = (len / 4 - 1) as u16;
    app[2..4].copy_from_slice(&words.to_be_bytes());
    app[4..8].copy_from_slice(&ssrc.to_be_bytes());
    app[8..12].copy_from_slice(b"SES1");
    // identifier stays zero
    app[14..16].copy_from_slice(&(desc.len() as u16).to_be_bytes());
    app[16..16 + desc.len()].copy_from_slice(desc);
    app
}

/// The full compound report sent every interval.
pub fn compound_report(
    ssrc: u32,
    ntp_secs: u32,
    rtp_timestamp: u32,
    spc: u32,
    soc: u32,
    describe: &str,
) -> Vec<u8> {
    let mut report = Vec::with_capacity(28 + 20 + 16 + describe.len() + 4);
    report.extend_from_slice(&sender_report(ssrc, ntp_secs, rtp_timestamp, spc, soc));
    report.extend_from_slice(&source_description(ssrc));
    report.extend_from_slice(&app_packet(ssrc, describe));
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_report_layout() {
        let sr = sender_report(0xAABBCCDD, 1_700_000_000, 0x00090000, 42, 55272);
        assert_eq!(sr[0], 0x80);
        assert_eq!(sr[1], 200);
        assert_eq!(u16::from_be_bytes([sr[2], sr[3]]), 6, "28 bytes = 7 words - 1");
        assert_eq!(&sr[4..8], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(u32::from_be_bytes([sr[8], sr[9], sr[10], sr[11]]), 1_700_000_000);
        assert_eq!(&sr[12..16], &[0, 0, 0, 0], "NTP fraction zero");
        assert_eq!(u32::from_be_bytes([sr[20], sr[21], sr[22], sr[23]]), 42);
        assert_eq!(u32::from_be_bytes([sr[24], sr[25], sr[26], sr[27]]), 55272);
    }

    #[test]
    fn sdes_layout() {
        let sdes = source_description(1);
        assert_eq!(sdes[0], 0x81);
        assert_eq!(sdes[1], 202);
        assert_eq!(u16::from_be_bytes([sdes[2], sdes[3]]), 4);
        assert_eq!(sdes[8], 1, "CNAME item");
        assert_eq!(sdes[9], 6);
        assert_eq!(&sdes[10..16], b"satip\0");
    }

    #[test]
    fn app_framing_for_any_describe_string() {
        for describe in [
            "",
            "x",
            "ver=1.0;src=1;tuner=1,240,1,15,11720,v,dvbs,qpsk,,0.35,27500,34;pids=0,17",
            "abc",
            "abcd",
        ] {
            let app = app_packet(0x01020304, describe);
            assert_eq!(app.len() % 4, 0, "padded to 32-bit");
            let words = u16::from_be_bytes([app[2], app[3]]) as usize;
            let padded = (16 + describe.len()).div_ceil(4) * 4;
            assert_eq!(words, padded / 4 - 1, "length field in words minus one");
            let inner = u16::from_be_bytes([app[14], app[15]]) as usize;
            assert_eq!(inner, describe.len(), "inner length counts unpadded bytes");
            assert_eq!(&app[8..12], b"SES1");
            assert_eq!(&app[16..16 + describe.len()], describe.as_bytes());
            // padding bytes are zero
            assert!(app[16 + describe.len()..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn compound_report_is_three_packets() {
        let report = compound_report(7, 100, 200, 1, 1316, "ver=1.5;tuner=1;uri=udp://x");
        assert_eq!(report[1], 200);
        assert_eq!(report[28 + 1], 202);
        assert_eq!(report[28 + 20 + 1], 204);
        assert_eq!(report.len() % 4, 0);
    }
}
