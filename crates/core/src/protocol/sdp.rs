//! SDP generation for DESCRIBE responses (RFC 4566, SAT>IP §3.5.7).
//!
//! The body enumerates every stream with its current attribute describe
//! string:
//!
//! ```text
//! v=0
//! o=- 0 0 IN IP4 192.168.0.10
//! s=SatIPServer:1 2,0,0
//! t=0 0
//! m=video 0 RTP/AVP 33
//! c=IN IP4 0.0.0.0
//! a=control:stream=1
//! a=fmtp:33 ver=1.0;src=1;tuner=1,240,1,15,11720,v,dvbs,qpsk,,0.35,27500,34;pids=0,17
//! a=sendonly
//! ```

/// Generate the DESCRIBE body.
///
/// `counts` is the advertised (DVB-S2, DVB-T/T2, DVB-C) tuner triple;
/// `streams` carries each stream's describe string and active flag.
pub fn generate_describe(
    host: &str,
    counts: (usize, usize, usize),
    streams: &[(String, bool)],
) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o=- 0 0 IN IP4 {host}"));
    sdp.push(format!(
        "s=SatIPServer:1 {},{},{}",
        counts.0, counts.1, counts.2
    ));
    sdp.push("t=0 0".to_string());

    for (index, (describe, active)) in streams.iter().enumerate() {
        sdp.push("m=video 0 RTP/AVP 33".to_string());
        sdp.push("c=IN IP4 0.0.0.0".to_string());
        sdp.push(format!("a=control:stream={}", index + 1));
        if !describe.is_empty() {
            sdp.push(format!("a=fmtp:33 {describe}"));
        }
        sdp.push(if *active { "a=sendonly" } else { "a=inactive" }.to_string());
    }

    format!("{}\r\n", sdp.join("\r\n"))
}
