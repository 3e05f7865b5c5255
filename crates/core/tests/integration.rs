//! Integration tests: full RTSP handshakes against a running server with a
//! file-backed TS source, over both UDP and interleaved TCP transports.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use satip::{RtspServer, ServerConfig, StreamManager};

const TS_PACKET_SIZE: usize = 188;

fn write_ts_file(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for i in 0..21u8 {
        let mut pkt = [0u8; TS_PACKET_SIZE];
        pkt[0] = 0x47;
        pkt[1] = 0x01;
        pkt[2] = 0x00;
        pkt[3] = 0x10 | (i & 0x0F);
        file.write_all(&pkt).unwrap();
    }
    path
}

fn start_server(rtsp_port: u16) -> RtspServer {
    let config = ServerConfig {
        bind_ip: [127, 0, 0, 1].into(),
        rtsp_port,
        dvb_path: std::env::temp_dir().join("satip-integration-no-dvb"),
        ..ServerConfig::default()
    };
    let manager = StreamManager::new(&config);
    let mut server = RtspServer::new(config, manager);
    server.start().expect("server start");
    server
}

fn connect(port: u16) -> BufReader<TcpStream> {
    let addr = format!("127.0.0.1:{port}")
        .to_socket_addrs()
        .unwrap()
        .next()
        .unwrap();
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    BufReader::new(stream)
}

/// Send a request and read the full response (headers plus body).
fn rtsp_request(reader: &mut BufReader<TcpStream>, request: &str) -> String {
    reader.get_ref().write_all(request.as_bytes()).unwrap();

    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        && len > 0
    {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).unwrap();
        response.push_str(&String::from_utf8_lossy(&body));
    }

    response
}

fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response
        .lines()
        .find(|l| l.to_lowercase().starts_with(&name.to_lowercase()))
        .and_then(|l| l.split_once(':'))
        .map(|(_, v)| v.trim())
}

#[test]
fn udp_handshake_and_rtp_flow() {
    let path = write_ts_file("satip-int-udp.ts");
    let mut server = start_server(18554);
    let mut conn = connect(18554);

    let base = "rtsp://127.0.0.1:18554";

    // OPTIONS
    let response = rtsp_request(&mut conn, &format!("OPTIONS {base}/ RTSP/1.0\r\nCSeq: 1\r\n\r\n"));
    assert!(response.starts_with("RTSP/1.0 200 OK"), "{response}");
    assert!(header_value(&response, "Public:").unwrap().contains("SETUP"));

    // DESCRIBE
    let response = rtsp_request(
        &mut conn,
        &format!("DESCRIBE {base}/ RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"),
    );
    assert!(response.starts_with("RTSP/1.0 200 OK"), "{response}");
    assert!(response.contains("Content-Type: application/sdp"));
    assert!(response.contains("v=0"));
    assert!(response.contains("s=SatIPServer:1"));
    assert!(response.contains("m=video 0 RTP/AVP 33"));
    assert!(response.contains("a=inactive"));

    // SETUP with a client UDP port pair
    let rtp_receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp_receiver
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    let rtp_port = rtp_receiver.local_addr().unwrap().port();

    let uri = format!("{base}/?msys=file&uri={}&pids=all", path.display());
    let response = rtsp_request(
        &mut conn,
        &format!(
            "SETUP {uri} RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port={rtp_port}-{}\r\n\r\n",
            rtp_port + 1
        ),
    );
    assert!(response.starts_with("RTSP/1.0 200 OK"), "{response}");
    let transport = header_value(&response, "Transport:").expect("Transport header");
    assert!(transport.contains(&format!("client_port={rtp_port}-{}", rtp_port + 1)));
    assert!(transport.contains("server_port="), "{transport}");

    let session = header_value(&response, "Session:").expect("Session header");
    let session_id = session.split(';').next().unwrap().trim();
    assert_eq!(session_id.len(), 12, "12-digit session id");
    assert!(session.contains("timeout=60"));

    // PLAY starts the RTP flow to the client port
    let response = rtsp_request(
        &mut conn,
        &format!("PLAY {base}/stream=1 RTSP/1.0\r\nCSeq: 4\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(response.starts_with("RTSP/1.0 200 OK"), "{response}");

    let mut buf = [0u8; 2048];
    let mut last_seq: Option<u16> = None;
    for _ in 0..3 {
        let n = rtp_receiver.recv(&mut buf).expect("RTP packet");
        assert_eq!(buf[0] >> 6, 2, "RTP version 2");
        assert_eq!(buf[1] & 0x7F, 33, "payload type MP2T");
        assert_eq!((n - 12) % TS_PACKET_SIZE, 0, "whole TS packets");
        assert_eq!(buf[12], 0x47, "payload starts at sync byte");
        let seq = u16::from_be_bytes([buf[2], buf[3]]);
        if let Some(last) = last_seq {
            assert_eq!(seq, last.wrapping_add(1));
        }
        last_seq = Some(seq);
    }

    // DESCRIBE now shows the active stream's fmtp line
    let response = rtsp_request(
        &mut conn,
        &format!("DESCRIBE {base}/ RTSP/1.0\r\nCSeq: 5\r\n\r\n"),
    );
    assert!(response.contains("a=fmtp:33 ver=1.5;tuner=1;file="));
    assert!(response.contains("a=sendonly"));

    // TEARDOWN frees the session
    let response = rtsp_request(
        &mut conn,
        &format!("TEARDOWN {base}/stream=1 RTSP/1.0\r\nCSeq: 6\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(response.starts_with("RTSP/1.0 200 OK"), "{response}");

    // the id is gone afterwards
    let response = rtsp_request(
        &mut conn,
        &format!("PLAY {base}/stream=1 RTSP/1.0\r\nCSeq: 7\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(response.starts_with("RTSP/1.0 454"), "{response}");

    server.stop();
    let _ = std::fs::remove_file(path);
}

#[test]
fn interleaved_tcp_frames_on_the_rtsp_connection() {
    let path = write_ts_file("satip-int-tcp.ts");
    let mut server = start_server(18555);
    let mut conn = connect(18555);

    let base = "rtsp://127.0.0.1:18555";
    let uri = format!("{base}/?msys=file&uri={}&pids=all", path.display());

    let response = rtsp_request(
        &mut conn,
        &format!(
            "SETUP {uri} RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
        ),
    );
    assert!(response.starts_with("RTSP/1.0 200 OK"), "{response}");
    let transport = header_value(&response, "Transport:").unwrap();
    assert!(transport.contains("RTP/AVP/TCP"));
    assert!(transport.contains("interleaved=0-1"));
    let session_id = header_value(&response, "Session:")
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .trim()
        .to_string();

    let response = rtsp_request(
        &mut conn,
        &format!("PLAY {base}/stream=1 RTSP/1.0\r\nCSeq: 2\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(response.starts_with("RTSP/1.0 200 OK"), "{response}");

    // data now arrives interleaved on this very connection:
    // '$', channel, 16-bit length, then the RTP packet
    for _ in 0..3 {
        let mut header = [0u8; 4];
        conn.read_exact(&mut header).expect("interleaved header");
        assert_eq!(header[0], 0x24);
        assert!(header[1] <= 1, "negotiated channel byte");
        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        let mut payload = vec![0u8; len];
        conn.read_exact(&mut payload).expect("interleaved payload");
        if header[1] == 0 {
            assert_eq!(payload[0] >> 6, 2, "RTP version");
            assert_eq!(payload[1] & 0x7F, 33, "MP2T");
            assert_eq!((len - 12) % TS_PACKET_SIZE, 0);
            assert_eq!(payload[12], 0x47);
        } else {
            assert_eq!(payload[1], 200, "RTCP compound starts with SR");
        }
    }

    server.stop();
    let _ = std::fs::remove_file(path);
}

#[test]
fn unknown_session_gets_454() {
    let mut server = start_server(18556);
    let mut conn = connect(18556);

    let response = rtsp_request(
        &mut conn,
        "PLAY rtsp://127.0.0.1:18556/stream=1 RTSP/1.0\r\nCSeq: 1\r\nSession: 999999999999\r\n\r\n",
    );
    assert!(response.starts_with("RTSP/1.0 454 Session Not Found"), "{response}");

    server.stop();
}

#[test]
fn transport_syntax_errors_get_400() {
    let mut server = start_server(18557);
    let mut conn = connect(18557);
    let base = "rtsp://127.0.0.1:18557";

    // missing Transport header
    let response = rtsp_request(
        &mut conn,
        &format!("SETUP {base}/?msys=file RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
    );
    assert!(response.starts_with("RTSP/1.0 400"), "{response}");

    // transport without ports
    let response = rtsp_request(
        &mut conn,
        &format!("SETUP {base}/?msys=file RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP;unicast\r\n\r\n"),
    );
    assert!(response.starts_with("RTSP/1.0 400"), "{response}");

    server.stop();
}

#[test]
fn incapable_delivery_system_gets_503() {
    let mut server = start_server(18558);
    let mut conn = connect(18558);

    // no DVB hardware enumerated: nothing can do dvbs
    let response = rtsp_request(
        &mut conn,
        "SETUP rtsp://127.0.0.1:18558/?msys=dvbs&freq=11720&pol=v&sr=27500&fec=34 RTSP/1.0\r\n\
         CSeq: 1\r\nTransport: RTP/AVP;unicast;client_port=45678-45679\r\n\r\n",
    );
    assert!(response.starts_with("RTSP/1.0 503"), "{response}");

    server.stop();
}
