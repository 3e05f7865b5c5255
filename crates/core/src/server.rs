//! The RTSP front: listener worker and per-client connections.
//!
//! SAT>IP has no mount table and no per-path routing: one connection
//! speaks for one client, every request resolves through the stream
//! manager, and a connection carrying interleaved sessions takes their
//! transport down with it. The acceptor runs on the same poll-driven
//! worker primitive as the tuner readers; each accepted client gets a
//! plain thread that frames request heads out of a byte carry buffer.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;

use crate::base::Worker;
use crate::config::ServerConfig;
use crate::error::{Result, SatipError};
use crate::protocol::query::SatipQuery;
use crate::protocol::response::StatusCode;
use crate::protocol::{MethodHandler, RtspRequest, RtspResponse};
use crate::stream::StreamManager;

const ACCEPT_POLL_TIMEOUT_MS: u16 = 500;
/// Client reads tick at this pace so the running flag stays responsive.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// A SAT>IP request head is a few hundred bytes; anything beyond this is
/// not RTSP.
const MAX_REQUEST_BYTES: usize = 8192;

/// The RTSP server: binds the listener, runs the acceptor worker and the
/// session sweeper.
pub struct RtspServer {
    config: Arc<ServerConfig>,
    manager: Arc<StreamManager>,
    running: Arc<AtomicBool>,
    acceptor: Mutex<Option<Worker>>,
}

impl RtspServer {
    pub fn new(config: ServerConfig, manager: Arc<StreamManager>) -> Self {
        RtspServer {
            config: Arc::new(config),
            manager,
            running: Arc::new(AtomicBool::new(false)),
            acceptor: Mutex::new(None),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SatipError::AlreadyRunning);
        }

        let listener = TcpListener::bind((self.config.bind_ip, self.config.rtsp_port))?;
        listener.set_nonblocking(true)?;

        self.running.store(true, Ordering::SeqCst);
        self.manager.start_session_sweeper();

        tracing::info!(
            ip = %self.config.bind_ip,
            port = self.config.rtsp_port,
            uuid = %self.config.uuid,
            "RTSP server listening"
        );

        let manager = self.manager.clone();
        let config = self.config.clone();
        let running = self.running.clone();

        let acceptor = Worker::spawn("rtsp-acceptor", move || {
            // level-triggered readiness, same cadence as the tuner reads
            let raw = listener.as_raw_fd();
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(raw) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            let ready =
                matches!(poll(&mut fds, PollTimeout::from(ACCEPT_POLL_TIMEOUT_MS)), Ok(n) if n > 0);
            if !ready {
                return true;
            }

            match listener.accept() {
                Ok((socket, peer)) => {
                    tracing::info!(%peer, "client connected");
                    let m = manager.clone();
                    let c = config.clone();
                    let r = running.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("rtsp-{peer}"))
                        .spawn(move || serve_connection(socket, m, c, r));
                    if let Err(e) = spawned {
                        tracing::error!(error = %e, "connection thread spawn failed");
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => tracing::warn!(error = %e, "TCP accept error"),
            }
            true
        });
        *self.acceptor.lock() = Some(acceptor);

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut acceptor) = self.acceptor.lock().take() {
            acceptor.stop();
        }
        self.manager.stop();
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Serve one RTSP client until it hangs up or the server stops.
///
/// Requests and responses share the socket with any interleaved frames;
/// the pump for an interleaved PLAY therefore starts only after its
/// response has been written.
fn serve_connection(
    socket: TcpStream,
    manager: Arc<StreamManager>,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
) {
    let Ok(peer) = socket.peer_addr() else {
        return;
    };
    if socket.set_read_timeout(Some(CLIENT_READ_TIMEOUT)).is_err() {
        return;
    }

    let mut handler = MethodHandler::new(manager.clone(), config, peer);
    let mut pending: Vec<u8> = Vec::new();

    let goodbye = loop {
        if !running.load(Ordering::SeqCst) {
            break "server shutting down";
        }

        let head = match next_request_head(&socket, &mut pending) {
            Ok(Some(head)) => head,
            Ok(None) => continue, // read timeout tick, re-check running
            Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => break "client hung up",
            Err(e) => {
                tracing::warn!(%peer, error = %e, "connection read failed");
                break "read failed";
            }
        };

        let reply = match RtspRequest::parse(&head) {
            Ok(request) => {
                tracing::debug!(%peer, method = %request.method, uri = %request.uri, "request");
                handler.handle(&request, &socket)
            }
            Err(e) => {
                // unparsable head: answer 400, the CSeq is unknowable
                tracing::warn!(%peer, error = %e, "unparsable request");
                RtspResponse::new(StatusCode::BadRequest, 0)
            }
        };

        tracing::debug!(%peer, status = reply.status(), "response");
        let mut writer: &TcpStream = &socket;
        if writer.write_all(reply.to_wire().as_bytes()).is_err() {
            break "write failed";
        }

        // interleaved PLAY: pumps start only now, so no frame precedes
        // the response on this socket
        if let Some(stream) = handler.take_deferred_start()
            && let Err(e) = stream.start_pumps()
        {
            tracing::error!(stream = stream.id(), error = %e, "pump start failed");
        }
    };

    // sessions riding this connection lose their transport with it; UDP
    // sessions survive an RTSP reconnect
    for session_id in handler.interleaved_sessions() {
        if let Ok((stream, _)) =
            manager.find_stream_for(peer.ip(), Some(session_id.as_str()), &SatipQuery::default())
        {
            stream.mark_self_destruct("RTSP connection closed");
        }
    }

    tracing::info!(%peer, goodbye, "client disconnected");
}

/// Accumulate bytes until a blank line terminates a request head, and
/// split that head off the carry buffer. `Ok(None)` means the read timed
/// out before a head completed; pipelined bytes past the head stay queued
/// for the next call.
fn next_request_head(socket: &TcpStream, pending: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    loop {
        if let Some(end) = head_end(pending) {
            let head: Vec<u8> = pending.drain(..end).collect();
            return Ok(Some(String::from_utf8_lossy(&head).into_owned()));
        }
        if pending.len() > MAX_REQUEST_BYTES {
            return Err(std::io::Error::other("oversized request head"));
        }

        let mut chunk = [0u8; 1024];
        let mut reader: &TcpStream = socket;
        match reader.read(&mut chunk) {
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
            Err(ref e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Offset one past the blank line ending a request head, if present.
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_end_detection() {
        assert_eq!(head_end(b"OPTIONS / RTSP/1.0\r\nCSeq: 1\r\n\r\n"), Some(31));
        assert_eq!(head_end(b"OPTIONS / RTSP/1.0\nCSeq: 1\n\n"), Some(28));
        assert_eq!(head_end(b"OPTIONS / RTSP/1.0\r\nCSeq: 1\r\n"), None);
        assert_eq!(head_end(b""), None);
    }

    #[test]
    fn pipelined_heads_stay_queued() {
        let mut pending = Vec::new();
        pending.extend_from_slice(b"A / RTSP/1.0\r\n\r\nB / RTSP/1.0\r\n\r\n");
        let end = head_end(&pending).unwrap();
        let head: Vec<u8> = pending.drain(..end).collect();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(head_end(&pending), Some(pending.len()));
    }
}
