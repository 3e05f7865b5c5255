//! Streams: the channel reservations owning one tuner and the output
//! pumps, plus the process-wide stream manager.
//!
//! A stream exists for the whole process lifetime (one per enumerated
//! device) and flips between idle and active as clients come and go. While
//! active it runs three workers: the tuner *reader* (device → buffer
//! ring, with in-place descrambling), the RTP *writer* (ring → transport)
//! and the RTCP reporter.

pub mod client;
pub mod manager;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::RngExt;

use crate::base::Worker;
use crate::decrypt::DvbapiClient;
use crate::error::{Result, SatipError};
use crate::input::TunerSource;
use crate::output::BufferRing;
use crate::output::rtcp;
use crate::output::rtp::{RtpSender, SendOutcome, SenderTransport};
use crate::protocol::SatipQuery;

pub use client::{ClientTransport, StreamClient};
pub use manager::StreamManager;

/// Minimum spacing between RTP sends, and the pump's wake granularity.
const SEND_INTERVAL: Duration = Duration::from_micros(100);
/// RTCP report interval, counted in 50 ms pump ticks.
const RTCP_TICKS_PER_REPORT: u32 = 100;
const RTCP_TICK: Duration = Duration::from_millis(50);

/// State shared between the stream's workers and the RTSP side.
pub struct StreamShared {
    pub id: usize,
    pub ssrc: u32,
    start: Instant,
    pub client: Mutex<Option<StreamClient>>,
    pub ring: BufferRing,
    spc: AtomicU32,
    soc: AtomicU32,
    rtp_timestamp: AtomicU32,
}

impl StreamShared {
    /// 90-kHz RTP timestamp sampled now.
    fn timestamp_now(&self) -> u32 {
        (self.start.elapsed().as_millis() as u64).wrapping_mul(90) as u32
    }

    fn touch(&self) {
        if let Some(client) = self.client.lock().as_mut() {
            client.touch();
        }
    }

    fn self_destruct(&self, reason: &str) {
        let mut client = self.client.lock();
        if let Some(client) = client.as_mut()
            && !client.self_destruct
        {
            tracing::error!(stream = self.id, reason, "marking client for destruction");
            client.self_destruct = true;
        }
    }
}

#[derive(Default)]
struct Pumps {
    reader: Option<Worker>,
    writer: Option<Worker>,
    rtcp: Option<Worker>,
}

impl Pumps {
    fn stop(&mut self) {
        // stop the producer first so the writer drains cleanly
        if let Some(mut worker) = self.reader.take() {
            worker.stop();
        }
        if let Some(mut worker) = self.writer.take() {
            worker.stop();
        }
        if let Some(mut worker) = self.rtcp.take() {
            worker.stop();
        }
    }

    fn running(&self) -> bool {
        self.writer.is_some()
    }
}

/// A channel reservation: one tuner, at most one client, the pumps.
pub struct Stream {
    shared: Arc<StreamShared>,
    input: Arc<dyn TunerSource>,
    decrypt: Option<Arc<DvbapiClient>>,
    pumps: Mutex<Pumps>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl Stream {
    pub fn new(id: usize, input: Arc<dyn TunerSource>, decrypt: Option<Arc<DvbapiClient>>) -> Self {
        let ssrc: u32 = rand::rng().random();
        Stream {
            shared: Arc::new(StreamShared {
                id,
                ssrc,
                start: Instant::now(),
                client: Mutex::new(None),
                ring: BufferRing::new(ssrc, 0),
                spc: AtomicU32::new(0),
                soc: AtomicU32::new(0),
                rtp_timestamp: AtomicU32::new(0),
            }),
            input,
            decrypt,
            pumps: Mutex::new(Pumps::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn ssrc(&self) -> u32 {
        self.shared.ssrc
    }

    pub fn input(&self) -> &Arc<dyn TunerSource> {
        &self.input
    }

    pub fn has_client(&self) -> bool {
        self.shared.client.lock().is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared
            .client
            .lock()
            .as_ref()
            .map(|c| c.session_id.clone())
    }

    pub fn client_ip(&self) -> Option<std::net::IpAddr> {
        self.shared.client.lock().as_ref().map(|c| c.ip)
    }

    pub fn session_header_value(&self) -> Option<String> {
        self.shared
            .client
            .lock()
            .as_ref()
            .map(|c| c.session_header_value())
    }

    /// Attach a client created by SETUP.
    pub fn set_client(&self, client: StreamClient) {
        tracing::info!(
            stream = self.shared.id,
            session = %client.session_id,
            ip = %client.ip,
            "client attached"
        );
        *self.shared.client.lock() = Some(client);
    }

    /// Read something from the attached client.
    pub fn with_client<R>(&self, f: impl FnOnce(&StreamClient) -> R) -> Option<R> {
        self.shared.client.lock().as_ref().map(f)
    }

    /// Refresh the client's liveness clock (RTSP activity).
    pub fn touch_client(&self) {
        self.shared.touch();
    }

    /// Apply a request's SAT>IP parameters to the owned tuner.
    pub fn apply_query(&self, query: &SatipQuery) -> Result<()> {
        self.input.parse_stream_parameters(query)
    }

    pub fn is_streaming(&self) -> bool {
        self.pumps.lock().running()
    }

    /// Bring the tuner in line with the requested parameters (tune and
    /// PID reconciliation). Fails the triggering request on tuner errors.
    pub fn update_tuner(&self) -> Result<()> {
        self.input.update()
    }

    /// PLAY: bring the tuner up to date and start the pumps.
    pub fn start_streaming(&self) -> Result<()> {
        self.update_tuner()?;
        self.start_pumps()
    }

    /// Start the reader/writer/RTCP workers for the attached client.
    pub fn start_pumps(&self) -> Result<()> {
        let mut pumps = self.pumps.lock();
        if pumps.running() {
            return Ok(());
        }
        self.shared.ring.flush();

        let (rtp_transport, rtcp_transport, rr_socket) = self
            .shared
            .client
            .lock()
            .as_ref()
            .map(|client| build_transports(client))
            .transpose()?
            .ok_or(SatipError::NotStarted)?;

        pumps.reader = Some(self.spawn_reader());
        pumps.writer = Some(self.spawn_writer(rtp_transport));
        pumps.rtcp = Some(self.spawn_rtcp(rtcp_transport, rr_socket));

        tracing::info!(stream = self.shared.id, "streaming started");
        Ok(())
    }

    fn spawn_reader(&self) -> Worker {
        let input = self.input.clone();
        let shared = self.shared.clone();
        let decrypt = self.decrypt.clone();
        Worker::spawn(&format!("reader-{}", shared.id), move || {
            if !input.is_data_available() {
                return true;
            }
            let mut published = false;
            {
                let mut slot = shared.ring.write_slot();
                if input.read_full_ts_packet(&mut slot) {
                    if shared.ring.available() > 1 {
                        if let (Some(client), Some(state)) = (&decrypt, input.decrypt_state()) {
                            client.decrypt(shared.id, state, &mut slot);
                        }
                        published = true;
                    } else {
                        // ring full: drop this buffer, re-sync on the next fill
                        slot.reset();
                    }
                }
            }
            if published {
                shared.ring.publish();
            }
            true
        })
    }

    fn spawn_writer(&self, transport: SenderTransport) -> Worker {
        let shared = self.shared.clone();
        let mut sender = RtpSender::new(transport);
        let mut last_send = Instant::now();
        Worker::spawn(&format!("writer-{}", shared.id), move || {
            if last_send.elapsed() >= SEND_INTERVAL {
                let outcome = shared.ring.pop_ready(|buffer| {
                    let timestamp = shared.timestamp_now();
                    let outcome = sender.send_frame(buffer, timestamp);
                    if let SendOutcome::Sent(_) = outcome {
                        shared.spc.fetch_add(1, Ordering::Relaxed);
                        shared
                            .soc
                            .fetch_add(buffer.payload_len() as u32, Ordering::Relaxed);
                        shared.rtp_timestamp.store(timestamp, Ordering::Relaxed);
                    }
                    outcome
                });
                if let Some(outcome) = outcome {
                    last_send = Instant::now();
                    if outcome == SendOutcome::PeerGone {
                        shared.self_destruct("RTP send failed");
                    }
                }
            }
            thread::sleep(SEND_INTERVAL);
            true
        })
    }

    fn spawn_rtcp(
        &self,
        transport: SenderTransport,
        rr_socket: Option<Arc<std::net::UdpSocket>>,
    ) -> Worker {
        let shared = self.shared.clone();
        let input = self.input.clone();
        let mut sender = RtpSender::new(transport);
        let mut ticks = 0u32;
        Worker::spawn(&format!("rtcp-{}", shared.id), move || {
            // receiver reports count as client liveness
            if let Some(socket) = &rr_socket {
                let mut buf = [0u8; 1500];
                while let Ok(n) = socket.recv(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    shared.touch();
                }
            }

            ticks += 1;
            if ticks >= RTCP_TICKS_PER_REPORT {
                ticks = 0;
                let describe = input.attribute_describe_string().unwrap_or_default();
                let ntp_secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0);
                let report = rtcp::compound_report(
                    shared.ssrc,
                    ntp_secs,
                    shared.rtp_timestamp.load(Ordering::Relaxed),
                    shared.spc.load(Ordering::Relaxed),
                    shared.soc.load(Ordering::Relaxed),
                    &describe,
                );
                if sender.send_raw(&report) == SendOutcome::PeerGone {
                    shared.self_destruct("RTCP send failed");
                }
            }
            thread::sleep(RTCP_TICK);
            true
        })
    }

    /// TEARDOWN (or reaping): stop pumps, release the tuner and the client.
    pub fn teardown(&self) -> Result<()> {
        self.pumps.lock().stop();
        if let (Some(client), Some(state)) = (&self.decrypt, self.input.decrypt_state()) {
            client.stop_decrypt(self.shared.id, state);
        }
        self.input.teardown()?;
        let removed = self.shared.client.lock().take();
        if let Some(client) = removed {
            tracing::info!(
                stream = self.shared.id,
                session = %client.session_id,
                "client released"
            );
        }
        self.shared.spc.store(0, Ordering::Relaxed);
        self.shared.soc.store(0, Ordering::Relaxed);
        self.shared.ring.flush();
        Ok(())
    }

    /// Flag the client for reaping (dead transport).
    pub fn mark_self_destruct(&self, reason: &str) {
        self.shared.self_destruct(reason);
    }

    /// Whether the sweeper should reap this stream's client now.
    pub fn needs_reaping(&self, now: Instant) -> bool {
        self.shared
            .client
            .lock()
            .as_ref()
            .is_some_and(|c| c.self_destruct || c.expired(now))
    }

    /// SAT>IP attribute describe string and whether the stream is active.
    pub fn describe_string(&self) -> (String, bool) {
        let describe = self.input.attribute_describe_string().unwrap_or_default();
        (describe, self.has_client())
    }
}

/// Build the RTP and RTCP sender transports (and the RR listener) from a
/// client's negotiated transport.
fn build_transports(
    client: &StreamClient,
) -> Result<(SenderTransport, SenderTransport, Option<Arc<std::net::UdpSocket>>)> {
    match &client.transport {
        ClientTransport::Udp {
            rtp_dest,
            rtcp_dest,
            rtp_socket,
            rtcp_socket,
        } => Ok((
            SenderTransport::Udp {
                socket: rtp_socket.clone(),
                dest: *rtp_dest,
            },
            SenderTransport::Udp {
                socket: rtcp_socket.clone(),
                dest: *rtcp_dest,
            },
            Some(rtcp_socket.clone()),
        )),
        ClientTransport::Tcp {
            socket,
            rtp_channel,
            rtcp_channel,
        } => {
            let rtp = socket.try_clone().map_err(SatipError::Io)?;
            let rtcp = socket.try_clone().map_err(SatipError::Io)?;
            Ok((
                SenderTransport::Tcp {
                    socket: rtp,
                    channel: *rtp_channel,
                },
                SenderTransport::Tcp {
                    socket: rtcp,
                    channel: *rtcp_channel,
                },
                None,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::file::FileSource;
    use crate::mpegts::TS_PACKET_SIZE;
    use crate::stream::client::allocate_udp_pair;
    use std::io::Write;
    use std::net::{IpAddr, SocketAddr, UdpSocket};

    fn write_ts_file(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for i in 0..21u8 {
            let mut pkt = [0u8; TS_PACKET_SIZE];
            pkt[0] = 0x47;
            pkt[1] = 0x01;
            pkt[3] = 0x10 | (i & 0x0F);
            file.write_all(&pkt).unwrap();
        }
        path
    }

    fn udp_client(receiver: &UdpSocket) -> StreamClient {
        let ip = IpAddr::from([127, 0, 0, 1]);
        let (rtp_socket, rtcp_socket) = allocate_udp_pair(ip).unwrap();
        let dest = receiver.local_addr().unwrap();
        StreamClient::new(
            ip,
            ClientTransport::Udp {
                rtp_dest: dest,
                rtcp_dest: SocketAddr::new(ip, dest.port() + 1),
                rtp_socket,
                rtcp_socket,
            },
        )
    }

    #[test]
    fn file_stream_end_to_end_rtp_flow() {
        let path = write_ts_file("satip-stream-e2e.ts");
        let source = Arc::new(FileSource::new(0));
        let stream = Stream::new(0, source, None);
        stream
            .apply_query(&SatipQuery::from_uri(&format!(
                "rtsp://h/?msys=file&uri={}",
                path.display()
            )))
            .unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream.set_client(udp_client(&receiver));
        stream.start_streaming().unwrap();

        // sequence numbers are monotonic with no skips, payload is TS-aligned
        let mut last_seq: Option<u16> = None;
        for _ in 0..5 {
            let mut buf = [0u8; 2048];
            let n = receiver.recv(&mut buf).expect("RTP packet");
            assert_eq!(buf[1] & 0x7F, 33);
            assert_eq!((n - 12) % TS_PACKET_SIZE, 0);
            assert_eq!(buf[12], 0x47);
            let seq = u16::from_be_bytes([buf[2], buf[3]]);
            if let Some(last) = last_seq {
                assert_eq!(seq, last.wrapping_add(1), "no skipped sequence numbers");
            }
            last_seq = Some(seq);
        }

        stream.teardown().unwrap();
        assert!(!stream.has_client());
        assert!(!stream.is_streaming());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn needs_reaping_on_self_destruct_and_expiry() {
        let source = Arc::new(FileSource::new(0));
        let stream = Stream::new(0, source, None);
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut client = udp_client(&receiver);
        client.timeout = Duration::from_millis(5);
        stream.set_client(client);

        assert!(!stream.needs_reaping(Instant::now()));
        thread::sleep(Duration::from_millis(15));
        assert!(stream.needs_reaping(Instant::now()), "idle client expires");

        stream.touch_client();
        assert!(!stream.needs_reaping(Instant::now()), "touch refreshes liveness");

        stream.shared.self_destruct("test");
        assert!(stream.needs_reaping(Instant::now()));
    }
}
