//! The process-wide stream manager: device enumeration, request→stream
//! matching and session liveness.

use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::base::Worker;
use crate::config::ServerConfig;
use crate::decrypt::{DecryptState, DvbapiClient};
use crate::error::{Result, SatipError};
use crate::input::dvb::Frontend;
use crate::input::file::FileSource;
use crate::input::streamer::StreamerSource;
use crate::input::{InputSystem, TunerSource};
use crate::protocol::SatipQuery;

use super::Stream;

/// How often the sweeper scans for dead sessions.
const SWEEP_INTERVAL_TICKS: u32 = 20;
const SWEEP_TICK: Duration = Duration::from_millis(250);

/// Owns every [`Stream`] for the process lifetime.
pub struct StreamManager {
    streams: Vec<Arc<Stream>>,
    decrypt: Option<Arc<DvbapiClient>>,
    sweeper: Mutex<Option<Worker>>,
}

impl StreamManager {
    /// Enumerate devices and build the stream table: every DVB frontend
    /// under `<dvbPath>`, plus one file and one UDP-listener source so the
    /// gateway also serves `msys=file` and `msys=streamer` requests.
    pub fn new(cfg: &ServerConfig) -> Arc<Self> {
        let decrypt = cfg
            .decrypt
            .enabled
            .then(|| DvbapiClient::new(cfg.decrypt.clone()));

        let mut streams: Vec<Arc<Stream>> = Vec::new();
        for frontend in Frontend::enumerate(&cfg.dvb_path, 0) {
            if let Some(state) = frontend.decrypt_state() {
                state.lock().set_rewrite_pmt(cfg.decrypt.rewrite_pmt);
            }
            let input: Arc<dyn TunerSource> = frontend;
            streams.push(Arc::new(Stream::new(
                streams.len(),
                input,
                decrypt.clone(),
            )));
        }

        let file_id = streams.len();
        streams.push(Arc::new(Stream::new(
            file_id,
            Arc::new(FileSource::new(file_id)),
            None,
        )));
        let streamer_id = streams.len();
        streams.push(Arc::new(Stream::new(
            streamer_id,
            Arc::new(StreamerSource::new(streamer_id, cfg.bind_ip)),
            None,
        )));

        tracing::info!(streams = streams.len(), "stream table built");

        let manager = Arc::new(StreamManager {
            streams,
            decrypt,
            sweeper: Mutex::new(None),
        });
        if let Some(client) = &manager.decrypt {
            client.attach_manager(&manager);
            client.start();
        }
        manager
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn streams(&self) -> &[Arc<Stream>] {
        &self.streams
    }

    pub fn stream(&self, id: usize) -> Option<&Arc<Stream>> {
        self.streams.get(id)
    }

    /// Match an incoming request to a stream.
    ///
    /// Policy, in order: a live session ID wins; then a stream already
    /// owned by this client address; then the first idle stream capable of
    /// the requested delivery system. Returns `is_new` for the third case.
    pub fn find_stream_for(
        &self,
        client_ip: IpAddr,
        session_id: Option<&str>,
        query: &SatipQuery,
    ) -> Result<(Arc<Stream>, bool)> {
        if let Some(wanted) = session_id {
            return self
                .streams
                .iter()
                .find(|s| s.session_id().as_deref() == Some(wanted))
                .map(|s| (s.clone(), false))
                .ok_or_else(|| SatipError::SessionNotFound(wanted.to_string()));
        }

        if let Some(stream) = self
            .streams
            .iter()
            .find(|s| s.client_ip() == Some(client_ip))
        {
            return Ok((stream.clone(), false));
        }

        let wanted_system = query.msys().and_then(InputSystem::from_msys);
        self.streams
            .iter()
            .find(|s| {
                !s.has_client()
                    && wanted_system.is_none_or(|system| s.input().capable_of(system))
            })
            .map(|s| (s.clone(), true))
            .ok_or(SatipError::NoFreeStream)
    }

    /// Reap every client that self-destructed or went silent past its
    /// timeout. Runs at least every 5 s on the sweeper thread.
    pub fn check_session_timeout(&self) {
        let now = Instant::now();
        for stream in &self.streams {
            if stream.needs_reaping(now) {
                let session = stream.session_id().unwrap_or_default();
                tracing::info!(stream = stream.id(), %session, "session timed out, tearing down");
                if let Err(e) = stream.teardown() {
                    tracing::error!(stream = stream.id(), error = %e, "teardown failed");
                }
            }
        }
    }

    /// Spawn the session sweeper.
    pub fn start_session_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut ticks = 0u32;
        let worker = Worker::spawn("session-sweeper", move || {
            thread::sleep(SWEEP_TICK);
            ticks += 1;
            if ticks < SWEEP_INTERVAL_TICKS {
                return true;
            }
            ticks = 0;
            match weak.upgrade() {
                Some(manager) => {
                    manager.check_session_timeout();
                    true
                }
                None => false,
            }
        });
        *self.sweeper.lock() = Some(worker);
    }

    pub fn stop(&self) {
        if let Some(mut worker) = self.sweeper.lock().take() {
            worker.stop();
        }
        for stream in &self.streams {
            if stream.has_client() {
                let _ = stream.teardown();
            }
        }
        if let Some(client) = &self.decrypt {
            client.stop();
        }
    }

    /// Run `f` on a stream's descrambling state (decrypt client dispatch).
    pub fn with_decrypt_state<R>(
        &self,
        stream_id: usize,
        f: impl FnOnce(&mut DecryptState) -> R,
    ) -> Option<R> {
        let stream = self.streams.get(stream_id)?;
        let state = stream.input().decrypt_state()?;
        Some(f(&mut state.lock()))
    }

    /// Provider connection dropped: every stream loses its keys and
    /// filters.
    pub fn clear_decrypt_states(&self) {
        for stream in &self.streams {
            if let Some(state) = stream.input().decrypt_state() {
                state.lock().stop_filters(stream.id());
            }
        }
    }

    /// Per-stream describe strings with their active flags, for DESCRIBE
    /// and the RTCP APP block.
    pub fn describe_strings(&self) -> Vec<(String, bool)> {
        self.streams.iter().map(|s| s.describe_string()).collect()
    }

    /// (DVB-S2, DVB-T/T2, DVB-C) tuner counts for the SDP session name.
    pub fn delivery_counts(&self) -> (usize, usize, usize) {
        let count = |system: InputSystem| {
            self.streams
                .iter()
                .filter(|s| s.input().capable_of(system))
                .count()
        };
        (
            count(InputSystem::DvbS2),
            count(InputSystem::DvbT).max(count(InputSystem::DvbT2)),
            count(InputSystem::DvbC),
        )
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::client::{ClientTransport, StreamClient, allocate_udp_pair};
    use std::net::SocketAddr;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_ip: IpAddr::from([127, 0, 0, 1]),
            dvb_path: std::env::temp_dir().join("satip-no-dvb-here"),
            ..ServerConfig::default()
        }
    }

    fn attach_udp_client(manager: &StreamManager, stream_id: usize) -> String {
        let ip = IpAddr::from([127, 0, 0, 1]);
        let (rtp_socket, rtcp_socket) = allocate_udp_pair(ip).unwrap();
        let client = StreamClient::new(
            ip,
            ClientTransport::Udp {
                rtp_dest: SocketAddr::new(ip, 45678),
                rtcp_dest: SocketAddr::new(ip, 45679),
                rtp_socket,
                rtcp_socket,
            },
        );
        let session = client.session_id.clone();
        manager.stream(stream_id).unwrap().set_client(client);
        session
    }

    #[test]
    fn enumerates_fallback_sources_without_hardware() {
        let manager = StreamManager::new(&test_config());
        // no DVB devices: the file and streamer sources remain
        assert_eq!(manager.stream_count(), 2);
        assert!(manager.stream(0).unwrap().input().capable_of(InputSystem::File));
        assert!(
            manager
                .stream(1)
                .unwrap()
                .input()
                .capable_of(InputSystem::Streamer)
        );
    }

    #[test]
    fn session_id_lookup_and_unknown_session() {
        let manager = StreamManager::new(&test_config());
        let session = attach_udp_client(&manager, 0);

        let (stream, is_new) = manager
            .find_stream_for(
                IpAddr::from([10, 0, 0, 1]),
                Some(session.as_str()),
                &SatipQuery::default(),
            )
            .unwrap();
        assert_eq!(stream.id(), 0);
        assert!(!is_new);

        let err = manager
            .find_stream_for(
                IpAddr::from([10, 0, 0, 1]),
                Some("999999999999"),
                &SatipQuery::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SatipError::SessionNotFound(_)));
    }

    #[test]
    fn address_affinity_then_first_free() {
        let manager = StreamManager::new(&test_config());
        attach_udp_client(&manager, 0);

        // same address returns the owned stream
        let (stream, is_new) = manager
            .find_stream_for(IpAddr::from([127, 0, 0, 1]), None, &SatipQuery::default())
            .unwrap();
        assert_eq!(stream.id(), 0);
        assert!(!is_new);

        // a different address gets the first free stream
        let (stream, is_new) = manager
            .find_stream_for(IpAddr::from([10, 0, 0, 2]), None, &SatipQuery::default())
            .unwrap();
        assert_eq!(stream.id(), 1);
        assert!(is_new);
    }

    #[test]
    fn capability_filter_and_exhaustion() {
        let manager = StreamManager::new(&test_config());
        let query = SatipQuery::from_uri("rtsp://h/?msys=streamer");
        let (stream, _) = manager
            .find_stream_for(IpAddr::from([10, 0, 0, 3]), None, &query)
            .unwrap();
        assert!(stream.input().capable_of(InputSystem::Streamer));

        // no tuner can do DVB-S here
        let query = SatipQuery::from_uri("rtsp://h/?msys=dvbs");
        let err = manager
            .find_stream_for(IpAddr::from([10, 0, 0, 4]), None, &query)
            .unwrap_err();
        assert!(matches!(err, SatipError::NoFreeStream));
    }

    #[test]
    fn sweeper_reaps_expired_session() {
        let manager = StreamManager::new(&test_config());
        let ip = IpAddr::from([127, 0, 0, 1]);
        let (rtp_socket, rtcp_socket) = allocate_udp_pair(ip).unwrap();
        let mut client = StreamClient::new(
            ip,
            ClientTransport::Udp {
                rtp_dest: SocketAddr::new(ip, 45678),
                rtcp_dest: SocketAddr::new(ip, 45679),
                rtp_socket,
                rtcp_socket,
            },
        );
        client.timeout = Duration::from_millis(10);
        let session = client.session_id.clone();
        manager.stream(0).unwrap().set_client(client);

        thread::sleep(Duration::from_millis(25));
        manager.check_session_timeout();

        assert!(!manager.stream(0).unwrap().has_client(), "client reaped");
        let err = manager
            .find_stream_for(ip, Some(session.as_str()), &SatipQuery::default())
            .unwrap_err();
        assert!(matches!(err, SatipError::SessionNotFound(_)), "stale id gets 454");
    }
}
