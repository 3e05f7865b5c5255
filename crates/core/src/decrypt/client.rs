//! The control-word provider client (DVB-API network protocol).
//!
//! One worker thread owns a single TCP connection to the provider
//! (typically OSCam's dvbapi port). Messages are 32-bit big-endian opcode
//! framed. Outbound: the CLIENT_INFO handshake, CA-PMT pushes, matched
//! FILTER_DATA sections and CA-STOP. Inbound: section-filter control,
//! control words and ECM metadata, routed to the owning frontend through
//! the stream manager.
//!
//! Connect failures retry every 5 s; a dropped connection clears every
//! frontend's keys, filters and batch state and resumes the retry loop.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::{Mutex, RwLock};

use crate::base::Worker;
use crate::config::DecryptConfig;
use crate::mpegts::PacketBuffer;
use crate::stream::StreamManager;

use super::Parity;
use super::state::{DecryptState, EcmInfo, ProviderEvent};

const DVBAPI_PROTOCOL_VERSION: u16 = 2;
const PRODUCT_NAME: &str = "satip 0.1";

const DVBAPI_CA_SET_DESCR: u32 = 0x4010_6F86;
const DVBAPI_CA_SET_PID: u32 = 0x4008_6F87;
const DVBAPI_DMX_SET_FILTER: u32 = 0x403C_6F2B;
const DVBAPI_DMX_STOP: u32 = 0x0000_6F2A;
const DVBAPI_AOT_CA_PMT: u32 = 0x9F80_3282;
const DVBAPI_AOT_CA_STOP: u32 = 0x9F80_3F04;
const DVBAPI_FILTER_DATA: u32 = 0xFFFF_0000;
const DVBAPI_CLIENT_INFO: u32 = 0xFFFF_0001;
const DVBAPI_SERVER_INFO: u32 = 0xFFFF_0002;
const DVBAPI_ECM_INFO: u32 = 0xFFFF_0003;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const POLL_TIMEOUT_MS: u16 = 500;

struct Shared {
    cfg: DecryptConfig,
    connected: AtomicBool,
    socket: Mutex<Option<TcpStream>>,
    server_name: Mutex<String>,
    manager: RwLock<Weak<StreamManager>>,
}

impl Shared {
    fn disconnect(&self) {
        let name = self.server_name.lock().clone();
        tracing::info!(server = %name, "connection to control-word provider lost");
        *self.server_name.lock() = "Not connected".to_string();
        *self.socket.lock() = None;
        self.connected.store(false, Ordering::Release);
        // no provider means no keys: degrade every stream
        if let Some(manager) = self.manager.read().upgrade() {
            manager.clear_decrypt_states();
        }
    }

    fn send(&self, data: &[u8]) -> bool {
        let mut socket = self.socket.lock();
        let Some(stream) = socket.as_mut() else {
            return false;
        };
        match stream.write(data) {
            Ok(n) if n == data.len() => true,
            Ok(_) | Err(_) => {
                tracing::error!("send to control-word provider failed");
                false
            }
        }
    }
}

/// Shared client for every stream's descrambling, one worker thread.
pub struct DvbapiClient {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl DvbapiClient {
    pub fn new(cfg: DecryptConfig) -> Arc<Self> {
        Arc::new(DvbapiClient {
            shared: Arc::new(Shared {
                cfg,
                connected: AtomicBool::new(false),
                socket: Mutex::new(None),
                server_name: Mutex::new("Not connected".to_string()),
                manager: RwLock::new(Weak::new()),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Late-bound back reference; streams and the client are both owned by
    /// the manager.
    pub fn attach_manager(&self, manager: &Arc<StreamManager>) {
        *self.shared.manager.write() = Arc::downgrade(manager);
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn server_name(&self) -> String {
        self.shared.server_name.lock().clone()
    }

    /// Spawn the provider worker thread.
    pub fn start(&self) {
        let shared = self.shared.clone();
        let mut retry_at = Instant::now();
        let mut carry: Vec<u8> = Vec::new();

        let worker = Worker::spawn("dvbapi-client", move || {
            if !shared.connected.load(Ordering::Acquire) {
                if !shared.cfg.enabled {
                    thread::sleep(Duration::from_millis(500));
                    return true;
                }
                if Instant::now() < retry_at {
                    thread::sleep(Duration::from_millis(100));
                    return true;
                }
                match connect(&shared.cfg) {
                    Ok(stream) => {
                        tracing::info!(
                            server = %shared.cfg.server_addr,
                            port = shared.cfg.server_port,
                            "connecting to control-word provider"
                        );
                        *shared.socket.lock() = Some(stream);
                        carry.clear();
                        shared.connected.store(true, Ordering::Release);
                        shared.send(&client_info_message());
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "provider connect failed, retrying in 5 s");
                        retry_at = Instant::now() + RECONNECT_DELAY;
                    }
                }
                return true;
            }

            let raw = {
                let socket = shared.socket.lock();
                match socket.as_ref() {
                    Some(stream) => stream.as_raw_fd(),
                    None => return true,
                }
            };
            let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
            let mut fds = [PollFd::new(
                borrowed,
                PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
            )];
            let readable = matches!(poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)), Ok(n) if n > 0);
            if !readable {
                return true;
            }

            let mut chunk = [0u8; 2048];
            let read = {
                let mut socket = shared.socket.lock();
                match socket.as_mut() {
                    Some(stream) => stream.read(&mut chunk),
                    None => return true,
                }
            };
            match read {
                Ok(0) => shared.disconnect(),
                Ok(n) => {
                    carry.extend_from_slice(&chunk[..n]);
                    dispatch_messages(&shared, &mut carry);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::error!(error = %e, "provider read failed");
                    shared.disconnect();
                }
            }
            true
        });
        *self.worker.lock() = Some(worker);
    }

    pub fn stop(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
    }

    /// Descramble a filled buffer for one stream and forward any produced
    /// provider traffic (FILTER_DATA, CA-PMT).
    pub fn decrypt(&self, stream_id: usize, state: &Mutex<DecryptState>, buffer: &mut PacketBuffer) {
        if !self.connected() {
            return;
        }
        let mut events = Vec::new();
        state.lock().process_buffer(stream_id, buffer, &mut events);

        let demux_index = stream_id as u8 + self.shared.cfg.adapter_offset;
        for event in events {
            match event {
                ProviderEvent::FilterData {
                    demux,
                    filter,
                    section,
                } => {
                    tracing::debug!(
                        stream = stream_id,
                        demux,
                        filter,
                        size = section.len(),
                        "sending filter data"
                    );
                    if !self.shared.send(&filter_data_message(demux, filter, &section)) {
                        tracing::error!(stream = stream_id, "filter data send failed");
                    }
                }
                ProviderEvent::CaPmt {
                    program_number,
                    program_info,
                } => {
                    let message = ca_pmt_message(
                        self.shared.cfg.list_mode.wire(),
                        program_number,
                        demux_index,
                        &program_info,
                    );
                    tracing::debug!(
                        stream = stream_id,
                        program = program_number,
                        demux = demux_index,
                        "pushing CA-PMT"
                    );
                    if !self.shared.send(&message) {
                        tracing::error!(stream = stream_id, "CA-PMT send failed");
                    }
                }
            }
        }
    }

    /// Tell the provider to stop this demux and drop the stream's
    /// descrambling state.
    pub fn stop_decrypt(&self, stream_id: usize, state: &Mutex<DecryptState>) {
        if self.connected() {
            let demux_index = stream_id as u8 + self.shared.cfg.adapter_offset;
            if !self.shared.send(&ca_stop_message(demux_index)) {
                tracing::error!(stream = stream_id, "CA stop send failed");
            }
        }
        state.lock().stop_filters(stream_id);
    }
}

impl Drop for DvbapiClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn connect(cfg: &DecryptConfig) -> std::io::Result<TcpStream> {
    let addr = format!("{}:{}", cfg.server_addr, cfg.server_port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::other("provider address does not resolve"))?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Parse every complete message in `carry`, leaving a trailing partial in
/// place for the next read.
fn dispatch_messages(shared: &Shared, carry: &mut Vec<u8>) {
    let mut i = 0usize;
    let buf = carry.as_slice();
    while buf.len() - i >= 4 {
        let cmd = u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let remaining = &buf[i..];
        let consumed = match cmd {
            DVBAPI_SERVER_INFO => handle_server_info(shared, remaining),
            DVBAPI_DMX_SET_FILTER => handle_dmx_set_filter(shared, remaining),
            DVBAPI_DMX_STOP => handle_dmx_stop(shared, remaining),
            DVBAPI_CA_SET_DESCR => handle_ca_set_descr(shared, remaining),
            DVBAPI_CA_SET_PID => {
                // consumed but ignored
                if remaining.len() >= 13 { Some(13) } else { None }
            }
            DVBAPI_ECM_INFO => handle_ecm_info(shared, remaining),
            _ => {
                tracing::debug!(cmd = format_args!("{cmd:#010X}"), "unexpected provider message, resyncing");
                Some(remaining.len())
            }
        };
        match consumed {
            Some(n) => i += n,
            None => break, // partial message, wait for more bytes
        }
    }
    carry.drain(..i);
}

fn adapter_to_stream(shared: &Shared, adapter: u8) -> Option<usize> {
    adapter.checked_sub(shared.cfg.adapter_offset).map(usize::from)
}

fn handle_server_info(shared: &Shared, buf: &[u8]) -> Option<usize> {
    if buf.len() < 7 {
        return None;
    }
    let name_len = buf[6] as usize;
    if buf.len() < 7 + name_len {
        return None;
    }
    let name = String::from_utf8_lossy(&buf[7..7 + name_len]).to_string();
    tracing::info!(server = %name, "connected to control-word provider");
    *shared.server_name.lock() = name;
    Some(7 + name_len)
}

fn handle_dmx_set_filter(shared: &Shared, buf: &[u8]) -> Option<usize> {
    // adapter, demux, filter, pid, then a dmx_sct_filter_params body of
    // which only the 16-byte data and mask matter
    if buf.len() < 65 {
        return None;
    }
    let demux = buf[5];
    let filter = buf[6];
    let pid = (u16::from(buf[7]) << 8) | u16::from(buf[8]);
    let mut data = [0u8; 16];
    let mut mask = [0u8; 16];
    data.copy_from_slice(&buf[9..25]);
    mask.copy_from_slice(&buf[25..41]);

    if let Some(stream_id) = adapter_to_stream(shared, buf[4])
        && let Some(manager) = shared.manager.read().upgrade()
    {
        tracing::debug!(stream = stream_id, demux, filter, pid, "provider starts section filter");
        manager.with_decrypt_state(stream_id, |state| {
            state.filters.start(demux, filter, pid, data, mask);
        });
    }
    Some(65)
}

fn handle_dmx_stop(shared: &Shared, buf: &[u8]) -> Option<usize> {
    if buf.len() < 9 {
        return None;
    }
    let demux = buf[5];
    let filter = buf[6];
    if let Some(stream_id) = adapter_to_stream(shared, buf[4])
        && let Some(manager) = shared.manager.read().upgrade()
    {
        tracing::debug!(stream = stream_id, demux, filter, "provider stops section filter");
        manager.with_decrypt_state(stream_id, |state| {
            state.filters.stop(demux, filter);
        });
    }
    Some(9)
}

fn handle_ca_set_descr(shared: &Shared, buf: &[u8]) -> Option<usize> {
    if buf.len() < 21 {
        return None;
    }
    let index = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
    let parity_raw = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);
    let mut cw = [0u8; 8];
    cw.copy_from_slice(&buf[13..21]);

    if let Some(stream_id) = adapter_to_stream(shared, buf[4])
        && let Some(parity) = Parity::from_wire(parity_raw)
        && let Some(manager) = shared.manager.read().upgrade()
    {
        tracing::debug!(
            stream = stream_id,
            ?parity,
            index,
            "received control word"
        );
        manager.with_decrypt_state(stream_id, |state| {
            state.keys.set(parity, &cw);
        });
    }
    Some(21)
}

fn handle_ecm_info(shared: &Shared, buf: &[u8]) -> Option<usize> {
    if buf.len() < 19 {
        return None;
    }
    let service_id = (u16::from(buf[5]) << 8) | u16::from(buf[6]);
    let ca_id = (u16::from(buf[7]) << 8) | u16::from(buf[8]);
    let pid = (u16::from(buf[9]) << 8) | u16::from(buf[10]);
    let provider_id = u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]);
    let ecm_time_ms = u32::from_be_bytes([buf[15], buf[16], buf[17], buf[18]]);

    let mut i = 19usize;
    let mut strings = Vec::with_capacity(4);
    for _ in 0..4 {
        let len = *buf.get(i)? as usize;
        let bytes = buf.get(i + 1..i + 1 + len)?;
        strings.push(String::from_utf8_lossy(bytes).to_string());
        i += 1 + len;
    }
    let hops = *buf.get(i)?;
    i += 1;

    if let Some(stream_id) = adapter_to_stream(shared, buf[4])
        && let Some(manager) = shared.manager.read().upgrade()
    {
        let info = EcmInfo {
            pid,
            service_id,
            ca_id,
            provider_id,
            ecm_time_ms,
            card_system: strings[0].clone(),
            reader_name: strings[1].clone(),
            source_name: strings[2].clone(),
            protocol_name: strings[3].clone(),
            hops,
        };
        tracing::debug!(
            stream = stream_id,
            system = %info.card_system,
            reader = %info.reader_name,
            ecm_time_ms,
            "ECM info"
        );
        manager.with_decrypt_state(stream_id, |state| state.set_ecm_info(info));
    }
    Some(i)
}

// -- outbound message builders ---------------------------------------------

/// CLIENT_INFO handshake: protocol version and product name.
pub(crate) fn client_info_message() -> Vec<u8> {
    let name = PRODUCT_NAME.as_bytes();
    let mut message = Vec::with_capacity(7 + name.len());
    message.extend_from_slice(&DVBAPI_CLIENT_INFO.to_be_bytes());
    message.extend_from_slice(&DVBAPI_PROTOCOL_VERSION.to_be_bytes());
    message.push(name.len() as u8);
    message.extend_from_slice(name);
    message
}

/// FILTER_DATA: a matched section back to the provider.
pub(crate) fn filter_data_message(demux: u8, filter: u8, section: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(6 + section.len());
    message.extend_from_slice(&DVBAPI_FILTER_DATA.to_be_bytes());
    message.push(demux);
    message.push(filter);
    message.extend_from_slice(section);
    message
}

/// AOT_CA_PMT: list-managed PMT push with the demux descriptor and the
/// program's CA descriptors.
pub(crate) fn ca_pmt_message(
    list_mode: u8,
    program_number: u16,
    demux_index: u8,
    program_info: &[u8],
) -> Vec<u8> {
    // ca_pmt_cmd_id + demux descriptor precede the copied program info
    let prog_info_length = program_info.len() + 1 + 4;
    let total_length = prog_info_length + 6;

    let mut message = Vec::with_capacity(total_length + 6);
    message.extend_from_slice(&DVBAPI_AOT_CA_PMT.to_be_bytes());
    message.extend_from_slice(&(total_length as u16).to_be_bytes());
    message.push(list_mode);
    message.extend_from_slice(&program_number.to_be_bytes());
    message.push(DVBAPI_PROTOCOL_VERSION as u8);
    message.extend_from_slice(&(prog_info_length as u16).to_be_bytes());
    message.push(0x01); // ca_pmt_cmd_id = CAPMT_CMD_OK_DESCRAMBLING
    message.push(0x82); // CAPMT_DESC_DEMUX
    message.push(0x02);
    message.push(demux_index);
    message.push(demux_index);
    message.extend_from_slice(program_info);
    message
}

/// AOT_CA_STOP for one demux index.
pub(crate) fn ca_stop_message(demux_index: u8) -> [u8; 8] {
    let mut message = [0u8; 8];
    message[..4].copy_from_slice(&DVBAPI_AOT_CA_STOP.to_be_bytes());
    message[4] = 0x83;
    message[5] = 0x02;
    message[6] = 0x00;
    message[7] = demux_index;
    message
}
