//! The DVB frontend: a state machine over the `frontendN`, `demux0` and
//! `dvr0` character devices of one adapter.
//!
//! ```text
//! Closed -> Opened -> Tuned -> Streaming
//!                ^      |
//!                +------+  (parameter change: retune)
//! ```
//!
//! Only the streaming state produces TS data. Tuning drains stale frontend
//! events, pushes the delivery-system property sequence and waits up to 3 s
//! for `FE_HAS_LOCK`; a timeout leaves the frontend opened and fails the
//! triggering request.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;

use crate::decrypt::DecryptState;
use crate::error::{Result, SatipError};
use crate::input::{InputSystem, TunerSource};
use crate::mpegts::{PacketBuffer, PidTable, packet_pid};
use crate::protocol::SatipQuery;
use crate::protocol::query::PidSelection;

use super::data::FrontendData;
use super::delivery::DeliverySystem;
use super::sys;

const TUNE_LOCK_TIMEOUT: Duration = Duration::from_secs(3);
const LOCK_POLL: Duration = Duration::from_millis(25);
const READ_POLL_TIMEOUT_MS: u16 = 500;

/// Last sampled signal readings, folded into the describe string.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalStatus {
    pub status: u32,
    pub strength: u16,
    pub snr: u16,
    pub ber: u32,
    pub uncorrected_blocks: u32,
}

impl SignalStatus {
    fn has_lock(&self) -> bool {
        self.status & sys::FE_HAS_LOCK != 0
    }
}

#[derive(Default)]
struct Inner {
    fd_fe: Option<File>,
    fd_dvr: Option<File>,
    tuned: bool,
    data: FrontendData,
    pids: PidTable,
    signal: SignalStatus,
}

/// One physical DVB frontend, shared between the RTSP handlers, the reader
/// thread and the decrypt client.
pub struct Frontend {
    stream_id: usize,
    path_fe: PathBuf,
    path_dmx: PathBuf,
    path_dvr: PathBuf,
    capabilities: Vec<InputSystem>,
    inner: Mutex<Inner>,
    decrypt: Mutex<DecryptState>,
}

impl Frontend {
    pub fn new(
        stream_id: usize,
        path_fe: PathBuf,
        path_dmx: PathBuf,
        path_dvr: PathBuf,
        capabilities: Vec<InputSystem>,
    ) -> Self {
        Frontend {
            stream_id,
            path_fe,
            path_dmx,
            path_dvr,
            capabilities,
            inner: Mutex::new(Inner::default()),
            decrypt: Mutex::new(DecryptState::new()),
        }
    }

    /// Walk `<dvb_path>/adapterN/frontendM` and build a frontend for every
    /// device found, probing its delivery-system capabilities.
    pub fn enumerate(dvb_path: &Path, first_stream_id: usize) -> Vec<Arc<Frontend>> {
        let mut frontends: Vec<Arc<Frontend>> = Vec::new();
        for adapter in 0.. {
            let adapter_path = dvb_path.join(format!("adapter{adapter}"));
            if !adapter_path.exists() {
                break;
            }
            for fe in 0.. {
                let fe_path = adapter_path.join(format!("frontend{fe}"));
                if !fe_path.exists() {
                    break;
                }
                let capabilities = match probe_capabilities(&fe_path) {
                    Ok(caps) if !caps.is_empty() => caps,
                    Ok(_) | Err(_) => {
                        tracing::warn!(path = %fe_path.display(), "skipping unprobeable frontend");
                        continue;
                    }
                };
                let stream_id = first_stream_id + frontends.len();
                tracing::info!(
                    stream = stream_id,
                    path = %fe_path.display(),
                    systems = ?capabilities.iter().map(|c| c.msys()).collect::<Vec<_>>(),
                    "found frontend"
                );
                frontends.push(Arc::new(Frontend::new(
                    stream_id,
                    fe_path,
                    adapter_path.join("demux0"),
                    adapter_path.join("dvr0"),
                    capabilities,
                )));
            }
        }
        frontends
    }

    fn open_device(path: &Path, write: bool) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
            .open(path)
            .map_err(|e| SatipError::Tuner(format!("open {} failed: {e}", path.display())))
    }

    /// Tune when parameters changed, then reconcile the PID filters.
    fn setup_and_tune(&self, inner: &mut Inner) -> Result<()> {
        if inner.data.changed {
            if inner.fd_fe.is_none() {
                inner.fd_fe = Some(Self::open_device(&self.path_fe, true)?);
            }
            let Some(fe) = inner.fd_fe.as_ref() else {
                return Err(SatipError::Tuner("frontend not open".to_string()));
            };

            let system = inner
                .data
                .delivery_system
                .ok_or_else(|| SatipError::Tuner("no delivery system requested".to_string()))?;
            let delivery = DeliverySystem::for_system(system)
                .ok_or_else(|| SatipError::Tuner(format!("{} not tunable", system.msys())))?;

            tracing::info!(stream = self.stream_id, msys = system.msys(), freq_khz = inner.data.freq_khz, "start tuning");
            delivery
                .start_tune(fe.as_fd(), self.stream_id, &inner.data)
                .map_err(|e| SatipError::Tuner(format!("tune failed: {e}")))?;

            // wait for a frontend lock, bounded
            let deadline = Instant::now() + TUNE_LOCK_TIMEOUT;
            loop {
                let status = sys::read_status(fe.as_fd()).unwrap_or(0);
                inner.signal.status = status;
                if status & sys::FE_HAS_LOCK != 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(SatipError::Tuner("no lock within 3 s".to_string()));
                }
                thread::sleep(LOCK_POLL);
            }
            tracing::info!(stream = self.stream_id, "tuned (lock)");
            inner.tuned = true;
            inner.data.changed = false;
        }

        if inner.fd_dvr.is_none() {
            inner.fd_dvr = Some(Self::open_device(&self.path_dvr, false)?);
        }

        if inner.pids.has_changed() {
            let dmx_path = self.path_dmx.clone();
            let (opened, closed) = inner
                .pids
                .reconcile(|pid| {
                    let dmx = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
                        .open(&dmx_path)?;
                    sys::set_pes_filter(dmx.as_fd(), pid)?;
                    Ok(dmx)
                })
                .map_err(|e| SatipError::Tuner(format!("demux filter failed: {e}")))?;
            tracing::debug!(stream = self.stream_id, opened, closed, "PID filters reconciled");
        }
        Ok(())
    }

    fn monitor_signal(&self, inner: &mut Inner) {
        let Some(fe) = inner.fd_fe.as_ref() else {
            return;
        };
        let fd = fe.as_fd();
        inner.signal = SignalStatus {
            status: sys::read_status(fd).unwrap_or(0),
            strength: sys::read_signal_strength(fd).unwrap_or(0),
            snr: sys::read_snr(fd).unwrap_or(0),
            ber: sys::read_ber(fd).unwrap_or(0),
            uncorrected_blocks: sys::read_uncorrected_blocks(fd).unwrap_or(0),
        };
    }

    fn describe(&self, inner: &Inner) -> String {
        let data = &inner.data;
        let signal = &inner.signal;
        let level = signal.strength >> 8;
        let quality = signal.snr >> 12;
        let lock = u8::from(signal.has_lock());
        let freq_mhz = data.freq_khz as f64 / 1000.0;
        let msys = data.delivery_system.map(|s| s.msys()).unwrap_or("");
        match data.delivery_system {
            Some(InputSystem::DvbS | InputSystem::DvbS2) => format!(
                "ver=1.0;src={};tuner={},{},{},{},{},{},{},{},{},{},{},{};pids={}",
                data.diseqc_src,
                self.stream_id + 1,
                level,
                lock,
                quality,
                freq_mhz,
                data.polarization.satip(),
                msys,
                data.modulation.satip(),
                data.pilot.satip(),
                data.rolloff.satip(),
                data.symbol_rate,
                data.fec.satip(),
                inner.pids.pid_csv()
            ),
            Some(InputSystem::DvbT | InputSystem::DvbT2) => format!(
                "ver=1.1;tuner={},{},{},{},{},{},{},,,,,,;pids={}",
                self.stream_id + 1,
                level,
                lock,
                quality,
                freq_mhz,
                data.bandwidth_hz / 1_000_000,
                msys,
                inner.pids.pid_csv()
            ),
            Some(InputSystem::DvbC) => format!(
                "ver=1.2;tuner={},{},{},{},{},8,{},{},{};pids={}",
                self.stream_id + 1,
                level,
                lock,
                quality,
                freq_mhz,
                msys,
                data.modulation.satip(),
                data.symbol_rate,
                inner.pids.pid_csv()
            ),
            _ => String::new(),
        }
    }
}

/// Query `DTV_ENUM_DELSYS`, falling back to the legacy frontend type.
fn probe_capabilities(fe_path: &Path) -> std::io::Result<Vec<InputSystem>> {
    let fe = OpenOptions::new()
        .read(true)
        .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
        .open(fe_path)?;
    let mut systems = Vec::new();
    if let Ok(prop) = sys::get_property(fe.as_fd(), sys::DTV_ENUM_DELSYS) {
        let buffer = unsafe { prop.u.buffer };
        for &delsys in buffer.data.iter().take(buffer.len.min(32) as usize) {
            let mapped = match u32::from(delsys) {
                sys::SYS_DVBS => Some(InputSystem::DvbS),
                sys::SYS_DVBS2 => Some(InputSystem::DvbS2),
                sys::SYS_DVBT => Some(InputSystem::DvbT),
                sys::SYS_DVBT2 => Some(InputSystem::DvbT2),
                sys::SYS_DVBC_ANNEX_A => Some(InputSystem::DvbC),
                _ => None,
            };
            if let Some(system) = mapped
                && !systems.contains(&system)
            {
                systems.push(system);
            }
        }
    }
    if systems.is_empty() {
        let info = sys::get_info(fe.as_fd())?;
        systems = match info.fe_type {
            0 => vec![InputSystem::DvbS, InputSystem::DvbS2],
            1 => vec![InputSystem::DvbC],
            2 => vec![InputSystem::DvbT],
            _ => Vec::new(),
        };
    }
    Ok(systems)
}

impl TunerSource for Frontend {
    fn stream_id(&self) -> usize {
        self.stream_id
    }

    fn capable_of(&self, system: InputSystem) -> bool {
        self.capabilities.contains(&system)
    }

    fn parse_stream_parameters(&self, query: &SatipQuery) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.data.apply_query(query)?;

        if let Some(selection) = query.pids() {
            match selection? {
                PidSelection::All => inner.pids.set_all_pids(true),
                PidSelection::None => inner.pids.clear_pids(),
                PidSelection::List(list) => {
                    inner.pids.clear_pids();
                    for pid in list {
                        inner.pids.set_pid(pid, true);
                    }
                }
            }
        }
        if let Some(add) = query.addpids() {
            for pid in add? {
                inner.pids.set_pid(pid, true);
            }
        }
        if let Some(del) = query.delpids() {
            for pid in del? {
                inner.pids.set_pid(pid, false);
            }
        }
        Ok(())
    }

    fn update(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.setup_and_tune(&mut inner)
    }

    fn teardown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.pids.clear();
        inner.fd_dvr = None;
        inner.fd_fe = None;
        inner.tuned = false;
        inner.signal = SignalStatus::default();
        // force a retune on the next use of this frontend
        inner.data.changed = true;
        tracing::info!(stream = self.stream_id, "frontend released");
        Ok(())
    }

    fn is_data_available(&self) -> bool {
        let raw = {
            let inner = self.inner.lock();
            match &inner.fd_dvr {
                Some(dvr) => dvr.as_raw_fd(),
                None => return false,
            }
        };
        // the reader thread is the only closer of this fd while streaming,
        // so polling outside the lock is safe
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(READ_POLL_TIMEOUT_MS)) {
            Ok(n) if n > 0 => fds[0].revents().is_some_and(|r| !r.is_empty()),
            _ => false,
        }
    }

    fn read_full_ts_packet(&self, buffer: &mut PacketBuffer) -> bool {
        let mut inner = self.inner.lock();
        let Some(dvr) = inner.fd_dvr.as_mut() else {
            return false;
        };
        loop {
            let free = buffer.free_space();
            if free.is_empty() {
                break;
            }
            match dvr.read(free) {
                Ok(0) => break,
                Ok(n) => buffer.add_written(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::error!(stream = self.stream_id, error = %e, "dvr read failed");
                    break;
                }
            }
        }
        if !buffer.full() {
            return false;
        }
        if !buffer.try_syncing() {
            tracing::error!(stream = self.stream_id, "packet buffer not in sync");
            return false;
        }
        if buffer.full() {
            for pkt in buffer.ts_packets_mut() {
                if pkt[0] == 0x47 {
                    let pid = packet_pid(pkt);
                    inner.pids.add_pid_data(pid, pkt[3] & 0x0F);
                }
            }
            return true;
        }
        false
    }

    fn attribute_describe_string(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        if !inner.tuned {
            return None;
        }
        self.monitor_signal(&mut inner);
        Some(self.describe(&inner))
    }

    fn pid_csv(&self) -> String {
        self.inner.lock().pids.pid_csv()
    }

    fn decrypt_state(&self) -> Option<&Mutex<DecryptState>> {
        Some(&self.decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frontend() -> Frontend {
        Frontend::new(
            0,
            PathBuf::from("/dev/dvb/adapter0/frontend0"),
            PathBuf::from("/dev/dvb/adapter0/demux0"),
            PathBuf::from("/dev/dvb/adapter0/dvr0"),
            vec![InputSystem::DvbS, InputSystem::DvbS2],
        )
    }

    #[test]
    fn capability_check() {
        let fe = test_frontend();
        assert!(fe.capable_of(InputSystem::DvbS));
        assert!(!fe.capable_of(InputSystem::DvbC));
    }

    #[test]
    fn pid_set_replacement_and_delta() {
        let fe = test_frontend();
        fe.parse_stream_parameters(&SatipQuery::from_uri("rtsp://h/?pids=0,17"))
            .unwrap();
        assert_eq!(fe.pid_csv(), "0,17");

        fe.parse_stream_parameters(&SatipQuery::from_uri("rtsp://h/?addpids=100&delpids=17"))
            .unwrap();
        assert_eq!(fe.pid_csv(), "0,100");

        fe.parse_stream_parameters(&SatipQuery::from_uri("rtsp://h/?pids=none"))
            .unwrap();
        assert_eq!(fe.pid_csv(), "");

        fe.parse_stream_parameters(&SatipQuery::from_uri("rtsp://h/?pids=all"))
            .unwrap();
        assert_eq!(fe.pid_csv(), "all");
    }

    #[test]
    fn idle_frontend_has_no_describe_string() {
        let fe = test_frontend();
        assert!(fe.attribute_describe_string().is_none());
    }

    #[test]
    fn update_without_delivery_system_fails() {
        let fe = test_frontend();
        fe.parse_stream_parameters(&SatipQuery::from_uri("rtsp://h/?freq=11720"))
            .unwrap();
        assert!(fe.update().is_err());
    }
}
