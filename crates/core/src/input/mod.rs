//! TS input devices: DVB frontends, a file player and a UDP/multicast
//! listener, all behind the [`TunerSource`] capability contract.

pub mod dvb;
pub mod file;
pub mod streamer;

use parking_lot::Mutex;

use crate::decrypt::DecryptState;
use crate::error::Result;
use crate::mpegts::PacketBuffer;
use crate::protocol::SatipQuery;

/// Delivery systems a device can be asked for via `msys=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSystem {
    DvbS,
    DvbS2,
    DvbT,
    DvbT2,
    DvbC,
    File,
    Streamer,
}

impl InputSystem {
    /// Map a `msys=` value; unknown systems are rejected.
    pub fn from_msys(msys: &str) -> Option<Self> {
        match msys {
            "dvbs" => Some(Self::DvbS),
            "dvbs2" => Some(Self::DvbS2),
            "dvbt" => Some(Self::DvbT),
            "dvbt2" => Some(Self::DvbT2),
            "dvbc" => Some(Self::DvbC),
            "file" => Some(Self::File),
            "streamer" => Some(Self::Streamer),
            _ => None,
        }
    }

    pub fn msys(self) -> &'static str {
        match self {
            Self::DvbS => "dvbs",
            Self::DvbS2 => "dvbs2",
            Self::DvbT => "dvbt",
            Self::DvbT2 => "dvbt2",
            Self::DvbC => "dvbc",
            Self::File => "file",
            Self::Streamer => "streamer",
        }
    }
}

/// Capability contract of a TS source owned by a stream.
///
/// All methods take `&self`: implementations keep their mutable state behind
/// a mutex because RTSP handlers (parameter changes), the reader thread
/// (I/O) and the RTCP reporter (describe string) all reach in concurrently.
pub trait TunerSource: Send + Sync {
    fn stream_id(&self) -> usize;

    /// Whether this device can deliver the given system.
    fn capable_of(&self, system: InputSystem) -> bool;

    /// Apply SAT>IP parameters from a SETUP or PLAY request.
    fn parse_stream_parameters(&self, query: &SatipQuery) -> Result<()>;

    /// Bring the hardware in line with the requested parameters: tune when
    /// they changed, then reconcile the PID filters.
    fn update(&self) -> Result<()>;

    /// Release the device (close handles, clear PID filters).
    fn teardown(&self) -> Result<()>;

    /// Level-triggered readiness with a 500 ms poll timeout.
    fn is_data_available(&self) -> bool;

    /// Read into the buffer; `true` once it holds a full 1316-byte payload.
    fn read_full_ts_packet(&self, buffer: &mut PacketBuffer) -> bool;

    /// SAT>IP attribute describe string (`ver=…;tuner=…`), `None` while the
    /// device is idle.
    fn attribute_describe_string(&self) -> Option<String>;

    /// Currently requested PIDs as CSV, for the describe string.
    fn pid_csv(&self) -> String {
        String::new()
    }

    /// Descrambling state, for devices that can feed the decrypt client.
    fn decrypt_state(&self) -> Option<&Mutex<DecryptState>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msys_round_trip() {
        for msys in ["dvbs", "dvbs2", "dvbt", "dvbt2", "dvbc", "file", "streamer"] {
            assert_eq!(InputSystem::from_msys(msys).unwrap().msys(), msys);
        }
        assert!(InputSystem::from_msys("atsc").is_none());
    }
}
