//! Typed tuning parameters and their SAT>IP query mappings.

use crate::error::{ParseErrorKind, Result, SatipError};
use crate::input::InputSystem;
use crate::protocol::SatipQuery;

use super::sys;

/// LNB polarization, from `pol=` (case-insensitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarization {
    Horizontal,
    #[default]
    Vertical,
    CircularLeft,
    CircularRight,
}

impl Polarization {
    pub fn from_satip(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "h" => Some(Self::Horizontal),
            "v" => Some(Self::Vertical),
            "l" => Some(Self::CircularLeft),
            "r" => Some(Self::CircularRight),
            _ => None,
        }
    }

    pub fn satip(self) -> &'static str {
        match self {
            Self::Horizontal => "h",
            Self::Vertical => "v",
            Self::CircularLeft => "l",
            Self::CircularRight => "r",
        }
    }

    /// Horizontal and circular-left select the 18 V LNB plane.
    pub fn is_horizontal(self) -> bool {
        matches!(self, Self::Horizontal | Self::CircularLeft)
    }
}

/// Inner FEC, from `fec=` (`34` → 3/4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fec {
    #[default]
    Auto,
    F12,
    F23,
    F34,
    F35,
    F45,
    F56,
    F67,
    F78,
    F89,
    F910,
}

impl Fec {
    pub fn from_satip(value: &str) -> Option<Self> {
        match value {
            "12" => Some(Self::F12),
            "23" => Some(Self::F23),
            "34" => Some(Self::F34),
            "35" => Some(Self::F35),
            "45" => Some(Self::F45),
            "56" => Some(Self::F56),
            "67" => Some(Self::F67),
            "78" => Some(Self::F78),
            "89" => Some(Self::F89),
            "910" => Some(Self::F910),
            _ => None,
        }
    }

    pub fn satip(self) -> &'static str {
        match self {
            Self::Auto => "",
            Self::F12 => "12",
            Self::F23 => "23",
            Self::F34 => "34",
            Self::F35 => "35",
            Self::F45 => "45",
            Self::F56 => "56",
            Self::F67 => "67",
            Self::F78 => "78",
            Self::F89 => "89",
            Self::F910 => "910",
        }
    }

    pub fn dtv(self) -> u32 {
        match self {
            Self::Auto => sys::FEC_AUTO,
            Self::F12 => sys::FEC_1_2,
            Self::F23 => sys::FEC_2_3,
            Self::F34 => sys::FEC_3_4,
            Self::F35 => sys::FEC_3_5,
            Self::F45 => sys::FEC_4_5,
            Self::F56 => sys::FEC_5_6,
            Self::F67 => sys::FEC_6_7,
            Self::F78 => sys::FEC_7_8,
            Self::F89 => sys::FEC_8_9,
            Self::F910 => sys::FEC_9_10,
        }
    }
}

/// Modulation, from `mtype=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modulation {
    #[default]
    Auto,
    Qpsk,
    Psk8,
    Qam16,
    Qam32,
    Qam64,
    Qam128,
    Qam256,
}

impl Modulation {
    pub fn from_satip(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "qpsk" => Some(Self::Qpsk),
            "8psk" => Some(Self::Psk8),
            "16qam" => Some(Self::Qam16),
            "32qam" => Some(Self::Qam32),
            "64qam" => Some(Self::Qam64),
            "128qam" => Some(Self::Qam128),
            "256qam" => Some(Self::Qam256),
            _ => None,
        }
    }

    pub fn satip(self) -> &'static str {
        match self {
            Self::Auto => "",
            Self::Qpsk => "qpsk",
            Self::Psk8 => "8psk",
            Self::Qam16 => "16qam",
            Self::Qam32 => "32qam",
            Self::Qam64 => "64qam",
            Self::Qam128 => "128qam",
            Self::Qam256 => "256qam",
        }
    }

    pub fn dtv(self) -> u32 {
        match self {
            Self::Auto => sys::QAM_AUTO,
            Self::Qpsk => sys::QPSK,
            Self::Psk8 => sys::PSK_8,
            Self::Qam16 => sys::QAM_16,
            Self::Qam32 => sys::QAM_32,
            Self::Qam64 => sys::QAM_64,
            Self::Qam128 => sys::QAM_128,
            Self::Qam256 => sys::QAM_256,
        }
    }
}

/// Roll-off, from `ro=` (`0.35`, `0.25`, `0.20`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollOff {
    #[default]
    Auto,
    R35,
    R25,
    R20,
}

impl RollOff {
    pub fn from_satip(value: &str) -> Option<Self> {
        match value {
            "0.35" | "35" => Some(Self::R35),
            "0.25" | "25" => Some(Self::R25),
            "0.20" | "20" => Some(Self::R20),
            _ => None,
        }
    }

    pub fn satip(self) -> &'static str {
        match self {
            Self::Auto => "",
            Self::R35 => "0.35",
            Self::R25 => "0.25",
            Self::R20 => "0.20",
        }
    }

    pub fn dtv(self) -> u32 {
        match self {
            Self::Auto => sys::ROLLOFF_AUTO,
            Self::R35 => sys::ROLLOFF_35,
            Self::R25 => sys::ROLLOFF_25,
            Self::R20 => sys::ROLLOFF_20,
        }
    }
}

/// Pilot tones, from `plts=` (`on`, `off`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pilot {
    #[default]
    Auto,
    On,
    Off,
}

impl Pilot {
    pub fn from_satip(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn satip(self) -> &'static str {
        match self {
            Self::Auto => "",
            Self::On => "on",
            Self::Off => "off",
        }
    }

    pub fn dtv(self) -> u32 {
        match self {
            Self::Auto => sys::PILOT_AUTO,
            Self::On => sys::PILOT_ON,
            Self::Off => sys::PILOT_OFF,
        }
    }
}

/// The requested tuning configuration of a frontend.
///
/// `changed` is set whenever a parameter that needs a retune arrives and is
/// cleared by the tune path after a successful lock.
#[derive(Debug, Clone, Default)]
pub struct FrontendData {
    pub delivery_system: Option<InputSystem>,
    /// kHz (11720.5 MHz → 11 720 500).
    pub freq_khz: u32,
    /// ksym/s as given by `sr=`.
    pub symbol_rate: u32,
    pub fec: Fec,
    pub modulation: Modulation,
    pub rolloff: RollOff,
    pub pilot: Pilot,
    pub polarization: Polarization,
    /// 1-based DiSEqC source from `src=`.
    pub diseqc_src: u32,
    /// Hz, from `bw=` in MHz (DVB-T/T2).
    pub bandwidth_hz: u32,
    pub changed: bool,
}

fn invalid(param: &str) -> SatipError {
    SatipError::Parse {
        kind: ParseErrorKind::InvalidQuery(param.to_string()),
    }
}

/// Assign a field and raise `changed` on any transition.
macro_rules! update {
    ($self:ident, $field:ident, $value:expr) => {{
        let value = $value;
        if $self.$field != value {
            $self.$field = value;
            $self.changed = true;
        }
    }};
}

impl FrontendData {
    /// Fold a request's tuning parameters into this configuration. Any
    /// retune-relevant change raises `changed`.
    pub fn apply_query(&mut self, query: &SatipQuery) -> Result<()> {
        if let Some(msys) = query.msys() {
            let system = InputSystem::from_msys(msys).ok_or_else(|| invalid("msys"))?;
            update!(self, delivery_system, Some(system));
        }
        if let Some(freq) = query.frequency_khz() {
            update!(self, freq_khz, freq?);
        }
        if let Some(sr) = query.int("sr") {
            update!(self, symbol_rate, sr?);
        }
        if let Some(pol) = query.get("pol") {
            let pol = Polarization::from_satip(pol).ok_or_else(|| invalid("pol"))?;
            update!(self, polarization, pol);
        }
        if let Some(fec) = query.get("fec") {
            let fec = Fec::from_satip(fec).ok_or_else(|| invalid("fec"))?;
            update!(self, fec, fec);
        }
        if let Some(mtype) = query.get("mtype") {
            let mtype = Modulation::from_satip(mtype).ok_or_else(|| invalid("mtype"))?;
            update!(self, modulation, mtype);
        }
        if let Some(ro) = query.get("ro") {
            let ro = RollOff::from_satip(ro).ok_or_else(|| invalid("ro"))?;
            update!(self, rolloff, ro);
        }
        if let Some(plts) = query.get("plts") {
            let plts = Pilot::from_satip(plts).ok_or_else(|| invalid("plts"))?;
            update!(self, pilot, plts);
        }
        if let Some(src) = query.int("src") {
            update!(self, diseqc_src, src?);
        }
        if let Some(bw) = query.int("bw") {
            update!(self, bandwidth_hz, bw? * 1_000_000);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_dvbs_query() {
        let q = SatipQuery::from_uri("rtsp://h/?msys=dvbs&freq=11720&pol=v&sr=27500&fec=34&src=1");
        let mut data = FrontendData::default();
        data.apply_query(&q).unwrap();
        assert!(data.changed);
        assert_eq!(data.delivery_system, Some(InputSystem::DvbS));
        assert_eq!(data.freq_khz, 11_720_000);
        assert_eq!(data.symbol_rate, 27_500);
        assert_eq!(data.polarization, Polarization::Vertical);
        assert_eq!(data.fec, Fec::F34);
    }

    #[test]
    fn unchanged_query_does_not_flag() {
        let q = SatipQuery::from_uri("rtsp://h/?msys=dvbs&freq=11720&pol=v");
        let mut data = FrontendData::default();
        data.apply_query(&q).unwrap();
        data.changed = false;
        data.apply_query(&q).unwrap();
        assert!(!data.changed, "identical parameters must not force a retune");
    }

    #[test]
    fn polarization_case_insensitive() {
        assert_eq!(Polarization::from_satip("H"), Some(Polarization::Horizontal));
        assert_eq!(Polarization::from_satip("r"), Some(Polarization::CircularRight));
        assert!(Polarization::from_satip("x").is_none());
    }

    #[test]
    fn unknown_msys_rejected() {
        let q = SatipQuery::from_uri("rtsp://h/?msys=atsc");
        let mut data = FrontendData::default();
        assert!(data.apply_query(&q).is_err());
    }

    #[test]
    fn fractional_frequency() {
        let q = SatipQuery::from_uri("rtsp://h/?freq=11720.5");
        let mut data = FrontendData::default();
        data.apply_query(&q).unwrap();
        assert_eq!(data.freq_khz, 11_720_500);
    }
}
