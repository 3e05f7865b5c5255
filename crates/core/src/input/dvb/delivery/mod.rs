//! Per-delivery-system tuning: property sequences for DVB-S/S2, DVB-T/T2
//! and DVB-C, with DiSEqC handling for satellite.

pub mod diseqc;
pub mod lnb;

use std::io;
use std::os::fd::BorrowedFd;

use crate::input::InputSystem;

use super::data::FrontendData;
use super::sys::{self, DtvProperty};

pub use diseqc::{Diseqc, UserBand};
pub use lnb::Lnb;

/// The tuning strategy selected for a frontend, a tagged union over the
/// supported delivery systems.
#[derive(Debug, Clone, Copy)]
pub enum DeliverySystem {
    DvbS { diseqc: Diseqc },
    DvbT,
    DvbC,
}

impl DeliverySystem {
    /// Pick the strategy for a requested `msys`.
    pub fn for_system(system: InputSystem) -> Option<Self> {
        match system {
            InputSystem::DvbS | InputSystem::DvbS2 => Some(DeliverySystem::DvbS {
                diseqc: Diseqc::default(),
            }),
            InputSystem::DvbT | InputSystem::DvbT2 => Some(DeliverySystem::DvbT),
            InputSystem::DvbC => Some(DeliverySystem::DvbC),
            InputSystem::File | InputSystem::Streamer => None,
        }
    }

    /// Run DiSEqC (satellite only) and push the tune property sequence.
    /// Pending frontend events are drained first to clear stale status.
    pub fn start_tune(
        &self,
        fd: BorrowedFd,
        stream_id: usize,
        data: &FrontendData,
    ) -> io::Result<()> {
        let mut props = match self {
            DeliverySystem::DvbS { diseqc } => {
                // DiSEqC switch positions are 1-based on the wire
                let src = data.diseqc_src.saturating_sub(1) % diseqc::MAX_LNB;
                let mut freq = data.freq_khz;
                diseqc.send(fd, stream_id, &mut freq, src, data.polarization)?;
                dvbs_properties(data, freq)
            }
            DeliverySystem::DvbT => dvbt_properties(data),
            DeliverySystem::DvbC => dvbc_properties(data),
        };

        sys::drain_events(fd);
        sys::set_properties(fd, &mut props)
    }
}

fn delivery_system_dtv(system: Option<InputSystem>) -> u32 {
    match system {
        Some(InputSystem::DvbS) => sys::SYS_DVBS,
        Some(InputSystem::DvbS2) => sys::SYS_DVBS2,
        Some(InputSystem::DvbT) => sys::SYS_DVBT,
        Some(InputSystem::DvbT2) => sys::SYS_DVBT2,
        Some(InputSystem::DvbC) => sys::SYS_DVBC_ANNEX_A,
        _ => sys::SYS_UNDEFINED,
    }
}

/// DVB-S/S2 sequence; `if_freq_khz` is the post-DiSEqC L-band frequency.
pub fn dvbs_properties(data: &FrontendData, if_freq_khz: u32) -> Vec<DtvProperty> {
    vec![
        DtvProperty::new(sys::DTV_CLEAR, sys::DTV_UNDEFINED),
        DtvProperty::new(sys::DTV_DELIVERY_SYSTEM, delivery_system_dtv(data.delivery_system)),
        DtvProperty::new(sys::DTV_FREQUENCY, if_freq_khz),
        DtvProperty::new(sys::DTV_MODULATION, data.modulation.dtv()),
        DtvProperty::new(sys::DTV_SYMBOL_RATE, data.symbol_rate * 1_000),
        DtvProperty::new(sys::DTV_INNER_FEC, data.fec.dtv()),
        DtvProperty::new(sys::DTV_INVERSION, sys::INVERSION_AUTO),
        DtvProperty::new(sys::DTV_ROLLOFF, data.rolloff.dtv()),
        DtvProperty::new(sys::DTV_PILOT, data.pilot.dtv()),
        DtvProperty::new(sys::DTV_TUNE, sys::DTV_UNDEFINED),
    ]
}

/// DVB-T/T2 sequence; terrestrial frequencies are handed over in Hz.
pub fn dvbt_properties(data: &FrontendData) -> Vec<DtvProperty> {
    vec![
        DtvProperty::new(sys::DTV_CLEAR, sys::DTV_UNDEFINED),
        DtvProperty::new(sys::DTV_DELIVERY_SYSTEM, delivery_system_dtv(data.delivery_system)),
        DtvProperty::new(sys::DTV_FREQUENCY, data.freq_khz.saturating_mul(1_000)),
        DtvProperty::new(sys::DTV_MODULATION, data.modulation.dtv()),
        DtvProperty::new(sys::DTV_BANDWIDTH_HZ, data.bandwidth_hz),
        DtvProperty::new(sys::DTV_INVERSION, sys::INVERSION_AUTO),
        DtvProperty::new(sys::DTV_TRANSMISSION_MODE, sys::TRANSMISSION_MODE_AUTO),
        DtvProperty::new(sys::DTV_GUARD_INTERVAL, sys::GUARD_INTERVAL_AUTO),
        DtvProperty::new(sys::DTV_TUNE, sys::DTV_UNDEFINED),
    ]
}

/// DVB-C (Annex A) sequence.
pub fn dvbc_properties(data: &FrontendData) -> Vec<DtvProperty> {
    vec![
        DtvProperty::new(sys::DTV_CLEAR, sys::DTV_UNDEFINED),
        DtvProperty::new(sys::DTV_DELIVERY_SYSTEM, delivery_system_dtv(data.delivery_system)),
        DtvProperty::new(sys::DTV_FREQUENCY, data.freq_khz.saturating_mul(1_000)),
        DtvProperty::new(sys::DTV_MODULATION, data.modulation.dtv()),
        DtvProperty::new(sys::DTV_SYMBOL_RATE, data.symbol_rate * 1_000),
        DtvProperty::new(sys::DTV_INNER_FEC, data.fec.dtv()),
        DtvProperty::new(sys::DTV_INVERSION, sys::INVERSION_AUTO),
        DtvProperty::new(sys::DTV_TUNE, sys::DTV_UNDEFINED),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::dvb::data::{Fec, Modulation};
    use crate::protocol::SatipQuery;

    fn dvbs_data() -> FrontendData {
        let mut data = FrontendData::default();
        data.apply_query(&SatipQuery::from_uri(
            "rtsp://h/?msys=dvbs&freq=11720&pol=v&sr=27500&fec=34&mtype=qpsk",
        ))
        .unwrap();
        data
    }

    #[test]
    fn dvbs_sequence_order() {
        let props = dvbs_properties(&dvbs_data(), 1_120_000);
        let cmds: Vec<u32> = props.iter().map(|p| p.cmd).collect();
        assert_eq!(
            cmds,
            vec![
                sys::DTV_CLEAR,
                sys::DTV_DELIVERY_SYSTEM,
                sys::DTV_FREQUENCY,
                sys::DTV_MODULATION,
                sys::DTV_SYMBOL_RATE,
                sys::DTV_INNER_FEC,
                sys::DTV_INVERSION,
                sys::DTV_ROLLOFF,
                sys::DTV_PILOT,
                sys::DTV_TUNE,
            ]
        );
        unsafe {
            assert_eq!(props[1].u.data, sys::SYS_DVBS);
            assert_eq!(props[2].u.data, 1_120_000);
            assert_eq!(props[4].u.data, 27_500_000);
        }
    }

    #[test]
    fn dvbs_values_mapped() {
        let data = dvbs_data();
        assert_eq!(data.fec, Fec::F34);
        assert_eq!(data.modulation, Modulation::Qpsk);
        let props = dvbs_properties(&data, 1_120_000);
        unsafe {
            assert_eq!(props[3].u.data, sys::QPSK);
            assert_eq!(props[5].u.data, sys::FEC_3_4);
        }
    }

    #[test]
    fn terrestrial_frequency_in_hz() {
        let mut data = FrontendData::default();
        data.apply_query(&SatipQuery::from_uri("rtsp://h/?msys=dvbt&freq=714&bw=8"))
            .unwrap();
        let props = dvbt_properties(&data);
        unsafe {
            assert_eq!(props[2].u.data, 714_000_000);
            assert_eq!(props[4].u.data, 8_000_000);
        }
    }
}
