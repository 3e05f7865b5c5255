//! DiSEqC strategies for DVB-S/S2: the committed switch and the two
//! single-cable variants (EN50494 "Unicable I", EN50607 "Jess").
//!
//! Every strategy exposes the same contract: `send(fd, stream_id, &mut
//! freq, src, pol)`. On success the requested downlink frequency has been
//! rewritten to the L-band frequency the tuner must actually tune — the
//! LNB IF for a switch, the assigned user-band slot for single-cable.

use std::io;
use std::os::fd::BorrowedFd;
use std::thread;
use std::time::Duration;

use super::super::data::Polarization;
use super::super::sys;
use super::lnb::Lnb;

/// Standard 4-position committed switch addressing.
pub const MAX_LNB: u32 = 4;

/// Settle time between bus transactions (DiSEqC 1.x timing).
const DISEQC_DELAY: Duration = Duration::from_millis(15);

/// Single-cable (EN50494/EN50607) user-band assignment.
#[derive(Debug, Clone, Copy)]
pub struct UserBand {
    /// Assigned user-band index.
    pub index: u8,
    /// Center frequency of the user-band slot, kHz.
    pub freq_khz: u32,
    /// Satellite position bit (position A/B).
    pub position: u8,
}

/// DiSEqC variant configured for a DVB-S frontend.
#[derive(Debug, Clone, Copy)]
pub enum Diseqc {
    /// Committed switch: tone burst + mini-DiSEqC, 4-position mapping.
    Switch { lnb: Lnb },
    /// EN50494 (Unicable I): ODU_CHANNEL_CHANGE on a shared cable.
    En50494 { lnb: Lnb, userband: UserBand },
    /// EN50607 (Jess / Unicable II): extended addressing.
    En50607 { lnb: Lnb, userband: UserBand },
}

impl Default for Diseqc {
    fn default() -> Self {
        Diseqc::Switch {
            lnb: Lnb::default(),
        }
    }
}

/// Committed-switch command for (src, polarization, band):
/// `E0 10 38 Fx` with input select in the low nibble.
pub fn switch_command(src: u32, pol: Polarization, hiband: bool) -> [u8; 4] {
    let mut data = 0xF0u8;
    data |= ((src & 0x03) as u8) << 2;
    if pol.is_horizontal() {
        data |= 0x02;
    }
    if hiband {
        data |= 0x01;
    }
    [0xE0, 0x10, 0x38, data]
}

/// EN50494 ODU_CHANNEL_CHANGE: `E0 10 5A <b3> <b4>` carrying the user-band
/// index, the bank bits (position, polarization, band) and the tuning word
/// `T = (IF + UBfreq + 2000) / 4000 - 350`.
pub fn en50494_command(
    userband: UserBand,
    if_khz: u32,
    pol: Polarization,
    hiband: bool,
) -> [u8; 5] {
    let t = ((if_khz + userband.freq_khz + 2_000) / 4_000).saturating_sub(350);
    let mut bank = 0u8;
    if userband.position & 1 != 0 {
        bank |= 0x04;
    }
    if pol.is_horizontal() {
        bank |= 0x02;
    }
    if hiband {
        bank |= 0x01;
    }
    let b3 = (userband.index << 5) | (bank << 2) | (((t >> 8) & 0x03) as u8);
    [0xE0, 0x10, 0x5A, b3, (t & 0xFF) as u8]
}

/// EN50607 ODU channel change: `70 <b1> <b2> <b3>` with 5-bit user band,
/// 11-bit tuning word `T = IF/1000 - 100` and the bank in the low nibble.
pub fn en50607_command(
    userband: UserBand,
    if_khz: u32,
    src: u32,
    pol: Polarization,
    hiband: bool,
) -> [u8; 4] {
    let t = (if_khz / 1_000).saturating_sub(100);
    let mut bank = ((src & 0x03) as u8) << 2;
    if pol.is_horizontal() {
        bank |= 0x02;
    }
    if hiband {
        bank |= 0x01;
    }
    [
        0x70,
        (userband.index << 3) | (((t >> 8) & 0x07) as u8),
        (t & 0xFF) as u8,
        bank,
    ]
}

impl Diseqc {
    /// Run the strategy on the frontend and rewrite `freq` to the L-band
    /// frequency to tune.
    pub fn send(
        &self,
        fd: BorrowedFd,
        stream_id: usize,
        freq_khz: &mut u32,
        src: u32,
        pol: Polarization,
    ) -> io::Result<()> {
        match self {
            Diseqc::Switch { lnb } => {
                let (if_freq, hiband) = lnb.intermediate_frequency(*freq_khz);
                let cmd = switch_command(src, pol, hiband);
                let voltage = if pol.is_horizontal() {
                    sys::SEC_VOLTAGE_18
                } else {
                    sys::SEC_VOLTAGE_13
                };
                tracing::debug!(
                    stream = stream_id,
                    src,
                    hiband,
                    cmd = ?cmd,
                    "sending committed DiSEqC switch"
                );

                sys::set_tone(fd, sys::SEC_TONE_OFF)?;
                sys::set_voltage(fd, voltage)?;
                thread::sleep(DISEQC_DELAY);
                sys::send_master_cmd(fd, &cmd)?;
                thread::sleep(DISEQC_DELAY);
                sys::send_burst(
                    fd,
                    if src & 1 == 0 {
                        sys::SEC_MINI_A
                    } else {
                        sys::SEC_MINI_B
                    },
                )?;
                thread::sleep(DISEQC_DELAY);
                sys::set_tone(fd, if hiband { sys::SEC_TONE_ON } else { sys::SEC_TONE_OFF })?;

                *freq_khz = if_freq;
                Ok(())
            }
            Diseqc::En50494 { lnb, userband } => {
                let (if_freq, hiband) = lnb.intermediate_frequency(*freq_khz);
                let cmd = en50494_command(*userband, if_freq, pol, hiband);
                tracing::debug!(
                    stream = stream_id,
                    userband = userband.index,
                    cmd = ?cmd,
                    "sending EN50494 channel change"
                );

                // command rides on 18 V, the shared cable then drops to 13 V
                sys::set_tone(fd, sys::SEC_TONE_OFF)?;
                sys::set_voltage(fd, sys::SEC_VOLTAGE_18)?;
                thread::sleep(DISEQC_DELAY);
                sys::send_master_cmd(fd, &cmd)?;
                thread::sleep(DISEQC_DELAY);
                sys::set_voltage(fd, sys::SEC_VOLTAGE_13)?;

                *freq_khz = userband.freq_khz;
                Ok(())
            }
            Diseqc::En50607 { lnb, userband } => {
                let (if_freq, hiband) = lnb.intermediate_frequency(*freq_khz);
                let cmd = en50607_command(*userband, if_freq, src, pol, hiband);
                tracing::debug!(
                    stream = stream_id,
                    userband = userband.index,
                    cmd = ?cmd,
                    "sending EN50607 channel change"
                );

                sys::set_tone(fd, sys::SEC_TONE_OFF)?;
                sys::set_voltage(fd, sys::SEC_VOLTAGE_18)?;
                thread::sleep(DISEQC_DELAY);
                sys::send_master_cmd(fd, &cmd)?;
                thread::sleep(DISEQC_DELAY);
                sys::set_voltage(fd, sys::SEC_VOLTAGE_13)?;

                *freq_khz = userband.freq_khz;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_command_mapping() {
        // src 0, vertical, low band: input select nibble clear
        assert_eq!(
            switch_command(0, Polarization::Vertical, false),
            [0xE0, 0x10, 0x38, 0xF0]
        );
        // src 1, horizontal, high band
        assert_eq!(
            switch_command(1, Polarization::Horizontal, true),
            [0xE0, 0x10, 0x38, 0xF7]
        );
        // src wraps into two bits
        assert_eq!(switch_command(3, Polarization::Vertical, true)[3], 0xFD);
    }

    #[test]
    fn en50494_tuning_word() {
        let ub = UserBand {
            index: 1,
            freq_khz: 1_400_000,
            position: 0,
        };
        // IF 1120 MHz: T = (1120000 + 1400000 + 2000)/4000 - 350 = 280
        let cmd = en50494_command(ub, 1_120_000, Polarization::Horizontal, true);
        assert_eq!(cmd[0..3], [0xE0, 0x10, 0x5A]);
        let t = ((u32::from(cmd[3]) & 0x03) << 8) | u32::from(cmd[4]);
        assert_eq!(t, 280);
        assert_eq!(cmd[3] >> 5, 1, "user band index");
    }

    #[test]
    fn en50607_layout() {
        let ub = UserBand {
            index: 5,
            freq_khz: 1_210_000,
            position: 0,
        };
        let cmd = en50607_command(ub, 1_120_000, 0, Polarization::Vertical, false);
        assert_eq!(cmd[0], 0x70);
        assert_eq!(cmd[1] >> 3, 5, "user band index");
        let t = ((u32::from(cmd[1]) & 0x07) << 8) | u32::from(cmd[2]);
        assert_eq!(t, 1020);
        assert_eq!(cmd[3], 0x00);
    }
}
