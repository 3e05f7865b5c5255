//! Universal LNB down-conversion.
//!
//! The LNB mixes the satellite frequency down into L-band before it enters
//! the tuner. A universal LNB has two local oscillators; the 22 kHz tone
//! selects the high band.

/// Local oscillator and band-switch frequencies, in kHz.
#[derive(Debug, Clone, Copy)]
pub struct Lnb {
    pub lof_low: u32,
    pub lof_high: u32,
    pub switch_freq: u32,
}

impl Default for Lnb {
    fn default() -> Self {
        // universal LNB
        Lnb {
            lof_low: 9_750_000,
            lof_high: 10_600_000,
            switch_freq: 11_700_000,
        }
    }
}

impl Lnb {
    /// L-band intermediate frequency for a downlink frequency, plus whether
    /// the high band (22 kHz tone on) is selected.
    pub fn intermediate_frequency(&self, freq_khz: u32) -> (u32, bool) {
        if freq_khz >= self.switch_freq {
            (freq_khz - self.lof_high, true)
        } else if freq_khz >= self.lof_low {
            (freq_khz - self.lof_low, false)
        } else {
            // C-band style: oscillator above the downlink
            (self.lof_low - freq_khz, false)
        }
    }
}
