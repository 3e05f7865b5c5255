//! The PID table: which PIDs a stream wants, which demux handles are open
//! for them, and per-PID continuity accounting.
//!
//! RTSP handlers mutate the wanted set (under the stream mutex); the tuner
//! reader reconciles it against the open demux handles and clears the
//! `changed` flag only after a fully successful pass, so a failed open is
//! retried on the next reconcile.

use std::fs::File;
use std::io;

/// PIDs 0..=8192; index 8192 is the "all PIDs" pseudo entry.
pub const MAX_PIDS: usize = 8193;
/// Pseudo PID meaning "pass the whole transport stream".
pub const ALL_PIDS: u16 = 8192;

#[derive(Default)]
struct PidData {
    used: bool,
    should_close: bool,
    dmx: Option<File>,
    cc: u8,
    cc_error: u32,
    count: u32,
}

/// PID → (used, demux handle, continuity counters) with a global dirty flag.
///
/// Invariants: an open demux handle implies the PID was `used` when it was
/// opened; `should_close` marks a pending close for the next reconcile.
pub struct PidTable {
    changed: bool,
    data: Vec<PidData>,
}

impl Default for PidTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PidTable {
    pub fn new() -> Self {
        let mut data = Vec::with_capacity(MAX_PIDS);
        data.resize_with(MAX_PIDS, PidData::default);
        PidTable {
            changed: false,
            data,
        }
    }

    /// Mark a PID wanted or unwanted. Flags the table changed on any
    /// transition; an unwanted PID with an open handle gets a pending close.
    pub fn set_pid(&mut self, pid: u16, used: bool) {
        let entry = &mut self.data[pid as usize];
        if entry.used != used {
            self.changed = true;
        }
        entry.used = used;
        if !used && entry.dmx.is_some() {
            entry.should_close = true;
        }
    }

    /// Select or deselect every PID via the "all PIDs" pseudo entry, and
    /// drop any individually selected PIDs.
    pub fn set_all_pids(&mut self, used: bool) {
        for pid in 0..ALL_PIDS {
            if self.data[pid as usize].used {
                self.set_pid(pid, false);
            }
        }
        self.set_pid(ALL_PIDS, used);
    }

    /// Deselect everything (`pids=none`).
    pub fn clear_pids(&mut self) {
        for pid in 0..MAX_PIDS as u16 {
            if self.data[pid as usize].used {
                self.set_pid(pid, false);
            }
        }
    }

    pub fn is_used(&self, pid: u16) -> bool {
        self.data[pid as usize].used
    }

    pub fn all_pids(&self) -> bool {
        self.data[ALL_PIDS as usize].used
    }

    pub fn has_changed(&self) -> bool {
        self.changed
    }

    pub fn reset_changed(&mut self) {
        self.changed = false;
    }

    /// Count a received TS packet for a PID and track continuity errors.
    pub fn add_pid_data(&mut self, pid: u16, cc: u8) {
        let entry = &mut self.data[pid as usize];
        entry.count += 1;
        if entry.count > 1 {
            let expected = (entry.cc + 1) & 0x0F;
            if expected != cc {
                entry.cc_error += 1;
            }
        }
        entry.cc = cc;
    }

    pub fn packet_count(&self, pid: u16) -> u32 {
        self.data[pid as usize].count
    }

    pub fn cc_errors(&self, pid: u16) -> u32 {
        self.data[pid as usize].cc_error
    }

    /// Comma-separated list of requested PIDs, `all` for the pseudo entry.
    pub fn pid_csv(&self) -> String {
        if self.all_pids() {
            return "all".to_string();
        }
        let mut csv = String::new();
        for pid in 0..ALL_PIDS {
            if self.data[pid as usize].used {
                if !csv.is_empty() {
                    csv.push(',');
                }
                csv.push_str(&pid.to_string());
            }
        }
        csv
    }

    /// Apply the wanted set to the demux handles: close pending PIDs, open
    /// newly wanted ones via `open`, leave the rest untouched. Returns
    /// `(opened, closed)`; the changed flag is cleared only when every open
    /// succeeded.
    pub fn reconcile<F>(&mut self, mut open: F) -> io::Result<(usize, usize)>
    where
        F: FnMut(u16) -> io::Result<File>,
    {
        let mut opened = 0;
        let mut closed = 0;
        for pid in 0..MAX_PIDS as u16 {
            let entry = &mut self.data[pid as usize];
            if entry.should_close {
                entry.dmx = None;
                entry.should_close = false;
                entry.cc = 0;
                entry.cc_error = 0;
                entry.count = 0;
                closed += 1;
            } else if entry.used && entry.dmx.is_none() {
                entry.dmx = Some(open(pid)?);
                opened += 1;
            }
        }
        self.changed = false;
        Ok((opened, closed))
    }

    /// Close every open handle and forget all state.
    pub fn clear(&mut self) {
        for entry in &mut self.data {
            *entry = PidData::default();
        }
        self.changed = false;
    }
}
