//! Linux DVB API v5 bindings (frontend and demux character devices).
//!
//! Struct layouts and ioctl numbers follow `linux/dvb/frontend.h` and
//! `linux/dvb/dmx.h`. Only the subset the gateway drives is declared.

#![allow(dead_code)]

use std::ffi::c_void;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::{ioctl_none, ioctl_read, ioctl_write_int_bad, ioctl_write_ptr, request_code_none};

/// DVB ioctls share the 'o' magic.
const IOCTL_TYPE: u8 = b'o';

// -- fe_status bits ---------------------------------------------------------

pub const FE_HAS_SIGNAL: u32 = 0x01;
pub const FE_HAS_CARRIER: u32 = 0x02;
pub const FE_HAS_VITERBI: u32 = 0x04;
pub const FE_HAS_SYNC: u32 = 0x08;
pub const FE_HAS_LOCK: u32 = 0x10;
pub const FE_TIMEDOUT: u32 = 0x20;

// -- fe_delivery_system -----------------------------------------------------

pub const SYS_UNDEFINED: u32 = 0;
pub const SYS_DVBC_ANNEX_A: u32 = 1;
pub const SYS_DVBT: u32 = 3;
pub const SYS_DVBS: u32 = 5;
pub const SYS_DVBS2: u32 = 6;
pub const SYS_DVBT2: u32 = 16;

// -- dtv_property commands --------------------------------------------------

pub const DTV_UNDEFINED: u32 = 0;
pub const DTV_TUNE: u32 = 1;
pub const DTV_CLEAR: u32 = 2;
pub const DTV_FREQUENCY: u32 = 3;
pub const DTV_MODULATION: u32 = 4;
pub const DTV_BANDWIDTH_HZ: u32 = 5;
pub const DTV_INVERSION: u32 = 6;
pub const DTV_SYMBOL_RATE: u32 = 8;
pub const DTV_INNER_FEC: u32 = 9;
pub const DTV_PILOT: u32 = 12;
pub const DTV_ROLLOFF: u32 = 13;
pub const DTV_DELIVERY_SYSTEM: u32 = 17;
pub const DTV_GUARD_INTERVAL: u32 = 38;
pub const DTV_TRANSMISSION_MODE: u32 = 39;
pub const DTV_STREAM_ID: u32 = 42;
pub const DTV_ENUM_DELSYS: u32 = 44;

// -- parameter enums --------------------------------------------------------

pub const INVERSION_AUTO: u32 = 2;

pub const FEC_NONE: u32 = 0;
pub const FEC_1_2: u32 = 1;
pub const FEC_2_3: u32 = 2;
pub const FEC_3_4: u32 = 3;
pub const FEC_4_5: u32 = 4;
pub const FEC_5_6: u32 = 5;
pub const FEC_6_7: u32 = 6;
pub const FEC_7_8: u32 = 7;
pub const FEC_8_9: u32 = 8;
pub const FEC_AUTO: u32 = 9;
pub const FEC_3_5: u32 = 10;
pub const FEC_9_10: u32 = 11;

pub const QPSK: u32 = 0;
pub const QAM_16: u32 = 1;
pub const QAM_32: u32 = 2;
pub const QAM_64: u32 = 3;
pub const QAM_128: u32 = 4;
pub const QAM_256: u32 = 5;
pub const QAM_AUTO: u32 = 6;
pub const PSK_8: u32 = 9;

pub const ROLLOFF_35: u32 = 0;
pub const ROLLOFF_20: u32 = 1;
pub const ROLLOFF_25: u32 = 2;
pub const ROLLOFF_AUTO: u32 = 3;

pub const PILOT_ON: u32 = 0;
pub const PILOT_OFF: u32 = 1;
pub const PILOT_AUTO: u32 = 2;

pub const TRANSMISSION_MODE_AUTO: u32 = 2;
pub const GUARD_INTERVAL_AUTO: u32 = 4;

pub const SEC_VOLTAGE_13: u32 = 0;
pub const SEC_VOLTAGE_18: u32 = 1;
pub const SEC_VOLTAGE_OFF: u32 = 2;

pub const SEC_TONE_ON: u32 = 0;
pub const SEC_TONE_OFF: u32 = 1;

pub const SEC_MINI_A: u32 = 0;
pub const SEC_MINI_B: u32 = 1;

// -- structs ----------------------------------------------------------------

pub const DTV_PROPERTY_BUFFER_SIZE: usize = 32;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct DtvPropertyBuffer {
    pub data: [u8; DTV_PROPERTY_BUFFER_SIZE],
    pub len: u32,
    pub reserved1: [u32; 3],
    pub reserved2: *mut c_void,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union DtvPropertyData {
    pub data: u32,
    pub buffer: DtvPropertyBuffer,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct DtvProperty {
    pub cmd: u32,
    pub reserved: [u32; 3],
    pub u: DtvPropertyData,
    pub result: i32,
}

impl DtvProperty {
    pub fn new(cmd: u32, data: u32) -> Self {
        DtvProperty {
            cmd,
            reserved: [0; 3],
            u: DtvPropertyData { data },
            result: 0,
        }
    }
}

#[repr(C)]
pub struct DtvProperties {
    pub num: u32,
    pub props: *mut DtvProperty,
}

#[repr(C)]
pub struct DvbFrontendInfo {
    pub name: [u8; 128],
    pub fe_type: u32,
    pub frequency_min: u32,
    pub frequency_max: u32,
    pub frequency_stepsize: u32,
    pub frequency_tolerance: u32,
    pub symbol_rate_min: u32,
    pub symbol_rate_max: u32,
    pub symbol_rate_tolerance: u32,
    pub notifier_delay: u32,
    pub caps: u32,
}

impl Default for DvbFrontendInfo {
    fn default() -> Self {
        // all-zero is a valid "unknown frontend" value
        unsafe { std::mem::zeroed() }
    }
}

/// `dvb_frontend_event`; the legacy parameter block is opaque here.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct DvbFrontendEvent {
    pub status: u32,
    pub parameters: [u8; 36],
}

impl Default for DvbFrontendEvent {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct DiseqcMasterCmd {
    pub msg: [u8; 6],
    pub msg_len: u8,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct DmxPesFilterParams {
    pub pid: u16,
    pub input: u32,
    pub output: u32,
    pub pes_type: u32,
    pub flags: u32,
}

pub const DMX_IN_FRONTEND: u32 = 0;
pub const DMX_OUT_TS_TAP: u32 = 2;
pub const DMX_PES_OTHER: u32 = 20;
pub const DMX_IMMEDIATE_START: u32 = 4;

// -- ioctls -----------------------------------------------------------------

ioctl_read!(fe_get_info, IOCTL_TYPE, 61, DvbFrontendInfo);
ioctl_write_ptr!(fe_diseqc_send_master_cmd, IOCTL_TYPE, 63, DiseqcMasterCmd);
ioctl_write_int_bad!(fe_diseqc_send_burst, request_code_none!(IOCTL_TYPE, 65));
ioctl_write_int_bad!(fe_set_tone, request_code_none!(IOCTL_TYPE, 66));
ioctl_write_int_bad!(fe_set_voltage, request_code_none!(IOCTL_TYPE, 67));
ioctl_read!(fe_read_status, IOCTL_TYPE, 69, u32);
ioctl_read!(fe_read_ber, IOCTL_TYPE, 70, u32);
ioctl_read!(fe_read_signal_strength, IOCTL_TYPE, 71, u16);
ioctl_read!(fe_read_snr, IOCTL_TYPE, 72, u16);
ioctl_read!(fe_read_uncorrected_blocks, IOCTL_TYPE, 73, u32);
ioctl_read!(fe_get_event, IOCTL_TYPE, 78, DvbFrontendEvent);
ioctl_write_ptr!(fe_set_property, IOCTL_TYPE, 82, DtvProperties);
ioctl_read!(fe_get_property, IOCTL_TYPE, 83, DtvProperties);

ioctl_none!(dmx_stop, IOCTL_TYPE, 42);
ioctl_write_ptr!(dmx_set_pes_filter, IOCTL_TYPE, 44, DmxPesFilterParams);
ioctl_write_int_bad!(dmx_set_buffer_size, request_code_none!(IOCTL_TYPE, 45));

// -- safe wrappers ----------------------------------------------------------

fn map_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Push a tuning property sequence to the frontend.
pub fn set_properties(fd: BorrowedFd, props: &mut [DtvProperty]) -> io::Result<()> {
    let mut cmdseq = DtvProperties {
        num: props.len() as u32,
        props: props.as_mut_ptr(),
    };
    unsafe { fe_set_property(fd.as_raw_fd(), &mut cmdseq) }.map_err(map_err)?;
    Ok(())
}

/// Query a single property (used for `DTV_ENUM_DELSYS`).
pub fn get_property(fd: BorrowedFd, cmd: u32) -> io::Result<DtvProperty> {
    let mut prop = DtvProperty::new(cmd, 0);
    let mut cmdseq = DtvProperties {
        num: 1,
        props: &mut prop,
    };
    unsafe { fe_get_property(fd.as_raw_fd(), &mut cmdseq) }.map_err(map_err)?;
    Ok(prop)
}

/// Pop every queued frontend event to clear stale `POLLPRI` status before
/// a new tune.
pub fn drain_events(fd: BorrowedFd) {
    let mut event = DvbFrontendEvent::default();
    while unsafe { fe_get_event(fd.as_raw_fd(), &mut event) }.is_ok() {}
}

pub fn read_status(fd: BorrowedFd) -> io::Result<u32> {
    let mut status = 0u32;
    unsafe { fe_read_status(fd.as_raw_fd(), &mut status) }.map_err(map_err)?;
    Ok(status)
}

pub fn read_signal_strength(fd: BorrowedFd) -> io::Result<u16> {
    let mut value = 0u16;
    unsafe { fe_read_signal_strength(fd.as_raw_fd(), &mut value) }.map_err(map_err)?;
    Ok(value)
}

pub fn read_snr(fd: BorrowedFd) -> io::Result<u16> {
    let mut value = 0u16;
    unsafe { fe_read_snr(fd.as_raw_fd(), &mut value) }.map_err(map_err)?;
    Ok(value)
}

pub fn read_ber(fd: BorrowedFd) -> io::Result<u32> {
    let mut value = 0u32;
    unsafe { fe_read_ber(fd.as_raw_fd(), &mut value) }.map_err(map_err)?;
    Ok(value)
}

pub fn read_uncorrected_blocks(fd: BorrowedFd) -> io::Result<u32> {
    let mut value = 0u32;
    unsafe { fe_read_uncorrected_blocks(fd.as_raw_fd(), &mut value) }.map_err(map_err)?;
    Ok(value)
}

pub fn get_info(fd: BorrowedFd) -> io::Result<DvbFrontendInfo> {
    let mut info = DvbFrontendInfo::default();
    unsafe { fe_get_info(fd.as_raw_fd(), &mut info) }.map_err(map_err)?;
    Ok(info)
}

pub fn set_tone(fd: BorrowedFd, tone: u32) -> io::Result<()> {
    unsafe { fe_set_tone(fd.as_raw_fd(), tone as i32) }.map_err(map_err)?;
    Ok(())
}

pub fn set_voltage(fd: BorrowedFd, voltage: u32) -> io::Result<()> {
    unsafe { fe_set_voltage(fd.as_raw_fd(), voltage as i32) }.map_err(map_err)?;
    Ok(())
}

pub fn send_burst(fd: BorrowedFd, burst: u32) -> io::Result<()> {
    unsafe { fe_diseqc_send_burst(fd.as_raw_fd(), burst as i32) }.map_err(map_err)?;
    Ok(())
}

pub fn send_master_cmd(fd: BorrowedFd, msg: &[u8]) -> io::Result<()> {
    let mut cmd = DiseqcMasterCmd {
        msg: [0; 6],
        msg_len: msg.len().min(6) as u8,
    };
    cmd.msg[..msg.len().min(6)].copy_from_slice(&msg[..msg.len().min(6)]);
    unsafe { fe_diseqc_send_master_cmd(fd.as_raw_fd(), &cmd) }.map_err(map_err)?;
    Ok(())
}

/// Configure a demux handle to pass one PID through to the DVR device.
pub fn set_pes_filter(fd: BorrowedFd, pid: u16) -> io::Result<()> {
    let params = DmxPesFilterParams {
        pid,
        input: DMX_IN_FRONTEND,
        output: DMX_OUT_TS_TAP,
        pes_type: DMX_PES_OTHER,
        flags: DMX_IMMEDIATE_START,
    };
    unsafe { dmx_set_pes_filter(fd.as_raw_fd(), &params) }.map_err(map_err)?;
    Ok(())
}
