//! Per-frontend descrambling state: CSA key slots, the packet batch, the
//! provider's section filters and the PAT/PMT bookkeeping.
//!
//! The reader thread drives [`DecryptState::process_buffer`] for every
//! filled packet buffer; the decrypt client thread installs keys and
//! filters as the provider sends them. Both sides go through the frontend's
//! state mutex.

use std::collections::HashMap;

use crate::mpegts::tables::{self, Pmt, TableData};
use crate::mpegts::{PacketBuffer, TS_PACKET_SIZE, packet_pid, set_null_pid};

use super::Parity;
use super::csa::{self, CSA_BATCH_SIZE, CsaKey};

/// ECM metadata reported by the provider (informational).
#[derive(Debug, Clone, Default)]
pub struct EcmInfo {
    pub pid: u16,
    pub service_id: u16,
    pub ca_id: u16,
    pub provider_id: u32,
    pub ecm_time_ms: u32,
    pub card_system: String,
    pub reader_name: String,
    pub source_name: String,
    pub protocol_name: String,
    pub hops: u8,
}

/// The two per-parity key slots.
#[derive(Default)]
pub struct KeySlots {
    slots: [Option<CsaKey>; 2],
}

/// Control words carry additive checksums in bytes 3 and 7.
fn control_word_checksum_ok(cw: &[u8; 8]) -> bool {
    let sum = |range: std::ops::Range<usize>| {
        range.fold(0u8, |acc, i| acc.wrapping_add(cw[i]))
    };
    cw[3] == sum(0..3) && cw[7] == sum(4..7)
}

impl KeySlots {
    /// Validate and install a control word. Returns `false` (slot
    /// untouched) on a checksum mismatch.
    pub fn set(&mut self, parity: Parity, cw: &[u8; 8]) -> bool {
        if !control_word_checksum_ok(cw) {
            tracing::warn!(?parity, "control word checksum mismatch, rejecting key");
            return false;
        }
        self.slots[parity.index()] = Some(CsaKey::new(cw));
        true
    }

    pub fn get(&self, parity: Parity) -> Option<&CsaKey> {
        self.slots[parity.index()].as_ref()
    }

    pub fn remove(&mut self, parity: Parity) {
        self.slots[parity.index()] = None;
    }

    pub fn clear(&mut self) {
        self.slots = [None, None];
    }
}

struct SectionFilter {
    pid: u16,
    data: [u8; 16],
    mask: [u8; 16],
}

impl SectionFilter {
    /// Predicate over the 16 leading section bytes.
    fn matches(&self, section: &[u8]) -> bool {
        (0..16).all(|i| {
            let byte = section.get(i).copied().unwrap_or(0);
            (self.data[i] ^ byte) & self.mask[i] == 0
        })
    }
}

/// The provider's active section filters, keyed by (demux, filter), with
/// per-PID section reassembly.
#[derive(Default)]
pub struct FilterTable {
    filters: HashMap<(u8, u8), SectionFilter>,
    sections: HashMap<u16, TableData>,
}

impl FilterTable {
    pub fn start(&mut self, demux: u8, filter: u8, pid: u16, data: [u8; 16], mask: [u8; 16]) {
        self.filters
            .insert((demux, filter), SectionFilter { pid, data, mask });
    }

    pub fn stop(&mut self, demux: u8, filter: u8) {
        self.filters.remove(&(demux, filter));
    }

    pub fn clear(&mut self) {
        self.filters.clear();
        self.sections.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn watches(&self, pid: u16) -> bool {
        self.filters.values().any(|f| f.pid == pid)
    }

    /// Feed one clear TS packet; on section completion returns the
    /// (demux, filter) pairs whose predicate matched, with the section.
    fn feed(&mut self, pid: u16, pkt: &[u8]) -> Option<Vec<(u8, u8, Vec<u8>)>> {
        if !self.watches(pid) {
            return None;
        }
        let acc = self.sections.entry(pid).or_default();
        if !acc.collect(pkt) {
            return None;
        }
        let section = acc.section().to_vec();
        acc.clear();
        let matches: Vec<(u8, u8, Vec<u8>)> = self
            .filters
            .iter()
            .filter(|(_, f)| f.pid == pid && f.matches(&section))
            .map(|(&(demux, filter), _)| (demux, filter, section.clone()))
            .collect();
        (!matches.is_empty()).then_some(matches)
    }
}

/// Data the decrypt client must ship to the provider, produced while
/// scanning a buffer.
#[derive(Debug)]
pub enum ProviderEvent {
    /// A section matched an active filter.
    FilterData {
        demux: u8,
        filter: u8,
        section: Vec<u8>,
    },
    /// A PMT finished collecting; push it as CA-PMT.
    CaPmt {
        program_number: u16,
        program_info: Vec<u8>,
    },
}

/// Descrambling state of one frontend.
pub struct DecryptState {
    pub keys: KeySlots,
    pub filters: FilterTable,
    batch: Vec<(usize, usize, usize)>,
    batch_parity: Option<Parity>,
    rewrite_pmt: bool,
    pat: TableData,
    pmt_pids: Vec<u16>,
    pmt: TableData,
    pmt_info: Option<Pmt>,
    pmt_sent: bool,
    pub ecm: Option<EcmInfo>,
}

impl Default for DecryptState {
    fn default() -> Self {
        Self::new()
    }
}

impl DecryptState {
    pub fn new() -> Self {
        DecryptState {
            keys: KeySlots::default(),
            filters: FilterTable::default(),
            batch: Vec::with_capacity(CSA_BATCH_SIZE),
            batch_parity: None,
            rewrite_pmt: false,
            pat: TableData::new(),
            pmt_pids: Vec::new(),
            pmt: TableData::new(),
            pmt_info: None,
            pmt_sent: false,
            ecm: None,
        }
    }

    pub fn set_rewrite_pmt(&mut self, enabled: bool) {
        self.rewrite_pmt = enabled;
    }

    /// Whether a PID was published as a PMT PID by the PAT.
    pub fn is_marked_as_pmt(&self, pid: u16) -> bool {
        self.pmt_pids.contains(&pid)
    }

    pub fn pmt(&self) -> Option<&Pmt> {
        self.pmt_info.as_ref()
    }

    /// Scan a filled buffer: batch-descramble scrambled packets, tap clear
    /// packets for the section filters and the PAT/PMT machinery. The
    /// buffer leaves this function fully descrambled (or degraded to NULL
    /// packets where no key exists).
    pub fn process_buffer(
        &mut self,
        stream_id: usize,
        buffer: &mut PacketBuffer,
        events: &mut Vec<ProviderEvent>,
    ) {
        let mut pending = false;
        {
            let payload = buffer.payload_mut();
            let count = payload.len() / TS_PACKET_SIZE;
            for i in 0..count {
                let start = i * TS_PACKET_SIZE;
                let end = start + TS_PACKET_SIZE;
                // transport-error packets are left alone
                if payload[start] != 0x47 || payload[start + 1] & 0x80 != 0 {
                    continue;
                }
                let pid = packet_pid(&payload[start..end]);

                if payload[start + 3] & 0x80 != 0 && pid < 0x1FFF {
                    let parity = Parity::from_ts(payload[start + 3]);
                    match (self.batch.is_empty(), self.batch_parity) {
                        (false, Some(current))
                            if current != parity || self.batch.len() >= CSA_BATCH_SIZE =>
                        {
                            let final_flush = current != parity;
                            if final_flush {
                                tracing::debug!(
                                    stream = stream_id,
                                    count = self.batch.len(),
                                    "parity changed, descrambling final batch"
                                );
                            }
                            self.flush_batch(payload, final_flush);
                        }
                        (true, Some(current)) if current != parity => {
                            // boundary fell between buffers: retire the key anyway
                            self.keys.remove(current);
                        }
                        _ => {}
                    }

                    if self.keys.get(parity).is_some() {
                        // skip the TS header and any adaptation field
                        let mut skip = 4;
                        if payload[start + 3] & 0x20 != 0 {
                            let af_len = payload[start + 4] as usize;
                            if af_len < 183 {
                                skip += af_len + 1;
                            }
                        }
                        self.batch.push((start + skip, TS_PACKET_SIZE - skip, start));
                        self.batch_parity = Some(parity);
                        pending = true;
                    } else {
                        set_null_pid(&mut payload[start..end]);
                    }
                } else if pid == 0 {
                    if self.pat.collect(&payload[start..end]) && self.pmt_pids.is_empty() {
                        match tables::parse_pat(self.pat.section()) {
                            Some(pat) => {
                                tracing::debug!(
                                    stream = stream_id,
                                    programs = pat.programs.len(),
                                    "PAT collected"
                                );
                                self.pmt_pids = pat.programs.iter().map(|&(_, pid)| pid).collect();
                            }
                            None => self.pat.clear(),
                        }
                    }
                } else if self.is_marked_as_pmt(pid) {
                    if self.pmt.collect(&payload[start..end]) && self.pmt_info.is_none() {
                        self.pmt_info = tables::parse_pmt(self.pmt.section());
                    }
                    if let Some(pmt) = &self.pmt_info
                        && !self.pmt_sent
                    {
                        events.push(ProviderEvent::CaPmt {
                            program_number: pmt.program_number,
                            program_info: pmt.program_info.clone(),
                        });
                        self.pmt_sent = true;
                    }
                    if self.rewrite_pmt {
                        tables::strip_ca_descriptors(&mut payload[start..end]);
                    }
                } else if let Some(matches) = self.filters.feed(pid, &payload[start..end]) {
                    for (demux, filter, section) in matches {
                        events.push(ProviderEvent::FilterData {
                            demux,
                            filter,
                            section,
                        });
                    }
                }
            }
        }

        if pending {
            buffer.set_decrypt_pending();
        }
        if !self.batch.is_empty() {
            self.flush_batch(buffer.payload_mut(), false);
        }
        buffer.clear_decrypt_pending();
    }

    /// Descramble and retire the current batch. `final_flush` additionally
    /// removes the outgoing parity's key.
    fn flush_batch(&mut self, payload: &mut [u8], final_flush: bool) {
        let Some(parity) = self.batch_parity else {
            self.batch.clear();
            return;
        };
        if let Some(key) = self.keys.get(parity) {
            for &(offset, len, pkt) in &self.batch {
                csa::decrypt_payload(key, &mut payload[offset..offset + len]);
                // clear the scramble bits so downstream passes it on
                payload[pkt + 3] &= 0x3F;
            }
            if final_flush {
                self.keys.remove(parity);
            }
        } else {
            for &(_, _, pkt) in &self.batch {
                set_null_pid(&mut payload[pkt..pkt + TS_PACKET_SIZE]);
            }
        }
        self.batch.clear();
    }

    /// Provider went away or the stream stopped: drop tables, filters,
    /// keys and batch state.
    pub fn stop_filters(&mut self, stream_id: usize) {
        tracing::info!(stream = stream_id, "clearing PAT/PMT tables and keys");
        self.pat.clear();
        self.pmt.clear();
        self.pmt_pids.clear();
        self.pmt_info = None;
        self.pmt_sent = false;
        self.keys.clear();
        self.batch.clear();
        self.batch_parity = None;
        self.filters.clear();
    }

    pub fn set_ecm_info(&mut self, info: EcmInfo) {
        self.ecm = Some(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVEN_CW: [u8; 8] = [0x01, 0x02, 0x03, 0x06, 0x05, 0x06, 0x07, 0x12];
    const ODD_CW: [u8; 8] = [0x11, 0x12, 0x13, 0x36, 0x15, 0x16, 0x17, 0x42];

    fn scrambled_packet(pid: u16, parity: Parity, cw: &[u8; 8], fill: u8) -> [u8; TS_PACKET_SIZE] {
        let mut pkt = [fill; TS_PACKET_SIZE];
        pkt[0] = 0x47;
        pkt[1] = (pid >> 8) as u8;
        pkt[2] = (pid & 0xFF) as u8;
        pkt[3] = 0x90 | if parity == Parity::Odd { 0x40 } else { 0x00 };
        let key = CsaKey::new(cw);
        csa::encrypt_payload(&key, &mut pkt[4..]);
        pkt
    }

    fn buffer_with(packets: &[[u8; TS_PACKET_SIZE]]) -> PacketBuffer {
        let mut buffer = PacketBuffer::new();
        buffer.initialize(1, 0);
        for pkt in packets {
            buffer.free_space()[..TS_PACKET_SIZE].copy_from_slice(pkt);
            buffer.add_written(TS_PACKET_SIZE);
        }
        buffer
    }

    #[test]
    fn control_word_checksum() {
        assert!(control_word_checksum_ok(&EVEN_CW));
        let mut bad = EVEN_CW;
        bad[3] = bad[3].wrapping_add(1);
        assert!(!control_word_checksum_ok(&bad));
    }

    #[test]
    fn rejects_bad_checksum_key() {
        let mut keys = KeySlots::default();
        let mut bad = EVEN_CW;
        bad[7] ^= 0xFF;
        assert!(!keys.set(Parity::Odd, &bad));
        assert!(keys.get(Parity::Odd).is_none());
        assert!(keys.set(Parity::Odd, &ODD_CW));
        assert!(keys.get(Parity::Odd).is_some());
    }

    #[test]
    fn parity_cutover_descrambles_and_retires_even_key() {
        let mut state = DecryptState::new();
        assert!(state.keys.set(Parity::Even, &EVEN_CW));
        assert!(state.keys.set(Parity::Odd, &ODD_CW));

        let packets = [
            scrambled_packet(0x100, Parity::Even, &EVEN_CW, 0xA1),
            scrambled_packet(0x100, Parity::Even, &EVEN_CW, 0xA2),
            scrambled_packet(0x100, Parity::Odd, &ODD_CW, 0xB1),
            scrambled_packet(0x100, Parity::Odd, &ODD_CW, 0xB2),
        ];
        let mut buffer = buffer_with(&packets);
        let mut events = Vec::new();
        state.process_buffer(0, &mut buffer, &mut events);

        // the even key was retired at the parity boundary, the odd one kept
        assert!(state.keys.get(Parity::Even).is_none());
        assert!(state.keys.get(Parity::Odd).is_some());

        // every packet is descrambled back to its plain fill byte
        let payload = buffer.payload();
        for (i, fill) in [0xA1u8, 0xA2, 0xB1, 0xB2].iter().enumerate() {
            let pkt = &payload[i * TS_PACKET_SIZE..(i + 1) * TS_PACKET_SIZE];
            assert_eq!(pkt[3] & 0xC0, 0, "scramble bits cleared");
            assert!(
                pkt[4..].iter().all(|&b| b == *fill),
                "packet {i} descrambled"
            );
        }
        assert!(!buffer.decrypt_pending());
        assert!(events.is_empty());
    }

    #[test]
    fn missing_key_degrades_to_null_pid() {
        let mut state = DecryptState::new();
        let packets = [scrambled_packet(0x100, Parity::Odd, &ODD_CW, 0xCC)];
        let mut buffer = buffer_with(&packets);
        let mut events = Vec::new();
        state.process_buffer(0, &mut buffer, &mut events);

        let payload = buffer.payload();
        assert_eq!(packet_pid(&payload[..TS_PACKET_SIZE]), 0x1FFF);
        assert_eq!(payload[3] & 0xC0, 0, "scramble bits cleared");
    }

    #[test]
    fn filter_tap_emits_matching_sections() {
        let mut state = DecryptState::new();
        let mut data = [0u8; 16];
        data[0] = 0x80; // ECM table id
        let mut mask = [0u8; 16];
        mask[0] = 0xFF;
        state.filters.start(0, 3, 0x123, data, mask);

        // one-packet section with table id 0x80
        let mut pkt = [0xFFu8; TS_PACKET_SIZE];
        pkt[0] = 0x47;
        pkt[1] = 0x41; // PUSI, pid 0x123
        pkt[2] = 0x23;
        pkt[3] = 0x10;
        pkt[4] = 0x00; // pointer
        pkt[5] = 0x80; // table id
        pkt[6] = 0x70;
        pkt[7] = 0x20; // section length 0x20
        let mut buffer = buffer_with(&[pkt]);
        let mut events = Vec::new();
        state.process_buffer(0, &mut buffer, &mut events);

        assert_eq!(events.len(), 1);
        match &events[0] {
            ProviderEvent::FilterData {
                demux,
                filter,
                section,
            } => {
                assert_eq!((*demux, *filter), (0, 3));
                assert_eq!(section[0], 0x80);
                assert_eq!(section.len(), 0x20 + 3);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // a non-matching table id stays quiet
        let mut other = pkt;
        other[5] = 0x81;
        let mut buffer = buffer_with(&[other]);
        events.clear();
        state.process_buffer(0, &mut buffer, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn pat_marks_pmt_and_ca_pmt_emitted_once() {
        let mut state = DecryptState::new();
        state.set_rewrite_pmt(true);

        // PAT: program 0x101 → PMT PID 0x1000
        let mut section: Vec<u8> = vec![0x00, 0xB0, 0x00, 0x00, 0x01, 0xC1, 0x00, 0x00];
        section.extend_from_slice(&[0x01, 0x01, 0xF0, 0x00]);
        let len = section.len() - 3 + 4;
        section[2] = len as u8;
        let crc = tables::calculate_crc32(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        let mut pat_pkt = [0xFFu8; TS_PACKET_SIZE];
        pat_pkt[0] = 0x47;
        pat_pkt[1] = 0x40;
        pat_pkt[2] = 0x00;
        pat_pkt[3] = 0x10;
        pat_pkt[4] = 0x00;
        pat_pkt[5..5 + section.len()].copy_from_slice(&section);

        let pmt_pkt = crate::mpegts::tables::tests::sample_pmt_packet();

        let mut buffer = buffer_with(&[pat_pkt, pmt_pkt, pmt_pkt]);
        let mut events = Vec::new();
        state.process_buffer(0, &mut buffer, &mut events);

        assert!(state.is_marked_as_pmt(0x1000));
        let ca_pmts = events
            .iter()
            .filter(|e| matches!(e, ProviderEvent::CaPmt { .. }))
            .count();
        assert_eq!(ca_pmts, 1, "CA-PMT pushed once per collected PMT");

        // rewrite enabled: the in-buffer PMT packets lost their CA descriptors
        let payload = buffer.payload();
        let rewritten = &payload[TS_PACKET_SIZE..TS_PACKET_SIZE * 2];
        let section_length =
            ((usize::from(rewritten[6] & 0x0F)) << 8) | usize::from(rewritten[7]);
        let section = &rewritten[5..5 + section_length + 3];
        assert_eq!(tables::calculate_crc32(section), 0);
        let pmt = tables::parse_pmt(section).unwrap();
        assert!(pmt.program_info.is_empty());
    }

    #[test]
    fn stop_filters_clears_everything() {
        let mut state = DecryptState::new();
        state.keys.set(Parity::Even, &EVEN_CW);
        state.filters.start(0, 0, 0x123, [0; 16], [0; 16]);
        state.stop_filters(0);
        assert!(state.keys.get(Parity::Even).is_none());
        assert!(state.filters.is_empty());
        assert!(!state.is_marked_as_pmt(0x1000));
    }
}
