//! MPEG-TS continuity correction across segment splices.
//!
//! The transcoder emits each segment as an independent transport
//! stream: continuity counters restart, and PCR/PTS clocks rebase near
//! zero. Concatenating segments verbatim would trip every receiver's
//! discontinuity detection. [`ContinuityFixer`] rewrites three fields
//! in arrival order so consecutive segments splice into one gapless
//! stream:
//!
//! - **Continuity counter** (4-bit, per PID): the first packet of a new
//!   source yields a per-PID offset
//!   `last_cc(prev) − first_cc(new) (+1 when the packet carries a
//!   payload)`; `(cc + offset) mod 16` is applied to every packet of
//!   the source.
//! - **PCR** (27 MHz): one per-source time delta
//!   `last PCR(prev) − first PCR(new) + gap`, with fallbacks to any
//!   PID's PCR, then PTS×300, then zero, added to every PCR field.
//! - **PES PTS** (90 kHz): the same delta scaled by 1/300, rewritten in
//!   place in the marker-bit split of the 5-byte field.
//!
//! [`next_source`](ContinuityFixer::next_source) marks a segment
//! boundary: it snapshots the rewritten tail values and clears the
//! first-seen tracking so the following segment is measured against
//! this segment's end. The whole working set is an explicit value owned
//! by one pacing run; nothing is shared or ambient.

use std::collections::HashMap;

use crate::error::CastError;

/// MPEG-TS packets are fixed 188-byte units.
pub const TS_PACKET_LEN: usize = 188;

/// Sync byte opening every TS packet.
const TS_SYNC_BYTE: u8 = 0x47;

/// Splice gap inserted between sources, in 27 MHz PCR units (100 ms).
/// A toolchain heuristic, kept tunable rather than derived.
pub const DEFAULT_SOURCE_GAP_27MHZ: u64 = 2_700_000;

/// PCR wraps at 2^33 * 300 (33-bit base, 300 ticks of extension each).
const PCR_MODULUS: u64 = (1 << 33) * 300;

/// PTS wraps at 2^33 (90 kHz clock).
const PTS_MODULUS: u64 = 1 << 33;

/// Per-stream-switch working set for the splice correction.
#[derive(Debug)]
pub struct ContinuityFixer {
    gap: u64,
    /// False until the first `next_source` call; the opening segment is
    /// passed through unmodified.
    has_prev: bool,
    /// Rewritten tail values of the previous source, per PID.
    prev_cc: HashMap<u16, u8>,
    prev_pcr: HashMap<u16, u64>,
    prev_pts: HashMap<u16, u64>,
    /// Rewritten tail values of the source currently being processed.
    tail_cc: HashMap<u16, u8>,
    tail_pcr: HashMap<u16, u64>,
    tail_pts: HashMap<u16, u64>,
    /// Counter correction per PID; an entry also marks "first packet of
    /// this PID already seen in this source".
    cc_offset: HashMap<u16, u8>,
    /// Per-source time correction in 27 MHz units, computed once from
    /// the first timing-bearing packet of the source.
    delta: Option<i64>,
}

impl ContinuityFixer {
    pub fn new(gap_27mhz: u64) -> Self {
        Self {
            gap: gap_27mhz,
            has_prev: false,
            prev_cc: HashMap::new(),
            prev_pcr: HashMap::new(),
            prev_pts: HashMap::new(),
            tail_cc: HashMap::new(),
            tail_pcr: HashMap::new(),
            tail_pts: HashMap::new(),
            cc_offset: HashMap::new(),
            delta: None,
        }
    }

    /// Rewrite one TS packet in place.
    ///
    /// Must be called for every packet of every source in arrival
    /// order; the tail bookkeeping depends on seeing the full stream.
    pub fn fix_packet(&mut self, pkt: &mut [u8]) -> Result<(), CastError> {
        if pkt.len() != TS_PACKET_LEN {
            return Err(ts_err(format!("{} bytes is not a TS packet", pkt.len())));
        }
        if pkt[0] != TS_SYNC_BYTE {
            return Err(ts_err(format!("bad sync byte {:#04x}", pkt[0])));
        }

        let pid = u16::from(pkt[1] & 0x1f) << 8 | u16::from(pkt[2]);
        let has_payload = pkt[3] & 0x10 != 0;

        let cc = pkt[3] & 0x0f;
        let offset = match self.cc_offset.get(&pid) {
            Some(&o) => o,
            None => {
                let o = self.counter_offset(pid, cc, has_payload);
                self.cc_offset.insert(pid, o);
                o
            }
        };
        let fixed_cc = (cc + offset) & 0x0f;
        pkt[3] = (pkt[3] & 0xf0) | fixed_cc;
        self.tail_cc.insert(pid, fixed_cc);

        let pcr = read_pcr(pkt);
        let pts_at = pts_field_offset(pkt);
        let pts = pts_at.map(|at| read_pts(&pkt[at..at + 5]));

        if self.delta.is_none() && (pcr.is_some() || pts.is_some()) {
            let delta = self.source_delta(pid, pcr, pts);
            tracing::trace!(pid, delta, "splice time delta");
            self.delta = Some(delta);
        }
        let delta = self.delta.unwrap_or(0);

        if let Some(value) = pcr {
            let fixed = add_mod(value, delta, PCR_MODULUS);
            write_pcr(pkt, fixed);
            self.tail_pcr.insert(pid, fixed);
        }
        if let (Some(at), Some(value)) = (pts_at, pts) {
            let fixed = add_mod(value, delta / 300, PTS_MODULUS);
            write_pts(&mut pkt[at..at + 5], fixed);
            self.tail_pts.insert(pid, fixed);
        }

        Ok(())
    }

    /// Mark a source boundary: the current tail becomes the reference
    /// for the next source, first-seen tracking restarts.
    pub fn next_source(&mut self) {
        self.prev_cc = self.tail_cc.clone();
        self.prev_pcr = self.tail_pcr.clone();
        self.prev_pts = self.tail_pts.clone();
        self.cc_offset.clear();
        self.delta = None;
        self.has_prev = true;
    }

    /// Drop all state. Used when streaming stops entirely.
    pub fn reset(&mut self) {
        self.prev_cc.clear();
        self.prev_pcr.clear();
        self.prev_pts.clear();
        self.tail_cc.clear();
        self.tail_pcr.clear();
        self.tail_pts.clear();
        self.cc_offset.clear();
        self.delta = None;
        self.has_prev = false;
    }

    fn counter_offset(&self, pid: u16, first_cc: u8, has_payload: bool) -> u8 {
        if !self.has_prev {
            return 0;
        }
        match self.prev_cc.get(&pid) {
            Some(&last) => {
                // The counter only increments on payload-bearing
                // packets, so a payload at the splice point needs the
                // extra step past the previous tail.
                let bump = u8::from(has_payload);
                last.wrapping_sub(first_cc).wrapping_add(bump) & 0x0f
            }
            None => 0,
        }
    }

    /// Time delta for the current source, computed from its first
    /// timing-bearing packet. Fallback chain per reference value: same
    /// PID's PCR, any PID's PCR, PTS scaled to 27 MHz, zero. The fixed
    /// splice gap is added regardless.
    fn source_delta(&self, pid: u16, pcr: Option<u64>, pts: Option<u64>) -> i64 {
        if !self.has_prev {
            return 0;
        }
        let current = match pcr.or(pts.map(|p| p * 300)) {
            Some(v) => v,
            None => return self.gap as i64,
        };
        let previous = self
            .prev_pcr
            .get(&pid)
            .copied()
            .or_else(|| self.prev_pcr.values().copied().max())
            .or_else(|| self.prev_pts.get(&pid).map(|p| p * 300))
            .or_else(|| self.prev_pts.values().copied().max().map(|p| p * 300));
        match previous {
            Some(prev) => prev as i64 - current as i64 + self.gap as i64,
            None => self.gap as i64,
        }
    }
}

fn add_mod(value: u64, delta: i64, modulus: u64) -> u64 {
    (i128::from(value) + i128::from(delta)).rem_euclid(i128::from(modulus)) as u64
}

/// Offset of the payload within a TS packet, if any.
fn payload_offset(pkt: &[u8]) -> Option<usize> {
    match (pkt[3] >> 4) & 0x03 {
        0b01 => Some(4),
        0b11 => {
            let at = 5 + pkt[4] as usize;
            (at < TS_PACKET_LEN).then_some(at)
        }
        _ => None,
    }
}

/// Read the 27 MHz PCR when the adaptation field carries one.
fn read_pcr(pkt: &[u8]) -> Option<u64> {
    if pkt[3] & 0x20 == 0 {
        return None;
    }
    let af_len = pkt[4] as usize;
    // Flags byte plus the 6-byte PCR field.
    if af_len < 7 || pkt[5] & 0x10 == 0 {
        return None;
    }
    let b = &pkt[6..12];
    let base = u64::from(b[0]) << 25
        | u64::from(b[1]) << 17
        | u64::from(b[2]) << 9
        | u64::from(b[3]) << 1
        | u64::from(b[4]) >> 7;
    let ext = u64::from(b[4] & 0x01) << 8 | u64::from(b[5]);
    Some(base * 300 + ext)
}

/// Write a 27 MHz PCR back into the adaptation field, preserving the
/// six reserved bits.
fn write_pcr(pkt: &mut [u8], pcr: u64) {
    let base = pcr / 300;
    let ext = pcr % 300;
    pkt[6] = (base >> 25) as u8;
    pkt[7] = (base >> 17) as u8;
    pkt[8] = (base >> 9) as u8;
    pkt[9] = (base >> 1) as u8;
    pkt[10] = ((base as u8 & 0x01) << 7) | (pkt[10] & 0x7e) | ((ext >> 8) as u8 & 0x01);
    pkt[11] = ext as u8;
}

/// Offset of the 5-byte PTS field when this packet starts a PES header
/// that carries one.
fn pts_field_offset(pkt: &[u8]) -> Option<usize> {
    // payload_unit_start_indicator
    if pkt[1] & 0x40 == 0 {
        return None;
    }
    let at = payload_offset(pkt)?;
    let payload = &pkt[at..];
    if payload.len() < 14 {
        return None;
    }
    // PES start-code prefix, then the PTS flag in the extension byte.
    if payload[0] != 0x00 || payload[1] != 0x00 || payload[2] != 0x01 {
        return None;
    }
    if payload[7] & 0x80 == 0 {
        return None;
    }
    Some(at + 9)
}

/// Read a 33-bit PTS out of the marker-bit split.
fn read_pts(p: &[u8]) -> u64 {
    u64::from(p[0] >> 1 & 0x07) << 30
        | u64::from(p[1]) << 22
        | u64::from(p[2] >> 1 & 0x7f) << 15
        | u64::from(p[3]) << 7
        | u64::from(p[4]) >> 1
}

/// Rewrite the 5-byte PTS field in place, preserving the 4-bit prefix
/// and setting the three marker bits.
fn write_pts(p: &mut [u8], pts: u64) {
    p[0] = (p[0] & 0xf0) | ((pts >> 30) as u8 & 0x07) << 1 | 0x01;
    p[1] = (pts >> 22) as u8;
    p[2] = ((pts >> 15) as u8 & 0x7f) << 1 | 0x01;
    p[3] = (pts >> 7) as u8;
    p[4] = ((pts as u8) & 0x7f) << 1 | 0x01;
}

fn ts_err(detail: String) -> CastError {
    CastError::Wire {
        format: "MPEG-TS",
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO_PID: u16 = 0x100;

    /// Payload-only packet with the given counter.
    fn payload_packet(pid: u16, cc: u8) -> Vec<u8> {
        let mut pkt = vec![0xffu8; TS_PACKET_LEN];
        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = (pid >> 8) as u8 & 0x1f;
        pkt[2] = pid as u8;
        pkt[3] = 0x10 | (cc & 0x0f);
        pkt
    }

    /// Packet with an adaptation field carrying a PCR, plus payload.
    fn pcr_packet(pid: u16, cc: u8, pcr: u64) -> Vec<u8> {
        let mut pkt = payload_packet(pid, cc);
        pkt[3] = 0x30 | (cc & 0x0f);
        pkt[4] = 7; // flags + PCR
        pkt[5] = 0x10;
        write_pcr(&mut pkt, pcr);
        pkt
    }

    /// Packet opening a PES header with a PTS.
    fn pes_packet(pid: u16, cc: u8, pts: u64) -> Vec<u8> {
        let mut pkt = payload_packet(pid, cc);
        pkt[1] |= 0x40; // payload unit start
        let p = &mut pkt[4..];
        p[0] = 0x00;
        p[1] = 0x00;
        p[2] = 0x01;
        p[3] = 0xe0; // video stream id
        p[4] = 0x00;
        p[5] = 0x00;
        p[6] = 0x80;
        p[7] = 0x80; // PTS only
        p[8] = 5;
        p[9] = 0x21; // '0010' prefix, markers set below
        write_pts(&mut p[9..14], pts);
        pkt
    }

    fn cc_of(pkt: &[u8]) -> u8 {
        pkt[3] & 0x0f
    }

    #[test]
    fn first_source_passes_through() {
        let mut fixer = ContinuityFixer::new(DEFAULT_SOURCE_GAP_27MHZ);
        let mut pkt = pcr_packet(VIDEO_PID, 3, 90_000);
        fixer.fix_packet(&mut pkt).unwrap();
        assert_eq!(cc_of(&pkt), 3);
        assert_eq!(read_pcr(&pkt), Some(90_000));
    }

    #[test]
    fn counters_continuous_across_splice() {
        let mut fixer = ContinuityFixer::new(DEFAULT_SOURCE_GAP_27MHZ);
        for cc in 0..=5u8 {
            let mut pkt = payload_packet(VIDEO_PID, cc);
            fixer.fix_packet(&mut pkt).unwrap();
        }
        fixer.next_source();

        // New source restarts its counter at an arbitrary value.
        let mut seen = Vec::new();
        for cc in [11u8, 12, 13, 14, 15, 0, 1] {
            let mut pkt = payload_packet(VIDEO_PID, cc);
            fixer.fix_packet(&mut pkt).unwrap();
            seen.push(cc_of(&pkt));
        }
        // Previous tail was 5; payload packets continue 6, 7, ...
        assert_eq!(seen, vec![6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn counter_wraps_mod_16() {
        let mut fixer = ContinuityFixer::new(DEFAULT_SOURCE_GAP_27MHZ);
        let mut pkt = payload_packet(VIDEO_PID, 15);
        fixer.fix_packet(&mut pkt).unwrap();
        fixer.next_source();

        let mut pkt = payload_packet(VIDEO_PID, 9);
        fixer.fix_packet(&mut pkt).unwrap();
        assert_eq!(cc_of(&pkt), 0);
    }

    #[test]
    fn adaptation_only_packet_does_not_bump() {
        let mut fixer = ContinuityFixer::new(DEFAULT_SOURCE_GAP_27MHZ);
        let mut pkt = payload_packet(VIDEO_PID, 7);
        fixer.fix_packet(&mut pkt).unwrap();
        fixer.next_source();

        // Adaptation-only packet: counter must repeat the tail value.
        let mut pkt = payload_packet(VIDEO_PID, 2);
        pkt[3] = 0x20 | 2;
        pkt[4] = 1;
        pkt[5] = 0x00;
        fixer.fix_packet(&mut pkt).unwrap();
        assert_eq!(cc_of(&pkt), 7);
    }

    #[test]
    fn pcr_monotonic_across_splice() {
        let gap = DEFAULT_SOURCE_GAP_27MHZ;
        let mut fixer = ContinuityFixer::new(gap);
        let mut last = 0;
        for (cc, pcr) in [(0u8, 1_000_000u64), (1, 2_000_000), (2, 3_000_000)] {
            let mut pkt = pcr_packet(VIDEO_PID, cc, pcr);
            fixer.fix_packet(&mut pkt).unwrap();
            last = read_pcr(&pkt).unwrap();
        }
        fixer.next_source();

        // New source rebases near zero.
        let mut pkt = pcr_packet(VIDEO_PID, 3, 500);
        fixer.fix_packet(&mut pkt).unwrap();
        let spliced = read_pcr(&pkt).unwrap();
        assert_eq!(spliced, last + gap);

        let mut pkt = pcr_packet(VIDEO_PID, 4, 900_500);
        fixer.fix_packet(&mut pkt).unwrap();
        assert_eq!(read_pcr(&pkt).unwrap(), spliced + 900_000);
    }

    #[test]
    fn pts_shifted_by_scaled_delta() {
        let gap = 2_700_000u64;
        let mut fixer = ContinuityFixer::new(gap);
        let mut pkt = pcr_packet(VIDEO_PID, 0, 27_000_000);
        fixer.fix_packet(&mut pkt).unwrap();
        fixer.next_source();

        // First packet of the new source carries a PCR of zero, so the
        // delta is 27_000_000 + gap; the PTS moves by delta / 300.
        let mut pkt = pcr_packet(VIDEO_PID, 1, 0);
        fixer.fix_packet(&mut pkt).unwrap();
        let mut pes = pes_packet(VIDEO_PID, 2, 45_000);
        fixer.fix_packet(&mut pes).unwrap();

        let at = pts_field_offset(&pes).unwrap();
        let fixed = read_pts(&pes[at..at + 5]);
        assert_eq!(fixed, 45_000 + (27_000_000 + gap) / 300);
    }

    #[test]
    fn pts_markers_and_prefix_preserved() {
        let mut pes = pes_packet(VIDEO_PID, 0, 0x1_2345_6789 & (PTS_MODULUS - 1));
        let at = pts_field_offset(&pes).unwrap();
        let field = &pes[at..at + 5];
        assert_eq!(field[0] & 0xf0, 0x20, "prefix nibble");
        assert_eq!(field[0] & 0x01, 1);
        assert_eq!(field[2] & 0x01, 1);
        assert_eq!(field[4] & 0x01, 1);

        let mut fixer = ContinuityFixer::new(0);
        fixer.fix_packet(&mut pes).unwrap();
        let field = &pes[at..at + 5];
        assert_eq!(field[0] & 0xf0, 0x20);
        assert_eq!(field[0] & 0x01, 1);
        assert_eq!(field[2] & 0x01, 1);
        assert_eq!(field[4] & 0x01, 1);
    }

    #[test]
    fn pts_roundtrip() {
        for pts in [0u64, 1, 90_000, (1 << 33) - 1] {
            let mut field = [0x21u8, 0, 1, 0, 1];
            write_pts(&mut field, pts);
            assert_eq!(read_pts(&field), pts, "pts {}", pts);
        }
    }

    #[test]
    fn pcr_roundtrip() {
        let mut pkt = pcr_packet(VIDEO_PID, 0, 0);
        for pcr in [0u64, 299, 300, 8_589_934_591 * 300 + 299] {
            write_pcr(&mut pkt, pcr);
            assert_eq!(read_pcr(&pkt), Some(pcr), "pcr {}", pcr);
        }
    }

    #[test]
    fn delta_falls_back_to_pts_reference() {
        let gap = 2_700_000u64;
        let mut fixer = ContinuityFixer::new(gap);
        // Previous source carried only a PTS.
        let mut pes = pes_packet(VIDEO_PID, 0, 90_000);
        fixer.fix_packet(&mut pes).unwrap();
        fixer.next_source();

        let mut pkt = pcr_packet(VIDEO_PID, 1, 0);
        fixer.fix_packet(&mut pkt).unwrap();
        assert_eq!(read_pcr(&pkt).unwrap(), 90_000 * 300 + gap);
    }

    #[test]
    fn missing_previous_reference_applies_gap_only() {
        let gap = 2_700_000u64;
        let mut fixer = ContinuityFixer::new(gap);
        // Previous source had no timing information at all.
        let mut pkt = payload_packet(VIDEO_PID, 0);
        fixer.fix_packet(&mut pkt).unwrap();
        fixer.next_source();

        let mut pkt = pcr_packet(VIDEO_PID, 1, 5_000);
        fixer.fix_packet(&mut pkt).unwrap();
        assert_eq!(read_pcr(&pkt).unwrap(), 5_000 + gap);
    }

    #[test]
    fn reset_clears_history() {
        let mut fixer = ContinuityFixer::new(DEFAULT_SOURCE_GAP_27MHZ);
        let mut pkt = payload_packet(VIDEO_PID, 9);
        fixer.fix_packet(&mut pkt).unwrap();
        fixer.next_source();
        fixer.reset();

        let mut pkt = payload_packet(VIDEO_PID, 4);
        fixer.fix_packet(&mut pkt).unwrap();
        assert_eq!(cc_of(&pkt), 4);
    }

    #[test]
    fn rejects_short_packet() {
        let mut fixer = ContinuityFixer::new(0);
        let mut short = vec![TS_SYNC_BYTE; 187];
        assert!(fixer.fix_packet(&mut short).is_err());
    }

    #[test]
    fn rejects_bad_sync_byte() {
        let mut fixer = ContinuityFixer::new(0);
        let mut pkt = payload_packet(VIDEO_PID, 0);
        pkt[0] = 0x48;
        assert!(fixer.fix_packet(&mut pkt).is_err());
    }
}
