//! RTCP receiver-report codec (RFC 3550 §6.4.2).
//!
//! Decodes the receiver reports clients send back on the RTCP port.
//! Only the subset the congestion monitor consumes is modeled: the
//! report-block statistics, of which `fraction_lost` is the one field
//! acted upon. Sender reports, SDES, and the rest of the RTCP family
//! are skipped when scanning a compound packet.

use crate::error::CastError;

/// RTCP packet type for receiver reports.
pub const PT_RECEIVER_REPORT: u8 = 201;

/// Length of the common RTCP header in bytes.
const RTCP_HEADER_LEN: usize = 4;

/// Length of one report block in bytes.
const REPORT_BLOCK_LEN: usize = 24;

/// One report block (RFC 3550 §6.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportBlock {
    /// The source this block reports on.
    pub source_ssrc: u32,
    /// Fraction of packets lost since the previous report, as a fixed
    /// point 8-bit value (loss rate × 256).
    pub fraction_lost: u8,
    /// Cumulative packets lost (24-bit signed).
    pub cumulative_lost: i32,
    /// Extended highest sequence number received.
    pub extended_highest_sequence: u32,
    /// Interarrival jitter in timestamp units.
    pub interarrival_jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp.
    pub last_sr: u32,
    /// Delay since the last SR, in 1/65536 seconds.
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    /// The loss fraction as a float in `[0, 1]`.
    pub fn fraction_lost_ratio(&self) -> f32 {
        f32::from(self.fraction_lost) / 256.0
    }
}

/// A decoded receiver report (packet type 201).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// SSRC of the reporting receiver.
    pub reporter_ssrc: u32,
    /// Report blocks, one per reported source.
    pub reports: Vec<ReportBlock>,
}

impl ReceiverReport {
    /// Decode a single receiver-report packet starting at `buf[0]`.
    pub fn decode(buf: &[u8]) -> Result<Self, CastError> {
        if buf.len() < RTCP_HEADER_LEN + 4 {
            return Err(rtcp_err(format!("{} bytes is too short", buf.len())));
        }
        let version = buf[0] >> 6;
        if version != 2 {
            return Err(rtcp_err(format!("bad version {}", version)));
        }
        if buf[1] != PT_RECEIVER_REPORT {
            return Err(rtcp_err(format!("packet type {} is not RR", buf[1])));
        }
        let report_count = (buf[0] & 0x1f) as usize;
        let declared_len = (u16::from_be_bytes([buf[2], buf[3]]) as usize + 1) * 4;
        let needed = RTCP_HEADER_LEN + 4 + report_count * REPORT_BLOCK_LEN;
        if declared_len < needed || buf.len() < needed {
            return Err(rtcp_err(format!(
                "{} report blocks do not fit in {} bytes",
                report_count,
                buf.len()
            )));
        }

        let reporter_ssrc = read_u32(buf, 4);
        let mut reports = Vec::with_capacity(report_count);
        for i in 0..report_count {
            let at = 8 + i * REPORT_BLOCK_LEN;
            let word = read_u32(buf, at + 4);
            // Top byte is fraction lost; low 24 bits are cumulative
            // lost, sign-extended from 24 to 32 bits.
            let fraction_lost = (word >> 24) as u8;
            let cumulative_lost = ((word << 8) as i32) >> 8;
            reports.push(ReportBlock {
                source_ssrc: read_u32(buf, at),
                fraction_lost,
                cumulative_lost,
                extended_highest_sequence: read_u32(buf, at + 8),
                interarrival_jitter: read_u32(buf, at + 12),
                last_sr: read_u32(buf, at + 16),
                delay_since_last_sr: read_u32(buf, at + 20),
            });
        }

        Ok(ReceiverReport {
            reporter_ssrc,
            reports,
        })
    }

    /// Scan a compound RTCP datagram for the first receiver report.
    ///
    /// Clients commonly bundle RR with SDES; non-RR packets are skipped
    /// by their declared length. Returns `None` when the datagram holds
    /// no well-formed RR.
    pub fn find_in(buf: &[u8]) -> Option<Self> {
        let mut offset = 0;
        while buf.len() >= offset + RTCP_HEADER_LEN {
            let chunk = &buf[offset..];
            if chunk[0] >> 6 != 2 {
                return None;
            }
            let packet_len = (u16::from_be_bytes([chunk[2], chunk[3]]) as usize + 1) * 4;
            if packet_len > chunk.len() {
                return None;
            }
            if chunk[1] == PT_RECEIVER_REPORT {
                return Self::decode(&chunk[..packet_len]).ok();
            }
            offset += packet_len;
        }
        None
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn rtcp_err(detail: String) -> CastError {
    CastError::Wire {
        format: "RTCP",
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a raw RR with one report block carrying `fraction_lost`.
    fn raw_rr(fraction_lost: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(0x81); // V=2, one report block
        buf.push(PT_RECEIVER_REPORT);
        buf.extend_from_slice(&7u16.to_be_bytes()); // (8 words - 1)
        buf.extend_from_slice(&0x1111_2222u32.to_be_bytes()); // reporter
        buf.extend_from_slice(&0x3333_4444u32.to_be_bytes()); // source
        let word = (u32::from(fraction_lost) << 24) | 0x000_0005; // 5 lost
        buf.extend_from_slice(&word.to_be_bytes());
        buf.extend_from_slice(&1000u32.to_be_bytes()); // EHSN
        buf.extend_from_slice(&42u32.to_be_bytes()); // jitter
        buf.extend_from_slice(&7u32.to_be_bytes()); // LSR
        buf.extend_from_slice(&9u32.to_be_bytes()); // DLSR
        buf
    }

    #[test]
    fn decode_single_report() {
        let rr = ReceiverReport::decode(&raw_rr(64)).unwrap();
        assert_eq!(rr.reporter_ssrc, 0x1111_2222);
        assert_eq!(rr.reports.len(), 1);
        let block = &rr.reports[0];
        assert_eq!(block.source_ssrc, 0x3333_4444);
        assert_eq!(block.fraction_lost, 64);
        assert_eq!(block.cumulative_lost, 5);
        assert_eq!(block.extended_highest_sequence, 1000);
        assert_eq!(block.interarrival_jitter, 42);
        assert_eq!(block.last_sr, 7);
        assert_eq!(block.delay_since_last_sr, 9);
    }

    #[test]
    fn fraction_ratio() {
        let rr = ReceiverReport::decode(&raw_rr(128)).unwrap();
        let ratio = rr.reports[0].fraction_lost_ratio();
        assert!((ratio - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn negative_cumulative_lost_sign_extends() {
        let mut buf = raw_rr(0);
        // Overwrite the loss word with a negative 24-bit value (-1).
        buf[12..16].copy_from_slice(&0x00FF_FFFFu32.to_be_bytes());
        let rr = ReceiverReport::decode(&buf).unwrap();
        assert_eq!(rr.reports[0].cumulative_lost, -1);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut buf = raw_rr(0);
        buf[0] = 0x41; // V=1
        assert!(ReceiverReport::decode(&buf).is_err());
    }

    #[test]
    fn rejects_wrong_packet_type() {
        let mut buf = raw_rr(0);
        buf[1] = 200; // SR
        assert!(ReceiverReport::decode(&buf).is_err());
    }

    #[test]
    fn rejects_truncated_block() {
        let buf = raw_rr(0);
        assert!(ReceiverReport::decode(&buf[..20]).is_err());
    }

    #[test]
    fn find_in_skips_leading_sdes() {
        // 8-byte SDES-shaped packet (PT 202) followed by a real RR.
        let mut buf = vec![0x81, 202, 0x00, 0x01, 0, 0, 0, 0];
        buf.extend_from_slice(&raw_rr(32));
        let rr = ReceiverReport::find_in(&buf).expect("RR after SDES");
        assert_eq!(rr.reports[0].fraction_lost, 32);
    }

    #[test]
    fn find_in_empty_none() {
        assert!(ReceiverReport::find_in(&[]).is_none());
    }
}
