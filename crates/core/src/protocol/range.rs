//! `Range` header parsing (RFC 2326 §12.29, npt form only).
//!
//! PLAY accepts `Range: npt=<start>-[<end>]`. The router rejects
//! ranges that reach past the media duration and echoes the effective
//! range — with an open end filled in by the duration — in the
//! response.

/// A parsed `npt=<start>-[<end>]` range, seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NptRange {
    pub start: f64,
    /// `None` for an open range (`npt=5-`).
    pub end: Option<f64>,
}

impl NptRange {
    /// Range covering the whole presentation.
    pub fn full() -> Self {
        Self {
            start: 0.0,
            end: None,
        }
    }

    /// Parse a `Range` header value. Returns `None` for anything that
    /// is not a well-formed npt range (other range units included).
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("npt=")?;
        let (start_text, end_text) = spec.split_once('-')?;

        let start_text = start_text.trim();
        let start = if start_text.is_empty() || start_text == "now" {
            0.0
        } else {
            start_text.parse::<f64>().ok().filter(|s| *s >= 0.0)?
        };

        let end_text = end_text.trim();
        let end = if end_text.is_empty() {
            None
        } else {
            Some(end_text.parse::<f64>().ok().filter(|e| *e >= start)?)
        };

        Some(Self { start, end })
    }

    /// Whether this range reaches past the presentation duration.
    pub fn exceeds(&self, duration: f64) -> bool {
        self.start > duration || self.end.is_some_and(|end| end > duration)
    }

    /// Effective range with the open end filled by the duration,
    /// formatted for the PLAY response.
    pub fn format_effective(&self, duration: f64) -> String {
        let end = self.end.unwrap_or(duration).min(duration);
        format!("npt={:.3}-{:.3}", self.start, end)
    }
}
