//! Media metadata produced by the external transcoder.
//!
//! The core does not transcode or manage segment files; it consumes two
//! artifacts the encoder leaves next to the segments:
//!
//! - a playlist file listing segment file names in play order, one per
//!   line (blank lines and `#` comments ignored);
//! - one frame log per segment (`<segment>.flog`) with a
//!   `<byte size> <frame type>` line per frame, in decode order.
//!
//! [`MediaSource`] resolves both at PLAY/DESCRIBE time and computes the
//! total duration the router clamps `Range` headers against.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CastError, Result};

/// Frame type as logged by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Intra-coded (key) frame.
    Key,
    /// Predicted frame.
    Delta,
    /// Bidirectionally predicted frame.
    Bidir,
}

impl FrameKind {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "I" => Some(Self::Key),
            "P" => Some(Self::Delta),
            "B" => Some(Self::Bidir),
            _ => None,
        }
    }
}

/// One frame-log entry: declared byte size and frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub size: u32,
    pub kind: FrameKind,
}

/// A resolved media presentation: base path, ordered segment list, and
/// the timing parameters the pacing math derives from.
#[derive(Debug, Clone)]
pub struct MediaSource {
    base: PathBuf,
    segments: Vec<String>,
    fps: u32,
    gop: u32,
    /// Total frame-log entries across all segments.
    total_frames: u64,
}

impl MediaSource {
    /// Resolve a playlist under `base` and pre-read every frame log to
    /// compute the total duration. Fails on a missing playlist, an
    /// empty segment list, or an unreadable frame log.
    pub fn open(base: &Path, playlist: &str, fps: u32, gop: u32) -> Result<Self> {
        let playlist_path = base.join(playlist);
        let text = fs::read_to_string(&playlist_path).map_err(|e| {
            CastError::Media(format!("playlist {}: {}", playlist_path.display(), e))
        })?;

        let segments: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            return Err(CastError::Media(format!(
                "playlist {} lists no segments",
                playlist_path.display()
            )));
        }

        let mut source = Self {
            base: base.to_path_buf(),
            segments,
            fps,
            gop,
            total_frames: 0,
        };
        for name in source.segments.clone() {
            source.total_frames += source.frame_log(&name)?.len() as u64;
        }
        Ok(source)
    }

    /// Segment file names in play order.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Absolute path of one segment.
    pub fn segment_path(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    /// Parse the encoder's frame log for one segment.
    pub fn frame_log(&self, name: &str) -> Result<Vec<FrameInfo>> {
        let path = self.base.join(format!("{}.flog", name));
        let text = fs::read_to_string(&path)
            .map_err(|e| CastError::Media(format!("frame log {}: {}", path.display(), e)))?;

        let mut frames = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let entry = parts
                .next()
                .and_then(|s| s.parse::<u32>().ok())
                .zip(parts.next().and_then(FrameKind::parse));
            match entry {
                Some((size, kind)) if size > 0 => frames.push(FrameInfo { size, kind }),
                _ => {
                    return Err(CastError::Media(format!(
                        "frame log {} line {} is malformed: {:?}",
                        path.display(),
                        lineno + 1,
                        line
                    )));
                }
            }
        }
        if frames.is_empty() {
            return Err(CastError::Media(format!(
                "frame log {} lists no frames",
                path.display()
            )));
        }
        Ok(frames)
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn gop(&self) -> u32 {
        self.gop
    }

    /// Total presentation duration in seconds. Each frame-log entry
    /// covers `1 / (fps * gop)` seconds, matching the pacing interval.
    pub fn duration_secs(&self) -> f64 {
        self.total_frames as f64 / f64::from(self.fps * self.gop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tscast-media-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_file(path: &Path, content: &str) {
        File::create(path)
            .unwrap()
            .write_all(content.as_bytes())
            .unwrap();
    }

    #[test]
    fn open_resolves_segments_and_duration() {
        let dir = scratch_dir("open");
        write_file(&dir.join("playlist.txt"), "# comment\nseg0.ts\n\nseg1.ts\n");
        write_file(&dir.join("seg0.ts.flog"), "376 I\n188 P\n");
        write_file(&dir.join("seg1.ts.flog"), "188 P\n188 B\n188 P\n188 B\n");

        let source = MediaSource::open(&dir, "playlist.txt", 25, 12).unwrap();
        assert_eq!(source.segments(), ["seg0.ts", "seg1.ts"]);
        // 6 entries at 1/300 s each.
        assert!((source.duration_secs() - 6.0 / 300.0).abs() < 1e-9);
    }

    #[test]
    fn frame_log_parses_sizes_and_kinds() {
        let dir = scratch_dir("flog");
        write_file(&dir.join("playlist.txt"), "a.ts\n");
        write_file(&dir.join("a.ts.flog"), "940 I\n376 P\n188 B\n");

        let source = MediaSource::open(&dir, "playlist.txt", 25, 12).unwrap();
        let frames = source.frame_log("a.ts").unwrap();
        assert_eq!(
            frames,
            vec![
                FrameInfo { size: 940, kind: FrameKind::Key },
                FrameInfo { size: 376, kind: FrameKind::Delta },
                FrameInfo { size: 188, kind: FrameKind::Bidir },
            ]
        );
    }

    #[test]
    fn empty_playlist_rejected() {
        let dir = scratch_dir("empty");
        write_file(&dir.join("playlist.txt"), "# nothing\n\n");
        assert!(matches!(
            MediaSource::open(&dir, "playlist.txt", 25, 12),
            Err(CastError::Media(_))
        ));
    }

    #[test]
    fn malformed_frame_log_rejected() {
        let dir = scratch_dir("bad");
        write_file(&dir.join("playlist.txt"), "a.ts\n");
        write_file(&dir.join("a.ts.flog"), "188 X\n");
        assert!(MediaSource::open(&dir, "playlist.txt", 25, 12).is_err());
    }

    #[test]
    fn missing_playlist_rejected() {
        let dir = scratch_dir("missing");
        assert!(MediaSource::open(&dir, "playlist.txt", 25, 12).is_err());
    }
}
