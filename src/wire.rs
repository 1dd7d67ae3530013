// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The progress wire protocol: two tags and one fixed-size frame.
//!
//! Byte-order normalization lives entirely in `encode`/`decode`; nothing
//! outside this module touches frame bytes.

use crate::controller::{Rank, Tag};
use crate::error::{ProtocolError, Result};
use crate::store::ObjectId;
use tracing::warn;

/// Satellite->root and root->client progress payloads.
pub const PROGRESS_EVENT_TAG: Tag = 188_970;

/// One-byte handshake token exchanged during phase teardown.
pub const CLEANUP_TAG: Tag = 188_971;

/// Width of the text field, NUL terminator included.
pub const PROGRESS_TEXT_CAP: usize = 128;

/// Total frame length: three big-endian i32s plus the text field.
pub const FRAME_LEN: usize = 12 + PROGRESS_TEXT_CAP;

/// One progress report as it crosses a process boundary.
///
/// Percent is an integer 0..=100; fractional precision below 1% is not
/// preserved across the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressFrame {
    pub rank: i32,
    pub object_id: ObjectId,
    pub percent: i32,
    pub text: String,
}

impl ProgressFrame {
    pub fn new(rank: Rank, object_id: ObjectId, fraction: f64, text: &str) -> Self {
        let fraction = if fraction < 0.0 {
            0.0
        } else if fraction > 1.0 {
            1.0
        } else {
            fraction
        };
        ProgressFrame {
            rank: rank as i32,
            object_id,
            percent: (fraction * 100.0).round() as i32,
            text: clamp_text(text),
        }
    }

    pub fn fraction(&self) -> f64 {
        f64::from(self.percent) / 100.0
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..4].copy_from_slice(&self.rank.to_be_bytes());
        buf[4..8].copy_from_slice(&self.object_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.percent.to_be_bytes());
        let text = self.text.as_bytes();
        // The text is clamped at the source; clamp again rather than
        // trust the caller, since an oversized copy would corrupt the
        // frame layout.
        let n = text.len().min(PROGRESS_TEXT_CAP - 1);
        buf[12..12 + n].copy_from_slice(&text[..n]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_LEN {
            return Err(ProtocolError::Transport(format!(
                "short progress frame: {} bytes",
                buf.len()
            )));
        }
        let text_field = &buf[12..FRAME_LEN];
        let end = text_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(text_field.len());
        Ok(ProgressFrame {
            rank: be_i32(&buf[0..4]),
            object_id: be_i32(&buf[4..8]),
            percent: be_i32(&buf[8..12]),
            text: String::from_utf8_lossy(&text_field[..end]).into_owned(),
        })
    }
}

fn be_i32(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Truncate to the wire cap on a character boundary. Enforced at the
/// source, before encoding; overlong text is a recovered condition, not
/// an error.
pub fn clamp_text(text: &str) -> String {
    if text.len() < PROGRESS_TEXT_CAP {
        return text.to_string();
    }
    let mut end = PROGRESS_TEXT_CAP - 1;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    warn!(
        "progress text truncated from {} to {} bytes",
        text.len(),
        end
    );
    text[..end].to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let f = ProgressFrame::new(3, 42, 0.57, "Filter A");
        let buf = f.encode();
        assert_eq!(buf.len(), FRAME_LEN);
        let g = ProgressFrame::decode(&buf).unwrap();
        assert_eq!(g, f);
        assert_eq!(g.percent, 57);
        assert!((g.fraction() - 0.57).abs() < 1e-9);
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert!(ProgressFrame::decode(&[0u8; FRAME_LEN - 1]).is_err());
    }

    #[test]
    fn text_is_clamped_at_the_cap() {
        let long = "x".repeat(500);
        let f = ProgressFrame::new(0, 1, 0.5, &long);
        assert_eq!(f.text.len(), PROGRESS_TEXT_CAP - 1);
        let g = ProgressFrame::decode(&f.encode()).unwrap();
        assert_eq!(g.text, f.text);
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        // 2-byte code points straddling the cap must not be split.
        let long = "é".repeat(200);
        let t = clamp_text(&long);
        assert!(t.len() <= PROGRESS_TEXT_CAP - 1);
        assert!(t.chars().all(|c| c == 'é'));
    }

    #[test]
    fn fraction_is_clamped_to_unit_interval() {
        assert_eq!(ProgressFrame::new(0, 1, -0.5, "").percent, 0);
        assert_eq!(ProgressFrame::new(0, 1, 7.0, "").percent, 100);
    }
}
