//! Timestamp seek over the packet ring.
//!
//! Packet anchor timestamps are monotonic within each ring segment, so the
//! search interpolates linearly between the bracket endpoints and falls back
//! to bisection steps when an estimate overshoots. On a wrapped ring the
//! bracket is first narrowed to the newer segment (before the write frontier)
//! or the older one (after it) by probing the first packet's anchor.

use crate::error::{FeedError, Result};
use crate::reader::FeedReader;

/// Where to land when no packet anchors exactly the requested timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekMode {
    /// Land on the last packet anchored at or before the target, so no frame
    /// at or after the target is missed. Lands on the oldest packet when the
    /// target predates the whole ring.
    #[default]
    Earliest,
    /// Land on the packet nearest the target even if its anchor is later.
    NearestForward,
}

impl FeedReader {
    /// Position the cursor so the next read starts at the packet covering
    /// `target` (a dts in stream time base units).
    pub fn seek(&mut self, target: i64, mode: SeekMode) -> Result<()> {
        if self.attached {
            self.refresh_frontier()?;
        }
        let ps = self.packet_size as u64;
        if self.file_size < self.first_packet_offset + ps {
            return Err(FeedError::NotFound(target));
        }

        // Bracket the search. A wrapped ring holds two monotonic segments:
        // newer data in [fpo, wi), older data in [wi, end).
        let (lo, hi) = if self.write_index > self.first_packet_offset
            && self.write_index < self.file_size
        {
            if self.packet_dts_at(self.first_packet_offset)? <= target {
                (self.first_packet_offset, self.write_index - ps)
            } else {
                (self.write_index, self.file_size - ps)
            }
        } else {
            (self.first_packet_offset, self.file_size - ps)
        };

        let mut pos_min = lo;
        let mut pos_max = hi;
        let mut pos = loop {
            if pos_min > pos_max {
                break pos_min;
            }
            let dts_min = self.packet_dts_at(pos_min)?;
            if dts_min > target {
                break pos_min;
            }
            let dts_max = self.packet_dts_at(pos_max)?;
            if dts_max <= target {
                break pos_max;
            }

            // dts_min <= target < dts_max: interpolate, packet-aligned.
            let span = (pos_max - pos_min) as f64;
            let frac = (target - dts_min) as f64 / (dts_max - dts_min) as f64;
            let mut pos = pos_min + ((span * frac) as u64 / ps) * ps;
            pos = pos.clamp(pos_min, pos_max);

            let dts = self.packet_dts_at(pos)?;
            if dts == target {
                break pos;
            } else if dts > target {
                pos_max = pos - ps;
            } else {
                pos_min = pos + ps;
            }
        };

        pos = pos.clamp(lo, hi);
        if mode == SeekMode::Earliest && pos > lo && self.packet_dts_at(pos)? > target {
            pos -= ps;
        }

        self.set_cursor(pos);
        Ok(())
    }
}
