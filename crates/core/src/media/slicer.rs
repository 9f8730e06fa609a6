//! Annex-B slicer for buffers carrying several H.264 NAL units.
//!
//! ```text
//! 00 00 00 01 | 67 ...  (SPS, skipped)
//! 00 00 00 01 | 41 ...  (non-IDR slice, yielded with its start code)
//! 00 00 00 01 | 06 ...  (SEI, skipped)
//! ```
//!
//! Only slice NAL units (type 1 and 5) are yielded. SPS/PPS/SEI found inside
//! a sliced buffer are dropped here; parameter sets reach the parser when
//! they arrive as standalone payloads without a start code.

use super::bits;

/// 4-byte Annex-B start code. 3-byte start codes are not recognised.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NON_IDR_SLICE: u8 = 1;
const IDR_SLICE: u8 = 5;

/// Iterator over the slice NAL units of an Annex-B buffer.
///
/// Each yielded span starts at its start code and runs to the next start
/// code or the end of the buffer.
#[derive(Debug)]
pub struct Slices<'a> {
    data: &'a [u8],
    next_start: Option<usize>,
    whole: bool,
}

/// Slice `data`, which is expected to begin with [`START_CODE`].
///
/// If no start code is present at all, the whole buffer is yielded as a
/// single unit.
pub fn slices(data: &[u8]) -> Slices<'_> {
    let next_start = bits::index_of(data, &START_CODE, 0);
    Slices {
        data,
        next_start,
        whole: next_start.is_none() && !data.is_empty(),
    }
}

/// Invoke `handler` for every slice NAL unit in `data`.
pub fn slice<'a>(data: &'a [u8], mut handler: impl FnMut(&'a [u8])) {
    for unit in slices(data) {
        handler(unit);
    }
}

impl<'a> Iterator for Slices<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.whole {
            self.whole = false;
            return Some(self.data);
        }

        while let Some(start) = self.next_start {
            let tail_len = self.data.len() - start;
            if tail_len == START_CODE.len() {
                self.next_start = None;
                return None;
            }

            let header_index = start + START_CODE.len();
            let next = bits::index_of(self.data, &START_CODE, header_index);
            self.next_start = next;

            let Some(&header) = self.data.get(header_index) else {
                return None;
            };
            let nal_type = header & 0x1F;
            let end = next.unwrap_or(self.data.len());

            if nal_type == NON_IDR_SLICE || nal_type == IDR_SLICE {
                return Some(&self.data[start..end]);
            }

            tracing::trace!(nal_type, len = end - start, "slicer skipped NAL unit");
        }

        None
    }
}
