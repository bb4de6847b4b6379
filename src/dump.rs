// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Compact single-line byte previews for log and error output.
//!
//! Packet-level `Debug` impls want to show the offending bytes, but never a
//! whole 64 KiB datagram; a preview prints the total length and a bounded
//! hex prefix. Full block dumps (for connection-level framing errors) go
//! through `pretty-hex` instead.

use std::fmt;

/// Leading bytes shown before the preview is cut off.
const PREVIEW_BYTES: usize = 48;

pub(crate) struct BytePreview<'a>(pub(crate) &'a [u8]);

impl fmt::Debug for BytePreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())?;
        for b in self.0.iter().take(PREVIEW_BYTES) {
            write!(f, " {b:02x}")?;
        }
        if self.0.len() > PREVIEW_BYTES {
            write!(f, " ..")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_shown_fully() {
        let s = format!("{:?}", BytePreview(&[0x80, 0x60, 0x00]));
        assert_eq!(s, "[3 bytes] 80 60 00");
    }

    #[test]
    fn long_input_truncated() {
        let data = vec![0xab; 100];
        let s = format!("{:?}", BytePreview(&data));
        assert!(s.starts_with("[100 bytes] ab ab"));
        assert!(s.ends_with(" .."));
        // 48 shown bytes, no more.
        assert_eq!(s.matches("ab").count(), PREVIEW_BYTES);
    }

    #[test]
    fn empty_input() {
        assert_eq!(format!("{:?}", BytePreview(&[])), "[0 bytes]");
    }
}
