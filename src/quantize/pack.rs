//! Bit packing for sub-byte and multi-byte codes
//!
//! Codes are written as a little-endian bit stream: value `i` occupies bits
//! `[i*w, (i+1)*w)` counted from the least significant bit of byte 0. This
//! gives the familiar layouts for the common widths:
//!
//! - 4-bit: two codes per byte, code 0 in the low nibble
//! - 8-bit: one code per byte
//! - 16-bit: little-endian `u16`
//! - 1/2/3-bit: packed low-to-high, 3-bit codes may straddle bytes

use super::BitWidth;
use crate::error::{HyperionError, Result};

/// Pack `codes` at `bit_width` into `ceil(len * bits / 8)` bytes
///
/// Codes wider than the bit width are masked.
pub fn pack_codes(codes: &[u32], bit_width: BitWidth) -> Vec<u8> {
    let mut out = vec![0u8; bit_width.packed_len(codes.len())];
    let mask = bit_width.max_code();

    match bit_width {
        BitWidth::Eight => {
            for (dst, &code) in out.iter_mut().zip(codes) {
                *dst = (code & mask) as u8;
            }
        },
        BitWidth::Sixteen => {
            for (chunk, &code) in out.chunks_exact_mut(2).zip(codes) {
                chunk.copy_from_slice(&((code & mask) as u16).to_le_bytes());
            }
        },
        BitWidth::Four => {
            for (i, &code) in codes.iter().enumerate() {
                let nibble = (code & mask) as u8;
                if i % 2 == 0 {
                    out[i / 2] = nibble;
                } else {
                    out[i / 2] |= nibble << 4;
                }
            }
        },
        _ => {
            let bits = bit_width.bits() as usize;
            for (i, &code) in codes.iter().enumerate() {
                let code = code & mask;
                let bit_pos = i * bits;
                let byte = bit_pos / 8;
                let shift = bit_pos % 8;
                out[byte] |= (code << shift) as u8;
                if shift + bits > 8 {
                    out[byte + 1] |= (code >> (8 - shift)) as u8;
                }
            }
        },
    }

    out
}

/// Unpack `count` codes of `bit_width` from `data`
///
/// # Errors
///
/// Returns error if `data` is shorter than the packed length of `count` codes.
pub fn unpack_codes(data: &[u8], count: usize, bit_width: BitWidth) -> Result<Vec<u32>> {
    let needed = bit_width.packed_len(count);
    if data.len() < needed {
        return Err(HyperionError::InvalidShape {
            reason: format!(
                "Packed buffer too short: {} bytes for {} codes at {} bits (need {})",
                data.len(),
                count,
                bit_width.bits(),
                needed
            ),
        });
    }

    let codes = match bit_width {
        BitWidth::Eight => data[..count].iter().map(|&b| u32::from(b)).collect(),
        BitWidth::Sixteen => data[..needed]
            .chunks_exact(2)
            .map(|c| u32::from(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        BitWidth::Four => (0..count)
            .map(|i| {
                let byte = data[i / 2];
                if i % 2 == 0 {
                    u32::from(byte & 0x0F)
                } else {
                    u32::from(byte >> 4)
                }
            })
            .collect(),
        _ => {
            let bits = bit_width.bits() as usize;
            let mask = bit_width.max_code();
            (0..count)
                .map(|i| {
                    let bit_pos = i * bits;
                    let byte = bit_pos / 8;
                    let shift = bit_pos % 8;
                    let mut word = u32::from(data[byte]) >> shift;
                    if shift + bits > 8 {
                        word |= u32::from(data[byte + 1]) << (8 - shift);
                    }
                    word & mask
                })
                .collect()
        },
    };

    Ok(codes)
}
