// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Text dump of a 32x32 tile as it sits in L1.
//!
//! A tile starts with a 16 byte header and stores its values as four 16x16 faces, row major
//! within a face and faces ordered top left, top right, bottom left, bottom right. Block float
//! formats put one shared exponent byte per 16 values right after the header.

use std::fmt::Write;

pub const TILE_HEIGHT: usize = 32;
pub const TILE_WIDTH: usize = 32;

const FACE_HEIGHT: usize = 16;
const FACE_WIDTH: usize = 16;
const HEADER_WORDS: usize = 4;
const EXP_SECTION_WORDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataFormat {
    Float32 = 0,
    Float16 = 1,
    Bfp8 = 2,
    Bfp4 = 3,
    Tf32 = 4,
    Float16B = 5,
    Bfp8B = 6,
    Bfp4B = 7,
    UInt16 = 9,
    Lf8 = 10,
    Bfp2 = 11,
    Int8 = 14,
    Bfp2B = 15,
}

impl TryFrom<u8> for DataFormat {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => DataFormat::Float32,
            1 => DataFormat::Float16,
            2 => DataFormat::Bfp8,
            3 => DataFormat::Bfp4,
            4 => DataFormat::Tf32,
            5 => DataFormat::Float16B,
            6 => DataFormat::Bfp8B,
            7 => DataFormat::Bfp4B,
            9 => DataFormat::UInt16,
            10 => DataFormat::Lf8,
            11 => DataFormat::Bfp2,
            14 => DataFormat::Int8,
            15 => DataFormat::Bfp2B,
            other => return Err(other),
        })
    }
}

impl DataFormat {
    /// Bits per value of the block float formats.
    fn block_float_bits(&self) -> Option<u32> {
        match self {
            DataFormat::Bfp8 | DataFormat::Bfp8B => Some(8),
            DataFormat::Bfp4 | DataFormat::Bfp4B => Some(4),
            DataFormat::Bfp2 | DataFormat::Bfp2B => Some(2),
            _ => None,
        }
    }

    /// The `a` variants carry 5 bit exponents biased by 15.
    fn has_short_exponent(&self) -> bool {
        matches!(
            self,
            DataFormat::Bfp8 | DataFormat::Bfp4 | DataFormat::Bfp2
        )
    }
}

fn field(word: u32, index: usize, bits: u32) -> u32 {
    (word >> (index as u32 * bits)) & ((1 << bits) - 1)
}

fn rebias(exp: u32, from: u32) -> u32 {
    exp.wrapping_sub(from).wrapping_add(127)
}

fn value_word(words: &[u32], index: usize, per_word: usize) -> Option<u32> {
    words.get(HEADER_WORDS + index / per_word).copied()
}

fn block_float(words: &[u32], index: usize, format: DataFormat, bits: u32) -> Option<u32> {
    let mut exp = field(
        *words.get(HEADER_WORDS + (index >> 6))?,
        (index >> 4) & 0x3,
        8,
    );

    let per_word = (32 / bits) as usize;
    let word = words.get(HEADER_WORDS + EXP_SECTION_WORDS + index / per_word)?;
    let value = field(*word, index % per_word, bits);

    let man_bits = bits - 1;
    let sign = value >> man_bits;
    let mut man = value & ((1 << man_bits) - 1);

    if man == 0 {
        exp = 0;
    } else {
        // Normalize so the leading one becomes the hidden bit.
        let mut shift = 0;
        while man & (1 << (man_bits - 1)) == 0 {
            man <<= 1;
            shift += 1;
        }
        man = (man << 1) & ((1 << man_bits) - 1);

        exp = exp.wrapping_sub(shift);
        if format.has_short_exponent() {
            exp = rebias(exp, 15);
        }
    }

    Some((sign << 31) | ((exp & 0xff) << 23) | (man << (23 - man_bits)))
}

/// The value at `index` as it would be stored in an f32 (or an i32 for the integer formats).
fn unpack(words: &[u32], index: usize, format: DataFormat) -> Option<u32> {
    if let Some(bits) = format.block_float_bits() {
        return block_float(words, index, format, bits);
    }

    let value = match format {
        DataFormat::Float16B => field(value_word(words, index, 2)?, index % 2, 16) << 16,
        DataFormat::Float16 => {
            let half = field(value_word(words, index, 2)?, index % 2, 16);
            let sign = (half & 0x8000) >> 15;
            let man = half & 0x3ff;
            let exp = match (half & 0x7c00) >> 10 {
                0 => 0,
                exp => rebias(exp, 15),
            };

            (sign << 31) | (exp << 23) | (man << 13)
        }
        DataFormat::Lf8 => {
            let byte = field(value_word(words, index, 4)?, index % 4, 8);
            let sign = (byte & 0x80) >> 7;
            let man = byte & 0x3;
            let exp = match (byte & 0x7c) >> 2 {
                0 => 0,
                exp => rebias(exp, 15),
            };

            (sign << 31) | (exp << 23) | (man << 21)
        }
        DataFormat::UInt16 => field(value_word(words, index, 2)?, index % 2, 16),
        DataFormat::Int8 => {
            // Sign and magnitude on the device.
            let byte = field(value_word(words, index, 4)?, index % 4, 8);
            let magnitude = byte & 0x7f;
            if byte & 0x80 != 0 {
                (magnitude as i32).wrapping_neg() as u32
            } else {
                magnitude
            }
        }
        _ => value_word(words, index, 1)?,
    };

    Some(value)
}

/// Render a tile read from the device, one line per row with every value as `{:8.4}`.
///
/// Returns None for a format that cannot be shown or when `data` is too short for the tile.
pub fn dump(data: &[u8], data_format: u8) -> Option<String> {
    let format = DataFormat::try_from(data_format).ok()?;

    let words = data
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<_>>();

    let mut tile = [[0f32; TILE_WIDTH]; TILE_HEIGHT];
    let faces_x = TILE_WIDTH / FACE_WIDTH;
    let faces_y = TILE_HEIGHT / FACE_HEIGHT;
    let face_size = FACE_HEIGHT * FACE_WIDTH;

    for face_row in 0..faces_y {
        for face_col in 0..faces_x {
            for i in 0..FACE_HEIGHT {
                for j in 0..FACE_WIDTH {
                    let index =
                        (face_row * faces_x + face_col) * face_size + i * FACE_WIDTH + j;
                    let raw = unpack(&words, index, format)?;

                    tile[face_row * FACE_HEIGHT + i][face_col * FACE_WIDTH + j] = match format {
                        DataFormat::Int8 | DataFormat::UInt16 => raw as i32 as f32,
                        _ => f32::from_bits(raw),
                    };
                }
            }
        }
    }

    let mut output = String::new();
    for row in tile.iter() {
        for value in row {
            let _ = write!(output, "{value:8.4} ");
        }
        output.push('\n');
    }

    Some(output)
}

#[cfg(test)]
mod test {
    use super::*;

    const VALUES: usize = TILE_HEIGHT * TILE_WIDTH;

    fn tile_of_words(values: impl Iterator<Item = u32>) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_WORDS * 4];
        for value in values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        data
    }

    fn cell(dump: &str, row: usize, col: usize) -> String {
        let line = dump.lines().nth(row).unwrap();
        line.split_whitespace().nth(col).unwrap().to_string()
    }

    #[test]
    fn unsupported_formats() {
        let data = tile_of_words((0..VALUES as u32).map(|_| 0));

        // Int32, UInt8 and the raw formats have no text form.
        for format in [8, 30, 0xf0, 0xf1, 0xf2, 0xff] {
            assert_eq!(dump(&data, format), None);
        }
        assert!(dump(&data, DataFormat::Float32 as u8).is_some());
    }

    #[test]
    fn short_data() {
        let data = tile_of_words((0..VALUES as u32 - 1).map(|_| 0));
        assert_eq!(dump(&data, DataFormat::Float32 as u8), None);
    }

    #[test]
    fn float32_faces() {
        let data = tile_of_words((0..VALUES as u32).map(|i| (i as f32).to_bits()));
        let text = dump(&data, DataFormat::Float32 as u8).unwrap();

        assert_eq!(text.lines().count(), TILE_HEIGHT);
        assert!(text.starts_with("  0.0000   1.0000   2.0000 "));
        assert!(text
            .lines()
            .all(|line| line.split_whitespace().count() == TILE_WIDTH));

        assert_eq!(cell(&text, 0, 15), "15.0000");
        // Top right face follows the whole top left one.
        assert_eq!(cell(&text, 0, 16), "256.0000");
        assert_eq!(cell(&text, 1, 0), "16.0000");
        assert_eq!(cell(&text, 16, 0), "512.0000");
        assert_eq!(cell(&text, 31, 31), "1023.0000");
    }

    #[test]
    fn half_precision() {
        // Two values per word, the first in the low half.
        let mut words = vec![0u32; VALUES / 2];
        words[0] = 0xc000_3c00;
        let text = dump(&tile_of_words(words.into_iter()), DataFormat::Float16 as u8).unwrap();
        assert!(text.starts_with("  1.0000  -2.0000   0.0000 "));

        let mut words = vec![0u32; VALUES / 2];
        words[0] = 0x4040_3f80;
        let text = dump(&tile_of_words(words.into_iter()), DataFormat::Float16B as u8).unwrap();
        assert!(text.starts_with("  1.0000   3.0000   0.0000 "));
    }

    #[test]
    fn block_float8() {
        let mut data = vec![0u8; HEADER_WORDS * 4];
        data.extend(std::iter::repeat(127).take(EXP_SECTION_WORDS * 4));
        let mut values = vec![0u8; VALUES];
        values[0] = 0x40;
        values[1] = 0xc0;
        values[2] = 0x20;
        values[3] = 0x60;
        data.extend_from_slice(&values);

        let text = dump(&data, DataFormat::Bfp8B as u8).unwrap();
        assert!(text.starts_with("  1.0000  -1.0000   0.5000   1.5000   0.0000 "));

        // Same bits with a 5 bit exponent of 15.
        for exp in &mut data[HEADER_WORDS * 4..(HEADER_WORDS + EXP_SECTION_WORDS) * 4] {
            *exp = 15;
        }
        let text = dump(&data, DataFormat::Bfp8 as u8).unwrap();
        assert!(text.starts_with("  1.0000  -1.0000   0.5000   1.5000   0.0000 "));
    }

    #[test]
    fn block_float4_shares_exponent_per_row_of_face() {
        let mut data = vec![0u8; HEADER_WORDS * 4];
        let mut exps = vec![127u8; EXP_SECTION_WORDS * 4];
        exps[1] = 128;
        data.extend_from_slice(&exps);
        // Every value is 0b0100, one with the hidden bit only.
        data.extend(std::iter::repeat(0x44).take(VALUES / 2));

        let text = dump(&data, DataFormat::Bfp4B as u8).unwrap();
        assert_eq!(cell(&text, 0, 0), "1.0000");
        assert_eq!(cell(&text, 1, 0), "2.0000");
        assert_eq!(cell(&text, 2, 5), "1.0000");
    }

    #[test]
    fn integers() {
        let mut words = vec![0u32; VALUES / 4];
        words[0] = 0x0000_0585;
        let text = dump(&tile_of_words(words.into_iter()), DataFormat::Int8 as u8).unwrap();
        assert!(text.starts_with(" -5.0000   5.0000   0.0000 "));

        let mut words = vec![0u32; VALUES / 2];
        words[0] = 0x0007_ffff;
        let text = dump(&tile_of_words(words.into_iter()), DataFormat::UInt16 as u8).unwrap();
        assert!(text.starts_with("65535.0000   7.0000 "));
    }
}
