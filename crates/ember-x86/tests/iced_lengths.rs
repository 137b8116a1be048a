//! Cross-check instruction lengths against iced-x86 for encodings both
//! decoders accept.

use ember_x86::{decode_bytes, DecodeMode};
use iced_x86::{Decoder, DecoderOptions};

fn iced_len(bytes: &[u8], bitness: u32) -> Option<usize> {
    let mut decoder = Decoder::new(bitness, bytes, DecoderOptions::NONE);
    let instr = decoder.decode();
    (!instr.is_invalid()).then(|| instr.len())
}

fn bitness(mode: DecodeMode) -> u32 {
    match mode {
        DecodeMode::Bits16 => 16,
        DecodeMode::Bits32 => 32,
    }
}

const CORPUS: &[&[u8]] = &[
    &[0x00, 0xc0],
    &[0x01, 0x44, 0x24, 0x08],
    &[0x03, 0x84, 0x88, 0x00, 0x10, 0x00, 0x00],
    &[0x05, 0x78, 0x56, 0x34, 0x12],
    &[0x0f, 0x01, 0x15, 0x00, 0x20, 0x00, 0x00],
    &[0x0f, 0x20, 0xc0],
    &[0x0f, 0x22, 0xd8],
    &[0x0f, 0x84, 0x10, 0x00, 0x00, 0x00],
    &[0x0f, 0xa4, 0xc8, 0x04],
    &[0x0f, 0xb6, 0x45, 0xfc],
    &[0x0f, 0xba, 0x28, 0x05],
    &[0x0f, 0xc7, 0x0e],
    &[0x0f, 0xc9],
    &[0x26, 0x8a, 0x07],
    &[0x67, 0x0f, 0x01, 0x1e, 0x34, 0x12],
    &[0x66, 0x89, 0xc8],
    &[0x66, 0xea, 0x00, 0x7c, 0x00, 0x00],
    &[0x67, 0x8b, 0x46, 0x02],
    &[0x67, 0xa1, 0x34, 0x12],
    &[0x69, 0xc0, 0x10, 0x27, 0x00, 0x00],
    &[0x6b, 0xc0, 0x0a],
    &[0x80, 0x3d, 0x00, 0x10, 0x00, 0x00, 0x01],
    &[0x81, 0xc4, 0x00, 0x01, 0x00, 0x00],
    &[0x8c, 0xd8],
    &[0x8d, 0x04, 0x40],
    &[0x8e, 0xd0],
    &[0x9a, 0x00, 0x10, 0x00, 0x00, 0x08, 0x00],
    &[0xa1, 0x00, 0x00, 0x01, 0x00],
    &[0xc1, 0xe0, 0x04],
    &[0xc2, 0x08, 0x00],
    &[0xc6, 0x05, 0x00, 0x10, 0x00, 0x00, 0x7f],
    &[0xc7, 0x44, 0x24, 0x04, 0x01, 0x00, 0x00, 0x00],
    &[0xc8, 0x10, 0x00, 0x01],
    &[0xcd, 0x80],
    &[0xd9, 0xc0],
    &[0xdd, 0x05, 0x00, 0x10, 0x00, 0x00],
    &[0xe2, 0xfe],
    &[0xe8, 0x00, 0x00, 0x00, 0x00],
    &[0xf0, 0x0f, 0xb1, 0x0b],
    &[0xf3, 0xa5],
    &[0xf6, 0x05, 0x00, 0x10, 0x00, 0x00, 0x80],
    &[0xf7, 0xf1],
    &[0xff, 0x15, 0x00, 0x20, 0x00, 0x00],
    &[0xff, 0x2d, 0x00, 0x20, 0x00, 0x00],
];

#[test]
fn corpus_lengths_match_iced() {
    for mode in [DecodeMode::Bits16, DecodeMode::Bits32] {
        for bytes in CORPUS {
            let ours = decode_bytes(bytes, mode);
            let theirs = iced_len(bytes, bitness(mode));
            if let (Ok(inst), Some(len)) = (ours, theirs) {
                assert_eq!(
                    usize::from(inst.len),
                    len,
                    "mode={mode:?} bytes={bytes:02x?}"
                );
            }
        }
    }
}

#[test]
fn corpus_decodes_in_32_bit_mode() {
    for bytes in CORPUS {
        let inst = decode_bytes(bytes, DecodeMode::Bits32)
            .unwrap_or_else(|e| panic!("{bytes:02x?}: {e:?}"));
        assert_eq!(usize::from(inst.len), bytes.len(), "{bytes:02x?}");
    }
}
