use ember_x86::{decode_bytes, DecodeError, DecodeMode, MAX_INST_LEN};
use iced_x86::{Decoder, DecoderOptions};
use proptest::prelude::*;

fn inputs() -> impl Strategy<Value = (DecodeMode, Vec<u8>)> {
    let mode = prop_oneof![Just(DecodeMode::Bits16), Just(DecodeMode::Bits32)];
    (mode, proptest::collection::vec(any::<u8>(), 1..=20))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 4096,
        .. ProptestConfig::default()
    })]

    #[test]
    fn decode_never_panics_and_respects_length_limit((mode, bytes) in inputs()) {
        match decode_bytes(&bytes, mode) {
            Ok(inst) => {
                prop_assert!(inst.len >= 1);
                prop_assert!(usize::from(inst.len) <= MAX_INST_LEN);
                prop_assert!(usize::from(inst.len) <= bytes.len());
            }
            Err(DecodeError::Invalid | DecodeError::TooLong | DecodeError::Fetch(_)) => {}
        }
    }

    #[test]
    fn accepted_lengths_agree_with_iced((mode, bytes) in inputs()) {
        let bitness = match mode {
            DecodeMode::Bits16 => 16,
            DecodeMode::Bits32 => 32,
        };
        let mut decoder = Decoder::new(bitness, &bytes, DecoderOptions::NONE);
        let reference = decoder.decode();
        if let Ok(inst) = decode_bytes(&bytes, mode) {
            if !reference.is_invalid() {
                prop_assert_eq!(usize::from(inst.len), reference.len(), "bytes={:02x?}", bytes);
            }
        }
    }
}
