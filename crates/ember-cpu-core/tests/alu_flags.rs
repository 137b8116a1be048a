mod common;

use common::*;
use ember_cpu_core::state::{
    gpr, FLAGS_STATUS, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF,
};
use ember_cpu_core::StepOutcome;
use proptest::prelude::*;

/// Run one two-register instruction (`op eax, ebx`) and return (eax, status flags).
fn run(code: [u8; 2], a: u32, b: u32, carry_in: bool) -> (u32, u32) {
    let mut cpu = protected_mode(&code);
    cpu.state.gpr[gpr::EAX] = a;
    cpu.state.gpr[gpr::EBX] = b;
    cpu.state.set_flag(FLAG_CF, carry_in);
    assert_eq!(cpu.step().unwrap(), StepOutcome::Retired);
    (cpu.state.gpr[gpr::EAX], cpu.state.eflags & FLAGS_STATUS)
}

fn expected_flags(a: u32, b: u32, result: u32, carry: bool, overflow: bool) -> u32 {
    let mut flags = 0;
    if carry {
        flags |= FLAG_CF;
    }
    if overflow {
        flags |= FLAG_OF;
    }
    if result == 0 {
        flags |= FLAG_ZF;
    }
    if result & 0x8000_0000 != 0 {
        flags |= FLAG_SF;
    }
    if (result as u8).count_ones() % 2 == 0 {
        flags |= FLAG_PF;
    }
    if (a ^ b ^ result) & 0x10 != 0 {
        flags |= FLAG_AF;
    }
    flags
}

fn reference_add(a: u32, b: u32, carry_in: bool) -> (u32, u32) {
    let wide = u64::from(a) + u64::from(b) + u64::from(carry_in);
    let signed = i64::from(a as i32) + i64::from(b as i32) + i64::from(carry_in);
    let result = wide as u32;
    let overflow = signed != i64::from(result as i32);
    (result, expected_flags(a, b, result, wide > u64::from(u32::MAX), overflow))
}

fn reference_sub(a: u32, b: u32, borrow_in: bool) -> (u32, u32) {
    let wide = i64::from(a) - i64::from(b) - i64::from(borrow_in);
    let signed = i64::from(a as i32) - i64::from(b as i32) - i64::from(borrow_in);
    let result = wide as u32;
    let overflow = signed != i64::from(result as i32);
    (result, expected_flags(a, b, result, wide < 0, overflow))
}

const ADD: [u8; 2] = [0x01, 0xd8];
const ADC: [u8; 2] = [0x11, 0xd8];
const SUB: [u8; 2] = [0x29, 0xd8];
const SBB: [u8; 2] = [0x19, 0xd8];

#[test]
fn add_flag_fixtures() {
    let cases = [
        (0x7fff_ffff, 1, 0x8000_0000, FLAG_OF | FLAG_SF | FLAG_AF | FLAG_PF),
        (0xffff_ffff, 1, 0, FLAG_CF | FLAG_ZF | FLAG_AF | FLAG_PF),
        (0x8000_0000, 0x8000_0000, 0, FLAG_CF | FLAG_OF | FLAG_ZF | FLAG_PF),
        (1, 2, 3, FLAG_PF),
        (0x0f, 0x01, 0x10, FLAG_AF),
    ];
    for (a, b, result, flags) in cases {
        assert_eq!(run(ADD, a, b, false), (result, flags), "{a:#x} + {b:#x}");
    }
}

#[test]
fn sub_flag_fixtures() {
    let cases = [
        (0, 1, 0xffff_ffff, FLAG_CF | FLAG_SF | FLAG_AF | FLAG_PF),
        (0x8000_0000, 1, 0x7fff_ffff, FLAG_OF | FLAG_AF | FLAG_PF),
        (5, 5, 0, FLAG_ZF | FLAG_PF),
    ];
    for (a, b, result, flags) in cases {
        assert_eq!(run(SUB, a, b, false), (result, flags), "{a:#x} - {b:#x}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 1024,
        .. ProptestConfig::default()
    })]

    #[test]
    fn add_matches_wide_reference(a in any::<u32>(), b in any::<u32>()) {
        prop_assert_eq!(run(ADD, a, b, false), reference_add(a, b, false));
    }

    #[test]
    fn adc_matches_wide_reference(a in any::<u32>(), b in any::<u32>(), c in any::<bool>()) {
        prop_assert_eq!(run(ADC, a, b, c), reference_add(a, b, c));
    }

    #[test]
    fn sub_matches_wide_reference(a in any::<u32>(), b in any::<u32>()) {
        prop_assert_eq!(run(SUB, a, b, false), reference_sub(a, b, false));
    }

    #[test]
    fn sbb_matches_wide_reference(a in any::<u32>(), b in any::<u32>(), c in any::<bool>()) {
        prop_assert_eq!(run(SBB, a, b, c), reference_sub(a, b, c));
    }
}
