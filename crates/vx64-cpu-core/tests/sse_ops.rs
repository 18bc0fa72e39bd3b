use std::sync::Arc;

use vx64_cpu_core::{BatchExit, Engine, EngineConfig, RFlags, Repr};
use vx64_mem::{Permissions, Segment, VirtualMemory};
use vx64_types::Gpr;

const CODE: u64 = 0x1000;
const DATA: u64 = 0x60_0000;

/// Runs `code` followed by `hlt` after `setup` has seeded the state.
fn run(code: &[u8], setup: impl FnOnce(&mut Engine)) -> Engine {
    let mut bytes = code.to_vec();
    bytes.push(0xf4);
    let mem = Arc::new(VirtualMemory::new());
    mem.map_with_data(Segment::new(CODE, CODE + 0x1000, Permissions::RX, "[code]"), &bytes)
        .unwrap();
    mem.map(Segment::new(DATA, DATA + 0x1000, Permissions::RW, "[data]"))
        .unwrap();
    let mut e = Engine::new(
        mem,
        EngineConfig {
            stack_size: 0x1000,
            ..EngineConfig::default()
        },
    )
    .unwrap();
    e.state_mut().set_rip(CODE);
    setup(&mut e);
    let res = e.run(100);
    assert_eq!(res.exit, BatchExit::Halted, "{res:?}");
    e
}

fn xmm(e: &mut Engine, i: usize) -> u128 {
    e.state_mut().vec_mut(i).xmm()
}

fn set_xmm(e: &mut Engine, i: usize, v: u128) {
    e.state_mut().vec_mut(i).set_xmm(v);
}

const HIGH: u128 = 0xdead_beef_0000_1111_2222_3333_4444_5555;

#[test]
fn movss_register_form_replaces_lane_zero() {
    // movss xmm0, xmm1
    let mut e = run(&[0xf3, 0x0f, 0x10, 0xc1], |e| {
        set_xmm(e, 0, HIGH);
        e.state_mut().vec_mut(1).set_f32(1.0);
    });
    assert_eq!(e.state_mut().vec_mut(0).repr(), Repr::F32(1.0));
    assert_eq!(xmm(&mut e, 0), (HIGH & !0xffff_ffff) | 0x3f80_0000);
}

#[test]
fn addss_keeps_scalar_cached() {
    // addss xmm0, xmm1; addss xmm0, xmm1
    let mut e = run(&[0xf3, 0x0f, 0x58, 0xc1, 0xf3, 0x0f, 0x58, 0xc1], |e| {
        set_xmm(e, 0, (HIGH & !0xffff_ffff) | u128::from(1.5f32.to_bits()));
        e.state_mut().vec_mut(1).set_f32(2.25);
    });
    assert_eq!(e.state_mut().vec_mut(0).repr(), Repr::F32(6.0));
    assert_eq!(xmm(&mut e, 0) >> 32, HIGH >> 32);
}

#[test]
fn movaps_store() {
    // movaps [rdi], xmm0
    let e = run(&[0x0f, 0x29, 0x07], |e| {
        set_xmm(e, 0, HIGH);
        e.state_mut().set_gpr(Gpr::Rdi, DATA + 0x20);
    });
    assert_eq!(e.memory().read_u64(DATA + 0x20).unwrap(), HIGH as u64);
    assert_eq!(e.memory().read_u64(DATA + 0x28).unwrap(), (HIGH >> 64) as u64);
}

#[test]
fn paddq_wraps_each_lane() {
    // paddq xmm0, xmm1
    let mut e = run(&[0x66, 0x0f, 0xd4, 0xc1], |e| {
        set_xmm(e, 0, (5u128 << 64) | u128::from(u64::MAX));
        set_xmm(e, 1, (7u128 << 64) | 2);
    });
    assert_eq!(xmm(&mut e, 0), (12u128 << 64) | 1);
}

#[test]
fn pcmpeqb_then_pmovmskb() {
    // pcmpeqb xmm0, xmm1; pmovmskb eax, xmm0
    let a = u128::from_le_bytes(*b"abcdefghijklmnop");
    let b = u128::from_le_bytes(*b"abXdefghijklmnoZ");
    let e = run(&[0x66, 0x0f, 0x74, 0xc1, 0x66, 0x0f, 0xd7, 0xc0], |e| {
        set_xmm(e, 0, a);
        set_xmm(e, 1, b);
        e.state_mut().set_gpr(Gpr::Rax, u64::MAX);
    });
    assert_eq!(e.state().gpr(Gpr::Rax), 0x7ffb);
}

#[test]
fn psrlw_immediate() {
    // psrlw xmm0, 3
    let mut e = run(&[0x66, 0x0f, 0x71, 0xd0, 0x03], |e| {
        set_xmm(e, 0, 0x8000_0010_ffff);
    });
    assert_eq!(xmm(&mut e, 0), 0x1000_0002_1fff);
}

#[test]
fn comiss_flags() {
    // comiss xmm0, xmm1
    let code = [0x0f, 0x2f, 0xc1];
    let cases = [
        (1.0f32, 2.0f32, (false, false, true)),
        (2.0, 1.0, (false, false, false)),
        (3.0, 3.0, (true, false, false)),
        (f32::NAN, 1.0, (true, true, true)),
    ];
    for (a, b, (zf, pf, cf)) in cases {
        let e = run(&code, |e| {
            e.state_mut().vec_mut(0).set_f32(a);
            e.state_mut().vec_mut(1).set_f32(b);
            e.state_mut().set_flag(RFlags::OF, true);
        });
        let s = e.state();
        assert_eq!(s.flag(RFlags::ZF), zf, "{a} vs {b}");
        assert_eq!(s.flag(RFlags::PF), pf, "{a} vs {b}");
        assert_eq!(s.flag(RFlags::CF), cf, "{a} vs {b}");
        assert!(!s.flag(RFlags::OF));
    }
}

#[test]
fn integer_conversions() {
    // cvttsd2si rax, xmm0
    let trunc = [0xf2, 0x48, 0x0f, 0x2c, 0xc0];
    for (v, want) in [
        (2.9f64, 2u64),
        (-2.9, (-2i64) as u64),
        (f64::NAN, 0x8000_0000_0000_0000),
        (1e300, 0x8000_0000_0000_0000),
    ] {
        let e = run(&trunc, |e| e.state_mut().vec_mut(0).set_f64(v));
        assert_eq!(e.state().gpr(Gpr::Rax), want, "{v}");
    }

    // cvtsi2sd xmm0, rax
    let mut e = run(&[0xf2, 0x48, 0x0f, 0x2a, 0xc0], |e| {
        set_xmm(e, 0, HIGH);
        e.state_mut().set_gpr(Gpr::Rax, (-5i64) as u64);
    });
    assert_eq!(e.state_mut().vec_mut(0).f64(), -5.0);
    assert_eq!(xmm(&mut e, 0) >> 64, HIGH >> 64);
}

#[test]
fn vex128_zeroes_upper_bits_legacy_preserves() {
    let ones = [u128::MAX; 4];

    // vpaddq xmm0, xmm0, xmm1
    let mut e = run(&[0xc5, 0xf9, 0xd4, 0xc1], |e| {
        e.state_mut().vec_mut(0).set_zmm(ones);
        set_xmm(e, 1, 1);
    });
    assert_eq!(
        e.state_mut().vec_mut(0).zmm(),
        [u128::MAX << 64, 0, 0, 0]
    );

    // paddq xmm0, xmm1
    let mut e = run(&[0x66, 0x0f, 0xd4, 0xc1], |e| {
        e.state_mut().vec_mut(0).set_zmm(ones);
        set_xmm(e, 1, 1);
    });
    assert_eq!(
        e.state_mut().vec_mut(0).zmm(),
        [u128::MAX << 64, u128::MAX, u128::MAX, u128::MAX]
    );
}

#[test]
fn ymm_load_store_and_vzeroupper() {
    // vmovdqu ymm0, [rsi]; vmovdqu [rdi], ymm0; vpxor ymm2, ymm2, ymm2; vzeroupper
    let code = [
        0xc5, 0xfe, 0x6f, 0x06, //
        0xc5, 0xfe, 0x7f, 0x07, //
        0xc5, 0xed, 0xef, 0xd2, //
        0xc5, 0xf8, 0x77,
    ];
    let src: Vec<u8> = (1..=32).collect();
    let mut e = run(&code, |e| {
        e.memory().write_bytes(DATA, &src).unwrap();
        e.state_mut().set_gpr(Gpr::Rsi, DATA);
        e.state_mut().set_gpr(Gpr::Rdi, DATA + 0x100);
        e.state_mut().vec_mut(2).set_zmm([u128::MAX; 4]);
    });

    let mut out = [0u8; 32];
    e.memory().read_bytes(DATA + 0x100, &mut out).unwrap();
    assert_eq!(&out[..], &src[..]);

    let lo = u128::from_le_bytes(src[..16].try_into().unwrap());
    assert_eq!(e.state_mut().vec_mut(0).zmm(), [lo, 0, 0, 0]);
    assert_eq!(e.state_mut().vec_mut(2).zmm(), [0; 4]);
}
