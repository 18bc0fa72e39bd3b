use std::sync::Arc;

use vx64_cpu_core::{BatchExit, CpuError, CpuState, Engine, EngineConfig, RFlags, StepExit};
use vx64_mem::{MemoryError, Permissions, Segment, VirtualMemory};
use vx64_types::Gpr;

const CODE: u64 = 0x1000;
const DATA: u64 = 0x10_0000;

fn engine(code: &[u8]) -> Engine {
    let mem = Arc::new(VirtualMemory::new());
    mem.map_with_data(Segment::new(CODE, CODE + 0x1000, Permissions::RX, "[code]"), code)
        .unwrap();
    mem.map(Segment::new(DATA, DATA + 0x1000, Permissions::RW, "[data]"))
        .unwrap();
    let config = EngineConfig {
        stack_address: 0x80_0000,
        stack_size: 0x4000,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(mem, config).unwrap();
    engine.state_mut().set_rip(CODE);
    engine
}

#[test]
fn inc_byte_0x7f() {
    // inc al; hlt
    let mut e = engine(&[0xfe, 0xc0, 0xf4]);
    e.state_mut().set_gpr(Gpr::Rax, 0x7f);
    e.state_mut().set_flag(RFlags::CF, true);

    let res = e.run(10);
    assert_eq!(res.exit, BatchExit::Halted);
    assert_eq!(res.executed, 2);

    let s = e.state();
    assert_eq!(s.gpr(Gpr::Rax), 0x80);
    assert!(s.flag(RFlags::OF));
    assert!(s.flag(RFlags::SF));
    assert!(!s.flag(RFlags::ZF));
    assert!(s.flag(RFlags::AF));
    assert!(!s.flag(RFlags::PF));
    assert!(s.flag(RFlags::CF));
    assert_eq!(s.rip(), CODE + 3);
}

#[test]
fn countdown_loop_runs_through_branches() {
    // mov ecx, 5; l: dec ecx; jnz l; hlt
    let mut e = engine(&[0xb9, 5, 0, 0, 0, 0xff, 0xc9, 0x75, 0xfc, 0xf4]);
    let res = e.run(100);
    assert_eq!(res.exit, BatchExit::Halted);
    assert_eq!(res.executed, 1 + 5 * 2 + 1);
    assert_eq!(e.state().gpr(Gpr::Rcx), 0);
    assert!(e.state().flag(RFlags::ZF));
}

#[test]
fn batch_limit_completes() {
    let mut e = engine(&[0x90; 16]);
    let res = e.run(4);
    assert_eq!(res.exit, BatchExit::Completed);
    assert_eq!(res.executed, 4);
    assert_eq!(e.state().rip(), CODE + 4);
}

#[test]
fn call_and_ret_use_the_stack() {
    // call +1; hlt; ret
    let mut e = engine(&[0xe8, 1, 0, 0, 0, 0xf4, 0xc3]);
    let rsp = e.state().gpr(Gpr::Rsp);
    assert_eq!(e.step().unwrap(), StepExit::Continue);
    assert_eq!(e.state().rip(), CODE + 6);
    assert_eq!(e.state().gpr(Gpr::Rsp), rsp - 8);
    assert_eq!(e.memory().read_u64(rsp - 8).unwrap(), CODE + 5);

    let res = e.run(10);
    assert_eq!(res.exit, BatchExit::Halted);
    assert_eq!(e.state().gpr(Gpr::Rsp), rsp);
    assert_eq!(e.state().rip(), CODE + 6);
}

#[test]
fn push_pop_round_trip() {
    // push rbx; pop rcx; push 0x-2 (imm8); pop rdx; hlt
    let mut e = engine(&[0x53, 0x59, 0x6a, 0xfe, 0x5a, 0xf4]);
    e.state_mut().set_gpr(Gpr::Rbx, 0xdead_beef_cafe);
    e.run(10);
    assert_eq!(e.state().gpr(Gpr::Rcx), 0xdead_beef_cafe);
    assert_eq!(e.state().gpr(Gpr::Rdx), (-2i64) as u64);
}

#[test]
fn cmov_false_still_zero_extends() {
    // cmp eax, eax; cmovne eax, ebx; hlt
    let mut e = engine(&[0x39, 0xc0, 0x0f, 0x45, 0xc3, 0xf4]);
    e.state_mut().set_gpr(Gpr::Rax, u64::MAX);
    e.state_mut().set_gpr(Gpr::Rbx, 7);
    e.run(10);
    assert_eq!(e.state().gpr(Gpr::Rax), 0xffff_ffff);
}

#[test]
fn wide_multiply_sets_carry() {
    // mul rbx; hlt
    let mut e = engine(&[0x48, 0xf7, 0xe3, 0xf4]);
    e.state_mut().set_gpr(Gpr::Rax, u64::MAX);
    e.state_mut().set_gpr(Gpr::Rbx, 2);
    e.run(10);
    let s = e.state();
    assert_eq!(s.gpr(Gpr::Rax), u64::MAX - 1);
    assert_eq!(s.gpr(Gpr::Rdx), 1);
    assert!(s.flag(RFlags::CF) && s.flag(RFlags::OF));
}

#[test]
fn signed_divide() {
    // cqo; idiv rbx; hlt
    let mut e = engine(&[0x48, 0x99, 0x48, 0xf7, 0xfb, 0xf4]);
    e.state_mut().set_gpr(Gpr::Rax, (-7i64) as u64);
    e.state_mut().set_gpr(Gpr::Rbx, 2);
    e.run(10);
    assert_eq!(e.state().gpr(Gpr::Rax), (-3i64) as u64);
    assert_eq!(e.state().gpr(Gpr::Rdx), (-1i64) as u64);
}

#[test]
fn divide_by_zero_faults_in_place() {
    // nop; div ebx
    let mut e = engine(&[0x90, 0xf7, 0xf3]);
    let res = e.run(10);
    assert_eq!(res.executed, 1);
    assert_eq!(
        res.exit,
        BatchExit::Fault(CpuError::DivideError { rip: CODE + 1 })
    );
    assert_eq!(e.state().rip(), CODE + 1);
}

#[test]
fn quotient_overflow_faults() {
    // div bl with AX = 0x1000, BL = 2
    let mut e = engine(&[0xf6, 0xf3]);
    e.state_mut().set_gpr(Gpr::Rax, 0x1000);
    e.state_mut().set_gpr(Gpr::Rbx, 2);
    assert_eq!(e.step(), Err(CpuError::DivideError { rip: CODE }));
    assert_eq!(e.state().gpr(Gpr::Rax), 0x1000);
}

#[test]
fn signed_min_by_minus_one_faults_at_every_width() {
    // (code, rdx, rax) with the divisor register (rcx) all ones.
    let cases: [(&[u8], u64, u64); 4] = [
        (&[0xf6, 0xf9], 0, 0x8000), // idiv cl
        (&[0x66, 0xf7, 0xf9], 0x8000, 0), // idiv cx
        (&[0xf7, 0xf9], 0x8000_0000, 0), // idiv ecx
        (&[0x48, 0xf7, 0xf9], 0x8000_0000_0000_0000, 0), // idiv rcx
    ];
    for (code, rdx, rax) in cases {
        let mut e = engine(code);
        e.state_mut().set_gpr(Gpr::Rdx, rdx);
        e.state_mut().set_gpr(Gpr::Rax, rax);
        e.state_mut().set_gpr(Gpr::Rcx, u64::MAX);

        let res = e.run(10);
        assert_eq!(
            res.exit,
            BatchExit::Fault(CpuError::DivideError { rip: CODE }),
            "{code:02x?}"
        );
        assert_eq!(res.executed, 0);
        assert_eq!(e.state().rip(), CODE);
        assert_eq!(e.state().gpr(Gpr::Rax), rax);
        assert_eq!(e.state().gpr(Gpr::Rdx), rdx);
    }
}

#[test]
fn idiv_rounds_toward_zero() {
    // idiv rcx with RDX:RAX = -7, RCX = 2
    let mut e = engine(&[0x48, 0xf7, 0xf9]);
    e.state_mut().set_gpr(Gpr::Rdx, u64::MAX);
    e.state_mut().set_gpr(Gpr::Rax, -7i64 as u64);
    e.state_mut().set_gpr(Gpr::Rcx, 2);
    assert_eq!(e.step(), Ok(StepExit::Continue));
    assert_eq!(e.state().gpr(Gpr::Rax), -3i64 as u64);
    assert_eq!(e.state().gpr(Gpr::Rdx), -1i64 as u64);
}

#[test]
fn ud2_and_syscall_exits() {
    let mut e = engine(&[0x0f, 0x05, 0x0f, 0x0b]);
    let res = e.run(10);
    assert_eq!(res.exit, BatchExit::Syscall);
    assert_eq!(res.executed, 1);
    assert_eq!(e.state().rip(), CODE + 2);

    let res = e.run(10);
    assert_eq!(
        res.exit,
        BatchExit::Fault(CpuError::InvalidOpcode { rip: CODE + 2 })
    );
    assert_eq!(e.state().rip(), CODE + 2);
}

#[test]
fn memory_fault_leaves_state_untouched() {
    // mov [0], rax
    let mut e = engine(&[0x48, 0x89, 0x04, 0x25, 0, 0, 0, 0]);
    let before = e.state().clone();
    let err = e.step().unwrap_err();
    assert!(matches!(
        err,
        CpuError::Memory(MemoryError::SegmentationFault { addr: 0, .. })
    ));
    assert_eq!(e.state(), &before);
}

#[test]
fn writes_to_code_are_access_violations() {
    // mov byte [rip-7], 0  (targets its own first byte)
    let mut e = engine(&[0xc6, 0x05, 0xf9, 0xff, 0xff, 0xff, 0x00]);
    let err = e.step().unwrap_err();
    assert!(matches!(
        err,
        CpuError::Memory(MemoryError::AccessViolation { addr: CODE, .. })
    ));
}

#[test]
fn fs_relative_load() {
    // mov rax, fs:[0x10]; hlt
    let mut e = engine(&[0x64, 0x48, 0x8b, 0x04, 0x25, 0x10, 0, 0, 0, 0xf4]);
    e.memory().write_u64(DATA + 0x10, 0x1122_3344).unwrap();
    e.state_mut().set_fs_base(DATA);
    e.run(10);
    assert_eq!(e.state().gpr(Gpr::Rax), 0x1122_3344);
}

#[test]
fn shift_by_zero_keeps_flags() {
    // stc; shl eax, cl (cl = 32 masks to 0); hlt
    let mut e = engine(&[0xf9, 0xd3, 0xe0, 0xf4]);
    e.state_mut().set_gpr(Gpr::Rax, 0xffff_ffff_0000_0001);
    e.state_mut().set_gpr(Gpr::Rcx, 32);
    e.run(10);
    assert!(e.state().flag(RFlags::CF));
    // The 32-bit write still zero-extends.
    assert_eq!(e.state().gpr(Gpr::Rax), 1);
}

#[test]
fn unmapped_rip_is_a_fetch_fault() {
    let mut e = engine(&[]);
    e.state_mut().set_rip(0xdead_0000);
    assert!(matches!(
        e.step(),
        Err(CpuError::Memory(MemoryError::SegmentationFault { addr: 0xdead_0000, .. }))
    ));
}

#[test]
fn snapshot_reflects_execution() {
    // mov ebx, 0x2a; hlt
    let mut e = engine(&[0xbb, 0x2a, 0, 0, 0, 0xf4]);
    e.run(10);
    let snap = e.state_mut().snapshot();
    assert_eq!(snap.gpr(Gpr::Rbx), 0x2a);
    assert_eq!(snap.rip, CODE + 6);
    assert_eq!(snap.rflags & 0x2, 0x2);
}

#[test]
fn contexts_share_one_address_space() {
    // push rdi; pop rax; mov [rsi], eax; hlt
    let code = [0x57, 0x58, 0x89, 0x06, 0xf4];
    let mut first = engine(&code);
    let mem = Arc::clone(first.memory());

    // A second stack at the same address collides with the first.
    let clash = Engine::new(
        Arc::clone(&mem),
        EngineConfig {
            stack_address: 0x80_0000,
            stack_size: 0x4000,
            ..EngineConfig::default()
        },
    );
    assert!(matches!(
        clash,
        Err(CpuError::Memory(MemoryError::Overlap { .. }))
    ));

    let stack = mem.allocate(0x4000, "[stack:2]").unwrap();
    let mut state = CpuState::new();
    state.set_gpr(Gpr::Rsp, stack.end - 16);
    state.set_rip(CODE);
    let mut second = Engine::with_state(Arc::clone(&mem), state, EngineConfig::default());

    first.state_mut().set_gpr(Gpr::Rdi, 1);
    first.state_mut().set_gpr(Gpr::Rsi, DATA);
    second.state_mut().set_gpr(Gpr::Rdi, 2);
    second.state_mut().set_gpr(Gpr::Rsi, DATA + 4);

    assert_eq!(first.run(10).exit, BatchExit::Halted);
    assert_eq!(second.run(10).exit, BatchExit::Halted);
    assert_eq!(mem.read_u32(DATA).unwrap(), 1);
    assert_eq!(mem.read_u32(DATA + 4).unwrap(), 2);
    assert_eq!(second.state().gpr(Gpr::Rsp), stack.end - 16);
}
