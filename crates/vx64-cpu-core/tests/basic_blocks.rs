use std::sync::Arc;

use vx64_cpu_core::{BasicBlock, CpuError, Engine, EngineConfig, IntrinsicTable, StepExit};
use vx64_mem::{Permissions, Segment, VirtualMemory};
use vx64_types::Gpr;

const CODE: u64 = 0x1000;
const DATA: u64 = 0x50_0000;

fn engine(code: &[u8], max_block_insts: usize) -> Engine {
    let mem = Arc::new(VirtualMemory::new());
    mem.map_with_data(Segment::new(CODE, CODE + 0x1000, Permissions::RX, "[code]"), code)
        .unwrap();
    mem.map(Segment::new(DATA, DATA + 0x1000, Permissions::RW, "[data]"))
        .unwrap();
    let mut engine = Engine::new(
        mem,
        EngineConfig {
            stack_size: 0x1000,
            max_block_insts,
            ..EngineConfig::default()
        },
    )
    .unwrap();
    engine.state_mut().set_rip(CODE);
    engine
}

#[test]
fn block_ends_at_first_branch() {
    // mov eax, 1; add eax, eax; jmp $; nop
    let mut e = engine(&[0xb8, 1, 0, 0, 0, 0x01, 0xc0, 0xeb, 0xfe, 0x90], 64);
    let block = e.decode_block().unwrap();
    assert_eq!(block.start(), CODE);
    assert_eq!(block.len(), 3);
    assert_eq!(block.end(), CODE + 9);
    assert!(block.insts().iter().all(|i| !i.is_bound()));
}

#[test]
fn block_respects_length_limit() {
    let mut e = engine(&[0x90; 32], 4);
    let block = e.decode_block().unwrap();
    assert_eq!(block.len(), 4);
    assert_eq!(block.end(), CODE + 4);
}

#[test]
fn reexecution_reuses_bindings_with_live_registers() {
    // l: mov [rdi], eax; add rdi, 4; inc eax; dec ecx; jnz l; hlt
    let code = [
        0x89, 0x07, // mov [rdi], eax
        0x48, 0x83, 0xc7, 0x04, // add rdi, 4
        0xff, 0xc0, // inc eax
        0xff, 0xc9, // dec ecx
        0x75, 0xf4, // jnz l
        0xf4,
    ];
    let mut e = engine(&code, 64);
    let s = e.state_mut();
    s.set_gpr(Gpr::Rdi, DATA);
    s.set_gpr(Gpr::Rcx, 3);
    s.set_gpr(Gpr::Rax, 10);

    let mut block = e.decode_block().unwrap();
    assert_eq!(block.len(), 5);

    let mut runs = 0;
    loop {
        let exit = e.run_block(&mut block).unwrap();
        assert_eq!(exit.exit, StepExit::Continue);
        assert_eq!(exit.executed, 5);
        assert!(block.insts().iter().all(|i| i.is_bound()));
        runs += 1;
        if e.state().rip() != block.start() {
            break;
        }
    }
    assert_eq!(runs, 3);
    for i in 0..3 {
        assert_eq!(e.memory().read_u32(DATA + i * 4).unwrap(), 10 + i as u32);
    }
    assert_eq!(e.state().rip(), CODE + 12);
    assert_eq!(e.step().unwrap(), StepExit::Halted);
}

#[test]
fn fault_inside_block_reports_progress_via_rip() {
    // inc eax; mov eax, [0]; inc eax
    let code = [0xff, 0xc0, 0x8b, 0x04, 0x25, 0, 0, 0, 0, 0xff, 0xc0];
    let mut e = engine(&code, 64);
    let mut block = e.decode_block().unwrap();
    let err = e.run_block(&mut block).unwrap_err();
    assert!(matches!(err, CpuError::Memory(_)));
    assert_eq!(e.state().rip(), CODE + 2);
    assert_eq!(e.state().gpr(Gpr::Rax), 1);
}

#[test]
fn decode_error_truncates_later_block() {
    let mem = VirtualMemory::new();
    // nop; nop; <unsupported 0F 0F>
    mem.map_with_data(
        Segment::new(CODE, CODE + 0x1000, Permissions::RX, "[code]"),
        &[0x90, 0x90, 0x0f, 0x0f, 0xc0, 0x00],
    )
    .unwrap();
    let mut bus = &mem;
    let intrinsics = IntrinsicTable::new();

    let block = BasicBlock::decode(&mut bus, CODE, &intrinsics, 64).unwrap();
    assert_eq!(block.len(), 2);

    let err = BasicBlock::decode(&mut bus, CODE + 2, &intrinsics, 64).unwrap_err();
    assert!(matches!(err, CpuError::Decode(_)));
}
