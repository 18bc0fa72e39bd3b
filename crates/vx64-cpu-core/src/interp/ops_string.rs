use vx64_types::{Gpr, Width};
use vx64_x86::{Reg, RepMode, StringOp};

use super::alu::sub_with_flags;
use crate::error::Result;
use crate::mem::CpuBus;
use crate::state::{CpuState, RFlags};

/// Runs a string instruction, including its whole `rep` loop.
///
/// Each iteration commits RSI/RDI/RCX before the next one starts, so a fault part-way leaves the
/// registers describing the remaining work.
pub(super) fn exec<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    op: StringOp,
    width: Width,
    rep: RepMode,
    addr32: bool,
) -> Result<()> {
    let aw = if addr32 { Width::W32 } else { Width::W64 };
    let ptr = |gpr| Reg::new(gpr, aw);
    let step = width.bytes() as u64;
    let acc = Reg::new(Gpr::Rax, width);

    loop {
        if rep != RepMode::None && state.read_reg(ptr(Gpr::Rcx)) == 0 {
            break;
        }
        let delta = if state.flag(RFlags::DF) {
            step.wrapping_neg()
        } else {
            step
        };
        let si = state.read_reg(ptr(Gpr::Rsi));
        let di = state.read_reg(ptr(Gpr::Rdi));

        let mut advance_si = false;
        let mut advance_di = false;
        match op {
            StringOp::Movs => {
                let v = bus.read_sized(si, width.bytes())?;
                bus.write_sized(di, width.bytes(), v)?;
                advance_si = true;
                advance_di = true;
            }
            StringOp::Stos => {
                bus.write_sized(di, width.bytes(), state.read_reg(acc))?;
                advance_di = true;
            }
            StringOp::Lods => {
                let v = bus.read_sized(si, width.bytes())?;
                state.write_reg(acc, v);
                advance_si = true;
            }
            StringOp::Cmps => {
                let a = bus.read_sized(si, width.bytes())?;
                let b = bus.read_sized(di, width.bytes())?;
                let mut flags = state.flags();
                sub_with_flags(&mut flags, a, b, false, width);
                state.set_flags(flags);
                advance_si = true;
                advance_di = true;
            }
            StringOp::Scas => {
                let b = bus.read_sized(di, width.bytes())?;
                let mut flags = state.flags();
                sub_with_flags(&mut flags, state.read_reg(acc), b, false, width);
                state.set_flags(flags);
                advance_di = true;
            }
        }

        if advance_si {
            state.write_reg(ptr(Gpr::Rsi), si.wrapping_add(delta));
        }
        if advance_di {
            state.write_reg(ptr(Gpr::Rdi), di.wrapping_add(delta));
        }
        if rep == RepMode::None {
            break;
        }
        let count = state.read_reg(ptr(Gpr::Rcx)).wrapping_sub(1);
        state.write_reg(ptr(Gpr::Rcx), count);

        let zf = state.flag(RFlags::ZF);
        match rep {
            RepMode::Repe if !zf => break,
            RepMode::Repne if zf => break,
            _ => {}
        }
    }
    Ok(())
}
