#![forbid(unsafe_code)]

//! x86-64 instruction decoding.
//!
//! [`decode`] turns up to 15 bytes at a guest address into an immutable [`Instruction`]: the raw
//! bytes, the length and an [`InstKind`] carrying operand descriptors. Descriptors name registers
//! and addressing expressions only; binding them to a CPU happens in the interpreter.

mod decoder;
mod error;
mod inst;
mod operand;

pub use decoder::decode;
pub use error::{DecodeError, DecodeErrorKind, RawBytes, MAX_INST_LEN};
pub use inst::{
    AluOp, FlagOp, InstKind, Instruction, IntrinsicId, MulDivOp, RepMode, ShiftCount, ShiftOp,
    SseOp, StringOp, VexOp,
};
pub use operand::{Address, Operand, Reg, SegOverride, VecReg, VecSize};
pub use vx64_types::{Cond, Gpr, Width};
