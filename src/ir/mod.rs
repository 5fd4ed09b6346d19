//! The SSA register IR the allocator works on
//!
//! A `Method` is a list of blocks in linear order. Values are defined once,
//! either by an instruction or by a phi at a block head. Instructions are
//! numbered with gaps of `INSTRUCTION_NUMBER_DELTA` so that moves can be
//! placed between them.

mod builder;
mod code;
mod instr;
mod value;

pub use builder::MethodBuilder;
pub use code::{BasicBlock, Method, Phi, INSTRUCTION_NUMBER_DELTA};
pub use instr::{BinOp, BlockId, IfCond, Instruction, Opcode};
pub use value::{ConstNumber, MoveType, Value, ValueId, ValueKind};
