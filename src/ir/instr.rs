//! Instructions of the register IR

use std::fmt::{Display, Error, Formatter};

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

use super::{ConstNumber, Method, MoveType, ValueId};

/// Handle of a block, an index into `Method::blocks`.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
  #[inline]
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl Display for BlockId {
  fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
    write!(fmt, "block{}", self.0)
  }
}

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, AsRefStr, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "kebab-case")]
pub enum BinOp {
  Add,
  Sub,
  Mul,
  Div,
  Rem,
  And,
  Or,
  Xor,
  Shl,
  Shr,
  Ushr,
  Cmp,
}

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, AsRefStr, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IfCond {
  Eq,
  Ne,
  Lt,
  Ge,
  Gt,
  Le,
}

#[derive(Debug, Clone, PartialEq, Eq, EnumAsInner, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
  /// Incoming argument, arrives in a fixed register.
  Argument { register: u32 },
  Const(ConstNumber),
  Move,
  Binop(BinOp),
  /// Call to a named method, the result (if any) is the `out` value.
  Invoke(String),
  Return,
  Goto(BlockId),
  If {
    cond: IfCond,
    target: BlockId,
    fallthrough: BlockId,
  },
  /// Register to register move inserted by the allocator. Has no values,
  /// only registers.
  #[serde(rename = "fixed-move")]
  FixedMove(MoveType),
}

/// One instruction. `out` and `ins` name SSA values; after allocation
/// `out_register` and `in_registers` hold the registers they were assigned
/// (the low register of a pair for wide values).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
  #[serde(default)]
  pub number: u32,
  pub op: Opcode,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub out: Option<ValueId>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub ins: Vec<ValueId>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub out_register: Option<u32>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub in_registers: Vec<u32>,
}

impl Instruction {
  pub fn new(op: Opcode, out: Option<ValueId>, ins: Vec<ValueId>) -> Self {
    Instruction {
      number: 0,
      op,
      out,
      ins,
      out_register: None,
      in_registers: vec![],
    }
  }

  /// A move between registers, as emitted by the move scheduler.
  pub fn fixed_move(ty: MoveType, dst: u32, src: u32) -> Self {
    Instruction {
      number: 0,
      op: Opcode::FixedMove(ty),
      out: None,
      ins: vec![],
      out_register: Some(dst),
      in_registers: vec![src],
    }
  }

  /// A const instruction writing straight into a register, used to
  /// rematerialize constants.
  pub fn fixed_const(dst: u32, number: ConstNumber) -> Self {
    Instruction {
      number: 0,
      op: Opcode::Const(number),
      out: None,
      ins: vec![],
      out_register: Some(dst),
      in_registers: vec![],
    }
  }

  pub fn is_terminator(&self) -> bool {
    matches!(self.op, Opcode::Return | Opcode::Goto(_) | Opcode::If { .. })
  }

  /// True for the instructions the allocator inserts.
  pub fn is_allocator_move(&self) -> bool {
    self.out.is_none() && matches!(self.op, Opcode::FixedMove(_) | Opcode::Const(_))
  }

  pub fn successors(&self) -> Vec<BlockId> {
    match &self.op {
      Opcode::Goto(target) => vec![*target],
      Opcode::If {
        target,
        fallthrough,
        ..
      } => vec![*target, *fallthrough],
      _ => vec![],
    }
  }

  /// Whether the two instructions encode the same after register allocation:
  /// same operation, same registers and the same register categories.
  pub fn identical_after_register_allocation(&self, other: &Instruction, method: &Method) -> bool {
    if self.op != other.op
      || self.out_register != other.out_register
      || self.in_registers != other.in_registers
      || self.ins.len() != other.ins.len()
    {
      return false;
    }
    let move_type = |value: &ValueId| method.value(*value).move_type();
    if self.out.map(|out| move_type(&out)) != other.out.map(|out| move_type(&out)) {
      return false;
    }
    self
      .ins
      .iter()
      .zip(other.ins.iter())
      .all(|(a, b)| move_type(a) == move_type(b))
  }

  fn out_operand(&self) -> Option<String> {
    match self.out_register {
      Some(r) => Some(format!("r{}", r)),
      None => self.out.map(|v| v.to_string()),
    }
  }

  fn in_operands(&self) -> Vec<String> {
    if !self.in_registers.is_empty() {
      self.in_registers.iter().map(|r| format!("r{}", r)).collect()
    } else {
      self.ins.iter().map(|v| v.to_string()).collect()
    }
  }
}

impl Display for Instruction {
  fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
    let out = self.out_operand().unwrap_or_else(|| "_".to_string());
    let ins = self.in_operands();
    match &self.op {
      Opcode::Argument { register } => write!(fmt, "{} <- argument r{}", out, register),
      Opcode::Const(number) => write!(fmt, "const {}, {}", out, number),
      Opcode::Move => write!(fmt, "move {}, {}", out, ins.join(", ")),
      Opcode::FixedMove(ty) => match ty {
        MoveType::Single => write!(fmt, "move {}, {}", out, ins.join(", ")),
        _ => write!(fmt, "move-{} {}, {}", ty.as_ref(), out, ins.join(", ")),
      },
      Opcode::Binop(op) => write!(fmt, "{} {}, {}", op.as_ref(), out, ins.join(", ")),
      Opcode::Invoke(name) => {
        write!(fmt, "invoke {}({})", name, ins.join(", "))?;
        match self.out_operand() {
          Some(out) => write!(fmt, " -> {}", out),
          None => Ok(()),
        }
      }
      Opcode::Return => match ins.first() {
        Some(value) => write!(fmt, "return {}", value),
        None => write!(fmt, "return-void"),
      },
      Opcode::Goto(target) => write!(fmt, "goto {}", target),
      Opcode::If {
        cond,
        target,
        fallthrough,
      } => write!(
        fmt,
        "if-{} {}, {} (else {})",
        cond.as_ref(),
        ins.join(", "),
        target,
        fallthrough
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_display_fixed_moves() {
    assert_eq!(Instruction::fixed_move(MoveType::Wide, 4, 2).to_string(), "move-wide r4, r2");
    assert_eq!(Instruction::fixed_move(MoveType::Single, 1, 0).to_string(), "move r1, r0");
    assert_eq!(
      Instruction::fixed_const(3, ConstNumber::int(7)).to_string(),
      "const r3, #7"
    );
  }

  #[test]
  fn test_display_before_allocation() {
    let add = Instruction::new(
      Opcode::Binop(BinOp::Add),
      Some(ValueId(2)),
      vec![ValueId(0), ValueId(1)],
    );
    assert_eq!(add.to_string(), "add v2, v0, v1");
    let branch = Instruction::new(
      Opcode::If {
        cond: IfCond::Eq,
        target: BlockId(2),
        fallthrough: BlockId(1),
      },
      None,
      vec![ValueId(0)],
    );
    assert_eq!(branch.to_string(), "if-eq v0, block2 (else block1)");
    assert_eq!(branch.successors(), vec![BlockId(2), BlockId(1)]);
  }

  #[test]
  fn test_allocator_moves() {
    assert!(Instruction::fixed_move(MoveType::Object, 1, 0).is_allocator_move());
    assert!(Instruction::fixed_const(0, ConstNumber::null()).is_allocator_move());
    let constant = Instruction::new(Opcode::Const(ConstNumber::int(1)), Some(ValueId(0)), vec![]);
    assert!(!constant.is_allocator_move());
  }

  fn allocated(op: Opcode, out: u32, ins: &[(u32, u32)]) -> Instruction {
    let mut instr = Instruction::new(
      op,
      Some(ValueId(out)),
      ins.iter().map(|(value, _)| ValueId(*value)).collect(),
    );
    instr.out_register = Some(0);
    instr.in_registers = ins.iter().map(|(_, register)| *register).collect();
    instr
  }

  #[test]
  fn test_identical_after_register_allocation() {
    use crate::ir::{Value, ValueKind};

    let kinds = [
      ValueKind::Narrow { object: false },
      ValueKind::Constant(ConstNumber::int(1)),
      ValueKind::Constant(ConstNumber::int(2)),
      ValueKind::Narrow { object: false },
      ValueKind::Narrow { object: true },
    ];
    let method = Method {
      name: "identical".to_string(),
      register_budget: 4,
      values: kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| Value::new(ValueId(i as u32), *kind))
        .collect(),
      blocks: vec![],
    };
    let add = Opcode::Binop(BinOp::Add);

    // Different constants read from the same registers encode the same.
    let add0 = allocated(add.clone(), 3, &[(0, 1), (1, 2)]);
    let add1 = allocated(add.clone(), 3, &[(0, 1), (2, 2)]);
    assert!(add0.identical_after_register_allocation(&add1, &method));

    // The same constant from another register does not.
    let add2 = allocated(add.clone(), 3, &[(0, 1), (1, 3)]);
    assert!(!add0.identical_after_register_allocation(&add2, &method));

    // Nor does an operand of another register category.
    let add3 = allocated(add.clone(), 3, &[(0, 1), (4, 2)]);
    assert!(!add0.identical_after_register_allocation(&add3, &method));

    let sub = allocated(Opcode::Binop(BinOp::Sub), 3, &[(0, 1), (1, 2)]);
    assert!(!add0.identical_after_register_allocation(&sub, &method));
  }
}
