//! Moves between physical registers
//!
//! Spill stores, reloads, rematerializations and phi moves all end up as
//! `RegisterMove`s, grouped per insertion point and sequentialized by the
//! `RegisterMoveScheduler`.

use std::{
  collections::BTreeMap,
  fmt::{Display, Error, Formatter},
};

use crate::ir::{ConstNumber, MoveType, ValueId};

/// The const instruction a constant move re-creates.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct ConstDefinition {
  pub value: ValueId,
  pub number: ConstNumber,
}

/// Move `src` into `dst`. A move without a source register materializes the
/// constant of its `definition` instead.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct RegisterMove {
  pub dst: u32,
  pub src: Option<u32>,
  pub ty: MoveType,
  pub definition: Option<ConstDefinition>,
}

impl RegisterMove {
  pub fn new(dst: u32, src: u32, ty: MoveType) -> Self {
    RegisterMove {
      dst,
      src: Some(src),
      ty,
      definition: None,
    }
  }

  pub fn constant(dst: u32, value: ValueId, number: ConstNumber) -> Self {
    RegisterMove {
      dst,
      src: None,
      ty: number.ty,
      definition: Some(ConstDefinition { value, number }),
    }
  }

  /// Whether executing this move overwrites `register`.
  pub fn writes(&self, register: u32) -> bool {
    self.dst == register || (self.ty.is_wide() && self.dst + 1 == register)
  }

  /// A move is blocked while another pending move still has to read one of
  /// the registers it writes. Reads go through `value_map`, which tracks
  /// where each source currently lives.
  pub fn is_blocked(&self, pending: &[RegisterMove], value_map: &BTreeMap<u32, u32>) -> bool {
    pending.iter().filter(|other| *other != self).any(|other| {
      let src = match other.src {
        Some(src) => value_map.get(&src).copied().unwrap_or(src),
        None => return false,
      };
      self.writes(src) || (other.ty.is_wide() && self.writes(src + 1))
    })
  }
}

impl Display for RegisterMove {
  fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
    match (self.src, self.definition) {
      (Some(src), _) => write!(fmt, "r{} <- r{} ({})", self.dst, src, self.ty.as_ref()),
      (None, Some(definition)) => write!(
        fmt,
        "r{} <- {} ({})",
        self.dst, definition.number, definition.value
      ),
      (None, None) => write!(fmt, "r{} <- ?", self.dst),
    }
  }
}
