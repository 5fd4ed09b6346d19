//! SSA values and their register categories

use std::fmt::{Display, Error, Formatter};

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

/// Handle of a value, an index into `Method::values`.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl ValueId {
  #[inline]
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl Display for ValueId {
  fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
    write!(fmt, "v{}", self.0)
  }
}

/// The register category of a move, picks between move, move-wide and
/// move-object when encoded.
#[derive(
  Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, AsRefStr, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MoveType {
  Single,
  Wide,
  Object,
}

impl MoveType {
  /// Number of consecutive registers a value of this type occupies.
  #[inline]
  pub fn required_registers(self) -> u32 {
    match self {
      MoveType::Wide => 2,
      MoveType::Single | MoveType::Object => 1,
    }
  }

  #[inline]
  pub fn is_wide(self) -> bool {
    self == MoveType::Wide
  }
}

/// A literal as materialized by a const instruction. `raw` holds the bit
/// pattern; floating point constants are stored by their IEEE bits.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstNumber {
  #[serde(rename = "type")]
  pub ty: MoveType,
  pub raw: i64,
}

impl ConstNumber {
  pub fn int(raw: i32) -> Self {
    ConstNumber {
      ty: MoveType::Single,
      raw: raw as i64,
    }
  }

  pub fn long(raw: i64) -> Self {
    ConstNumber {
      ty: MoveType::Wide,
      raw,
    }
  }

  pub fn null() -> Self {
    ConstNumber {
      ty: MoveType::Object,
      raw: 0,
    }
  }
}

impl Display for ConstNumber {
  fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
    match self.ty {
      MoveType::Object => write!(fmt, "null"),
      MoveType::Wide => write!(fmt, "#{}L", self.raw),
      MoveType::Single => write!(fmt, "#{}", self.raw),
    }
  }
}

/// What kind of register a value needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumAsInner, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
  /// A 32-bit primitive or a reference.
  Narrow {
    #[serde(default)]
    object: bool,
  },
  /// A 64-bit primitive in a register pair.
  Wide,
  /// The result of a const instruction, can be re-created instead of spilled.
  Constant(ConstNumber),
}

impl ValueKind {
  pub fn move_type(&self) -> MoveType {
    match self {
      ValueKind::Narrow { object: true } => MoveType::Object,
      ValueKind::Narrow { object: false } => MoveType::Single,
      ValueKind::Wide => MoveType::Wide,
      ValueKind::Constant(number) => number.ty,
    }
  }

  /// True for wide values and wide constants alike, unlike the derived
  /// `is_wide` which only matches the `Wide` variant.
  #[inline]
  pub fn needs_pair(&self) -> bool {
    self.move_type().is_wide()
  }

  #[inline]
  pub fn required_registers(&self) -> u32 {
    self.move_type().required_registers()
  }
}

/// A single SSA definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
  pub id: ValueId,
  pub kind: ValueKind,
  /// Name of the source local this value holds, kept observable in debug mode.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub local: Option<String>,
}

impl Value {
  pub fn new(id: ValueId, kind: ValueKind) -> Self {
    Value {
      id,
      kind,
      local: None,
    }
  }

  #[inline]
  pub fn move_type(&self) -> MoveType {
    self.kind.move_type()
  }

  #[inline]
  pub fn is_wide(&self) -> bool {
    self.kind.needs_pair()
  }

  /// A constant without local info can be re-created by its const
  /// instruction wherever it is needed.
  pub fn is_rematerializable(&self) -> bool {
    self.kind.is_constant() && self.local.is_none()
  }

  pub fn constant(&self) -> Option<ConstNumber> {
    self.kind.as_constant().copied()
  }
}
