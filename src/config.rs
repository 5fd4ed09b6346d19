//! Allocation strategy options
//!
//! Read from a TOML file when one is given; every missing key falls back to
//! its default.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Where the low register of a wide pair may start.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidePairing {
  /// Any `r, r + 1`.
  Consecutive,
  /// Only even `r`.
  Even,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
  pub debug: bool,
  pub rematerialize_constants: bool,
  pub wide_pairing: WidePairing,
  pub operand_registers: u32,
  pub verify: bool,
}

impl Default for AllocatorConfig {
  fn default() -> Self {
    AllocatorConfig {
      debug: false,                              // Keep values with local info alive to the end
      rematerialize_constants: true,             // Re-create constants instead of spilling them
      wide_pairing: WidePairing::Consecutive,    // Alignment of wide register pairs
      operand_registers: 256,                    // Registers instructions can address directly
      verify: cfg!(debug_assertions),            // Check every allocation after resolution
    }
  }
}

impl AllocatorConfig {
  pub fn from_toml_str(source: &str) -> Result<Self> {
    toml::from_str(source).context("invalid allocator configuration")
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)
      .with_context(|| format!("cannot read configuration {}", path.display()))?;
    Self::from_toml_str(&source)
  }

  #[inline]
  pub fn even_pairs(&self) -> bool {
    self.wide_pairing == WidePairing::Even
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_file_keeps_defaults() {
    let config = AllocatorConfig::from_toml_str("operand_registers = 16\nwide_pairing = \"even\"\n")
      .unwrap();
    assert_eq!(config.operand_registers, 16);
    assert!(config.even_pairs());
    assert!(config.rematerialize_constants);
    assert!(!config.debug);
  }

  #[test]
  fn test_unknown_pairing_rejected() {
    assert!(AllocatorConfig::from_toml_str("wide_pairing = \"odd\"").is_err());
  }
}
