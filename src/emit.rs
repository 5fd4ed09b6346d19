//! Output of allocated methods

use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use dexalloc::{driver::MethodOutcome, ir::Method, regalloc::Allocation};

/// Methods as text, the failed ones as comments.
pub fn emit_text(
  out: &mut impl Write,
  outcomes: &[MethodOutcome],
  dump_intervals: bool,
) -> Result<()> {
  for outcome in outcomes {
    match &outcome.result {
      Ok(allocation) => {
        write!(out, "{}", outcome.method)?;
        writeln!(
          out,
          "; {} registers, {} spilled values, {} moves",
          allocation.registers_used(),
          allocation.spilled_values(),
          allocation.inserted_moves().len()
        )?;
        if dump_intervals {
          dump(out, allocation)?;
        }
      }
      Err(e) => writeln!(out, "; {}", e)?,
    }
    writeln!(out)?;
  }
  Ok(())
}

fn dump(out: &mut impl Write, allocation: &Allocation) -> Result<()> {
  for (id, interval) in allocation.intervals().iter() {
    match interval.split_parent() {
      Some(parent) => writeln!(out, ";   #{} (from #{}) {}", id.0, parent.0, interval)?,
      None => writeln!(out, ";   #{} {}", id.0, interval)?,
    }
  }
  Ok(())
}

#[derive(Serialize)]
struct MethodReport<'a> {
  name: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  registers_used: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  method: Option<&'a Method>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
}

/// All methods as one JSON array.
pub fn emit_json(out: &mut impl Write, outcomes: &[MethodOutcome]) -> Result<()> {
  let reports = outcomes
    .iter()
    .map(|outcome| match &outcome.result {
      Ok(allocation) => MethodReport {
        name: &outcome.method.name,
        registers_used: Some(allocation.registers_used()),
        method: Some(&outcome.method),
        error: None,
      },
      Err(e) => MethodReport {
        name: &outcome.method.name,
        registers_used: None,
        method: None,
        error: Some(e.to_string()),
      },
    })
    .collect::<Vec<_>>();
  serde_json::to_writer_pretty(&mut *out, &reports)?;
  writeln!(out)?;
  Ok(())
}
