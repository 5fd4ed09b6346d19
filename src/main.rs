//! dexalloc: allocate registers for methods read from a JSON file

mod args;
mod emit;

use std::{
  fs::File,
  io::{self, BufWriter, Write},
  time,
};

use anyhow::{Context, Result};
use args::EmitTarget;

use dexalloc::{config::AllocatorConfig, driver};

fn main() {
  let cfg = args::parse_args();

  // make envlogger stdout
  let mut logger = env_logger::builder();
  logger.target(env_logger::Target::Stdout).format_timestamp(None);
  if cfg.verbose {
    logger.filter_level(log::LevelFilter::Info);
  }
  logger.init();

  let code = match run(&cfg) {
    Ok(code) => code,
    Err(e) => {
      eprintln!("{:#}", e);
      2
    }
  };
  std::process::exit(code);
}

/// Returns 1 if any method failed to allocate.
fn run(cfg: &args::Config) -> Result<i32> {
  // Helper macro to time evaluating an expression (like a function call.)
  macro_rules! time {
    ( $x:expr ) => {{
      let t1 = time::Instant::now();
      let result = $x;
      (result, t1.elapsed())
    }};
  }

  let mut config = match &cfg.config_file {
    Some(path) => AllocatorConfig::from_file(path)?,
    None => AllocatorConfig::default(),
  };
  if cfg.debug {
    config.debug = true;
  }

  let filename = cfg.file.as_deref().context("no input file")?;
  let source =
    std::fs::read_to_string(filename).with_context(|| format!("cannot read {}", filename))?;
  let (methods, parse_time) = time!(driver::parse_methods(&source));
  let methods = methods.with_context(|| format!("{} is not a list of methods", filename))?;

  let (outcomes, alloc_time) = time!(driver::allocate_all(methods, &config, cfg.jobs));
  let mut failed = 0;
  for outcome in outcomes.iter() {
    if let Err(e) = &outcome.result {
      eprintln!("internal compiler error: {}", e);
      failed += 1;
    }
  }
  log::info!("Parse time: {} us", parse_time.as_micros());
  log::info!(
    "Allocation: {} us for {} methods on {} workers",
    alloc_time.as_micros(),
    outcomes.len(),
    cfg.jobs
  );

  let mut out: Box<dyn Write> = match &cfg.output {
    Some(path) => Box::new(BufWriter::new(
      File::create(path).with_context(|| format!("cannot create {}", path))?,
    )),
    None => Box::new(io::stdout().lock()),
  };
  match cfg.emit {
    EmitTarget::Text => emit::emit_text(&mut out, &outcomes, cfg.dump_intervals)?,
    EmitTarget::Json => emit::emit_json(&mut out, &outcomes)?,
  }
  out.flush()?;

  Ok((failed > 0) as i32)
}
