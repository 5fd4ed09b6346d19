//! Parse command line arguments
//! Hand-rolled like the rest of our drivers; panics on anything it does not
//! understand.

use std::env;

pub enum EmitTarget {
  Text,
  Json,
}

/// Configuration options for this driver run.
pub struct Config {
  pub verbose: bool,
  pub debug: bool,
  pub dump_intervals: bool,

  pub emit: EmitTarget,
  pub jobs: usize,
  pub config_file: Option<String>,
  pub output: Option<String>,
  pub file: Option<String>,
}

impl Config {
  /// Set your defaults here!
  fn default() -> Self {
    Config {
      verbose: false,        // Log every method as it is allocated
      debug: false,          // Keep locals alive, overrides the config file
      dump_intervals: false, // Print the final intervals of every method

      emit: EmitTarget::Text, // Format of the allocated methods
      jobs: std::thread::available_parallelism().map_or(1, |n| n.get()), // Worker threads
      config_file: None,      // TOML allocator configuration
      output: None,           // Output file, stdout if absent
      file: None,             // JSON file of methods to allocate
    }
  }
}

fn parse_jobs(jobs: &str) -> usize {
  match jobs.parse::<usize>() {
    Ok(jobs) if jobs > 0 => jobs,
    _ => panic!("Invalid job count : {}", jobs),
  }
}

/// Parses command line input into a configuration. Panics on invalid args.
pub fn parse_args() -> Config {
  let args: Vec<String> = env::args().collect();
  let mut config = Config::default();
  let mut index = 1;

  // Value of an option taking the next space-delimited token.
  let value = |index: usize, what: &str| -> String {
    match args.get(index + 1) {
      Some(value) => value.clone(),
      None => panic!("Expected {}", what),
    }
  };

  while index < args.len() {
    match args[index].as_str() {
      "-v" | "--verbose" => config.verbose = true,
      "--debug" => config.debug = true,
      "--dump-intervals" => config.dump_intervals = true,
      "-e" | "--emit" => {
        config.emit = match value(index, "emit type").as_str() {
          "text" => EmitTarget::Text,
          "json" => EmitTarget::Json,
          other => panic!("Unknown emit type : {}", other),
        };
        index += 1;
      }
      "-j" | "--jobs" => {
        config.jobs = parse_jobs(&value(index, "job count"));
        index += 1;
      }
      "--config" => {
        config.config_file = Some(value(index, "configuration file"));
        index += 1;
      }
      "-o" | "--output" => {
        config.output = Some(value(index, "output file"));
        index += 1;
      }
      "-etext" => config.emit = EmitTarget::Text,
      "-ejson" => config.emit = EmitTarget::Json,
      jobs if jobs.starts_with("-j") => config.jobs = parse_jobs(&jobs[2..]),
      other if other.starts_with('-') => panic!("Unknown option : {}", other),
      file => config.file = Some(file.to_string()),
    };
    index += 1;
  }

  if config.file.is_none() {
    panic!("Expected file input");
  }

  config
}
