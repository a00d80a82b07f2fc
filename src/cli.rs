use crate::config::RuntimeConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

pub const DEFAULT_CONFIG_PATH: &str = "config/runtime.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Run a harness fixture, optionally writing or checking its output.
    Fixture { fixture: PathBuf, write_output: Option<PathBuf>, check_golden: Option<PathBuf> },
    /// Compile every script under `dir` (or the configured root) and report failures.
    /// With `watch`, keep recompiling scripts as they change on disk.
    Precompile { dir: Option<PathBuf>, watch: bool },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOptions {
    pub command: CliCommand,
    pub config_path: PathBuf,
    pub overrides: RuntimeConfigOverrides,
    /// Replaces the fixture's step count.
    pub steps: Option<usize>,
}

impl CliOptions {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut fixture = None;
        let mut write_output = None;
        let mut check_golden = None;
        let mut precompile: Option<Option<PathBuf>> = None;
        let mut watch = false;
        let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut overrides = RuntimeConfigOverrides::default();
        let mut steps = None;

        let mut iter = args.into_iter().map(|arg| arg.as_ref().to_string()).peekable();
        let _ = iter.next(); // skip program name if present
        while let Some(flag) = iter.next() {
            match flag.as_str() {
                "--help" | "-h" => {
                    return Ok(Self { command: CliCommand::Help, config_path, overrides, steps });
                }
                "--precompile" => {
                    let dir = match iter.peek() {
                        Some(next) if !next.starts_with('-') => iter.next().map(PathBuf::from),
                        _ => None,
                    };
                    precompile = Some(dir);
                    continue;
                }
                "--watch" | "-w" => {
                    watch = true;
                    continue;
                }
                _ => {}
            }
            if !flag.starts_with('-') {
                bail!("Unexpected argument '{flag}'. Use --help to list the supported flags.");
            }
            let value = iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?;
            match flag.as_str() {
                "--fixture" | "-f" => fixture = Some(PathBuf::from(value)),
                "--write-output" | "-o" => write_output = Some(PathBuf::from(value)),
                "--check-golden" | "--golden" | "-g" => check_golden = Some(PathBuf::from(value)),
                "--config" | "-c" => config_path = PathBuf::from(value),
                "--steps" | "-n" => {
                    steps = Some(value.parse::<usize>().with_context(|| format!("Invalid steps '{value}'"))?);
                }
                "--script-root" => overrides.script_root = Some(PathBuf::from(value)),
                "--seed" => {
                    overrides.seed = Some(value.parse::<u64>().with_context(|| format!("Invalid seed '{value}'"))?);
                }
                "--max-operations" => {
                    overrides.max_operations = Some(
                        value.parse::<u64>().with_context(|| format!("Invalid max-operations '{value}'"))?,
                    );
                }
                "--stats-interval" => {
                    overrides.stats_interval_ticks = Some(
                        value.parse::<u64>().with_context(|| format!("Invalid stats-interval '{value}'"))?,
                    );
                }
                _ => bail!("Unknown flag '{flag}'. Use --help to list the supported flags."),
            }
        }

        let command = match (precompile, fixture) {
            (Some(_), Some(_)) => bail!("--precompile and --fixture cannot be combined"),
            (Some(dir), None) => CliCommand::Precompile { dir, watch },
            (None, Some(_)) if watch => bail!("--watch only applies to --precompile"),
            (None, Some(fixture)) => CliCommand::Fixture { fixture, write_output, check_golden },
            (None, None) => bail!("--fixture <path> or --precompile [dir] is required"),
        };
        Ok(Self { command, config_path, overrides, steps })
    }
}

pub fn print_help() {
    println!("Usage: kestrel_behaviours --fixture <path> [--steps N] [--check-golden <path>] [--write-output <path>]");
    println!("       kestrel_behaviours --precompile [dir] [--watch]");
    println!("  -f, --fixture         Path to a harness fixture JSON file");
    println!("  -g, --check-golden    Golden output file to compare against");
    println!("  -o, --write-output    Path to write the actual output JSON");
    println!("      --precompile      Compile every script under dir (default: configured root)");
    println!("  -w, --watch           After precompiling, recompile scripts as they change");
    println!("  -n, --steps           Number of ticks to run (default: the fixture's)");
    println!("  -c, --config          Runtime config file (default: {DEFAULT_CONFIG_PATH})");
    println!("      --script-root     Override the behaviour script root");
    println!("      --seed            Seed for the shared script RNG");
    println!("      --max-operations  Per-call operation budget for scripts");
    println!("      --stats-interval  Ticks between lifecycle stats lines");
}
