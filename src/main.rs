use std::fs::{self, File};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kestrel_behaviours::cli::{print_help, CliCommand, CliOptions};
use kestrel_behaviours::config::RuntimeConfig;
use kestrel_behaviours::behaviour::BehaviourRuntime;
use kestrel_behaviours::harness::{load_fixture, run_fixture_with_config, HarnessOutput};
use kestrel_behaviours::logging;
use kestrel_behaviours::script_watch::ScriptWatcher;
use kestrel_behaviours::scripts::BehaviourRegistry;
use tracing::{error, info};

const WATCH_POLL: Duration = Duration::from_millis(250);

fn main() {
    let opts = match CliOptions::parse_from_env() {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if opts.command == CliCommand::Help {
        print_help();
        return;
    }
    if let Err(err) = run(opts) {
        eprintln!("[kestrel-behaviours] error: {err:?}");
        std::process::exit(1);
    }
}

fn run(opts: CliOptions) -> Result<()> {
    let mut config =
        if opts.config_path.exists() { RuntimeConfig::load(&opts.config_path)? } else { RuntimeConfig::default() };
    config.apply_overrides(&opts.overrides);
    logging::init(&config.log_filter);
    if !opts.overrides.is_empty() {
        info!(fields = ?opts.overrides.applied_fields(), "applied command line overrides");
    }

    match &opts.command {
        CliCommand::Fixture { fixture, write_output, check_golden } => {
            run_harness(&config, &opts, fixture, write_output.as_deref(), check_golden.as_deref())
        }
        CliCommand::Precompile { dir, watch } => {
            let dir = dir.clone().unwrap_or_else(|| config.scripts.root.clone());
            if *watch {
                watch_scripts(&config, &dir)
            } else {
                precompile(&config, &dir)
            }
        }
        CliCommand::Help => Ok(()),
    }
}

fn run_harness(
    config: &RuntimeConfig,
    opts: &CliOptions,
    fixture_path: &Path,
    write_output: Option<&Path>,
    check_golden: Option<&Path>,
) -> Result<()> {
    let mut fixture = load_fixture(fixture_path)?;
    if let Some(root) = &opts.overrides.script_root {
        fixture.script_root = root.clone();
    }
    if opts.overrides.seed.is_some() {
        fixture.deterministic_seed = opts.overrides.seed;
    }
    if let Some(steps) = opts.steps {
        fixture.steps = steps;
    }
    let output = run_fixture_with_config(&fixture, config)?;

    if let Some(path) = write_output {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating output directory '{}'", parent.display()))?;
            }
        }
        let file = File::create(path).with_context(|| format!("writing harness output to '{}'", path.display()))?;
        serde_json::to_writer_pretty(file, &output).context("serializing harness output")?;
        info!(path = %path.display(), "wrote harness output");
    }

    if let Some(path) = check_golden {
        let file = File::open(path).with_context(|| format!("opening golden file '{}'", path.display()))?;
        let expected: HarnessOutput = serde_json::from_reader(file).context("parsing golden JSON")?;
        if expected != output {
            bail!(
                "golden mismatch for {} (use --write-output to refresh):\nexpected: {}\nactual:   {}",
                fixture_path.display(),
                serde_json::to_string(&expected).unwrap_or_default(),
                serde_json::to_string(&output).unwrap_or_default(),
            );
        }
        info!(path = %path.display(), "matched golden");
    } else if write_output.is_none() {
        serde_json::to_writer_pretty(std::io::stdout(), &output)?;
        println!();
    }
    Ok(())
}

fn precompile(config: &RuntimeConfig, dir: &Path) -> Result<()> {
    let registry = BehaviourRegistry::new(&config.scripts);
    let entries = registry.preload_dir(dir)?;
    let mut failures = 0usize;
    for entry in &entries {
        match &entry.result {
            Ok(version) => println!("ok    {} (v{version}) {}", entry.id, entry.path.display()),
            Err(err) => {
                failures += 1;
                error!(behaviour = %entry.id, error = %err, "precompile failed");
                println!("error {} {}: {err}", entry.id, entry.path.display());
            }
        }
    }
    info!(scripts = entries.len(), failures, dir = %dir.display(), "precompile finished");
    if failures > 0 {
        bail!("{failures} of {} scripts failed to compile", entries.len());
    }
    Ok(())
}

fn watch_scripts(config: &RuntimeConfig, dir: &Path) -> Result<()> {
    let runtime = BehaviourRuntime::headless(config);
    let entries = runtime.registry().preload_dir(dir)?;
    for entry in &entries {
        match &entry.result {
            Ok(version) => println!("ok    {} (v{version})", entry.id),
            Err(err) => println!("error {}: {err}", entry.id),
        }
    }
    let mut watcher = ScriptWatcher::new(&config.scripts.extension)?;
    watcher.watch_root(dir)?;
    info!(dir = %dir.display(), scripts = entries.len(), "watching behaviour scripts");
    loop {
        for (id, result) in runtime.apply_script_changes(&mut watcher) {
            match result {
                Ok(version) => {
                    info!(behaviour = %id, version, "reloaded");
                    println!("ok    {id} (v{version})");
                }
                Err(err) => println!("error {id}: {err}"),
            }
        }
        thread::sleep(WATCH_POLL);
    }
}
