use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::PathBuf;

use storage_results::{BackendConfig, KeyValueStore, StorageResultBackend};

#[derive(Debug, Parser)]
#[command(name = "storage-results")]
#[command(about = "Inspect and maintain a storage-backed task result store", long_about = None)]
struct Cli {
    /// TOML configuration file, environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the value stored under a key
    Get(EntryArgs),
    /// Store a value under a key
    Set(SetArgs),
    /// Delete the entry of a key
    Delete(EntryArgs),
    /// Remove expired results
    Cleanup,
    /// Print the namespaced key for a task, group or chord id
    Key(KeyArgs),
}

#[derive(Debug, Args)]
struct EntryArgs {
    key: String,
}

#[derive(Debug, Args)]
struct SetArgs {
    key: String,

    /// Value to store, read from stdin when omitted
    value: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Namespace {
    Task,
    Group,
    Chord,
}

#[derive(Debug, Args)]
struct KeyArgs {
    namespace: Namespace,
    id: String,
}

fn main() {
    let exit_code = match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn try_main() -> Result<i32> {
    let args = Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = BackendConfig::load(args.config.as_ref()).context("loading configuration")?;
    let backend = StorageResultBackend::new(config).context("creating result backend")?;

    match &args.command {
        Commands::Get(entry_args) => get(&backend, entry_args),
        Commands::Set(set_args) => set(&backend, set_args),
        Commands::Delete(delete_args) => {
            backend.delete(&delete_args.key)?;
            Ok(0)
        }
        Commands::Cleanup => cleanup(&backend),
        Commands::Key(key_args) => {
            println!("{}", namespaced_key(&backend, key_args));
            Ok(0)
        }
    }
}

fn get(backend: &StorageResultBackend, args: &EntryArgs) -> Result<i32> {
    match backend.get(&args.key)? {
        Some(value) => {
            println!("{value}");
            Ok(0)
        }
        None => {
            eprintln!("no result stored under {}", args.key);
            Ok(1)
        }
    }
}

fn set(backend: &StorageResultBackend, args: &SetArgs) -> Result<i32> {
    let value = match &args.value {
        Some(value) => value.clone(),
        None => {
            let mut value = String::new();
            std::io::stdin()
                .read_to_string(&mut value)
                .context("reading value from stdin")?;
            value
        }
    };
    backend.set(&args.key, &value)?;
    Ok(0)
}

fn cleanup(backend: &StorageResultBackend) -> Result<i32> {
    let report = backend.cleanup()?;
    println!(
        "scanned {} skipped {} deleted {} failed {}",
        report.scanned, report.skipped, report.deleted, report.failed
    );
    Ok(0)
}

fn namespaced_key(backend: &StorageResultBackend, args: &KeyArgs) -> String {
    match args.namespace {
        Namespace::Task => backend.key_for_task(&args.id),
        Namespace::Group => backend.key_for_group(&args.id),
        Namespace::Chord => backend.key_for_chord(&args.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["storage-results", "get", "celery-task-meta-1", "-v"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Get(ref args) if args.key == "celery-task-meta-1"));
    }
}
