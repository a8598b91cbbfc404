//! `triagekit` CLI entry point.
//!
//! `scan <input>` runs the dispatcher/scheduler over one input into a
//! meta-directory store. `rules <store>` walks a finished store and
//! emits textual scan rules. Both are thin wrappers around the library
//! (spec.md §1's non-goal on CLI/config-parsing logic); all the hard
//! work lives in `triagekit::{dispatcher, workers, identifier}`.

use std::path::Path;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use triagekit::cli::{self, Command};
use triagekit::config::Config;
use triagekit::identifier::{self, denylist::Denylist};
use triagekit::meta_directory::MetaDirectoryStore;
use triagekit::parser::ParserRegistry;
use triagekit::workers::Scheduler;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let command = match cli::run() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    match command {
        Command::Scan {
            input,
            config,
            store,
            threads,
        } => run_scan(&input, config.as_deref(), store, threads),
        Command::Rules {
            store,
            config,
            output,
            identifiers,
        } => run_rules(&store, config.as_deref(), output, identifiers.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, ExitCode> {
    match path {
        Some(path) => Config::load(path).map_err(|e| {
            eprintln!("configuration error: {e}");
            ExitCode::from(1)
        }),
        None => Ok(Config::default()),
    }
}

fn run_scan(
    input: &Path,
    config_path: Option<&Path>,
    store_override: Option<std::path::PathBuf>,
    threads_override: Option<usize>,
) -> ExitCode {
    let mut config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    if let Some(store) = store_override {
        config.store_directory = store;
    }
    if let Some(threads) = threads_override {
        config.threads = threads;
    }

    if !input.is_file() {
        eprintln!("'{}' is not a regular file", input.display());
        return ExitCode::from(2);
    }

    let store = match MetaDirectoryStore::open_root(&config.store_directory) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("failed to open meta-directory store: {e}");
            return ExitCode::from(1);
        }
    };
    let root = match store.register_root(input) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("failed to register '{}': {e}", input.display());
            return ExitCode::from(1);
        }
    };

    let registry = ParserRegistry::with_builtins();
    let scheduler = Scheduler::new(store, registry, config.threads);
    let summary = scheduler.run(root);

    tracing::info!(
        processed = summary.processed,
        duplicates_skipped = summary.duplicates_skipped,
        errors = summary.errors.len(),
        "scan complete"
    );
    for error in &summary.errors {
        tracing::warn!(%error, "dispatch error (non-fatal, run continues)");
    }

    ExitCode::SUCCESS
}

fn run_rules(
    store_path: &Path,
    config_path: Option<&Path>,
    output_override: Option<std::path::PathBuf>,
    identifiers_path: Option<&Path>,
) -> ExitCode {
    let mut config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    if let Some(output) = output_override {
        config.yara_directory = output;
    }

    let denylist = match identifiers_path {
        Some(path) => match Denylist::load(path) {
            Ok(d) => d,
            Err(e) => {
                eprintln!("failed to load denylist: {e}");
                return ExitCode::from(1);
            }
        },
        None => Denylist::empty(),
    };

    let store = match MetaDirectoryStore::open_root(store_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("failed to open meta-directory store: {e}");
            return ExitCode::from(1);
        }
    };

    let files = match identifier::collect(&store, &config, &denylist) {
        Ok(files) => files,
        Err(e) => {
            eprintln!("failed to walk store: {e}");
            return ExitCode::from(1);
        }
    };

    if config.max_identifiers > 0 {
        tracing::debug!(
            max_identifiers = config.max_identifiers,
            "max_identifiers is accepted but not enforced (see DESIGN.md)"
        );
    }

    let mut emitted = 0usize;
    for file in &files {
        let rule_id = uuid::Uuid::new_v4().to_string();
        let generated_at = chrono::Utc::now().to_rfc3339();
        if let Some(rule) = identifier::rules::emit_file_rule(
            file,
            None,
            &file.meta_ref.0,
            &config,
            &rule_id,
            &generated_at,
        ) {
            if let Err(e) = rule.write_to(&config.yara_directory) {
                eprintln!("failed to write rule '{}': {e}", rule.file_name);
                return ExitCode::from(1);
            }
            emitted += 1;
        }
    }

    tracing::info!(files = files.len(), rules_emitted = emitted, "rule emission complete");
    ExitCode::SUCCESS
}
