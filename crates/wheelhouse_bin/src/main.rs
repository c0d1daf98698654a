use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use dialoguer::{Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use miette::{Context, IntoDiagnostic};
use reqwest::Client;
use reqwest_middleware::ClientWithMiddleware;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wheelhouse::closure::{fetch_closure, ClosureOptions, Resolution, ResolvedPackage};
use wheelhouse::index::{MappingClient, PyPiClient};
use wheelhouse::state::{
    DeclaredWheel, PackageDeclaration, PackageState, StateStore, WheelState, WheelStatus,
};
use wheelhouse::sync::{SyncOptions, Syncer};
use wheelhouse::types::{NormalizedPackageName, PackageName};
use wheelhouse::{convert_wheel, OutputLocation, VersionSpecifiers, WheelSource};

#[derive(Parser)]
#[command(author, version, about = "Convert Python wheels to conda packages", long_about = None)]
struct Args {
    /// Directory holding per-package declaration files
    #[clap(long, default_value = "packages", global = true)]
    packages_dir: PathBuf,

    /// Directory holding per-package state files
    #[clap(long, default_value = "state", global = true)]
    state_dir: PathBuf,

    /// Root directory of the produced conda channel
    #[clap(long, default_value = "channel", global = true)]
    channel_dir: PathBuf,

    /// Verbose logging
    #[clap(short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a single wheel into a .conda package
    Convert {
        /// Path to the .whl file to convert
        wheel: PathBuf,

        /// Output directory for the .conda file
        #[clap(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Convert every pending wheel of every declared package
    Sync {
        /// Enumerate what would be converted without doing anything
        #[clap(long)]
        dry_run: bool,
    },

    /// Convert pending wheels of a single package
    SyncPackage {
        /// The package name
        name: String,

        /// Enumerate what would be converted without doing anything
        #[clap(long)]
        dry_run: bool,
    },

    /// Report new upstream versions not yet declared
    Check,

    /// Verify that every converted package's dependencies are declared
    Validate,

    /// Regenerate channel repodata via the external indexer
    Index,

    /// Print per-package conversion tallies
    Status,

    /// Crawl a package and its dependency closure into declarations
    Add {
        /// The package to add
        package: String,

        /// Version constraint for the root package, e.g. ">=2.0"
        #[clap(short, long)]
        constraint: Option<String>,

        /// Maximum number of versions to fetch per package
        #[clap(short = 'n', long, default_value_t = 3)]
        max_versions: usize,

        /// Show what would be written without writing it
        #[clap(long)]
        dry_run: bool,

        /// Overwrite existing declarations
        #[clap(long)]
        force: bool,

        /// Fail instead of prompting for unresolvable packages
        #[clap(long)]
        non_interactive: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match actual_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn actual_main() -> miette::Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| get_default_env_filter(args.verbose)),
        )
        .init();

    let store = StateStore::new(&args.packages_dir, &args.state_dir);
    let client = ClientWithMiddleware::from(Client::new());

    match args.command {
        Command::Convert { wheel, output_dir } => cmd_convert(wheel, output_dir).await,
        Command::Sync { dry_run } => {
            let syncer = Syncer::new(store, PyPiClient::pypi(client), &args.channel_dir);
            cmd_sync(&syncer, None, dry_run).await
        }
        Command::SyncPackage { name, dry_run } => {
            let name = parse_package_name(&name)?;
            let syncer = Syncer::new(store, PyPiClient::pypi(client), &args.channel_dir);
            cmd_sync(&syncer, Some(name), dry_run).await
        }
        Command::Check => {
            let syncer = Syncer::new(store, PyPiClient::pypi(client), &args.channel_dir);
            cmd_check(&syncer).await
        }
        Command::Validate => cmd_validate(&store),
        Command::Index => {
            wheelhouse::channel::index_channel(&args.channel_dir).await?;
            println!("Indexed channel: {}", args.channel_dir.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => cmd_status(&store),
        Command::Add {
            package,
            constraint,
            max_versions,
            dry_run,
            force,
            non_interactive,
        } => {
            cmd_add(
                &store,
                client,
                &package,
                constraint.as_deref(),
                max_versions,
                dry_run,
                force,
                non_interactive,
            )
            .await
        }
    }
}

fn parse_package_name(raw: &str) -> miette::Result<NormalizedPackageName> {
    let name = PackageName::from_str(raw)
        .into_diagnostic()
        .wrap_err_with(|| format!("'{raw}' is not a valid package name"))?;
    Ok(name.into())
}

async fn cmd_convert(wheel: PathBuf, output_dir: PathBuf) -> miette::Result<ExitCode> {
    if !wheel.exists() {
        miette::bail!("wheel file not found: {}", wheel.display());
    }
    if !wheel.extension().is_some_and(|ext| ext == "whl") {
        miette::bail!("file does not appear to be a wheel: {}", wheel.display());
    }

    let output = OutputLocation::Directory(output_dir);
    let result = tokio::task::spawn_blocking(move || {
        convert_wheel(WheelSource::Path(wheel), &output)
    })
    .await
    .into_diagnostic()?
    .into_diagnostic()
    .wrap_err("conversion failed")?;

    tracing::info!(
        "{} {} -> {} ({} dependencies)",
        result.name,
        result.version,
        result.subdir,
        result.dependencies.len()
    );
    println!("Created: {}", result.path.display());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_sync(
    syncer: &Syncer,
    package: Option<NormalizedPackageName>,
    dry_run: bool,
) -> miette::Result<ExitCode> {
    let options = SyncOptions {
        dry_run,
        ..SyncOptions::default()
    };

    let spinner = ProgressBar::new_spinner().with_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("template is valid"),
    );
    spinner.set_message(if dry_run { "enumerating" } else { "syncing" });
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));

    let outcomes = match package {
        Some(name) => {
            let outcome = syncer.sync_package(name.clone(), &options).await?;
            [(name, outcome)].into_iter().collect()
        }
        None => syncer.sync_all(&options).await?,
    };
    spinner.finish_and_clear();

    let mut converted = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for (package, outcome) in &outcomes {
        if let Some(reason) = &outcome.halted {
            println!(
                "{} {package}: {reason}",
                console::style("halted").red().bold()
            );
            failed += 1;
            continue;
        }
        for filename in &outcome.converted {
            println!("  {} {filename}", console::style("✓").green());
        }
        for (filename, error) in &outcome.failed {
            println!("  {} {filename}: {error}", console::style("✗").red());
        }
        converted += outcome.converted.len();
        failed += outcome.failed.len();
        skipped += outcome.skipped.len();
    }

    println!("{}", console::style("Summary:").bold());
    if converted > 0 {
        println!(
            "  {} {converted} wheel(s) {}",
            console::style("✓").green(),
            if dry_run { "to convert" } else { "converted" }
        );
    }
    if failed > 0 {
        println!("  {} {failed} wheel(s) failed", console::style("✗").red());
    }
    if skipped > 0 {
        println!(
            "  {} {skipped} wheel(s) permanently skipped",
            console::style("○").yellow()
        );
    }
    if converted == 0 && failed == 0 && skipped == 0 {
        println!("  {}", console::style("No wheels to process").dim());
    }

    Ok(if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn cmd_check(syncer: &Syncer) -> miette::Result<ExitCode> {
    let updates = syncer.check_for_updates().await?;
    if updates.is_empty() {
        println!("All declared packages are up to date.");
    } else {
        for (package, versions) in updates {
            println!(
                "{}: {}",
                console::style(package.as_str()).bold(),
                versions.iter().join(", ")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_validate(store: &StateStore) -> miette::Result<ExitCode> {
    let missing = store.validate_dependencies().into_diagnostic()?;
    if missing.is_empty() {
        println!("Dependency closure is complete.");
        return Ok(ExitCode::SUCCESS);
    }
    for (package, names) in &missing {
        println!(
            "{} is missing: {}",
            console::style(package.as_str()).bold(),
            names.iter().join(", ")
        );
    }
    Ok(ExitCode::FAILURE)
}

fn cmd_status(store: &StateStore) -> miette::Result<ExitCode> {
    let packages = store.list_packages().into_diagnostic()?;
    if packages.is_empty() {
        println!("No packages declared.");
        return Ok(ExitCode::SUCCESS);
    }

    for package in packages {
        let state = match store.load_state(&package) {
            Ok(state) => state,
            Err(err) => {
                println!(
                    "{} {package}: {err}",
                    console::style("corrupt").red().bold()
                );
                continue;
            }
        };
        let count = |status: WheelStatus| {
            state
                .values()
                .filter(|wheel| wheel.status == status)
                .count()
        };
        println!(
            "{}: {} converted, {} pending, {} failed, {} skipped",
            console::style(package.as_str()).bold(),
            count(WheelStatus::Converted),
            count(WheelStatus::Pending),
            count(WheelStatus::Failed),
            count(WheelStatus::Skipped),
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// What the operator chose for a package the crawl could not resolve.
enum OperatorChoice {
    Skip,
    Map(String),
}

#[allow(clippy::too_many_arguments)]
async fn cmd_add(
    store: &StateStore,
    client: ClientWithMiddleware,
    package: &str,
    constraint: Option<&str>,
    max_versions: usize,
    dry_run: bool,
    force: bool,
    non_interactive: bool,
) -> miette::Result<ExitCode> {
    let root = parse_package_name(package)?;
    let parsed_constraint = constraint
        .map(VersionSpecifiers::from_str)
        .transpose()
        .into_diagnostic()
        .wrap_err("invalid version constraint")?;

    let pypi = PyPiClient::pypi(client.clone());
    let mapping = MappingClient::conda_forge(client);
    let options = ClosureOptions {
        max_versions: Some(max_versions),
        concurrency: 50,
    };

    println!(
        "Fetching dependency closure of {}...",
        console::style(root.as_str()).bold()
    );
    let closure = fetch_closure(&pypi, &mapping, root.clone(), parsed_constraint, &options).await;

    // Everything is decided before anything is written: an abort mid-prompt
    // must leave the declarations untouched.
    let mut operator_mappings: Vec<(NormalizedPackageName, String)> = Vec::new();
    if !closure.unresolved.is_empty() {
        if non_interactive {
            for node in &closure.unresolved {
                eprintln!(
                    "unresolved: {} (required by {}): {}",
                    node.name,
                    node.required_by
                        .as_ref()
                        .map_or("the operator", |name| name.as_str()),
                    node.error
                );
            }
            miette::bail!(
                "{} package(s) need operator input and --non-interactive was given",
                closure.unresolved.len()
            );
        }

        for node in &closure.unresolved {
            println!(
                "\n{} {} (required by {}): {}",
                console::style("unresolved:").yellow().bold(),
                node.name,
                node.required_by
                    .as_ref()
                    .map_or("the operator", |name| name.as_str()),
                node.error
            );
            match prompt_for_unresolved(&node.name)? {
                OperatorChoice::Skip => {}
                OperatorChoice::Map(conda_name) => {
                    operator_mappings.push((node.name.clone(), conda_name));
                }
            }
        }
    }

    let mut written = 0;
    for resolved in &closure.resolved {
        let (declaration, state) = declaration_for(resolved);
        written += write_declaration(store, &resolved.name, declaration, state, dry_run, force)?;
    }
    for (name, conda_name) in operator_mappings {
        let declaration = PackageDeclaration {
            conda_forge: Some(conda_name),
            ..PackageDeclaration::default()
        };
        written += write_declaration(store, &name, declaration, PackageState::default(), dry_run, force)?;
    }

    println!(
        "\n{} {written} declaration(s){}",
        console::style(if dry_run { "Would write" } else { "Wrote" }).bold(),
        if dry_run { " (dry run)" } else { "" }
    );
    Ok(ExitCode::SUCCESS)
}

fn prompt_for_unresolved(name: &NormalizedPackageName) -> miette::Result<OperatorChoice> {
    let choice = Select::new()
        .with_prompt(format!("How should '{name}' be resolved?"))
        .items(&[
            "Skip it",
            "Defer to a conda-forge package",
            "Abort without writing anything",
        ])
        .default(0)
        .interact()
        .into_diagnostic()?;
    match choice {
        0 => Ok(OperatorChoice::Skip),
        1 => {
            let conda_name: String = Input::new()
                .with_prompt("conda-forge package name")
                .default(name.to_string())
                .interact_text()
                .into_diagnostic()?;
            Ok(OperatorChoice::Map(conda_name))
        }
        _ => Err(miette::miette!("aborted by operator")),
    }
}

/// Builds the declaration and seeded state for one resolved node.
fn declaration_for(resolved: &ResolvedPackage) -> (PackageDeclaration, PackageState) {
    match &resolved.resolution {
        Resolution::Mapped { conda_name } => (
            PackageDeclaration {
                conda_forge: Some(conda_name.clone()),
                ..PackageDeclaration::default()
            },
            PackageState::default(),
        ),
        Resolution::Fetched { releases, .. } => {
            let mut declaration = PackageDeclaration {
                version_constraint: resolved
                    .constraint
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                ..PackageDeclaration::default()
            };
            let mut state = PackageState::default();
            for release in releases {
                let Some(wheel) = release.best_wheel() else {
                    continue;
                };
                declaration.wheels.push(DeclaredWheel {
                    filename: wheel.filename.clone(),
                });
                state.insert(
                    wheel.filename.clone(),
                    WheelState {
                        status: WheelStatus::Pending,
                        sha256: (!wheel.sha256.is_empty()).then(|| wheel.sha256.clone()),
                        upload_time: release.upload_time,
                        ..WheelState::default()
                    },
                );
            }
            (declaration, state)
        }
    }
}

/// Writes one declaration plus its seeded state. Returns 1 when something
/// was (or would be) written.
fn write_declaration(
    store: &StateStore,
    name: &NormalizedPackageName,
    declaration: PackageDeclaration,
    state: PackageState,
    dry_run: bool,
    force: bool,
) -> miette::Result<usize> {
    if store.has_declaration(name) && !force {
        println!(
            "  {} {name} (already declared, use --force to overwrite)",
            console::style("skipped").dim()
        );
        return Ok(0);
    }

    if dry_run {
        let wheels = declaration.wheels.len();
        match &declaration.conda_forge {
            Some(mapped) => println!("  would declare {name} -> conda-forge:{mapped}"),
            None => println!("  would declare {name} with {wheels} wheel(s)"),
        }
        return Ok(1);
    }

    store.save_declaration(name, &declaration).into_diagnostic()?;
    if !state.is_empty() {
        // Never clobber conversion history on re-add: merge, existing
        // entries win.
        let mut merged = store.load_state(name).into_diagnostic()?;
        for (filename, wheel_state) in state {
            merged.entry(filename).or_insert(wheel_state);
        }
        store.save_state(name, &merged).into_diagnostic()?;
    }
    match &declaration.conda_forge {
        Some(mapped) => println!(
            "  {} {name} -> conda-forge:{mapped}",
            console::style("declared").green()
        ),
        None => println!(
            "  {} {name} ({} wheel(s))",
            console::style("declared").green(),
            declaration.wheels.len()
        ),
    }
    Ok(1)
}

/// Constructs a default [`EnvFilter`] used when RUST_LOG is not set.
fn get_default_env_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::new(format!("wheelhouse={level}"))
        .add_directive(Directive::from_str(&format!("wheelhouse_bin={level}")).unwrap())
}
