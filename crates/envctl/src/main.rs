use anyhow::Result;
use clap::{Parser, Subcommand};
use env_core::index::SearchResult;
use env_core::lifecycle::EnvironmentStatus;
use env_core::packages::{PackageInfo, PackageOpResult};
use env_core::session::{ManagerHandle, SessionRegistry, StaticSessionStore};
use env_core::{CancellationToken, EnvError, EnvKind, EnvSpec, PackageRecord, VirtualEnvironment};
use env_tools::PythonInstallation;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about = "Manage per-project Python environments", long_about = None)]
struct Cli {
    /// Working directory (defaults to the current directory)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Activate this environment before running the command
    #[arg(long = "env", global = true)]
    env_name: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List Python interpreters installed on this machine
    Interpreters,
    /// Show the environments of the working directory and which is active
    Status,
    /// Create, activate, delete, and list environments
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },
    /// Package operations on the active environment
    Pkg {
        #[command(subcommand)]
        command: PkgCommands,
    },
    /// Save or install requirements files
    Requirements {
        #[command(subcommand)]
        command: RequirementsCommands,
    },
}

#[derive(Subcommand)]
enum EnvCommands {
    /// List environments with their packages
    List,
    /// Create a new environment
    Create {
        name: String,
        /// Environment kind: venv, conda, or poetry
        #[arg(long, short, default_value = "venv")]
        kind: EnvKind,
        /// Interpreter version prefix (e.g. 3.11) or path
        #[arg(long, short)]
        python: Option<String>,
        /// Conda channel (repeatable)
        #[arg(long = "channel", short = 'c')]
        channels: Vec<String>,
        /// Give a venv access to the base interpreter's packages
        #[arg(long)]
        system_site_packages: bool,
    },
    /// Make an environment the active one
    Activate { name: String },
    /// Delete an environment and its directory
    Delete { name: String },
}

#[derive(Subcommand)]
enum PkgCommands {
    /// Install packages in one resolver run
    Install {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Uninstall packages
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// List installed packages
    List,
    /// List packages with a newer version available
    Outdated,
    /// Upgrade one package, or every outdated package
    Update { name: Option<String> },
    /// Search the package index
    Search {
        query: String,
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },
    /// Show package metadata
    Info { name: String },
    /// Show a package's direct dependencies
    Deps { name: String },
}

#[derive(Subcommand)]
enum RequirementsCommands {
    /// Write the active environment's packages to a requirements file
    Save {
        path: Option<PathBuf>,
        /// Write bare names without pinned versions
        #[arg(long)]
        no_versions: bool,
    },
    /// Install from a requirements file
    Install { path: Option<PathBuf> },
}

#[derive(Tabled)]
struct InterpreterRow {
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "PATH")]
    path: String,
    #[tabled(rename = "DEFAULT")]
    default: String,
}

impl From<&PythonInstallation> for InterpreterRow {
    fn from(p: &PythonInstallation) -> Self {
        InterpreterRow {
            version: p.version.clone(),
            path: shorten_path(&p.executable_path),
            default: if p.is_default { "*" } else { "" }.to_string(),
        }
    }
}

#[derive(Tabled)]
struct EnvironmentRow {
    #[tabled(rename = "")]
    active: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "PYTHON")]
    python: String,
    #[tabled(rename = "PACKAGES")]
    packages: usize,
    #[tabled(rename = "PATH")]
    path: String,
}

impl From<&VirtualEnvironment> for EnvironmentRow {
    fn from(env: &VirtualEnvironment) -> Self {
        EnvironmentRow {
            active: if env.is_active { "*" } else { "" }.to_string(),
            name: env.name.clone(),
            kind: env.kind.to_string(),
            python: env.python_version.clone().unwrap_or_else(|| "-".to_string()),
            packages: env.packages.len(),
            path: shorten_path(&env.path),
        }
    }
}

#[derive(Tabled)]
struct PackageRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "LATEST")]
    latest: String,
}

impl From<&PackageRecord> for PackageRow {
    fn from(p: &PackageRecord) -> Self {
        PackageRow {
            name: p.name.clone(),
            version: p.installed_version.clone(),
            latest: p.available_version.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct SearchRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

impl From<&SearchResult> for SearchRow {
    fn from(r: &SearchResult) -> Self {
        SearchRow {
            name: r.name.clone(),
            version: r.version.clone(),
            description: truncate(&r.description, 60),
        }
    }
}

/// Shorten a path for display by replacing home directory with ~
fn shorten_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

/// Single-line, length-limited text for table cells.
fn truncate(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let cut: String = single_line.chars().take(max_chars - 3).collect();
        format!("{}...", cut)
    }
}

fn print_table<R: Tabled>(rows: Vec<R>, empty: &str) {
    if rows.is_empty() {
        println!("{}", empty);
        return;
    }
    println!("{}", Table::new(rows).with(Style::rounded()));
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
}

fn print_op_result(result: &PackageOpResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }
    if !result.output.trim().is_empty() {
        println!("{}", result.output.trim_end());
    }
    if result.changes.is_empty() {
        println!("No changes.");
        return Ok(());
    }
    #[derive(Tabled)]
    struct ChangeRow {
        #[tabled(rename = "PACKAGE")]
        name: String,
        #[tabled(rename = "FROM")]
        from: String,
        #[tabled(rename = "TO")]
        to: String,
    }
    let rows: Vec<ChangeRow> = result
        .changes
        .iter()
        .map(|c| ChangeRow {
            name: c.name.clone(),
            from: c.from.clone().unwrap_or_else(|| "-".to_string()),
            to: c.to.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    print_table(rows, "");
    Ok(())
}

fn print_status(status: &EnvironmentStatus, json: bool) -> Result<()> {
    if json {
        return print_json(status);
    }
    println!("Working directory: {}", shorten_path(&status.working_directory));
    println!(
        "Active environment: {}",
        status.active_environment.as_deref().unwrap_or("none")
    );
    let rows: Vec<EnvironmentRow> = status.environments.iter().map(EnvironmentRow::from).collect();
    print_table(rows, "No environments found.");
    print_warnings(&status.warnings);
    Ok(())
}

fn print_package_info(info: &PackageInfo) {
    println!("Name:      {}", info.name);
    println!("Version:   {}", info.version);
    println!("Installed: {}", if info.installed { "yes" } else { "no" });
    if let Some(summary) = &info.summary {
        println!("Summary:   {}", summary);
    }
    if let Some(home_page) = &info.home_page {
        println!("Home page: {}", home_page);
    }
    if let Some(location) = &info.location {
        println!("Location:  {}", shorten_path(location));
    }
    println!("Requires:  {}", info.requires.join(", "));
}

/// Failure surfaced to the user; carries the typed error when there is one.
enum CliError {
    Env(EnvError),
    Other(anyhow::Error),
}

impl From<EnvError> for CliError {
    fn from(e: EnvError) -> Self {
        CliError::Env(e)
    }
}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(e)
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let json = cli.json;
    let outcome = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::Other(e.into()))
        .and_then(|rt| rt.block_on(async_main(cli)));

    match outcome {
        Ok(()) => {}
        Err(CliError::Env(e)) => {
            if json {
                let report = e.report();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "error": report }))
                        .unwrap_or_else(|_| e.to_string())
                );
            } else {
                eprintln!("Error: {}", e);
                if let Some(details) = e.details() {
                    eprintln!("{}", details.trim_end());
                }
            }
            std::process::exit(1);
        }
        Err(CliError::Other(e)) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn async_main(cli: Cli) -> Result<(), CliError> {
    let working_dir = match cli.dir {
        Some(dir) => dir.canonicalize().unwrap_or(dir),
        None => std::env::current_dir().map_err(anyhow::Error::from)?,
    };

    // One session per invocation, bound to the working directory.
    let session_id = Uuid::new_v4().to_string();
    let store = Arc::new(StaticSessionStore::default());
    store.bind(session_id.clone(), working_dir);
    let sessions = SessionRegistry::new(store, env_core::settings::load_settings());
    let handle = sessions.handle(&session_id)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let result = run(&handle, cli.command, cli.env_name.as_deref(), cli.json, &cancel).await;
    sessions.end_session(&session_id);
    result
}

/// The registry lives only as long as this process: reconcile it from disk,
/// then activate the `--env` environment if one was named.
async fn prepare(handle: &ManagerHandle, env_name: Option<&str>) -> Result<(), CliError> {
    for warning in handle.refresh().await {
        log::debug!("{}", warning);
    }
    if let Some(name) = env_name {
        handle.activate_environment(name).await?;
    }
    Ok(())
}

async fn run(
    handle: &ManagerHandle,
    command: Commands,
    env_name: Option<&str>,
    json: bool,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    match command {
        Commands::Interpreters => {
            let found = handle.discover_interpreters().await;
            if json {
                print_json(&found)?;
            } else {
                let rows: Vec<InterpreterRow> = found.iter().map(InterpreterRow::from).collect();
                print_table(rows, "No Python interpreters found.");
            }
        }
        Commands::Status => {
            prepare(handle, env_name).await?;
            print_status(&handle.get_status(cancel).await, json)?;
        }
        Commands::Env { command } => env_command(handle, command, env_name, json, cancel).await?,
        Commands::Pkg { command } => {
            prepare(handle, env_name).await?;
            pkg_command(handle, command, json, cancel).await?;
        }
        Commands::Requirements { command } => {
            prepare(handle, env_name).await?;
            match command {
                RequirementsCommands::Save { path, no_versions } => {
                    let written = handle
                        .save_requirements(path.as_deref(), !no_versions, cancel)
                        .await?;
                    if json {
                        print_json(&serde_json::json!({ "path": written }))?;
                    } else {
                        println!("Wrote {}", shorten_path(&written));
                    }
                }
                RequirementsCommands::Install { path } => {
                    let result = handle.install_from_requirements(path.as_deref(), cancel).await?;
                    print_op_result(&result, json)?;
                }
            }
        }
    }
    Ok(())
}

async fn env_command(
    handle: &ManagerHandle,
    command: EnvCommands,
    env_name: Option<&str>,
    json: bool,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    prepare(handle, env_name).await?;

    match command {
        EnvCommands::List => {
            let listing = handle.list_environments(cancel).await;
            if json {
                print_json(&listing)?;
            } else {
                let rows: Vec<EnvironmentRow> =
                    listing.environments.iter().map(EnvironmentRow::from).collect();
                print_table(rows, "No environments found.");
                print_warnings(&listing.warnings);
            }
        }
        EnvCommands::Create {
            name,
            kind,
            python,
            channels,
            system_site_packages,
        } => {
            let spec = match kind {
                EnvKind::Venv => EnvSpec::Venv {
                    system_site_packages,
                },
                EnvKind::Conda => EnvSpec::Conda { channels },
                EnvKind::Poetry => EnvSpec::Poetry,
            };
            let created = handle
                .create_environment(&name, spec, python.as_deref(), cancel)
                .await?;
            if json {
                print_json(&created)?;
            } else {
                println!(
                    "Created {} environment '{}' (Python {}) at {}",
                    created.kind,
                    created.name,
                    created.python_version.as_deref().unwrap_or("?"),
                    shorten_path(&created.path)
                );
            }
        }
        EnvCommands::Activate { name } => {
            let result = handle.activate_environment(&name).await?;
            if json {
                print_json(&result)?;
            } else {
                match result.previous {
                    Some(previous) if previous != result.active => {
                        println!("Activated '{}' (was '{}')", result.active, previous)
                    }
                    _ => println!("Activated '{}'", result.active),
                }
            }
        }
        EnvCommands::Delete { name } => {
            let result = handle.delete_environment(&name).await?;
            if json {
                print_json(&result)?;
            } else if result.was_active {
                println!("Deleted '{}'; no environment is active now", result.name);
            } else {
                println!("Deleted '{}'", result.name);
            }
        }
    }
    Ok(())
}

async fn pkg_command(
    handle: &ManagerHandle,
    command: PkgCommands,
    json: bool,
    cancel: &CancellationToken,
) -> Result<(), CliError> {
    match command {
        PkgCommands::Install { packages } => {
            let result = handle.install_packages(&packages, cancel).await?;
            print_op_result(&result, json)?;
        }
        PkgCommands::Uninstall { packages } => {
            let result = handle.uninstall_packages(&packages, cancel).await?;
            print_op_result(&result, json)?;
        }
        PkgCommands::List => {
            let packages = handle.list_installed_packages(cancel).await?;
            if json {
                print_json(&packages)?;
            } else {
                let rows: Vec<PackageRow> = packages.iter().map(PackageRow::from).collect();
                print_table(rows, "No packages installed.");
            }
        }
        PkgCommands::Outdated => {
            let packages = handle.check_outdated_packages(cancel).await?;
            if json {
                print_json(&packages)?;
            } else {
                let rows: Vec<PackageRow> = packages.iter().map(PackageRow::from).collect();
                print_table(rows, "All packages are up to date.");
            }
        }
        PkgCommands::Update { name } => {
            let result = handle.update_packages(name.as_deref(), cancel).await?;
            print_op_result(&result, json)?;
        }
        PkgCommands::Search { query, limit } => {
            let results = handle.search_packages(&query, limit).await?;
            if json {
                print_json(&results)?;
            } else {
                let rows: Vec<SearchRow> = results.iter().map(SearchRow::from).collect();
                print_table(rows, "No matching packages.");
            }
        }
        PkgCommands::Info { name } => match handle.get_package_info(&name, cancel).await? {
            Some(info) if json => print_json(&info)?,
            Some(info) => print_package_info(&info),
            None if json => print_json(&serde_json::Value::Null)?,
            None => println!("Package '{}' not found.", name),
        },
        PkgCommands::Deps { name } => {
            let deps = handle.get_package_dependencies(&name, cancel).await?;
            if json {
                print_json(&deps)?;
            } else if deps.is_empty() {
                println!("'{}' has no dependencies.", name);
            } else {
                for dep in deps {
                    println!("{}", dep);
                }
            }
        }
    }
    Ok(())
}
