use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use lsp_types::{DocumentSymbol, DocumentSymbolResponse};
use lspm::config::{RegistryEntry, RegistrySource};
use lspm::package::{resolve_method, Ecosystem, Platform};
use lspm::{ConfigLoader, LspError, LspManager, ServerConfigs, ServerInstaller};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Language Server Package Manager
///
/// Installs language servers and talks to them over LSP.
#[derive(Parser, Debug)]
#[command(name = "lspm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace root directory
    ///
    /// If not specified, attempts to auto-detect from:
    /// 1. Current directory's git root
    /// 2. Current working directory
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decompose a package identifier and show its install strategy
    Parse {
        /// e.g. pkg:npm/typescript-language-server@4.3.3
        id: String,
    },
    /// List known language servers and what is installed
    List,
    /// Install a language server by package name or language
    Install { package: String },
    /// Enable an installed language server
    Enable { language: String },
    /// Disable an installed language server
    Disable { language: String },
    /// Print the document symbols of a file
    Symbols {
        file: PathBuf,
        /// Language to use instead of detecting it from the extension
        #[arg(long)]
        language: Option<String>,
    },
}

fn setup_logging(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if let Some(log_path) = log_file {
        let file = std::fs::File::create(log_path)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

fn detect_workspace_root(provided: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = provided {
        return Ok(path.canonicalize()?);
    }

    // Try to find git root
    let current_dir = std::env::current_dir()?;
    let mut dir = current_dir.as_path();

    loop {
        if dir.join(".git").exists() {
            info!("Detected git root: {}", dir.display());
            return Ok(dir.to_path_buf());
        }

        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    info!("Using current directory as workspace root");
    Ok(current_dir)
}

/// Shared state for the commands that touch installed servers.
struct AppState {
    loader: ConfigLoader,
    configs: Arc<ServerConfigs>,
    data_dir: PathBuf,
}

impl AppState {
    fn load() -> Result<Self> {
        let loader = ConfigLoader::new().context("Failed to load configuration")?;
        let data_dir = loader.data_dir()?;
        let configs = ServerConfigs::load(data_dir.join("manifest.json"), loader.user_config())?;
        Ok(Self {
            loader,
            configs: Arc::new(configs),
            data_dir,
        })
    }

    /// Package name first, then language.
    fn entry(&self, package: &str) -> Result<RegistryEntry> {
        self.loader
            .get_lsp_by_name(package)
            .or_else(|_| self.loader.get_lsp_for_language(package))
            .map_err(|_| anyhow!("No language server named or registered for '{}'", package))
    }
}

fn parse(id: &str) -> Result<()> {
    let source = lspm::parse_package_id(id)
        .ok_or_else(|| anyhow!("Invalid package identifier: {}", id))?;
    let canonical = source.to_string();
    let platform = Platform::current();

    // Release assets and build commands are only known to the registry
    let registered = ConfigLoader::new().ok().and_then(|loader| {
        loader
            .list_available_lsps()
            .into_iter()
            .find(|entry| {
                lspm::parse_package_id(&entry.source.id)
                    .is_some_and(|known| known.to_string() == canonical)
            })
            .map(|entry| (entry.name.clone(), entry.installation_method(&platform)))
    });
    let (package, method) = match registered {
        Some((name, method)) => (Some(name), Some(method)),
        None if source.ecosystem == Ecosystem::Github => (None, None),
        None => {
            let bare = RegistrySource {
                id: id.to_string(),
                asset: None,
                build: None,
            };
            (None, Some(resolve_method(&bare, &platform)))
        }
    };

    let report = serde_json::json!({
        "canonical": canonical,
        "package": package,
        "method": method.map(|m| m.label()),
        "source": source,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn list() -> Result<()> {
    let ctx = AppState::load()?;
    let installed = ctx.configs.list_installed().await;

    for entry in ctx.loader.list_available_lsps() {
        let status = installed
            .iter()
            .find(|(_, server)| server.package == entry.name)
            .map(|(_, server)| {
                if server.enabled {
                    format!("installed {}", server.version)
                } else {
                    format!("disabled {}", server.version)
                }
            })
            .unwrap_or_default();
        println!(
            "{:<28} {:<24} {}",
            entry.name,
            entry.languages.join(","),
            status
        );
    }
    Ok(())
}

async fn install(package: &str) -> Result<()> {
    let ctx = AppState::load()?;
    let entry = ctx.entry(package)?;
    let installer = ServerInstaller::new(ctx.data_dir.join("servers"), Arc::clone(&ctx.configs));
    let mut updates = installer.subscribe();
    let mut printed = 0;

    println!("Installing {} ({})", entry.name, entry.source.id);
    let installation = installer.start_installation(&entry);
    tokio::pin!(installation);

    let result = loop {
        tokio::select! {
            result = &mut installation => break result,
            changed = updates.changed() => {
                if changed.is_err() {
                    continue;
                }
                printed = print_output(&updates, printed);
            }
            _ = tokio::signal::ctrl_c() => {
                if installer.cancel_installation() {
                    eprintln!("Cancelling...");
                }
            }
        }
    };
    print_output(&updates, printed);

    let binary = result?;
    println!("Installed {} at {}", entry.name, binary.path.display());
    Ok(())
}

fn print_output(
    updates: &tokio::sync::watch::Receiver<Option<lspm::InstallOperation>>,
    printed: usize,
) -> usize {
    let snapshot = updates.borrow();
    let Some(operation) = snapshot.as_ref() else {
        return printed;
    };
    for line in operation.output.iter().skip(printed) {
        println!("  {}", line);
    }
    operation.output.len()
}

async fn set_enabled(language: &str, enabled: bool) -> Result<()> {
    let ctx = AppState::load()?;
    if !ctx.configs.set_enabled(language, enabled).await? {
        bail!("No language server installed for {}", language);
    }
    println!(
        "{} {}",
        if enabled { "Enabled" } else { "Disabled" },
        language
    );
    Ok(())
}

async fn symbols(workspace: PathBuf, file: &Path, language: Option<String>) -> Result<()> {
    let ctx = AppState::load()?;
    let file = file
        .canonicalize()
        .with_context(|| format!("Cannot open {}", file.display()))?;
    let language = match language {
        Some(language) => language,
        None => ctx
            .loader
            .get_lsp_for_file(&file)?
            .primary_language()
            .to_string(),
    };

    let manager = LspManager::new(Arc::clone(&ctx.configs), ctx.loader.request_timeout());
    let client = manager
        .start_server(&language, workspace, Vec::new(), ctx.loader.start_policy())
        .await?;

    let result: Result<_, LspError> = async {
        let uri = client.open_path(&file).await?;
        client.document_symbols(&uri).await
    }
    .await;

    if let Err(e) = manager.stop_all_servers().await {
        for (language, error) in &e.failures {
            eprintln!("warning: {} did not stop cleanly: {}", language, error);
        }
    }

    match result? {
        Some(DocumentSymbolResponse::Nested(symbols)) => print_symbols(&symbols, 0),
        Some(DocumentSymbolResponse::Flat(symbols)) => {
            for symbol in symbols {
                println!(
                    "{:?} {} (line {})",
                    symbol.kind,
                    symbol.name,
                    symbol.location.range.start.line + 1
                );
            }
        }
        None => println!("No symbols"),
    }
    Ok(())
}

fn print_symbols(symbols: &[DocumentSymbol], depth: usize) {
    for symbol in symbols {
        println!(
            "{}{:?} {} (line {})",
            "  ".repeat(depth),
            symbol.kind,
            symbol.name,
            symbol.range.start.line + 1
        );
        if let Some(children) = &symbol.children {
            print_symbols(children, depth + 1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.log_file)?;

    info!("Starting LSPM v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Parse { id } => parse(&id),
        Command::List => list().await,
        Command::Install { package } => install(&package).await,
        Command::Enable { language } => set_enabled(&language, true).await,
        Command::Disable { language } => set_enabled(&language, false).await,
        Command::Symbols { file, language } => {
            let workspace = detect_workspace_root(args.workspace)?;
            info!("Workspace root: {}", workspace.display());
            symbols(workspace, &file, language).await
        }
    }
}
