use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use whisperdock::config::{config_path, Config};
use whisperdock::inference::LayoutCheckEngine;
use whisperdock::models::registry::suggest;
use whisperdock::models::{
    integrity, normalize, CatalogSort, ManagerEvent, ModelCatalogEntry, ModelLifecycleManager,
    ModelState,
};
use whisperdock::transfer::{format_bytes, TransferEvent};

#[derive(Parser)]
#[command(name = "whisperdock")]
#[command(about = "Download and manage on-device Whisper models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List models available for download
    List {
        #[arg(long, value_enum, default_value_t = SortArg::Recommended)]
        sort: SortArg,
    },
    /// List models found on disk
    Installed,
    /// Show the storage roots that are scanned
    Roots,
    /// Download a model and make it active (default: `[model].default`)
    Download { id: Option<String> },
    /// Unload the current model and activate another
    Switch { id: String },
    /// Delete every copy of a model
    Delete { id: String },
    /// Print the directory of a downloaded model
    Path { id: String },
    /// Check a file against a SHA-256 digest
    Verify { file: PathBuf, sha256: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Size,
    Recommended,
}

impl From<SortArg> for CatalogSort {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Size => Self::Size,
            SortArg::Recommended => Self::Recommended,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("whisperdock=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify { file, sha256 } => verify_file(&file, &sha256),
        command => run(command).await,
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let config = Config::load()?;
    let manager = Arc::new(
        ModelLifecycleManager::from_config(&config, Arc::new(LayoutCheckEngine::new())).await?,
    );

    match command {
        Commands::List { sort } => list_models(&manager, sort.into()).await,
        Commands::Installed => list_installed(&manager).await,
        Commands::Roots => {
            for root in manager.storage_roots() {
                let marker = if root.path.is_dir() { "" } else { " (missing)" };
                println!("{:<14} {}{marker}", root.convention, root.path.display());
            }
            Ok(())
        }
        Commands::Download { id } => {
            let id = id.unwrap_or_else(|| config.model.default.clone());
            let entry = find_entry(&manager, &id).await?;
            let path = with_progress(&manager, manager.download(&entry)).await?;
            println!("✓ {} ready at {}", entry.id, path.display());
            Ok(())
        }
        Commands::Switch { id } => {
            let entry = find_entry(&manager, &id).await?;
            let path = with_progress(&manager, manager.switch_model(&entry)).await?;
            remember_default(config, &entry.id)?;
            println!("✓ Active model set to '{}' ({})", entry.id, path.display());
            Ok(())
        }
        Commands::Delete { id } => {
            let report = manager.delete_model(&id).await?;
            if report.nothing_found() {
                println!("No copies of '{}' found", normalize(&id));
            } else {
                println!(
                    "✓ Removed {} of {} directories for '{}'",
                    report.removed_count,
                    report.attempted_paths.len(),
                    normalize(&id)
                );
            }
            if let Some(error) = report.first_error {
                bail!("Some directories could not be removed: {error}");
            }
            Ok(())
        }
        Commands::Path { id } => {
            let path = manager.resolve_active_model_directory(&id).await?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Verify { file, sha256 } => verify_file(&file, &sha256),
    }
}

async fn list_models(manager: &ModelLifecycleManager, sort: CatalogSort) -> anyhow::Result<()> {
    let mut catalog = manager.fetch_models().await;
    sort.apply(&mut catalog);
    let installed = manager.downloaded_models().await?;
    let active = manager.active_model();

    println!("Available models:\n");
    for entry in &catalog {
        let mut tags = Vec::new();
        if active.as_deref() == Some(entry.id.as_str()) {
            tags.push("active");
        } else if installed.contains(&entry.id) {
            tags.push("installed");
        }
        if entry.recommended {
            tags.push("recommended");
        }
        if !entry.supported {
            tags.push("unsupported");
        }

        println!(
            "  {:<34} {:>10}  {}{}",
            entry.id,
            format_bytes(entry.size_bytes),
            entry.description,
            if tags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", tags.join(", "))
            }
        );
    }

    Ok(())
}

async fn list_installed(manager: &ModelLifecycleManager) -> anyhow::Result<()> {
    let index = manager.downloaded_models().await?;
    if index.is_empty() {
        println!("No models installed. Download one with:\n  whisperdock download <id>");
        return Ok(());
    }

    let active = manager.active_model();
    println!("Installed models:\n");
    for artifact in index.iter() {
        let marker = if active.as_deref() == Some(artifact.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {:<34} {:>10}  {}",
            artifact.id,
            format_bytes(artifact.size_bytes),
            artifact.directory.display()
        );
    }
    println!("\nTotal: {}", format_bytes(index.total_size_bytes()));

    Ok(())
}

async fn find_entry(manager: &ModelLifecycleManager, id: &str) -> anyhow::Result<ModelCatalogEntry> {
    let catalog = manager.fetch_models().await;
    let id = normalize(id);

    if let Some(entry) = catalog.iter().find(|e| e.id == id) {
        return Ok(entry.clone());
    }
    match suggest(&id, &catalog) {
        Some(close) => bail!("Unknown model '{id}'. Did you mean '{close}'?"),
        None => bail!("Unknown model '{id}'. Run 'whisperdock list' to see available models"),
    }
}

/// Drive a manager request while rendering its progress; Ctrl-C cancels
async fn with_progress<T>(
    manager: &ModelLifecycleManager,
    request: impl std::future::Future<Output = whisperdock::Result<T>>,
) -> anyhow::Result<T> {
    let bar = ProgressBar::new(1_000);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );

    let mut events = manager.subscribe();
    tokio::pin!(request);
    let result = loop {
        tokio::select! {
            result = &mut request => break result,
            event = events.recv() => match event {
                Ok(ManagerEvent::State(ModelState::Downloading(fraction))) => {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    bar.set_position((fraction * 1_000.0) as u64);
                }
                Ok(ManagerEvent::State(ModelState::Loading)) => bar.set_message("loading"),
                Ok(ManagerEvent::Transfer(TransferEvent::Progress(progress))) => {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    bar.set_message(format!("{}/s", format_bytes(progress.bytes_per_second as u64)));
                }
                Ok(ManagerEvent::Transfer(TransferEvent::RetryScheduled { attempt, delay, reason })) => {
                    bar.println(format!("attempt {attempt} failed ({reason}), retrying in {}s", delay.as_secs()));
                }
                Ok(_) | Err(_) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                bar.set_message("cancelling");
                manager.cancel_download();
            }
        }
    };

    bar.finish_and_clear();
    Ok(result?)
}

/// Persist the switched-to model as the configured default
fn remember_default(mut config: Config, id: &str) -> anyhow::Result<()> {
    config.model.default = id.to_string();
    let path = config_path()?;
    config
        .save(&path)
        .with_context(|| format!("Failed to update {}", path.display()))
}

fn verify_file(file: &Path, expected: &str) -> anyhow::Result<()> {
    if !file.is_file() {
        bail!("{} does not exist", file.display());
    }
    if integrity::verify(file, expected) {
        println!("✓ {} matches", file.display());
        Ok(())
    } else {
        let actual = integrity::sha256_file(file)?;
        bail!("Checksum mismatch for {}: got {actual}", file.display())
    }
}
