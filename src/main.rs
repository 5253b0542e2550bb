//! Dockyard - Manage containerized development services from the command line

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dockyard::core::{
    Badge, InstallProgressEvent, OperationResult, PortMapping, ServiceId, ServiceManager,
};
use dockyard::runtime::RuntimeAdapter;
use dockyard::{Database, DockerCli, InMemoryRuntime, InstallOptions, APP_NAME, APP_VERSION};

#[derive(Parser)]
#[command(name = "dockyard", version, about = "Manage containerized development services")]
struct Cli {
    /// Run against an in-memory runtime and database; nothing touches Docker or disk
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List declared services and their state
    List,
    /// Show container daemon status and host metrics
    Info,
    /// Show definition, state and configuration of a service
    Detail { id: String },
    /// Pull and create a service container
    Install {
        id: String,
        /// Create the container without starting it
        #[arg(long)]
        no_start: bool,
        /// Also configure host routing
        #[arg(long)]
        routing: bool,
    },
    /// Start an installed service
    Start { id: String },
    /// Stop a running service
    Stop { id: String },
    /// Restart an installed service
    Restart { id: String },
    /// Remove a service container
    Uninstall {
        id: String,
        /// Also remove the service's named volumes
        #[arg(long)]
        volumes: bool,
    },
    /// Publish a container port on a different host port
    SetPort {
        id: String,
        external: u16,
        internal: u16,
    },
    /// List labeled runtime resources, orphans and pending updates
    Resources,
    /// Show lifecycle history of a service
    History {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.debug);

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Initialize database
    let database = if cli.dry_run {
        Database::open_in_memory()?
    } else {
        Database::open_default()?
    };
    database.initialize()?;
    let database = Arc::new(database);

    let settings = database.load_settings()?.unwrap_or_default();
    if let Err(e) = database.prune_history(settings.history_retention_days) {
        warn!("Failed to prune history: {}", e);
    }

    let adapter: Arc<dyn RuntimeAdapter> = if cli.dry_run {
        Arc::new(InMemoryRuntime::new())
    } else {
        Arc::new(DockerCli::new(
            settings.docker_binary.clone(),
            settings.label_key.clone(),
        ))
    };

    let manager = ServiceManager::builder(adapter)
        .settings(settings)
        .config_store(database.clone())
        .observer(database.clone())
        .build();

    let daemon = manager.health().poll().await;
    if daemon.is_actionable() {
        if let Err(e) = manager.discover().await {
            warn!("Failed to discover existing containers: {}", e);
        }
    }

    run(cli.command, &manager, &database).await
}

async fn run(command: Command, manager: &ServiceManager, database: &Database) -> Result<ExitCode> {
    match command {
        Command::List => {
            for summary in manager.cache().list().value {
                let ports: Vec<String> = summary.ports.iter().map(PortMapping::to_string).collect();
                println!(
                    "{:<12} {:<14} {:<10} {}",
                    summary.id,
                    summary.phase,
                    summary.installed_version.as_deref().unwrap_or("-"),
                    ports.join(", ")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Info => {
            let Some(snapshot) = manager.health().snapshot() else {
                println!("Daemon status unknown");
                return Ok(ExitCode::FAILURE);
            };
            if !snapshot.is_actionable() {
                println!(
                    "Daemon unavailable: {}",
                    snapshot.status.error.as_deref().unwrap_or("not running")
                );
                return Ok(ExitCode::FAILURE);
            }
            println!("Daemon running (checked {})", snapshot.checked_at.to_rfc3339());
            if let Some(info) = manager.health().poll_info().await {
                println!("CPUs:   {} ({})", info.cpus, info.cpu_string());
                println!("Memory: {}", info.memory_string());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Detail { id } => {
            let detail = manager.cache().detail(&ServiceId::from(id))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&detail.value).context("Failed to render detail")?
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Install {
            id,
            no_start,
            routing,
        } => {
            let id = ServiceId::from(id);
            let mut subscription = manager.subscribe_progress(&id);
            let options = InstallOptions {
                start_immediately: !no_start,
                config: None,
                configure_routing: routing,
            };
            let install = manager.install(&id, options);
            tokio::pin!(install);
            let result = loop {
                tokio::select! {
                    result = &mut install => break result,
                    event = subscription.recv() => print_progress(&event),
                }
            };
            // Events published right before the install returned
            while let Some(event) = subscription.try_recv() {
                print_progress(&event);
            }
            Ok(report(&result))
        }
        Command::Start { id } => Ok(report(&manager.start(&ServiceId::from(id)).await)),
        Command::Stop { id } => Ok(report(&manager.stop(&ServiceId::from(id)).await)),
        Command::Restart { id } => Ok(report(&manager.restart(&ServiceId::from(id)).await)),
        Command::Uninstall { id, volumes } => {
            Ok(report(&manager.uninstall(&ServiceId::from(id), volumes).await))
        }
        Command::SetPort {
            id,
            external,
            internal,
        } => {
            let id = ServiceId::from(id);
            let mut config = manager.cache().detail(&id)?.value.config;
            match config.ports.iter_mut().find(|p| p.internal == internal) {
                Some(port) => port.external = external,
                None => config.ports.push(PortMapping::new(external, internal)),
            }
            Ok(report(&manager.update_config(&id, config)))
        }
        Command::Resources => {
            let reconciled = manager.refresh_resources().await?;
            let resources = manager.cache().resources().await?;
            for record in &resources.value {
                let bound = record
                    .bound_service_id
                    .as_ref()
                    .map(ServiceId::to_string)
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<40} {}", record.to_string(), bound);
            }
            match Badge::from_report(&reconciled) {
                Some(badge) => println!(
                    "{} orphaned, {} with updates available",
                    badge.orphans, badge.updates
                ),
                None => println!("Everything is in sync"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::History { id, limit } => {
            for entry in database.load_history(&ServiceId::from(id), limit)? {
                println!(
                    "{}  {:<18} {}",
                    entry.event_time.to_rfc3339(),
                    entry.event_type,
                    entry.details.as_deref().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_progress(event: &InstallProgressEvent) {
    match &event.progress {
        Some(progress) => println!("  {} {}", event.status, progress),
        None => println!("  {}", event.status),
    }
}

/// Print an operation result and map it to an exit code
fn report(result: &OperationResult) -> ExitCode {
    if result.success {
        println!("OK");
        if let Some(message) = &result.message {
            println!("{}", message);
        }
        ExitCode::SUCCESS
    } else {
        eprintln!(
            "Error: {}",
            result.error.as_deref().unwrap_or(dockyard::core::UNKNOWN_ERROR)
        );
        ExitCode::FAILURE
    }
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default = if debug { "dockyard=debug" } else { "dockyard=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
