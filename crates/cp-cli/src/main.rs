//! cocalc-plus CLI
//!
//! Single binary for remote sessions:
//! - `ssh`: start a daemon on a remote host and tunnel a local port to it
//! - `sync`: file-sync sessions supervised by a local scheduler process
//! - `forward`: standalone persistent port forwards
//! - `config`: manage the configuration file

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cocalc_plus::commands::{self, ConnectArgs, Context, ForwardCreateArgs, SyncCreateArgs, SyncEditArgs};
use cocalc_plus::output::print_error;
use cp_remote::PortChoice;
use cp_sync::{DesiredState, Prefer};

#[derive(Parser)]
#[command(name = "cocalc-plus")]
#[command(author, version, about = "Remote daemon sessions over ssh, with file sync")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Local data directory (registry, session database, pid files)
    #[arg(long, global = true, env = "COCALC_PLUS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a remote target, or manage known targets
    Ssh(SshCommand),

    /// Manage file-sync sessions
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Manage persistent port forwards
    Forward {
        #[command(subcommand)]
        action: ForwardAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
#[command(args_conflicts_with_subcommands = true)]
#[command(subcommand_negates_reqs = true)]
struct SshCommand {
    #[command(subcommand)]
    action: Option<SshAction>,

    #[command(flatten)]
    connect: ConnectFlags,
}

#[derive(Args)]
struct ConnectFlags {
    /// Remote target: [user@]host[:port]
    #[arg(required = true)]
    target: Option<String>,
    /// Local port for the tunnel (number or 'auto')
    #[arg(long, default_value = "auto")]
    local_port: PortChoice,
    /// Remote port for the daemon (number or 'auto')
    #[arg(long, default_value = "auto")]
    remote_port: PortChoice,
    /// Don't open the URL in a browser
    #[arg(long)]
    no_open: bool,
    /// Fail instead of installing a missing remote binary
    #[arg(long)]
    no_install: bool,
    /// Reinstall and restart the remote daemon
    #[arg(long)]
    upgrade: bool,
    /// Only open the tunnel; never install or start anything
    #[arg(long)]
    forward_only: bool,
    /// Identity file passed to ssh
    #[arg(short, long)]
    identity: Option<PathBuf>,
    /// Jump host passed to ssh
    #[arg(short = 'J', long)]
    proxy_jump: Option<String>,
    /// Extra argument for ssh (repeatable)
    #[arg(long = "ssh-arg", allow_hyphen_values = true)]
    ssh_args: Vec<String>,
}

#[derive(Subcommand)]
enum SshAction {
    /// List known targets
    List {
        /// Don't contact the remotes
        #[arg(long)]
        offline: bool,
        /// Bypass the status cache
        #[arg(short, long)]
        force: bool,
    },
    /// Show daemon status on a target
    Status {
        target: String,
        /// Bypass the status cache
        #[arg(short, long)]
        force: bool,
    },
    /// Close the tunnel and stop the remote daemon
    Stop { target: String },
    /// Close the tunnel and remove the target from the registry
    Forget { target: String },
    /// Star a target so it sorts first
    Star {
        target: String,
        /// Remove the star
        #[arg(long)]
        off: bool,
    },
    /// Check every target for a newer release
    Upgrades {
        /// Bypass the manifest and version caches
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum SyncAction {
    /// Create a sync session and start it
    Create {
        /// Session name
        #[arg(short, long)]
        name: String,
        /// First endpoint: path or host[:port]:path
        alpha: String,
        /// Second endpoint: path or host[:port]:path
        beta: String,
        /// Which side wins conflicts
        #[arg(long, default_value = "alpha")]
        prefer: Prefer,
        /// Ignore rule (repeatable)
        #[arg(long)]
        ignore: Vec<String>,
        /// Merge strategy passed to the scheduler
        #[arg(long)]
        merge_strategy: Option<String>,
        /// Label as key=value (repeatable)
        #[arg(short, long = "label")]
        labels: Vec<String>,
        /// Create without starting
        #[arg(long)]
        stopped: bool,
    },
    /// List sessions
    List {
        /// Label selector: k=v, !k=v, k, !k (repeatable, all must match)
        #[arg(short, long)]
        selector: Vec<String>,
        /// Show detailed information
        #[arg(short, long)]
        long: bool,
    },
    /// Show one session
    Status {
        /// Session id or name
        session: String,
    },
    /// Change a session's options
    Edit {
        /// Session id or name
        session: String,
        /// New name
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        prefer: Option<Prefer>,
        /// Replace ignore rules (repeatable)
        #[arg(long)]
        ignore: Vec<String>,
        /// Remove all ignore rules
        #[arg(long, conflicts_with = "ignore")]
        clear_ignore: bool,
        #[arg(long)]
        merge_strategy: Option<String>,
        /// Set a label as key=value (repeatable)
        #[arg(short, long = "label")]
        labels: Vec<String>,
        /// Remove a label (repeatable)
        #[arg(long)]
        unlabel: Vec<String>,
    },
    /// Start sessions
    Start {
        #[arg(required = true)]
        sessions: Vec<String>,
    },
    /// Stop sessions
    Stop {
        #[arg(required = true)]
        sessions: Vec<String>,
    },
    /// Stop and delete sessions
    Remove {
        #[arg(required = true)]
        sessions: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ForwardAction {
    /// Create a forward and start it
    Create {
        /// Forward name
        #[arg(short, long)]
        name: String,
        /// Remote target: [user@]host[:port]
        target: String,
        /// Local port
        #[arg(long)]
        local_port: u16,
        /// Port on the remote loopback
        #[arg(long)]
        remote_port: u16,
        /// Create without starting
        #[arg(long)]
        stopped: bool,
    },
    /// List forwards
    List,
    /// Start forwards
    Start {
        #[arg(required = true)]
        forwards: Vec<String>,
    },
    /// Stop forwards
    Stop {
        #[arg(required = true)]
        forwards: Vec<String>,
    },
    /// Stop and delete forwards
    Remove {
        #[arg(required = true)]
        forwards: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show config file path
    Path,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Get specific config value
    Get { key: String },
    /// Set config value
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        // Config commands work on the file itself, not the parsed settings
        Commands::Config { action } => config_command(cli.config.as_deref(), action),
        Commands::Ssh(ssh) => ssh_command(&Context::load(cli.config, cli.data_dir)?, ssh).await,
        Commands::Sync { action } => sync_command(&Context::load(cli.config, cli.data_dir)?, action).await,
        Commands::Forward { action } => {
            forward_command(&Context::load(cli.config, cli.data_dir)?, action).await
        }
    }
}

fn config_command(path: Option<&Path>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => commands::config_show(path),
        ConfigAction::Path => commands::config_path(path),
        ConfigAction::Init { force } => commands::config_init(path, force),
        ConfigAction::Get { key } => commands::config_get(path, &key),
        ConfigAction::Set { key, value } => commands::config_set(path, &key, &value),
    }
}

async fn ssh_command(ctx: &Context, ssh: SshCommand) -> Result<()> {
    match ssh.action {
        Some(SshAction::List { offline, force }) => commands::ssh_list(ctx, offline, force).await,
        Some(SshAction::Status { target, force }) => commands::ssh_status(ctx, &target, force).await,
        Some(SshAction::Stop { target }) => commands::ssh_stop(ctx, &target).await,
        Some(SshAction::Forget { target }) => commands::ssh_forget(ctx, &target).await,
        Some(SshAction::Star { target, off }) => commands::ssh_star(ctx, &target, !off),
        Some(SshAction::Upgrades { force }) => commands::ssh_upgrades(ctx, force).await,
        None => {
            let flags = ssh.connect;
            let Some(target) = flags.target else {
                anyhow::bail!("A target is required");
            };
            let args = ConnectArgs {
                target,
                local_port: flags.local_port,
                remote_port: flags.remote_port,
                no_open: flags.no_open,
                no_install: flags.no_install,
                upgrade: flags.upgrade,
                forward_only: flags.forward_only,
                identity: flags.identity,
                proxy_jump: flags.proxy_jump,
                ssh_args: flags.ssh_args,
            };
            commands::ssh_connect(ctx, args, shutdown_token()).await
        }
    }
}

async fn sync_command(ctx: &Context, action: SyncAction) -> Result<()> {
    match action {
        SyncAction::Create {
            name,
            alpha,
            beta,
            prefer,
            ignore,
            merge_strategy,
            labels,
            stopped,
        } => {
            let args = SyncCreateArgs {
                name,
                alpha,
                beta,
                prefer,
                ignore,
                merge_strategy,
                labels,
                stopped,
            };
            commands::sync_create(ctx, args).await
        }
        SyncAction::List { selector, long } => commands::sync_list(ctx, &selector, long).await,
        SyncAction::Status { session } => commands::sync_status(ctx, &session).await,
        SyncAction::Edit {
            session,
            name,
            prefer,
            ignore,
            clear_ignore,
            merge_strategy,
            labels,
            unlabel,
        } => {
            let args = SyncEditArgs {
                name,
                prefer,
                ignore,
                clear_ignore,
                merge_strategy,
                labels,
                unlabel,
            };
            commands::sync_edit(ctx, &session, args).await
        }
        SyncAction::Start { sessions } => {
            commands::sync_set_state(ctx, &sessions, DesiredState::Running).await
        }
        SyncAction::Stop { sessions } => {
            commands::sync_set_state(ctx, &sessions, DesiredState::Stopped).await
        }
        SyncAction::Remove { sessions } => commands::sync_remove(ctx, &sessions).await,
    }
}

async fn forward_command(ctx: &Context, action: ForwardAction) -> Result<()> {
    match action {
        ForwardAction::Create {
            name,
            target,
            local_port,
            remote_port,
            stopped,
        } => {
            let args = ForwardCreateArgs {
                name,
                target,
                local_port,
                remote_port,
                stopped,
            };
            commands::forward_create(ctx, args).await
        }
        ForwardAction::List => commands::forward_list(ctx).await,
        ForwardAction::Start { forwards } => {
            commands::forward_set_state(ctx, &forwards, DesiredState::Running).await
        }
        ForwardAction::Stop { forwards } => {
            commands::forward_set_state(ctx, &forwards, DesiredState::Stopped).await
        }
        ForwardAction::Remove { forwards } => commands::forward_remove(ctx, &forwards).await,
    }
}

/// Cancelled on Ctrl+C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, closing tunnel...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, closing tunnel...");
            }
        }

        cancel_clone.cancel();
    });
    cancel
}
