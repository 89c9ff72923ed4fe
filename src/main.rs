mod admin;
mod auth;
mod config;
mod db;
mod error;
mod git;
mod health;
mod hook;
mod http;
mod metrics;
mod push;
mod serv;
mod ssh;

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::access::{AccessControl, DbMembership, Membership};
use crate::config::Config;
use crate::db::{Database, Repository, User};
use crate::error::GatewayError;
use crate::git::{GitRunner, HookEnv, RepoRef};
use crate::hook::HookCommand;
use crate::metrics::MetricsRegistry;
use crate::push::LiveEffects;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "Git protocol access gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = "GITGATE_CONFIG",
        default_value = "custom/conf/gitgate.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// The config path made absolute against the current directory. It is
    /// baked into hook shims and the hook environment, and git runs hooks
    /// from inside the repository.
    fn config_path(&self) -> Result<PathBuf> {
        std::path::absolute(&self.config)
            .with_context(|| format!("failed to resolve config path {}", self.config.display()))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SSH and HTTP front doors.
    Web,
    /// Dispatch one SSH command for an authenticated key.
    Serv {
        /// `key-<id>` of the key that authenticated the session.
        key: String,
    },
    /// Platform hooks, invoked by the shims git runs.
    Hook {
        #[command(subcommand)]
        hook: HookArgs,
    },
    /// Operator bootstrap commands.
    Admin {
        #[command(subcommand)]
        command: admin::AdminCommand,
    },
}

#[derive(Subcommand, Debug)]
enum HookArgs {
    PreReceive,
    Update {
        ref_name: String,
        old_oid: String,
        new_oid: String,
    },
    PostReceive,
}

impl From<HookArgs> for HookCommand {
    fn from(args: HookArgs) -> Self {
        match args {
            HookArgs::PreReceive => HookCommand::PreReceive,
            HookArgs::Update {
                ref_name,
                old_oid,
                new_oid,
            } => HookCommand::Update {
                ref_name,
                old_oid,
                new_oid,
            },
            HookArgs::PostReceive => HookCommand::PostReceive,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by the front doors, the dispatcher and the admin commands.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Handed to child processes so they load the same file.
    pub config_path: PathBuf,
    pub db: Database,
    pub membership: Arc<dyn Membership>,
    pub git: GitRunner,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub async fn build(config: Config, config_path: PathBuf) -> Result<Self> {
        let db = Database::connect(&config.database)
            .await
            .with_context(|| format!("failed to open database {}", config.database.path.display()))?;
        Self::with_database(config, config_path, db)
    }

    fn with_database(config: Config, config_path: PathBuf, db: Database) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("gitgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            git: GitRunner::new(&config.git),
            membership: Arc::new(DbMembership::new(db.clone())),
            config: Arc::new(config),
            config_path,
            db,
            metrics: MetricsRegistry::new(),
            http_client,
        })
    }

    #[cfg(test)]
    pub async fn for_tests(config: Config) -> Self {
        let db = Database::in_memory().await.unwrap();
        Self::with_database(config, PathBuf::from("/etc/gitgate.yaml"), db).unwrap()
    }

    pub fn access(&self) -> AccessControl<'_> {
        AccessControl {
            db: &self.db,
            membership: self.membership.as_ref(),
            require_signin_view: self.config.auth.require_signin_view,
        }
    }

    pub fn push_effects(&self) -> LiveEffects {
        LiveEffects::new(
            self.db.clone(),
            self.http_client.clone(),
            self.config.hooks.local_root_url.clone(),
        )
    }

    /// Look up owner and repository. Either one missing is `ResourceNotFound`.
    pub async fn resolve_repo(&self, repo_ref: &RepoRef) -> Result<(User, Repository), GatewayError> {
        let not_found = |e: db::Error| {
            if e.is_not_found() {
                GatewayError::ResourceNotFound(format!("{}/{}", repo_ref.owner, repo_ref.name))
            } else {
                e.into()
            }
        };
        let owner = self.db.users().get_by_name(&repo_ref.owner).await.map_err(not_found)?;
        let repo = self
            .db
            .repos()
            .get_by_owner_and_name(owner.id, &repo_ref.name)
            .await
            .map_err(not_found)?;
        Ok((owner, repo))
    }

    pub fn repo_path(&self, owner: &User, repo: &Repository, is_wiki: bool) -> PathBuf {
        let root = &self.config.repository.root;
        if is_wiki {
            repo.wiki_path(root, &owner.name)
        } else {
            repo.repo_path(root, &owner.name)
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_web_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// `serv` and `hook` own neither stdout (the git wire) nor stderr (relayed to
/// the client), so they log to `{log_dir}/{name}.log`.
fn init_file_tracing(config: &Config, name: &str) -> Result<()> {
    let log_dir = &config.app.log_dir;
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
    let path = log_dir.join(format!("{name}.log"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let default_level = if config.is_dev() { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr: std::net::SocketAddr = state
        .config
        .http
        .listen
        .parse()
        .context("invalid http.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn run_web(config: Config, config_path: PathBuf) -> Result<()> {
    init_web_tracing();
    tracing::info!(config_path = %config_path.display(), "starting gitgate");

    tokio::fs::create_dir_all(&config.repository.root)
        .await
        .with_context(|| {
            format!(
                "failed to create repository root {}",
                config.repository.root.display()
            )
        })?;

    let state = Arc::new(AppState::build(config, config_path).await?);

    let http_handle = tokio::spawn({
        let s = Arc::clone(&state);
        async move {
            if let Err(e) = run_http_server(s).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
    });

    let ssh_handle = tokio::spawn({
        let s = Arc::clone(&state);
        async move {
            if s.config.ssh.disabled {
                tracing::info!("built-in SSH server disabled");
                return;
            }
            tokio::select! {
                res = ssh::start_ssh_server(s) => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "SSH server failed");
                    }
                }
                () = shutdown_signal() => {}
            }
        }
    });

    let _ = tokio::try_join!(http_handle, ssh_handle);

    state.db.clone().close().await;
    tracing::info!("gitgate shut down cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Subprocess roles
// ---------------------------------------------------------------------------

/// Without a config there is no run mode and no log file; the client only
/// gets the opaque line and never the server-side paths in the error.
fn config_load_failed<W: Write>(stderr: &mut W) {
    let _ = writeln!(stderr, "gitgate: Internal error");
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

async fn run_serv<W: Write>(config_path: &Path, key: &str, stderr: &mut W) -> i32 {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(_) => {
            config_load_failed(stderr);
            return 1;
        }
    };
    // Logging is best-effort here; a push must not fail on a log file.
    let _ = init_file_tracing(&config, "serv");

    let state = match AppState::build(config, config_path.to_path_buf()).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "failed to initialise serv");
            eprintln!("gitgate: Internal error");
            return 1;
        }
    };

    let original_command = env_nonempty("SSH_ORIGINAL_COMMAND");
    let git_protocol = env_nonempty("GIT_PROTOCOL");
    let code = serv::serve(
        &state,
        key,
        original_command.as_deref(),
        git_protocol.as_deref(),
        stderr,
    )
    .await;
    state.db.close().await;
    code
}

async fn run_hook(config_path: &Path, hook: HookCommand) -> i32 {
    let stderr = &mut std::io::stderr();
    let env = match HookEnv::from_process_env() {
        Ok(Some(env)) => env,
        Ok(None) => return 0,
        Err(e) => {
            eprintln!("gitgate: {}", e.public_message());
            return 1;
        }
    };
    let config_path = if config_path.exists() {
        config_path.to_path_buf()
    } else {
        env.config_path.clone()
    };
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(_) => {
            config_load_failed(stderr);
            return 1;
        }
    };
    let _ = init_file_tracing(&config, "hooks");

    let stdin = match hook {
        HookCommand::Update { .. } => Vec::new(),
        _ => {
            let mut buf = Vec::new();
            if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
                tracing::error!(error = %e, "failed to read hook input");
                eprintln!("gitgate: Internal error");
                return 1;
            }
            buf
        }
    };

    let db = match Database::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "failed to open database");
            eprintln!("gitgate: Internal error");
            return 1;
        }
    };
    let code = hook::run(&db, &hook, Some(&env), &stdin, stderr).await;
    db.close().await;
    code
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path();

    match cli.command {
        Command::Web => {
            let config_path = config_path?;
            let config = config::load_config(&config_path)?;
            run_web(config, config_path).await
        }
        Command::Serv { key } => {
            let config_path = config_path.unwrap_or(cli.config);
            let code = run_serv(&config_path, &key, &mut std::io::stderr()).await;
            std::process::exit(code);
        }
        Command::Hook { hook } => {
            let config_path = config_path.unwrap_or(cli.config);
            let code = run_hook(&config_path, hook.into()).await;
            std::process::exit(code);
        }
        Command::Admin { command } => {
            let config_path = config_path?;
            let config = config::load_config(&config_path)?;
            let state = AppState::build(config, config_path).await?;
            let res = admin::run(&state, command, &mut std::io::stdout()).await;
            state.db.close().await;
            res
        }
    }
}
