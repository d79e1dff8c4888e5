use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use mood_auth::{
    ChannelNavigator, ConfigError, ErrorCode, Navigator, PersistError, SessionConfig, SessionError, SessionFile,
    SessionManager, SessionState, TracingNavigator,
};
use serde_json::Value;

const DEFAULT_SESSION_DIR: &str = ".mood-auth";
const DEFAULT_SESSION_FILE: &str = "session.json";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("login failed [{code}]: {source}")]
    Session {
        code: &'static str,
        #[source]
        source: SessionError,
    },
    #[error("session file error: {0}")]
    Persist(#[from] PersistError),
    #[error("no session file: pass --session-file or set AUTH_SESSION_FILE")]
    MissingSessionFile,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

impl From<SessionError> for CliError {
    fn from(source: SessionError) -> Self {
        Self::Session { code: source.error_code(), source }
    }
}

#[derive(Parser, Debug)]
#[command(name = "mood-auth", about = "Mood Notes session CLI")]
struct Cli {
    #[arg(long, env = "AUTH_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "AUTH_SESSION_FILE")]
    session_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and persist the session.
    Login(Credentials),
    /// Forget the persisted session.
    Logout,
    /// Show the persisted session.
    Status,
    /// Log in, print every session change, log out on Ctrl-C.
    Watch(Credentials),
}

#[derive(Args, Debug)]
struct Credentials {
    #[arg(long, env = "AUTH_EMAIL")]
    email: String,

    #[arg(long, env = "AUTH_PASSWORD", hide_env_values = true)]
    password: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = dotenv {
        if !e.not_found() {
            tracing::warn!(error = %e, ".env not loaded");
        }
    }

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    match cli.command {
        Command::Login(creds) => run_login(&config, creds).await,
        Command::Logout => run_logout(&config),
        Command::Status => run_status(&config),
        Command::Watch(creds) => run_watch(&config, creds).await,
    }
}

/// Environment first, then flags, then the home-directory session file.
fn build_config(cli: &Cli) -> Result<SessionConfig, CliError> {
    let mut config = SessionConfig::from_env_with(cli.base_url.as_deref())?;
    config.session_file = cli
        .session_file
        .clone()
        .or(config.session_file)
        .or_else(default_session_file);
    Ok(config)
}

fn default_session_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_SESSION_DIR).join(DEFAULT_SESSION_FILE))
}

fn manager(config: &SessionConfig, navigator: Arc<dyn Navigator>) -> Result<SessionManager, CliError> {
    let manager = SessionManager::from_config(config, navigator)?;
    manager.restore();
    Ok(manager)
}

async fn run_login(config: &SessionConfig, creds: Credentials) -> Result<(), CliError> {
    let manager = manager(config, Arc::new(TracingNavigator))?;
    let state = manager.login(&creds.email, &creds.password).await?;
    print_session(&state)
}

fn run_logout(config: &SessionConfig) -> Result<(), CliError> {
    let manager = manager(config, Arc::new(TracingNavigator))?;
    manager.logout();
    println!("logged out");
    Ok(())
}

fn run_status(config: &SessionConfig) -> Result<(), CliError> {
    let file = config
        .session_file
        .as_ref()
        .map(SessionFile::new)
        .ok_or(CliError::MissingSessionFile)?;
    let state = file.load()?.unwrap_or_default();
    print_session(&state)
}

async fn run_watch(config: &SessionConfig, creds: Credentials) -> Result<(), CliError> {
    let (navigator, mut destinations) = ChannelNavigator::new();
    let manager = manager(config, Arc::new(navigator))?;
    let mut changes = manager.store().subscribe();

    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        while let Ok(dest) = destinations.try_recv() {
                            println!("-> {dest}");
                        }
                        break;
                    }
                    let state = changes.borrow_and_update().clone();
                    if let Err(e) = print_session(&state) {
                        tracing::warn!(error = %e, "failed to render session");
                    }
                }
                Some(dest) = destinations.recv() => println!("-> {dest}"),
                else => break,
            }
        }
    });

    let outcome = manager.login(&creds.email, &creds.password).await;
    if outcome.is_ok() {
        tokio::signal::ctrl_c().await?;
        manager.logout();
    }

    // Dropping the manager closes both channels and ends the printer.
    drop(manager);
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "printer task failed");
    }
    outcome.map(|_| ()).map_err(CliError::from)
}

fn print_session(state: &SessionState) -> Result<(), CliError> {
    match state.user() {
        Some(user) => {
            println!("logged in");
            print_json(user.profile())
        }
        None => {
            println!("logged out");
            Ok(())
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
