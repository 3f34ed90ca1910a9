//! Host or join a session over an in-memory editing model.
//!
//! Run a host and a guest:
//!   cargo run -p reelsync-demo-session -- host --port 9000 --name Alice --color 255,0,0
//!   cargo run -p reelsync-demo-session -- join --host localhost --port 9000 --name Bob --color 0,255,0

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use reelsync_core::{ConnectionState, MessageRegistry};
use reelsync_session::memory::MemoryApplication;
use reelsync_session::model::{Application, Project};
use reelsync_session::tools::RosterEvent;
use reelsync_session::{ConnectionManager, Session, SessionConfig};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::rc::Rc;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reelsync", version, about = "Collaborative editing session")]
struct Cli {
    /// Session config (TOML)
    #[arg(long, global = true, env = "REELSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a session and share projects with everyone who joins
    Host {
        #[arg(long, default_value_t = 9000)]
        port: u16,

        /// Project file to share; an empty project is created if none is given
        #[arg(long)]
        project: Vec<PathBuf>,

        #[command(flatten)]
        profile: Profile,
    },
    /// Join a hosted session
    Join {
        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long, default_value_t = 9000)]
        port: u16,

        #[command(flatten)]
        profile: Profile,
    },
}

#[derive(Args)]
struct Profile {
    /// Name shown to other participants
    #[arg(long, env = "USER")]
    name: String,

    /// Cursor color as r,g,b
    #[arg(long, value_parser = parse_color)]
    color: Option<[u8; 3]>,
}

impl Profile {
    fn client_data(&self) -> Value {
        match self.color {
            Some(color) => json!({ "name": self.name, "color": color }),
            None => json!({ "name": self.name }),
        }
    }
}

fn parse_color(s: &str) -> Result<[u8; 3], String> {
    let channels = s
        .split(',')
        .map(|c| c.trim().parse::<u8>().map_err(|e| format!("{c:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    <[u8; 3]>::try_from(channels).map_err(|_| "expected three channels, e.g. 255,0,0".to_string())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("reelsync=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(cli.command, config))
}

async fn run(command: Command, config: SessionConfig) -> anyhow::Result<()> {
    let app = MemoryApplication::new();
    let manager = ConnectionManager::new(config, MessageRegistry::standard(), app.clone())?;

    let ended = Rc::new(Notify::new());
    let notify = ended.clone();
    manager.subscribe_state(move |change| {
        match &change.error {
            Some(error) => tracing::warn!(code = ?error.code, "{:?} -> {:?}: {}", change.old, change.new, error.text),
            None => tracing::info!("{:?} -> {:?}", change.old, change.new),
        }
        if change.new == ConnectionState::Disconnected {
            notify.notify_one();
        }
    });

    match command {
        Command::Host { port, project, profile } => {
            let mut shared = Vec::new();
            for path in &project {
                let opened = app
                    .open_project(path)
                    .with_context(|| format!("opening {}", path.display()))?;
                shared.push(opened.guid());
            }
            if shared.is_empty() {
                shared.push(app.create_project("Untitled").guid());
            }
            manager.start_server(port, profile.client_data(), &shared).await?;
            if let Some(port) = manager.local_port() {
                tracing::info!("sharing {} project(s) on port {}", shared.len(), port);
            }
        }
        Command::Join { host, port, profile } => {
            manager.connect_client(&host, port, profile.client_data())?;
        }
    }
    if let Some(session) = manager.session() {
        watch(&session);
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutting down");
        }
        _ = ended.notified() => {}
    }

    match manager.state() {
        ConnectionState::ServerRunning => manager.stop_server()?,
        ConnectionState::ClientConnecting | ConnectionState::ClientConnected => manager.disconnect_client()?,
        ConnectionState::Disconnected => {}
    }
    if let Some(error) = manager.error() {
        anyhow::bail!("{}", error.text);
    }
    Ok(())
}

fn watch(session: &Session) {
    session.client().subscribe_peer_count(|count| tracing::info!("{} peer(s) in the session", count));
    session.roster().subscribe(|event| match event {
        RosterEvent::Joined(participant) => tracing::info!("{} joined", participant.name),
        RosterEvent::Left(participant) => tracing::info!("{} left", participant.name),
        RosterEvent::Notification { from, message } => tracing::info!("[{}] {}", from, message),
    });
    session
        .project_push()
        .subscribe_progress(|progress| tracing::info!("loading projects: {}%", progress.percent));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_needs_three_channels() {
        assert_eq!(parse_color("255, 0,0"), Ok([255, 0, 0]));
        assert!(parse_color("255,0").is_err());
        assert!(parse_color("256,0,0").is_err());
    }

    #[test]
    fn cli_parses_both_roles() {
        let cli = Cli::parse_from(["reelsync", "join", "--port", "9100", "--name", "Bob", "--color", "0,255,0"]);
        let Command::Join { host, port, profile } = cli.command else {
            panic!("expected join");
        };
        assert_eq!((host.as_str(), port), ("localhost", 9100));
        assert_eq!(profile.client_data(), json!({"name": "Bob", "color": [0, 255, 0]}));

        let cli = Cli::parse_from(["reelsync", "host", "--name", "Alice"]);
        assert!(matches!(cli.command, Command::Host { port: 9000, .. }));
    }
}
