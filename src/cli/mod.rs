use crate::config::{load_index_config, load_peer_config};
use crate::error::{Result, ShareError};
use crate::peer::{PeerSession, SessionEvent};
use crate::server::{IndexServer, ServerHandle};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser)]
#[command(name = "peershare")]
#[command(about = "Peer-to-peer file sharing with a central index server", long_about = None)]
pub struct Cli {
    /// TOML file with [index] and/or [peer] tables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the index server. Reads `discover <host>`, `ping <host>` and
    /// `shutdown` from stdin.
    Server {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Join as a peer. Reads `publish <local> <name>`, `fetch <name>`,
    /// `list` and `quit` from stdin.
    Peer {
        /// Unique hostname to register with the index server
        #[arg(long)]
        hostname: Option<String>,

        /// Index server address
        #[arg(short, long)]
        server: Option<SocketAddr>,

        /// Address for the transfer listener
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Download directory
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Server { bind } => {
                let mut config = load_index_config(self.config.as_deref())?;
                if let Some(bind) = bind {
                    config.bind_addr = *bind;
                }
                run_server(IndexServer::bind(config).await?).await
            }

            Commands::Peer {
                hostname,
                server,
                listen,
                dir,
            } => {
                let mut config = load_peer_config(self.config.as_deref())?;
                if let Some(hostname) = hostname {
                    config.hostname = hostname.clone();
                }
                if let Some(server) = server {
                    config.server_addr = *server;
                }
                if let Some(listen) = listen {
                    config.listen_addr = *listen;
                }
                if let Some(dir) = dir {
                    config.download_dir = dir.clone();
                }
                if config.hostname.is_empty() {
                    return Err(ShareError::Config(
                        "a hostname is required (--hostname or [peer] hostname)".to_string(),
                    ));
                }
                run_peer(PeerSession::connect(config).await?).await
            }
        }
    }
}

async fn run_server(server: IndexServer) -> Result<()> {
    let handle = server.handle();
    let mut task = tokio::spawn(server.run());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            result = &mut task => {
                if let Err(e) = result {
                    warn!("Server task ended abnormally: {}", e);
                }
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => handle.shutdown(),
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => server_command(&handle, line.trim()).await,
                None => stdin_open = false,
            },
        }
    }
}

async fn server_command(handle: &ServerHandle, command: &str) {
    let parts: Vec<&str> = command.split_whitespace().collect();

    match parts.as_slice() {
        [] => println!("Server command cannot be blank!"),
        ["discover", hostname] => {
            let hosts = handle.discover(hostname).await;
            if hosts.is_empty() {
                println!("No hosts found with hostname '{}'", hostname);
            }
            for host in hosts {
                println!("Files on '{}' ({}):", hostname, host.listen_addr);
                for file in &host.files {
                    println!("  {} -> {}", file.published_name, file.local_name);
                }
            }
        }
        ["ping", hostname] => {
            let reports = handle.ping(hostname).await;
            if reports.is_empty() {
                println!("Unknown client '{}'", hostname);
            }
            for report in reports {
                println!("{}", report);
            }
        }
        ["shutdown"] => handle.shutdown(),
        _ => println!("Unknown server command: {}", command),
    }
}

async fn run_peer(session: PeerSession) -> Result<()> {
    println!(
        "Registered as '{}', serving on {}",
        session.hostname(),
        session.listen_addr()
    );

    if let Some(mut events) = session.events().await {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let parts: Vec<&str> = line.split_whitespace().collect();
        let result = match parts.as_slice() {
            [] => Ok(()),
            ["publish", local_name, published_name] => {
                session.publish(local_name, published_name).await
            }
            ["fetch", published_name] => session.fetch(published_name).await,
            ["list"] => {
                for (name, path) in session.shared_files().list().await {
                    println!("  {} -> {}", name, path.display());
                }
                Ok(())
            }
            ["quit"] => break,
            _ => {
                println!("Unknown command: {}", line);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("Error: {}", e);
        }
    }

    session.quit().await
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Downloaded { fname, path, bytes } => {
            println!("Fetched '{}' into {} ({} bytes)", fname, path.display(), bytes)
        }
        SessionEvent::DownloadFailed { fname, reason } => {
            println!("Fetch of '{}' failed: {}", fname, reason)
        }
        SessionEvent::NotFound { fname, message } => {
            println!("'{}' not found: {}", fname, message)
        }
        SessionEvent::ServerError(message) => println!("Server error: {}", message),
        SessionEvent::Disconnected => println!("Connection closed by the server."),
    }
}
