//! Quill bridge: host process, worker process and a local document server
//! in one executable.
//!
//! `host` (the default) binds the control plane, re-runs this executable as
//! `worker`, drives the handshake and prints the project listing the worker
//! reports. `serve-docs` runs the in-memory realtime backend for local use.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde_json::json;

use quill_sync::capabilities::LIST_PROJECTS;
use quill_sync::realtime::{DocServer, DocServerConfig};
use quill_sync::worker::{run_worker_process, termination_signal};
use quill_sync::{
    BridgeConfig, ControlPlaneServer, CredentialProvider, DirectoryCache, HostController,
    HostOptions, HttpProjectDirectory, StaticToken, WorkerExit, WorkerProcess,
};

#[derive(Parser, Debug)]
#[command(
    name = "quill-bridge",
    version,
    about = "Host/worker bridge to the Quill realtime backend"
)]
struct Cli {
    #[command(flatten)]
    endpoints: EndpointArgs,
    #[command(subcommand)]
    command: Option<Command>,
}

/// Overrides applied on top of defaults and `QUILL_*` variables.
#[derive(Args, Debug)]
struct EndpointArgs {
    #[arg(long, global = true)]
    http_base_url: Option<String>,
    #[arg(long, global = true)]
    ws_base_url: Option<String>,
    #[arg(long, global = true)]
    control_plane_port: Option<u16>,
    #[arg(long, global = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn a worker and drive it (default).
    Host,
    /// Run as the worker half; only valid when spawned by a host.
    Worker,
    /// Serve documents from memory over the realtime protocol.
    ServeDocs {
        #[arg(long, default_value = "127.0.0.1:9090")]
        bind: String,
        /// JSON file of `{"<collection>": {"<doc id>": <document>}}`.
        #[arg(long)]
        seed: Option<PathBuf>,
    },
}

fn config_from(args: EndpointArgs) -> BridgeConfig {
    let mut config = BridgeConfig::from_env();
    if let Some(url) = args.http_base_url {
        config.http_base_url = url;
    }
    if let Some(url) = args.ws_base_url {
        config.ws_base_url = url;
    }
    if let Some(port) = args.control_plane_port {
        config.control_plane_port = port;
    }
    if args.token.is_some() {
        config.auth_token = args.token;
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries IPC in the worker; logs go to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = config_from(cli.endpoints);

    match cli.command.unwrap_or(Command::Host) {
        Command::Host => run_host(config).await,
        Command::Worker => {
            run_worker_process(config).await;
            Ok(())
        }
        Command::ServeDocs { bind, seed } => serve_docs(bind, seed, config.auth_token).await,
    }
}

enum Outcome {
    SessionDone(anyhow::Result<()>),
    WorkerExited(std::io::Result<WorkerExit>),
}

async fn run_host(config: BridgeConfig) -> anyhow::Result<()> {
    let token = config
        .auth_token
        .clone()
        .context("no bearer token: pass --token or set QUILL_AUTH_TOKEN")?;
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticToken::new(token));

    let control =
        ControlPlaneServer::bind(config.control_plane_port, config.request_timeout).await?;
    let source = HttpProjectDirectory::new(
        config.http_base_url.clone(),
        credentials.clone(),
        config.request_timeout,
    )?;
    let directory = Arc::new(DirectoryCache::new(Arc::new(source), config.directory_throttle));

    let mut worker = WorkerProcess::spawn_current_exe(["worker"]).context("spawning worker")?;
    let (stdin, stdout) = worker.take_pipes().context("worker pipes unavailable")?;
    let options = HostOptions {
        control_plane_port: control.port(),
        ..HostOptions::from(&config)
    };
    let host = HostController::start(stdout, stdin, directory, credentials, options);

    let session = async {
        if !host.wait_handshake(config.handshake_timeout).await {
            bail!("worker did not complete the handshake within {:?}", config.handshake_timeout);
        }
        let ready_within = config.connect_timeout + config.request_timeout;
        let capabilities = control.wait_registered(ready_within).await?;
        info!("Worker registered capabilities: {}", capabilities.join(", "));

        let listing = control.invoke(LIST_PROJECTS, json!({})).await?;
        println!("{}", serde_json::to_string_pretty(&listing)?);
        let ids = host.get_projects().await?;
        info!("Worker reports {} projects", ids.len());

        termination_signal().await;
        Ok::<(), anyhow::Error>(())
    };

    let outcome = tokio::select! {
        result = session => Outcome::SessionDone(result),
        exit = worker.wait() => Outcome::WorkerExited(exit),
    };

    match outcome {
        Outcome::SessionDone(result) => {
            if let Err(e) = host.shutdown("host exiting") {
                log::warn!("Could not ask the worker to shut down: {e}");
            }
            let exit = match tokio::time::timeout(Duration::from_secs(5), worker.wait()).await {
                Ok(exit) => exit?,
                Err(_) => {
                    log::warn!("Worker ignored shutdown; killing it");
                    worker.kill().await?;
                    worker.wait().await?
                }
            };
            host.worker_exited(exit);
            result
        }
        Outcome::WorkerExited(exit) => {
            let exit = exit?;
            host.worker_exited(exit);
            if exit.is_graceful() {
                Ok(())
            } else {
                bail!("worker failed: {exit}")
            }
        }
    }
}

async fn serve_docs(
    bind: String,
    seed: Option<PathBuf>,
    auth_token: Option<String>,
) -> anyhow::Result<()> {
    let server = DocServer::new(DocServerConfig {
        bind_addr: bind,
        auth_token,
        ..DocServerConfig::default()
    });
    if let Some(path) = seed {
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let seed: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing seed file {}", path.display()))?;
        server.seed_from_json(&seed).await;
    }

    tokio::select! {
        result = server.run() => result?,
        _ = termination_signal() => info!("Document server stopping"),
    }
    Ok(())
}
