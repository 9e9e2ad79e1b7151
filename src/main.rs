use anyhow::{Context, Result};
use lxd_buildhost::builder::{BuildHost, BuildRequest, Provisioner, ReleaseOutcome};
use lxd_buildhost::cli::{Args, ConfigDiscovery, ExecConfig, ExecutionMode, TransferConfig};
use lxd_buildhost::config::LxdConfig;
use lxd_buildhost::lxd::{LxdClient, WebSocketConnector};
use lxd_buildhost::transport::{LogSink, LxdTransport};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries descriptors and command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lxd_buildhost=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&args, mode).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args, mode: ExecutionMode) -> Result<ExitCode> {
    if mode == ExecutionMode::ShowConfig {
        ConfigDiscovery::show_discovery_info();
        return Ok(ExitCode::SUCCESS);
    }

    let config = ConfigDiscovery::load(args.config.as_deref()).context("loading configuration")?;
    let client = Arc::new(LxdClient::from_config(&config).context("creating LXD client")?);

    match mode {
        ExecutionMode::Acquire { os } => {
            let provisioner = Provisioner::new(client, &config);
            let request = BuildRequest { os };
            let host = provisioner
                .acquire_with_cancel(&request, &shutdown_token())
                .await?;
            println!("{}", serde_json::to_string_pretty(&host)?);
            Ok(ExitCode::SUCCESS)
        }
        ExecutionMode::Exec(exec) => run_exec(&config, client, exec).await,
        ExecutionMode::Release { host } => {
            let provisioner = Provisioner::new(client, &config);
            match provisioner.release(&descriptor(&host)).await {
                ReleaseOutcome::Released => {
                    println!("released {}", host);
                    Ok(ExitCode::SUCCESS)
                }
                ReleaseOutcome::Failed(failure) => {
                    println!("failed: {}", failure);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        ExecutionMode::Push(transfer) => {
            let transport = file_transport(&config, client, &transfer)?;
            let file = tokio::fs::File::open(&transfer.local)
                .await
                .with_context(|| format!("opening {:?}", transfer.local))?;
            transport.upload(file, &transfer.remote).await?;
            info!("Uploaded {:?} to {}:{}", transfer.local, transfer.host, transfer.remote);
            Ok(ExitCode::SUCCESS)
        }
        ExecutionMode::Pull(transfer) => {
            let transport = file_transport(&config, client, &transfer)?;
            let file = tokio::fs::File::create(&transfer.local)
                .await
                .with_context(|| format!("creating {:?}", transfer.local))?;
            transport.download(&transfer.remote, file).await?;
            info!("Downloaded {}:{} to {:?}", transfer.host, transfer.remote, transfer.local);
            Ok(ExitCode::SUCCESS)
        }
        ExecutionMode::ShowConfig => Ok(ExitCode::SUCCESS),
    }
}

async fn run_exec(config: &LxdConfig, client: Arc<LxdClient>, exec: ExecConfig) -> Result<ExitCode> {
    let connector =
        Arc::new(WebSocketConnector::from_config(config).context("creating stream connector")?);
    let log: LogSink = Arc::new(Mutex::new(tokio::io::stdout()));

    let mut transport =
        LxdTransport::for_container(client, connector, &exec.host, &exec.workspace, log)
            .with_exec_timeout(config.timing.exec_timeout);
    transport.set_env(exec.env);

    let success = transport
        .exec_with_cancel(
            &exec.command,
            exec.working_directory.as_deref(),
            &shutdown_token(),
        )
        .await?;

    if success {
        return Ok(ExitCode::SUCCESS);
    }

    let code = transport.last_exit_code().unwrap_or(1);
    warn!("Command exited with {}", code);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn file_transport(
    config: &LxdConfig,
    client: Arc<LxdClient>,
    transfer: &TransferConfig,
) -> Result<LxdTransport> {
    let connector = Arc::new(WebSocketConnector::from_config(config)?);
    let log: LogSink = Arc::new(Mutex::new(tokio::io::sink()));
    Ok(LxdTransport::for_container(
        client,
        connector,
        &transfer.host,
        lxd_buildhost::env::host::WORKSPACE,
        log,
    ))
}

/// Descriptor for a host acquired by an earlier invocation.
fn descriptor(host: &str) -> BuildHost {
    BuildHost {
        host: host.to_string(),
        name: host.to_string(),
        username: lxd_buildhost::env::host::USERNAME.to_string(),
        workspace: lxd_buildhost::env::host::WORKSPACE.to_string(),
        distro: String::new(),
        release: String::new(),
        transports: vec![lxd_buildhost::env::host::TRANSPORT_KIND.to_string()],
        acquired_at: chrono::Utc::now(),
    }
}

/// Token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
    token
}
