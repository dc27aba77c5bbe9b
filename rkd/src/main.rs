use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use rkd::config::{self, DaemonArgs, file};
use rkd::daemon;
use rkd::error::{DaemonError, EXIT_FAILURE};
use rkd::listener::ListenAddr;
use rkd::logging::{self, LogFormat};
use rkd::recovery::RecoveryCoordinator;
use rkd::supervisor::runtime::NativeRuntime;
use rkd::supervisor::{LaunchOptions, LifecycleState, Supervisor};
use rkd::tls::{self, ClientTls};
use rkd::workloads::CommandWorkloads;

#[derive(Parser)]
#[command(name = "rkd", version)]
#[command(about = "rk8s container daemon and its supervisor", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the daemon in the foreground")]
    Daemon(DaemonArgs),
    #[command(about = "Start the daemon as a child process and keep it running")]
    Supervise(SuperviseArgs),
    #[command(about = "Check that a daemon answers on an address")]
    Ping(PingArgs),
    #[command(about = "Fold flags into a configuration file without a running daemon")]
    UpdateConfig(DaemonArgs),
}

#[derive(Args)]
struct SuperviseArgs {
    #[command(flatten)]
    daemon: DaemonArgs,

    /// Workload CLI used to resume workloads after each start
    #[arg(long = "workload-cli", value_name = "PATH")]
    workload_cli: Option<PathBuf>,

    /// Seconds to wait for the daemon to answer on its listen addresses
    #[arg(long = "start-timeout", value_name = "SECS", default_value_t = 15)]
    start_timeout: u64,

    /// Directory for the configuration handoff and the daemon log (defaults to home-dir)
    #[arg(long = "state-dir", value_name = "PATH")]
    state_dir: Option<PathBuf>,
}

#[derive(Args)]
struct PingArgs {
    /// Daemon address, unix:///path or tcp://host:port
    #[arg(short = 'H', long, value_name = "ADDR")]
    host: String,

    #[arg(long, value_name = "PATH")]
    tlscacert: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    tlscert: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    tlskey: Option<PathBuf>,

    /// Seconds to wait for a reply
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    timeout: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        let code = e
            .downcast_ref::<DaemonError>()
            .map_or(EXIT_FAILURE, DaemonError::exit_code);
        eprintln!("rkd: {e:#}");
        if let Some(tail) = e.downcast_ref::<DaemonError>().and_then(DaemonError::log_tail) {
            if !tail.is_empty() {
                eprintln!("--- daemon log ---\n{tail}");
            }
        }
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Daemon(args) => {
            let config = load_logged(&args, cli.log_format)?;
            daemon::run(config).await?;
            Ok(())
        }
        Commands::Supervise(args) => supervise(args, cli.log_format).await,
        Commands::Ping(args) => {
            logging::init(false, cli.log_format);
            ping(args).await
        }
        Commands::UpdateConfig(args) => {
            logging::init(args.debug.unwrap_or(false), cli.log_format);
            let path = args
                .config_file
                .clone()
                .ok_or_else(|| anyhow!("update-config needs --config-file"))?;
            let changes = args.to_fragment()?;
            file::update(&path, &changes)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

/// Loads the configuration and sets up logging from it.
fn load_logged(args: &DaemonArgs, format: LogFormat) -> Result<rkd::EffectiveConfig, DaemonError> {
    let loaded = config::load(args);
    let debug = match &loaded {
        Ok(config) => config.debug,
        Err(_) => args.debug.unwrap_or(false),
    };
    logging::init(debug, format);
    loaded
}

async fn supervise(args: SuperviseArgs, format: LogFormat) -> anyhow::Result<()> {
    let config = load_logged(&args.daemon, format)?;
    let state_dir = args
        .state_dir
        .clone()
        .unwrap_or_else(|| config.home_dir.clone());
    let options = LaunchOptions::for_current_exe(&state_dir)
        .context("failed to locate the rkd executable")?
        .with_start_timeout(Duration::from_secs(args.start_timeout));

    let mut supervisor = Supervisor::new(Arc::new(NativeRuntime::new()), options);
    if let Some(workload_cli) = &args.workload_cli {
        let first_listen = config.listen.first().cloned().unwrap_or_default();
        let manager = CommandWorkloads::new(workload_cli).with_host(first_listen);
        supervisor = supervisor.with_recovery(RecoveryCoordinator::new(), Arc::new(manager));
    }

    let outcome = supervisor.start(config).await?;
    info!(pid = outcome.pid, "supervising daemon");

    let shutdown = daemon::shutdown_signal();
    tokio::pin!(shutdown);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tick.tick() => {
                if supervisor.status().await != LifecycleState::Crashed {
                    continue;
                }
                warn!("daemon crashed, restarting");
                match supervisor.restart().await {
                    Ok(outcome) => info!(pid = outcome.pid, "daemon restarted"),
                    Err(e) => error!(error = %e, "restart failed"),
                }
            }
        }
    }

    info!("stopping daemon");
    supervisor.stop().await?;
    Ok(())
}

async fn ping(args: PingArgs) -> anyhow::Result<()> {
    let addr = ListenAddr::parse(&args.host).map_err(|reason| DaemonError::MalformedInput {
        origin: config::Provenance::Cli,
        field: "host".to_string(),
        reason,
    })?;
    let client = ClientTls {
        ca: args.tlscacert,
        cert: args.tlscert,
        key: args.tlskey,
    };
    let client = client.is_set().then_some(client);
    let reply = tls::ping(&addr, client.as_ref(), Duration::from_secs(args.timeout)).await?;
    println!("{reply}");
    Ok(())
}
