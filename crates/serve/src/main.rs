use anyhow::Context;
use clap::Parser;
use serve::pool::{default_workers, CommandFactory, PoolConfig, WorkerPool};
use serve::{api, invoke, App};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// fimserve repurposes steady-state hydraulic river models into reach-scoped
/// flood-inundation maps and rating curves, served over an OGC-shaped API.
#[derive(Debug, Parser)]
#[clap(name = "fimserve", version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start the service: HTTP surface plus the worker pool.
    Start(StartArgs),
    /// Check a running service's health endpoint.
    Status(StatusArgs),
    /// Signal a running service to shut down.
    Stop(StopArgs),
    /// Worker-child entry point; invoked by the service itself.
    #[clap(hide = true)]
    Invoke(invoke::InvokeArgs),
}

#[derive(Debug, clap::Args)]
struct StartArgs {
    /// Port of the HTTP surface.
    #[clap(long, env = "FIM_PORT", default_value = "5000")]
    port: u16,
    /// Worker count; defaults to max(cores - 2, 1).
    #[clap(long = "threads", env = "FIM_WORKERS")]
    threads: Option<usize>,
    /// Directory holding the job store, server log, and pid file.
    #[clap(long = "data-dir", env = "FIM_DATA_DIR", default_value = ".fimserve")]
    data_dir: PathBuf,
    /// Seconds between the terminate and kill signals of a dismissal.
    #[clap(
        long = "dismiss-grace-secs",
        env = "FIM_DISMISS_GRACE_SECS",
        default_value = "10"
    )]
    dismiss_grace_secs: u64,
    #[clap(flatten)]
    adapters: invoke::AdapterArgs,
}

#[derive(Debug, clap::Args)]
struct StatusArgs {
    #[clap(long, env = "FIM_PORT", default_value = "5000")]
    port: u16,
}

#[derive(Debug, clap::Args)]
struct StopArgs {
    #[clap(long = "data-dir", env = "FIM_DATA_DIR", default_value = ".fimserve")]
    data_dir: PathBuf,
}

// Exit codes: 0 clean, 1 configuration error, 2 bind failure.
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Invoke(args) => {
            // The child logs to stderr so its diagnostics land in the
            // job's captured output.
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
            invoke::run(&args)
        }
        Command::Start(args) => match start(args) {
            Ok(()) => 0,
            Err(StartError::Bind(err)) => {
                eprintln!("failed to bind the service port: {err:#}");
                EXIT_BIND
            }
            Err(StartError::Config(err)) => {
                eprintln!("configuration error: {err:#}");
                EXIT_CONFIG
            }
        },
        Command::Status(args) => status(args),
        Command::Stop(args) => stop(args),
    };
    std::process::exit(code);
}

enum StartError {
    Bind(anyhow::Error),
    Config(anyhow::Error),
}

fn start(args: StartArgs) -> Result<(), StartError> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data directory {}", args.data_dir.display()))
        .map_err(StartError::Config)?;
    init_tracing(&args.data_dir.join("serve.log")).map_err(StartError::Config)?;
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the tokio runtime")
        .map_err(StartError::Config)?;

    let result = runtime.block_on(async_start(args));

    tracing::info!(ok = result.is_ok(), "main loop completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result
}

async fn async_start(args: StartArgs) -> Result<(), StartError> {
    use futures::FutureExt;

    // Bind early in the lifecycle, to not fail requests dispatched as soon
    // as the process is up.
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .map_err(|err| StartError::Bind(err.into()))?;

    let store = job_store::JobStore::open(args.data_dir.join("jobs.db"))
        .context("opening the job store")
        .map_err(StartError::Config)?;

    let pid_path = args.data_dir.join("serve.pid");
    std::fs::write(&pid_path, std::process::id().to_string())
        .context("writing the pid file")
        .map_err(StartError::Config)?;

    // The logs sink into which supervisors stream captured child output.
    let (logs_tx, logs_rx) = tokio::sync::mpsc::channel(supervisor::logs::CHANNEL_DEPTH);
    let logs_sink = tokio::spawn(supervisor::logs::serve_sink(store.clone(), logs_rx));

    let app = App::new(store, registry::Registry::default());
    let factory = invoke_factory(&args.adapters)
        .context("locating the service binary for worker children")
        .map_err(StartError::Config)?;
    let pool = WorkerPool::start(
        app.clone(),
        logs_tx.clone(),
        factory,
        PoolConfig {
            workers: args.threads.unwrap_or_else(default_workers),
            grace: std::time::Duration::from_secs(args.dismiss_grace_secs),
            ..PoolConfig::default()
        },
    );
    tracing::info!(workers = pool.size(), port = args.port, "serving");

    // Share-able future which completes when the service should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let router = api::build_router(app);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving the API")
        .map_err(StartError::Config)?;

    pool.shutdown(std::time::Duration::from_secs(args.dismiss_grace_secs)).await;
    std::mem::drop(logs_tx);
    let _ = logs_sink.await;
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}

/// Children re-invoke this binary's hidden `invoke` subcommand, carrying
/// the adapter configuration through explicit flags.
fn invoke_factory(adapters: &invoke::AdapterArgs) -> anyhow::Result<CommandFactory> {
    let exe = std::env::current_exe().context("resolving current_exe")?;
    let adapters = adapters.clone();
    Ok(Arc::new(move |job: &models::Job| {
        let mut cmd = supervisor::process::Command::new(&exe);
        cmd.arg("invoke")
            .arg("--process")
            .arg(&job.process)
            .arg("--input")
            .arg(job.input.to_string())
            .arg("--normal-depth-slope")
            .arg(adapters.normal_depth_slope.to_string());
        if let Some(path) = &adapters.network_parquet {
            cmd.arg("--network-parquet").arg(path);
        }
        if let Some(url) = &adapters.dem_url {
            cmd.arg("--dem-url").arg(url);
        }
        if let Some(bin) = &adapters.solver_bin {
            cmd.arg("--solver-bin").arg(bin);
        }
        cmd
    }))
}

fn init_tracing(log_path: &Path) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening server log {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::sync::Mutex::new(file)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

fn status(args: StatusArgs) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return EXIT_CONFIG;
        }
    };
    runtime.block_on(async {
        let url = format!("http://127.0.0.1:{}/ping", args.port);
        match reqwest::get(&url).await {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                println!("{body}");
                0
            }
            Ok(response) => {
                eprintln!("service responded {} on {url}", response.status());
                1
            }
            Err(err) => {
                eprintln!("service is unreachable at {url}: {err}");
                1
            }
        }
    })
}

fn stop(args: StopArgs) -> i32 {
    let pid_path = args.data_dir.join("serve.pid");
    let pid: i32 = match std::fs::read_to_string(&pid_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
    {
        Some(pid) => pid,
        None => {
            eprintln!("no pid recorded at {}", pid_path.display());
            return EXIT_CONFIG;
        }
    };
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == -1 {
        eprintln!(
            "failed to signal pid {pid}: {}",
            std::io::Error::last_os_error()
        );
        return 1;
    }
    println!("signalled pid {pid}");
    0
}
