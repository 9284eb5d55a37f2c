use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use access_proxy::{comms, config::Config, utils};

#[derive(Parser)]
#[command(
    name = "access-proxy",
    version,
    about = "Local proxy that attaches access tokens to forwarded requests"
)]
struct AppCli {
    /// Run in daemon mode (background)
    #[arg(long)]
    daemon: bool,

    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the forwarding proxy
    Serve {
        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
}

fn run_daemon() -> Result<()> {
    use daemonize::Daemonize;
    let daemonize = Daemonize::new()
        .pid_file("access-proxy.pid")
        .working_directory(".")
        .umask(0o027)
        .privileged_action(|| {
            info!("daemon started");
        });

    daemonize.start().map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    if args.daemon {
        run_daemon()?;
    }

    let mut config = Config::load(&args.config)?;
    if let Some(Commands::Serve { port: Some(port) }) = args.command {
        config.port = port;
    }

    info!(
        port = config.port,
        retry_count = config.retry_count,
        cache_timeout_ms = config.cache_timeout_ms,
        "starting access proxy"
    );
    comms::local_api::serve(config).await?;

    Ok(())
}
