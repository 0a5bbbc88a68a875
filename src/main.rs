use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn, Level};

mod codec;
mod play;
mod publish;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the liveness server
    Serve {
        /// Set config file path
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Watch a stream over WHEP or HLS
    Play(play::Args),
    /// Publish RTP received on a local UDP port over WHIP
    Publish(publish::Args),
}

fn verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    match args.command {
        Command::Serve { config } => serve(config).await,
        Command::Play(args) => {
            utils::set_log(format!(
                "livecast={},liveplay={},webrtc=error",
                verbosity(args.verbose),
                verbosity(args.verbose)
            ));
            if let Err(e) = play::run(args).await {
                warn!("play failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Command::Publish(args) => {
            utils::set_log(format!(
                "livecast={},liveplay={},webrtc=error",
                verbosity(args.verbose),
                verbosity(args.verbose)
            ));
            if let Err(e) = publish::run(args).await {
                warn!("publish failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn serve(config: Option<String>) {
    let cfg = livewatch::config::Config::parse(config);

    utils::set_log(format!(
        "livecast={},livewatch={},tower_http={},webrtc=error",
        cfg.log.level, cfg.log.level, cfg.log.level
    ));

    warn!("set log level : {}", cfg.log.level);
    debug!("config : {:?}", cfg);

    let listener = match tokio::net::TcpListener::bind(cfg.http.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("bind {} failed: {}", cfg.http.listen, e);
            std::process::exit(1);
        }
    };

    livewatch::serve(cfg, listener, shutdown_signal()).await;
    info!("Server shutdown");
}

pub(crate) async fn shutdown_signal() {
    let str = utils::wait_for_stop_signal().await;
    debug!("Received signal: {}", str);
}
