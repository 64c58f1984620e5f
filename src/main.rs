use std::{error::Error, process, sync::Arc};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};
use tokio_util::sync::CancellationToken;
use url::Url;

use presently::{
    config::Config,
    gateway::{self, GatewayConnector},
    host::Host,
    imdb::ImdbResolver,
    sweeper,
    tokens::ConfigTokenStore,
    tracker::{self, PresenceTracker},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Ensure that this file is kept secure and not shared publicly, as it
    /// contains the gateway tokens of every tracked user.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Media server base URL
    ///
    /// Overrides the `server_url` from the secrets file.
    #[arg(long, value_hint = ValueHint::Url)]
    server: Option<Url>,

    /// Language code for metadata scraping
    #[arg(short, long, default_value_t = String::from("en"))]
    language: String,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose`
                // is 0 by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Main application loop.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = Config::from_secrets(&args.secrets_file)?;
    config.language = args.language;
    if let Some(server) = args.server {
        if let Some(ref mut host) = config.host {
            host.url = server;
        }
    }

    let Some(ref host_settings) = config.host else {
        return Err(format!("{} does not configure a media server", args.secrets_file).into());
    };
    if config.tokens.is_empty() {
        return Err(format!("{} does not configure any user tokens", args.secrets_file).into());
    }

    let user_agent = format!("{}/{}", config.app_name, config.app_version);
    let host = Host::new(host_settings, &user_agent, config.poll_interval)?;

    let tracker = PresenceTracker::new(
        tracker::Settings {
            drift_tolerance: config.drift_tolerance,
            session_timeout: config.session_timeout,
        },
        Arc::new(ConfigTokenStore::new(config.tokens.clone())),
        Arc::new(ImdbResolver::new(&config.language)?),
        Arc::new(GatewayConnector::new(gateway::Settings {
            url: config.gateway_url.clone(),
            properties: config.properties.clone(),
            invalid_session_cooldown: config.invalid_session_cooldown,
            connect_retry_delay: config.connect_retry_delay,
        })),
    );

    let shutdown = CancellationToken::new();
    let sweeper = sweeper::spawn(
        tracker.clone(),
        config.sweep_interval,
        shutdown.child_token(),
    );

    tokio::select! {
        // Prioritize shutdown signals over the poll loop.
        biased;

        _ = tokio::signal::ctrl_c() => info!("shutting down gracefully"),
        () = host.run(&tracker, &shutdown) => {}
    }

    shutdown.cancel();
    tracker.shutdown();
    let _ = sweeper.await;

    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
