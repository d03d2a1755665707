//! This is the primary binary for the workspace admin API server.

#![deny(rust_2018_idioms)]

#[macro_use]
extern crate log;

use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::ResultExt;
use std::env;
use std::process;
use std::str::FromStr;
use std::time::Duration;

use apiserver::serve;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9339";
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

type Result<T> = std::result::Result<T, error::Error>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("{}", source))]
        Server { source: apiserver::server::Error },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },
    }
}

/// Stores user-supplied arguments.
struct Args {
    data_dir: String,
    bind: String,
    workers: usize,
    drain_timeout: Duration,
    log_level: LevelFilter,
}

/// Informs the user about proper usage of the program and exits.
fn usage() -> ! {
    let program_name = env::args().next().unwrap_or_else(|| "program".to_string());
    eprintln!(
        r"Usage: {}
            --data-dir PATH
            [ --bind ADDRESS:PORT ]
            [ --workers COUNT ]
            [ --drain-timeout-secs SECONDS ]
            [ --log-level trace|debug|info|warn|error ]

    Bind address defaults to {}
    Drain timeout defaults to {} seconds",
        program_name, DEFAULT_BIND_ADDR, DEFAULT_DRAIN_TIMEOUT_SECS
    );
    process::exit(2);
}

/// Prints a more specific message before exiting through usage().
fn usage_msg<S: AsRef<str>>(msg: S) -> ! {
    eprintln!("{}\n", msg.as_ref());
    usage();
}

/// Parses user arguments into an Args structure.
fn parse_args(args: env::Args) -> Args {
    let mut data_dir = None;
    let mut bind = None;
    let mut workers = None;
    let mut drain_timeout = None;
    let mut log_level = None;

    let mut iter = args.skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "--data-dir" => {
                data_dir = Some(
                    iter.next()
                        .unwrap_or_else(|| usage_msg("Did not give argument to --data-dir")),
                )
            }

            "--bind" => {
                bind = Some(
                    iter.next()
                        .unwrap_or_else(|| usage_msg("Did not give argument to --bind")),
                )
            }

            "--workers" => {
                let workers_str = iter
                    .next()
                    .unwrap_or_else(|| usage_msg("Did not give argument to --workers"));
                let count = workers_str.parse::<usize>().unwrap_or_else(|e| {
                    usage_msg(format!(
                        "Invalid worker count '{}' given to --workers: {}",
                        workers_str, e
                    ))
                });
                if count == 0 {
                    usage_msg("--workers must be at least 1");
                }
                workers = Some(count);
            }

            "--drain-timeout-secs" => {
                let secs_str = iter
                    .next()
                    .unwrap_or_else(|| usage_msg("Did not give argument to --drain-timeout-secs"));
                let secs = secs_str.parse::<u64>().unwrap_or_else(|e| {
                    usage_msg(format!(
                        "Invalid timeout '{}' given to --drain-timeout-secs: {}",
                        secs_str, e
                    ))
                });
                drain_timeout = Some(Duration::from_secs(secs));
            }

            "--log-level" => {
                let log_level_str = iter
                    .next()
                    .unwrap_or_else(|| usage_msg("Did not give argument to --log-level"));
                log_level = Some(LevelFilter::from_str(&log_level_str).unwrap_or_else(|_| {
                    usage_msg(format!("Invalid log level '{}'", log_level_str))
                }));
            }

            _ => usage(),
        }
    }

    Args {
        data_dir: data_dir.unwrap_or_else(|| usage()),
        bind: bind.unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        workers: workers.unwrap_or(2),
        drain_timeout: drain_timeout
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS)),
        log_level: log_level.unwrap_or(LevelFilter::Info),
    }
}

/// Opens server state and serves the admin API until stopped.
async fn run() -> Result<()> {
    let args = parse_args(env::args());

    // TerminalMode::Mixed will send errors to stderr and anything less to stdout.
    TermLogger::init(
        args.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    let workers_suffix = match args.workers {
        n if n > 1 => "s",
        _ => "",
    };
    info!(
        "Starting server at {} with {} worker{} and data directory {}",
        &args.bind, args.workers, workers_suffix, &args.data_dir,
    );

    serve(&args.data_dir, &args.bind, args.workers, args.drain_timeout)
        .await
        .context(error::ServerSnafu)
}

// Returning a Result from main makes it print a Debug representation of the error, but with Snafu
// we have nice Display representations of the error, so we wrap "main" (run) and print any error.
#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
