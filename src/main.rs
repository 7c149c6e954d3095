mod config;
mod runtime;
mod sandbox;
mod security;
mod store;

use std::io::Read;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::runtime::{Runtime, SNIPPET_DELIMITER};
use crate::sandbox::Executor;
use crate::security::RateLimiter;
use crate::store::{cache_key, Store};

const DEFAULT_CONFIG_PATH: &str = "config/runbox.toml";

/// Length ceiling for `sanitize` input, as in the goal prompt path.
const SANITIZE_MAX_LEN: usize = 3000;

fn print_help() {
    println!(
        "\
runbox v{}

Runs short Python snippets behind a rate limit, a length ceiling and a
denylist, with a best-effort SQLite/PostgreSQL cache alongside.

USAGE:
    runbox [OPTIONS] <COMMAND>

COMMANDS:
    run [FILE...]                     Execute each FILE (or stdin) in the sandbox
    serve                             Execute snippets read from stdin, separated
                                      by '{SNIPPET_DELIMITER}' lines, in one session
    cache get KEY                     Print a cached value (exit 1 if absent)
    cache set KEY VALUE [TTL_MIN]     Store a value [default TTL: from config]
    cache purge                       Delete expired cache rows
    sanitize [TEXT]                   Clean TEXT (or stdin) with the denylist
    status [--json]                   Show storage backend and limits

    KEY may be given as `--query NAMESPACE TEXT`: the key is then derived
    from a hash of TEXT, for caching results of free-form queries.

    Rate limits apply per process: `serve` and multi-file `run` share one
    window, separate invocations do not.

OPTIONS:
    -c, --config PATH   TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
                        (missing file = built-in defaults)
    -u, --user ID       Requester identity for rate limiting [default: default]
    -h, --help          Print this help message and exit
    -V, --version       Print version and exit

ENVIRONMENT VARIABLES:
    RUST_LOG        Log level filter for tracing (e.g. runbox=debug)
    DEBUG_MODE      \"true\" raises the default log level to info
    DATABASE_URL    PostgreSQL connection string; the local SQLite file
                    is used when unset or unreachable

The denylist is a plain text filter, not an isolation boundary: snippets
run with the privileges of this process.",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parsed command line.
#[derive(Debug, PartialEq)]
struct Cli {
    config_path: String,
    user: String,
    command: Vec<String>,
}

/// Finds `--help` / `--version` among the options that precede the command.
/// Anything from the command word on belongs to the command.
fn leading_flag(args: &[String]) -> Option<&str> {
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" | "-V" | "--version" => return Some(arg.as_str()),
            "-c" | "--config" | "-u" | "--user" => {
                args.next();
            }
            _ => return None,
        }
    }
    None
}

/// Splits a cache command's arguments into the key and what follows it.
/// `--query NAMESPACE TEXT` derives the key from a hash of TEXT.
fn cache_target<'a>(args: &'a [&'a str]) -> Result<(String, &'a [&'a str])> {
    match args {
        ["--query" | "-q", namespace, text, rest @ ..] => Ok((cache_key(namespace, text), rest)),
        ["--query" | "-q", ..] => bail!("--query needs a namespace and a text"),
        [key, rest @ ..] => Ok((key.to_string(), rest)),
        [] => bail!("missing cache key"),
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Cli> {
    let mut cli = Cli {
        config_path: DEFAULT_CONFIG_PATH.to_string(),
        user: "default".to_string(),
        command: Vec::new(),
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" if cli.command.is_empty() => {
                cli.config_path = args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?;
            }
            "-u" | "--user" if cli.command.is_empty() => {
                cli.user = args.next().ok_or_else(|| anyhow!("{arg} needs an id"))?;
            }
            _ => cli.command.push(arg),
        }
    }
    Ok(cli)
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Handle --help / --version before anything else
    match leading_flag(&args) {
        Some("--version" | "-V") => {
            println!("runbox v{}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Some(_) => {
            print_help();
            std::process::exit(0);
        }
        None => {}
    }

    let cli = parse_args(args)?;
    let config = Config::load_or_default(&cli.config_path)?;

    // RUST_LOG wins; otherwise DEBUG_MODE decides between info and warn
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Configuration: {}", cli.config_path);

    let store = Arc::new(Store::open(&config.storage).await);
    let executor = Executor::new(config.sandbox.clone(), Arc::new(RateLimiter::new()))?;
    let runtime = Runtime::start(config, store, executor, &cli.user).await;

    let command: Vec<&str> = cli.command.iter().map(String::as_str).collect();
    match command.as_slice() {
        ["run"] => println!("{}", runtime.run_code(&read_stdin()?).await),
        ["run", paths @ ..] => {
            for path in paths {
                let code = std::fs::read_to_string(path)?;
                println!("{}", runtime.run_code(&code).await);
                if paths.len() > 1 {
                    println!("{SNIPPET_DELIMITER}");
                }
            }
        }
        ["serve"] => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            runtime.serve(stdin, tokio::io::stdout()).await?;
        }
        ["cache", "get", args @ ..] => {
            let (key, rest) = cache_target(args)?;
            if !rest.is_empty() {
                bail!("Unexpected arguments after key: {}", rest.join(" "));
            }
            match runtime.cache_get(&key).await {
                Some(value) => println!("{value}"),
                None => std::process::exit(1),
            }
        }
        ["cache", "set", args @ ..] => {
            let (key, rest) = cache_target(args)?;
            match rest {
                [value] => runtime.cache_set(&key, value, None).await,
                [value, ttl] => {
                    let ttl: i64 = ttl
                        .parse()
                        .map_err(|_| anyhow!("TTL must be a whole number of minutes, got '{ttl}'"))?;
                    runtime.cache_set(&key, value, Some(ttl)).await;
                }
                _ => bail!("usage: cache set KEY VALUE [TTL_MINUTES]"),
            }
        }
        ["cache", "purge"] => println!("{} expired entries removed", runtime.cache_purge().await),
        ["sanitize"] => println!("{}", runtime.sanitize(&read_stdin()?, SANITIZE_MAX_LEN)),
        ["sanitize", text @ ..] => {
            println!("{}", runtime.sanitize(&text.join(" "), SANITIZE_MAX_LEN))
        }
        ["status"] => println!("{}", runtime.status()),
        ["status", "--json"] => println!("{}", serde_json::to_string_pretty(&runtime.status())?),
        [] => {
            print_help();
            bail!("no command given");
        }
        other => bail!("Unknown command: {}\nType --help for usage.", other.join(" ")),
    }

    Ok(())
}
