//! CLI mode for shellcache - drive the cache lifecycle from the command line.

mod progress;

use std::env;
use std::path::PathBuf;

use crate::{
    AppConfig, CacheLifecycle, Deployment, DiskStorage, Error, FetchOutcome, FetchRequest,
    HttpFetcher,
};

pub use progress::{BarProgress, format_bytes, format_elapsed};
use progress::{print_activation, print_offline, print_status};

type DiskLifecycle = CacheLifecycle<DiskStorage, HttpFetcher>;

/// What to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stage the core shell.
    Install,
    /// Reconcile the content partition with the staged shell.
    Activate,
    /// Install then activate.
    Update,
    /// Run one request through fetch interception and print the body.
    Fetch(String),
    /// Fetch every resource not yet cached.
    DownloadOffline,
    /// Show the partitions relative to the deployment.
    Status,
    /// Run the caching proxy.
    Serve,
}

/// Parsed command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    /// Config file path.
    pub config: Option<PathBuf>,
    /// Deployment file path, overriding the config.
    pub deployment: Option<PathBuf>,
    /// Origin, overriding the config.
    pub origin: Option<String>,
    /// Cache directory, overriding the config.
    pub cache_dir: Option<PathBuf>,
    /// Command to run; `None` prints usage.
    pub command: Option<Command>,
}

fn print_usage() {
    eprintln!("Usage: shellcache [OPTIONS] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  install             Fetch the core shell into the temp partition");
    eprintln!("  activate            Promote the staged shell and evict stale entries");
    eprintln!("  update              install, then activate");
    eprintln!("  fetch <url>         Run one GET through the cache and print the body");
    eprintln!("  download-offline    Fetch every resource not yet cached");
    eprintln!("  status              Show cache state for the current deployment");
    eprintln!("  serve               Run the caching proxy");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <FILE>       Config file (TOML)");
    eprintln!("  -d, --deployment <FILE>   Deployment file (JSON manifest + core list)");
    eprintln!("      --origin <URL>        Origin the manifest is relative to");
    eprintln!("      --cache-dir <DIR>     Directory holding the cache partitions");
    eprintln!("  -h, --help                Show this help");
}

fn value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> crate::Result<String> {
    iter.next()
        .cloned()
        .ok_or_else(|| Error::Config(format!("{flag} requires a value")))
}

/// Parses arguments (without the program name).
///
/// # Errors
///
/// Returns [`Error::Config`] for unknown flags, missing values or a
/// missing command argument.
pub fn parse_args(args: &[String]) -> crate::Result<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => parsed.config = Some(value(&mut iter, arg)?.into()),
            "-d" | "--deployment" => parsed.deployment = Some(value(&mut iter, arg)?.into()),
            "--origin" => parsed.origin = Some(value(&mut iter, arg)?),
            "--cache-dir" => parsed.cache_dir = Some(value(&mut iter, arg)?.into()),
            "-h" | "--help" => {
                parsed.command = None;
                return Ok(parsed);
            }
            flag if flag.starts_with('-') => {
                return Err(Error::Config(format!("unknown option {flag}")));
            }
            command if parsed.command.is_none() => {
                parsed.command = Some(match command {
                    "install" => Command::Install,
                    "activate" => Command::Activate,
                    "update" => Command::Update,
                    "fetch" => Command::Fetch(value(&mut iter, "fetch")?),
                    "download-offline" => Command::DownloadOffline,
                    "status" => Command::Status,
                    "serve" => Command::Serve,
                    other => return Err(Error::Config(format!("unknown command {other}"))),
                });
            }
            extra => return Err(Error::Config(format!("unexpected argument {extra}"))),
        }
    }
    Ok(parsed)
}

/// Loads config and deployment, applying command-line overrides.
fn load(args: &CliArgs) -> crate::Result<(AppConfig, Deployment)> {
    let mut config = match &args.config {
        Some(path) => {
            let config = AppConfig::load(path)?;
            log::info!("Loaded config from {}", path.display());
            config
        }
        None => AppConfig::default(),
    };
    if let Some(origin) = &args.origin {
        config.cache = config.cache.with_origin(origin.as_str());
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    if let Some(path) = &args.deployment {
        config.deployment = Some(path.clone());
    }
    config.cache.validate()?;

    let path = config
        .deployment
        .clone()
        .ok_or_else(|| Error::Config("no deployment file; pass --deployment".to_string()))?;
    let deployment = Deployment::load(&path)?;
    Ok((config, deployment))
}

fn build_lifecycle(config: &AppConfig, deployment: Deployment) -> crate::Result<DiskLifecycle> {
    let cache_dir = config.resolved_cache_dir();
    log::info!("Cache directory: {}", cache_dir.display());
    let storage = DiskStorage::new(cache_dir);
    let fetcher = HttpFetcher::new(&config.cache)?;
    Ok(CacheLifecycle::new(
        config.cache.clone(),
        deployment,
        storage,
        fetcher,
    ))
}

/// Makes sure the instance serves requests: resumes if the stored manifest
/// is current, otherwise installs and activates.
async fn ensure_active(lifecycle: &mut DiskLifecycle) -> crate::Result<()> {
    if lifecycle.resume().await? {
        return Ok(());
    }
    println!("Cache is not current for this deployment, updating.");
    lifecycle.install().await?;
    let report = lifecycle.activate().await;
    print_activation(&report);
    Ok(())
}

/// Runs a parsed command.
///
/// # Errors
///
/// Returns an error if loading, installing, fetching or serving fails.
pub async fn run_command(args: CliArgs) -> crate::Result<()> {
    let Some(command) = args.command.clone() else {
        print_usage();
        return Ok(());
    };
    let (config, deployment) = load(&args)?;
    let mut lifecycle = build_lifecycle(&config, deployment)?;

    match command {
        Command::Install => {
            let staged = lifecycle.install().await?;
            println!("Staged {staged} core resource(s). Run `activate` to apply.");
        }
        Command::Activate => {
            let report = lifecycle.activate().await;
            print_activation(&report);
        }
        Command::Update => {
            lifecycle.install().await?;
            let report = lifecycle.activate().await;
            print_activation(&report);
        }
        Command::Fetch(url) => {
            ensure_active(&mut lifecycle).await?;
            let request = FetchRequest::get(url.as_str());
            match lifecycle.handle_fetch(&request).await? {
                FetchOutcome::Response(response) => {
                    log::info!(
                        "{} {} ({})",
                        response.status,
                        url,
                        format_bytes(response.len() as u64)
                    );
                    println!("{}", String::from_utf8_lossy(&response.body));
                }
                FetchOutcome::Passthrough => {
                    println!("{url} is not a cached resource; not intercepted.");
                }
            }
        }
        Command::DownloadOffline => {
            ensure_active(&mut lifecycle).await?;
            let progress = BarProgress::new();
            let result = lifecycle.download_offline(&progress).await;
            progress.finish();
            print_offline(&result?);
        }
        Command::Status => {
            let status = lifecycle.status().await?;
            println!("Deployment: {} resources", lifecycle.deployment().resources.len());
            print_status(&status);
        }
        Command::Serve => serve(lifecycle, &config).await?,
    }
    Ok(())
}

#[cfg(feature = "server")]
async fn serve(mut lifecycle: DiskLifecycle, config: &AppConfig) -> crate::Result<()> {
    ensure_active(&mut lifecycle).await?;
    let state = crate::proxy::ProxyState::new(lifecycle, config.deployment.clone());
    crate::proxy::serve(state, &config.proxy).await
}

#[cfg(not(feature = "server"))]
async fn serve(_lifecycle: DiskLifecycle, _config: &AppConfig) -> crate::Result<()> {
    Err(Error::Config("proxy support not compiled in".to_string()))
}

/// Entry point for the `shellcache` binary.
///
/// # Errors
///
/// Returns an error if argument parsing or the command fails.
pub async fn run() -> crate::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let parsed = parse_args(&args)?;
    run_command(parsed).await
}
