//! shellcache CLI - keep an offline copy of a web app shell.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use env_logger::Env;

#[tokio::main]
async fn main() -> shellcache::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    shellcache::cli::run().await
}
