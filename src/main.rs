mod cache;
mod call;
mod catalog;
mod engine;
mod filter;
mod modes;
mod notify;
mod sweep;
mod tones;

use anyhow::Result;
use dotenvy::dotenv;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();

    modes::run_from_env().await
}
