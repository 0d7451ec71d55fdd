// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use streamrelay::config::RelayConfig;

#[tokio::main]
async fn main() {
    let config = RelayConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = streamrelay::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
