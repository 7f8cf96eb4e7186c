// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cw_rpc::RpcTarget;
use cw_server::{AppState, serve};
use cw_testkit::TestTarget;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "capnweb-server", version, about = "capnweb test server")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:9200")]
    bind: String,

    /// Enable frame-level debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("cw_rpc=debug,cw_server=debug")
    } else {
        EnvFilter::new("cw_server=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = AppState::new(|| Arc::new(TestTarget::new()) as Arc<dyn RpcTarget>);
    let (addr, server) = serve(&args.bind, state)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!("WebSocket: ws://{addr}/rpc");
    info!("HTTP batch: http://{addr}/");

    server.await.context("serve")
}
