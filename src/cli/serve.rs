use std::net::SocketAddr;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::config::Config;
use crate::server::{self, AppState};

use super::context;

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Listen address; overrides the configured one.
    #[arg(long)]
    pub listen: Option<SocketAddr>,
}

pub(crate) async fn execute(mut config: Config, args: ServeArgs) -> Result<i32> {
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    let addr = config.listen_addr;
    let context = context::build(config).await?;
    let state = AppState::new(context.config, context.center, context.settings);

    info!(target: "cli", %addr, "starting control plane");
    server::serve(state, addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!(target: "cli", "shutdown signal received");
    })
    .await?;
    Ok(0)
}
