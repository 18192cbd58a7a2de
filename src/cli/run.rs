use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use tracing::info;
use wheelhouse_core_types::{Script, ScriptStatus};
use wheelhouse_script_engine::LoginGate;
use wheelhouse_session_center::SessionOptions;

use crate::config::Config;

use super::context;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the script JSON file.
    pub script: PathBuf,

    /// Run the browser headless (ignored when the script asks for a human
    /// login).
    #[arg(long)]
    pub headless: bool,

    /// Override the script's profile selection by exact name.
    #[arg(long)]
    pub profile: Option<String>,
}

/// Blocks on operator confirmation for human-assisted logins.
struct StdinGate;

#[async_trait]
impl LoginGate for StdinGate {
    async fn wait_for_login(&self) {
        eprintln!("============================================================");
        eprintln!("WAITING FOR HUMAN LOGIN");
        eprintln!("Complete the login in the browser window, then press ENTER.");
        eprintln!("============================================================");
        let _ = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
        })
        .await;
    }
}

pub(crate) async fn execute(config: Config, args: RunArgs) -> Result<i32> {
    let raw = std::fs::read(&args.script)
        .with_context(|| format!("cannot read script file {}", args.script.display()))?;
    let mut script: Script =
        serde_json::from_slice(&raw).context("script file is not valid JSON")?;
    if let Some(profile) = args.profile {
        script.session.profile_name = Some(profile);
    }

    let context = context::build(config).await?;
    let center = context.center;

    let entry = center
        .open(SessionOptions {
            headless: args.headless,
            requirements: script.session.clone(),
        })
        .await?;
    info!(
        target: "cli",
        session = %entry.id,
        script = %script.name,
        "session opened, running script"
    );

    let gate: Arc<dyn LoginGate> = Arc::new(StdinGate);
    let result = center.run_script(&entry, script, Some(gate)).await?;
    center.close(&entry.id).await?;
    center.uploader().wait_idle(std::time::Duration::from_secs(10)).await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(match result.status {
        ScriptStatus::Completed | ScriptStatus::Stopped => 0,
        ScriptStatus::Aborted | ScriptStatus::Error => 1,
    })
}
