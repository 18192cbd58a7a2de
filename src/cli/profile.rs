use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::json;
use wheelhouse_core_types::SessionRequirements;
use wheelhouse_profile_store::{NewProfile, ProfileStore};
use wheelhouse_session_center::SessionOptions;

use crate::config::Config;

use super::context;

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Create a profile and its user-data directory.
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Tags, repeatable.
        #[arg(long)]
        tag: Vec<String>,
        #[arg(long)]
        auto_login_site: Vec<String>,
        /// Session timeout in hours.
        #[arg(long, default_value_t = 24)]
        timeout: u32,
    },
    /// List profiles, optionally OR-filtered by tags.
    List {
        #[arg(long)]
        tag: Vec<String>,
    },
    /// Delete a profile (keeps the user-data directory with --keep-data).
    Delete {
        name: String,
        #[arg(long)]
        keep_data: bool,
    },
    /// Replace a profile's tags.
    UpdateTags {
        name: String,
        #[arg(long, required = true)]
        tag: Vec<String>,
    },
    /// Static validation of a profile's user-data directory.
    Validate { name: String },
    /// Export a profile as a .tar.gz archive.
    Export { name: String, output: PathBuf },
    /// Import a previously exported archive.
    Import {
        archive: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Open a headful browser on the profile so a human can log in.
    Login {
        name: String,
        /// Page to open for the login.
        #[arg(long)]
        url: String,
    },
}

pub(crate) async fn execute(config: Config, command: ProfileCommand) -> Result<i32> {
    match command {
        ProfileCommand::Login { name, url } => login(config, name, url).await,
        command => {
            let store = ProfileStore::open(&config.profiles_root).with_context(|| {
                format!("cannot open profiles root {}", config.profiles_root.display())
            })?;
            catalog_command(&store, command)
        }
    }
}

fn catalog_command(store: &ProfileStore, command: ProfileCommand) -> Result<i32> {
    match command {
        ProfileCommand::Create {
            name,
            description,
            tag,
            auto_login_site,
            timeout,
        } => {
            let profile = store.create(NewProfile {
                name,
                description,
                tags: tag,
                auto_login_sites: auto_login_site,
                session_timeout_hours: Some(timeout),
            })?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        ProfileCommand::List { tag } => {
            let filter = if tag.is_empty() { None } else { Some(tag.as_slice()) };
            let profiles = store.list(filter);
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "profiles": profiles,
                    "total_count": profiles.len(),
                }))?
            );
        }
        ProfileCommand::Delete { name, keep_data } => {
            store.delete(&name, keep_data)?;
            println!("Deleted profile: {name}");
        }
        ProfileCommand::UpdateTags { name, tag } => {
            store.update_tags(&name, tag.clone())?;
            println!("{}", serde_json::to_string_pretty(&json!({ "tags": tag }))?);
        }
        ProfileCommand::Validate { name } => {
            let report = store.validate(&name)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ProfileCommand::Export { name, output } => {
            let archive = store.export(&name, &output)?;
            println!("Exported profile to {}", archive.display());
        }
        ProfileCommand::Import { archive, name } => {
            let profile = store.import(&archive, name.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        ProfileCommand::Login { .. } => unreachable!("handled by execute"),
    }
    Ok(0)
}

/// Human-assisted login bootstrap: open a visible browser on the profile,
/// wait for the operator, then record the login requirement.
async fn login(config: Config, name: String, url: String) -> Result<i32> {
    let context = context::build(config).await?;
    let center = context.center;
    let store = center.store();

    if store.get(&name).is_none() {
        store.create(NewProfile {
            name: name.clone(),
            description: format!("Profile with authenticated session for {url}"),
            tags: vec!["authenticated".to_string()],
            auto_login_sites: vec![url.clone()],
            session_timeout_hours: None,
        })?;
        println!("Created profile: {name}");
    }
    store.mark_requires_human_login(&name, true, format!("Manual login required for {url}"))?;

    let entry = center
        .open(SessionOptions {
            headless: false,
            requirements: SessionRequirements::named(&name),
        })
        .await?;
    entry
        .driver
        .goto(
            &url,
            Default::default(),
            std::time::Duration::from_secs(120),
        )
        .await?;

    println!("Browser opened at {url}.");
    println!("Log in manually, then press ENTER to save the session...");
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    })
    .await?;

    center.close(&entry.id).await?;
    println!("Profile '{name}' login setup completed.");
    println!("Future scripts can reuse this authenticated session.");
    Ok(0)
}
