use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use policywatch::activity::HttpActivity;
use policywatch::cli::{BreakerCommand, Cli, Command};
use policywatch::config::PolicywatchConfig;
use policywatch::item::Stage;
use policywatch::scheduler::{Scheduler, SeedEntry, SeedFile};
use policywatch::schema::SchemaRegistry;
use policywatch::store::{ArtifactStore, FileStore};
use policywatch::ui::{self, StageProgress};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "policywatch=debug" } else { "policywatch=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = PolicywatchConfig::load_from(&cli.config)?;
    let data_dir = Path::new(&config.data_dir);
    let store = Arc::new(FileStore::open(data_dir.join("state"))?);
    let artifacts = ArtifactStore::open(data_dir.join("artifacts"))?;
    let executor = HttpActivity::new(
        config.endpoints.scrape_url.clone(),
        config.endpoints.llm_url.clone(),
        config.api_key.clone(),
    );
    let scheduler = Scheduler::new(config, store, artifacts, SchemaRegistry::builtin(), executor);

    match cli.command {
        Command::Seed { ids, file } => {
            let mut entries = Vec::new();
            for id in &ids {
                entries.push(SeedEntry::parse_id(id)?);
            }
            if let Some(path) = file {
                let contents = std::fs::read_to_string(path)?;
                entries.extend(toml::from_str::<SeedFile>(&contents)?.items);
            }
            let created = scheduler.seed(&entries)?;
            println!("Seeded {created} new item(s), {} already present", entries.len() - created as usize);
        }

        Command::Run { stage } => {
            let recovered = scheduler.recover()?;
            if recovered > 0 {
                println!("Recovered {recovered} interrupted item(s)");
            }
            let stages: Vec<Stage> = match stage {
                Some(arg) => vec![arg.into()],
                None => Stage::ALL.to_vec(),
            };
            for stage in stages {
                let progress = StageProgress::start(stage);
                let report = scheduler.run_stage(stage).await?;
                progress.complete(stage, &report);
            }
        }

        Command::Status { workflow, state } => {
            let items = scheduler.query(workflow.as_deref(), state.map(Into::into))?;
            ui::print_items(&items);
        }

        Command::Breaker { command } => match command {
            BreakerCommand::Status => {
                let workflows = scheduler.breakers().known_workflows()?;
                if workflows.is_empty() {
                    println!("No breaker records yet.");
                }
                for workflow in workflows {
                    if let Some(record) = scheduler.breakers().status(&workflow)? {
                        ui::print_breaker(&workflow, &record);
                    }
                }
            }
            BreakerCommand::Reset { workflow } => {
                scheduler.breakers().reset(&workflow)?;
                println!("Breaker for {workflow} reset to closed");
            }
        },

        Command::Cancel { workflow } => {
            let report = scheduler.cancel(&workflow)?;
            ui::print_cancel(&workflow, &report);
        }

        Command::Replay { id, stage } => {
            let item = scheduler.get_item(&id)?;
            if scheduler.revalidate(&item.key, stage.into())? {
                println!("{id}: stored payload is valid");
            } else {
                println!("{id}: stored payload FAILS validation");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
