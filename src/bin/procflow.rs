use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use procflow::{
    CreateFlowParam, FlowModel, MemoryStore, ProcessEngine, StartProcessParam, UpdateFlowParam,
};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "procflow", version, about = "Procflow CLI", author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a flow model file
    Validate {
        #[arg(long)]
        file: PathBuf,
    },
    /// Deploy a flow model into an in-memory engine and start it
    Run {
        #[arg(long)]
        file: PathBuf,
        /// Start variables as a JSON object
        #[arg(long, default_value = "{}")]
        vars: String,
        /// Commit suspended user tasks with empty variables until the flow ends
        #[arg(long, default_value_t = false)]
        auto_commit: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { file } => handle_validate(file)?,
        Command::Run {
            file,
            vars,
            auto_commit,
        } => handle_run(file, vars, auto_commit).await?,
    }
    Ok(())
}

fn handle_validate(file: PathBuf) -> anyhow::Result<()> {
    let model = read_model(&file)?;
    model.validate()?;
    println!(
        "Flow model `{}` is valid ({} nodes)",
        file.display(),
        model.nodes.len()
    );
    Ok(())
}

async fn handle_run(file: PathBuf, vars: String, auto_commit: bool) -> anyhow::Result<()> {
    let model = read_model(&file)?;
    let variables: BTreeMap<String, Value> = serde_json::from_str(&vars)?;
    let flow_key = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "flow".to_string());

    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    let flow_module_id = engine
        .create_flow(CreateFlowParam {
            flow_key: flow_key.clone(),
            flow_name: flow_key,
            operator: "procflow-cli".to_string(),
            remark: String::new(),
        })
        .await?;
    engine
        .update_flow(UpdateFlowParam {
            flow_module_id: flow_module_id.clone(),
            flow_model: Some(model),
            ..Default::default()
        })
        .await?;
    engine.deploy_flow(&flow_module_id).await?;

    let mut result = engine
        .start_process(StartProcessParam {
            flow_module_id: Some(flow_module_id),
            variables,
            ..Default::default()
        })
        .await?;

    loop {
        match result.active_task {
            Some(task) => {
                println!(
                    "Suspended at user task `{}` (node instance `{}`, flow instance `{}`)",
                    task.node_key, task.node_instance_id, task.flow_instance_id
                );
                if !auto_commit {
                    break;
                }
                result = engine
                    .commit_task(&task.flow_instance_id, &task.node_instance_id, BTreeMap::new())
                    .await?;
            }
            None => {
                println!(
                    "Flow instance `{}` finished with status {:?}",
                    result.flow_instance_id, result.status
                );
                break;
            }
        }
    }
    Ok(())
}

fn read_model(file: &PathBuf) -> anyhow::Result<FlowModel> {
    let content = fs::read_to_string(file)?;
    Ok(serde_json::from_str(&content)?)
}
