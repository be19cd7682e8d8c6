mod cli;

use pathway::backend::simulated::SimulatedBackend;
use pathway::config::StackConfig;
use pathway::descriptor::{Mode, ResourceId, ResourceKind};
use pathway::discovery::RetryPolicy;
use pathway::executor::{Executor, ExecutorSettings, LiveResource};
use pathway::outputs::Outputs;
use pathway::resolver::ExecutionPlan;
use pathway::stack::Stack;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("PATHWAY_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(1);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err,);
                    std::process::exit(1);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = match cli.command {
        cli::Command::Plan(plan_cli) => plan(plan_cli),
        cli::Command::Rehearse(rehearse_cli) => rehearse(rehearse_cli).await,
    };

    if let Err(e) = command_result {
        for error in e.chain() {
            eprintln!("{error}")
        }
        std::process::exit(1);
    }
}

#[derive(serde::Serialize)]
struct Step<'a> {
    id: &'a ResourceId,
    kind: &'a ResourceKind,
    lookup: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<&'a ResourceId>,
}

fn steps(plan: &ExecutionPlan) -> Vec<Step<'_>> {
    plan.steps()
        .iter()
        .map(|step| Step {
            id: step.id(),
            kind: step.kind(),
            lookup: step.mode() == Mode::Lookup,
            depends_on: step.depends_on().iter().collect(),
        })
        .collect()
}

#[derive(serde::Serialize)]
struct PlanReport<'a> {
    primary: Vec<Step<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    accelerator: Option<Vec<Step<'a>>>,
}

pub fn plan(cli: cli::PlanCommand) -> anyhow::Result<()> {
    let config = StackConfig::load(&cli.input.env_file)?;
    let stack = Stack::new(&config)?;

    let report = PlanReport {
        primary: steps(stack.primary()),
        accelerator: stack.accelerator().plan().map(|branch| steps(branch.plan())),
    };

    output(&cli.output, &report)
}

#[derive(serde::Serialize)]
struct RehearsalReport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    failed: Option<&'a ResourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
    outputs: &'a Outputs,
    live: &'a [LiveResource],
}

pub async fn rehearse(cli: cli::RehearseCommand) -> anyhow::Result<()> {
    let config = StackConfig::load(&cli.input.env_file)?;
    let stack = Stack::new(&config)?;

    let settings = ExecutorSettings {
        concurrency: usize::try_from(cli.concurrency)?,
        retry: RetryPolicy {
            max_attempts: cli.max_attempts,
            backoff_base_ms: cli.backoff_ms,
            backoff_max_ms: cli.backoff_max_ms,
            query_timeout_ms: cli.query_timeout_ms,
        },
    };
    let backend = Arc::new(SimulatedBackend::new(cli.discovery_lag));
    let executor = Executor::new(backend, settings);

    let cancel = executor.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, letting in-flight resources finish");
            cancel.cancel();
        }
    });

    match stack.provision(&executor).await {
        Ok(result) => output(
            &cli.output,
            &RehearsalReport {
                failed: None,
                cause: None,
                outputs: &result.outputs,
                live: &result.live(),
            },
        ),
        Err(failed) => {
            output(
                &cli.output,
                &RehearsalReport {
                    failed: Some(&failed.resource),
                    cause: Some(failed.cause.to_string()),
                    outputs: &failed.outputs,
                    live: &failed.live,
                },
            )?;
            Err(failed.into())
        }
    }
}

fn output<T: serde::Serialize>(output: &cli::OutputArgs, value: &T) -> anyhow::Result<()> {
    match output.format {
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), value)?,
        cli::OutputFormat::Json => {
            serde_json::to_writer_pretty(std::io::stdout(), value)?;
            println!();
        }
    };

    Ok(())
}
