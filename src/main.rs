//! Binary entry point for the sshprov CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sshprov::{
    ApplyReport, ConfigError, Engine, GraphError, InstallConfig, InstallError, PlanEntry,
    ProvisionContext, Ssh2Connector, State, StateStore, StateStoreError, build_install_graph,
    exports, preview,
};

mod cli;

use cli::{Cli, StateArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("installer plan error: {0}")]
    Install(#[from] InstallError),
    #[error("state error: {0}")]
    State(#[from] StateStoreError),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Apply(args) => apply_command(&args).await,
        Cli::Preview(args) => preview_command(&args),
    }
}

fn load(args: &StateArgs) -> Result<(InstallConfig, StateStore, State), CliError> {
    let config = InstallConfig::load_without_cli_args()?;
    config.validate()?;
    let store = StateStore::new(args.state.as_deref().unwrap_or(&config.state_path));
    let state = store.load()?;
    Ok((config, store, state))
}

async fn apply_command(args: &StateArgs) -> Result<i32, CliError> {
    let (config, store, mut state) = load(args)?;
    let graph = build_install_graph(&config)?;
    let context =
        ProvisionContext::new(Ssh2Connector::default()).with_retry_policy(config.retry_policy());
    let engine = Engine::new(context);

    let outcome = engine.apply(&graph, &mut state).await;
    store.save(&state)?;
    let report = outcome?;
    info!(state = %store.path(), "state saved");

    let mut stdout = io::stdout();
    write_report(&mut stdout, &report)?;
    if report.has_failures() {
        return Ok(1);
    }
    write_exports(&mut stdout, &exports(&config))?;
    Ok(0)
}

fn preview_command(args: &StateArgs) -> Result<i32, CliError> {
    let (config, _store, state) = load(args)?;
    let graph = build_install_graph(&config)?;
    let plan = preview(&graph, &state)?;
    write_plan(io::stdout(), &plan)?;
    Ok(0)
}

fn write_plan(mut target: impl Write, plan: &[PlanEntry]) -> io::Result<()> {
    for entry in plan {
        writeln!(target, "{} ({}): {}", entry.name, entry.kind, entry.action)?;
    }
    Ok(())
}

fn write_report(mut target: impl Write, report: &ApplyReport) -> io::Result<()> {
    for node in &report.nodes {
        writeln!(target, "{} ({}): {}", node.name, node.kind, node.outcome)?;
    }
    Ok(())
}

fn write_exports(mut target: impl Write, values: &[(&'static str, String)]) -> io::Result<()> {
    for (key, value) in values {
        writeln!(target, "{key} = {value}")?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
