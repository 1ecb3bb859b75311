#![allow(clippy::result_large_err)]

use anyhow::{anyhow, Context};
use as4_engine::config::EngineConfig;
use as4_engine::pipeline::ComponentRegistry;
use as4_engine::pmode::load_directory;
use as4_engine::telemetry;
use std::path::PathBuf;

enum CliCommand {
    Run { agents_path: Option<PathBuf> },
    ValidatePModes { directories: Vec<PathBuf> },
    ListComponents,
    Help,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    match parse_cli_args()? {
        CliCommand::Run { agents_path } => {
            let mut config = EngineConfig::load().context("failed to load configuration")?;
            if let Some(path) = agents_path {
                config.agents_path = Some(path);
            }

            let app = as4_engine::app::EngineApp::initialise(config)
                .await
                .context("failed to construct application")?;

            app.run().await.context("application runtime error")
        }
        CliCommand::ValidatePModes { directories } => run_validate_pmodes(directories),
        CliCommand::ListComponents => {
            print_components();
            Ok(())
        }
        CliCommand::Help => {
            print_help();
            Ok(())
        }
    }
}

fn parse_cli_args() -> anyhow::Result<CliCommand> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliCommand::Run { agents_path: None });
    };

    if first == "validate-pmodes" {
        let directories: Vec<PathBuf> = args.map(PathBuf::from).collect();
        if directories.is_empty() {
            anyhow::bail!("as4-engine validate-pmodes requires at least one directory");
        }
        return Ok(CliCommand::ValidatePModes { directories });
    }

    let mut agents_path = None;
    let mut pending = Some(first);

    loop {
        let arg = match pending.take() {
            Some(value) => value,
            None => match args.next() {
                Some(value) => value,
                None => break,
            },
        };

        match arg.as_str() {
            "-c" | "--config" => {
                if agents_path.is_some() {
                    anyhow::bail!("agent settings path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("expected path after {arg}"))?;
                agents_path = Some(PathBuf::from(value));
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            "--list-components" => return Ok(CliCommand::ListComponents),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    Ok(CliCommand::Run { agents_path })
}

fn print_help() {
    println!(
        "\
Usage: as4-engine [OPTIONS]
       as4-engine validate-pmodes <DIR>...

Options:
  -c, --config <PATH>    Path to the agent settings YAML file
      --list-components  Print the receivers, transformers, steps and conditions
                         agent settings may reference
  -h, --help             Print this help message
"
    );
}

fn print_components() {
    let registry = ComponentRegistry::builtin();
    let sections = [
        ("Receivers", registry.receiver_keys()),
        ("Transformers", registry.transformer_keys()),
        ("Steps", registry.step_keys()),
        ("Conditions", registry.condition_keys()),
    ];
    for (title, keys) in sections {
        println!("{title}:");
        for key in keys {
            println!("  - {key}");
        }
    }
}

fn run_validate_pmodes(directories: Vec<PathBuf>) -> anyhow::Result<()> {
    let mut had_error = false;

    for directory in directories {
        let report = match load_directory(&directory) {
            Ok(report) => report,
            Err(err) => {
                eprintln!("{err}");
                had_error = true;
                continue;
            }
        };
        for rejected in &report.rejected {
            eprintln!("{rejected}");
        }
        for warning in &report.warnings {
            eprintln!("{}: {warning}", directory.display());
        }
        if report.is_clean() {
            println!(
                "validated {} ({} pmodes)",
                directory.display(),
                report.snapshot.len()
            );
        } else {
            had_error = true;
        }
    }

    if had_error {
        Err(anyhow!("one or more pmodes failed validation"))
    } else {
        Ok(())
    }
}
