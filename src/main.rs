mod cli;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error};

use atmos::config::{Config, ConfigView, Settings};
use atmos::executor::{ExecError, RunOptions, TerraformExecutor};
use cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "atmos=warn",
        0 => "atmos=info",
        1 => "atmos=debug",
        _ => "atmos=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        // terraform has already reported its own failure
        Err(e) => match e.downcast_ref::<ExecError>() {
            Some(failed @ ExecError::ProcessFailed { .. }) => {
                ExitCode::from(u8::try_from(failed.exit_code()).unwrap_or(1))
            }
            _ => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let config = Config::load(&cwd)?;
    match config.config_file() {
        Some(path) => debug!("loaded config from {}", path.display()),
        None => debug!("no config/atmos.yml found, using defaults"),
    }

    match cli.command {
        Command::Tf {
            skip_backend,
            skip_secrets,
            get_modules,
            args,
        } => {
            let executor = TerraformExecutor::new(Arc::new(config), cli.group)?;
            let options = RunOptions {
                skip_backend,
                skip_secrets,
                get_modules,
                ..Default::default()
            };
            executor.run(&args, options)?;
            Ok(())
        }
        Command::Config { json } => {
            let settings = Settings::from_view(&config)?;
            let output = if json {
                render_config_json(&settings, config.config_file())?
            } else {
                render_config_human(&settings, config.root_dir(), config.config_file())
            };
            println!("{output}");
            Ok(())
        }
    }
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn render_config_human(settings: &Settings, root: &Path, config_path: Option<&Path>) -> String {
    let mut output = String::new();

    output.push_str("Paths\n");
    push_kv(&mut output, "root", root.display());
    push_kv(
        &mut output,
        "config",
        config_path.map_or("(none)".to_string(), |p| p.display().to_string()),
    );
    push_kv(&mut output, "tmp_root", &settings.tmp_root);
    output.push('\n');

    output.push_str("Terraform\n");
    push_kv(&mut output, "command", &settings.terraform.command);
    push_kv(&mut output, "compat11", settings.terraform.compat11);
    push_kv(
        &mut output,
        "disable_shared_plugins",
        settings.terraform.disable_shared_plugins,
    );
    output.push('\n');

    output.push_str("IPC\n");
    push_kv(&mut output, "disable", settings.ipc.disable);
    output.push('\n');

    output.push_str("Notifications\n");
    push_kv(&mut output, "disable", settings.ui.notify.disable);
    push_kv(
        &mut output,
        "command",
        settings
            .ui
            .notify
            .command
            .as_ref()
            .map_or("(platform default)".to_string(), |c| c.join(" ")),
    );
    output.push('\n');

    output.push_str("Filters\n");
    if settings.filters.disabled.is_empty() {
        push_kv(&mut output, "disabled", "(none)");
    } else {
        push_kv(&mut output, "disabled", settings.filters.disabled.join(", "));
    }

    output
}

fn render_config_json(settings: &Settings, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "settings": settings,
        "source_path": config_path.map(|p| p.display().to_string()),
    });
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
