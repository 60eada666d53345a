use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use marketplace_installer::{
    ArtifactSignature, CancelAck, InstallRequest, JobStatus, JobView, Marketplace,
    MarketplaceConfig, ENV_ROOT,
};
use serde_json::json;
use tracing::debug;

use crate::completion::write_completions_script;
use crate::render::{
    format_config_lines, format_job_outcome_lines, format_registry_lines, format_sweep_lines,
    format_transition_line, DownloadProgress, OutputStyle, TerminalRenderer,
};
use crate::{Cli, Commands};

pub(crate) async fn run_cli(cli: Cli) -> Result<ExitCode> {
    let config = resolve_config(&cli)?;
    let json_output = cli.json;

    match cli.command {
        Commands::Install {
            app_id,
            source,
            sha256,
            signature,
            public_key,
            replace,
        } => {
            let request = build_install_request(source, sha256, signature, public_key, replace);
            let marketplace = Marketplace::open(config)?;
            let job_id = marketplace.start_install(&app_id, request)?;
            follow_job(&marketplace, &job_id, json_output).await
        }
        Commands::Uninstall { app_id } => {
            let marketplace = Marketplace::open(config)?;
            let job_id = marketplace.start_uninstall(&app_id)?;
            follow_job(&marketplace, &job_id, json_output).await
        }
        Commands::List => {
            let marketplace = Marketplace::open(config)?;
            let entries = marketplace.list_registry().await?;
            if json_output {
                print_json(&entries)?;
            } else {
                TerminalRenderer::current().print_lines(&format_registry_lines(&entries));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sweep => {
            let marketplace = Marketplace::open(config)?;
            let report = marketplace.sweep_orphans().await?;
            if json_output {
                print_json(&report)?;
            } else {
                TerminalRenderer::current().print_lines(&format_sweep_lines(&report));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            if json_output {
                print_json(&config_json(&config))?;
            } else {
                TerminalRenderer::current().print_lines(&format_config_lines(&config));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            write_completions_script(shell, &mut stdout)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<MarketplaceConfig> {
    let Some(root) = &cli.root else {
        return MarketplaceConfig::from_env();
    };
    MarketplaceConfig::from_lookup(|key| {
        if key == ENV_ROOT {
            Some(root.display().to_string())
        } else {
            std::env::var(key).ok()
        }
    })
}

pub(crate) fn build_install_request(
    source: String,
    sha256: Option<String>,
    signature: Option<String>,
    public_key: Option<String>,
    replace: bool,
) -> InstallRequest {
    let mut request = InstallRequest::new(source);
    request.expected_sha256 = sha256;
    request.signature = match (signature, public_key) {
        (Some(signature_hex), Some(public_key_hex)) => Some(ArtifactSignature {
            public_key_hex,
            signature_hex,
        }),
        _ => None,
    };
    request.replace_existing = replace;
    request
}

async fn follow_job(
    marketplace: &Marketplace,
    job_id: &str,
    json_output: bool,
) -> Result<ExitCode> {
    let mut receiver = marketplace
        .jobs()
        .subscribe(job_id)
        .ok_or_else(|| anyhow!("job {job_id} is not tracked by this process"))?;
    let renderer = if json_output {
        TerminalRenderer::from_style(OutputStyle::Plain)
    } else {
        TerminalRenderer::current()
    };

    let mut last_status = None;
    let mut progress: Option<DownloadProgress> = None;
    let mut interrupted = false;
    let final_view = loop {
        let view = receiver.borrow_and_update().clone();
        if last_status != Some(view.status) {
            last_status = Some(view.status);
            if view.status != JobStatus::Downloading {
                if let Some(progress) = progress.take() {
                    if view.status.is_terminal() && view.status != JobStatus::Succeeded {
                        progress.finish_abandon();
                    } else {
                        progress.finish_success();
                    }
                }
            }
            if !json_output && !view.status.is_terminal() {
                let line = format_transition_line(&view);
                match &progress {
                    Some(progress) => progress.suspend(|| renderer.print_status("step", &line)),
                    None => renderer.print_status("step", &line),
                }
            }
            if view.status == JobStatus::Downloading && !json_output {
                progress = Some(renderer.start_progress("download"));
            }
        }
        if let Some(progress) = progress.as_mut() {
            progress.set(view.bytes_downloaded, view.total_bytes);
        }
        if view.status.is_terminal() {
            break view;
        }

        tokio::select! {
            changed = receiver.changed() => {
                if changed.is_err() {
                    break marketplace
                        .poll(job_id)
                        .ok_or_else(|| anyhow!("job {job_id} disappeared"))?;
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("failed to listen for ctrl-c")?;
                interrupted = true;
                let ack = marketplace.cancel(job_id);
                debug!(job_id, ?ack, "cancellation requested from terminal");
                if ack == CancelAck::Requested && !json_output {
                    eprintln!("cancelling job {job_id}...");
                }
            }
        }
    };
    if let Some(progress) = progress.take() {
        progress.finish_abandon();
    }

    report_outcome(renderer, &final_view, json_output)?;
    Ok(exit_code_for(&final_view))
}

fn report_outcome(renderer: TerminalRenderer, view: &JobView, json_output: bool) -> Result<()> {
    if json_output {
        return print_json(view);
    }
    renderer.print_lines(&format_job_outcome_lines(view, renderer.style()));
    Ok(())
}

pub(crate) fn exit_code_for(view: &JobView) -> ExitCode {
    if view.status == JobStatus::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

pub(crate) fn config_json(config: &MarketplaceConfig) -> serde_json::Value {
    json!({
        "root": config.root,
        "max_artifact_bytes": config.max_artifact_bytes,
        "lock_lease_secs": config.lock_lease.as_secs(),
        "lock_wait_secs": config.lock_wait_timeout.as_secs(),
        "retry": {
            "max_attempts": config.retry.max_attempts,
            "base_delay_ms": config.retry.base_delay.as_millis() as u64,
            "max_delay_ms": config.retry.max_delay.as_millis() as u64,
        },
        "fetch_timeout_secs": config.fetch_timeout.as_secs(),
        "staging_grace_secs": config.staging_grace.as_secs(),
        "job_retention_secs": config.job_retention.as_secs(),
        "sweep_interval_secs": config.sweep_interval.as_secs(),
    })
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(value).context("failed to serialize command output")?;
    println!("{rendered}");
    Ok(())
}
