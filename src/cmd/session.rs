//! Session commands: `create`, `advance`, `resume`, `status`, `history`, `submit`.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use labtriage::config::TriageConfig;
use labtriage::models::{Decision, InterruptKind};
use labtriage::orchestrator::{
    HistoryEntry, SessionStatus, SessionView, Supervisor, SupervisorError, build_supervisor,
};

use super::super::Cli;

fn supervisor(config: &TriageConfig) -> Result<Supervisor> {
    build_supervisor(config, None)
}

/// Run `op` behind a spinner when a human is watching stderr.
async fn with_spinner<T, F>(cli: &Cli, message: &str, op: F) -> Result<T, SupervisorError>
where
    F: Future<Output = Result<T, SupervisorError>>,
{
    if cli.json || !console::Term::stderr().is_term() {
        return op.await;
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .expect("progress bar template is a valid static string"),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    let result = op.await;
    spinner.finish_and_clear();
    result
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn print_view(cli: &Cli, view: &SessionView) -> Result<()> {
    if cli.json {
        return print_json(view);
    }

    let status = match view.status {
        SessionStatus::Running => style(view.status.to_string()).cyan(),
        SessionStatus::AwaitingApproval { .. } => style(view.status.to_string()).yellow(),
        SessionStatus::Complete => style(view.status.to_string()).green(),
    };
    println!();
    println!("{} {}", style("Session").bold(), view.session_id);
    println!("  status: {}", status.bold());
    println!("  step:   {}", view.current_step);

    let state = &view.state;
    if !state.biomarkers.is_empty() {
        println!();
        println!("{}", style("Biomarkers").bold());
        for biomarker in state.biomarkers.values() {
            let flag = if biomarker.status.is_abnormal() {
                style(biomarker.status.as_str()).red().bold()
            } else {
                style(biomarker.status.as_str()).dim()
            };
            println!(
                "  {:<24} {:>10} {:<10} {:<12} {}",
                biomarker.name,
                biomarker.value,
                biomarker.unit,
                biomarker.range_label(),
                flag
            );
        }
    }
    if let Some(summary) = &state.interpretation_summary {
        println!();
        println!("  {}", summary);
    }
    if state.specialist_needed {
        println!();
        println!(
            "{} {}{}",
            style("Referral:").bold(),
            state.specialist_type.as_deref().unwrap_or("specialist"),
            state
                .specialist_condition
                .as_deref()
                .map(|c| format!(" ({})", c))
                .unwrap_or_default()
        );
    }
    for result in &state.specialist_results {
        let rating = result
            .rating
            .map(|r| format!(" ★ {:.1}", r))
            .unwrap_or_default();
        println!("  - {}, {}{}", result.name, result.location, rating);
    }
    if state.specialist_search_approved && state.specialist_results.is_empty() && view.status == SessionStatus::Complete {
        println!("  {}", style("No specialists matched the search.").dim());
    }
    if !state.external_record_ids.is_empty() {
        println!();
        println!(
            "{} {}",
            style("Records:").bold(),
            state.external_record_ids.join(", ")
        );
    }
    if let Some(disclaimer) = &state.medical_disclaimer {
        println!();
        println!("{}", style(disclaimer).dim());
    }
    if let SessionStatus::AwaitingApproval { interrupt } = view.status {
        println!();
        println!(
            "Waiting for a decision on {}. Run `labtriage resume {} --approve` or `--deny`.",
            style(interrupt).yellow(),
            view.session_id
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_create(
    config: &TriageConfig,
    cli: &Cli,
    file: Option<&Path>,
    text: Option<&str>,
    location: Option<&str>,
    advance: bool,
) -> Result<()> {
    let sup = supervisor(config)?;
    let mut view = match (file, text) {
        (Some(path), _) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read report {}", path.display()))?;
            sup.create_from_document(&bytes, location).await?
        }
        (None, Some(text)) => sup.create(text, location).await?,
        (None, None) => bail!("Provide a report file or --text"),
    };
    if advance {
        let id = view.session_id.clone();
        view = with_spinner(cli, "Interpreting report...", sup.advance(&id)).await?;
    }
    print_view(cli, &view)
}

pub async fn cmd_advance(config: &TriageConfig, cli: &Cli, session_id: &str) -> Result<()> {
    let sup = supervisor(config)?;
    let view = with_spinner(cli, "Advancing session...", sup.advance(session_id)).await?;
    print_view(cli, &view)
}

pub async fn cmd_resume(
    config: &TriageConfig,
    cli: &Cli,
    session_id: &str,
    approve: bool,
    deny: bool,
    interrupt: Option<&str>,
) -> Result<()> {
    let expected = interrupt
        .map(|kind| kind.parse::<InterruptKind>())
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let sup = supervisor(config)?;

    let decision = match (approve, deny) {
        (true, _) => Decision::Approve,
        (_, true) => Decision::Deny,
        _ => prompt_decision(&sup, session_id).await?,
    };

    let view = with_spinner(
        cli,
        "Resuming session...",
        sup.resume(session_id, decision, expected),
    )
    .await?;
    print_view(cli, &view)
}

/// Ask on the terminal; refuse to guess when nobody is there to answer.
async fn prompt_decision(sup: &Supervisor, session_id: &str) -> Result<Decision> {
    if !console::Term::stdout().is_term() {
        bail!("Pass --approve or --deny");
    }
    let view = sup.get_state(session_id).await?;
    let SessionStatus::AwaitingApproval { interrupt } = view.status else {
        bail!("Session {} is not waiting for approval", session_id);
    };

    let prompt = match interrupt {
        InterruptKind::SpecialistSearch => format!(
            "Search for a {} near {}?",
            view.state
                .specialist_type
                .as_deref()
                .unwrap_or("specialist"),
            view.state
                .patient_location
                .as_deref()
                .unwrap_or("the configured default location")
        ),
    };
    let choice = dialoguer::Select::new()
        .with_prompt(prompt)
        .items(&["Approve", "Deny"])
        .default(0)
        .interact()
        .context("Failed to read decision")?;
    Ok(if choice == 0 {
        Decision::Approve
    } else {
        Decision::Deny
    })
}

pub async fn cmd_status(config: &TriageConfig, cli: &Cli, session_id: &str) -> Result<()> {
    let view = supervisor(config)?.get_state(session_id).await?;
    print_view(cli, &view)
}

pub async fn cmd_history(config: &TriageConfig, cli: &Cli, session_id: &str) -> Result<()> {
    let history: Vec<HistoryEntry> = supervisor(config)?.history(session_id).await?;
    if cli.json {
        return print_json(&history);
    }
    println!();
    println!("{} {}", style("History of").bold(), session_id);
    for entry in &history {
        let pending = entry
            .pending_interrupt
            .map(|k| format!("  awaiting {}", style(k).yellow()))
            .unwrap_or_default();
        println!(
            "  #{:<3} {}  {:<28} biomarkers={}{}",
            entry.sequence,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.step.as_str(),
            entry.biomarker_count,
            pending
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_submit(config: &TriageConfig, cli: &Cli, session_id: &str) -> Result<()> {
    let sup = supervisor(config)?;
    let view = with_spinner(cli, "Submitting records...", sup.submit_records(session_id)).await?;
    print_view(cli, &view)
}

pub async fn cmd_chat(
    config: &TriageConfig,
    cli: &Cli,
    session_id: &str,
    message: &str,
) -> Result<()> {
    let sup = supervisor(config)?;
    let reply = with_spinner(cli, "Thinking...", sup.chat(session_id, message)).await?;
    if cli.json {
        return print_json(&reply);
    }
    println!();
    println!("{}", reply.message);
    println!();
    Ok(())
}
