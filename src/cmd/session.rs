//! Session commands: start, status, decide, resume, list, log, artifact.

use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use stagegate::config::StagegateConfig;
use stagegate::store::open_store;
use stagegate_common::{DecisionRequest, GateToken, RunState, SessionId, SessionStatus};

use super::build_engine;

/// Decision given on the command line, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionChoice {
    Approve,
    Revise(String),
    Abort,
    Prompt,
}

impl DecisionChoice {
    pub fn from_flags(approve: bool, revise: Option<String>, abort: bool) -> Self {
        match (approve, revise, abort) {
            (true, _, _) => Self::Approve,
            (_, Some(feedback), _) => Self::Revise(feedback),
            (_, _, true) => Self::Abort,
            _ => Self::Prompt,
        }
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    raw.parse()
        .map_err(|e| anyhow::anyhow!("Invalid session id '{}': {}", raw, e))
}

fn state_label(state: RunState) -> String {
    match state {
        RunState::AwaitingDecision => style(state.as_str()).yellow().to_string(),
        RunState::Running => style(state.as_str()).cyan().to_string(),
        RunState::Finalized => style(state.as_str()).green().to_string(),
        RunState::Terminated => style(state.as_str()).dim().to_string(),
        RunState::Failed => style(state.as_str()).red().to_string(),
    }
}

pub fn print_status(status: &SessionStatus) {
    println!();
    println!("Session {}", style(status.session_id).bold());
    println!("  Stage:     {}", status.current_stage);
    println!("  State:     {}", state_label(status.state));
    println!("  Version:   {}", status.version);
    if !status.completed_stages.is_empty() {
        let stages: Vec<&str> = status.completed_stages.iter().map(|s| s.as_str()).collect();
        println!("  Approved:  {}", stages.join(" → "));
    }
    let backlog = &status.backlog_summary;
    if backlog.total > 0 {
        println!(
            "  Backlog:   {} done, {} failed, {} pending, {} revising of {}",
            backlog.done, backlog.failed, backlog.pending, backlog.revising, backlog.total
        );
    }
    for (key, count) in &status.revision_counts {
        println!("  Revisions: {} = {}", key, count);
    }
    if let Some(reason) = &status.failure {
        println!("  Failure:   {}", style(reason).red());
    }
    if let Some(gate) = &status.pending_gate {
        println!();
        println!(
            "  Awaiting decision on {} (draft v{})",
            style(gate.stage).yellow(),
            gate.payload_version
        );
        println!("  Token:     {}", gate.lock_token);
        println!(
            "  Resume with: stagegate decide {} --approve | --revise \"...\" | --abort",
            status.session_id
        );
    }
    println!();
}

pub async fn cmd_start(config: &StagegateConfig, file: &Path) -> Result<()> {
    let document = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read input document {}", file.display()))?;
    if document.trim().is_empty() {
        bail!("Input document {} is empty", file.display());
    }

    let engine = build_engine(config)?;
    let session = engine.create_session(document).await?;
    println!("Started session {}", style(session.session_id).bold());

    let status = engine.drive(session.session_id).await?;
    print_status(&status);
    Ok(())
}

pub async fn cmd_status(config: &StagegateConfig, session_id: &str) -> Result<()> {
    let id = parse_session_id(session_id)?;
    let store = open_store(config)?;
    let session = store.load(id).await?;
    print_status(&session.status());
    Ok(())
}

fn prompt_decision(status: &SessionStatus) -> Result<DecisionRequest> {
    if let Some(gate) = &status.pending_gate {
        println!();
        println!("{} draft:", style(gate.stage).yellow().bold());
        println!("{}", serde_json::to_string_pretty(&gate.payload)?);
        println!();
    }

    let options = &["Approve", "Request a revision", "Abort the pipeline"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Decision")
        .items(options)
        .default(0)
        .interact()?;

    match selection {
        0 => Ok(DecisionRequest::approve()),
        1 => {
            let feedback: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("Feedback")
                .interact_text()?;
            Ok(DecisionRequest::revise(feedback))
        }
        _ => Ok(DecisionRequest::abort()),
    }
}

pub async fn cmd_decide(
    config: &StagegateConfig,
    session_id: &str,
    choice: DecisionChoice,
    token: Option<&str>,
) -> Result<()> {
    let id = parse_session_id(session_id)?;
    let engine = build_engine(config)?;
    let status = engine.get_status(id).await?;

    let token: GateToken = match token {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid gate token '{}': {}", raw, e))?,
        None => match &status.pending_gate {
            Some(gate) => gate.lock_token,
            None => bail!(
                "Session {} is not awaiting a decision (state: {})",
                id,
                status.state
            ),
        },
    };

    let request = match choice {
        DecisionChoice::Approve => DecisionRequest::approve(),
        DecisionChoice::Revise(feedback) => DecisionRequest::revise(feedback),
        DecisionChoice::Abort => DecisionRequest::abort(),
        DecisionChoice::Prompt => prompt_decision(&status)?,
    };

    let status = engine.submit_decision(id, token, &request).await?;
    println!("Decision '{}' applied", request.decision);

    let status = if status.state == RunState::Running {
        engine.drive(id).await?
    } else {
        status
    };
    print_status(&status);
    Ok(())
}

pub async fn cmd_resume(config: &StagegateConfig, session_id: &str) -> Result<()> {
    let id = parse_session_id(session_id)?;
    let engine = build_engine(config)?;
    let status = engine.resume(id).await?;
    print_status(&status);
    Ok(())
}

pub async fn cmd_list(config: &StagegateConfig) -> Result<()> {
    let store = open_store(config)?;
    let sessions = store.list().await?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<12}  {:<18}  {}",
        "SESSION", "STAGE", "STATE", "LAST ACTIVITY"
    );
    for summary in sessions {
        println!(
            "{:<36}  {:<12}  {:<18}  {}",
            summary.session_id,
            summary.current_stage.as_str(),
            summary.state.as_str(),
            summary.last_activity.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn cmd_log(config: &StagegateConfig, session_id: &str) -> Result<()> {
    let id = parse_session_id(session_id)?;
    let store = open_store(config)?;
    store.load(id).await?;
    for event in store.events(id).await? {
        let item = event
            .item_id
            .as_deref()
            .map(|i| format!(" [{}]", i))
            .unwrap_or_default();
        let kind = if event.is_terminal() {
            style(event.kind.as_str()).bold().to_string()
        } else {
            event.kind.as_str().to_string()
        };
        println!(
            "{:>4}  {}  {:<12} {}{} {}",
            event.seq,
            style(event.timestamp.format("%H:%M:%S")).dim(),
            event.stage.as_str(),
            kind,
            item,
            style(&event.detail).dim()
        );
    }
    Ok(())
}

pub async fn cmd_artifact(config: &StagegateConfig, session_id: &str, key: &str) -> Result<()> {
    let id = parse_session_id(session_id)?;
    let store = open_store(config)?;
    let session = store.load(id).await?;
    let artifact = session
        .artifact(key)
        .with_context(|| format!("No artifact '{}' in session {}", key, id))?;
    println!("{}", serde_json::to_string_pretty(&artifact.content)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pick_a_decision() {
        assert_eq!(DecisionChoice::from_flags(true, None, false), DecisionChoice::Approve);
        assert_eq!(
            DecisionChoice::from_flags(false, Some("more".into()), false),
            DecisionChoice::Revise("more".into())
        );
        assert_eq!(DecisionChoice::from_flags(false, None, true), DecisionChoice::Abort);
        assert_eq!(DecisionChoice::from_flags(false, None, false), DecisionChoice::Prompt);
    }
}
