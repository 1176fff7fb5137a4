//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use anyhow::{Context, bail};
use irflow_core::approval::{ApprovalOutcome, AutoApprovalEngine, IncidentSnapshot, ProposedAction};
use irflow_core::collaborators::{Collaborators, IncidentRecord, InMemoryIncidentStore, ManualClock};
use irflow_core::config::{IrflowConfig, load_config, workspace_config_path};
use irflow_core::recovery::{
    ErrorClassification, ErrorStatistics, RecoveryContext, RecoveryManager,
};
use irflow_core::state_machine::{StateMachine, TransitionRecord};
use irflow_core::{IncidentState, TransitionContext};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Transitions { from } => handle_transitions(from.as_deref()),
        Commands::Rules => handle_rules(workspace),
        Commands::Approve { incident, actions } => handle_approve(workspace, &incident, &actions),
        Commands::Simulate { fail_analysis } => handle_simulate(workspace, fail_analysis).await,
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load(workspace: &Path) -> anyhow::Result<IrflowConfig> {
    let config = load_config(Some(workspace), None).context("Failed to load config")?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

fn handle_transitions(from: Option<&str>) -> anyhow::Result<()> {
    let from = from
        .map(str::parse::<IncidentState>)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let sm = StateMachine::new();
    let rows: Vec<_> = sm
        .transitions()
        .iter()
        .filter(|row| from.is_none_or(|f| row.from == f))
        .collect();

    println!("Transitions ({}):", rows.len());
    for row in rows {
        let guard = row
            .guard
            .as_ref()
            .map(|g| format!("[{g}]"))
            .unwrap_or_default();
        println!(
            "  {:<26} -> {:<26} {:<24} {}",
            row.from.as_str(),
            row.to.as_str(),
            guard,
            row.description
        );
    }
    Ok(())
}

fn handle_rules(workspace: &Path) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let engine = AutoApprovalEngine::from_config(&config.approval)?;
    let source = config
        .approval
        .rules_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in".to_string());

    println!("Approval rules ({source}):");
    for rule in engine.rules() {
        let status = if rule.enabled { "enabled" } else { "disabled" };
        println!(
            "  {} ({status}, max risk {:.2}): {}",
            rule.id, rule.max_risk_score, rule.name
        );
        println!("    actions: {}", rule.action_patterns.join(", "));
        for condition in &rule.conditions {
            println!(
                "    when {} {:?} {}",
                condition.field, condition.operator, condition.value
            );
        }
    }
    if !engine.is_enabled() {
        println!("\nAuto-remediation is disabled; every request will be denied.");
    }
    Ok(())
}

/// Accept either a bare array of actions or `{"actions": [...]}`.
fn parse_actions(value: &Value) -> anyhow::Result<Vec<ProposedAction>> {
    let list = value
        .as_array()
        .or_else(|| value.get("actions").and_then(Value::as_array))
        .context("actions must be a JSON array or an object with an \"actions\" array")?;
    Ok(list.iter().map(ProposedAction::from_json).collect())
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn evaluate_request(
    engine: &AutoApprovalEngine,
    incident: &Value,
    actions: &Value,
) -> anyhow::Result<ApprovalOutcome> {
    let incident = IncidentSnapshot::from_json(incident);
    let actions = parse_actions(actions)?;
    Ok(engine.can_auto_approve(&incident, &actions))
}

fn handle_approve(workspace: &Path, incident: &Path, actions: &Path) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let engine = AutoApprovalEngine::from_config(&config.approval)?;
    let outcome = evaluate_request(&engine, &read_json(incident)?, &read_json(actions)?)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

const SIM_INCIDENT: &str = "sim-001";

/// What a simulation run produced.
pub(crate) struct SimulationReport {
    pub incident_id: String,
    pub final_state: IncidentState,
    pub approval: ApprovalOutcome,
    pub repaired: bool,
    pub history: Vec<TransitionRecord>,
    pub statistics: ErrorStatistics,
}

fn step(
    sm: &StateMachine,
    clock: &ManualClock,
    to: IncidentState,
    actor: &str,
    ctx: &TransitionContext,
) -> anyhow::Result<()> {
    clock.advance_secs(30);
    if !sm.transition(SIM_INCIDENT, to, actor, ctx) {
        bail!(
            "transition {} -> {to} rejected",
            sm.current_state(SIM_INCIDENT)
        );
    }
    Ok(())
}

/// Drive one incident through its lifecycle on simulated time and
/// in-memory collaborators.
pub(crate) async fn run_simulation(
    config: &IrflowConfig,
    fail_analysis: bool,
) -> anyhow::Result<SimulationReport> {
    let clock = Arc::new(ManualClock::default());
    let sm = Arc::new(StateMachine::new().with_clock(clock.clone()));
    let engine = AutoApprovalEngine::from_config(&config.approval)?.with_clock(clock.clone());

    let store = Arc::new(InMemoryIncidentStore::new());
    store.insert(IncidentRecord {
        id: SIM_INCIDENT.to_string(),
        status: "open".to_string(),
        title: Some("Brute-force logins against the admin portal".to_string()),
        severity: Some("high".to_string()),
        ..Default::default()
    });
    let collaborators = Collaborators {
        store: store.clone(),
        ..Collaborators::in_memory()
    };
    let recovery = RecoveryManager::new(sm.clone(), collaborators)
        .with_config(&config.recovery)
        .with_clock(clock.clone())
        .with_scheduler(clock.clone());

    let none = TransitionContext::new();
    step(&sm, &clock, IncidentState::DetectionReceived, "detector", &none)?;
    step(&sm, &clock, IncidentState::AnalysisInProgress, "orchestrator", &none)?;

    let mut repaired = false;
    if fail_analysis {
        info!(incident_id = SIM_INCIDENT, "Injecting analysis failure");
        let restarted = recovery
            .handle_error(
                "analysis agent stopped responding",
                ErrorClassification::WorkflowError,
                Some(SIM_INCIDENT),
                &RecoveryContext::new(),
            )
            .await;
        info!(incident_id = SIM_INCIDENT, restarted, "Analysis restart requested");
        let gave_up = TransitionContext::new().with("failure_reason", "analysis budget exhausted");
        step(&sm, &clock, IncidentState::Failed, "orchestrator", &gave_up)?;
        repaired = recovery.repair_incident(SIM_INCIDENT).await;
        if !repaired {
            bail!("repair of {SIM_INCIDENT} failed");
        }
    }

    step(&sm, &clock, IncidentState::AnalysisComplete, "analyzer", &none)?;
    let findings = TransitionContext::new()
        .with("confidence", 0.92)
        .with("threat_confirmed", true);
    step(
        &sm,
        &clock,
        IncidentState::RemediationRequested,
        "orchestrator",
        &findings,
    )?;

    let snapshot = IncidentSnapshot {
        id: SIM_INCIDENT.to_string(),
        severity: Some("high".to_string()),
        confidence: Some(0.92),
        attack_type: Some("brute_force".to_string()),
        threat_confirmed: Some(true),
        created_at: sm.timeline(SIM_INCIDENT).detected_at,
        prior_action_count: 0,
    };
    let actions = [
        ProposedAction::new("block_ip").on("edge-firewall"),
        ProposedAction::new("rotate_credentials").on("staging-admin-portal"),
        ProposedAction::new("snapshot_volume").on("admin-portal-db"),
    ];
    let approval = engine.can_auto_approve(&snapshot, &actions);
    if approval.approved {
        let ctx = TransitionContext::new().with("auto_approved", true);
        step(&sm, &clock, IncidentState::RemediationApproved, "auto_approval", &ctx)?;
    } else {
        let ctx = TransitionContext::new().with("approved_by", "on-call analyst");
        step(&sm, &clock, IncidentState::RemediationApproved, "analyst", &ctx)?;
    }

    step(&sm, &clock, IncidentState::RemediationInProgress, "executor", &none)?;
    let results: Vec<Value> = actions
        .iter()
        .map(|a| json!({ "action_type": a.action_type, "status": "completed" }))
        .collect();
    let done = TransitionContext::new().with("actions", results);
    step(&sm, &clock, IncidentState::RemediationComplete, "executor", &done)?;
    step(&sm, &clock, IncidentState::Resolved, "orchestrator", &none)?;
    step(&sm, &clock, IncidentState::Closed, "analyst", &none)?;

    Ok(SimulationReport {
        incident_id: SIM_INCIDENT.to_string(),
        final_state: sm.current_state(SIM_INCIDENT),
        approval,
        repaired,
        history: sm.history(SIM_INCIDENT),
        statistics: recovery.get_error_statistics(),
    })
}

async fn handle_simulate(workspace: &Path, fail_analysis: bool) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let report = run_simulation(&config, fail_analysis).await?;

    println!("Incident {} ended in {}", report.incident_id, report.final_state);
    println!(
        "\nApproval: {}",
        if report.approval.approved {
            "auto-approved"
        } else {
            "human approval required"
        }
    );
    for reason in &report.approval.reasons {
        println!("  - {reason}");
    }
    if report.repaired {
        println!("\nIncident was repaired after an injected analysis failure.");
    }

    println!("\nHistory:");
    for record in &report.history {
        println!(
            "  {} {:<24} -> {:<24} {:<14} {:?}: {}",
            record.timestamp.format("%H:%M:%S"),
            record.details.prior_state.as_str(),
            record.resulting_state.as_str(),
            record.actor,
            record.kind,
            record.details.description
        );
    }

    println!("\nError statistics:");
    println!("{}", serde_json::to_string_pretty(&report.statistics)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&IrflowConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();

        handle_config(ConfigAction::Init, workspace).unwrap();

        let config_path = workspace.join(".irflow").join("config.toml");
        assert!(config_path.exists());
        let content = std::fs::read_to_string(&config_path).unwrap();
        let parsed: IrflowConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed, IrflowConfig::default());

        // A second init leaves the file alone.
        std::fs::write(&config_path, "[recovery]\nretry_limit = 9\n").unwrap();
        handle_config(ConfigAction::Init, workspace).unwrap();
        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("retry_limit = 9"));
    }

    #[test]
    fn test_transitions_rejects_unknown_state() {
        assert!(handle_transitions(Some("analysis-complete")).is_ok());
        assert!(handle_transitions(Some("nonsense")).is_err());
    }

    #[test]
    fn test_parse_actions_shapes() {
        let bare = json!([{"action_type": "get_instance"}]);
        let wrapped = json!({"actions": [{"type": "list_users"}, {}]});
        assert_eq!(parse_actions(&bare).unwrap().len(), 1);
        let actions = parse_actions(&wrapped).unwrap();
        assert_eq!(actions[0].action_type.as_deref(), Some("list_users"));
        assert_eq!(actions[1].action_type, None);
        assert!(parse_actions(&json!({"action": []})).is_err());
    }

    #[test]
    fn test_evaluate_request() {
        let engine = AutoApprovalEngine::default();
        let incident = json!({"id": "inc-1", "severity": "medium", "confidence": 0.8});
        let outcome =
            evaluate_request(&engine, &incident, &json!([{"action_type": "get_instance"}]))
                .unwrap();
        assert!(outcome.approved);

        let outcome = evaluate_request(
            &engine,
            &incident,
            &json!([{"action_type": "get_instance"}, {"action_type": "terminate_instance"}]),
        )
        .unwrap();
        assert!(!outcome.approved);
    }

    #[test]
    fn test_approve_reads_files() {
        let dir = TempDir::new().unwrap();
        let incident = dir.path().join("incident.json");
        let actions = dir.path().join("actions.json");
        std::fs::write(&incident, r#"{"id": "inc-1", "confidence": 0.9}"#).unwrap();
        std::fs::write(&actions, r#"[{"action_type": "list_buckets"}]"#).unwrap();
        assert!(handle_approve(dir.path(), &incident, &actions).is_ok());

        std::fs::write(&actions, "not json").unwrap();
        assert!(handle_approve(dir.path(), &incident, &actions).is_err());
    }

    #[tokio::test]
    async fn test_simulation_reaches_closed() {
        let report = run_simulation(&IrflowConfig::default(), false)
            .await
            .unwrap();
        assert_eq!(report.final_state, IncidentState::Closed);
        assert!(report.approval.approved, "{:?}", report.approval.reasons);
        assert!(!report.repaired);
        assert_eq!(report.history.len(), 9);
        assert_eq!(report.statistics.total_errors, 0);
    }

    #[tokio::test]
    async fn test_simulation_with_failure_repairs_incident() {
        let report = run_simulation(&IrflowConfig::default(), true)
            .await
            .unwrap();
        assert_eq!(report.final_state, IncidentState::Closed);
        assert!(report.repaired);
        assert!(
            report
                .history
                .iter()
                .any(|r| r.kind == irflow_core::TransitionKind::AdministrativeOverride)
        );
        assert_eq!(report.statistics.total_errors, 1);
    }

    #[tokio::test]
    async fn test_simulation_without_auto_remediation_uses_analyst() {
        let mut config = IrflowConfig::default();
        config.approval.auto_remediation_enabled = false;
        let report = run_simulation(&config, false).await.unwrap();
        assert!(!report.approval.approved);
        assert!(report.history.iter().any(|r| r.actor == "analyst"
            && r.resulting_state == IncidentState::RemediationApproved));
    }
}
