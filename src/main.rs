use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::level_filters::LevelFilter;

use changegate::agents::{Agent, AgentRegistry};
use changegate::approval::Verdict;
use changegate::capabilities::CapabilityRegistry;
use changegate::cli::{
    Cli, Commands, ExecutionCommands, NotificationCommands, ProfileCommands, RegistryCommands,
    TaskCommands, command_label, parse_context_args,
};
use changegate::config::{
    RuntimeConfig, build_agent_overrides, build_orchestrator, load_profiles, resolve_runtime_config,
};
use changegate::doctor::{run_doctor, run_migrate};
use changegate::error::{categorize_error, format_cli_error, render_error_message};
use changegate::executor::Advance;
use changegate::ledger::render_trace;
use changegate::model::{Plan, TaskStatus};
use changegate::notify::run_notifications_report;
use changegate::orchestrator::{
    DecisionOutcome, ExecutionView, Orchestrator, SubmitRequest, Submission, SweepReport, TaskView,
};
use changegate::profiles::{run_profiles_list, run_profiles_show};
use changegate::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive_config = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive_config));
        tracing::error!(
            category = categorize_error(&err).code(),
            error = %render_error_message(&err, show_sensitive_config),
            "command failed"
        );
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let principal = cli.principal.trim().to_string();
    tracing::debug!(
        command = %command_label(&cli.command),
        profile = %cfg.profile,
        principal = %principal,
        "running command"
    );

    match cli.command {
        Commands::Submit {
            intent,
            context,
            resources,
            idempotency_key,
            json,
        } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            let submission = orchestrator
                .submit(SubmitRequest {
                    intent: intent.join(" "),
                    context: parse_context_args(&context, &resources)?,
                    submitter: principal,
                    idempotency_key,
                })
                .await?;
            if json {
                print_json(&submission)?;
            } else {
                print_submission(&submission);
            }
        }
        Commands::Tasks { command } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            run_tasks_command(&orchestrator, command).await?;
        }
        Commands::Approve { task_id, notes } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            let outcome = orchestrator.approve(&task_id, &principal, notes).await?;
            print_decision(&outcome);
        }
        Commands::Reject { task_id, notes } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            let outcome = orchestrator.reject(&task_id, &principal, notes).await?;
            print_decision(&outcome);
        }
        Commands::Modify { task_id, notes } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            let outcome = orchestrator
                .request_modification(&task_id, &principal, notes)
                .await?;
            print_decision(&outcome);
        }
        Commands::Revise {
            task_id,
            context,
            resources,
        } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            let patch = parse_context_args(&context, &resources)?;
            let submission = orchestrator.revise(&task_id, &principal, patch).await?;
            print_submission(&submission);
        }
        Commands::Executions { command } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            run_executions_command(&orchestrator, &principal, command).await?;
        }
        Commands::Sweep => {
            let orchestrator = build_orchestrator(&cfg).await?;
            let report = orchestrator.sweep().await?;
            print_sweep(&report);
        }
        Commands::Serve { host, port } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            run_server(orchestrator, cfg.profile.clone(), host, port, cfg.sweep_interval_secs).await?;
        }
        Commands::Doctor => run_doctor(&cfg).await?,
        Commands::Migrate => run_migrate(&cfg).await?,
        Commands::Registry { command } => run_registry_command(&cfg, command),
        Commands::Notifications { command } => match command {
            NotificationCommands::Report { path, limit } => {
                run_notifications_report(&cfg, path, limit)?;
            }
        },
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg)?,
            ProfileCommands::Show => run_profiles_show(&cfg)?,
        },
    }

    Ok(())
}

async fn run_tasks_command(orchestrator: &Orchestrator, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::List { status, limit } => {
            let status = status
                .as_deref()
                .map(|raw| {
                    TaskStatus::parse(raw.trim()).ok_or_else(|| {
                        anyhow::anyhow!(
                            "invalid value '{raw}' for --status. Use draft, pending_approval, approved, rejected, expired, executing, completed, failed_with_rollback, cancelled or halted."
                        )
                    })
                })
                .transpose()?;
            let tasks = orchestrator.list_tasks(status, limit).await?;
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }
            for task in tasks {
                println!(
                    "{}  {:<20} {:<8} {:<22} {}",
                    task.id,
                    task.status.as_str(),
                    task.agent.as_deref().unwrap_or("-"),
                    task.risk_class.map(|risk| risk.as_str()).unwrap_or("-"),
                    task.intent
                );
            }
        }
        TaskCommands::Show { task_id, json } => {
            let view = orchestrator.task_view(&task_id).await?;
            if json {
                print_json(&view)?;
            } else {
                print_task_view(&view);
            }
        }
        TaskCommands::Trace { task_id, json } => {
            let events = orchestrator.trace(&task_id).await?;
            if json {
                print_json(&events)?;
            } else {
                print!("{}", render_trace(&events));
            }
        }
    }
    Ok(())
}

async fn run_executions_command(orchestrator: &Orchestrator, principal: &str, command: ExecutionCommands) -> Result<()> {
    let view = match command {
        ExecutionCommands::Show { execution_id, json } => {
            let view = orchestrator.execution_view(&execution_id).await?;
            if json {
                return print_json(&view);
            }
            view
        }
        ExecutionCommands::Advance { execution_id } => orchestrator.advance(&execution_id).await?,
        ExecutionCommands::Pause { execution_id } => {
            orchestrator.pause(&execution_id, principal).await?
        }
        ExecutionCommands::Resume { execution_id } => {
            orchestrator.resume(&execution_id, principal).await?
        }
        ExecutionCommands::Cancel { execution_id } => {
            orchestrator.cancel(&execution_id, principal).await?
        }
        ExecutionCommands::ApprovePhase {
            execution_id,
            notes,
        } => {
            orchestrator
                .approve_phase(&execution_id, principal, notes)
                .await?
        }
    };
    print_execution_view(&view);
    Ok(())
}

fn run_registry_command(cfg: &RuntimeConfig, command: RegistryCommands) {
    let capabilities = CapabilityRegistry::builtin();
    match command {
        RegistryCommands::Tools => {
            for capability in capabilities.iter() {
                println!(
                    "{:<34} {:<22} rollback={:<30} {}",
                    capability.name,
                    capability.risk_class.as_str(),
                    capability.rollback.unwrap_or("-"),
                    capability.description
                );
            }
        }
        RegistryCommands::Agents => {
            let agents = AgentRegistry::new(&capabilities, &build_agent_overrides(cfg));
            for agent in agents.iter() {
                let description = agent.describe();
                println!(
                    "{} v{} (autonomy={}): {}",
                    description.name,
                    description.version,
                    description.autonomy.as_str(),
                    description.description
                );
                println!("  triggers: {}", description.triggers.join(", "));
                println!("  tools: {}", description.tools.join(", "));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON output")?;
    println!("{rendered}");
    Ok(())
}

fn describe_advance(advance: &Advance) -> String {
    match advance {
        Advance::Finished { status, reason } => format!("finished as {status}: {reason}"),
        Advance::Waiting { phase, until } => {
            format!("waiting to start phase {phase} at {}", until.to_rfc3339())
        }
        Advance::Paused { phase } => format!("paused before phase {phase}"),
        Advance::AwaitingPromotion { phase } => {
            format!("awaiting promotion approval into phase {phase}")
        }
    }
}

fn describe_verdict(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Approved => "approved".to_string(),
        Verdict::Rejected { by, .. } => format!("rejected by {by}"),
        Verdict::ModificationRequested { by, .. } => format!("modification requested by {by}"),
        Verdict::Pending {
            approvals,
            required,
        } => format!("pending ({approvals}/{required} approvals)"),
    }
}

fn print_plan(plan: &Plan) {
    println!(
        "Plan {} by {} (risk={} score={} quality={} autonomy={})",
        plan.id,
        plan.agent,
        plan.risk_class.as_str(),
        plan.risk_score,
        plan.quality.total(),
        plan.autonomy.as_str()
    );
    println!("  {}", plan.rationale);
    for (index, phase) in plan.phases.iter().enumerate() {
        println!(
            "  [{index}] {:<24} {:<28} targets={:<4} wait={}s",
            phase.name,
            phase.operation,
            phase.targets.len(),
            phase.wait_secs
        );
    }
}

fn print_submission(submission: &Submission) {
    let task = &submission.task;
    if submission.replayed {
        println!("Idempotency key matched an existing task.");
    }
    println!("Task {} is {}", task.id, task.status.as_str());
    if let Some(reason) = &task.status_reason {
        println!("  reason: {reason}");
    }
    if let Some(plan) = &submission.plan {
        print_plan(plan);
    }
    for violation in &submission.violations {
        println!("  violation [{}] {}", violation.source.as_str(), violation.message);
    }
    if let Some(execution) = &submission.execution {
        println!("Execution {} is {}", execution.id, execution.status.as_str());
    }
    if let Some(advance) = &submission.advance {
        println!("  {}", describe_advance(advance));
    }
}

fn print_decision(outcome: &DecisionOutcome) {
    if !outcome.recorded {
        println!("Decision was already recorded; nothing changed.");
    }
    println!(
        "Task {} is {} ({})",
        outcome.task.id,
        outcome.task.status.as_str(),
        describe_verdict(&outcome.verdict)
    );
    if let Some(execution) = &outcome.execution {
        println!("Execution {} is {}", execution.id, execution.status.as_str());
    }
    if let Some(advance) = &outcome.advance {
        println!("  {}", describe_advance(advance));
    }
}

fn print_task_view(view: &TaskView) {
    let task = &view.task;
    println!("Task {}", task.id);
    println!("  intent: {}", task.intent);
    println!("  status: {}", task.status.as_str());
    println!("  submitter: {}", task.submitter);
    println!("  revision: {}", task.revision);
    if let Some(reason) = &task.status_reason {
        println!("  reason: {reason}");
    }
    if let Some(deadline) = task.approval_deadline {
        println!("  approval deadline: {}", deadline.to_rfc3339());
    }
    if let Some(plan) = &view.plan {
        print_plan(plan);
    }
    if let Some(verdict) = &view.verdict {
        println!("Verdict: {}", describe_verdict(verdict));
    }
    for record in &view.approvals {
        println!(
            "  #{} {} {} ({}){}",
            record.sequence,
            record.approver_id,
            record.decision.as_str(),
            record.scope.key(),
            record
                .notes
                .as_deref()
                .map(|notes| format!(": {notes}"))
                .unwrap_or_default()
        );
    }
    for execution in &view.executions {
        println!(
            "Execution {} is {} (phase {}/{})",
            execution.id,
            execution.status.as_str(),
            execution.current_phase,
            execution.phase_count
        );
    }
    println!("Trace: {}", view.trace);
}

fn print_execution_view(view: &ExecutionView) {
    let execution = &view.execution;
    println!(
        "Execution {} for task {} is {} (phase {}/{})",
        execution.id,
        execution.task_id,
        execution.status.as_str(),
        execution.current_phase,
        execution.phase_count
    );
    if let Some(hold) = execution.hold {
        println!("  hold: {}", hold.as_str());
    }
    if let Some(reason) = &execution.status_reason {
        println!("  reason: {reason}");
    }
    println!("  deadline: {}", execution.deadline.to_rfc3339());
    for phase in &view.phases {
        let counts = phase
            .counts
            .iter()
            .map(|(state, count)| format!("{state}={count}"))
            .collect::<Vec<String>>()
            .join(" ");
        println!(
            "  [{}] {:<24} {:<20} {}",
            phase.phase.index,
            phase.phase.spec.name,
            phase.phase.status.as_str(),
            counts
        );
    }
    if let Some(advance) = &view.advance {
        println!("  {}", describe_advance(advance));
    }
}

fn print_sweep(report: &SweepReport) {
    println!(
        "Sweep: expired={} advanced={} skipped_busy={} errors={}",
        report.expired.len(),
        report.advanced.len(),
        report.skipped_busy,
        report.errors.len()
    );
    for task_id in &report.expired {
        println!("  expired {task_id}");
    }
    for swept in &report.advanced {
        println!(
            "  {} ({}): {}",
            swept.execution_id,
            swept.task_id,
            describe_advance(&swept.advance)
        );
    }
    for error in &report.errors {
        println!("  error: {error}");
    }
}
