use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig, display_store_url};

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "<none>".to_string()
    } else {
        items.join(", ")
    }
}

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Store URL: {}", display_store_url(cfg));
    println!("Approval timeout (secs): {}", cfg.approval_timeout_secs);
    println!("Execution timeout (secs): {}", cfg.execution_timeout_secs);
    println!("Auto-rollback threshold: {}", cfg.auto_rollback_threshold);
    println!("Fan-out limit: {}", cfg.fan_out_limit);
    println!(
        "Quality floors: plan_only={} prod={}",
        cfg.plan_only_min_quality, cfg.prod_min_quality
    );
    println!("Approvers: {}", list_or_none(&cfg.approvers));
    println!(
        "Revalidate after pause: {}",
        cfg.revalidate_after_pause_secs
            .map(|secs| format!("{secs}s"))
            .unwrap_or_else(|| "disabled".to_string())
    );
    println!(
        "Intent guardrail: mode={} terms={} max_chars={}",
        cfg.intent_guardrail_mode.as_str(),
        cfg.guardrail_terms.len(),
        cfg.max_intent_chars
    );
    println!("Notifications: enabled={} path={}", cfg.notify_enabled, cfg.notify_path);
    println!("Connector: {}", cfg.connector.as_str());
    println!(
        "Apply command: {}",
        cfg.apply_command.as_deref().unwrap_or("<not configured>")
    );
    println!(
        "Health command: {}",
        cfg.health_command.as_deref().unwrap_or("<not configured>")
    );
    println!(
        "Command timeout={}s retry_attempts={} retry_delay_ms={}",
        cfg.command_timeout_secs, cfg.command_retry_attempts, cfg.command_retry_delay_ms
    );
    if !cfg.simulated_faults.is_empty() {
        println!("Simulated faults: {}", cfg.simulated_faults.len());
    }
    println!(
        "ITSM journal: {}",
        cfg.itsm_journal_path.as_deref().unwrap_or("<disabled>")
    );
    println!("Sweep interval (secs): {}", cfg.sweep_interval_secs);
    println!(
        "Policy rules: {}",
        list_or_none(
            &cfg.policy_rules
                .iter()
                .map(|rule| rule.name.clone())
                .collect::<Vec<String>>()
        )
    );
    println!(
        "Facts: {}",
        list_or_none(&cfg.facts.keys().cloned().collect::<Vec<String>>())
    );
    for (agent, mode) in &cfg.agent_autonomy {
        println!("Autonomy override: {agent} -> {}", mode.as_str());
    }
    for (agent, patterns) in &cfg.agent_tool_deny {
        println!("Tool deny override: {agent} -> {}", patterns.join(", "));
    }
    Ok(())
}
