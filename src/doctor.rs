use std::path::Path;

use anyhow::{Context, Result};

use crate::agents::AgentRegistry;
use crate::capabilities::CapabilityRegistry;
use crate::config::{RuntimeConfig, build_agent_overrides, connector_problems, display_store_url};
use crate::store::{SCHEMA_VERSION, Store};

fn report(label: &str, problems: &[String]) -> bool {
    if problems.is_empty() {
        println!("- {label}: ok");
        return true;
    }
    println!("- {label}: {} problem(s)", problems.len());
    for problem in problems {
        println!("    {problem}");
    }
    false
}

fn writable_parent_problems(label: &str, path: &str) -> Vec<String> {
    let parent = Path::new(path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    if parent.exists() {
        match std::fs::metadata(parent) {
            Ok(meta) if meta.permissions().readonly() => {
                vec![format!("{label} directory '{}' is read-only", parent.display())]
            }
            Ok(_) => Vec::new(),
            Err(err) => vec![format!("{label} directory '{}': {err}", parent.display())],
        }
    } else {
        // Created on first write.
        Vec::new()
    }
}

async fn store_problems(cfg: &RuntimeConfig) -> Vec<String> {
    let store = match Store::connect(&cfg.store_url).await {
        Ok(store) => store,
        Err(err) => return vec![format!("cannot open store: {err}")],
    };
    match store.schema_version().await {
        Ok(version) if version == SCHEMA_VERSION => Vec::new(),
        Ok(version) if version < SCHEMA_VERSION => vec![format!(
            "schema version {version} is behind {SCHEMA_VERSION}; run `changegate migrate`"
        )],
        Ok(version) => vec![format!(
            "schema version {version} is newer than this binary supports ({SCHEMA_VERSION})"
        )],
        Err(err) => vec![format!("cannot read schema version: {err}")],
    }
}

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );
    println!("Store: {}", display_store_url(cfg));

    let capabilities = CapabilityRegistry::builtin();
    let agents = AgentRegistry::new(&capabilities, &build_agent_overrides(cfg));
    let mut registry = capabilities.consistency_problems();
    registry.extend(agents.consistency_problems(&capabilities));

    let mut notify = Vec::new();
    if cfg.notify_enabled {
        notify = writable_parent_problems("notification", &cfg.notify_path);
    }
    if let Some(path) = cfg.itsm_journal_path.as_deref() {
        notify.extend(writable_parent_problems("ITSM journal", path));
    }

    println!("Checks:");
    let results = [
        report("store and migrations", &store_problems(cfg).await),
        report("capability and agent registries", &registry),
        report(
            &format!("connector ({})", cfg.connector.as_str()),
            &connector_problems(cfg),
        ),
        report("notification and journal paths", &notify),
    ];

    let failed = results.iter().filter(|ok| !**ok).count();
    if failed > 0 {
        return Err(anyhow::anyhow!("doctor found {failed} failing check(s)"));
    }
    println!("All checks passed.");
    Ok(())
}

pub async fn run_migrate(cfg: &RuntimeConfig) -> Result<()> {
    let store = Store::connect(&cfg.store_url)
        .await
        .with_context(|| format!("failed to open store at {}", cfg.store_url))?;
    let before = store.schema_version().await?;
    let after = store.migrate().await.context("store migration failed")?;
    if before == after {
        println!("Store already at schema version {after}: {}", display_store_url(cfg));
    } else {
        println!(
            "SQLite migrations applied ({before} -> {after}): {}",
            display_store_url(cfg)
        );
    }
    Ok(())
}
