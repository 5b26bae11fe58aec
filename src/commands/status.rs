use cadence_runtime::AppConfig;
use std::path::Path;

pub fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::from_file(config_path)?;
    let resolved = config.resolve_heartbeats();

    println!("📊 Heartbeat schedule for {}\n", config_path.display());
    println!("Default agent: {}\n", config.default_agent_id());

    println!("🤖 Agents:");
    for agent_id in config.agent_ids() {
        match resolved.iter().find(|r| r.agent_id == agent_id) {
            Some(entry) => println!("  • {:<16} every {:?}", agent_id, entry.interval),
            None => println!("  • {:<16} wake-only", agent_id),
        }
    }

    if resolved.is_empty() {
        println!("\n⚠️  No agent has a valid periodic heartbeat");
    }
    Ok(())
}
