//! Read-only commands: `scene`, `records` and `config`.

use anyhow::Result;

use chaos_engine::config::EngineConfig;
use chaos_engine::scene::SceneCode;

use super::require_repositories;

pub fn cmd_scene(code: &str) -> Result<()> {
    let scene = SceneCode::parse(code)?;
    println!("original: {}", scene.original());
    println!("target:   {}", scene.target());
    println!("action:   {}", scene.action());
    println!("recover:  {}", scene.is_recover());
    if scene.is_recover() {
        println!("attacks:  {}", scene.without_recover());
    }
    Ok(())
}

pub async fn cmd_records(config: &EngineConfig, experiment_task_id: i64) -> Result<()> {
    let repositories = require_repositories(config)?;
    let records = repositories
        .records
        .select_by_experiment_task_id(experiment_task_id)
        .await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

pub fn cmd_config(config: &EngineConfig) -> Result<()> {
    let mut shown = config.clone();
    if shown.kubernetes.token.is_some() {
        shown.kubernetes.token = Some("<redacted>".to_string());
    }
    print!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}
