use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::ApplierConfig;
use crate::id::ChannelId;
use crate::log_reader::MemoryLog;
use crate::logging::init_tracing;
use crate::recovery::RecoveryScanner;
use crate::service::ApplierService;
use crate::storage::MemoryStorage;
use anyhow::{bail, Context, Result};
use std::env;
use std::sync::Arc;

const USAGE: &str = "usage:\n  applier replay <config.json> <groups.jsonl> <checkpoint.json>\n  applier recover <groups.jsonl> <checkpoint.json>";

/// Command-line entrypoint: replays a JSON-lines group log into the in-memory
/// storage engine, or prints the recovery plan for a checkpoint file.
pub fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    init_tracing(None).context("installing tracing subscriber")?;
    match args.first().map(String::as_str) {
        Some("replay") => match &args[1..] {
            [config, groups, checkpoint] => replay(config, groups, checkpoint),
            _ => bail!("{USAGE}"),
        },
        Some("recover") => match &args[1..] {
            [groups, checkpoint] => recover(groups, checkpoint),
            _ => bail!("{USAGE}"),
        },
        _ => bail!("{USAGE}"),
    }
}

fn replay(config_path: &str, groups_path: &str, checkpoint_path: &str) -> Result<()> {
    let config = ApplierConfig::load(config_path)
        .with_context(|| format!("loading config {config_path}"))?;
    let log = MemoryLog::load(groups_path).with_context(|| format!("reading {groups_path}"))?;
    let store = FileCheckpointStore::open(checkpoint_path)
        .with_context(|| format!("opening checkpoint {checkpoint_path}"))?;
    let storage = MemoryStorage::new(ChannelId::new(config.channel.clone()));
    let service = ApplierService::new(config, Arc::new(storage.clone()), Arc::new(store));
    service.start(Box::new(log)).context("starting applier")?;
    let drained = service.drain();
    if let Some(status) = service.status() {
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    drained.context("replaying log")?;
    println!("committed {} group(s)", storage.commits().len());
    Ok(())
}

fn recover(groups_path: &str, checkpoint_path: &str) -> Result<()> {
    let mut log = MemoryLog::load(groups_path).with_context(|| format!("reading {groups_path}"))?;
    let store = FileCheckpointStore::open(checkpoint_path)
        .with_context(|| format!("opening checkpoint {checkpoint_path}"))?;
    let record = store.load()?;
    let plan = RecoveryScanner::scan(&mut log, &record)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
