use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::{error, info};

use crate::sync::engine::SyncEngine;

const TEST_FOLDER: &str = "script_includes";
const TEST_FILE: &str = "JSUtil.js";

#[derive(Debug, Default)]
pub struct SelfTestReport {
    results: Vec<(&'static str, bool)>,
}

impl SelfTestReport {
    fn check(&mut self, name: &'static str, passed: bool) {
        if passed {
            info!(check = name, "PASS");
        } else {
            error!(check = name, "FAIL");
        }
        self.results.push((name, passed));
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|(_, passed)| !passed).count()
    }

    pub fn log(&self) {
        info!(
            passed = self.total() - self.failed(),
            failed = self.failed(),
            "self-test finished"
        );
    }
}

pub fn test_file_path(root: &Path) -> PathBuf {
    root.join(TEST_FOLDER).join(TEST_FILE)
}

/// Runs the live checks against the first root. The record's original content is
/// restored afterwards.
pub async fn run(engine: &SyncEngine) -> anyhow::Result<SelfTestReport> {
    let root = engine
        .config()
        .roots
        .first()
        .context("no root configured")?
        .path
        .clone();
    let file = test_file_path(&root);
    let record = engine
        .track_file(&file)?
        .context("JSUtil.js is not mapped; is the script_includes folder configured?")?;
    let coordinate = record.coordinate().clone();
    let client = engine
        .client_for(&root)
        .context("no client for the first root")?;
    let mut report = SelfTestReport::default();

    record.clear_sync_state().await?;
    report.check("download", engine.add_file(&file).await?);
    let original = engine.read_file(&file).await?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();

    let edited = with_marker(&original, &format!("local edit {stamp}"));
    engine.write_file(&file, &edited).await?;
    let uploaded = engine.send_file(&file).await?;
    engine.add_file(&file).await?;
    let round_trip = engine.read_file(&file).await? == edited;
    let stored_remotely = match record.sys_id().await {
        Some(sys_id) => client
            .get_record(&coordinate.table, &sys_id)
            .await?
            .first()
            .and_then(|remote| remote.field(&coordinate.field))
            .is_some_and(|content| content.as_bytes() == edited.as_slice()),
        None => false,
    };
    report.check("upload", uploaded && round_trip && stored_remotely);

    let remote_edit = with_marker(&original, &format!("remote edit {stamp}"));
    client
        .update_field(
            &coordinate.table,
            &coordinate.query(),
            &coordinate.field,
            &String::from_utf8_lossy(&remote_edit),
        )
        .await?;
    engine
        .write_file(&file, &with_marker(&original, &format!("conflicting edit {stamp}")))
        .await?;
    report.check("conflict rejected", !engine.send_file(&file).await?);

    engine.add_file(&file).await?;
    let protected = with_marker(&original, &format!("unsaved edit {stamp}"));
    engine.write_file(&file, &protected).await?;
    record.mark_newly_discovered(true);
    let redirected = engine.add_file(&file).await?;
    let kept = engine.read_file(&file).await? == protected;
    report.check("local data kept", redirected && kept);

    engine.write_file(&file, &original).await?;
    report.check("restore", engine.send_file(&file).await?);
    Ok(report)
}

fn with_marker(content: &[u8], marker: &str) -> Vec<u8> {
    let mut out = content.to_vec();
    out.extend_from_slice(format!("\n// sync test: {marker}\n").as_bytes());
    out
}
