//! Checkpoint inspection commands.

use color_eyre::Result;
use color_eyre::eyre::eyre;
use console::style;
use encore_storage::{CheckpointDiff, CheckpointFile, CheckpointStore};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Length of the key prefix shown in listings
const KEY_PREVIEW: usize = 16;

/// Load a checkpoint, failing if the file is missing
pub fn load(path: &Path) -> Result<CheckpointFile> {
    let store = CheckpointStore::new(path);
    let file = store
        .load()?
        .ok_or_else(|| eyre!("No checkpoint at {}", path.display()))?;
    debug!(path = %path.display(), entries = file.len(), "Checkpoint opened");
    Ok(file)
}

fn preview(key: &str) -> &str {
    key.get(..KEY_PREVIEW).unwrap_or(key)
}

fn write_json<T: Serialize>(out: &mut dyn Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

/// List the records of a checkpoint, optionally only those of one method
pub fn inspect(out: &mut dyn Write, file: &CheckpointFile, method: Option<&str>, json: bool) -> Result<()> {
    let records: Vec<_> = match method {
        Some(name) => file.find_by_method(name).collect(),
        None => file.records.iter().collect(),
    };

    if json {
        let listing: Vec<_> = records
            .iter()
            .map(|(key, record)| {
                serde_json::json!({
                    "key": key,
                    "method": record.method,
                    "result": record.result,
                })
            })
            .collect();
        return write_json(out, &listing);
    }

    let meta = &file.metadata;
    writeln!(
        out,
        "{} {} (version {}, saved {})",
        style("simulation").bold(),
        meta.simulation_id,
        meta.version,
        meta.saved_at.to_rfc3339()
    )?;
    if let Some(run) = meta.run_id {
        writeln!(out, "{} {}", style("run").bold(), run)?;
    }
    writeln!(out, "{} of {} records", records.len(), file.len())?;

    for (key, record) in records {
        writeln!(
            out,
            "{}  {}  {}",
            style(preview(key.as_str())).dim(),
            style(&record.method).cyan(),
            record.result
        )?;
    }
    Ok(())
}

/// Summarize calls per method
pub fn stats(out: &mut dyn Write, file: &CheckpointFile, json: bool) -> Result<()> {
    let counts = file.method_counts();
    let fallback = file.records.keys().filter(|key| key.is_fallback()).count();

    if json {
        return write_json(
            out,
            &serde_json::json!({
                "simulation": file.metadata.simulation_id,
                "records": file.len(),
                "fallback_keys": fallback,
                "uncached": file.uncached.len(),
                "methods": counts,
            }),
        );
    }

    writeln!(
        out,
        "{} records in simulation {}",
        file.len(),
        file.metadata.simulation_id
    )?;
    if fallback > 0 {
        writeln!(
            out,
            "{} {} keys derived from string renderings",
            style("warning:").yellow().bold(),
            fallback
        )?;
    }
    if !file.uncached.is_empty() {
        writeln!(out, "{} calls ran without a record", file.uncached.len())?;
    }
    let width = counts.keys().map(String::len).max().unwrap_or(0);
    for (method, count) in &counts {
        writeln!(out, "  {:<width$}  {}", method, count, width = width)?;
    }
    Ok(())
}

/// Report differences between two checkpoints. Returns whether they match.
pub fn diff(out: &mut dyn Write, left: &CheckpointFile, right: &CheckpointFile, json: bool) -> Result<bool> {
    let diff = CheckpointDiff::compare(left, right);

    if json {
        write_json(out, &diff)?;
        return Ok(diff.is_identical());
    }

    if diff.is_identical() {
        writeln!(out, "{}", style("checkpoints are identical").green())?;
        return Ok(true);
    }

    for (key, method) in &diff.only_left {
        writeln!(out, "{} {}  {}", style("-").red(), preview(key.as_str()), method)?;
    }
    for (key, method) in &diff.only_right {
        writeln!(out, "{} {}  {}", style("+").green(), preview(key.as_str()), method)?;
    }
    for change in &diff.changed {
        writeln!(
            out,
            "{} {}  {}",
            style("~").yellow(),
            preview(change.key.as_str()),
            change.left.method
        )?;
        writeln!(out, "    left:  {}", change.left.result)?;
        writeln!(out, "    right: {}", change.right.result)?;
    }
    writeln!(
        out,
        "{} only left, {} only right, {} changed",
        diff.only_left.len(),
        diff.only_right.len(),
        diff.changed.len()
    )?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::{CallKey, Hash, SimulationId};
    use encore_storage::CheckpointRecord;
    use serde_json::json;

    fn key(data: &str) -> CallKey {
        CallKey::canonical(Hash::compute(data.as_bytes()))
    }

    fn sample() -> CheckpointFile {
        let mut file = CheckpointFile::new(SimulationId::default());
        file.insert(key("a"), CheckpointRecord::new("Person::act", json!(1)));
        file.insert(key("b"), CheckpointRecord::new("Person::act", json!(2)));
        file.insert(key("c"), CheckpointRecord::new("Factory::generate", json!("x")));
        file
    }

    fn render<F: FnOnce(&mut dyn Write) -> Result<()>>(f: F) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_load_saved_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.json");
        CheckpointStore::new(&path).save(&sample()).unwrap();
        assert_eq!(load(&path).unwrap().len(), 3);
    }

    #[test]
    fn test_inspect_filters_by_method() {
        let output = render(|out| inspect(out, &sample(), Some("generate"), false));
        assert!(output.contains("1 of 3 records"));
        assert!(output.contains("Factory::generate"));
        assert!(!output.contains("Person::act"));
    }

    #[test]
    fn test_inspect_json() {
        let output = render(|out| inspect(out, &sample(), None, true));
        let listing: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(listing.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_stats_counts_methods() {
        let output = render(|out| stats(out, &sample(), true));
        let summary: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(summary["records"], 3);
        assert_eq!(summary["methods"]["Person::act"], 2);
        assert_eq!(summary["fallback_keys"], 0);
        assert_eq!(summary["uncached"], 0);

        let flaky = sample().with_uncached([(key("e"), "Person::act".to_string())]);
        let output = render(|out| stats(out, &flaky, false));
        assert!(output.contains("1 calls ran without a record"));
    }

    #[test]
    fn test_diff_reports_changes() {
        let left = sample();
        let mut right = sample();
        right.insert(key("a"), CheckpointRecord::new("Person::act", json!(10)));
        right.insert(key("d"), CheckpointRecord::new("Person::act", json!(4)));

        let mut buf = Vec::new();
        let identical = diff(&mut buf, &left, &right, false).unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert!(!identical);
        assert!(output.contains("0 only left, 1 only right, 1 changed"));

        let mut buf = Vec::new();
        assert!(diff(&mut buf, &left, &left, false).unwrap());
    }
}
