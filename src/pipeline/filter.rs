//! Post-processing of the intermediate dataset.
//!
//! Epistemic foundation:
//! - K_i: The intermediate file keeps every trace with its reason; filtering is a separate step
//! - K_i: The final dataset holds exactly the rows with `filtered == false`
//! - B_i: Rows on disk may have been edited → the filtered/reason invariant is checked, not assumed

use crate::models::{DistillError, FilteredReason, ReasoningTrace, Result};
use crate::verify::TraceValidator;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// Counts from one filter pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub total: usize,
    pub kept: usize,
    pub invalid_format: usize,
    pub incorrect_answer: usize,
}

/// Counts from one revalidation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevalidateStats {
    pub total: usize,
    pub valid: usize,
    pub invalid_format: usize,
    pub incorrect_answer: usize,
    /// Rows whose verdict differs from the stored one
    pub changed: usize,
}

/// The two fields the filter step reads; everything else is copied verbatim.
#[derive(Deserialize)]
struct VerdictView {
    filtered: bool,
    filtered_reason: FilteredReason,
}

fn read_lines(path: &Path) -> Result<Vec<(usize, String)>> {
    let file = File::open(path).map_err(|e| DistillError::io("opening dataset", e))?;
    let mut lines = Vec::new();

    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| DistillError::io("reading dataset", e))?;
        if !line.trim().is_empty() {
            lines.push((line_num + 1, line));
        }
    }
    Ok(lines)
}

fn create_writer(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| DistillError::io("creating output file", e))
}

/// Copy the rows with `filtered == false` from `input` to `output`.
///
/// A row whose `filtered` flag disagrees with its `filtered_reason` aborts
/// the pass with a parse error naming the line.
pub fn filter_dataset(input: &Path, output: &Path) -> Result<FilterStats> {
    let lines = read_lines(input)?;
    let mut writer = create_writer(output)?;
    let mut stats = FilterStats::default();

    for (line_num, line) in &lines {
        let view: VerdictView = serde_json::from_str(line)
            .map_err(|e| DistillError::ParseError(format!("Line {line_num}: {e}")))?;

        if view.filtered != view.filtered_reason.is_filtered() {
            return Err(DistillError::ParseError(format!(
                "Line {line_num}: filtered={} contradicts filtered_reason={}",
                view.filtered, view.filtered_reason
            )));
        }

        stats.total += 1;
        match view.filtered_reason {
            FilteredReason::Valid => {
                stats.kept += 1;
                writeln!(writer, "{line}").map_err(|e| DistillError::io("writing output", e))?;
            }
            FilteredReason::InvalidFormat => stats.invalid_format += 1,
            FilteredReason::IncorrectAnswer => stats.incorrect_answer += 1,
        }
    }

    writer
        .flush()
        .map_err(|e| DistillError::io("flushing output", e))?;

    info!(
        total = stats.total,
        kept = stats.kept,
        invalid_format = stats.invalid_format,
        incorrect_answer = stats.incorrect_answer,
        "Filtered dataset"
    );
    Ok(stats)
}

/// Recompute every verdict in `input` and write the rows to `output`.
pub fn revalidate_dataset(
    input: &Path,
    output: &Path,
    validator: &TraceValidator,
) -> Result<RevalidateStats> {
    let lines = read_lines(input)?;
    let mut traces = Vec::with_capacity(lines.len());
    for (line_num, line) in &lines {
        let trace: ReasoningTrace = serde_json::from_str(line)
            .map_err(|e| DistillError::ParseError(format!("Line {line_num}: {e}")))?;
        traces.push(trace);
    }

    let mut writer = create_writer(output)?;
    let mut stats = RevalidateStats::default();

    for mut trace in traces {
        let before = trace.filtered_reason;
        validator.revalidate(&mut trace);

        stats.total += 1;
        match trace.filtered_reason {
            FilteredReason::Valid => stats.valid += 1,
            FilteredReason::InvalidFormat => stats.invalid_format += 1,
            FilteredReason::IncorrectAnswer => stats.incorrect_answer += 1,
        }
        if trace.filtered_reason != before {
            stats.changed += 1;
            debug!(
                record_index = trace.record_index,
                sample_index = trace.sample_index,
                from = %before,
                to = %trace.filtered_reason,
                "Verdict changed"
            );
        }

        let json = serde_json::to_string(&trace)
            .map_err(|e| DistillError::Internal(format!("Failed to serialize trace: {e}")))?;
        writeln!(writer, "{json}").map_err(|e| DistillError::io("writing output", e))?;
    }

    writer
        .flush()
        .map_err(|e| DistillError::io("flushing output", e))?;

    info!(
        total = stats.total,
        valid = stats.valid,
        changed = stats.changed,
        "Revalidated dataset"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Generation, ProblemRecord, StreamStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    fn row(text: &str, gold: &str) -> String {
        let generation = Generation {
            record_index: 0,
            sample_index: 0,
            record: ProblemRecord::new("p", gold),
            text: text.to_string(),
            status: StreamStatus::Complete,
            stream_error: None,
            model: "m".to_string(),
            generated_at: Utc::now(),
            generation_time_ms: 0,
        };
        serde_json::to_string(&TraceValidator::default().judge(generation)).unwrap()
    }

    #[test]
    fn test_filter_keeps_only_valid_rows_verbatim() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("all.jsonl");
        let output = dir.path().join("final.jsonl");

        let valid = row("<think>a</think>\\boxed{4}", "4");
        let lines = [
            valid.clone(),
            row("\\boxed{4}", "4"),
            String::new(),
            row("<think>a</think>\\boxed{5}", "4"),
        ];
        std::fs::write(&input, lines.join("\n")).unwrap();

        let stats = filter_dataset(&input, &output).unwrap();
        assert_eq!(
            stats,
            FilterStats {
                total: 3,
                kept: 1,
                invalid_format: 1,
                incorrect_answer: 1,
            }
        );
        assert_eq!(std::fs::read_to_string(&output).unwrap(), format!("{valid}\n"));
    }

    #[test]
    fn test_filter_rejects_inconsistent_row() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("all.jsonl");
        let tampered = row("<think>a</think>\\boxed{5}", "4").replace("\"filtered\":true", "\"filtered\":false");
        std::fs::write(&input, format!("{}\n{tampered}\n", row("<think>a</think>\\boxed{4}", "4"))).unwrap();

        let err = filter_dataset(&input, &dir.path().join("out.jsonl")).unwrap_err();
        match err {
            DistillError::ParseError(msg) => assert!(msg.starts_with("Line 2")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_revalidate_repairs_stale_verdicts() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("all.jsonl");
        let output = dir.path().join("again.jsonl");

        let stale = row("<think>a</think>\\boxed{5}", "4").replace("\"answer\":\"4\"", "\"answer\":\"5\"");
        std::fs::write(&input, format!("{stale}\n{}\n", row("oops", "4"))).unwrap();

        let stats = revalidate_dataset(&input, &output, &TraceValidator::default()).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.invalid_format, 1);
        assert_eq!(stats.changed, 1);

        let rows: Vec<ReasoningTrace> = std::fs::read_to_string(&output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(!rows[0].filtered);
        assert!(rows.iter().all(ReasoningTrace::is_consistent));
    }
}
