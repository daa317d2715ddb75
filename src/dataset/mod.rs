//! Dataset source adapter.
//!
//! Epistemic foundation:
//! - K_i: A corpus is a directory; a split is one file inside it
//! - B_i: The corpus/split exists → `DataUnavailable` otherwise (fatal)
//! - B_i: Each row carries a problem text → `ParseError` otherwise (fatal)
//! - I^R: Source field names are configurable
//!
//! A missing answer is not an error here; the validator rejects such rows.

use crate::models::{DatasetConfig, DistillError, ProblemRecord, Result, RESERVED_FIELDS};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Anything that can hand over an ordered list of problem records.
pub trait DatasetSource {
    /// Load every record of `split` in `corpus`, in source order.
    fn load(&self, corpus: &str, split: &str) -> Result<Vec<ProblemRecord>>;
}

/// JSONL / JSON corpus laid out as `<root>/<corpus>/<split>.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlCorpus {
    root: PathBuf,
    problem_field: String,
    answer_field: String,
    limit: Option<usize>,
}

impl JsonlCorpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            problem_field: "problem".to_string(),
            answer_field: "answer".to_string(),
            limit: None,
        }
    }

    /// Build from the `[dataset]` config section.
    pub fn from_config(config: &DatasetConfig) -> Self {
        Self {
            root: config.root.clone(),
            problem_field: config.problem_field.clone(),
            answer_field: config.answer_field.clone(),
            limit: None,
        }
    }

    /// Read problem text from `field` instead of `problem`.
    pub fn with_problem_field(mut self, field: impl Into<String>) -> Self {
        self.problem_field = field.into();
        self
    }

    /// Read the ground truth from `field` instead of `answer`.
    pub fn with_answer_field(mut self, field: impl Into<String>) -> Self {
        self.answer_field = field.into();
        self
    }

    /// Keep only the first `limit` records.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Find the file backing a split.
    fn resolve(&self, corpus: &str, split: &str) -> Result<PathBuf> {
        let dir = self.root.join(corpus);
        if !dir.is_dir() {
            return Err(DistillError::DataUnavailable {
                corpus: corpus.to_string(),
                split: split.to_string(),
                reason: format!("no corpus directory at {}", dir.display()),
            });
        }

        ["jsonl", "json"]
            .iter()
            .map(|ext| dir.join(format!("{split}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| DistillError::DataUnavailable {
                corpus: corpus.to_string(),
                split: split.to_string(),
                reason: format!("no {split}.jsonl or {split}.json in {}", dir.display()),
            })
    }

    fn read_jsonl(&self, path: &Path) -> Result<Vec<ProblemRecord>> {
        let file = File::open(path).map_err(|e| DistillError::io("opening corpus file", e))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            if self.limit.is_some_and(|n| records.len() >= n) {
                break;
            }
            let line = line.map_err(|e| DistillError::io("reading corpus file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Value = serde_json::from_str(&line)
                .map_err(|e| DistillError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
            records.push(self.to_record(row, line_num + 1)?);
        }

        Ok(records)
    }

    fn read_json_array(&self, path: &Path) -> Result<Vec<ProblemRecord>> {
        let file = File::open(path).map_err(|e| DistillError::io("opening corpus file", e))?;
        let rows: Vec<Value> = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            DistillError::ParseError(format!("{}: expected a JSON array: {}", path.display(), e))
        })?;

        let take = self.limit.unwrap_or(rows.len());
        rows.into_iter()
            .take(take)
            .enumerate()
            .map(|(idx, row)| self.to_record(row, idx + 1))
            .collect()
    }

    /// Map one source row onto a [`ProblemRecord`].
    fn to_record(&self, row: Value, position: usize) -> Result<ProblemRecord> {
        let Value::Object(mut fields) = row else {
            return Err(DistillError::ParseError(format!(
                "Row {position}: expected a JSON object"
            )));
        };

        let problem = fields
            .remove(&self.problem_field)
            .and_then(value_to_text)
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                DistillError::ParseError(format!(
                    "Row {position}: missing or empty '{}' field",
                    self.problem_field
                ))
            })?;

        let answer = fields
            .remove(&self.answer_field)
            .and_then(value_to_text)
            .unwrap_or_default();
        if answer.is_empty() {
            debug!(row = position, "Record has no answer; it will fail validation");
        }

        Ok(ProblemRecord {
            problem,
            answer,
            extra: rename_reserved(fields),
        })
    }
}

impl DatasetSource for JsonlCorpus {
    fn load(&self, corpus: &str, split: &str) -> Result<Vec<ProblemRecord>> {
        let path = self.resolve(corpus, split)?;
        let records = if path.extension().is_some_and(|ext| ext == "json") {
            self.read_json_array(&path)?
        } else {
            self.read_jsonl(&path)?
        };

        info!(
            corpus,
            split,
            path = %path.display(),
            count = records.len(),
            "Loaded problem records"
        );
        Ok(records)
    }
}

/// Textual form of a scalar answer; `null` and containers yield nothing.
fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn rename_reserved(fields: Map<String, Value>) -> Map<String, Value> {
    fields
        .into_iter()
        .map(|(key, value)| {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                (format!("source_{key}"), value)
            } else {
                (key, value)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn corpus_with(split_file: &str, content: &str) -> TempDir {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("math");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(split_file), content).unwrap();
        root
    }

    #[test]
    fn test_load_jsonl_in_order() {
        let root = corpus_with(
            "train.jsonl",
            "{\"problem\": \"2+2=?\", \"answer\": \"4\"}\n\n{\"problem\": \"3*3=?\", \"answer\": 9, \"level\": 1}\n",
        );

        let records = JsonlCorpus::new(root.path()).load("math", "train").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].problem, "2+2=?");
        assert_eq!(records[0].answer, "4");
        assert_eq!(records[1].answer, "9");
        assert_eq!(records[1].extra["level"], 1);
    }

    #[test]
    fn test_missing_answer_is_kept() {
        let root = corpus_with("test.jsonl", "{\"problem\": \"unknown\"}\n");
        let records = JsonlCorpus::new(root.path()).load("math", "test").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].answer, "");
    }

    #[test]
    fn test_missing_split_is_data_unavailable() {
        let root = corpus_with("train.jsonl", "");
        let err = JsonlCorpus::new(root.path()).load("math", "validation").unwrap_err();
        assert!(matches!(err, DistillError::DataUnavailable { .. }));

        let err = JsonlCorpus::new(root.path()).load("physics", "train").unwrap_err();
        assert!(matches!(err, DistillError::DataUnavailable { .. }));
    }

    #[test]
    fn test_custom_fields_and_limit() {
        let root = corpus_with(
            "train.json",
            r#"[{"question": "a", "solution": "1"}, {"question": "b", "solution": "2"}, {"question": "c", "solution": "3"}]"#,
        );

        let records = JsonlCorpus::new(root.path())
            .with_problem_field("question")
            .with_answer_field("solution")
            .with_limit(Some(2))
            .load("math", "train")
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].problem, "b");
        assert_eq!(records[1].answer, "2");
    }

    #[test]
    fn test_empty_problem_is_parse_error() {
        let root = corpus_with("train.jsonl", "{\"problem\": \"  \", \"answer\": \"1\"}\n");
        let err = JsonlCorpus::new(root.path()).load("math", "train").unwrap_err();
        assert!(matches!(err, DistillError::ParseError(_)));
    }

    #[test]
    fn test_reserved_passthrough_fields_are_renamed() {
        let root = corpus_with(
            "train.jsonl",
            "{\"problem\": \"p\", \"answer\": \"1\", \"id\": \"abc\", \"model\": \"x\"}\n",
        );
        let records = JsonlCorpus::new(root.path()).load("math", "train").unwrap();
        assert_eq!(records[0].extra["source_id"], "abc");
        assert_eq!(records[0].extra["source_model"], "x");
        assert!(!records[0].extra.contains_key("id"));
    }
}
