use crate::domains;
use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Pipeline stage a capture belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Initial,
    Retry,
    Form,
    Confirmation,
    Mailto,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initial => "initial",
            Stage::Retry => "retry",
            Stage::Form => "form",
            Stage::Confirmation => "confirmation",
            Stage::Mailto => "mailto",
            Stage::Error => "error",
        }
    }
}

/// The HTTP traffic captured for one stage of one link.
#[derive(Debug, Clone, Serialize)]
pub struct StageCapture {
    pub url: String,
    pub method: String,
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_data: Option<Vec<(String, String)>>,
}

#[derive(Debug, Clone, Serialize)]
struct StageEntry {
    stage: Stage,
    #[serde(flatten)]
    capture: StageCapture,
}

/// Everything recorded about a link that did not trivially succeed.
#[derive(Debug, Clone, Serialize)]
pub struct IssueRecord {
    pub link: String,
    stages: Vec<StageEntry>,
    pub reason: String,
}

impl IssueRecord {
    pub fn new(link: &str) -> Self {
        Self {
            link: link.to_string(),
            stages: Vec::new(),
            reason: String::new(),
        }
    }

    /// Append a stage capture; bodies are sanitized before storage.
    pub fn capture(&mut self, stage: Stage, mut capture: StageCapture) {
        capture.body = sanitize_html(&capture.body);
        self.stages.push(StageEntry { stage, capture });
    }

    pub fn set_reason(&mut self, reason: &str) {
        self.reason = reason.to_string();
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaxonomyBucket {
    pub domain: String,
    pub failures: u64,
    pub reasons: Vec<String>,
}

/// Per-run collection of issue records with a rolled-up failure taxonomy.
#[derive(Debug, Default)]
pub struct IssueLog {
    records: Vec<IssueRecord>,
}

#[derive(Serialize)]
struct IssueFile<'a> {
    issues: &'a [IssueRecord],
    worst_offenders: Vec<TaxonomyBucket>,
}

impl IssueLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: IssueRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Top-N second-level domains by failure count, with their distinct
    /// failure reasons.
    pub fn taxonomy(&self, top_n: usize) -> Vec<TaxonomyBucket> {
        let mut buckets: HashMap<String, (u64, HashSet<String>)> = HashMap::new();
        for record in &self.records {
            let key = domains::taxonomy_key(&record.link);
            let entry = buckets.entry(key).or_default();
            entry.0 += 1;
            if !record.reason.is_empty() {
                entry.1.insert(record.reason.clone());
            }
        }

        let mut rollup: Vec<TaxonomyBucket> = buckets
            .into_iter()
            .map(|(domain, (failures, reasons))| {
                let mut reasons: Vec<String> = reasons.into_iter().collect();
                reasons.sort();
                TaxonomyBucket {
                    domain,
                    failures,
                    reasons,
                }
            })
            .collect();
        rollup.sort_by(|a, b| b.failures.cmp(&a.failures).then(a.domain.cmp(&b.domain)));
        rollup.truncate(top_n);
        rollup
    }

    /// Serialize the ordered records plus the top-10 rollup to a JSON file.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = IssueFile {
            issues: &self.records,
            worst_offenders: self.taxonomy(10),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write issues log {}", path.display()))
    }
}

/// Strip scripts and non-printable noise from a captured body so the issues
/// log stays readable.
pub fn sanitize_html(content: &str) -> String {
    let script_re = Regex::new(r"(?is)<script\b.*?</script>").unwrap();
    let stripped = script_re.replace_all(content, "");
    let printable: String = stripped
        .chars()
        .filter(|c| matches!(c, '\x20'..='\x7E' | '\n' | '\r' | '\t') || !c.is_ascii())
        .collect();
    let ws_re = Regex::new(r"\s+").unwrap();
    ws_re.replace_all(&printable, " ").trim().to_string()
}

/// Raw per-link traffic log, written regardless of outcome.
pub struct Transcript {
    path: PathBuf,
    content: String,
}

impl Transcript {
    pub fn new(log_dir: &Path, run_tag: &str, link: &str) -> Self {
        let host_part = domains::host_of(link)
            .unwrap_or_else(|| "unknown".to_string())
            .replace('.', "_");
        let host_part: String = host_part.chars().take(20).collect();
        let path = log_dir.join(format!("visit_{run_tag}_{host_part}.log"));

        let mut transcript = Self {
            path,
            content: String::new(),
        };
        let _ = writeln!(
            transcript.content,
            "Timestamp: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        transcript
    }

    /// Record one request/response exchange.
    pub fn record(
        &mut self,
        label: &str,
        method: &str,
        url: &str,
        status: Option<u16>,
        headers: &BTreeMap<String, String>,
        form_data: Option<&[(String, String)]>,
        body: &str,
        success: bool,
    ) {
        let _ = writeln!(self.content);
        let _ = writeln!(self.content, "{label} URL: {url}");
        let _ = writeln!(self.content, "Method: {method}");
        if let Some(form_data) = form_data {
            let _ = writeln!(self.content, "Form Data:");
            for (key, value) in form_data {
                let _ = writeln!(self.content, "  {key}: {value}");
            }
        }
        match status {
            Some(code) => {
                let _ = writeln!(self.content, "Status: {code}");
            }
            None => {
                let _ = writeln!(self.content, "Status: (no response)");
            }
        }
        let _ = writeln!(self.content, "Success: {}", if success { "Yes" } else { "No" });
        let _ = writeln!(self.content, "Headers:");
        for (key, value) in headers {
            let _ = writeln!(self.content, "  {key}: {value}");
        }
        let _ = writeln!(self.content, "Body:");
        let _ = writeln!(self.content, "{body}");
    }

    pub fn note(&mut self, text: &str) {
        let _ = writeln!(self.content, "{text}");
    }

    /// Write the accumulated transcript to disk.
    pub fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        std::fs::write(&self.path, &self.content)
            .with_context(|| format!("failed to write transcript {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(url: &str) -> StageCapture {
        StageCapture {
            url: url.to_string(),
            method: "GET".to_string(),
            status: Some(200),
            headers: BTreeMap::new(),
            body: "<p>body</p>".to_string(),
            form_data: None,
        }
    }

    fn failed_record(link: &str, reason: &str) -> IssueRecord {
        let mut record = IssueRecord::new(link);
        record.capture(Stage::Initial, capture(link));
        record.set_reason(reason);
        record
    }

    #[test]
    fn test_sanitize_html() {
        let input = "<div>ok</div><script>alert('x')\nmore</script>  trailing\t\tspace";
        let out = sanitize_html(input);
        assert!(!out.contains("alert"));
        assert!(out.contains("<div>ok</div>"));
        assert!(!out.contains("\t"));
    }

    #[test]
    fn test_sanitize_keeps_non_ascii_text() {
        let out = sanitize_html("配信停止が完了しました");
        assert!(out.contains("配信停止"));
    }

    #[test]
    fn test_taxonomy_rollup_ordering() {
        let mut log = IssueLog::new();
        log.push(failed_record("https://a.example.com/u", "No confirmation message"));
        log.push(failed_record("https://mail.a.example.com/u2", "Server error during form submission"));
        log.push(failed_record("https://b.example.org/u", "No confirmation message"));

        let rollup = log.taxonomy(10);
        assert_eq!(rollup.len(), 2);
        assert_eq!(rollup[0].domain, "example.com");
        assert_eq!(rollup[0].failures, 2);
        assert_eq!(rollup[0].reasons.len(), 2);
        assert_eq!(rollup[1].domain, "example.org");
    }

    #[test]
    fn test_taxonomy_truncates_to_top_n() {
        let mut log = IssueLog::new();
        for i in 0..15 {
            log.push(failed_record(&format!("https://host{i}.test/u"), "r"));
        }
        assert_eq!(log.taxonomy(10).len(), 10);
    }

    #[test]
    fn test_write_issue_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/run/unsubscribe_issues.json");
        let mut log = IssueLog::new();
        log.push(failed_record("https://a.example.com/u", "No confirmation message"));
        log.write(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["issues"][0]["link"], "https://a.example.com/u");
        assert_eq!(parsed["issues"][0]["stages"][0]["stage"], "initial");
        assert_eq!(parsed["worst_offenders"][0]["domain"], "example.com");
    }

    #[test]
    fn test_transcript_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcript =
            Transcript::new(dir.path(), "20260827_120000", "https://news.example.com/u");
        transcript.record(
            "Initial",
            "GET",
            "https://news.example.com/u",
            Some(200),
            &BTreeMap::new(),
            None,
            "<p>done</p>",
            true,
        );
        transcript.flush().unwrap();

        let content = std::fs::read_to_string(transcript.path()).unwrap();
        assert!(content.contains("Method: GET"));
        assert!(content.contains("Status: 200"));
        assert!(transcript
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("news_example_com"));
    }
}
