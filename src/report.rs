use crate::scan::ScoredLink;
use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use std::fmt::Write as _;
use std::path::Path;

/// CSS class bucket for a risk score. Negative scores are the scan-failed
/// sentinel and get their own bucket.
pub fn score_class(score: f64) -> &'static str {
    if score < 0.0 {
        "unknown"
    } else if score < 5.0 {
        "low"
    } else if score < 20.0 {
        "medium"
    } else {
        "high"
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

/// Render scored links as a standalone HTML document. The table layout is
/// stable: `parse` reads it back for dry-run replay.
pub fn render(scored: &[ScoredLink], service: &str) -> String {
    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Unsubscribe Link Report</title>\n<style>\n\
         body {{ font-family: sans-serif; margin: 2em; }}\n\
         table {{ border-collapse: collapse; width: 100%; }}\n\
         th, td {{ border: 1px solid #ccc; padding: 6px 10px; text-align: left; }}\n\
         .score.low {{ color: #2e7d32; }}\n\
         .score.medium {{ color: #e65100; }}\n\
         .score.high {{ color: #b71c1c; font-weight: bold; }}\n\
         .score.unknown {{ color: #757575; }}\n\
         </style>\n</head>\n<body>\n\
         <h1>Unsubscribe Link Report</h1>\n\
         <p>Scored by {} on {}. {} links.</p>\n\
         <table>\n<tr><th>Risk Score</th><th>Link</th></tr>\n",
        escape(service),
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        scored.len()
    );

    for link in scored {
        let url = escape(&link.url);
        let _ = writeln!(
            html,
            "<tr><td class=\"score {}\">{:.2}</td><td><a href=\"{url}\">{url}</a></td></tr>",
            score_class(link.score),
            link.score
        );
    }

    html.push_str("</table>\n</body>\n</html>\n");
    html
}

pub fn write_report<P: AsRef<Path>>(path: P, scored: &[ScoredLink], service: &str) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, render(scored, service))
        .with_context(|| format!("failed to write report {}", path.display()))
}

/// Recover the (URL, score) pairs from a previously rendered report.
pub fn parse(html: &str) -> Vec<ScoredLink> {
    let row_re = Regex::new(
        r#"<td class="score [a-z]+">(-?[0-9.]+)</td><td><a href="([^"]+)">"#,
    )
    .unwrap();

    row_re
        .captures_iter(html)
        .filter_map(|caps| {
            let score: f64 = caps[1].parse().ok()?;
            Some(ScoredLink {
                url: unescape(&caps[2]),
                score,
            })
        })
        .collect()
}

/// Read a report file back into scored links for `--dry-run`.
pub fn load_report<P: AsRef<Path>>(path: P) -> Result<Vec<ScoredLink>> {
    let path = path.as_ref();
    let html = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read report {}", path.display()))?;
    let scored = parse(&html);
    if scored.is_empty() {
        log::warn!("No scored links found in {}", path.display());
    }
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::SCAN_FAILED_SCORE;

    #[test]
    fn test_score_class_buckets() {
        assert_eq!(score_class(0.0), "low");
        assert_eq!(score_class(4.9), "low");
        assert_eq!(score_class(5.0), "medium");
        assert_eq!(score_class(19.9), "medium");
        assert_eq!(score_class(20.0), "high");
        assert_eq!(score_class(SCAN_FAILED_SCORE), "unknown");
    }

    #[test]
    fn test_round_trip_preserves_pairs() {
        let scored = vec![
            ScoredLink {
                url: "https://a.example.com/unsub?u=1&list=news".to_string(),
                score: 0.0,
            },
            ScoredLink {
                url: "https://b.example.org/optout".to_string(),
                score: 12.34,
            },
            ScoredLink {
                url: "https://c.example.net/remove".to_string(),
                score: SCAN_FAILED_SCORE,
            },
        ];

        let html = render(&scored, "VirusTotal");
        // Two decimals, so replay sees the same score the live run used.
        assert!(html.contains(">12.34<"));
        assert_eq!(parse(&html), scored);
    }

    #[test]
    fn test_parse_ignores_unrelated_markup() {
        assert!(parse("<html><body><p>no table here</p></body></html>").is_empty());
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unsubscribe_links.html");
        let scored = vec![ScoredLink {
            url: "https://a.example.com/unsub".to_string(),
            score: 3.0,
        }];
        write_report(&path, &scored, "Hybrid Analysis").unwrap();
        assert_eq!(load_report(&path).unwrap(), scored);
    }
}
