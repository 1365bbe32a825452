use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Durable set of URLs that have completed an unsubscribe action (or were
/// deliberately marked do-not-retry).
///
/// Backed by a newline-delimited file, loaded once per run and appended to
/// immediately on every success so a crash mid-run keeps prior successes.
/// A crash between a successful HTTP call and the append can cause one
/// duplicate visit on the next run. The file is a single-writer resource:
/// concurrent runs against the same path are unsupported.
pub struct VisitedCache {
    path: PathBuf,
    urls: HashSet<String>,
}

impl VisitedCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache directory {}", parent.display()))?;
        }

        let urls = match std::fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| line.to_lowercase())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read visited-link cache {}", path.display())
                })
            }
        };

        Ok(Self { path, urls })
    }

    /// Case-insensitive membership test.
    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(&url.to_lowercase())
    }

    /// Append a URL to the cache, flushing to disk before returning.
    pub fn record(&mut self, url: &str) -> Result<()> {
        if !self.urls.insert(url.to_lowercase()) {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open visited-link cache {}", self.path.display()))?;
        writeln!(file, "{url}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// The subset of `urls` not yet in the cache, in input order. Scoring
    /// batches are filtered through this so provider quota is never spent
    /// on a link the executor would refuse anyway.
    pub fn filter_unvisited(&self, urls: &[String]) -> Vec<String> {
        urls.iter()
            .filter(|url| !self.contains(url))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VisitedCache::open(dir.path().join("visited_urls.txt")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_record_and_contains_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visited_urls.txt");
        let mut cache = VisitedCache::open(&path).unwrap();
        cache.record("https://Example.com/Unsubscribe?id=1").unwrap();

        assert!(cache.contains("https://example.com/unsubscribe?id=1"));
        assert!(cache.contains("HTTPS://EXAMPLE.COM/UNSUBSCRIBE?ID=1"));
        assert!(!cache.contains("https://example.com/other"));
    }

    #[test]
    fn test_record_is_durable_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visited_urls.txt");

        {
            let mut cache = VisitedCache::open(&path).unwrap();
            cache.record("https://a.example/unsub").unwrap();
            cache.record("https://b.example/unsub").unwrap();
        }

        // Reopen simulates the next run; both entries must survive.
        let cache = VisitedCache::open(&path).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("https://a.example/unsub"));
        assert!(cache.contains("https://b.example/unsub"));
    }

    #[test]
    fn test_filter_unvisited() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = VisitedCache::open(dir.path().join("visited_urls.txt")).unwrap();
        cache.record("https://a.example/unsub").unwrap();

        let urls = vec![
            "https://A.EXAMPLE/unsub".to_string(),
            "https://b.example/unsub".to_string(),
            "https://c.example/unsub".to_string(),
        ];
        assert_eq!(
            cache.filter_unvisited(&urls),
            vec![
                "https://b.example/unsub".to_string(),
                "https://c.example/unsub".to_string(),
            ]
        );
    }

    #[test]
    fn test_duplicate_record_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visited_urls.txt");
        let mut cache = VisitedCache::open(&path).unwrap();
        cache.record("https://a.example/unsub").unwrap();
        cache.record("https://A.EXAMPLE/unsub").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
