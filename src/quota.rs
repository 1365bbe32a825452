use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A rolling time bucket with an independent request cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    Minute,
    Hour,
    Day,
    Month,
}

impl QuotaWindow {
    pub fn duration(&self) -> Duration {
        match self {
            QuotaWindow::Minute => Duration::minutes(1),
            QuotaWindow::Hour => Duration::hours(1),
            QuotaWindow::Day => Duration::days(1),
            QuotaWindow::Month => Duration::days(30),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QuotaWindow::Minute => "minute",
            QuotaWindow::Hour => "hour",
            QuotaWindow::Day => "day",
            QuotaWindow::Month => "month",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowCounter {
    pub window: QuotaWindow,
    pub limit: u32,
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl WindowCounter {
    fn roll(&mut self, now: DateTime<Utc>) {
        if now - self.window_start >= self.window.duration() {
            self.count = 0;
            self.window_start = now;
        }
    }

    fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}

/// Outcome of a pre-call quota check.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaState {
    /// Calls may proceed; carries min remaining across all windows.
    Available(u32),
    /// The fastest window is at its limit; sleep this long, then re-check.
    Throttle(std::time::Duration),
    /// A slow window is at its limit; stop the batch.
    Exhausted(QuotaWindow),
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    service: String,
    counters: Vec<WindowCounter>,
    updated_at: DateTime<Utc>,
}

/// Durable per-service quota counters.
///
/// One JSON file per service holding a count, limit and window start per
/// time window, plus a last-update timestamp. Counts are persisted on every
/// `record` and re-read (`reload`) before every outbound call, since another
/// run may have consumed quota in between. The file is single-writer:
/// concurrent runs against it may double-count.
pub struct QuotaLedger {
    path: PathBuf,
    service: String,
    counters: Vec<WindowCounter>,
    updated_at: DateTime<Utc>,
}

impl QuotaLedger {
    /// Load the ledger for `service`, or initialize it with the given
    /// per-window limits. Configured limits always win over persisted ones;
    /// persisted counts and window starts are kept.
    pub fn open<P: AsRef<Path>>(
        path: P,
        service: &str,
        limits: &[(QuotaWindow, u32)],
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create quota directory {}", parent.display()))?;
        }

        let now = Utc::now();
        let mut counters: Vec<WindowCounter> = limits
            .iter()
            .map(|&(window, limit)| WindowCounter {
                window,
                limit,
                count: 0,
                window_start: now,
            })
            .collect();
        // Fastest window first; the throttle/stop decision depends on it.
        counters.sort_by_key(|c| c.window.duration());

        let mut ledger = Self {
            path,
            service: service.to_string(),
            counters,
            updated_at: now,
        };
        ledger.merge_persisted()?;
        Ok(ledger)
    }

    fn merge_persisted(&mut self) -> Result<()> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read quota file {}", self.path.display()))
            }
        };

        let persisted: LedgerFile = match serde_json::from_str(&raw) {
            Ok(f) => f,
            Err(e) => {
                log::warn!(
                    "Quota file {} is unreadable ({e}); starting counts from zero",
                    self.path.display()
                );
                return Ok(());
            }
        };

        for counter in &mut self.counters {
            if let Some(saved) = persisted
                .counters
                .iter()
                .find(|c| c.window == counter.window)
            {
                counter.count = saved.count;
                counter.window_start = saved.window_start;
            }
        }
        self.updated_at = persisted.updated_at;
        Ok(())
    }

    /// Re-read persisted counts, keeping configured limits.
    pub fn reload(&mut self) -> Result<()> {
        self.merge_persisted()
    }

    /// Roll expired windows and report whether a call may proceed.
    pub fn check(&mut self) -> QuotaState {
        self.check_at(Utc::now())
    }

    pub fn check_at(&mut self, now: DateTime<Utc>) -> QuotaState {
        for counter in &mut self.counters {
            counter.roll(now);
        }

        // Slow windows exhaust the batch; only the fastest one throttles.
        for counter in self.counters.iter().skip(1) {
            if counter.count >= counter.limit {
                return QuotaState::Exhausted(counter.window);
            }
        }

        if let Some(fastest) = self.counters.first() {
            if fastest.count >= fastest.limit {
                let reset_at = fastest.window_start + fastest.window.duration();
                let wait = (reset_at - now).to_std().unwrap_or_default();
                return QuotaState::Throttle(wait);
            }
        }

        let remaining = self
            .counters
            .iter()
            .map(WindowCounter::remaining)
            .min()
            .unwrap_or(0);
        QuotaState::Available(remaining)
    }

    /// Min remaining across all windows, after rolling.
    pub fn remaining(&mut self) -> u32 {
        match self.check() {
            QuotaState::Available(n) => n,
            _ => 0,
        }
    }

    /// Count one consumed request against every window and persist.
    pub fn record(&mut self) -> Result<()> {
        self.record_at(Utc::now())
    }

    pub fn record_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        for counter in &mut self.counters {
            counter.roll(now);
            counter.count += 1;
        }
        self.updated_at = now;
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let file = LedgerFile {
            service: self.service.clone(),
            counters: self.counters.clone(),
            updated_at: self.updated_at,
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write quota file {}", self.path.display()))
    }

    /// (window, used, limit) per window, for the usage display.
    pub fn snapshot(&mut self) -> Vec<(QuotaWindow, u32, u32)> {
        let now = Utc::now();
        for counter in &mut self.counters {
            counter.roll(now);
        }
        self.counters
            .iter()
            .map(|c| (c.window, c.count, c.limit))
            .collect()
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}
