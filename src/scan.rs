use crate::domains;
use crate::prompt::Confirmer;
use crate::quota::{QuotaLedger, QuotaState, QuotaWindow};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Sentinel score for links whose reputation scan failed or never ran.
/// The executor's threshold filter never admits negative scores.
pub const SCAN_FAILED_SCORE: f64 = -1.0;

/// A candidate link with its computed risk score (0-100, percentage of
/// reputation signals flagging the domain as malicious).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredLink {
    pub url: String,
    pub score: f64,
}

/// Reputation-provider capability: one score per domain. Implementations
/// are selected by which API key the run supplies; they are composed into
/// the scanner, never subclassed.
#[async_trait]
pub trait DomainScorer {
    fn service_name(&self) -> &'static str;

    /// Name of the per-service quota ledger file.
    fn quota_file_name(&self) -> &'static str;

    /// The provider's rate windows and caps.
    fn quota_limits(&self) -> &'static [(QuotaWindow, u32)];

    /// Score 0-100; "no data" from the provider is 0.0, not an error.
    async fn score_domain(&self, domain: &str) -> Result<f64>;
}

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("unsub-pilot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build reputation HTTP client")
}

/// Free-tier windows: 4/minute, 500/day, 15500/month.
pub const VIRUS_TOTAL_LIMITS: &[(QuotaWindow, u32)] = &[
    (QuotaWindow::Minute, 4),
    (QuotaWindow::Day, 500),
    (QuotaWindow::Month, 15_500),
];

/// Free-tier windows: 200/minute, 2000/hour.
pub const HYBRID_ANALYSIS_LIMITS: &[(QuotaWindow, u32)] =
    &[(QuotaWindow::Minute, 200), (QuotaWindow::Hour, 2_000)];

/// VirusTotal domain reports.
pub struct VirusTotalScorer {
    client: reqwest::Client,
    api_key: String,
}

impl VirusTotalScorer {
    pub fn new(api_key: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl DomainScorer for VirusTotalScorer {
    fn service_name(&self) -> &'static str {
        "VirusTotal"
    }

    fn quota_file_name(&self) -> &'static str {
        "vt_requests.json"
    }

    fn quota_limits(&self) -> &'static [(QuotaWindow, u32)] {
        VIRUS_TOTAL_LIMITS
    }

    async fn score_domain(&self, domain: &str) -> Result<f64> {
        let url = format!("https://www.virustotal.com/api/v3/domains/{domain}");
        let response = self
            .client
            .get(&url)
            .header("x-apikey", &self.api_key)
            .send()
            .await
            .with_context(|| format!("VirusTotal request failed for {domain}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "VirusTotal returned {} for {domain}",
                response.status()
            ));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .with_context(|| format!("failed to decode VirusTotal response for {domain}"))?;

        Ok(virus_total_score(&data))
    }
}

/// Percentage of analysis engines reporting the domain malicious. A report
/// with no stats counts as no data.
fn virus_total_score(data: &serde_json::Value) -> f64 {
    let stats = &data["data"]["attributes"]["last_analysis_stats"];
    if stats.is_null() {
        return 0.0;
    }

    let count = |key: &str| stats[key].as_u64().unwrap_or(0);
    let malicious = count("malicious");
    let total = malicious + count("suspicious") + count("undetected") + count("harmless");
    if total == 0 {
        return 0.0;
    }
    malicious as f64 / total as f64 * 100.0
}

/// Hybrid Analysis term search.
pub struct HybridAnalysisScorer {
    client: reqwest::Client,
    api_key: String,
}

impl HybridAnalysisScorer {
    pub fn new(api_key: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl DomainScorer for HybridAnalysisScorer {
    fn service_name(&self) -> &'static str {
        "Hybrid Analysis"
    }

    fn quota_file_name(&self) -> &'static str {
        "ha_requests.json"
    }

    fn quota_limits(&self) -> &'static [(QuotaWindow, u32)] {
        HYBRID_ANALYSIS_LIMITS
    }

    async fn score_domain(&self, domain: &str) -> Result<f64> {
        let response = self
            .client
            .post("https://www.hybrid-analysis.com/api/v2/search/terms")
            .header("api-key", &self.api_key)
            .header("Accept", "application/json")
            .form(&[("domain", domain)])
            .send()
            .await
            .with_context(|| format!("Hybrid Analysis request failed for {domain}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            log::info!("No Hybrid Analysis results for {domain}");
            return Ok(0.0);
        }
        if !response.status().is_success() {
            return Err(anyhow!(
                "Hybrid Analysis returned {} for {domain}",
                response.status()
            ));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .with_context(|| format!("failed to decode Hybrid Analysis response for {domain}"))?;

        Ok(hybrid_analysis_score(&data))
    }
}

/// Percentage of search results carrying a "malicious" verdict.
fn hybrid_analysis_score(data: &serde_json::Value) -> f64 {
    let results = match data["result"].as_array() {
        Some(results) if !results.is_empty() => results,
        _ => return 0.0,
    };

    let malicious = results
        .iter()
        .filter(|r| {
            r["verdict"]
                .as_str()
                .map(|v| v.eq_ignore_ascii_case("malicious"))
                .unwrap_or(false)
        })
        .count();
    malicious as f64 / results.len() as f64 * 100.0
}

/// Drives a scoring batch under quota discipline.
///
/// Links sharing a host are scored with a single provider call; the ledger
/// is re-read before every call so concurrent past runs are respected. Any
/// provider failure other than "no data" aborts the remaining batch to
/// conserve quota.
pub struct LinkScanner<'a, S: DomainScorer, C: Confirmer + ?Sized> {
    scorer: &'a S,
    ledger: &'a mut QuotaLedger,
    confirmer: &'a C,
    enforce_quota: bool,
}

impl<'a, S: DomainScorer, C: Confirmer + ?Sized> LinkScanner<'a, S, C> {
    pub fn new(
        scorer: &'a S,
        ledger: &'a mut QuotaLedger,
        confirmer: &'a C,
        enforce_quota: bool,
    ) -> Self {
        Self {
            scorer,
            ledger,
            confirmer,
            enforce_quota,
        }
    }

    /// Score each link's domain. The result may be shorter than the input
    /// when quota runs out, the user declines, or a provider call fails.
    pub async fn scan(&mut self, links: &[String]) -> Result<Vec<ScoredLink>> {
        let mut scored: Vec<ScoredLink> = Vec::new();
        if links.is_empty() {
            return Ok(scored);
        }

        let minute_limit = self
            .scorer
            .quota_limits()
            .iter()
            .find(|(w, _)| *w == QuotaWindow::Minute)
            .map(|&(_, limit)| limit)
            .unwrap_or(u32::MAX);
        let estimated_secs = if self.enforce_quota {
            (links.len() as f64 / minute_limit as f64).ceil() * 90.0
        } else {
            links.len() as f64
        };
        log::info!(
            "Estimated {} scan time: {:.1} minutes ({:.0} seconds)",
            self.scorer.service_name(),
            estimated_secs / 60.0,
            estimated_secs
        );

        let prompt = format!(
            "Proceed with {} scanning of {} links?",
            self.scorer.service_name(),
            links.len()
        );
        if !self.confirmer.confirm(&prompt) {
            log::info!("{} scanning skipped", self.scorer.service_name());
            return Ok(scored);
        }

        // One provider call per domain per run.
        let mut domain_scores: HashMap<String, f64> = HashMap::new();

        for link in links {
            let domain = match domains::host_of(link) {
                Some(d) => d,
                None => {
                    log::warn!("Skipping malformed URL: {link}");
                    continue;
                }
            };

            if let Some(&score) = domain_scores.get(&domain) {
                scored.push(ScoredLink {
                    url: link.clone(),
                    score,
                });
                continue;
            }

            if self.enforce_quota && !self.wait_for_quota().await? {
                return Ok(scored);
            }

            match self.scorer.score_domain(&domain).await {
                Ok(score) => {
                    self.ledger.record()?;
                    domain_scores.insert(domain, score);
                    scored.push(ScoredLink {
                        url: link.clone(),
                        score,
                    });
                }
                Err(e) => {
                    // A systemic provider outage would burn quota for
                    // nothing; stop the batch here.
                    log::error!(
                        "Failed to scan {domain} with {}: {e}. Stopping scan.",
                        self.scorer.service_name()
                    );
                    scored.push(ScoredLink {
                        url: link.clone(),
                        score: SCAN_FAILED_SCORE,
                    });
                    self.ledger.record()?;
                    break;
                }
            }
        }

        Ok(scored)
    }

    /// Re-reads the persisted ledger and waits out the fast window if
    /// needed. Returns false when a slow window is exhausted.
    async fn wait_for_quota(&mut self) -> Result<bool> {
        loop {
            self.ledger.reload()?;
            match self.ledger.check() {
                QuotaState::Available(_) => return Ok(true),
                QuotaState::Throttle(wait) => {
                    let wait = wait.max(Duration::from_secs(1));
                    log::info!(
                        "{} per-minute quota reached; sleeping {}s",
                        self.scorer.service_name(),
                        wait.as_secs()
                    );
                    tokio::time::sleep(wait).await;
                }
                QuotaState::Exhausted(window) => {
                    log::warn!(
                        "{} {} request limit reached; stopping scan",
                        self.scorer.service_name(),
                        window.label()
                    );
                    return Ok(false);
                }
            }
        }
    }
}
