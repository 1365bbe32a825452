use crate::cache::VisitedCache;
use crate::domains;
use crate::issues::{IssueLog, IssueRecord, Stage, StageCapture, Transcript};
use crate::lexicon::Lexicon;
use crate::mail::MailProvider;
use crate::page;
use crate::prompt::Confirmer;
use crate::scan::ScoredLink;
use anyhow::{Context, Result};
use chrono::Local;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

const MAX_REDIRECTS: usize = 5;

/// Terminal classification of one link in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    InitialSuccess,
    FormSuccess,
    ConfirmationSuccess,
    MailtoSuccess,
    Failed,
    Indeterminate,
    AlreadyVisited,
}

impl VisitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            VisitOutcome::InitialSuccess
                | VisitOutcome::FormSuccess
                | VisitOutcome::ConfirmationSuccess
                | VisitOutcome::MailtoSuccess
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            VisitOutcome::InitialSuccess => "unsubscribed (direct)",
            VisitOutcome::FormSuccess => "unsubscribed (form)",
            VisitOutcome::ConfirmationSuccess => "unsubscribed (confirmation)",
            VisitOutcome::MailtoSuccess => "unsubscribed (mailto)",
            VisitOutcome::Failed => "failed",
            VisitOutcome::Indeterminate => "indeterminate",
            VisitOutcome::AlreadyVisited => "already visited",
        }
    }
}

/// What the first stage decided about a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialDisposition {
    Success,
    Rejected,
    Continue,
}

/// 2xx plus either a success keyword in the visible text or, under the
/// `empty_body_is_success` policy, an empty body. One-click endpoints
/// commonly answer 200 with no content at all.
pub fn is_success_response(
    status: u16,
    body: &str,
    lexicon: &Lexicon,
    empty_body_is_success: bool,
) -> bool {
    if !(200..300).contains(&status) {
        return false;
    }
    if body.trim().is_empty() {
        return empty_body_is_success;
    }
    lexicon.matches_success(&page::visible_text(body))
}

/// Query parameters of a link, reshaped into form fields for the POST
/// retry stage.
pub fn query_form_data(link: &str) -> Vec<(String, String)> {
    match url::Url::parse(link) {
        Ok(parsed) => parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        Err(_) => vec![],
    }
}

/// First-stage classification. Only 400 is terminal here; anything else
/// that is not a success moves on to the retry, form, and confirmation
/// stages.
pub fn classify_initial(
    status: u16,
    body: &str,
    lexicon: &Lexicon,
    empty_body_is_success: bool,
) -> InitialDisposition {
    if status == 400 {
        return InitialDisposition::Rejected;
    }
    if is_success_response(status, body, lexicon, empty_body_is_success) {
        InitialDisposition::Success
    } else {
        InitialDisposition::Continue
    }
}

#[derive(Debug, Clone)]
pub struct VisitOptions {
    pub empty_body_is_success: bool,
    pub enable_mailto: bool,
    pub dry_run: bool,
}

impl VisitOptions {
    pub fn new() -> Self {
        Self {
            empty_body_is_success: true,
            enable_mailto: false,
            dry_run: false,
        }
    }
}

impl Default for VisitOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-run results of the executor.
#[derive(Debug, Default)]
pub struct VisitReport {
    pub outcomes: Vec<(String, VisitOutcome)>,
    /// Message ids whose unsubscribe succeeded; eligible for deletion.
    pub deletable: Vec<String>,
    /// Links the threshold filter refused to visit.
    pub skipped: usize,
}

impl VisitReport {
    pub fn count(&self, outcome: VisitOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }

    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }
}

struct StageResponse {
    url: String,
    status: u16,
    headers: BTreeMap<String, String>,
    body: String,
}

enum Fetched {
    Response(StageResponse),
    ErrorRedirect { location: String },
}

fn header_map(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_lowercase(),
                value.to_str().unwrap_or("").to_string(),
            )
        })
        .collect()
}

/// Drives one link at a time through the visit state machine: initial GET,
/// optional mailto fallback, form submission, confirmation chase. Successful
/// outcomes go to the visited cache; failures go to the issue log. Redirects
/// are followed by hand so error-page targets can be rejected outright.
pub struct LinkVisitor<'a, M: MailProvider> {
    client: reqwest::Client,
    lexicon: &'a Lexicon,
    cache: &'a mut VisitedCache,
    mail: Option<&'a M>,
    options: VisitOptions,
}

impl<'a, M: MailProvider> LinkVisitor<'a, M> {
    pub fn new(
        lexicon: &'a Lexicon,
        cache: &'a mut VisitedCache,
        mail: Option<&'a M>,
        options: VisitOptions,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("unsub-pilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build visitor HTTP client")?;
        Ok(Self {
            client,
            lexicon,
            cache,
            mail,
            options,
        })
    }

    /// Visit every scored link that passes the threshold filter. Scores
    /// must be in [0, threshold]; the scan-failed sentinel is negative and
    /// therefore never admitted. Nothing is visited until the confirmer
    /// agrees; declining returns an empty report.
    pub async fn run(
        &mut self,
        scored: &[ScoredLink],
        threshold: f64,
        message_index: &HashMap<String, String>,
        issues: &mut IssueLog,
        log_dir: &Path,
        confirmer: &dyn Confirmer,
    ) -> VisitReport {
        let mut report = VisitReport::default();

        let eligible = scored
            .iter()
            .filter(|link| {
                (0.0..=threshold).contains(&link.score)
                    && domains::is_actionable(&link.url)
                    && !self.cache.contains(&link.url)
            })
            .count();
        if eligible > 0 {
            let prompt = format!("Proceed with visiting {eligible} link(s)?");
            if !confirmer.confirm(&prompt) {
                log::info!("Visiting skipped");
                return report;
            }
        }

        let base_tag = Local::now().format("%Y%m%d_%H%M%S").to_string();

        for (index, link) in scored.iter().enumerate() {
            if link.score < 0.0 {
                log::warn!("Skipping {} (reputation scan failed)", link.url);
                report.skipped += 1;
                continue;
            }
            if link.score > threshold {
                log::info!(
                    "Skipping {} (risk score {:.1} above threshold {:.1})",
                    link.url,
                    link.score,
                    threshold
                );
                report.skipped += 1;
                continue;
            }
            if !domains::is_actionable(&link.url) {
                log::warn!("Skipping non-actionable URL: {}", link.url);
                report.skipped += 1;
                continue;
            }

            if self.cache.contains(&link.url) {
                log::info!("Already visited {}; skipping", link.url);
                report
                    .outcomes
                    .push((link.url.clone(), VisitOutcome::AlreadyVisited));
                continue;
            }

            let mut transcript =
                Transcript::new(log_dir, &format!("{base_tag}_{index:03}"), &link.url);
            let mut record = IssueRecord::new(&link.url);

            let outcome = match self
                .visit_link(&link.url, &mut transcript, &mut record)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("Error visiting {}: {e:#}", link.url);
                    transcript.note(&format!("Error: {e:#}"));
                    record.capture(
                        Stage::Error,
                        StageCapture {
                            url: link.url.clone(),
                            method: "GET".to_string(),
                            status: None,
                            headers: BTreeMap::new(),
                            body: format!("{e:#}"),
                            form_data: None,
                        },
                    );
                    record.set_reason(&format!("Request error: {e}"));
                    VisitOutcome::Failed
                }
            };

            if outcome.is_success() {
                if let Err(e) = self.cache.record(&link.url) {
                    log::error!("Failed to record {} in visited cache: {e}", link.url);
                }
                if let Some(message_id) = message_index.get(&link.url) {
                    report.deletable.push(message_id.clone());
                }
            }

            if matches!(outcome, VisitOutcome::Failed | VisitOutcome::Indeterminate) {
                issues.push(record);
            }

            if let Err(e) = transcript.flush() {
                log::warn!("Failed to write transcript for {}: {e}", link.url);
            }

            log::info!("{} -> {}", link.url, outcome.label());
            report.outcomes.push((link.url.clone(), outcome));
        }

        report
    }

    async fn visit_link(
        &mut self,
        link: &str,
        transcript: &mut Transcript,
        record: &mut IssueRecord,
    ) -> Result<VisitOutcome> {
        log::info!("Visiting {link}");

        let initial = match self.get_following(link).await? {
            Fetched::ErrorRedirect { location } => {
                transcript.note(&format!("Redirected to error page: {location}"));
                record.set_reason("Redirected to an error page");
                return Ok(VisitOutcome::Failed);
            }
            Fetched::Response(response) => response,
        };

        let disposition = classify_initial(
            initial.status,
            &initial.body,
            self.lexicon,
            self.options.empty_body_is_success,
        );
        transcript.record(
            "Initial",
            "GET",
            &initial.url,
            Some(initial.status),
            &initial.headers,
            None,
            &initial.body,
            disposition == InitialDisposition::Success,
        );
        record.capture(
            Stage::Initial,
            StageCapture {
                url: initial.url.clone(),
                method: "GET".to_string(),
                status: Some(initial.status),
                headers: initial.headers.clone(),
                body: initial.body.clone(),
                form_data: None,
            },
        );

        match disposition {
            InitialDisposition::Success => return Ok(VisitOutcome::InitialSuccess),
            InitialDisposition::Rejected => {
                record.set_reason("Request rejected by server");
                return Ok(VisitOutcome::Failed);
            }
            InitialDisposition::Continue => {}
        }

        if self.options.enable_mailto
            && !self.options.dry_run
            && (200..300).contains(&initial.status)
        {
            if let Some(outcome) = self.try_mailto(&initial.body, transcript, record).await {
                return Ok(outcome);
            }
        }

        if let Some(outcome) = self.retry_with_post(link, transcript, record).await {
            return Ok(outcome);
        }

        let mut working_url = initial.url.clone();
        let mut working_body = initial.body;

        if let Some(form) = page::find_unsubscribe_form(&working_body, self.lexicon) {
            let action = match &form.action {
                Some(action) => match page::resolve_action(&working_url, action) {
                    Some(resolved) => resolved,
                    None => {
                        transcript.note(&format!("Form action '{action}' did not resolve"));
                        record.set_reason("Invalid form action URL");
                        return Ok(VisitOutcome::Failed);
                    }
                },
                // An action-less form posts back to the page itself.
                None => working_url.clone(),
            };

            log::debug!("Submitting unsubscribe form to {action}");
            let response = self
                .client
                .post(&action)
                .form(&form.fields)
                .send()
                .await
                .with_context(|| format!("form submission to {action} failed"))?;
            let status = response.status().as_u16();
            let headers = header_map(response.headers());
            let body = response.text().await.unwrap_or_default();

            let success = is_success_response(
                status,
                &body,
                self.lexicon,
                self.options.empty_body_is_success,
            );
            transcript.record(
                "Form",
                "POST",
                &action,
                Some(status),
                &headers,
                Some(&form.fields),
                &body,
                success,
            );
            record.capture(
                Stage::Form,
                StageCapture {
                    url: action.clone(),
                    method: "POST".to_string(),
                    status: Some(status),
                    headers,
                    body: body.clone(),
                    form_data: Some(form.fields.clone()),
                },
            );

            if success {
                return Ok(VisitOutcome::FormSuccess);
            }
            if status == 500 {
                record.set_reason("Server error during form submission");
                return Ok(VisitOutcome::Failed);
            }

            working_url = action;
            working_body = body;
        }

        self.chase_confirmation(&working_url, &working_body, transcript, record)
            .await
    }

    /// POST the link itself with its query parameters as form data. Some
    /// endpoints ignore a bare GET but act on the POST. `Some` only on
    /// success; any failure falls through to the form stage.
    async fn retry_with_post(
        &self,
        link: &str,
        transcript: &mut Transcript,
        record: &mut IssueRecord,
    ) -> Option<VisitOutcome> {
        let params = query_form_data(link);

        log::debug!("Retrying {link} as POST");
        let response = match self.client.post(link).form(&params).send().await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Retry POST to {link} failed: {e}");
                transcript.note(&format!("Retry POST failed: {e}"));
                return None;
            }
        };
        let status = response.status().as_u16();
        let headers = header_map(response.headers());
        let body = response.text().await.unwrap_or_default();

        let success = is_success_response(
            status,
            &body,
            self.lexicon,
            self.options.empty_body_is_success,
        );
        transcript.record(
            "Retry",
            "POST",
            link,
            Some(status),
            &headers,
            Some(&params),
            &body,
            success,
        );
        record.capture(
            Stage::Retry,
            StageCapture {
                url: link.to_string(),
                method: "POST".to_string(),
                status: Some(status),
                headers,
                body,
                form_data: Some(params),
            },
        );

        success.then_some(VisitOutcome::InitialSuccess)
    }

    /// Mailto fallback. `Some` only on success; failures are logged and the
    /// machine moves on to form submission.
    async fn try_mailto(
        &self,
        body: &str,
        transcript: &mut Transcript,
        record: &mut IssueRecord,
    ) -> Option<VisitOutcome> {
        let address = page::find_mailto(body)?;
        let mail = self.mail?;

        log::info!("Found mailto fallback: {address}");
        match mail.send_message(&address, "Unsubscribe Request", "").await {
            Ok(()) => {
                transcript.note(&format!("Sent unsubscribe request to {address}"));
                record.capture(
                    Stage::Mailto,
                    StageCapture {
                        url: format!("mailto:{address}"),
                        method: "MAILTO".to_string(),
                        status: None,
                        headers: BTreeMap::new(),
                        body: String::new(),
                        form_data: None,
                    },
                );
                Some(VisitOutcome::MailtoSuccess)
            }
            Err(e) => {
                log::warn!("Failed to send unsubscribe mail to {address}: {e}");
                transcript.note(&format!("Mailto to {address} failed: {e}"));
                None
            }
        }
    }

    async fn chase_confirmation(
        &self,
        working_url: &str,
        working_body: &str,
        transcript: &mut Transcript,
        record: &mut IssueRecord,
    ) -> Result<VisitOutcome> {
        let target = match page::find_confirmation(working_body, working_url) {
            Some(target) => target,
            None => {
                record.set_reason("No confirmation link found");
                return Ok(VisitOutcome::Indeterminate);
            }
        };

        if self.cache.contains(&target.url) {
            transcript.note(&format!("Confirmation target {} already visited", target.url));
            record.set_reason("No confirmation link found");
            return Ok(VisitOutcome::Indeterminate);
        }

        log::debug!("Chasing confirmation link {}", target.url);
        let (method, request) = if target.is_post {
            ("POST", self.client.post(&target.url).form(&target.form_data))
        } else {
            ("GET", self.client.get(&target.url))
        };
        let response = request
            .send()
            .await
            .with_context(|| format!("confirmation request to {} failed", target.url))?;
        let status = response.status().as_u16();
        let headers = header_map(response.headers());
        let body = response.text().await.unwrap_or_default();

        let success = is_success_response(
            status,
            &body,
            self.lexicon,
            self.options.empty_body_is_success,
        );
        transcript.record(
            "Confirmation",
            method,
            &target.url,
            Some(status),
            &headers,
            target.is_post.then_some(target.form_data.as_slice()),
            &body,
            success,
        );
        record.capture(
            Stage::Confirmation,
            StageCapture {
                url: target.url.clone(),
                method: method.to_string(),
                status: Some(status),
                headers,
                body,
                form_data: target.is_post.then(|| target.form_data.clone()),
            },
        );

        if success {
            Ok(VisitOutcome::ConfirmationSuccess)
        } else {
            record.set_reason("No confirmation message");
            Ok(VisitOutcome::Failed)
        }
    }

    /// GET with the redirect chain followed by hand, so that a Location
    /// pointing at an error page can short-circuit the whole link.
    async fn get_following(&self, start_url: &str) -> Result<Fetched> {
        let mut url = start_url.to_string();
        let mut hops = 0;

        loop {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("GET {url} failed"))?;
            let status = response.status().as_u16();
            let headers = header_map(response.headers());

            if (300..400).contains(&status) && hops < MAX_REDIRECTS {
                let location = headers.get("location").cloned().unwrap_or_default();
                if location.to_lowercase().contains("error") {
                    return Ok(Fetched::ErrorRedirect { location });
                }
                if let Some(next) = page::resolve_action(&url, &location) {
                    log::debug!("Following redirect {url} -> {next}");
                    hops += 1;
                    url = next;
                    continue;
                }
            }

            let body = response.text().await.unwrap_or_default();
            return Ok(Fetched::Response(StageResponse {
                url,
                status,
                headers,
                body,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MailMessage;
    use crate::prompt::{DenyConfirmer, ForceConfirmer};
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct NoMail;

    #[async_trait]
    impl MailProvider for NoMail {
        async fn resolve_label(&self, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn list_messages(
            &self,
            _label_id: &str,
            _page_token: Option<&str>,
        ) -> Result<(Vec<String>, Option<String>)> {
            Ok((vec![], None))
        }

        async fn get_message(&self, id: &str) -> Result<MailMessage> {
            Err(anyhow!("no such message {id}"))
        }

        async fn delete_message(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn send_message(&self, _to: &str, _subject: &str, _body: &str) -> Result<()> {
            Ok(())
        }
    }

    fn lexicon() -> Lexicon {
        Lexicon::default()
    }

    #[test]
    fn test_success_keywords_in_body() {
        let lex = lexicon();
        assert!(is_success_response(
            200,
            "<p>You have successfully unsubscribed.</p>",
            &lex,
            true
        ));
        assert!(is_success_response(
            202,
            "<p>Sie wurden abgemeldet</p>",
            &lex,
            true
        ));
        assert!(!is_success_response(
            200,
            "<p>Please confirm your choice</p>",
            &lex,
            true
        ));
    }

    #[test]
    fn test_empty_body_policy() {
        let lex = lexicon();
        assert!(is_success_response(200, "  \n ", &lex, true));
        assert!(!is_success_response(200, "  \n ", &lex, false));
        // Non-2xx empty body is never a success.
        assert!(!is_success_response(404, "", &lex, true));
    }

    #[test]
    fn test_classify_initial_dispositions() {
        let lex = lexicon();
        assert_eq!(
            classify_initial(200, "unsubscribed successfully", &lex, true),
            InitialDisposition::Success
        );
        assert_eq!(
            classify_initial(400, "bad request", &lex, true),
            InitialDisposition::Rejected
        );
        // Only 400 is terminal at this stage; a 500 still gets the form
        // and confirmation stages.
        assert_eq!(
            classify_initial(500, "oops", &lex, true),
            InitialDisposition::Continue
        );
        assert_eq!(
            classify_initial(302, "unsubscribed", &lex, true),
            InitialDisposition::Continue
        );
    }

    #[test]
    fn test_outcome_success_split() {
        assert!(VisitOutcome::InitialSuccess.is_success());
        assert!(VisitOutcome::MailtoSuccess.is_success());
        assert!(!VisitOutcome::Failed.is_success());
        assert!(!VisitOutcome::Indeterminate.is_success());
        assert!(!VisitOutcome::AlreadyVisited.is_success());
    }

    #[tokio::test]
    async fn test_cached_link_skips_http() {
        let dir = tempfile::tempdir().unwrap();
        let lex = lexicon();
        let mut cache = VisitedCache::open(dir.path().join("visited.txt")).unwrap();
        cache.record("https://news.example.com/unsub?u=1").unwrap();
        let cached_len = cache.len();

        let mut visitor =
            LinkVisitor::new(&lex, &mut cache, None::<&NoMail>, VisitOptions::new()).unwrap();
        let scored = vec![ScoredLink {
            url: "https://News.Example.com/unsub?u=1".to_string(),
            score: 0.0,
        }];
        let mut issues = IssueLog::new();
        let report = visitor
            .run(
                &scored,
                5.0,
                &HashMap::new(),
                &mut issues,
                dir.path(),
                &ForceConfirmer,
            )
            .await;

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].1, VisitOutcome::AlreadyVisited);
        assert!(report.deletable.is_empty());
        assert!(issues.is_empty());
        assert_eq!(cache.len(), cached_len);
    }

    #[tokio::test]
    async fn test_threshold_filter_rejects_without_visiting() {
        let dir = tempfile::tempdir().unwrap();
        let lex = lexicon();
        let mut cache = VisitedCache::open(dir.path().join("visited.txt")).unwrap();
        let mut visitor =
            LinkVisitor::new(&lex, &mut cache, None::<&NoMail>, VisitOptions::new()).unwrap();

        let scored = vec![
            // Above threshold.
            ScoredLink {
                url: "https://risky.example.com/unsub".to_string(),
                score: 42.0,
            },
            // Scan-failed sentinel.
            ScoredLink {
                url: "https://unknown.example.com/unsub".to_string(),
                score: crate::scan::SCAN_FAILED_SCORE,
            },
            // Not an absolute http(s) URL.
            ScoredLink {
                url: "mailto:leave@example.com".to_string(),
                score: 0.0,
            },
        ];
        let mut issues = IssueLog::new();
        let report = visitor
            .run(
                &scored,
                5.0,
                &HashMap::new(),
                &mut issues,
                dir.path(),
                &ForceConfirmer,
            )
            .await;

        assert_eq!(report.skipped, 3);
        assert!(report.outcomes.is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_declined_prompt_visits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let lex = lexicon();
        let mut cache = VisitedCache::open(dir.path().join("visited.txt")).unwrap();
        let mut visitor =
            LinkVisitor::new(&lex, &mut cache, None::<&NoMail>, VisitOptions::new()).unwrap();

        let scored = vec![ScoredLink {
            url: "https://news.example.com/unsub?u=1".to_string(),
            score: 0.0,
        }];
        let mut issues = IssueLog::new();
        let report = visitor
            .run(
                &scored,
                5.0,
                &HashMap::new(),
                &mut issues,
                dir.path(),
                &DenyConfirmer,
            )
            .await;

        assert!(report.outcomes.is_empty());
        assert_eq!(report.skipped, 0);
        assert!(report.deletable.is_empty());
        assert!(cache.is_empty());
        assert!(issues.is_empty());
    }

    #[test]
    fn test_query_form_data() {
        assert_eq!(
            query_form_data("https://a.example/unsub?u=1&list=news"),
            vec![
                ("u".to_string(), "1".to_string()),
                ("list".to_string(), "news".to_string()),
            ]
        );
        assert!(query_form_data("https://a.example/unsub").is_empty());
        assert!(query_form_data("not a url").is_empty());
    }
}
