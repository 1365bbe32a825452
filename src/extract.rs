use crate::mail::{MailMessage, MailProvider};
use anyhow::Result;
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Where an unsubscribe URL was discovered in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSource {
    Header,
    Body,
}

/// A URL extracted from a message that plausibly performs an unsubscribe
/// action. Immutable once created; deduplicated by exact URL at discovery.
#[derive(Debug, Clone)]
pub struct CandidateLink {
    pub url: String,
    pub message_id: String,
    pub source: LinkSource,
}

#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub candidates: Vec<CandidateLink>,
    pub scanned: usize,
}

impl ExtractionResult {
    pub fn urls(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.url.clone()).collect()
    }

    /// URL -> originating message id.
    pub fn message_index(&self) -> HashMap<String, String> {
        self.candidates
            .iter()
            .map(|c| (c.url.clone(), c.message_id.clone()))
            .collect()
    }
}

/// Walks messages in a label and pulls unsubscribe URLs, preferring the
/// structured List-Unsubscribe header over body-text matches.
pub struct LinkExtractor<'a, M: MailProvider> {
    mail: &'a M,
    bracket_re: Regex,
    body_url_re: Regex,
}

impl<'a, M: MailProvider> LinkExtractor<'a, M> {
    pub fn new(mail: &'a M) -> Self {
        Self {
            mail,
            bracket_re: Regex::new(r"<([^>]+)>").unwrap(),
            body_url_re: Regex::new(r#"(?i)https?://[^\s"'<>]*unsubscribe[^\s"'<>]*"#).unwrap(),
        }
    }

    /// Collect distinct candidate links from up to `max_messages` messages
    /// in `label`. A missing label or per-message failure is logged and
    /// yields a partial (possibly empty) result, never an error.
    pub async fn collect(&self, label: &str, max_messages: usize) -> Result<ExtractionResult> {
        let mut result = ExtractionResult::default();

        let label_id = match self.mail.resolve_label(label).await? {
            Some(id) => id,
            None => {
                log::warn!("Label '{label}' not found; nothing to scan");
                return Ok(result);
            }
        };

        log::info!("Scanning up to {max_messages} messages in label '{label}'");
        let mut seen: HashSet<String> = HashSet::new();
        let mut page_token: Option<String> = None;

        loop {
            let (ids, next) = match self.mail.list_messages(&label_id, page_token.as_deref()).await
            {
                Ok(page) => page,
                Err(e) => {
                    log::error!("Failed to list messages in '{label}': {e}");
                    break;
                }
            };

            for id in ids {
                if result.scanned >= max_messages {
                    return Ok(result);
                }
                result.scanned += 1;

                let message = match self.mail.get_message(&id).await {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("Failed to fetch message {id}: {e}");
                        continue;
                    }
                };

                log::debug!(
                    "Scanning message {} of {}: {}",
                    result.scanned,
                    max_messages,
                    message.subject()
                );

                if let Some((url, source)) = self.extract_link(&message) {
                    if seen.insert(url.clone()) {
                        result.candidates.push(CandidateLink {
                            url,
                            message_id: id,
                            source,
                        });
                    }
                }
            }

            page_token = next;
            if page_token.is_none() {
                break;
            }
        }

        Ok(result)
    }

    /// First match per message: List-Unsubscribe header, then body text.
    fn extract_link(&self, message: &MailMessage) -> Option<(String, LinkSource)> {
        if let Some(value) = message.header("List-Unsubscribe") {
            for caps in self.bracket_re.captures_iter(value) {
                let target = caps[1].trim();
                if target.starts_with("http://") || target.starts_with("https://") {
                    return Some((target.to_string(), LinkSource::Header));
                }
            }
        }

        let body = message.body_text();
        if !body.is_empty() {
            if let Some(m) = self.body_url_re.find(&body) {
                return Some((m.as_str().to_string(), LinkSource::Body));
            }
        }

        None
    }

    /// Total number of messages in a label, for the `--count` mode.
    pub async fn count_label(&self, label: &str) -> Result<usize> {
        let label_id = match self.mail.resolve_label(label).await? {
            Some(id) => id,
            None => {
                log::warn!("Label '{label}' not found");
                return Ok(0);
            }
        };

        let mut total = 0;
        let mut page_token: Option<String> = None;
        loop {
            let (ids, next) = self.mail.list_messages(&label_id, page_token.as_deref()).await?;
            total += ids.len();
            page_token = next;
            if page_token.is_none() {
                break;
            }
        }
        Ok(total)
    }

    /// (message id, subject) pairs for the `--list` mode.
    pub async fn list_label(&self, label: &str) -> Result<Vec<(String, String)>> {
        let label_id = match self.mail.resolve_label(label).await? {
            Some(id) => id,
            None => {
                log::warn!("Label '{label}' not found");
                return Ok(vec![]);
            }
        };

        let mut contents = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let (ids, next) = self.mail.list_messages(&label_id, page_token.as_deref()).await?;
            for id in ids {
                match self.mail.get_message(&id).await {
                    Ok(message) => contents.push((id, message.subject().to_string())),
                    Err(e) => log::warn!("Failed to fetch message {id}: {e}"),
                }
            }
            page_token = next;
            if page_token.is_none() {
                break;
            }
        }
        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{Header, MessagePart, PartBody};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use base64::{engine::general_purpose, Engine as _};
    use std::collections::HashMap;

    struct FakeMail {
        labels: HashMap<String, String>,
        messages: Vec<MailMessage>,
    }

    #[async_trait]
    impl MailProvider for FakeMail {
        async fn resolve_label(&self, name: &str) -> Result<Option<String>> {
            Ok(self.labels.get(&name.to_lowercase()).cloned())
        }

        async fn list_messages(
            &self,
            _label_id: &str,
            page_token: Option<&str>,
        ) -> Result<(Vec<String>, Option<String>)> {
            // Two pages so the paging loop is exercised.
            let ids: Vec<String> = self.messages.iter().map(|m| m.id.clone()).collect();
            let (first, rest) = ids.split_at(ids.len().min(2));
            match page_token {
                None if rest.is_empty() => Ok((first.to_vec(), None)),
                None => Ok((first.to_vec(), Some("page2".to_string()))),
                Some(_) => Ok((rest.to_vec(), None)),
            }
        }

        async fn get_message(&self, id: &str) -> Result<MailMessage> {
            self.messages
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| anyhow!("no such message {id}"))
        }

        async fn delete_message(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn send_message(&self, _to: &str, _subject: &str, _body: &str) -> Result<()> {
            Ok(())
        }
    }

    fn message(id: &str, unsubscribe_header: Option<&str>, body: Option<&str>) -> MailMessage {
        let mut headers = vec![Header {
            name: "Subject".to_string(),
            value: format!("subject {id}"),
        }];
        if let Some(value) = unsubscribe_header {
            headers.push(Header {
                name: "List-Unsubscribe".to_string(),
                value: value.to_string(),
            });
        }
        MailMessage {
            id: id.to_string(),
            payload: Some(MessagePart {
                headers,
                body: PartBody {
                    data: body.map(|b| general_purpose::URL_SAFE_NO_PAD.encode(b.as_bytes())),
                },
                parts: vec![],
            }),
        }
    }

    fn fake(messages: Vec<MailMessage>) -> FakeMail {
        let mut labels = HashMap::new();
        labels.insert("junk".to_string(), "Label_7".to_string());
        FakeMail { labels, messages }
    }

    #[tokio::test]
    async fn test_header_link_preferred_over_body() {
        let mail = fake(vec![message(
            "m1",
            Some("<mailto:u@example.com>, <https://example.com/unsub?id=1>"),
            Some("visit https://other.example/unsubscribe now"),
        )]);
        let result = LinkExtractor::new(&mail).collect("Junk", 10).await.unwrap();

        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].url, "https://example.com/unsub?id=1");
        assert_eq!(result.candidates[0].source, LinkSource::Header);
        assert_eq!(
            result.message_index()["https://example.com/unsub?id=1"],
            "m1"
        );
    }

    #[tokio::test]
    async fn test_body_fallback_and_dedup() {
        let mail = fake(vec![
            message("m1", None, Some("click https://example.com/unsubscribe/abc here")),
            message("m2", None, Some("again https://example.com/unsubscribe/abc here")),
            message("m3", None, Some("nothing to see")),
        ]);
        let result = LinkExtractor::new(&mail).collect("Junk", 10).await.unwrap();

        assert_eq!(result.scanned, 3);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].source, LinkSource::Body);
        // First discoverer owns the index entry.
        assert_eq!(
            result.message_index()["https://example.com/unsubscribe/abc"],
            "m1"
        );
    }

    #[tokio::test]
    async fn test_missing_label_returns_empty() {
        let mail = fake(vec![message("m1", None, Some("https://x.example/unsubscribe"))]);
        let result = LinkExtractor::new(&mail)
            .collect("NoSuchLabel", 10)
            .await
            .unwrap();
        assert_eq!(result.scanned, 0);
        assert!(result.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_max_messages_respected() {
        let mail = fake(vec![
            message("m1", None, None),
            message("m2", None, None),
            message("m3", None, None),
            message("m4", None, None),
        ]);
        let result = LinkExtractor::new(&mail).collect("Junk", 3).await.unwrap();
        assert_eq!(result.scanned, 3);
    }

    #[tokio::test]
    async fn test_count_label() {
        let mail = fake(vec![
            message("m1", None, None),
            message("m2", None, None),
            message("m3", None, None),
        ]);
        assert_eq!(LinkExtractor::new(&mail).count_label("Junk").await.unwrap(), 3);
        assert_eq!(
            LinkExtractor::new(&mail).count_label("Missing").await.unwrap(),
            0
        );
    }

    #[test]
    fn test_mailto_only_header_falls_through_to_body() {
        let mail = fake(vec![]);
        let extractor = LinkExtractor::new(&mail);
        let m = message(
            "m1",
            Some("<mailto:unsubscribe@example.com>"),
            Some("or use https://example.com/unsubscribe?u=1"),
        );
        let (url, source) = extractor.extract_link(&m).unwrap();
        assert_eq!(url, "https://example.com/unsubscribe?u=1");
        assert_eq!(source, LinkSource::Body);
    }
}
