use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use std::time::Duration;

const GMAIL_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// A single message header.
#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    pub data: Option<String>,
}

/// One MIME part; multipart messages nest parts recursively.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: PartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailMessage {
    pub id: String,
    pub payload: Option<MessagePart>,
}

impl MailMessage {
    /// Case-insensitive header lookup on the top-level part.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload.as_ref()?.headers.iter().find_map(|h| {
            if h.name.eq_ignore_ascii_case(name) {
                Some(h.value.as_str())
            } else {
                None
            }
        })
    }

    pub fn subject(&self) -> &str {
        self.header("Subject").unwrap_or("(No Subject)")
    }

    /// Concatenated decoded text of every part, walking multipart segments
    /// recursively. Undecodable segments are skipped.
    pub fn body_text(&self) -> String {
        let mut out = String::new();
        if let Some(payload) = &self.payload {
            collect_body(payload, &mut out);
        }
        out
    }
}

fn collect_body(part: &MessagePart, out: &mut String) {
    if let Some(data) = &part.body.data {
        if let Some(text) = decode_base64url(data) {
            out.push_str(&text);
        }
    }
    for sub in &part.parts {
        collect_body(sub, out);
    }
}

/// Gmail part data is base64url, with or without padding.
fn decode_base64url(data: &str) -> Option<String> {
    let trimmed = data.trim_end_matches('=');
    let bytes = general_purpose::URL_SAFE_NO_PAD.decode(trimmed).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// The mail-store capabilities the pipeline consumes. Authentication and
/// token refresh live outside this crate; implementations get a ready
/// credential.
#[async_trait]
pub trait MailProvider {
    async fn resolve_label(&self, name: &str) -> Result<Option<String>>;

    /// One page of message ids in a label, plus the next page token.
    async fn list_messages(
        &self,
        label_id: &str,
        page_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)>;

    async fn get_message(&self, id: &str) -> Result<MailMessage>;

    async fn delete_message(&self, id: &str) -> Result<()>;

    async fn send_message(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<LabelInfo>,
}

#[derive(Debug, Deserialize)]
struct LabelInfo {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// Gmail REST v1 client over a caller-supplied OAuth bearer token.
pub struct GmailClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl GmailClient {
    pub fn new(token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("unsub-pilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build mail HTTP client")?;

        Ok(Self {
            client,
            token: token.to_string(),
            base_url: GMAIL_BASE.to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("mail request failed: GET {path}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "mail provider returned {} for GET {path}",
                response.status()
            ));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to decode mail response for GET {path}"))
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn resolve_label(&self, name: &str) -> Result<Option<String>> {
        let list: LabelList = self.get_json("/labels").await?;
        Ok(list
            .labels
            .into_iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
            .map(|l| l.id))
    }

    async fn list_messages(
        &self,
        label_id: &str,
        page_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let mut path = format!("/messages?labelIds={label_id}&maxResults=100");
        if let Some(token) = page_token {
            path.push_str(&format!("&pageToken={token}"));
        }
        let list: MessageList = self.get_json(&path).await?;
        let ids = list.messages.into_iter().map(|m| m.id).collect();
        Ok((ids, list.next_page_token))
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage> {
        self.get_json(&format!("/messages/{id}?format=full")).await
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        let url = format!("{}/messages/{id}", self.base_url);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("failed to delete message {id}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "mail provider returned {} deleting message {id}",
                response.status()
            ));
        }
        Ok(())
    }

    async fn send_message(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let rfc822 = format!("To: {to}\r\nSubject: {subject}\r\n\r\n{body}");
        let raw = general_purpose::URL_SAFE_NO_PAD.encode(rfc822.as_bytes());

        let url = format!("{}/messages/send", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await
            .with_context(|| format!("failed to send message to {to}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "mail provider returned {} sending message to {to}",
                response.status()
            ));
        }
        log::info!("Sent \"{subject}\" to {to}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(data: Option<&str>, parts: Vec<MessagePart>) -> MessagePart {
        MessagePart {
            headers: vec![],
            body: PartBody {
                data: data.map(str::to_string),
            },
            parts,
        }
    }

    fn b64(text: &str) -> String {
        general_purpose::URL_SAFE_NO_PAD.encode(text.as_bytes())
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let message = MailMessage {
            id: "m1".to_string(),
            payload: Some(MessagePart {
                headers: vec![Header {
                    name: "List-Unsubscribe".to_string(),
                    value: "<https://example.com/u>".to_string(),
                }],
                body: PartBody::default(),
                parts: vec![],
            }),
        };
        assert_eq!(
            message.header("list-unsubscribe"),
            Some("<https://example.com/u>")
        );
        assert_eq!(message.header("Reply-To"), None);
    }

    #[test]
    fn test_body_text_recurses_multipart() {
        let message = MailMessage {
            id: "m1".to_string(),
            payload: Some(part(
                None,
                vec![
                    part(Some(&b64("plain text; ")), vec![]),
                    part(None, vec![part(Some(&b64("nested html")), vec![])]),
                ],
            )),
        };
        assert_eq!(message.body_text(), "plain text; nested html");
    }

    #[test]
    fn test_body_text_tolerates_bad_base64() {
        let message = MailMessage {
            id: "m1".to_string(),
            payload: Some(part(Some("!!not base64!!"), vec![])),
        };
        assert_eq!(message.body_text(), "");
    }

    #[test]
    fn test_decode_handles_padding() {
        let padded = general_purpose::URL_SAFE.encode("hi there".as_bytes());
        assert_eq!(decode_base64url(&padded), Some("hi there".to_string()));
    }
}
