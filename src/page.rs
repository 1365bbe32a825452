use crate::lexicon::Lexicon;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Path fragments that mark a link or form action as an unsubscribe
/// confirmation target.
pub const CONFIRMATION_PATH_KEYWORDS: [&str; 5] =
    ["/unsubscribe", "/unsub", "/optout", "/opt-out", "/remove"];

/// A form discovered on a landing page: its raw action attribute and the
/// named field values it would submit.
#[derive(Debug, Clone, PartialEq)]
pub struct FormSpec {
    pub action: Option<String>,
    pub fields: Vec<(String, String)>,
}

/// A confirmation hop discovered on a landing page.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationTarget {
    pub url: String,
    pub is_post: bool,
    pub form_data: Vec<(String, String)>,
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

/// Visible text of a page, for success-keyword matching. Plain-text bodies
/// pass through unchanged; broken markup degrades to whatever text the
/// parser recovers.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document.root_element().text().collect::<Vec<_>>().join(" ")
}

/// First mailto: address on the page, with any ?subject= suffix stripped.
pub fn find_mailto(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    for anchor in document.select(&selector("a[href]")) {
        let href = anchor.value().attr("href")?.trim();
        if let Some(rest) = href.strip_prefix("mailto:") {
            let address = rest.split('?').next().unwrap_or(rest).trim();
            if !address.is_empty() {
                return Some(address.to_string());
            }
        }
    }
    None
}

fn collect_fields(form: ElementRef) -> Vec<(String, String)> {
    let mut fields = Vec::new();

    for input in form.select(&selector("input[name]")) {
        let name = input.value().attr("name").unwrap_or("").trim();
        if !name.is_empty() {
            let value = input.value().attr("value").unwrap_or("");
            fields.push((name.to_string(), value.to_string()));
        }
    }

    for select in form.select(&selector("select[name]")) {
        let name = select.value().attr("name").unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }
        let options: Vec<ElementRef> = select.select(&selector("option")).collect();
        let chosen = options
            .iter()
            .find(|o| o.value().attr("selected").is_some())
            .or_else(|| options.first());
        let value = chosen
            .map(|o| {
                o.value()
                    .attr("value")
                    .map(str::to_string)
                    .unwrap_or_else(|| o.text().collect::<String>().trim().to_string())
            })
            .unwrap_or_default();
        fields.push((name.to_string(), value));
    }

    for textarea in form.select(&selector("textarea[name]")) {
        let name = textarea.value().attr("name").unwrap_or("").trim();
        if !name.is_empty() {
            let value = textarea.text().collect::<String>().trim().to_string();
            fields.push((name.to_string(), value));
        }
    }

    fields
}

fn form_has_intent(form: ElementRef, lexicon: &Lexicon) -> bool {
    for button in form.select(&selector("button")) {
        let label = button.text().collect::<String>();
        if lexicon.matches_intent(&label) {
            return true;
        }
        if let Some(value) = button.value().attr("value") {
            if lexicon.matches_intent(value) {
                return true;
            }
        }
    }

    for input in form.select(&selector("input")) {
        let kind = input.value().attr("type").unwrap_or("");
        if kind.eq_ignore_ascii_case("submit") || kind.eq_ignore_ascii_case("button") {
            if let Some(value) = input.value().attr("value") {
                if lexicon.matches_intent(value) {
                    return true;
                }
            }
        }
    }

    false
}

/// First form whose button or submit-input label carries unsubscribe intent.
pub fn find_unsubscribe_form(html: &str, lexicon: &Lexicon) -> Option<FormSpec> {
    let document = Html::parse_document(html);
    for form in document.select(&selector("form")) {
        if form_has_intent(form, lexicon) {
            return Some(FormSpec {
                action: form
                    .value()
                    .attr("action")
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty()),
                fields: collect_fields(form),
            });
        }
    }
    None
}

/// Resolve a form action or anchor target against the page URL. Handles
/// relative and protocol-relative values; anything that does not come out
/// as an absolute http(s) URL is None.
pub fn resolve_action(base_url: &str, action: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    let resolved = base.join(action.trim()).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

fn path_matches(target: &str) -> bool {
    let lower = target.to_lowercase();
    CONFIRMATION_PATH_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Search a working body for the confirmation hop. Forms with a matching
/// action win over submit-adjacent forms, which win over matching anchors;
/// javascript: targets are ignored.
pub fn find_confirmation(html: &str, base_url: &str) -> Option<ConfirmationTarget> {
    let document = Html::parse_document(html);

    for form in document.select(&selector("form[action]")) {
        let action = form.value().attr("action").unwrap_or("");
        if path_matches(action) {
            if let Some(url) = resolve_action(base_url, action) {
                return Some(ConfirmationTarget {
                    url,
                    is_post: true,
                    form_data: collect_fields(form),
                });
            }
        }
    }

    for form in document.select(&selector("form[action]")) {
        let has_submit = form.select(&selector("input")).any(|i| {
            i.value()
                .attr("type")
                .map(|t| t.eq_ignore_ascii_case("submit"))
                .unwrap_or(false)
        });
        if !has_submit {
            continue;
        }
        let action = form.value().attr("action").unwrap_or("");
        if action.trim().is_empty() {
            continue;
        }
        if let Some(url) = resolve_action(base_url, action) {
            return Some(ConfirmationTarget {
                url,
                is_post: true,
                form_data: collect_fields(form),
            });
        }
    }

    for anchor in document.select(&selector("a[href]")) {
        let href = anchor.value().attr("href").unwrap_or("").trim();
        if href.to_lowercase().starts_with("javascript:") {
            continue;
        }
        if path_matches(href) {
            if let Some(url) = resolve_action(base_url, href) {
                return Some(ConfirmationTarget {
                    url,
                    is_post: false,
                    form_data: vec![],
                });
            }
        }
    }

    None
}
