use url::Url;

/// Extract the host from a URL, lowercased.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .host_str()
        .map(|h| h.to_lowercase())
}

/// Reduce a host to its second-level domain (removes subdomains).
/// e.g., "email.nationalgeographic.com" -> "nationalgeographic.com"
pub fn second_level_domain(host: &str) -> String {
    let parts: Vec<&str> = host.split('.').collect();

    if parts.len() >= 2 {
        let root = format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1]);

        // Handle common two-part TLDs like .co.uk, .com.au, etc.
        if parts.len() >= 3 {
            let common_two_part_tlds = [
                "co.uk", "com.au", "co.jp", "co.kr", "com.br", "co.za", "com.mx", "co.in",
                "com.sg", "co.nz", "com.ar", "co.il", "org.uk", "net.au", "gov.uk", "ac.uk",
                "edu.au",
            ];

            if common_two_part_tlds.contains(&root.as_str()) {
                return format!(
                    "{}.{}.{}",
                    parts[parts.len() - 3],
                    parts[parts.len() - 2],
                    parts[parts.len() - 1]
                );
            }
        }

        root
    } else {
        host.to_string()
    }
}

/// Taxonomy key for a link: second-level domain of its host, or the raw
/// input when it does not parse as a URL.
pub fn taxonomy_key(url: &str) -> String {
    match host_of(url) {
        Some(host) => second_level_domain(&host),
        None => url.to_lowercase(),
    }
}

/// True when the URL is an absolute http/https URL, the only kind the
/// visitor will touch.
pub fn is_actionable(url: &str) -> bool {
    match Url::parse(url) {
        Ok(u) => matches!(u.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("https://Example.COM/path?x=1"),
            Some("example.com".to_string())
        );
        assert_eq!(host_of("not a url"), None);
        assert_eq!(host_of("mailto:user@example.com"), None);
    }

    #[test]
    fn test_second_level_domain() {
        assert_eq!(second_level_domain("example.com"), "example.com");
        assert_eq!(
            second_level_domain("email.nationalgeographic.com"),
            "nationalgeographic.com"
        );
        assert_eq!(second_level_domain("mail.example.co.uk"), "example.co.uk");
        assert_eq!(second_level_domain("single"), "single");
    }

    #[test]
    fn test_is_actionable() {
        assert!(is_actionable("https://example.com/unsubscribe"));
        assert!(is_actionable("http://example.com/u?id=1"));
        assert!(!is_actionable("mailto:list@example.com"));
        assert!(!is_actionable("/relative/unsubscribe"));
        assert!(!is_actionable("javascript:void(0)"));
    }

    #[test]
    fn test_taxonomy_key() {
        assert_eq!(
            taxonomy_key("https://news.example.com/unsub"),
            "example.com"
        );
        assert_eq!(taxonomy_key("garbage"), "garbage");
    }
}
