use url::Url;

const WWW_ALIAS: &str = "www.";

/// URL prefixes that belong to the browser or the extension itself.
/// They are never attributed to a site.
const INTERNAL_PREFIXES: &[&str] = &["chrome://", "chrome-extension://"];

/// Maps a raw URL to the domain key all accounting is attributed to.
///
/// Scheme, port, path and query are dropped and a leading `www.` is stripped.
/// Input that does not parse as a URL with a host is returned unchanged.
pub fn normalize(raw: &str) -> String {
    let host = match Url::parse(raw) {
        Ok(u) => u.host_str().map(str::to_string),
        Err(_) => None,
    };
    match host {
        Some(h) if !h.is_empty() => strip_www(&h).to_string(),
        _ => raw.to_string(),
    }
}

/// Normalizes a domain typed by the user into a settings entry
/// (`www.YouTube.com/`, `https://youtube.com/watch` and `youtube.com` all map
/// to `youtube.com`).
pub fn normalize_entry(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.contains("://") {
        return normalize(trimmed);
    }
    let host = trimmed
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(trimmed)
        .to_lowercase();
    strip_www(&host).to_string()
}

pub fn is_internal_url(url: &str, extra_internal: Option<&str>) -> bool {
    if INTERNAL_PREFIXES.iter().any(|p| url.starts_with(p)) {
        return true;
    }
    matches!(extra_internal, Some(prefix) if !prefix.is_empty() && url.starts_with(prefix))
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix(WWW_ALIAS).unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_scheme_path_query_and_www() {
        assert_eq!(normalize("https://www.example.com/a?b=1"), "example.com");
        assert_eq!(normalize("http://example.com/"), "example.com");
        assert_eq!(normalize("https://EXAMPLE.com:8443/x#frag"), "example.com");
    }

    #[test]
    fn normalize_keeps_other_subdomains() {
        assert_eq!(normalize("https://docs.rs/tokio"), "docs.rs");
        assert_eq!(normalize("https://gist.github.com/x"), "gist.github.com");
        // Only a leading alias is stripped.
        assert_eq!(normalize("https://mail.www.example.com/"), "mail.www.example.com");
    }

    #[test]
    fn normalize_falls_back_to_raw_input() {
        assert_eq!(normalize("not a url"), "not a url");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("about:blank"), "about:blank");
    }

    #[test]
    fn normalize_entry_accepts_bare_hosts() {
        assert_eq!(normalize_entry(" www.YouTube.com/ "), "youtube.com");
        assert_eq!(normalize_entry("https://www.youtube.com/watch?v=1"), "youtube.com");
        assert_eq!(normalize_entry("github.com"), "github.com");
    }

    #[test]
    fn internal_urls_are_detected() {
        assert!(is_internal_url("chrome://extensions", None));
        assert!(is_internal_url("chrome-extension://abc/popup.html", None));
        assert!(is_internal_url("moz-extension://x/blocked.html", Some("moz-extension://x/")));
        assert!(!is_internal_url("https://github.com", Some("")));
    }
}
