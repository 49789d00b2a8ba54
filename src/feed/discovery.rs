//! Scanning HTML pages for feed and icon `<link>` tags.
//!
//! Uses simple string scanning (no HTML parser dependency). Attribute order
//! and quoting style do not matter; relative URLs are resolved against the
//! page URL.

/// True if the response looks like an HTML page rather than a feed document.
pub fn looks_like_html(content_type: &str, body: &[u8]) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("text/html") || content_type.contains("application/xhtml") {
        return true;
    }
    let head = &body[..body.len().min(1024)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    head.contains("<!doctype html") || head.contains("<html")
}

/// Finds the first `<link rel="alternate">` with an RSS or Atom type.
pub fn find_feed_link_in_html(html: &str, base_url: &str) -> Option<String> {
    link_tags(html)
        .find(|tag| has_rel(tag, "alternate") && is_feed_type(tag))
        .and_then(|tag| extract_attr_value(tag, "href"))
        .map(|href| resolve_url(href, base_url))
}

/// Finds the best icon declared by the page.
///
/// Prefers `rel="icon"` / `rel="shortcut icon"`, then falls back to
/// `apple-touch-icon`.
pub fn find_icon_link_in_html(html: &str, base_url: &str) -> Option<String> {
    let mut touch_icon = None;
    for tag in link_tags(html) {
        let Some(href) = extract_attr_value(tag, "href") else {
            continue;
        };
        if has_rel(tag, "icon") {
            return Some(resolve_url(href, base_url));
        }
        if touch_icon.is_none()
            && (has_rel(tag, "apple-touch-icon") || has_rel(tag, "apple-touch-icon-precomposed"))
        {
            touch_icon = Some(resolve_url(href, base_url));
        }
    }
    touch_icon
}

/// `/favicon.ico` at the origin of `url`.
pub fn favicon_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.join("/favicon.ico").ok().map(|u| u.to_string())
}

/// Iterates the original-case text of every `<link ...>` tag.
fn link_tags(html: &str) -> impl Iterator<Item = &str> {
    let lower = html.to_ascii_lowercase();
    let mut tags = Vec::new();
    let mut search_from = 0;

    while let Some(link_start) = lower[search_from..].find("<link") {
        let abs_start = search_from + link_start;
        let Some(tag_end) = lower[abs_start..].find('>') else {
            break;
        };
        tags.push(&html[abs_start..=abs_start + tag_end]);
        search_from = abs_start + tag_end + 1;
    }

    tags.into_iter()
}

/// Checks whether the space-separated `rel` attribute contains `token`.
fn has_rel(tag: &str, token: &str) -> bool {
    extract_attr_value(tag, "rel").is_some_and(|rel| {
        rel.split_ascii_whitespace()
            .any(|t| t.eq_ignore_ascii_case(token))
    })
}

/// Checks if a `<link>` tag has an RSS or Atom feed type.
fn is_feed_type(tag: &str) -> bool {
    extract_attr_value(tag, "type").is_some_and(|t| {
        let t = t.to_ascii_lowercase();
        t.contains("application/rss+xml") || t.contains("application/atom+xml")
    })
}

/// Extracts the value of an attribute from a tag string (case-preserving).
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_ascii_lowercase();
    let attr_prefix = format!("{attr_name}=");

    // Require a whitespace boundary so `href=` does not match inside `data-href=`
    let mut from = 0;
    let attr_start = loop {
        let pos = from + tag_lower[from..].find(&attr_prefix)?;
        if pos > 0 && tag_lower.as_bytes()[pos - 1].is_ascii_whitespace() {
            break pos;
        }
        from = pos + attr_prefix.len();
    };
    let value_start = attr_start + attr_prefix.len();

    if value_start >= tag.len() {
        return None;
    }

    let rest = &tag[value_start..];
    let quote = rest.as_bytes().first()?;

    if *quote != b'"' && *quote != b'\'' {
        // Unquoted value runs until whitespace or the end of the tag
        let end = rest
            .find(|c: char| c.is_ascii_whitespace() || c == '>')
            .unwrap_or(rest.len());
        return Some(rest[..end].trim_end_matches('/')).filter(|v| !v.is_empty());
    }

    let quote_char = *quote as char;
    let inner = &rest[1..];
    let end = inner.find(quote_char)?;

    Some(&inner[..end])
}

/// Resolves a potentially relative URL against a base URL.
pub fn resolve_url(href: &str, base_url: &str) -> String {
    let href = href.trim();

    // Already absolute
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_owned();
    }

    // Protocol-relative: use URL parser to normalize and prevent credential injection
    if href.starts_with("//") {
        let with_scheme = format!("https:{}", href);
        if let Ok(parsed) = url::Url::parse(&with_scheme) {
            return parsed.to_string();
        }
    }

    // Relative URL: resolve against base
    if let Ok(base) = url::Url::parse(base_url) {
        if let Ok(resolved) = base.join(href) {
            return resolved.to_string();
        }
    }

    // Fallback: return as-is
    href.to_owned()
}
