use anyhow::Result;
use feed_rs::parser;
use sha2::{Digest, Sha256};

/// A feed document reduced to what the store persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    /// Website the feed belongs to (first non-`self` link)
    pub site_url: Option<String>,
    /// Icon or logo declared by the feed itself
    pub icon_url: Option<String>,
    pub articles: Vec<ParsedArticle>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArticle {
    pub guid: String,
    pub title: String,
    pub url: Option<String>,
    pub published: Option<i64>,
    pub summary: Option<String>,
}

pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed> {
    let feed = parser::parse(bytes)?;

    let title = feed
        .title
        .map(|t| t.content.trim().to_owned())
        .filter(|t| !t.is_empty());
    let site_url = feed
        .links
        .iter()
        .find(|link| link.rel.as_deref() != Some("self"))
        .map(|link| link.href.clone());
    let icon_url = feed
        .icon
        .or(feed.logo)
        .map(|image| image.uri)
        .filter(|uri| !uri.trim().is_empty());

    let articles: Vec<ParsedArticle> = feed
        .entries
        .into_iter()
        .map(|entry| {
            let url = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let guid = generate_guid(existing_id, url.as_deref(), &title, published);

            ParsedArticle {
                guid,
                title,
                url,
                published,
                summary,
            }
        })
        .collect();

    Ok(ParsedFeed {
        title,
        site_url,
        icon_url,
        articles,
    })
}

fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
