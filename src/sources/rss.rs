use crate::error::SourceError;
use crate::sources::scrape::{decode_entities, strip_html};
use crate::sources::{send, FeedItem, FeedSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;

pub struct RssClient {
    client: Client,
}

impl RssClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Returns the inner text of the first `<tag>` element in `block`,
/// unwrapping CDATA sections.
fn element_text<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}", tag);
    let mut search = 0;
    loop {
        let start = search + block[search..].find(&open)?;
        let after = &block[start + open.len()..];
        // <link> must not match <linkedin...>
        match after.chars().next() {
            Some('>') | Some(' ') | Some('\t') | Some('\n') | Some('\r') | Some('/') => {}
            _ => {
                search = start + open.len();
                continue;
            }
        }
        let tag_end = start + open.len() + after.find('>')?;
        if block[..tag_end].ends_with('/') {
            return None;
        }
        let content_start = tag_end + 1;
        let close = format!("</{}>", tag);
        let content_end = content_start + block[content_start..].find(&close)?;
        let inner = block[content_start..content_end].trim();
        let inner = inner
            .strip_prefix("<![CDATA[")
            .and_then(|s| s.strip_suffix("]]>"))
            .unwrap_or(inner);
        return Some(inner.trim());
    }
}

/// Atom links carry the target in an `href` attribute.
fn atom_href(block: &str) -> Option<&str> {
    let start = block.find("<link")?;
    let tag = &block[start..start + block[start..].find('>')?];
    let href = tag.find("href=")? + 5;
    let quote = tag[href..].chars().next()?;
    let value = &tag[href + 1..];
    Some(&value[..value.find(quote)?])
}

/// Accepts RFC 2822 (RSS) and RFC 3339 (Atom) timestamps.
pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let candidate = &rest[start + open.len()..];
        if !candidate.starts_with('>') && !candidate.starts_with(' ') {
            rest = candidate;
            continue;
        }
        let Some(end) = candidate.find(&close) else {
            break;
        };
        out.push(&candidate[..end]);
        rest = &candidate[end + close.len()..];
    }
    out
}

/// Parses RSS 2.0 `<item>` and Atom `<entry>` elements. Entries without a
/// title or link are skipped; descriptions are returned as plain text.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>, SourceError> {
    if !xml.contains("<rss") && !xml.contains("<feed") && !xml.contains("<rdf:RDF") {
        return Err(SourceError::Malformed("document is not an RSS or Atom feed".to_string()));
    }

    let mut entries = blocks(xml, "item");
    if entries.is_empty() {
        entries = blocks(xml, "entry");
    }

    Ok(entries
        .into_iter()
        .filter_map(|block| {
            let title = strip_html(element_text(block, "title")?);
            let link = element_text(block, "link")
                .filter(|l| !l.is_empty())
                .or_else(|| atom_href(block))
                .map(|l| decode_entities(l.trim()))?;
            if title.is_empty() || link.is_empty() {
                return None;
            }
            let description = element_text(block, "description")
                .or_else(|| element_text(block, "summary"))
                .or_else(|| element_text(block, "content"))
                .map(|d| strip_html(&decode_entities(d)))
                .unwrap_or_default();
            let published_at = element_text(block, "pubDate")
                .or_else(|| element_text(block, "published"))
                .or_else(|| element_text(block, "updated"))
                .or_else(|| element_text(block, "dc:date"))
                .and_then(parse_feed_date);
            Some(FeedItem {
                title,
                link,
                description,
                published_at,
            })
        })
        .collect())
}

#[async_trait]
impl FeedSource for RssClient {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<FeedItem>, SourceError> {
        let body = send(self.client.get(url), url).await?.text().await?;
        parse_feed(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Feed</title>
<item>
  <title><![CDATA[Bitcoin breaks $70k]]></title>
  <link>https://news.example/btc</link>
  <description><![CDATA[<p>Price <b>surged</b> overnight &amp; held.</p>]]></description>
  <pubDate>Wed, 01 May 2024 08:30:00 +0000</pubDate>
</item>
<item>
  <title>No link here</title>
  <description>dropped</description>
</item>
<item>
  <title>Undated</title>
  <link>https://news.example/undated</link>
</item>
</channel></rss>"#;

    #[test]
    fn parses_rss_items() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Bitcoin breaks $70k");
        assert_eq!(items[0].link, "https://news.example/btc");
        assert_eq!(items[0].description, "Price surged overnight & held.");
        assert_eq!(
            items[0].published_at.map(|d| d.to_rfc3339()),
            Some("2024-05-01T08:30:00+00:00".to_string())
        );
        assert_eq!(items[1].published_at, None);
    }

    #[test]
    fn parses_atom_entries() {
        let atom = r#"<feed xmlns="http://www.w3.org/2005/Atom">
<entry><title type="html">ETH upgrade</title><link href="https://a.example/eth"/>
<updated>2024-05-02T10:00:00Z</updated><summary>Dencun is live</summary></entry>
</feed>"#;
        let items = parse_feed(atom).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link, "https://a.example/eth");
        assert_eq!(items[0].description, "Dencun is live");
        assert!(items[0].published_at.is_some());
    }

    #[test]
    fn rejects_html_pages() {
        assert!(parse_feed("<html><body>nope</body></html>").is_err());
    }
}
