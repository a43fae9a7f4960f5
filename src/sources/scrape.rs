use crate::error::SourceError;
use crate::sources::{send, ArticleScraper};
use crate::utils::utils::truncate_chars;
use async_trait::async_trait;
use reqwest::Client;

/// Article bodies are cut to this many characters before prompting.
pub const MAX_BODY_CHARS: usize = 3000;

/// Decodes the handful of entities that show up in news markup.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let Some(end) = tail.find(';').filter(|&e| e <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" | "#39" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Removes markup and collapses whitespace.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    decode_entities(&text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_paragraph_open(tail: &str) -> bool {
    let bytes = tail.as_bytes();
    bytes.len() > 2
        && bytes[0] == b'<'
        && (bytes[1] == b'p' || bytes[1] == b'P')
        && (bytes[2] == b'>' || bytes[2].is_ascii_whitespace())
}

/// Joins the text of every `<p>` element with newlines.
pub fn extract_paragraphs(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut paragraphs = Vec::new();
    let mut cursor = 0;

    while let Some(found) = lower[cursor..].find("<p") {
        let start = cursor + found;
        if !is_paragraph_open(&lower[start..]) {
            cursor = start + 2;
            continue;
        }
        let Some(open_end) = lower[start..].find('>').map(|i| start + i + 1) else {
            break;
        };
        let close = lower[open_end..]
            .find("</p>")
            .map(|i| open_end + i)
            .unwrap_or(html.len());
        let text = strip_html(&html[open_end..close]);
        if !text.is_empty() {
            paragraphs.push(text);
        }
        cursor = (close + 4).min(html.len());
    }
    paragraphs.join("\n")
}

/// Fetches pages with the shared client and keeps the paragraph text.
pub struct HttpScraper {
    client: Client,
}

impl HttpScraper {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArticleScraper for HttpScraper {
    async fn body_text(&self, url: &str) -> Result<String, SourceError> {
        let html = send(self.client.get(url), "article").await?.text().await?;
        let text = extract_paragraphs(&html);
        if text.trim().is_empty() {
            return Err(SourceError::Empty(url.to_string()));
        }
        Ok(truncate_chars(&text, MAX_BODY_CHARS).to_string())
    }
}
