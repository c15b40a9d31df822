use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::de::{from_str, DeError};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FeedEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    #[serde(rename = "pubDate")]
    pub pub_date: Option<String>,
    pub description: Option<String>,
}

/// The document as a whole could not be read as a feed.
#[derive(Debug, Error)]
pub(crate) enum FeedError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("document has no rss/channel element")]
    MissingChannel,
}

/// Split a feed into its `rss/channel/item` elements and deserialize each one on its
/// own, so a malformed item only costs that item. Only a document that is not XML, or
/// has no `rss/channel`, is an error for the whole feed.
pub(crate) fn parse_feed(xml: &str) -> Result<Vec<Result<FeedEntry, DeError>>, FeedError> {
    let xml = scrub_html_entities_for_xml(xml);
    let mut reader = Reader::from_str(&xml);
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut saw_channel = false;
    let mut items = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"item" && in_channel(&path) {
                    let inner = reader.read_text(e.name())?;
                    items.push(from_str::<FeedEntry>(&format!("<item>{inner}</item>")));
                    continue;
                }
                if name == b"channel" && is_root(&path) {
                    saw_channel = true;
                }
                path.push(name);
            }
            Event::Empty(e) => match e.local_name().as_ref() {
                b"item" if in_channel(&path) => items.push(Ok(FeedEntry::default())),
                b"channel" if is_root(&path) => saw_channel = true,
                _ => {}
            },
            Event::End(_) => {
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_channel {
        return Err(FeedError::MissingChannel);
    }
    Ok(items)
}

fn is_root(path: &[Vec<u8>]) -> bool {
    matches!(path, [root] if root.as_slice() == b"rss")
}

fn in_channel(path: &[Vec<u8>]) -> bool {
    matches!(path, [root, channel] if root.as_slice() == b"rss" && channel.as_slice() == b"channel")
}

/// RFC 2822 feed dates become RFC 3339; anything else is kept as published upstream.
pub(crate) fn normalize_pub_date(raw: &str) -> String {
    let raw = raw.trim();
    match DateTime::parse_from_rfc2822(raw) {
        Ok(dt) => dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true),
        Err(_) => raw.to_string(),
    }
}

// HTML named entities that feeds emit but XML does not define.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
