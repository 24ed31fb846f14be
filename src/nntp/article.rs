//! Typed records parsed from command responses
//!
//! These are the thin per-command grammar helpers: turning a status message or
//! a body into a struct, and turning an article reference into command text.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Reference to an article: a message id or a number in the selected group
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArticleId {
    /// Globally unique message id, always stored with angle brackets
    MessageId(String),
    /// Article number within the current group
    Number(u64),
}

impl ArticleId {
    /// Message id reference, adding angle brackets when missing
    pub fn message_id(id: &str) -> Self {
        let id = id.trim();
        if id.starts_with('<') {
            ArticleId::MessageId(id.to_string())
        } else {
            ArticleId::MessageId(format!("<{}>", id))
        }
    }

    /// Check a numeric reference against the selected group's range
    pub fn check_range(&self, group: Option<&GroupInfo>) -> Result<()> {
        if let (ArticleId::Number(n), Some(info)) = (self, group)
            && (*n < info.low || *n > info.high)
        {
            return Err(Error::Other(format!(
                "article number {} is not available in {} ({}-{})",
                n, info.name, info.low, info.high
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ArticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArticleId::MessageId(id) => f.write_str(id),
            ArticleId::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<u64> for ArticleId {
    fn from(n: u64) -> Self {
        ArticleId::Number(n)
    }
}

impl From<&str> for ArticleId {
    fn from(id: &str) -> Self {
        ArticleId::message_id(id)
    }
}

impl From<String> for ArticleId {
    fn from(id: String) -> Self {
        ArticleId::message_id(&id)
    }
}

/// Result of selecting a group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group name
    pub name: String,
    /// Estimated number of articles
    pub count: u64,
    /// Lowest article number
    pub low: u64,
    /// Highest article number
    pub high: u64,
}

impl GroupInfo {
    /// Parse the message of a `211 count low high name` reply
    pub fn parse(message: &str, requested: &str) -> Result<Self> {
        let mut words = message.split_whitespace();
        let mut number = |what: &str| -> Result<u64> {
            words
                .next()
                .and_then(|w| w.parse().ok())
                .ok_or_else(|| Error::Parse(format!("GROUP reply lacks {}: {:?}", what, message)))
        };

        let count = number("count")?;
        let low = number("low")?;
        let high = number("high")?;
        let name = words.next().unwrap_or(requested).to_string();

        Ok(Self {
            name,
            count,
            low,
            high,
        })
    }
}

/// One line of `LIST ACTIVE`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveGroup {
    /// Group name
    pub name: String,
    /// Highest article number
    pub high: u64,
    /// Lowest article number
    pub low: u64,
    /// Posting permitted
    pub posting: bool,
    /// Posts go through a moderator
    pub moderated: bool,
}

impl ActiveGroup {
    /// Parse `name high low flag`; lines that do not fit are skipped
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?.to_string();
        let high = parts.next()?.parse().ok()?;
        let low = parts.next()?.parse().ok()?;
        let (posting, moderated) = match parts.next() {
            Some("y") => (true, false),
            Some("m") => (true, true),
            _ => (false, false),
        };

        Some(Self {
            name,
            high,
            low,
            posting,
            moderated,
        })
    }
}

/// A column of the overview database
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverviewField {
    /// Lowercased header or metadata name
    pub name: String,
    /// Values carry a `Name:` prefix that must be stripped
    pub full: bool,
}

/// Parse `LIST OVERVIEW.FMT` lines; the article number column comes first
pub fn parse_overview_format(lines: &[String]) -> Vec<OverviewField> {
    let mut fields = vec![OverviewField {
        name: "number".to_string(),
        full: false,
    }];

    for line in lines.iter().filter(|l| !l.is_empty()) {
        let (name, flag) = line.split_once(':').unwrap_or((line.as_str(), ""));
        // `:bytes` style metadata entries have an empty name part
        let (name, flag) = if name.is_empty() {
            (flag, "")
        } else {
            (name, flag)
        };
        fields.push(OverviewField {
            name: name.to_lowercase(),
            full: flag.eq_ignore_ascii_case("full"),
        });
    }

    fields
}

/// One overview row, keyed by the overview format's column names
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverviewEntry {
    fields: HashMap<String, String>,
}

impl OverviewEntry {
    /// Parse a tab separated overview row against `format`
    pub fn parse_line(line: &str, format: &[OverviewField]) -> Self {
        let mut fields = HashMap::new();

        for (i, value) in line.split('\t').enumerate() {
            let Some(field) = format.get(i) else {
                break;
            };
            let value = if field.full {
                value
                    .split_once(':')
                    .map(|(_, rest)| rest)
                    .unwrap_or(value)
                    .trim()
            } else {
                value
            };
            fields.insert(field.name.clone(), value.to_string());
        }

        Self { fields }
    }

    /// Value of a column by its lowercased name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Article number
    pub fn number(&self) -> Option<u64> {
        self.get("number").and_then(|n| n.parse().ok())
    }
}

/// Parsed article headers, looked up case-insensitively
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Parse a header block, folding continuation lines into the previous header
    pub fn parse(block: &str) -> Self {
        let mut entries: Vec<(String, String)> = Vec::new();

        for line in block.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            if line.starts_with([' ', '\t']) || !line.contains(':') {
                if let Some((_, value)) = entries.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }

            if let Some((name, value)) = line.split_once(':') {
                entries.push((name.trim().to_lowercase(), value.trim().to_string()));
            }
        }

        Self { entries }
    }

    /// First value of a header
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Number of header lines
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True without any header
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A fetched article
#[derive(Clone, Debug, Default)]
pub struct Article {
    /// Headers, empty for a BODY fetch
    pub headers: Headers,
    /// Body bytes, empty for a HEAD fetch
    pub body: Vec<u8>,
}

impl Article {
    /// Split an `ARTICLE` response body at the first blank line
    pub fn parse(raw: &[u8]) -> Self {
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|i| (i, i + 4))
            .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|i| (i, i + 2)));

        match split {
            Some((head_end, body_start)) => Self {
                headers: Headers::parse(&String::from_utf8_lossy(&raw[..head_end])),
                body: raw[body_start..].to_vec(),
            },
            None => Self {
                headers: Headers::parse(&String::from_utf8_lossy(raw)),
                body: Vec::new(),
            },
        }
    }
}
