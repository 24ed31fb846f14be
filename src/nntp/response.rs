//! Parsed server responses and status codes

use crate::error::{Error, Result};
use regex::Regex;
use std::sync::{LazyLock, OnceLock};

/// Status codes the client reacts to
pub mod codes {
    /// Capability list follows
    pub const CAPABILITIES_FOLLOW: u16 = 101;
    /// Server date
    pub const SERVER_DATE: u16 = 111;
    /// Service available, posting allowed
    pub const POSTING_ALLOWED: u16 = 200;
    /// Service available, posting prohibited
    pub const POSTING_PROHIBITED: u16 = 201;
    /// Connection closing
    pub const CLOSING: u16 = 205;
    /// Group selected
    pub const GROUP_SELECTED: u16 = 211;
    /// Information follows
    pub const LIST_FOLLOWS: u16 = 215;
    /// Article follows
    pub const ARTICLE_FOLLOWS: u16 = 220;
    /// Headers follow
    pub const HEAD_FOLLOWS: u16 = 221;
    /// Body follows
    pub const BODY_FOLLOWS: u16 = 222;
    /// Article exists
    pub const ARTICLE_EXISTS: u16 = 223;
    /// Overview information follows
    pub const OVERVIEW_FOLLOWS: u16 = 224;
    /// Authentication accepted
    pub const AUTH_ACCEPTED: u16 = 281;
    /// Password required
    pub const PASSWORD_REQUIRED: u16 = 381;
    /// Service temporarily unavailable
    pub const SERVICE_UNAVAILABLE: u16 = 400;
    /// No such newsgroup
    pub const NO_SUCH_GROUP: u16 = 411;
    /// No such article
    pub const NO_SUCH_ARTICLE: u16 = 430;
    /// Authentication required
    pub const AUTH_REQUIRED: u16 = 480;
    /// Authentication rejected
    pub const AUTH_REJECTED: u16 = 481;
}

#[allow(clippy::expect_used)] // literal pattern
static STATUS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{3}) ([\S\s]+)$").expect("valid status line pattern"));

/// Split a status line into code and message
///
/// The line must not include its terminating CRLF. Codes outside
/// `100..=599` are rejected.
pub fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let captures = STATUS_LINE
        .captures(line)
        .ok_or_else(|| Error::Parse(format!("malformed status line: {:?}", line)))?;

    let code: u16 = captures[1]
        .parse()
        .map_err(|_| Error::Parse(format!("bad status code in {:?}", line)))?;

    if !(100..600).contains(&code) {
        return Err(Error::Parse(format!("status code {} out of range", code)));
    }

    Ok((code, captures[2].to_string()))
}

/// One complete server response
#[derive(Debug)]
pub struct Response {
    code: u16,
    message: String,
    body: Vec<u8>,
    lines: OnceLock<Vec<String>>,
}

impl Response {
    /// Assemble a response from its parts
    pub fn new(code: u16, message: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            code,
            message: message.into(),
            body,
            lines: OnceLock::new(),
        }
    }

    /// Three digit status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Status message, without the code
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Unstuffed body bytes; empty for single-line responses
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take ownership of the body
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Body split into lines, computed on first use
    pub fn lines(&self) -> &[String] {
        self.lines.get_or_init(|| {
            if self.body.is_empty() {
                return Vec::new();
            }
            String::from_utf8_lossy(&self.body)
                .split('\n')
                .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
                .collect()
        })
    }

    /// Whitespace separated words of the status message
    pub fn message_words(&self) -> Vec<&str> {
        self.message.split_whitespace().collect()
    }
}
