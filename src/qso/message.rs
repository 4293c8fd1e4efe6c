/// `message.rs` — FT8/FT4 standard message grammar
///
/// The exchange only ever uses six shapes: CQ, reply-with-grid, report,
/// roger-report, RR73, and 73. Everything else (free text, hashed calls,
/// contest exchanges) parses as `Free` and is ignored by the strategy.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedMessage {
    Cq {
        caller: String,
        grid: Option<String>,
        /// Directed CQ qualifier (`DX`, `NA`, `POTA`, ...).
        modifier: Option<String>,
    },
    Reply {
        to: String,
        from: String,
        grid: String,
    },
    Report {
        to: String,
        from: String,
        snr: i32,
    },
    RogerReport {
        to: String,
        from: String,
        snr: i32,
    },
    Rr73 {
        to: String,
        from: String,
    },
    Seventy3 {
        to: String,
        from: String,
    },
    Free(String),
}

impl ParsedMessage {
    pub fn parse(text: &str) -> ParsedMessage {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        match tokens.as_slice() {
            ["CQ", rest @ ..] => parse_cq(rest, text),
            [to, from, tail] if is_callsign(to) && is_callsign(from) => {
                let (to, from) = (to.to_string(), from.to_string());
                if *tail == "73" {
                    ParsedMessage::Seventy3 { to, from }
                } else if *tail == "RR73" || *tail == "RRR" {
                    ParsedMessage::Rr73 { to, from }
                } else if let Some(snr) = parse_roger_report(tail) {
                    ParsedMessage::RogerReport { to, from, snr }
                } else if let Some(snr) = parse_report(tail) {
                    ParsedMessage::Report { to, from, snr }
                } else if is_grid(tail) {
                    ParsedMessage::Reply {
                        to,
                        from,
                        grid: tail.to_string(),
                    }
                } else {
                    ParsedMessage::Free(text.to_string())
                }
            }
            _ => ParsedMessage::Free(text.to_string()),
        }
    }

    /// The station that transmitted this message.
    pub fn sender(&self) -> Option<&str> {
        match self {
            ParsedMessage::Cq { caller, .. } => Some(caller),
            ParsedMessage::Reply { from, .. }
            | ParsedMessage::Report { from, .. }
            | ParsedMessage::RogerReport { from, .. }
            | ParsedMessage::Rr73 { from, .. }
            | ParsedMessage::Seventy3 { from, .. } => Some(from),
            ParsedMessage::Free(_) => None,
        }
    }

    /// The station this message is directed at (None for CQ / free text).
    pub fn addressee(&self) -> Option<&str> {
        match self {
            ParsedMessage::Reply { to, .. }
            | ParsedMessage::Report { to, .. }
            | ParsedMessage::RogerReport { to, .. }
            | ParsedMessage::Rr73 { to, .. }
            | ParsedMessage::Seventy3 { to, .. } => Some(to),
            _ => None,
        }
    }
}

fn parse_cq(rest: &[&str], original: &str) -> ParsedMessage {
    match rest {
        [caller] if is_callsign(caller) => ParsedMessage::Cq {
            caller: caller.to_string(),
            grid: None,
            modifier: None,
        },
        [caller, grid] if is_callsign(caller) && is_grid(grid) => ParsedMessage::Cq {
            caller: caller.to_string(),
            grid: Some(grid.to_string()),
            modifier: None,
        },
        [modifier, caller] if is_callsign(caller) => ParsedMessage::Cq {
            caller: caller.to_string(),
            grid: None,
            modifier: Some(modifier.to_string()),
        },
        [modifier, caller, grid] if is_callsign(caller) && is_grid(grid) => ParsedMessage::Cq {
            caller: caller.to_string(),
            grid: Some(grid.to_string()),
            modifier: Some(modifier.to_string()),
        },
        _ => ParsedMessage::Free(original.to_string()),
    }
}

/// Loose callsign check: 3-11 chars, at least one digit and one letter,
/// alphanumeric plus `/` for portable suffixes.
pub fn is_callsign(token: &str) -> bool {
    let len = token.chars().count();
    if !(3..=11).contains(&len) {
        return false;
    }
    let mut has_digit = false;
    let mut has_alpha = false;
    for c in token.chars() {
        match c {
            '0'..='9' => has_digit = true,
            'A'..='Z' => has_alpha = true,
            '/' => {}
            _ => return false,
        }
    }
    has_digit && has_alpha
}

/// 4-character Maidenhead locator: two letters A-R, two digits.
pub fn is_grid(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 4
        && bytes[..2].iter().all(|b| (b'A'..=b'R').contains(b))
        && bytes[2..].iter().all(|b| b.is_ascii_digit())
}

fn parse_report(token: &str) -> Option<i32> {
    if token.len() < 2 || !token.is_ascii() {
        return None;
    }
    let (sign, digits) = token.split_at(1);
    if (sign != "+" && sign != "-") || digits.is_empty() || digits.len() > 2 {
        return None;
    }
    let value: i32 = digits.parse().ok()?;
    Some(if sign == "-" { -value } else { value })
}

fn parse_roger_report(token: &str) -> Option<i32> {
    parse_report(token.strip_prefix('R')?)
}

/// Format an SNR the way the exchange writes it: signed, two digits.
pub fn format_report(snr: i32) -> String {
    format!("{}{:02}", if snr < 0 { "-" } else { "+" }, snr.abs().min(50))
}
