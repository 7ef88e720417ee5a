//! Extraction of a title and description from free-form model output.
//!
//! Two strategies run in order:
//! 1. **Markers**: `Title:` / `Description:` labels, plain or emphasized
//!    (`**Title:**`, `**Title**:`), optionally behind heading hashes.
//! 2. **Positional**: when no title marker is found, the first meaningful
//!    line above any `Description:` marker is the title and the rest is the
//!    description.

use std::sync::LazyLock;

use regex::Regex;

use partgen_shared::PartGenError;

static TITLE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#*\s*(?:\*\*\s*title\s*:\s*\*\*|\*\*\s*title\s*\*\*\s*:|title\s*:)\s*(.*)$")
        .expect("valid regex")
});

static DESCRIPTION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^#*\s*(?:\*\*\s*description\s*:\s*\*\*|\*\*\s*description\s*\*\*\s*:|description\s*:)\s*(.*)$",
    )
    .expect("valid regex")
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Lines that are never part of the description body.
const NOISE_PREFIXES: &[&str] = &["#", "**", "Note:", "By ", "Error:", "The description has been"];

/// Introductory chatter some models put before the answer.
const PREAMBLE_PREFIX: &str = "Based on the inputs";

/// Mis-encoded dashes seen in model output (UTF-8 read as CP1252 / Mac Roman).
const DASH_REPAIRS: &[(&str, &str)] = &[
    ("â€“", "–"),
    ("â€”", "—"),
    ("‚Äì", "–"),
    ("‚Äî", "—"),
];

/// Which strategy produced the title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Markers,
    Positional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub title: String,
    pub description: String,
    pub strategy: ParseStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("response is empty")]
    Empty,
    #[error("no title could be recovered from the response")]
    NoTitle,
}

impl From<ParseError> for PartGenError {
    fn from(err: ParseError) -> Self {
        PartGenError::parse(err.to_string())
    }
}

/// Parse a sanitized model reply.
pub fn parse(raw: &str) -> Result<ParsedResponse, ParseError> {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(PREAMBLE_PREFIX))
        .collect();

    if lines.is_empty() {
        return Err(ParseError::Empty);
    }

    let marked = parse_markers(&lines);

    let (title, description, strategy) = match marked.title {
        Some(title) => (title, marked.description, ParseStrategy::Markers),
        None => {
            let (title, rest) = parse_positional(&lines).ok_or(ParseError::NoTitle)?;
            let description = marked.description.or(rest);
            (title, description, ParseStrategy::Positional)
        }
    };

    let title = clean(&title);
    if title.is_empty() {
        return Err(ParseError::NoTitle);
    }

    let description = description
        .map(|d| clean(&d))
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| format!("Technical details for {title}."));

    Ok(ParsedResponse {
        title,
        description,
        strategy,
    })
}

#[derive(Default)]
struct Marked {
    title: Option<String>,
    description: Option<String>,
}

fn parse_markers(lines: &[&str]) -> Marked {
    let mut title: Option<String> = None;
    let mut awaiting_title = false;
    let mut description: Vec<&str> = Vec::new();
    let mut seen_description = false;

    for &line in lines {
        if let Some(caps) = TITLE_MARKER.captures(line) {
            if title.is_none() && !awaiting_title {
                let inline = caps[1].trim();
                if inline.is_empty() {
                    awaiting_title = true;
                } else {
                    title = Some(inline.to_string());
                }
            }
            continue;
        }

        if let Some(caps) = DESCRIPTION_MARKER.captures(line) {
            if !seen_description {
                seen_description = true;
                awaiting_title = false;
                let inline = caps.get(1).map_or("", |m| m.as_str()).trim();
                if !inline.is_empty() {
                    description.push(inline);
                }
            }
            continue;
        }

        // `**Title:**` alone on its line: the title follows.
        if awaiting_title && !is_noise(line) {
            title = Some(line.to_string());
            awaiting_title = false;
            continue;
        }

        if seen_description && !is_noise(line) {
            description.push(line);
        }
    }

    Marked {
        title,
        description: (!description.is_empty()).then(|| description.join(" ")),
    }
}

fn parse_positional(lines: &[&str]) -> Option<(String, Option<String>)> {
    // Once a description marker appears, every later line is description body.
    let head = match lines.iter().position(|line| DESCRIPTION_MARKER.is_match(line)) {
        Some(end) => &lines[..end],
        None => lines,
    };
    let mut content = head.iter().copied().filter(|line| !TITLE_MARKER.is_match(line));

    let title = content.next()?.to_string();
    let rest: Vec<&str> = content.collect();
    Some((title, (!rest.is_empty()).then(|| rest.join(" "))))
}

fn is_noise(line: &str) -> bool {
    NOISE_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
}

/// Strip emphasis and heading markers, repair dashes, collapse whitespace.
fn clean(text: &str) -> String {
    let mut out = text.replace("**", "").replace("__", "").replace('*', "");
    for (broken, fixed) in DASH_REPAIRS {
        out = out.replace(broken, fixed);
    }
    let out = out.trim_start().trim_start_matches('#');
    WHITESPACE.replace_all(out, " ").trim().to_string()
}
