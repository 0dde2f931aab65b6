//! Response normalization
//!
//! Turns text scraped from the chat transcript into clean Markdown. The steps
//! run in a fixed order:
//!
//! 1. decode HTML entities (one level) and drop any reference that survives
//! 2. strip citation markers
//! 3. remove UI chrome (speaker label, trailing "Edit in a page", CRLF, trailing spaces)
//! 4. break flattened text apart: inline headings, rules and runs of list items
//!    (`intro - one - two`) move onto their own lines
//! 5. collapse blank-line runs to a single blank line
//! 6. headings and rules: blank line around them, one space after a heading marker
//! 7. list items: one space after the marker
//!
//! Code blocks and inline code are left alone by steps 2, 4, 6 and 7. Numeric
//! references only count as citations when they do not follow a word, so
//! `arr[0]` survives. The whole
//! pipeline is repeated until it reaches a fixed point, which makes
//! [`normalize`] idempotent.

mod entities;
#[cfg(test)]
mod proptests;

pub use entities::decode_entities;

use pulldown_cmark::{Event, Parser, Tag};
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

/// Upper bound on pipeline repetitions; real input settles in two or three.
const MAX_PASSES: usize = 16;

static RESIDUAL_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z][A-Za-z0-9]{1,31});")
        .expect("valid regex")
});

static CITATION_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[_\{\{\{CITATION\{\{\{_?\d+\{\]\([^)]*\)").expect("valid regex")
});

static NUMERIC_CITATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[ \t]*\[\^?\d{1,3}(?:[ \t]*,[ \t]*\^?\d{1,3})*\]").expect("valid regex")
});

static INLINE_RULE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(^|[ \t])-{3,}[ \t]+(#{1,6}[ \t]+\S)").expect("valid regex")
});

static TRAILING_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)([^\s-])[ \t]+-{3,}[ \t]*$").expect("valid regex"));

static INLINE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^\s#])[ \t]+(#{1,6}[ \t]+[^\s\d#])").expect("valid regex")
});

static INLINE_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+([-•])[ \t]+").expect("valid regex"));

static INLINE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+(\d{1,3}\.)[ \t]+").expect("valid regex"));

static RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ \t]*-{3,}[ \t]*$").expect("valid regex"));

static SOURCE_MARK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"【[^】\n]*】").expect("valid regex"));

static SPEAKER_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\A\s*copilot\s+said\s*:?\s*").expect("valid regex"));

static EDIT_AFFORDANCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*edit\s+in\s+a\s+page\s*\z").expect("valid regex"));

static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})[ \t]+(\S.*)$").expect("valid regex"));

static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([ \t]*)([-*+•]|\d{1,9}[.)])[ \t]+(\S.*)$").expect("valid regex")
});

/// Normalizes a captured response into Markdown.
pub fn normalize(raw: &str) -> String {
    let mut current = pass(raw);
    for _ in 0..MAX_PASSES {
        let next = pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
    tracing::debug!("Normalization did not settle; returning last pass");
    current
}

fn pass(text: &str) -> String {
    let text = strip_entities(text);
    let text = map_outside_code(&text, false, strip_citations);
    let text = strip_chrome(&text);
    let text = map_outside_code(&text, false, break_flattened);
    let text = collapse_blank_lines(&text);
    reflow_blocks(&text)
}

fn strip_entities(text: &str) -> String {
    let mut text = decode_entities(text);
    // Removing one reference can join its neighbours into another
    while RESIDUAL_ENTITY.is_match(&text) {
        text = RESIDUAL_ENTITY.replace_all(&text, "").into_owned();
    }
    text
}

fn strip_citations(segment: &str) -> String {
    let mut text = segment.to_string();
    loop {
        let next = SOURCE_MARK
            .replace_all(&CITATION_TOKEN.replace_all(&text, ""), "")
            .into_owned();
        let next = strip_numeric_refs(&next);
        if next == text {
            return text;
        }
        text = next;
    }
}

/// `[1]`, `[1, 2]`, `[^3]` in citation position.
///
/// Skips link text (`[1](...)`), footnote definitions (`[^1]:`) and indexing
/// such as `arr[0]` or `m[1][2]`. Footnote references (`word[^3]`) and a
/// reference chained onto one just removed (`[1][2]`) are still citations.
fn strip_numeric_refs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in NUMERIC_CITATION.find_iter(text) {
        if text[m.end()..].starts_with(['(', ':']) {
            continue;
        }
        let chained = last > 0 && last == m.start();
        let spaced = m.as_str().starts_with([' ', '\t']);
        let footnote = m.as_str().contains('^');
        if !chained && !spaced && !footnote && follows_word(&text[..m.start()]) {
            continue;
        }
        out.push_str(&text[last..m.start()]);
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

fn follows_word(before: &str) -> bool {
    before
        .chars()
        .next_back()
        .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == ']')
}

fn strip_chrome(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut text = unified
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    loop {
        let stripped = EDIT_AFFORDANCE
            .replace(&SPEAKER_LABEL.replace(&text, ""), "")
            .into_owned();
        if stripped == text {
            return text;
        }
        text = stripped;
    }
}

/// Undoes the flattening of rendered Markdown into running text.
fn break_flattened(segment: &str) -> String {
    let text = INLINE_RULE_HEADING.replace_all(segment, "$1---\n\n$2");
    let text = TRAILING_RULE.replace_all(&text, "$1\n\n---");
    let text = INLINE_HEADING.replace_all(&text, "$1\n\n$2");
    text.split('\n')
        .map(|line| {
            let line = break_items(line, &INLINE_BULLET);
            line.split('\n')
                .map(|part| break_items(part, &INLINE_NUMBER))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Puts each item of an inline run (two or more markers after some text) on its own line.
fn break_items(line: &str, marker: &Regex) -> String {
    let items: Vec<(Range<usize>, &str)> = marker
        .captures_iter(line)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let before = line[..whole.start()].chars().next_back();
            let after = line[whole.end()..].chars().next();
            let inline = before.is_some_and(|c| !c.is_whitespace() && c != '-')
                && after.is_some_and(|c| !c.is_whitespace());
            inline.then(|| (whole.range(), caps.get(1).map_or("", |m| m.as_str())))
        })
        .collect();
    if items.len() < 2 {
        return line.to_string();
    }

    let mut out = String::with_capacity(line.len() + items.len());
    let mut last = 0;
    for (range, bullet) in items {
        out.push_str(&line[last..range.start]);
        out.push('\n');
        out.push_str(bullet);
        out.push(' ');
        last = range.end;
    }
    out.push_str(&line[last..]);
    out
}

fn collapse_blank_lines(text: &str) -> String {
    BLANK_RUN.replace_all(text, "\n\n").trim().to_string()
}

fn reflow_blocks(text: &str) -> String {
    let protected = code_ranges(text, true);
    let mut out: Vec<String> = Vec::new();
    let mut offset = 0;
    let mut after_rule = false;

    for line in text.split('\n') {
        let start = offset;
        offset += line.len() + 1;
        if std::mem::take(&mut after_rule) && !line.is_empty() {
            out.push(String::new());
        }

        if protected.iter().any(|range| range.contains(&start)) {
            out.push(line.to_string());
        } else if RULE.is_match(line) {
            if out.last().is_some_and(|prev| !prev.is_empty()) {
                out.push(String::new());
            }
            out.push("---".to_string());
            after_rule = true;
        } else if let Some(caps) = HEADING.captures(line) {
            if out.last().is_some_and(|prev| !prev.is_empty()) {
                out.push(String::new());
            }
            out.push(format!("{} {}", &caps[1], &caps[2]));
        } else if let Some(caps) = LIST_ITEM.captures(line) {
            out.push(format!("{}{} {}", &caps[1], &caps[2], &caps[3]));
        } else {
            out.push(line.to_string());
        }
    }

    out.join("\n")
}

/// Byte ranges of code blocks (and inline code unless `blocks_only`)
fn code_ranges(text: &str, blocks_only: bool) -> Vec<Range<usize>> {
    Parser::new(text)
        .into_offset_iter()
        .filter_map(|(event, range)| match event {
            Event::Start(Tag::CodeBlock(_)) => Some(range),
            Event::Code(_) if !blocks_only => Some(range),
            _ => None,
        })
        .collect()
}

/// Applies `f` to every stretch of `text` outside code
fn map_outside_code(text: &str, blocks_only: bool, f: impl Fn(&str) -> String) -> String {
    let ranges = code_ranges(text, blocks_only);
    if ranges.is_empty() {
        return f(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for range in ranges {
        if range.start < cursor {
            continue;
        }
        out.push_str(&f(&text[cursor..range.start]));
        out.push_str(&text[range.clone()]);
        cursor = range.end;
    }
    out.push_str(&f(&text[cursor..]));
    out
}
