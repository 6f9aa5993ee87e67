use std::collections::BTreeSet;
use std::ops::Range;

use serde::Serialize;

pub const CITATION_PREFIX: &str = "citar ";
pub const URL_FIELD: &str = "url";
pub const ARCHIVE_URL_FIELD: &str = "arquivourl";
pub const ARCHIVE_TIMESTAMP_FIELD: &str = "wayb";
pub const DEAD_LINK_FIELD: &str = "urlmorta";
pub const DEAD_LINK_VALUE: &str = "sim";

/// Template parameters keyed by lower-cased, trimmed name, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = normalize_key(key);
        self.entries
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets a field, keeping its position when it already exists.
    pub fn insert(&mut self, key: &str, value: &str) -> Option<String> {
        let key = normalize_key(key);
        let value = value.trim().to_string();
        match self.entries.iter_mut().find(|(name, _)| *name == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let key = normalize_key(key);
        let index = self.entries.iter().position(|(name, _)| *name == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitationTemplate {
    pub name: String,
    pub fields: FieldMap,
    /// Byte range of the whole `{{...}}` node in the text it was parsed from.
    pub span: Range<usize>,
}

impl CitationTemplate {
    pub fn is_citation(&self) -> bool {
        self.name.trim().to_lowercase().starts_with(CITATION_PREFIX)
    }

    /// The `url` field, when present and not blank.
    pub fn url(&self) -> Option<&str> {
        self.fields
            .get(URL_FIELD)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn has_archive(&self) -> bool {
        self.fields.contains(ARCHIVE_URL_FIELD) || self.fields.contains(ARCHIVE_TIMESTAMP_FIELD)
    }

    pub fn to_wikitext(&self) -> String {
        build(&self.name, &self.fields)
    }
}

/// All citation templates in `wikitext`, nested ones included, in source order.
pub fn extract(wikitext: &str) -> Vec<CitationTemplate> {
    scan_templates(wikitext)
        .into_iter()
        .filter_map(|span| parse_span(wikitext, span))
        .filter(CitationTemplate::is_citation)
        .collect()
}

pub fn has_citations(wikitext: &str) -> bool {
    extract(wikitext)
        .iter()
        .any(|template| template.url().is_some())
}

/// Parses one complete `{{...}}` node. Returns `None` when `raw` is not exactly one template.
pub fn parse(raw: &str) -> Option<CitationTemplate> {
    let trimmed = raw.trim();
    let whole = 0..trimmed.len();
    if !scan_templates(trimmed).contains(&whole) {
        return None;
    }
    parse_span(trimmed, whole)
}

/// Field map of one complete template.
pub fn parse_fields(raw: &str) -> Option<FieldMap> {
    parse(raw).map(|template| template.fields)
}

pub fn build(name: &str, fields: &FieldMap) -> String {
    let mut output = format!("{{{{{}", name.trim());
    for (key, value) in fields.iter() {
        output.push('|');
        output.push_str(key);
        output.push('=');
        output.push_str(value);
    }
    output.push_str("}}");
    output
}

/// Bracketed external links and free `http(s)://` URLs anywhere in `text`.
pub fn extract_external_links(text: &str) -> BTreeSet<String> {
    let mut urls = BTreeSet::new();
    let bytes = text.as_bytes();

    let mut cursor = 0usize;
    while let Some(offset) = text[cursor..].find('[') {
        let open = cursor + offset;
        cursor = open + 1;
        if bytes.get(open + 1) == Some(&b'[') {
            cursor = open + 2;
            continue;
        }
        let rest = &text[open + 1..];
        if starts_with_scheme(rest) || rest.starts_with("//") {
            let end = rest
                .find(|ch: char| ch.is_whitespace() || ch == ']')
                .unwrap_or(rest.len());
            let url = rest[..end].trim();
            if url.len() > 2 {
                urls.insert(url.to_string());
            }
        }
    }

    for scheme in ["http://", "https://"] {
        let mut cursor = 0usize;
        while let Some(offset) = text[cursor..].find(scheme) {
            let start = cursor + offset;
            let rest = &text[start..];
            let end = rest
                .find(|ch: char| {
                    ch.is_whitespace() || matches!(ch, ']' | '[' | '|' | '}' | '{' | '<' | '>' | '"')
                })
                .unwrap_or(rest.len());
            let url = rest[..end].trim_end_matches(['.', ',', ';', ':', '!', '?', ')', '\'']);
            if url.len() > scheme.len() {
                urls.insert(url.to_string());
            }
            cursor = start + scheme.len();
        }
    }

    urls
}

fn starts_with_scheme(value: &str) -> bool {
    let lower = value
        .get(..8)
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| value.to_ascii_lowercase());
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

fn parse_span(text: &str, span: Range<usize>) -> Option<CitationTemplate> {
    let raw = text.get(span.clone())?;
    let inner = raw.strip_prefix("{{")?.strip_suffix("}}")?;
    let parts = split_top_level(inner, b'|');
    let (name, params) = parts.split_first()?;
    let name = strip_comments(name).trim().to_string();
    if name.is_empty() {
        return None;
    }

    let mut fields = FieldMap::new();
    let mut positional = 0usize;
    for param in params {
        match split_top_level(param, b'=').split_first() {
            Some((key, rest)) if !rest.is_empty() => {
                let value = &param[key.len() + 1..];
                fields.insert(key, value);
            }
            _ => {
                positional += 1;
                fields.insert(&positional.to_string(), param);
            }
        }
    }

    Some(CitationTemplate { name, fields, span })
}

enum Open {
    Template(usize),
    Parameter,
}

/// Byte ranges of every `{{...}}` node, sorted by start offset. Unterminated nodes are dropped.
fn scan_templates(text: &str) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let lower = text.to_ascii_lowercase();
    let mut stack: Vec<Open> = Vec::new();
    let mut spans = Vec::new();
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        if let Some(end) = skip_unparsed(&lower, cursor) {
            cursor = end;
            continue;
        }
        let rest = &bytes[cursor..];
        if rest.starts_with(b"{{{") {
            stack.push(Open::Parameter);
            cursor += 3;
            continue;
        }
        if rest.starts_with(b"{{") {
            stack.push(Open::Template(cursor));
            cursor += 2;
            continue;
        }
        if rest.starts_with(b"}}") {
            match stack.last() {
                Some(Open::Parameter) if rest.starts_with(b"}}}") => {
                    stack.pop();
                    cursor += 3;
                }
                Some(Open::Parameter) => {
                    // malformed parameter; let the enclosing template close here
                    stack.pop();
                }
                Some(Open::Template(start)) => {
                    spans.push(*start..cursor + 2);
                    stack.pop();
                    cursor += 2;
                }
                None => cursor += 2,
            }
            continue;
        }
        cursor += 1;
    }

    spans.sort_by_key(|span| span.start);
    spans
}

/// Splits on `delimiter` where it is not nested in braces, wikilinks, comments or unparsed tags.
fn split_top_level(text: &str, delimiter: u8) -> Vec<&str> {
    let bytes = text.as_bytes();
    let lower = text.to_ascii_lowercase();
    let mut parts = Vec::new();
    let mut brace_depth = 0usize;
    let mut link_depth = 0usize;
    let mut segment_start = 0usize;
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        if let Some(end) = skip_unparsed(&lower, cursor) {
            cursor = end;
            continue;
        }
        let rest = &bytes[cursor..];
        if rest.starts_with(b"[[") {
            link_depth += 1;
            cursor += 2;
            continue;
        }
        if rest.starts_with(b"]]") && link_depth > 0 {
            link_depth -= 1;
            cursor += 2;
            continue;
        }
        match bytes[cursor] {
            b'{' => brace_depth += 1,
            b'}' => brace_depth = brace_depth.saturating_sub(1),
            byte if byte == delimiter && brace_depth == 0 && link_depth == 0 => {
                parts.push(&text[segment_start..cursor]);
                segment_start = cursor + 1;
            }
            _ => {}
        }
        cursor += 1;
    }
    parts.push(&text[segment_start..]);
    parts
}

/// Tags whose contents are literal text, never template markup.
const UNPARSED_TAGS: [&str; 5] = ["nowiki", "pre", "syntaxhighlight", "source", "math"];

/// End offset of the comment or unparsed tag opening at `cursor`, if any.
/// `lower` is the ASCII-lowercased text; unclosed elements run to its end.
fn skip_unparsed(lower: &str, cursor: usize) -> Option<usize> {
    if lower.as_bytes().get(cursor) != Some(&b'<') {
        return None;
    }
    let rest = &lower[cursor..];
    if let Some(body) = rest.strip_prefix("<!--") {
        return Some(
            body.find("-->")
                .map_or(lower.len(), |end| cursor + 4 + end + 3),
        );
    }

    let after_open = &rest[1..];
    let tag = UNPARSED_TAGS.iter().find(|tag| {
        after_open.strip_prefix(**tag).is_some_and(|tail| {
            tail.starts_with(|ch: char| ch == '>' || ch == '/' || ch.is_ascii_whitespace())
        })
    })?;
    let Some(open_len) = rest.find('>') else {
        return Some(lower.len());
    };
    let body_start = cursor + open_len + 1;
    if rest[..open_len].ends_with('/') {
        return Some(body_start);
    }

    let closing = format!("</{tag}");
    let Some(offset) = lower[body_start..].find(&closing) else {
        return Some(lower.len());
    };
    let close_start = body_start + offset;
    Some(
        lower[close_start..]
            .find('>')
            .map_or(lower.len(), |end| close_start + end + 1),
    )
}

fn strip_comments(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("<!--") {
        output.push_str(&rest[..start]);
        match rest[start + 4..].find("-->") {
            Some(end) => rest = &rest[start + 4 + end + 3..],
            None => {
                rest = "";
                break;
            }
        }
    }
    output.push_str(rest);
    output
}
