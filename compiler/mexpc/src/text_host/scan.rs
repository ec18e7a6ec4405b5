//! Locating macro definitions and calls in source text.
//!
//! ```text
//! macro twice(decl) { $0, $0 }      definition: name, kind, body
//! let xs = [twice!(1)];             call: path `twice`, body `1`
//! #[cfg(off)] twice!(2);            call gated out by conditional compilation
//! ```
//!
//! Calls inside a definition body or a string literal are not calls. A call
//! whose parenthesis never closes is reported as invalid, with the rest of
//! the text as its body.

use std::ops::Range;

use crate::host::MacroKind;

const CFG_OFF: &str = "#[cfg(off)]";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ParsedDef {
    pub name: String,
    pub kind: MacroKind,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ParsedCall {
    pub path: String,
    pub body: String,
    pub cfg_enabled: bool,
    pub valid: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Scan {
    pub defs: Vec<ParsedDef>,
    pub calls: Vec<ParsedCall>,
}

pub(crate) fn scan(text: &str) -> Scan {
    let (defs, spans) = scan_defs(text);
    let calls = scan_calls(text, &spans);
    Scan { defs, calls }
}

fn scan_defs(text: &str) -> (Vec<ParsedDef>, Vec<Range<usize>>) {
    let bytes = text.as_bytes();
    let mut defs = Vec::new();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            i = skip_string(bytes, i);
            continue;
        }
        if is_token_start(bytes, i) && text[i..].starts_with("macro") {
            if let Some((def, end)) = parse_def(text, i) {
                defs.push(def);
                spans.push(i..end);
                i = end;
                continue;
            }
        }
        i += 1;
    }
    (defs, spans)
}

/// `macro name(kind) { body }` starting at `start`. Returns the definition
/// and the offset just past its closing brace.
fn parse_def(text: &str, start: usize) -> Option<(ParsedDef, usize)> {
    let bytes = text.as_bytes();
    let mut i = start + "macro".len();
    if !bytes.get(i)?.is_ascii_whitespace() {
        return None;
    }
    i = skip_whitespace(bytes, i);
    let name = ident_at(text, i)?;
    i = skip_whitespace(bytes, i + name.len());
    if bytes.get(i) != Some(&b'(') {
        return None;
    }
    i = skip_whitespace(bytes, i + 1);
    let kind_name = ident_at(text, i)?;
    let kind = match kind_name {
        "decl" => MacroKind::Declarative,
        "proc" => MacroKind::Procedural,
        _ => return None,
    };
    i = skip_whitespace(bytes, i + kind_name.len());
    if bytes.get(i) != Some(&b')') {
        return None;
    }
    i = skip_whitespace(bytes, i + 1);
    if bytes.get(i) != Some(&b'{') {
        return None;
    }
    let close = matching_close(bytes, i)?;
    Some((
        ParsedDef {
            name: name.to_string(),
            kind,
            body: text[i + 1..close].trim().to_string(),
        },
        close + 1,
    ))
}

fn scan_calls(text: &str, def_spans: &[Range<usize>]) -> Vec<ParsedCall> {
    let bytes = text.as_bytes();
    let mut calls = Vec::new();
    let mut spans = def_spans.iter().peekable();
    let mut i = 0;
    while i < bytes.len() {
        // A call or string may have jumped past whole definitions.
        while spans.next_if(|span| span.end <= i).is_some() {}
        if let Some(span) = spans.peek() {
            if span.contains(&i) {
                i = span.end;
                spans.next();
                continue;
            }
        }
        if bytes[i] == b'"' {
            i = skip_string(bytes, i);
            continue;
        }
        if !is_token_start(bytes, i) {
            i += 1;
            continue;
        }
        let Some(path) = ident_at(text, i) else {
            i += 1;
            continue;
        };
        let open = i + path.len() + 1;
        if bytes.get(open - 1) != Some(&b'!') || bytes.get(open) != Some(&b'(') {
            i += path.len();
            continue;
        }

        let cfg_enabled = !text[..i].trim_end().ends_with(CFG_OFF);
        match matching_close(bytes, open) {
            Some(close) => {
                calls.push(ParsedCall {
                    path: path.to_string(),
                    body: text[open + 1..close].to_string(),
                    cfg_enabled,
                    valid: true,
                });
                i = close + 1;
            }
            None => {
                calls.push(ParsedCall {
                    path: path.to_string(),
                    body: text[open + 1..].to_string(),
                    cfg_enabled,
                    valid: false,
                });
                i = bytes.len();
            }
        }
    }
    calls
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_token_start(bytes: &[u8], i: usize) -> bool {
    (bytes[i].is_ascii_alphabetic() || bytes[i] == b'_')
        && (i == 0 || !is_ident_byte(bytes[i - 1]))
}

fn ident_at(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let first = *bytes.get(start)?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let len = bytes[start..]
        .iter()
        .take_while(|&&b| is_ident_byte(b))
        .count();
    Some(&text[start..start + len])
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    i
}

/// Offset just past the string literal opening at `start`.
fn skip_string(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Offset of the delimiter closing the one at `open`, honouring nesting and
/// string literals.
fn matching_close(bytes: &[u8], open: usize) -> Option<usize> {
    let mut stack = Vec::new();
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'(' => stack.push(b')'),
            b'[' => stack.push(b']'),
            b'{' => stack.push(b'}'),
            b @ (b')' | b']' | b'}') => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}
