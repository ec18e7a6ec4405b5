//! Template-substitution expander.
//!
//! Definitions are text templates with positional placeholders; calls are
//! comma-separated argument lists.
//!
//! | Placeholder | Replaced by |
//! |---|---|
//! | `$0`, `$1`, ... | the n-th argument |
//! | `$*` | all arguments joined with `", "` |
//! | `$$` | a literal `$` |
//!
//! Any other use of `$`, or a placeholder index of [`MAX_ARGS`] or more,
//! makes the definition unusable. Arguments are split at top-level commas;
//! commas inside `()`, `[]`, `{}` or string literals do not split. Every
//! substituted argument gets a range-map entry pointing back at its position
//! in the call body.

use std::ops::Range;

use mexp_ir::{ExpansionError, ExpansionErrorKind, MappedRange, RangeMap};

use crate::{Expander, Expansion, MacroCallData, MacroDefData};

/// The reference expander: positional template substitution.
#[derive(Copy, Clone, Debug, Default)]
pub struct TemplateExpander;

impl TemplateExpander {
    pub fn new() -> Self {
        TemplateExpander
    }
}

impl Expander for TemplateExpander {
    fn normalize_def(&self, body: &str) -> Option<MacroDefData> {
        let text = body.trim();
        parse_template(text)?;
        Some(MacroDefData {
            text: text.to_string(),
        })
    }

    fn normalize_call(&self, body: &str) -> Option<MacroCallData> {
        split_args(body)?;
        Some(MacroCallData {
            text: body.to_string(),
        })
    }

    fn expand(&self, def: &MacroDefData, call: &MacroCallData) -> Result<Expansion, ExpansionError> {
        let pieces = parse_template(&def.text).ok_or_else(|| {
            ExpansionError::new(ExpansionErrorKind::BadDefinition, "invalid placeholder")
        })?;
        let args = split_args(&call.text).ok_or_else(|| {
            ExpansionError::new(ExpansionErrorKind::BadArguments, "unbalanced delimiters")
        })?;
        check_arity(&pieces, args.len())?;

        let mut text = String::with_capacity(def.text.len() + call.text.len());
        let mut ranges = RangeMap::new();
        let mut emit_arg = |text: &mut String, arg: &Range<usize>| {
            ranges.push(MappedRange::new(
                offset(arg.start),
                offset(text.len()),
                offset(arg.len()),
            ));
            text.push_str(&call.text[arg.clone()]);
        };

        for piece in &pieces {
            match *piece {
                Piece::Text(literal) => text.push_str(literal),
                Piece::Arg(index) => emit_arg(&mut text, &args[index]),
                Piece::AllArgs => {
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            text.push_str(", ");
                        }
                        emit_arg(&mut text, arg);
                    }
                }
            }
        }

        if !is_balanced(&text) {
            return Err(ExpansionError::new(
                ExpansionErrorKind::MalformedOutput,
                "expansion has unbalanced delimiters",
            ));
        }

        Ok(Expansion { text, ranges })
    }
}

/// Placeholders index below this bound; larger ones make the definition
/// unusable.
pub const MAX_ARGS: usize = 1 << 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Piece<'a> {
    Text(&'a str),
    Arg(usize),
    AllArgs,
}

fn parse_template(text: &str) -> Option<Vec<Piece<'_>>> {
    let bytes = text.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        if start < i {
            pieces.push(Piece::Text(&text[start..i]));
        }
        match bytes.get(i + 1) {
            Some(b'$') => {
                pieces.push(Piece::Text("$"));
                i += 2;
            }
            Some(b'*') => {
                pieces.push(Piece::AllArgs);
                i += 2;
            }
            Some(c) if c.is_ascii_digit() => {
                let digits_end = bytes[i + 1..]
                    .iter()
                    .position(|b| !b.is_ascii_digit())
                    .map_or(bytes.len(), |p| i + 1 + p);
                let index: usize = text[i + 1..digits_end].parse().ok()?;
                if index >= MAX_ARGS {
                    return None;
                }
                pieces.push(Piece::Arg(index));
                i = digits_end;
            }
            _ => return None,
        }
        start = i;
    }
    if start < bytes.len() {
        pieces.push(Piece::Text(&text[start..]));
    }
    Some(pieces)
}

fn check_arity(pieces: &[Piece<'_>], given: usize) -> Result<(), ExpansionError> {
    let required = pieces
        .iter()
        .filter_map(|p| match p {
            Piece::Arg(index) => Some(index + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    let variadic = pieces.contains(&Piece::AllArgs);

    if given == required || (variadic && given >= required) {
        return Ok(());
    }
    let plural = if required == 1 { "" } else { "s" };
    let at_least = if variadic { "at least " } else { "" };
    Err(ExpansionError::new(
        ExpansionErrorKind::BadArguments,
        format!("expected {at_least}{required} argument{plural}, got {given}"),
    ))
}

/// Split a call body into trimmed top-level arguments.
///
/// `None` if delimiters or string literals are unbalanced. A trailing empty
/// argument (trailing comma, or a blank body) is dropped.
fn split_args(text: &str) -> Option<Vec<Range<usize>>> {
    let mut args = Vec::new();
    let mut start = 0;
    scan(text, |i, c, depth| {
        if c == ',' && depth == 0 {
            args.push(start..i);
            start = i + 1;
        }
    })?;
    args.push(start..text.len());

    let mut args: Vec<Range<usize>> = args.into_iter().map(|r| trim_range(text, r)).collect();
    if args.last().is_some_and(Range::is_empty) {
        args.pop();
    }
    Some(args)
}

fn is_balanced(text: &str) -> bool {
    scan(text, |_, _, _| {}).is_some()
}

/// Walk `text` outside string literals, reporting each char with the
/// delimiter depth before it. `None` on unbalanced input.
fn scan(text: &str, mut visit: impl FnMut(usize, char, usize)) -> Option<()> {
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        visit(i, c, closers.len());
        match c {
            '"' => in_string = true,
            '(' => closers.push(')'),
            '[' => closers.push(']'),
            '{' => closers.push('}'),
            ')' | ']' | '}' => {
                if closers.pop() != Some(c) {
                    return None;
                }
            }
            _ => {}
        }
    }
    (!in_string && closers.is_empty()).then_some(())
}

fn trim_range(text: &str, range: Range<usize>) -> Range<usize> {
    let slice = &text[range.clone()];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    if leading == slice.len() {
        return range.start..range.start;
    }
    range.start + leading..range.end - trailing
}

fn offset(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
