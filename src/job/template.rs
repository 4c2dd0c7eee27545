//! Argument templating.
//!
//! Arguments may embed actions of the form `{{func "arg" ...}}`. Available
//! functions:
//! - `{{env "KEY"}}`: value from the effective environment, empty if absent
//! - `{{name}}`: the task name
//! - `{{time "2006-01-02"}}`: current local time in a reference-time layout
//!   (`Mon Jan 2 15:04:05 MST 2006`); a layout containing `%` is read as
//!   strftime instead
//! - `{{count}}`: 1 + number of successful executions so far

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use regex::Regex;

use crate::error::TemplateError;

static ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^([A-Za-z_][A-Za-z0-9_]*)((?:\s+"(?:[^"\\]|\\.)*")*)$"#)
        .expect("valid action regex")
});

static STRING_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("valid argument regex"));

/// Values the template functions read from.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub name: &'a str,
    pub env: &'a BTreeMap<String, String>,
    /// Successful executions recorded before this attempt.
    pub successes: usize,
    pub now: DateTime<Local>,
}

/// Render every action in `text`.
pub fn render(text: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = find_close(after_open).ok_or(TemplateError::Unclosed {
            offset: offset + start,
        })?;

        out.push_str(&eval(after_open[..end].trim(), ctx)?);

        let consumed = start + 2 + end + 2;
        rest = &rest[consumed..];
        offset += consumed;
    }
    out.push_str(rest);
    Ok(out)
}

/// Byte offset of the `}}` closing an action, ignoring any inside quotes.
fn find_close(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quote => i += 1,
            b'"' => in_quote = !in_quote,
            b'}' if !in_quote && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn eval(action: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let caps = ACTION.captures(action).ok_or_else(|| TemplateError::Malformed {
        action: action.to_string(),
    })?;
    let name = &caps[1];
    let args: Vec<String> = STRING_ARG
        .captures_iter(caps.get(2).map_or("", |m| m.as_str()))
        .map(|c| unescape(&c[1]))
        .collect();

    match name {
        "env" => {
            let [key] = expect_args::<1>(name, args)?;
            Ok(ctx.env.get(&key).cloned().unwrap_or_default())
        }
        "name" => {
            expect_args::<0>(name, args)?;
            Ok(ctx.name.to_string())
        }
        "time" => {
            let [layout] = expect_args::<1>(name, args)?;
            format_time(&ctx.now, &layout)
        }
        "count" => {
            expect_args::<0>(name, args)?;
            Ok((ctx.successes + 1).to_string())
        }
        other => Err(TemplateError::UnknownFunction {
            name: other.to_string(),
        }),
    }
}

fn expect_args<const N: usize>(name: &str, args: Vec<String>) -> Result<[String; N], TemplateError> {
    let got = args.len();
    args.try_into().map_err(|_| TemplateError::Arity {
        name: name.to_string(),
        expected: N,
        got,
    })
}

fn format_time(now: &DateTime<Local>, layout: &str) -> Result<String, TemplateError> {
    let strftime = if layout.contains('%') {
        layout.to_string()
    } else {
        reference_to_strftime(layout, now.offset().local_minus_utc() == 0)
    };
    let items: Vec<Item<'_>> = StrftimeItems::new(&strftime).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return Err(TemplateError::TimeLayout {
            layout: layout.to_string(),
        });
    }
    Ok(now.format_with_items(items.into_iter()).to_string())
}

/// Reference-time tokens, longest first where one is a prefix of another.
const REFERENCE_TOKENS: &[(&str, &str)] = &[
    ("January", "%B"),
    ("Jan", "%b"),
    ("Monday", "%A"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    ("2006", "%Y"),
    ("_2006", "_%Y"),
    ("_2", "%e"),
    ("002", "%j"),
    ("01", "%m"),
    ("02", "%d"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("06", "%y"),
    ("15", "%H"),
    ("1", "%-m"),
    ("2", "%-d"),
    ("3", "%-I"),
    ("4", "%-M"),
    ("5", "%-S"),
    ("PM", "%p"),
    ("pm", "%P"),
    ("-07:00:00", "%::z"),
    ("-07:00", "%:z"),
    ("-0700", "%z"),
    ("-07", "%:::z"),
];

/// Zone tokens rendered as `Z` when the offset is zero.
const UTC_Z_TOKENS: &[(&str, &str)] = &[
    ("Z07:00:00", "%::z"),
    ("Z07:00", "%:z"),
    ("Z0700", "%z"),
    ("Z07", "%:::z"),
];

/// Translate a reference-time layout into strftime. Unknown text is kept
/// literally.
fn reference_to_strftime(layout: &str, utc: bool) -> String {
    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;

    'scan: while let Some(c) = rest.chars().next() {
        for (token, spec) in UTC_Z_TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(if utc { "Z" } else { spec });
                rest = tail;
                continue 'scan;
            }
        }
        for (token, spec) in REFERENCE_TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(spec);
                rest = tail;
                continue 'scan;
            }
        }
        if let Some((spec, len)) = fraction(rest) {
            out.push_str(&spec);
            rest = &rest[len..];
            continue;
        }
        match c {
            '%' => out.push_str("%%"),
            other => out.push(other),
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// `.000`, `,000000` or `.999999999` style fractional seconds. Only 3, 6 or 9
/// digits are supported and the digits are always printed in full.
fn fraction(s: &str) -> Option<(String, usize)> {
    let mut chars = s.chars();
    let sep = chars.next().filter(|c| matches!(c, '.' | ','))?;
    let digit = chars.next().filter(|c| matches!(c, '0' | '9'))?;
    let run = 1 + s[2..].chars().take_while(|c| *c == digit).count();
    if s[1 + run..].starts_with(|c: char| c.is_ascii_digit()) || !matches!(run, 3 | 6 | 9) {
        return None;
    }
    Some((format!("{sep}%{run}f"), 1 + run))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
