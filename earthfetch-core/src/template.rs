//! `{t:%Y%m%d}`-style path and URL templates.
//!
//! Grammar:
//! - `{t}` renders the timestamp as `YYYY-MM-DD HH:MM:SS`
//! - `{t:<strftime>}` renders it with a chrono strftime pattern
//! - `{field}` renders a value from the [`FormatContext`]
//! - `{{` and `}}` are literal braces
//!
//! Patterns are checked when the template is parsed, so rendering never hits
//! an invalid strftime specifier.

use chrono::format::StrftimeItems;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unbalanced '{brace}' at byte {position} in template '{template}'")]
    Unbalanced {
        template: String,
        brace: char,
        position: usize,
    },

    #[error("empty field name in template '{0}'")]
    EmptyField(String),

    #[error("invalid time format '{spec}' in template '{template}'")]
    InvalidTimeFormat { template: String, spec: String },

    #[error("format spec '{spec}' is only supported on the time field (in '{field}')")]
    UnsupportedSpec { field: String, spec: String },

    #[error("unknown template field '{0}'")]
    UnknownField(String),
}

/// Named values available to `{field}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatContext(BTreeMap<String, String>);

impl FormatContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Time(Option<String>),
    Field(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(TemplateError::Unbalanced {
                        template: source.to_string(),
                        brace: '}',
                        position: pos,
                    })
                }
                '{' => {
                    let mut field = String::new();
                    let mut closed = false;
                    for (_, fc) in chars.by_ref() {
                        if fc == '}' {
                            closed = true;
                            break;
                        }
                        if fc == '{' {
                            break;
                        }
                        field.push(fc);
                    }
                    if !closed {
                        return Err(TemplateError::Unbalanced {
                            template: source.to_string(),
                            brace: '{',
                            position: pos,
                        });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_field(source, &field)?);
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the template contains a `{t...}` placeholder.
    pub fn uses_time(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Time(_)))
    }

    /// Whether a literal part contains a `*` glob wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Literal(l) if l.contains('*')))
    }

    pub fn render(&self, t: NaiveDateTime, ctx: &FormatContext) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(l) => out.push_str(l),
                Segment::Time(None) => out.push_str(&crate::timestamp::display(t)),
                Segment::Time(Some(spec)) => write_time(&mut out, t, spec).map_err(|_| {
                    TemplateError::InvalidTimeFormat {
                        template: self.source.clone(),
                        spec: spec.clone(),
                    }
                })?,
                Segment::Field(name) => out.push_str(
                    ctx.get(name)
                        .ok_or_else(|| TemplateError::UnknownField(name.clone()))?,
                ),
            }
        }
        Ok(out)
    }
}

fn parse_field(template: &str, field: &str) -> Result<Segment, TemplateError> {
    let (name, spec) = match field.split_once(':') {
        Some((name, spec)) => (name.trim(), Some(spec)),
        None => (field.trim(), None),
    };
    if name.is_empty() {
        return Err(TemplateError::EmptyField(template.to_string()));
    }
    if name != "t" {
        return match spec {
            None => Ok(Segment::Field(name.to_string())),
            Some(spec) => Err(TemplateError::UnsupportedSpec {
                field: name.to_string(),
                spec: spec.to_string(),
            }),
        };
    }

    match spec {
        None => Ok(Segment::Time(None)),
        Some(spec) => {
            let mut rendered = String::new();
            let sample = NaiveDate::from_ymd_opt(2000, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default();
            write_time(&mut rendered, sample, spec).map_err(|_| TemplateError::InvalidTimeFormat {
                template: template.to_string(),
                spec: spec.to_string(),
            })?;
            Ok(Segment::Time(Some(spec.to_string())))
        }
    }
}

// `write!` reports a failing Display impl as an error instead of panicking,
// which covers both bad specifiers and offset fields on naive timestamps.
fn write_time(out: &mut String, t: NaiveDateTime, spec: &str) -> std::fmt::Result {
    write!(out, "{}", t.format_with_items(StrftimeItems::new(spec)))
}
