//! `${{ namespace.key }}` expansion for action arguments, environment values
//! and target commands.

use crate::error::PipelineResult;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// A single `${{ ... }}` occurrence split into its namespace and key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expression<'a> {
    pub namespace: &'a str,
    pub key: &'a str,
}

/// Resolves expressions during rendering. Returning `Ok(None)` keeps the
/// expression verbatim so a later pass can fill it in.
pub trait Resolve {
    fn resolve(&self, expr: Expression<'_>) -> PipelineResult<Option<String>>;
}

pub fn expressions(input: &str) -> Vec<Expression<'_>> {
    let mut found = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        found.push(parse(&after_open[..end]));
        rest = &after_open[end + CLOSE.len()..];
    }
    found
}

pub fn render<R: Resolve + ?Sized>(input: &str, resolver: &R) -> PipelineResult<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        output.push_str(&rest[..start]);
        let raw = &after_open[..end];
        match resolver.resolve(parse(raw))? {
            Some(value) => output.push_str(&value),
            None => {
                output.push_str(OPEN);
                output.push_str(raw);
                output.push_str(CLOSE);
            }
        }
        rest = &after_open[end + CLOSE.len()..];
    }
    output.push_str(rest);
    Ok(output)
}

fn parse(raw: &str) -> Expression<'_> {
    let trimmed = raw.trim();
    match trimmed.split_once('.') {
        Some((namespace, key)) => Expression {
            namespace: namespace.trim(),
            key: key.trim(),
        },
        None => Expression {
            namespace: trimmed,
            key: "",
        },
    }
}
