//! Selectors
//!
//! The subset of CSS selectors subscribers use to describe their targets:
//! type, universal, `#id`, `.class`, attribute selectors (`[a]`, `[a=v]`,
//! `[a~=v]`, `[a^=v]`, `[a$=v]`, `[a*=v]`, `[a|=v]`), descendant and child
//! combinators, and comma separated lists. No pseudo-classes.

use std::fmt;
use std::str::FromStr;

use crate::{NodeId, TreeAccess};

/// Upper bound on ancestor hops while matching combinators. Hosts may hand
/// the engine trees whose parent chains are not guaranteed to be acyclic.
const MAX_ANCESTOR_HOPS: usize = 256;

/// Selector parse error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,

    #[error("unexpected character `{ch}` in selector `{selector}`")]
    UnexpectedChar { selector: String, ch: char },

    #[error("unterminated attribute selector in `{selector}`")]
    UnterminatedAttribute { selector: String },

    #[error("selector `{selector}` ends with a combinator")]
    DanglingCombinator { selector: String },
}

/// Parsed selector list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    text: Box<str>,
    alternatives: Vec<ComplexSelector>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ComplexSelector {
    /// Left to right; `combinators[i]` sits between `compounds[i]` and `compounds[i + 1]`
    compounds: Vec<CompoundSelector>,
    combinators: Vec<Combinator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompoundSelector {
    parts: Vec<SimpleSelector>,
}

/// Simple selector types
#[derive(Debug, Clone, PartialEq, Eq)]
enum SimpleSelector {
    /// Universal selector (*)
    Universal,
    /// Tag name selector (div, span, etc.)
    Tag(Box<str>),
    /// ID selector (#id)
    Id(Box<str>),
    /// Class selector (.class)
    Class(Box<str>),
    /// Attribute selector
    Attr {
        name: Box<str>,
        op: AttrOp,
        value: Box<str>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals,
    Includes,
    StartsWith,
    EndsWith,
    Contains,
    DashMatch,
}

impl Selector {
    /// Parse a selector list
    pub fn parse(text: &str) -> Result<Self, SelectorError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SelectorError::Empty);
        }

        let mut alternatives = Vec::new();
        for part in split_top_level(trimmed) {
            alternatives.push(parse_complex(part.trim(), trimmed)?);
        }

        Ok(Self {
            text: trimmed.into(),
            alternatives,
        })
    }

    /// Original selector text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Does `node` itself match any alternative?
    pub fn matches<T: TreeAccess + ?Sized>(&self, tree: &T, node: NodeId) -> bool {
        if tree.tag_name(node).is_none() {
            return false;
        }
        self.alternatives
            .iter()
            .any(|complex| match_from(complex, complex.compounds.len() - 1, tree, node))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Selector::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn match_from<T: TreeAccess + ?Sized>(
    complex: &ComplexSelector,
    index: usize,
    tree: &T,
    node: NodeId,
) -> bool {
    if !complex.compounds[index].matches(tree, node) {
        return false;
    }
    if index == 0 {
        return true;
    }

    match complex.combinators[index - 1] {
        Combinator::Child => tree
            .parent(node)
            .is_some_and(|parent| match_from(complex, index - 1, tree, parent)),
        Combinator::Descendant => {
            let mut current = tree.parent(node);
            let mut hops = 0;
            while let Some(ancestor) = current {
                if hops >= MAX_ANCESTOR_HOPS {
                    break;
                }
                if match_from(complex, index - 1, tree, ancestor) {
                    return true;
                }
                current = tree.parent(ancestor);
                hops += 1;
            }
            false
        }
    }
}

impl CompoundSelector {
    fn matches<T: TreeAccess + ?Sized>(&self, tree: &T, node: NodeId) -> bool {
        let Some(tag) = tree.tag_name(node) else {
            return false;
        };
        self.parts.iter().all(|part| match part {
            SimpleSelector::Universal => true,
            SimpleSelector::Tag(name) => tag.eq_ignore_ascii_case(name),
            SimpleSelector::Id(id) => tree.attribute(node, "id") == Some(id.as_ref()),
            SimpleSelector::Class(class) => tree
                .attribute(node, "class")
                .is_some_and(|list| list.split_whitespace().any(|c| c == class.as_ref())),
            SimpleSelector::Attr { name, op, value } => match tree.attribute(node, name) {
                Some(actual) => op.matches(actual, value),
                None => false,
            },
        })
    }
}

impl AttrOp {
    fn matches(self, actual: &str, expected: &str) -> bool {
        match self {
            AttrOp::Exists => true,
            AttrOp::Equals => actual == expected,
            AttrOp::Includes => actual.split_whitespace().any(|w| w == expected),
            AttrOp::StartsWith => !expected.is_empty() && actual.starts_with(expected),
            AttrOp::EndsWith => !expected.is_empty() && actual.ends_with(expected),
            AttrOp::Contains => !expected.is_empty() && actual.contains(expected),
            AttrOp::DashMatch => {
                actual == expected
                    || actual
                        .strip_prefix(expected)
                        .is_some_and(|rest| rest.starts_with('-'))
            }
        }
    }
}

/// Split on commas outside of attribute brackets and quotes
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, ch) in text.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_complex(text: &str, whole: &str) -> Result<ComplexSelector, SelectorError> {
    if text.is_empty() {
        return Err(SelectorError::Empty);
    }

    let mut compounds = Vec::new();
    let mut combinators = Vec::new();
    let mut pending = Combinator::Descendant;
    let mut rest = text;

    while !rest.is_empty() {
        let (compound, remaining) = parse_compound(rest, whole)?;
        if !compounds.is_empty() {
            combinators.push(pending);
        }
        compounds.push(compound);

        let trimmed = remaining.trim_start();
        if let Some(after) = trimmed.strip_prefix('>') {
            pending = Combinator::Child;
            rest = after.trim_start();
            if rest.is_empty() {
                return Err(SelectorError::DanglingCombinator {
                    selector: whole.to_string(),
                });
            }
        } else {
            pending = Combinator::Descendant;
            rest = trimmed;
        }
    }

    Ok(ComplexSelector {
        compounds,
        combinators,
    })
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'
}

/// Read an identifier at the start of `text`
fn take_ident(text: &str) -> (&str, &str) {
    let end = text
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text.split_at(end)
}

fn parse_compound<'a>(
    text: &'a str,
    whole: &str,
) -> Result<(CompoundSelector, &'a str), SelectorError> {
    let mut parts = Vec::new();
    let mut rest = text;

    if let Some(after) = rest.strip_prefix('*') {
        parts.push(SimpleSelector::Universal);
        rest = after;
    } else {
        let (tag, after) = take_ident(rest);
        if !tag.is_empty() {
            parts.push(SimpleSelector::Tag(tag.to_ascii_lowercase().into()));
            rest = after;
        }
    }

    loop {
        let Some(ch) = rest.chars().next() else {
            break;
        };
        match ch {
            '#' | '.' => {
                let (name, after) = take_ident(&rest[1..]);
                if name.is_empty() {
                    return Err(unexpected(whole, ch));
                }
                parts.push(if ch == '#' {
                    SimpleSelector::Id(name.into())
                } else {
                    SimpleSelector::Class(name.into())
                });
                rest = after;
            }
            '[' => {
                let (attr, after) = parse_attribute(&rest[1..], whole)?;
                parts.push(attr);
                rest = after;
            }
            c if c.is_whitespace() || c == '>' => break,
            other => return Err(unexpected(whole, other)),
        }
    }

    if parts.is_empty() {
        let ch = rest.chars().next().unwrap_or(' ');
        return Err(unexpected(whole, ch));
    }
    Ok((CompoundSelector { parts }, rest))
}

fn parse_attribute<'a>(
    text: &'a str,
    whole: &str,
) -> Result<(SimpleSelector, &'a str), SelectorError> {
    let unterminated = || SelectorError::UnterminatedAttribute {
        selector: whole.to_string(),
    };

    let (name, rest) = take_ident(text.trim_start());
    if name.is_empty() {
        return Err(unterminated());
    }
    let rest = rest.trim_start();
    if rest.is_empty() {
        return Err(unterminated());
    }

    if let Some(after) = rest.strip_prefix(']') {
        let attr = SimpleSelector::Attr {
            name: name.to_ascii_lowercase().into(),
            op: AttrOp::Exists,
            value: "".into(),
        };
        return Ok((attr, after));
    }

    let (op, rest) = [
        ("~=", AttrOp::Includes),
        ("^=", AttrOp::StartsWith),
        ("$=", AttrOp::EndsWith),
        ("*=", AttrOp::Contains),
        ("|=", AttrOp::DashMatch),
        ("=", AttrOp::Equals),
    ]
    .iter()
    .find_map(|(token, op)| rest.strip_prefix(token).map(|after| (*op, after)))
    .ok_or_else(|| unexpected(whole, rest.chars().next().unwrap_or(']')))?;

    let rest = rest.trim_start();
    let (value, rest) = match rest.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let body = &rest[1..];
            let end = body.find(q).ok_or_else(unterminated)?;
            (&body[..end], &body[end + 1..])
        }
        _ => take_ident(rest),
    };

    let rest = rest.trim_start().strip_prefix(']').ok_or_else(unterminated)?;
    let attr = SimpleSelector::Attr {
        name: name.to_ascii_lowercase().into(),
        op,
        value: value.into(),
    };
    Ok((attr, rest))
}

fn unexpected(whole: &str, ch: char) -> SelectorError {
    SelectorError::UnexpectedChar {
        selector: whole.to_string(),
        ch,
    }
}
