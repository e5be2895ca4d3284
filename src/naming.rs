//! Rename patterns.
//!
//! A rename step turns each image's output name into an expanded pattern.
//! Patterns are literal text with `{placeholder}` tokens:
//!
//! | Placeholder | Expands to |
//! |---|---|
//! | `{name}` | source file stem (`IMG_0042` from `IMG_0042.jpg`) |
//! | `{index}` | position in the batch, offset by `startIndex`, zero-padded to `zeroPad` |
//! | `{timestamp}` | batch start, unix seconds |
//! | `{width}`, `{height}` | current image dimensions |
//! | `{ext}` | output extension without the dot |
//!
//! The expansion is a file *stem*: the extension is always appended by the
//! pipeline. `{{` and `}}` produce literal braces.
//!
//! A pattern that holds neither `{name}` nor `{index}` cannot give every
//! image in a batch a distinct name; normalization replaces it with
//! [`DEFAULT_PATTERN`]. `{timestamp}` does not count: it is one value for
//! the whole batch.

use std::fmt;
use thiserror::Error;

/// Pattern used when a rename step has no uniqueness placeholder.
pub const DEFAULT_PATTERN: &str = "{name}-{index}";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("unbalanced brace at position {0}")]
    UnbalancedBrace(usize),
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),
    #[error("pattern must not contain path separators")]
    PathSeparator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Name,
    Index,
    Timestamp,
    Width,
    Height,
    Ext,
}

impl Placeholder {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(Placeholder::Name),
            "index" => Some(Placeholder::Index),
            "timestamp" => Some(Placeholder::Timestamp),
            "width" => Some(Placeholder::Width),
            "height" => Some(Placeholder::Height),
            "ext" => Some(Placeholder::Ext),
            _ => None,
        }
    }

    /// Whether this placeholder differs between images of one batch.
    pub fn is_unique(self) -> bool {
        matches!(self, Placeholder::Name | Placeholder::Index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    Placeholder(Placeholder),
}

/// A parsed rename pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePattern {
    source: String,
    tokens: Vec<Token>,
}

/// Per-image values substituted into a pattern.
#[derive(Debug, Clone, Copy)]
pub struct NameContext<'a> {
    pub name: &'a str,
    pub index: u64,
    pub zero_pad: usize,
    pub timestamp: u64,
    pub width: u32,
    pub height: u32,
    pub ext: &'a str,
}

impl RenamePattern {
    /// Parse a pattern.
    ///
    /// ```
    /// use imagetask::naming::{NameContext, RenamePattern};
    ///
    /// let p = RenamePattern::parse("{name}_{width}w").unwrap();
    /// let ctx = NameContext {
    ///     name: "dawn", index: 1, zero_pad: 0, timestamp: 0,
    ///     width: 800, height: 600, ext: "jpg",
    /// };
    /// assert_eq!(p.expand(&ctx), "dawn_800w");
    /// ```
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.contains('/') || pattern.contains('\\') {
            return Err(PatternError::PathSeparator);
        }

        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().is_some_and(|&(_, n)| n == '{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().is_some_and(|&(_, n)| n == '}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(PatternError::UnbalancedBrace(pos)),
                '{' => {
                    let mut key = String::new();
                    let mut closed = false;
                    for (_, k) in chars.by_ref() {
                        match k {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(PatternError::UnbalancedBrace(pos)),
                            _ => key.push(k),
                        }
                    }
                    if !closed {
                        return Err(PatternError::UnbalancedBrace(pos));
                    }
                    let placeholder = Placeholder::parse(key.trim())
                        .ok_or_else(|| PatternError::UnknownPlaceholder(key.clone()))?;
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Placeholder(placeholder));
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Whether the pattern holds at least one per-image placeholder.
    pub fn is_unique(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::Placeholder(p) if p.is_unique()))
    }

    pub fn expand(&self, ctx: &NameContext<'_>) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(s) => out.push_str(s),
                Token::Placeholder(p) => match p {
                    Placeholder::Name => out.push_str(ctx.name),
                    Placeholder::Index => {
                        out.push_str(&format!("{:0>width$}", ctx.index, width = ctx.zero_pad))
                    }
                    Placeholder::Timestamp => out.push_str(&ctx.timestamp.to_string()),
                    Placeholder::Width => out.push_str(&ctx.width.to_string()),
                    Placeholder::Height => out.push_str(&ctx.height.to_string()),
                    Placeholder::Ext => out.push_str(ctx.ext),
                },
            }
        }
        out
    }
}

impl Default for RenamePattern {
    fn default() -> Self {
        Self {
            source: DEFAULT_PATTERN.to_string(),
            tokens: vec![
                Token::Placeholder(Placeholder::Name),
                Token::Literal("-".to_string()),
                Token::Placeholder(Placeholder::Index),
            ],
        }
    }
}

impl fmt::Display for RenamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// File stem of `path`, or `"image"` when it has none.
pub fn file_stem(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string())
}
