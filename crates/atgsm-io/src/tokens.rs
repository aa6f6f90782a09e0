//! Tokenizer for AT response parameters.
//!
//! Splits the text after a response prefix on top-level commas. Double
//! quotes group text (and are stripped), parentheses open a nested list:
//!
//! ```text
//! "SM",6,40            -> [SM, 6, 40]
//! 0,0,,123             -> [0, 0, "", 123]
//! ("GSM","UCS2"),(0-4) -> [[GSM, UCS2], [0-4]]
//! ```

use atgsm_core::error::{Error, Result};

/// One parameter of a response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Value(String),
    List(Vec<Token>),
}

impl Token {
    /// The text of a plain value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Token::Value(v) => Some(v.as_str()),
            Token::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Token]> {
        match self {
            Token::List(items) => Some(items.as_slice()),
            Token::Value(_) => None,
        }
    }

    /// Parse a plain value as a number.
    pub fn as_u32(&self) -> Option<u32> {
        self.as_str().and_then(|v| v.trim().parse().ok())
    }

    pub fn is_numeric(&self) -> bool {
        self.as_u32().is_some()
    }

    /// Values of a list, or the value itself for a plain token.
    pub fn values(&self) -> Vec<String> {
        match self {
            Token::Value(v) => vec![v.clone()],
            Token::List(items) => items
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect(),
        }
    }
}

/// Tokenize `input`. Unterminated quotes or unbalanced parentheses are an
/// error so callers can wait for the rest of a split line.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut chars = input.chars().peekable();
    let tokens = parse_list(&mut chars, false)?;
    Ok(tokens)
}

fn parse_list(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    nested: bool,
) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending: Option<Token> = None;

    loop {
        let Some(c) = chars.next() else {
            if nested {
                return Err(Error::Protocol("unbalanced parenthesis".into()));
            }
            break;
        };
        match c {
            '"' => {
                // Text between quotes is taken verbatim, commas included.
                let mut closed = false;
                for q in chars.by_ref() {
                    if q == '"' {
                        closed = true;
                        break;
                    }
                    current.push(q);
                }
                if !closed {
                    return Err(Error::Protocol("unterminated quote".into()));
                }
                quoted = true;
            }
            '(' => pending = Some(Token::List(parse_list(chars, true)?)),
            ')' if nested => {
                tokens.push(finish(&mut current, &mut quoted, &mut pending));
                return Ok(tokens);
            }
            ')' => return Err(Error::Protocol("unbalanced parenthesis".into())),
            ',' => tokens.push(finish(&mut current, &mut quoted, &mut pending)),
            _ => current.push(c),
        }
    }

    if !(tokens.is_empty() && current.trim().is_empty() && !quoted && pending.is_none()) {
        tokens.push(finish(&mut current, &mut quoted, &mut pending));
    }
    Ok(tokens)
}

fn finish(current: &mut String, quoted: &mut bool, pending: &mut Option<Token>) -> Token {
    let text = std::mem::take(current);
    let was_quoted = std::mem::replace(quoted, false);
    match pending.take() {
        Some(list) => list,
        None if was_quoted => Token::Value(text),
        None => Token::Value(text.trim().to_string()),
    }
}

/// Plain string values of `tokens`, with nested lists rendered empty.
pub fn strings(tokens: &[Token]) -> Vec<String> {
    tokens
        .iter()
        .map(|t| t.as_str().unwrap_or_default().to_string())
        .collect()
}
