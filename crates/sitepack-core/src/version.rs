use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A version or release string compared token by token.
///
/// Digit runs compare numerically, letter runs compare byte-wise, a digit run
/// outranks a letter run, and a longer token sequence outranks its prefix. A
/// `~` marks a pre-release and sorts before everything, including the end of
/// the string, so `1.0~rc1 < 1.0`. All other characters only separate tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Version {
    raw: String,
    tokens: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Numeric(String),
    Alpha(String),
    Tilde,
}

impl Version {
    pub fn parse(input: &str) -> Self {
        let raw = input.trim().to_string();
        let tokens = tokenize(&raw);
        Self { raw, tokens }
    }

    pub fn empty() -> Self {
        Self::parse("")
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn tokenize(raw: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch == '~' {
            tokens.push(Token::Tilde);
            chars.next();
        } else if ch.is_ascii_digit() {
            let mut digits = String::new();
            while let Some(&next) = chars.peek() {
                if !next.is_ascii_digit() {
                    break;
                }
                digits.push(next);
                chars.next();
            }
            let trimmed = digits.trim_start_matches('0');
            tokens.push(Token::Numeric(if trimmed.is_empty() {
                "0".to_string()
            } else {
                trimmed.to_string()
            }));
        } else if ch.is_ascii_alphabetic() {
            let mut letters = String::new();
            while let Some(&next) = chars.peek() {
                if !next.is_ascii_alphabetic() {
                    break;
                }
                letters.push(next);
                chars.next();
            }
            tokens.push(Token::Alpha(letters));
        } else {
            chars.next();
        }
    }

    tokens
}

fn compare_tokens(left: &[Token], right: &[Token]) -> Ordering {
    let mut index = 0;
    loop {
        let ordering = match (left.get(index), right.get(index)) {
            (Some(Token::Tilde), Some(Token::Tilde)) => Ordering::Equal,
            (Some(Token::Tilde), _) => return Ordering::Less,
            (_, Some(Token::Tilde)) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(Token::Numeric(_)), Some(Token::Alpha(_))) => return Ordering::Greater,
            (Some(Token::Alpha(_)), Some(Token::Numeric(_))) => return Ordering::Less,
            // leading zeros are already stripped, so digit count decides first
            (Some(Token::Numeric(a)), Some(Token::Numeric(b))) => {
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
            (Some(Token::Alpha(a)), Some(Token::Alpha(b))) => a.as_bytes().cmp(b.as_bytes()),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
        index += 1;
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_tokens(&self.tokens, &other.tokens)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tokens.hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<String> for Version {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for Version {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.raw
    }
}
