//! Version-aware ordering of object keys.
//!
//! Keys are split into alternating runs of digits and non-digits. Digit runs
//! compare numerically, everything else byte-wise, so `dep-1.10.0.tar.gz`
//! sorts after `dep-1.9.0.tar.gz`.

use std::cmp::Ordering;

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Number(&'a str),
    Text(&'a str),
}

fn tokens(s: &str) -> Vec<Token<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_digits = None;
    for (idx, ch) in s.char_indices() {
        let digit = ch.is_ascii_digit();
        match in_digits {
            Some(prev) if prev != digit => {
                out.push(token(&s[start..idx], prev));
                start = idx;
            }
            _ => {}
        }
        in_digits = Some(digit);
    }
    if let Some(digit) = in_digits {
        out.push(token(&s[start..], digit));
    }
    out
}

fn token(run: &str, digit: bool) -> Token<'_> {
    if digit {
        Token::Number(run)
    } else {
        Token::Text(run)
    }
}

/// Compare two digit runs by value without parsing, so arbitrarily long runs
/// never overflow.
fn compare_numbers(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_tokens(a: &Token<'_>, b: &Token<'_>) -> Ordering {
    match (a, b) {
        (Token::Number(a), Token::Number(b)) => compare_numbers(a, b),
        (Token::Text(a), Token::Text(b)) => a.cmp(b),
        // A release number outranks a textual tag in the same position.
        (Token::Number(_), Token::Text(_)) => Ordering::Greater,
        (Token::Text(_), Token::Number(_)) => Ordering::Less,
    }
}

/// Total, version-aware ordering of two strings.
///
/// Strings equal under natural ordering (`1.01` vs `1.1`) fall back to plain
/// byte order so the result is deterministic.
pub fn compare(a: &str, b: &str) -> Ordering {
    let ta = tokens(a);
    let tb = tokens(b);
    for (x, y) in ta.iter().zip(tb.iter()) {
        let ord = compare_tokens(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ta.len().cmp(&tb.len()).then_with(|| a.cmp(b))
}
