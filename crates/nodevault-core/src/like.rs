//! SQL `LIKE` pattern matching and escaping.
//!
//! Tree lock back ends that answer "is anything locked under this path?"
//! with a substring/prefix search must escape the pattern-special characters
//! of the stored path first. Without escaping, a lock on `/Root/A/B_B` would
//! match `/Root/A/BxB/...` because `_` matches any single character.
//!
//! Supported syntax: `%` (any run), `_` (any single character),
//! `[abc]`, `[a-z]`, `[^a]` (character sets). Matching is ASCII
//! case-insensitive, like the default collation of repository paths.

/// Escape `%`, `_` and `[` so that `text` matches only itself.
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '%' => out.push_str("[%]"),
            '_' => out.push_str("[_]"),
            '[' => out.push_str("[[]"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Any,
    One,
    Literal(char),
    Set { negated: bool, ranges: Vec<(char, char)> },
}

/// A compiled `LIKE` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikePattern {
    tokens: Vec<Token>,
}

impl LikePattern {
    pub fn new(pattern: &str) -> Self {
        let chars: Vec<char> = pattern.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '%' => {
                    // Collapse runs of '%'.
                    if tokens.last() != Some(&Token::Any) {
                        tokens.push(Token::Any);
                    }
                    i += 1;
                }
                '_' => {
                    tokens.push(Token::One);
                    i += 1;
                }
                '[' => match parse_set(&chars, i) {
                    Some((token, next)) => {
                        tokens.push(token);
                        i = next;
                    }
                    None => {
                        tokens.push(Token::Literal('['));
                        i += 1;
                    }
                },
                c => {
                    tokens.push(Token::Literal(c));
                    i += 1;
                }
            }
        }
        Self { tokens }
    }

    /// Pattern matching `path` itself and everything below it:
    /// `escape(path) + "/%"`.
    pub fn descendants_of(path: &str) -> Self {
        Self::new(&format!("{}/%", escape_like(path)))
    }

    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        // reachable[j]: the tokens consumed so far can match text[..j]
        let mut reachable = vec![false; text.len() + 1];
        reachable[0] = true;

        for token in &self.tokens {
            let mut next = vec![false; text.len() + 1];
            match token {
                Token::Any => {
                    let mut seen = false;
                    for j in 0..=text.len() {
                        seen |= reachable[j];
                        next[j] = seen;
                    }
                }
                single => {
                    for j in 0..text.len() {
                        if reachable[j] && matches_one(single, text[j]) {
                            next[j + 1] = true;
                        }
                    }
                }
            }
            reachable = next;
            if !reachable.iter().any(|r| *r) {
                return false;
            }
        }
        reachable[text.len()]
    }
}

fn matches_one(token: &Token, c: char) -> bool {
    match token {
        Token::Any | Token::One => true,
        Token::Literal(l) => l.eq_ignore_ascii_case(&c),
        Token::Set { negated, ranges } => {
            let lc = c.to_ascii_lowercase();
            let hit = ranges.iter().any(|(lo, hi)| {
                let (lo, hi) = (lo.to_ascii_lowercase(), hi.to_ascii_lowercase());
                lo <= lc && lc <= hi
            });
            hit != *negated
        }
    }
}

/// Parse `[...]` starting at `start`. The first character after `[` (or
/// `[^`) is always part of the set, which is how `[]]` and `[[]` work.
fn parse_set(chars: &[char], start: usize) -> Option<(Token, usize)> {
    let mut i = start + 1;
    let negated = chars.get(i) == Some(&'^') && chars.get(i + 1).is_some_and(|c| *c != ']');
    if negated {
        i += 1;
    }
    let mut ranges = Vec::new();
    let mut first = true;
    while i < chars.len() {
        let c = chars[i];
        if c == ']' && !first {
            return Some((Token::Set { negated, ranges }, i + 1));
        }
        first = false;
        if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).is_some_and(|c| *c != ']') {
            ranges.push((c, chars[i + 2]));
            i += 3;
        } else {
            ranges.push((c, c));
            i += 1;
        }
    }
    None
}
