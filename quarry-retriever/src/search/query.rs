//! Google-style query syntax translated into SQLite FTS5 boolean syntax.
//!
//! | input               | FTS5                 |
//! |---------------------|----------------------|
//! | `hello world`       | `hello AND world`    |
//! | `"hello world"`     | `"hello world"`      |
//! | `hello OR world`    | `hello OR world`     |
//! | `hello -world`      | `hello NOT world`    |
//! | `-draft notes`      | `notes NOT draft`    |
//!
//! FTS5's `NOT` is binary, so a negation attaches to the operand before it.
//! Negations that appear before any positive term are emitted right after
//! the first positive term.

use crate::error::QuarryError;

type Result<T> = std::result::Result<T, QuarryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Term(String),
    Phrase(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Operand(Operand),
    Not(Operand),
    Or,
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let negated = c == '-';
        if negated {
            chars.next();
            match chars.peek() {
                // A lone `-` carries no operand.
                None => break,
                Some(c) if c.is_whitespace() => continue,
                Some(_) => {}
            }
        }
        let operand = if chars.peek() == Some(&'"') {
            chars.next();
            let mut phrase = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                phrase.push(c);
            }
            if !closed {
                return Err(QuarryError::invalid_option("unbalanced quotes in query"));
            }
            Operand::Phrase(phrase)
        } else {
            let mut term = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '"' {
                    break;
                }
                term.push(c);
                chars.next();
            }
            if !negated && term.eq_ignore_ascii_case("OR") {
                tokens.push(Token::Or);
                continue;
            }
            Operand::Term(term)
        };
        if matches!(&operand, Operand::Phrase(p) if p.trim().is_empty()) {
            continue;
        }
        tokens.push(if negated {
            Token::Not(operand)
        } else {
            Token::Operand(operand)
        });
    }
    Ok(tokens)
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn needs_quoting(term: &str) -> bool {
    matches!(term, "AND" | "OR" | "NOT" | "NEAR")
        || term.chars().any(|c| !(c.is_alphanumeric() || c == '_'))
}

impl Operand {
    fn render(&self) -> String {
        match self {
            Self::Phrase(p) => quote(p),
            Self::Term(t) if needs_quoting(t) => quote(t),
            Self::Term(t) => t.clone(),
        }
    }
}

/// Translate web-search syntax into an FTS5 MATCH expression.
///
/// Fails with `InvalidOption` on unbalanced quotes, a dangling `OR`, or a
/// query made only of negations.
pub fn convert_to_query(input: &str) -> Result<String> {
    let tokens = lex(input)?;
    let mut out = String::new();
    let mut pending_or = false;
    let mut deferred: Vec<String> = Vec::new();

    for token in &tokens {
        match token {
            Token::Or => {
                if out.is_empty() || pending_or {
                    return Err(QuarryError::invalid_option("dangling OR in query"));
                }
                pending_or = true;
            }
            Token::Not(inner) => {
                let negated = inner.render();
                if out.is_empty() {
                    deferred.push(negated);
                } else {
                    // Binary NOT replaces any pending AND/OR.
                    if pending_or {
                        tracing::warn!(
                            query = input,
                            term = %negated,
                            "OR before a negated term has no effect; treating it as NOT"
                        );
                    }
                    out.push_str(" NOT ");
                    out.push_str(&negated);
                    pending_or = false;
                }
            }
            Token::Operand(positive) => {
                let first = out.is_empty();
                if !first {
                    out.push_str(if pending_or { " OR " } else { " AND " });
                }
                out.push_str(&positive.render());
                pending_or = false;
                if first {
                    for negated in deferred.drain(..) {
                        out.push_str(" NOT ");
                        out.push_str(&negated);
                    }
                }
            }
        }
    }

    if pending_or {
        return Err(QuarryError::invalid_option("dangling OR in query"));
    }
    if out.is_empty() && !deferred.is_empty() {
        return Err(QuarryError::invalid_option(
            "query needs at least one term that is not negated",
        ));
    }
    Ok(out)
}

/// Whitespace-split terms joined with `AND`, passed through verbatim.
pub fn plain_query(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" AND ")
}

/// Reject FTS5 expressions with unbalanced quotes or dangling operators.
pub fn validate_query(query: &str) -> Result<()> {
    if query.chars().filter(|c| *c == '"').count() % 2 != 0 {
        return Err(QuarryError::invalid_option("unbalanced quotes in query"));
    }

    // Words outside quotes; a quoted section counts as one operand.
    let mut words: Vec<&str> = Vec::new();
    let mut in_quotes = false;
    let mut start: Option<usize> = None;
    for (i, c) in query.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
            if start.is_none() {
                start = Some(i);
            }
        } else if c.is_whitespace() && !in_quotes {
            if let Some(s) = start.take() {
                words.push(&query[s..i]);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        words.push(&query[s..]);
    }

    let is_operator = |w: &str| matches!(w, "AND" | "OR" | "NOT");
    let Some((first, last)) = words.first().zip(words.last()) else {
        return Err(QuarryError::invalid_option("empty query"));
    };
    if is_operator(*first) {
        return Err(QuarryError::invalid_option(format!("query cannot start with {first}")));
    }
    if is_operator(*last) {
        return Err(QuarryError::invalid_option(format!("dangling {last} at end of query")));
    }
    if let Some(pair) = words.windows(2).find(|w| is_operator(w[0]) && is_operator(w[1])) {
        return Err(QuarryError::invalid_option(format!(
            "dangling {} before {}",
            pair[0], pair[1]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(input: &str) -> String {
        convert_to_query(input).unwrap()
    }

    #[test]
    fn test_basic_translations() {
        assert_eq!(convert("hello world"), "hello AND world");
        assert_eq!(convert("\"hello world\""), "\"hello world\"");
        assert_eq!(convert("hello OR world"), "hello OR world");
        assert_eq!(convert("hello or world"), "hello OR world");
        assert_eq!(convert("hello -world"), "hello NOT world");
        assert_eq!(convert("\"fat rat\" -cat"), "\"fat rat\" NOT cat");
    }

    #[test]
    fn test_negation_placement() {
        assert_eq!(convert("-draft notes"), "notes NOT draft");
        assert_eq!(convert("a -\"b c\" d"), "a NOT \"b c\" AND d");
        assert!(matches!(
            convert_to_query("-only -negations"),
            Err(QuarryError::InvalidOption(_))
        ));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_or_before_negation_is_reported() {
        assert_eq!(convert("a OR -b"), "a NOT b");
        assert!(logs_contain("OR before a negated term has no effect"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_plain_negation_is_silent() {
        assert_eq!(convert("a -b"), "a NOT b");
        assert!(!logs_contain("has no effect"));
    }

    #[test]
    fn test_special_terms_are_quoted() {
        assert_eq!(convert("foo-bar baz"), "\"foo-bar\" AND baz");
        assert_eq!(convert("NEAR AND"), "\"NEAR\" AND \"AND\"");
        assert_eq!(convert("c++ title:x"), "\"c++\" AND \"title:x\"");
        assert_eq!(convert("snake_case café"), "snake_case AND café");
    }

    #[test]
    fn test_rejected_inputs() {
        for bad in ["\"open phrase", "OR hello", "hello OR", "a OR OR b"] {
            assert!(
                matches!(convert_to_query(bad), Err(QuarryError::InvalidOption(_))),
                "{bad}"
            );
        }
        assert_eq!(convert(""), "");
        assert_eq!(convert("  - \"\" "), "");
    }

    #[test]
    fn test_plain_query() {
        assert_eq!(plain_query("  alpha   beta gamma "), "alpha AND beta AND gamma");
    }

    #[test]
    fn test_validator() {
        assert!(validate_query("hello AND world").is_ok());
        assert!(validate_query("\"a OR\" NOT b").is_ok());
        assert!(validate_query("\"unbalanced").is_err());
        assert!(validate_query("hello NOT").is_err());
        assert!(validate_query("NOT hello").is_err());
        assert!(validate_query("a OR NOT b").is_err());
        assert!(validate_query("").is_err());
        for input in ["hello world", "\"fat rat\" -cat", "-x y OR z"] {
            assert!(validate_query(&convert(input)).is_ok(), "{input}");
        }
    }
}
