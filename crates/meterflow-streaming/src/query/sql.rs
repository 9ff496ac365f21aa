//! Lexical helpers for engine statements
//!
//! Statements are compared after canonicalization: backticks dropped,
//! keywords and identifiers upper-cased, whitespace collapsed and removed
//! around punctuation. Single-quoted literals are kept verbatim.

/// Quote a string literal, doubling embedded quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Canonical form of a statement or statement fragment
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut pending_space = false;

    for c in sql.chars() {
        if in_literal {
            out.push(c);
            if c == '\'' {
                in_literal = false;
            }
            continue;
        }

        match c {
            '`' => {}
            c if c.is_whitespace() => pending_space = true,
            c => {
                let joined = out.chars().last().map_or(true, |prev| {
                    matches!(prev, '(' | ',' | '=' | '<' | '>')
                        || matches!(c, '(' | ')' | ',' | '=' | '<' | '>')
                });
                if pending_space && !joined {
                    out.push(' ');
                }
                pending_space = false;
                if c == '\'' {
                    in_literal = true;
                }
                out.extend(c.to_uppercase());
            }
        }
    }

    let trimmed = out.trim_end_matches(';').trim_end();
    trimmed.to_string()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '$' | '.' | '\'' | '*')
}

/// Byte offset of a top-level keyword at or after `from`.
///
/// Matches whole words only, outside literals and parentheses. Expects a
/// normalized statement.
pub fn find_keyword(sql: &str, keyword: &str, from: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut in_literal = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_literal {
            if b == b'\'' {
                in_literal = false;
            }
            i += 1;
            continue;
        }

        match b {
            b'\'' => in_literal = true,
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ if depth == 0 && i >= from && bytes[i..].starts_with(keyword.as_bytes()) => {
                let before_ok = i == 0 || !is_word_char(bytes[i - 1] as char);
                let end = i + keyword.len();
                let after_ok = end == bytes.len() || !is_word_char(bytes[end] as char);
                if before_ok && after_ok {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }

    None
}

/// Split on top-level commas
pub fn split_top_level(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_literal = false;

    for c in list.chars() {
        match c {
            '\'' => in_literal = !in_literal,
            '(' if !in_literal => depth += 1,
            ')' if !in_literal => depth = depth.saturating_sub(1),
            ',' if !in_literal && depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }

    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ignores_formatting() {
        let a = "create table `T` as select SUM( x ) as value\n  from s;";
        let b = "CREATE TABLE T AS SELECT SUM(X) AS VALUE FROM S";
        assert_eq!(normalize_sql(a), b);
        assert_eq!(normalize_sql(b), b);
    }

    #[test]
    fn test_normalize_keeps_literals() {
        assert_eq!(
            normalize_sql("where type = 'Api Call' and x = 'it''s'"),
            "WHERE TYPE='Api Call' AND X='it''s'"
        );
    }

    #[test]
    fn test_find_keyword_skips_nested_and_literals() {
        let sql = normalize_sql("SELECT A FROM (SELECT B FROM C) WHERE X = 'FROM' GROUP BY A");
        let from = find_keyword(&sql, "FROM", 0).unwrap();
        assert_eq!(&sql[from..from + 5], "FROM(");
        assert!(find_keyword(&sql, "FROM", from + 1).is_none());
        assert!(find_keyword(&sql, "GROUP BY", 0).is_some());
        assert!(find_keyword(&sql, "ROUP", 0).is_none());
    }

    #[test]
    fn test_split_top_level() {
        assert_eq!(
            split_top_level("A, F(B, C), 'x,y'"),
            vec!["A", "F(B, C)", "'x,y'"]
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
