//! Read-only SQL statement checks and identifier extraction.
//!
//! A small comment- and string-aware tokenizer backs both the pre-execution
//! validation gate and the schema-aware checks used during recovery. This is
//! deliberately not a SQL parser; it only needs to answer "is this a single
//! SELECT", "which tables does it touch", and "which qualified columns does
//! it mention".

pub const DISALLOWED_KEYWORDS: [&str; 10] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "MERGE",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    // Bare word, uppercased for keyword comparison; raw case preserved.
    Word { upper: String, raw: String },
    // Double-quoted or backtick-quoted identifier, quotes stripped.
    QuotedIdent(String),
    // Single-quoted string literal, content dropped.
    StringLit,
    Number,
    Punct(char),
}

impl Token {
    fn is_word(&self, kw: &str) -> bool {
        matches!(self, Token::Word { upper, .. } if upper == kw)
    }

    fn ident(&self) -> Option<&str> {
        match self {
            Token::Word { raw, .. } => Some(raw),
            Token::QuotedIdent(s) => Some(s),
            _ => None,
        }
    }
}

fn tokenize(sql: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        // Line comment
        if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        // Block comment
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err("unterminated block comment".into());
                }
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
            continue;
        }
        // String literal, '' escapes a quote
        if c == '\'' {
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string literal".into()),
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => i += 2,
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
            tokens.push(Token::StringLit);
            continue;
        }
        // Quoted identifier
        if c == '"' || c == '`' {
            let quote = c;
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err("unterminated quoted identifier".into());
            }
            tokens.push(Token::QuotedIdent(chars[start..i].iter().collect()));
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let raw: String = chars[start..i].iter().collect();
            tokens.push(Token::Word { upper: raw.to_uppercase(), raw });
            continue;
        }
        if c.is_ascii_digit() {
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '_')
            {
                i += 1;
            }
            tokens.push(Token::Number);
            continue;
        }
        tokens.push(Token::Punct(c));
        i += 1;
    }
    Ok(tokens)
}

/// Validate that `sql` is exactly one read-only SELECT statement.
///
/// Checks, in order: non-empty, a single top-level statement (a semicolon is
/// only allowed as trailing terminator), first significant token `SELECT`,
/// `FROM` present, no disallowed keyword anywhere outside strings and quoted
/// identifiers, balanced parentheses.
pub fn validate_select(sql: &str) -> Result<(), String> {
    let tokens = tokenize(sql)?;
    if tokens.is_empty() {
        return Err("empty statement".into());
    }
    // Semicolons: only a trailing terminator is allowed.
    let semis: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| matches!(t, Token::Punct(';')))
        .map(|(i, _)| i)
        .collect();
    match semis.as_slice() {
        [] => {}
        [last] if *last == tokens.len() - 1 => {}
        _ => return Err("multiple statements are not allowed".into()),
    }
    if !tokens[0].is_word("SELECT") {
        return Err("statement must begin with SELECT".into());
    }
    if !tokens.iter().any(|t| t.is_word("FROM")) {
        return Err("statement has no FROM clause".into());
    }
    for t in &tokens {
        if let Token::Word { upper, .. } = t
            && DISALLOWED_KEYWORDS.contains(&upper.as_str())
        {
            return Err(format!("disallowed keyword {upper}"));
        }
    }
    let mut depth: i64 = 0;
    for t in &tokens {
        match t {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced parentheses".into());
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses".into());
    }
    Ok(())
}

/// A table referenced in a FROM or JOIN position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

// Words that terminate a from-item and can never be an alias.
const CLAUSE_WORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "INTERSECT", "EXCEPT", "ON",
    "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "OUTER", "NATURAL", "USING", "SELECT",
    "AS", "AND", "OR", "NOT",
];

/// Extract table references from FROM and JOIN positions. Subqueries
/// contribute no table name; schema-qualified names keep their last segment.
pub fn referenced_tables(sql: &str) -> Vec<TableRef> {
    let Ok(tokens) = tokenize(sql) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let introduces = tokens[i].is_word("FROM") || tokens[i].is_word("JOIN");
        if !introduces {
            i += 1;
            continue;
        }
        i += 1;
        loop {
            // Subquery or parenthesized join: step inside and let the outer
            // scan pick up any FROM/JOIN it contains.
            if matches!(tokens.get(i), Some(Token::Punct('('))) {
                i += 1;
                break;
            } else {
                // Dotted identifier chain; last segment is the table name.
                let mut name = None;
                while let Some(t) = tokens.get(i) {
                    match t.ident() {
                        Some(id)
                            if !matches!(t, Token::Word { upper, .. }
                                if CLAUSE_WORDS.contains(&upper.as_str())) =>
                        {
                            name = Some(id.to_string());
                            i += 1;
                            if matches!(tokens.get(i), Some(Token::Punct('.'))) {
                                i += 1;
                                continue;
                            }
                        }
                        _ => {}
                    }
                    break;
                }
                let Some(name) = name else { break };
                let mut alias = None;
                if matches!(tokens.get(i), Some(t) if t.is_word("AS")) {
                    i += 1;
                }
                if let Some(t) = tokens.get(i)
                    && let Some(id) = t.ident()
                    && !matches!(t, Token::Word { upper, .. } if CLAUSE_WORDS.contains(&upper.as_str()))
                {
                    alias = Some(id.to_string());
                    i += 1;
                }
                out.push(TableRef { name, alias });
            }
            // Comma continues the FROM list.
            if matches!(tokens.get(i), Some(Token::Punct(','))) {
                i += 1;
                continue;
            }
            break;
        }
    }
    out
}

/// Extract `qualifier.column` pairs outside FROM/JOIN positions. For longer
/// chains (`schema.table.column`) the last two segments are kept.
pub fn qualified_columns(sql: &str) -> Vec<(String, String)> {
    let Ok(tokens) = tokenize(sql) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut in_from_item = false;
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            t if t.is_word("FROM") || t.is_word("JOIN") => {
                in_from_item = true;
                i += 1;
            }
            Token::Word { upper, .. }
                if matches!(
                    upper.as_str(),
                    "WHERE" | "ON" | "GROUP" | "ORDER" | "HAVING" | "SELECT" | "LIMIT" | "USING"
                ) =>
            {
                in_from_item = false;
                i += 1;
            }
            t if t.ident().is_some() => {
                // Collect the dotted chain starting here.
                let mut chain = vec![t.ident().unwrap().to_string()];
                let mut j = i + 1;
                while matches!(tokens.get(j), Some(Token::Punct('.'))) {
                    match tokens.get(j + 1).and_then(|t| t.ident()) {
                        Some(id) => {
                            chain.push(id.to_string());
                            j += 2;
                        }
                        None => break,
                    }
                }
                if chain.len() >= 2 && !in_from_item {
                    let column = chain[chain.len() - 1].clone();
                    let qualifier = chain[chain.len() - 2].clone();
                    out.push((qualifier, column));
                }
                i = j;
            }
            _ => i += 1,
        }
    }
    out
}
