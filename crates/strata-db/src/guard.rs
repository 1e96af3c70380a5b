//! Best-effort detection of destructive SQL statements.
//!
//! This is a heuristic over a token stream, not a parser. Comments, string
//! literals and quoted identifiers are skipped and keywords are matched as
//! whole words, so identifiers such as `drop_table_log` or a literal
//! containing `'TRUNCATE'` do not trip it. Equivalent statements phrased in
//! ways it does not recognise will pass.

use std::fmt;

/// A class of statement the raw-query path refuses to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestructiveStatement {
    DropTable,
    Truncate,
    AlterTable,
    /// `DELETE` with no `WHERE` clause.
    UnqualifiedDelete,
}

impl DestructiveStatement {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DropTable => "DROP TABLE",
            Self::Truncate => "TRUNCATE",
            Self::AlterTable => "ALTER TABLE",
            Self::UnqualifiedDelete => "DELETE without WHERE",
        }
    }
}

impl fmt::Display for DestructiveStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Terminator,
    Other,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '\'' | '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                i += 1;
                while i < chars.len() {
                    if chars[i] == close {
                        // A doubled quote is an escaped quote inside the literal.
                        if close != ']' && chars.get(i + 1) == Some(&close) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Other);
            }
            ';' => {
                tokens.push(Token::Terminator);
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            c if c.is_whitespace() => i += 1,
            _ => {
                tokens.push(Token::Other);
                i += 1;
            }
        }
    }

    tokens
}

fn scan_statement(words: &[&str], found: &mut Vec<DestructiveStatement>) {
    let mut push = |kind| {
        if !found.contains(&kind) {
            found.push(kind);
        }
    };

    for pair in words.windows(2) {
        match (pair[0], pair[1]) {
            ("DROP", "TABLE") => push(DestructiveStatement::DropTable),
            ("ALTER", "TABLE") => push(DestructiveStatement::AlterTable),
            _ => {}
        }
    }

    if words.contains(&"TRUNCATE") {
        push(DestructiveStatement::Truncate);
    }

    if let Some(pos) = words.iter().position(|w| *w == "DELETE") {
        if !words[pos..].contains(&"WHERE") {
            push(DestructiveStatement::UnqualifiedDelete);
        }
    }
}

/// Returns every destructive statement class found in `sql`, in order of
/// first appearance. Empty when the SQL looks safe.
pub fn find_destructive(sql: &str) -> Vec<DestructiveStatement> {
    let tokens = tokenize(sql);
    let mut found = Vec::new();

    for statement in tokens.split(|t| *t == Token::Terminator) {
        let words: Vec<&str> = statement
            .iter()
            .filter_map(|t| match t {
                Token::Word(w) => Some(w.as_str()),
                _ => None,
            })
            .collect();
        scan_statement(&words, &mut found);
    }

    found
}
