//! Tokenizer for snippet source.

use crate::packages::directive::is_directive_line;
use crate::record::Diagnostic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Int(i64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Assign,
    /// Statement separator: `;` or a line break.
    Separator,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            Self::Int(n) => format!("integer {}", n),
            Self::Str(_) => "string".to_string(),
            Self::Ident(name) => format!("'{}'", name),
            Self::Plus => "'+'".to_string(),
            Self::Minus => "'-'".to_string(),
            Self::Star => "'*'".to_string(),
            Self::Slash => "'/'".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::LBracket => "'['".to_string(),
            Self::RBracket => "']'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Assign => "'='".to_string(),
            Self::Separator => "end of statement".to_string(),
            Self::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

/// Split source into tokens. Lexical errors are reported as diagnostics and
/// the offending characters skipped.
pub fn tokenize(source: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();

    for (index, line_text) in source.lines().enumerate() {
        let line = index as u32 + 1;
        if is_directive_line(line_text) {
            continue;
        }
        lex_line(line_text, line, &mut tokens, &mut diagnostics);
        tokens.push(Token {
            kind: TokenKind::Separator,
            line,
            column: line_text.chars().count() as u32 + 1,
        });
    }

    let last_line = source.lines().count().max(1) as u32;
    tokens.push(Token {
        kind: TokenKind::Eof,
        line: last_line,
        column: 1,
    });
    (tokens, diagnostics)
}

fn lex_line(text: &str, line: u32, tokens: &mut Vec<Token>, diagnostics: &mut Vec<Diagnostic>) {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let column = i as u32 + 1;
        let mut push = |kind| tokens.push(Token { kind, line, column });

        match c {
            ' ' | '\t' | '\r' => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => break,
            '+' => {
                push(TokenKind::Plus);
                i += 1;
            }
            '-' => {
                push(TokenKind::Minus);
                i += 1;
            }
            '*' => {
                push(TokenKind::Star);
                i += 1;
            }
            '/' => {
                push(TokenKind::Slash);
                i += 1;
            }
            '(' => {
                push(TokenKind::LParen);
                i += 1;
            }
            ')' => {
                push(TokenKind::RParen);
                i += 1;
            }
            '[' => {
                push(TokenKind::LBracket);
                i += 1;
            }
            ']' => {
                push(TokenKind::RBracket);
                i += 1;
            }
            ',' => {
                push(TokenKind::Comma);
                i += 1;
            }
            '=' => {
                push(TokenKind::Assign);
                i += 1;
            }
            ';' => {
                push(TokenKind::Separator);
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                let mut value = String::new();
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '"' => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        '\\' if i + 1 < chars.len() => {
                            value.push(match chars[i + 1] {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            i += 2;
                        }
                        other => {
                            value.push(other);
                            i += 1;
                        }
                    }
                }
                if closed {
                    push(TokenKind::Str(value));
                } else {
                    diagnostics.push(Diagnostic::error(
                        "unterminated string literal",
                        line,
                        start as u32 + 1,
                    ));
                }
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                match digits.parse::<i64>() {
                    Ok(n) => push(TokenKind::Int(n)),
                    Err(_) => diagnostics.push(Diagnostic::error(
                        format!("integer literal {} is too large", digits),
                        line,
                        column,
                    )),
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                push(TokenKind::Ident(chars[start..i].iter().collect()));
            }
            other => {
                diagnostics.push(Diagnostic::error(
                    format!("unexpected character '{}'", other),
                    line,
                    column,
                ));
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, diagnostics) = tokenize(source);
        assert!(diagnostics.is_empty(), "unexpected diagnostics: {:?}", diagnostics);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_print_call() {
        assert_eq!(
            kinds("print(1+1)"),
            vec![
                TokenKind::Ident("print".to_string()),
                TokenKind::LParen,
                TokenKind::Int(1),
                TokenKind::Plus,
                TokenKind::Int(1),
                TokenKind::RParen,
                TokenKind::Separator,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_directives_skipped() {
        let source = "#r \"nuget: Foo, 1.0\"\nlet x = 1 // one\n";
        assert_eq!(
            kinds(source),
            vec![
                TokenKind::Ident("let".to_string()),
                TokenKind::Ident("x".to_string()),
                TokenKind::Assign,
                TokenKind::Int(1),
                TokenKind::Separator,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n""#)[0],
            TokenKind::Str("a\"b\n".to_string())
        );
    }

    #[test]
    fn test_positions() {
        let (tokens, _) = tokenize("let a = 1\n  print(a)");
        let print = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Ident("print".to_string()))
            .unwrap();
        assert_eq!((print.line, print.column), (2, 3));
    }

    #[test]
    fn test_errors() {
        let (_, diagnostics) = tokenize("print(\"open)\nlet y = 3 $ 4");
        assert_eq!(diagnostics.len(), 2);
        assert_eq!((diagnostics[0].line, diagnostics[0].column), (1, 7));
        assert_eq!((diagnostics[1].line, diagnostics[1].column), (2, 11));
        assert!(diagnostics.iter().all(|d| d.is_error()));
    }
}
