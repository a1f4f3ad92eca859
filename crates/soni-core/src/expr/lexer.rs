//! Tokenizador de expresiones.
//!
//! Tokens: números (enteros y flotantes), strings entre comillas simples o
//! dobles, identificadores, palabras clave (`and`, `or`, `not`, `true`,
//! `false`, `null`) y los operadores/signos del lenguaje.

use super::eval::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Pipe,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(EvalError::Syntax("'=' must be '=='".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(EvalError::Syntax("'!' must be '!='".to_string()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            // Escapes mínimos: \' \" \\ \n \t
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&other) => s.push(other),
                                None => return Err(EvalError::Syntax("dangling escape".to_string())),
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(EvalError::Syntax("unterminated string".to_string())),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        // `1.foo` es miembro sobre entero, no flotante.
                        if chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) && !is_float {
                            is_float = true;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let n = text.parse::<f64>().map_err(|_| EvalError::Syntax(format!("bad number '{text}'")))?;
                    tokens.push(Token::Float(n));
                } else {
                    let n = text.parse::<i64>().map_err(|_| EvalError::Syntax(format!("bad number '{text}'")))?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(EvalError::Syntax(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_mixed_expression() {
        let tokens = tokenize("total >= 10 and name == 'ana'").expect("tokenize");
        assert_eq!(tokens,
                   vec![Token::Ident("total".into()),
                        Token::Ge,
                        Token::Int(10),
                        Token::And,
                        Token::Ident("name".into()),
                        Token::EqEq,
                        Token::Str("ana".into())]);
    }

    #[test]
    fn distinguishes_float_from_member() {
        assert_eq!(tokenize("1.5").expect("float"), vec![Token::Float(1.5)]);
        assert_eq!(tokenize("a.b").expect("member"),
                   vec![Token::Ident("a".into()), Token::Dot, Token::Ident("b".into())]);
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(tokenize("'abc").is_err());
    }

    #[test]
    fn rejects_single_equals() {
        assert!(tokenize("a = 1").is_err());
    }
}
