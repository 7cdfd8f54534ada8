use crate::errors::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Minus,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

/// A cursor over the expression source. Mirrors the shape of the SQL
/// lexer: peek, bump, and a little lookahead for two-char operators.
pub(crate) struct Cursor<'a> {
    source: &'a str,
    chars: std::str::CharIndices<'a>,
    peeked: Option<(usize, char)>,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices(),
            peeked: None,
        }
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        if self.peeked.is_none() {
            self.peeked = self.chars.next();
        }
        self.peeked
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        self.peek();
        self.peeked.take()
    }

    fn eat(&mut self, expected: char) -> bool {
        match self.peek() {
            Some((_, c)) if c == expected => {
                self.bump();
                true
            }
            _ => false,
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> ExprError {
        ExprError::Lex {
            expression: self.source.to_string(),
            offset,
            message: message.into(),
        }
    }
}

pub(crate) fn lex(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut cursor = Cursor::new(source);
    let mut tokens = Vec::new();

    while let Some((offset, c)) = cursor.bump() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '.' => Token::Dot,
            ',' => Token::Comma,
            '-' => Token::Minus,
            '=' if cursor.eat('=') => Token::Eq,
            '!' if cursor.eat('=') => Token::Ne,
            '!' => Token::Not,
            '<' if cursor.eat('=') => Token::Le,
            '<' if cursor.eat('>') => Token::Ne,
            '<' => Token::Lt,
            '>' if cursor.eat('=') => Token::Ge,
            '>' => Token::Gt,
            '&' if cursor.eat('&') => Token::And,
            '|' if cursor.eat('|') => Token::Or,
            '\'' | '"' => lex_string(&mut cursor, offset, c)?,
            c if c.is_ascii_digit() => lex_number(&mut cursor, c)?,
            c if c.is_alphabetic() || c == '_' => lex_word(&mut cursor, c),
            other => return Err(cursor.error(offset, format!("unexpected character '{other}'"))),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

fn lex_string(cursor: &mut Cursor<'_>, start: usize, quote: char) -> Result<Token, ExprError> {
    let mut text = String::new();
    loop {
        match cursor.bump() {
            Some((_, c)) if c == quote => return Ok(Token::Str(text)),
            Some((_, '\\')) => match cursor.bump() {
                Some((_, escaped)) => text.push(escaped),
                None => return Err(cursor.error(start, "unterminated string literal")),
            },
            Some((_, c)) => text.push(c),
            None => return Err(cursor.error(start, "unterminated string literal")),
        }
    }
}

fn lex_number(cursor: &mut Cursor<'_>, first: char) -> Result<Token, ExprError> {
    let mut text = String::from(first);
    let mut is_float = false;
    while let Some((_, c)) = cursor.peek() {
        if c.is_ascii_digit() {
            text.push(c);
            cursor.bump();
        } else if c == '.' {
            // Only consume the dot when a digit follows; `a[0].b` must keep
            // its dot for the path walker.
            let mut lookahead = cursor.chars.clone();
            match lookahead.next() {
                Some((_, next)) if next.is_ascii_digit() => {
                    is_float = true;
                    text.push(c);
                    cursor.bump();
                }
                _ => break,
            }
        } else {
            break;
        }
    }
    if is_float {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| cursor.error(0, format!("bad float literal '{text}'")))
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| cursor.error(0, format!("bad integer literal '{text}'")))
    }
}

fn lex_word(cursor: &mut Cursor<'_>, first: char) -> Token {
    let mut text = String::from(first);
    while let Some((_, c)) = cursor.peek() {
        if c.is_alphanumeric() || c == '_' || c == '$' {
            text.push(c);
            cursor.bump();
        } else {
            break;
        }
    }
    match text.as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        "eq" => Token::Eq,
        "neq" | "ne" => Token::Ne,
        "lt" => Token::Lt,
        "lte" => Token::Le,
        "gt" => Token::Gt,
        "gte" => Token::Ge,
        _ => Token::Ident(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_operators_and_words() {
        let tokens = lex("age != null and name == 'ada'").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("age".into()),
                Token::Ne,
                Token::Null,
                Token::And,
                Token::Ident("name".into()),
                Token::Eq,
                Token::Str("ada".into()),
            ]
        );
    }

    #[test]
    fn keeps_path_dots_out_of_numbers() {
        let tokens = lex("items[0].price > 1.5").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("items".into()),
                Token::LBracket,
                Token::Int(0),
                Token::RBracket,
                Token::Dot,
                Token::Ident("price".into()),
                Token::Gt,
                Token::Float(1.5),
            ]
        );
    }

    #[test]
    fn rejects_unterminated_strings() {
        assert!(lex("name == 'oops").is_err());
    }
}
