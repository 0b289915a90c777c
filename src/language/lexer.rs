use crate::language::{
    span::Span,
    token::{Token, TokenKind},
};

#[derive(Debug)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

pub fn lex(source: &str) -> Result<Vec<Token>, Vec<LexError>> {
    let lexer = Lexer::new(source);
    lexer.run()
}

struct Lexer<'a> {
    src: &'a str,
    chars: std::str::Chars<'a>,
    current: Option<char>,
    offset: usize,
    tokens: Vec<Token>,
    errors: Vec<LexError>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        let mut chars = src.chars();
        let current = chars.next();
        Self {
            src,
            chars,
            current,
            offset: 0,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, Vec<LexError>> {
        while let Some(ch) = self.current {
            match ch {
                '-' if self.peek() == Some('-') => self.eat_comment(),
                ch if ch.is_whitespace() => {
                    self.bump();
                }
                ch if ch.is_ascii_alphabetic() || ch == '_' => self.lex_name(),
                ch if ch.is_ascii_digit() => self.lex_number(),
                '.' if self.peek().is_some_and(|c| c.is_ascii_digit()) => self.lex_number(),
                '"' | '\'' => self.lex_quoted_string(ch),
                '[' if matches!(self.peek(), Some('[') | Some('=')) && self.long_bracket_level().is_some() => {
                    self.lex_long_string()
                }
                _ => self.lex_symbol(),
            }
        }
        self.push_token(TokenKind::Eof, self.offset, self.offset);

        if self.errors.is_empty() {
            Ok(self.tokens)
        } else {
            Err(self.errors)
        }
    }

    fn bump(&mut self) -> Option<char> {
        if let Some(ch) = self.current {
            self.offset += ch.len_utf8();
        }
        self.current = self.chars.next();
        self.current
    }

    fn peek(&self) -> Option<char> {
        self.chars.clone().next()
    }

    fn push_token(&mut self, kind: TokenKind, start: usize, end: usize) {
        self.tokens.push(Token {
            kind,
            span: Span::new(start, end),
        });
    }

    fn error(&mut self, start: usize, end: usize, message: impl Into<String>) {
        self.errors.push(LexError {
            message: message.into(),
            span: Span::new(start, end),
        });
    }

    /// Level of a long bracket `[`, `[=`, `[==`... at the current position,
    /// if the bracket actually closes with another `[`.
    fn long_bracket_level(&self) -> Option<usize> {
        let mut probe = self.chars.clone();
        let mut level = 0;
        loop {
            match probe.next() {
                Some('=') => level += 1,
                Some('[') => return Some(level),
                _ => return None,
            }
        }
    }

    fn eat_comment(&mut self) {
        self.bump();
        self.bump();
        if self.current == Some('[') {
            if let Some(level) = self.long_bracket_level() {
                self.eat_long_bracket_body(level);
                return;
            }
        }
        while let Some(ch) = self.current {
            if ch == '\n' {
                break;
            }
            self.bump();
        }
    }

    /// Consumes `[=*[ ... ]=*]` starting at the opening `[`, returning the
    /// body. Assumes the opening bracket was validated by
    /// `long_bracket_level`.
    fn eat_long_bracket_body(&mut self, level: usize) -> String {
        self.bump();
        for _ in 0..level {
            self.bump();
        }
        self.bump();
        // A newline right after the opening bracket is dropped.
        if self.current == Some('\r') {
            self.bump();
        }
        if self.current == Some('\n') {
            self.bump();
        }

        let mut body = String::new();
        loop {
            match self.current {
                None => {
                    self.error(self.offset, self.offset, "Unterminated long bracket");
                    return body;
                }
                Some(']') => {
                    let mut probe = self.chars.clone();
                    let mut eqs = 0;
                    let closed = loop {
                        match probe.next() {
                            Some('=') => eqs += 1,
                            Some(']') => break eqs == level,
                            _ => break false,
                        }
                    };
                    if closed {
                        for _ in 0..level + 2 {
                            self.bump();
                        }
                        return body;
                    }
                    body.push(']');
                    self.bump();
                }
                Some(ch) => {
                    body.push(ch);
                    self.bump();
                }
            }
        }
    }

    fn lex_long_string(&mut self) {
        let start = self.offset;
        let level = self
            .long_bracket_level()
            .unwrap_or(0);
        let body = self.eat_long_bracket_body(level);
        self.push_token(TokenKind::Str(body), start, self.offset);
    }

    fn lex_name(&mut self) {
        let start = self.offset;
        while let Some(ch) = self.current {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.bump();
            } else {
                break;
            }
        }

        let end = self.offset;
        let slice = &self.src[start..end];
        let kind = match slice {
            "and" => TokenKind::And,
            "break" => TokenKind::Break,
            "do" => TokenKind::Do,
            "else" => TokenKind::Else,
            "elseif" => TokenKind::Elseif,
            "end" => TokenKind::End,
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "function" => TokenKind::Function,
            "goto" => TokenKind::Goto,
            "if" => TokenKind::If,
            "in" => TokenKind::In,
            "local" => TokenKind::Local,
            "nil" => TokenKind::Nil,
            "not" => TokenKind::Not,
            "or" => TokenKind::Or,
            "repeat" => TokenKind::Repeat,
            "return" => TokenKind::Return,
            "then" => TokenKind::Then,
            "true" => TokenKind::True,
            "until" => TokenKind::Until,
            "while" => TokenKind::While,
            _ => TokenKind::Name(slice.to_string()),
        };
        self.push_token(kind, start, end);
    }

    fn lex_number(&mut self) {
        let start = self.offset;

        if self.current == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            self.bump();
            self.bump();
            let digits_start = self.offset;
            while let Some(ch) = self.current {
                if ch.is_ascii_hexdigit() {
                    self.bump();
                } else {
                    break;
                }
            }
            let end = self.offset;
            let digits = &self.src[digits_start..end];
            match i64::from_str_radix(digits, 16) {
                Ok(value) => self.push_token(TokenKind::Int(value), start, end),
                Err(_) => self.error(start, end, "Malformed hexadecimal number"),
            }
            return;
        }

        let mut is_float = false;
        while let Some(ch) = self.current {
            match ch {
                ch if ch.is_ascii_digit() => {
                    self.bump();
                }
                '.' if !is_float => {
                    is_float = true;
                    self.bump();
                }
                'e' | 'E' => {
                    is_float = true;
                    self.bump();
                    if matches!(self.current, Some('+') | Some('-')) {
                        self.bump();
                    }
                }
                _ => break,
            }
        }

        let end = self.offset;
        let slice = &self.src[start..end];
        if is_float {
            match slice.parse::<f64>() {
                Ok(value) => self.push_token(TokenKind::Float(value), start, end),
                Err(_) => self.error(start, end, "Malformed number"),
            }
        } else {
            match slice.parse::<i64>() {
                Ok(value) => self.push_token(TokenKind::Int(value), start, end),
                // Integer literals too large for i64 spill into floats.
                Err(_) => match slice.parse::<f64>() {
                    Ok(value) => self.push_token(TokenKind::Float(value), start, end),
                    Err(_) => self.error(start, end, "Malformed number"),
                },
            }
        }
    }

    fn lex_quoted_string(&mut self, quote: char) {
        let start = self.offset;
        self.bump();
        let mut value = String::new();
        loop {
            match self.current {
                None => {
                    self.error(start, self.offset, "Unterminated string");
                    break;
                }
                Some('\n') => {
                    self.error(start, self.offset, "Unterminated string");
                    break;
                }
                Some(ch) if ch == quote => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    match self.current {
                        Some('n') => {
                            value.push('\n');
                            self.bump();
                        }
                        Some('t') => {
                            value.push('\t');
                            self.bump();
                        }
                        Some('r') => {
                            value.push('\r');
                            self.bump();
                        }
                        Some('a') => {
                            value.push('\u{7}');
                            self.bump();
                        }
                        Some('b') => {
                            value.push('\u{8}');
                            self.bump();
                        }
                        Some('f') => {
                            value.push('\u{c}');
                            self.bump();
                        }
                        Some('v') => {
                            value.push('\u{b}');
                            self.bump();
                        }
                        Some('\\') => {
                            value.push('\\');
                            self.bump();
                        }
                        Some('"') => {
                            value.push('"');
                            self.bump();
                        }
                        Some('\'') => {
                            value.push('\'');
                            self.bump();
                        }
                        Some('\n') => {
                            value.push('\n');
                            self.bump();
                        }
                        Some('x') => {
                            self.bump();
                            let mut code = 0u32;
                            let mut digits = 0;
                            while digits < 2 {
                                match self.current.and_then(|c| c.to_digit(16)) {
                                    Some(d) => {
                                        code = code * 16 + d;
                                        digits += 1;
                                        self.bump();
                                    }
                                    None => break,
                                }
                            }
                            if digits == 0 {
                                self.error(self.offset, self.offset, "Missing hex digits in escape");
                            } else if let Some(ch) = char::from_u32(code) {
                                value.push(ch);
                            }
                        }
                        Some('z') => {
                            self.bump();
                            while self.current.is_some_and(|c| c.is_whitespace()) {
                                self.bump();
                            }
                        }
                        Some(d) if d.is_ascii_digit() => {
                            let mut code = 0u32;
                            let mut digits = 0;
                            while digits < 3 {
                                match self.current.and_then(|c| c.to_digit(10)) {
                                    Some(v) => {
                                        code = code * 10 + v;
                                        digits += 1;
                                        self.bump();
                                    }
                                    None => break,
                                }
                            }
                            if code > 255 {
                                self.error(self.offset, self.offset, "Decimal escape too large");
                            } else if let Some(ch) = char::from_u32(code) {
                                value.push(ch);
                            }
                        }
                        Some(other) => {
                            self.error(
                                self.offset,
                                self.offset,
                                format!("Invalid escape sequence `\\{other}`"),
                            );
                            self.bump();
                        }
                        None => {
                            self.error(start, self.offset, "Unterminated string");
                            break;
                        }
                    }
                }
                Some(ch) => {
                    value.push(ch);
                    self.bump();
                }
            }
        }
        self.push_token(TokenKind::Str(value), start, self.offset);
    }

    fn lex_symbol(&mut self) {
        let start = self.offset;
        let Some(ch) = self.current else {
            return;
        };
        let kind = match ch {
            '+' => {
                self.bump();
                TokenKind::Plus
            }
            '-' => {
                self.bump();
                TokenKind::Minus
            }
            '*' => {
                self.bump();
                TokenKind::Star
            }
            '/' => {
                self.bump();
                if self.current == Some('/') {
                    self.bump();
                    TokenKind::SlashSlash
                } else {
                    TokenKind::Slash
                }
            }
            '%' => {
                self.bump();
                TokenKind::Percent
            }
            '^' => {
                self.bump();
                TokenKind::Caret
            }
            '#' => {
                self.bump();
                TokenKind::Hash
            }
            '&' => {
                self.bump();
                TokenKind::Ampersand
            }
            '~' => {
                self.bump();
                if self.current == Some('=') {
                    self.bump();
                    TokenKind::TildeEq
                } else {
                    TokenKind::Tilde
                }
            }
            '|' => {
                self.bump();
                TokenKind::Pipe
            }
            '<' => {
                self.bump();
                match self.current {
                    Some('<') => {
                        self.bump();
                        TokenKind::LtLt
                    }
                    Some('=') => {
                        self.bump();
                        TokenKind::LtEq
                    }
                    _ => TokenKind::Lt,
                }
            }
            '>' => {
                self.bump();
                match self.current {
                    Some('>') => {
                        self.bump();
                        TokenKind::GtGt
                    }
                    Some('=') => {
                        self.bump();
                        TokenKind::GtEq
                    }
                    _ => TokenKind::Gt,
                }
            }
            '=' => {
                self.bump();
                if self.current == Some('=') {
                    self.bump();
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            '(' => {
                self.bump();
                TokenKind::LParen
            }
            ')' => {
                self.bump();
                TokenKind::RParen
            }
            '{' => {
                self.bump();
                TokenKind::LBrace
            }
            '}' => {
                self.bump();
                TokenKind::RBrace
            }
            '[' => {
                self.bump();
                TokenKind::LBracket
            }
            ']' => {
                self.bump();
                TokenKind::RBracket
            }
            ';' => {
                self.bump();
                TokenKind::Semi
            }
            ':' => {
                self.bump();
                if self.current == Some(':') {
                    self.bump();
                    TokenKind::ColonColon
                } else {
                    TokenKind::Colon
                }
            }
            ',' => {
                self.bump();
                TokenKind::Comma
            }
            '.' => {
                self.bump();
                if self.current == Some('.') {
                    self.bump();
                    if self.current == Some('.') {
                        self.bump();
                        TokenKind::Ellipsis
                    } else {
                        TokenKind::DotDot
                    }
                } else {
                    TokenKind::Dot
                }
            }
            other => {
                self.bump();
                self.error(start, self.offset, format!("Unexpected character `{other}`"));
                return;
            }
        };
        self.push_token(kind, start, self.offset);
    }
}
