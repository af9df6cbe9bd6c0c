use crate::frontend::token::{Token, TokenKind};

pub struct TokenDumper {
    pub color: bool,
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self { color: true }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";
    const RED: &'static str = "\x1b[31m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn dump(&self, tokens: &[Token]) {
        for token in tokens {
            self.print_one(token);
        }
    }

    fn print_one(&self, token: &Token) {
        let group = self.group(token.kind);
        let colr = if self.color { self.color(token.kind) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        match token.kind {
            TokenKind::Eof => {
                println!("[{:03}] {}{:<8} EOF{}", token.line, colr, group, reset);
            }
            TokenKind::String => {
                println!(
                    "[{:03}] {}{:<8} {:?}{}",
                    token.line, colr, group, token.lexeme, reset
                );
            }
            _ => {
                println!(
                    "[{:03}] {}{:<8} {}{}",
                    token.line, colr, group, token.lexeme, reset
                );
            }
        }
    }

    fn group(&self, kind: TokenKind) -> &'static str {
        use TokenKind::*;
        match kind {
            Eof => "EOF",
            Error => "ERROR",

            // literals
            Number => "NUMBER",
            String => "STRING",
            True | False | Nil => "LITERAL",

            // names
            Identifier => "IDENT",

            // structure
            LeftParen | RightParen => "PAREN",
            LeftBrace | RightBrace => "BRACE",
            Comma | Dot | Semicolon => "PUNCT",

            // ops / comparisons
            Plus | Minus | Star | Slash | Bang | Equal => "OP",
            BangEqual | EqualEqual | Greater | GreaterEqual | Less | LessEqual => "CMP",

            // everything else = keyword
            _ => "KEYWORD",
        }
    }

    fn color(&self, kind: TokenKind) -> &'static str {
        use TokenKind::*;
        match kind {
            Eof => Self::DIM,
            Error => Self::RED,
            String => Self::GRN,
            Number | True | False | Nil => Self::CYN,
            Identifier => Self::YEL,
            Plus | Minus | Star | Slash | Bang | Equal => Self::MAG,
            BangEqual | EqualEqual | Greater | GreaterEqual | Less | LessEqual => Self::MAG,
            _ => Self::RESET,
        }
    }
}
