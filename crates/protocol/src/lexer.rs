//! Tokeniser shared by the wire protocol and the daemon configuration file.
//!
//! The input is a byte buffer holding one or more lines.  Tokens are bare
//! words, quoted strings (quotes stripped, contents undecoded so the
//! take-out encoding survives), signed integers, single characters, and
//! explicit end-of-line markers.  `#` starts a comment running to end of
//! line, and a backslash immediately before a line terminator continues
//! the logical line.

use thiserror::Error;

/// A single lexical token borrowed from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    /// A bare word: `[A-Za-z_][A-Za-z0-9_]*`.  Keyword recognition is the
    /// caller's concern (matched case-insensitively).
    Word(&'a str),
    /// A quoted string with the delimiters stripped.  The bytes are left
    /// undecoded; pass through [`crate::takeout::decode`] to recover
    /// embedded quotes.
    Str(&'a [u8]),
    /// A signed integer: `[-+]?[0-9]+`.
    Int(i64),
    /// Any other single character (`=` being the common one).
    Char(u8),
    /// End of line (CR, LF, or CR-LF).
    Eol,
    /// End of input.
    Eof,
}

/// Lexing failures.  The line number is 1-based.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unmatched quote on line {line}")]
    UnmatchedQuote { line: u32 },
    #[error("integer out of range on line {line}")]
    IntegerOutOfRange { line: u32 },
}

/// Streaming tokeniser over a borrowed byte buffer.
pub struct Lexer<'a> {
    buf: &'a [u8],
    pos: usize,
    line: u32,
    got_eol: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            line: 0,
            got_eol: true,
        }
    }

    /// The 1-based line number of the most recently returned token.
    pub fn line(&self) -> u32 {
        self.line
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.buf.get(self.pos + ahead).copied()
    }

    /// Returns the next token, skipping whitespace and comments.
    pub fn next_token(&mut self) -> Result<Token<'a>, LexError> {
        if self.got_eol {
            // Deferred line count increment so Eol reports its own line.
            self.line += 1;
            self.got_eol = false;
        }
        loop {
            let Some(c) = self.peek(0) else {
                return Ok(Token::Eof);
            };
            match c {
                b' ' | b'\t' | b'\x0b' | b'\x0c' => {
                    self.pos += 1;
                }
                b'#' => {
                    match memchr::memchr2(b'\n', b'\r', &self.buf[self.pos..]) {
                        Some(off) => self.pos += off,
                        None => self.pos = self.buf.len(),
                    }
                }
                b'\r' | b'\n' => {
                    if c == b'\r' && self.peek(1) == Some(b'\n') {
                        self.pos += 1;
                    }
                    self.pos += 1;
                    self.got_eol = true;
                    return Ok(Token::Eol);
                }
                b'"' | b'\'' => {
                    let quote = c;
                    let start = self.pos + 1;
                    let end = match memchr::memchr3(quote, b'\r', b'\n', &self.buf[start..]) {
                        Some(off) => start + off,
                        None => self.buf.len(),
                    };
                    if self.buf.get(end).copied() == Some(quote) {
                        self.pos = end + 1;
                        return Ok(Token::Str(&self.buf[start..end]));
                    }
                    self.pos = end;
                    return Err(LexError::UnmatchedQuote { line: self.line });
                }
                b'\\' => {
                    // Line continuation; anything else falls through to a
                    // single-char token.
                    if self.peek(1) == Some(b'\n') {
                        self.pos += 2;
                        self.line += 1;
                        continue;
                    }
                    if self.peek(1) == Some(b'\r') && self.peek(2) == Some(b'\n') {
                        self.pos += 3;
                        self.line += 1;
                        continue;
                    }
                    self.pos += 1;
                    return Ok(Token::Char(c));
                }
                _ => return self.lex_word_int_or_char(c),
            }
        }
    }

    fn lex_word_int_or_char(&mut self, c: u8) -> Result<Token<'a>, LexError> {
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.pos;
            let mut end = start + 1;
            while let Some(b) = self.buf.get(end).copied() {
                if b.is_ascii_alphanumeric() || b == b'_' {
                    end += 1;
                } else {
                    break;
                }
            }
            self.pos = end;
            // Word bytes are ASCII by construction.
            let word = std::str::from_utf8(&self.buf[start..end])
                .expect("bare words are ASCII");
            return Ok(Token::Word(word));
        }
        let is_signed_digit = (c == b'-' || c == b'+')
            && self.peek(1).is_some_and(|b| b.is_ascii_digit());
        if c.is_ascii_digit() || is_signed_digit {
            let start = self.pos;
            let mut end = start + 1;
            while let Some(b) = self.buf.get(end).copied() {
                if b.is_ascii_digit() {
                    end += 1;
                } else {
                    break;
                }
            }
            self.pos = end;
            let text = std::str::from_utf8(&self.buf[start..end])
                .expect("integer tokens are ASCII");
            let value: i64 = text
                .parse()
                .map_err(|_| LexError::IntegerOutOfRange { line: self.line })?;
            return Ok(Token::Int(value));
        }
        self.pos += 1;
        Ok(Token::Char(c))
    }

    /// Skips tokens until the next [`Token::Eol`] or [`Token::Eof`],
    /// consuming the terminator.  Used by parsers to resynchronise after
    /// an unrecognised directive.
    pub fn skip_line(&mut self) -> Result<(), LexError> {
        loop {
            match self.next_token() {
                Ok(Token::Eol | Token::Eof) => return Ok(()),
                Ok(_) => {}
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(input: &[u8]) -> Vec<Token<'_>> {
        let mut lex = Lexer::new(input);
        let mut toks = Vec::new();
        loop {
            let tok = lex.next_token().expect("lex ok");
            let done = tok == Token::Eof;
            toks.push(tok);
            if done {
                break;
            }
        }
        toks
    }

    #[test]
    fn words_ints_chars_and_eol() {
        let toks = collect(b"CONNECT CONSOLE='web1' PORT=7890\n");
        assert_eq!(
            toks,
            vec![
                Token::Word("CONNECT"),
                Token::Word("CONSOLE"),
                Token::Char(b'='),
                Token::Str(b"web1"),
                Token::Word("PORT"),
                Token::Char(b'='),
                Token::Int(7890),
                Token::Eol,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let toks = collect(b"A # trailing words 'unclosed\nB\n");
        assert_eq!(
            toks,
            vec![
                Token::Word("A"),
                Token::Eol,
                Token::Word("B"),
                Token::Eol,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn crlf_is_one_eol() {
        let toks = collect(b"A\r\nB\rC\n");
        assert_eq!(
            toks,
            vec![
                Token::Word("A"),
                Token::Eol,
                Token::Word("B"),
                Token::Eol,
                Token::Word("C"),
                Token::Eol,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn double_quotes_and_empty_strings() {
        let toks = collect(b"LOG=\"\" DEV=\"a b\"\n");
        assert_eq!(toks[2], Token::Str(b""));
        assert_eq!(toks[6], Token::Str(b"a b"));
    }

    #[test]
    fn unmatched_quote_is_an_error() {
        let mut lex = Lexer::new(b"NAME='oops\n");
        assert_eq!(lex.next_token(), Ok(Token::Word("NAME")));
        assert_eq!(lex.next_token(), Ok(Token::Char(b'=')));
        assert_eq!(
            lex.next_token(),
            Err(LexError::UnmatchedQuote { line: 1 })
        );
    }

    #[test]
    fn backslash_continues_the_line() {
        let toks = collect(b"A \\\nB\n");
        assert_eq!(
            toks,
            vec![Token::Word("A"), Token::Word("B"), Token::Eol, Token::Eof]
        );
    }

    #[test]
    fn negative_integers_parse() {
        let toks = collect(b"-12 +3\n");
        assert_eq!(toks[0], Token::Int(-12));
        assert_eq!(toks[1], Token::Int(3));
    }

    #[test]
    fn line_numbers_follow_eol_tokens() {
        let mut lex = Lexer::new(b"A\nB\n");
        lex.next_token().expect("A");
        assert_eq!(lex.line(), 1);
        lex.next_token().expect("eol");
        lex.next_token().expect("B");
        assert_eq!(lex.line(), 2);
    }

    #[test]
    fn quoted_bytes_pass_through_undecoded() {
        // A high-bit byte inside quotes must survive for takeout::decode.
        let input = [b'X', b'=', b'\'', 0xA7, b'\'', b'\n'];
        let mut lex = Lexer::new(&input);
        lex.next_token().expect("X");
        lex.next_token().expect("=");
        assert_eq!(lex.next_token(), Ok(Token::Str(&[0xA7][..])));
    }
}
