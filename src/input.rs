use core::fmt;

use crate::{Cell, Error};

/// Size of the scratch buffer shared by the tokenizer and error
/// formatting.
pub const SCRATCH_SIZE: usize = 512;

/// Bounded scratch space.
///
/// The tokenizer leaves the current word here; the error formatter
/// overwrites it freely. After any error the previous contents are gone.
pub struct Scratch {
    buf: [u8; SCRATCH_SIZE],
    len: usize,
}

impl Scratch {
    pub(crate) fn new() -> Self {
        Self {
            buf: [0; SCRATCH_SIZE],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push(&mut self, byte: u8) -> Result<(), Error> {
        if self.len == SCRATCH_SIZE {
            return Err(Error::OutOfScratch);
        }
        self.buf[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }
}

impl fmt::Write for Scratch {
    /// Truncating write; message formatting never fails.
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = SCRATCH_SIZE - self.len;
        let mut take = s.len().min(room);
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// One token from the input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// A signed decimal literal.
    Number(Cell),
    /// A word; its bytes were copied into scratch.
    Word,
    /// Input exhausted.
    End,
}

/// Cursor over one borrowed chunk of source text.
///
/// Tokens are whitespace-delimited. A `-` immediately followed by a digit
/// begins a number; `\` discards the rest of the line; anything else that
/// is not whitespace is a word.
pub struct Tokenizer<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    pub fn next_token(&mut self, scratch: &mut Scratch) -> Result<Token, Error> {
        loop {
            let c = match self.peek() {
                Some(c) => c,
                None => return Ok(Token::End),
            };
            if c.is_ascii_whitespace() {
                self.pos += 1;
                continue;
            }
            if c == b'\\' {
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == b'\n' {
                        break;
                    }
                }
                continue;
            }
            let negative = c == b'-'
                && matches!(self.input.get(self.pos + 1), Some(d) if d.is_ascii_digit());
            if negative || c.is_ascii_digit() {
                if negative {
                    self.pos += 1;
                }
                let mut n: Cell = 0;
                while let Some(d) = self.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    n = n.wrapping_mul(10).wrapping_add((d - b'0') as Cell);
                    self.pos += 1;
                }
                return Ok(Token::Number(if negative { n.wrapping_neg() } else { n }));
            }
            // A word: maximal non-whitespace run, copied into scratch.
            scratch.clear();
            while let Some(c) = self.peek() {
                if c.is_ascii_whitespace() {
                    break;
                }
                scratch.push(c)?;
                self.pos += 1;
            }
            return Ok(Token::Word);
        }
    }
}

#[cfg(test)]
pub mod test {
    use super::{Scratch, Token, Tokenizer, SCRATCH_SIZE};
    use crate::Error;

    fn tokens_of(input: &str) -> Vec<(Token, String)> {
        let mut scratch = Scratch::new();
        let mut tok = Tokenizer::new(input.as_bytes());
        let mut out = Vec::new();
        loop {
            match tok.next_token(&mut scratch).unwrap() {
                Token::End => return out,
                t @ Token::Word => out.push((t, scratch.as_str().to_string())),
                t => out.push((t, String::new())),
            }
        }
    }

    #[test]
    fn numbers_and_words() {
        assert_eq!(
            tokens_of("1 -25 dup -"),
            vec![
                (Token::Number(1), String::new()),
                (Token::Number(-25), String::new()),
                (Token::Word, "dup".to_string()),
                (Token::Word, "-".to_string()),
            ]
        );
    }

    #[test]
    fn maximal_digit_run() {
        // A trailing non-digit starts a fresh token.
        assert_eq!(
            tokens_of("5x"),
            vec![
                (Token::Number(5), String::new()),
                (Token::Word, "x".to_string()),
            ]
        );
    }

    #[test]
    fn line_comments() {
        assert_eq!(
            tokens_of("1 \\ 2 3 4 5\r\n6"),
            vec![
                (Token::Number(1), String::new()),
                (Token::Number(6), String::new()),
            ]
        );
        // Comment at end of input, no newline.
        assert_eq!(tokens_of("\\ nothing here"), vec![]);
    }

    #[test]
    fn word_too_long_for_scratch() {
        let long = "w".repeat(SCRATCH_SIZE + 1);
        let mut scratch = Scratch::new();
        let mut tok = Tokenizer::new(long.as_bytes());
        assert_eq!(tok.next_token(&mut scratch), Err(Error::OutOfScratch));
    }

    #[test]
    fn scratch_write_truncates() {
        use core::fmt::Write;
        let mut scratch = Scratch::new();
        for _ in 0..SCRATCH_SIZE {
            scratch.push(b'a').unwrap();
        }
        // Full scratch silently drops formatted output.
        write!(&mut scratch, "more").unwrap();
        assert_eq!(scratch.as_bytes().len(), SCRATCH_SIZE);
    }
}
