//! Lexical analysis: turns the raw input string into a vector of tokens.
//!
//! The tokenizer is intentionally tiny – it knows nothing about semantics
//! beyond recognising keywords, identifiers, operators and literals.
//! Multi-character punctuators are matched before single-character ones to
//! avoid ambiguity.

use crate::error::{CompileError, CompileResult};

/// Kinds of tokens recognised by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
  Punctuator,
  Keyword,
  Ident,
  Num,
  Str,
  Eof,
}

/// Thin wrapper for lexical information needed by later stages.
#[derive(Debug, Clone)]
pub struct Token {
  pub kind: TokenKind,
  pub value: Option<i64>,
  /// Decoded bytes of a string literal, including the trailing NUL.
  pub contents: Option<Vec<u8>>,
  pub loc: usize,
  pub len: usize,
}

impl Token {
  /// Convenience constructor to keep the `tokenize` loop readable.
  pub fn new(kind: TokenKind, loc: usize, len: usize, value: Option<i64>) -> Self {
    Self {
      kind,
      value,
      contents: None,
      loc,
      len,
    }
  }
}

const KEYWORDS: [&str; 9] = [
  "return", "if", "else", "while", "for", "int", "char", "sizeof", "struct",
];

const PUNCTUATORS2: [&str; 4] = ["==", "!=", "<=", ">="];

/// Lex the input into a flat vector of tokens terminated by an `Eof` marker.
pub fn tokenize(input: &str) -> CompileResult<Vec<Token>> {
  let mut tokens = Vec::new();
  let bytes = input.as_bytes();
  let mut i = 0;

  while i < bytes.len() {
    let c = bytes[i];
    if c.is_ascii_whitespace() {
      i += 1;
      continue;
    }

    if c.is_ascii_digit() {
      let start = i;
      i += 1;
      while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
      }
      let text = &input[start..i];
      let value = text
        .parse::<i64>()
        .map_err(|err| CompileError::at(input, start, format!("invalid number: {err}")))?;
      tokens.push(Token::new(TokenKind::Num, start, i - start, Some(value)));
      continue;
    }

    if c == b'"' {
      let start = i;
      i += 1;
      let mut contents = Vec::new();
      loop {
        if i >= bytes.len() {
          return Err(CompileError::at(input, start, "unclosed string literal"));
        }
        match bytes[i] {
          b'"' => {
            i += 1;
            break;
          }
          b'\\' => {
            if i + 1 >= bytes.len() {
              return Err(CompileError::at(input, start, "unclosed string literal"));
            }
            contents.push(unescape(bytes[i + 1]));
            i += 2;
          }
          byte => {
            contents.push(byte);
            i += 1;
          }
        }
      }
      contents.push(b'\0');
      let mut token = Token::new(TokenKind::Str, start, i - start, None);
      token.contents = Some(contents);
      tokens.push(token);
      continue;
    }

    if c.is_ascii_alphabetic() || c == b'_' {
      let start = i;
      i += 1;
      while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
      }
      let text = &input[start..i];
      let kind = if KEYWORDS.contains(&text) {
        TokenKind::Keyword
      } else {
        TokenKind::Ident
      };
      tokens.push(Token::new(kind, start, i - start, None));
      continue;
    }

    if let Some(op) = PUNCTUATORS2
      .into_iter()
      .find(|op| input[i..].starts_with(op))
    {
      tokens.push(Token::new(TokenKind::Punctuator, i, op.len(), None));
      i += op.len();
      continue;
    }

    if matches!(
      c,
      b'+'
        | b'-'
        | b'*'
        | b'/'
        | b'('
        | b')'
        | b'{'
        | b'}'
        | b'['
        | b']'
        | b'<'
        | b'>'
        | b';'
        | b'='
        | b','
        | b'&'
        | b'.'
    ) {
      tokens.push(Token::new(TokenKind::Punctuator, i, 1, None));
      i += 1;
      continue;
    }

    let invalid_char = input[i..].chars().next().unwrap_or('\0');
    return Err(CompileError::at(
      input,
      i,
      format!("invalid token: '{invalid_char}'"),
    ));
  }

  tokens.push(Token::new(TokenKind::Eof, input.len(), 0, None));
  Ok(tokens)
}

fn unescape(byte: u8) -> u8 {
  match byte {
    b'a' => 0x07,
    b'b' => 0x08,
    b't' => b'\t',
    b'n' => b'\n',
    b'v' => 0x0b,
    b'f' => 0x0c,
    b'r' => b'\r',
    b'e' => 0x1b,
    b'0' => b'\0',
    other => other,
  }
}

/// Return the slice from the source that produced this token.
pub fn token_text<'a>(token: &Token, source: &'a str) -> &'a str {
  let end = token.loc + token.len;
  &source[token.loc..end]
}

/// Human-friendly description used in diagnostics.
pub fn describe_token(token: Option<&Token>, source: &str) -> String {
  match token {
    Some(t) => match t.kind {
      TokenKind::Eof => "EOF".to_string(),
      _ => token_text(t, source).to_string(),
    },
    None => "EOF".to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn kinds(source: &str) -> Vec<TokenKind> {
    tokenize(source)
      .unwrap()
      .into_iter()
      .map(|token| token.kind)
      .collect()
  }

  #[test]
  fn keywords_and_idents_are_distinguished() {
    let tokens = tokenize("int intx return returning").unwrap();
    assert_eq!(tokens[0].kind, TokenKind::Keyword);
    assert_eq!(tokens[1].kind, TokenKind::Ident);
    assert_eq!(tokens[2].kind, TokenKind::Keyword);
    assert_eq!(tokens[3].kind, TokenKind::Ident);
    assert_eq!(tokens[4].kind, TokenKind::Eof);
  }

  #[test]
  fn multi_char_punctuators_win_over_single() {
    let source = "a<=b == c";
    let tokens = tokenize(source).unwrap();
    assert_eq!(token_text(&tokens[1], source), "<=");
    assert_eq!(token_text(&tokens[3], source), "==");
  }

  #[test]
  fn string_literal_carries_nul_terminated_bytes() {
    let tokens = tokenize(r#""hi""#).unwrap();
    assert_eq!(tokens[0].kind, TokenKind::Str);
    assert_eq!(tokens[0].contents.as_deref(), Some(&b"hi\0"[..]));
    assert_eq!(tokens[0].len, 4);
  }

  #[test]
  fn string_escapes_are_decoded() {
    let tokens = tokenize(r#""a\tb\n\e\0\q""#).unwrap();
    let contents = tokens[0].contents.as_deref().unwrap();
    assert_eq!(contents, &[b'a', b'\t', b'b', b'\n', 0x1b, 0, b'q', 0]);
  }

  #[test]
  fn unclosed_string_is_an_error() {
    let err = tokenize(r#"  "oops"#).unwrap_err();
    assert!(err.to_string().contains("unclosed string literal"));
  }

  #[test]
  fn struct_member_access_tokens() {
    assert_eq!(
      kinds("s.x"),
      vec![
        TokenKind::Ident,
        TokenKind::Punctuator,
        TokenKind::Ident,
        TokenKind::Eof
      ]
    );
  }

  #[test]
  fn rejects_unknown_characters() {
    let err = tokenize("1 @ 2").unwrap_err();
    assert!(err.to_string().contains("invalid token"));
  }
}
