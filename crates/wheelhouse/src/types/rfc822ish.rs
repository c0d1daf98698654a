// Grammar comes from https://github.com/njsmith/posy/blob/main/src/vocab/rfc822ish.rs
// Licensed under MIT or Apache-2.0

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

/// The header-and-body shape shared by a wheel's `METADATA` and `WHEEL`
/// files. Nominally RFC 822; in practice the format is whatever Python's
/// `email.parser` accepts, which is rather more lenient. We parse the common
/// ground: header lines (with continuation lines embedding their newlines),
/// a blank line, then an optional free-form body.
#[derive(Debug, Clone)]
pub struct RFC822ish {
    fields: HashMap<String, Vec<String>>,
    /// Everything after the first blank line, if any. For `METADATA` this is
    /// the long description.
    pub body: Option<String>,
}

#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum RFC822ishError {
    #[error("malformed metadata headers: {0}")]
    Malformed(#[from] peg::error::ParseError<peg::str::LineCol>),

    #[error("multiple values for singleton key {0}")]
    Duplicate(String),

    #[error("missing required key {0}")]
    Missing(String),
}

peg::parser! {
    grammar headers() for str {
        rule line_ending()
            = quiet!{"\r\n" / "\r" / "\n"}
              / expected!("end of line")

        rule field_name() -> &'input str
            = quiet!{$(['\x21'..='\x39' | '\x3b'..='\x7e']+)}
              / expected!("field name")

        // Space and tab directly after the colon are dropped, any other
        // whitespace in the value is preserved.
        rule field_separator()
            = ":" [' ' | '\t']*

        rule field_value_piece()
            = [^ '\r' | '\n']*

        rule continuation_line_ending()
            = quiet!{line_ending() [' ' | '\t']} / expected!("continuation line")

        rule field_value() -> &'input str
            = $(field_value_piece() ** continuation_line_ending())

        rule field() -> (String, String)
            = n:field_name() field_separator() v:field_value()
                { (n.to_ascii_lowercase(), v.to_owned()) }

        rule fields() -> Vec<(String, String)>
            = field() ** line_ending()

        rule trailing_body() -> String
            = line_ending() line_ending() b:$([_]*) { b.to_owned() }

        // The final optional line_ending() absorbs a stray trailing newline
        // when there is no body.
        pub rule document() -> (Vec<(String, String)>, Option<String>)
            = f:fields() body:(trailing_body()?) line_ending()? { (f, body) }
    }
}

impl FromStr for RFC822ish {
    type Err = RFC822ishError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (raw_fields, body) = headers::document(input)?;
        let mut fields: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in raw_fields {
            fields.entry(name).or_default().push(value);
        }
        Ok(RFC822ish { fields, body })
    }
}

impl RFC822ish {
    /// Removes and returns every value recorded for `key`. Field names are
    /// case-insensitive.
    pub fn take_all(&mut self, key: &str) -> Vec<String> {
        self.fields
            .remove(&key.to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Removes a key that may appear at most once.
    pub fn maybe_take(&mut self, key: &str) -> Result<Option<String>, RFC822ishError> {
        let mut values = self.take_all(key);
        match values.len() {
            0 => Ok(None),
            1 => Ok(values.pop()),
            _ => Err(RFC822ishError::Duplicate(key.to_owned())),
        }
    }

    /// Removes a key that must appear exactly once.
    pub fn take(&mut self, key: &str) -> Result<String, RFC822ishError> {
        self.maybe_take(key)?
            .ok_or_else(|| RFC822ishError::Missing(key.to_owned()))
    }
}
