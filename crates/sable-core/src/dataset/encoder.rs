//! Column name encoding.
//!
//! User-facing column names can contain anything (spaces, operators,
//! non-ASCII). Code that reaches the runtime only ever sees encoded
//! identifiers such as `col3_enc`; messages coming back are decoded so the
//! user sees their own names again.

use rustc_hash::FxHashMap;

const ENCODED_PREFIX: &str = "col";
const ENCODED_SUFFIX: &str = "_enc";

/// Build the encoded identifier for column slot `index`.
pub fn encoded_name(index: usize) -> String {
    format!("{}{}{}", ENCODED_PREFIX, index, ENCODED_SUFFIX)
}

/// Slot number of an encoded identifier.
pub fn encoded_slot(name: &str) -> Option<usize> {
    let digits = name
        .strip_prefix(ENCODED_PREFIX)?
        .strip_suffix(ENCODED_SUFFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Whether `name` looks like an encoded identifier.
pub fn is_encoded_name(name: &str) -> bool {
    encoded_slot(name).is_some()
}

/// Bidirectional mapping between user names and encoded identifiers.
#[derive(Debug, Clone, Default)]
pub struct ColumnEncoder {
    to_encoded: FxHashMap<String, String>,
    to_user: FxHashMap<String, String>,
    /// User names sorted longest first so overlapping names resolve greedily.
    by_length: Vec<String>,
}

impl ColumnEncoder {
    /// Build an encoder from `(user name, encoded name)` pairs.
    pub fn new<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut encoder = Self::default();
        for (user, encoded) in pairs {
            encoder.to_encoded.insert(user.to_string(), encoded.to_string());
            encoder.to_user.insert(encoded.to_string(), user.to_string());
        }
        encoder.by_length = encoder.to_encoded.keys().cloned().collect();
        encoder
            .by_length
            .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        encoder
    }

    /// Encoded identifier of a user name.
    pub fn encode_name(&self, user: &str) -> Option<&str> {
        self.to_encoded.get(user).map(String::as_str)
    }

    /// User name of an encoded identifier.
    pub fn decode_name(&self, encoded: &str) -> Option<&str> {
        self.to_user.get(encoded).map(String::as_str)
    }

    /// Replace every column reference in `code` with its encoded identifier.
    ///
    /// Back-quoted names (`` `my column` ``) are replaced including the quotes.
    /// Bare names only match on identifier boundaries and never in call
    /// position, so a column called `mean` leaves `mean(x)` alone. String
    /// literals are left untouched.
    pub fn encode_all(&self, code: &str) -> String {
        self.rewrite(code, |encoder, rest| {
            if let Some(quoted) = rest.strip_prefix('`') {
                let end = quoted.find('`')?;
                let name = &quoted[..end];
                let encoded = encoder.to_encoded.get(name)?;
                return Some((end + 2, encoded.clone()));
            }

            encoder.by_length.iter().find_map(|name| {
                let after = rest.strip_prefix(name.as_str())?;
                if after.chars().next().is_some_and(is_ident_char)
                    || after.trim_start().starts_with('(')
                {
                    return None;
                }
                Some((name.len(), encoder.to_encoded[name].clone()))
            })
        })
    }

    /// Replace encoded identifiers in `text` with user names.
    pub fn decode_all(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();
        let mut prev_ident = false;

        while let Some((start, c)) = chars.next() {
            if !prev_ident && is_ident_start(c) {
                let mut end = start + c.len_utf8();
                while let Some(&(i, next)) = chars.peek() {
                    if !(next.is_alphanumeric() || next == '_') {
                        break;
                    }
                    end = i + next.len_utf8();
                    chars.next();
                }
                let word = &text[start..end];
                out.push_str(self.to_user.get(word).map_or(word, String::as_str));
                prev_ident = true;
                continue;
            }

            out.push(c);
            prev_ident = c.is_alphanumeric() || c == '_';
        }

        out
    }

    /// Walk `code`, skipping string literals, and let `replace` rewrite
    /// the text at every identifier boundary.
    fn rewrite(
        &self,
        code: &str,
        replace: impl Fn(&Self, &str) -> Option<(usize, String)>,
    ) -> String {
        let mut out = String::with_capacity(code.len());
        let mut pos = 0;
        let mut prev_ident = false;
        let mut quote: Option<char> = None;

        while pos < code.len() {
            let rest = &code[pos..];
            let Some(c) = rest.chars().next() else { break };

            if let Some(q) = quote {
                out.push(c);
                pos += c.len_utf8();
                if c == '\\' {
                    if let Some(escaped) = code[pos..].chars().next() {
                        out.push(escaped);
                        pos += escaped.len_utf8();
                    }
                } else if c == q {
                    quote = None;
                }
                continue;
            }

            if c == '"' || c == '\'' {
                quote = Some(c);
                out.push(c);
                pos += 1;
                prev_ident = false;
                continue;
            }

            if !prev_ident {
                if let Some((consumed, replacement)) = replace(self, rest) {
                    out.push_str(&replacement);
                    pos += consumed;
                    prev_ident = true;
                    continue;
                }
            }

            out.push(c);
            pos += c.len_utf8();
            prev_ident = is_ident_char(c);
        }

        out
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}
