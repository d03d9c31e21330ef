//! HTTP header mapping
//!
//! Header names are stored in their canonical `Capitalized-Hyphenated`
//! form, looked up case-insensitively, and iterated in order of first
//! appearance. A repeated name is folded into the first entry.

use super::{Error, Result, Status};
use std::fmt;

/// HTTP headers collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Set a header, replacing any existing value for the same name
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(idx) => self.headers[idx].1 = value,
            None => self.headers.push((canonical_name(name), value)),
        }
    }

    /// Add a value for a header
    ///
    /// A second value for an existing name is joined to the first one
    /// with `", "`, keeping the position of the first occurrence.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(idx) => {
                let existing = &mut self.headers[idx].1;
                if existing.is_empty() {
                    *existing = value;
                } else if !value.is_empty() {
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
            }
            None => self.headers.push((canonical_name(name), value)),
        }
    }

    /// Get the value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|idx| self.headers[idx].1.as_str())
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Check whether a comma-separated header contains `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    /// Remove a header, returning its value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|idx| self.headers.remove(idx).1)
    }

    /// Get the number of distinct headers
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Clear all headers
    pub fn clear(&mut self) {
        self.headers.clear();
    }

    /// Iterate over all headers in first-occurrence order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Append folded continuation text to the most recent header
    pub(crate) fn continue_last(&mut self, text: &str) -> Result<()> {
        match self.headers.last_mut() {
            Some((_, value)) => {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(text.trim());
                Ok(())
            }
            None => Err(Error::framing(
                Status::BAD_REQUEST,
                "Bad Request (continuation before first header)",
            )),
        }
    }

    /// Parse a header line into name and value
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let colon_pos = line.find(':').ok_or_else(|| {
            Error::framing(
                Status::BAD_REQUEST,
                format!("Bad Request (no colon in header: {})", line),
            )
        })?;

        let name = line[..colon_pos].trim();
        let value = line[colon_pos + 1..].trim();

        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::framing(
                Status::BAD_REQUEST,
                format!("Bad Request (malformed header name: {:?})", name),
            ));
        }

        Ok((name.to_string(), value.to_string()))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// Normalize a header name to `Capitalized-Hyphenated` form
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name.as_ref(), value);
        }
        headers
    }
}
