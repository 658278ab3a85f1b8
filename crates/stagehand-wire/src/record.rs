//! Attribute records: the schema-checked key/value payloads of the protocol
//!
//! Sub-command payloads, plugin capability probes, plugin result files, and
//! the xfer-info/go-ahead/ack exchanges all travel as attribute records: an
//! ordered set of `Key = Value` lines where a value is a quoted string, an
//! integer, a boolean, or a brace-delimited list of quoted strings. Records
//! in a sequence are separated by blank lines.

use std::fmt;

use stagehand_types::{Error, Result};

/// A typed attribute value inside a record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    /// A string, quoted on the wire
    Str(String),
    /// A 64-bit integer
    Int(i64),
    /// A boolean, `true`/`false` on the wire
    Bool(bool),
    /// A parallel list of strings, `{ "a", "b" }` on the wire
    StrList(Vec<String>),
}

impl fmt::Display for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "\"{}\"", escape(s)),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::StrList(items) => {
                write!(f, "{{ ")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\"", escape(item))?;
                }
                write!(f, " }}")
            }
        }
    }
}

/// An ordered attribute record
///
/// Insertion order is preserved so records serialize deterministically,
/// which the tests and the stats log rely on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrRecord {
    entries: Vec<(String, RecordValue)>,
}

impl AttrRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an attribute
    pub fn insert<K: Into<String>>(&mut self, key: K, value: RecordValue) {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Insert a string attribute, returning the record for chaining
    pub fn with_str<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.insert(key, RecordValue::Str(value.into()));
        self
    }

    /// Insert an integer attribute, returning the record for chaining
    pub fn with_int<K: Into<String>>(mut self, key: K, value: i64) -> Self {
        self.insert(key, RecordValue::Int(value));
        self
    }

    /// Insert a boolean attribute, returning the record for chaining
    pub fn with_bool<K: Into<String>>(mut self, key: K, value: bool) -> Self {
        self.insert(key, RecordValue::Bool(value));
        self
    }

    /// Insert a string-list attribute, returning the record for chaining
    pub fn with_list<K: Into<String>>(mut self, key: K, value: Vec<String>) -> Self {
        self.insert(key, RecordValue::StrList(value));
        self
    }

    /// Look up an attribute
    pub fn get(&self, key: &str) -> Option<&RecordValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Look up a string attribute
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(RecordValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Look up an integer attribute
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(RecordValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Look up a boolean attribute
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(RecordValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Look up a string-list attribute
    pub fn get_list(&self, key: &str) -> Option<&[String]> {
        match self.get(key) {
            Some(RecordValue::StrList(items)) => Some(items),
            _ => None,
        }
    }

    /// Fetch a string attribute the schema requires
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .ok_or_else(|| Error::protocol(format!("record missing string attribute {key}")))
    }

    /// Fetch an integer attribute the schema requires
    pub fn require_int(&self, key: &str) -> Result<i64> {
        self.get_int(key)
            .ok_or_else(|| Error::protocol(format!("record missing integer attribute {key}")))
    }

    /// Fetch a boolean attribute the schema requires
    pub fn require_bool(&self, key: &str) -> Result<bool> {
        self.get_bool(key)
            .ok_or_else(|| Error::protocol(format!("record missing boolean attribute {key}")))
    }

    /// Fetch a string-list attribute the schema requires
    pub fn require_list(&self, key: &str) -> Result<&[String]> {
        self.get_list(key)
            .ok_or_else(|| Error::protocol(format!("record missing list attribute {key}")))
    }

    /// Whether the record has no attributes
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate attributes in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RecordValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parse one record from its wire text
    pub fn parse(text: &str) -> Result<Self> {
        let mut record = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, raw) = line
                .split_once('=')
                .ok_or_else(|| Error::protocol(format!("malformed record line: {line:?}")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::protocol(format!("record line without key: {line:?}")));
            }
            record.insert(key, parse_value(raw.trim())?);
        }
        Ok(record)
    }

    /// Parse a sequence of blank-line-separated records
    pub fn parse_sequence(text: &str) -> Result<Vec<Self>> {
        let mut records = Vec::new();
        for chunk in text.split("\n\n") {
            if chunk.trim().is_empty() {
                continue;
            }
            records.push(Self::parse(chunk)?);
        }
        Ok(records)
    }

    /// Serialize a sequence of records to wire text
    pub fn write_sequence(records: &[Self]) -> String {
        records
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for AttrRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            writeln!(f, "{key} = {value}")?;
        }
        Ok(())
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a quoted string off the front of `raw`, returning the unescaped
/// content and the remainder after the closing quote
fn take_quoted(raw: &str) -> Result<(String, &str)> {
    let rest = raw
        .strip_prefix('"')
        .ok_or_else(|| Error::protocol(format!("expected quoted string: {raw:?}")))?;
    let mut escaped = false;
    for (idx, c) in rest.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Ok((unescape(&rest[..idx]), &rest[idx + 1..]));
        }
    }
    Err(Error::protocol(format!("unterminated string: {raw:?}")))
}

fn parse_value(raw: &str) -> Result<RecordValue> {
    if raw.starts_with('"') {
        let (value, rest) = take_quoted(raw)?;
        if !rest.trim().is_empty() {
            return Err(Error::protocol(format!("trailing data after string: {raw:?}")));
        }
        return Ok(RecordValue::Str(value));
    }
    if let Some(body) = raw.strip_prefix('{') {
        let body = body
            .strip_suffix('}')
            .ok_or_else(|| Error::protocol(format!("unterminated list: {raw:?}")))?;
        let mut items = Vec::new();
        let mut rest = body.trim();
        while !rest.is_empty() {
            let (item, after) = take_quoted(rest)?;
            items.push(item);
            rest = after.trim();
            if let Some(after_comma) = rest.strip_prefix(',') {
                rest = after_comma.trim();
            } else if !rest.is_empty() {
                return Err(Error::protocol(format!("malformed list: {raw:?}")));
            }
        }
        return Ok(RecordValue::StrList(items));
    }
    match raw {
        "true" | "TRUE" | "True" => return Ok(RecordValue::Bool(true)),
        "false" | "FALSE" | "False" => return Ok(RecordValue::Bool(false)),
        _ => {}
    }
    raw.parse::<i64>()
        .map(RecordValue::Int)
        .map_err(|_| Error::protocol(format!("unrecognised record value: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let record = AttrRecord::new()
            .with_str("PluginType", "FileTransfer")
            .with_str("SupportedMethods", "http,https")
            .with_bool("MultipleFileSupport", true)
            .with_int("PluginVersion", 2)
            .with_list("Urls", vec!["s3://a/b".into(), "".into()]);

        let text = record.to_string();
        let parsed = AttrRecord::parse(&text).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_string_escaping() {
        let record = AttrRecord::new().with_str("Reason", "said \"no\" via C:\\path");
        let parsed = AttrRecord::parse(&record.to_string()).unwrap();
        assert_eq!(parsed.get_str("Reason"), Some("said \"no\" via C:\\path"));
    }

    #[test]
    fn test_sequence_round_trip() {
        let records = vec![
            AttrRecord::new()
                .with_str("Url", "http://example/x")
                .with_str("LocalFileName", "x"),
            AttrRecord::new()
                .with_str("Url", "http://example/y")
                .with_str("LocalFileName", "y"),
        ];
        let text = AttrRecord::write_sequence(&records);
        let parsed = AttrRecord::parse_sequence(&text).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_schema_checks() {
        let record = AttrRecord::new().with_int("Result", 1);
        assert!(record.require_int("Result").is_ok());
        assert!(record.require_str("Result").is_err());
        assert!(record.require_int("Missing").is_err());
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(AttrRecord::parse("NoEquals").is_err());
        assert!(AttrRecord::parse("Key = \"unterminated").is_err());
        assert!(AttrRecord::parse("Key = {\"a\"").is_err());
        assert!(AttrRecord::parse("Key = nonsense").is_err());
    }

    #[test]
    fn test_insert_replaces() {
        let mut record = AttrRecord::new().with_int("A", 1);
        record.insert("A", RecordValue::Int(2));
        assert_eq!(record.get_int("A"), Some(2));
        assert_eq!(record.iter().count(), 1);
    }
}
