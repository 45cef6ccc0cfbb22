//! Parser for RouterOS `print detail` style output.
//!
//! The appliance prints records as `key="value"` pairs with a handful of
//! quirks any consumer has to survive:
//!
//! - list views open with a `Flags:` legend line that is not part of any
//!   record;
//! - long records wrap; continuation lines are indented deeper than the
//!   item index column;
//! - numeric values may be printed as space-separated digit groups
//!   (`file-size=7 949 127 950 336`);
//! - records open with an item index, optionally followed by flag letters
//!   (` 0 XE slot="..."`).
//!
//! The parser joins wrapped lines, strips the legend, tokenizes on unquoted
//! whitespace, re-joins digit groups, and ignores keys it does not know.
//! It performs no I/O and no retries; callers own both.

use std::collections::HashMap;

/// One parsed appliance record.
#[derive(Debug, Default, Clone)]
pub struct Record {
    /// Item index as printed by the appliance, if present.
    pub index: Option<u32>,
    /// Flag letters attached to the item (`X`, `E`, ...), if any.
    pub flags: String,
    fields: HashMap<String, String>,
}

impl Record {
    /// Look up a field value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Look up a field and parse it as an unsigned integer, tolerating the
    /// appliance's space-grouped digit rendering.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        let raw = self.fields.get(key)?;
        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        compact.parse().ok()
    }

    /// Whether the record carries a given boolean flag field (`yes`/`no`).
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.fields.get(key).map(String::as_str) {
            Some("yes") | Some("true") => Some(true),
            Some("no") | Some("false") => Some(false),
            _ => None,
        }
    }

    #[cfg(test)]
    fn set(&mut self, key: &str, value: &str) {
        self.fields.insert(key.into(), value.into());
    }
}

/// Parse `print detail` output into records.
pub fn parse_detail(output: &str) -> Vec<Record> {
    let mut records = Vec::new();
    for logical in logical_records(output) {
        if let Some(record) = parse_record(&logical) {
            records.push(record);
        }
    }
    records
}

// Joins wrapped lines back into one logical line per record. A record line
// starts at the left margin with the item index; continuations are indented
// past the index column.
fn logical_records(output: &str) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("Flags:") {
            continue;
        }
        if starts_new_record(line) {
            if !current.is_empty() {
                result.push(std::mem::take(&mut current));
            }
            current.push_str(trimmed);
        } else if !current.is_empty() {
            current.push(' ');
            current.push_str(trimmed);
        }
        // A continuation with no open record means the output did not start
        // with an index line; such lines are dropped.
    }
    if !current.is_empty() {
        result.push(current);
    }
    result
}

// Record lines carry the index within the first three columns; wrapped value
// lines are indented deeper, even when they happen to start with digits.
fn starts_new_record(line: &str) -> bool {
    let indent = line.len() - line.trim_start().len();
    if indent > 2 {
        return false;
    }
    let mut chars = line.trim_start().chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => {}
        _ => return false,
    }
    for c in chars {
        if c.is_ascii_digit() {
            continue;
        }
        return c.is_whitespace();
    }
    // A line that is only digits is a wrapped digit group, not an index.
    false
}

fn parse_record(logical: &str) -> Option<Record> {
    let tokens = tokenize(logical);
    let mut record = Record::default();
    let mut last_numeric_key: Option<String> = None;
    let mut seen_field = false;

    for token in tokens {
        if let Some((key, value)) = split_field(&token) {
            let is_numeric = !value.is_empty() && value.chars().all(|c| c.is_ascii_digit());
            last_numeric_key = is_numeric.then(|| key.clone());
            record.fields.insert(key, value);
            seen_field = true;
            continue;
        }
        // Bare tokens: the leading index, flag letters, or a wrapped digit
        // group belonging to the previous numeric value.
        if !seen_field && record.index.is_none() {
            if let Ok(index) = token.parse::<u32>() {
                record.index = Some(index);
                continue;
            }
        }
        if !seen_field
            && record.flags.is_empty()
            && token.chars().all(|c| c.is_ascii_uppercase())
        {
            record.flags = token;
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            if let Some(ref key) = last_numeric_key {
                if let Some(value) = record.fields.get_mut(key) {
                    value.push_str(&token);
                    continue;
                }
            }
        }
        // Anything else is an unknown bare word; ignored.
    }

    (record.index.is_some() || !record.fields.is_empty()).then_some(record)
}

// Splits a `key=value` token, stripping one level of surrounding quotes
// from the value.
fn split_field(token: &str) -> Option<(String, String)> {
    let (key, value) = token.split_once('=')?;
    if key.is_empty() || !key.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key.to_string(), value.to_string()))
}

// Whitespace tokenizer that keeps quoted spans intact.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
