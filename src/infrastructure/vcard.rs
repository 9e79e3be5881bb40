//! vCard contact file reader.
//!
//! Only the fields needed for name resolution are read: `N` (given name),
//! `FN` (formatted name), `TEL` and `EMAIL`.

use std::fs;
use std::path::Path;

use crate::domain::{AppError, Contact, ContactDirectory, Result};

/// Load a contact directory from a vCard file holding any number of cards.
///
/// # Errors
/// Returns error if the file cannot be read or a card is never closed.
pub fn load_contacts(path: &Path) -> Result<ContactDirectory> {
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::io(format!("read contacts file {}", path.display()), e))?;
    let dir = parse_vcards(&content)?;
    tracing::info!(
        path = %path.display(),
        contacts = dir.len(),
        "Loaded contacts"
    );
    Ok(dir)
}

/// Parse vCard text into a contact directory.
///
/// # Errors
/// Returns a configuration error on a malformed card structure.
pub fn parse_vcards(content: &str) -> Result<ContactDirectory> {
    let mut dir = ContactDirectory::new();
    let mut current: Option<(Contact, Vec<String>)> = None;

    for line in unfold(content) {
        let Some((name, value)) = split_property(&line) else {
            continue;
        };
        match name.as_str() {
            "BEGIN" if value.eq_ignore_ascii_case("VCARD") => {
                if current.is_some() {
                    return Err(AppError::config("decode vcard: nested BEGIN:VCARD"));
                }
                current = Some((Contact::default(), Vec::new()));
            }
            "END" if value.eq_ignore_ascii_case("VCARD") => {
                let (contact, addresses) = current
                    .take()
                    .ok_or_else(|| AppError::config("decode vcard: END:VCARD without BEGIN"))?;
                for (address, previous) in dir.insert(contact.clone(), addresses) {
                    tracing::warn!(
                        "multiple contacts {:?} and {:?} share the same phone or email {:?}",
                        previous,
                        contact.formatted_name,
                        address
                    );
                }
            }
            _ => {
                let Some((contact, addresses)) = current.as_mut() else {
                    continue;
                };
                match name.as_str() {
                    "FN" => contact.formatted_name = unescape(value),
                    "N" => {
                        contact.given_name = value.split(';').nth(1).map(unescape).unwrap_or_default();
                    }
                    "TEL" => addresses.push(sanitize_phone(value)),
                    "EMAIL" => addresses.push(unescape(value)),
                    _ => {}
                }
            }
        }
    }

    if current.is_some() {
        return Err(AppError::config("decode vcard: missing END:VCARD"));
    }
    Ok(dir)
}

/// Join folded continuation lines (lines starting with a space or tab).
fn unfold(content: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in content.lines() {
        let raw = raw.trim_end_matches('\r');
        if let Some(rest) = raw.strip_prefix([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        lines.push(raw.to_string());
    }
    lines
}

/// Split `group.NAME;PARAM=x:value` into the upper-cased bare name and value.
fn split_property(line: &str) -> Option<(String, &str)> {
    let (head, value) = line.split_once(':')?;
    let name = head.split(';').next().unwrap_or(head);
    let name = name.rsplit('.').next().unwrap_or(name);
    Some((name.to_ascii_uppercase(), value.trim()))
}

fn unescape(value: &str) -> String {
    value
        .replace("\\,", ",")
        .replace("\\;", ";")
        .replace("\\n", "\n")
        .replace("\\\\", "\\")
}

/// Strip the punctuation and whitespace the Messages database never stores.
fn sanitize_phone(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | '-') && !c.is_whitespace())
        .collect()
}
