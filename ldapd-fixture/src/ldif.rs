//! Streaming LDIF (RFC 2849) reader.
//!
//! Records are parsed one at a time from any [`BufRead`], so an import can apply
//! each record before the next one is read and stop at the first malformed one.
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Lines};
use thiserror::Error;
use url::Url;

use crate::dn;

/// LDIF syntax error, with the line it was found on
#[derive(Error, Debug)]
#[error("LDIF line {line}: {kind}")]
pub struct LdifError {
    /// 1-based line number
    pub line: usize,
    /// What went wrong
    pub kind: LdifErrorKind,
}

/// Kind of [`LdifError`]
#[derive(Error, Debug)]
pub enum LdifErrorKind {
    /// Reading the underlying stream failed
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    /// Continuation line with nothing to continue
    #[error("continuation line without a preceding line")]
    DanglingContinuation,
    /// `version:` other than 1
    #[error("unsupported LDIF version {0:?}")]
    Version(String),
    /// Record does not start with `dn:`
    #[error("record must start with dn, found {0:?}")]
    MissingDn(String),
    /// DN is syntactically wrong
    #[error("invalid DN {0:?}")]
    InvalidDn(String),
    /// Line has no `:` separator
    #[error("missing ':' in {0:?}")]
    MissingSeparator(String),
    /// Attribute description is empty or has bad characters
    #[error("invalid attribute name {0:?}")]
    InvalidAttribute(String),
    /// `::` value is not valid base64
    #[error("invalid base64 value for {0}")]
    Base64(String),
    /// `:<` value with a URL we cannot read
    #[error("cannot read value from {url}: {reason}")]
    Url {
        /// URL from the LDIF
        url: String,
        /// Reason
        reason: String,
    },
    /// Unknown `changetype:`
    #[error("unknown changetype {0:?}")]
    ChangeType(String),
    /// Line not allowed at this position of a record
    #[error("unexpected line {0:?}")]
    Unexpected(String),
    /// Mandatory field of a change record is absent
    #[error("missing {0}")]
    Missing(&'static str),
    /// Content record without any attribute
    #[error("entry has no attributes")]
    NoAttributes,
}

/// Entry to create, built from a content record or `changetype: add`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    dn: String,
    attributes: BTreeMap<String, BTreeSet<Vec<u8>>>,
}

impl ImportEntry {
    /// Entry without attributes
    pub fn new(dn: impl Into<String>) -> Self {
        ImportEntry {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add `value` to `name`, names compare case-insensitively
    pub fn add_value(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        let key = self
            .attributes
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_string());
        self.attributes.entry(key).or_default().insert(value.into());
    }

    /// Builder flavor of [`ImportEntry::add_value`]
    pub fn with(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.add_value(name, value);
        self
    }

    /// Distinguished name
    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// All attributes
    pub fn attributes(&self) -> &BTreeMap<String, BTreeSet<Vec<u8>>> {
        &self.attributes
    }

    /// Values of one attribute
    pub fn values(&self, name: &str) -> Option<&BTreeSet<Vec<u8>>> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Values of one attribute that are valid UTF-8
    pub fn str_values(&self, name: &str) -> Vec<&str> {
        self.values(name)
            .into_iter()
            .flatten()
            .filter_map(|v| std::str::from_utf8(v).ok())
            .collect()
    }
}

/// One `add:`/`delete:`/`replace:`/`increment:` block of a modify record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Add values
    Add(String, Vec<Vec<u8>>),
    /// Delete values, or the whole attribute when empty
    Delete(String, Vec<Vec<u8>>),
    /// Replace all values
    Replace(String, Vec<Vec<u8>>),
    /// Increment an integer attribute
    Increment(String, Vec<u8>),
}

/// One LDIF record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LdifRecord {
    /// Create an entry
    Add(ImportEntry),
    /// Remove an entry
    Delete {
        /// Entry to remove
        dn: String,
    },
    /// Change attributes of an entry
    Modify {
        /// Entry to change
        dn: String,
        /// Changes in file order
        mods: Vec<Modification>,
    },
    /// Rename or move an entry
    ModDn {
        /// Entry to rename
        dn: String,
        /// New RDN
        new_rdn: String,
        /// Remove the old RDN values
        delete_old_rdn: bool,
        /// New parent
        new_superior: Option<String>,
    },
}

impl LdifRecord {
    /// DN the record applies to
    pub fn dn(&self) -> &str {
        match self {
            LdifRecord::Add(entry) => entry.dn(),
            LdifRecord::Delete { dn }
            | LdifRecord::Modify { dn, .. }
            | LdifRecord::ModDn { dn, .. } => dn,
        }
    }
}

#[derive(Debug)]
struct Line {
    number: usize,
    text: String,
}

#[derive(Debug)]
struct Field {
    number: usize,
    name: String,
    value: Vec<u8>,
}

impl Field {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn text(&self) -> Result<String, LdifError> {
        String::from_utf8(self.value.clone())
            .map_err(|_| error(self.number, LdifErrorKind::Unexpected(self.name.clone())))
    }
}

fn error(line: usize, kind: LdifErrorKind) -> LdifError {
    LdifError { line, kind }
}

/// Iterator of [`LdifRecord`]s read from a [`BufRead`]
///
/// Yields `None` after the first error.
pub struct LdifReader<R> {
    lines: Lines<R>,
    line_number: usize,
    first_record: bool,
    failed: bool,
}

impl<R: BufRead> LdifReader<R> {
    /// Read records from `reader`
    pub fn new(reader: R) -> Self {
        LdifReader {
            lines: reader.lines(),
            line_number: 0,
            first_record: true,
            failed: false,
        }
    }

    /// Unfolded lines of the next record, comments dropped
    fn next_block(&mut self) -> Result<Vec<Line>, LdifError> {
        let mut block: Vec<Line> = vec![];
        let mut in_comment = false;

        while let Some(line) = self.lines.next() {
            self.line_number += 1;
            let line = line.map_err(|e| error(self.line_number, e.into()))?;
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                if block.is_empty() {
                    in_comment = false;
                    continue;
                }
                break;
            }

            if let Some(rest) = line.strip_prefix(' ') {
                if in_comment {
                    continue;
                }
                match block.last_mut() {
                    Some(last) => last.text.push_str(rest),
                    None => {
                        return Err(error(
                            self.line_number,
                            LdifErrorKind::DanglingContinuation,
                        ))
                    }
                }
                continue;
            }

            in_comment = line.starts_with('#');
            if !in_comment {
                block.push(Line {
                    number: self.line_number,
                    text: line.to_string(),
                });
            }
        }

        Ok(block)
    }

    fn next_record(&mut self) -> Result<Option<LdifRecord>, LdifError> {
        loop {
            let block = self.next_block()?;
            if block.is_empty() {
                return Ok(None);
            }

            let mut fields = block
                .into_iter()
                .map(parse_field)
                .collect::<Result<Vec<_>, _>>()?;

            if std::mem::take(&mut self.first_record) && fields[0].is("version") {
                let version = fields.remove(0);
                if version.value != b"1" {
                    return Err(error(
                        version.number,
                        LdifErrorKind::Version(String::from_utf8_lossy(&version.value).into()),
                    ));
                }
                if fields.is_empty() {
                    continue;
                }
            }

            return parse_record(fields).map(Some);
        }
    }
}

impl<R: BufRead> Iterator for LdifReader<R> {
    type Item = Result<LdifRecord, LdifError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse every record of an LDIF text
pub fn parse_str(text: &str) -> Result<Vec<LdifRecord>, LdifError> {
    LdifReader::new(text.as_bytes()).collect()
}

fn valid_attribute_name(name: &str) -> bool {
    let mut parts = name.split(';');
    let base = parts.next().unwrap_or_default();
    dn::valid_attribute_type(base)
        && parts.all(|o| !o.is_empty() && o.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

fn parse_field(line: Line) -> Result<Field, LdifError> {
    if line.text == "-" {
        return Ok(Field {
            number: line.number,
            name: "-".to_string(),
            value: vec![],
        });
    }

    let Some((name, rest)) = line.text.split_once(':') else {
        return Err(error(
            line.number,
            LdifErrorKind::MissingSeparator(line.text.clone()),
        ));
    };
    let name = name.trim_end().to_string();
    if !valid_attribute_name(&name) {
        return Err(error(line.number, LdifErrorKind::InvalidAttribute(name)));
    }

    let value = if let Some(encoded) = rest.strip_prefix(':') {
        STANDARD
            .decode(encoded.trim())
            .map_err(|_| error(line.number, LdifErrorKind::Base64(name.clone())))?
    } else if let Some(url) = rest.strip_prefix('<') {
        read_url(url.trim()).map_err(|kind| error(line.number, kind))?
    } else {
        rest.trim_start_matches(' ').as_bytes().to_vec()
    };

    Ok(Field {
        number: line.number,
        name,
        value,
    })
}

fn read_url(url: &str) -> Result<Vec<u8>, LdifErrorKind> {
    let bad = |reason: String| LdifErrorKind::Url {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| bad(e.to_string()))?;
    if parsed.scheme() != "file" {
        return Err(bad(format!("unsupported scheme {}", parsed.scheme())));
    }
    let path = parsed
        .to_file_path()
        .map_err(|_| bad("not a local path".to_string()))?;
    std::fs::read(&path).map_err(|e| bad(e.to_string()))
}

fn parse_record(fields: Vec<Field>) -> Result<LdifRecord, LdifError> {
    let mut fields = fields.into_iter().peekable();
    let Some(first) = fields.next() else {
        return Err(error(0, LdifErrorKind::Missing("dn")));
    };
    if !first.is("dn") {
        return Err(error(first.number, LdifErrorKind::MissingDn(first.name)));
    }
    let dn = first.text()?;
    if !dn::is_valid(&dn) {
        return Err(error(first.number, LdifErrorKind::InvalidDn(dn)));
    }
    let dn_line = first.number;

    while fields.next_if(|f| f.is("control")).is_some() {}

    let change_type = match fields.next_if(|f| f.is("changetype")) {
        Some(f) => Some((f.number, f.text()?.trim().to_ascii_lowercase())),
        None => None,
    };

    match change_type {
        None => parse_entry(dn, dn_line, fields),
        Some((_, kind)) if kind == "add" => parse_entry(dn, dn_line, fields),
        Some((_, kind)) if kind == "delete" => match fields.next() {
            Some(f) => Err(error(f.number, LdifErrorKind::Unexpected(f.name))),
            None => Ok(LdifRecord::Delete { dn }),
        },
        Some((_, kind)) if kind == "modrdn" || kind == "moddn" => parse_moddn(dn, dn_line, fields),
        Some((_, kind)) if kind == "modify" => parse_modify(dn, fields),
        Some((number, kind)) => Err(error(number, LdifErrorKind::ChangeType(kind))),
    }
}

fn parse_entry(
    dn: String,
    dn_line: usize,
    fields: impl Iterator<Item = Field>,
) -> Result<LdifRecord, LdifError> {
    let mut entry = ImportEntry::new(dn);
    for field in fields {
        if field.name == "-" || field.is("changetype") || field.is("dn") {
            return Err(error(field.number, LdifErrorKind::Unexpected(field.name)));
        }
        entry.add_value(&field.name, field.value);
    }
    if entry.attributes.is_empty() {
        return Err(error(dn_line, LdifErrorKind::NoAttributes));
    }
    Ok(LdifRecord::Add(entry))
}

fn parse_moddn(
    dn: String,
    dn_line: usize,
    mut fields: impl Iterator<Item = Field>,
) -> Result<LdifRecord, LdifError> {
    let new_rdn = match fields.next() {
        Some(f) if f.is("newrdn") => f.text()?,
        Some(f) => return Err(error(f.number, LdifErrorKind::Unexpected(f.name))),
        None => return Err(error(dn_line, LdifErrorKind::Missing("newrdn"))),
    };
    let delete_old_rdn = match fields.next() {
        Some(f) if f.is("deleteoldrdn") => match f.text()?.trim() {
            "0" => false,
            "1" => true,
            other => return Err(error(f.number, LdifErrorKind::Unexpected(other.to_string()))),
        },
        Some(f) => return Err(error(f.number, LdifErrorKind::Unexpected(f.name))),
        None => return Err(error(dn_line, LdifErrorKind::Missing("deleteoldrdn"))),
    };
    let new_superior = match fields.next() {
        Some(f) if f.is("newsuperior") => Some(f.text()?),
        Some(f) => return Err(error(f.number, LdifErrorKind::Unexpected(f.name))),
        None => None,
    };
    if let Some(f) = fields.next() {
        return Err(error(f.number, LdifErrorKind::Unexpected(f.name)));
    }

    Ok(LdifRecord::ModDn {
        dn,
        new_rdn,
        delete_old_rdn,
        new_superior,
    })
}

fn parse_modify(
    dn: String,
    fields: impl Iterator<Item = Field>,
) -> Result<LdifRecord, LdifError> {
    let mut mods = vec![];
    // operation, attribute, values, line of the operation
    let mut current: Option<(String, String, Vec<Vec<u8>>, usize)> = None;

    for field in fields {
        if field.name == "-" {
            match current.take() {
                Some(open) => mods.push(finish_modification(open)?),
                None => return Err(error(field.number, LdifErrorKind::Unexpected(field.name))),
            }
            continue;
        }

        match &mut current {
            Some((_, attr, values, _)) => {
                let base = |n: &str| n.split(';').next().unwrap_or_default().to_ascii_lowercase();
                if base(attr) != base(&field.name) {
                    return Err(error(field.number, LdifErrorKind::Unexpected(field.name)));
                }
                values.push(field.value);
            }
            None => {
                let op = field.name.to_ascii_lowercase();
                if !matches!(op.as_str(), "add" | "delete" | "replace" | "increment") {
                    return Err(error(field.number, LdifErrorKind::Unexpected(field.name)));
                }
                let attr = field.text()?;
                if !valid_attribute_name(&attr) {
                    return Err(error(field.number, LdifErrorKind::InvalidAttribute(attr)));
                }
                current = Some((op, attr, vec![], field.number));
            }
        }
    }

    // be lenient about a missing trailing "-"
    if let Some(open) = current {
        mods.push(finish_modification(open)?);
    }

    Ok(LdifRecord::Modify { dn, mods })
}

fn finish_modification(
    (op, attr, mut values, line): (String, String, Vec<Vec<u8>>, usize),
) -> Result<Modification, LdifError> {
    Ok(match op.as_str() {
        "add" if values.is_empty() => {
            return Err(error(line, LdifErrorKind::Missing("value for add")))
        }
        "add" => Modification::Add(attr, values),
        "delete" => Modification::Delete(attr, values),
        "replace" => Modification::Replace(attr, values),
        _ if values.len() != 1 => {
            return Err(error(line, LdifErrorKind::Missing("single value for increment")))
        }
        _ => Modification::Increment(attr, values.remove(0)),
    })
}
