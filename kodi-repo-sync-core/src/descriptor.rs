//! `addon.xml` descriptors.
//!
//! Only the attributes of the root `<addon>` element are interpreted; the rest
//! of the document is checked for well-formedness and otherwise carried
//! through verbatim into the merged index.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// The identifying attributes of an `<addon>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonDescriptor {
    pub id: String,
    pub version: String,
    pub name: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("malformed XML: {message}")]
    Malformed { message: String },
    #[error("expected root element <{expected}>, found <{found}>")]
    UnexpectedRoot {
        expected: &'static str,
        found: String,
    },
    #[error("document has no root element")]
    Empty,
    #[error("<addon> element is missing the '{attribute}' attribute")]
    MissingAttribute { attribute: &'static str },
}

fn malformed(err: impl std::fmt::Display) -> DescriptorError {
    DescriptorError::Malformed {
        message: err.to_string(),
    }
}

fn read_addon(start: &BytesStart<'_>) -> Result<AddonDescriptor, DescriptorError> {
    let mut id = None;
    let mut version = None;
    let mut name = None;
    let mut provider = None;
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        let value = attr.unescape_value().map_err(malformed)?.into_owned();
        match attr.key.as_ref() {
            b"id" => id = Some(value),
            b"version" => version = Some(value),
            b"name" => name = Some(value),
            b"provider-name" => provider = Some(value),
            _ => {}
        }
    }
    let id = id
        .filter(|v| !v.trim().is_empty())
        .ok_or(DescriptorError::MissingAttribute { attribute: "id" })?;
    let version = version
        .filter(|v| !v.trim().is_empty())
        .ok_or(DescriptorError::MissingAttribute {
            attribute: "version",
        })?;
    Ok(AddonDescriptor {
        id,
        version,
        name,
        provider,
    })
}

/// Walks the whole document, calling `visit(depth, element)` for every
/// element start. Depth 0 is the root. Fails on anything not well-formed.
fn walk<F>(xml: &str, mut visit: F) -> Result<(), DescriptorError>
where
    F: FnMut(usize, &BytesStart<'_>) -> Result<(), DescriptorError>,
{
    let mut reader = Reader::from_str(xml.trim_start_matches('\u{feff}'));
    reader.config_mut().trim_text(true);
    let mut depth = 0usize;
    let mut roots = 0usize;
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) => {
                if depth == 0 {
                    roots += 1;
                }
                visit(depth, &e)?;
                depth += 1;
            }
            Event::Empty(e) => {
                if depth == 0 {
                    roots += 1;
                }
                visit(depth, &e)?;
            }
            Event::End(_) => {
                depth = depth.checked_sub(1).ok_or_else(|| DescriptorError::Malformed {
                    message: "unexpected closing tag".into(),
                })?;
            }
            Event::Text(_) | Event::CData(_) if depth == 0 => {
                return Err(DescriptorError::Malformed {
                    message: "content outside the root element".into(),
                });
            }
            Event::Eof => break,
            _ => {}
        }
        if roots > 1 {
            return Err(DescriptorError::Malformed {
                message: "more than one root element".into(),
            });
        }
    }
    if depth != 0 {
        return Err(DescriptorError::Malformed {
            message: "unclosed element at end of document".into(),
        });
    }
    if roots == 0 {
        return Err(DescriptorError::Empty);
    }
    Ok(())
}

/// Parses a standalone `addon.xml` document.
pub fn parse(xml: &str) -> Result<AddonDescriptor, DescriptorError> {
    let mut found = None;
    walk(xml, |depth, e| {
        if depth == 0 {
            if e.name().as_ref() != b"addon" {
                return Err(DescriptorError::UnexpectedRoot {
                    expected: "addon",
                    found: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                });
            }
            found = Some(read_addon(e)?);
        }
        Ok(())
    })?;
    found.ok_or(DescriptorError::Empty)
}

/// Looks up one add-on in a repository `addons.xml` document. The first entry
/// with a matching id wins.
pub fn find_in_index(xml: &str, addon_id: &str) -> Result<Option<AddonDescriptor>, DescriptorError> {
    let mut found = None;
    walk(xml, |depth, e| {
        match depth {
            0 if e.name().as_ref() != b"addons" => Err(DescriptorError::UnexpectedRoot {
                expected: "addons",
                found: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
            }),
            1 if found.is_none() && e.name().as_ref() == b"addon" => {
                // Entries for other add-ons are not required to be complete.
                if let Ok(descriptor) = read_addon(e) {
                    if descriptor.id == addon_id {
                        found = Some(descriptor);
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    })?;
    Ok(found)
}

/// Returns the document body without a byte-order mark or XML declaration.
pub fn strip_declaration(text: &str) -> &str {
    let text = text.trim_start_matches('\u{feff}').trim();
    if text.starts_with("<?xml") {
        if let Some(end) = text.find("?>") {
            return text[end + 2..].trim();
        }
    }
    text
}
