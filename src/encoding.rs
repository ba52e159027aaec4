//! BACnet Tag and Value Decoding
//!
//! Decode-side subset of the BACnet tag-length-value encoding defined in
//! ASHRAE 135 clause 20.2. The monitor never encodes application data, so
//! only the readers are provided.
//!
//! # Overview
//!
//! Every data element starts with a tag octet carrying the tag number, a
//! class bit (application vs. context-specific) and a 3-bit length/value/type
//! field. Lengths of five or more bytes spill into extension octets, and
//! constructed values are bracketed by opening/closing tags.
//!
//! Decoders return `(value, consumed)` so callers can walk a buffer without
//! any shared cursor state.

use std::fmt;

/// Result type for decoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur while decoding tagged values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Ran out of data mid-value
    BufferUnderflow,
    /// Invalid or unexpected tag number
    InvalidTag,
    /// Invalid length value for the tag type
    InvalidLength,
    /// Invalid encoding format
    InvalidFormat(String),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::BufferUnderflow => write!(f, "Buffer underflow during decoding"),
            EncodingError::InvalidTag => write!(f, "Invalid tag encountered"),
            EncodingError::InvalidLength => write!(f, "Invalid length value"),
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
        }
    }
}

impl std::error::Error for EncodingError {}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApplicationTag::Null),
            1 => Ok(ApplicationTag::Boolean),
            2 => Ok(ApplicationTag::UnsignedInt),
            3 => Ok(ApplicationTag::SignedInt),
            4 => Ok(ApplicationTag::Real),
            5 => Ok(ApplicationTag::Double),
            6 => Ok(ApplicationTag::OctetString),
            7 => Ok(ApplicationTag::CharacterString),
            8 => Ok(ApplicationTag::BitString),
            9 => Ok(ApplicationTag::Enumerated),
            10 => Ok(ApplicationTag::Date),
            11 => Ok(ApplicationTag::Time),
            12 => Ok(ApplicationTag::ObjectIdentifier),
            _ => Err(EncodingError::InvalidTag),
        }
    }
}

/// Tag class after the initial octet has been decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// Application-tagged primitive value
    Application(ApplicationTag),
    /// Context-specific primitive value
    Context(u8),
    /// Opening tag of a constructed value
    Opening(u8),
    /// Closing tag of a constructed value
    Closing(u8),
}

/// A decoded tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Tag class and number
    pub class: TagClass,
    /// Content length in bytes (zero for opening/closing tags)
    pub length: usize,
    /// Number of header bytes consumed
    pub header_len: usize,
}

impl Tag {
    /// Total footprint of this tag and its content for primitive values
    pub fn footprint(&self) -> usize {
        self.header_len + self.length
    }
}

/// Decode the tag header at the start of `data`
pub fn decode_tag(data: &[u8]) -> Result<Tag> {
    if data.is_empty() {
        return Err(EncodingError::BufferUnderflow);
    }

    let tag_byte = data[0];
    let tag_number = tag_byte >> 4;
    let context = (tag_byte & 0x08) != 0;
    let lvt = (tag_byte & 0x07) as usize;
    let mut header_len = 1;

    // Extended tag numbers (>= 15) never show up in the PDUs the monitor
    // classifies; reject rather than mis-parse.
    if tag_number == 0x0F {
        return Err(EncodingError::InvalidTag);
    }

    if context {
        match lvt {
            6 => {
                return Ok(Tag {
                    class: TagClass::Opening(tag_number),
                    length: 0,
                    header_len,
                })
            }
            7 => {
                return Ok(Tag {
                    class: TagClass::Closing(tag_number),
                    length: 0,
                    header_len,
                })
            }
            _ => {}
        }
    }

    let length = if lvt == 5 {
        if data.len() < 2 {
            return Err(EncodingError::BufferUnderflow);
        }
        let len_byte = data[1];
        header_len += 1;
        if len_byte < 254 {
            len_byte as usize
        } else if len_byte == 254 {
            if data.len() < 4 {
                return Err(EncodingError::BufferUnderflow);
            }
            header_len += 2;
            u16::from_be_bytes([data[2], data[3]]) as usize
        } else {
            if data.len() < 6 {
                return Err(EncodingError::BufferUnderflow);
            }
            header_len += 4;
            u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize
        }
    } else {
        lvt
    };

    let class = if context {
        TagClass::Context(tag_number)
    } else {
        TagClass::Application(ApplicationTag::try_from(tag_number)?)
    };

    // Application booleans carry their value in the LVT field itself;
    // there is no content to skip.
    let length = if class == TagClass::Application(ApplicationTag::Boolean) {
        0
    } else {
        length
    };

    Ok(Tag {
        class,
        length,
        header_len,
    })
}

/// Bytes consumed by the tag at the start of `data`, including the content
/// of a constructed value up to its matching closing tag.
pub fn skip_value(data: &[u8]) -> Result<usize> {
    let tag = decode_tag(data)?;
    match tag.class {
        TagClass::Opening(number) => {
            let mut pos = tag.header_len;
            let mut depth = 1;
            while depth > 0 {
                if pos >= data.len() {
                    return Err(EncodingError::BufferUnderflow);
                }
                let inner = decode_tag(&data[pos..])?;
                match inner.class {
                    TagClass::Opening(_) => depth += 1,
                    TagClass::Closing(n) => {
                        if depth == 1 && n != number {
                            return Err(EncodingError::InvalidFormat(
                                "mismatched closing tag".to_string(),
                            ));
                        }
                        depth -= 1;
                    }
                    _ => {}
                }
                pos += inner.footprint();
                if pos > data.len() {
                    return Err(EncodingError::BufferUnderflow);
                }
            }
            Ok(pos)
        }
        TagClass::Closing(_) => Ok(tag.header_len),
        _ => {
            let total = tag.footprint();
            if total > data.len() {
                return Err(EncodingError::BufferUnderflow);
            }
            Ok(total)
        }
    }
}

fn unsigned_content(data: &[u8]) -> Result<u32> {
    match data.len() {
        1 => Ok(data[0] as u32),
        2 => Ok(u16::from_be_bytes([data[0], data[1]]) as u32),
        3 => Ok(u32::from_be_bytes([0, data[0], data[1], data[2]])),
        4 => Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]])),
        _ => Err(EncodingError::InvalidLength),
    }
}

fn content<'a>(data: &'a [u8], tag: &Tag) -> Result<&'a [u8]> {
    if data.len() < tag.footprint() {
        return Err(EncodingError::BufferUnderflow);
    }
    Ok(&data[tag.header_len..tag.footprint()])
}

/// Decode a BACnet unsigned integer
pub fn decode_unsigned(data: &[u8]) -> Result<(u32, usize)> {
    let tag = decode_tag(data)?;
    if tag.class != TagClass::Application(ApplicationTag::UnsignedInt) {
        return Err(EncodingError::InvalidTag);
    }
    let value = unsigned_content(content(data, &tag)?)?;
    Ok((value, tag.footprint()))
}

/// Decode a BACnet enumerated value
pub fn decode_enumerated(data: &[u8]) -> Result<(u32, usize)> {
    let tag = decode_tag(data)?;
    if tag.class != TagClass::Application(ApplicationTag::Enumerated) {
        return Err(EncodingError::InvalidTag);
    }
    let value = unsigned_content(content(data, &tag)?)?;
    Ok((value, tag.footprint()))
}

/// Decode a BACnet object identifier into `(object_type, instance)`
pub fn decode_object_identifier(data: &[u8]) -> Result<((u16, u32), usize)> {
    let tag = decode_tag(data)?;
    if tag.class != TagClass::Application(ApplicationTag::ObjectIdentifier) {
        return Err(EncodingError::InvalidTag);
    }
    if tag.length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let raw = content(data, &tag)?;
    let object_id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    Ok((split_object_id(object_id), tag.footprint()))
}

/// Split a raw 32-bit object identifier into `(object_type, instance)`
pub fn split_object_id(object_id: u32) -> (u16, u32) {
    ((object_id >> 22) as u16, object_id & 0x3F_FFFF)
}

fn character_string_content(raw: &[u8]) -> Result<String> {
    if raw.is_empty() {
        return Err(EncodingError::BufferUnderflow);
    }
    // First octet selects the character set; 0 is ANSI X3.4 (UTF-8 compatible).
    let text = &raw[1..];
    match raw[0] {
        0 => String::from_utf8(text.to_vec())
            .map_err(|_| EncodingError::InvalidFormat("invalid UTF-8 string".to_string())),
        _ => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(text);
            Ok(decoded.into_owned())
        }
    }
}

/// Decode a BACnet character string
pub fn decode_character_string(data: &[u8]) -> Result<(String, usize)> {
    let tag = decode_tag(data)?;
    if tag.class != TagClass::Application(ApplicationTag::CharacterString) {
        return Err(EncodingError::InvalidTag);
    }
    let value = character_string_content(content(data, &tag)?)?;
    Ok((value, tag.footprint()))
}

/// Decode a context-tagged unsigned integer with the expected tag number
pub fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let tag = decode_tag(data)?;
    if tag.class != TagClass::Context(tag_number) {
        return Err(EncodingError::InvalidTag);
    }
    let value = unsigned_content(content(data, &tag)?)?;
    Ok((value, tag.footprint()))
}

/// Decode a context-tagged enumerated value with the expected tag number
pub fn decode_context_enumerated(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    decode_context_unsigned(data, tag_number)
}

/// Decode a context-tagged object identifier with the expected tag number
pub fn decode_context_object_id(data: &[u8], tag_number: u8) -> Result<((u16, u32), usize)> {
    let tag = decode_tag(data)?;
    if tag.class != TagClass::Context(tag_number) {
        return Err(EncodingError::InvalidTag);
    }
    if tag.length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let raw = content(data, &tag)?;
    let object_id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    Ok((split_object_id(object_id), tag.footprint()))
}

/// Decode a context-tagged character string with the expected tag number
pub fn decode_context_character_string(data: &[u8], tag_number: u8) -> Result<(String, usize)> {
    let tag = decode_tag(data)?;
    if tag.class != TagClass::Context(tag_number) {
        return Err(EncodingError::InvalidTag);
    }
    let value = character_string_content(content(data, &tag)?)?;
    Ok((value, tag.footprint()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_unsigned_widths() {
        assert_eq!(decode_unsigned(&[0x21, 0x2A]).unwrap(), (42, 2));
        assert_eq!(decode_unsigned(&[0x22, 0x12, 0x34]).unwrap(), (0x1234, 3));
        assert_eq!(
            decode_unsigned(&[0x24, 0x01, 0x02, 0x03, 0x04]).unwrap(),
            (0x01020304, 5)
        );
    }

    #[test]
    fn test_decode_unsigned_underflow() {
        assert_eq!(
            decode_unsigned(&[0x22, 0x12]),
            Err(EncodingError::BufferUnderflow)
        );
    }

    #[test]
    fn test_decode_object_identifier() {
        // device, instance 12345: (8 << 22) | 12345
        let raw = ((8u32 << 22) | 12345).to_be_bytes();
        let data = [0xC4, raw[0], raw[1], raw[2], raw[3]];
        let ((object_type, instance), consumed) = decode_object_identifier(&data).unwrap();
        assert_eq!(object_type, 8);
        assert_eq!(instance, 12345);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_decode_character_string() {
        // tag 7, extended length 6: charset byte + "hello"
        let data = [0x75, 0x06, 0x00, b'h', b'e', b'l', b'l', b'o'];
        let (value, consumed) = decode_character_string(&data).unwrap();
        assert_eq!(value, "hello");
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_decode_context_unsigned() {
        // context tag 1, one byte
        let data = [0x19, 0x07];
        assert_eq!(decode_context_unsigned(&data, 1).unwrap(), (7, 2));
        assert_eq!(
            decode_context_unsigned(&data, 0),
            Err(EncodingError::InvalidTag)
        );
    }

    #[test]
    fn test_opening_closing_tags() {
        let opening = decode_tag(&[0x3E]).unwrap();
        assert_eq!(opening.class, TagClass::Opening(3));
        let closing = decode_tag(&[0x3F]).unwrap();
        assert_eq!(closing.class, TagClass::Closing(3));
    }

    #[test]
    fn test_skip_constructed_value() {
        // opening 2, unsigned 42, nested opening/closing 0, closing 2
        let data = [0x2E, 0x21, 0x2A, 0x0E, 0x0F, 0x2F, 0x21, 0x01];
        assert_eq!(skip_value(&data).unwrap(), 6);
        // primitive skip lands on the trailing unsigned
        assert_eq!(skip_value(&data[6..]).unwrap(), 2);
    }
}
