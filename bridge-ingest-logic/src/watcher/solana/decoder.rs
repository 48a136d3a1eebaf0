use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::Value;

use crate::{error::DecodeError, types::Payload};

const PROGRAM_DATA_PREFIX: &str = "Program data: ";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscriminatorType {
    #[default]
    U8,
    U64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    U8,
    U64,
    /// Byte string whose length is the value of the field named by `ref`.
    BytesLen,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct VariantLayout {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldLayout>,
}

/// Borsh-style event layout of one program: a little-endian discriminator
/// followed by the fields of the matching variant.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ProgramLayout {
    #[serde(default)]
    pub discriminator: DiscriminatorType,
    /// Keyed by the decimal discriminator value.
    #[serde(default)]
    pub variants: HashMap<String, VariantLayout>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, need: usize) -> Result<&'a [u8], DecodeError> {
        let have = self.bytes.len() - self.offset;
        if have < need {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                need,
                have,
            });
        }
        let out = &self.bytes[self.offset..self.offset + need];
        self.offset += need;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u64, DecodeError> {
        Ok(self.take(1)?[0].into())
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.bytes[self.offset..];
        self.offset = self.bytes.len();
        out
    }
}

/// `Program data:` payloads carried by a transaction's log lines.
pub fn program_data(logs: &[String]) -> Vec<&str> {
    logs.iter()
        .filter_map(|line| line.strip_prefix(PROGRAM_DATA_PREFIX))
        .map(str::trim)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct LayoutDecoder {
    layouts: HashMap<String, ProgramLayout>,
}

impl LayoutDecoder {
    pub fn new(layouts: HashMap<String, ProgramLayout>) -> Self {
        Self { layouts }
    }

    pub fn has_layout(&self, program_id: &str) -> bool {
        self.layouts.contains_key(program_id)
    }

    /// Decodes a base64 `Program data:` payload. `Ok(None)` if the program
    /// has no configured layout.
    pub fn decode_base64(&self, program_id: &str, data: &str) -> Result<Option<Payload>, DecodeError> {
        if !self.has_layout(program_id) {
            return Ok(None);
        }
        let bytes = STANDARD.decode(data)?;
        self.decode(program_id, &bytes)
    }

    pub fn decode(&self, program_id: &str, bytes: &[u8]) -> Result<Option<Payload>, DecodeError> {
        let Some(layout) = self.layouts.get(program_id) else {
            return Ok(None);
        };
        let mut reader = Reader { bytes, offset: 0 };
        let tag = match layout.discriminator {
            DiscriminatorType::U8 => reader.u8()?,
            DiscriminatorType::U64 => reader.u64()?,
        };

        let mut out = Payload::new();
        out.insert("event_tag".into(), tag.into());
        let Some(variant) = layout.variants.get(&tag.to_string()) else {
            out.insert("raw".into(), hex::encode(bytes).into());
            return Ok(Some(out));
        };
        out.insert("name".into(), variant.name.clone().into());

        for field in &variant.fields {
            let value: Value = match field.ty {
                FieldType::U8 => reader.u8()?.into(),
                FieldType::U64 => reader.u64()?.into(),
                FieldType::BytesLen => {
                    let reference = field.reference.clone().unwrap_or_default();
                    let len = out
                        .get(&reference)
                        .and_then(Value::as_u64)
                        .ok_or_else(|| DecodeError::UnknownLengthField {
                            field: field.name.clone(),
                            reference,
                        })?;
                    let need = usize::try_from(len).unwrap_or(usize::MAX);
                    let raw = reader.take(need)?;
                    match std::str::from_utf8(raw) {
                        Ok(text) => text.into(),
                        Err(_) => hex::encode(raw).into(),
                    }
                }
                FieldType::Unsupported => {
                    out.insert(field.name.clone(), hex::encode(reader.rest()).into());
                    break;
                }
            };
            out.insert(field.name.clone(), value);
        }
        Ok(Some(out))
    }
}
