//! Identity replies: battery serial (0x11), BMS model (0x01) and the model
//! field (0x30).

use crate::fields::Fields;
use crate::identifier::BmsIdentifier;
use crate::protocol::PRODUCTION_YEAR_BASE;
use crate::Result;
use chrono::NaiveDate;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const NO_SERIAL: [u8; 2] = [0x00, 0xFF];
/// Model field text carrying a 12 character model and a 13 digit identifier.
const COMBINED_MODEL_FIELD_LEN: usize = 25;
const MODEL_LEN_IN_COMBINED_FIELD: usize = 12;
const MODEL_FIELD_SEPARATOR: char = '!';

/// `len` followed by `len` ASCII bytes.
fn length_prefixed(fields: &Fields) -> Result<String> {
    let len = fields.byte(0)? as usize;
    let text = fields.slice(1, len)?;
    Ok(String::from_utf8_lossy(text).into_owned())
}

/// Battery serial, `None` if the pack has none programmed.
pub fn decode_serial(payload: &[u8]) -> Result<Option<String>> {
    let fields = Fields::new(payload);
    if NO_SERIAL.contains(&fields.byte(0)?) {
        log::debug!("No serial number set");
        return Ok(None);
    }
    length_prefixed(&fields).map(Some)
}

pub fn decode_bms_model(payload: &[u8]) -> Result<String> {
    let model = length_prefixed(&Fields::new(payload))?;
    Ok(model.chars().filter(|c| !c.is_whitespace()).collect())
}

/// Battery model text, BMS identifier and production date.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelField {
    pub text: String,
    pub production_date: Option<NaiveDate>,
}

impl ModelField {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let fields = Fields::new(payload);
        let text = length_prefixed(&fields)?;
        let date_offset = 1 + fields.byte(0)? as usize;
        let production_date = fields.slice(date_offset, 3).ok().and_then(|date| {
            NaiveDate::from_ymd_opt(
                PRODUCTION_YEAR_BASE + date[0] as i32,
                date[1] as u32 + 1,
                date[2] as u32 + 1,
            )
        });
        Ok(Self {
            text,
            production_date,
        })
    }

    pub fn model(&self) -> &str {
        if self.text.len() == COMBINED_MODEL_FIELD_LEN {
            if let Some(model) = self.text.get(..MODEL_LEN_IN_COMBINED_FIELD) {
                return model;
            }
        }
        self.text
            .split(MODEL_FIELD_SEPARATOR)
            .next()
            .unwrap_or_default()
    }

    /// Raw identifier text, `None` when the field carries only a model.
    pub fn identifier_text(&self) -> Option<&str> {
        if self.text.len() == COMBINED_MODEL_FIELD_LEN {
            return self.text.get(MODEL_LEN_IN_COMBINED_FIELD..);
        }
        let mut parts = self.text.split(MODEL_FIELD_SEPARATOR);
        let _model = parts.next()?;
        match (parts.next(), parts.next()) {
            (Some(identifier), None) => Some(identifier),
            _ => None,
        }
    }

    pub fn identifier(&self) -> Option<Result<BmsIdentifier>> {
        self.identifier_text().map(BmsIdentifier::decode)
    }
}

/// Everything the pack tells about itself.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    pub bms_model: Option<String>,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub identifier: Option<String>,
    pub production_date: Option<NaiveDate>,
}
