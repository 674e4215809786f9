//! OpenTag filament record parsing.
//!
//! Decodes the binary filament-identity record carried in cabinet RFID
//! transfers. Multibyte integers are little-endian; absent optional fields
//! are encoded as all-ones (`0xFF`/`0xFFFF`/`0xFFFFFFFF`). Parsing is
//! lenient: a payload shorter than the full record simply leaves the
//! trailing fields absent, so a zero-length transfer yields an empty record
//! rather than an error.

use serde::Serialize;

/// Full record length as written by the cabinet firmware.
pub const RECORD_LEN: usize = 148;

// Field offsets within the record.
const OFF_TAG_VERSION: usize = 0;
const OFF_MANUFACTURER: usize = 2;
const OFF_MATERIAL: usize = 18;
const OFF_COLOR_NAME: usize = 34;
const OFF_DIAMETER_NOMINAL: usize = 66;
const OFF_DIAMETER_TARGET: usize = 68;
const OFF_WEIGHT_NOMINAL: usize = 70;
const OFF_DENSITY: usize = 72;
const OFF_PRINT_TEMP: usize = 76;
const OFF_BED_TEMP: usize = 78;
const OFF_COLOR_RGB: usize = 80;
const OFF_SERIAL: usize = 84;
const OFF_PRODUCTION_DATE: usize = 100;
const OFF_MAX_DRY_TEMP: usize = 108;
const OFF_EMPTY_SPOOL_WEIGHT: usize = 110;
const OFF_FILAMENT_LENGTH: usize = 112;

const MANUFACTURER_LEN: usize = 16;
const MATERIAL_LEN: usize = 16;
const COLOR_NAME_LEN: usize = 32;
const SERIAL_LEN: usize = 16;
const PRODUCTION_DATE_LEN: usize = 8;

/// A parsed filament-identity record.
///
/// Every field is optional: tags written by older firmware omit trailing
/// fields, and in-range fields may carry the all-ones "absent" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilamentRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_version: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_name: Option<String>,
    /// Color as `[r, g, b]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_rgb: Option<[u8; 3]>,
    /// Nominal filament diameter in micrometers (e.g. 1750).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diameter_nominal_um: Option<u16>,
    /// Manufacturing target diameter in micrometers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diameter_target_um: Option<u16>,
    /// Nominal spool weight in grams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_nominal_g: Option<u16>,
    /// Density in micrograms per cubic centimeter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density_ug_cm3: Option<u32>,
    /// Recommended hotend temperature in degrees Celsius.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_temp_c: Option<u16>,
    /// Recommended bed temperature in degrees Celsius.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed_temp_c: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Production date as `YYYYMMDD`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_dry_temp_c: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_spool_weight_g: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filament_length_mm: Option<u32>,
}

impl FilamentRecord {
    /// Parses a record from a reassembled transfer payload.
    pub fn parse(payload: &[u8]) -> Self {
        Self {
            tag_version: read_u16(payload, OFF_TAG_VERSION),
            manufacturer: read_str(payload, OFF_MANUFACTURER, MANUFACTURER_LEN),
            material: read_str(payload, OFF_MATERIAL, MATERIAL_LEN),
            color_name: read_str(payload, OFF_COLOR_NAME, COLOR_NAME_LEN),
            color_rgb: read_rgb(payload, OFF_COLOR_RGB),
            diameter_nominal_um: read_u16(payload, OFF_DIAMETER_NOMINAL),
            diameter_target_um: read_u16(payload, OFF_DIAMETER_TARGET),
            weight_nominal_g: read_u16(payload, OFF_WEIGHT_NOMINAL),
            density_ug_cm3: read_u32(payload, OFF_DENSITY),
            print_temp_c: read_u16(payload, OFF_PRINT_TEMP),
            bed_temp_c: read_u16(payload, OFF_BED_TEMP),
            serial: read_str(payload, OFF_SERIAL, SERIAL_LEN),
            production_date: read_str(payload, OFF_PRODUCTION_DATE, PRODUCTION_DATE_LEN),
            max_dry_temp_c: read_u16(payload, OFF_MAX_DRY_TEMP),
            empty_spool_weight_g: read_u16(payload, OFF_EMPTY_SPOOL_WEIGHT),
            filament_length_mm: read_u32(payload, OFF_FILAMENT_LENGTH),
        }
    }

    /// True when no field was present, e.g. for a zero-length transfer.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Reads a little-endian u16, treating truncation and the all-ones sentinel
/// as absent.
fn read_u16(payload: &[u8], offset: usize) -> Option<u16> {
    let bytes = payload.get(offset..offset + 2)?;
    let value = u16::from_le_bytes([bytes[0], bytes[1]]);
    (value != u16::MAX).then_some(value)
}

/// Reads a little-endian u32, treating truncation and the all-ones sentinel
/// as absent.
fn read_u32(payload: &[u8], offset: usize) -> Option<u32> {
    let bytes = payload.get(offset..offset + 4)?;
    let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (value != u32::MAX).then_some(value)
}

/// Reads a NUL-padded ASCII field. Unwritten tag memory reads as `0xFF`, so
/// both paddings terminate the string. Empty or non-UTF-8 fields are absent.
fn read_str(payload: &[u8], offset: usize, len: usize) -> Option<String> {
    let bytes = payload.get(offset..offset + len)?;
    let end = bytes
        .iter()
        .position(|&b| b == 0x00 || b == 0xFF)
        .unwrap_or(len);
    let text = std::str::from_utf8(&bytes[..end]).ok()?.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn read_rgb(payload: &[u8], offset: usize) -> Option<[u8; 3]> {
    let bytes = payload.get(offset..offset + 3)?;
    let rgb = [bytes[0], bytes[1], bytes[2]];
    (rgb != [0xFF; 3]).then_some(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a full-length record with every optional field left absent.
    fn blank_record() -> Vec<u8> {
        vec![0xFF; RECORD_LEN]
    }

    fn write_field(buf: &mut [u8], offset: usize, bytes: &[u8]) {
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn write_str_field(buf: &mut [u8], offset: usize, len: usize, text: &str) {
        let field = &mut buf[offset..offset + len];
        field.fill(0x00);
        field[..text.len()].copy_from_slice(text.as_bytes());
    }

    fn sample_record() -> Vec<u8> {
        let mut buf = blank_record();
        write_field(&mut buf, OFF_TAG_VERSION, &1u16.to_le_bytes());
        write_str_field(&mut buf, OFF_MANUFACTURER, MANUFACTURER_LEN, "Polymaker");
        write_str_field(&mut buf, OFF_MATERIAL, MATERIAL_LEN, "PLA");
        write_str_field(&mut buf, OFF_COLOR_NAME, COLOR_NAME_LEN, "Army Green");
        write_field(&mut buf, OFF_DIAMETER_NOMINAL, &1750u16.to_le_bytes());
        write_field(&mut buf, OFF_DIAMETER_TARGET, &1750u16.to_le_bytes());
        write_field(&mut buf, OFF_WEIGHT_NOMINAL, &1000u16.to_le_bytes());
        write_field(&mut buf, OFF_DENSITY, &1_240_000u32.to_le_bytes());
        write_field(&mut buf, OFF_PRINT_TEMP, &210u16.to_le_bytes());
        write_field(&mut buf, OFF_BED_TEMP, &60u16.to_le_bytes());
        write_field(&mut buf, OFF_COLOR_RGB, &[0x4B, 0x5A, 0x2F]);
        write_str_field(&mut buf, OFF_SERIAL, SERIAL_LEN, "PM24100042");
        write_str_field(&mut buf, OFF_PRODUCTION_DATE, PRODUCTION_DATE_LEN, "20240310");
        buf
    }

    mod parse_tests {
        use super::*;

        #[test]
        fn parses_populated_record() {
            let record = FilamentRecord::parse(&sample_record());
            assert_eq!(record.manufacturer.as_deref(), Some("Polymaker"));
            assert_eq!(record.material.as_deref(), Some("PLA"));
            assert_eq!(record.color_name.as_deref(), Some("Army Green"));
            assert_eq!(record.color_rgb, Some([0x4B, 0x5A, 0x2F]));
            assert_eq!(record.diameter_nominal_um, Some(1750));
            assert_eq!(record.weight_nominal_g, Some(1000));
            assert_eq!(record.density_ug_cm3, Some(1_240_000));
            assert_eq!(record.print_temp_c, Some(210));
            assert_eq!(record.bed_temp_c, Some(60));
            assert_eq!(record.serial.as_deref(), Some("PM24100042"));
            assert_eq!(record.production_date.as_deref(), Some("20240310"));
        }

        #[test]
        fn sentinel_fields_are_absent() {
            let record = FilamentRecord::parse(&blank_record());
            assert!(record.is_empty());
        }

        #[test]
        fn optional_trailing_fields_stay_absent_in_sample() {
            let record = FilamentRecord::parse(&sample_record());
            assert_eq!(record.max_dry_temp_c, None);
            assert_eq!(record.empty_spool_weight_g, None);
            assert_eq!(record.filament_length_mm, None);
        }

        #[test]
        fn empty_payload_yields_empty_record() {
            let record = FilamentRecord::parse(&[]);
            assert!(record.is_empty());
        }

        #[test]
        fn short_payload_keeps_leading_fields() {
            // Only the version and manufacturer fit.
            let full = sample_record();
            let record = FilamentRecord::parse(&full[..OFF_MATERIAL]);
            assert_eq!(record.tag_version, Some(1));
            assert_eq!(record.manufacturer.as_deref(), Some("Polymaker"));
            assert_eq!(record.material, None);
            assert_eq!(record.print_temp_c, None);
        }

        #[test]
        fn multibyte_fields_are_little_endian() {
            let mut buf = blank_record();
            write_field(&mut buf, OFF_PRINT_TEMP, &[0xD2, 0x00]);
            let record = FilamentRecord::parse(&buf);
            assert_eq!(record.print_temp_c, Some(210));
        }

        #[test]
        fn non_utf8_string_field_is_absent() {
            let mut buf = blank_record();
            write_field(&mut buf, OFF_MATERIAL, &[0xC3, 0x28, 0x00]);
            let record = FilamentRecord::parse(&buf);
            assert_eq!(record.material, None);
        }
    }

    mod serialize_tests {
        use super::*;

        #[test]
        fn absent_fields_are_omitted_from_json() {
            let json = serde_json::to_value(FilamentRecord::parse(&blank_record()))
                .expect("serializable");
            assert_eq!(json, serde_json::json!({}));
        }

        #[test]
        fn present_fields_appear_by_name() {
            let json = serde_json::to_value(FilamentRecord::parse(&sample_record()))
                .expect("serializable");
            assert_eq!(json["material"], "PLA");
            assert_eq!(json["print_temp_c"], 210);
            assert_eq!(json["color_rgb"], serde_json::json!([0x4B, 0x5A, 0x2F]));
        }
    }
}
