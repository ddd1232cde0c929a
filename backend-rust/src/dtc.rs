//! Diagnostic trouble code catalog: flagbyte-driven address enumeration and
//! bit-to-code/title decoding, mirroring FreeSSM's `setupDiagnosticCodes()`.

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DtcError {
    #[error("definitions symbol {0} not found in source")]
    SymbolNotFound(String),
    #[error("no DTC entries parsed for symbol {0}")]
    EmptyDefinitions(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtcEntry {
    pub current_addr: u32,
    pub historic_addr: u32,
    pub bit: u8,
    pub code: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtcHit {
    pub addr: u32,
    pub bit: u8,
    pub code: String,
    pub title: String,
}

pub struct DtcCatalog {
    by_key: HashMap<(u32, u32, u8), DtcEntry>,
}

const OBD_SYMBOL: &str = "_DTC_OBD_defs_en";
const SUBARU_SYMBOL: &str = "_DTC_SUBARU_defs_en";

pub fn symbol_for_format(fmt_obd2: bool) -> &'static str {
    if fmt_obd2 {
        OBD_SYMBOL
    } else {
        SUBARU_SYMBOL
    }
}

impl DtcCatalog {
    /// A catalog with no known entries: every set bit decodes as the
    /// synthetic `"???"` hit. Used when no definitions source is configured.
    pub fn empty() -> Self {
        Self { by_key: HashMap::new() }
    }

    /// Parses the FreeSSM English definitions C++ source for one symbol's
    /// initializer block: lines of `"curr_hex;hist_hex;bit;code;title"`.
    pub fn parse_defs(source: &str, symbol_name: &str) -> Result<Self, DtcError> {
        let marker = format!("const QStringList SSMFlagbyteDefinitions_en::{symbol_name} =");
        let start = source
            .find(&marker)
            .ok_or_else(|| DtcError::SymbolNotFound(symbol_name.to_string()))?;
        let mut block = &source[start..];
        if let Some(end) = block.find(";\n") {
            block = &block[..end + 2];
        }

        let entry_re = Regex::new(r#"<<\s*"([0-9A-Fa-f]{6};[0-9A-Fa-f]{6};[1-8];[^"]*)""#).unwrap();
        let mut by_key = HashMap::new();
        for cap in entry_re.captures_iter(block) {
            let raw = &cap[1];
            let parts: Vec<&str> = raw.splitn(5, ';').collect();
            if parts.len() != 5 {
                continue;
            }
            let current_addr = u32::from_str_radix(parts[0], 16).unwrap_or(0);
            let historic_addr = u32::from_str_radix(parts[1], 16).unwrap_or(0);
            let bit: u8 = parts[2].parse().unwrap_or(0);
            let entry = DtcEntry {
                current_addr,
                historic_addr,
                bit,
                code: parts[3].trim().to_string(),
                title: parts[4].trim().to_string(),
            };
            by_key.insert((current_addr, historic_addr, bit), entry);
        }

        if by_key.is_empty() {
            return Err(DtcError::EmptyDefinitions(symbol_name.to_string()));
        }
        Ok(Self { by_key })
    }

    pub fn lookup(&self, current_addr: u32, historic_addr: u32, bit: u8) -> Option<&DtcEntry> {
        self.by_key.get(&(current_addr, historic_addr, bit))
    }
}

fn flagbyte_bit(flagbytes: &[u8], byte_index: usize, bit_index: u8) -> bool {
    if byte_index >= flagbytes.len() || bit_index > 7 {
        return false;
    }
    flagbytes[byte_index] & (1 << bit_index) != 0
}

/// Returns `(fmt_obd2, address_pairs)` for the supported (current, historic)
/// address pairs implied by the ECU's flagbytes.
pub fn enumerate_supported_dtc_addr_pairs(flagbytes: &[u8]) -> (bool, Vec<(u32, u32)>) {
    let fmt_obd2 = !flagbyte_bit(flagbytes, 29, 7);
    let mut pairs = Vec::new();

    let add_range = |pairs: &mut Vec<(u32, u32)>, start: u32, end: u32, hist_delta: u32| {
        for addr in start..=end {
            pairs.push((addr, addr + hist_delta));
        }
    };

    if !fmt_obd2 {
        add_range(&mut pairs, 0x8E, 0x98, 22);
        return (fmt_obd2, pairs);
    }

    if flagbyte_bit(flagbytes, 29, 4) || flagbyte_bit(flagbytes, 29, 6) {
        add_range(&mut pairs, 0x8E, 0xAD, 32);
    }
    if flagbyte_bit(flagbytes, 28, 0) {
        add_range(&mut pairs, 0xF0, 0xF3, 4);
    }
    if flagbytes.len() > 32 {
        if flagbyte_bit(flagbytes, 39, 7) {
            add_range(&mut pairs, 0x123, 0x12A, 8);
        }
        if flagbyte_bit(flagbytes, 39, 6) {
            add_range(&mut pairs, 0x150, 0x154, 5);
        }
        if flagbyte_bit(flagbytes, 39, 5) {
            add_range(&mut pairs, 0x160, 0x164, 5);
        }
        if flagbyte_bit(flagbytes, 39, 4) {
            add_range(&mut pairs, 0x174, 0x17A, 7);
        }
        if flagbytes.len() > 48 {
            if flagbyte_bit(flagbytes, 50, 6) {
                add_range(&mut pairs, 0x1C1, 0x1C6, 6);
                add_range(&mut pairs, 0x20A, 0x20D, 4);
            }
            if flagbyte_bit(flagbytes, 50, 5) {
                add_range(&mut pairs, 0x263, 0x267, 5);
            }
        }
    }

    if pairs.is_empty() {
        add_range(&mut pairs, 0x8E, 0xAD, 32);
    }

    (fmt_obd2, pairs)
}

/// Decodes every set bit across `pairs` into a hit, sorted by
/// `(code, addr, bit, title)`. Entries with both code and title empty are
/// treated as explicitly suppressed; unknown bits get a synthetic `"???"` hit.
pub fn decode_hits(pairs: &[(u32, u32)], values: &HashMap<u32, u8>, catalog: &DtcCatalog, use_hist: bool) -> Vec<DtcHit> {
    let mut hits = Vec::new();

    for &(curr_addr, hist_addr) in pairs {
        let addr = if use_hist { hist_addr } else { curr_addr };
        let Some(&databyte) = values.get(&addr) else {
            continue;
        };
        for bit0 in 0..8u8 {
            if databyte & (1 << bit0) == 0 {
                continue;
            }
            let bit = bit0 + 1;
            match catalog.lookup(curr_addr, hist_addr, bit) {
                None => hits.push(DtcHit {
                    addr,
                    bit,
                    code: "???".to_string(),
                    title: format!("Unknown DTC bit (0x{curr_addr:04X}/0x{hist_addr:04X} bit {bit})"),
                }),
                Some(entry) if entry.code.is_empty() && entry.title.is_empty() => continue,
                Some(entry) => hits.push(DtcHit {
                    addr,
                    bit,
                    code: if entry.code.is_empty() { "???".to_string() } else { entry.code.clone() },
                    title: if entry.title.is_empty() { "(no description)".to_string() } else { entry.title.clone() },
                }),
            }
        }
    }

    hits.sort_by(|a, b| (a.code.as_str(), a.addr, a.bit, a.title.as_str()).cmp(&(b.code.as_str(), b.addr, b.bit, b.title.as_str())));
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_defs_source() -> String {
        format!(
            r#"
const QStringList SSMFlagbyteDefinitions_en::{SUBARU_SYMBOL} =
    QStringList()
    << "008E;00A6;2;P0031;HO2S-11 heater control circuit low"
    << "008E;00A6;1;;"
    ;

const QStringList SSMFlagbyteDefinitions_en::{OBD_SYMBOL} =
    QStringList()
    << "0090;00A6;2;P0031;HO2S-11 heater control circuit low"
    ;
"#
        )
    }

    #[test]
    fn test_non_obd2_format_limits_pairs_to_base_range() {
        let mut flagbytes = vec![0u8; 30];
        flagbytes[29] = 1 << 7; // non-OBD2
        let (fmt_obd2, pairs) = enumerate_supported_dtc_addr_pairs(&flagbytes);
        assert!(!fmt_obd2);
        assert_eq!(pairs.first(), Some(&(0x8E, 0x8E + 22)));
        assert_eq!(pairs.last(), Some(&(0x98, 0x98 + 22)));
        assert_eq!(pairs.len(), (0x98 - 0x8E + 1) as usize);
    }

    #[test]
    fn test_extended_ranges_match_table() {
        let mut flagbytes = vec![0u8; 40];
        flagbytes[29] = 1 << 4;
        flagbytes[28] = 1 << 0;
        flagbytes[39] = 1 << 7;
        let (fmt_obd2, pairs) = enumerate_supported_dtc_addr_pairs(&flagbytes);
        assert!(fmt_obd2);
        assert!(pairs.contains(&(0x8E, 0x8E + 32)));
        assert!(pairs.contains(&(0xF0, 0xF0 + 4)));
        assert!(pairs.contains(&(0x123, 0x123 + 8)));
        assert!(!pairs.contains(&(0x150, 0x150 + 5)));
    }

    #[test]
    fn test_suppressed_entry_emits_no_hit() {
        let catalog = DtcCatalog::parse_defs(&sample_defs_source(), SUBARU_SYMBOL).unwrap();
        let mut values = HashMap::new();
        values.insert(0x008E, 0b0000_0011); // bits 1 and 2 set
        let hits = decode_hits(&[(0x008E, 0x00A6)], &values, &catalog, false);
        // bit 1 is suppressed (empty code+title); only bit 2 should hit
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].code, "P0031");
    }

    #[test]
    fn test_literal_dtc_scenario() {
        let catalog = DtcCatalog::parse_defs(&sample_defs_source(), OBD_SYMBOL).unwrap();
        let mut values = HashMap::new();
        values.insert(0x0090, 0x02);
        values.insert(0x00A6, 0x00);
        let current = decode_hits(&[(0x0090, 0x00A6)], &values, &catalog, false);
        let historic = decode_hits(&[(0x0090, 0x00A6)], &values, &catalog, true);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].code, "P0031");
        assert!(historic.is_empty());
    }

    #[test]
    fn test_unknown_bit_gets_placeholder() {
        let catalog = DtcCatalog::parse_defs(&sample_defs_source(), OBD_SYMBOL).unwrap();
        let mut values = HashMap::new();
        values.insert(0x0090, 0x04); // bit 3, not in defs
        let hits = decode_hits(&[(0x0090, 0x00A6)], &values, &catalog, false);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].code, "???");
    }
}
