//! RomRaider-style parameter catalog: XML loading, ROM-id matching,
//! attribute inheritance, topic slugging, and the fast-profile selection.

use std::collections::{HashMap, HashSet};

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::expr::{self, Expr};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("malformed parameter catalog XML: {0}")]
    Xml(String),
    #[error("no ecu definition matches ROM id {0}")]
    NoMatchingRom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Numeric,
    Bool,
}

#[derive(Debug, Clone)]
pub struct ParamDef {
    pub id: String,
    pub topic_slug: String,
    pub addr: u32,
    pub size: u8,
    pub signed: bool,
    pub kind: ParamKind,
    pub bit: u8,
    pub unit: String,
    pub decimals: u32,
    pub expr: Option<Expr>,
}

#[derive(Debug, Clone, Default)]
struct RawParam {
    id: String,
    storagetype: String,
    address: String,
    bit: Option<u8>,
    unit: String,
    decimals: u32,
    expr: String,
}

#[derive(Debug, Clone, Default)]
struct RawEcu {
    ecu_type: String,
    rom_pattern: String,
    name: String,
    includes: Vec<String>,
    params: Vec<RawParam>,
}

pub struct ParamCatalog {
    ecus: Vec<RawEcu>,
}

const FAST_PROFILE_TOPICS: &[&str] = &[
    "engine_speed",
    "vehicle_speed",
    "manifold_absolute_pressure",
    "manifold_relative_pressure",
    "throttle_opening_angle",
    "accelerator_opening_angle",
    "mass_air_flow",
    "intake_air_temperature",
    "coolant_temperature",
    "ignition_timing",
    "knock_correction",
    "battery_v",
    "afr_sensor_1",
    "afr_correction_1",
    "afr_learning_1",
    "fuel_injector_1_pulse_width",
    "fuel_injector_2_pulse_width",
    "primary_wastegate_duty_cycle",
    "secondary_wastegate_duty_cycle",
    "fuel_pressure_high",
    "main_throttle_sensor",
    "main_accelerator_sensor",
];

fn attr(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name.as_bytes() {
            Some(String::from_utf8_lossy(&a.value).into_owned())
        } else {
            None
        }
    })
}

impl ParamCatalog {
    pub fn load_from_str(xml: &str) -> Result<Self, CatalogError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut ecus = Vec::new();
        let mut current: Option<RawEcu> = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf).map_err(|e| CatalogError::Xml(e.to_string()))? {
                Event::Start(e) if e.name().as_ref() == b"ecu" => {
                    current = Some(parse_ecu_attrs(&e));
                }
                Event::Empty(e) if e.name().as_ref() == b"ecu" => {
                    ecus.push(parse_ecu_attrs(&e));
                }
                Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"parameter" => {
                    let param = parse_param_attrs(&e);
                    if let Some(ecu) = current.as_mut() {
                        ecu.params.push(param);
                    }
                }
                Event::End(e) if e.name().as_ref() == b"ecu" => {
                    if let Some(ecu) = current.take() {
                        ecus.push(ecu);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(Self { ecus })
    }

    /// Resolves the ordered parameter list for a ROM id, applying wildcard
    /// matching, inheritance, dedup, slugging, and fast-profile selection.
    /// Returns the matched ecu's display name alongside the parameters.
    pub fn params_for_rom(&self, rom_id_hex: &str, profile: &str) -> Result<(String, Vec<ParamDef>), CatalogError> {
        let ecu = select_ecu(&self.ecus, rom_id_hex).ok_or_else(|| CatalogError::NoMatchingRom(rom_id_hex.to_string()))?;
        let ecu_name = ecu.name.clone();

        let by_type: HashMap<&str, &RawEcu> = self.ecus.iter().map(|e| (e.ecu_type.as_str(), e)).collect();
        let mut seen = HashSet::new();
        let mut raw_params = Vec::new();
        collect_params(&by_type, ecu, &mut seen, &mut raw_params);

        let mut defs = Vec::new();
        for p in raw_params {
            if let Some(def) = build_param_def(p) {
                defs.push(def);
            }
        }
        assign_unique_slugs(&mut defs);

        Ok((ecu_name, select_profile_params(defs, profile)))
    }
}

fn parse_ecu_attrs(e: &quick_xml::events::BytesStart) -> RawEcu {
    let ecu_type = attr(e, "type").unwrap_or_default();
    let rom_pattern = attr(e, "id").unwrap_or_default();
    let name = attr(e, "name").unwrap_or_default();
    let includes = attr(e, "include")
        .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default();
    RawEcu { ecu_type, rom_pattern, name, includes, params: Vec::new() }
}

fn parse_param_attrs(e: &quick_xml::events::BytesStart) -> RawParam {
    RawParam {
        id: attr(e, "id").unwrap_or_default(),
        storagetype: attr(e, "storagetype").unwrap_or_default(),
        address: attr(e, "address").unwrap_or_default(),
        bit: attr(e, "bit").and_then(|s| s.parse().ok()),
        unit: attr(e, "unit").unwrap_or_default(),
        decimals: attr(e, "decimals").and_then(|s| s.parse().ok()).unwrap_or(0),
        expr: attr(e, "expr").unwrap_or_default(),
    }
}

fn hex_pairs(s: &str) -> Vec<String> {
    let cleaned: Vec<char> = s.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    cleaned.chunks(2).map(|c| c.iter().collect()).collect()
}

fn select_ecu<'a>(ecus: &'a [RawEcu], rom_id_hex: &str) -> Option<&'a RawEcu> {
    if let Some(exact) = ecus.iter().find(|e| e.rom_pattern.eq_ignore_ascii_case(rom_id_hex)) {
        return Some(exact);
    }

    let target_pairs = hex_pairs(rom_id_hex);
    let mut best: Option<(&RawEcu, usize)> = None;

    for e in ecus {
        if e.ecu_type.is_empty() || e.ecu_type.eq_ignore_ascii_case("BASE") {
            continue;
        }
        let pattern_pairs = hex_pairs(&e.rom_pattern);
        if pattern_pairs.len() != target_pairs.len() || pattern_pairs.is_empty() {
            continue;
        }
        let mut wildcards = 0;
        let mut matches = true;
        for (p, t) in pattern_pairs.iter().zip(target_pairs.iter()) {
            if p.eq_ignore_ascii_case("FF") {
                wildcards += 1;
            } else if !p.eq_ignore_ascii_case(t) {
                matches = false;
                break;
            }
        }
        if !matches {
            continue;
        }
        if best.map(|(_, w)| wildcards < w).unwrap_or(true) {
            best = Some((e, wildcards));
        }
    }

    best.map(|(e, _)| e)
}

fn collect_params<'a>(
    by_type: &HashMap<&str, &'a RawEcu>,
    ecu: &'a RawEcu,
    seen: &mut HashSet<String>,
    out: &mut Vec<&'a RawParam>,
) {
    for p in &ecu.params {
        if p.id.is_empty() {
            continue;
        }
        if seen.insert(p.id.clone()) {
            out.push(p);
        }
    }
    for include in &ecu.includes {
        if let Some(parent) = by_type.get(include.as_str()) {
            collect_params(by_type, parent, seen, out);
        }
    }
}

fn parse_address(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn storage_size_signed(storagetype: &str) -> Option<(u8, bool)> {
    match storagetype {
        "uint8" => Some((1, false)),
        "int8" => Some((1, true)),
        "uint16" => Some((2, false)),
        "int16" => Some((2, true)),
        "uint32" => Some((4, false)),
        "int32" => Some((4, true)),
        _ => None,
    }
}

fn build_param_def(p: &RawParam) -> Option<ParamDef> {
    if p.id.is_empty() {
        return None;
    }
    let (size, signed) = storage_size_signed(&p.storagetype)?;
    let addr = parse_address(&p.address)?;

    let (kind, bit) = match p.bit {
        Some(b) if (1..=8).contains(&b) && size == 1 => (ParamKind::Bool, b),
        _ => (ParamKind::Numeric, 0),
    };

    let normalized = expr::normalize_expr(&p.expr);
    let compiled = expr::compile_expr(&normalized);

    Some(ParamDef {
        id: p.id.clone(),
        topic_slug: slugify_metric(&p.id),
        addr,
        size,
        signed,
        kind,
        bit,
        unit: p.unit.clone(),
        decimals: p.decimals,
        expr: compiled,
    })
}

pub fn slugify_metric(name: &str) -> String {
    let mut s = name.to_lowercase();
    s = s.replace("air/fuel", "afr");
    s = s.replace("a/f", "af");
    s = s.replace('%', "pct");
    s = s.replace("voltage", "v");

    let mut result = String::new();
    let mut last_was_sep = true; // suppress a leading underscore
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            result.push('_');
            last_was_sep = true;
        }
    }
    while result.ends_with('_') {
        result.pop();
    }
    result
}

fn assign_unique_slugs(defs: &mut [ParamDef]) {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for def in defs.iter_mut() {
        let base = def.topic_slug.clone();
        let count = counts.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            def.topic_slug = format!("{base}_{count}");
        }
    }
}

/// Strips a trailing `_<digits>` disambiguation suffix added by
/// `assign_unique_slugs`, so `engine_speed_2` matches the fast profile the
/// same way `engine_speed` does.
fn strip_disambiguation_suffix(slug: &str) -> &str {
    if let Some(pos) = slug.rfind('_') {
        let suffix = &slug[pos + 1..];
        if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
            return &slug[..pos];
        }
    }
    slug
}

fn select_profile_params(params: Vec<ParamDef>, profile: &str) -> Vec<ParamDef> {
    if profile != "fast" {
        return params;
    }
    let selected: Vec<ParamDef> = params
        .iter()
        .filter(|p| FAST_PROFILE_TOPICS.contains(&strip_disambiguation_suffix(&p.topic_slug)))
        .cloned()
        .collect();
    if selected.is_empty() {
        params
    } else {
        selected
    }
}

/// Decodes `size` big-endian bytes into a signed/unsigned integer.
pub fn decode_raw_value(bytes: &[u8], signed: bool) -> i64 {
    let mut unsigned: u64 = 0;
    for &b in bytes {
        unsigned = (unsigned << 8) | b as u64;
    }
    if !signed || bytes.is_empty() {
        return unsigned as i64;
    }
    let bits = bytes.len() * 8;
    let sign_bit = 1u64 << (bits - 1);
    if unsigned & sign_bit != 0 {
        (unsigned as i64) - (1i64 << bits)
    } else {
        unsigned as i64
    }
}

/// Decodes every parameter in `params` against an address->byte map,
/// skipping any parameter whose bytes are incomplete. Expression failures
/// fall back to the raw scaled value rather than raising. Returns the
/// decoded metrics alongside a units map sharing the same keyset.
pub fn decode_rr_params(params: &[ParamDef], bytes_by_addr: &HashMap<u32, u8>) -> (HashMap<String, f64>, HashMap<String, String>) {
    let mut resolved_by_id: HashMap<String, f64> = HashMap::new();
    let mut out = HashMap::new();
    let mut units = HashMap::new();

    for p in params {
        let mut bytes = Vec::with_capacity(p.size as usize);
        let mut complete = true;
        for offset in 0..p.size as u32 {
            match bytes_by_addr.get(&(p.addr + offset)) {
                Some(b) => bytes.push(*b),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if !complete {
            continue;
        }

        let raw_int = decode_raw_value(&bytes, p.signed);
        let raw_value = raw_int as f64;

        let value = if p.kind == ParamKind::Bool && matches!(p.expr, None) {
            ((bytes[0] >> (p.bit - 1)) & 1) as f64
        } else {
            match &p.expr {
                Some(expr) => expr::eval(expr, raw_value, &resolved_by_id),
                None => raw_value,
            }
        };

        let rounded = round_to(value, p.decimals);
        resolved_by_id.insert(p.id.clone(), rounded);
        out.insert(p.topic_slug.clone(), rounded);
        units.insert(p.topic_slug.clone(), p.unit.clone());
    }

    (out, units)
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XML: &str = r#"
        <logprotocol type="SSM">
          <ecu type="BASE" id="">
            <parameter id="Engine Speed" storagetype="uint16" address="0x200" unit="rpm" />
          </ecu>
          <ecu type="A" id="4142434445" include="BASE">
            <parameter id="Coolant Temperature" storagetype="uint8" address="0x210" expr="value - 40" unit="C" />
            <parameter id="Throttle Opening Angle" storagetype="uint8" address="0x211" expr="value*0.75 - 32" decimals="1" />
            <parameter id="Some Unused" storagetype="uint8" address="0x212" />
          </ecu>
          <ecu type="B" id="41424344FF" include="A">
            <parameter id="Check Engine Light" storagetype="uint8" address="0x213" bit="3" />
          </ecu>
        </logprotocol>
    "#;

    #[test]
    fn test_exact_rom_match_wins_over_wildcard() {
        let catalog = ParamCatalog::load_from_str(SAMPLE_XML).unwrap();
        let (_, params) = catalog.params_for_rom("4142434445", "full").unwrap();
        assert!(params.iter().any(|p| p.id == "Engine Speed"));
        assert!(params.iter().any(|p| p.id == "Coolant Temperature"));
        assert!(!params.iter().any(|p| p.id == "Check Engine Light"));
    }

    #[test]
    fn test_wildcard_match_walks_includes() {
        let catalog = ParamCatalog::load_from_str(SAMPLE_XML).unwrap();
        let (_, params) = catalog.params_for_rom("4142434499", "full").unwrap();
        assert!(params.iter().any(|p| p.id == "Check Engine Light"));
        assert!(params.iter().any(|p| p.id == "Engine Speed"));
    }

    #[test]
    fn test_fast_profile_select_matches_scenario() {
        let catalog = ParamCatalog::load_from_str(SAMPLE_XML).unwrap();
        let (_, params) = catalog.params_for_rom("4142434445", "fast").unwrap();
        let ids: Vec<&str> = params.iter().map(|p| p.id.as_str()).collect();
        assert!(ids.contains(&"Engine Speed"));
        assert!(ids.contains(&"Coolant Temperature"));
        assert!(ids.contains(&"Throttle Opening Angle"));
        assert!(!ids.contains(&"Some Unused"));
    }

    #[test]
    fn test_expression_sample_scenario() {
        let catalog = ParamCatalog::load_from_str(SAMPLE_XML).unwrap();
        let (_, params) = catalog.params_for_rom("4142434445", "full").unwrap();
        let throttle = params.iter().find(|p| p.id == "Throttle Opening Angle").unwrap();
        let mut bytes = HashMap::new();
        bytes.insert(throttle.addr, 0xC8u8);
        let (decoded, units) = decode_rr_params(std::slice::from_ref(throttle), &bytes);
        assert_eq!(decoded[&throttle.topic_slug], 118.0);
        assert_eq!(units.get(&throttle.topic_slug), decoded.get(&throttle.topic_slug).map(|_| &throttle.unit));
    }

    #[test]
    fn test_fast_profile_keeps_duplicate_slug_after_suffix_strip() {
        assert_eq!(strip_disambiguation_suffix("engine_speed_2"), "engine_speed");
        assert_eq!(strip_disambiguation_suffix("engine_speed"), "engine_speed");
        assert_eq!(strip_disambiguation_suffix("fuel_injector_1_pulse_width"), "fuel_injector_1_pulse_width");
    }

    #[test]
    fn test_slug_disambiguation() {
        assert_eq!(slugify_metric("Foo Bar"), "foo_bar");
        assert_eq!(slugify_metric("foo/bar"), "foo_bar");
        assert_eq!(slugify_metric("Battery Voltage"), "battery_v");
    }

    #[test]
    fn test_decode_raw_value_signed_and_unsigned() {
        assert_eq!(decode_raw_value(&[0xFF], false), 255);
        assert_eq!(decode_raw_value(&[0xFF], true), -1);
        assert_eq!(decode_raw_value(&[0x01, 0x00], false), 256);
        assert_eq!(decode_raw_value(&[0xFF, 0xFF], true), -1);
    }

    #[test]
    fn test_bool_fast_path() {
        let def = ParamDef {
            id: "CEL".into(),
            topic_slug: "cel".into(),
            addr: 0x100,
            size: 1,
            signed: false,
            kind: ParamKind::Bool,
            bit: 3,
            unit: String::new(),
            decimals: 0,
            expr: None,
        };
        let mut bytes = HashMap::new();
        bytes.insert(0x100, 0b0000_0100u8); // bit 3 (1-indexed) set
        let (decoded, _) = decode_rr_params(&[def], &bytes);
        assert_eq!(decoded["cel"], 1.0);
    }
}
