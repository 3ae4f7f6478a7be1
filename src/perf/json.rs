//! JSON event-name resolver.
//!
//! The bundle is a flat JSON array of `{"name", "config", "config1", "config2"}`
//! objects, the same shape distributed as `.../events/<model>.json` by the
//! Linux `perf` tooling's event-list generator. Only the fields this crate
//! actually dispatches on (`config`/`config1`/`config2`, feeding
//! `perf_event_open::event::raw::Raw`) are modeled; unknown fields are
//! ignored by `serde_json`.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct RawEventDef {
    pub name: String,
    #[serde(default, deserialize_with = "hex_or_dec")]
    pub config: u64,
    #[serde(default, deserialize_with = "hex_or_dec")]
    pub config1: u64,
    #[serde(default, deserialize_with = "hex_or_dec")]
    pub config2: u64,
}

fn hex_or_dec<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => {
            let s = s.trim();
            let parsed = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .map(|hex| u64::from_str_radix(hex, 16))
                .unwrap_or_else(|| s.parse());
            parsed.map_err(serde::de::Error::custom)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    pub name: String,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
}

/// Parses a JSON event bundle and resolves `names` against it, in order.
///
/// Fails on an empty bundle and on the first name with no matching entry;
/// it does not silently drop unresolved events.
pub fn resolve(bundle_json: &str, names: &[String]) -> Result<Vec<ResolvedEvent>> {
    let defs: Vec<RawEventDef> = serde_json::from_str(bundle_json)
        .map_err(|e| Error::parse("perf event bundle", e.to_string()))?;
    if defs.is_empty() {
        return Err(Error::parse("perf event bundle", "empty bundle".to_string()));
    }

    let by_name: HashMap<&str, &RawEventDef> = defs.iter().map(|d| (d.name.as_str(), d)).collect();

    names
        .iter()
        .map(|name| {
            by_name
                .get(name.as_str())
                .map(|d| ResolvedEvent {
                    name: d.name.clone(),
                    config: d.config,
                    config1: d.config1,
                    config2: d.config2,
                })
                .ok_or_else(|| Error::UnknownPerfEvent { name: name.clone() })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = r#"[
        {"name": "CPU_CLK_UNHALTED.C02", "config": "0x3C"},
        {"name": "CPU_CLK_UNHALTED.THREAD", "config": 60}
    ]"#;

    #[test]
    fn resolves_known_events_in_order() {
        let names = vec!["CPU_CLK_UNHALTED.THREAD".to_string(), "CPU_CLK_UNHALTED.C02".to_string()];
        let resolved = resolve(BUNDLE, &names).unwrap();
        assert_eq!(resolved[0].config, 60);
        assert_eq!(resolved[1].config, 0x3C);
    }

    #[test]
    fn unresolved_name_is_an_error() {
        let names = vec!["NOT_A_REAL_EVENT".to_string()];
        assert!(matches!(resolve(BUNDLE, &names), Err(Error::UnknownPerfEvent { .. })));
    }

    #[test]
    fn empty_bundle_is_an_error() {
        assert!(resolve("[]", &["X".to_string()]).is_err());
    }
}
