//! PDU definition manifests
//!
//! A definition file maps `(robot, pdu name)` to a channel id and byte size.
//! Two on-disk forms exist: the legacy form carries inline reader/writer
//! lists per robot; the compact form shares PDU type sets between robots via
//! a `paths` table of type files referenced by `pdutypes_id`. Definitions
//! are loaded once and read-only afterwards; shared owners hold them behind
//! an `Arc`.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Definition of a single PDU channel
#[derive(Debug, Clone)]
pub struct PduDef {
    pub type_name: String,
    /// Original PDU name; the per-robot lookup key
    pub name: String,
    /// Display name; equals `name` unless the manifest says otherwise
    pub display_name: String,
    pub channel_id: u32,
    pub pdu_size: usize,
    pub method_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyRoot {
    robots: Vec<LegacyRobot>,
}

#[derive(Debug, Deserialize)]
struct LegacyRobot {
    name: String,
    #[serde(default)]
    shm_pdu_readers: Vec<LegacyDef>,
    #[serde(default)]
    shm_pdu_writers: Vec<LegacyDef>,
}

#[derive(Debug, Deserialize)]
struct LegacyDef {
    #[serde(rename = "type")]
    type_name: String,
    org_name: String,
    #[serde(default)]
    name: Option<String>,
    channel_id: u32,
    pdu_size: usize,
    #[serde(default)]
    method_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompactRoot {
    paths: Vec<CompactPath>,
    robots: Vec<CompactRobot>,
}

#[derive(Debug, Deserialize)]
struct CompactPath {
    id: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct CompactRobot {
    name: String,
    pdutypes_id: String,
}

#[derive(Debug, Deserialize)]
struct CompactDef {
    channel_id: u32,
    pdu_size: usize,
    name: String,
    #[serde(rename = "type")]
    type_name: String,
}

/// Loaded, immutable name/channel mapping for a set of robots
#[derive(Debug, Default)]
pub struct PduDefinition {
    // robot name -> pdu name -> definition
    robots: HashMap<String, HashMap<String, PduDef>>,
}

impl PduDefinition {
    /// Load a definition file, auto-detecting the legacy or compact form
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        let root: serde_json::Value = serde_json::from_str(&text)?;

        if root.get("paths").is_some() {
            Self::load_compact(path, root)
        } else {
            Self::load_legacy(root)
        }
    }

    fn load_legacy(root: serde_json::Value) -> Result<Self> {
        let root: LegacyRoot = serde_json::from_value(root)
            .map_err(|e| Error::InvalidConfig(format!("bad PDU definition: {}", e)))?;

        let mut robots: HashMap<String, HashMap<String, PduDef>> = HashMap::new();
        for robot in root.robots {
            let defs = robots.entry(robot.name.clone()).or_default();
            for entry in robot.shm_pdu_readers.into_iter().chain(robot.shm_pdu_writers) {
                // a PDU listed as both reader and writer keeps the first record
                if defs.contains_key(&entry.org_name) {
                    continue;
                }
                let display_name = entry.name.clone().unwrap_or_else(|| entry.org_name.clone());
                defs.insert(
                    entry.org_name.clone(),
                    PduDef {
                        type_name: entry.type_name,
                        name: entry.org_name,
                        display_name,
                        channel_id: entry.channel_id,
                        pdu_size: entry.pdu_size,
                        method_type: entry.method_type,
                    },
                );
            }
        }
        Ok(Self { robots })
    }

    fn load_compact(path: &Path, root: serde_json::Value) -> Result<Self> {
        let root: CompactRoot = serde_json::from_value(root)
            .map_err(|e| Error::InvalidConfig(format!("bad PDU definition: {}", e)))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut type_sets: HashMap<String, Vec<CompactDef>> = HashMap::new();
        for entry in root.paths {
            let type_path = base_dir.join(&entry.path);
            let text = std::fs::read_to_string(&type_path)
                .map_err(|_| Error::FileNotFound(type_path.display().to_string()))?;
            let defs: Vec<CompactDef> = serde_json::from_str(&text)
                .map_err(|e| Error::InvalidConfig(format!("bad PDU type file {}: {}", entry.path, e)))?;
            type_sets.insert(entry.id, defs);
        }

        let mut robots: HashMap<String, HashMap<String, PduDef>> = HashMap::new();
        for robot in root.robots {
            let set = type_sets.get(&robot.pdutypes_id).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "robot {} references unknown pdutypes_id {}",
                    robot.name, robot.pdutypes_id
                ))
            })?;
            let defs = robots.entry(robot.name).or_default();
            for entry in set {
                defs.insert(
                    entry.name.clone(),
                    PduDef {
                        type_name: entry.type_name.clone(),
                        name: entry.name.clone(),
                        display_name: entry.name.clone(),
                        channel_id: entry.channel_id,
                        pdu_size: entry.pdu_size,
                        method_type: None,
                    },
                );
            }
        }
        Ok(Self { robots })
    }

    /// Look up a PDU by robot and name
    pub fn resolve(&self, robot: &str, pdu_name: &str) -> Option<&PduDef> {
        self.robots.get(robot)?.get(pdu_name)
    }

    /// Look up a PDU by robot and channel id
    pub fn resolve_channel(&self, robot: &str, channel_id: u32) -> Option<&PduDef> {
        self.robots
            .get(robot)?
            .values()
            .find(|d| d.channel_id == channel_id)
    }

    /// PDU byte size for a robot/name pair, 0 when unknown
    pub fn pdu_size(&self, robot: &str, pdu_name: &str) -> usize {
        self.resolve(robot, pdu_name).map_or(0, |d| d.pdu_size)
    }

    /// Channel id for a robot/name pair
    pub fn channel_id(&self, robot: &str, pdu_name: &str) -> Option<u32> {
        self.resolve(robot, pdu_name).map(|d| d.channel_id)
    }

    pub fn robot_names(&self) -> impl Iterator<Item = &str> {
        self.robots.keys().map(String::as_str)
    }
}
