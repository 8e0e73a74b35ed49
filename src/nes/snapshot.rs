use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use super::apu::Apu;
use super::cpu::Cpu;
use super::mapper::MapperState;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Whole-machine state. Byte arenas are stored as base64 strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Fingerprint of the PRG image the state was taken from.
    pub rom_sha1: String,
    pub cpu: Cpu,
    #[serde(with = "bytes_b64")]
    pub ram: Vec<u8>,
    pub mapper: MapperState,
    pub apu: Apu,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize snapshot")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(text).context("failed to parse snapshot JSON")?;
        if snapshot.version != SNAPSHOT_VERSION {
            bail!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            );
        }
        Ok(snapshot)
    }
}

pub(crate) mod bytes_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::mapper::MapperRegisters;

    fn sample() -> Snapshot {
        let mut cpu = Cpu::new();
        cpu.a = 0x42;
        cpu.pc = 0xC123;
        Snapshot {
            version: SNAPSHOT_VERSION,
            rom_sha1: "abc=".to_string(),
            cpu,
            ram: (0..=255u8).cycle().take(2048).collect(),
            mapper: MapperState {
                registers: MapperRegisters::Fixed,
                prg_ram: vec![0xAA; 16],
                chr_ram: Vec::new(),
            },
            apu: Apu::new(),
        }
    }

    #[test]
    fn byte_arenas_are_base64_strings() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["ram"].is_string());
        assert_eq!(value["mapper"]["prg_ram"], "qqqqqqqqqqqqqqqqqqqqqg==");
        assert_eq!(value["mapper"]["chr_ram"], "");
        assert_eq!(value["mapper"]["registers"]["kind"], "fixed");
    }

    #[test]
    fn json_restores_registers_and_memory() {
        let original = sample();
        let restored = Snapshot::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(restored.cpu, original.cpu);
        assert_eq!(restored.ram, original.ram);
        assert_eq!(restored.mapper, original.mapper);
        assert_eq!(restored.rom_sha1, original.rom_sha1);
    }

    #[test]
    fn rejects_other_versions_and_bad_payloads() {
        let mut snapshot = sample();
        snapshot.version = SNAPSHOT_VERSION + 1;
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(Snapshot::from_json(&json).is_err());

        let bad_ram = sample()
            .to_json()
            .unwrap()
            .replacen("\"ram\":\"", "\"ram\":\"***", 1);
        assert!(Snapshot::from_json(&bad_ram).is_err());
        assert!(Snapshot::from_json("{").is_err());
    }
}
