use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::Value;

use crate::arch::Arch;

/// Config sections deserialize from a named table of the TOML file; a
/// missing section falls back to defaults.
pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value
                .clone()
                .try_into()
                .expect("cannot deserialize config section"),
            None => Self::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub arch: Arch,
    /// 0 selects the architecture default.
    pub cores: usize,
    /// In MiB; 0 selects the architecture default.
    pub memory_mb: u64,
    pub debug: bool,
    pub performance: bool,
    pub ring_bus: bool,
    /// Pace PCIe transfers to (scaled) real time.
    pub pace_pcie: bool,
    pub perf_csv: Option<String>,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            arch: Arch::Knc,
            cores: 0,
            memory_mb: 0,
            debug: false,
            performance: false,
            ring_bus: false,
            pace_pcie: false,
            perf_csv: None,
        }
    }
}

impl SimConfig {
    /// Load the `[sim]` section of a TOML config file.
    pub fn from_file(path: &std::path::Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!("config file {} not read: {err}", path.display());
                return Self::default();
            }
        };
        let table: Value = match toml::from_str(&text) {
            Ok(table) => table,
            Err(err) => {
                warn!("config file {} not parsed: {err}", path.display());
                return Self::default();
            }
        };
        Self::from_section(table.get("sim"))
    }

    pub fn effective_cores(&self) -> usize {
        if self.cores == 0 {
            self.arch.profile().num_cores
        } else {
            self.cores
        }
    }

    pub fn effective_memory_size(&self) -> u64 {
        if self.memory_mb == 0 {
            self.arch.profile().memory_size
        } else {
            self.memory_mb << 20
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_track_architecture() {
        let cfg = SimConfig::default();
        assert_eq!(cfg.effective_cores(), 60);
        assert_eq!(cfg.effective_memory_size(), 8 << 30);

        let cfg = SimConfig {
            arch: Arch::Knl,
            ..SimConfig::default()
        };
        assert_eq!(cfg.effective_cores(), 68);
        assert_eq!(cfg.effective_memory_size(), 16 << 30);
    }

    #[test]
    fn overrides_win() {
        let cfg = SimConfig {
            cores: 4,
            memory_mb: 256,
            ..SimConfig::default()
        };
        assert_eq!(cfg.effective_cores(), 4);
        assert_eq!(cfg.effective_memory_size(), 256 << 20);
    }

    #[test]
    fn parses_sim_section() {
        let table: Value = toml::from_str(
            r#"
            [sim]
            arch = "knl"
            cores = 8
            ring_bus = true
            "#,
        )
        .unwrap();
        let cfg = SimConfig::from_section(table.get("sim"));
        assert_eq!(cfg.arch, Arch::Knl);
        assert_eq!(cfg.cores, 8);
        assert!(cfg.ring_bus);
        assert!(!cfg.debug);
    }

    #[test]
    fn missing_section_is_default() {
        let table: Value = toml::from_str("[other]\nx = 1\n").unwrap();
        let cfg = SimConfig::from_section(table.get("sim"));
        assert_eq!(cfg.cores, 0);
    }
}
