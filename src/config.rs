//! Linker configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::arch::Arch;
use crate::error::ConfigError;

const MIN_CODE_CACHE: usize = 64 * 1024;
const MAX_CODE_CACHE: usize = 1024 * 1024 * 1024;
const MAX_SHIFT: u32 = 3;
/// Hard ceiling on outgoing stack slots an adapter may use
const MAX_ADAPTER_STACK_SLOTS: u32 = 400;

/// Base and shift of a compressed reference encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressedEncoding {
    pub base: u64,
    pub shift: u32,
}

impl CompressedEncoding {
    /// `(address - base) >> shift`, if that round-trips through 32 bits.
    pub fn encode(&self, address: u64) -> Option<u32> {
        let delta = address.checked_sub(self.base)?;
        if delta & ((1u64 << self.shift) - 1) != 0 {
            return None;
        }
        u32::try_from(delta >> self.shift).ok()
    }

    pub fn decode(&self, narrow: u32) -> u64 {
        self.base + ((narrow as u64) << self.shift)
    }
}

/// Configuration for a [`crate::runtime::LinkRuntime`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkerConfig {
    pub arch: Arch,
    /// Usable code cache bytes, not counting the poll page
    pub code_cache_size: usize,
    /// Map the code cache executable. Off for tooling that never runs the code.
    pub map_executable: bool,
    pub compressed_oops: Option<CompressedEncoding>,
    pub compressed_class_pointers: Option<CompressedEncoding>,
    pub max_adapter_stack_slots: u32,
    pub trace_install: bool,
    pub trace_ic: bool,
    pub trace_adapters: bool,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            arch: Arch::host(),
            code_cache_size: 16 * 1024 * 1024,
            map_executable: false,
            compressed_oops: None,
            compressed_class_pointers: None,
            max_adapter_stack_slots: 256,
            trace_install: false,
            trace_ic: false,
            trace_adapters: false,
        }
    }
}

impl LinkerConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CODE_CACHE..=MAX_CODE_CACHE).contains(&self.code_cache_size) {
            return Err(ConfigError::Invalid(format!(
                "code_cache_size {} is outside {MIN_CODE_CACHE}..={MAX_CODE_CACHE}",
                self.code_cache_size
            )));
        }
        for (name, encoding) in [
            ("compressed_oops", self.compressed_oops),
            ("compressed_class_pointers", self.compressed_class_pointers),
        ] {
            if let Some(encoding) = encoding.filter(|e| e.shift > MAX_SHIFT) {
                return Err(ConfigError::Invalid(format!(
                    "{name}.shift {} is larger than {MAX_SHIFT}",
                    encoding.shift
                )));
            }
        }
        if self.max_adapter_stack_slots == 0 || self.max_adapter_stack_slots > MAX_ADAPTER_STACK_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "max_adapter_stack_slots must be within 1..={MAX_ADAPTER_STACK_SLOTS}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.arch, Arch::host());
        assert!(!config.trace_ic);
    }

    #[test]
    fn test_partial_toml() {
        let config = LinkerConfig::from_toml(
            r#"
arch = "aarch64"
trace_ic = true

[compressed_oops]
base = 0x800000000
shift = 3
"#,
        )
        .unwrap();
        assert_eq!(config.arch, Arch::Aarch64);
        assert!(config.trace_ic);
        assert_eq!(config.code_cache_size, LinkerConfig::default().code_cache_size);
        assert_eq!(
            config.compressed_oops,
            Some(CompressedEncoding {
                base: 0x8_0000_0000,
                shift: 3
            })
        );
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(matches!(
            LinkerConfig::from_toml("tracing = true"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation() {
        let err = LinkerConfig::from_toml("code_cache_size = 4096").unwrap_err();
        assert!(err.to_string().contains("code_cache_size"));

        let err = LinkerConfig::from_toml("[compressed_class_pointers]\nbase = 0\nshift = 4").unwrap_err();
        assert!(err.to_string().contains("shift"));

        assert!(LinkerConfig::from_toml("max_adapter_stack_slots = 401").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "arch = \"riscv64\"\ncode_cache_size = 131072").unwrap();
        let config = LinkerConfig::load(file.path()).unwrap();
        assert_eq!(config.arch, Arch::Riscv64);
        assert_eq!(config.code_cache_size, 128 * 1024);

        let missing = file.path().with_extension("missing");
        assert!(matches!(LinkerConfig::load(&missing), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_compressed_encoding() {
        let enc = CompressedEncoding {
            base: 0x1000_0000,
            shift: 3,
        };
        assert_eq!(enc.encode(0x1000_0040), Some(8));
        assert_eq!(enc.decode(8), 0x1000_0040);
        assert_eq!(enc.encode(0x1000_0041), None);
        assert_eq!(enc.encode(0x0FFF_FFF8), None);
        assert_eq!(enc.encode(0x1000_0000 + (1u64 << 35)), None);
    }
}
