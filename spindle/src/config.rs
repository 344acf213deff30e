//! Tunables consulted when fibers are created.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Name of the default stack size tunable.
pub const STACK_SIZE_KEY: &str = "fiber.stack_size";

pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

const ENV_PREFIX: &str = "SPINDLE_";

// 0 until resolved or installed
static STACK_SIZE: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FiberConfig {
    /// Bytes allocated for a fiber created with a stack size of 0.
    pub stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        FiberConfig {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl FiberConfig {
    /// Resolves every named tunable through `lookup`.
    /// Names that `lookup` doesn't know keep their default.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut config = FiberConfig::default();
        if let Some(value) = lookup(STACK_SIZE_KEY) {
            config.stack_size = parse_size(STACK_SIZE_KEY, &value)?;
        }
        Ok(config)
    }

    /// Reads `fiber.stack_size` from `SPINDLE_FIBER_STACK_SIZE`.
    pub fn from_env() -> Result<Self> {
        FiberConfig::from_lookup(|key| std::env::var(env_key(key)).ok())
    }

    /// Makes this the process-wide configuration.
    pub fn install(self) -> Result<()> {
        if self.stack_size == 0 {
            return Err(Error::InvalidConfig {
                key: STACK_SIZE_KEY,
                value: self.stack_size.to_string(),
            });
        }
        STACK_SIZE.store(self.stack_size, Ordering::Release);
        log::debug!("default fiber stack size set to {}", self.stack_size);
        Ok(())
    }
}

/// Environment variable backing a named tunable.
pub fn env_key(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.replace('.', "_").to_ascii_uppercase())
}

fn parse_size(key: &'static str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(Error::InvalidConfig {
            key,
            value: value.to_owned(),
        }),
    }
}

/// Default stack size in bytes.
///
/// Resolved from the environment on first use unless a configuration was
/// installed before.
pub fn stack_size() -> usize {
    match STACK_SIZE.load(Ordering::Acquire) {
        0 => {
            let size = match FiberConfig::from_env() {
                Ok(config) => config.stack_size,
                Err(error) => {
                    log::warn!("{error}, using {DEFAULT_STACK_SIZE}");
                    DEFAULT_STACK_SIZE
                }
            };
            // an install racing with us wins
            match STACK_SIZE.compare_exchange(0, size, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => size,
                Err(installed) => installed,
            }
        }
        size => size,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_to_128_kib() {
        let config = FiberConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.stack_size, 131072);
    }

    #[test]
    fn resolves_named_keys() {
        let values = HashMap::from([(STACK_SIZE_KEY, " 65536 ".to_owned())]);
        let config = FiberConfig::from_lookup(|key| values.get(key).cloned()).unwrap();
        assert_eq!(config.stack_size, 65536);
    }

    #[test]
    fn rejects_bad_sizes() {
        for value in ["0", "-1", "lots", ""] {
            let error = FiberConfig::from_lookup(|_| Some(value.to_owned())).unwrap_err();
            assert!(matches!(error, Error::InvalidConfig { key: STACK_SIZE_KEY, .. }), "{value}");
        }
    }

    #[test]
    fn refuses_to_install_zero() {
        assert!(FiberConfig { stack_size: 0 }.install().is_err());
    }

    #[test]
    fn env_names() {
        assert_eq!(env_key(STACK_SIZE_KEY), "SPINDLE_FIBER_STACK_SIZE");
    }
}
