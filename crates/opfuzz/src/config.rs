use serde::Deserialize;

use crate::errors::ConfigError;

pub const CONFIG_PREFIX: &str = "OPFUZZ_";

/// Tunables for one fuzzer instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FuzzerConfig {
    /// Chance (1-100) that an eligible instruction has its opcode replaced.
    pub substitution_percent: u8,
    /// Length bounds of randomized strings.
    pub min_str_len: usize,
    pub max_str_len: usize,
    /// Bounds of randomized integer operands.
    pub min_int: i64,
    pub max_int: i64,
    /// Range of encoded operands.
    pub min_oparg: u32,
    pub max_oparg: u32,
    /// Number of valid comparison operators.
    pub cmp_op_domain: u32,
    /// Whether the JIT backend runs after verification.
    pub jit_enabled: bool,
    /// Seed for the random source. Entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            substitution_percent: 50,
            min_str_len: 0,
            max_str_len: 100,
            min_int: i64::MIN,
            max_int: i64::MAX,
            min_oparg: 0,
            max_oparg: u32::MAX,
            cmp_op_domain: 12,
            jit_enabled: true,
            seed: None,
        }
    }
}

impl FuzzerConfig {
    /// Reads `OPFUZZ_*` variables, using defaults for the ones not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = envy::prefixed(CONFIG_PREFIX)
            .from_env::<Self>()
            .map_err(|err| ConfigError::ConfigDeserializationError {
                err,
                from: "FuzzerConfig".to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_substitution_percent(mut self, percent: u8) -> Self {
        self.substitution_percent = percent;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.substitution_percent > 100 {
            return Err(ConfigError::InvalidValue {
                field: "substitution_percent",
                message: format!("{} is not a percentage", self.substitution_percent),
            });
        }
        if self.min_str_len > self.max_str_len {
            return Err(ConfigError::InvalidRange {
                field: "str_len",
                min: self.min_str_len.to_string(),
                max: self.max_str_len.to_string(),
            });
        }
        if self.min_int > self.max_int {
            return Err(ConfigError::InvalidRange {
                field: "int",
                min: self.min_int.to_string(),
                max: self.max_int.to_string(),
            });
        }
        if self.min_oparg > self.max_oparg {
            return Err(ConfigError::InvalidRange {
                field: "oparg",
                min: self.min_oparg.to_string(),
                max: self.max_oparg.to_string(),
            });
        }
        if self.cmp_op_domain == 0 || self.cmp_op_domain > self.max_oparg {
            return Err(ConfigError::InvalidValue {
                field: "cmp_op_domain",
                message: format!(
                    "{} does not fit the operand range 0..={}",
                    self.cmp_op_domain, self.max_oparg
                ),
            });
        }
        Ok(())
    }
}
