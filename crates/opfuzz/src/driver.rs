//! Runs source text through the instrumented front end and classifies the
//! result.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::FuzzerConfig;
use crate::errors::{CompileError, ConfigError, FuzzerError, JitError};
use crate::frontend;
use crate::interceptor::{FuzzingEmitter, MutationStats};
use crate::jit::{JitCompiler, ThreadedJit};
use crate::randomizer::Randomizer;
use crate::unit::CompiledUnit;
use crate::verifier::{StructuralVerifier, Verifier};

/// Name of the synthetic function every input is wrapped in.
pub const WRAPPER_NAME: &str = "wrapper_function";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FuzzOutcome {
    /// The wrapped text did not parse. No unit was produced.
    SyntaxError,
    /// The verifier rejected the mutated unit.
    VerificationError,
    /// The unit verified but the JIT reported an internal error.
    ErrorCaughtByJit,
    Success,
}

/// Outcome of one trial, with the mutated unit when one was produced.
#[derive(Debug, Clone)]
pub struct FuzzResult {
    pub unit: Option<CompiledUnit>,
    pub outcome: FuzzOutcome,
    /// Message of the syntax, verifier or JIT error behind the outcome.
    pub detail: Option<String>,
    pub stats: MutationStats,
}

/// A JIT-caught failure seen during a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Index of the corpus entry that produced it.
    pub entry: usize,
    pub iteration: u64,
    pub outcome: FuzzOutcome,
    pub detail: Option<String>,
    pub source: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CampaignReport {
    pub iterations: u64,
    pub outcomes: BTreeMap<FuzzOutcome, u64>,
    pub findings: Vec<Finding>,
    pub mutations: MutationStats,
}

impl CampaignReport {
    pub fn count(&self, outcome: FuzzOutcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

/// Indents `source` under a `def` of [`WRAPPER_NAME`] so that statement
/// fragments compile as a function body.
pub fn wrap_source(source: &str) -> String {
    let mut wrapped = format!("def {WRAPPER_NAME}():\n");
    for line in source.lines() {
        if !line.trim().is_empty() {
            wrapped.push_str("  ");
            wrapped.push_str(line);
        }
        wrapped.push('\n');
    }
    wrapped
}

pub struct Fuzzer {
    config: FuzzerConfig,
    randomizer: Randomizer,
    rng: StdRng,
    verifier: Box<dyn Verifier>,
    jit: Option<Box<dyn JitCompiler>>,
}

impl Fuzzer {
    /// Builds a fuzzer from a validated `config`.
    pub fn new(config: FuzzerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut jit = ThreadedJit::new();
        jit.set_enabled(config.jit_enabled);
        Ok(Self {
            randomizer: Randomizer::from(&config),
            verifier: Box::new(StructuralVerifier::new(config.cmp_op_domain)),
            jit: Some(Box::new(jit)),
            rng,
            config,
        })
    }

    pub fn with_verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifier = Box::new(verifier);
        self
    }

    pub fn with_jit(mut self, jit: impl JitCompiler + 'static) -> Self {
        self.jit = Some(Box::new(jit));
        self
    }

    pub fn without_jit(mut self) -> Self {
        self.jit = None;
        self
    }

    pub fn config(&self) -> &FuzzerConfig {
        &self.config
    }

    /// Runs one trial on `source`.
    ///
    /// Syntax, verifier and JIT errors are outcomes. An error is returned
    /// only when the fuzzer broke one of its own invariants.
    pub fn fuzz(&mut self, source: &str) -> Result<FuzzResult, FuzzerError> {
        let wrapped = wrap_source(source);
        let mut emitter = FuzzingEmitter::new(
            &mut self.rng,
            self.randomizer,
            self.config.substitution_percent,
            self.config.cmp_op_domain,
        );
        let compiled = frontend::compile(&wrapped, &mut emitter);
        let stats = emitter.stats();

        let unit = match compiled {
            Ok(unit) => unit,
            Err(CompileError::Syntax(err)) => {
                debug!(%err, "Rejected by the front end");
                return Ok(FuzzResult {
                    unit: None,
                    outcome: FuzzOutcome::SyntaxError,
                    detail: Some(err.to_string()),
                    stats,
                });
            }
            Err(CompileError::Fuzzer(err)) => return Err(err),
        };

        if let Err(err) = self.verifier.validate(&unit) {
            debug!(%err, "Rejected by the verifier");
            return Ok(FuzzResult {
                unit: Some(unit),
                outcome: FuzzOutcome::VerificationError,
                detail: Some(err.to_string()),
                stats,
            });
        }

        if let Some(jit) = &self.jit {
            let function = unit.code_constants().next().ok_or_else(|| {
                FuzzerError::Internal(format!("{WRAPPER_NAME} was not compiled to a unit"))
            })?;
            match jit.compile(function) {
                Ok(code) => debug!(
                    ops = code.len(),
                    max_stack_depth = code.max_stack_depth,
                    "JIT compiled"
                ),
                Err(JitError::Disabled) => debug!("JIT disabled, skipping"),
                Err(err) => {
                    debug!(%err, "JIT reported an internal error");
                    return Ok(FuzzResult {
                        unit: Some(unit),
                        outcome: FuzzOutcome::ErrorCaughtByJit,
                        detail: Some(err.to_string()),
                        stats,
                    });
                }
            }
        }

        Ok(FuzzResult {
            unit: Some(unit),
            outcome: FuzzOutcome::Success,
            detail: None,
            stats,
        })
    }

    /// Cycles through `corpus` for `iterations` trials.
    pub fn run_campaign(
        &mut self,
        corpus: &[String],
        iterations: u64,
    ) -> Result<CampaignReport, FuzzerError> {
        let mut report = CampaignReport::default();
        if corpus.is_empty() {
            return Ok(report);
        }
        for (iteration, (entry, source)) in (0..iterations).zip(corpus.iter().enumerate().cycle())
        {
            let result = self.fuzz(source)?;
            report.iterations += 1;
            *report.outcomes.entry(result.outcome).or_default() += 1;
            report.mutations.merge(&result.stats);
            if result.outcome == FuzzOutcome::ErrorCaughtByJit {
                info!(entry, iteration, detail = ?result.detail, "Found JIT error");
                report.findings.push(Finding {
                    entry,
                    iteration,
                    outcome: result.outcome,
                    detail: result.detail,
                    source: source.clone(),
                });
            }
        }
        info!(
            iterations = report.iterations,
            findings = report.findings.len(),
            "Campaign finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_source_indents_non_blank_lines() {
        assert_eq!(
            wrap_source("x = 1\n\ny = 2"),
            "def wrapper_function():\n  x = 1\n\n  y = 2\n"
        );
    }

    #[test]
    fn test_seeded_fuzzers_agree() {
        let config = FuzzerConfig::default().with_seed(7);
        let source = "a = 'text'\nb = a + 'more'\nc = b < a\n";
        let mut first = Fuzzer::new(config.clone()).unwrap();
        let mut second = Fuzzer::new(config).unwrap();
        for _ in 0..5 {
            let left = first.fuzz(source).unwrap();
            let right = second.fuzz(source).unwrap();
            assert_eq!(left.outcome, right.outcome);
            assert_eq!(
                left.unit.map(|u| u.to_string()),
                right.unit.map(|u| u.to_string())
            );
        }
    }

    #[test]
    fn test_campaign_counts_every_iteration() {
        let config = FuzzerConfig::default().with_seed(3);
        let corpus = vec!["x = 1".to_string(), "def f(:".to_string()];
        let report = Fuzzer::new(config)
            .unwrap()
            .run_campaign(&corpus, 10)
            .unwrap();
        assert_eq!(report.iterations, 10);
        assert_eq!(report.count(FuzzOutcome::SyntaxError), 5);
        assert_eq!(report.outcomes.values().sum::<u64>(), 10);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"]["syntax_error"], 5);
    }

    #[test]
    fn test_empty_corpus() {
        let report = Fuzzer::new(FuzzerConfig::default().with_seed(1))
            .unwrap()
            .run_campaign(&[], 4)
            .unwrap();
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = FuzzerConfig {
            min_str_len: 9,
            max_str_len: 2,
            ..FuzzerConfig::default()
        };
        assert!(matches!(
            Fuzzer::new(config),
            Err(ConfigError::InvalidRange { field: "str_len", .. })
        ));
        let config = FuzzerConfig {
            substitution_percent: 101,
            ..FuzzerConfig::default()
        };
        assert!(Fuzzer::new(config).is_err());
    }

    #[test]
    fn test_disabled_jit_skips_compilation() {
        // Only the JIT rejects the trailing BAD comparison.
        let config = FuzzerConfig {
            substitution_percent: 0,
            ..FuzzerConfig::default()
        }
        .with_seed(13);
        let disabled = FuzzerConfig {
            jit_enabled: false,
            ..config.clone()
        };
        let mut enabled = Fuzzer::new(config).unwrap();
        let mut disabled = Fuzzer::new(disabled).unwrap();
        let mut caught = 0;
        for _ in 0..200 {
            let with_jit = enabled.fuzz("x = a < b").unwrap();
            let without_jit = disabled.fuzz("x = a < b").unwrap();
            assert_ne!(without_jit.outcome, FuzzOutcome::ErrorCaughtByJit);
            if with_jit.outcome == FuzzOutcome::ErrorCaughtByJit {
                caught += 1;
                assert_eq!(without_jit.outcome, FuzzOutcome::Success);
            }
        }
        assert!(caught > 0);
    }
}
