use eyre::WrapErr;
use opfuzz::FuzzerConfig;
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, fmt, layer::SubscriberExt};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) -> eyre::Result<()> {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_filter(log_filter);
    let subscriber = Registry::default().with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .wrap_err("setting default subscriber failed")
}

/// Defaults, overridden by `OPFUZZ_*` variables, overridden by flags.
pub fn init_config(opts: &Options) -> eyre::Result<FuzzerConfig> {
    let mut config = FuzzerConfig::from_env()?;
    if let Some(seed) = opts.seed {
        config.seed = Some(seed);
    }
    if let Some(percent) = opts.substitution_percent {
        config.substitution_percent = percent;
    }
    if opts.no_jit {
        config.jit_enabled = false;
    }
    config.validate()?;
    Ok(config)
}
