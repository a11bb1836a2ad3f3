//! `tracing` subscriber setup for binaries embedding the watchers.
//!
//! The filter comes from `RUST_LOG` and defaults to `info`.
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Install a global subscriber writing compact lines to stdout.
pub fn setup_logging() -> anyhow::Result<()> {
    setup_logging_with_writer(std::io::stdout)
}

/// Install a global subscriber writing to `writer`.
pub fn setup_logging_with_writer<W>(writer: W) -> anyhow::Result<()>
where
    W: for<'writer> fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact(),
        )
        .try_init()?;
    Ok(())
}
