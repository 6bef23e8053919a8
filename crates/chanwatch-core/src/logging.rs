use crate::{errors::Error, Result};

/// Initialize tracing for a chanwatch binary.
///
/// Defaults to `info` for our crates and everything else; `RUST_LOG` wins when set.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "info,chanwatch_core=info,chanwatch_store=info,chanwatch_telegram=info,{service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init()
        .map_err(|e| Error::External(format!("logging init failed: {e}")))?;

    Ok(())
}
