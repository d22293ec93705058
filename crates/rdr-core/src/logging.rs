use crate::Result;

/// Initialize tracing for a service binary.
///
/// Default: info for our crates, warn for everything else. Can be overridden
/// with `RUST_LOG`.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,rdr=info,rdr_core=info,rdr_relay=info,rdr_worker=info,rdr_embeddings=info,{service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .init();

    Ok(())
}
