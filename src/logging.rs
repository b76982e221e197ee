use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. `RUST_LOG` wins when set;
/// otherwise `verbose` picks debug over info for this crate.
///
/// Safe to call more than once: later calls are no-ops.
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "voxel_commons=debug,server=debug,client=debug"
    } else {
        "voxel_commons=info,server=info,client=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
