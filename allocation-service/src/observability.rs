use tracing_subscriber::EnvFilter;

/// Logs go to stderr so that stdout carries only the JSON report.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "allocation_service=info".parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
