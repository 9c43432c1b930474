use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// `level` seeds the default filter (RUST_LOG still wins when set);
/// `format` selects json (default), pretty, or compact output.
pub fn init(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
        .add_directive("hyper=warn".parse().expect("valid directive"))
        .add_directive("tokio=warn".parse().expect("valid directive"))
        .add_directive("sqlx=warn".parse().expect("valid directive"));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        "pretty" => registry
            .with(fmt::layer().pretty().with_target(true))
            .init(),
        "compact" | "text" => registry
            .with(fmt::layer().compact().with_target(true))
            .init(),
        _ => registry
            .with(fmt::layer().json().with_target(true))
            .init(),
    }
}
