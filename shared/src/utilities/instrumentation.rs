use time::macros::format_description;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, fmt::time::LocalTime, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Installs the fmt subscriber used by every service binary. `RUST_LOG`
/// wins over the configured level when set.
pub fn init_tracing(service_name: &str, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{service_name}={level},shared={level},release_core={level},tower_http=warn,hyper=warn"
        ))
    });

    let timer = LocalTime::new(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(timer),
        )
        .init();
}
