//! Structured logging (§4.M). Grounded on the teacher's
//! `plugins::logging::init` — an `EnvFilter` plus a `tracing_subscriber`
//! fmt layer, with `log::` call sites forwarded through `LogTracer` — but
//! writing to stderr rather than a rotating daily file: this gateway is
//! a headless daemon expected to run under a process supervisor (systemd,
//! Docker) that already captures and rotates stderr, so a second
//! in-process rotation scheme would just be redundant bookkeeping.

pub fn init() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr())))
        .try_init()
        .ok();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sentrygate started");
}
