pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

/// Reported to gateways in the handshake. Set `PROMTUN_VERSION` at build time
/// to override the crate version.
pub const VERSION: &str = match option_env!("PROMTUN_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

pub async fn run(args: config::StartupArgs) -> anyhow::Result<()> {
    app::run(args).await
}
