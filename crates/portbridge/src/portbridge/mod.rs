pub mod admin;
pub mod agent;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

pub async fn run(overrides: app::Overrides) -> anyhow::Result<()> {
    app::run(overrides).await
}
