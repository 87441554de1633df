pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod tunnel;

pub async fn serve(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::serve(config_path).await
}

pub async fn connect(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::connect(config_path).await
}
