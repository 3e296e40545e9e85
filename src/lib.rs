mod app;
mod config;
mod db;
mod error;
mod model;
mod normalize;
mod web;

pub use config::AppConfig;

pub async fn run() -> anyhow::Result<()> {
    app::run().await
}
