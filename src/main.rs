//! Theras distribution service

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    theras_distribution::server::run().await
}
