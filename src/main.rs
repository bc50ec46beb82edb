use moli::Moli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let maid = Moli::new(&config_path).await?;
    maid.run().await
}
