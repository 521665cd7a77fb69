#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stepwright_cli::cli::run().await
}
