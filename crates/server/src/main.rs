#[tokio::main]
async fn main() -> anyhow::Result<()> {
    amora_server::run().await
}
