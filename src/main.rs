#[tokio::main]
async fn main() -> anyhow::Result<()> {
    token_keeper::app::run().await
}
