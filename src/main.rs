mod cli;

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}
