#[tokio::main]
async fn main() -> anyhow::Result<()> {
    trace_analyzer::service::run().await
}
