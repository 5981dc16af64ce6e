mod element;
mod host;
mod link;
mod radio;
mod transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
