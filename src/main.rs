// `main.rs` stays tiny: everything lives in the library and `server::run()`
// wires it together.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logistics_ingest::server::run().await
}
