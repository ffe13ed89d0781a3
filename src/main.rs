#[tokio::main]
async fn main() {
    if let Err(error) = chatwire_lib::run().await {
        eprintln!("chatwire failed: {error}");
        std::process::exit(1);
    }
}
