#[tokio::main]
async fn main() {
    if let Err(err) = anssl::run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
