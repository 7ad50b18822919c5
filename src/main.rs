use beacon_indexer::cli;
use std::process;

#[tokio::main]
async fn main() {
    match cli::run().await {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("Command failed with: {}", e);
            process::exit(1)
        }
    }
}
