use otel_mutator::core::MutatorApp;

#[tokio::main]
async fn main() {
    if let Err(e) = MutatorApp::run().await {
        eprintln!("\nError: {:#}\n", e);
        std::process::exit(1);
    }
}
