use duxnet_node::run_node;
use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::var("DUXNET_CONFIG").unwrap_or_else(|_| "config/duxnet.toml".to_string());
    if let Err(e) = run_node(PathBuf::from(path)).await {
        eprintln!("node failed: {e:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
