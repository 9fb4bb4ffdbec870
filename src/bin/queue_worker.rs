//! `queue-worker` binary entry point: loads configuration, installs
//! logging, and hands off to the Supervisor.

use queue_worker_core::{config, logging, supervisor};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logging::init();

    let config = config::load().unwrap_or_else(|e| {
        eprintln!("FATAL: {e:#}");
        std::process::exit(1);
    });

    let code = supervisor::run(config).await;
    std::process::exit(code);
}
