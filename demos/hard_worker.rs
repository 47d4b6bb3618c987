//! Enqueue a few jobs and process them until Ctrl+C.
//!
//! Requires a running Redis. Configure with `HARBOR_*` variables, e.g.
//!
//! ```text
//! HARBOR_STORE_URL=redis://127.0.0.1:6379/0 HARBOR_LOG_FORMAT=pretty \
//!     cargo run --example hard_worker
//! ```

use harbor::*;
use serde_json::json;
use std::time::Duration;

/// Args: `[how_hard, how_long_seconds]`, both optional.
async fn hard_worker(args: JobArgs) -> QueueResult<()> {
    let how_hard = args
        .first()
        .and_then(|v| v.as_str())
        .unwrap_or("super hard")
        .to_string();
    let how_long = match args.get(1) {
        None => 1,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| QueueError::handler(format!("bad duration: {}", v)))?,
    };

    tokio::time::sleep(Duration::from_secs(how_long)).await;
    println!("Workin' {} for {}s.", how_hard, how_long);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let config = Config::from_env()?;

    let client = Client::connect(&config).await?;
    client
        .enqueue("default", "HardWorker", vec![json!("super hard"), json!(1)])
        .await?;
    client
        .enqueue("default", "HardWorker", vec![json!("pretty hard"), json!(2)])
        .await?;
    client
        .enqueue_in(
            "default",
            "HardWorker",
            vec![json!("eventually")],
            Duration::from_secs(5),
        )
        .await?;

    let mut registry = HandlerRegistry::new();
    registry.register_fn("HardWorker", hard_worker);

    println!("Processing jobs, press Ctrl+C to stop");
    Server::connect(config, registry)
        .await?
        .run_until_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
