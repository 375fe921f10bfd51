use std::time::Duration;

use forge_kernel::{kernel, Kernel, KernelConfig, TaskSpec};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = KernelConfig::load().unwrap_or_default();
    kernel::init_logging(&config.observability);

    info!("starting forge-kernel demo");
    let forge = Kernel::start(config).await;

    let handle = forge
        .queue()
        .submit(
            TaskSpec::new("demo-task", |ctx| {
                Box::pin(async move {
                    if let Some(progress) = ctx.progress() {
                        progress.start();
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(serde_json::json!({"greeting": "hello from the kernel"}))
                })
            })
            .with_progress(1, "demo task"),
        )
        .await?;

    let result = forge.queue().await_task(&handle.id, Some(Duration::from_secs(5))).await;
    info!(?result, "demo task finished");

    forge.shutdown().await;
    Ok(())
}
