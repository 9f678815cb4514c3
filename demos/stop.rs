use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use leaky_throttle::RateLimiter;

#[tokio::main]
async fn main() -> Result<()> {
    helpers::init_logging();

    let limiter = RateLimiter::per_second(10.0, 100)?;
    let executed = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let executed = executed.clone();

        limiter.submit(move || {
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }

    tokio::time::sleep(Duration::from_millis(550)).await;

    println!("Stopping with {} tasks queued...", limiter.len());
    limiter.stop();

    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("Executed {} tasks", executed.load(Ordering::SeqCst));
    Ok(())
}
