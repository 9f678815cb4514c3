use std::time;

use anyhow::Result;
use leaky_throttle::RateLimiter;

#[tokio::main]
async fn main() -> Result<()> {
    helpers::init_logging();

    let limiter = RateLimiter::per_second(5.0, 10)?;

    let start = time::Instant::now();

    for n in 0..15 {
        let accepted = limiter.submit(move || {
            println!("task {} ran after {:?}", n, start.elapsed());
        });

        if !accepted {
            println!("task {} rejected, queue is full", n);
        }
    }

    println!("Draining...");

    // Should take about two seconds, one task every 200ms.
    limiter.drain().await;

    println!("Drained in {:?}!", start.elapsed());
    Ok(())
}
