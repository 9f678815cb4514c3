use std::thread;
use std::time;

use anyhow::Result;
use leaky_throttle::{Dispatch, RateLimiter};

/// Slow tasks don't hold up the tick rate with detached dispatch, compare the
/// timings with `Dispatch::Inline`.
async fn grind(what: &str, dispatch: Dispatch) -> Result<()> {
    let limiter = RateLimiter::builder()
        .rate(20.0)
        .capacity(20)
        .dispatch(dispatch)
        .build()?;

    let start = time::Instant::now();

    for n in 0..20 {
        limiter.submit(move || {
            thread::sleep(time::Duration::from_millis(200));
            println!("task {n} done after {:?}", start.elapsed());
        });
    }

    limiter.drain().await;

    println!("# {what}");
    println!("Drained in {:?}", start.elapsed());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    helpers::init_logging();

    grind("inline", Dispatch::Inline).await?;
    grind("detached", Dispatch::Detached).await?;
    Ok(())
}
