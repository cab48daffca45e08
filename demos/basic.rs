//! Walks a pool through the life of a few connections: small per event
//! objects, a large buffer, and the recycling of a block once every object in
//! it was released. Run with `RUST_LOG=debug` to see the pool's own events.

use mempool::{Pool, PoolConfig, Release};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut pool = Pool::new(PoolConfig::new(4096).growth_step(4096).traced(true))?;
    println!("threshold: {} bytes", pool.threshold());

    let mut events = Vec::new();
    for fd in 0..200u32 {
        let event = pool.calloc(48)?;
        pool.bytes_mut(&event)[..4].copy_from_slice(&fd.to_ne_bytes());
        events.push(event);
    }
    println!("after 200 events: {:?}", pool.stats());

    let buffer = pool.alloc(64 * 1024)?;
    println!("large buffer of {} bytes, large: {}", buffer.len(), buffer.is_large());

    // Connections close, their events go away in bulk.
    for event in events.drain(..150) {
        assert_eq!(pool.free(event), Release::ReclaimDeferred);
    }
    assert_eq!(pool.free(buffer), Release::ReclaimedImmediately);

    for _ in 0..200 {
        events.push(pool.alloc(48)?);
    }
    println!("after churn: {:?}", pool.stats());

    pool.destroy();
    Ok(())
}
