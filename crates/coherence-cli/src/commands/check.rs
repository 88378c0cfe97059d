use std::time::Instant;

use coherence_core::CoherenceConfig;

use super::Context;

pub fn check(config: &CoherenceConfig) -> anyhow::Result<()> {
    let ctx = Context::open(config)?;

    let started = Instant::now();
    {
        let mut conn = ctx.pool.read_connection(&ctx.key)?;
        conn.query("SELECT 1", &[])?;
    }
    let healthy = ctx.pool.health_check_idle() == 0;
    let stats = ctx.pool.stats(&ctx.key);

    println!("database:   {}", ctx.key);
    println!(
        "probe:      {} ({} ms)",
        if healthy { "ok" } else { "failed" },
        started.elapsed().as_millis()
    );
    println!(
        "pool:       {} active, {} idle, {} waits (max {})",
        stats.active,
        stats.idle,
        stats.wait_count,
        ctx.pool.config().max_size
    );
    ctx.pool.log_stats();

    ctx.finish();
    if !healthy {
        anyhow::bail!("idle connection failed its liveness probe");
    }
    Ok(())
}
