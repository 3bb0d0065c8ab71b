use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::OnceLock;

use tokio::time::{interval, Instant, Duration};
use crate::sluicedb::config::COARSE_CLOCK_GRANULARITY_SECONDS;

static COARSE_CLOCK: AtomicU32 = AtomicU32::new(0);
static START: OnceLock<Instant> = OnceLock::new();

/// Seconds since the clock updater started. Cheap enough to call on every packet.
pub fn coarse_monotonic_now() -> u32 {
    COARSE_CLOCK.load(Relaxed)
}

fn update_coarse_monotonic_clock() {
    let start = START.get_or_init(Instant::now);
    let now = start.elapsed().as_secs() as u32;
    COARSE_CLOCK.store(now, Relaxed);
}

pub async fn coarse_monotonic_clock_updater() {
    let mut interval = interval(Duration::from_secs(COARSE_CLOCK_GRANULARITY_SECONDS));
    loop {
        interval.tick().await;
        update_coarse_monotonic_clock();
    }
}
