use quanta::Instant;

/// Millisecond clock for engine timestamps.
/// Wraps every ~49 days (u32::MAX ms); the engine compares with wrapping
/// arithmetic so the wrap is harmless.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the clock was created.
    pub fn now_ms(&self) -> u32 {
        let elapsed = self.epoch.elapsed();
        (elapsed.as_millis() as u64 & 0xFFFF_FFFF) as u32
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
