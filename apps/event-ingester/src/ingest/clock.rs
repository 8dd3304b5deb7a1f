use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Hands out `ts_server` instants that never go backwards within the process,
/// even if the wall clock is stepped back.
#[derive(Debug)]
pub struct ServerClock {
    last: Mutex<DateTime<Utc>>,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    fn observe(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = wall.max(*last);
        *last = next;
        next
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}
