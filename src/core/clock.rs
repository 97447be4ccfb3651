use chrono::{DateTime, Utc};

/// Time source injected into every component that stamps or compares times.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a settable instant. Used by tests that assert exact timestamps.
#[cfg(test)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn at(rfc3339: &str) -> Self {
        let now = DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid rfc3339 timestamp")
            .with_timezone(&Utc);
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, rfc3339: &str) {
        let now = DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid rfc3339 timestamp")
            .with_timezone(&Utc);
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
