use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;

/// Status carried by `START_RES` / `STOP_RES`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Success,
    Forbidden,
    NotFound,
}

impl ResponseType {
    pub fn code(self) -> u16 {
        match self {
            ResponseType::Success => 200,
            ResponseType::Forbidden => 403,
            ResponseType::NotFound => 404,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            ResponseType::Success => "Success",
            ResponseType::Forbidden => "Resource full",
            ResponseType::NotFound => "Not found",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(ResponseType::Success),
            403 => Some(ResponseType::Forbidden),
            404 => Some(ResponseType::NotFound),
            _ => None,
        }
    }
}

/// Message sequence numbers handed out by one sender process.
///
/// Created once at startup and shared; the only way to read it is to take the next number.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU32);

impl SequenceCounter {
    pub fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    /// Returns the current number and advances the counter (wrapping at `u32::MAX`).
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Wall-clock timestamp used in message headers, in milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn response_codes() {
        for response_type in [ResponseType::Success, ResponseType::Forbidden, ResponseType::NotFound] {
            assert_eq!(ResponseType::from_code(response_type.code()), Some(response_type));
        }
        assert_eq!(ResponseType::from_code(500), None);
        assert_eq!(ResponseType::Forbidden.reason(), "Resource full");
    }

    #[test]
    fn sequence_numbers_are_unique_across_threads() {
        let counter = Arc::new(SequenceCounter::new(10));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..250).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (10..1010).collect::<Vec<_>>());
        assert_eq!(counter.next(), 1010);
    }
}
