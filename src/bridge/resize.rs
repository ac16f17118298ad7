//! Resize debouncing
//!
//! The first resize of a burst opens a fixed window; every resize inside it
//! replaces the pending size. When the window closes the last size is
//! applied once. The window does not slide.

use std::time::Duration;

use tokio::time::Instant;

use crate::ssh::PtySize;

/// Default debounce window
pub const DEFAULT_RESIZE_WINDOW: Duration = Duration::from_millis(30);

#[derive(Debug)]
pub struct ResizeCoalescer {
    window: Duration,
    pending: Option<PtySize>,
    deadline: Option<Instant>,
}

impl ResizeCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Record a resize request received at `now`.
    pub fn push(&mut self, size: PtySize, now: Instant) {
        self.pending = Some(size);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    /// When the pending resize becomes due, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take the pending size if its window has closed by `now`.
    pub fn take_due(&mut self, now: Instant) -> Option<PtySize> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }
}

impl Default for ResizeCoalescer {
    fn default() -> Self {
        Self::new(DEFAULT_RESIZE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_collapses_to_last() {
        let mut c = ResizeCoalescer::new(Duration::from_millis(30));
        let t0 = Instant::now();

        c.push(PtySize::new(80, 24), t0);
        c.push(PtySize::new(100, 30), t0 + Duration::from_millis(10));
        c.push(PtySize::new(120, 40), t0 + Duration::from_millis(25));

        assert_eq!(c.deadline(), Some(t0 + Duration::from_millis(30)));
        assert_eq!(c.take_due(t0 + Duration::from_millis(29)), None);
        assert_eq!(
            c.take_due(t0 + Duration::from_millis(30)),
            Some(PtySize::new(120, 40))
        );
        assert_eq!(c.take_due(t0 + Duration::from_millis(60)), None);
        assert_eq!(c.deadline(), None);
    }

    #[test]
    fn test_window_does_not_slide() {
        let mut c = ResizeCoalescer::new(Duration::from_millis(30));
        let t0 = Instant::now();

        c.push(PtySize::new(80, 24), t0);
        c.push(PtySize::new(90, 24), t0 + Duration::from_millis(29));
        assert_eq!(c.deadline(), Some(t0 + Duration::from_millis(30)));
    }

    #[test]
    fn test_next_burst_opens_new_window() {
        let mut c = ResizeCoalescer::new(Duration::from_millis(30));
        let t0 = Instant::now();

        c.push(PtySize::new(80, 24), t0);
        assert!(c.take_due(t0 + Duration::from_millis(30)).is_some());

        let t1 = t0 + Duration::from_millis(100);
        c.push(PtySize::new(132, 43), t1);
        assert_eq!(c.deadline(), Some(t1 + Duration::from_millis(30)));
    }
}
