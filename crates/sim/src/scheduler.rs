use std::time::{Duration, Instant};

pub const PRIORITY_COUNT: usize = 5;

/// Dispatch class for scheduled events. Higher priorities drain first each
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Always = 4,
}

const EVENT_POOL_CAP: usize = 256;

#[derive(Debug)]
struct Event<P> {
    request_time: f64,
    target_time: f64,
    payload: Option<P>,
}

/// Bucketed priority queue of timed events. Buckets are kept ordered by
/// target time (earliest dispatched first); spent event shells return to a
/// free list. An optional wall-clock budget can cut a frame short, but only
/// at bucket boundaries so no class is starved from within.
pub struct Scheduler<P> {
    buckets: [Vec<Event<P>>; PRIORITY_COUNT],
    pool: Vec<Event<P>>,
    budget: Option<Duration>,
    frame_start: Instant,
    active_bucket: Option<usize>,
}

impl<P> Default for Scheduler<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Scheduler<P> {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Vec::new()),
            pool: Vec::new(),
            budget: None,
            frame_start: Instant::now(),
            active_bucket: None,
        }
    }

    pub fn with_budget(budget: Duration) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    pub fn schedule(&mut self, priority: Priority, now: f64, target_time: f64, payload: P) {
        let mut event = self.pool.pop().unwrap_or(Event {
            request_time: 0.0,
            target_time: 0.0,
            payload: None,
        });
        event.request_time = now;
        event.target_time = target_time;
        event.payload = Some(payload);

        // Stored descending so the earliest event pops from the back; ties
        // keep submission order.
        let bucket = &mut self.buckets[priority as usize];
        let position = bucket.partition_point(|e| e.target_time > target_time);
        bucket.insert(position, event);
    }

    /// Marks the start of a frame for the wall-clock budget.
    pub fn begin_frame(&mut self) {
        self.frame_start = Instant::now();
        self.active_bucket = None;
    }

    /// Pops the next due event, highest bucket first, earliest target time
    /// within a bucket. Returns the payload and the delay since the event
    /// was requested. `None` once nothing is due or the budget expired at a
    /// bucket boundary.
    pub fn pop_due(&mut self, now: f64) -> Option<(P, f64)> {
        for index in (0..PRIORITY_COUNT).rev() {
            let due = self.buckets[index]
                .last()
                .is_some_and(|e| e.target_time <= now);
            if !due {
                continue;
            }

            if self.active_bucket != Some(index) {
                if self.active_bucket.is_some() && self.over_budget() {
                    return None;
                }
                self.active_bucket = Some(index);
            }

            let mut event = self.buckets[index].pop().expect("due event");
            let payload = event.payload.take().expect("pooled event with payload");
            let time_delta = now - event.request_time;
            if self.pool.len() < EVENT_POOL_CAP {
                self.pool.push(event);
            }
            return Some((payload, time_delta));
        }
        None
    }

    fn over_budget(&self) -> bool {
        self.budget
            .is_some_and(|budget| self.frame_start.elapsed() >= budget)
    }
}
