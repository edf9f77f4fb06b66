//! Outbound priority scheduling.
//!
//! `PriorityWriterQueue` serves byte chunks across N priority lanes with a
//! weighted round-robin: a weight distribution `[D0, D1, ..]` (D0 >= D1 >= 1)
//! bounds how many consecutive frames each lane may emit before the scheduler
//! advances. `PriorityTracker` is the bare rotation without queues, reused by
//! the delivery layer to pick which priority stream sends next.

use crate::frame;
use std::collections::VecDeque;

/// Doubling weight distribution for `n` priorities, highest first.
/// `exponential_weights(3)` is `[4, 2, 1]`.
pub fn exponential_weights(n: usize) -> Vec<usize> {
    debug_assert!(n >= 1 && n <= 16);
    (0..n).rev().map(|i| 1usize << i).collect()
}

struct Lane {
    q: VecDeque<Vec<u8>>,
    counter: usize,
}

pub struct PriorityWriterQueue {
    lanes: Vec<Lane>,
    weights: Vec<usize>,
    current: usize,
    // Pending payload bytes still sitting in the lanes (staged frame excluded).
    remain: u64,
    // Frame currently being sent, header included. Survives partial writes.
    staged: Vec<u8>,
}

impl PriorityWriterQueue {
    pub fn new(weights: &[usize]) -> PriorityWriterQueue {
        assert!(!weights.is_empty() && weights.len() <= 16);
        assert!(weights.iter().all(|&w| w >= 1));

        let lanes = weights
            .iter()
            .map(|&w| Lane {
                q: VecDeque::new(),
                counter: w,
            })
            .collect();

        PriorityWriterQueue {
            lanes,
            weights: weights.to_vec(),
            current: 0,
            remain: 0,
            staged: Vec::new(),
        }
    }

    #[inline]
    pub fn priority_count(&self) -> usize {
        self.lanes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remain == 0 && self.staged.is_empty()
    }

    /// Payload bytes waiting in the lanes, the staged remnant excluded.
    #[inline]
    pub fn remain_bytes(&self) -> u64 {
        self.remain
    }

    pub fn enqueue(&mut self, priority: usize, data: Vec<u8>) {
        debug_assert!(priority < self.lanes.len());

        if data.is_empty() {
            return;
        }

        self.remain += data.len() as u64;
        self.lanes[priority].q.push_back(data);
    }

    fn reset_phase(&mut self) {
        for (lane, &weight) in self.lanes.iter_mut().zip(&self.weights) {
            lane.counter = weight;
        }

        self.current = 0;
        self.staged.clear();
    }

    /// Moves `current` to the lane allowed to emit the next frame.
    /// Only called when the queue holds data.
    fn acquire_priority(&mut self) {
        debug_assert!(!self.is_empty());

        let n = self.lanes.len();
        let lane = &self.lanes[self.current];

        // The current lane continues its phase while it has both data and
        // remaining frame budget.
        if !lane.q.is_empty() && lane.counter > 0 {
            return;
        }

        for offset in 1..=n {
            let index = (self.current + offset) % n;
            let lane = &self.lanes[index];

            if !lane.q.is_empty() && lane.counter > 0 {
                self.current = index;
                return;
            }
        }

        // Data remains but every lane holding data exhausted its budget:
        // start a new phase.
        for (lane, &weight) in self.lanes.iter_mut().zip(&self.weights) {
            lane.counter = weight;
        }

        for index in 0..n {
            if !self.lanes[index].q.is_empty() {
                self.current = index;
                return;
            }
        }

        unreachable!("writer queue advertised pending data with all lanes empty");
    }

    /// Stages (or re-yields) the next outbound frame of at most `frame_size`
    /// bytes (header included) and appends it to `out`. Returns false when
    /// there is nothing to send.
    pub fn acquire_frame(&mut self, frame_size: usize, out: &mut Vec<u8>) -> bool {
        debug_assert!(frame_size > frame::HEADER_SIZE);

        if !self.staged.is_empty() {
            out.extend_from_slice(&self.staged);
            return true;
        }

        if self.is_empty() {
            return false;
        }

        self.acquire_priority();

        let current = self.current;
        let take;
        {
            let lane = &mut self.lanes[current];
            let head = lane.q.front_mut().expect("non-empty lane without head");

            take = head.len().min(frame_size - frame::HEADER_SIZE);
            frame::pack(current, &head[..take], &mut self.staged);
            head.drain(..take);

            if head.is_empty() {
                lane.q.pop_front();
            }
        }

        debug_assert!(self.remain >= take as u64);
        self.remain -= take as u64;

        out.extend_from_slice(&self.staged);
        true
    }

    /// Drops `n` sent bytes off the staged frame. Once the staged frame is
    /// fully gone the current lane spent one unit of its frame budget.
    pub fn shift(&mut self, n: usize) {
        debug_assert!(n > 0 && n <= self.staged.len());

        self.staged.drain(..n);

        if self.staged.is_empty() {
            let lane = &mut self.lanes[self.current];
            lane.counter = lane.counter.saturating_sub(1);

            if self.is_empty() {
                self.reset_phase();
            }
        }
    }
}

/// Weighted rotation over priority indices without queues attached.
pub struct PriorityTracker {
    weights: Vec<usize>,
    current: usize,
    counter: usize,
}

impl PriorityTracker {
    pub fn new(weights: &[usize]) -> PriorityTracker {
        assert!(!weights.is_empty());
        assert!(weights.iter().all(|&w| w >= 1));

        PriorityTracker {
            weights: weights.to_vec(),
            current: 0,
            counter: 0,
        }
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Advances within the current priority's budget, rolling over to the
    /// next priority once the budget is spent.
    pub fn next(&mut self) -> usize {
        if self.counter == self.weights[self.current] {
            self.counter = 0;
            self.current += 1;
        }

        if self.current == self.weights.len() {
            self.current = 0;
        }

        self.counter += 1;
        self.current
    }

    /// Jumps straight to the next priority, abandoning the rest of the
    /// current budget.
    pub fn skip(&mut self) -> usize {
        self.counter = 0;
        self.current += 1;

        if self.current >= self.weights.len() {
            self.current = 0;
        }

        self.current
    }

    pub fn reset(&mut self) {
        self.current = 0;
        self.counter = 0;
    }
}
