use std::collections::BTreeMap;
use std::time::Duration;

/// Identifies a kind of scheduled work. At most one task per id is live at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerId {
    ListenStreamConnectionBackoff,
    WriteStreamConnectionBackoff,
    ListenStreamIdle,
    WriteStreamIdle,
    OnlineStateTimeout,
    /// Gives up on a limbo resolution for the given target.
    LimboResolution(i32),
    GarbageCollection,
}

/// Work to run after `delay`. The owner hands it back to the engine when it fires; a
/// task whose generation has been superseded or cancelled is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DelayedTask {
    pub timer_id: TimerId,
    pub generation: u64,
    pub delay: Duration,
}

/// Tracks the live generation of each timer and collects newly scheduled tasks.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    live: BTreeMap<TimerId, u64>,
    next_generation: u64,
    scheduled: Vec<DelayedTask>,
}

impl TimerRegistry {
    /// Schedules `timer_id`, replacing any pending task with the same id.
    pub fn schedule(&mut self, timer_id: TimerId, delay: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(timer_id, generation);
        self.scheduled.push(DelayedTask {
            timer_id,
            generation,
            delay,
        });
    }

    pub fn cancel(&mut self, timer_id: TimerId) {
        self.live.remove(&timer_id);
    }

    pub fn is_scheduled(&self, timer_id: TimerId) -> bool {
        self.live.contains_key(&timer_id)
    }

    /// Consumes a fired task; returns false if it was cancelled or rescheduled since.
    pub fn fire(&mut self, task: &DelayedTask) -> bool {
        match self.live.get(&task.timer_id) {
            Some(generation) if *generation == task.generation => {
                self.live.remove(&task.timer_id);
                true
            }
            _ => false,
        }
    }

    /// Tasks scheduled since the last call, for the runtime to sleep on.
    pub fn drain_scheduled(&mut self) -> Vec<DelayedTask> {
        std::mem::take(&mut self.scheduled)
    }

    pub fn cancel_all(&mut self) {
        self.live.clear();
        self.scheduled.clear();
    }
}
