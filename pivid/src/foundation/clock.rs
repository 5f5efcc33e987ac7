use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::foundation::lock;
use crate::foundation::time::{SteadyTime, WallTime};

/// Time and wakeup capability injected into every long-lived component.
///
/// Production code uses [`SystemClock`]; tests use [`FakeClock`], which only
/// moves when told to. All blocking in the playback core goes through a
/// [`Flag`] created against one of these, so a test clock can wake every
/// waiter when it advances.
pub trait Clock: Send + Sync {
    fn steady_time(&self) -> SteadyTime;

    fn wall_time(&self) -> WallTime;

    /// Block until `flag` latches or `deadline` passes.
    ///
    /// Returns true and consumes the latch if the flag was set; false on
    /// deadline. `None` waits indefinitely.
    fn wait(&self, flag: &FlagState, deadline: Option<SteadyTime>) -> bool;

    /// Called once for every flag created against this clock.
    fn attach(&self, _flag: &Arc<FlagState>) {}
}

/// Shared latch + condvar behind a [`Flag`].
pub struct FlagState {
    set: Mutex<bool>,
    cond: Condvar,
}

impl FlagState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// Wake waiters while holding the latch lock, so a waiter between its
    /// predicate check and its park cannot miss the notification.
    pub(crate) fn notify(&self) {
        let _guard = lock(&self.set);
        self.cond.notify_all();
    }
}

/// Edge-triggered, level-latched wakeup.
///
/// `set` before `wait` makes `wait` return immediately; every successful wait
/// consumes the latch. Cancellation is modeled as another thread calling
/// `set`; the flag itself never fails.
pub struct Flag {
    clock: Arc<dyn Clock>,
    state: Arc<FlagState>,
}

impl Flag {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let state = FlagState::new();
        clock.attach(&state);
        Self { clock, state }
    }

    pub fn set(&self) {
        {
            let mut set = lock(&self.state.set);
            *set = true;
        }
        self.state.notify();
    }

    /// Block until the flag is set, then consume the latch.
    pub fn wait(&self) {
        self.clock.wait(&self.state, None);
    }

    /// Block until the flag is set or `deadline` passes.
    ///
    /// Returns true iff the flag was set (latch consumed).
    pub fn wait_until(&self, deadline: SteadyTime) -> bool {
        self.clock.wait(&self.state, Some(deadline))
    }
}

impl Clone for Flag {
    fn clone(&self) -> Self {
        Self {
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
        }
    }
}

/// Sleep on a throwaway flag; wakes only at `deadline`.
pub fn sleep_until(clock: &Arc<dyn Clock>, deadline: SteadyTime) {
    Flag::new(Arc::clone(clock)).wait_until(deadline);
}

/// Production clock over `std::time`.
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: std::time::Instant::now(),
        })
    }
}

impl Clock for SystemClock {
    fn steady_time(&self) -> SteadyTime {
        SteadyTime::from_origin(self.origin.elapsed())
    }

    fn wall_time(&self) -> WallTime {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        WallTime(since_epoch.as_secs_f64())
    }

    fn wait(&self, flag: &FlagState, deadline: Option<SteadyTime>) -> bool {
        let mut set = lock(&flag.set);
        loop {
            if *set {
                *set = false;
                return true;
            }
            match deadline {
                None => {
                    set = flag
                        .cond
                        .wait(set)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                Some(d) => {
                    let now = self.steady_time();
                    if now >= d {
                        return false;
                    }
                    let (guard, _) = flag
                        .cond
                        .wait_timeout(set, d - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    set = guard;
                }
            }
        }
    }
}

/// Manually advanced clock for tests.
///
/// `advance` moves steady and wall time together and wakes every flag created
/// against this clock, so waiters re-check their deadlines against the new
/// time.
pub struct FakeClock {
    now: Mutex<SteadyTime>,
    wall_base: f64,
    flags: Mutex<Vec<Weak<FlagState>>>,
}

impl FakeClock {
    pub fn new() -> Arc<Self> {
        Self::starting_at(SteadyTime::from_origin(Duration::from_secs(1_000)))
    }

    pub fn starting_at(now: SteadyTime) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
            wall_base: 1_700_000_000.0,
            flags: Mutex::new(Vec::new()),
        })
    }

    pub fn advance(&self, by: Duration) {
        {
            let mut now = lock(&self.now);
            *now += by;
        }
        let mut flags = lock(&self.flags);
        flags.retain(|weak| match weak.upgrade() {
            Some(state) => {
                state.notify();
                true
            }
            None => false,
        });
    }
}

impl Clock for FakeClock {
    fn steady_time(&self) -> SteadyTime {
        *lock(&self.now)
    }

    fn wall_time(&self) -> WallTime {
        WallTime(self.wall_base + self.steady_time().since_origin().as_secs_f64())
    }

    fn attach(&self, flag: &Arc<FlagState>) {
        lock(&self.flags).push(Arc::downgrade(flag));
    }

    fn wait(&self, flag: &FlagState, deadline: Option<SteadyTime>) -> bool {
        let mut set = lock(&flag.set);
        loop {
            if *set {
                *set = false;
                return true;
            }
            if let Some(d) = deadline {
                if self.steady_time() >= d {
                    return false;
                }
            }
            set = flag
                .cond
                .wait(set)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}
