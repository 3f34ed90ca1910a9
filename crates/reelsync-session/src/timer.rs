//! One-shot and repeating timers on the local task set.
//!
//! A timer owns at most one local task. Restarting only moves the deadline,
//! so resetting a heartbeat on every received frame costs no task churn.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    OneShot,
    Repeating,
}

type Callback = Rc<dyn Fn()>;

struct TimerInner {
    period: Duration,
    mode: Mode,
    deadline: Cell<Instant>,
    callback: RefCell<Option<Callback>>,
    task: RefCell<Option<JoinHandle<()>>>,
}

/// Must be used from within a `tokio::task::LocalSet`.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    pub fn one_shot(period: Duration) -> Self {
        Self::with_mode(period, Mode::OneShot)
    }

    pub fn repeating(period: Duration) -> Self {
        Self::with_mode(period, Mode::Repeating)
    }

    fn with_mode(period: Duration, mode: Mode) -> Self {
        Self {
            inner: Rc::new(TimerInner {
                period,
                mode,
                deadline: Cell::new(Instant::now()),
                callback: RefCell::new(None),
                task: RefCell::new(None),
            }),
        }
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Arm the timer with a new callback, replacing any pending one.
    pub fn start(&self, callback: impl Fn() + 'static) {
        self.stop();
        self.inner.callback.replace(Some(Rc::new(callback)));
        self.restart();
    }

    /// Push the deadline one period into the future, re-arming if idle.
    pub fn restart(&self) {
        if self.inner.callback.borrow().is_none() {
            return;
        }
        self.inner.deadline.set(Instant::now() + self.inner.period);
        if self.is_active() {
            return;
        }
        let task = tokio::task::spawn_local(run(Rc::downgrade(&self.inner)));
        self.inner.task.replace(Some(task));
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.task.borrow_mut().take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.task.borrow().is_some()
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn run(timer: Weak<TimerInner>) {
    loop {
        let deadline = match timer.upgrade() {
            Some(inner) => inner.deadline.get(),
            None => return,
        };
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = timer.upgrade() else { return };
        if Instant::now() < inner.deadline.get() {
            continue;
        }
        let callback = inner.callback.borrow().clone();
        let one_shot = inner.mode == Mode::OneShot;
        if one_shot {
            // Dropping the handle detaches this task; it ends right below.
            inner.task.replace(None);
        } else {
            inner.deadline.set(Instant::now() + inner.period);
        }
        drop(inner);

        if let Some(callback) = callback {
            callback();
        }
        if one_shot {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    fn counter() -> (Rc<Cell<u32>>, impl Fn() + 'static) {
        let count = Rc::new(Cell::new(0));
        let handle = count.clone();
        (count, move || handle.set(handle.get() + 1))
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        LocalSet::new()
            .run_until(async {
                let timer = Timer::one_shot(Duration::from_secs(10));
                let (count, tick) = counter();
                timer.start(tick);
                tokio::time::sleep(Duration::from_secs(9)).await;
                assert_eq!(count.get(), 0);
                tokio::time::sleep(Duration::from_secs(30)).await;
                assert_eq!(count.get(), 1);
                assert!(!timer.is_active());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_defers_expiry() {
        LocalSet::new()
            .run_until(async {
                let timer = Timer::one_shot(Duration::from_secs(10));
                let (count, tick) = counter();
                timer.start(tick);
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_secs(6)).await;
                    timer.restart();
                }
                assert_eq!(count.get(), 0);
                tokio::time::sleep(Duration::from_secs(11)).await;
                assert_eq!(count.get(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_until_stopped() {
        LocalSet::new()
            .run_until(async {
                let timer = Timer::repeating(Duration::from_secs(1));
                let (count, tick) = counter();
                timer.start(tick);
                tokio::time::sleep(Duration::from_millis(3500)).await;
                assert_eq!(count.get(), 3);
                timer.stop();
                tokio::time::sleep(Duration::from_secs(5)).await;
                assert_eq!(count.get(), 3);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_can_rearm_from_its_callback() {
        LocalSet::new()
            .run_until(async {
                let timer = Timer::one_shot(Duration::from_secs(1));
                let count = Rc::new(Cell::new(0));
                let handle = count.clone();
                let rearm = timer.clone();
                timer.start(move || {
                    handle.set(handle.get() + 1);
                    if handle.get() < 3 {
                        rearm.restart();
                    }
                });
                tokio::time::sleep(Duration::from_secs(10)).await;
                assert_eq!(count.get(), 3);
            })
            .await;
    }
}
