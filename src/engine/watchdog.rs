//! Deadline watchdog
//!
//! One background thread per context, spawned the first time a call runs with
//! a timeout. It sleeps until the armed deadline and then raises a timeout
//! interrupt through the same path as `stop()`.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::interrupt::{InterruptState, Reason};

#[derive(Debug, Clone, Copy)]
struct Armed {
    call: u64,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    armed: Option<Armed>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// Handle to a context's watchdog thread; dropping it joins the thread
#[derive(Debug)]
pub(crate) struct Watchdog {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(context: u64, interrupts: Arc<InterruptState>) -> io::Result<Watchdog> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("jsgate-watchdog-{context}"))
            .spawn(move || worker.run(context, &interrupts))?;
        tracing::trace!(context, "watchdog started");
        Ok(Watchdog {
            shared,
            thread: Some(thread),
        })
    }

    /// Interrupt `call` once `deadline` passes
    pub fn arm(&self, call: u64, deadline: Instant) {
        let mut state = self.shared.state.lock();
        state.armed = Some(Armed { call, deadline });
        self.shared.wake.notify_one();
    }

    /// Cancel the deadline for `call`; a no-op if it already fired
    pub fn disarm(&self, call: u64) {
        let mut state = self.shared.state.lock();
        if state.armed.is_some_and(|armed| armed.call == call) {
            state.armed = None;
            self.shared.wake.notify_one();
        }
    }
}

impl Shared {
    fn run(&self, context: u64, interrupts: &InterruptState) {
        let mut state = self.state.lock();
        while !state.shutdown {
            let armed = state.armed;
            match armed {
                None => self.wake.wait(&mut state),
                Some(armed) if Instant::now() >= armed.deadline => {
                    state.armed = None;
                    if interrupts.request_for(armed.call, Reason::Timeout) {
                        tracing::debug!(context, call = armed.call, "deadline expired, interrupting");
                    }
                }
                Some(armed) => {
                    let _ = self.wake.wait_until(&mut state, armed.deadline);
                }
            }
        }
        tracing::trace!(context, "watchdog stopped");
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
