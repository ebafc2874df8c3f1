//! Process-wide SIGINT/SIGTERM coordination.
//!
//! Ground truth: `examples/original_source/src/SignalHandler.{h,cpp}`. The
//! anonymous-namespace `GlobalSignalHandler` singleton becomes a `OnceLock`-backed
//! static; the raw `sigaction` installation becomes `signal_hook`'s background
//! signal-iterator thread (`signal-hook` is already in the teacher's sibling pack,
//! see `examples/wandb-wandb/nvidia_gpu_stats/Cargo.toml`), which hands signals to
//! us on an ordinary thread instead of inside a signal handler, making it safe to
//! take locks and run arbitrary callbacks in `notify`.
//!
//! `notify` walks the handler stack from top to bottom (innermost-scope first),
//! invoking every handler — not just the top one. A separate, slightly different
//! inline duplicate of this class lives in the original's `main.cpp` and only
//! notifies the single innermost handler; this module follows the documented
//! contract (every handler) rather than that duplicate.

use std::sync::{Arc, Condvar, Mutex, OnceLock};

use log::error;

type Callback = Box<dyn Fn(i32) + Send + Sync>;

struct Handler {
    id: u64,
    callback: Callback,
}

struct State {
    interrupted: bool,
    stack: Vec<Handler>,
    next_id: u64,
    installed: bool,
}

struct GlobalCoordinator {
    state: Mutex<State>,
    cond: Condvar,
}

impl GlobalCoordinator {
    fn new() -> Self {
        GlobalCoordinator {
            state: Mutex::new(State {
                interrupted: false,
                stack: Vec::new(),
                next_id: 0,
                installed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn try_install(&'static self) {
        let mut state = self.state.lock().expect("signal mutex poisoned");
        if state.installed {
            return;
        }
        state.installed = true;
        drop(state);

        match signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM]) {
            Ok(mut signals) => {
                std::thread::Builder::new()
                    .name("signal-dispatch".to_string())
                    .spawn(move || {
                        for signal_value in signals.forever() {
                            self.notify(signal_value);
                        }
                    })
                    .expect("failed to spawn signal dispatch thread");
            }
            Err(e) => {
                error!("failed to install global signal handler: {e}");
            }
        }
    }

    fn push(&'static self, callback: Callback) -> u64 {
        self.try_install();
        let mut state = self.state.lock().expect("signal mutex poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.stack.push(Handler { id, callback });
        id
    }

    fn pop(&self, id: u64) {
        let mut state = self.state.lock().expect("signal mutex poisoned");
        if let Some(pos) = state.stack.iter().position(|h| h.id == id) {
            state.stack.remove(pos);
        }
    }

    fn notify(&self, signal_value: i32) {
        let mut state = self.state.lock().expect("signal mutex poisoned");
        state.interrupted = true;
        for handler in state.stack.iter().rev() {
            (handler.callback)(signal_value);
        }
        drop(state);
        self.cond.notify_all();
    }

    fn interrupted(&self) -> bool {
        self.state.lock().expect("signal mutex poisoned").interrupted
    }

    fn wait(&self) {
        let state = self.state.lock().expect("signal mutex poisoned");
        if !state.interrupted {
            drop(self.cond.wait(state).expect("signal mutex poisoned"));
        }
    }
}

static COORDINATOR: OnceLock<GlobalCoordinator> = OnceLock::new();

fn coordinator() -> &'static GlobalCoordinator {
    COORDINATOR.get_or_init(GlobalCoordinator::new)
}

/// Returns whether SIGINT or SIGTERM has ever been received by this process.
/// Sticky: once true, stays true for the lifetime of the process.
pub fn interrupted() -> bool {
    coordinator().interrupted()
}

/// Blocks the calling thread until a signal is (or has already been) received.
pub fn wait_for_signal() {
    coordinator().wait();
}

/// A scoped entry in the signal-handler stack: pushed at construction, popped at
/// drop, so scoping follows normal Rust lifetime rules instead of explicit
/// push/pop pairing.
pub struct ScopedSignalHandler {
    id: u64,
}

impl ScopedSignalHandler {
    /// `callback` runs on the signal-dispatch thread whenever SIGINT/SIGTERM
    /// arrives while this guard is alive, innermost guards first.
    pub fn new<F>(callback: F) -> Arc<ScopedSignalHandler>
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        let id = coordinator().push(Box::new(callback));
        Arc::new(ScopedSignalHandler { id })
    }

    pub fn wait(&self) {
        wait_for_signal();
    }

    pub fn interrupted(&self) -> bool {
        interrupted()
    }
}

impl Drop for ScopedSignalHandler {
    fn drop(&mut self) {
        coordinator().pop(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // These tests share one process-wide signal coordinator, so they drive it by
    // calling `notify` directly through a raised signal rather than relying on
    // real delivery ordering across tests.

    #[test]
    fn scoped_handlers_notify_innermost_first() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        let outer = ScopedSignalHandler::new(move |_| order_a.lock().unwrap().push("outer"));
        let order_b = order.clone();
        let inner = ScopedSignalHandler::new(move |_| order_b.lock().unwrap().push("inner"));

        coordinator().notify(signal_hook::consts::SIGINT);

        assert_eq!(*order.lock().unwrap(), vec!["inner", "outer"]);
        drop(inner);
        drop(outer);
    }

    #[test]
    fn interrupted_flag_is_sticky() {
        let count_before = AtomicUsize::new(0);
        let _guard = ScopedSignalHandler::new(move |_| {
            count_before.fetch_add(1, Ordering::SeqCst);
        });
        coordinator().notify(signal_hook::consts::SIGTERM);
        assert!(interrupted());
        assert!(interrupted());
    }

    #[test]
    fn popped_handler_is_not_notified() {
        let was_called = Arc::new(Mutex::new(false));
        let flag = was_called.clone();
        let guard = ScopedSignalHandler::new(move |_| *flag.lock().unwrap() = true);
        drop(guard);

        coordinator().notify(signal_hook::consts::SIGINT);
        assert!(!*was_called.lock().unwrap());
    }
}
