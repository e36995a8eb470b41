// Veera Core Engine — Display Pacer
// Reveals the accumulator's target text at a fixed per-character cadence,
// decoupling display rate from bursty network arrival.
//
// Key properties:
//   - One character per tick, indexed by Unicode scalar value — a
//     multibyte character is never split.
//   - The visible text is always a prefix of the LATEST installed target;
//     installing a shorter or rewritten target clamps the prefix.
//   - Caught up + stream active → idle ticks (ready to resume instantly).
//     Caught up + finalized → the task stops itself.
//   - Reveal and replace events are sent under the state lock, so channel
//     order always equals the order they applied to the state.
//   - `stop()` is idempotent and checked before every step, so ticks that
//     were already queued at teardown mutate nothing.

use crate::engine::types::ChatEvent;
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

// ── Reveal state ───────────────────────────────────────────────────────────

/// Outcome of one pacer tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The next character was revealed.
    Reveal(String),
    /// Caught up but the stream is still active — nothing to do yet.
    Idle,
    /// Caught up and finalized — the task can stop.
    Done,
}

/// Shared reveal state: the current target text and how much of it is
/// visible. The turn driver installs snapshots; the pacer task steps.
/// Both sides hold it behind one mutex, so every install fully applies
/// before the next tick reads it and vice versa.
#[derive(Debug, Default)]
pub struct RevealState {
    target: String,
    /// Byte offset of the reveal cursor into `target`.
    /// Invariant: always on a char boundary.
    visible_bytes: usize,
    visible_chars: usize,
    finalized: bool,
}

impl RevealState {
    pub fn new() -> Self {
        RevealState::default()
    }

    /// Install a new target text (the latest snapshot, already cleaned).
    ///
    /// The visible prefix is clamped to `min(visible, target chars)`.
    /// Returns true when the already-visible prefix changed — shrunk, or
    /// rewritten by a target whose prefix differs — meaning the viewer
    /// needs a full replace rather than an append.
    pub fn install(&mut self, new_target: String) -> bool {
        let new_chars = new_target.chars().count();
        let clamped_chars = self.visible_chars.min(new_chars);
        let clamped_bytes = byte_offset_of_char(&new_target, clamped_chars);

        let prefix_changed = clamped_chars != self.visible_chars
            || new_target[..clamped_bytes] != self.target[..self.visible_bytes];

        self.target = new_target;
        self.visible_chars = clamped_chars;
        self.visible_bytes = clamped_bytes;
        prefix_changed
    }

    /// Mark that no further targets will be installed.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Reveal the next character, or report idle / done.
    pub fn step(&mut self) -> Step {
        if self.visible_bytes < self.target.len() {
            match self.target[self.visible_bytes..].chars().next() {
                Some(c) => {
                    self.visible_bytes += c.len_utf8();
                    self.visible_chars += 1;
                    Step::Reveal(c.to_string())
                }
                None => Step::Idle,
            }
        } else if self.finalized {
            Step::Done
        } else {
            Step::Idle
        }
    }

    /// The text revealed so far — always a prefix of the current target.
    pub fn visible_text(&self) -> &str {
        &self.target[..self.visible_bytes]
    }

    pub fn visible_chars(&self) -> usize {
        self.visible_chars
    }

    pub fn is_caught_up(&self) -> bool {
        self.visible_bytes == self.target.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Byte offset of the `n`-th character of `s` (or `s.len()` past the end).
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

// ── Stop signal ────────────────────────────────────────────────────────────

/// Signal that the pacer task should stop at its next tick.
/// Shared between the pacer handle, the turn driver, and the turn handle;
/// requesting twice is harmless.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Pacer task ─────────────────────────────────────────────────────────────

/// Handle to the spawned reveal task. Owns the one authoritative `stop()`;
/// dropping the handle does NOT stop the task (the driver joins it to let
/// buffered characters drain).
pub struct Pacer {
    handle: JoinHandle<()>,
    stop: StopSignal,
}

impl Pacer {
    /// Spawn the reveal loop: one tick per `interval`, one character per
    /// tick, emitted to the embedder as `ChatEvent::Reveal`. The task
    /// exits on its own once the state is finalized and fully revealed,
    /// or at the first tick after `stop()`.
    pub fn spawn(
        session_id: String,
        message_id: String,
        state: Arc<Mutex<RevealState>>,
        interval: Duration,
        events: UnboundedSender<ChatEvent>,
    ) -> Pacer {
        let stop = StopSignal::new();
        let task_stop = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if task_stop.is_requested() {
                    break;
                }
                // Send while the lock is held so channel order matches the
                // order reveals and replaces apply to the state.
                let done = {
                    let mut reveal = state.lock();
                    match reveal.step() {
                        Step::Reveal(chunk) => {
                            let _ = events.send(ChatEvent::Reveal {
                                session_id: session_id.clone(),
                                message_id: message_id.clone(),
                                text: chunk,
                            });
                            false
                        }
                        Step::Idle => false,
                        Step::Done => true,
                    }
                };
                if done {
                    break;
                }
            }
            debug!("[pacer] Reveal task for message {} stopped", message_id);
        });

        Pacer { handle, stop }
    }

    /// Request the task to stop at its next tick. Idempotent; safe to call
    /// from any terminal transition.
    pub fn stop(&self) {
        self.stop.request();
    }

    /// A clone of the stop signal, for teardown paths that outlive the
    /// handle (e.g. the turn handle's abort).
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Wait for the task to exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}
