// Veera Core Engine — Streaming chat runtime
// Folds remote stream events into per-message state, paces their reveal
// for display, and settles each turn into the persisted session list.

pub mod types;
pub mod providers;
pub mod stream;
pub mod pacer;
pub mod chat;
pub mod sessions;
pub mod turn;
