//! Events and progress reporting
//!
//! Two channels leave a run:
//!
//! 1. **Progress** (`progress.rs`): per-run `watch` channel of
//!    [`ProgressView`] snapshots. Latest-value semantics; closes after the
//!    terminal snapshot.
//!
//! 2. **Event bus** (`bus.rs`): process-wide broadcast of [`RunEvent`]s
//!    for logging and external observers. Lossy under lag.
//!
//! ```text
//! ┌──────────────┐  snapshot  ┌──────────────┐     ┌──────────────┐
//! │ RunStateMach │───────────▶│ watch (run)  │────▶│ subscribers  │
//! │   (commit)   │            └──────────────┘     └──────────────┘
//! │              │   event    ┌──────────────┐     ┌──────────────┐
//! │              │───────────▶│  broadcast   │────▶│  listeners   │
//! └──────────────┘            └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod progress;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use progress::{ProgressPublisher, ProgressSubscription, ProgressView};
pub use types::RunEvent;
