use std::time::Duration;

use crossterm::event::{self, Event as CrosstermEvent};
use stagewatch_core::types::SessionEvent;
use tokio::sync::broadcast;

/// Events that drive the TUI loop.
pub enum TuiEvent {
    /// A crossterm key event.
    Key(crossterm::event::KeyEvent),
    Resize(u16, u16),
    /// A session event from the EventBus.
    Session(SessionEvent),
    /// Tick timer for spinners.
    Tick,
}

/// Merged event loop: crossterm + EventBus + tick timer.
pub struct EventLoop {
    session_rx: broadcast::Receiver<SessionEvent>,
    tick_interval: Duration,
}

impl EventLoop {
    pub fn new(session_rx: broadcast::Receiver<SessionEvent>, tick_interval: Duration) -> Self {
        Self {
            session_rx,
            tick_interval,
        }
    }

    /// Wait for the next event from any source. `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<TuiEvent> {
        let tick_sleep = tokio::time::sleep(self.tick_interval);

        // Poll crossterm in a blocking thread
        let crossterm_poll = tokio::task::spawn_blocking(|| {
            if event::poll(Duration::from_millis(50)).unwrap_or(false) {
                event::read().ok()
            } else {
                None
            }
        });

        tokio::select! {
            result = self.session_rx.recv() => {
                match result {
                    Ok(evt) => Some(TuiEvent::Session(evt)),
                    // States are full replacements; the next one catches us up
                    Err(broadcast::error::RecvError::Lagged(_)) => Some(TuiEvent::Tick),
                    Err(_) => None,
                }
            }
            result = crossterm_poll => {
                match result {
                    Ok(Some(CrosstermEvent::Key(key))) => Some(TuiEvent::Key(key)),
                    Ok(Some(CrosstermEvent::Resize(w, h))) => Some(TuiEvent::Resize(w, h)),
                    _ => Some(TuiEvent::Tick),
                }
            }
            _ = tick_sleep => {
                Some(TuiEvent::Tick)
            }
        }
    }
}
