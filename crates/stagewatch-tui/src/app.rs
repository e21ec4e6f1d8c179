use std::collections::VecDeque;
use std::sync::Arc;

use ratatui::backend::Backend;
use ratatui::Terminal;

use stagewatch_core::config::TuiConfig;
use stagewatch_core::types::{GraphState, Node, SessionEvent, SessionId};

use crate::event::{EventLoop, TuiEvent};
use crate::input::{self, InputAction};
use crate::ui;

const MAX_LOG_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
}

/// One line of the session log panel.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: LogLevel,
    pub text: String,
}

/// Application state.
pub struct App {
    pub title: String,
    pub session_id: SessionId,
    pub config: TuiConfig,
    /// Latest published state; `None` until the layout loads.
    pub state: Option<Arc<GraphState>>,
    /// Last layout failure and its attempt number.
    pub layout_error: Option<(String, u32)>,
    pub connected: bool,
    pub closed: bool,
    pub selected: usize,
    pub show_log: bool,
    pub log: VecDeque<LogLine>,
    pub tick_count: usize,
}

impl App {
    pub fn new(
        title: impl Into<String>,
        session_id: SessionId,
        config: TuiConfig,
        initial: Option<Arc<GraphState>>,
    ) -> Self {
        Self {
            title: title.into(),
            session_id,
            config,
            state: initial,
            layout_error: None,
            connected: true,
            closed: false,
            selected: 0,
            show_log: true,
            log: VecDeque::new(),
            tick_count: 0,
        }
    }

    fn push_log(&mut self, level: LogLevel, text: impl Into<String>) {
        if self.log.len() == MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(LogLine {
            level,
            text: text.into(),
        });
    }

    /// Handle a session event.
    pub fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => {
                // The initial snapshot may be newer than states still queued on the bus
                if let Some(current) = &self.state {
                    if state.generation < current.generation {
                        return;
                    }
                }
                if self.selected >= state.nodes.len() {
                    self.selected = 0;
                }
                self.state = Some(state);
            }
            SessionEvent::LayoutUnavailable { reason, attempt } => {
                self.push_log(
                    LogLevel::Warn,
                    format!("layout unavailable (attempt {}): {}", attempt, reason),
                );
                self.layout_error = Some((reason, attempt));
            }
            SessionEvent::LayoutLoaded { nodes, edges } => {
                self.layout_error = None;
                self.push_log(
                    LogLevel::Info,
                    format!("layout loaded: {} nodes, {} edges", nodes, edges),
                );
            }
            SessionEvent::EventRejected { reason } => {
                self.push_log(LogLevel::Warn, format!("rejected event: {}", reason));
            }
            SessionEvent::TransportDisconnected { reason } => {
                self.connected = false;
                self.push_log(LogLevel::Warn, format!("disconnected: {}", reason));
            }
            SessionEvent::Reconnected => {
                self.connected = true;
                self.push_log(LogLevel::Info, "reconnected");
            }
            SessionEvent::ResyncCompleted { applied, skipped } => {
                self.push_log(
                    LogLevel::Info,
                    format!("resync: {} applied, {} skipped", applied, skipped),
                );
            }
            SessionEvent::VisibilityGap { reason } => {
                self.push_log(LogLevel::Warn, format!("visibility gap: {}", reason));
            }
            SessionEvent::Closed => {
                self.closed = true;
                self.push_log(LogLevel::Info, "session closed");
            }
        }
    }

    pub fn handle_action(&mut self, action: InputAction) {
        let count = self.state.as_ref().map(|s| s.nodes.len()).unwrap_or(0);
        match action {
            InputAction::SelectNext if count > 0 => {
                self.selected = (self.selected + 1) % count;
            }
            InputAction::SelectPrev if count > 0 => {
                self.selected = (self.selected + count - 1) % count;
            }
            InputAction::ToggleLog => self.show_log = !self.show_log,
            _ => {}
        }
    }

    pub fn selected_node(&self) -> Option<&Node> {
        self.state.as_ref().and_then(|s| s.nodes.get(self.selected))
    }
}

/// Main app loop.
pub async fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    mut app: App,
    mut events: EventLoop,
) -> anyhow::Result<()> {
    loop {
        terminal.draw(|f| ui::draw(f, &app))?;

        let Some(event) = events.next().await else {
            break;
        };
        match event {
            TuiEvent::Key(key) => match input::handle_key(key) {
                InputAction::Quit => break,
                action => app.handle_action(action),
            },
            TuiEvent::Session(event) => app.handle_session_event(event),
            TuiEvent::Tick => {
                app.tick_count = app.tick_count.wrapping_add(1);
            }
            TuiEvent::Resize(_, _) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagewatch_core::types::Graph;
    use stagewatch_engine::GraphStateStore;

    fn app() -> App {
        App::new("test", SessionId::new(), TuiConfig::default(), None)
    }

    #[test]
    fn layout_error_cleared_on_load() {
        let mut app = app();
        app.handle_session_event(SessionEvent::LayoutUnavailable {
            reason: "HTTP 503".into(),
            attempt: 2,
        });
        assert_eq!(app.layout_error, Some(("HTTP 503".to_string(), 2)));

        app.handle_session_event(SessionEvent::LayoutLoaded { nodes: 5, edges: 4 });
        assert!(app.layout_error.is_none());
        assert_eq!(app.log.len(), 2);
    }

    #[test]
    fn older_generation_never_replaces_newer() {
        let store = GraphStateStore::new();
        let first = store.initialize(Graph::agent_pipeline()).unwrap();
        store.apply_status("plan", stagewatch_core::types::Status::Running).unwrap();
        let second = store.current_state().unwrap();

        let mut app = app();
        app.handle_session_event(SessionEvent::StateChanged(second.clone()));
        app.handle_session_event(SessionEvent::StateChanged(first));
        assert_eq!(app.state.as_ref().unwrap().generation, second.generation);
    }

    #[test]
    fn selection_wraps() {
        let store = GraphStateStore::new();
        let state = store.initialize(Graph::agent_pipeline()).unwrap();
        let mut app = app();
        app.handle_session_event(SessionEvent::StateChanged(state));

        app.handle_action(InputAction::SelectPrev);
        assert_eq!(app.selected_node().unwrap().id, "respond");
        app.handle_action(InputAction::SelectNext);
        assert_eq!(app.selected_node().unwrap().id, "plan");
    }

    #[test]
    fn disconnect_and_reconnect_tracked() {
        let mut app = app();
        app.handle_session_event(SessionEvent::TransportDisconnected {
            reason: "reset".into(),
        });
        assert!(!app.connected);
        app.handle_session_event(SessionEvent::Reconnected);
        assert!(app.connected);
    }

    #[test]
    fn log_is_bounded() {
        let mut app = app();
        for i in 0..(MAX_LOG_LINES + 10) {
            app.handle_session_event(SessionEvent::EventRejected {
                reason: format!("bad {}", i),
            });
        }
        assert_eq!(app.log.len(), MAX_LOG_LINES);
        assert!(app.log.back().unwrap().text.ends_with(&format!("{}", MAX_LOG_LINES + 9)));
    }
}
