mod app;
mod event;
mod input;
mod ui;

use std::time::Duration;

use stagewatch_core::config::TuiConfig;
use stagewatch_engine::InspectionSession;

/// Launch the terminal UI over a running session. Returns when the user
/// quits or the session's event bus goes away.
pub async fn run_tui(
    session: &InspectionSession,
    config: TuiConfig,
    title: impl Into<String>,
) -> anyhow::Result<()> {
    // Subscribe before snapshotting so no state falls in between
    let session_rx = session.subscribe();
    let initial = session.current_state().ok();
    let tick = Duration::from_millis(config.tick_ms.max(10));
    let app = app::App::new(title, session.id().clone(), config, initial);
    let events = event::EventLoop::new(session_rx, tick);

    // Enter raw mode
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;

    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = ratatui::Terminal::new(backend)?;

    let result = app::run_app(&mut terminal, app, events).await;

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;
    terminal.show_cursor()?;

    result
}
