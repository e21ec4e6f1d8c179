use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// Actions produced by key input handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    Quit,
    /// Move the selection to the next node.
    SelectNext,
    /// Move the selection to the previous node.
    SelectPrev,
    /// Show or hide the session log panel.
    ToggleLog,
    None,
}

pub fn handle_key(key: KeyEvent) -> InputAction {
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => InputAction::Quit,
        KeyCode::Char('q') | KeyCode::Esc => InputAction::Quit,
        KeyCode::Tab | KeyCode::Right | KeyCode::Down | KeyCode::Char('j') | KeyCode::Char('l') => {
            InputAction::SelectNext
        }
        KeyCode::BackTab | KeyCode::Left | KeyCode::Up | KeyCode::Char('k') | KeyCode::Char('h') => {
            InputAction::SelectPrev
        }
        KeyCode::Char('L') => InputAction::ToggleLog,
        _ => InputAction::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn quit_keys() {
        assert_eq!(handle_key(key(KeyCode::Char('q'))), InputAction::Quit);
        assert_eq!(handle_key(key(KeyCode::Esc)), InputAction::Quit);
        assert_eq!(
            handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            InputAction::Quit
        );
        assert_eq!(handle_key(key(KeyCode::Char('c'))), InputAction::None);
    }

    #[test]
    fn navigation_keys() {
        assert_eq!(handle_key(key(KeyCode::Tab)), InputAction::SelectNext);
        assert_eq!(handle_key(key(KeyCode::Char('k'))), InputAction::SelectPrev);
        assert_eq!(
            handle_key(KeyEvent::new(KeyCode::Char('L'), KeyModifiers::SHIFT)),
            InputAction::ToggleLog
        );
    }
}
