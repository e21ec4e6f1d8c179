use std::sync::OnceLock;

use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols::Marker;
use ratatui::text::{Line, Span};
use ratatui::widgets::canvas::{Canvas, Line as CanvasLine};
use ratatui::widgets::{Block, BorderType, Borders, Clear, Paragraph, Wrap};
use ratatui::Frame;
use tui_banner::Banner;

use stagewatch_core::config::TuiConfig;
use stagewatch_core::types::{GraphState, Status};

use crate::app::{App, LogLevel};

const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const NODE_HEIGHT: u16 = 3;
const MIN_NODE_WIDTH: u16 = 10;
const MAX_NODE_WIDTH: u16 = 24;
const SIDE_PANEL_WIDTH: u16 = 36;

/// Cached banner, rendered once since it never changes.
struct BannerCache {
    lines: Vec<String>,
    /// Widest line in the banner (character count).
    width: u16,
    height: u16,
}

fn cached_banner() -> &'static BannerCache {
    static CACHE: OnceLock<BannerCache> = OnceLock::new();
    CACHE.get_or_init(|| {
        let text = Banner::new("STAGEWATCH")
            .map(|b| b.style(tui_banner::Style::NeonCyber).render())
            .unwrap_or_else(|_| String::from("STAGEWATCH"));
        let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
        let width = lines
            .iter()
            .map(|l| l.chars().count() as u16)
            .max()
            .unwrap_or(10);
        let height = lines.len() as u16;
        BannerCache {
            lines,
            width,
            height,
        }
    })
}

pub fn status_color(status: Status) -> Color {
    match status {
        Status::Idle => Color::DarkGray,
        Status::Running => Color::Yellow,
        Status::Succeeded => Color::Green,
        Status::Failed => Color::Red,
    }
}

fn status_symbol(status: Status, tick: usize) -> &'static str {
    match status {
        Status::Idle => "○",
        Status::Running => SPINNER[(tick / 2) % SPINNER.len()],
        Status::Succeeded => "✓",
        Status::Failed => "✗",
    }
}

/// Draw the TUI layout.
pub fn draw(f: &mut Frame, app: &App) {
    let area = f.area();
    let banner = cached_banner();

    // Full art only when it leaves at least 12 rows for the graph
    let banner_height = if area.height < 12 {
        0
    } else if area.width >= banner.width + 2 && area.height >= banner.height + 1 + 12 {
        banner.height + 1
    } else {
        2
    };

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(banner_height),
            Constraint::Min(1),
            Constraint::Length(1),
        ])
        .split(area);

    if banner_height > 0 {
        draw_banner(f, app, chunks[0], banner_height);
    }

    let body = if area.width > SIDE_PANEL_WIDTH * 2 {
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(1), Constraint::Length(SIDE_PANEL_WIDTH)])
            .split(chunks[1]);
        draw_side_panel(f, app, cols[1]);
        cols[0]
    } else {
        chunks[1]
    };

    match &app.state {
        Some(state) => draw_graph(f, app, state, body),
        None => draw_unavailable(f, app, body),
    }
    draw_status_bar(f, app, chunks[2]);
}

fn draw_banner(f: &mut Frame, app: &App, area: Rect, banner_height: u16) {
    let banner = cached_banner();

    let lines: Vec<Line> = if banner_height > 2 && area.width >= banner.width {
        banner
            .lines
            .iter()
            .map(|l| Line::from(Span::styled(l.clone(), Style::default().fg(Color::Cyan))))
            .collect()
    } else {
        vec![Line::from(vec![
            Span::styled(
                " STAGEWATCH",
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(format!("  {}", app.title), Style::default().fg(Color::DarkGray)),
        ])]
    };

    let widget = Paragraph::new(lines).block(Block::default().borders(Borders::BOTTOM));
    f.render_widget(widget, area);
}

/// Terminal cells of each node, in node order. Positions are divided by the
/// configured scale, which grows when needed so the whole graph fits. `None`
/// when a node still falls outside `area`.
pub fn layout_nodes(state: &GraphState, area: Rect, config: &TuiConfig) -> Vec<Option<Rect>> {
    if area.height < NODE_HEIGHT || area.width == 0 {
        return vec![None; state.nodes.len()];
    }
    let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
    for node in &state.nodes {
        min_x = min_x.min(node.position.x);
        max_x = max_x.max(node.position.x);
        min_y = min_y.min(node.position.y);
        max_y = max_y.max(node.position.y);
    }
    let x_scale = fit_scale(config.x_scale, max_x - min_x, area.width.saturating_sub(MAX_NODE_WIDTH));
    let y_scale = fit_scale(config.y_scale, max_y - min_y, area.height.saturating_sub(NODE_HEIGHT));

    state
        .nodes
        .iter()
        .map(|node| {
            let col = ((node.position.x - min_x) / x_scale).round() as u16;
            let row = ((node.position.y - min_y) / y_scale).round() as u16;
            let width = (node.display_label().chars().count() as u16 + 6)
                .clamp(MIN_NODE_WIDTH, MAX_NODE_WIDTH);
            if col >= area.width || row.saturating_add(NODE_HEIGHT) > area.height {
                return None;
            }
            Some(Rect {
                x: area.x + col,
                y: area.y + row,
                width: width.min(area.width - col),
                height: NODE_HEIGHT,
            })
        })
        .collect()
}

fn fit_scale(configured: f64, span: f64, cells: u16) -> f64 {
    let scale = if configured > 0.0 { configured } else { 1.0 };
    if cells == 0 || span <= 0.0 {
        return scale;
    }
    scale.max(span / cells as f64)
}

fn draw_graph(f: &mut Frame, app: &App, state: &GraphState, area: Rect) {
    let title = format!(" Pipeline · gen {} ", state.generation);
    let block = Block::default().borders(Borders::ALL).title(title);
    let mut inner = block.inner(area);
    f.render_widget(block, area);

    if let Some(gap) = &state.visibility_gap {
        let warning = Paragraph::new(format!(
            " ⚠ visibility gap since {}: {} (showing last known status)",
            gap.since.format("%H:%M:%S"),
            gap.reason
        ))
        .style(
            Style::default()
                .bg(Color::Yellow)
                .fg(Color::Black)
                .add_modifier(Modifier::BOLD),
        );
        f.render_widget(warning, Rect { height: inner.height.min(1), ..inner });
        inner.y += 2;
        inner.height = inner.height.saturating_sub(2);
    }

    let rects = layout_nodes(state, inner, &app.config);

    // Edges go under the boxes: right side of the source to left side of the target
    let (w, h) = (inner.width as f64, inner.height as f64);
    let mut segments = Vec::new();
    for edge in state.edges.iter() {
        let source = state.nodes.iter().position(|n| n.id == edge.source);
        let target = state.nodes.iter().position(|n| n.id == edge.target);
        let (Some(si), Some(ti)) = (source, target) else {
            continue;
        };
        let (Some(s), Some(t)) = (rects[si], rects[ti]) else {
            continue;
        };
        let color = status_color(state.nodes[si].status);
        let x1 = (s.x + s.width - inner.x) as f64;
        let y1 = h - (s.y - inner.y) as f64 - 1.5;
        let x2 = (t.x - inner.x) as f64;
        let y2 = h - (t.y - inner.y) as f64 - 1.5;
        segments.push((x1, y1, x2, y2, color));
    }
    let canvas = Canvas::default()
        .marker(Marker::Braille)
        .x_bounds([0.0, w])
        .y_bounds([0.0, h])
        .paint(move |ctx| {
            for &(x1, y1, x2, y2, color) in &segments {
                ctx.draw(&CanvasLine {
                    x1,
                    y1,
                    x2,
                    y2,
                    color,
                });
            }
        });
    f.render_widget(canvas, inner);

    for (i, (node, rect)) in state.nodes.iter().zip(rects).enumerate() {
        let Some(rect) = rect else { continue };
        let color = status_color(node.status);
        let selected = i == app.selected;
        let mut border = Style::default().fg(color);
        if selected {
            border = border.add_modifier(Modifier::BOLD);
        }
        let text = format!(
            "{} {}",
            status_symbol(node.status, app.tick_count),
            node.display_label()
        );
        let widget = Paragraph::new(text)
            .style(Style::default().fg(color))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .border_type(if selected {
                        BorderType::Double
                    } else {
                        BorderType::Rounded
                    })
                    .border_style(border),
            );
        f.render_widget(Clear, rect);
        f.render_widget(widget, rect);
    }
}

fn draw_unavailable(f: &mut Frame, app: &App, area: Rect) {
    let mut lines = vec![
        Line::from(""),
        Line::from(Span::styled(
            "graph unavailable",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
    ];
    match &app.layout_error {
        Some((reason, attempt)) => {
            lines.push(Line::from(format!("{} (attempt {})", reason, attempt)));
            lines.push(Line::from(Span::styled(
                "retrying…",
                Style::default().fg(Color::DarkGray),
            )));
        }
        None => lines.push(Line::from(Span::styled(
            format!("{} waiting for layout", SPINNER[(app.tick_count / 2) % SPINNER.len()]),
            Style::default().fg(Color::DarkGray),
        ))),
    }

    let widget = Paragraph::new(lines)
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title(" Pipeline "));
    f.render_widget(widget, area);
}

fn draw_side_panel(f: &mut Frame, app: &App, area: Rect) {
    let rows = if app.show_log {
        Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(9), Constraint::Min(3)])
            .split(area)
    } else {
        Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1)])
            .split(area)
    };

    let mut details = Vec::new();
    match (app.selected_node(), &app.state) {
        (Some(node), Some(state)) => {
            let upstream = state.upstream_of(&node.id);
            details.push(Line::from(Span::styled(
                node.display_label().to_string(),
                Style::default().add_modifier(Modifier::BOLD),
            )));
            details.push(Line::from(format!("id: {}", node.id)));
            details.push(Line::from(vec![
                Span::raw("status: "),
                Span::styled(
                    node.status.to_string(),
                    Style::default().fg(status_color(node.status)),
                ),
            ]));
            details.push(Line::from(format!(
                "after: {}",
                if upstream.is_empty() {
                    "-".to_string()
                } else {
                    upstream.join(", ")
                }
            )));
            let blocked: Vec<&str> = upstream
                .iter()
                .copied()
                .filter(|id| state.status(id) == Some(Status::Failed))
                .collect();
            if !blocked.is_empty() {
                details.push(Line::from(Span::styled(
                    format!("failed upstream: {}", blocked.join(", ")),
                    Style::default().fg(Color::Red),
                )));
            }
        }
        _ => details.push(Line::from(Span::styled(
            "no node selected",
            Style::default().fg(Color::DarkGray),
        ))),
    }
    let widget = Paragraph::new(details)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title(" Node "));
    f.render_widget(widget, rows[0]);

    if app.show_log {
        let visible = rows[1].height.saturating_sub(2) as usize;
        let lines: Vec<Line> = app
            .log
            .iter()
            .skip(app.log.len().saturating_sub(visible))
            .map(|l| {
                let color = match l.level {
                    LogLevel::Info => Color::Gray,
                    LogLevel::Warn => Color::Yellow,
                };
                Line::from(Span::styled(l.text.clone(), Style::default().fg(color)))
            })
            .collect();
        let widget = Paragraph::new(lines)
            .block(Block::default().borders(Borders::ALL).title(" Session "));
        f.render_widget(widget, rows[1]);
    }
}

fn draw_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let link = if app.closed {
        "closed"
    } else if app.connected {
        "live"
    } else {
        "reconnecting"
    };
    let counts = match &app.state {
        Some(state) => {
            let s = state.summary();
            format!(
                "{} idle · {} running · {} ok · {} failed",
                s.idle, s.running, s.succeeded, s.failed
            )
        }
        None => "no layout".to_string(),
    };
    let text = format!(
        " Session: {} | {} | {} | Tab select · L log · q quit",
        app.session_id.short(),
        link,
        counts
    );
    let status = Paragraph::new(text).style(Style::default().bg(Color::DarkGray).fg(Color::White));
    f.render_widget(status, area);
}
