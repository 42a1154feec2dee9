//! UI rendering for the monitor.

use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph, List, ListItem},
    style::{Color, Style, Modifier},
};
use crate::cpu::{LoopState, FLUSH_THRESHOLD};
use super::app::MonitorApp;

/// Main draw function.
pub fn draw(frame: &mut Frame, app: &MonitorApp) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(60),
            Constraint::Percentage(40),
        ])
        .split(frame.area());

    // Left side: execution, registers, bus and status
    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(8),
            Constraint::Length(app.machine.config().registers.len() as u16 + 4),
            Constraint::Length(6),
            Constraint::Length(3),
        ])
        .split(chunks[0]);

    draw_history(frame, left_chunks[0], app);
    draw_registers(frame, left_chunks[1], app);
    draw_bus(frame, left_chunks[2], app);
    draw_status(frame, left_chunks[3], app);

    // Right side: data region and help
    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(10),
            Constraint::Length(4),
        ])
        .split(chunks[1]);

    draw_data(frame, right_chunks[0], app);
    draw_help(frame, right_chunks[1]);
}

/// Recently executed actions, newest on top.
fn draw_history(frame: &mut Frame, area: Rect, app: &MonitorApp) {
    let rows = (area.height as usize).saturating_sub(2);

    let items: Vec<ListItem> = app
        .recent_actions(rows)
        .into_iter()
        .enumerate()
        .map(|(i, text)| {
            let style = if i == 0 {
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            ListItem::new(text).style(style)
        })
        .collect();

    let list = List::new(items)
        .block(Block::default()
            .title(format!(" Executed ({}) ", app.machine.cpu().executed()))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan)));

    frame.render_widget(list, area);
}

/// Registers plus the loop state line.
fn draw_registers(frame: &mut Frame, area: Rect, app: &MonitorApp) {
    let cpu = app.machine.cpu();

    let mut content: Vec<Line> = cpu
        .registers()
        .iter()
        .map(|(name, value)| {
            Line::from(vec![
                Span::raw(format!("{:>4}: ", name)),
                Span::styled(format!("{:>20}", value), value_style(value)),
            ])
        })
        .collect();

    content.push(Line::from(vec![
        Span::raw("Loop: "),
        Span::styled(cpu.loop_state().to_string(), loop_style(cpu.loop_state())),
        Span::raw(format!("   compiled: {}", cpu.loops().len())),
    ]));
    content.push(Line::from(vec![
        Span::raw("Steps: "),
        Span::styled(app.machine.steps().to_string(), Style::default().fg(Color::Cyan)),
        Span::raw("   State: "),
        if app.failed {
            Span::styled("failed", Style::default().fg(Color::Red))
        } else if app.machine.is_idle() {
            Span::styled("idle", Style::default().fg(Color::Gray))
        } else {
            Span::styled("busy", Style::default().fg(Color::Green))
        },
    ]));

    let paragraph = Paragraph::new(content)
        .block(Block::default()
            .title(" Registers ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Green)));

    frame.render_widget(paragraph, area);
}

/// Router counters.
fn draw_bus(frame: &mut Frame, area: Rect, app: &MonitorApp) {
    let config = app.machine.bus().config();
    let stats = app.machine.bus().stats();

    let content = vec![
        Line::from(format!(
            "width {} B/lane/tick   chunk {}   {} Hz",
            config.width,
            config.chunk_size(),
            config.frequency
        )),
        Line::from(format!("ticks {}   delivered {}", stats.ticks, stats.delivered_fragments)),
        Line::from(vec![
            Span::raw("in flight "),
            Span::styled(
                stats.in_flight.to_string(),
                if stats.in_flight > 0 { Style::default().fg(Color::Yellow) } else { Style::default() },
            ),
            Span::raw(format!("   deferrals {}", stats.deferrals)),
        ]),
    ];

    let paragraph = Paragraph::new(content)
        .block(Block::default()
            .title(" Bus ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Blue)));

    frame.render_widget(paragraph, area);
}

/// Data region with cached values alongside.
fn draw_data(frame: &mut Frame, area: Rect, app: &MonitorApp) {
    let memory = app.machine.memory();
    let cache = app.machine.cpu().cache();
    let visible_rows = (area.height as usize).saturating_sub(2);
    let start = app.data_scroll;
    let end = (start + visible_rows).min(memory.data_len());

    let items: Vec<ListItem> = (start..end)
        .map(|address| {
            let address = address as i64;
            let value = memory.read_data(address).unwrap_or_default();

            let (text, style) = match cache.entry(address) {
                Some(entry) => (
                    format!("0x{:03x}: {:>12}  [cache {} / {}]", address, value, entry.value, entry.access),
                    if entry.access + 1 >= FLUSH_THRESHOLD {
                        Style::default().fg(Color::Red)
                    } else {
                        Style::default().fg(Color::Yellow)
                    },
                ),
                None if value != 0 => (format!("0x{:03x}: {:>12}", address, value), Style::default().fg(Color::White)),
                None => (format!("0x{:03x}: {:>12}", address, value), Style::default().fg(Color::DarkGray)),
            };

            ListItem::new(text).style(style)
        })
        .collect();

    let list = List::new(items)
        .block(Block::default()
            .title(format!(" Data ({} cached) ", cache.len()))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Magenta)));

    frame.render_widget(list, area);
}

/// Draw status bar.
fn draw_status(frame: &mut Frame, area: Rect, app: &MonitorApp) {
    let status = Paragraph::new(app.status.clone())
        .style(Style::default().fg(if app.failed { Color::Red } else { Color::White }))
        .block(Block::default()
            .title(" Status ")
            .borders(Borders::ALL));

    frame.render_widget(status, area);
}

/// Draw help panel.
fn draw_help(frame: &mut Frame, area: Rect) {
    let help = Paragraph::new(vec![
        Line::from("s: Step  r: Run  p: Pause  x: Reset"),
        Line::from("↑↓: Scroll data  q: Quit"),
    ])
    .style(Style::default().fg(Color::DarkGray))
    .block(Block::default()
        .title(" Help ")
        .borders(Borders::ALL));

    frame.render_widget(help, area);
}

fn value_style(value: i64) -> Style {
    match value.signum() {
        -1 => Style::default().fg(Color::Red),
        0 => Style::default().fg(Color::Gray),
        _ => Style::default().fg(Color::Green),
    }
}

fn loop_style(state: &LoopState) -> Style {
    match state {
        LoopState::Idle => Style::default().fg(Color::Gray),
        LoopState::Building(_) => Style::default().fg(Color::Cyan),
        LoopState::AwaitingBranch { .. } => Style::default().fg(Color::Yellow),
        LoopState::Executing(_) => Style::default().fg(Color::Green),
    }
}
