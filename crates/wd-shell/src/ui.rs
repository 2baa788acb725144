//! Dashboard rendering. Pure functions from the model to ratatui widgets;
//! the session loop owns the terminal and calls [`render`] once per
//! iteration.

use crate::model::Model;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph};
use ratatui::Frame;
use std::time::Duration;
use wd_core::cursor;

/// Rows consumed above the scrollable output: the header block (two text
/// lines plus its borders) and the output block's own borders.
pub const HEADER_ROWS: u16 = 6;

struct Theme {
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    err: Color,
    border: Color,
}

fn theme() -> Theme {
    Theme {
        text: Color::Gray,
        muted: Color::DarkGray,
        accent: Color::Cyan,
        ok: Color::Green,
        err: Color::Red,
        border: Color::DarkGray,
    }
}

/// Lines of scrollable output that fit in `area`.
pub fn output_height(area: Rect) -> usize {
    area.height.saturating_sub(HEADER_ROWS) as usize
}

/// Rendered height of each command block under the current collapse set: a
/// collapsed block is its header line only, an expanded one is header plus
/// output plus an error line when the command failed.
pub fn block_sizes(model: &Model) -> Vec<usize> {
    let Some(run) = model.active_run.as_ref() else {
        return Vec::new();
    };
    run.evals
        .iter()
        .enumerate()
        .map(|(idx, eval)| {
            if model.collapsed.contains(&idx) {
                1
            } else {
                1 + eval.output.lines().count() + usize::from(eval.error.is_some())
            }
        })
        .collect()
}

pub fn render(frame: &mut Frame, model: &Model) {
    let theme = theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(4), Constraint::Min(0)])
        .split(frame.size());
    frame.render_widget(render_header(model, &theme), layout[0]);
    render_output(frame, model, &theme, layout[1]);
    if model.chooser_visible {
        render_chooser(frame, model, &theme);
    }
}

fn render_header(model: &Model, theme: &Theme) -> Paragraph<'static> {
    let status = match model.active_run.as_ref() {
        None => Span::styled("idle", Style::default().fg(theme.muted)),
        Some(run) if !run.done => Span::styled(
            format!(
                "{} running {}",
                model.spinner.glyph(),
                format_duration(model.run_elapsed)
            ),
            Style::default().fg(theme.accent),
        ),
        Some(run) => match run.error.as_deref() {
            None => Span::styled(
                format!(
                    "ok in {}",
                    format_duration(run.duration.unwrap_or(model.run_elapsed))
                ),
                Style::default().fg(theme.ok),
            ),
            Some(err) => Span::styled(
                format!("failed: {err}"),
                Style::default().fg(theme.err),
            ),
        },
    };
    let status_line = Line::from(vec![
        Span::styled(
            format!("{}  ", model.now.format("%H:%M:%S")),
            Style::default().fg(theme.muted),
        ),
        Span::styled(
            format!("{}  ", model.build_file),
            Style::default().fg(theme.text),
        ),
        Span::styled(
            format!("rev {} ({})  ", model.revision, model.head_snapshot),
            Style::default().fg(theme.muted),
        ),
        status,
    ]);
    let edits_line = if model.queued_paths.is_empty() {
        Line::from(Span::styled(
            "no edits since last run  (f targets, r rerun, o fold, q quit)",
            Style::default().fg(theme.muted),
        ))
    } else {
        Line::from(Span::styled(
            format!("edited: {}", model.queued_paths.join(", ")),
            Style::default().fg(theme.accent),
        ))
    };

    Paragraph::new(Text::from(vec![status_line, edits_line])).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .title(Span::styled(
                "watchdeck",
                Style::default()
                    .fg(theme.accent)
                    .add_modifier(Modifier::BOLD),
            )),
    )
}

fn render_output(frame: &mut Frame, model: &Model, theme: &Theme, area: Rect) {
    let lines = output_lines(model, theme);
    let view_height = output_height(frame.size());
    let at = cursor::buffer_index(model.cursor, &model.block_sizes);
    let top = at.saturating_sub(model.cursor.line_in_view);

    let visible: Vec<Line> = lines
        .into_iter()
        .enumerate()
        .skip(top)
        .take(view_height)
        .map(|(idx, line)| {
            if idx == at {
                line.style(Style::default().add_modifier(Modifier::REVERSED))
            } else {
                line
            }
        })
        .collect();

    let title = if model.selected_target.is_empty() {
        "default".to_string()
    } else {
        model.selected_target.clone()
    };
    frame.render_widget(
        Paragraph::new(Text::from(visible)).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.border))
                .title(Span::styled(
                    title,
                    Style::default()
                        .fg(theme.accent)
                        .add_modifier(Modifier::BOLD),
                )),
        ),
        area,
    );
}

/// Flatten the run into one buffer of lines, mirroring [`block_sizes`]
/// exactly: the cursor's buffer index must stay a valid index here.
fn output_lines(model: &Model, theme: &Theme) -> Vec<Line<'static>> {
    let Some(run) = model.active_run.as_ref() else {
        return Vec::new();
    };
    let mut lines = Vec::new();
    for (idx, eval) in run.evals.iter().enumerate() {
        let marker = if !eval.done {
            Span::styled(
                format!("{} ", model.spinner.glyph()),
                Style::default().fg(theme.accent),
            )
        } else if eval.error.is_some() {
            Span::styled("x ", Style::default().fg(theme.err))
        } else {
            Span::styled("+ ", Style::default().fg(theme.ok))
        };
        if model.collapsed.contains(&idx) {
            let hidden = eval.output.lines().count() + usize::from(eval.error.is_some());
            lines.push(Line::from(vec![
                marker,
                Span::styled(
                    format!("$ {}", eval.command),
                    Style::default().fg(theme.text).add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    format!("  [{hidden} lines hidden]"),
                    Style::default().fg(theme.muted),
                ),
            ]));
            continue;
        }
        lines.push(Line::from(vec![
            marker,
            Span::styled(
                format!("$ {}", eval.command),
                Style::default().fg(theme.text).add_modifier(Modifier::BOLD),
            ),
        ]));
        for text in eval.output.lines() {
            lines.push(Line::from(Span::styled(
                text.to_string(),
                Style::default().fg(theme.text),
            )));
        }
        if let Some(err) = eval.error.as_deref() {
            lines.push(Line::from(Span::styled(
                err.to_string(),
                Style::default().fg(theme.err),
            )));
        }
    }
    lines
}

fn render_chooser(frame: &mut Frame, model: &Model, theme: &Theme) {
    let area = centered_rect(40, 50, frame.size());
    let mut items = vec![ListItem::new("(default)")];
    items.extend(
        model
            .targets
            .iter()
            .map(|target| ListItem::new(target.clone())),
    );
    let mut state = ListState::default();
    state.select(Some(model.chooser_pos));
    let list = List::new(items)
        .highlight_symbol(">> ")
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.border))
                .title(Span::styled(
                    "Target",
                    Style::default()
                        .fg(theme.accent)
                        .add_modifier(Modifier::BOLD),
                )),
        );
    frame.render_widget(Clear, area);
    frame.render_stateful_widget(list, area, &mut state);
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100u16.saturating_sub(percent_y)) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100u16.saturating_sub(percent_y)) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100u16.saturating_sub(percent_x)) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100u16.saturating_sub(percent_x)) / 2),
        ])
        .split(vertical[1])[1]
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs >= 60.0 {
        format!("{}m{:02}s", d.as_secs() / 60, d.as_secs() % 60)
    } else {
        format!("{secs:.1}s")
    }
}
