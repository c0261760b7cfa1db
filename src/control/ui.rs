use std::error::Error;
use std::io::stdout;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded};
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap};

use crate::control::api;
use crate::{ChannelState, ChannelStatus, EndpointHealth, EndpointRegistry, EndpointStatus};

const TICK_RATE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct AppState {
    endpoints: Vec<EndpointStatus>,
    selected: usize,
    mode: Mode,
    message: Option<String>,
    last_update: Option<Instant>,
}

impl AppState {
    fn channels(&self) -> impl Iterator<Item = (&EndpointStatus, &ChannelStatus)> {
        self.endpoints
            .iter()
            .flat_map(|e| e.channels.iter().map(move |c| (e, c)))
    }

    fn channel_count(&self) -> usize {
        self.endpoints.iter().map(|e| e.channels.len()).sum()
    }

    fn current(&self) -> Option<ChannelStatus> {
        self.channels().nth(self.selected).map(|(_, c)| c.clone())
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    GainInput,
}

struct GainEditor {
    buffer: String,
}

/// Run the ratatui-based developer console against `registry` until `q` is pressed.
pub fn run(registry: EndpointRegistry) -> Result<(), Box<dyn Error>> {
    setup_terminal()?;

    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (status_tx, status_rx) = bounded(4);
    let poller = registry.clone();
    std::thread::Builder::new()
        .name("endpointctl-status".into())
        .spawn(move || {
            loop {
                if status_tx.send(api::get_status(&poller)).is_err() {
                    break;
                }
                std::thread::sleep(TICK_RATE);
            }
        })?;

    let mut app = AppState::default();
    let mut gain_editor: Option<GainEditor> = None;

    loop {
        terminal.draw(|frame| draw(frame, &app, gain_editor.as_ref()))?;

        if let Some(endpoints) = try_recv_latest(&status_rx) {
            app.endpoints = endpoints;
            app.last_update = Some(Instant::now());
            app.selected = app.selected.min(app.channel_count().saturating_sub(1));
        }
        if let Some(line) = crate::pop_log() {
            app.message = Some(line);
        }

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(&registry, &mut app, &mut gain_editor, key) {
                    break;
                }
            }
        }
    }

    restore_terminal()?;
    Ok(())
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

fn handle_key(
    registry: &EndpointRegistry,
    app: &mut AppState,
    gain_editor: &mut Option<GainEditor>,
    key: KeyEvent,
) -> bool {
    match app.mode {
        Mode::Normal => match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Up => {
                app.selected = app.selected.saturating_sub(1);
            }
            KeyCode::Down => {
                if app.selected + 1 < app.channel_count() {
                    app.selected += 1;
                }
            }
            KeyCode::Char(' ') => {
                if let Some(channel) = app.current() {
                    app.message = Some(match api::toggle_running(registry, channel.id) {
                        Ok(state) => format!("{} {:?}", channel.id, state),
                        Err(err) => format!("{}: {err}", channel.id),
                    });
                }
            }
            KeyCode::Char('g') => {
                if let Some(channel) = app.current() {
                    let db = api::linear_to_db(channel.volume).max(-120.0);
                    gain_editor.replace(GainEditor {
                        buffer: format!("{db:.1}"),
                    });
                    app.mode = Mode::GainInput;
                }
            }
            _ => {}
        },
        Mode::GainInput => match key.code {
            KeyCode::Esc => {
                gain_editor.take();
                app.mode = Mode::Normal;
            }
            KeyCode::Enter => {
                if let (Some(editor), Some(channel)) = (gain_editor.take(), app.current()) {
                    if let Ok(value) = editor.buffer.trim().parse::<f32>() {
                        if api::set_volume_db(registry, channel.id, value) {
                            app.message = Some(format!("Set {} gain to {value:.1} dB", channel.id));
                        }
                    }
                }
                app.mode = Mode::Normal;
            }
            KeyCode::Backspace => {
                if let Some(editor) = gain_editor.as_mut() {
                    editor.buffer.pop();
                }
            }
            KeyCode::Char(c) => {
                if let Some(editor) = gain_editor.as_mut() {
                    if c.is_ascii_digit() || matches!(c, '.' | '-' | '+') {
                        editor.buffer.push(c);
                    }
                }
            }
            _ => {}
        },
    }
    false
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState, gain_editor: Option<&GainEditor>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3 + app.endpoints.len().max(1) as u16),
            Constraint::Min(8),
            Constraint::Length(4),
        ])
        .split(frame.size());

    draw_endpoints(frame, chunks[0], app);
    draw_channels(frame, chunks[1], app);
    draw_footer(frame, chunks[2], app);

    if let Some(editor) = gain_editor {
        let area = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(3)])
            .split(frame.size())[1];

        let block = Block::default()
            .title("Set Gain (dB): Enter to apply, Esc to cancel")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow));

        let paragraph = Paragraph::new(editor.buffer.clone())
            .block(block)
            .wrap(Wrap { trim: false });

        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }
}

fn health_style(health: EndpointHealth) -> Style {
    match health {
        EndpointHealth::Healthy => Style::default().fg(Color::Green),
        EndpointHealth::Disconnected => Style::default().fg(Color::Red),
        EndpointHealth::Faulted => Style::default().fg(Color::Magenta),
    }
}

fn draw_endpoints(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default()
        .title("Shared Endpoints")
        .borders(Borders::ALL);

    if app.endpoints.is_empty() {
        let empty = Paragraph::new(Line::from(vec![Span::styled(
            "No open endpoints",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )]));
        frame.render_widget(empty.block(block), area);
        return;
    }

    let lines: Vec<Line> = app
        .endpoints
        .iter()
        .map(|e| {
            Line::from(vec![
                Span::raw(format!(
                    "Device {}  {} Hz x{}  Burst: {} frames  Buffer: {} frames  Refs: {}  Bursts: {}  Underflows: {}  RMS: {:.3}  ",
                    e.device_id,
                    e.sample_rate,
                    e.channel_count,
                    e.frames_per_burst,
                    e.buffer_size_frames,
                    e.reference_count,
                    e.bursts_written,
                    e.underflows,
                    e.output_rms,
                )),
                Span::styled(format!("{:?}", e.health), health_style(e.health)),
                Span::raw(if e.streaming { "  streaming" } else { "  idle" }),
            ])
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn state_style(state: ChannelState) -> Style {
    match state {
        ChannelState::Running => Style::default().fg(Color::Green),
        ChannelState::Stopped => Style::default(),
        ChannelState::Disconnected | ChannelState::Faulted => Style::default().fg(Color::Red),
    }
}

fn draw_channels(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Streams").borders(Borders::ALL);

    let header = Row::new(vec![
        Cell::from(""),
        Cell::from("Stream"),
        Cell::from("Device"),
        Cell::from("State"),
        Cell::from("Gain (dB)"),
        Cell::from("Buffer %"),
        Cell::from("Underflows"),
        Cell::from("Frames mixed"),
    ])
    .style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let rows = app.channels().enumerate().map(|(idx, (endpoint, ch))| {
        let indicator = if idx == app.selected { ">" } else { "" };
        let mut row = Row::new(vec![
            Cell::from(indicator.to_string()),
            Cell::from(ch.id.to_string()),
            Cell::from(endpoint.device_id.to_string()),
            Cell::from(Span::styled(format!("{:?}", ch.state), state_style(ch.state))),
            Cell::from(format!("{:.1}", api::linear_to_db(ch.volume).max(-120.0))),
            Cell::from(format!("{:.1}", ch.buffer_fill * 100.0)),
            Cell::from(ch.underflows.to_string()),
            Cell::from(ch.frames_mixed.to_string()),
        ]);
        if idx == app.selected {
            row = row.style(Style::default().fg(Color::Yellow));
        }
        row
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(2),
            Constraint::Length(12),
            Constraint::Length(8),
            Constraint::Length(14),
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(12),
            Constraint::Length(14),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(2);

    frame.render_widget(table, area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "Up/Down: Select  |  Space: Start/stop  |  g: Set gain  |  q: Quit";
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
