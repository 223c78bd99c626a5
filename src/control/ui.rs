use std::error::Error;
use std::io::stdout;
use std::time::{Duration, Instant};

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
use ratatui::widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table, Wrap};

use crate::config::DriverConfig;
use crate::control::session::{DemoSession, SessionStatus};
use crate::pcm::StreamState;

const TICK_RATE: Duration = Duration::from_millis(100);
const INITIAL_RATE_HZ: u32 = 48_000;

struct AppState {
    status: SessionStatus,
    message: Option<String>,
    last_update: Instant,
}

/// Run the ratatui-based developer console over a simulated device.
pub fn run() -> Result<(), Box<dyn Error>> {
    let mut session = DemoSession::new(DriverConfig::default(), INITIAL_RATE_HZ)?;

    setup_terminal()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut app = AppState {
        status: session.status(),
        message: Some("s: start playback".into()),
        last_update: Instant::now(),
    };

    let result = loop {
        if app.last_update.elapsed() >= TICK_RATE {
            app.status = session.status();
            app.last_update = Instant::now();
        }
        if let Err(err) = terminal.draw(|frame| draw(frame, &app)) {
            break Err(err.into());
        }

        match event::poll(Duration::from_millis(10)) {
            Ok(true) => match event::read() {
                Ok(CEvent::Key(key)) => {
                    if handle_key(&mut app, &mut session, key) {
                        break Ok(());
                    }
                    app.status = session.status();
                }
                Ok(_) => {}
                Err(err) => break Err(err.into()),
            },
            Ok(false) => {}
            Err(err) => break Err(err.into()),
        }
    };

    restore_terminal()?;
    result
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

fn handle_key(app: &mut AppState, session: &mut DemoSession, key: KeyEvent) -> bool {
    let outcome = match key.code {
        KeyCode::Char('q') | KeyCode::Esc => return true,
        KeyCode::Char('s') => session.start().map(|()| "Playback started".to_string()),
        KeyCode::Char(' ') => session.toggle_pause().map(|()| {
            if session.status().playing {
                "Resumed".to_string()
            } else {
                "Paused".to_string()
            }
        }),
        KeyCode::Char('r') => session
            .cycle_rate()
            .map(|hz| format!("Rate switched to {hz} Hz")),
        KeyCode::Char('a') => session.abort().map(|()| "Stream aborted".to_string()),
        KeyCode::Char('u') => session.unplug().map(|()| "Device unplugged".to_string()),
        _ => return false,
    };
    app.message = Some(match outcome {
        Ok(message) => message,
        Err(err) => format!("Error: {err}"),
    });
    false
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
            Constraint::Length(4),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_stream(frame, chunks[1], app);
    draw_level(frame, chunks[2], app);
    draw_footer(frame, chunks[3], app);
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default()
        .title("HiFace Streaming Console")
        .borders(Borders::ALL);

    let status = &app.status;
    let content = match &status.card {
        Some(card) => Paragraph::new(format!(
            "{card}    Device clock: {} Hz    Packets: {}    Streamed: {:.1} KiB",
            status.device_rate_hz,
            status.packets,
            status.bytes_streamed as f64 / 1024.0,
        )),
        None => Paragraph::new(Line::from(vec![Span::styled(
            "Device unplugged",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )])),
    };

    frame.render_widget(content.block(block), area);
}

fn draw_stream(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Stream").borders(Borders::ALL);

    let Some(stream) = &app.status.stream else {
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };

    let state_style = match (stream.panicked, stream.state) {
        (true, _) => Style::default().fg(Color::Red),
        (false, StreamState::Running) => Style::default().fg(Color::Green),
        _ => Style::default().fg(Color::Yellow),
    };
    let rate = stream
        .rate_hz
        .map(|hz| format!("{hz} Hz"))
        .unwrap_or_else(|| "unset".into());
    let rows = vec![
        Row::new(vec![
            Cell::from("State"),
            Cell::from(stream.state.as_str()).style(state_style),
        ]),
        Row::new(vec![Cell::from("Rate"), Cell::from(rate)]),
        Row::new(vec![
            Cell::from("Active"),
            Cell::from(if stream.position.active { "Yes" } else { "No" }),
        ]),
        Row::new(vec![
            Cell::from("DMA offset"),
            Cell::from(stream.position.dma_off.to_string()),
        ]),
        Row::new(vec![
            Cell::from("Period offset"),
            Cell::from(stream.position.period_off.to_string()),
        ]),
        Row::new(vec![
            Cell::from("In flight"),
            Cell::from(stream.in_flight.to_string()),
        ]),
        Row::new(vec![
            Cell::from("Completions"),
            Cell::from(stream.completions.to_string()),
        ]),
        Row::new(vec![
            Cell::from("Periods"),
            Cell::from(format!("{} (tone {})", stream.periods, app.status.tone_periods)),
        ]),
        Row::new(vec![
            Cell::from("Errors"),
            Cell::from(stream.errors.to_string()),
        ]),
    ];

    let header = Row::new(vec![Cell::from("Field"), Cell::from("Value")]).style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );
    let table = Table::new(rows, [Constraint::Length(16), Constraint::Min(20)])
        .header(header)
        .block(block)
        .column_spacing(2);

    frame.render_widget(table, area);
}

fn draw_level(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let level = f64::from(app.status.peak_level).clamp(0.0, 1.0);
    let gauge = Gauge::default()
        .block(Block::default().title("Output peak").borders(Borders::ALL))
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(level);
    frame.render_widget(gauge, area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "s: Start  •  Space: Pause  •  r: Next rate  •  a: Abort  •  u: Unplug  •  q: Quit";
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
