//! Terminal gesture surface
//!
//! Takes over the terminal (raw mode, alternate screen, mouse capture) and
//! draws the 3x3 grid with ratatui. Drags with the left button draw a
//! pattern; right click or Esc cancels; `q` or Ctrl+C closes the surface.
//!
//! crossterm input is read on a dedicated thread and forwarded over a
//! channel so `next_event` stays async.

use crate::domain::types::{PointerEvent, Zone};
use crate::infra::logging::set_console_paused;
use crate::services::gesture::{CaptureError, GestureSurface, ZoneGrid};
use async_trait::async_trait;
use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, KeyModifiers,
        MouseButton, MouseEventKind,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::Line,
    widgets::{Block, Borders, Paragraph},
    Frame, Terminal,
};
use std::io::{self, Stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const INPUT_POLL: Duration = Duration::from_millis(50);
const INPUT_CHANNEL_CAPACITY: usize = 256;

/// Keypad order, top row first
const ROWS: [[u8; 3]; 3] = [[7, 8, 9], [4, 5, 6], [1, 2, 3]];

#[derive(Debug, Clone, Copy, PartialEq)]
enum SurfaceInput {
    Pointer(PointerEvent),
    Resize(u16, u16),
    Close,
}

/// Translate one crossterm event; cell positions map to cell centers
fn map_event(event: Event) -> Option<SurfaceInput> {
    match event {
        Event::Mouse(mouse) => {
            let x = f64::from(mouse.column) + 0.5;
            let y = f64::from(mouse.row) + 0.5;
            match mouse.kind {
                MouseEventKind::Down(MouseButton::Left) => {
                    Some(SurfaceInput::Pointer(PointerEvent::Press { x, y }))
                }
                MouseEventKind::Drag(MouseButton::Left) | MouseEventKind::Moved => {
                    Some(SurfaceInput::Pointer(PointerEvent::Move { x, y }))
                }
                MouseEventKind::Up(MouseButton::Left) => {
                    Some(SurfaceInput::Pointer(PointerEvent::Release))
                }
                MouseEventKind::Down(MouseButton::Right) => {
                    Some(SurfaceInput::Pointer(PointerEvent::Cancel))
                }
                _ => None,
            }
        }
        Event::Key(key) if key.kind == KeyEventKind::Press => match key.code {
            KeyCode::Esc => Some(SurfaceInput::Pointer(PointerEvent::Cancel)),
            KeyCode::Char('q') => Some(SurfaceInput::Close),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(SurfaceInput::Close)
            }
            _ => None,
        },
        Event::Resize(width, height) => Some(SurfaceInput::Resize(width, height)),
        _ => None,
    }
}

fn spawn_reader(stop: Arc<AtomicBool>, tx: mpsc::Sender<SurfaceInput>) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("fingerlock-input".to_string()).spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            match event::poll(INPUT_POLL) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(error = %e, "terminal_poll_failed");
                    break;
                }
            }
            let input = match event::read() {
                Ok(event) => map_event(event),
                Err(e) => {
                    warn!(error = %e, "terminal_read_failed");
                    break;
                }
            };
            let Some(input) = input else { continue };
            if tx.blocking_send(input).is_err() || input == SurfaceInput::Close {
                break;
            }
        }
        debug!("terminal_reader_stopped");
    })
}

pub struct TerminalSurface {
    terminal: Option<Terminal<CrosstermBackend<Stdout>>>,
    events: Option<mpsc::Receiver<SurfaceInput>>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    size: (u16, u16),
    title: String,
    prompt: String,
    progress: Vec<Zone>,
}

impl TerminalSurface {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            terminal: None,
            events: None,
            reader: None,
            stop: Arc::new(AtomicBool::new(false)),
            size: (0, 0),
            title: title.into(),
            prompt: String::new(),
            progress: Vec::new(),
        }
    }

    fn setup(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        self.size = crossterm::terminal::size()?;
        self.terminal = Some(terminal);

        self.stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        self.reader = Some(spawn_reader(self.stop.clone(), tx)?);
        self.events = Some(rx);
        Ok(())
    }

    fn redraw(&mut self) {
        let title = self.title.as_str();
        let prompt = self.prompt.as_str();
        let progress = self.progress.as_slice();
        if let Some(terminal) = self.terminal.as_mut() {
            if let Err(e) = terminal.draw(|f| draw_grid(f, title, prompt, progress)) {
                warn!(error = %e, "terminal_draw_failed");
            }
        }
    }
}

#[async_trait]
impl GestureSurface for TerminalSurface {
    fn grid(&self) -> ZoneGrid {
        ZoneGrid::new(f64::from(self.size.0), f64::from(self.size.1))
    }

    async fn next_event(&mut self) -> Option<PointerEvent> {
        loop {
            let input = self.events.as_mut()?.recv().await?;
            match input {
                SurfaceInput::Pointer(event) => return Some(event),
                SurfaceInput::Resize(width, height) => {
                    self.size = (width, height);
                    self.redraw();
                }
                SurfaceInput::Close => {
                    self.events = None;
                    return None;
                }
            }
        }
    }

    fn show_prompt(&mut self, prompt: &str) {
        self.prompt = prompt.to_string();
        self.redraw();
    }

    fn show_progress(&mut self, zones: &[Zone]) {
        self.progress = zones.to_vec();
        self.redraw();
    }

    fn activate(&mut self) -> Result<(), CaptureError> {
        if self.terminal.is_some() && self.events.is_some() {
            return Ok(());
        }
        self.deactivate();
        set_console_paused(true);
        if let Err(e) = self.setup() {
            warn!(error = %e, "terminal_setup_failed");
            self.deactivate();
            return Err(CaptureError::SurfaceClosed);
        }
        self.redraw();
        Ok(())
    }

    fn deactivate(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.events = None;
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(mut terminal) = self.terminal.take() {
            let _ = execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture);
            let _ = terminal.show_cursor();
        }
        let _ = disable_raw_mode();
        set_console_paused(false);
    }
}

impl Drop for TerminalSurface {
    fn drop(&mut self) {
        if self.terminal.is_some() {
            self.deactivate();
        }
    }
}

fn draw_grid(f: &mut Frame, title: &str, prompt: &str, progress: &[Zone]) {
    let area = f.area();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Ratio(1, 3), Constraint::Ratio(1, 3), Constraint::Ratio(1, 3)])
        .split(area);

    for (row_index, row) in ROWS.iter().enumerate() {
        let cells = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Ratio(1, 3), Constraint::Ratio(1, 3), Constraint::Ratio(1, 3)])
            .split(rows[row_index]);

        for (col_index, &id) in row.iter().enumerate() {
            let step = progress.iter().position(|z| z.id() == id);
            let style = match step {
                Some(_) => Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
                None => Style::default().fg(Color::DarkGray),
            };
            let label = match step {
                Some(index) => format!("{}  (#{})", id, index + 1),
                None => id.to_string(),
            };
            let cell = Paragraph::new(Line::from(label))
                .style(style)
                .block(Block::default().borders(Borders::ALL).border_style(style));
            f.render_widget(cell, cells[col_index]);
        }
    }

    // Status line over the bottom border
    if area.height > 1 {
        let line = Rect { x: area.x, y: area.y + area.height - 1, width: area.width, height: 1 };
        let text = format!(" {} | {} | Esc: cancel, q: quit ", title, prompt);
        f.render_widget(
            Paragraph::new(Line::from(text)).style(Style::default().fg(Color::Cyan)),
            line,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEvent, MouseEvent};

    fn mouse(kind: MouseEventKind, column: u16, row: u16) -> Event {
        Event::Mouse(MouseEvent { kind, column, row, modifiers: KeyModifiers::NONE })
    }

    #[test]
    fn test_map_mouse_events() {
        assert_eq!(
            map_event(mouse(MouseEventKind::Down(MouseButton::Left), 3, 4)),
            Some(SurfaceInput::Pointer(PointerEvent::Press { x: 3.5, y: 4.5 }))
        );
        assert_eq!(
            map_event(mouse(MouseEventKind::Drag(MouseButton::Left), 10, 2)),
            Some(SurfaceInput::Pointer(PointerEvent::Move { x: 10.5, y: 2.5 }))
        );
        assert_eq!(
            map_event(mouse(MouseEventKind::Up(MouseButton::Left), 0, 0)),
            Some(SurfaceInput::Pointer(PointerEvent::Release))
        );
        assert_eq!(
            map_event(mouse(MouseEventKind::Down(MouseButton::Right), 0, 0)),
            Some(SurfaceInput::Pointer(PointerEvent::Cancel))
        );
        assert_eq!(map_event(mouse(MouseEventKind::ScrollUp, 0, 0)), None);
    }

    #[test]
    fn test_map_key_events() {
        let esc = Event::Key(KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE));
        let quit = Event::Key(KeyEvent::new(KeyCode::Char('q'), KeyModifiers::NONE));
        let ctrl_c = Event::Key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL));
        let plain_c = Event::Key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE));

        assert_eq!(map_event(esc), Some(SurfaceInput::Pointer(PointerEvent::Cancel)));
        assert_eq!(map_event(quit), Some(SurfaceInput::Close));
        assert_eq!(map_event(ctrl_c), Some(SurfaceInput::Close));
        assert_eq!(map_event(plain_c), None);
        assert_eq!(map_event(Event::Resize(120, 40)), Some(SurfaceInput::Resize(120, 40)));
    }

    #[test]
    fn test_terminal_cells_map_onto_keypad_grid() {
        let grid = ZoneGrid::new(90.0, 30.0);
        assert_eq!(grid.zone_at(0.5, 0.5).map(Zone::id), Some(7));
        assert_eq!(grid.zone_at(45.5, 15.5).map(Zone::id), Some(5));
        assert_eq!(grid.zone_at(89.5, 29.5).map(Zone::id), Some(3));
    }
}
