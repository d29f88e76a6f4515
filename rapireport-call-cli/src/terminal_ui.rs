//! Terminal rendering of the call overlay

use anyhow::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame, Terminal,
};
use rapireport_call_core::presenter::{StreamSource, VideoSlot};
use rapireport_call_core::{
    config::RingtoneAssets, OverlayView, RenderTarget, Ringer, Ringtone,
};
use std::collections::VecDeque;
use std::io::{self, Stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const MAX_NOTICES: usize = 5;

/// How the overlay is drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Full-screen terminal UI
    Tui,
    /// One line per change, commands read from stdin
    Plain,
}

/// Display mode flag
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliDisplayMode {
    /// Full-screen terminal UI
    Tui,
    /// Line output for pipes and logs
    Plain,
}

impl From<CliDisplayMode> for DisplayMode {
    fn from(mode: CliDisplayMode) -> Self {
        match mode {
            CliDisplayMode::Tui => DisplayMode::Tui,
            CliDisplayMode::Plain => DisplayMode::Plain,
        }
    }
}

/// User command from a key press or a stdin line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCommand {
    Accept,
    Decline,
    HangUp,
    ToggleMic,
    ToggleCamera,
    Minimize,
    Restore,
    Quit,
}

impl UiCommand {
    /// Command bound to `c`
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'a' => Some(Self::Accept),
            'd' => Some(Self::Decline),
            'h' => Some(Self::HangUp),
            'm' => Some(Self::ToggleMic),
            'v' => Some(Self::ToggleCamera),
            'n' => Some(Self::Minimize),
            'r' => Some(Self::Restore),
            'q' => Some(Self::Quit),
            _ => None,
        }
    }

    /// Command for a stdin line
    pub fn from_line(line: &str) -> Option<Self> {
        let mut chars = line.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_char(c),
            _ => None,
        }
    }

    fn from_key(code: KeyCode) -> Option<Self> {
        match code {
            KeyCode::Esc => Some(Self::Quit),
            KeyCode::Char(c) => Self::from_char(c),
            _ => None,
        }
    }
}

/// Plain-text lines for a view
pub fn describe(view: &OverlayView) -> Vec<String> {
    match view {
        OverlayView::Hidden => vec!["[no call]".to_string()],
        OverlayView::Modal(modal) => {
            let mut lines = vec![format!("[call] {} - {}", modal.title, modal.status_line)];
            if let Some(error) = &modal.error {
                lines.push(format!("  error: {error}"));
            }
            lines.push(format!(
                "  camera {} | mic {} | remote video {}",
                on_off(modal.camera_enabled),
                on_off(modal.mic_enabled),
                if modal.remote_video { "yes" } else { "no" }
            ));
            let mut keys = Vec::new();
            if modal.controls.accept {
                keys.push("(a) accept");
            }
            if modal.controls.decline {
                keys.push("(d) decline");
            }
            if modal.controls.hang_up {
                keys.push("(h) hang up");
            }
            if modal.controls.toggles {
                keys.push("(m) mic");
                keys.push("(v) camera");
            }
            if modal.controls.minimize {
                keys.push("(n) minimize");
            }
            keys.push("(q) quit");
            lines.push(format!("  {}", keys.join(" | ")));
            lines
        }
        OverlayView::Minimized(widget) => vec![format!(
            "[in call] {} {} | camera {} | mic {} | (r) restore (h) hang up",
            widget.title,
            widget.elapsed,
            on_off(widget.camera_enabled),
            on_off(widget.mic_enabled)
        )],
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn describe_source(source: &StreamSource) -> String {
    match source {
        StreamSource::Local(stream) => {
            format!("{} ({} tracks)", stream.id(), stream.tracks().len())
        }
        StreamSource::Remote(stream) => {
            format!("{} ({} tracks)", stream.id(), stream.tracks().len())
        }
    }
}

/// Overlay state the terminal draws from
pub struct TerminalTarget {
    mode: DisplayMode,
    view: OverlayView,
    local: Option<String>,
    remote: Option<String>,
    notices: VecDeque<String>,
}

impl TerminalTarget {
    pub fn new(mode: DisplayMode) -> Self {
        Self {
            mode,
            view: OverlayView::Hidden,
            local: None,
            remote: None,
            notices: VecDeque::new(),
        }
    }

    pub fn view(&self) -> &OverlayView {
        &self.view
    }

    /// Show a notice, keeping the latest few
    pub fn push_notice(&mut self, notice: String) {
        if self.mode == DisplayMode::Plain {
            println!("* {notice}");
        }
        self.notices.push_back(notice);
        while self.notices.len() > MAX_NOTICES {
            self.notices.pop_front();
        }
    }
}

impl RenderTarget for TerminalTarget {
    fn render(&mut self, view: &OverlayView) {
        self.view = view.clone();
        if self.mode == DisplayMode::Plain {
            for line in describe(view) {
                println!("{line}");
            }
        }
    }

    fn attach(&mut self, slot: VideoSlot, source: Option<StreamSource>) {
        let described = source.as_ref().map(describe_source);
        if self.mode == DisplayMode::Plain {
            if let Some(d) = &described {
                println!("  {slot:?} video <- {d}");
            }
        }
        match slot {
            VideoSlot::Local => self.local = described,
            VideoSlot::Remote => self.remote = described,
        }
    }
}

fn draw(f: &mut Frame, target: &TerminalTarget) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(8),                         // Overlay
            Constraint::Length(4),                      // Video surfaces
            Constraint::Length(MAX_NOTICES as u16 + 2), // Notices
        ])
        .split(f.size());

    draw_overlay(f, chunks[0], target.view());
    draw_surfaces(f, chunks[1], target);
    draw_notices(f, chunks[2], target);
}

fn draw_overlay(f: &mut Frame, area: Rect, view: &OverlayView) {
    let (title, color) = match view {
        OverlayView::Hidden => ("Consultation", Color::DarkGray),
        OverlayView::Modal(_) => ("Call", Color::Cyan),
        OverlayView::Minimized(_) => ("In call (minimized)", Color::Green),
    };
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(color));

    let mut lines: Vec<Line> = Vec::new();
    match view {
        OverlayView::Hidden => lines.push(Line::from(Span::styled(
            "Waiting for calls",
            Style::default().fg(Color::DarkGray),
        ))),
        OverlayView::Modal(modal) => {
            lines.push(Line::from(Span::styled(
                modal.title.clone(),
                Style::default().add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(modal.status_line.clone()));
            if let Some(error) = &modal.error {
                lines.push(Line::from(Span::styled(
                    error.clone(),
                    Style::default().fg(Color::Red),
                )));
            }
            lines.push(Line::from(""));
            for line in describe(view).into_iter().skip(1) {
                lines.push(Line::from(line.trim().to_string()));
            }
        }
        OverlayView::Minimized(_) => {
            for line in describe(view) {
                lines.push(Line::from(line));
            }
        }
    }

    let paragraph = Paragraph::new(lines)
        .block(block)
        .alignment(Alignment::Center);
    f.render_widget(paragraph, area);
}

fn draw_surfaces(f: &mut Frame, area: Rect, target: &TerminalTarget) {
    let block = Block::default().title("Video").borders(Borders::ALL);
    let lines = vec![
        Line::from(format!(
            "Local:  {}",
            target.local.as_deref().unwrap_or("-")
        )),
        Line::from(format!(
            "Remote: {}",
            target.remote.as_deref().unwrap_or("-")
        )),
    ];
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_notices(f: &mut Frame, area: Rect, target: &TerminalTarget) {
    let block = Block::default().title("Notices").borders(Borders::ALL);
    let lines: Vec<Line> = target
        .notices
        .iter()
        .map(|n| Line::from(n.clone()))
        .collect();
    f.render_widget(Paragraph::new(lines).block(block), area);
}

/// Full-screen terminal
pub struct TerminalUI {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalUI {
    /// Enter the alternate screen
    pub fn new() -> Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        Ok(Self { terminal })
    }

    /// Redraw from `target`
    pub fn draw(&mut self, target: &TerminalTarget) -> Result<()> {
        self.terminal.draw(|f| draw(f, target))?;
        Ok(())
    }

    /// Pending key press, without blocking
    pub fn poll_command(&self) -> Result<Option<UiCommand>> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                return Ok(UiCommand::from_key(key.code));
            }
        }
        Ok(None)
    }
}

impl Drop for TerminalUI {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(
            self.terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        );
        let _ = self.terminal.show_cursor();
    }
}

/// Ringer that rings the terminal bell
pub struct TerminalRinger {
    assets: RingtoneAssets,
    playing: AtomicBool,
}

impl TerminalRinger {
    pub fn new(assets: RingtoneAssets) -> Self {
        Self {
            assets,
            playing: AtomicBool::new(false),
        }
    }
}

impl Ringer for TerminalRinger {
    fn play(&self, tone: Ringtone) {
        self.playing.store(true, Ordering::SeqCst);
        tracing::info!(?tone, asset = tone.asset(&self.assets), "Ringing");
        print!("\x07");
    }

    fn stop(&self) {
        if self.playing.swap(false, Ordering::SeqCst) {
            tracing::debug!("Ringtone stopped");
        }
    }
}
