//! Operator surface for the vision node.
//!
//! The vision loop shows every scanned frame and asks whether the operator
//! wants to stop. Two surfaces exist:
//!
//! - `HeadlessOperator`: no display, stop on Ctrl+C.
//! - `TerminalPreview`: live preview in the terminal using half-block cells,
//!   with a status line; `q` or Ctrl+C stops.

use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend, buffer::Buffer, layout::Rect, style::Color, widgets::Widget,
    Terminal,
};
use std::fs::OpenOptions;
use std::io::{self, stdout, Stdout, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::Frame;

const KEY_POLL: Duration = Duration::from_millis(1);

pub trait OperatorSurface {
    /// Display a frame. Called once per scanned frame, before inference.
    fn show(&mut self, frame: &Frame) -> Result<()>;

    /// Replace the status text, if the surface has one.
    fn set_status(&mut self, _status: &str) {}

    /// Whether the operator asked to stop.
    fn quit_requested(&mut self) -> Result<bool>;
}

/// No display. Stops when the shared flag is raised.
pub struct HeadlessOperator {
    stop: Arc<AtomicBool>,
}

impl HeadlessOperator {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self { stop }
    }

    /// Raise the stop flag on Ctrl+C. Can only be installed once per process.
    pub fn with_ctrlc() -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            handler_flag.store(true, Ordering::SeqCst);
        })
        .context("install Ctrl+C handler")?;
        Ok(Self::new(stop))
    }
}

impl OperatorSurface for HeadlessOperator {
    fn show(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    fn quit_requested(&mut self) -> Result<bool> {
        Ok(self.stop.load(Ordering::SeqCst))
    }
}

/// Terminal preview. Owns the terminal while alive; dropping it restores the
/// normal screen and cooked mode.
pub struct TerminalPreview {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    status: String,
}

impl TerminalPreview {
    pub fn enter() -> Result<Self> {
        enable_raw_mode().context("enable raw terminal mode")?;
        let mut stdout = stdout();
        if let Err(err) = execute!(stdout, EnterAlternateScreen) {
            let _ = disable_raw_mode();
            return Err(err).context("enter alternate screen");
        }
        let terminal = match Terminal::new(CrosstermBackend::new(stdout)) {
            Ok(terminal) => terminal,
            Err(err) => {
                let _ = leave_preview(&mut io::stdout());
                return Err(err).context("open terminal");
            }
        };
        Ok(Self {
            terminal,
            status: "scanning | q: quit".to_string(),
        })
    }

    fn restore(&mut self) -> io::Result<()> {
        leave_preview(self.terminal.backend_mut())?;
        self.terminal.show_cursor()
    }
}

fn leave_preview<W: Write>(out: &mut W) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(out, LeaveAlternateScreen)
}

/// Log destination while the preview owns the terminal. Records are appended
/// to `path`; on stderr they would draw over the frame.
pub fn preview_log_target(path: &Path) -> Result<env_logger::Target> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;
    Ok(env_logger::Target::Pipe(Box::new(file)))
}

impl OperatorSurface for TerminalPreview {
    fn show(&mut self, frame: &Frame) -> Result<()> {
        let status = self.status.as_str();
        self.terminal
            .draw(|f| {
                let area = f.area();

                // Bottom line is the status bar.
                let frame_area = Rect {
                    x: area.x,
                    y: area.y,
                    width: area.width,
                    height: area.height.saturating_sub(1),
                };
                f.render_widget(FrameView { frame }, frame_area);

                let status_area = Rect {
                    x: area.x,
                    y: area.height.saturating_sub(1),
                    width: area.width,
                    height: 1,
                };
                f.render_widget(StatusBar { message: status }, status_area);
            })
            .context("draw preview")?;
        Ok(())
    }

    fn set_status(&mut self, status: &str) {
        self.status = format!("{} | q: quit", status);
    }

    fn quit_requested(&mut self) -> Result<bool> {
        while event::poll(KEY_POLL).context("poll terminal events")? {
            let Event::Key(key) = event::read().context("read terminal event")? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let ctrl_c =
                key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);
            if ctrl_c || key.code == KeyCode::Char('q') {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Drop for TerminalPreview {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            log::warn!("failed to restore terminal: {}", err);
        }
    }
}

/// Renders a frame with '▀' cells: foreground is the upper pixel, background
/// the lower one, so each cell carries two rows.
struct FrameView<'a> {
    frame: &'a Frame,
}

impl Widget for FrameView<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let frame = self.frame;
        if area.width == 0 || area.height == 0 {
            return;
        }

        let frame_aspect = frame.width as f64 / frame.height as f64;
        let term_width = area.width as f64;
        let term_height = (area.height as f64) * 2.0;

        let (display_width, display_height) = if term_width / term_height > frame_aspect {
            let h = term_height;
            ((h * frame_aspect) as u16, (h / 2.0) as u16)
        } else {
            let w = term_width;
            (w as u16, (w / frame_aspect / 2.0) as u16)
        };
        if display_width == 0 || display_height == 0 {
            return;
        }

        let x_offset = area.x + area.width.saturating_sub(display_width) / 2;
        let y_offset = area.y + area.height.saturating_sub(display_height) / 2;
        let x_scale = frame.width as f64 / display_width as f64;
        let y_scale = frame.height as f64 / (display_height as f64 * 2.0);

        for ty in 0..display_height {
            for tx in 0..display_width {
                let term_x = x_offset + tx;
                let term_y = y_offset + ty;
                if term_x >= area.x + area.width || term_y >= area.y + area.height {
                    continue;
                }

                let src_x = (tx as f64 * x_scale) as u32;
                let src_y_top = (ty as f64 * 2.0 * y_scale) as u32;
                let src_y_bottom = ((ty as f64 * 2.0 + 1.0) * y_scale) as u32;

                let (r, g, b) = frame.rgb_at(src_x, src_y_top);
                let top = Color::Rgb(r, g, b);
                let (r, g, b) = frame.rgb_at(src_x, src_y_bottom);
                let bottom = Color::Rgb(r, g, b);

                if let Some(cell) = buf.cell_mut((term_x, term_y)) {
                    cell.set_char('▀');
                    cell.set_fg(top);
                    cell.set_bg(bottom);
                }
            }
        }
    }
}

struct StatusBar<'a> {
    message: &'a str,
}

impl Widget for StatusBar<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        for x in area.x..area.x + area.width {
            if let Some(cell) = buf.cell_mut((x, area.y)) {
                cell.set_char(' ');
                cell.set_bg(Color::DarkGray);
            }
        }

        let text: String = self.message.chars().take(area.width as usize).collect();
        buf.set_string(
            area.x,
            area.y,
            text,
            ratatui::style::Style::default()
                .fg(Color::White)
                .bg(Color::DarkGray),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Frame::new(data, width, height, 0).unwrap()
    }

    #[test]
    fn headless_follows_stop_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut operator = HeadlessOperator::new(Arc::clone(&stop));
        operator.show(&make_test_frame(2, 2, [0, 0, 0])).unwrap();
        assert!(!operator.quit_requested().unwrap());

        stop.store(true, Ordering::SeqCst);
        assert!(operator.quit_requested().unwrap());
    }

    #[test]
    fn frame_view_fills_cells_with_half_blocks() {
        let frame = make_test_frame(8, 8, [200, 10, 20]);
        let area = Rect::new(0, 0, 4, 2);
        let mut buf = Buffer::empty(area);
        FrameView { frame: &frame }.render(area, &mut buf);

        let cell = &buf[(0u16, 0u16)];
        assert_eq!(cell.symbol(), "▀");
        assert_eq!(cell.fg, Color::Rgb(200, 10, 20));
        assert_eq!(cell.bg, Color::Rgb(200, 10, 20));
    }

    #[test]
    fn status_bar_truncates_to_width() {
        let area = Rect::new(0, 0, 5, 1);
        let mut buf = Buffer::empty(area);
        StatusBar {
            message: "published ripe",
        }
        .render(area, &mut buf);
        assert_eq!(buf[(4u16, 0u16)].symbol(), "i");
    }

    #[test]
    fn leave_preview_restores_main_screen() {
        let mut out = Vec::new();
        leave_preview(&mut out).unwrap();
        let written = String::from_utf8(out).unwrap();
        assert!(written.contains("\x1b[?1049l"), "{written:?}");
    }

    #[test]
    fn preview_logs_go_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vision_node.log");

        let target = preview_log_target(&path).unwrap();
        let env_logger::Target::Pipe(mut pipe) = target else {
            panic!("expected a pipe target");
        };
        pipe.write_all(b"published ripe\n").unwrap();
        pipe.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "published ripe\n");

        assert!(preview_log_target(&dir.path().join("missing/dir.log")).is_err());
    }
}
