use crate::{Metrics, MetricsSnapshot, RateCounter, Readout};
use anyhow::Result;
use crossbeam_channel::tick;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::info;
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Status {
    pub counter: RateCounter,
    pub t_begin: Instant,
    pub snapshot: MetricsSnapshot,
    metrics: Arc<Metrics>,
    pub exit: Option<StatusExit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusExit {
    Quit,
    Finished,
}

impl Status {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            counter: RateCounter::default(),
            t_begin: Instant::now(),
            snapshot: metrics.snapshot(),
            metrics,
            exit: None,
        }
    }

    /// Redraw once a second until the run ends or `q` is pressed, in which
    /// case the run is stopped.
    pub fn run(&mut self, terminal: &mut DefaultTerminal, readout: &mut Readout) -> Result<StatusExit> {
        let ticker = tick(Duration::from_secs(1));
        self.t_begin = Instant::now();
        self.counter.reset();
        self.exit = None;

        while self.exit.is_none() {
            let _ = ticker.recv();
            self.refresh();
            self.handle_events()?;
            if self.exit.is_none() && readout.is_finished() {
                self.exit = Some(StatusExit::Finished);
            }
            terminal.draw(|f| self.draw(f))?;
        }

        if self.exit == Some(StatusExit::Quit) {
            info!("Quit requested, stopping run {}", readout.run_number());
        }
        readout.set_running(false)?;
        self.refresh();
        terminal.draw(|f| self.draw(f))?;
        Ok(self.exit.unwrap_or(StatusExit::Finished))
    }

    pub fn refresh(&mut self) {
        self.snapshot = self.metrics.snapshot();
        self.counter.update_total(self.snapshot.bytes_received);
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event);
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            self.exit = Some(StatusExit::Quit);
        }
    }
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let s = &self.snapshot;
        let state = if s.running { "running" } else { "stopped" };
        let title = Line::from(
            format!(" Run {} Subrun {} Status ({state}) ", s.run_number, s.subrun).bold(),
        );
        let instructions = Line::from(vec![" Quit ".into(), "<Q> ".blue().bold()]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let errors = if s.error_bits == 0 {
            "none".to_string().green()
        } else {
            format!("0x{:02x}", s.error_bits).red()
        };
        let status_text = Text::from(vec![
            Line::from(vec![
                "Elapsed time: ".into(),
                self.t_begin.elapsed().as_secs().to_string().yellow(),
                " s".into(),
                " Events: ".into(),
                s.events.to_string().yellow(),
                " Files: ".into(),
                s.files.to_string().yellow(),
                " DMA loops: ".into(),
                s.dma_loops.to_string().yellow(),
            ]),
            Line::from(vec![
                "Data rate: ".into(),
                format!("{:.2}", self.counter.rate()).yellow(),
                " MB/s ".into(),
                " Received: ".into(),
                format!("{:.2}", s.megabytes_received).yellow(),
                " MB ".into(),
                " Avg chunk: ".into(),
                format!("{:.0}", s.avg_chunk_words).yellow(),
                " words".into(),
            ]),
            Line::from(vec![
                "Markers start/end: ".into(),
                format!("{}/{}", s.start_markers, s.end_markers).yellow(),
                " Overflows: ".into(),
                s.overflows.to_string().yellow(),
                " Truncated: ".into(),
                s.truncated_events.to_string().yellow(),
                " Oversized: ".into(),
                s.oversized_events.to_string().yellow(),
            ]),
            Line::from(vec![
                "PPS samples: ".into(),
                s.pps_samples.to_string().yellow(),
                " SW triggers: ".into(),
                s.software_triggers.to_string().yellow(),
                " Errors: ".into(),
                errors,
            ]),
        ]);

        Paragraph::new(status_text)
            .centered()
            .block(block)
            .render(area, buf);
    }
}
