//! Monitor application state and logic.

use crate::asm::{format_action, Program};
use crate::config::MachineConfig;
use crate::machine::{Machine, MachineError};

/// Steps taken per frame while running.
const STEPS_PER_FRAME: usize = 4;

/// Monitor application state.
pub struct MonitorApp {
    /// The machine being watched.
    pub machine: Machine,
    /// Program loaded on every reset.
    pub program: Program,
    /// Is the machine stepping continuously?
    pub running: bool,
    /// Should we quit?
    pub should_quit: bool,
    /// Status message to display.
    pub status: String,
    /// Data view scroll offset.
    pub data_scroll: usize,
    /// Set once the machine stopped with an error; stepping is refused until reset.
    pub failed: bool,
}

impl MonitorApp {
    /// Build a machine from `config` and load `program` into it.
    pub fn new(config: MachineConfig, program: Program) -> Result<Self, MachineError> {
        let mut machine = Machine::new(config)?;
        machine.load(&program)?;

        Ok(Self {
            machine,
            program,
            running: false,
            should_quit: false,
            status: "Ready. Press 's' to step, 'r' to run, 'q' to quit.".into(),
            data_scroll: 0,
            failed: false,
        })
    }

    /// Step the machine once.
    pub fn step(&mut self) {
        if self.failed {
            self.running = false;
            return;
        }
        if self.machine.is_idle() {
            self.status = format!("Idle after {} steps", self.machine.steps());
            self.running = false;
            return;
        }

        match self.machine.step() {
            Ok(()) => {
                self.status = match self.last_action() {
                    Some(text) => format!("step {}: {}", self.machine.steps(), text),
                    None => format!("step {}", self.machine.steps()),
                };
            }
            Err(e) => {
                self.status = format!("Error: {}", e);
                self.running = false;
                self.failed = true;
            }
        }
    }

    /// Run until idle or error.
    pub fn run(&mut self) {
        self.running = true;
        self.status = "Running...".into();
    }

    pub fn pause(&mut self) {
        self.running = false;
        self.status = "Paused.".into();
    }

    /// One frame of continuous execution.
    pub fn tick(&mut self) {
        for _ in 0..STEPS_PER_FRAME {
            if !self.running {
                return;
            }
            self.step();
        }
    }

    /// Rebuild the machine and reload the program.
    pub fn reset(&mut self) {
        let config = self.machine.config().clone();
        match Machine::new(config).and_then(|mut m| m.load(&self.program).map(|_| m)) {
            Ok(machine) => {
                self.machine = machine;
                self.failed = false;
                self.status = "Reset. Ready.".into();
            }
            Err(e) => self.status = format!("Error: {}", e),
        }
        self.running = false;
    }

    pub fn scroll_up(&mut self) {
        self.data_scroll = self.data_scroll.saturating_sub(1);
    }

    pub fn scroll_down(&mut self) {
        if self.data_scroll + 1 < self.machine.memory().data_len() {
            self.data_scroll += 1;
        }
    }

    /// Recently executed actions as assembly text, newest first.
    pub fn recent_actions(&self, lines: usize) -> Vec<String> {
        let names = &self.machine.config().registers;
        let history: Vec<_> = self.machine.cpu().history().collect();
        history
            .iter()
            .rev()
            .take(lines)
            .map(|action| format_action(action, names))
            .collect()
    }

    fn last_action(&self) -> Option<String> {
        self.recent_actions(1).pop()
    }
}

/// Run the monitor on a program.
pub fn run_monitor(config: MachineConfig, program: Program) -> Result<(), MachineError> {
    let mut app = MonitorApp::new(config, program)?;
    terminal_loop(&mut app).map_err(|e| MachineError::IoError(e.to_string()))
}

fn terminal_loop(app: &mut MonitorApp) -> std::io::Result<()> {
    use crossterm::{
        event::{self, Event, KeyCode, KeyEventKind},
        terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
        ExecutableCommand,
    };
    use ratatui::prelude::*;
    use std::io::stdout;
    use std::time::Duration;

    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    loop {
        terminal.draw(|frame| {
            super::ui::draw(frame, app);
        })?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') => app.should_quit = true,
                        KeyCode::Char('s') => {
                            app.running = false;
                            app.step();
                        }
                        KeyCode::Char('r') => app.run(),
                        KeyCode::Char('p') => app.pause(),
                        KeyCode::Char('x') => app.reset(),
                        KeyCode::Up => app.scroll_up(),
                        KeyCode::Down => app.scroll_down(),
                        _ => {}
                    }
                }
            }
        }

        if app.running {
            app.tick();
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(())
}
