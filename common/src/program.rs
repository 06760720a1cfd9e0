use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::OperatingState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("program name must not be empty")]
    EmptyName,
    #[error("program `{0}` has no steps")]
    NoSteps(String),
    #[error("program `{name}`: indefinite step {index} must be the last step")]
    IndefiniteStepNotLast { name: String, index: usize },
    #[error("unknown program `{0}`")]
    UnknownProgram(String),
    #[error("program `{0}` is a built-in preset and cannot be replaced")]
    PresetReadOnly(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramStep {
    pub state: OperatingState,
    // Zero holds the state until the program is stopped.
    pub duration_secs: u32,
}

impl ProgramStep {
    pub const fn new(state: OperatingState, duration_secs: u32) -> Self {
        Self {
            state,
            duration_secs,
        }
    }

    pub fn is_indefinite(&self) -> bool {
        self.duration_secs == 0
    }

    fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookingProgram {
    pub name: String,
    pub steps: Vec<ProgramStep>,
    #[serde(default)]
    pub repeat: bool,
}

impl CookingProgram {
    pub fn new(name: impl Into<String>, steps: Vec<ProgramStep>, repeat: bool) -> Self {
        Self {
            name: name.into(),
            steps,
            repeat,
        }
    }

    pub fn validate(&self) -> Result<(), ProgramError> {
        if self.name.trim().is_empty() {
            return Err(ProgramError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(ProgramError::NoSteps(self.name.clone()));
        }

        let last = self.steps.len() - 1;
        if let Some(index) = self
            .steps
            .iter()
            .position(ProgramStep::is_indefinite)
            .filter(|&index| index != last)
        {
            return Err(ProgramError::IndefiniteStepNotLast {
                name: self.name.clone(),
                index,
            });
        }

        Ok(())
    }

    pub fn total_duration_secs(&self) -> u64 {
        self.steps
            .iter()
            .map(|step| u64::from(step.duration_secs))
            .sum()
    }

    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .map(|step| {
                if step.is_indefinite() {
                    step.state.to_string()
                } else {
                    format!("{} {}", step.state, format_duration(step.duration_secs))
                }
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

pub fn format_duration(secs: u32) -> String {
    if secs == 0 {
        return "indefinite".to_string();
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    match (hours, minutes) {
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}

const HOUR: u32 = 3600;

pub fn presets() -> Vec<CookingProgram> {
    use OperatingState::{High, Low, Warm};

    vec![
        CookingProgram::new(
            "Slow Cook",
            vec![
                ProgramStep::new(High, 3 * HOUR),
                ProgramStep::new(Low, 6 * HOUR),
                ProgramStep::new(Warm, 0),
            ],
            false,
        ),
        CookingProgram::new(
            "Quick Warm",
            vec![ProgramStep::new(High, HOUR), ProgramStep::new(Warm, 0)],
            false,
        ),
        CookingProgram::new(
            "All Day",
            vec![ProgramStep::new(Low, 8 * HOUR), ProgramStep::new(Warm, 0)],
            false,
        ),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramLibrary {
    #[serde(default)]
    custom: Vec<CookingProgram>,
}

impl ProgramLibrary {
    pub fn new(custom: Vec<CookingProgram>) -> Self {
        let mut library = Self::default();
        for program in custom {
            if let Err(err) = library.upsert(program) {
                warn!("dropping stored program: {err}");
            }
        }
        library
    }

    pub fn custom(&self) -> &[CookingProgram] {
        &self.custom
    }

    pub fn all(&self) -> Vec<CookingProgram> {
        presets().into_iter().chain(self.custom.iter().cloned()).collect()
    }

    pub fn find(&self, name: &str) -> Result<CookingProgram, ProgramError> {
        presets()
            .into_iter()
            .chain(self.custom.iter().cloned())
            .find(|program| program.name == name)
            .ok_or_else(|| ProgramError::UnknownProgram(name.to_string()))
    }

    pub fn upsert(&mut self, program: CookingProgram) -> Result<(), ProgramError> {
        program.validate()?;
        if presets().iter().any(|preset| preset.name == program.name) {
            return Err(ProgramError::PresetReadOnly(program.name));
        }

        match self.custom.iter_mut().find(|existing| existing.name == program.name) {
            Some(existing) => *existing = program,
            None => self.custom.push(program),
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.custom.len();
        self.custom.retain(|program| program.name != name);
        self.custom.len() != before
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramEvent {
    StepStarted {
        index: usize,
        state: OperatingState,
    },
    Completed {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramStatus {
    pub name: String,
    pub step: usize,
    pub total_steps: usize,
    pub state: OperatingState,
    pub remaining_secs: Option<u64>,
    pub progress: f32,
}

#[derive(Debug, Default)]
pub struct ProgramRunner {
    active: Option<CookingProgram>,
    step_index: usize,
    step_elapsed: Duration,
}

impl ProgramRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&CookingProgram> {
        self.active.as_ref()
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn current_step(&self) -> Option<ProgramStep> {
        self.active
            .as_ref()
            .and_then(|program| program.steps.get(self.step_index).copied())
    }

    pub fn start(&mut self, program: CookingProgram) -> Result<OperatingState, ProgramError> {
        program.validate()?;

        let state = program.steps[0].state;
        info!("starting program '{}': {}", program.name, program.summary());

        self.active = Some(program);
        self.step_index = 0;
        self.step_elapsed = Duration::ZERO;

        Ok(state)
    }

    pub fn stop(&mut self) -> Option<String> {
        self.step_index = 0;
        self.step_elapsed = Duration::ZERO;
        let stopped = self.active.take().map(|program| program.name);
        if let Some(name) = &stopped {
            info!("program '{name}' stopped");
        }
        stopped
    }

    /// Advance the running program by `elapsed`. At most one step boundary
    /// is crossed per call.
    pub fn tick(&mut self, elapsed: Duration) -> Option<ProgramEvent> {
        let step = self.current_step()?;

        self.step_elapsed += elapsed;
        if step.is_indefinite() || self.step_elapsed < step.duration() {
            return None;
        }

        self.advance()
    }

    fn advance(&mut self) -> Option<ProgramEvent> {
        let program = self.active.as_ref()?;

        let mut next = self.step_index + 1;
        if next >= program.steps.len() {
            if !program.repeat {
                let name = self.stop()?;
                info!("program '{name}' complete");
                return Some(ProgramEvent::Completed { name });
            }
            next = 0;
        }

        let state = program.steps[next].state;
        info!(
            "program '{}' step {}/{}: {state}",
            program.name,
            next + 1,
            program.steps.len()
        );

        self.step_index = next;
        self.step_elapsed = Duration::ZERO;
        Some(ProgramEvent::StepStarted { index: next, state })
    }

    pub fn step_remaining_secs(&self) -> Option<u64> {
        let step = self.current_step()?;
        if step.is_indefinite() {
            return None;
        }
        Some(step.duration().saturating_sub(self.step_elapsed).as_secs())
    }

    pub fn step_progress(&self) -> f32 {
        match self.current_step() {
            Some(step) if !step.is_indefinite() => {
                (self.step_elapsed.as_secs_f32() / step.duration().as_secs_f32()).min(1.0)
            }
            _ => 0.0,
        }
    }

    pub fn status(&self) -> Option<ProgramStatus> {
        let program = self.active.as_ref()?;
        let step = self.current_step()?;

        Some(ProgramStatus {
            name: program.name.clone(),
            step: self.step_index + 1,
            total_steps: program.steps.len(),
            state: step.state,
            remaining_secs: self.step_remaining_secs(),
            progress: self.step_progress(),
        })
    }

    pub fn status_text(&self) -> String {
        let Some(status) = self.status() else {
            return "No program".to_string();
        };

        let prefix = format!(
            "{} - Step {}/{}: {}",
            status.name, status.step, status.total_steps, status.state
        );
        match status.remaining_secs {
            Some(remaining) => format!("{prefix} ({}:{:02} left)", remaining / 60, remaining % 60),
            None => format!("{prefix} (indefinite)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SECOND: Duration = Duration::from_secs(1);

    fn two_step(repeat: bool) -> CookingProgram {
        CookingProgram::new(
            "Test",
            vec![
                ProgramStep::new(OperatingState::High, 2),
                ProgramStep::new(OperatingState::Low, 3),
            ],
            repeat,
        )
    }

    #[test]
    fn presets_are_valid_and_end_in_warm() {
        let presets = presets();
        assert_eq!(presets.len(), 3);
        for program in &presets {
            program.validate().unwrap();
            assert_eq!(program.steps.last().unwrap().state, OperatingState::Warm);
        }
        assert_eq!(presets[0].summary(), "HIGH 3h -> LOW 6h -> WARM");
        assert_eq!(presets[0].total_duration_secs(), 9 * 3600);
    }

    #[test]
    fn validation_rejects_malformed_programs() {
        assert_eq!(
            CookingProgram::new("", vec![ProgramStep::new(OperatingState::Low, 0)], false)
                .validate(),
            Err(ProgramError::EmptyName)
        );
        assert_eq!(
            CookingProgram::new("Empty", vec![], false).validate(),
            Err(ProgramError::NoSteps("Empty".to_string()))
        );
        assert_eq!(
            CookingProgram::new(
                "Stuck",
                vec![
                    ProgramStep::new(OperatingState::Warm, 0),
                    ProgramStep::new(OperatingState::High, 60),
                ],
                false
            )
            .validate(),
            Err(ProgramError::IndefiniteStepNotLast {
                name: "Stuck".to_string(),
                index: 0
            })
        );
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(0), "indefinite");
        assert_eq!(format_duration(45 * 60), "45m");
        assert_eq!(format_duration(2 * 3600), "2h");
        assert_eq!(format_duration(3600 + 30 * 60), "1h 30m");
    }

    #[test]
    fn runs_steps_then_completes() {
        let mut runner = ProgramRunner::new();
        assert_eq!(runner.start(two_step(false)).unwrap(), OperatingState::High);

        assert_eq!(runner.tick(SECOND), None);
        assert_eq!(runner.step_remaining_secs(), Some(1));
        assert_eq!(
            runner.tick(SECOND),
            Some(ProgramEvent::StepStarted {
                index: 1,
                state: OperatingState::Low
            })
        );

        assert_eq!(runner.tick(SECOND), None);
        assert_eq!(runner.tick(SECOND), None);
        assert_eq!(
            runner.tick(SECOND),
            Some(ProgramEvent::Completed {
                name: "Test".to_string()
            })
        );
        assert!(!runner.is_active());
        assert_eq!(runner.tick(SECOND), None);
    }

    #[test]
    fn repeating_program_wraps_to_first_step() {
        let mut runner = ProgramRunner::new();
        runner.start(two_step(true)).unwrap();

        for _ in 0..4 {
            runner.tick(SECOND);
        }
        assert_eq!(
            runner.tick(SECOND),
            Some(ProgramEvent::StepStarted {
                index: 0,
                state: OperatingState::High
            })
        );
        assert!(runner.is_active());
    }

    #[test]
    fn indefinite_final_step_holds() {
        let mut runner = ProgramRunner::new();
        let quick_warm = ProgramLibrary::default().find("Quick Warm").unwrap();
        runner.start(quick_warm).unwrap();

        assert!(matches!(
            runner.tick(Duration::from_secs(3600)),
            Some(ProgramEvent::StepStarted {
                state: OperatingState::Warm,
                ..
            })
        ));
        assert_eq!(runner.tick(Duration::from_secs(100_000)), None);
        assert_eq!(runner.step_remaining_secs(), None);
        assert_eq!(runner.step_progress(), 0.0);
        assert_eq!(runner.status_text(), "Quick Warm - Step 2/2: WARM (indefinite)");
    }

    #[test]
    fn status_text_shows_time_left() {
        let mut runner = ProgramRunner::new();
        assert_eq!(runner.status_text(), "No program");

        runner
            .start(ProgramLibrary::default().find("Slow Cook").unwrap())
            .unwrap();
        runner.tick(SECOND);

        assert_eq!(runner.status_text(), "Slow Cook - Step 1/3: HIGH (179:59 left)");
        let progress = runner.step_progress();
        assert!(progress > 0.0 && progress < 0.001);
    }

    #[test]
    fn stop_clears_active_program() {
        let mut runner = ProgramRunner::new();
        runner.start(two_step(false)).unwrap();

        assert_eq!(runner.stop(), Some("Test".to_string()));
        assert_eq!(runner.stop(), None);
        assert_eq!(runner.status(), None);
    }

    #[test]
    fn library_upserts_and_removes_custom_programs() {
        let mut library = ProgramLibrary::default();
        library.upsert(two_step(false)).unwrap();
        library.upsert(two_step(true)).unwrap();

        assert_eq!(library.custom().len(), 1);
        assert!(library.find("Test").unwrap().repeat);
        assert_eq!(library.all().len(), 4);

        assert!(library.remove("Test"));
        assert!(!library.remove("Test"));
        assert_eq!(
            library.find("Test"),
            Err(ProgramError::UnknownProgram("Test".to_string()))
        );
    }

    #[test]
    fn library_refuses_to_shadow_presets() {
        let mut library = ProgramLibrary::default();
        let mut fake = two_step(false);
        fake.name = "All Day".to_string();

        assert_eq!(
            library.upsert(fake),
            Err(ProgramError::PresetReadOnly("All Day".to_string()))
        );
        assert!(!library.remove("All Day"));
    }

    #[test]
    fn library_drops_invalid_stored_programs() {
        let stored = vec![two_step(false), CookingProgram::new("Broken", vec![], false)];
        let library = ProgramLibrary::new(stored);
        assert_eq!(library.custom().len(), 1);
    }
}
