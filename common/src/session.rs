use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;

use crate::{
    config::DataLogConfig,
    crockpot::{ControlError, Crockpot, CycleReport},
    datalog::DataLog,
    program::{ProgramError, ProgramEvent, ProgramLibrary, ProgramRunner, ProgramStatus},
    relay::RelayActuator,
    types::OperatingState,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("program step could not be applied: {0}")]
    Control(#[from] ControlError),
}

#[derive(Debug)]
pub struct CookSession {
    pub runner: ProgramRunner,
    pub library: ProgramLibrary,
    pub datalog: DataLog,
    // Program step whose state change has not been accepted yet.
    pending: Option<OperatingState>,
}

impl CookSession {
    pub fn new(library: ProgramLibrary, datalog: &DataLogConfig) -> Self {
        Self {
            runner: ProgramRunner::new(),
            library,
            datalog: DataLog::new(datalog),
            pending: None,
        }
    }

    pub fn start_program<R: RelayActuator>(
        &mut self,
        crockpot: &Crockpot<R>,
        name: &str,
    ) -> Result<ProgramStatus, SessionError> {
        let program = self.library.find(name)?;
        let state = self.runner.start(program)?;

        if let Err(err) = crockpot.set_state(state) {
            self.runner.stop();
            return Err(err.into());
        }

        self.pending = None;
        self.sync_datalog();
        self.runner
            .status()
            .ok_or_else(|| ProgramError::UnknownProgram(name.to_string()).into())
    }

    pub fn stop_program(&mut self) -> Option<String> {
        self.pending = None;
        let stopped = self.runner.stop();
        self.sync_datalog();
        stopped
    }

    pub fn after_cycle<R: RelayActuator>(
        &mut self,
        crockpot: &Crockpot<R>,
        report: Option<&CycleReport>,
        elapsed: Duration,
    ) {
        if let Some(shutoff) = report.and_then(|report| report.shutoff) {
            if let Some(name) = self.stop_program() {
                warn!("program '{name}' stopped by safety shutoff: {shutoff}");
            }
        }

        match self.runner.tick(elapsed) {
            Some(ProgramEvent::StepStarted { state, .. }) => self.pending = Some(state),
            Some(ProgramEvent::Completed { name }) => {
                info!("program '{name}' finished");
                self.pending = None;
            }
            None => {}
        }

        if let Some(state) = self.pending {
            match crockpot.set_state(state) {
                Ok(()) => self.pending = None,
                Err(err) => error!("program step to {state} not applied, retrying: {err}"),
            }
        }

        self.sync_datalog();
        let status = crockpot.get_status();
        self.datalog.tick(&status, crockpot.relay_main(), elapsed);
    }

    fn sync_datalog(&mut self) {
        self.datalog.set_program(self.runner.status().as_ref());
    }
}
