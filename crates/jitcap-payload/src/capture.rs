//! Reacting to compilation events: enumerate, claim, capture, resolve.
//!
//! Every entry point returns a [`CaptureStatus`]; nothing here panics or
//! propagates into the host thread that delivered the notification.

use crate::config::CaptureConfig;
use crate::disasm::{self, TargetDedup};
use crate::error::{CaptureError, Result};
use crate::events::{
    CodeRegion, CompilationEvents, EventSourceError, FunctionId, NameOracle, ReJitId,
};
use crate::memory::ProcessMemory;
use crate::session::Session;
use jitcap_shared::{
    Architecture, FunctionCallTarget, FunctionCode, Message, MessageHeader, MessageSink,
    RequestFunctionCode,
};
use log::{debug, info, trace, warn};
use std::sync::Arc;

/// Per-session capture behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Bracket captures with suspend/resume when the host says blocking is safe
    pub suspend_runtime: bool,
    pub target_dedup: TargetDedup,
}

impl CaptureOptions {
    pub fn new(config: &CaptureConfig, arch: Architecture) -> Self {
        let target_dedup = match arch {
            Architecture::Arm | Architecture::Arm64 if config.arm64_dedup => TargetDedup::PerScan,
            _ => TargetDedup::for_architecture(arch),
        };

        Self {
            suspend_runtime: config.suspend_runtime,
            target_dedup,
        }
    }
}

/// Messages emitted by one capture pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub code_messages: usize,
    pub call_targets: usize,
}

impl CaptureSummary {
    pub fn is_empty(&self) -> bool {
        self.code_messages == 0 && self.call_targets == 0
    }
}

/// Outcome of a capture entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// The pass ran to completion.
    Done(CaptureSummary),
    /// The session ended before or during the pass; remaining work was skipped.
    SessionEnded,
    /// The runtime could not enumerate the function's code.
    Failed,
}

impl CaptureStatus {
    /// Everything except an enumeration failure counts as success.
    pub fn is_success(&self) -> bool {
        !matches!(self, CaptureStatus::Failed)
    }
}

/// What the receive loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Stop,
}

/// Resumes the runtime when dropped, if the suspend succeeded.
struct SuspendGuard<'a> {
    events: &'a dyn CompilationEvents,
    suspended: bool,
}

impl<'a> SuspendGuard<'a> {
    fn enter(events: &'a dyn CompilationEvents) -> Self {
        let suspended = events.suspend_runtime();
        if !suspended {
            debug!("runtime suspend unavailable, capturing without it");
        }
        Self { events, suspended }
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        if self.suspended && !self.events.resume_runtime() {
            warn!("runtime resume failed");
        }
    }
}

/// The capture orchestrator for one session.
pub struct Capture {
    session: Arc<Session>,
    events: Arc<dyn CompilationEvents>,
    names: Arc<dyn NameOracle>,
    memory: Arc<dyn ProcessMemory>,
    sink: Arc<dyn MessageSink>,
    options: CaptureOptions,
}

impl Capture {
    pub fn new(
        session: Arc<Session>,
        events: Arc<dyn CompilationEvents>,
        names: Arc<dyn NameOracle>,
        memory: Arc<dyn ProcessMemory>,
        sink: Arc<dyn MessageSink>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            session,
            events,
            names,
            memory,
            sink,
            options,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// A function finished compiling. `safe_to_block` is the host's hint that
    /// the calling thread may suspend the runtime.
    pub fn on_function_compiled(&self, function: FunctionId, safe_to_block: bool) -> CaptureStatus {
        if self.session.is_ended() {
            return CaptureStatus::SessionEnded;
        }

        if let Some(name) = self.events.function_name(function) {
            trace!("compiled 0x{:X} {}", function, name);
        }

        let _bracket = (self.options.suspend_runtime && safe_to_block)
            .then(|| SuspendGuard::enter(self.events.as_ref()));

        self.capture_function(function, None)
    }

    /// The consumer asked for one generation of a function again.
    pub fn handle_request(&self, request: &RequestFunctionCode) -> CaptureStatus {
        if request.process_id as u32 != self.session.process_id() {
            debug!(
                "ignoring request for process {} (this is {})",
                request.process_id,
                self.session.process_id()
            );
            return CaptureStatus::Done(CaptureSummary::default());
        }

        let Ok(rejit) = ReJitId::try_from(request.rejit_id) else {
            debug!("ignoring request with rejit id {}", request.rejit_id);
            return CaptureStatus::Done(CaptureSummary::default());
        };

        self.capture_function(request.function_id as FunctionId, Some(rejit))
    }

    /// Handle one frame from the receive loop.
    pub fn handle_frame(&self, header: &MessageHeader, body: &[u8]) -> Dispatch {
        match Message::decode(header, body) {
            Ok(Message::EndSession) => {
                info!("consumer ended the session");
                self.session.end();
                Dispatch::Stop
            }
            Ok(Message::RequestFunctionCode(request)) => {
                let status = self.handle_request(&request);
                debug!(
                    "request for 0x{:X} rejit {}: {:?}",
                    request.function_id, request.rejit_id, status
                );
                Dispatch::Continue
            }
            Ok(other) => {
                debug!("ignoring {:?} from consumer", other.kind());
                Dispatch::Continue
            }
            Err(e) => {
                warn!("dropping frame of kind {}: {}", header.kind, e);
                Dispatch::Continue
            }
        }
    }

    fn capture_function(&self, function: FunctionId, only_rejit: Option<ReJitId>) -> CaptureStatus {
        let mut summary = CaptureSummary::default();
        match self.try_capture_function(function, only_rejit, &mut summary) {
            Ok(()) => CaptureStatus::Done(summary),
            Err(CaptureError::SessionEnded) => CaptureStatus::SessionEnded,
            Err(e) => {
                warn!("{}", e);
                CaptureStatus::Failed
            }
        }
    }

    fn try_capture_function(
        &self,
        function: FunctionId,
        only_rejit: Option<ReJitId>,
        summary: &mut CaptureSummary,
    ) -> Result<()> {
        self.check_session()?;

        let enumeration = |source: EventSourceError| CaptureError::Enumeration { function, source };
        let rejits = self.events.rejit_ids(function).map_err(enumeration)?;

        for rejit in rejits {
            if only_rejit.is_some_and(|wanted| wanted != rejit) {
                continue;
            }

            let Ok(rejit_id) = i32::try_from(rejit) else {
                warn!(
                    "rejit id {} of function 0x{:X} does not fit the wire format, skipping",
                    rejit, function
                );
                continue;
            };

            self.check_session()?;
            let starts = self
                .events
                .native_code_starts(function, rejit)
                .map_err(enumeration)?;

            for start in starts {
                self.check_session()?;
                let regions = self.events.code_regions(start).map_err(enumeration)?;

                for region in regions {
                    self.capture_region(function, rejit_id, region, summary)?;
                }
            }
        }

        Ok(())
    }

    fn capture_region(
        &self,
        function: FunctionId,
        rejit_id: i32,
        region: CodeRegion,
        summary: &mut CaptureSummary,
    ) -> Result<()> {
        self.check_session()?;

        if !self.session.sent().try_claim(region.start) {
            trace!("0x{:X} already sent", region.start);
            return Ok(());
        }

        let code = match self.read_code(region) {
            Ok(code) => code,
            Err(e) => {
                warn!("skipping code of function 0x{:X}: {}", function, e);
                return Ok(());
            }
        };

        self.check_session()?;
        let process_id = self.session.process_id() as i32;
        let message = Message::FunctionCode(FunctionCode {
            function_id: function as i64,
            address: region.start as i64,
            rejit_id,
            process_id,
            code: code.clone(),
        });
        if self.sink.send(&message) {
            summary.code_messages += 1;
        } else {
            debug!("FunctionCode for 0x{:X} was not sent", region.start);
        }

        let mut targets = Vec::new();
        disasm::extract_targets(
            &code,
            region.start,
            self.session.architecture(),
            self.options.target_dedup,
            |target| targets.push(target),
        );

        for target in targets {
            self.check_session()?;

            let Some(name) = self.names.resolve(target) else {
                continue;
            };

            let message = Message::FunctionCallTarget(FunctionCallTarget {
                function_id: function as i64,
                address: target as i64,
                rejit_id,
                process_id,
                name,
            });
            if self.sink.send(&message) {
                summary.call_targets += 1;
            }
        }

        Ok(())
    }

    fn read_code(&self, region: CodeRegion) -> Result<Vec<u8>> {
        Ok(self.memory.read(region.start, region.size)?)
    }

    fn check_session(&self) -> Result<()> {
        if self.session.is_ended() {
            Err(CaptureError::SessionEnded)
        } else {
            Ok(())
        }
    }
}
