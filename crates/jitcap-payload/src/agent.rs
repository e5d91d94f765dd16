//! Attach/detach lifecycle: connect, announce, receive, shut down.

use crate::capture::{Capture, CaptureOptions, CaptureStatus, Dispatch};
use crate::config::CaptureConfig;
use crate::error::Result;
use crate::events::{CompilationEvents, FunctionId, NameOracle};
use crate::memory::ProcessMemory;
use crate::session::Session;
use jitcap_shared::{Channel, FramedTransport, Message, MessageSink, StartSession};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A live attachment: the session, its transport and the receive thread.
pub struct Agent<C: Channel + 'static> {
    transport: Arc<FramedTransport<C>>,
    capture: Arc<Capture>,
    receiver: Option<JoinHandle<()>>,
}

#[cfg(any(windows, unix))]
impl Agent<jitcap_shared::PlatformChannel> {
    /// The host asked us to attach. Connects to the consumer and starts the session.
    pub fn attach(
        config: &CaptureConfig,
        events: Arc<dyn CompilationEvents>,
        names: Arc<dyn NameOracle>,
        client_data: &[u8],
    ) -> Result<Self> {
        if !client_data.is_empty() {
            debug!("attach client data: {} bytes", client_data.len());
        }

        info!("connecting to {}", config.pipe_name);
        let transport = jitcap_shared::connect(&config.pipe_name, config.send_timeout)?;
        let session = Session::current(crate::machine::current_architecture());

        Self::start(
            transport,
            config,
            session,
            events,
            names,
            Arc::new(crate::memory::LocalMemory),
        )
    }
}

impl<C: Channel + 'static> Agent<C> {
    /// Start a session over an already connected transport.
    pub fn start(
        transport: FramedTransport<C>,
        config: &CaptureConfig,
        session: Session,
        events: Arc<dyn CompilationEvents>,
        names: Arc<dyn NameOracle>,
        memory: Arc<dyn ProcessMemory>,
    ) -> Result<Self> {
        let transport = Arc::new(transport);
        let session = Arc::new(session);
        let options = CaptureOptions::new(config, session.architecture());
        let sink: Arc<dyn MessageSink> = transport.clone();
        let capture = Arc::new(Capture::new(
            session.clone(),
            events,
            names,
            memory,
            sink,
            options,
        ));

        let hello = Message::StartSession(StartSession {
            process_kind: session.architecture().machine() as i32,
            process_id: session.process_id() as i32,
        });
        if !transport.send(&hello) {
            warn!("StartSession was not delivered");
        }

        let receiver = {
            let transport = transport.clone();
            let capture = capture.clone();
            thread::Builder::new()
                .name("jitcap-receive".to_string())
                .spawn(move || receive(&transport, &capture))
                .map_err(jitcap_shared::Error::from)?
        };

        info!(
            "session started: process {}, {:?}",
            session.process_id(),
            session.architecture()
        );

        Ok(Self {
            transport,
            capture,
            receiver: Some(receiver),
        })
    }

    /// Forward a compilation notification from the host.
    pub fn on_function_compiled(&self, function: FunctionId, safe_to_block: bool) -> CaptureStatus {
        self.capture.on_function_compiled(function, safe_to_block)
    }

    pub fn session(&self) -> &Arc<Session> {
        self.capture.session()
    }

    pub fn capture(&self) -> &Capture {
        &self.capture
    }

    /// End the session, drop the connection and wait for the receive thread.
    pub fn detach(&mut self) {
        self.capture.session().end();
        self.transport.disconnect();

        if let Some(receiver) = self.receiver.take() {
            if receiver.join().is_err() {
                warn!("receive thread panicked");
            }
        }
    }
}

impl<C: Channel + 'static> Drop for Agent<C> {
    fn drop(&mut self) {
        self.detach();
    }
}

fn receive<C: Channel>(transport: &FramedTransport<C>, capture: &Capture) {
    let session = capture.session();

    transport.receive_loop(
        |header, body| {
            if capture.handle_frame(&header, &body) == Dispatch::Stop {
                transport.disconnect();
            }
        },
        || session.is_ended(),
    );

    // A broken connection ends the session as well.
    if session.end() {
        info!("connection closed, session ended");
    }
    transport.disconnect();
}
