//! The outgoing session state machine.
//!
//! One session task per `(local domain, remote domain)` pair, owning its
//! socket exclusively. The task walks the negotiation states (connect,
//! stream opening, optional STARTTLS and SASL EXTERNAL, Server Dialback)
//! and then relays stanzas. Stanzas arriving before `stream_established`
//! queue in order and are flushed on establishment; any queue remaining at
//! termination is bounced with `remote-server-not-found`.
//!
//! Connect failures put the session into `wait_before_retry`: the queue is
//! bounced, a backoff timer is armed (doubling per failure inside one
//! session, capped by `s2s_max_retry_delay`), and timer expiry terminates
//! the session so the next outbound stanza starts a fresh one.

use std::collections::VecDeque;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minidom::Element;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::stream_error_xml;
use crate::parser::{build_stream_open, ns, StreamEvent, StreamFeatures, StreamHeader};
use crate::s2s::dialback;
use crate::s2s::registry::{OutgoingRegistry, SessionKey, VerifyOutcome};
use crate::s2s::transport::Transport;
use crate::s2s::{SessionFlags, SessionRole, SessionState};

use std::sync::Arc;

/// Commands accepted on a session's mailbox.
#[derive(Debug)]
pub enum SessionCommand {
    /// Relay (or queue) an outbound stanza.
    Send(Element),
    /// Terminate now if the session is sitting out a retry delay.
    TerminateIfWaiting,
    /// Terminate unconditionally.
    Stop,
}

/// Why the negotiation loop ended.
enum Exit {
    /// Tear the session down (socket may already be gone).
    Terminate,
    /// Close the socket and reconnect with the current flags.
    Reconnect,
    /// Connect-level failure: back off before giving up.
    Backoff,
}

/// What the event handlers ask the driver loop to do next.
enum Action {
    Stay,
    Goto(SessionState),
    /// Upgrade the socket to TLS, then reopen the stream.
    UpgradeTls,
    Flush,
    Exit(Exit),
}

/// Draw the next retry delay: uniform in [1000, 15000] ms on the first
/// failure, doubling afterwards, capped at `max`.
pub(crate) fn next_retry_delay<R: Rng + ?Sized>(
    previous: Option<Duration>,
    max: Duration,
    rng: &mut R,
) -> Duration {
    let delay = match previous {
        None => Duration::from_millis(rng.random_range(1000..15000)),
        Some(previous) => previous.saturating_mul(2),
    };
    delay.min(max)
}

pub(crate) struct OutgoingSession {
    id: u64,
    pair: SessionKey,
    role: SessionRole,
    registry: Arc<OutgoingRegistry>,
    state: SessionState,
    flags: SessionFlags,
    queue: VecDeque<Element>,
    retry_delay: Option<Duration>,
    /// Stream id assigned by the peer on the current stream.
    remote_stream_id: Option<String>,
    /// Where verifier sessions report their verdict.
    verify_reply: Option<mpsc::Sender<VerifyOutcome>>,
}

impl OutgoingSession {
    pub(crate) fn new(
        id: u64,
        pair: SessionKey,
        role: SessionRole,
        registry: Arc<OutgoingRegistry>,
        verify_reply: Option<mpsc::Sender<VerifyOutcome>>,
    ) -> Self {
        Self {
            id,
            pair,
            role,
            registry,
            state: SessionState::OpenSocket,
            flags: SessionFlags::default(),
            queue: VecDeque::new(),
            retry_delay: None,
            remote_stream_id: None,
            verify_reply,
        }
    }

    /// Session task entry point.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        let metrics = self.registry.metrics();
        metrics.record_session_started();
        if self.role.is_verify() {
            metrics.record_verify_session();
        } else if self.registry.try_register(&self.pair, self.id).is_none() {
            // Another session won the slot between spawn and startup; the
            // winner carries the pair, nothing to bounce yet.
            debug!(pair = %self.pair, id = self.id, "lost registration race");
            metrics.record_session_closed();
            return;
        }

        self.drive(&mut rx).await;

        if !self.role.is_verify() {
            self.registry.remove_connection(&self.pair, self.id);
        }
        self.bounce_queue().await;
        metrics.record_session_closed();
        info!(pair = %self.pair, id = self.id, state = %self.state, "session terminated");
    }

    /// Reconnect loop around one negotiation attempt.
    async fn drive(&mut self, rx: &mut mpsc::Receiver<SessionCommand>) {
        loop {
            self.state = SessionState::OpenSocket;
            self.flags.tls_enabled = false;
            self.remote_stream_id = None;

            let transport = match self.open_socket().await {
                Some(transport) => transport,
                None => match self.wait_before_retry(rx).await {
                    // Retry expiry and explicit termination both end the
                    // session; a fresh one is spawned on the next send.
                    Exit::Terminate | Exit::Backoff => return,
                    Exit::Reconnect => continue,
                },
            };

            match self.negotiate(transport, rx).await {
                Exit::Terminate => return,
                Exit::Reconnect => continue,
                Exit::Backoff => match self.wait_before_retry(rx).await {
                    Exit::Terminate | Exit::Backoff => return,
                    Exit::Reconnect => continue,
                },
            }
        }
    }

    /// Resolve and connect; `None` on total failure.
    async fn open_socket(&mut self) -> Option<Transport> {
        let config = self.registry.config();
        let candidates = self.registry.connect_candidates(&self.pair.remote).await;
        if candidates.is_empty() {
            warn!(remote = %self.pair.remote, "no connect candidates");
            return None;
        }

        match Transport::connect(
            &candidates,
            config.local_address,
            config.connect_timeout,
            config.send_timeout,
        )
        .await
        {
            Ok(transport) => Some(transport),
            Err(error) => {
                warn!(remote = %self.pair.remote, error = %error, "connect failed");
                None
            }
        }
    }

    /// Run one stream's negotiation and relay phase.
    async fn negotiate(
        &mut self,
        mut transport: Transport,
        rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> Exit {
        let open = build_stream_open(&self.pair.local, &self.pair.remote, self.flags.use_v10);
        if transport.send_raw(open.as_bytes()).await.is_err() {
            return Exit::Backoff;
        }
        self.state = SessionState::WaitForStream;

        let config = self.registry.config();
        let mut state_deadline = self.deadline_for(self.state);
        let mut idle_deadline = Instant::now() + config.idle_timeout;

        enum Input {
            Event(Option<StreamEvent>),
            ReadError(crate::error::XmppError),
            Command(Option<SessionCommand>),
            Timeout,
        }

        loop {
            let sleep_at = if self.state == SessionState::StreamEstablished {
                idle_deadline
            } else {
                state_deadline
            };

            let input = tokio::select! {
                event = transport.read_event() => match event {
                    Ok(event) => Input::Event(event),
                    Err(error) => Input::ReadError(error),
                },
                command = rx.recv() => Input::Command(command),
                _ = sleep_until(sleep_at) => Input::Timeout,
            };

            let action = match input {
                Input::Event(Some(event)) => self.handle_event(event, &mut transport).await,
                Input::Event(None) => {
                    debug!(pair = %self.pair, "peer closed the socket");
                    Action::Exit(Exit::Terminate)
                }
                Input::ReadError(error) => {
                    warn!(pair = %self.pair, error = %error, "stream read failed");
                    Action::Exit(Exit::Terminate)
                }
                Input::Command(Some(SessionCommand::Send(stanza))) => {
                    if self.state == SessionState::StreamEstablished {
                        if transport.send_element(&stanza).await.is_err() {
                            self.queue.push_back(stanza);
                            Action::Exit(Exit::Terminate)
                        } else {
                            self.registry.metrics().record_stanza_relayed();
                            idle_deadline = Instant::now() + config.idle_timeout;
                            Action::Stay
                        }
                    } else if self.queue.len() >= config.max_fsm_queue {
                        warn!(pair = %self.pair, "pending queue overflow");
                        self.queue.push_back(stanza);
                        Action::Exit(Exit::Terminate)
                    } else {
                        self.queue.push_back(stanza);
                        Action::Stay
                    }
                }
                Input::Command(Some(SessionCommand::TerminateIfWaiting)) => Action::Stay,
                Input::Command(Some(SessionCommand::Stop)) | Input::Command(None) => {
                    Action::Exit(Exit::Terminate)
                }
                Input::Timeout => {
                    if self.state == SessionState::StreamEstablished {
                        info!(pair = %self.pair, "idle watchdog expired");
                    } else {
                        warn!(pair = %self.pair, state = %self.state, "negotiation timed out");
                    }
                    Action::Exit(Exit::Terminate)
                }
            };

            match action {
                Action::Stay => {}
                Action::Goto(state) => {
                    self.state = state;
                    state_deadline = self.deadline_for(state);
                }
                Action::UpgradeTls => {
                    let connector = match self.registry.tls_connector(&self.pair.local) {
                        Ok(connector) => connector,
                        Err(error) => {
                            warn!(pair = %self.pair, error = %error, "TLS setup failed");
                            transport.close().await;
                            return Exit::Terminate;
                        }
                    };
                    transport = match transport.upgrade_tls(&connector, &self.pair.remote).await {
                        Ok(transport) => transport,
                        Err(error) => {
                            warn!(pair = %self.pair, error = %error, "TLS handshake failed");
                            return Exit::Terminate;
                        }
                    };
                    self.flags.tls_enabled = true;
                    let open =
                        build_stream_open(&self.pair.local, &self.pair.remote, self.flags.use_v10);
                    if transport.send_raw(open.as_bytes()).await.is_err() {
                        return Exit::Terminate;
                    }
                    self.state = SessionState::WaitForStream;
                    state_deadline = self.deadline_for(self.state);
                }
                Action::Flush => {
                    self.state = SessionState::StreamEstablished;
                    self.registry.metrics().record_session_established();
                    info!(pair = %self.pair, queued = self.queue.len(), "stream established");
                    while let Some(stanza) = self.queue.pop_front() {
                        if transport.send_element(&stanza).await.is_err() {
                            self.queue.push_front(stanza);
                            return Exit::Terminate;
                        }
                        self.registry.metrics().record_stanza_relayed();
                    }
                    idle_deadline = Instant::now() + config.idle_timeout;
                }
                Action::Exit(exit) => {
                    match exit {
                        Exit::Terminate | Exit::Backoff => transport.close().await,
                        Exit::Reconnect => {
                            self.state = SessionState::ReopenSocket;
                            transport.close().await;
                        }
                    }
                    return exit;
                }
            }
        }
    }

    /// One stream event against the current state.
    async fn handle_event(&mut self, event: StreamEvent, transport: &mut Transport) -> Action {
        match (self.state, event) {
            (SessionState::WaitForStream, StreamEvent::StreamStart(header)) => {
                self.handle_stream_start(header, transport).await
            }

            (SessionState::WaitForFeatures, StreamEvent::Features(features)) => {
                self.handle_features(features, transport).await
            }

            (SessionState::WaitForAuthResult, StreamEvent::SaslSuccess) => {
                debug!(pair = %self.pair, "SASL EXTERNAL succeeded");
                self.flags.authenticated = true;
                transport.reset_framer();
                let open =
                    build_stream_open(&self.pair.local, &self.pair.remote, self.flags.use_v10);
                if transport.send_raw(open.as_bytes()).await.is_err() {
                    return Action::Exit(Exit::Terminate);
                }
                Action::Goto(SessionState::WaitForStream)
            }
            (SessionState::WaitForAuthResult, StreamEvent::SaslFailure) => {
                debug!(pair = %self.pair, "SASL EXTERNAL refused, falling back");
                self.flags.may_try_auth = false;
                Action::Exit(Exit::Reconnect)
            }

            (SessionState::WaitForStarttlsProceed, StreamEvent::TlsProceed) => Action::UpgradeTls,
            (SessionState::WaitForStarttlsProceed, StreamEvent::TlsFailure) => {
                warn!(pair = %self.pair, "peer refused STARTTLS");
                Action::Exit(Exit::Terminate)
            }

            (SessionState::WaitForValidation, StreamEvent::DialbackResult { result_type, .. }) => {
                match result_type.as_deref() {
                    Some("valid") => {
                        self.flags.authenticated = true;
                        Action::Flush
                    }
                    Some(other) => {
                        warn!(pair = %self.pair, verdict = %other, "dialback refused");
                        Action::Exit(Exit::Terminate)
                    }
                    None => Action::Stay,
                }
            }
            (
                SessionState::WaitForValidation,
                StreamEvent::DialbackVerify {
                    from,
                    to,
                    id,
                    key,
                    result_type,
                },
            ) => {
                match result_type {
                    Some(verdict) if self.role.is_verify() => {
                        self.forward_verify_outcome(verdict == "valid").await;
                        Action::Exit(Exit::Terminate)
                    }
                    Some(_) => Action::Stay,
                    // A verification request arriving on our own stream:
                    // answer for the key we issued.
                    None => {
                        self.answer_verify_request(&from, &to, &id, key.as_deref(), transport)
                            .await
                    }
                }
            }

            (
                SessionState::StreamEstablished,
                StreamEvent::DialbackVerify {
                    from,
                    to,
                    id,
                    key,
                    result_type: None,
                },
            ) => {
                self.answer_verify_request(&from, &to, &id, key.as_deref(), transport)
                    .await
            }
            (SessionState::StreamEstablished, StreamEvent::Stanza(stanza)) => {
                if let Err(error) = self.registry.router().deliver(stanza).await {
                    warn!(pair = %self.pair, error = %error, "inbound delivery failed");
                }
                Action::Stay
            }

            (_, StreamEvent::StreamEnd) => Action::Exit(Exit::Terminate),
            (_, StreamEvent::StreamError { condition }) => {
                warn!(pair = %self.pair, condition = %condition, "peer sent stream error");
                Action::Exit(Exit::Terminate)
            }

            (state, event) => {
                debug!(pair = %self.pair, state = %state, event = ?event, "ignoring event");
                Action::Stay
            }
        }
    }

    async fn handle_stream_start(
        &mut self,
        header: StreamHeader,
        transport: &mut Transport,
    ) -> Action {
        if let Some(default_ns) = header.default_ns.as_deref() {
            if default_ns != ns::JABBER_SERVER {
                let _ = transport
                    .send_raw(stream_error_xml("invalid-namespace").as_bytes())
                    .await;
                return Action::Exit(Exit::Terminate);
            }
        }

        self.remote_stream_id = header.id.clone();
        self.flags.dialback_enabled = header.dialback;

        if let SessionRole::Verify {
            key, stream_id, ..
        } = &self.role
        {
            // Verifier sub-sessions ask their question as soon as the
            // stream is open; no features dance.
            let verify = dialback::build_verify(
                &self.pair.local,
                &self.pair.remote,
                stream_id,
                key,
            );
            if transport.send_raw(verify.as_bytes()).await.is_err() {
                return Action::Exit(Exit::Terminate);
            }
            return Action::Goto(SessionState::WaitForValidation);
        }

        if header.supports_v10() && self.flags.use_v10 {
            return Action::Goto(SessionState::WaitForFeatures);
        }

        if header.dialback {
            return self.send_dialback_key(transport).await;
        }

        warn!(pair = %self.pair, "peer offers neither XMPP 1.0 nor dialback");
        Action::Exit(Exit::Terminate)
    }

    async fn handle_features(
        &mut self,
        features: StreamFeatures,
        transport: &mut Transport,
    ) -> Action {
        let config = self.registry.config();
        self.flags.tls_offered |= features.starttls;
        self.flags.tls_required = features.starttls_required;

        if features.offers_external()
            && self.flags.may_try_auth
            && self.flags.tls_enabled
            && !self.role.is_verify()
        {
            let auth = format!(
                "<auth xmlns='{}' mechanism='EXTERNAL'>{}</auth>",
                ns::SASL,
                BASE64.encode(self.pair.local.as_bytes())
            );
            if transport.send_raw(auth.as_bytes()).await.is_err() {
                return Action::Exit(Exit::Terminate);
            }
            return Action::Goto(SessionState::WaitForAuthResult);
        }

        if features.starttls && config.use_starttls.allows_tls() && !self.flags.tls_enabled {
            let starttls = format!("<starttls xmlns='{}'/>", ns::TLS);
            if transport.send_raw(starttls.as_bytes()).await.is_err() {
                return Action::Exit(Exit::Terminate);
            }
            return Action::Goto(SessionState::WaitForStarttlsProceed);
        }

        if features.starttls_required && !config.use_starttls.allows_tls() {
            // The peer insists on TLS we will not do; drop back to a
            // pre-1.0 stream where only dialback is on the table.
            info!(pair = %self.pair, "peer requires STARTTLS, retrying pre-1.0");
            self.flags.use_v10 = false;
            return Action::Exit(Exit::Reconnect);
        }

        if self.flags.authenticated {
            return Action::Flush;
        }

        if features.dialback || self.flags.dialback_enabled {
            return self.send_dialback_key(transport).await;
        }

        warn!(pair = %self.pair, "no usable authentication offered");
        Action::Exit(Exit::Terminate)
    }

    async fn send_dialback_key(&mut self, transport: &mut Transport) -> Action {
        let key = match &self.role {
            SessionRole::New { key } => key.clone(),
            SessionRole::Verify { .. } => {
                return Action::Exit(Exit::Terminate);
            }
        };
        let result = dialback::build_result(&self.pair.local, &self.pair.remote, &key);
        if transport.send_raw(result.as_bytes()).await.is_err() {
            return Action::Exit(Exit::Terminate);
        }
        Action::Goto(SessionState::WaitForValidation)
    }

    /// Answer a `db:verify` request received on this stream: the peer is
    /// checking a key we issued for the pair named in the request.
    async fn answer_verify_request(
        &mut self,
        from: &str,
        to: &str,
        id: &str,
        key: Option<&str>,
        transport: &mut Transport,
    ) -> Action {
        let pair = SessionKey::new(to, from);
        let valid = key
            .map(|key| self.registry.has_key(&pair, key))
            .unwrap_or(false);
        let response = dialback::build_verify_response(to, from, id, valid);
        if transport.send_raw(response.as_bytes()).await.is_err() {
            return Action::Exit(Exit::Terminate);
        }
        Action::Stay
    }

    async fn forward_verify_outcome(&mut self, valid: bool) {
        if let (SessionRole::Verify { request_id, .. }, Some(reply)) =
            (&self.role, self.verify_reply.as_ref())
        {
            let outcome = VerifyOutcome {
                request_id: request_id.clone(),
                local: self.pair.local.clone(),
                remote: self.pair.remote.clone(),
                valid,
            };
            if reply.send(outcome).await.is_err() {
                debug!(pair = %self.pair, "verify requester went away");
            }
        }
    }

    /// Hold in `wait_before_retry`: bounce the queue, arm the timer, and
    /// terminate when it fires or when the registry broadcasts
    /// `terminate_if_waiting_delay`.
    async fn wait_before_retry(&mut self, rx: &mut mpsc::Receiver<SessionCommand>) -> Exit {
        if self.role.is_verify() {
            // Verifiers never retry; their requester has its own deadline.
            return Exit::Terminate;
        }

        let config = self.registry.config();
        let delay = next_retry_delay(self.retry_delay, config.max_retry_delay, &mut rand::rng());
        self.retry_delay = Some(delay);
        self.state = SessionState::WaitBeforeRetry;
        self.bounce_queue().await;

        info!(pair = %self.pair, delay_ms = delay.as_millis() as u64, "waiting before retry");
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Exit::Terminate,
                command = rx.recv() => match command {
                    Some(SessionCommand::Send(stanza)) => {
                        // Bounced at termination; no silent loss.
                        self.queue.push_back(stanza);
                    }
                    Some(SessionCommand::TerminateIfWaiting)
                    | Some(SessionCommand::Stop)
                    | None => return Exit::Terminate,
                },
            }
        }
    }

    async fn bounce_queue(&mut self) {
        while let Some(stanza) = self.queue.pop_front() {
            self.registry.bounce(stanza).await;
        }
    }

    fn deadline_for(&self, state: SessionState) -> Instant {
        let config = self.registry.config();
        match state.timeout_factor() {
            Some(factor) => Instant::now() + config.state_timeout * factor,
            None => Instant::now() + config.idle_timeout,
        }
    }
}
