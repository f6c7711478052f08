//! # XEP-0199: XMPP Ping
//!
//! [`Ping`] answers the client's pings and, if configured to, probes the
//! client's liveness with pings of its own. A probe which is not answered
//! within a third of the probe interval terminates the stream with
//! `connection-timeout`. Any traffic from the client counts as an answer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jid::Jid;
use rand::{thread_rng, Rng};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::ping::Ping as PingQuery;
use xmpp_parsers::stanza_error::DefinedCondition;

use crate::config::PingConfig;
use crate::module::IqModule;
use crate::ns;
use crate::stanza;
use crate::stream::StreamHandle;
use crate::stream_error::StreamError;

pub(crate) static PING_PROBE_ID_PREFIX: &str = "c2s-liveness-probe";

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    /// No probe outstanding.
    Idle,
    AwaitingPong {
        id: String,
        deadline: Instant,
    },
    /// The client missed a deadline; the stream is being torn down.
    Failed,
    Stopped,
}

struct ProbeState {
    phase: Phase,
    next_ping: Instant,
}

struct Shared {
    state: Mutex<ProbeState>,
    /// Wakes the prober whenever `state` changed under it.
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The XEP-0199 module of one stream.
pub struct Ping {
    config: PingConfig,
    stream: StreamHandle,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Ping {
    /// Create the module for the stream behind `stream`.
    pub fn new(config: PingConfig, stream: StreamHandle) -> Ping {
        Ping {
            config,
            stream,
            shared: Arc::new(Shared {
                state: Mutex::new(ProbeState {
                    phase: Phase::Idle,
                    next_ping: Instant::now() + config.send_interval,
                }),
                notify: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Whether `to` designates the server itself or the owner of the stream.
    fn is_addressed_to_us(&self, to: Option<&Jid>) -> bool {
        let Some(to) = to else {
            return true;
        };
        if to.node().is_none()
            && to.resource().is_none()
            && to.domain().as_str().eq_ignore_ascii_case(self.stream.domain())
        {
            return true;
        }
        match self.stream.jid() {
            Some(owner) => *to == Jid::from(owner.to_bare()) || *to == Jid::from(owner),
            None => false,
        }
    }

    fn answer(&self, iq: Iq) {
        let reply = if !self.is_addressed_to_us(iq.to.as_ref()) {
            stanza::error_reply(&iq, DefinedCondition::Forbidden)
        } else {
            match &iq.payload {
                IqType::Get(payload) if PingQuery::try_from(payload.clone()).is_ok() => {
                    stanza::result_reply(&iq, None)
                }
                _ => stanza::error_reply(&iq, DefinedCondition::BadRequest),
            }
        };
        if self.stream.send_element(reply.into()).is_err() {
            log::debug!("Ping reply to {} dropped, stream is gone", iq.id);
        }
    }

    fn handle_pong(&self, iq: &Iq) {
        let mut state = self.shared.lock();
        match &state.phase {
            Phase::AwaitingPong { id, .. } if *id == iq.id => {
                log::trace!("Pong {} received", iq.id);
                state.phase = Phase::Idle;
                state.next_ping = Instant::now() + self.config.send_interval;
                drop(state);
                self.shared.notify.notify_one();
            }
            // Inbound traffic already settled the probe.
            _ => log::trace!("Ignoring stale pong {}", iq.id),
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IqModule for Ping {
    fn associated_namespaces(&self) -> &[&str] {
        &[ns::PING]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        stanza::payload(iq)
            .map(|child| child.is("ping", ns::PING))
            .unwrap_or(false)
    }

    fn matches_response(&self, iq: &Iq) -> bool {
        iq.id.starts_with(PING_PROBE_ID_PREFIX)
    }

    fn process_iq(&self, iq: Iq) {
        match iq.payload {
            IqType::Get(_) | IqType::Set(_) => self.answer(iq),
            IqType::Result(_) | IqType::Error(_) => self.handle_pong(&iq),
        }
    }

    fn start(&self) {
        if !self.config.send {
            return;
        }
        let mut task = self.lock_task();
        if task.is_some() {
            return;
        }
        {
            let mut state = self.shared.lock();
            if state.phase != Phase::Idle {
                return;
            }
            state.next_ping = Instant::now() + self.config.send_interval;
        }
        *task = Some(tokio::spawn(probe(
            Arc::clone(&self.shared),
            self.stream.clone(),
            self.config,
        )));
    }

    fn on_activity(&self) {
        if !self.config.send {
            return;
        }
        let mut state = self.shared.lock();
        match state.phase {
            Phase::Idle | Phase::AwaitingPong { .. } => {
                state.phase = Phase::Idle;
                state.next_ping = Instant::now() + self.config.send_interval;
                drop(state);
                self.shared.notify.notify_one();
            }
            Phase::Failed | Phase::Stopped => (),
        }
    }

    fn done(&self) {
        {
            let mut state = self.shared.lock();
            if state.phase != Phase::Failed {
                state.phase = Phase::Stopped;
            }
        }
        self.shared.notify.notify_one();
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
    }
}

impl Drop for Ping {
    fn drop(&mut self) {
        self.done();
    }
}

async fn probe(shared: Arc<Shared>, stream: StreamHandle, config: PingConfig) {
    // Random start to stay clear of ids chosen by the client.
    let mut ping_probe_ctr: u64 = thread_rng().gen();
    loop {
        let (next_ping, deadline) = {
            let state = shared.lock();
            match &state.phase {
                Phase::Idle => (state.next_ping, None),
                Phase::AwaitingPong { deadline, .. } => (state.next_ping, Some(*deadline)),
                Phase::Failed | Phase::Stopped => return,
            }
        };

        tokio::select! {
            biased;
            _ = sleep_until(deadline.unwrap_or(next_ping)), if deadline.is_some() => {
                let mut state = shared.lock();
                match &state.phase {
                    Phase::AwaitingPong { id, deadline } if *deadline <= Instant::now() => {
                        log::info!("No answer to ping {}, disconnecting", id);
                        state.phase = Phase::Failed;
                        drop(state);
                        stream.disconnect(StreamError::ConnectionTimeout);
                        return;
                    }
                    _ => continue,
                }
            }
            _ = sleep_until(next_ping) => {
                let now = Instant::now();
                let mut state = shared.lock();
                if state.next_ping > now {
                    continue;
                }
                state.next_ping = now + config.send_interval;
                match state.phase {
                    Phase::Idle => {
                        ping_probe_ctr = ping_probe_ctr.wrapping_add(1);
                        let id = format!("{}-{}", PING_PROBE_ID_PREFIX, ping_probe_ctr);
                        state.phase = Phase::AwaitingPong {
                            id: id.clone(),
                            deadline: now + config.pong_timeout(),
                        };
                        drop(state);
                        log::trace!("Sending ping {}", id);
                        // No addressing needed on c2s streams.
                        let ping = Iq::from_get(id, PingQuery);
                        if stream.send_element(ping.into()).is_err() {
                            return;
                        }
                    }
                    // The outstanding deadline stays authoritative.
                    Phase::AwaitingPong { .. } => (),
                    Phase::Failed | Phase::Stopped => return,
                }
            }
            _ = shared.notify.notified() => (),
        }
    }
}

#[cfg(test)]
mod tests;
