//! # IQ modules
//!
//! Once a stream is bound, every IQ it receives is offered to its modules in
//! order, and the first module claiming it processes it. A module answers
//! through the [`StreamHandle`][`crate::StreamHandle`] it was built with,
//! which serialises its writes with those of the stream itself.

use std::collections::BTreeSet;

use xmpp_parsers::iq::Iq;

use crate::stanza;

pub mod ping;

/// A feature module handling IQ stanzas on one stream.
///
/// Modules live exactly as long as their stream and are torn down with it
/// through [`done`][`Self::done`].
pub trait IqModule: Send + Sync {
    /// Namespaces handled by this module, used for feature advertisement.
    fn associated_namespaces(&self) -> &[&str];

    /// Whether this module wants to process the request `iq`.
    ///
    /// Must be free of side effects: it may be called any number of times
    /// before the stanza is processed, if at all.
    fn matches_iq(&self, iq: &Iq) -> bool;

    /// Whether `iq` is the response to a request this module sent.
    fn matches_response(&self, _iq: &Iq) -> bool {
        false
    }

    /// Process an IQ this module claimed.
    ///
    /// For requests, exactly one `result` or `error` reply must be sent,
    /// possibly later from a task the module spawned.
    fn process_iq(&self, iq: Iq);

    /// Called once the stream is bound, before any IQ is dispatched.
    fn start(&self) {}

    /// Called for every element received on the bound stream, before it is
    /// dispatched.
    fn on_activity(&self) {}

    /// Release timers and tasks owned by the module. Idempotent, and safe to
    /// call whether or not [`start`][`Self::start`] was ever called.
    fn done(&self);
}

/// The ordered, fixed set of modules of one stream.
#[derive(Default)]
pub struct Modules {
    modules: Vec<Box<dyn IqModule>>,
}

impl Modules {
    /// Dispatch to `modules` in the given order.
    pub fn new(modules: Vec<Box<dyn IqModule>>) -> Self {
        Modules { modules }
    }

    /// Union of the namespaces of all modules.
    pub fn namespaces(&self) -> BTreeSet<&str> {
        self.modules
            .iter()
            .flat_map(|module| module.associated_namespaces().iter().copied())
            .collect()
    }

    /// Hand `iq` to the first module claiming it.
    ///
    /// Requests are claimed by [`IqModule::matches_iq`], responses by
    /// [`IqModule::matches_response`]. The IQ is given back if no module
    /// claims it.
    pub fn dispatch(&self, iq: Iq) -> Result<(), Iq> {
        let is_request = stanza::is_request(&iq);
        let module = self.modules.iter().find(|module| {
            if is_request {
                module.matches_iq(&iq)
            } else {
                module.matches_response(&iq)
            }
        });
        match module {
            Some(module) => {
                module.process_iq(iq);
                Ok(())
            }
            None => Err(iq),
        }
    }

    /// Start all modules.
    pub fn start(&self) {
        for module in &self.modules {
            module.start();
        }
    }

    /// Signal activity on the stream to all modules.
    pub fn on_activity(&self) {
        for module in &self.modules {
            module.on_activity();
        }
    }

    /// Tear all modules down.
    pub fn done(&self) {
        for module in &self.modules {
            module.done();
        }
    }
}

impl Drop for Modules {
    fn drop(&mut self) {
        self.done();
    }
}
