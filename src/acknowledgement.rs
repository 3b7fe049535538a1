use std::sync::{Arc, Mutex};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::shutdown::ShutdownSignal;

/// Tracks outstanding reliable sends by message id, resolving them when a matching
///  acknowledgement arrives.
#[derive(Default, Clone)]
pub struct AcknowledgementCoordinator {
    expectations: Arc<Mutex<FxHashMap<Uuid, oneshot::Sender<()>>>>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExpectationOutcome {
    Acknowledged,
    Cancelled,
}

impl AcknowledgementCoordinator {
    pub fn new() -> AcknowledgementCoordinator {
        Default::default()
    }

    /// Register interest in the acknowledgement for a message id. There can be at most one
    ///  registration per id at any given time.
    pub fn expect(&self, message_id: Uuid, cancellation: ShutdownSignal) -> anyhow::Result<Expectation> {
        let (tx, rx) = oneshot::channel();

        let mut expectations = self.expectations.lock().unwrap();
        if expectations.contains_key(&message_id) {
            bail!("there is already an acknowledgement expectation for message {}", message_id);
        }
        expectations.insert(message_id, tx);
        trace!("expecting acknowledgement for {}", message_id);

        Ok(Expectation {
            message_id,
            rx,
            cancellation,
            outcome: None,
            coordinator: self.clone(),
        })
    }

    /// Resolve the expectation for a message id. Returns `false` if there was none, i.e. for
    ///  duplicate or late acknowledgements.
    pub fn on_acknowledgement(&self, message_id: Uuid) -> bool {
        let sender = self.expectations.lock().unwrap().remove(&message_id);
        match sender {
            Some(sender) => {
                trace!("acknowledgement for {}", message_id);
                let _ = sender.send(());
                true
            }
            None => {
                debug!("acknowledgement for {} without expectation - ignoring", message_id);
                false
            }
        }
    }

    pub fn num_expected(&self) -> usize {
        self.expectations.lock().unwrap().len()
    }
}

/// An outstanding acknowledgement. Dropping it deregisters the message id.
pub struct Expectation {
    message_id: Uuid,
    rx: oneshot::Receiver<()>,
    cancellation: ShutdownSignal,
    outcome: Option<ExpectationOutcome>,
    coordinator: AcknowledgementCoordinator,
}

impl Expectation {
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Completes when the acknowledgement arrives or the cancellation signal fires, whichever
    ///  comes first. Once complete, this returns the same outcome immediately on every call.
    ///
    /// This is cancellation safe, so it can be raced against a resend delay.
    pub async fn wait(&mut self) -> ExpectationOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }

        let outcome = select! {
            biased;
            r = &mut self.rx => match r {
                Ok(()) => ExpectationOutcome::Acknowledged,
                // the coordinator can not drop the sender without resolving, so this is
                //  unreachable in practice
                Err(_) => ExpectationOutcome::Cancelled,
            },
            _ = self.cancellation.cancelled() => ExpectationOutcome::Cancelled,
        };
        self.outcome = Some(outcome);
        outcome
    }
}

impl Drop for Expectation {
    fn drop(&mut self) {
        // closing the receiver marks our sender as closed, which distinguishes it from a
        //  later registration for the same id
        self.rx.close();

        let mut expectations = self.coordinator.expectations.lock().unwrap();
        if expectations.get(&self.message_id).is_some_and(|tx| tx.is_closed()) {
            expectations.remove(&self.message_id);
        }
    }
}
