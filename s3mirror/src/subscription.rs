//! Client-side view of the push-notification subscription lifecycle.
//!
//! The subscription identifier is written once, by the subscribe path at
//! start-up, and read once, at shutdown. The confirmation callback only
//! advances the state; it never changes the identifier.

use std::sync::Mutex;

use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Nothing requested (or no topic configured).
    #[default]
    None,
    /// Subscribe issued; the provider's confirmation callback is pending.
    Requested { subscription_arn: String },
    /// The confirmation callback was received and answered.
    Confirmed { subscription_arn: String },
    /// Unsubscribed during shutdown.
    Unsubscribed,
}

#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    state: Mutex<SubscriptionState>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SubscriptionState {
        self.lock().clone()
    }

    /// Records the identifier returned by Subscribe.
    pub fn requested(&self, subscription_arn: String) {
        let mut state = self.lock();
        debug!("subscription {subscription_arn:?} requested");
        *state = SubscriptionState::Requested { subscription_arn };
    }

    /// Advances Requested to Confirmed. A confirmation with no preceding
    /// request (another process subscribed, or a redelivery after shutdown
    /// started) changes nothing.
    pub fn confirmed(&self) {
        let mut state = self.lock();
        if let SubscriptionState::Requested { subscription_arn } = &*state {
            info!("subscription {subscription_arn:?} is now confirmed");
            *state = SubscriptionState::Confirmed {
                subscription_arn: subscription_arn.clone(),
            };
        } else {
            debug!("confirmation received in state {state:?}, ignored");
        }
    }

    /// Takes the identifier for the shutdown Unsubscribe call, leaving the
    /// tracker in its terminal state. Returns `None` when there is nothing
    /// to unsubscribe.
    pub fn take_for_unsubscribe(&self) -> Option<String> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SubscriptionState::Unsubscribed) {
            SubscriptionState::Requested { subscription_arn }
            | SubscriptionState::Confirmed { subscription_arn } => Some(subscription_arn),
            SubscriptionState::None | SubscriptionState::Unsubscribed => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SubscriptionState> {
        self.state.lock().expect("subscription lock poisoned")
    }
}
