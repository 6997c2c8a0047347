//! Automatic reconnection with randomized backoff.
//!
//! Accounts that drop with a non-fatal reason get a reconnect timer:
//! the first delay is drawn uniformly from [8, 60) seconds, every
//! further failure doubles it up to a cap of 600 seconds. A fatal
//! reason disables the account instead. Network-up reconnects every
//! disconnected enabled account immediately; network-down tears
//! connections down without scheduling anything (network-up will).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::account::AccountId;

/// Bounds of the first reconnect delay, in seconds.
const INITIAL_DELAY_MIN: u64 = 8;
const INITIAL_DELAY_MAX: u64 = 60;

/// Upper bound on any reconnect delay, in seconds.
const MAX_DELAY: u64 = 600;

/// Called when a reconnect timer fires or network-up demands a signon.
pub type SignonFn = dyn Fn(AccountId) + Send + Sync;

/// Called when a fatal disconnect disables an account.
pub type DisableFn = dyn Fn(AccountId) + Send + Sync;

struct AutoRecon {
    delay_secs: u64,
    timer: Option<JoinHandle<()>>,
}

/// The process-wide reconnect controller.
pub struct ReconnectController {
    entries: Mutex<HashMap<AccountId, AutoRecon>>,
    rng: Mutex<StdRng>,
    signon: Box<SignonFn>,
    disable: Box<DisableFn>,
}

impl ReconnectController {
    /// A controller seeded from the OS RNG.
    pub fn new(
        signon: impl Fn(AccountId) + Send + Sync + 'static,
        disable: impl Fn(AccountId) + Send + Sync + 'static,
    ) -> Self {
        Self::with_rng(StdRng::from_entropy(), signon, disable)
    }

    /// A controller with a caller-provided RNG; tests seed this.
    pub fn with_rng(
        rng: StdRng,
        signon: impl Fn(AccountId) + Send + Sync + 'static,
        disable: impl Fn(AccountId) + Send + Sync + 'static,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            signon: Box::new(signon),
            disable: Box::new(disable),
        }
    }

    /// The account signed on; forget its backoff history.
    pub fn connected(&self, account: &AccountId) {
        if let Some(entry) = self.entries.lock().unwrap().remove(account) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    /// An account was removed; equivalent to [`Self::connected`].
    pub fn account_removed(&self, account: &AccountId) {
        self.connected(account);
    }

    /// The account disconnected. Non-fatal reasons schedule a
    /// reconnect; fatal ones disable the account.
    pub fn report_disconnect(self: &Arc<Self>, account: AccountId, fatal: bool) {
        if fatal {
            info!(%account, "fatal disconnect, disabling account");
            self.connected(&account);
            (self.disable)(account);
            return;
        }

        let delay_secs = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&account) {
                Some(entry) => {
                    entry.delay_secs = (entry.delay_secs * 2).min(MAX_DELAY);
                    if let Some(timer) = entry.timer.take() {
                        timer.abort();
                    }
                    entry.delay_secs
                }
                None => {
                    let delay_secs = self
                        .rng
                        .lock()
                        .unwrap()
                        .gen_range(INITIAL_DELAY_MIN..INITIAL_DELAY_MAX);
                    entries.insert(
                        account.clone(),
                        AutoRecon {
                            delay_secs,
                            timer: None,
                        },
                    );
                    delay_secs
                }
            }
        };

        debug!(%account, delay_secs, "scheduling reconnect");
        let this = Arc::clone(self);
        let timer_account = account.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            if let Some(entry) = this.entries.lock().unwrap().get_mut(&timer_account) {
                entry.timer = None;
            }
            debug!(account = %timer_account, "reconnect timer fired");
            (this.signon)(timer_account);
        });

        if let Some(entry) = self.entries.lock().unwrap().get_mut(&account) {
            entry.timer = Some(timer);
        }
    }

    /// The OS reports the network came up: drop all backoff state and
    /// sign every listed account straight on.
    pub fn network_connected(&self, disconnected: Vec<AccountId>) {
        {
            let mut entries = self.entries.lock().unwrap();
            for (_, entry) in entries.drain() {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
        }
        for account in disconnected {
            (self.signon)(account);
        }
    }

    /// The current backoff delay for an account, if one is tracked.
    pub fn current_delay(&self, account: &AccountId) -> Option<Duration> {
        self.entries
            .lock()
            .unwrap()
            .get(account)
            .map(|e| Duration::from_secs(e.delay_secs))
    }
}
