use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use crate::channel::{ChannelFactory, RetryableChannel, WriteCompletion};
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::supervisor::retry_agent::RetryAgent;
use crate::supervisor::retry_strategy::{DelayedSwitchRetryStrategy, RetryStrategy};

pub enum SupervisorState<C> {
    NoChannel,
    Searching,
    HasChannel(Arc<C>),
    /// terminal
    Exhausted { attempts: u32 },
    /// terminal
    Closed,
}

impl<C> SupervisorState<C> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Exhausted { .. } | SupervisorState::Closed)
    }

    fn terminal_error(&self) -> Option<ChannelError> {
        match self {
            SupervisorState::Exhausted { attempts } => Some(ChannelError::TooManyRetries { attempts: *attempts }),
            SupervisorState::Closed => Some(ChannelError::ShutDown),
            _ => None,
        }
    }
}

impl<C> Clone for SupervisorState<C> {
    fn clone(&self) -> Self {
        match self {
            SupervisorState::NoChannel => SupervisorState::NoChannel,
            SupervisorState::Searching => SupervisorState::Searching,
            SupervisorState::HasChannel(channel) => SupervisorState::HasChannel(channel.clone()),
            SupervisorState::Exhausted { attempts } => SupervisorState::Exhausted { attempts: *attempts },
            SupervisorState::Closed => SupervisorState::Closed,
        }
    }
}

impl<C> Debug for SupervisorState<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::NoChannel => write!(f, "NoChannel"),
            SupervisorState::Searching => write!(f, "Searching"),
            SupervisorState::HasChannel(_) => write!(f, "HasChannel"),
            SupervisorState::Exhausted { attempts } => write!(f, "Exhausted({})", attempts),
            SupervisorState::Closed => write!(f, "Closed"),
        }
    }
}

/// A [RetryableChannel] that replaces its underlying channel whenever it closes, using a
///  [RetryStrategy] to find the replacement.
///
/// ```ascii
/// NoChannel -> Searching -> HasChannel
///                  ^            |
///                  +------------+  (channel closed, or it refused a recipient)
///
/// Searching -> Exhausted         (retry budget used up)
/// *         -> Closed            (shutdown)
/// ```
///
/// `send` and `accept` never wait: while there is no channel, they fail fast and callers are
///  expected to try again later. Once the supervisor is exhausted it stays dead, and every
///  call fails with the same terminal error.
///
/// The current channel is published through a `watch` channel, so readers always see either a
///  fully installed channel or none. At most one search runs at any time; concurrent triggers
///  (close signal, refused recipient) collapse into the running search.
pub struct ChannelSupervisor<S: RetryStrategy> {
    inner: Arc<SupervisorInner<S>>,
}

impl<S: RetryStrategy> Clone for ChannelSupervisor<S> {
    fn clone(&self) -> Self {
        ChannelSupervisor {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ChannelFactory> ChannelSupervisor<DelayedSwitchRetryStrategy<F>> {
    pub fn from_config(config: &ChannelConfig, factory: F) -> anyhow::Result<ChannelSupervisor<DelayedSwitchRetryStrategy<F>>> {
        config.validate()?;
        Ok(ChannelSupervisor::new(DelayedSwitchRetryStrategy::new(RetryAgent::from_config(config), factory)))
    }
}

impl<S: RetryStrategy> ChannelSupervisor<S> {
    /// NB: When this is called outside a tokio runtime, the supervisor binds to the runtime
    ///  that calls [RetryableChannel::start]. Searches triggered from other threads are spawned
    ///  on that runtime.
    pub fn new(strategy: S) -> ChannelSupervisor<S> {
        ChannelSupervisor {
            inner: Arc::new(SupervisorInner {
                strategy,
                runtime: Mutex::new(Handle::try_current().ok()),
                state: watch::Sender::new(SupervisorState::NoChannel),
                search_in_progress: AtomicBool::new(false),
                tasks: Default::default(),
            }),
        }
    }

    pub fn state(&self) -> SupervisorState<S::Channel> {
        self.inner.state.borrow().clone()
    }

    pub fn current_channel(&self) -> Option<Arc<S::Channel>> {
        match &*self.inner.state.borrow() {
            SupervisorState::HasChannel(channel) => Some(channel.clone()),
            _ => None,
        }
    }

    pub fn strategy(&self) -> &S {
        &self.inner.strategy
    }
}

#[async_trait]
impl<S: RetryStrategy> RetryableChannel for ChannelSupervisor<S> {
    /// Resolves once a channel is installed, or fails if the supervisor gave up or was shut down
    async fn start(&self) -> anyhow::Result<()> {
        self.inner.bind_runtime();

        let is_unstarted = matches!(*self.inner.state.borrow(), SupervisorState::NoChannel);
        if is_unstarted {
            self.inner.search_next_channel(None);
        }

        let mut state_receiver = self.inner.state.subscribe();
        let state = state_receiver
            .wait_for(|state| !matches!(state, SupervisorState::NoChannel | SupervisorState::Searching))
            .await?
            .clone();

        match state.terminal_error() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let mut previous = None;
        self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            previous = Some(std::mem::replace(state, SupervisorState::Closed));
            true
        });
        self.inner.abort_tasks();

        if let Some(SupervisorState::HasChannel(channel)) = previous {
            debug!("shutting down the current channel");
            channel.shutdown().await?;
        }
        info!("channel supervisor is shut down");
        Ok(())
    }

    /// resolves on shutdown, and when the supervisor gave up
    async fn closed(&self) {
        let mut state_receiver = self.inner.state.subscribe();
        let _ = state_receiver.wait_for(|state| state.is_terminal()).await;
    }

    fn send(&self, msg: Bytes) -> Result<WriteCompletion, ChannelError> {
        match self.state() {
            SupervisorState::HasChannel(channel) => channel.send(msg),
            SupervisorState::NoChannel | SupervisorState::Searching => Err(ChannelError::NoChannelAvailable),
            SupervisorState::Exhausted { attempts } => Err(ChannelError::TooManyRetries { attempts }),
            SupervisorState::Closed => Err(ChannelError::ShutDown),
        }
    }

    async fn receive(&self, sender: SocketAddr, msg_buf: &[u8]) {
        match self.current_channel() {
            Some(channel) => channel.receive(sender, msg_buf).await,
            None => debug!("no channel - dropping message from {:?}", sender),
        }
    }

    /// NB: A channel refusing the recipient is taken as a sign that it is no longer usable, and
    ///  it is replaced. This call returns `false` in the meantime.
    fn accept(&self, recipient: SocketAddr) -> bool {
        let Some(channel) = self.current_channel() else {
            return false;
        };
        if channel.accept(recipient) {
            return true;
        }

        debug!("current channel does not accept {:?} - searching for a replacement", recipient);
        self.inner.search_next_channel(Some(&channel));
        false
    }

    fn is_writable(&self) -> bool {
        self.current_channel()
            .is_some_and(|channel| channel.is_writable())
    }
}

struct SupervisorInner<S: RetryStrategy> {
    strategy: S,
    runtime: Mutex<Option<Handle>>,
    state: watch::Sender<SupervisorState<S::Channel>>,
    search_in_progress: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: RetryStrategy> Drop for SupervisorInner<S> {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl<S: RetryStrategy> SupervisorInner<S> {
    /// Starts a search unless one is running already. If `replacing` is passed, the search only
    ///  starts if that channel is still the current one.
    fn search_next_channel(self: &Arc<Self>, replacing: Option<&Arc<S::Channel>>) {
        // checked before any state changes, so there is nothing to roll back
        let Some(runtime) = self.runtime() else {
            error!("supervisor is not bound to a tokio runtime - can not search for a channel");
            return;
        };

        if self.search_in_progress.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            trace!("search for a channel is in progress already");
            return;
        }

        let mut previous = None;
        let mut is_started = false;
        self.state.send_if_modified(|state| {
            let replaced = match &*state {
                SupervisorState::NoChannel => Some(None),
                SupervisorState::HasChannel(current) if replacing.map_or(true, |r| Arc::ptr_eq(r, current)) => Some(Some(current.clone())),
                _ => None,
            };

            match replaced {
                Some(replaced) => {
                    previous = replaced;
                    is_started = true;
                    *state = SupervisorState::Searching;
                    true
                }
                None => false,
            }
        });

        if !is_started {
            self.search_in_progress.store(false, Ordering::Release);
            return;
        }

        debug!("searching for a new channel");
        let handle = runtime.spawn(self.clone().search(previous));
        self.register_task(handle);
    }

    async fn search(self: Arc<Self>, mut previous: Option<Arc<S::Channel>>) {
        let mut attempt: u32 = 0;
        let result = loop {
            attempt += 1;
            match self.strategy.next_channel(previous.take()).await {
                Ok(channel) => break Ok(channel),
                Err(ChannelError::StartFailed(e)) => {
                    if !self.strategy.next_channel_available() {
                        warn!("attempt #{} to establish a channel failed: {}", attempt, e);
                        break Err(ChannelError::TooManyRetries { attempts: self.strategy.attempt_count() });
                    }
                    warn!("attempt #{} to establish a channel failed - retrying: {}", attempt, e);
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(channel) => self.install(channel, attempt).await,
            Err(e) => {
                error!("giving up on establishing a channel: {}", e);
                let attempts = match e {
                    ChannelError::TooManyRetries { attempts } => attempts,
                    _ => self.strategy.attempt_count(),
                };
                self.state.send_if_modified(|state| {
                    if matches!(state, SupervisorState::Searching) {
                        *state = SupervisorState::Exhausted { attempts };
                        true
                    }
                    else {
                        false
                    }
                });
                self.search_in_progress.store(false, Ordering::Release);
            }
        }
    }

    async fn install(self: &Arc<Self>, channel: Arc<S::Channel>, attempts: u32) {
        let mut is_installed = false;
        self.state.send_if_modified(|state| {
            if matches!(state, SupervisorState::Searching) {
                *state = SupervisorState::HasChannel(channel.clone());
                is_installed = true;
                true
            }
            else {
                false
            }
        });
        self.search_in_progress.store(false, Ordering::Release);

        if is_installed {
            info!("new channel is installed after {} attempt(s)", attempts);
            self.watch_for_close(channel);
        }
        else {
            debug!("supervisor was shut down during the search - discarding the new channel");
            if let Err(e) = channel.shutdown().await {
                warn!("error shutting down discarded channel: {}", e);
            }
        }
    }

    fn watch_for_close(self: &Arc<Self>, channel: Arc<S::Channel>) {
        let Some(runtime) = self.runtime() else {
            error!("supervisor is not bound to a tokio runtime - can not watch the new channel");
            return;
        };

        let inner: Weak<Self> = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            channel.closed().await;
            if let Some(inner) = inner.upgrade() {
                debug!("channel was closed");
                inner.search_next_channel(Some(&channel));
            }
        });
        self.register_task(handle);
    }

    fn bind_runtime(&self) {
        let mut runtime = self.runtime.lock()
            .unwrap_or_else(|e| e.into_inner());
        if runtime.is_none() {
            *runtime = Handle::try_current().ok();
        }
    }

    /// the runtime the supervisor is bound to, falling back to the caller's
    fn runtime(&self) -> Option<Handle> {
        self.runtime.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .or_else(|| Handle::try_current().ok())
    }

    fn register_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock()
            .unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock()
            .unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
