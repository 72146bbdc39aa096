//! Lifecycle controller: install, activate and claim, plus the control channel.
//!
//! Registration state is an explicit value owned by the controller. Every
//! change goes through [`transition`], a pure function from the current
//! state and a signal to the next state and the effects to run.

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::clients::Clients;
use crate::config::{Config, NotificationConfig};
use crate::engine::{Disposition, InterceptionEngine};
use crate::error::{ActivationError, InstallError, MessageError};
use crate::generation::{ActivationReport, GenerationId, GenerationManager, Installed};
use crate::http::Request;
use crate::network::Network;
use crate::notify::{build_notification, Notifier, PushPayload, ACTION_OPEN};

/// Sync tag the worker knows how to handle.
pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

/// Where this worker instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
  Uninstalled,
  Installing,
  /// Installed but not controlling clients
  Waiting,
  Activating,
  /// Controlling clients
  Active,
  /// Superseded by a newer generation
  Redundant,
}

impl RegistrationState {
  /// Whether fetches are intercepted in this state.
  pub fn intercepts(self) -> bool {
    matches!(self, RegistrationState::Activating | RegistrationState::Active)
  }
}

impl fmt::Display for RegistrationState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      RegistrationState::Uninstalled => "uninstalled",
      RegistrationState::Installing => "installing",
      RegistrationState::Waiting => "waiting",
      RegistrationState::Activating => "activating",
      RegistrationState::Active => "active",
      RegistrationState::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
  Install,
  InstallSucceeded { skip_waiting: bool },
  InstallFailed,
  SkipWaiting,
  Activate,
  ActivationComplete,
  ActivationFailed,
  Superseded,
}

/// Work the controller performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
  RunInstall,
  SkipWaiting,
  RunActivate,
}

/// Result of an accepted signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
  pub state: RegistrationState,
  pub effects: Vec<Effect>,
}

impl Transition {
  fn to(state: RegistrationState) -> Self {
    Self {
      state,
      effects: Vec::new(),
    }
  }

  fn with(state: RegistrationState, effect: Effect) -> Self {
    Self {
      state,
      effects: vec![effect],
    }
  }
}

/// Compute the next state. `None` means the signal does not apply.
pub fn transition(state: RegistrationState, signal: Signal) -> Option<Transition> {
  use RegistrationState::*;

  match (state, signal) {
    (Uninstalled, Signal::Install) => Some(Transition::with(Installing, Effect::RunInstall)),
    (Installing, Signal::InstallSucceeded { skip_waiting: true }) => {
      Some(Transition::with(Waiting, Effect::SkipWaiting))
    }
    (Installing, Signal::InstallSucceeded { skip_waiting: false }) => Some(Transition::to(Waiting)),
    (Installing, Signal::InstallFailed) => Some(Transition::to(Uninstalled)),
    (Waiting, Signal::SkipWaiting | Signal::Activate) => {
      Some(Transition::with(Activating, Effect::RunActivate))
    }
    (Activating, Signal::ActivationComplete) => Some(Transition::to(Active)),
    // Stale generations may remain; activation can be attempted again
    (Activating, Signal::ActivationFailed) => Some(Transition::to(Waiting)),
    (Installing | Waiting | Activating | Active, Signal::Superseded) => {
      Some(Transition::to(Redundant))
    }
    _ => None,
  }
}

/// Messages accepted on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
  SkipWaiting,
  GetVersion,
}

impl ControlMessage {
  /// Parse `{"type": "..."}`.
  pub fn parse(data: &Value) -> Result<Self, MessageError> {
    let kind = match data.get("type") {
      None | Some(Value::Null) => return Err(MessageError::MissingType),
      Some(Value::String(kind)) => kind.as_str(),
      Some(other) => return Err(MessageError::Malformed(format!("type is {}", other))),
    };

    match kind {
      "SKIP_WAITING" => Ok(ControlMessage::SkipWaiting),
      "GET_VERSION" => Ok(ControlMessage::GetVersion),
      other => Err(MessageError::UnknownKind(other.to_string())),
    }
  }
}

/// Reply to `GET_VERSION`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionReply {
  pub version: String,
}

/// Reply port handed over with a control message.
pub type ReplyPort = oneshot::Sender<VersionReply>;

/// Everything the worker can be asked to handle.
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  Message {
    data: Value,
    reply: Option<ReplyPort>,
  },
  Sync {
    tag: String,
  },
  Push {
    data: Option<Vec<u8>>,
  },
  NotificationClick {
    action: Option<String>,
  },
  Error(String),
  UnhandledRejection(String),
}

/// What install and activation did while handling one event.
#[derive(Debug, Default)]
pub struct Progress {
  pub installed: Option<Result<Installed, InstallError>>,
  pub activated: Option<Result<ActivationReport, ActivationError>>,
}

#[derive(Debug)]
pub enum EventOutcome {
  Lifecycle(Progress),
  Fetch(Disposition),
  Handled,
  /// Not applicable in the current state, or rejected
  Ignored,
}

/// Static settings for one worker generation.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub generation: GenerationId,
  pub preload: Vec<Url>,
  pub fallback: Url,
  pub offline_message: String,
  pub skip_waiting: bool,
  pub notifications: NotificationConfig,
}

impl WorkerSettings {
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    Ok(Self {
      generation: config.generation(),
      preload: config.preload_urls()?,
      fallback: config.fallback_url()?,
      offline_message: config.offline_message.clone(),
      skip_waiting: config.skip_waiting,
      notifications: config.notifications.clone(),
    })
  }
}

/// Sequences lifecycle events and routes every other event to its handler.
pub struct LifecycleController<S: CacheStore> {
  state: Mutex<RegistrationState>,
  skip_requested: AtomicBool,
  generations: GenerationManager<S>,
  engine: InterceptionEngine<S>,
  clients: Arc<dyn Clients>,
  notifier: Arc<dyn Notifier>,
  settings: WorkerSettings,
}

impl<S: CacheStore> LifecycleController<S> {
  pub fn new(
    store: Arc<S>,
    network: Arc<dyn Network>,
    clients: Arc<dyn Clients>,
    notifier: Arc<dyn Notifier>,
    settings: WorkerSettings,
  ) -> Self {
    let generations = GenerationManager::new(
      store,
      Arc::clone(&network),
      Arc::clone(&clients),
      settings.generation.clone(),
    );
    let engine = InterceptionEngine::new(
      generations.handle(),
      network,
      Request::get(settings.fallback.clone()).key(),
      settings.offline_message.clone(),
    );

    Self {
      state: Mutex::new(RegistrationState::Uninstalled),
      skip_requested: AtomicBool::new(false),
      generations,
      engine,
      clients,
      notifier,
      settings,
    }
  }

  fn lock_state(&self) -> MutexGuard<'_, RegistrationState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn state(&self) -> RegistrationState {
    *self.lock_state()
  }

  pub fn version(&self) -> &GenerationId {
    self.generations.current()
  }

  pub fn engine(&self) -> &InterceptionEngine<S> {
    &self.engine
  }

  /// Pick up where a previous process left off.
  ///
  /// If the current generation is the only one in the store, activation
  /// already completed. If stale ones remain, it is installed but waiting.
  pub fn restore(&self) -> RegistrationState {
    let mut state = self.lock_state();
    if *state != RegistrationState::Uninstalled {
      return *state;
    }

    if self.generations.is_installed() {
      let sole = self
        .generations
        .store()
        .keys()
        .map(|keys| keys.len() == 1)
        .unwrap_or(false);
      let restored = if sole {
        RegistrationState::Active
      } else {
        // Also the state after an activation whose purge partly failed;
        // activating again retries the purge
        warn!(
          generation = %self.version(),
          stale = ?self.stale_generations(),
          "stale generations remain, waiting for activation"
        );
        RegistrationState::Waiting
      };
      info!(generation = %self.version(), state = %restored, "restored registration");
      *state = restored;
    }
    *state
  }

  fn stale_generations(&self) -> Vec<GenerationId> {
    self
      .generations
      .store()
      .keys()
      .map(|keys| keys.into_iter().filter(|k| k != self.version()).collect())
      .unwrap_or_default()
  }

  /// Feed a signal to the state machine and store the new state.
  fn apply(&self, signal: Signal) -> Option<Vec<Effect>> {
    Self::step(&mut self.lock_state(), signal)
  }

  fn step(state: &mut RegistrationState, signal: Signal) -> Option<Vec<Effect>> {
    let current = *state;
    match transition(current, signal) {
      Some(next) => {
        debug!(from = %current, to = %next.state, ?signal, "transition");
        *state = next.state;
        Some(next.effects)
      }
      None => {
        debug!(state = %current, ?signal, "signal does not apply");
        None
      }
    }
  }

  async fn run(&self, effects: Vec<Effect>) -> Progress {
    let mut queue: VecDeque<Effect> = effects.into();
    let mut progress = Progress::default();

    while let Some(effect) = queue.pop_front() {
      let signal = match effect {
        Effect::RunInstall => {
          let result = self.generations.install(&self.settings.preload).await;
          if let Err(e) = &result {
            error!(error = %e, "installation failed");
          }
          // The skip request is consumed under the same lock that leaves Installing
          let next = {
            let mut state = self.lock_state();
            let requested = self.skip_requested.swap(false, Ordering::SeqCst);
            let signal = match &result {
              Ok(_) => Signal::InstallSucceeded {
                skip_waiting: self.settings.skip_waiting || requested,
              },
              Err(_) => Signal::InstallFailed,
            };
            Self::step(&mut state, signal)
          };
          progress.installed = Some(result);
          if let Some(next) = next {
            queue.extend(next);
          }
          continue;
        }
        Effect::SkipWaiting => Signal::SkipWaiting,
        Effect::RunActivate => {
          let result = self.generations.activate().await;
          let signal = match &result {
            Ok(_) => Signal::ActivationComplete,
            Err(e) => {
              error!(error = %e, "activation failed");
              Signal::ActivationFailed
            }
          };
          progress.activated = Some(result);
          signal
        }
      };

      if let Some(next) = self.apply(signal) {
        queue.extend(next);
      }
    }

    progress
  }

  async fn signal(&self, signal: Signal) -> EventOutcome {
    match self.apply(signal) {
      Some(effects) => EventOutcome::Lifecycle(self.run(effects).await),
      None => EventOutcome::Ignored,
    }
  }

  /// Install the current generation; activates right away when skip-waiting applies.
  pub async fn install(&self) -> EventOutcome {
    self.signal(Signal::Install).await
  }

  pub async fn activate(&self) -> EventOutcome {
    self.signal(Signal::Activate).await
  }

  /// Force takeover without waiting for existing clients to close.
  pub async fn skip_waiting(&self) -> EventOutcome {
    {
      let state = self.lock_state();
      if *state == RegistrationState::Installing {
        // Honored only if the running install succeeds
        self.skip_requested.store(true, Ordering::SeqCst);
        return EventOutcome::Handled;
      }
    }
    self.signal(Signal::SkipWaiting).await
  }

  /// A newer generation took over.
  pub fn supersede(&self) -> RegistrationState {
    self.apply(Signal::Superseded);
    self.state()
  }

  /// Retire this worker if its generation was purged by a newer one.
  fn check_superseded(&self) {
    match self.generations.store().keys() {
      Ok(keys) if !keys.contains(self.version()) => {
        info!(generation = %self.version(), ?keys, "generation purged by a newer one");
        self.supersede();
      }
      Ok(_) => {}
      Err(e) => warn!(error = %e, "failed to enumerate generations"),
    }
  }

  pub async fn fetch(&self, request: Request) -> Disposition {
    if self.state().intercepts() {
      self.check_superseded();
    }
    let state = self.state();
    if !state.intercepts() {
      debug!(%state, url = %request.url, "not controlling, passing through");
      return Disposition::PassThrough(request);
    }
    self.engine.handle(request).await
  }

  /// Handle a control-channel message.
  pub async fn message(&self, data: &Value, reply: Option<ReplyPort>) -> EventOutcome {
    let message = match ControlMessage::parse(data) {
      Ok(message) => message,
      Err(MessageError::MissingType) => {
        debug!(%data, "ignoring message without type");
        return EventOutcome::Ignored;
      }
      Err(e) => {
        warn!(%data, error = %e, "unknown message");
        return EventOutcome::Ignored;
      }
    };

    info!(?message, "message received");
    match message {
      ControlMessage::SkipWaiting => self.skip_waiting().await,
      ControlMessage::GetVersion => {
        let Some(reply) = reply else {
          warn!(error = %MessageError::NoReplyPort("GET_VERSION"), "dropping message");
          return EventOutcome::Ignored;
        };
        let version = VersionReply {
          version: self.version().to_string(),
        };
        if reply.send(version).is_err() {
          debug!("version requester went away");
        }
        EventOutcome::Handled
      }
    }
  }

  fn sync(&self, tag: &str) -> EventOutcome {
    info!(tag, "background sync");
    if tag == BACKGROUND_SYNC_TAG {
      info!("background sync completed");
      EventOutcome::Handled
    } else {
      debug!(tag, "no work registered for sync tag");
      EventOutcome::Ignored
    }
  }

  fn push(&self, data: Option<&[u8]>) -> EventOutcome {
    let Some(data) = data else {
      debug!("push without data");
      return EventOutcome::Ignored;
    };

    match PushPayload::parse(data) {
      Ok(payload) => {
        info!(?payload, "push received");
        let notification = build_notification(&self.settings.notifications, &payload);
        self.notifier.show(&notification);
        EventOutcome::Handled
      }
      Err(e) => {
        warn!(error = %e, "push payload is not valid json");
        EventOutcome::Ignored
      }
    }
  }

  fn notification_click(&self, action: Option<&str>) -> EventOutcome {
    info!(?action, "notification click");
    if action == Some(ACTION_OPEN) {
      self.clients.open_window(&self.settings.fallback);
    }
    EventOutcome::Handled
  }

  /// Route one event to its handler.
  pub async fn dispatch(&self, event: WorkerEvent) -> EventOutcome {
    match event {
      WorkerEvent::Install => self.install().await,
      WorkerEvent::Activate => self.activate().await,
      WorkerEvent::Fetch(request) => EventOutcome::Fetch(self.fetch(request).await),
      WorkerEvent::Message { data, reply } => self.message(&data, reply).await,
      WorkerEvent::Sync { tag } => self.sync(&tag),
      WorkerEvent::Push { data } => self.push(data.as_deref()),
      WorkerEvent::NotificationClick { action } => self.notification_click(action.as_deref()),
      WorkerEvent::Error(message) => {
        error!(%message, "error occurred");
        EventOutcome::Handled
      }
      WorkerEvent::UnhandledRejection(reason) => {
        error!(%reason, "unhandled rejection");
        EventOutcome::Handled
      }
    }
  }
}
