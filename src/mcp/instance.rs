//! Per-tenant MCP instance management
//!
//! Each [`McpInstance`] owns one loopback sub-server serving the rmcp
//! Streamable-HTTP transport, the port it is bound to, and a TTL watchdog
//! that evicts the instance once it has been idle for too long.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──> Starting ──listener bound──> Running
//!    ▲                                                 │
//!    └──────────── Stopping <── stop() / TTL expiry ───┘
//! ```
//!
//! Start and stop are serialized by a per-instance lock. The watchdog
//! re-checks idleness under that lock before evicting, so a request that
//! touched the instance in the meantime wins, and a concurrent `stop()`
//! always finds either a running instance or a no-op.

use crate::mcp::port_pool::{PortPool, PortPoolError};
use crate::mcp::registry::InstanceManager;
use crate::mcp::service::{TenantMcpService, ToolPack, ToolRegistrar};
use axum::{response::Json, routing::get, Router as AxumRouter};
use chrono::{DateTime, Utc};
use rmcp::handler::server::tool::ToolRouter;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("Invalid identifier format: {0}")]
    InvalidIdentifier(String),

    #[error(transparent)]
    PortAllocation(#[from] PortPoolError),

    #[error("Failed to bind MCP sub-server on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("MCP instance {0} has not been started")]
    NotStarted(String),

    #[error("MCP instance {0} has been retired")]
    Retired(String),

    #[error("MCP sub-server for {0} panicked")]
    SubServerPanicked(String),

    #[error("Start of MCP instance {0} was aborted")]
    StartAborted(String),
}

/// Timing knobs shared by every instance of a manager
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    /// Idle time after which an instance is evicted
    pub ttl: Duration,
    /// Watchdog wake-up period
    pub check_interval: Duration,
    /// Fraction of the TTL after which idleness is logged as a warning
    pub warning_ratio: f64,
    /// Time given to the sub-server to drain before it is aborted
    pub shutdown_grace: Duration,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            check_interval: Duration::from_secs(10),
            warning_ratio: 0.7,
            shutdown_grace: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum InstanceState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl InstanceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => InstanceState::Starting,
            1 => InstanceState::Running,
            2 => InstanceState::Stopping,
            _ => InstanceState::Stopped,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why an instance is being stopped, carried in logs only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    TtlExpired,
    Recovery,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Requested => "requested",
            StopReason::TtlExpired => "ttl_expired",
            StopReason::Recovery => "recovery",
            StopReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of an instance, as listed by `GET /instances`
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub seconds_alive: u64,
    pub minutes_since_last_activity: f64,
    pub minutes_until_ttl: f64,
    pub ttl_minutes: f64,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub status: InstanceState,
}

struct SubServer {
    port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

#[derive(Default)]
struct Lifecycle {
    sub_server: Option<SubServer>,
    watchdog: Option<JoinHandle<()>>,
}

const NO_PORT: u16 = 0;

/// One tenant's MCP sub-server plus its bookkeeping
pub struct McpInstance {
    identifier: String,
    token: String,
    settings: Arc<InstanceSettings>,
    ports: Arc<PortPool>,
    tool_pack: Arc<dyn ToolPack>,
    manager: Weak<InstanceManager>,
    clock: Instant,
    created_at_ms: AtomicU64,
    last_activity_ms: AtomicU64,
    port: AtomicU16,
    state: AtomicU8,
    should_stop: AtomicBool,
    retired: AtomicBool,
    generation: AtomicU64,
    tools: OnceCell<Arc<ToolRouter<TenantMcpService>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for McpInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpInstance")
            .field("identifier", &self.identifier)
            .field("port", &self.port())
            .field("state", &self.state())
            .finish()
    }
}

impl McpInstance {
    /// Creates a stopped instance
    ///
    /// # Arguments
    ///
    /// * `identifier` - Tenant key, already validated
    /// * `token` - Bearer credential captured at creation
    /// * `settings` - TTL and shutdown timings
    /// * `ports` - Pool the instance allocates from and releases to
    /// * `tool_pack` - Tool catalogue registered on first start
    /// * `manager` - Registry to leave on TTL expiry; `Weak::new()` when unmanaged
    pub fn new(
        identifier: String,
        token: String,
        settings: Arc<InstanceSettings>,
        ports: Arc<PortPool>,
        tool_pack: Arc<dyn ToolPack>,
        manager: Weak<InstanceManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            token,
            settings,
            ports,
            tool_pack,
            manager,
            clock: Instant::now(),
            created_at_ms: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            port: AtomicU16::new(NO_PORT),
            state: AtomicU8::new(InstanceState::Stopped as u8),
            should_stop: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            tools: OnceCell::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == InstanceState::Running
    }

    /// Whether the instance was evicted or drained and must not be restarted
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Incremented on every successful start
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::Acquire) {
            NO_PORT => None,
            port => Some(port),
        }
    }

    /// Loopback URL of the sub-server
    ///
    /// # Errors
    ///
    /// * `InstanceError::NotStarted` - No port assigned yet
    pub fn url(&self) -> Result<String, InstanceError> {
        self.port()
            .map(|port| format!("http://localhost:{}", port))
            .ok_or_else(|| InstanceError::NotStarted(self.identifier.clone()))
    }

    /// Marks the instance as active now
    pub fn touch(&self) {
        self.last_activity_ms
            .fetch_max(self.now_ms(), Ordering::AcqRel);
    }

    /// Time since the last `touch`
    pub fn idle(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Time since the last successful `start`
    pub fn age(&self) -> Duration {
        let created = self.created_at_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(created))
    }

    /// Starts the sub-server if it is not running
    ///
    /// Registers the tool pack on the first call, acquires a port, binds the
    /// loopback listener and spawns the server and watchdog tasks. The
    /// listener is bound before this returns, so the sub-server accepts
    /// connections as soon as the instance is `Running`. On failure every
    /// partially acquired resource is released and the state is `Stopped`.
    ///
    /// # Errors
    ///
    /// * `InstanceError::Retired` - The instance was evicted
    /// * `InstanceError::PortAllocation` - The pool is exhausted
    /// * `InstanceError::Bind` - The acquired port could not be bound
    pub async fn start(self: &Arc<Self>) -> Result<(), InstanceError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.start_locked(&mut lifecycle).await
    }

    /// Stops the sub-server and releases its port
    ///
    /// Idempotent: stopping a stopped instance is a no-op.
    pub async fn stop(&self) -> Result<(), InstanceError> {
        self.stop_for(StopReason::Requested).await
    }

    pub async fn stop_for(&self, reason: StopReason) -> Result<(), InstanceError> {
        self.should_stop.store(true, Ordering::Release);
        let mut lifecycle = self.lifecycle.lock().await;
        Self::cancel_watchdog(&mut lifecycle).await;
        self.teardown(&mut lifecycle, reason).await
    }

    /// Stops the instance for good; later `activate` calls fail with `Retired`
    pub async fn retire(&self, reason: StopReason) -> Result<(), InstanceError> {
        self.should_stop.store(true, Ordering::Release);
        let mut lifecycle = self.lifecycle.lock().await;
        self.retired.store(true, Ordering::Release);
        Self::cancel_watchdog(&mut lifecycle).await;
        self.teardown(&mut lifecycle, reason).await
    }

    /// Ensures the instance is running and records activity
    ///
    /// A failed start retires the instance so that concurrent callers
    /// holding the same handle do not resurrect a rolled-back entry.
    pub(crate) async fn activate(self: &Arc<Self>) -> Result<(), InstanceError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_retired() {
            return Err(InstanceError::Retired(self.identifier.clone()));
        }

        if !self.is_running() {
            if let Err(e) = self.start_locked(&mut lifecycle).await {
                self.retired.store(true, Ordering::Release);
                return Err(e);
            }
        }

        self.touch();
        Ok(())
    }

    /// Restarts a sub-server that stopped answering
    ///
    /// `failed_generation` is the [`generation`](Self::generation) the caller
    /// observed before its request failed. When another caller has already
    /// restarted the instance since, this only touches it.
    pub async fn restart(self: &Arc<Self>, failed_generation: u64) -> Result<(), InstanceError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_running() && self.generation() != failed_generation {
            self.touch();
            return Ok(());
        }

        tracing::warn!(identifier = %self.identifier, "Restarting MCP instance");
        Self::cancel_watchdog(&mut lifecycle).await;
        if let Err(e) = self.teardown(&mut lifecycle, StopReason::Recovery).await {
            tracing::warn!(identifier = %self.identifier, error = %e, "Error while stopping crashed sub-server");
        }
        self.start_locked(&mut lifecycle).await?;
        self.touch();
        Ok(())
    }

    /// Aborts the sub-server task without releasing anything
    ///
    /// Leaves the instance `Running` with a dead backend, the way a crashed
    /// sub-server looks to the gateway. Reached from outside the crate only
    /// through [`crate::test_utils::crash_sub_server`].
    pub(crate) async fn kill_sub_server(&self) {
        let lifecycle = self.lifecycle.lock().await;
        if let Some(sub) = lifecycle.sub_server.as_ref() {
            tracing::warn!(identifier = %self.identifier, port = sub.port, "Killing MCP sub-server");
            sub.task.abort();
            while !sub.task.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    pub fn info(&self) -> InstanceInfo {
        let idle = self.idle();
        let ttl = self.settings.ttl;
        let minutes_idle = idle.as_secs_f64() / 60.0;
        let minutes_left = (ttl.as_secs_f64() - idle.as_secs_f64()).max(0.0) / 60.0;

        InstanceInfo {
            created_at: self.wall_time(self.created_at_ms.load(Ordering::Acquire)),
            last_activity: self.wall_time(self.last_activity_ms.load(Ordering::Acquire)),
            seconds_alive: self.age().as_secs(),
            minutes_since_last_activity: round_tenth(minutes_idle),
            minutes_until_ttl: round_tenth(minutes_left),
            ttl_minutes: ttl.as_secs_f64() / 60.0,
            port: self.port(),
            url: self.url().ok(),
            status: self.state(),
        }
    }

    async fn start_locked(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> Result<(), InstanceError> {
        if self.is_retired() {
            return Err(InstanceError::Retired(self.identifier.clone()));
        }
        if self.is_running() && lifecycle.sub_server.is_some() {
            return Ok(());
        }

        Self::cancel_watchdog(lifecycle).await;

        self.set_state(InstanceState::Starting);
        tracing::info!(identifier = %self.identifier, "Starting MCP instance");

        let tools = self
            .tools
            .get_or_init(|| async {
                let mut registrar = ToolRegistrar::new();
                self.tool_pack
                    .register(&mut registrar, &self.identifier, &self.token)
                    .await;
                tracing::debug!(
                    identifier = %self.identifier,
                    tools = registrar.len(),
                    "Registered tool pack"
                );
                Arc::new(registrar.into_router())
            })
            .await
            .clone();

        let port = match self.ports.acquire() {
            Ok(port) => port,
            Err(e) => {
                self.set_state(InstanceState::Stopped);
                tracing::error!(identifier = %self.identifier, error = %e, "Port allocation failed");
                return Err(e.into());
            }
        };

        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.ports.release(port);
                self.set_state(InstanceState::Stopped);
                tracing::error!(identifier = %self.identifier, port, error = %source, "Sub-server bind failed");
                return Err(InstanceError::Bind { port, source });
            }
        };

        let service = TenantMcpService::new(self.identifier.clone(), self.token.clone(), tools);
        let app = sub_server_router(service);
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        lifecycle.sub_server = Some(SubServer {
            port,
            shutdown,
            task,
        });
        self.port.store(port, Ordering::Release);
        self.should_stop.store(false, Ordering::Release);

        let now = self.now_ms();
        self.created_at_ms.store(now, Ordering::Release);
        self.last_activity_ms.store(now, Ordering::Release);

        lifecycle.watchdog = Some(tokio::spawn(run_watchdog(
            Arc::downgrade(self),
            Arc::clone(&self.settings),
        )));

        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set_state(InstanceState::Running);
        tracing::info!(identifier = %self.identifier, port, "MCP instance running");
        Ok(())
    }

    async fn cancel_watchdog(lifecycle: &mut Lifecycle) {
        if let Some(watchdog) = lifecycle.watchdog.take() {
            watchdog.abort();
            let _ = watchdog.await;
        }
    }

    /// Shuts the sub-server down and returns its port; the caller holds the lock
    async fn teardown(
        &self,
        lifecycle: &mut Lifecycle,
        reason: StopReason,
    ) -> Result<(), InstanceError> {
        let Some(sub) = lifecycle.sub_server.take() else {
            self.set_state(InstanceState::Stopped);
            return Ok(());
        };

        self.set_state(InstanceState::Stopping);
        sub.shutdown.cancel();

        let mut task = sub.task;
        let joined = match tokio::time::timeout(self.settings.shutdown_grace, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(
                    identifier = %self.identifier,
                    port = sub.port,
                    "Sub-server did not drain in time, aborting"
                );
                task.abort();
                task.await
            }
        };

        self.ports.release(sub.port);
        self.port.store(NO_PORT, Ordering::Release);
        self.set_state(InstanceState::Stopped);
        tracing::info!(
            identifier = %self.identifier,
            port = sub.port,
            reason = %reason,
            "MCP instance stopped"
        );

        match joined {
            Err(e) if e.is_panic() => Err(InstanceError::SubServerPanicked(self.identifier.clone())),
            Ok(Err(e)) => {
                tracing::warn!(identifier = %self.identifier, error = %e, "Sub-server exited with error");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// TTL eviction, run from the watchdog task
    async fn expire(self: Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_retired() || self.should_stop.load(Ordering::Acquire) {
            return;
        }

        if ttl_verdict(self.idle(), self.settings.ttl, self.settings.ttl) != TtlVerdict::Evict {
            tracing::debug!(identifier = %self.identifier, "Activity raced with eviction, keeping instance");
            return;
        }

        self.retired.store(true, Ordering::Release);
        self.should_stop.store(true, Ordering::Release);
        // This is our own task; detach it rather than awaiting ourselves
        drop(lifecycle.watchdog.take());

        let result = self.teardown(&mut lifecycle, StopReason::TtlExpired).await;
        drop(lifecycle);

        if let Err(e) = result {
            tracing::warn!(identifier = %self.identifier, error = %e, "Error while evicting MCP instance");
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.remove_if_current(&self.identifier, &self).await;
        }
    }

    fn set_state(&self, state: InstanceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn wall_time(&self, at_ms: u64) -> DateTime<Utc> {
        let ago = Duration::from_millis(self.now_ms().saturating_sub(at_ms));
        Utc::now() - chrono::Duration::from_std(ago).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// What one watchdog check decides for a given idle time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TtlVerdict {
    Keep,
    Warn,
    Evict,
}

/// Idle exactly at the TTL evicts; idle exactly at `warn_after` warns
fn ttl_verdict(idle: Duration, ttl: Duration, warn_after: Duration) -> TtlVerdict {
    if idle >= ttl {
        TtlVerdict::Evict
    } else if idle >= warn_after {
        TtlVerdict::Warn
    } else {
        TtlVerdict::Keep
    }
}

async fn run_watchdog(instance: Weak<McpInstance>, settings: Arc<InstanceSettings>) {
    let ttl = settings.ttl;
    let warn_after = ttl.mul_f64(settings.warning_ratio.clamp(0.0, 1.0));

    loop {
        tokio::time::sleep(settings.check_interval).await;

        let Some(instance) = instance.upgrade() else {
            return;
        };
        if instance.should_stop.load(Ordering::Acquire) {
            return;
        }

        let idle = instance.idle();
        match ttl_verdict(idle, ttl, warn_after) {
            TtlVerdict::Evict => {
                tracing::info!(
                    identifier = %instance.identifier,
                    idle_secs = idle.as_secs(),
                    ttl_secs = ttl.as_secs(),
                    "MCP instance idle past TTL, evicting"
                );
                instance.expire().await;
                return;
            }
            TtlVerdict::Warn => {
                tracing::warn!(
                    identifier = %instance.identifier,
                    idle_secs = idle.as_secs(),
                    remaining_secs = (ttl - idle).as_secs(),
                    "MCP instance approaching TTL"
                );
            }
            TtlVerdict::Keep => {
                tracing::debug!(
                    identifier = %instance.identifier,
                    idle_secs = idle.as_secs(),
                    "TTL check"
                );
            }
        }
    }
}

fn sub_server_router(service: TenantMcpService) -> AxumRouter {
    let mcp = StreamableHttpService::new(
        move || Ok::<_, std::io::Error>(service.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    AxumRouter::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .fallback_service(mcp)
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
