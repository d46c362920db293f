//! Worker process state machine.
//!
//! ```text
//! Unstarted ─▶ AwaitingHandshake ─ping+pong─▶ AwaitingInitialize
//!                                                  │ initialize
//!                                                  ▼
//!                         Terminated ◀─ ShuttingDown ◀─ Ready ◀─ Initializing
//! ```
//!
//! The worker pings the host as soon as it starts, then handles messages in
//! arrival order. Initialize is the one long step and runs beside the read
//! loop. Every way out of the loop ends in exactly one call to the injected
//! [`Terminate`], carrying a reserved [`ExitCode`].

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};

use crate::capabilities::WorkerCapabilities;
use crate::config::BridgeConfig;
use crate::control::{CapabilityHandler, ControlPlaneClient};
use crate::deferred::DeferredError;
use crate::directory::{DirectoryCache, HttpProjectDirectory, StaticToken};
use crate::exit::{ExitCode, ProcessExit, Terminate};
use crate::handshake::{Handshake, Outbox, WORKER_PRE_HANDSHAKE};
use crate::ipc::{attached_to_parent, spawn_writer, IpcReader};
use crate::message::{Incoming, InitializeParams, Message, MessageBody, MessageKind};
use crate::projects::ProjectRequests;
use crate::realtime::{ConnectionManager, ConnectionTimeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unstarted,
    AwaitingHandshake,
    AwaitingInitialize,
    Initializing,
    Ready,
    ShuttingDown,
    Terminated,
}

/// Failure of one initialize step. Each maps to its own exit code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("control plane unreachable: {0}")]
    ControlPlane(String),
    #[error("realtime backend unreachable: {0}")]
    Backend(String),
    #[error("capability registration failed: {0}")]
    Registration(String),
}

impl ServiceError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ServiceError::ControlPlane(_) => ExitCode::ControlPlaneUnreachable,
            ServiceError::Backend(_) => ExitCode::BackendUnreachable,
            ServiceError::Registration(_) => ExitCode::RegistrationFailed,
        }
    }
}

/// What the worker needs from the outside world.
#[async_trait]
pub trait WorkerServices: Send + Sync {
    async fn connect_control_plane(&self, port: u16) -> Result<(), ServiceError>;

    async fn connect_backend(&self, params: &InitializeParams) -> Result<(), ServiceError>;

    async fn register_capabilities(&self) -> Result<(), ServiceError>;

    /// Project ids reported to the host; empty before initialize.
    async fn list_projects(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub stale_after: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for WorkerOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            stale_after: config.stale_after,
            handshake_timeout: config.handshake_timeout,
            request_timeout: config.request_timeout,
        }
    }
}

enum Flow {
    Continue,
    Initialize(InitializeParams),
    Exit(ExitCode, String),
}

type InitSteps = BoxFuture<'static, std::thread::Result<Result<(), ServiceError>>>;

/// Observes and drives a running worker from inside the same process.
#[derive(Clone)]
pub struct WorkerHandle {
    outbox: Outbox,
    projects: Arc<ProjectRequests>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn handshake(&self) -> Handshake {
        self.outbox.handshake()
    }

    pub async fn wait_for_state(&self, wanted: WorkerState) -> WorkerState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| *s == wanted).await.map(|s| *s);
        reached.unwrap_or_else(|_| *rx.borrow())
    }

    /// Ask the host for its project list.
    pub async fn request_projects(&self) -> Result<Vec<String>, DeferredError> {
        self.projects.request().await
    }
}

pub struct Worker {
    services: Arc<dyn WorkerServices>,
    options: WorkerOptions,
    outbox: Outbox,
    projects: Arc<ProjectRequests>,
    state: watch::Sender<WorkerState>,
    initialized: bool,
}

impl Worker {
    pub fn new(
        services: Arc<dyn WorkerServices>,
        options: WorkerOptions,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let outbox = Outbox::new(tx, WORKER_PRE_HANDSHAKE);
        let projects = Arc::new(ProjectRequests::new(outbox.clone(), options.request_timeout));
        let (state, _) = watch::channel(WorkerState::Unstarted);
        Self {
            services,
            options,
            outbox,
            projects,
            state,
            initialized: false,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            outbox: self.outbox.clone(),
            projects: self.projects.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    fn set_state(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::debug!("Worker state {previous:?} -> {next:?}");
        }
    }

    fn send(&self, body: MessageBody) {
        if let Err(e) = self.outbox.send(body) {
            log::warn!("Worker could not send: {e}");
        }
    }

    /// Run until shutdown. Returns the exit code and its reason; the caller
    /// hands both to the terminator.
    ///
    /// Initialize runs alongside the read loop: a shutdown request or signal
    /// ends the worker even while a connect hangs. Other messages that
    /// arrive meanwhile are held and handled once the worker is ready.
    pub async fn run<R>(
        mut self,
        reader: R,
        shutdown: impl Future<Output = ()>,
    ) -> (ExitCode, String)
    where
        R: AsyncRead + Unpin,
    {
        self.set_state(WorkerState::AwaitingHandshake);
        let mut reader = IpcReader::new(reader);
        if self.outbox.send(MessageBody::Ping).is_err() {
            self.set_state(WorkerState::Terminated);
            return (ExitCode::Graceful, "IPC channel closed before start".into());
        }

        tokio::pin!(shutdown);
        let deadline = tokio::time::sleep(self.options.handshake_timeout);
        tokio::pin!(deadline);
        let mut init: Option<InitSteps> = None;
        let mut held: VecDeque<Message> = VecDeque::new();

        let (code, reason) = 'run: loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break (ExitCode::Graceful, "termination signal".to_string()),
                _ = &mut deadline, if !self.outbox.handshake().is_complete() => {
                    break (
                        ExitCode::HandshakeTimeout,
                        format!("no handshake within {:?}", self.options.handshake_timeout),
                    );
                }
                outcome = async {
                    match init.as_mut() {
                        Some(steps) => steps.await,
                        None => std::future::pending().await,
                    }
                }, if init.is_some() => {
                    init = None;
                    match outcome {
                        Ok(Ok(())) => {
                            self.set_state(WorkerState::Ready);
                            log::info!("Worker ready");
                        }
                        Ok(Err(e)) => {
                            log::error!("Initialize failed: {e}");
                            break (e.exit_code(), e.to_string());
                        }
                        Err(panic) => break (ExitCode::UncaughtError, panic_message(&panic)),
                    }
                    while let Some(msg) = held.pop_front() {
                        if let Flow::Exit(code, reason) = self.process(msg, &mut init).await {
                            break 'run (code, reason);
                        }
                    }
                }
                frame = reader.next() => {
                    let msg = match frame {
                        None => {
                            break (ExitCode::Graceful, "IPC channel closed by parent".to_string());
                        }
                        Some(Err(e)) => {
                            log::warn!("Protocol error from host: {e}");
                            self.send(MessageBody::error(e.to_string()));
                            continue;
                        }
                        Some(Ok(Incoming::Unknown { type_name, id })) => {
                            log::warn!("Ignoring message #{id:?} of unknown type {type_name:?}");
                            continue;
                        }
                        Some(Ok(Incoming::Message(msg))) => msg,
                    };
                    if init.is_some() && !msg.is(MessageKind::Shutdown) {
                        log::debug!("Holding {} #{} until initialize finishes", msg.kind(), msg.id);
                        held.push_back(msg);
                        continue;
                    }
                    if let Flow::Exit(code, reason) = self.process(msg, &mut init).await {
                        break (code, reason);
                    }
                }
            }
        };

        self.set_state(WorkerState::ShuttingDown);
        self.projects.abandon("worker shutting down");
        self.set_state(WorkerState::Terminated);
        (code, reason)
    }

    /// Dispatch one message, starting the initialize steps when it asks for them.
    async fn process(&mut self, msg: Message, init: &mut Option<InitSteps>) -> Flow {
        match AssertUnwindSafe(self.dispatch(msg)).catch_unwind().await {
            Ok(Flow::Initialize(params)) => {
                *init = Some(self.initialize_steps(params));
                Flow::Continue
            }
            Ok(flow) => flow,
            Err(panic) => Flow::Exit(ExitCode::UncaughtError, panic_message(&panic)),
        }
    }

    async fn dispatch(&mut self, msg: Message) -> Flow {
        let kind = msg.kind();
        if kind.expires() && msg.is_stale(self.options.stale_after) {
            log::warn!("Discarding stale {kind} message #{}", msg.id);
            return Flow::Continue;
        }
        log::trace!("IPC recv {kind} #{}", msg.id);

        match msg.body {
            MessageBody::Ping => {
                self.outbox.mark_ping_received();
                self.send(MessageBody::Pong);
                self.check_handshake();
            }
            MessageBody::Pong => {
                self.outbox.mark_pong_received();
                self.check_handshake();
            }
            MessageBody::Initialize(params) => return self.begin_initialize(params),
            MessageBody::GetProjects => {
                let services = self.services.clone();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let projects = services.list_projects().await;
                    if let Err(e) = outbox.send(MessageBody::ProjectResults { projects }) {
                        log::warn!("Could not answer getProjects: {e}");
                    }
                });
            }
            MessageBody::ProjectResults { projects } => {
                self.projects.resolve(projects);
            }
            MessageBody::Error { message, stack } => {
                log::warn!("Host reported an error: {message}");
                if let Some(stack) = stack {
                    log::debug!("Host error stack: {stack}");
                }
            }
            MessageBody::Shutdown { reason } => {
                let reason = reason.unwrap_or_else(|| "shutdown requested".to_string());
                return Flow::Exit(ExitCode::Graceful, reason);
            }
        }
        Flow::Continue
    }

    fn check_handshake(&self) {
        if self.outbox.handshake().is_complete() && self.state() == WorkerState::AwaitingHandshake {
            log::info!("Handshake with host complete");
            self.set_state(WorkerState::AwaitingInitialize);
        }
    }

    fn begin_initialize(&mut self, params: InitializeParams) -> Flow {
        if self.initialized {
            log::warn!("Ignoring duplicate initialize");
            self.send(MessageBody::error("already initialized"));
            return Flow::Continue;
        }
        if !self.outbox.handshake().is_complete() {
            // The host only sends initialize after seeing our pong.
            log::info!("Initialize arrived before the handshake settled; treating it as liveness");
            self.outbox.mark_complete();
        }
        self.initialized = true;
        self.set_state(WorkerState::Initializing);
        log::info!("Initializing worker with {params:?}");
        Flow::Initialize(params)
    }

    /// Control plane, then backend, then registration; the first failure wins.
    fn initialize_steps(&self, params: InitializeParams) -> InitSteps {
        let services = self.services.clone();
        AssertUnwindSafe(async move {
            services.connect_control_plane(params.control_plane_port).await?;
            services.connect_backend(&params).await?;
            services.register_capabilities().await
        })
        .catch_unwind()
        .boxed()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic while handling message: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic while handling message: {s}")
    } else {
        "panic while handling message".to_string()
    }
}

/// Run a worker over the given pipes and terminate through `terminator`.
pub async fn serve<R, W>(
    services: Arc<dyn WorkerServices>,
    options: WorkerOptions,
    reader: R,
    writer: W,
    terminator: &dyn Terminate,
    shutdown: impl Future<Output = ()>,
) -> ExitCode
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, writer_task) = spawn_writer(writer);
    let worker = Worker::new(services, options, tx);
    let (code, reason) = worker.run(reader, shutdown).await;

    // Let queued replies reach the host before exiting.
    if tokio::time::timeout(Duration::from_secs(1), writer_task).await.is_err() {
        log::debug!("IPC writer still busy at exit");
    }
    terminator.terminate(code, &reason);
    code
}

/// Entry point of the `worker` subcommand: stdin/stdout IPC, OS signals,
/// real services, real process exit.
pub async fn run_worker_process(config: BridgeConfig) -> ExitCode {
    if !attached_to_parent() {
        ProcessExit.terminate(ExitCode::NotForked, "not started by a host process");
        return ExitCode::NotForked;
    }
    let services = Arc::new(LiveServices::new(config.clone()));
    serve(
        services,
        WorkerOptions::from(&config),
        tokio::io::stdin(),
        tokio::io::stdout(),
        &ProcessExit,
        termination_signal(),
    )
    .await
}

/// Resolves on SIGINT or SIGTERM.
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Production services: control-plane client, realtime connection manager
/// and the REST directory.
pub struct LiveServices {
    config: BridgeConfig,
    realtime: Arc<ConnectionManager>,
    directory: Arc<OnceLock<Arc<DirectoryCache>>>,
    capabilities: Arc<WorkerCapabilities>,
    control: Mutex<Option<ControlPlaneClient>>,
}

impl LiveServices {
    pub fn new(config: BridgeConfig) -> Self {
        let realtime = Arc::new(ConnectionManager::new(ConnectionTimeouts::from(&config)));
        let directory = Arc::new(OnceLock::new());
        let capabilities = Arc::new(WorkerCapabilities::new(realtime.clone(), directory.clone()));
        Self {
            config,
            realtime,
            directory,
            capabilities,
            control: Mutex::new(None),
        }
    }

    pub fn realtime(&self) -> &Arc<ConnectionManager> {
        &self.realtime
    }
}

#[async_trait]
impl WorkerServices for LiveServices {
    async fn connect_control_plane(&self, port: u16) -> Result<(), ServiceError> {
        let handler: Arc<dyn CapabilityHandler> = self.capabilities.clone();
        let client = ControlPlaneClient::connect(port, handler, self.config.connect_timeout)
            .await
            .map_err(|e| ServiceError::ControlPlane(e.to_string()))?;
        *self.control.lock().await = Some(client);
        Ok(())
    }

    async fn connect_backend(&self, params: &InitializeParams) -> Result<(), ServiceError> {
        let source = HttpProjectDirectory::new(
            params.http_base_url.clone(),
            Arc::new(StaticToken::new(params.auth_token.clone())),
            self.config.request_timeout,
        )
        .map_err(|e| ServiceError::Backend(e.to_string()))?;
        let cache = Arc::new(DirectoryCache::new(Arc::new(source), self.config.directory_throttle));
        if self.directory.set(cache).is_err() {
            log::debug!("Directory already configured");
        }

        self.realtime
            .connect(&params.ws_base_url, &params.auth_token)
            .await
            .map_err(|e| ServiceError::Backend(e.to_string()))
    }

    async fn register_capabilities(&self) -> Result<(), ServiceError> {
        let control = self.control.lock().await;
        let client = control
            .as_ref()
            .ok_or_else(|| ServiceError::Registration("control plane not connected".into()))?;
        client
            .register(self.capabilities.capabilities(), self.config.request_timeout)
            .await
            .map_err(|e| ServiceError::Registration(e.to_string()))
    }

    async fn list_projects(&self) -> Vec<String> {
        match self.directory.get() {
            Some(cache) => cache.get_available_projects(false).await.ids(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::RecordingExit;
    use crate::message::{now_ms, MessageEncoder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    #[derive(Default)]
    struct FakeServices {
        backend_calls: AtomicUsize,
        backend_delay: Option<Duration>,
        fail_backend: bool,
        panic_on_register: bool,
    }

    #[async_trait]
    impl WorkerServices for FakeServices {
        async fn connect_control_plane(&self, _port: u16) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn connect_backend(&self, _params: &InitializeParams) -> Result<(), ServiceError> {
            self.backend_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.backend_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_backend {
                return Err(ServiceError::Backend("refused".into()));
            }
            Ok(())
        }

        async fn register_capabilities(&self) -> Result<(), ServiceError> {
            if self.panic_on_register {
                panic!("registry exploded");
            }
            Ok(())
        }

        async fn list_projects(&self) -> Vec<String> {
            vec!["p1".into()]
        }
    }

    fn params() -> InitializeParams {
        InitializeParams {
            auth_token: "tok".into(),
            http_base_url: "http://127.0.0.1:1/api".into(),
            ws_base_url: "ws://127.0.0.1:1".into(),
            control_plane_port: 1,
        }
    }

    /// A running worker with the host's ends of both pipes.
    struct Harness {
        encoder: MessageEncoder,
        to_worker: mpsc::UnboundedSender<Message>,
        from_worker: IpcReader<DuplexStream>,
        handle: WorkerHandle,
        task: JoinHandle<(ExitCode, String)>,
    }

    impl Harness {
        fn start(services: Arc<FakeServices>) -> Self {
            Self::with_shutdown(services, std::future::pending())
        }

        fn with_shutdown(
            services: Arc<FakeServices>,
            shutdown: impl Future<Output = ()> + Send + 'static,
        ) -> Self {
            let (host_out, worker_in) = tokio::io::duplex(16 * 1024);
            let (worker_out, host_in) = tokio::io::duplex(16 * 1024);
            let (tx, _writer) = spawn_writer(worker_out);
            let worker = Worker::new(services, WorkerOptions::default(), tx);
            let handle = worker.handle();
            let task = tokio::spawn(worker.run(worker_in, shutdown));
            let (to_worker, _host_writer) = spawn_writer(host_out);
            Self {
                encoder: MessageEncoder::new(),
                to_worker,
                from_worker: IpcReader::new(host_in),
                handle,
                task,
            }
        }

        fn send(&self, body: MessageBody) {
            self.to_worker.send(self.encoder.encode(body)).unwrap();
        }

        fn send_stamped(&self, body: MessageBody, timestamp: i64) {
            let mut msg = self.encoder.encode(body);
            msg.timestamp = timestamp;
            self.to_worker.send(msg).unwrap();
        }

        fn handshake(&self) {
            self.send(MessageBody::Ping);
            self.send(MessageBody::Pong);
        }

        async fn next_of(&mut self, kind: MessageKind) -> Message {
            let reader = &mut self.from_worker;
            let found = async {
                loop {
                    match reader.next().await {
                        Some(Ok(Incoming::Message(msg))) if msg.is(kind) => return msg,
                        Some(_) => continue,
                        None => panic!("worker closed its pipe before sending {kind}"),
                    }
                }
            };
            timeout(Duration::from_secs(5), found).await.expect("worker replied in time")
        }

        async fn reach(&self, state: WorkerState) {
            timeout(Duration::from_secs(5), self.handle.wait_for_state(state))
                .await
                .expect("worker reached the state in time");
        }

        async fn finish(self) -> (ExitCode, String) {
            timeout(Duration::from_secs(5), self.task)
                .await
                .expect("worker stopped in time")
                .unwrap()
        }
    }

    #[test]
    fn test_service_errors_map_to_distinct_codes() {
        assert_eq!(
            ServiceError::ControlPlane("x".into()).exit_code(),
            ExitCode::ControlPlaneUnreachable
        );
        assert_eq!(ServiceError::Backend("x".into()).exit_code(), ExitCode::BackendUnreachable);
        assert_eq!(
            ServiceError::Registration("x".into()).exit_code(),
            ExitCode::RegistrationFailed
        );
    }

    #[tokio::test]
    async fn test_duplicate_initialize_yields_one_error() {
        let services = Arc::new(FakeServices::default());
        let mut h = Harness::start(services.clone());
        h.handshake();
        h.send(MessageBody::Initialize(params()));
        h.send(MessageBody::Initialize(params()));

        let error = h.next_of(MessageKind::Error).await;
        assert_eq!(error.body, MessageBody::error("already initialized"));
        h.reach(WorkerState::Ready).await;
        assert_eq!(services.backend_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_data_messages_are_discarded_but_shutdown_is_not() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let services = Arc::new(FakeServices::default());
        let mut worker = Worker::new(services, WorkerOptions::default(), tx);
        worker.outbox.mark_complete();
        let encoder = MessageEncoder::new();

        let mut request = encoder.encode(MessageBody::GetProjects);
        request.timestamp -= 60_000;
        assert!(matches!(worker.dispatch(request).await, Flow::Continue));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        let mut shutdown = encoder.encode(MessageBody::Shutdown { reason: None });
        shutdown.timestamp -= 60_000;
        assert!(matches!(
            worker.dispatch(shutdown).await,
            Flow::Exit(ExitCode::Graceful, _)
        ));
    }

    #[tokio::test]
    async fn test_late_handshake_and_initialize_are_still_honored() {
        let mut h = Harness::start(Arc::new(FakeServices::default()));
        let long_ago = now_ms() - 60_000;
        h.send_stamped(MessageBody::Ping, long_ago);
        h.send_stamped(MessageBody::Pong, long_ago);

        h.next_of(MessageKind::Pong).await;
        h.reach(WorkerState::AwaitingInitialize).await;
        assert!(h.handle.handshake().is_complete());

        h.send_stamped(MessageBody::Initialize(params()), long_ago);
        h.reach(WorkerState::Ready).await;
    }

    #[tokio::test]
    async fn test_absurd_timestamps_do_not_end_the_worker() {
        let mut h = Harness::start(Arc::new(FakeServices::default()));
        h.send(MessageBody::Ping);
        h.send_stamped(MessageBody::Pong, i64::MIN);
        h.reach(WorkerState::AwaitingInitialize).await;

        h.send_stamped(MessageBody::GetProjects, i64::MIN);
        h.send_stamped(MessageBody::GetProjects, i64::MAX);
        let answer = h.next_of(MessageKind::ProjectResults).await;
        assert_eq!(answer.body, MessageBody::ProjectResults { projects: vec!["p1".into()] });
        assert!(!h.task.is_finished());

        h.send(MessageBody::Shutdown { reason: None });
        assert_eq!(h.finish().await, (ExitCode::Graceful, "shutdown requested".to_string()));
    }

    #[tokio::test]
    async fn test_backend_failure_exits_with_backend_code() {
        let h = Harness::start(Arc::new(FakeServices {
            fail_backend: true,
            ..FakeServices::default()
        }));
        h.handshake();
        h.send(MessageBody::Initialize(params()));
        let (code, reason) = h.finish().await;
        assert_eq!(code, ExitCode::BackendUnreachable);
        assert!(reason.contains("refused"), "{reason}");
    }

    #[tokio::test]
    async fn test_shutdown_request_interrupts_hanging_initialize() {
        let services = Arc::new(FakeServices {
            backend_delay: Some(Duration::from_secs(30)),
            ..FakeServices::default()
        });
        let h = Harness::start(services.clone());
        h.handshake();
        h.send(MessageBody::Initialize(params()));
        h.reach(WorkerState::Initializing).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        h.send(MessageBody::GetProjects);
        h.send(MessageBody::Shutdown {
            reason: Some("host closing".into()),
        });
        let (code, reason) = h.finish().await;
        assert_eq!(code, ExitCode::Graceful);
        assert_eq!(reason, "host closing");
        assert_eq!(services.backend_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_termination_signal_interrupts_hanging_initialize() {
        let services = Arc::new(FakeServices {
            backend_delay: Some(Duration::from_secs(30)),
            ..FakeServices::default()
        });
        let h = Harness::with_shutdown(services, tokio::time::sleep(Duration::from_millis(300)));
        h.handshake();
        h.send(MessageBody::Initialize(params()));
        h.reach(WorkerState::Initializing).await;

        let (code, reason) = h.finish().await;
        assert_eq!(code, ExitCode::Graceful);
        assert_eq!(reason, "termination signal");
    }

    #[tokio::test]
    async fn test_requests_during_initialize_are_answered_once_ready() {
        let services = Arc::new(FakeServices {
            backend_delay: Some(Duration::from_millis(200)),
            ..FakeServices::default()
        });
        let mut h = Harness::start(services);
        h.handshake();
        h.send(MessageBody::Initialize(params()));
        h.reach(WorkerState::Initializing).await;
        h.send(MessageBody::GetProjects);

        let answer = h.next_of(MessageKind::ProjectResults).await;
        assert_eq!(answer.body, MessageBody::ProjectResults { projects: vec!["p1".into()] });
        assert_eq!(h.handle.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_serve_exits_gracefully_when_parent_closes_pipe() {
        let (host_end, worker_end) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker_end);
        drop(host_end);

        let exit = RecordingExit::new();
        let code = serve(
            Arc::new(FakeServices::default()),
            WorkerOptions::default(),
            worker_read,
            worker_write,
            &exit,
            std::future::pending(),
        )
        .await;
        assert_eq!(code, ExitCode::Graceful);
        assert_eq!(exit.last_code(), Some(ExitCode::Graceful));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_host_times_out_handshake() {
        let (host_end, worker_end) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker_end);

        let exit = RecordingExit::new();
        let code = serve(
            Arc::new(FakeServices::default()),
            WorkerOptions::default(),
            worker_read,
            worker_write,
            &exit,
            std::future::pending(),
        )
        .await;
        assert_eq!(code, ExitCode::HandshakeTimeout);
        drop(host_end);
    }

    #[tokio::test]
    async fn test_shutdown_signal_is_graceful() {
        let (_host_end, worker_end) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker_end);

        let exit = RecordingExit::new();
        let code = serve(
            Arc::new(FakeServices::default()),
            WorkerOptions::default(),
            worker_read,
            worker_write,
            &exit,
            async {},
        )
        .await;
        assert_eq!(code, ExitCode::Graceful);
        assert_eq!(exit.calls()[0].1, "termination signal");
    }

    #[tokio::test]
    async fn test_panicking_handler_exits_with_uncaught_code() {
        let (host_end, worker_end) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker_end);
        let (_host_read, host_write) = tokio::io::split(host_end);
        let (to_worker, _writer) = spawn_writer(host_write);
        let encoder = MessageEncoder::new();
        for body in [MessageBody::Ping, MessageBody::Pong, MessageBody::Initialize(params())] {
            to_worker.send(encoder.encode(body)).unwrap();
        }

        let services = Arc::new(FakeServices {
            panic_on_register: true,
            ..FakeServices::default()
        });
        let exit = RecordingExit::new();
        let code = serve(
            services,
            WorkerOptions::default(),
            worker_read,
            worker_write,
            &exit,
            std::future::pending(),
        )
        .await;
        assert_eq!(code, ExitCode::UncaughtError);
        assert!(exit.calls()[0].1.contains("registry exploded"));
    }
}
