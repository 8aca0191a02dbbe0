//! Command Serializer and the asynchronous caller API.
//!
//! ```text
//! caller tasks ── Command + oneshot ──> [microllm-session thread]
//!      ^                                  owns SessionEngine<B>
//!      └──────────── Result<T> ───────────┘
//! ```
//!
//! The lane runs commands strictly in submission order. Generations can be
//! cancelled cooperatively through `CancelRegistry`; `is_model_loaded` is
//! answered from a shared flag without queueing.

pub(crate) mod command;
pub mod stop;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Sender, unbounded};
use tokio::sync::oneshot;

use microllm_abi::backend::{Message, NativeEngine};

use crate::config::SessionConfig;
use crate::conversation::ConversationView;
use crate::engine::{
    ConversationOutcome, GenerationRequest, GenerationResult, LoadOutcome, SessionEngine,
};
use crate::error::{Result, SessionError};
use command::{Command, Reply, run_lane};
use stop::{CancelRegistry, StopSignal};

const LANE_THREAD_NAME: &str = "microllm-session";

/// Handle to a running session lane. Dropping it cancels generations, drains
/// the queue and stops the lane.
pub struct SessionHandle {
    cmd_tx: Sender<Command>,
    loaded: Arc<AtomicBool>,
    cancel: Arc<CancelRegistry>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SessionHandle {
    /// Move `backend` onto a dedicated thread and start serving commands.
    pub fn spawn<B>(backend: B, config: SessionConfig) -> Result<Self>
    where
        B: NativeEngine + Send + 'static,
    {
        Self::spawn_engine(SessionEngine::new(backend, config))
    }

    pub fn spawn_engine<B>(engine: SessionEngine<B>) -> Result<Self>
    where
        B: NativeEngine + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = unbounded::<Command>();
        let loaded = engine.loaded_flag();
        let thread = thread::Builder::new()
            .name(LANE_THREAD_NAME.into())
            .spawn(move || run_lane(engine, cmd_rx))?;

        Ok(Self {
            cmd_tx,
            loaded,
            cancel: CancelRegistry::new(),
            thread: Some(thread),
        })
    }

    async fn call<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| SessionError::WorkerUnavailable)?;
        rx.await.map_err(|_| SessionError::WorkerUnavailable)?
    }

    /// Load a model; queued generations are cancelled first.
    pub async fn load_model<P: AsRef<Path>>(
        &self,
        path: P,
        context_size: u32,
        threads: u32,
    ) -> Result<LoadOutcome> {
        self.cancel.cancel_all();
        let path = path.as_ref().to_path_buf();
        self.call(|reply| Command::Load {
            path,
            context_size,
            threads,
            reply,
        })
        .await
    }

    /// Unload, preempting any running or queued generation.
    pub async fn unload_model(&self) -> Result<()> {
        self.cancel.cancel_all();
        self.call(|reply| Command::Unload { reply }).await
    }

    #[inline]
    pub fn is_model_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Forget the history, preempting any running or queued generation.
    pub async fn reset_conversation(&self) -> Result<()> {
        self.cancel.cancel_all();
        self.call(|reply| Command::Reset { reply }).await
    }

    pub async fn set_conversation<S: Into<String>>(
        &self,
        language: S,
        messages: Vec<Message>,
    ) -> Result<ConversationOutcome> {
        let language = language.into();
        self.call(|reply| Command::SetConversation {
            language,
            messages,
            reply,
        })
        .await
    }

    /// Incremental chat turn.
    pub async fn converse(&self, mut request: GenerationRequest) -> Result<GenerationResult> {
        request.isolated = false;
        self.generate(request).await
    }

    /// History-independent generation; the conversation is left as it was.
    pub async fn generate_isolated(
        &self,
        mut request: GenerationRequest,
    ) -> Result<GenerationResult> {
        request.isolated = true;
        self.generate(request).await
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let stop = StopSignal::issue(&self.cancel);
        self.call(|reply| Command::Generate {
            request,
            stop,
            reply,
        })
        .await
    }

    /// Stop the running generation and drop queued ones.
    pub fn cancel_generation(&self) {
        tracing::debug!("generation cancel requested");
        self.cancel.cancel_all();
    }

    /// Snapshot of the conversation as the lane sees it.
    pub async fn conversation(&self) -> Result<ConversationView> {
        self.call(|reply| Command::Inspect { reply }).await
    }

    /// Drain queued commands, unload, and join the lane.
    pub fn shutdown(mut self) {
        self.stop_lane();
    }

    fn stop_lane(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("session lane panicked");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel.cancel_all();
        }
        self.stop_lane();
    }
}
