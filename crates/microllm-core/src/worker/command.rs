//! Commands carried over the session lane, and how the lane runs them.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use crossbeam_channel::Receiver;
use tokio::sync::oneshot;

use microllm_abi::backend::{Message, NativeEngine};

use super::stop::StopSignal;
use crate::conversation::ConversationView;
use crate::engine::{
    ConversationOutcome, GenerationRequest, GenerationResult, LoadOutcome, SessionEngine,
};
use crate::error::{Result, SessionError};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    Load {
        path: PathBuf,
        context_size: u32,
        threads: u32,
        reply: Reply<LoadOutcome>,
    },
    Unload {
        reply: Reply<()>,
    },
    Reset {
        reply: Reply<()>,
    },
    SetConversation {
        language: String,
        messages: Vec<Message>,
        reply: Reply<ConversationOutcome>,
    },
    Generate {
        request: GenerationRequest,
        stop: StopSignal,
        reply: Reply<GenerationResult>,
    },
    Inspect {
        reply: Reply<ConversationView>,
    },
    Shutdown,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Load { .. } => "load",
            Command::Unload { .. } => "unload",
            Command::Reset { .. } => "reset",
            Command::SetConversation { .. } => "set_conversation",
            Command::Generate { request, .. } if request.isolated => "generate_isolated",
            Command::Generate { .. } => "converse",
            Command::Inspect { .. } => "inspect",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Body of the session thread: one command at a time, in arrival order.
pub(crate) fn run_lane<B: NativeEngine>(mut engine: SessionEngine<B>, rx: Receiver<Command>) {
    tracing::debug!("session lane started");
    while let Ok(cmd) = rx.recv() {
        if matches!(cmd, Command::Shutdown) {
            break;
        }
        tracing::trace!(command = cmd.name(), "dispatch");
        execute(&mut engine, cmd);
    }
    if engine.is_model_loaded() {
        if let Err(e) = engine.unload_model() {
            tracing::warn!(error = %e, "unload on shutdown failed");
        }
    }
    tracing::debug!("session lane stopped");
}

fn execute<B: NativeEngine>(engine: &mut SessionEngine<B>, cmd: Command) {
    match cmd {
        Command::Load {
            path,
            context_size,
            threads,
            reply,
        } => respond(
            reply,
            guarded(engine, |e| e.load_model(&path, context_size, threads)),
        ),
        Command::Unload { reply } => respond(reply, guarded(engine, |e| e.unload_model())),
        Command::Reset { reply } => respond(reply, guarded(engine, |e| e.reset_conversation())),
        Command::SetConversation {
            language,
            messages,
            reply,
        } => respond(
            reply,
            guarded(engine, |e| e.set_conversation(&language, messages)),
        ),
        Command::Generate {
            request,
            stop,
            reply,
        } => respond(reply, guarded(engine, |e| e.generate(&request, &stop))),
        Command::Inspect { reply } => respond(reply, Ok(engine.conversation())),
        Command::Shutdown => {}
    }
}

/// Run one handler; a panic fails only this command and poisons the cache.
fn guarded<B, T, F>(engine: &mut SessionEngine<B>, f: F) -> Result<T>
where
    B: NativeEngine,
    F: FnOnce(&mut SessionEngine<B>) -> Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(engine))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(panic = %msg, "command panicked; cache marked stale");
            engine.poison_cache();
            Err(SessionError::Panicked(msg))
        }
    }
}

fn respond<T>(reply: Reply<T>, result: Result<T>) {
    // The caller may have given up waiting.
    let _ = reply.send(result);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
