//! Optional hooks the orchestrator consults between steps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::tools::SharedTodoList;

#[async_trait]
pub trait Capabilities: Send + Sync {
    /// Reminder block for unfinished tasks, appended to the outgoing request.
    async fn outstanding_tasks(&self) -> Option<String> {
        None
    }

    /// Whether the operator asked to stop the current turn.
    fn interruption_requested(&self) -> bool {
        false
    }

    /// Called once an interruption has been repaired.
    fn clear_interruption(&self) {}
}

/// No todo list, never interrupted.
pub struct NoCapabilities;

#[async_trait]
impl Capabilities for NoCapabilities {}

/// Todo-list backed capabilities with an interrupt flag.
pub struct SessionCapabilities {
    todos: Option<SharedTodoList>,
    interrupt: Arc<AtomicBool>,
}

impl SessionCapabilities {
    pub fn new(todos: Option<SharedTodoList>) -> Self {
        Self::with_interrupt_flag(todos, Arc::new(AtomicBool::new(false)))
    }

    /// Use an interrupt flag owned by someone else.
    pub fn with_interrupt_flag(todos: Option<SharedTodoList>, interrupt: Arc<AtomicBool>) -> Self {
        Self { todos, interrupt }
    }

    /// Flag shared with whoever can request an interruption.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }
}

#[async_trait]
impl Capabilities for SessionCapabilities {
    async fn outstanding_tasks(&self) -> Option<String> {
        let todos = self.todos.as_ref()?;
        todos.lock().await.outstanding_summary()
    }

    fn interruption_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn clear_interruption(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
    }
}
