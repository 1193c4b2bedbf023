use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as SyncMutex;

use super::session::ExitOutcome;
use crate::error::Result;

/// The shell hosting an exam: focus and fullscreen listeners, fullscreen
/// control, and navigation away once the exam is over.
pub trait ExamWindow: Send + Sync {
    fn attach_listeners(&self);
    fn detach_listeners(&self);
    fn is_fullscreen(&self) -> bool;
    fn request_fullscreen(&self) -> Result<()>;
    fn exit_fullscreen(&self);
    fn leave(&self, outcome: ExitOutcome);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCall {
    AttachListeners,
    DetachListeners,
    RequestFullscreen,
    ExitFullscreen,
    Leave(ExitOutcome),
}

/// Window for terminal and test shells: keeps fullscreen as a flag and
/// records every call in order.
#[derive(Default)]
pub struct HeadlessWindow {
    fullscreen: AtomicBool,
    listening: AtomicBool,
    calls: SyncMutex<Vec<WindowCall>>,
}

impl HeadlessWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors the user leaving fullscreen outside the session's control.
    pub fn set_fullscreen(&self, fullscreen: bool) {
        self.fullscreen.store(fullscreen, Ordering::SeqCst);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<WindowCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: WindowCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl ExamWindow for HeadlessWindow {
    fn attach_listeners(&self) {
        self.listening.store(true, Ordering::SeqCst);
        self.record(WindowCall::AttachListeners);
    }

    fn detach_listeners(&self) {
        self.listening.store(false, Ordering::SeqCst);
        self.record(WindowCall::DetachListeners);
    }

    fn is_fullscreen(&self) -> bool {
        self.fullscreen.load(Ordering::SeqCst)
    }

    fn request_fullscreen(&self) -> Result<()> {
        self.fullscreen.store(true, Ordering::SeqCst);
        self.record(WindowCall::RequestFullscreen);
        Ok(())
    }

    fn exit_fullscreen(&self) {
        self.fullscreen.store(false, Ordering::SeqCst);
        self.record(WindowCall::ExitFullscreen);
    }

    fn leave(&self, outcome: ExitOutcome) {
        self.record(WindowCall::Leave(outcome));
    }
}
