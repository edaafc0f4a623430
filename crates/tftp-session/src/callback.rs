//! Callback slots
//!
//! A slot holds at most one user callback. The callback owns whatever
//! context it needs, so there is no separate context pointer to keep in
//! sync with it.

use std::io;
use std::sync::Arc;

use tftp::{FileHandle, OpenMode, OpenedFile};

use crate::section::Section;
use crate::status::OperationResult;

/// Client error callback: TFTP error code and message
pub type ErrorCallback = Box<dyn FnMut(u16, &str) -> OperationResult + Send>;
/// Client fetch progress: payload size of each received block
pub type FetchProgressCallback = Box<dyn FnMut(usize) -> OperationResult + Send>;
/// Client option acknowledgment: option name and accepted value
pub type OptionAcceptedCallback = Box<dyn FnMut(&str, &str) -> OperationResult + Send>;

pub type OpenFileCallback = Arc<dyn Fn(&Section<'_>, &str, OpenMode) -> io::Result<OpenedFile> + Send + Sync>;
pub type CloseFileCallback = Arc<dyn Fn(&Section<'_>, FileHandle) -> io::Result<()> + Send + Sync>;
/// Section lifecycle callback (started, finished)
pub type SectionCallback = Arc<dyn Fn(&Section<'_>) -> OperationResult + Send + Sync>;

/// Zero or one registered callback of one kind
#[derive(Clone)]
pub struct CallbackSlot<P> {
    callback: Option<P>,
}

impl<P> Default for CallbackSlot<P> {
    fn default() -> Self {
        Self { callback: None }
    }
}

impl<P> CallbackSlot<P> {
    pub fn set(&mut self, callback: P) {
        self.callback = Some(callback);
    }

    pub fn clear(&mut self) {
        self.callback = None;
    }

    pub fn is_registered(&self) -> bool {
        self.callback.is_some()
    }

    /// Run the registered callback, or `default` when the slot is empty
    pub fn dispatch<R>(&self, call: impl FnOnce(&P) -> R, default: impl FnOnce() -> R) -> R {
        match &self.callback {
            Some(callback) => call(callback),
            None => default(),
        }
    }

    /// Like [`dispatch`](Self::dispatch), moving `arg` into whichever branch runs
    pub fn dispatch_with<A, R>(&self, arg: A, call: impl FnOnce(&P, A) -> R, default: impl FnOnce(A) -> R) -> R {
        match &self.callback {
            Some(callback) => call(callback, arg),
            None => default(arg),
        }
    }

    /// Like [`dispatch`](Self::dispatch) for callbacks that need `&mut`
    pub fn dispatch_mut<R>(&mut self, call: impl FnOnce(&mut P) -> R, default: impl FnOnce() -> R) -> R {
        match &mut self.callback {
            Some(callback) => call(callback),
            None => default(),
        }
    }
}

/// Callbacks of a [`TftpClient`](crate::TftpClient)
#[derive(Default)]
pub struct ClientCallbacks {
    pub error: CallbackSlot<ErrorCallback>,
    pub fetch_progress: CallbackSlot<FetchProgressCallback>,
    pub option_accepted: CallbackSlot<OptionAcceptedCallback>,
}

impl ClientCallbacks {
    pub fn clear(&mut self) {
        self.error.clear();
        self.fetch_progress.clear();
        self.option_accepted.clear();
    }
}

/// Callbacks of a [`TftpServer`](crate::TftpServer); cloning shares the
/// registered closures
#[derive(Clone, Default)]
pub struct ServerCallbacks {
    pub open_file: CallbackSlot<OpenFileCallback>,
    pub close_file: CallbackSlot<CloseFileCallback>,
    pub section_started: CallbackSlot<SectionCallback>,
    pub section_finished: CallbackSlot<SectionCallback>,
}

impl ServerCallbacks {
    pub fn clear(&mut self) {
        self.open_file.clear();
        self.close_file.clear();
        self.section_started.clear();
        self.section_finished.clear();
    }
}
