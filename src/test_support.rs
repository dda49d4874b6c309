//! Shared helpers for unit tests.
use crate::window::Surface;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};

static PROCESS_HOOKS: Mutex<()> = Mutex::new(());

/// Serializes tests that touch signal dispositions or the panic hook.
pub fn process_hooks() -> MutexGuard<'static, ()> {
    PROCESS_HOOKS.lock().unwrap_or_else(|e| e.into_inner())
}

/// What a [`RecordingSurface`] has been asked to do.
#[derive(Debug, Default)]
pub struct SurfaceLog {
    pub presented: usize,
    pub titles: Vec<String>,
    pub closed: usize,
    pub errors: Vec<(String, String)>,
}

/// Surface that records calls instead of rendering anything.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    log: Rc<RefCell<SurfaceLog>>,
}

impl RecordingSurface {
    pub fn new() -> (Self, Rc<RefCell<SurfaceLog>>) {
        let surface = Self::default();
        let log = Rc::clone(&surface.log);
        (surface, log)
    }
}

impl Surface for RecordingSurface {
    fn present(&mut self, title: &str) {
        let mut log = self.log.borrow_mut();
        log.presented += 1;
        log.titles.push(title.to_string());
    }

    fn show_error(&mut self, title: &str, message: &str) {
        self.log
            .borrow_mut()
            .errors
            .push((title.to_string(), message.to_string()));
    }

    fn close(&mut self) {
        self.log.borrow_mut().closed += 1;
    }
}
