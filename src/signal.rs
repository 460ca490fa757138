//! Ctrl+C handling.
//!
//! The handler only raises a flag. The child process in the foreground gets
//! the same SIGINT and exits, the pipeline notices the flag as soon as control
//! returns, and cleanup runs before the process ends.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ui;

/// Set once the user asks the deployment to stop.
#[derive(Debug, Clone)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    /// Create a flag and route SIGINT into it.
    ///
    /// Registration can only happen once per process. When it fails a warning
    /// is printed, since Ctrl+C would then end the process without cleanup;
    /// the returned flag can still be triggered by hand.
    pub fn install() -> Self {
        let flag = Self::manual();
        if let Err(err) = flag.register() {
            ui::warning(&format!(
                "Could not install Ctrl+C handler ({err}); interrupting will skip cleanup"
            ));
        }
        flag
    }

    /// Route SIGINT into this flag.
    pub fn register(&self) -> Result<(), ctrlc::Error> {
        let handle = self.flag.clone();
        ctrlc::set_handler(move || {
            handle.store(true, Ordering::SeqCst);
        })
    }

    /// Flag with no signal handler attached.
    pub fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once the flag is set.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_set() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// The user stopped the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deployment interrupted by user")
    }
}

impl std::error::Error for Interrupted {}

/// True if `err` or anything in its chain is [`Interrupted`].
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Interrupted>())
}
