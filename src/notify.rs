// =============================================================================
// Notifier — fire-and-forget side channel for user-facing toasts (spec.md §6)
// =============================================================================
//
// The core never awaits a notification. A real toast/desktop notifier is an
// external collaborator (spec.md §1); the default implementation here only
// logs via `tracing` at a level derived from severity.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::types::Severity;

/// Single fire-and-forget entry point the core calls on circuit-breaker
/// transitions and Rejected orders. Implementations must not block —
/// callers spawn the call onto its own task and never await it.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Default notifier: routes every message through `tracing` at a level
/// derived from `severity`. A real desktop/toast notifier observes these
/// log lines externally; this crate does not render them itself.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => info!(target: "notify", "{message}"),
            Severity::Warning => warn!(target: "notify", "{message}"),
            Severity::Critical => error!(target: "notify", "{message}"),
        }
    }
}

/// Spawns `notifier.notify(..)` onto its own task so the caller never
/// awaits delivery (spec.md §6: "never awaits it").
pub fn fire_and_forget(notifier: Arc<dyn Notifier>, message: String, severity: Severity) {
    tokio::task::spawn_blocking(move || {
        notifier.notify(&message, severity);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNotifier {
        count: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, _message: &str, _severity: Severity) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tracing_notifier_does_not_panic_on_any_severity() {
        let n = TracingNotifier;
        n.notify("test info", Severity::Info);
        n.notify("test warn", Severity::Warning);
        n.notify("test critical", Severity::Critical);
    }

    #[tokio::test]
    async fn fire_and_forget_eventually_delivers() {
        let notifier = Arc::new(CountingNotifier { count: AtomicUsize::new(0) });
        fire_and_forget(notifier.clone(), "hi".into(), Severity::Info);
        // give the spawned blocking task a chance to run
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(notifier.count.load(Ordering::SeqCst), 1);
    }
}
