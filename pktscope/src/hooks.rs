use anyhow::Context as _;
use std::sync::Arc;

use crate::dispatch::{HookDispatcher, SnifferContext};
use crate::record::Stage;

/// A request to start observing one stage.
#[derive(Clone)]
pub struct HookRequest {
    pub stage: Stage,
    /// Lower runs earlier.
    pub priority: u16,
    pub dispatcher: HookDispatcher,
}

/// Something that can deliver packets at an interception stage.
///
/// While a hook is registered its dispatcher is invoked once per packet seen
/// at that stage. Once `unregister` returns, the dispatcher is never invoked
/// again.
pub trait InterceptionService {
    type Handle;

    fn register(&mut self, request: HookRequest) -> anyhow::Result<Self::Handle>;

    fn unregister(&mut self, handle: Self::Handle) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Unregistered,
    Registered,
}

/// Owns the registered hooks for the lifetime of the agent.
pub struct Sniffer<S: InterceptionService> {
    service: S,
    ctx: Arc<SnifferContext>,
    hooks: Vec<(Stage, S::Handle)>,
}

impl<S: InterceptionService> Sniffer<S> {
    /// Register one hook per `(stage, priority)` pair, in order.
    ///
    /// Registration is all-or-nothing: if any stage fails, the hooks that were
    /// already registered are torn down again before the error is returned.
    pub fn start(
        mut service: S,
        ctx: Arc<SnifferContext>,
        stages: &[(Stage, u16)],
    ) -> anyhow::Result<Self> {
        let mut hooks: Vec<(Stage, S::Handle)> = Vec::with_capacity(stages.len());

        for &(stage, priority) in stages {
            let request = HookRequest {
                stage,
                priority,
                dispatcher: HookDispatcher::new(stage, ctx.clone()),
            };
            match service.register(request) {
                Ok(handle) => {
                    tracing::info!(%stage, priority, "hook registered");
                    hooks.push((stage, handle));
                }
                Err(e) => {
                    rollback(&mut service, hooks);
                    return Err(e).with_context(|| format!("failed to register {stage} hook"));
                }
            }
        }

        Ok(Self {
            service,
            ctx,
            hooks,
        })
    }

    pub fn context(&self) -> &Arc<SnifferContext> {
        &self.ctx
    }

    pub fn state(&self, stage: Stage) -> HookState {
        if self.hooks.iter().any(|(s, _)| *s == stage) {
            HookState::Registered
        } else {
            HookState::Unregistered
        }
    }

    /// Unregister every hook. All hooks are attempted; the first failure is
    /// returned.
    pub fn shutdown(mut self) -> anyhow::Result<S> {
        let mut first_err = None;
        while let Some((stage, handle)) = self.hooks.pop() {
            match self.service.unregister(handle) {
                Ok(()) => tracing::info!(%stage, "hook unregistered"),
                Err(e) => {
                    tracing::error!(%stage, "failed to unregister hook: {:#}", e);
                    if first_err.is_none() {
                        first_err = Some(e.context(format!("failed to unregister {stage} hook")));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(self.service),
        }
    }
}

fn rollback<S: InterceptionService>(service: &mut S, mut hooks: Vec<(Stage, S::Handle)>) {
    while let Some((stage, handle)) = hooks.pop() {
        if let Err(e) = service.unregister(handle) {
            tracing::error!(%stage, "rollback: failed to unregister hook: {:#}", e);
        } else {
            tracing::debug!(%stage, "rollback: hook unregistered");
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::dispatch::Verdict;
    use std::sync::Mutex;

    /// In-memory service: dispatchers are kept in a table and fed by hand.
    /// The journal is shared so tests can inspect it after the service has
    /// been moved into a `Sniffer` or dropped by a failed start.
    #[derive(Default)]
    pub struct MockService {
        pub active: Vec<(usize, HookRequest)>,
        pub fail_on: Option<Stage>,
        pub journal: Arc<Mutex<Vec<String>>>,
        next_id: usize,
    }

    impl MockService {
        /// A service that refuses to register `stage`.
        pub fn failing_on(stage: Stage) -> Self {
            Self {
                fail_on: Some(stage),
                ..Self::default()
            }
        }

        pub fn entries(&self) -> Vec<String> {
            self.journal.lock().unwrap().clone()
        }

        pub fn deliver(&self, stage: Stage, raw: &[u8]) -> Vec<Verdict> {
            self.active
                .iter()
                .filter(|(_, r)| r.stage == stage)
                .map(|(_, r)| r.dispatcher.on_packet(raw))
                .collect()
        }
    }

    impl InterceptionService for MockService {
        type Handle = usize;

        fn register(&mut self, request: HookRequest) -> anyhow::Result<usize> {
            if self.fail_on == Some(request.stage) {
                anyhow::bail!("stage {} unavailable", request.stage);
            }
            let id = self.next_id;
            self.next_id += 1;
            self.journal
                .lock()
                .unwrap()
                .push(format!("register {} prio {}", request.stage, request.priority));
            self.active.push((id, request));
            Ok(id)
        }

        fn unregister(&mut self, handle: usize) -> anyhow::Result<()> {
            let pos = self
                .active
                .iter()
                .position(|(id, _)| *id == handle)
                .context("unknown handle")?;
            let (_, request) = self.active.remove(pos);
            self.journal
                .lock()
                .unwrap()
                .push(format!("unregister {}", request.stage));
            Ok(())
        }
    }
}
