use anyhow::Context as _;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Duration;

use aya::maps::{MapData, RingBuf};
use aya::programs::tc::{self, NlOptions, SchedClassifierLinkId, TcAttachOptions};
use aya::programs::{SchedClassifier, TcAttachType};
use aya::Ebpf;

use pktscope_common::RawHeaderEvent;

use crate::dispatch::HookDispatcher;
use crate::hooks::{HookRequest, InterceptionService};
use crate::record::Stage;

/// Dispatcher per stage, indexed by [`Stage::index`].
type Routes = Arc<RwLock<[Option<HookDispatcher>; 2]>>;

fn program_name(stage: Stage) -> &'static str {
    match stage {
        Stage::PreRouting => "pktscope_ingress",
        Stage::PostRouting => "pktscope_egress",
    }
}

fn attach_type(stage: Stage) -> TcAttachType {
    match stage {
        Stage::PreRouting => TcAttachType::Ingress,
        Stage::PostRouting => TcAttachType::Egress,
    }
}

pub struct TcHookHandle {
    stage: Stage,
    link_id: SchedClassifierLinkId,
}

/// Interception service backed by two TC classifiers on one interface.
///
/// Ingress stands in for pre-routing and egress for post-routing. The
/// classifiers copy header bytes into the `EVENTS` ring buffer; an
/// [`EventPoller`] drains it and calls whichever dispatcher is registered for
/// the event's stage.
pub struct TcInterceptor {
    bpf: Ebpf,
    iface: String,
    routes: Routes,
    loaded: [bool; 2],
}

impl TcInterceptor {
    pub fn load(object: &Path, iface: &str) -> anyhow::Result<Self> {
        let bpf = Ebpf::load_file(object)
            .with_context(|| format!("failed to load eBPF object {}", object.display()))?;

        // If the clsact qdisc already exists (EEXIST), that is fine.
        if let Err(e) = tc::qdisc_add_clsact(iface) {
            if e.raw_os_error() != Some(17) {
                return Err(e).with_context(|| format!("failed to add clsact qdisc on {iface}"));
            }
            tracing::debug!("clsact qdisc already exists on {}, reusing", iface);
        }
        tracing::info!(
            "stages on {}: PRE_ROUTING = TC ingress, POST_ROUTING = TC egress (forwarded traffic is seen on the egress interface only)",
            iface
        );

        Ok(Self {
            bpf,
            iface: iface.to_string(),
            routes: Arc::new(RwLock::new([None, None])),
            loaded: [false, false],
        })
    }

    /// Take ownership of the ring buffer. Can only be called once.
    pub fn event_poller(&mut self) -> anyhow::Result<EventPoller> {
        let map = self
            .bpf
            .take_map("EVENTS")
            .context("EVENTS map missing from eBPF object")?;
        Ok(EventPoller {
            ring_buf: RingBuf::try_from(map)?,
            routes: self.routes.clone(),
        })
    }

    fn classifier(&mut self, stage: Stage) -> anyhow::Result<&mut SchedClassifier> {
        let name = program_name(stage);
        let program = self
            .bpf
            .program_mut(name)
            .with_context(|| format!("program {name} missing from eBPF object"))?;
        Ok(program.try_into()?)
    }

    fn attach(&mut self, stage: Stage, priority: u16) -> anyhow::Result<SchedClassifierLinkId> {
        let iface = self.iface.clone();
        let needs_load = !self.loaded[stage.index()];

        let program = self.classifier(stage)?;
        if needs_load {
            program.load()?;
        }
        let options = TcAttachOptions::Netlink(NlOptions {
            priority,
            handle: 0,
        });
        let link_id = program.attach_with_options(&iface, attach_type(stage), options)?;

        self.loaded[stage.index()] = true;
        Ok(link_id)
    }
}

impl InterceptionService for TcInterceptor {
    type Handle = TcHookHandle;

    fn register(&mut self, request: HookRequest) -> anyhow::Result<TcHookHandle> {
        let stage = request.stage;
        let idx = stage.index();

        // Route first, so the very first event of the new hook has somewhere
        // to go.
        self.routes.write().unwrap_or_else(PoisonError::into_inner)[idx] =
            Some(request.dispatcher);

        match self.attach(stage, request.priority) {
            Ok(link_id) => {
                tracing::info!(
                    "{} attached to {} ({:?}, priority {})",
                    program_name(stage),
                    self.iface,
                    attach_type(stage),
                    request.priority
                );
                Ok(TcHookHandle { stage, link_id })
            }
            Err(e) => {
                self.routes.write().unwrap_or_else(PoisonError::into_inner)[idx] = None;
                Err(e)
            }
        }
    }

    fn unregister(&mut self, handle: TcHookHandle) -> anyhow::Result<()> {
        let TcHookHandle { stage, link_id } = handle;
        let detached = self
            .classifier(stage)
            .and_then(|program| Ok(program.detach(link_id)?));

        // Events already queued for this stage are dropped by the poller once
        // the route is gone. Taking the write lock waits out any dispatch that
        // is still running.
        self.routes.write().unwrap_or_else(PoisonError::into_inner)[stage.index()] = None;

        detached.with_context(|| format!("failed to detach {}", program_name(stage)))
    }
}

/// Drains the classifiers' ring buffer into the registered dispatchers.
pub struct EventPoller {
    ring_buf: RingBuf<MapData>,
    routes: Routes,
}

impl EventPoller {
    pub async fn run(mut self) {
        loop {
            while let Some(item) = self.ring_buf.next() {
                dispatch_event(&self.routes, &item);
            }

            // Yield briefly to avoid busy-spinning when the ring buffer is empty.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

fn dispatch_event(routes: &RwLock<[Option<HookDispatcher>; 2]>, item: &[u8]) {
    if item.len() < core::mem::size_of::<RawHeaderEvent>() {
        return;
    }
    let event = unsafe { core::ptr::read_unaligned(item.as_ptr() as *const RawHeaderEvent) };
    let Some(stage) = Stage::from_wire(event.stage) else {
        tracing::trace!(tag = event.stage, "event with unknown stage tag");
        return;
    };

    // The read guard is held across the call so that `unregister` cannot
    // return while a dispatch for its stage is still in flight.
    let routes = routes.read().unwrap_or_else(PoisonError::into_inner);
    if let Some(dispatcher) = &routes[stage.index()] {
        dispatcher.on_packet(event.bytes());
    }
}
