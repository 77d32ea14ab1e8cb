// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! The node: one context object owning every subsystem, constructed in
//! dependency order (scheduler → transport → engine → naming → broadcast
//! → control). One [`Node::update`] tick drives, in order: transport
//! events, naming watches and session recovery, router endpoint
//! reconciliation, the session-timeout sweep, broadcast maintenance, and
//! the idle sweep. [`Node::serve`] loops that tick on the runtime until
//! the `quit` control command (or token) fires.

use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    broadcast::{ChannelMgr, RELAY_SERVICE},
    cfg::config::Config,
    codec::CodecKind,
    ctrl::{CTRL_SERVICE, CtrlService},
    error::{MsgError, RouterError, RpcError},
    naming::{Naming, store::CoordStore},
    router::{RoutePolicy, Router},
    rpc::{RpcEngine, ServiceHandler},
    sched::TaskSet,
    transport::{NetEvent, NetEventKind, Transport, handle::Handle},
};

pub struct Node {
    cfg: Config,
    tasks: Arc<TaskSet>,
    transport: Arc<Transport>,
    engine: Arc<RpcEngine>,
    naming: Arc<Naming>,
    channels: Arc<ChannelMgr>,
    ctrl: Arc<CtrlService>,
    routers: DashMap<String, Arc<Router>>,
    quit: CancellationToken,
}

impl Node {
    /// Builds and wires the fabric. The relay listener is bound here when
    /// the config names one, so peers can reach this server as soon as
    /// the node exists.
    pub async fn new(cfg: Config, store: Arc<dyn CoordStore>) -> Result<Arc<Self>> {
        let quit = CancellationToken::new();
        let tasks = Arc::new(TaskSet::new());
        let transport = Transport::new(cfg.transport_config());
        let engine = RpcEngine::new(Arc::clone(&transport), Arc::clone(&tasks), cfg.default_timeout());
        let naming = Naming::new(store, cfg.naming_config());
        let channels = ChannelMgr::new(
            cfg.broadcast_config(),
            Arc::clone(&transport),
            Arc::clone(&naming),
        );
        engine.attach_channels(&channels);
        channels.attach_engine(&engine);

        let ctrl = CtrlService::new(quit.clone());

        let _ = engine.register_service(RELAY_SERVICE, channels.relay_service());
        let _ = engine.register_service(
            CTRL_SERVICE,
            Arc::clone(&ctrl) as Arc<dyn ServiceHandler>,
        );

        if !cfg.app.app_key.is_empty() {
            naming
                .set_app_info(&cfg.app.app_id, &cfg.app.app_key)
                .await
                .context("failed to install app credential")?;
        }

        if !cfg.broadcast.relay_url.is_empty() {
            transport
                .bind(&cfg.broadcast.relay_url, CodecKind::Binary)
                .await
                .context("failed to bind broadcast relay listener")?;
        }

        let node = Arc::new(Self {
            cfg,
            tasks,
            transport,
            engine,
            naming,
            channels,
            ctrl,
            routers: DashMap::new(),
            quit,
        });
        node.install_builtin_commands();
        info!(app_id = %node.cfg.app.app_id, instance_id = node.cfg.app.instance_id, "node up");
        Ok(node)
    }

    fn install_builtin_commands(self: &Arc<Self>) {
        let stat_node = Arc::downgrade(self);
        let _ = self.ctrl.register_command(
            "stat",
            "dump runtime counters",
            Arc::new(move |_opts: &[String]| {
                let node = stat_node.upgrade().ok_or("node is gone")?;
                Ok(node.stat_string())
            }),
        );

        let _ = self.ctrl.register_command(
            "reload",
            "re-validate the configuration file",
            Arc::new(move |opts: &[String]| match opts.first() {
                Some(path) => match Config::load_from_file(path) {
                    Ok(_) => Ok(format!("config {path} ok (restart applies transport changes)")),
                    Err(e) => Err(format!("config {path} invalid: {e:#}")),
                },
                None => Ok("no config path given; nothing reloaded".to_string()),
            }),
        );
    }

    // ---- accessors -----------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn engine(&self) -> &Arc<RpcEngine> {
        &self.engine
    }

    pub fn naming(&self) -> &Arc<Naming> {
        &self.naming
    }

    pub fn channels(&self) -> &Arc<ChannelMgr> {
        &self.channels
    }

    pub fn ctrl(&self) -> &Arc<CtrlService> {
        &self.ctrl
    }

    pub fn tasks(&self) -> &Arc<TaskSet> {
        &self.tasks
    }

    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    // ---- convenience wiring --------------------------------------------

    pub async fn bind(&self, url: &str, codec: CodecKind) -> Result<Handle, MsgError> {
        self.transport.bind(url, codec).await
    }

    pub async fn connect(&self, url: &str, codec: CodecKind) -> Result<Handle, MsgError> {
        self.transport.connect(url, codec).await
    }

    pub fn register_service(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<String, RpcError> {
        self.engine.register_service(name, handler)
    }

    /// Publishes this instance under `name` with the given URLs.
    pub async fn register_instance(&self, name: &str, urls: &[String]) -> Result<()> {
        self.naming
            .register(name, urls, self.cfg.app.instance_id)
            .await
            .map_err(|e| anyhow::anyhow!("register {name} failed: {e}"))
    }

    /// Creates (or returns) the router bound to `name`.
    pub async fn open_router(
        &self,
        name: &str,
        policy: RoutePolicy,
        codec: CodecKind,
    ) -> Result<Arc<Router>, RouterError> {
        if let Some(router) = self.routers.get(name) {
            return Ok(Arc::clone(router.value()));
        }
        let router = Router::new(name, policy, codec, Arc::clone(&self.transport));
        router.init(&self.naming).await?;
        self.routers.insert(name.to_string(), Arc::clone(&router));
        Ok(router)
    }

    // ---- the loop ------------------------------------------------------

    /// One full tick: transport events, naming watches, router
    /// reconciliation, the session-timeout sweep, broadcast maintenance,
    /// idle sweep, in that order. Returns the amount of work done; a
    /// zero tick means the fabric is idle.
    pub async fn update(&self) -> usize {
        let mut work = 0usize;

        while let Some(event) = self.transport.poll(Duration::ZERO).await {
            work += 1;
            self.handle_event(event);
        }

        work += self.naming.update().await;

        // Endpoint sets recorded by the watch callbacks above are applied
        // here, inside the same tick.
        let routers: Vec<Arc<Router>> = self
            .routers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for router in routers {
            work += router.update().await;
        }

        work += self.engine.update();
        self.channels.update();
        work += self.transport.sweep_idle().len();
        work
    }

    fn handle_event(&self, event: NetEvent) {
        match event.kind {
            NetEventKind::Accepted { listener } => {
                debug!(handle = event.handle, listener, "peer accepted");
            },
            NetEventKind::Message => match self.transport.recv(event.handle) {
                Ok(msg) => self.engine.on_message(event.handle, msg),
                Err(e) => debug!(handle = event.handle, "event without message: {e}"),
            },
            NetEventKind::Closed => {
                for router in self.routers.iter() {
                    router.forget_handle(event.handle);
                }
                // Releases records kept alive for late reads (one-shot
                // HTTP); a no-op for handles already fully dropped.
                self.transport.close(event.handle);
            },
        }
    }

    /// Runs the update loop until `quit` fires, then fails outstanding
    /// sessions and kills hosted tasks.
    pub async fn serve(&self) {
        info!("serving");
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                event = self.transport.poll(Duration::from_millis(10)) => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                    self.update().await;
                },
            }
        }
        info!("quitting");
        self.drain_tasks(Duration::from_secs(1)).await;
        self.engine.shutdown();
        self.tasks.close();
    }

    /// Lets in-flight handler tasks finish (and their replies flush)
    /// before teardown, up to `max_wait`.
    async fn drain_tasks(&self, max_wait: Duration) {
        let deadline = tokio::time::Instant::now() + max_wait;
        while !self.tasks.is_empty() && tokio::time::Instant::now() < deadline {
            self.update().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn stat_string(&self) -> String {
        format!(
            "sessions={} services={} tasks={} connections={} channels={} routers={} cached_names={} overload={}",
            self.engine.session_count(),
            self.engine.service_count(),
            self.tasks.len(),
            self.transport.connection_count(),
            self.channels.channel_count(),
            self.routers.len(),
            self.naming.cached_names(),
            self.engine.overload(),
        )
    }
}
