//! Simulated infrastructure.
//!
//! In-memory drivers for every kind. The binary runs them when no real
//! drivers are linked, and the tests use them to exercise the driver
//! contract: repeated ensures provision once, teardown is idempotent, and a
//! route waits for its target to report an address.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{DesiredState, ResourceId, ResourceKind, Secret, SecretId};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::context::ReconcileContext;
use crate::dispatch::DriverRegistry;
use crate::driver::{Driver, DriverOutcome};
use crate::error::{Error, Result};

const DATABASE_PORT: u16 = 5432;

#[derive(Debug, Clone, Default)]
struct SimRecord {
    provisions: u32,
    running: bool,
    ip: Option<String>,
    secret_id: Option<SecretId>,
    route: Option<(String, u64)>,
}

#[derive(Debug, Default)]
struct SimState {
    records: HashMap<ResourceId, SimRecord>,
    failures: HashMap<ResourceId, String>,
    next_host: u32,
}

impl SimState {
    fn allocate_ip(&mut self) -> String {
        self.next_host = self.next_host.wrapping_add(1);
        let [_, _, hi, lo] = self.next_host.to_be_bytes();
        format!("10.88.{hi}.{lo}")
    }
}

/// Shared in-memory "cloud" behind the simulated drivers.
#[derive(Debug, Default)]
pub struct SimulatedInfrastructure {
    state: Mutex<SimState>,
}

impl SimulatedInfrastructure {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a simulated driver for every kind.
    #[must_use]
    pub fn registry(self: &Arc<Self>) -> DriverRegistry {
        let driver = |role: Role| -> Arc<dyn Driver> {
            Arc::new(SimDriver {
                infra: Arc::clone(self),
                role,
            })
        };

        DriverRegistry {
            compute: driver(Role::Container),
            volume: driver(Role::Storage),
            bucket: driver(Role::Storage),
            http_route: driver(Role::Route),
            database: driver(Role::Database),
            broker: driver(Role::Storage),
            observability: driver(Role::Storage),
        }
    }

    /// Make the next attempt for `resource_id` fail with `message`.
    pub async fn fail_next(&self, resource_id: &ResourceId, message: impl Into<String>) {
        self.state
            .lock()
            .await
            .failures
            .insert(resource_id.clone(), message.into());
    }

    /// Stop or destroy infrastructure behind the engine's back.
    pub async fn kill(&self, resource_id: &ResourceId) {
        let mut state = self.state.lock().await;
        let has_address = state.records.get(resource_id).map(|r| r.ip.is_some());
        match has_address {
            Some(true) => {
                if let Some(record) = state.records.get_mut(resource_id) {
                    record.running = false;
                }
            }
            Some(false) => {
                state.records.remove(resource_id);
            }
            None => {}
        }
    }

    /// How many times infrastructure was created for `resource_id`.
    pub async fn provision_count(&self, resource_id: &ResourceId) -> u32 {
        self.state
            .lock()
            .await
            .records
            .get(resource_id)
            .map_or(0, |record| record.provisions)
    }

    /// Whether anything is provisioned for `resource_id`.
    pub async fn exists(&self, resource_id: &ResourceId) -> bool {
        self.state.lock().await.records.contains_key(resource_id)
    }

    /// Running flag of a container or database, if provisioned.
    pub async fn is_running(&self, resource_id: &ResourceId) -> Option<bool> {
        self.state
            .lock()
            .await
            .records
            .get(resource_id)
            .map(|record| record.running)
    }

    /// Hostname and port a route currently forwards, if provisioned.
    pub async fn route(&self, resource_id: &ResourceId) -> Option<(String, u64)> {
        self.state
            .lock()
            .await
            .records
            .get(resource_id)
            .and_then(|record| record.route.clone())
    }

    async fn take_failure(&self, resource_id: &ResourceId) -> Option<String> {
        self.state.lock().await.failures.remove(resource_id)
    }

    async fn teardown(&self, resource_id: &ResourceId) {
        if self.state.lock().await.records.remove(resource_id).is_some() {
            info!(resource_id = %resource_id, "Simulated teardown");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Container,
    Database,
    Storage,
    Route,
}

struct SimDriver {
    infra: Arc<SimulatedInfrastructure>,
    role: Role,
}

#[async_trait]
impl Driver for SimDriver {
    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<DriverOutcome> {
        let resource = ctx.resource();
        let kind = ctx.kind()?;

        if let Some(message) = self.infra.take_failure(&resource.resource_id).await {
            return Err(Error::driver_failed(kind.as_str(), message));
        }

        if resource.is_deletion_requested() {
            self.infra.teardown(&resource.resource_id).await;
            return ctx.report_deleted().await;
        }

        match self.role {
            Role::Container => self.ensure_container(ctx, kind).await,
            Role::Database => self.ensure_database(ctx).await,
            Role::Storage => self.ensure_storage(ctx).await,
            Role::Route => self.ensure_route(ctx).await,
        }
    }
}

impl SimDriver {
    async fn ensure_container(&self, ctx: &ReconcileContext, kind: ResourceKind) -> Result<DriverOutcome> {
        let resource = ctx.resource();
        let want_running = resource.desired_state != DesiredState::Paused;

        let ip = {
            let mut state = self.infra.state.lock().await;
            let ip = match state.records.get(&resource.resource_id).and_then(|r| r.ip.clone()) {
                Some(ip) => ip,
                None => state.allocate_ip(),
            };
            let record = state
                .records
                .entry(resource.resource_id.clone())
                .or_default();
            if record.provisions == 0 {
                record.provisions = 1;
                debug!(resource_id = %resource.resource_id, kind = %kind, ip = %ip, "Simulated container created");
            }
            record.ip = Some(ip.clone());
            record.running = want_running;
            ip
        };

        ctx.report_ready(json!({
            "running": want_running,
            "ip": ip,
            "image": resource.spec.get("image").cloned().unwrap_or(Value::Null),
        }))
        .await
    }

    async fn ensure_database(&self, ctx: &ReconcileContext) -> Result<DriverOutcome> {
        let resource = ctx.resource();
        let want_running = resource.desired_state != DesiredState::Paused;
        let engine = resource.spec_str("engine").unwrap_or("postgres").to_string();

        // Held across the secret write so concurrent ensures create one secret.
        let mut state = self.infra.state.lock().await;
        let existing = state.records.get(&resource.resource_id).cloned();
        let ip = match existing.as_ref().and_then(|r| r.ip.clone()) {
            Some(ip) => ip,
            None => state.allocate_ip(),
        };
        let secret_id = match existing.as_ref().and_then(|r| r.secret_id.clone()) {
            Some(secret_id) => secret_id,
            None => {
                let secret = Secret::new(format!("{}-password", resource.name), generate_password())
                    .for_resource(resource.resource_id.clone());
                ctx.secrets().create(secret).await?.secret_id
            }
        };

        let record = state
            .records
            .entry(resource.resource_id.clone())
            .or_default();
        if record.provisions == 0 {
            record.provisions = 1;
            debug!(resource_id = %resource.resource_id, ip = %ip, "Simulated database created");
        }
        record.ip = Some(ip.clone());
        record.running = want_running;
        record.secret_id = Some(secret_id.clone());
        drop(state);

        ctx.report_ready_with_details(
            json!({
                "running": want_running,
                "ip": ip,
                "port": DATABASE_PORT,
                "engine": engine,
                "secret_id": secret_id,
            }),
            Some(json!({ "secret_id": secret_id })),
        )
        .await
    }

    async fn ensure_storage(&self, ctx: &ReconcileContext) -> Result<DriverOutcome> {
        let resource = ctx.resource();
        {
            let mut state = self.infra.state.lock().await;
            let record = state
                .records
                .entry(resource.resource_id.clone())
                .or_default();
            if record.provisions == 0 {
                record.provisions = 1;
                debug!(resource_id = %resource.resource_id, kind = %resource.kind, "Simulated storage created");
            }
        }

        ctx.report_ready(json!({
            "deleted": false,
            "name": resource.name,
            "spec": resource.spec,
        }))
        .await
    }

    async fn ensure_route(&self, ctx: &ReconcileContext) -> Result<DriverOutcome> {
        let resource = ctx.resource();
        let Some(hostname) = resource.spec_str("hostname").map(str::to_string) else {
            return ctx.report_pending("Route has no hostname").await;
        };
        let Some(port) = resource.spec.get("targetPort").and_then(Value::as_u64) else {
            return ctx.report_pending("Route has no target port").await;
        };
        let Some(target) = resource.spec_str("targetResourceId").map(ResourceId::from) else {
            return ctx.report_pending("Route has no target resource").await;
        };

        let target_ip = ctx
            .observed()
            .get(&target)
            .await?
            .and_then(|entry| entry.field("ip").and_then(Value::as_str).map(str::to_string));
        let Some(target_ip) = target_ip else {
            return ctx
                .report_pending(format!("Waiting for target {target} to report an address"))
                .await;
        };

        {
            let mut state = self.infra.state.lock().await;
            let record = state
                .records
                .entry(resource.resource_id.clone())
                .or_default();
            if record.provisions == 0 {
                record.provisions = 1;
            }
            record.route = Some((hostname.clone(), port));
        }

        ctx.report_ready(json!({
            "deleted": false,
            "hostname": hostname,
            "targetPort": port,
            "upstream": format!("{target_ip}:{port}"),
        }))
        .await
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}
