//! Main controller implementation.
//!
//! Wires the operator together: NSX and Kubernetes clients, the shared
//! store and allocator, one generic reconciler per managed kind, the
//! network-mode gate and its watchers, the garbage collector, the metrics
//! server and (when certificates are configured) the admission webhook.
//!
//! Startup order matters: backend state is rehydrated into the store and
//! allocator before any watcher or the GC runs.

use crate::allocator::IpAllocator;
use crate::config::Config;
use crate::error::ControllerError;
use crate::gc::{GarbageCollector, GcTarget, ResourceGc};
use crate::metrics::{serve_metrics, Metrics};
use crate::network_mode::{CrKeyLister, KubeNamespaceSource, NetworkModeGate, Requeuer};
use crate::realization::{RealizationPoller, RetryPolicy};
use crate::reconciler::GenericReconciler;
use crate::resource::{CrApi, KubeCrApi, ManagedResource};
use crate::services::{IpAddressAllocationService, ResourceService, ServiceContext, SubnetService};
use crate::status::{CrStatusUpdater, EventSink, KubeEventSink, StatusUpdater};
use crate::store::ResourceStore;
use crate::watcher::{watch_default_network, watch_deletions, watch_namespaces, watch_resource};
use crate::webhook::{serve_webhook, KubeAdmissionLookup, WebhookState};
use crds::{IPAddressAllocation, Network, Subnet};
use futures::channel::mpsc;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use nsx_client::{NsxClient, NsxClientTrait};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Name reported on Events
const CONTROLLER_NAME: &str = "nsx-operator";

/// How long cross-resource reads in admission may take
const ADMISSION_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long running tasks get to finish after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type TaskResult = (&'static str, Result<(), ControllerError>);

/// Main controller for NSX resource management.
pub struct Controller {
    tasks: JoinSet<TaskResult>,
    gc: Arc<GarbageCollector>,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("tasks", &self.tasks.len())
            .field("gc", &self.gc)
            .finish_non_exhaustive()
    }
}

// Everything a managed kind needs, independent of the kind
struct Shared {
    client: Client,
    store: Arc<ResourceStore>,
    gate: Arc<NetworkModeGate>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    reconcile_timeout: Duration,
    concurrency: u16,
}

impl Shared {
    /// Rehydrate the kind, then start its controller and deletion watcher.
    ///
    /// Returns the kind's GC target.
    async fn start_kind<K: ManagedResource>(
        &self,
        service: Arc<dyn ResourceService<K>>,
        tasks: &mut JoinSet<TaskResult>,
        shutdown: &CancellationToken,
    ) -> Result<Arc<dyn GcTarget>, ControllerError> {
        let found = service.rehydrate().await?;
        info!("Rehydrated {} {} backend objects", found, K::RESOURCE_TYPE);

        let api: Arc<dyn CrApi<K>> = Arc::new(KubeCrApi::<K>::new(self.client.clone()));
        let status: Arc<dyn StatusUpdater<K>> = Arc::new(CrStatusUpdater::new(
            Arc::clone(&api),
            Arc::clone(&self.events),
            Arc::clone(&self.metrics),
        ));
        let reconciler = Arc::new(GenericReconciler::new(
            Arc::clone(&api),
            Arc::clone(&service),
            Arc::clone(&self.store),
            Arc::clone(&self.gate),
            status,
            self.reconcile_timeout,
        ));

        let (requeue_tx, requeue_rx) = mpsc::unbounded();
        self.gate.register(Requeuer {
            resource_name: K::RESOURCE_TYPE,
            lister: Arc::new(CrKeyLister::new(Arc::clone(&api))),
            sender: requeue_tx,
        });

        let kube_api: Api<K> = Api::all(self.client.clone());
        spawn(
            tasks,
            K::RESOURCE_TYPE,
            watch_resource(
                kube_api.clone(),
                Arc::clone(&reconciler),
                requeue_rx,
                self.concurrency,
                shutdown.clone(),
            ),
        );
        spawn(tasks, "deletion watcher", watch_deletions(kube_api, reconciler, shutdown.clone()));

        Ok(Arc::new(ResourceGc::new(
            api,
            service,
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
        )))
    }
}

fn spawn<F>(tasks: &mut JoinSet<TaskResult>, name: &'static str, task: F)
where
    F: Future<Output = Result<(), ControllerError>> + Send + 'static,
{
    tasks.spawn(async move { (name, task.await) });
}

impl Controller {
    /// Creates a new controller instance and starts every background task.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing NSX Operator");

        let kube_client = Client::try_default().await?;

        let nsx_client = NsxClient::new(
            config.nsx_manager_url.clone(),
            config.nsx_username.clone(),
            config.nsx_password.clone(),
            config.nsx_insecure,
        )?;
        info!("Validating NSX credentials and connectivity...");
        nsx_client.validate_connection().await.map_err(|e| {
            error!("Failed to connect to NSX Manager at {}: {}", config.nsx_manager_url, e);
            error!("Please ensure NSX_USERNAME/NSX_PASSWORD are correct and the manager is reachable");
            ControllerError::Nsx(e)
        })?;
        info!("NSX Manager connectivity established");
        let nsx_client: Arc<dyn NsxClientTrait> = Arc::new(nsx_client);

        let metrics = Arc::new(Metrics::new().map_err(|e| ControllerError::Server(e.to_string()))?);
        let ready = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        spawn(
            &mut tasks,
            "metrics server",
            serve_metrics(config.metrics_addr, Arc::clone(&metrics), Arc::clone(&ready), shutdown.clone()),
        );

        let allocator = IpAllocator::new();
        for pool in &config.ip_pools {
            info!("IP pool {}: {:?}", pool.name, pool.blocks);
            allocator.add_pool(&pool.name, pool.blocks.clone());
        }
        let store = Arc::new(ResourceStore::new());
        let ctx = Arc::new(ServiceContext {
            poller: RealizationPoller::new(Arc::clone(&nsx_client)),
            client: nsx_client,
            store: Arc::clone(&store),
            allocator: Arc::new(allocator),
            realize_policy: RetryPolicy {
                interval: config.realize_interval,
                timeout: config.realize_timeout,
            },
            cluster: config.cluster_name.clone(),
            project: config.nsx_project.clone(),
        });

        let gate = Arc::new(NetworkModeGate::new(Arc::new(KubeNamespaceSource::new(
            kube_client.clone(),
            config.default_network_namespace.clone(),
        ))));
        let shared = Shared {
            client: kube_client.clone(),
            store,
            gate: Arc::clone(&gate),
            events: Arc::new(KubeEventSink::new(kube_client.clone(), CONTROLLER_NAME)),
            metrics: Arc::clone(&metrics),
            reconcile_timeout: config.reconcile_timeout,
            concurrency: config.worker_concurrency,
        };

        // Rehydration failures abort startup: a partial store could hand
        // out addresses already in use
        let targets = vec![
            shared
                .start_kind::<IPAddressAllocation>(
                    Arc::new(IpAddressAllocationService::new(Arc::clone(&ctx))),
                    &mut tasks,
                    &shutdown,
                )
                .await?,
            shared
                .start_kind::<Subnet>(Arc::new(SubnetService::new(ctx)), &mut tasks, &shutdown)
                .await?,
        ];

        spawn(
            &mut tasks,
            "namespace watcher",
            watch_namespaces(Api::<Namespace>::all(kube_client.clone()), Arc::clone(&gate), shutdown.clone()),
        );
        spawn(
            &mut tasks,
            "default network watcher",
            watch_default_network(
                Api::<Network>::namespaced(kube_client.clone(), &config.default_network_namespace),
                config.default_network_namespace.clone(),
                gate,
                shutdown.clone(),
            ),
        );

        match &config.webhook_cert_dir {
            Some(cert_dir) => {
                let lookup = Arc::new(KubeAdmissionLookup::new(kube_client, ADMISSION_LOOKUP_TIMEOUT));
                let state = Arc::new(WebhookState::new(lookup, Arc::clone(&metrics)));
                let cert_dir = cert_dir.clone();
                let addr = config.webhook_addr;
                let token = shutdown.clone();
                spawn(&mut tasks, "webhook server", async move {
                    serve_webhook(addr, &cert_dir, state, token).await
                });
            }
            None => warn!("WEBHOOK_CERT_DIR not set, admission webhook disabled"),
        }

        let gc = Arc::new(GarbageCollector::new(targets, config.gc_interval, shutdown.child_token()));
        gc.start();

        Ok(Self {
            tasks,
            gc,
            ready,
            shutdown,
        })
    }

    /// Runs the controller until a shutdown signal or a task failure.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        self.ready.store(true, Ordering::SeqCst);
        info!("NSX Operator running");

        let result = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                Ok(())
            }
            Some(joined) = self.tasks.join_next() => match joined {
                Ok((name, Ok(()))) => Err(ControllerError::Watch(format!("{} exited unexpectedly", name))),
                Ok((name, Err(e))) => Err(ControllerError::Watch(format!("{} failed: {}", name, e))),
                Err(e) => Err(ControllerError::Watch(format!("task panicked: {}", e))),
            },
        };
        if let Err(e) = &result {
            error!("{}", e);
        }

        self.stop().await;
        result
    }

    async fn stop(mut self) {
        info!("Stopping NSX Operator");
        self.ready.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.gc.stop().await;

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Ok((name, Err(e))) = joined {
                    warn!("{} ended with error during shutdown: {}", name, e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Tasks still running after {:?}, aborting", SHUTDOWN_GRACE);
            self.tasks.abort_all();
        }
        info!("NSX Operator stopped");
    }
}
