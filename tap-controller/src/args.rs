use crate::{core::CONTROL_PLANE_NS_LABEL, grpc, index, session, TargetDiscover};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use k8s_openapi::api::{apps::v1 as apps, batch::v1 as batch, core::v1 as k8s};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use tokio::time::Duration;
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "tap", about = "Streams live request metadata from meshed proxies")]
pub struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_TAP_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8088")]
    grpc_addr: SocketAddr,

    /// The namespace in which the control plane is installed. Only pods meshed
    /// by this control plane are tapped.
    #[clap(long, default_value = "linkerd")]
    controller_namespace: String,

    /// The port on which proxies serve the tap API.
    #[clap(long, default_value = "4190")]
    tap_port: u16,

    /// The maximum number of concurrently active tap sessions.
    #[clap(long, default_value = "100")]
    max_sessions: usize,

    /// The maximum number of events a single session may deliver.
    #[clap(long, default_value = "10000")]
    max_limit: u32,

    /// The number of events buffered for each client.
    #[clap(long, default_value = "1000")]
    event_buffer: usize,

    #[clap(long, default_value = "5000")]
    connect_timeout_ms: u64,

    #[clap(long, default_value = "1000")]
    close_timeout_ms: u64,

    /// How long shutdown waits for active sessions to end.
    #[clap(long, default_value = "10000")]
    shutdown_grace_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            grpc_addr,
            controller_namespace,
            tap_port,
            max_sessions,
            max_limit,
            event_buffer,
            connect_timeout_ms,
            close_timeout_ms,
            shutdown_grace_ms,
        } = self;

        if max_limit == 0 {
            bail!("--max-limit must be positive");
        }

        let config = session::Config {
            max_sessions,
            max_limit,
            event_buffer,
            fan_in_capacity: event_buffer,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            close_timeout: Duration::from_millis(close_timeout_ms),
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
        };

        // Build the index that resolves tap requests to the proxies that must
        // be tapped.
        let index = index::Index::shared(tap_port, &controller_namespace);

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("tap_index"), index.clone());
        let session_metrics =
            session::SessionMetrics::register(prom.sub_registry_with_prefix("tap_session"));
        let grpc_metrics = grpc::metrics::GrpcServerMetricsFamily::register(
            prom.sub_registry_with_prefix("grpc_server"),
        );
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches.

        let pods = runtime.watch_all::<k8s::Pod>(
            watcher::Config::default()
                .labels(&format!("{CONTROL_PLANE_NS_LABEL}={controller_namespace}")),
        );
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services)
                .instrument(info_span!("services")),
        );

        let deployments = runtime.watch_all::<apps::Deployment>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), deployments)
                .instrument(info_span!("deployments")),
        );

        let statefulsets = runtime.watch_all::<apps::StatefulSet>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), statefulsets)
                .instrument(info_span!("statefulsets")),
        );

        let daemonsets = runtime.watch_all::<apps::DaemonSet>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), daemonsets)
                .instrument(info_span!("daemonsets")),
        );

        let replicasets = runtime.watch_all::<apps::ReplicaSet>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), replicasets)
                .instrument(info_span!("replicasets")),
        );

        let jobs = runtime.watch_all::<batch::Job>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), jobs).instrument(info_span!("jobs")));

        let rcs = runtime.watch_all::<k8s::ReplicationController>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), rcs)
                .instrument(info_span!("replicationcontrollers")),
        );

        // Run the gRPC server, resolving sessions against the index handle.
        tokio::spawn(grpc(
            grpc_addr,
            config,
            index,
            session_metrics,
            grpc_metrics,
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(
    addr: SocketAddr,
    config: session::Config,
    index: index::SharedIndex,
    session_metrics: session::SessionMetrics,
    grpc_metrics: grpc::metrics::GrpcServerMetricsFamily,
    drain: drain::Watch,
) -> Result<()> {
    let observe = grpc::ProxyTap::new(config.connect_timeout);
    let sessions = session::Sessions::new(
        config,
        TargetDiscover::new(index),
        observe,
        session_metrics,
    );
    let svc = grpc::ResourceTapServer::new(sessions.clone(), drain.clone(), grpc_metrics).svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder().add_service(svc).serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "tap gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            // End active sessions so that their response streams complete
            // before the server stops accepting connections.
            sessions.shutdown().await;
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
