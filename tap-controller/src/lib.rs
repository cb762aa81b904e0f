#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use linkerd_tap_controller_core as core;
pub use linkerd_tap_controller_grpc as grpc;
pub use linkerd_tap_controller_k8s_index as index;
pub use linkerd_tap_controller_session as session;

mod args;

pub use self::args::Args;

/// Resolves resource selections against the cluster index.
#[derive(Clone, Debug)]
struct TargetDiscover(index::SharedIndex);

impl TargetDiscover {
    pub fn new(index: index::SharedIndex) -> Self {
        Self(index)
    }
}

#[async_trait::async_trait]
impl core::DiscoverTargets for TargetDiscover {
    async fn watch_targets(
        &self,
        selection: &core::ResourceSelection,
    ) -> anyhow::Result<core::TargetStream> {
        let rx = self.0.write().subscribe(selection);
        Ok(Box::pin(tokio_stream::wrappers::WatchStream::new(rx)))
    }
}
