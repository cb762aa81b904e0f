use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

use super::SharedIndex;

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut pod_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of meshed pods in the index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in &this.namespaces {
            let labels = vec![("namespace", ns.as_str())];
            let pods = ConstGauge::new(index.pods.len() as u32);
            let pod_encoder = pod_encoder.encode_family(&labels)?;
            pods.encode(pod_encoder)?;
        }

        let mut workload_encoder = encoder.encode_descriptor(
            "workload_index_size",
            "The number of pod-selecting workloads in the index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in &this.namespaces {
            let labels = vec![("namespace", ns.as_str())];
            let workloads = ConstGauge::new(index.workloads.len() as u32);
            let workload_encoder = workload_encoder.encode_family(&labels)?;
            workloads.encode(workload_encoder)?;
        }

        let subscription_encoder = encoder.encode_descriptor(
            "subscriptions",
            "The number of resource selections with active subscribers",
            None,
            MetricType::Gauge,
        )?;
        let subscriptions = this
            .subscriptions
            .values()
            .filter(|tx| !tx.is_closed())
            .count();
        ConstGauge::new(subscriptions as u32).encode(subscription_encoder)?;

        Ok(())
    }
}
