//! In-process mesh: one publisher, N distributors, every distributor
//! forwarding to every other one over in-memory duplex streams.

use anyhow::{Context, Result};
use swarmcast_services::{Distributor, NodeOptions, Publisher};

/// Buffer size of each in-memory link.
const LINK_BUFFER: usize = 64 * 1024;

pub struct Mesh {
    pub publisher: Publisher,
    pub distributors: Vec<Distributor>,
}

impl Mesh {
    /// `node_options` is called once per node.
    pub async fn build(count: usize, node_options: impl Fn() -> NodeOptions) -> Result<Self> {
        let publisher = Publisher::new(node_options());

        let mut distributors = Vec::with_capacity(count);
        for i in 0..count {
            let (upstream, downstream) = tokio::io::duplex(LINK_BUFFER);
            let distributor = Distributor::new(Box::new(downstream), node_options())
                .with_context(|| format!("starting distributor {i}"))?;
            publisher
                .add_peer(Box::new(upstream))
                .await
                .with_context(|| format!("attaching distributor {i}"))?;
            distributors.push(distributor);
        }

        for (i, from) in distributors.iter().enumerate() {
            for (j, to) in distributors.iter().enumerate() {
                if i == j {
                    continue;
                }
                let (forwarding, collecting) = tokio::io::duplex(LINK_BUFFER);
                from.add_forwarding_peer(Box::new(forwarding))
                    .await
                    .with_context(|| format!("linking {i} -> {j}"))?;
                to.add_collector_peer(Box::new(collecting))
                    .await
                    .with_context(|| format!("linking {i} -> {j}"))?;
            }
        }
        tracing::info!(distributors = count, links = count * count.saturating_sub(1), "mesh ready");

        Ok(Self {
            publisher,
            distributors,
        })
    }

    /// Close every node, publisher first. Reports the first failure after
    /// attempting all of them.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = self.publisher.close().await.err().map(anyhow::Error::from);
        for (i, distributor) in self.distributors.iter().enumerate() {
            if let Err(e) = distributor.close().await {
                tracing::warn!(distributor = i, error = %e, "close failed");
                first_error.get_or_insert_with(|| anyhow::Error::from(e));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
