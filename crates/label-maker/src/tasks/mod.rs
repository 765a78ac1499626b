use crate::store::KubeStore;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod config;
pub mod node;
pub mod types;
pub mod update;

// Re-export commonly used items
pub use config::LabelerConfig;
pub use node::{reconcile, reconcile_node, ReconcileOutcome};
pub use types::{Context, Error, Result};

/// Requeue delay after a reconciliation ran out of time
const TIMEOUT_REQUEUE: Duration = Duration::from_secs(5);

/// Main entry point: watch all Nodes and designate their roles until
/// `shutdown` is cancelled.
#[instrument(skip_all, fields(role_label = %config.role_label))]
pub async fn run_node_controller(
    client: Client,
    config: LabelerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    config.validate()?;

    info!("Starting node role controller");

    let nodes: Api<Node> = Api::all(client);
    let context = Arc::new(
        Context::new(Arc::new(KubeStore::new(nodes.clone())), config)
            .with_shutdown(shutdown.clone()),
    );

    let watcher_config = Config::default().any_semantic();

    let controller = Controller::new(nodes, watcher_config)
        .run(reconcile, error_policy, context)
        .for_each(|reconciliation_result| {
            let node_span = tracing::info_span!("node_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((node_ref, _action)) => {
                        debug!(node.name = %node_ref.name, "Node reconciliation finished");
                    }
                    Err(reconciliation_err) => {
                        warn!(error = %reconciliation_err, "Node reconciliation error");
                    }
                }
            }
            .instrument(node_span)
        });

    tokio::select! {
        () = controller => warn!("Node watch stream ended"),
        () = shutdown.cancelled() => info!("Shutdown requested"),
    }

    info!("Node role controller shutting down");
    Ok(())
}

/// Error policy for the node controller.
///
/// Cancellation means the process is stopping, so nothing is requeued.
/// Timeouts retry soon; other failures wait for the configured delay.
#[instrument(skip_all, fields(node.name = %node.name_any()))]
fn error_policy(node: Arc<Node>, err: &Error, ctx: Arc<Context>) -> Action {
    error_action(err, &ctx)
}

fn error_action(err: &Error, ctx: &Context) -> Action {
    if err.is_cancellation() {
        debug!(error = %err, "Node reconciliation cancelled");
        return Action::await_change();
    }

    if let Error::Timeout { .. } = err {
        warn!(error = %err, "Node reconciliation timed out, requeueing");
        return Action::requeue(TIMEOUT_REQUEUE);
    }

    error!(
        error = %err,
        requeue_after = ?ctx.config.error_requeue,
        "Node reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}
