use std::sync::Arc;

use reclaimable_pvc_controllers::controller::{run_controller_main, Controller};
use reclaimable_pvc_controllers::releaser::{Releaser, AGENT_NAME};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    run_controller_main(AGENT_NAME, |ctx| {
        let controller: Arc<dyn Controller> = Releaser::new(ctx);
        controller
    })
    .await
}
