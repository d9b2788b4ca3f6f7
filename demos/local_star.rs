use clap::Parser;
use clap_derive::Parser;
use bytes::Bytes;
use collab_mesh::config::OverlayConfig;
use collab_mesh::ids::{ChannelId, NetworkId, PeerId};
use collab_mesh::router::router::{IncomingRequest, Notification, Router};
use collab_mesh::test_util::fixture::TestNetwork;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use tracing::{info, Level};

/// Runs a hub and a number of spokes in a single process, connected through in-memory
///  transport and signaling, and exchanges some notifications and requests between them.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 3)]
    spokes: usize,

    #[clap(long, default_value_t = 0)]
    signaling_jitter_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.spokes == 0 {
        return Err(anyhow!("at least one spoke is required"));
    }

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let network = TestNetwork::with_jitter(OverlayConfig::default(), Duration::from_millis(args.signaling_jitter_millis));
    let nodes = network.build_star(&NetworkId::new("demo"), args.spokes).await?;
    info!("star with {} members is up", nodes.len());

    let routers = nodes.into_iter()
        .map(Router::new)
        .collect::<Vec<_>>();

    let chat = ChannelId::new("chat");
    let uppercase = ChannelId::new("uppercase");

    for router in &routers {
        let local_id = router.network().local_id().clone();
        let _chat = router.on_notification(chat.clone(), move |notification: Notification| {
            let local_id = local_id.clone();
            async move {
                info!("{} received from {}: {}", local_id, notification.sender_id, String::from_utf8_lossy(&notification.body));
            }
        });
    }

    let hub_router = Arc::downgrade(&routers[0]);
    let _uppercase = routers[0].on_request(uppercase.clone(), move |request: IncomingRequest| {
        let hub_router = hub_router.clone();
        async move {
            if let Some(router) = hub_router.upgrade() {
                let body = String::from_utf8_lossy(&request.body).to_uppercase();
                if let Err(e) = router.respond(&request.sender_id, request.request_id, true, Bytes::from(body)).await {
                    info!("responding failed: {}", e);
                }
            }
        }
    });

    let hub_id = PeerId::new("hub");
    for router in &routers[1..] {
        let local_id = router.network().local_id().clone();
        router.notify(None, &chat, Bytes::from(format!("hello from {}", local_id))).await?;

        let response = router.request(&hub_id, &uppercase, Bytes::from(format!("shout for {}", local_id))).await?;
        info!("{} got response (ok={}): {}", local_id, response.ok, String::from_utf8_lossy(&response.body));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    for router in &routers {
        router.dispose();
        router.network().disconnect().await;
    }
    Ok(())
}
