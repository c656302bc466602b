use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rand::RngCore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use chunknet::{
    dial_addr, run_session, serve, Config, Connector, Hive, KVStore, Kademlia, LocalStore,
    NetStore, PeerAddr, RequestQueue, SessionContext, SledKv, TcpTransport,
};

/// Usage: chunknet [datadir] [port] [bootnode-url]
///
/// Runs a storage node: listens for peers on TCP, persists chunks and the
/// peer pool under the data directory, and optionally dials a bootnode.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let datadir = PathBuf::from(args.next().unwrap_or_else(|| "chunknet-data".to_string()));
    let port: u16 = args.next().as_deref().unwrap_or("8500").parse()?;
    let bootnode = args.next();

    std::fs::create_dir_all(&datadir)?;
    let db = sled::open(datadir.join("chunks"))?;
    let chunks: Arc<dyn KVStore> = Arc::new(SledKv::new(db.open_tree("chunks")?));
    let queue: Arc<dyn KVStore> = Arc::new(SledKv::new(db.open_tree("requests")?));

    let node_id = load_node_id(&datadir)?;
    let self_addr = PeerAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, node_id);
    let address = self_addr.address();
    info!(%address, port, "starting node");

    let cfg = Config::default();
    let local = Arc::new(LocalStore::new(
        chunks,
        cfg.mem_cache_cap,
        cfg.db_cache_cap,
    )?);
    let kad = Arc::new(Mutex::new(Kademlia::new(address, &cfg)));
    let netstore = NetStore::new(cfg, address, local, kad.clone(), RequestQueue::new(queue));
    let hive = Hive::new(kad);

    let ctx = SessionContext {
        netstore: netstore.clone(),
        hive: hive.clone(),
        self_addr: self_addr.clone(),
        client: format!("chunknet/{}", env!("CARGO_PKG_VERSION")),
    };

    let transport = TcpTransport::bind(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port,
    ))
    .await?;
    info!(listen = %transport.local_addr()?, url = %self_addr.url(), "listening");

    let connector = dial_connector(ctx.clone());
    hive.start(Some(datadir.join("peers.json")), connector.clone())
        .await?;

    if let Some(url) = bootnode {
        info!(%url, "dialing bootnode");
        (connector)(url);
    }

    tokio::spawn(serve(transport, ctx));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    hive.stop().await?;
    netstore.shutdown().await;
    Ok(())
}

fn load_node_id(datadir: &std::path::Path) -> Result<Vec<u8>> {
    let path = datadir.join("node.id");
    if path.exists() {
        return Ok(std::fs::read(&path)?);
    }
    let mut id = vec![0u8; 64];
    rand::thread_rng().fill_bytes(&mut id);
    std::fs::write(&path, &id)?;
    Ok(id)
}

/// Turn hive dial requests into TCP connections running peer sessions.
fn dial_connector(ctx: SessionContext) -> Connector {
    Arc::new(move |url: String| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let Some(addr) = dial_addr(&url) else {
                warn!(%url, "undialable peer url");
                return;
            };
            match tokio::net::TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    if let Err(err) = run_session(ctx, reader, writer).await {
                        debug!(%addr, %err, "outbound session ended");
                    }
                }
                Err(err) => debug!(%addr, %err, "dial failed"),
            }
        });
    })
}
