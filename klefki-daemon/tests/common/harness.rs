//! Test harness for broker E2E tests.
//!
//! Uses tonic's pattern of passing server directly to client (no network).

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use klefki_auth::{sign_nonce, PrivateKey};
use klefki_core::MachineId;
use klefki_daemon::{build_engine, BrokerEngine, KlefkiBroker, PollRateLimiter, ServeArgs};
use klefki_proto::klefki_service_client::KlefkiServiceClient;
use klefki_proto::klefki_service_server::KlefkiServiceServer;
use klefki_proto::{GetKeyRequest, GetTimeRequest};
use klefki_registry::MachineStore;
use sqlx::sqlite::SqlitePoolOptions;
use tonic::codegen::InterceptedService;

pub type Client = KlefkiServiceClient<KlefkiServiceServer<KlefkiBroker<Arc<MachineStore>>>>;

#[allow(dead_code)]
pub type LimitedClient = KlefkiServiceClient<
    InterceptedService<KlefkiServiceServer<KlefkiBroker<Arc<MachineStore>>>, PollRateLimiter>,
>;

/// Daemon settings with every optional check switched off.
pub fn default_args() -> ServeArgs {
    ServeArgs {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        database: None,
        session_max_age: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(60),
        max_clock_skew: None,
        reject_replayed_nonces: false,
        rate_limit_per_second: 20,
        rate_limit_burst: 100,
        log_level: None,
    }
}

/// Broker over an in-memory registry, served directly to clients.
pub struct TestBroker {
    pub store: Arc<MachineStore>,
    pub engine: Arc<BrokerEngine>,
    broker: KlefkiBroker<Arc<MachineStore>>,
}

impl TestBroker {
    pub async fn new() -> Self {
        Self::with_args(&default_args()).await
    }

    pub async fn with_args(args: &ServeArgs) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        let store = MachineStore::new(pool)
            .await
            .expect("Failed to initialize registry");
        Self::with_store(Arc::new(store), args)
    }

    /// Broker over a registry file that other stores may also write to.
    #[allow(dead_code)]
    pub async fn open(path: &Path) -> Self {
        let store = MachineStore::open(path)
            .await
            .expect("Failed to open registry");
        Self::with_store(Arc::new(store), &default_args())
    }

    fn with_store(store: Arc<MachineStore>, args: &ServeArgs) -> Self {
        let (engine, _replay_cache) = build_engine(Arc::clone(&store), args);
        let broker =
            KlefkiBroker::new(Arc::clone(&engine)).with_registry_sync(Arc::clone(&store));

        Self {
            store,
            engine,
            broker,
        }
    }

    /// Register a fresh machine and hand back its key.
    pub async fn register(&self, name: &str) -> TestMachine {
        let key = PrivateKey::generate();
        let record = self
            .store
            .create(name, &key.public_key())
            .await
            .expect("Failed to register machine");
        TestMachine { key, id: record.id }
    }

    pub fn client(&self) -> Client {
        KlefkiServiceClient::new(KlefkiServiceServer::new(self.broker.clone()))
    }

    #[allow(dead_code)]
    pub fn limited_client(&self, limiter: PollRateLimiter) -> LimitedClient {
        KlefkiServiceClient::new(KlefkiServiceServer::with_interceptor(
            self.broker.clone(),
            limiter,
        ))
    }
}

/// A registered machine holding its private key.
pub struct TestMachine {
    pub key: PrivateKey,
    pub id: MachineId,
}

impl TestMachine {
    /// A correctly signed poll anchored to `signed_at`.
    pub fn poll_request(&self, nonce: &str, signed_at: &str) -> GetKeyRequest {
        GetKeyRequest {
            machine_id: self.id.0.clone(),
            nonce: nonce.to_string(),
            signature: sign_nonce(&self.key, nonce).to_bytes().to_vec(),
            signed_at: signed_at.to_string(),
        }
    }

    /// Fetch broker time, then build a signed poll.
    pub async fn fresh_poll(&self, client: &mut Client, nonce: &str) -> GetKeyRequest {
        let time = client
            .get_time(GetTimeRequest {})
            .await
            .expect("GetTime failed")
            .into_inner()
            .time;
        self.poll_request(nonce, &time)
    }
}
