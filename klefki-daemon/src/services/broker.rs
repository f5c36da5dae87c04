//! Klefki broker gRPC service implementation.

use std::sync::Arc;

use klefki_core::{
    AuthChallenge, BrokerError, EncryptedKey, MachineId, MachineRegistry, PollOutcome,
    SessionEngine,
};
use klefki_proto::klefki_service_server::KlefkiService;
use klefki_registry::MachineStore;
use klefki_proto::{
    GetKeyRequest, GetKeyResponse, GetTimeRequest, GetTimeResponse, ListSessionsRequest,
    ListSessionsResponse, SubmitKeyRequest, SubmitKeyResponse,
};
use tonic::{Request, Response, Status};

use crate::convert::{broker_error_to_status, pending_to_proto};

/// gRPC front for a [`SessionEngine`].
///
/// Every handler runs its engine call to completion without awaiting, so a
/// client that disconnects mid-request cannot leave a session half-updated.
pub struct KlefkiBroker<R> {
    engine: Arc<SessionEngine<R>>,
    store: Option<Arc<MachineStore>>,
}

impl<R> KlefkiBroker<R> {
    pub fn new(engine: Arc<SessionEngine<R>>) -> Self {
        Self {
            engine,
            store: None,
        }
    }

    /// Pick up registry edits made by other processes before each lookup.
    pub fn with_registry_sync(mut self, store: Arc<MachineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn engine(&self) -> &Arc<SessionEngine<R>> {
        &self.engine
    }
}

impl<R> Clone for KlefkiBroker<R> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            store: self.store.clone(),
        }
    }
}

impl<R> KlefkiBroker<R> {
    // Runs before the engine call, so the engine itself never awaits.
    async fn sync_registry(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.sync().await {
                tracing::warn!(error = %e, "Registry sync failed, using previous snapshot");
            }
        }
    }
}

/// Log a failed operation at a level matching its cause, then convert.
fn reject(op: &'static str, machine_id: &MachineId, err: BrokerError) -> Status {
    match &err {
        BrokerError::Unauthenticated => {
            tracing::warn!(op, machine_id = %machine_id, "Authentication failed");
        }
        BrokerError::NotFound => {
            tracing::warn!(op, machine_id = %machine_id, "Unknown machine");
        }
        BrokerError::InvalidRequest(reason) => {
            tracing::debug!(op, machine_id = %machine_id, reason = %reason, "Invalid request");
        }
        BrokerError::Internal(detail) => {
            tracing::error!(op, machine_id = %machine_id, error = %detail, "Internal error");
        }
    }
    broker_error_to_status(&err)
}

#[tonic::async_trait]
impl<R> KlefkiService for KlefkiBroker<R>
where
    R: MachineRegistry + 'static,
{
    async fn get_time(
        &self,
        _request: Request<GetTimeRequest>,
    ) -> Result<Response<GetTimeResponse>, Status> {
        let time = self.engine.challenge_time();
        tracing::trace!(time = %time, "GetTime request");
        Ok(Response::new(GetTimeResponse { time }))
    }

    async fn get_key(
        &self,
        request: Request<GetKeyRequest>,
    ) -> Result<Response<GetKeyResponse>, Status> {
        let req = request.into_inner();
        let challenge = AuthChallenge {
            machine_id: MachineId::new(req.machine_id),
            nonce: req.nonce,
            signature: req.signature,
            signed_at: req.signed_at,
        };
        tracing::debug!(machine_id = %challenge.machine_id, "GetKey request");
        self.sync_registry().await;

        match self.engine.poll(&challenge) {
            Ok(PollOutcome::Delivered(key)) => {
                tracing::info!(
                    machine_id = %challenge.machine_id,
                    bytes = key.len(),
                    "Key delivered, session closed"
                );
                Ok(Response::new(GetKeyResponse {
                    enc_key: key.into_bytes(),
                }))
            }
            Ok(PollOutcome::NotAvailable) => {
                tracing::debug!(machine_id = %challenge.machine_id, "No key submitted yet");
                Err(Status::unavailable("key not available"))
            }
            Err(e) => Err(reject("GetKey", &challenge.machine_id, e)),
        }
    }

    async fn submit_key(
        &self,
        request: Request<SubmitKeyRequest>,
    ) -> Result<Response<SubmitKeyResponse>, Status> {
        let req = request.into_inner();
        let machine_id = MachineId::new(req.machine_id);
        let bytes = req.enc_key.len();
        self.sync_registry().await;

        self.engine
            .submit_key(&machine_id, EncryptedKey::new(req.enc_key))
            .map_err(|e| reject("SubmitKey", &machine_id, e))?;

        tracing::info!(machine_id = %machine_id, bytes, "Encrypted key submitted");
        Ok(Response::new(SubmitKeyResponse {}))
    }

    async fn list_sessions(
        &self,
        _request: Request<ListSessionsRequest>,
    ) -> Result<Response<ListSessionsResponse>, Status> {
        self.sync_registry().await;
        let pending = self.engine.list_pending().map_err(|e| {
            tracing::error!(error = %e, "ListSessions failed");
            broker_error_to_status(&e)
        })?;
        tracing::debug!(sessions = pending.len(), "ListSessions request");

        let machines = pending.into_iter().map(pending_to_proto).collect();
        Ok(Response::new(ListSessionsResponse { machines }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klefki_auth::{sign_nonce, PrivateKey};
    use klefki_core::{InMemoryRegistry, MachineIdentity};
    use tonic::Code;

    fn broker_with(key: &PrivateKey) -> (KlefkiBroker<Arc<InMemoryRegistry>>, MachineId) {
        let registry = Arc::new(InMemoryRegistry::new());
        let identity = MachineIdentity::from_public_key(&key.public_key());
        let id = identity.id.clone();
        registry.insert(identity);
        let engine = Arc::new(SessionEngine::new(registry));
        (KlefkiBroker::new(engine), id)
    }

    fn get_key_request(key: &PrivateKey, id: &MachineId, nonce: &str, signed_at: &str) -> GetKeyRequest {
        GetKeyRequest {
            machine_id: id.0.clone(),
            nonce: nonce.to_string(),
            signature: sign_nonce(key, nonce).to_bytes().to_vec(),
            signed_at: signed_at.to_string(),
        }
    }

    #[tokio::test]
    async fn test_poll_without_key_is_unavailable() {
        let key = PrivateKey::generate();
        let (broker, id) = broker_with(&key);
        let now = broker.engine().challenge_time();

        let status = broker
            .get_key(Request::new(get_key_request(&key, &id, "n1", &now)))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "key not available");
    }

    #[tokio::test]
    async fn test_submit_then_deliver_once() {
        let key = PrivateKey::generate();
        let (broker, id) = broker_with(&key);
        let now = broker.engine().challenge_time();

        broker
            .submit_key(Request::new(SubmitKeyRequest {
                machine_id: id.0.clone(),
                enc_key: b"ciphertext".to_vec(),
            }))
            .await
            .unwrap();

        let delivered = broker
            .get_key(Request::new(get_key_request(&key, &id, "n1", &now)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(delivered.enc_key, b"ciphertext");

        let again = broker
            .get_key(Request::new(get_key_request(&key, &id, "n2", &now)))
            .await
            .unwrap_err();
        assert_eq!(again.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_missing_signed_at_is_invalid_argument() {
        let key = PrivateKey::generate();
        let (broker, id) = broker_with(&key);

        let status = broker
            .get_key(Request::new(get_key_request(&key, &id, "n1", "")))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_submit_for_unknown_machine() {
        let key = PrivateKey::generate();
        let (broker, _) = broker_with(&key);

        let status = broker
            .submit_key(Request::new(SubmitKeyRequest {
                machine_id: "SHA256:nobody".into(),
                enc_key: b"C".to_vec(),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_list_sessions_reports_state() {
        let key = PrivateKey::generate();
        let (broker, id) = broker_with(&key);
        let now = broker.engine().challenge_time();

        let _ = broker
            .get_key(Request::new(get_key_request(&key, &id, "n1", &now)))
            .await;

        let listed = broker
            .list_sessions(Request::new(ListSessionsRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(listed.machines.len(), 1);
        let machine = &listed.machines[0];
        assert_eq!(machine.id, id.0);
        assert_eq!(machine.public_key, key.public_key().to_bytes().to_vec());
        assert!(!machine.last_asked.is_empty());
        assert!(!machine.key_ready);
    }
}
