//! Broker RPC commands.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use klefki_auth::{open, seal, sign_nonce, Fingerprint, PrivateKey, PublicKey};
use klefki_core::MachineId;
use klefki_proto::{
    klefki_service_client::KlefkiServiceClient, GetKeyRequest, GetTimeRequest,
    ListSessionsRequest, Machine, SubmitKeyRequest,
};
use klefki_registry::MachineStore;
use tokio::time::Instant;
use tonic::transport::Channel;
use tonic::{Code, Status};
use uuid::Uuid;

use crate::utils::{format_broker_time, read_passphrase};

/// Longest pause between `--wait` retries.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Options for `requests getkey`.
pub struct GetKeyOptions<'a> {
    pub priv_key: &'a Path,
    pub wait: bool,
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

/// Print the broker's challenge clock.
pub async fn get_time(client: &mut KlefkiServiceClient<Channel>, json: bool) -> Result<()> {
    let time = client
        .get_time(GetTimeRequest {})
        .await
        .context("GetTime failed")?
        .into_inner()
        .time;

    if json {
        println!("{}", serde_json::json!({ "time": time }));
    } else {
        println!("{}", time);
    }
    Ok(())
}

/// One authenticated poll: fetch broker time, sign a fresh nonce, ask.
async fn poll_once(
    client: &mut KlefkiServiceClient<Channel>,
    key: &PrivateKey,
    machine_id: &str,
) -> Result<Vec<u8>, Status> {
    let signed_at = client.get_time(GetTimeRequest {}).await?.into_inner().time;
    let nonce = Uuid::new_v4().to_string();

    let request = GetKeyRequest {
        machine_id: machine_id.to_string(),
        signature: sign_nonce(key, &nonce).to_bytes().to_vec(),
        nonce,
        signed_at,
    };

    Ok(client.get_key(request).await?.into_inner().enc_key)
}

/// Poll for this machine's passphrase and print it.
pub async fn get_key(
    client: &mut KlefkiServiceClient<Channel>,
    options: GetKeyOptions<'_>,
) -> Result<()> {
    let pem = std::fs::read_to_string(options.priv_key)
        .with_context(|| format!("Failed to read {}", options.priv_key.display()))?;
    let key = PrivateKey::from_pkcs8_pem(&pem).context("Invalid private key")?;
    let machine_id = Fingerprint::from_public_key(&key.public_key());

    let deadline = options.timeout.map(|t| Instant::now() + t);
    let mut interval = options.interval.max(Duration::from_secs(1));

    let envelope = loop {
        match poll_once(client, &key, machine_id.as_str()).await {
            Ok(envelope) => break envelope,
            Err(status) if status.code() == Code::Unavailable && options.wait => {
                let pause = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            anyhow::bail!("Timed out waiting for key for {}", machine_id);
                        }
                        interval.min(remaining)
                    }
                    None => interval,
                };
                eprintln!("Key not available yet, retrying in {}s", pause.as_secs());
                tokio::time::sleep(pause).await;
                interval = interval.saturating_mul(2).min(MAX_RETRY_INTERVAL);
            }
            Err(status) => return Err(status).context("Failed to get key from server"),
        }
    };

    let passphrase = open(&key, &envelope).context("Failed to decrypt delivered key")?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(passphrase.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

/// Show machines waiting on the broker.
pub async fn list_sessions(client: &mut KlefkiServiceClient<Channel>, json: bool) -> Result<()> {
    let machines = client
        .list_sessions(ListSessionsRequest {})
        .await
        .context("ListSessions failed")?
        .into_inner()
        .machines;

    if json {
        let sessions_json: Vec<_> = machines
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "last_asked": (!m.last_asked.is_empty()).then_some(&m.last_asked),
                    "key_ready": m.key_ready,
                    "registered": !m.public_key.is_empty(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&sessions_json)?);
    } else if machines.is_empty() {
        println!("No results found");
    } else {
        println!("{:<52}  {:<24}  KEY", "FINGERPRINT", "LAST ASKED");
        for m in &machines {
            println!(
                "{:<52}  {:<24}  {}",
                m.id,
                format_broker_time(&m.last_asked),
                if m.key_ready { "ready" } else { "waiting" }
            );
        }
    }
    Ok(())
}

/// Pick the recipient key from the broker's session list.
fn key_from_sessions<'a>(machines: &'a [Machine], machine_id: &str) -> Option<&'a [u8]> {
    machines
        .iter()
        .find(|m| m.id == machine_id && !m.public_key.is_empty())
        .map(|m| m.public_key.as_slice())
}

/// Decode `bytes` and require that they hash to `machine_id`.
///
/// The id is the key's fingerprint, so a broker cannot substitute a key
/// of its own and read the passphrase.
fn checked_recipient(bytes: &[u8], machine_id: &str) -> Result<PublicKey> {
    let key = PublicKey::from_bytes(bytes).context("Machine has an invalid public key")?;
    let fingerprint = Fingerprint::from_public_key(&key);
    if fingerprint.as_str() != machine_id {
        anyhow::bail!(
            "public key for {machine_id} has fingerprint {fingerprint}, refusing to encrypt to it"
        );
    }
    Ok(key)
}

/// The machine's public key, from its pending session or else the local
/// registry database.
async fn recipient_key(
    client: &mut KlefkiServiceClient<Channel>,
    registry_db: &Path,
    machine_id: &str,
) -> Result<PublicKey> {
    let machines = client
        .list_sessions(ListSessionsRequest {})
        .await
        .context("ListSessions failed")?
        .into_inner()
        .machines;

    let bytes = match key_from_sessions(&machines, machine_id) {
        Some(bytes) => bytes.to_vec(),
        None if registry_db.exists() => {
            tracing::debug!(path = %registry_db.display(), "No pending session, checking local registry");
            let store = MachineStore::open(registry_db)
                .await
                .context("Failed to open registry")?;
            store
                .get(&MachineId::new(machine_id))
                .await
                .context("Registry lookup failed")?
                .with_context(|| format!("no sessions found for {machine_id:?}"))?
                .public_key
        }
        None => anyhow::bail!("no sessions found for {machine_id:?}"),
    };

    checked_recipient(&bytes, machine_id)
}

/// Seal a passphrase to a machine and hand it to the broker.
pub async fn submit_key(
    client: &mut KlefkiServiceClient<Channel>,
    registry_db: &Path,
    machine_id: &str,
    passphrase_file: Option<&Path>,
) -> Result<()> {
    let recipient = recipient_key(client, registry_db, machine_id).await?;

    let passphrase = read_passphrase(passphrase_file)?;
    if passphrase.is_empty() {
        anyhow::bail!("Passphrase is empty");
    }

    let envelope = seal(&recipient, &passphrase).context("Failed to encrypt passphrase")?;

    client
        .submit_key(SubmitKeyRequest {
            machine_id: machine_id.to_string(),
            enc_key: envelope,
        })
        .await
        .context("SubmitKey failed")?;

    eprintln!("✓ Key submitted for {}", machine_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(id: &str, public_key: Vec<u8>) -> Machine {
        Machine {
            id: id.to_string(),
            public_key,
            last_asked: String::new(),
            key_ready: false,
        }
    }

    #[test]
    fn test_key_from_sessions() {
        let machines = vec![
            machine("SHA256:a", vec![1; 32]),
            machine("SHA256:b", vec![2; 32]),
            machine("SHA256:gone", Vec::new()),
        ];

        assert_eq!(key_from_sessions(&machines, "SHA256:b"), Some(&[2u8; 32][..]));
        assert_eq!(key_from_sessions(&machines, "SHA256:gone"), None);
        assert_eq!(key_from_sessions(&machines, "SHA256:c"), None);
    }

    #[test]
    fn test_recipient_must_match_machine_id() {
        let machine_key = PrivateKey::generate().public_key();
        let machine_id = Fingerprint::from_public_key(&machine_key).into_string();
        let broker_key = PrivateKey::generate().public_key();

        let machines = vec![machine(&machine_id, broker_key.to_bytes().to_vec())];
        let listed = key_from_sessions(&machines, &machine_id).unwrap();
        let err = checked_recipient(listed, &machine_id).unwrap_err();
        assert!(err.to_string().contains("refusing"));

        let key = checked_recipient(&machine_key.to_bytes(), &machine_id).unwrap();
        assert_eq!(key, machine_key);
    }
}
