//! Machine registry commands.
//!
//! These talk to the registry database directly; a running broker picks
//! up changes on its next sweep.

use std::path::Path;

use anyhow::{Context, Result};
use klefki_auth::{Fingerprint, PrivateKey};
use klefki_core::MachineId;
use klefki_registry::{MachineRecord, MachineStore};

use crate::utils::{format_time, write_private_file};

fn record_to_json(record: &MachineRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id.as_str(),
        "name": record.name,
        "created_at": record.created_at.to_rfc3339(),
    })
}

/// Generate a key pair and register the public half.
///
/// The private key goes to `out` if given, else to stdout.
pub async fn new_machine(
    store: &MachineStore,
    name: &str,
    out: Option<&Path>,
    json: bool,
) -> Result<()> {
    let key = PrivateKey::generate();
    let pem = key.to_pkcs8_pem().context("Failed to encode private key")?;

    // Write the key first so a registered machine never lacks one
    if let Some(path) = out {
        write_private_file(path, pem.as_bytes())?;
    }

    let record = store
        .create(name, &key.public_key())
        .await
        .context("Failed to register machine")?;
    tracing::debug!(machine_id = %record.id, name = %record.name, "Machine registered");

    if json {
        let mut value = record_to_json(&record);
        if out.is_none() {
            value["private_key"] = serde_json::Value::String(
                String::from_utf8_lossy(pem.as_bytes()).into_owned(),
            );
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", record.id);
        match out {
            Some(path) => eprintln!("✓ Machine {} registered, key written to {}", name, path.display()),
            None => {
                print!("{}", String::from_utf8_lossy(pem.as_bytes()));
                eprintln!("✓ Machine {} registered", name);
            }
        }
    }
    Ok(())
}

/// List registered machines.
pub async fn list_machines(store: &MachineStore, json: bool) -> Result<()> {
    let machines = store.list().await.context("Failed to list machines")?;

    if json {
        let machines_json: Vec<_> = machines.iter().map(record_to_json).collect();
        println!("{}", serde_json::to_string_pretty(&machines_json)?);
    } else if machines.is_empty() {
        println!("No machines registered");
    } else {
        println!("{:<52}  {:<20}  CREATED", "FINGERPRINT", "NAME");
        for m in &machines {
            println!("{:<52}  {:<20}  {}", m.id, m.name, format_time(&m.created_at));
        }
    }
    Ok(())
}

/// Remove a machine from the registry.
pub async fn delete_machine(store: &MachineStore, fingerprint: &str) -> Result<()> {
    let id = MachineId::from(
        Fingerprint::parse(fingerprint)
            .with_context(|| format!("Invalid machine id {fingerprint:?}"))?,
    );
    if !store.delete(&id).await.context("Failed to delete machine")? {
        anyhow::bail!("Machine {} not found", fingerprint);
    }
    eprintln!("✓ Machine {} deleted", fingerprint);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> MachineStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        MachineStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_new_machine_writes_usable_key() {
        let store = memory_store().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web-1.pem");

        new_machine(&store, "web-1", Some(&path), false).await.unwrap();

        let pem = std::fs::read_to_string(&path).unwrap();
        let key = PrivateKey::from_pkcs8_pem(&pem).unwrap();
        let id = MachineId::from(Fingerprint::from_public_key(&key.public_key()));

        let record = store.get(&id).await.unwrap().expect("machine registered");
        assert_eq!(record.name, "web-1");
    }

    #[tokio::test]
    async fn test_new_machine_refuses_existing_key_file() {
        let store = memory_store().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web-1.pem");
        std::fs::write(&path, "keep me").unwrap();

        assert!(new_machine(&store, "web-1", Some(&path), false).await.is_err());
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[tokio::test]
    async fn test_delete_unknown_machine() {
        let store = memory_store().await;
        let unknown = Fingerprint::from_public_key(&PrivateKey::generate().public_key());
        let err = delete_machine(&store, unknown.as_str()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_delete_rejects_malformed_id() {
        let store = memory_store().await;
        let err = delete_machine(&store, "web-1").await.unwrap_err();
        assert!(err.to_string().contains("Invalid machine id"));
    }
}
