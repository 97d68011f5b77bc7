//! Example: Registering a device and settling a channel transfer
//!
//! Run with: RUST_LOG=shift_core=debug cargo run --example settle_transfer

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use shift_core::crypto::sha256;
use shift_core::{
    AttestationVerifier, ChannelConfig, ChannelId, ChannelLedger, ClosingSignatures,
    DeviceCertificate, DeviceId, DeviceRegistration, Ed25519Verifier, HardwareType,
    KeyPoolManager, Manufacturer, ManufacturerId, ManufacturerRegistry, MemoryJournal, PartyId,
    QuoteBuilder, SettlementJournal, ShiftConfig, SignatureVerifier, Signer,
    TransactionCoordinator,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Shift settlement core - Example Usage\n");
    println!("=====================================\n");

    let config = ShiftConfig::from_json(r#"{ "key_pool": { "default_capacity": 64 } }"#)?;
    let now = Utc::now();

    // Step 1: Trust a manufacturer root
    println!("1. Registering manufacturer trust root...");
    let manufacturer_id = ManufacturerId([0x5a; 32]);
    let manufacturer_root = Signer::generate();
    let attestation_key = Signer::generate();
    let registry = ManufacturerRegistry::new();
    registry.register(Manufacturer {
        manufacturer_id,
        name: "Shift Devices Ltd".to_string(),
        root_key: manufacturer_root.public_key(),
        active: true,
        registered_at: now,
    });
    println!("   Manufacturer {manufacturer_id} trusted\n");

    // Step 2: Wire the components
    let verifier: Arc<dyn SignatureVerifier> = Arc::new(Ed25519Verifier);
    let attestations = Arc::new(AttestationVerifier::new(
        config.attestation.clone(),
        Arc::new(registry),
        Arc::clone(&verifier),
    ));
    let key_pools = Arc::new(KeyPoolManager::new(
        config.key_pool.clone(),
        &config.settlement,
        Arc::clone(&verifier),
    ));
    let channels = Arc::new(ChannelLedger::new(&config.settlement, Arc::clone(&verifier)));
    let journal = Arc::new(MemoryJournal::new());
    let coordinator = TransactionCoordinator::new(
        config.settlement.clone(),
        Arc::clone(&verifier),
        attestations,
        Arc::clone(&key_pools),
        Arc::clone(&channels),
        journal.clone(),
    );

    // Step 3: Register a device for each party
    println!("2. Registering attested devices...");
    let alice = Signer::generate();
    let bob = Signer::generate();
    let alice_device = DeviceId([0xa1; 32]);
    let bob_device = DeviceId([0xb1; 32]);
    let alice_keys: Vec<Signer> = (0..4).map(|_| Signer::generate()).collect();

    for (device_id, owner, keys) in [
        (alice_device, &alice, alice_keys.iter().map(Signer::public_key).collect()),
        (bob_device, &bob, vec![Signer::generate().public_key()]),
    ] {
        let quote = QuoteBuilder::new()
            .device_id(device_id)
            .manufacturer_id(manufacturer_id)
            .public_key(attestation_key.public_key())
            .timestamp(now)
            .measurement(sha256(b"shift-boot 1.2.0"))
            .measurement(sha256(b"shift-os 4.1.3"))
            .build_and_sign(&attestation_key)?;
        let certificate = DeviceCertificate::issue(
            &manufacturer_root,
            manufacturer_id,
            device_id,
            attestation_key.public_key(),
        );
        let handle = coordinator
            .register_device(
                DeviceRegistration {
                    device_id: device_id.as_bytes().to_vec(),
                    owner: PartyId(owner.public_key()),
                    hardware_type: HardwareType::ShiftDevice,
                    manufacturer_id: manufacturer_id.as_bytes().to_vec(),
                    quote,
                    certificate,
                    one_time_keys: keys,
                },
                now,
            )
            .await?;
        println!(
            "   Device {} attested until {}, {} one-time keys",
            handle.device_id, handle.attestation_expires_at, handle.available_keys
        );
    }
    println!();

    // Step 4: Open and fund a channel
    println!("3. Opening channel...");
    let channel_id = ChannelId(sha256(b"alice-bob-channel"));
    let alice_party = PartyId(alice.public_key());
    let bob_party = PartyId(bob.public_key());
    channels
        .open_channel(channel_id, alice_party, bob_party, 1_000_000, ChannelConfig::default(), now)
        .await?;
    let channel = channels.deposit(&channel_id, &bob_party, 500_000, now).await?;
    println!("   Balances: A={} B={}\n", channel.balance_a, channel.balance_b);

    // Step 5: Prepare and execute a transfer
    println!("4. Settling transfer...");
    let at = now + Duration::seconds(5);
    let handle = coordinator
        .prepare_transaction(channel_id, alice_device, 250_000, bob_device.as_bytes(), at)
        .await?;
    let hash = handle.transaction_hash;
    let signature = alice_keys[0].sign(&hash);
    let result = coordinator
        .execute_transaction(&handle, &signature.0, 0, &alice_keys[0].public_key(), at)
        .await?;
    println!("   Transaction {}", hex::encode(&hash[..8]));
    println!("   Balances: A={} B={}", result.balance_a, result.balance_b);
    println!(
        "   Destruction proof: {}",
        hex::encode(result.destruction_proof.proof)
    );

    let replay = coordinator
        .execute_transaction(&handle, &signature.0, 0, &alice_keys[0].public_key(), at)
        .await?;
    anyhow::ensure!(replay == result, "replay must return the original result");
    println!("   Replay returned cached result\n");

    // Step 6: Counterparty checks
    println!("5. Counterparty verification...");
    let burned = key_pools.verify_encumbrance(&result.destruction_proof).await?;
    let included = channels
        .inclusion_proof(&channel_id, &hash)
        .await?
        .context("settled transaction missing from log")?
        .verify(&channels.settlement_root(&channel_id).await?);
    println!("   Key encumbered: {burned}");
    println!("   In settlement log: {included}");
    println!("   Hash verifies: {}\n", coordinator.verify_transaction(&hash, &hash).await);

    // Step 7: Cooperative close
    println!("6. Closing channel...");
    let channel = channels.channel(&channel_id).await?;
    let message = channel.closing_message(channel.balance_a, channel.balance_b);
    let signatures = ClosingSignatures {
        party_a: Some(alice.sign(&message)),
        party_b: Some(bob.sign(&message)),
    };
    let closed = channels
        .close_channel(&channel_id, channel.balance_a, channel.balance_b, &signatures, at)
        .await?;
    println!("   Channel {} is {}", closed.channel_id, closed.status);
    println!("   Journal entries: {}", journal.entries().await?.len());

    let state = coordinator.protocol_state().await;
    println!(
        "\nDone: {} devices, {} transactions, fee {}",
        state.total_devices, state.total_transactions, state.protocol_fee
    );
    Ok(())
}
