//! End-to-end connector flows against a scripted server.
//!
//! Each test plays the relay (and, where needed, a partner device) frame by
//! frame: registration, login with a key update, account export/import in
//! both trust modes, the retry ladder, streaming downloads, key rotation,
//! keepalive and self-removal.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use drift_core::events::SyncEvent;
use drift_core::harness::{test_defaults, ServerEnd, TestRig};
use drift_core::keystore::{crypt_key_name, secret_key_name, sign_key_name};
use drift_core::settings::{keys, Settings};
use drift_core::ExportData;

use drift_crypto::asym::{
    EncryptionKeyPair, EncryptionPublicKey, EncryptionScheme, SignatureScheme, SigningKeyPair,
    SigningPublicKey,
};
use drift_crypto::export::generate_export_key;
use drift_crypto::mac;
use drift_crypto::rng::seeded_rng;
use drift_crypto::secret::{SecretKey, CHACHA20_POLY1305};

use drift_proto::messages::{
    key_update_signature_data, AccountMessage, ChangedInfoMessage, ChangedMessage,
    DeviceKeysMessage, GrantMessage, IdentifyMessage, KeyDeviceEntry, KeyUpdate,
    LastChangedMessage, MacUpdateAckMessage, Message, ProofMessage, RegisterMessage,
    RemovedMessage, WelcomeMessage, NONCE_SIZE, PING_FRAME,
};

/// A partner device played directly by the test.
struct PeerDevice {
    id: Uuid,
    sign: SigningKeyPair,
    crypt: EncryptionKeyPair,
}

impl PeerDevice {
    fn new(tag: &[u8]) -> Self {
        let mut rng = seeded_rng(tag).unwrap();
        Self {
            id: Uuid::new_v4(),
            sign: SigningKeyPair::generate(SignatureScheme::EcdsaEcpSha3_512, 0, &mut rng)
                .unwrap(),
            crypt: EncryptionKeyPair::generate(EncryptionScheme::RsaOaepSha3_512, 2048, &mut rng)
                .unwrap(),
        }
    }
}

/// `sign-scheme ‖ sign-pub ‖ crypt-scheme ‖ crypt-pub ‖ index`, the byte
/// string covered by a key CMAC.
fn key_cmac_data(
    sign_scheme: &str,
    sign_der: &[u8],
    crypt_scheme: &str,
    crypt_der: &[u8],
    index: u32,
) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(sign_scheme.as_bytes());
    data.extend_from_slice(sign_der);
    data.extend_from_slice(crypt_scheme.as_bytes());
    data.extend_from_slice(crypt_der);
    data.extend_from_slice(&index.to_be_bytes());
    data
}

/// Drive a fresh registration to Idle. Returns the assigned device id, the
/// live server end and the registration message (the device's public keys).
async fn register(rig: &mut TestRig) -> (Uuid, ServerEnd, RegisterMessage) {
    let mut server = rig.next_server().await;
    server.send(&IdentifyMessage {
        nonce: vec![0x01; NONCE_SIZE],
        upload_limit: 1 << 20,
    });

    let (frame, raw) = server.next_message_raw().await;
    let register = match frame.message {
        Message::Register(m) => m,
        other => panic!("expected Register, got {other:?}"),
    };
    // The frame is signed with the embedded (fresh) signing key.
    let signed = frame.signed.expect("register frame must be signed");
    let sign_pub =
        SigningPublicKey::from_tagged_der(&register.sign_scheme, &register.sign_key).unwrap();
    sign_pub
        .verify(&raw[..signed.payload_len], &signed.signature)
        .unwrap();
    assert!(!register.cmac.is_empty());

    let device_id = Uuid::new_v4();
    server.send(&AccountMessage { device_id });
    rig.event_matching(|e| matches!(e, SyncEvent::Ready)).await;

    (device_id, server, register)
}

/// Export the account untrusted and accept the peer's proof, which hands
/// the current account secret to the test. Returns `(index, secret)`.
async fn grant_peer(
    rig: &mut TestRig,
    server: &mut ServerEnd,
    peer: &PeerDevice,
) -> (u32, Vec<u8>) {
    let (data, _salt, export_key) = rig.handle.export_account(false, None).await.unwrap();
    assert!(!data.trusted);

    let mut mac_data = data.p_nonce.clone();
    mac_data.extend_from_slice(data.partner_id.as_bytes());
    mac_data.extend_from_slice(data.scheme.as_bytes());
    let cmac = mac::create_cmac(&export_key, &mac_data).unwrap();

    server.send(&ProofMessage {
        p_nonce: data.p_nonce.clone(),
        device_id: peer.id,
        device_name: "peer phone".into(),
        sign_scheme: peer.sign.scheme().tag().into(),
        sign_key: peer.sign.public_der().unwrap(),
        crypt_scheme: peer.crypt.scheme().tag().into(),
        crypt_key: peer.crypt.public_der().unwrap(),
        mac_scheme: data.scheme.clone(),
        cmac,
        trust_cmac: None,
    });

    let event = rig
        .event_matching(|e| matches!(e, SyncEvent::LoginRequested(_)))
        .await;
    match &event {
        SyncEvent::LoginRequested(info) => {
            assert_eq!(info.device_id, peer.id);
            assert_eq!(info.name, "peer phone");
            assert_eq!(info.fingerprint.len(), 32);
        }
        _ => unreachable!(),
    }

    rig.handle.login_reply(peer.id, true);
    let frame = server.next_message().await;
    let accept = match frame.message {
        Message::Accept(m) => m,
        other => panic!("expected Accept, got {other:?}"),
    };
    assert_eq!(accept.device_id, peer.id);
    assert_eq!(accept.scheme, CHACHA20_POLY1305);

    let secret = peer.crypt.decrypt(&accept.secret).unwrap().to_vec();
    rig.event_matching(|e| matches!(e, SyncEvent::AccountAccessGranted(id) if *id == peer.id))
        .await;
    (accept.index, secret)
}

#[tokio::test(start_paused = true)]
async fn fresh_registration_persists_identity() {
    let mut rig = TestRig::spawn(test_defaults());

    let (device_id, _server, _register) = register(&mut rig).await;

    assert_eq!(rig.settings.get_uuid(keys::DEVICE_ID), Some(device_id));
    assert!(rig.keystore.contains(&sign_key_name(&device_id)));
    assert!(rig.keystore.contains(&crypt_key_name(&device_id)));
    // The active symmetric generation is sealed as well.
    assert!(rig.keystore.contains(&secret_key_name(&device_id, 0)));
    assert_eq!(rig.settings.get_u32(keys::KEYS_ACTIVE), Some(0));
    // The effective server configuration was persisted verbatim.
    assert_eq!(
        rig.settings.get_str(keys::REMOTE_URL).as_deref(),
        Some("wss://sync.test.example/ws")
    );
}

#[tokio::test(start_paused = true)]
async fn registration_emits_reconnecting_then_ready() {
    let mut rig = TestRig::spawn(test_defaults());

    assert!(matches!(rig.next_event().await, SyncEvent::Reconnecting));
    let mut server = rig.next_server().await;
    server.send(&IdentifyMessage {
        nonce: vec![0x01; NONCE_SIZE],
        upload_limit: 1_048_576,
    });
    assert!(matches!(
        rig.next_event().await,
        SyncEvent::UpdateUploadLimit(1_048_576)
    ));
    let _ = server.next_message().await;
    server.send(&AccountMessage {
        device_id: Uuid::new_v4(),
    });
    assert!(matches!(rig.next_event().await, SyncEvent::Ready));
}

#[tokio::test(start_paused = true)]
async fn login_applies_key_updates_and_sends_mac_update() {
    let mut rig = TestRig::spawn(test_defaults());
    let (device_id, mut server, register) = register(&mut rig).await;

    // Extract the account secret by playing an accepted partner device.
    let peer = PeerDevice::new(b"peer-login");
    let (index, secret) = grant_peer(&mut rig, &mut server, &peer).await;
    assert_eq!(index, 0);

    // Drop the connection; the client retries and logs in.
    drop(server);
    let mut server = rig.next_server().await;
    server.send(&IdentifyMessage {
        nonce: vec![0x02; NONCE_SIZE],
        upload_limit: 1 << 20,
    });

    let (frame, raw) = server.next_message_raw().await;
    let login = match frame.message {
        Message::Login(m) => m,
        other => panic!("expected Login, got {other:?}"),
    };
    assert_eq!(login.device_id, device_id);
    assert_eq!(login.nonce, vec![0x02; NONCE_SIZE]);
    let signed = frame.signed.expect("login frame must be signed");
    SigningPublicKey::from_tagged_der(&register.sign_scheme, &register.sign_key)
        .unwrap()
        .verify(&raw[..signed.payload_len], &signed.signature)
        .unwrap();

    // A peer rotated the account secret while this device was offline:
    // deliver generation 1, wrapped for this device, MACed under
    // generation 0.
    let new_secret = SecretKey::generate().unwrap();
    let crypt_pub =
        EncryptionPublicKey::from_tagged_der(&register.crypt_scheme, &register.crypt_key).unwrap();
    let wrapped = crypt_pub.encrypt(new_secret.as_bytes()).unwrap();
    let update_data = key_update_signature_data(&device_id, 1, CHACHA20_POLY1305, &wrapped);
    let update_cmac = mac::create_cmac(&secret, &update_data).unwrap();

    server.send(&WelcomeMessage {
        has_changes: true,
        key_updates: vec![KeyUpdate {
            index: 1,
            scheme: CHACHA20_POLY1305.into(),
            key: wrapped,
            cmac: update_cmac,
        }],
    });

    rig.event_matching(|e| matches!(e, SyncEvent::ReadyWithChanges))
        .await;

    // The client must re-prove knowledge under the new generation.
    let frame = server.next_message().await;
    let mac_update = match frame.message {
        Message::MacUpdate(m) => m,
        other => panic!("expected MacUpdate, got {other:?}"),
    };
    assert_eq!(mac_update.key_index, 1);
    let cmac_data = key_cmac_data(
        &register.sign_scheme,
        &register.sign_key,
        &register.crypt_scheme,
        &register.crypt_key,
        1,
    );
    mac::verify_cmac(new_secret.as_bytes(), &cmac_data, &mac_update.cmac).unwrap();
    server.send(&MacUpdateAckMessage);
}

#[tokio::test(start_paused = true)]
async fn untrusted_import_waits_for_user_acceptance() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, mut server, _register) = register(&mut rig).await;

    let peer = PeerDevice::new(b"peer-untrusted");
    let (index, secret) = grant_peer(&mut rig, &mut server, &peer).await;
    assert_eq!(index, 0);
    assert_eq!(secret.len(), 32);
}

#[tokio::test(start_paused = true)]
async fn denied_login_reply_sends_deny() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, mut server, _register) = register(&mut rig).await;

    let peer = PeerDevice::new(b"peer-denied");
    let (data, _salt, export_key) = rig.handle.export_account(false, None).await.unwrap();
    let mut mac_data = data.p_nonce.clone();
    mac_data.extend_from_slice(data.partner_id.as_bytes());
    mac_data.extend_from_slice(data.scheme.as_bytes());
    server.send(&ProofMessage {
        p_nonce: data.p_nonce.clone(),
        device_id: peer.id,
        device_name: "rejected".into(),
        sign_scheme: peer.sign.scheme().tag().into(),
        sign_key: peer.sign.public_der().unwrap(),
        crypt_scheme: peer.crypt.scheme().tag().into(),
        crypt_key: peer.crypt.public_der().unwrap(),
        mac_scheme: data.scheme.clone(),
        cmac: mac::create_cmac(&export_key, &mac_data).unwrap(),
        trust_cmac: None,
    });
    rig.event_matching(|e| matches!(e, SyncEvent::LoginRequested(_)))
        .await;

    rig.handle.login_reply(peer.id, false);
    let frame = server.next_message().await;
    match frame.message {
        Message::Deny(m) => assert_eq!(m.device_id, peer.id),
        other => panic!("expected Deny, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn proof_with_wrong_cmac_is_denied() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, mut server, _register) = register(&mut rig).await;

    let peer = PeerDevice::new(b"peer-forged");
    let (data, _salt, _export_key) = rig.handle.export_account(false, None).await.unwrap();
    server.send(&ProofMessage {
        p_nonce: data.p_nonce.clone(),
        device_id: peer.id,
        device_name: "forger".into(),
        sign_scheme: peer.sign.scheme().tag().into(),
        sign_key: peer.sign.public_der().unwrap(),
        crypt_scheme: peer.crypt.scheme().tag().into(),
        crypt_key: peer.crypt.public_der().unwrap(),
        mac_scheme: data.scheme.clone(),
        cmac: vec![0u8; 16],
        trust_cmac: None,
    });
    let frame = server.next_message().await;
    match frame.message {
        Message::Deny(m) => assert_eq!(m.device_id, peer.id),
        other => panic!("expected Deny, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unresolved_proof_is_auto_denied() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, mut server, _register) = register(&mut rig).await;

    let peer = PeerDevice::new(b"peer-expired");
    let (data, _salt, export_key) = rig.handle.export_account(false, None).await.unwrap();
    let mut mac_data = data.p_nonce.clone();
    mac_data.extend_from_slice(data.partner_id.as_bytes());
    mac_data.extend_from_slice(data.scheme.as_bytes());
    server.send(&ProofMessage {
        p_nonce: data.p_nonce.clone(),
        device_id: peer.id,
        device_name: "ignored".into(),
        sign_scheme: peer.sign.scheme().tag().into(),
        sign_key: peer.sign.public_der().unwrap(),
        crypt_scheme: peer.crypt.scheme().tag().into(),
        crypt_key: peer.crypt.public_der().unwrap(),
        mac_scheme: data.scheme.clone(),
        cmac: mac::create_cmac(&export_key, &mac_data).unwrap(),
        trust_cmac: None,
    });
    rig.event_matching(|e| matches!(e, SyncEvent::LoginRequested(_)))
        .await;

    // Nobody answers; after the timeout exactly one Deny goes out.
    let frame = server.next_message().await;
    match frame.message {
        Message::Deny(m) => assert_eq!(m.device_id, peer.id),
        other => panic!("expected Deny, got {other:?}"),
    }

    // A late acceptance finds nothing; the next outbound frame is the
    // device listing, not a second Deny or an Accept.
    rig.handle.login_reply(peer.id, true);
    rig.handle.list_devices();
    let frame = server.next_message().await;
    assert!(matches!(frame.message, Message::ListDevices(_)));
}

#[tokio::test(start_paused = true)]
async fn retry_ladder_backs_off_and_resets() {
    let mut rig = TestRig::spawn_configured(test_defaults(), Arc::new(Settings::in_memory()), 3);

    // Three refused attempts, then the fourth connects and registers.
    let (_device_id, server, _register) = register(&mut rig).await;

    let attempts = rig.factory.attempts();
    assert_eq!(attempts.len(), 4);
    let deltas: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(deltas[0] >= Duration::from_secs(5) && deltas[0] < Duration::from_secs(7));
    assert!(deltas[1] >= Duration::from_secs(10) && deltas[1] < Duration::from_secs(12));
    assert!(deltas[2] >= Duration::from_secs(30) && deltas[2] < Duration::from_secs(32));

    // A successful login reset the ladder: the next failure starts at the
    // shortest delay again.
    drop(server);
    let _server = rig.next_server().await;
    let attempts = rig.factory.attempts();
    assert_eq!(attempts.len(), 5);
    let delta = attempts[4] - attempts[3];
    assert!(delta >= Duration::from_secs(5) && delta < Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn resync_streams_changes() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, mut server, _register) = register(&mut rig).await;
    let peer = PeerDevice::new(b"peer-resync");
    let (_, secret) = grant_peer(&mut rig, &mut server, &peer).await;
    let account_key = SecretKey::from_bytes(CHACHA20_POLY1305, &secret).unwrap();

    rig.handle.resync();
    let frame = server.next_message().await;
    assert!(matches!(frame.message, Message::Sync(_)));

    let payloads: [&[u8]; 3] = [b"change-1", b"change-2", b"change-3"];
    let (salt, data) = account_key.encrypt(payloads[0]).unwrap();
    server.send(&ChangedInfoMessage {
        change_estimate: 3,
        data_index: 10,
        key_index: 0,
        salt,
        data,
    });
    for (offset, payload) in payloads[1..].iter().enumerate() {
        let (salt, data) = account_key.encrypt(payload).unwrap();
        server.send(&ChangedMessage {
            data_index: 11 + offset as u64,
            key_index: 0,
            salt,
            data,
        });
    }
    server.send(&LastChangedMessage);

    rig.event_matching(|e| matches!(e, SyncEvent::ProgressAdded(3)))
        .await;
    for (offset, payload) in payloads.iter().enumerate() {
        let event = rig
            .event_matching(|e| matches!(e, SyncEvent::DownloadData(_, _)))
            .await;
        match event {
            SyncEvent::DownloadData(index, data) => {
                assert_eq!(index, 10 + offset as u64);
                assert_eq!(data, *payload);
            }
            _ => unreachable!(),
        }
        rig.handle.download_done(10 + offset as u64);
    }
    rig.event_matching(|e| matches!(e, SyncEvent::Ready)).await;
}

#[tokio::test(start_paused = true)]
async fn upload_round_trips_through_active_generation() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, mut server, _register) = register(&mut rig).await;
    let peer = PeerDevice::new(b"peer-upload");
    let (_, secret) = grant_peer(&mut rig, &mut server, &peer).await;
    let account_key = SecretKey::from_bytes(CHACHA20_POLY1305, &secret).unwrap();

    rig.handle
        .upload_data(b"object-1".to_vec(), b"the payload".to_vec());
    rig.event_matching(|e| matches!(e, SyncEvent::Sending)).await;

    let frame = server.next_message().await;
    let change = match frame.message {
        Message::Change(m) => m,
        other => panic!("expected Change, got {other:?}"),
    };
    assert_eq!(change.data_id, b"object-1");
    assert_eq!(change.key_index, 0);
    assert_eq!(
        account_key.decrypt(&change.salt, &change.data).unwrap(),
        b"the payload"
    );

    server.send(&drift_proto::messages::ChangeAckMessage {
        data_id: change.data_id.clone(),
    });
    rig.event_matching(
        |e| matches!(e, SyncEvent::UploadDone(id) if id.as_slice() == b"object-1"),
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn key_rotation_wraps_the_new_secret_for_the_fleet() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, mut server, register) = register(&mut rig).await;
    let peer = PeerDevice::new(b"peer-rotation");
    let (_, secret) = grant_peer(&mut rig, &mut server, &peer).await;

    rig.handle.init_key_update();
    let frame = server.next_message().await;
    match frame.message {
        Message::KeyChange(m) => assert_eq!(m.next_index, 1),
        other => panic!("expected KeyChange, got {other:?}"),
    }

    // The peer proves knowledge of the current secret.
    let peer_cmac_data = key_cmac_data(
        peer.sign.scheme().tag(),
        &peer.sign.public_der().unwrap(),
        peer.crypt.scheme().tag(),
        &peer.crypt.public_der().unwrap(),
        0,
    );
    server.send(&DeviceKeysMessage {
        key_index: 1,
        duplicated: false,
        devices: vec![KeyDeviceEntry {
            device_id: peer.id,
            sign_scheme: peer.sign.scheme().tag().into(),
            sign_key: peer.sign.public_der().unwrap(),
            crypt_scheme: peer.crypt.scheme().tag().into(),
            crypt_key: peer.crypt.public_der().unwrap(),
            cmac: mac::create_cmac(&secret, &peer_cmac_data).unwrap(),
        }],
    });

    let frame = server.next_message().await;
    let new_key = match frame.message {
        Message::NewKey(m) => m,
        other => panic!("expected NewKey, got {other:?}"),
    };
    assert_eq!(new_key.key_index, 1);
    assert_eq!(new_key.scheme, CHACHA20_POLY1305);
    assert_eq!(new_key.device_keys.len(), 1);

    // The peer can unwrap the new generation, and the per-device CMAC is
    // keyed by the previous one.
    let update = &new_key.device_keys[0];
    assert_eq!(update.device_id, peer.id);
    let new_secret = peer.crypt.decrypt(&update.key).unwrap().to_vec();
    let update_data =
        key_update_signature_data(&peer.id, 1, CHACHA20_POLY1305, &update.key);
    mac::verify_cmac(&secret, &update_data, &update.cmac).unwrap();

    // The message-level CMAC proves the rotating device knows the new key.
    let own_data = key_cmac_data(
        &register.sign_scheme,
        &register.sign_key,
        &register.crypt_scheme,
        &register.crypt_key,
        1,
    );
    mac::verify_cmac(&new_secret, &own_data, &new_key.cmac).unwrap();

    // Only after the acknowledgement does the new generation go active.
    server.send(&drift_proto::messages::NewKeyAckMessage { key_index: 1 });
    rig.handle
        .upload_data(b"post-rotation".to_vec(), b"fresh".to_vec());
    let frame = server.next_message().await;
    match frame.message {
        Message::Change(m) => {
            assert_eq!(m.key_index, 1);
            let key = SecretKey::from_bytes(CHACHA20_POLY1305, &new_secret).unwrap();
            assert_eq!(key.decrypt(&m.salt, &m.data).unwrap(), b"fresh");
        }
        other => panic!("expected Change, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn trusted_import_runs_the_access_round() {
    // Start disabled so the import can be staged before the first connect.
    let settings = Arc::new(Settings::in_memory());
    settings.set_bool(keys::ENABLED, false);
    let mut rig = TestRig::spawn_configured(test_defaults(), settings, 0);

    // The exporting device (played by the test) created a trusted export.
    let partner_id = Uuid::new_v4();
    let (scheme, _salt, export_key) = generate_export_key(Some("correct horse")).unwrap();
    let p_nonce = vec![0x42; NONCE_SIZE];
    let mut sign_data = p_nonce.clone();
    sign_data.extend_from_slice(partner_id.as_bytes());
    sign_data.extend_from_slice(scheme.as_bytes());
    let cmac = mac::create_cmac(export_key.as_bytes(), &sign_data).unwrap();

    rig.handle
        .prepare_import(
            ExportData {
                partner_id,
                trusted: true,
                p_nonce: p_nonce.clone(),
                scheme: scheme.clone(),
                cmac: cmac.clone(),
                config: None,
            },
            Some(export_key.as_bytes().to_vec()),
        )
        .await
        .unwrap();
    assert!(rig.settings.contains(keys::IMPORT_NONCE));

    rig.handle.set_sync_enabled(true);
    let mut server = rig.next_server().await;
    server.send(&IdentifyMessage {
        nonce: vec![0x03; NONCE_SIZE],
        upload_limit: 1 << 20,
    });

    let (frame, raw) = server.next_message_raw().await;
    let access = match frame.message {
        Message::Access(m) => m,
        other => panic!("expected Access, got {other:?}"),
    };
    assert_eq!(access.partner_id, partner_id);
    assert_eq!(access.p_nonce, p_nonce);
    assert_eq!(access.mac_scheme, scheme);
    assert_eq!(access.cmac, cmac);
    let signed = frame.signed.expect("access frame must be signed");
    SigningPublicKey::from_tagged_der(&access.sign_scheme, &access.sign_key)
        .unwrap()
        .verify(&raw[..signed.payload_len], &signed.signature)
        .unwrap();

    // The trust CMAC covers the importer's encryption key.
    let trust_cmac = access.trust_cmac.expect("trusted import sends a trust cmac");
    let mut trust_data = access.crypt_scheme.as_bytes().to_vec();
    trust_data.extend_from_slice(&access.crypt_key);
    mac::verify_cmac(export_key.as_bytes(), &trust_data, &trust_cmac).unwrap();

    // Grant: deliver the account secret wrapped for the importer.
    let account_secret = SecretKey::generate().unwrap();
    let importer_crypt =
        EncryptionPublicKey::from_tagged_der(&access.crypt_scheme, &access.crypt_key).unwrap();
    let wrapped = importer_crypt.encrypt(account_secret.as_bytes()).unwrap();
    let new_device_id = Uuid::new_v4();
    server.send(&GrantMessage {
        device_id: new_device_id,
        index: 0,
        scheme: CHACHA20_POLY1305.into(),
        secret: wrapped,
    });

    rig.event_matching(|e| matches!(e, SyncEvent::Ready)).await;
    rig.event_matching(|e| matches!(e, SyncEvent::ImportCompleted))
        .await;

    // The staging keys are gone, the identity persisted, and the server
    // CMAC re-sent under the granted secret.
    assert!(!rig.settings.contains(keys::IMPORT_NONCE));
    assert_eq!(rig.settings.get_uuid(keys::DEVICE_ID), Some(new_device_id));
    let frame = server.next_message().await;
    let mac_update = match frame.message {
        Message::MacUpdate(m) => m,
        other => panic!("expected MacUpdate, got {other:?}"),
    };
    assert_eq!(mac_update.key_index, 0);
    let cmac_data = key_cmac_data(
        &access.sign_scheme,
        &access.sign_key,
        &access.crypt_scheme,
        &access.crypt_key,
        0,
    );
    mac::verify_cmac(account_secret.as_bytes(), &cmac_data, &mac_update.cmac).unwrap();
}

#[tokio::test(start_paused = true)]
async fn self_removal_clears_identity_and_reconnects() {
    let mut rig = TestRig::spawn(test_defaults());
    let (device_id, mut server, _register) = register(&mut rig).await;
    assert!(rig.keystore.contains(&sign_key_name(&device_id)));

    rig.handle.reset_account(false);
    let frame = server.next_message().await;
    match frame.message {
        Message::Remove(m) => assert_eq!(m.device_id, device_id),
        other => panic!("expected Remove, got {other:?}"),
    }
    // Key material is wiped before the server even confirms.
    assert!(!rig.keystore.contains(&sign_key_name(&device_id)));
    assert!(!rig.keystore.contains(&crypt_key_name(&device_id)));
    assert_eq!(rig.settings.get_uuid(keys::DEVICE_ID), None);

    server.send(&RemovedMessage { device_id });

    // The connector reconnects and, having no identity, registers anew.
    let mut server = rig.next_server().await;
    server.send(&IdentifyMessage {
        nonce: vec![0x04; NONCE_SIZE],
        upload_limit: 1 << 20,
    });
    let frame = server.next_message().await;
    assert!(matches!(frame.message, Message::Register(_)));
}

#[tokio::test(start_paused = true)]
async fn two_missed_pings_reconnect_once() {
    let settings = Arc::new(Settings::in_memory());
    settings.set_u32(keys::KEEPALIVE_TIMEOUT, 1);
    let mut rig = TestRig::spawn_configured(test_defaults(), settings, 0);
    let (_device_id, mut server, _register) = register(&mut rig).await;

    // First keepalive fire sends the ping frame.
    let frame = server.recv_raw().await;
    assert_eq!(frame.as_ref(), PING_FRAME);

    // No reply: the second fire tears the connection down and reconnects.
    let _new_server = rig.next_server().await;
    assert_eq!(rig.factory.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn answered_pings_keep_the_connection() {
    let settings = Arc::new(Settings::in_memory());
    settings.set_u32(keys::KEEPALIVE_TIMEOUT, 1);
    let mut rig = TestRig::spawn_configured(test_defaults(), settings, 0);
    let (_device_id, mut server, _register) = register(&mut rig).await;

    for _ in 0..3 {
        let frame = server.recv_raw().await;
        assert_eq!(frame.as_ref(), PING_FRAME);
        server.send_raw(PING_FRAME);
    }
    assert_eq!(rig.factory.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn set_sync_enabled_is_idempotent() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, _server, _register) = register(&mut rig).await;

    rig.handle.set_sync_enabled(false);
    rig.event_matching(|e| matches!(e, SyncEvent::SyncEnabledChanged(false)))
        .await;

    // Setting the same value again emits nothing; the next observable
    // change event is the device rename marker.
    rig.handle.set_sync_enabled(false);
    rig.handle.set_device_name("marker");
    loop {
        match rig.next_event().await {
            SyncEvent::SyncEnabledChanged(_) => panic!("duplicate syncEnabledChanged"),
            SyncEvent::DeviceNameChanged(name) => {
                assert_eq!(name, "marker");
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn operations_outside_idle_are_dropped() {
    // Sync disabled: the connector sits inactive.
    let settings = Arc::new(Settings::in_memory());
    settings.set_bool(keys::ENABLED, false);
    let mut rig = TestRig::spawn_configured(test_defaults(), settings, 0);
    rig.event_matching(|e| matches!(e, SyncEvent::Disconnected))
        .await;

    // None of these may produce a connection or a frame.
    rig.handle.resync();
    rig.handle.list_devices();
    rig.handle.upload_data(b"k".to_vec(), b"v".to_vec());
    rig.handle.download_done(1);
    rig.handle.init_key_update();

    // Re-enabling still works afterwards, proving the loop is healthy.
    rig.handle.set_sync_enabled(true);
    rig.event_matching(|e| matches!(e, SyncEvent::SyncEnabledChanged(true)))
        .await;
    let _server = rig.next_server().await;
    assert_eq!(rig.factory.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn finalize_emits_finalized() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, _server, _register) = register(&mut rig).await;

    rig.handle.finalize();
    rig.event_matching(|e| matches!(e, SyncEvent::Finalized))
        .await;
}

#[tokio::test(start_paused = true)]
async fn devices_listing_is_cached_and_pruned() {
    let mut rig = TestRig::spawn(test_defaults());
    let (_device_id, mut server, _register) = register(&mut rig).await;

    rig.handle.list_devices();
    let frame = server.next_message().await;
    assert!(matches!(frame.message, Message::ListDevices(_)));

    let other = Uuid::new_v4();
    server.send(&drift_proto::messages::DevicesMessage {
        devices: vec![drift_proto::messages::DeviceEntry {
            device_id: other,
            name: "tablet".into(),
            fingerprint: vec![0xAB; 32],
        }],
    });
    let event = rig
        .event_matching(|e| matches!(e, SyncEvent::DevicesListed(_)))
        .await;
    match event {
        SyncEvent::DevicesListed(devices) => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].device_id, other);
        }
        _ => unreachable!(),
    }

    // Removal of a peer prunes the cache and re-emits the listing.
    server.send(&RemovedMessage { device_id: other });
    let event = rig
        .event_matching(|e| matches!(e, SyncEvent::DevicesListed(_)))
        .await;
    match event {
        SyncEvent::DevicesListed(devices) => assert!(devices.is_empty()),
        _ => unreachable!(),
    }
}
