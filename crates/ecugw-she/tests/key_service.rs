//! Key service behaviour against the software secure element

use std::sync::Arc;
use std::time::Duration;

use ecugw_she::crypto;
use ecugw_she::{
    Key128, KeyService, KeyServiceError, KeySlot, SheCommand, SheResponse, SoftSecureElement,
};

const UID: [u8; 15] = [0x3C; 15];

fn setup(latency: Duration, timeout: Duration) -> (Arc<SoftSecureElement>, KeyService) {
    let element = Arc::new(SoftSecureElement::new(UID).with_latency(latency));
    let service = KeyService::new(element.clone(), timeout);
    (element, service)
}

async fn provisioned() -> (Arc<SoftSecureElement>, KeyService) {
    let (element, service) = setup(Duration::ZERO, Duration::from_millis(500));
    service
        .set_auth_key(&Key128::new([0x42; 16]))
        .await
        .unwrap();
    (element, service)
}

#[tokio::test]
async fn load_key_counter_sequence_rejects_replay() {
    let (element, service) = provisioned().await;
    let key = Key128::new([0x10; 16]);

    service.load_key(KeySlot::User(1), &key, 1).await.unwrap();
    service.load_key(KeySlot::User(1), &key, 2).await.unwrap();
    let err = service.load_key(KeySlot::User(1), &key, 1).await.unwrap_err();

    assert_eq!(
        err,
        KeyServiceError::CounterNotIncreasing {
            slot: KeySlot::User(1),
            counter: 1,
            stored: 2,
        }
    );
    assert_eq!(element.slot_counter(KeySlot::User(1)), Some(2));
}

#[tokio::test]
async fn equal_counter_is_also_rejected() {
    let (_element, service) = provisioned().await;
    let key = Key128::new([0x10; 16]);
    service.load_key(KeySlot::User(2), &key, 7).await.unwrap();
    assert!(matches!(
        service.load_key(KeySlot::User(2), &key, 7).await,
        Err(KeyServiceError::CounterNotIncreasing { .. })
    ));
}

#[tokio::test]
async fn provisioned_key_encrypts_like_reference_cbc() {
    let (_element, service) = provisioned().await;
    let key = [0x5Eu8; 16];
    service
        .load_key(KeySlot::User(1), &Key128::new(key), 1)
        .await
        .unwrap();

    let data = [0xA7u8; 64];
    let enc = service
        .encrypt_cbc(KeySlot::User(1), [0; 16], &data)
        .await
        .unwrap();
    assert_eq!(enc, crypto::cbc_encrypt(&key, &[0; 16], &data).unwrap());

    let dec = service
        .decrypt_cbc(KeySlot::User(1), [0; 16], &enc)
        .await
        .unwrap();
    assert_eq!(dec, data);
}

#[tokio::test]
async fn mac_generate_and_verify() {
    let (_element, service) = provisioned().await;
    service
        .load_key(KeySlot::User(3), &Key128::new([9; 16]), 1)
        .await
        .unwrap();
    let mac = service.generate_mac(KeySlot::User(3), b"firmware").await.unwrap();
    assert!(service.verify_mac(KeySlot::User(3), b"firmware", &mac).await.unwrap());
    assert!(!service.verify_mac(KeySlot::User(3), b"firmwarE", &mac).await.unwrap());
}

#[tokio::test]
async fn ram_key_loads_in_plain() {
    let (_element, service) = setup(Duration::ZERO, Duration::from_millis(500));
    let key = [0x77u8; 16];
    service.load_plain_ram_key(&Key128::new(key)).await.unwrap();
    let enc = service.encrypt_ecb(KeySlot::Ram, &[0u8; 16]).await.unwrap();
    assert_eq!(enc, crypto::ecb_encrypt(&key, &[0u8; 16]).unwrap());
}

#[tokio::test]
async fn second_start_while_in_flight_is_busy() {
    let (_element, service) = setup(Duration::from_millis(100), Duration::from_secs(1));

    let mut pending = service.start(SheCommand::Random).unwrap();
    assert!(matches!(
        service.start(SheCommand::Random),
        Err(KeyServiceError::Busy)
    ));
    assert!(pending.poll().is_none());

    let response = pending.wait().await.unwrap();
    assert!(matches!(response, SheResponse::Random(_)));

    // Token is free again
    let again = service.start(SheCommand::Random).unwrap();
    assert!(again.wait().await.is_ok());
}

#[tokio::test]
async fn blocking_call_gives_up_with_busy() {
    // Erase runs three element commands back to back under one token
    let (_element, service) = setup(Duration::from_millis(40), Duration::from_millis(60));
    let eraser = service.clone();
    let erase = tokio::spawn(async move { eraser.erase_keys().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = service.execute(SheCommand::Random).await.unwrap_err();
    assert_eq!(err, KeyServiceError::Busy);
    assert!(erase.await.unwrap().is_ok());
}

#[tokio::test]
async fn timeout_cancels_and_frees_element() {
    let (element, service) = setup(Duration::from_millis(300), Duration::from_millis(30));

    let err = service.execute(SheCommand::Random).await.unwrap_err();
    assert_eq!(err, KeyServiceError::Timeout(Duration::from_millis(30)));
    assert_eq!(element.cancel_count(), 1);

    // The token was released after cancellation
    let pending = service.start(SheCommand::Random).unwrap();
    assert!(matches!(
        pending.wait().await,
        Err(KeyServiceError::Timeout(_))
    ));
    assert_eq!(element.cancel_count(), 2);
}

#[tokio::test]
async fn erase_keys_wipes_element_and_mirror() {
    let (element, service) = provisioned().await;
    service
        .load_key(KeySlot::User(4), &Key128::new([4; 16]), 3)
        .await
        .unwrap();

    service.erase_keys().await.unwrap();

    assert_eq!(element.slot_counter(KeySlot::Master), None);
    assert_eq!(element.slot_counter(KeySlot::User(4)), None);
    assert_eq!(service.slot_counter(KeySlot::User(4)), None);

    // Bootstrapping works again from the empty key
    assert_eq!(service.set_auth_key(&Key128::new([8; 16])).await.unwrap(), 1);
}

#[tokio::test]
async fn erase_with_wrong_master_is_refused() {
    let (element, service) = provisioned().await;
    // Service believes a different master key is installed
    service.restore_slot(KeySlot::Master, Some(Key128::new([0; 16])), 1);

    assert!(matches!(
        service.erase_keys().await,
        Err(KeyServiceError::Element(_))
    ));
    assert_eq!(element.slot_counter(KeySlot::Master), Some(1));
}

#[tokio::test]
async fn concurrent_loads_keep_the_higher_counter() {
    let (element, service) = setup(Duration::from_millis(20), Duration::from_millis(500));
    service
        .set_auth_key(&Key128::new([0x42; 16]))
        .await
        .unwrap();
    let key = Key128::new([0x10; 16]);

    // Both pass the early replay check; the lower one queues behind the token
    let (high, low) = tokio::join!(
        service.load_key(KeySlot::User(3), &key, 3),
        service.load_key(KeySlot::User(3), &key, 2),
    );

    high.unwrap();
    assert_eq!(
        low.unwrap_err(),
        KeyServiceError::CounterNotIncreasing {
            slot: KeySlot::User(3),
            counter: 2,
            stored: 3,
        }
    );
    assert_eq!(service.slot_counter(KeySlot::User(3)), Some(3));
    assert_eq!(element.slot_counter(KeySlot::User(3)), Some(3));
}
