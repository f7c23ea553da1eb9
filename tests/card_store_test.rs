//! Integration tests for card storage: migrate-on-read, dual-predicate
//! lookups, main-card exclusivity and tenant isolation.

mod common;

use common::*;
use noebs_store::crypto::{is_encrypted, is_hash, CryptoError};
use noebs_store::{Card, CardUpdate, DataCodec, StoreErrorKind};

const PAN: &str = "1234567890123456";

#[tokio::test]
async fn test_legacy_card_is_migrated_on_first_read() {
    let (_dir, store) = encrypted_store().await;
    let id = insert_legacy_card(&store, TENANT, 1, PAN).await;

    let card = store.get_card_by_id(TENANT, id).await.unwrap();
    assert_eq!(card.pan, PAN);

    let (pan, pan_enc) = stored_card_pan(&store, id).await;
    assert!(is_hash(&pan));
    assert_eq!(pan, store.codec().hash(PAN));
    let pan_enc = pan_enc.expect("ciphertext persisted");
    assert!(is_encrypted(&pan_enc));
    assert_eq!(store.codec().decrypt(&pan_enc).unwrap(), PAN);

    assert_eq!(store.migration_stats().migrated, 1);
    assert_eq!(store.migration_stats().backfill_failed, 0);

    // already migrated; nothing left to backfill
    let again = store.get_card_by_id(TENANT, id).await.unwrap();
    assert_eq!(again.pan, PAN);
    assert_eq!(store.migration_stats().migrated, 1);
}

#[tokio::test]
async fn test_lookup_by_pan_matches_before_and_after_migration() {
    let (_dir, store) = encrypted_store().await;
    let id = insert_legacy_card(&store, TENANT, 7, PAN).await;

    let before = store.get_card_by_pan(TENANT, 7, PAN).await.unwrap();
    assert_eq!(before.id, id);
    assert_eq!(before.pan, PAN);
    assert!(is_hash(&stored_card_pan(&store, id).await.0));

    let after = store.get_card_by_pan(TENANT, 7, PAN).await.unwrap();
    assert_eq!(after.id, id);
    assert_eq!(after.pan, PAN);
}

#[tokio::test]
async fn test_create_card_stores_hash_and_ciphertext() {
    let (_dir, store) = encrypted_store().await;
    let mut card = Card::new(3, "4111111111111111", "2701")
        .with_ipin("0000")
        .with_name("Salary");
    store.create_card(TENANT, &mut card).await.unwrap();

    assert!(card.id > 0);
    assert_eq!(card.tenant_id, TENANT);
    assert_eq!(card.pan, "4111111111111111");

    let (ipin, ipin_enc): (String, Option<String>) =
        sqlx::query_as("SELECT ipin, ipin_enc FROM cards WHERE id = $1")
            .bind(card.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert!(is_hash(&ipin));
    assert!(ipin_enc.is_some());

    let loaded = store.get_card_by_id(TENANT, card.id).await.unwrap();
    assert_eq!(loaded.pan, "4111111111111111");
    assert_eq!(loaded.ipin, "0000");
    assert_eq!(loaded.name, "Salary");
    assert_eq!(store.migration_stats().migrated, 0);
}

#[tokio::test]
async fn test_legacy_ipin_is_migrated_unconditionally() {
    let (_dir, store) = encrypted_store().await;
    let id = insert_legacy_card(&store, TENANT, 1, PAN).await;
    sqlx::query("UPDATE cards SET ipin = '12' WHERE id = $1")
        .bind(id)
        .execute(store.pool())
        .await
        .unwrap();

    let card = store.get_card_by_id(TENANT, id).await.unwrap();
    assert_eq!(card.ipin, "12");

    let (ipin, ipin_enc): (String, Option<String>) =
        sqlx::query_as("SELECT ipin, ipin_enc FROM cards WHERE id = $1")
            .bind(id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(ipin, store.codec().hash("12"));
    assert!(ipin_enc.is_some());
    assert_eq!(store.migration_stats().migrated, 2);
}

#[tokio::test]
async fn test_hash_without_ciphertext_is_an_error() {
    let (_dir, store) = encrypted_store().await;
    let id = insert_legacy_card(&store, TENANT, 1, PAN).await;
    sqlx::query("UPDATE cards SET pan = $1 WHERE id = $2")
        .bind(store.codec().hash(PAN))
        .bind(id)
        .execute(store.pool())
        .await
        .unwrap();

    let err = store.get_card_by_id(TENANT, id).await.unwrap_err();
    assert_eq!(err.kind, StoreErrorKind::Crypto(CryptoError::MissingCiphertext));
    assert!(!err.is_database_error());
}

#[tokio::test]
async fn test_set_main_card_from_zero_flagged() {
    let (_dir, store) = encrypted_store().await;
    let first = insert_legacy_card(&store, TENANT, 5, "5555555555554444").await;
    let second = insert_legacy_card(&store, TENANT, 5, PAN).await;

    store.set_main_card(TENANT, 5, PAN).await.unwrap();
    assert_eq!(main_card_ids(&store, TENANT, 5).await, vec![second]);

    let main = store.get_main_card(TENANT, 5).await.unwrap();
    assert_eq!(main.id, second);
    assert_eq!(main.pan, PAN);
    assert!(!store.get_card_by_id(TENANT, first).await.unwrap().is_main);
}

#[tokio::test]
async fn test_set_main_card_moves_single_flag() {
    let (_dir, store) = encrypted_store().await;
    let mut first = Card::new(5, "5555555555554444", "2701");
    store.create_card(TENANT, &mut first).await.unwrap();
    let mut second = Card::new(5, PAN, "2701");
    store.create_card(TENANT, &mut second).await.unwrap();

    store.set_main_card(TENANT, 5, "5555555555554444").await.unwrap();
    assert_eq!(main_card_ids(&store, TENANT, 5).await, vec![first.id]);

    store.set_main_card(TENANT, 5, PAN).await.unwrap();
    assert_eq!(main_card_ids(&store, TENANT, 5).await, vec![second.id]);
}

#[tokio::test]
async fn test_set_main_card_repairs_multiple_flags() {
    let (_dir, store) = encrypted_store().await;
    let a = insert_legacy_card(&store, TENANT, 9, "4000000000000002").await;
    let b = insert_legacy_card(&store, TENANT, 9, "4000000000000010").await;
    let c = insert_legacy_card(&store, TENANT, 9, PAN).await;
    sqlx::query("UPDATE cards SET is_main = 1 WHERE user_id = 9")
        .execute(store.pool())
        .await
        .unwrap();
    assert_eq!(main_card_ids(&store, TENANT, 9).await, vec![a, b, c]);

    store.set_main_card(TENANT, 9, PAN).await.unwrap();
    assert_eq!(main_card_ids(&store, TENANT, 9).await, vec![c]);
}

#[tokio::test]
async fn test_set_main_card_unknown_pan_keeps_previous_flags() {
    let (_dir, store) = encrypted_store().await;
    let mut card = Card::new(2, PAN, "2701");
    store.create_card(TENANT, &mut card).await.unwrap();
    store.set_main_card(TENANT, 2, PAN).await.unwrap();

    let err = store
        .set_main_card(TENANT, 2, "9999999999999999")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(main_card_ids(&store, TENANT, 2).await, vec![card.id]);
}

#[tokio::test]
async fn test_identical_pans_in_two_tenants_are_isolated() {
    let (_dir, store) = encrypted_store().await;
    let mut ours = Card::new(1, PAN, "2701");
    store.create_card(TENANT, &mut ours).await.unwrap();
    let mut theirs = Card::new(1, PAN, "2701");
    store.create_card(OTHER_TENANT, &mut theirs).await.unwrap();

    assert_ne!(ours.id, theirs.id);
    assert_eq!(store.get_card_by_pan(TENANT, 1, PAN).await.unwrap().id, ours.id);
    assert_eq!(
        store.get_card_by_pan(OTHER_TENANT, 1, PAN).await.unwrap().id,
        theirs.id
    );

    let err = store.get_card_by_id(TENANT, theirs.id).await.unwrap_err();
    assert!(err.is_not_found());

    store.set_main_card(OTHER_TENANT, 1, PAN).await.unwrap();
    assert!(main_card_ids(&store, TENANT, 1).await.is_empty());
    assert_eq!(main_card_ids(&store, OTHER_TENANT, 1).await, vec![theirs.id]);
}

#[tokio::test]
async fn test_update_card_columns_reseals_pan() {
    let (_dir, store) = encrypted_store().await;
    let mut card = Card::new(4, PAN, "2701");
    store.create_card(TENANT, &mut card).await.unwrap();

    let updated = store
        .update_card_columns(
            TENANT,
            card.id,
            CardUpdate {
                pan: Some("4111111111111111".to_string()),
                name: Some("Travel".to_string()),
                ..CardUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.pan, "4111111111111111");
    assert_eq!(updated.name, "Travel");
    assert_eq!(updated.expiry, "2701");
    assert!(updated.updated_at >= card.updated_at);

    let (pan, _) = stored_card_pan(&store, card.id).await;
    assert_eq!(pan, store.codec().hash("4111111111111111"));

    let err = store
        .update_card_columns(TENANT, card.id, CardUpdate::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_soft_deleted_cards_are_hidden() {
    let (_dir, store) = encrypted_store().await;
    let mut keep = Card::new(6, PAN, "2701");
    store.create_card(TENANT, &mut keep).await.unwrap();
    let mut gone = Card::new(6, "4111111111111111", "2701");
    store.create_card(TENANT, &mut gone).await.unwrap();

    store.delete_card(TENANT, gone.id).await.unwrap();

    let cards = store.get_cards_by_user(TENANT, 6).await.unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].id, keep.id);
    assert!(store.get_card_by_id(TENANT, gone.id).await.unwrap_err().is_not_found());
    assert!(store.delete_card(TENANT, gone.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_passthrough_mode_leaves_values_untouched() {
    let (_dir, store) = store_with(DataCodec::disabled()).await;
    let legacy = insert_legacy_card(&store, TENANT, 1, PAN).await;
    let mut card = Card::new(1, "4111111111111111", "2701");
    store.create_card(TENANT, &mut card).await.unwrap();

    assert_eq!(store.get_card_by_id(TENANT, legacy).await.unwrap().pan, PAN);
    assert_eq!(
        store.get_card_by_pan(TENANT, 1, "4111111111111111").await.unwrap().id,
        card.id
    );

    assert_eq!(stored_card_pan(&store, legacy).await, (PAN.to_string(), None));
    assert_eq!(
        stored_card_pan(&store, card.id).await,
        ("4111111111111111".to_string(), None)
    );
    assert_eq!(store.migration_stats().migrated, 0);
}

#[tokio::test]
async fn test_empty_tenant_is_rejected() {
    let (_dir, store) = encrypted_store().await;
    let err = store.get_cards_by_user("", 1).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_failed_backfill_does_not_fail_read() {
    let (_dir, store) = encrypted_store().await;
    let id = insert_legacy_card(&store, TENANT, 1, PAN).await;
    sqlx::query(
        "CREATE TRIGGER block_card_updates BEFORE UPDATE ON cards
         BEGIN SELECT RAISE(ABORT, 'cards are read only'); END",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let card = store.get_card_by_id(TENANT, id).await.unwrap();
    assert_eq!(card.pan, PAN);

    let stats = store.migration_stats();
    assert_eq!(stats.migrated, 0);
    assert_eq!(stats.backfill_failed, 1);
    assert_eq!(stored_card_pan(&store, id).await, (PAN.to_string(), None));
}

#[tokio::test]
async fn test_create_card_rejects_encoded_values() {
    let (_dir, store) = encrypted_store().await;

    let mut hashed = Card::new(1, store.codec().hash(PAN), "2701");
    let err = store.create_card(TENANT, &mut hashed).await.unwrap_err();
    assert_eq!(err.status_code(), 400);

    let sealed_ipin = store.codec().encrypt("0000").unwrap();
    let mut with_sealed_ipin = Card::new(1, PAN, "2701").with_ipin(sealed_ipin);
    let err = store.create_card(TENANT, &mut with_sealed_ipin).await.unwrap_err();
    assert!(matches!(err.kind, StoreErrorKind::InvalidInput { .. }));

    assert!(store.get_cards_by_user(TENANT, 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_with_hashed_pan_keeps_ciphertext() {
    let (_dir, store) = encrypted_store().await;
    let mut card = Card::new(4, PAN, "2701");
    store.create_card(TENANT, &mut card).await.unwrap();
    let before = stored_card_pan(&store, card.id).await;

    let err = store
        .update_card_columns(
            TENANT,
            card.id,
            CardUpdate {
                pan: Some(store.codec().hash(PAN)),
                ..CardUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = store
        .update_card_columns(
            TENANT,
            card.id,
            CardUpdate {
                ipin: Some(store.codec().encrypt("0000").unwrap()),
                ..CardUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let after = stored_card_pan(&store, card.id).await;
    assert_eq!(before, after);
    assert!(after.1.is_some());
    assert_eq!(store.get_card_by_id(TENANT, card.id).await.unwrap().pan, PAN);
}

#[tokio::test]
async fn test_passthrough_mode_rejects_hashed_pan() {
    let (_dir, store) = store_with(DataCodec::disabled()).await;
    let mut card = Card::new(1, format!("h:{}", "ab".repeat(32)), "2701");
    let err = store.create_card(TENANT, &mut card).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
}
