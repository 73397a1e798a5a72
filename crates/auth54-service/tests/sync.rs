//! Replica convergence: hash comparison, forced synchronization, and
//! best-effort callbacks, driven in-process.

use auth54_core::actor::{Actor, ActorType};
use auth54_core::crypto::KeypairSigner;
use auth54_service::handlers::{Method, Request, dispatch};
use auth54_service::store::{ActorPermactionRow, Db};
use auth54_service::sync::{EMPTY_HASH_SENTINEL, SyncEngine};
use auth54_service::{ServiceChannel, ServiceConfig, ServiceContext};
use serde_json::{Value, json};

fn config_toml(service_uuid: &str, signer: &KeypairSigner, authority_key: &str) -> String {
    format!(
        "service_uuid = \"{service_uuid}\"\n\
         service_domain = \"http://127.0.0.1:9\"\n\
         public_key = \"{}\"\n\
         private_key = \"{}\"\n\
         [auth]\n\
         url = \"http://127.0.0.1:9\"\n\
         public_key = \"{authority_key}\"\n\
         [database]\n\
         path = \"unused.sqlite\"\n",
        signer.public_key_hex(),
        signer.private_key_hex(),
    )
}

fn federation() -> (ServiceContext, ServiceContext) {
    let authority_signer = KeypairSigner::generate();
    let dependent_signer = KeypairSigner::generate();
    let authority_uuid = uuid::Uuid::new_v4().to_string();
    let dependent_uuid = uuid::Uuid::new_v4().to_string();

    let authority = ServiceContext::with_db(
        ServiceConfig::from_toml(&config_toml(
            &authority_uuid,
            &authority_signer,
            &authority_signer.public_key_hex(),
        ))
        .unwrap(),
        Db::open_in_memory().unwrap(),
    )
    .unwrap();
    let dependent = ServiceContext::with_db(
        ServiceConfig::from_toml(&config_toml(
            &dependent_uuid,
            &dependent_signer,
            &authority_signer.public_key_hex(),
        ))
        .unwrap(),
        Db::open_in_memory().unwrap(),
    )
    .unwrap();

    // Unreachable loopback domains keep callback attempts local and fast.
    for (uuid, signer) in [
        (&authority_uuid, &authority_signer),
        (&dependent_uuid, &dependent_signer),
    ] {
        let mut service = Actor::new(uuid.clone(), ActorType::Service);
        service.initial_key = Some(signer.public_key_hex());
        service.uinfo = json!({ "service_domain": "http://127.0.0.1:9" });
        authority.db().upsert_actor(&service).unwrap();
        dependent.db().upsert_actor(&service).unwrap();
    }
    (authority, dependent)
}

fn user(uuid: &str) -> Actor {
    Actor::new(uuid, ActorType::User)
}

const U1: &str = "11111111-1111-4111-8111-111111111111";
const U2: &str = "22222222-2222-4222-8222-222222222222";

#[test]
fn forced_sync_converges_and_is_idempotent() {
    let (authority, dependent) = federation();
    authority.db().upsert_actor(&user(U1)).unwrap();
    authority
        .db()
        .upsert_actor_permaction(&ActorPermactionRow {
            permaction_uuid: "p1".to_string(),
            service_uuid: dependent.service_uuid().to_string(),
            actor_uuid: U1.to_string(),
            value: 1,
            params: json!({}),
        })
        .unwrap();

    let authority_channel = ServiceChannel::new(authority.clone()).unwrap();
    let dependent_channel = ServiceChannel::new(dependent.clone()).unwrap();
    let authority_sync = SyncEngine::new(&authority, &authority_channel);
    let dependent_sync = SyncEngine::new(&dependent, &dependent_channel);

    let bundle = authority_sync.build_bundle(dependent.service_uuid()).unwrap();
    let parts = SyncEngine::decode_bundle(&bundle).unwrap();

    dependent_sync.apply_bundle(&parts).unwrap();
    let converged = dependent_sync.actors_hash().unwrap();
    assert_eq!(converged, authority_sync.actors_hash().unwrap());
    assert_eq!(
        dependent_sync.permactions_hash(dependent.service_uuid()).unwrap(),
        authority_sync.permactions_hash(dependent.service_uuid()).unwrap(),
    );

    // Same bundle again changes nothing.
    dependent_sync.apply_bundle(&parts).unwrap();
    assert_eq!(dependent_sync.actors_hash().unwrap(), converged);
}

#[test]
fn forced_sync_prunes_rows_absent_upstream() {
    let (authority, dependent) = federation();
    authority.db().upsert_actor(&user(U1)).unwrap();
    authority.db().upsert_actor(&user(U2)).unwrap();

    let authority_channel = ServiceChannel::new(authority.clone()).unwrap();
    let dependent_channel = ServiceChannel::new(dependent.clone()).unwrap();
    let authority_sync = SyncEngine::new(&authority, &authority_channel);
    let dependent_sync = SyncEngine::new(&dependent, &dependent_channel);

    let first = authority_sync.build_bundle(dependent.service_uuid()).unwrap();
    dependent_sync
        .apply_bundle(&SyncEngine::decode_bundle(&first).unwrap())
        .unwrap();
    assert!(dependent.db().get_actor(U2).unwrap().is_some());

    // Authority drops one user; the next bundle removes it downstream.
    authority.db().delete_actor(U2).unwrap();
    let second = authority_sync.build_bundle(dependent.service_uuid()).unwrap();
    dependent_sync
        .apply_bundle(&SyncEngine::decode_bundle(&second).unwrap())
        .unwrap();

    assert!(dependent.db().get_actor(U2).unwrap().is_none());
    assert_eq!(
        dependent_sync.actors_hash().unwrap(),
        authority_sync.actors_hash().unwrap()
    );
}

#[test]
fn authority_rejects_forced_sync_over_the_wire() {
    let (authority, dependent) = federation();
    let dependent_channel = ServiceChannel::new(dependent.clone()).unwrap();
    let sync = SyncEngine::new(&dependent, &dependent_channel);
    let bundle = sync.build_bundle(authority.service_uuid()).unwrap();

    let mut body = json!({ "bundle": hex::encode(bundle) });
    dependent_channel.sign_body(&mut body).unwrap();
    let response = dispatch(
        &authority,
        &Request {
            method: Method::Post,
            endpoint: "synchronization/force".to_string(),
            body,
            session_token: None,
        },
    );
    assert_eq!(response.status, 400);
}

#[test]
fn hash_report_shape_differs_by_role() {
    let (authority, dependent) = federation();
    let authority_channel = ServiceChannel::new(authority.clone()).unwrap();
    let dependent_channel = ServiceChannel::new(dependent.clone()).unwrap();

    let authority_report = SyncEngine::new(&authority, &authority_channel)
        .hash_report()
        .unwrap();
    assert!(authority_report["permactions_hash_data"].is_object());

    let dependent_report = SyncEngine::new(&dependent, &dependent_channel)
        .hash_report()
        .unwrap();
    assert_eq!(
        dependent_report["permactions_hash_data"],
        Value::String(EMPTY_HASH_SENTINEL.to_string())
    );
}

#[test]
fn mutation_survives_unreachable_callback_peers() {
    let (authority, _dependent) = federation();
    let authority_channel = ServiceChannel::new(authority.clone()).unwrap();

    // The dependent's domain points at an unreachable loopback port, so the
    // callback fan-out fails; the mutation itself must still land.
    let mut body = json!({ "actor": user(U1) });
    authority_channel.sign_body(&mut body).unwrap();
    let response = dispatch(
        &authority,
        &Request {
            method: Method::Post,
            endpoint: "actor".to_string(),
            body,
            session_token: None,
        },
    );
    assert_eq!(response.status, 200);
    assert!(authority.db().get_actor(U1).unwrap().is_some());
}
