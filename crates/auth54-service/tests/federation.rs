//! End-to-end federation flows driven through the dispatcher, with the
//! authority and a dependent service running in-process over in-memory
//! databases.

use auth54_core::actor::{Actor, ActorType};
use auth54_core::crypto::KeypairSigner;
use auth54_core::passport::Apt54;
use auth54_service::handlers::{Method, Request, dispatch};
use auth54_service::store::Db;
use auth54_service::{ServiceChannel, ServiceConfig, ServiceContext};
use serde_json::{Value, json};

const USER_UUID: &str = "11111111-1111-4111-8111-111111111111";
const TARGET_UUID: &str = "22222222-2222-4222-8222-222222222222";

fn config_toml(service_uuid: &str, signer: &KeypairSigner, authority_key: &str) -> String {
    format!(
        "service_uuid = \"{service_uuid}\"\n\
         service_domain = \"https://svc.example\"\n\
         public_key = \"{}\"\n\
         private_key = \"{}\"\n\
         [auth]\n\
         url = \"https://auth.example\"\n\
         public_key = \"{authority_key}\"\n\
         [database]\n\
         path = \"unused.sqlite\"\n",
        signer.public_key_hex(),
        signer.private_key_hex(),
    )
}

/// An authority and one dependent service, both federated: the authority's
/// configured trust key is its own.
fn federation() -> (ServiceContext, ServiceContext) {
    let authority_signer = KeypairSigner::generate();
    let dependent_signer = KeypairSigner::generate();
    let authority_uuid = uuid::Uuid::new_v4().to_string();
    let dependent_uuid = uuid::Uuid::new_v4().to_string();

    let authority_config = ServiceConfig::from_toml(&config_toml(
        &authority_uuid,
        &authority_signer,
        &authority_signer.public_key_hex(),
    ))
    .unwrap();
    let dependent_config = ServiceConfig::from_toml(&config_toml(
        &dependent_uuid,
        &dependent_signer,
        &authority_signer.public_key_hex(),
    ))
    .unwrap();

    let authority =
        ServiceContext::with_db(authority_config, Db::open_in_memory().unwrap()).unwrap();
    let dependent =
        ServiceContext::with_db(dependent_config, Db::open_in_memory().unwrap()).unwrap();
    assert!(authority.is_authority());
    assert!(!dependent.is_authority());

    // Replicate the service actors so signed bodies can be verified.
    for (ctx_uuid, signer, domain) in [
        (&authority_uuid, &authority_signer, "https://auth.example"),
        (&dependent_uuid, &dependent_signer, "https://svc.example"),
    ] {
        let mut service = Actor::new(ctx_uuid.clone(), ActorType::Service);
        service.initial_key = Some(signer.public_key_hex());
        service.uinfo = json!({ "service_domain": domain });
        authority.db().upsert_actor(&service).unwrap();
        dependent.db().upsert_actor(&service).unwrap();
    }
    (authority, dependent)
}

fn post(endpoint: &str, body: Value) -> Request {
    Request {
        method: Method::Post,
        endpoint: endpoint.to_string(),
        body,
        session_token: None,
    }
}

fn post_with_token(endpoint: &str, body: Value, token: &str) -> Request {
    Request {
        method: Method::Post,
        endpoint: endpoint.to_string(),
        body,
        session_token: Some(token.to_string()),
    }
}

fn register_user(ctx: &ServiceContext, key: &KeypairSigner) -> Actor {
    let mut actor = Actor::new(USER_UUID, ActorType::User);
    actor.initial_key = Some(key.public_key_hex());
    ctx.db().upsert_actor(&actor).unwrap();
    actor
}

/// Runs the full passport challenge against the authority and returns the
/// issued passport.
fn obtain_passport(authority: &ServiceContext, key: &KeypairSigner) -> Apt54 {
    let step1 = dispatch(
        authority,
        &post("apt54", json!({ "pub_key": key.public_key_hex() })),
    );
    assert_eq!(step1.status, 200);
    let salt = step1.body["salt"].as_str().unwrap().to_string();

    let step2 = dispatch(
        authority,
        &post(
            "apt54",
            json!({
                "step": 2,
                "pub_key": key.public_key_hex(),
                "signed_salt": key.sign(&salt),
            }),
        ),
    );
    assert_eq!(step2.status, 200);
    serde_json::from_str(step2.body["apt54"].as_str().unwrap()).unwrap()
}

/// Establishes a session on `ctx` with a passport, returning the token.
fn establish_session(ctx: &ServiceContext, key: &KeypairSigner, apt54: &Apt54) -> String {
    let step1 = dispatch(ctx, &post("auth", json!({ "pub_key": key.public_key_hex() })));
    assert_eq!(step1.status, 200);
    let salt = step1.body["salt"].as_str().unwrap().to_string();

    let step2 = dispatch(
        ctx,
        &post(
            "auth",
            json!({
                "step": 2,
                "pub_key": key.public_key_hex(),
                "signed_salt": key.sign(&salt),
                "apt54": serde_json::to_string(apt54).unwrap(),
            }),
        ),
    );
    assert_eq!(step2.status, 200);
    step2.body["session_token"].as_str().unwrap().to_string()
}

#[test]
fn passport_issued_by_authority_opens_session_on_dependent() {
    let (authority, dependent) = federation();
    let user_key = KeypairSigner::generate();
    register_user(&authority, &user_key);

    let passport = obtain_passport(&authority, &user_key);
    assert_eq!(passport.actor_uuid(), USER_UUID);

    // The dependent never talked to the user before; the passport alone
    // proves the identity.
    let token = establish_session(&dependent, &user_key, &passport);
    let lookup = dispatch(
        &dependent,
        &post("get_session", json!({ "session_token": token })),
    );
    assert_eq!(lookup.status, 200);
    assert_eq!(lookup.body["uuid"], USER_UUID);

    // The dependent's replica learned the actor from the passport.
    assert!(dependent.db().get_actor(USER_UUID).unwrap().is_some());
}

#[test]
fn unknown_key_gets_452_from_authority() {
    let (authority, _) = federation();
    let stranger = KeypairSigner::generate();
    let response = dispatch(
        &authority,
        &post("apt54", json!({ "pub_key": stranger.public_key_hex() })),
    );
    assert_eq!(response.status, 452);
}

#[test]
fn tampered_passport_fails_on_dependent() {
    let (authority, dependent) = federation();
    let user_key = KeypairSigner::generate();
    register_user(&authority, &user_key);

    let mut passport = obtain_passport(&authority, &user_key);
    passport.user_data.uinfo = json!({ "role": "admin" });

    let step1 = dispatch(
        &dependent,
        &post("auth", json!({ "pub_key": user_key.public_key_hex() })),
    );
    let salt = step1.body["salt"].as_str().unwrap().to_string();
    let step2 = dispatch(
        &dependent,
        &post(
            "auth",
            json!({
                "step": 2,
                "pub_key": user_key.public_key_hex(),
                "signed_salt": user_key.sign(&salt),
                "apt54": serde_json::to_string(&passport).unwrap(),
            }),
        ),
    );
    assert_eq!(step2.status, 401);
}

#[test]
fn banned_actor_is_refused_a_session() {
    let (authority, _) = federation();
    let user_key = KeypairSigner::generate();
    let mut actor = register_user(&authority, &user_key);
    actor.is_banned = true;
    authority.db().upsert_actor(&actor).unwrap();

    let passport = obtain_passport(&authority, &user_key);
    let step1 = dispatch(
        &authority,
        &post("auth", json!({ "pub_key": user_key.public_key_hex() })),
    );
    let salt = step1.body["salt"].as_str().unwrap().to_string();
    let step2 = dispatch(
        &authority,
        &post(
            "auth",
            json!({
                "step": 2,
                "pub_key": user_key.public_key_hex(),
                "signed_salt": user_key.sign(&salt),
                "apt54": serde_json::to_string(&passport).unwrap(),
            }),
        ),
    );
    assert_eq!(step2.status, 403);
}

#[test]
fn masquerade_requires_the_capability() {
    let (authority, _) = federation();
    let user_key = KeypairSigner::generate();
    register_user(&authority, &user_key);
    authority
        .db()
        .upsert_actor(&Actor::new(TARGET_UUID, ActorType::User))
        .unwrap();

    let passport = obtain_passport(&authority, &user_key);
    let token = establish_session(&authority, &user_key, &passport);

    // Denied without a grant, and no session appears for the target.
    let denied = dispatch(
        &authority,
        &post_with_token("masquerade/on", json!({ "uuid": TARGET_UUID }), &token),
    );
    assert_eq!(denied.status, 403);
    assert!(
        authority
            .db()
            .latest_session_for(TARGET_UUID, authority.service_uuid())
            .unwrap()
            .is_none()
    );

    // Granted for this target, the switch works both ways.
    authority
        .db()
        .upsert_actor_permaction(&auth54_service::store::ActorPermactionRow {
            permaction_uuid: auth54_core::MASQUERADE_PERMACTION_UUID.to_string(),
            service_uuid: authority.service_uuid().to_string(),
            actor_uuid: USER_UUID.to_string(),
            value: 1,
            params: json!({ "masquerade": [TARGET_UUID] }),
        })
        .unwrap();

    let granted = dispatch(
        &authority,
        &post_with_token("masquerade/on", json!({ "uuid": TARGET_UUID }), &token),
    );
    assert_eq!(granted.status, 200);
    let masquerade_token = granted.body["masquerade_session"].as_str().unwrap();

    let as_target = dispatch(
        &authority,
        &post("get_session", json!({ "session_token": masquerade_token })),
    );
    assert_eq!(as_target.body["uuid"], TARGET_UUID);

    let off = dispatch(
        &authority,
        &post_with_token("masquerade/off", json!({}), masquerade_token),
    );
    assert_eq!(off.status, 200);
    assert_eq!(off.body["session_token"], token);
}

#[test]
fn signed_pull_endpoints_serve_the_replica() {
    let (authority, dependent) = federation();
    let user_key = KeypairSigner::generate();
    register_user(&authority, &user_key);

    // The dependent signs the pull request with its own service key.
    let channel = ServiceChannel::new(dependent.clone()).unwrap();
    let mut body = json!({});
    channel.sign_body(&mut body).unwrap();

    let response = dispatch(&authority, &post("service/get_actors", body));
    assert_eq!(response.status, 200);
    assert!(response.body["actors"]["actors"][USER_UUID].is_object());

    // An unsigned pull is rejected.
    let unsigned = dispatch(&authority, &post("service/get_actors", json!({})));
    assert_eq!(unsigned.status, 400);
}

#[test]
fn qr_login_hands_session_to_the_waiting_device() {
    let (authority, _) = federation();
    let user_key = KeypairSigner::generate();
    register_user(&authority, &user_key);
    let passport = obtain_passport(&authority, &user_key);

    // Waiting device mints a handoff token and shows the QR challenge.
    let temp = dispatch(&authority, &post("temporary_session", json!({})));
    assert_eq!(temp.status, 200);
    let temporary = temp.body["temporary_session"].as_str().unwrap().to_string();

    let step1 = dispatch(&authority, &post("auth", json!({ "qr_token": "pair-1" })));
    assert_eq!(step1.status, 200);
    let salt = step1.body["salt"].as_str().unwrap().to_string();

    // Logged-in phone scans the code and answers, chaining to the handoff.
    let step2 = dispatch(
        &authority,
        &post(
            "auth",
            json!({
                "step": 2,
                "qr_token": "pair-1",
                "signed_salt": user_key.sign(&salt),
                "apt54": serde_json::to_string(&passport).unwrap(),
                "temporary_session": temporary,
            }),
        ),
    );
    assert_eq!(step2.status, 200);

    // Waiting device redeems the handoff for the real session.
    let redeemed = dispatch(
        &authority,
        &post("get_session", json!({ "temporary_session": temporary })),
    );
    assert_eq!(redeemed.status, 200);
    assert_eq!(redeemed.body["uuid"], USER_UUID);

    // Single use.
    let again = dispatch(
        &authority,
        &post("get_session", json!({ "temporary_session": temporary })),
    );
    assert_eq!(again.status, 404);
}
