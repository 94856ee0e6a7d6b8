#![allow(dead_code)]

use rebac_engine::*;
use std::sync::{Arc, Once};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Install a test subscriber once per test binary; honours `RUST_LOG`
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

pub const PAYMENT_SCHEMA: &str = r#"
    definition namespace/user {}

    definition namespace/payment {
        relation payer: namespace/user
        relation collector: namespace/user
        relation marketplace_owner: namespace/user

        permission view = payer + collector + marketplace_owner
        permission some_restricted_permission = marketplace_owner
    }
"#;

// Helper to create test engine
pub async fn create_test_engine(schema: &str) -> Arc<AuthorizationEngine> {
    create_test_engine_with_config(schema, EngineConfig::default()).await
}

pub async fn create_test_engine_with_config(
    schema: &str,
    config: EngineConfig,
) -> Arc<AuthorizationEngine> {
    init_tracing();
    let engine = AuthorizationEngine::new(config).unwrap();
    engine.write_schema(schema).await.unwrap();
    Arc::new(engine)
}

pub fn touch(relationship: &str) -> RelationshipUpdate {
    RelationshipUpdate::touch(relationship.parse().unwrap())
}

pub fn delete(relationship: &str) -> RelationshipUpdate {
    RelationshipUpdate::delete(relationship.parse().unwrap())
}

pub fn subject(s: &str) -> SubjectReference {
    s.parse().unwrap()
}

pub fn object(s: &str) -> ObjectReference {
    s.parse().unwrap()
}

pub async fn check(engine: &AuthorizationEngine, subject_ref: &str, permission: &str, resource: &str) -> bool {
    engine
        .check(&subject(subject_ref), permission, &object(resource))
        .await
        .unwrap()
}
