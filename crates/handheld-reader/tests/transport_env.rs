//! `HANDHELD_TRANSPORT` handling in session creation.
//!
//! Kept in its own test binary: the variable is process-wide.

use handheld_reader::{DeviceManager, ReaderError, SessionConfig, SessionRegistry};
use handheld_transport::{
    ProxyConfig, TRANSPORT_ENV_VAR, TransportConfig, TransportError, TransportKind,
};

fn set_env(value: Option<&str>) {
    // SAFETY: this binary runs a single test, nothing else touches the environment.
    unsafe {
        match value {
            Some(value) => std::env::set_var(TRANSPORT_ENV_VAR, value),
            None => std::env::remove_var(TRANSPORT_ENV_VAR),
        }
    }
}

#[tokio::test]
async fn test_environment_overrides_configured_transport() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);
    let config = || {
        SessionConfig::new(TransportConfig::proxy(
            ProxyConfig::new(closed).with_connect_attempts(1),
        ))
    };
    let registry = SessionRegistry::new();

    set_env(Some("simulated"));
    let session = DeviceManager::create(&registry, config()).await.unwrap();
    assert_eq!(session.transport_kind(), TransportKind::Simulated);
    assert!(session.simulator().is_some());
    session.destroy().await;

    set_env(Some("carrier pigeon"));
    let error = DeviceManager::create(&registry, config()).await.unwrap_err();
    assert!(matches!(
        error,
        ReaderError::Transport(TransportError::InvalidConfig { .. })
    ));
    assert!(!registry.is_active());

    set_env(None);
    let error = DeviceManager::create(&registry, config()).await.unwrap_err();
    assert!(matches!(error, ReaderError::Transport(_)));
    assert!(!registry.is_active());
}
