//! Loading `mxrelay.config.ron` files
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{io::Write, net::IpAddr};

use mxrelay::Relay;
use mxrelay_delivery::{BalanceMode, RelayMode};
use mxrelay_smtp::SslMode;

fn config_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn loads_a_complete_configuration() {
    let file = config_file(
        r#"(
            relay: (
                relay_mode: SmartHost,
                balance_mode: LoadBalance,
                smart_hosts: [
                    (host: "a.example.net", port: 465, ssl_mode: Ssl),
                    (host: "b.example.net", port: 587, ssl_mode: Tls,
                     credentials: Some((username: "relay", password: "secret"))),
                ],
                bindings: [
                    (ip: "192.0.2.10", host_name: Some("relay.example.org")),
                    (ip: "2001:db8::10"),
                ],
                max_connections: 50,
                max_connections_per_ip: 4,
                session_idle_timeout_secs: 120,
                dns: (timeout_secs: 3),
                smtp_timeouts: (connect_secs: 10, data_secs: 300),
            ),
        )"#,
    );

    let relay = Relay::from_file(file.path()).unwrap();
    let config = relay.config();

    assert_eq!(config.relay_mode, RelayMode::SmartHost);
    assert_eq!(config.balance_mode, BalanceMode::LoadBalance);
    assert_eq!(config.smart_hosts.len(), 2);
    assert_eq!(config.smart_hosts[0].ssl_mode, SslMode::Ssl);
    assert_eq!(
        config.smart_hosts[1]
            .credentials
            .as_ref()
            .map(|c| c.username.as_str()),
        Some("relay")
    );
    assert_eq!(
        config.bindings.iter().map(|b| b.ip).collect::<Vec<_>>(),
        vec![
            "192.0.2.10".parse::<IpAddr>().unwrap(),
            "2001:db8::10".parse::<IpAddr>().unwrap(),
        ]
    );
    assert_eq!(config.max_connections, 50);
    assert_eq!(config.max_connections_per_ip, 4);
    assert_eq!(config.session_idle_timeout_secs, 120);
    assert_eq!(config.dns.timeout_secs, 3);
    assert_eq!(config.smtp_timeouts.connect_secs, 10);
    assert_eq!(config.smtp_timeouts.data_secs, 300);
    assert_eq!(config.smtp_timeouts.quit_secs, 10);
}

#[test]
fn missing_file_names_the_path() {
    let error = Relay::from_file(std::path::Path::new("/nonexistent/mxrelay.config.ron"))
        .unwrap_err()
        .to_string();

    assert!(error.contains("/nonexistent/mxrelay.config.ron"), "{error}");
}

#[test]
fn malformed_file_is_rejected() {
    let file = config_file("(relay: (relay_mode: Carrier))");

    let error = Relay::from_file(file.path()).unwrap_err();
    assert!(error.to_string().starts_with("Invalid configuration in"));
}

#[test]
fn empty_smart_host_name_is_rejected() {
    let file = config_file(r#"(relay: (relay_mode: SmartHost, smart_hosts: [(host: " ")]))"#);

    let error = Relay::from_file(file.path()).unwrap_err();
    assert_eq!(
        format!("{:#}", error).split(": ").last(),
        Some("Smart host 0 has an empty host name")
    );
}
